use anyhow::{bail, Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

const BUILTIN_SIGNATURES: &str = include_str!("../../data/signatures.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalwareType {
    WebShell,
    Virus,
    MaliciousCode,
}

impl MalwareType {
    pub fn label(&self) -> &'static str {
        match self {
            MalwareType::WebShell => "Web Shell",
            MalwareType::Virus => "Virus",
            MalwareType::MaliciousCode => "Malicious Code",
        }
    }
}

impl fmt::Display for MalwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    PathMatch,
    ContentRegex,
}

/// A single detection rule as reported to callers.
///
/// Path signatures have no id and carry the lowercase filename literal as
/// `pattern`; content signatures carry the regex source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub id: Option<u32>,
    pub malware_type: MalwareType,
    pub impact_level: ImpactLevel,
    pub detection: DetectionKind,
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct ContentRule {
    pub id: u32,
    pub malware_type: MalwareType,
    pub impact_level: ImpactLevel,
    pub expr: Regex,
}

impl ContentRule {
    fn to_signature(&self) -> Signature {
        Signature {
            id: Some(self.id),
            malware_type: self.malware_type,
            impact_level: self.impact_level,
            detection: DetectionKind::ContentRegex,
            pattern: self.expr.as_str().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignatureFile {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    id: u32,
    #[serde(rename = "type")]
    malware_type: MalwareType,
    impact: ImpactLevel,
    expr: String,
    #[serde(default)]
    case_insensitive: bool,
}

/// Immutable signature set: filename literals plus ordered content rules.
#[derive(Debug, Clone, Default)]
pub struct SignatureDatabase {
    paths: HashSet<String>,
    rules: Vec<ContentRule>,
}

impl SignatureDatabase {
    pub fn new(paths: impl IntoIterator<Item = String>, rules: Vec<ContentRule>) -> Self {
        Self {
            paths: paths.into_iter().map(|p| p.to_lowercase()).collect(),
            rules,
        }
    }

    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_SIGNATURES).context("内置特征库解析失败")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("正在加载特征库: {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取特征库文件: {:?}", path))?;
        let db = Self::from_yaml_str(&content)
            .with_context(|| format!("无法解析特征库文件: {:?}", path))?;

        log::info!(
            "已加载 {} 条文件名特征, {} 条内容特征",
            db.path_count(),
            db.rule_count()
        );
        Ok(db)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let parsed: SignatureFile = serde_yaml::from_str(content)?;

        let mut seen = HashMap::new();
        let mut rules = Vec::with_capacity(parsed.rules.len());
        for entry in parsed.rules {
            if let Some(prev) = seen.insert(entry.id, entry.expr.clone()) {
                bail!("特征ID重复: {} ({} / {})", entry.id, prev, entry.expr);
            }
            let expr = RegexBuilder::new(&entry.expr)
                .case_insensitive(entry.case_insensitive)
                .build()
                .with_context(|| format!("特征 {} 正则无效", entry.id))?;
            rules.push(ContentRule {
                id: entry.id,
                malware_type: entry.malware_type,
                impact_level: entry.impact,
                expr,
            });
        }

        Ok(Self::new(parsed.paths, rules))
    }

    /// `name` must already be lowercased.
    pub fn match_path(&self, name: &str) -> Option<Signature> {
        if !self.paths.contains(name) {
            return None;
        }
        Some(Signature {
            id: None,
            malware_type: MalwareType::WebShell,
            impact_level: ImpactLevel::High,
            detection: DetectionKind::PathMatch,
            pattern: name.to_string(),
        })
    }

    /// First rule in database order wins.
    pub fn match_content(&self, text: &str) -> Option<Signature> {
        self.rules
            .iter()
            .find(|rule| rule.expr.is_match(text))
            .map(ContentRule::to_signature)
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[ContentRule] {
        &self.rules
    }
}
