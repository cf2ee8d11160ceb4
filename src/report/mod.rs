use crate::scanner::{ImpactLevel, MalwareType, ScanEvent, ScanOutcome};
use chrono::{DateTime, Local};
use log::Level;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

/// Log severity used when reporting a detection.
pub fn severity(impact: ImpactLevel) -> Level {
    match impact {
        ImpactLevel::High => Level::Error,
        ImpactLevel::Medium => Level::Warn,
        ImpactLevel::Low => Level::Info,
    }
}

pub fn log_event(event: &ScanEvent) {
    match &event.outcome {
        ScanOutcome::Infected(detail) => {
            let id = detail
                .signature_id
                .map(|id| format!(" #{}", id))
                .unwrap_or_default();
            log::log!(
                severity(detail.impact_level),
                "发现 {}{}: {:?}",
                detail.malware_type.label(),
                id,
                event.path
            );
        }
        ScanOutcome::Whitelisted { detail, origin } => {
            log::info!(
                "白名单文件 {:?} ({}, {}): {}",
                event.path,
                origin.product,
                origin.filename,
                detail.malware_type.label()
            );
        }
        ScanOutcome::Skipped(reason) => log::debug!("{:?}: {}", event.path, reason),
        ScanOutcome::Errored(e) => log::warn!("{:?}: {}", event.path, e),
        ScanOutcome::Clean => log::debug!("{:?}: clean", event.path),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub scan_paths: Vec<PathBuf>,
    pub summary: ReportSummary,
    pub entries: Vec<ReportEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: u64,
    pub clean: u64,
    pub infected: u64,
    pub whitelisted: u64,
    pub skipped: u64,
    pub errored: u64,
    pub threats_by_type: BTreeMap<String, u64>,
    pub scan_duration_ms: u64,
}

/// One line of the report; clean files are counted but not listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub path: PathBuf,
    pub outcome: String,
    pub malware: Option<String>,
    pub impact: Option<ImpactLevel>,
    pub signature_id: Option<u32>,
    pub reason: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Yaml,
    Text,
}

impl ReportFormat {
    pub fn extension(&self) -> &str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Yaml => "yaml",
            ReportFormat::Text => "txt",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "yaml" | "yml" => Ok(ReportFormat::Yaml),
            "text" | "txt" => Ok(ReportFormat::Text),
            other => Err(anyhow::anyhow!("不支持的报告格式: {}", other)),
        }
    }
}

pub struct ReportGenerator {
    output_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn generate(&self, events: &[ScanEvent], scan_paths: &[PathBuf], started: Instant) -> ScanReport {
        let mut summary = ReportSummary::default();
        let mut entries = Vec::new();

        for event in events {
            summary.total += 1;
            match &event.outcome {
                ScanOutcome::Clean => summary.clean += 1,
                ScanOutcome::Infected(detail) => {
                    summary.infected += 1;
                    *summary
                        .threats_by_type
                        .entry(detail.malware_type.label().to_string())
                        .or_insert(0) += 1;
                }
                ScanOutcome::Whitelisted { .. } => summary.whitelisted += 1,
                ScanOutcome::Skipped(_) => summary.skipped += 1,
                ScanOutcome::Errored(_) => summary.errored += 1,
            }

            if event.outcome == ScanOutcome::Clean {
                continue;
            }
            let detail = event.outcome.detail();
            let product = match &event.outcome {
                ScanOutcome::Whitelisted { origin, .. } => Some(origin.product.clone()),
                _ => None,
            };
            entries.push(ReportEntry {
                path: event.path.clone(),
                outcome: event.outcome.kind().to_string(),
                malware: detail.map(|d| d.malware_type.label().to_string()),
                impact: detail.map(|d| d.impact_level),
                signature_id: detail.and_then(|d| d.signature_id),
                reason: event.outcome.reason(),
                product,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        summary.scan_duration_ms = started.elapsed().as_millis() as u64;

        let timestamp = Local::now();
        ScanReport {
            id: format!("RPT{}", timestamp.format("%Y%m%d%H%M%S%3f")),
            timestamp,
            scan_paths: scan_paths.to_vec(),
            summary,
            entries,
        }
    }

    pub fn save(&self, report: &ScanReport, format: ReportFormat) -> Result<PathBuf, anyhow::Error> {
        std::fs::create_dir_all(&self.output_dir)?;
        let filename = format!(
            "report_{}.{}",
            report.timestamp.format("%Y%m%d_%H%M%S"),
            format.extension()
        );
        let filepath = self.output_dir.join(&filename);

        match format {
            ReportFormat::Json => {
                let json = serde_json::to_string_pretty(report)?;
                std::fs::write(&filepath, json)?;
            }
            ReportFormat::Yaml => {
                let yaml = serde_yaml::to_string(report)?;
                std::fs::write(&filepath, yaml)?;
            }
            ReportFormat::Text => {
                std::fs::write(&filepath, Self::render_text(report))?;
            }
        }

        log::info!("报告已保存: {:?}", filepath);
        Ok(filepath)
    }

    pub fn render_text(report: &ScanReport) -> String {
        let s = &report.summary;
        let mut text = format!(
            r#"Web 恶意代码扫描报告
===============
扫描ID: {}
扫描时间: {}
扫描路径: {:?}

扫描摘要
--------
文件总数: {}
正常: {}
感染: {}
白名单: {}
跳过: {}
错误: {}
扫描时长: {}毫秒

详细结果
--------
"#,
            report.id,
            report.timestamp.format("%Y-%m-%d %H:%M:%S"),
            report.scan_paths,
            s.total,
            s.clean,
            s.infected,
            s.whitelisted,
            s.skipped,
            s.errored,
            s.scan_duration_ms
        );

        for entry in &report.entries {
            text.push_str(&format!("- [{}] {:?}\n", entry.outcome, entry.path));
            if let Some(malware) = &entry.malware {
                text.push_str(&format!("  类型: {}\n", malware));
            }
            if let Some(impact) = entry.impact {
                text.push_str(&format!("  风险等级: {:?}\n", impact));
            }
            if let Some(id) = entry.signature_id {
                text.push_str(&format!("  签名ID: {}\n", id));
            }
            if let Some(product) = &entry.product {
                text.push_str(&format!("  白名单产品: {}\n", product));
            }
            if let Some(reason) = &entry.reason {
                text.push_str(&format!("  原因: {}\n", reason));
            }
        }

        text
    }
}
