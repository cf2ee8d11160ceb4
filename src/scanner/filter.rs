use crate::scanner::engine::{ScanOptions, SkipReason};
use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(SkipReason),
}

/// Include/exclude rules on file and folder basenames.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    include_folders: Option<Regex>,
    exclude_folders: Option<Regex>,
}

impl FileFilter {
    pub fn new(options: &ScanOptions) -> Result<Self> {
        Ok(Self {
            include: compile(options.include.as_deref(), "include")?,
            exclude: compile(options.exclude.as_deref(), "exclude")?,
            include_folders: compile(options.include_folders.as_deref(), "include_folders")?,
            exclude_folders: compile(options.exclude_folders.as_deref(), "exclude_folders")?,
        })
    }

    pub fn decide_file(&self, name: &str) -> Decision {
        let name = name.to_lowercase();
        if is_denied(&self.include, &self.exclude, &name) {
            Decision::Deny(SkipReason::Excluded)
        } else {
            Decision::Allow
        }
    }

    pub fn decide_dir(&self, name: &str) -> Decision {
        if is_denied(&self.include_folders, &self.exclude_folders, name) {
            Decision::Deny(SkipReason::ExcludedFolder)
        } else {
            Decision::Allow
        }
    }
}

fn is_denied(include: &Option<Regex>, exclude: &Option<Regex>, name: &str) -> bool {
    if let Some(re) = exclude {
        if re.is_match(name) {
            return true;
        }
    }
    match include {
        Some(re) => !re.is_match(name),
        None => false,
    }
}

fn compile(pattern: Option<&str>, field: &str) -> Result<Option<Regex>> {
    match pattern {
        Some(p) if !p.is_empty() => RegexBuilder::new(p)
            .case_insensitive(true)
            .build()
            .map(Some)
            .with_context(|| format!("无效的 {} 规则: {}", field, p)),
        _ => Ok(None),
    }
}
