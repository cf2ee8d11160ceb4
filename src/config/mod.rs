use crate::report::ReportFormat;
use crate::scanner::ScanOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub scan: ScanOptions,
    /// 自定义特征库；为空时使用内置特征库
    #[serde(default)]
    pub signatures: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub output_dir: PathBuf,
    pub format: ReportFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("rokki")
                .join("reports"),
            format: ReportFormat::Text,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            signatures: None,
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl ScannerConfig {
    pub fn load(path: &PathBuf) -> Result<Self, anyhow::Error> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            config.scan.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or(PathBuf::from("/etc"))
            .join("rokki")
            .join("config.yaml")
    }
}
