use anyhow::Context;
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::path::PathBuf;

pub struct Logger;

impl Logger {
    /// Logs to stdout, and to a dated file when `log_dir` is given.
    pub fn init(log_dir: Option<PathBuf>, level: LevelFilter) -> Result<(), anyhow::Error> {
        let mut dispatcher = Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}][{}][{}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .chain(std::io::stdout());

        let mut log_file = None;
        if let Some(dir) = log_dir {
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(format!("rokki_{}.log", Local::now().format("%Y%m%d")));
            dispatcher = dispatcher.chain(
                fern::log_file(&path).context(format!("无法创建日志文件: {:?}", path))?,
            );
            log_file = Some(path);
        }

        dispatcher.apply()?;

        if let Some(path) = log_file {
            log::info!("日志系统已初始化，输出文件: {:?}", path);
        }

        Ok(())
    }

    pub fn get_level_filter(level: &str) -> LevelFilter {
        match level.to_uppercase().as_str() {
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            "TRACE" => LevelFilter::Trace,
            "OFF" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }
}
