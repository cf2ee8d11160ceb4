use crate::config::ScannerConfig;
use crate::report::{self, ReportFormat, ReportGenerator};
use crate::scanner::{Scanner, ScanOptions, SignatureDatabase};
use crate::utils::format_bytes;
use crate::utils::logging::Logger;
use crate::whitelist::{self, FatalHook, Lookup, WhitelistError, WhitelistStore};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Exit status when at least one infected file was found.
pub const EXIT_INFECTED: i32 = 2;

#[derive(Parser)]
#[command(name = "rokki")]
#[command(author = "Security Team")]
#[command(version)]
#[command(about = "Web 服务器恶意代码扫描工具", long_about = None)]
pub struct Command {
    #[command(subcommand)]
    pub subcommand: SubCommands,
    #[arg(short, long, global = true, help = "指定配置文件路径")]
    pub config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "显示详细输出")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum SubCommands {
    #[command(name = "scan", about = "扫描文件或目录")]
    Scan(ScanArgs),
    #[command(name = "whitelist", about = "管理白名单")]
    Whitelist(WhitelistArgs),
    #[command(name = "checksum", about = "计算文件 SHA-1")]
    Checksum(ChecksumArgs),
}

#[derive(Args)]
pub struct ScanArgs {
    #[arg(required = true, help = "扫描路径")]
    pub paths: Vec<PathBuf>,
    #[arg(long, short = 'r', help = "递归扫描子目录")]
    pub recursive: bool,
    #[arg(long, conflicts_with = "recursive", help = "不递归扫描 (覆盖配置文件)")]
    pub no_recursive: bool,
    #[arg(long, help = "仅扫描匹配的文件名 (正则)")]
    pub include: Option<String>,
    #[arg(long, help = "排除匹配的文件名 (正则)")]
    pub exclude: Option<String>,
    #[arg(long, help = "仅扫描匹配的目录名 (正则)")]
    pub include_folders: Option<String>,
    #[arg(long, help = "排除匹配的目录名 (正则)")]
    pub exclude_folders: Option<String>,
    #[arg(long, help = "最大文件大小 (字节)")]
    pub max_size: Option<u64>,
    #[arg(long, short = 'w', help = "白名单数据库路径")]
    pub whitelist: Option<PathBuf>,
    #[arg(long, short = 's', help = "特征库文件 (YAML)")]
    pub signatures: Option<PathBuf>,
    #[arg(long, help = "生成扫描报告")]
    pub report: bool,
    #[arg(long, short = 'f', help = "报告格式: json, yaml, text")]
    pub format: Option<String>,
}

#[derive(Args)]
pub struct WhitelistArgs {
    #[command(subcommand)]
    pub action: WhitelistAction,
}

#[derive(Subcommand)]
pub enum WhitelistAction {
    #[command(name = "add", about = "将文件或目录加入白名单")]
    Add {
        path: PathBuf,
        #[arg(long, short = 'p', help = "产品名称")]
        product: String,
        #[arg(long, help = "白名单数据库路径")]
        db: Option<PathBuf>,
    },
    #[command(name = "check", about = "检查文件是否在白名单中")]
    Check {
        path: PathBuf,
        #[arg(long, help = "白名单数据库路径")]
        db: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct ChecksumArgs {
    pub file: PathBuf,
}

impl Command {
    pub fn build() -> Self {
        Command::parse()
    }

    /// Returns the process exit status.
    pub async fn execute(matches: &Command) -> Result<i32> {
        let config_path = matches
            .config
            .clone()
            .unwrap_or_else(ScannerConfig::default_path);

        let config = ScannerConfig::load(&config_path)
            .with_context(|| format!("无法加载配置文件: {:?}", config_path))?;

        let level = if matches.verbose {
            log::LevelFilter::Debug
        } else {
            Logger::get_level_filter(&config.logging.level)
        };
        Logger::init(config.logging.log_dir.clone(), level)?;

        match &matches.subcommand {
            SubCommands::Scan(args) => Self::handle_scan(args, &config).await,
            SubCommands::Whitelist(args) => Self::handle_whitelist(args, &config).await,
            SubCommands::Checksum(args) => Self::handle_checksum(args).await,
        }
    }

    fn scan_options(args: &ScanArgs, config: &ScannerConfig) -> ScanOptions {
        let mut options = config.scan.clone();
        if args.recursive {
            options.recursive = true;
        } else if args.no_recursive {
            options.recursive = false;
        }
        if let Some(max_size) = args.max_size {
            options.max_size = max_size;
        }
        if args.include.is_some() {
            options.include = args.include.clone();
        }
        if args.exclude.is_some() {
            options.exclude = args.exclude.clone();
        }
        if args.include_folders.is_some() {
            options.include_folders = args.include_folders.clone();
        }
        if args.exclude_folders.is_some() {
            options.exclude_folders = args.exclude_folders.clone();
        }
        if args.whitelist.is_some() {
            options.whitelist = args.whitelist.clone();
        }
        options
    }

    fn fatal_store_hook() -> FatalHook {
        Arc::new(|e: &WhitelistError| {
            log::error!("白名单数据库不可用: {}", e);
            eprintln!("错误: 白名单数据库不可用: {}", e);
            std::process::exit(1);
        })
    }

    async fn handle_scan(args: &ScanArgs, config: &ScannerConfig) -> Result<i32> {
        let signatures = match args.signatures.as_ref().or(config.signatures.as_ref()) {
            Some(path) => SignatureDatabase::load(path)?,
            None => SignatureDatabase::builtin()?,
        };
        let options = Self::scan_options(args, config);
        let scanner = Scanner::with_fatal_hook(Arc::new(signatures), options, Self::fatal_store_hook())?;

        let start_time = Instant::now();
        let mut events = Vec::new();
        for path in &args.paths {
            let mut rx = scanner.scan_directory(path);
            while let Some(event) = rx.recv().await {
                report::log_event(&event);
                events.push(event);
            }
        }

        let closed = scanner.close().await;

        let stats = scanner.stats();
        let infected = events.iter().filter(|e| e.outcome.is_infected()).count();
        println!("\n扫描完成!");
        println!("扫描文件数: {}", stats.get_files_scanned());
        println!("扫描数据量: {}", format_bytes(stats.get_bytes_scanned() as u64));
        println!("发现威胁数: {}", infected);
        println!("白名单文件: {}", stats.get_whitelisted());
        println!("错误数: {}", stats.get_errors());
        println!("扫描耗时: {:.2}秒", start_time.elapsed().as_secs_f64());

        if args.report {
            let generator = ReportGenerator::new(config.report.output_dir.clone());
            let report = generator.generate(&events, &args.paths, start_time);
            let format = match &args.format {
                Some(f) => f.parse::<ReportFormat>()?,
                None => config.report.format,
            };
            let report_path = generator.save(&report, format)?;
            println!("报告已保存: {:?}", report_path);
        }

        closed?;
        Ok(if infected > 0 { EXIT_INFECTED } else { 0 })
    }

    async fn handle_whitelist(args: &WhitelistArgs, config: &ScannerConfig) -> Result<i32> {
        let db_path = |db: &Option<PathBuf>| -> Result<PathBuf> {
            db.clone()
                .or_else(|| config.scan.whitelist.clone())
                .ok_or_else(|| anyhow::anyhow!("未指定白名单数据库 (--db 或配置 scan.whitelist)"))
        };

        match &args.action {
            WhitelistAction::Add { path, product, db } => {
                let db = db_path(db)?;
                let store = WhitelistStore::open_with_hook(Some(db.as_path()), Self::fatal_store_hook())?;

                let mut rx = store.record_tree(path, product);
                let mut added = 0usize;
                let mut failed = 0usize;
                while let Some(result) = rx.recv().await {
                    match result {
                        Ok(file) => {
                            added += 1;
                            println!("{}  {}", file.checksum, file.filename);
                        }
                        Err(e) => {
                            failed += 1;
                            log::warn!("加入白名单失败: {}", e);
                        }
                    }
                }
                store.close().await?;

                println!("已加入白名单: {} 个文件, 失败: {}", added, failed);
                Ok(if failed > 0 { 1 } else { 0 })
            }
            WhitelistAction::Check { path, db } => {
                let db = db_path(db)?;
                let store = WhitelistStore::open_with_hook(Some(db.as_path()), Self::fatal_store_hook())?;
                let result = store.lookup_file(path).await;
                store.close().await?;

                match result? {
                    Lookup::Found(entry) => {
                        println!("在白名单中: {} ({}, {})", entry.checksum, entry.product, entry.filename);
                        Ok(0)
                    }
                    Lookup::NotFound => {
                        println!("不在白名单中: {:?}", path);
                        Ok(1)
                    }
                }
            }
        }
    }

    async fn handle_checksum(args: &ChecksumArgs) -> Result<i32> {
        let sha1 = whitelist::checksum(&args.file).await?;
        println!("{}  {}", sha1, args.file.display());
        Ok(0)
    }
}
