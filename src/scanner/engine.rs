use crate::scanner::filter::{Decision, FileFilter};
use crate::scanner::{ImpactLevel, MalwareType, Signature, SignatureDatabase, DetectionKind};
use crate::whitelist::{FatalHook, Lookup, WhitelistEntry, WhitelistStore};
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

pub const DEFAULT_MAX_SIZE: u64 = 104_857_600;
pub const DEFAULT_MAX_OPEN_FILES: usize = 256;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub max_size: u64,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub include_folders: Option<String>,
    pub exclude_folders: Option<String>,
    pub recursive: bool,
    pub whitelist: Option<PathBuf>,
    pub max_open_files: usize,
    pub retry_delay_ms: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            include: None,
            exclude: None,
            include_folders: None,
            exclude_folders: None,
            recursive: false,
            whitelist: None,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl ScanOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            bail!("max_size 必须大于 0");
        }
        if self.max_open_files == 0 {
            bail!("max_open_files 必须大于 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Excluded,
    ExcludedFolder,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Excluded => f.write_str("Excluded"),
            SkipReason::ExcludedFolder => f.write_str("Excluded folder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "message", rename_all = "snake_case")]
pub enum ScanError {
    #[error("File is not found")]
    NotFound,
    #[error("Folder is not found")]
    FolderNotFound,
    #[error("File should be provided")]
    NotAFile,
    #[error("File is too big")]
    TooLarge,
    #[error("{0}")]
    Io(String),
    #[error("Whitelist failure: {0}")]
    Storage(String),
}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        ScanError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Regex,
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDetail {
    pub check: CheckKind,
    pub malware_type: MalwareType,
    pub impact_level: ImpactLevel,
    pub signature_id: Option<u32>,
    pub pattern: Option<String>,
}

impl From<Signature> for MatchDetail {
    fn from(sig: Signature) -> Self {
        let check = match sig.detection {
            DetectionKind::PathMatch => CheckKind::Path,
            DetectionKind::ContentRegex => CheckKind::Regex,
        };
        Self {
            check,
            malware_type: sig.malware_type,
            impact_level: sig.impact_level,
            signature_id: sig.id,
            pattern: Some(sig.pattern),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ScanOutcome {
    Clean,
    Infected(MatchDetail),
    Whitelisted {
        detail: MatchDetail,
        origin: WhitelistEntry,
    },
    Skipped(SkipReason),
    Errored(ScanError),
}

impl ScanOutcome {
    pub fn is_infected(&self) -> bool {
        matches!(self, ScanOutcome::Infected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScanOutcome::Clean => "clean",
            ScanOutcome::Infected(_) => "infected",
            ScanOutcome::Whitelisted { .. } => "whitelisted",
            ScanOutcome::Skipped(_) => "skipped",
            ScanOutcome::Errored(_) => "errored",
        }
    }

    /// Human-readable reason for skipped and errored outcomes.
    pub fn reason(&self) -> Option<String> {
        match self {
            ScanOutcome::Skipped(reason) => Some(reason.to_string()),
            ScanOutcome::Errored(e) => Some(e.to_string()),
            _ => None,
        }
    }

    pub fn detail(&self) -> Option<&MatchDetail> {
        match self {
            ScanOutcome::Infected(detail) | ScanOutcome::Whitelisted { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub path: PathBuf,
    pub outcome: ScanOutcome,
}

pub struct ScanStats {
    pub start_time: Instant,
    pub files_scanned: AtomicUsize,
    pub threats_found: AtomicUsize,
    pub whitelisted: AtomicUsize,
    pub bytes_scanned: AtomicUsize,
    pub errors: AtomicUsize,
}

impl ScanStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            files_scanned: AtomicUsize::new(0),
            threats_found: AtomicUsize::new(0),
            whitelisted: AtomicUsize::new(0),
            bytes_scanned: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    pub fn get_files_scanned(&self) -> usize {
        self.files_scanned.load(Ordering::Relaxed)
    }

    pub fn get_threats_found(&self) -> usize {
        self.threats_found.load(Ordering::Relaxed)
    }

    pub fn get_whitelisted(&self) -> usize {
        self.whitelisted.load(Ordering::Relaxed)
    }

    pub fn get_bytes_scanned(&self) -> usize {
        self.bytes_scanned.load(Ordering::Relaxed)
    }

    pub fn get_errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn get_speed_mb_per_s(&self) -> f64 {
        let elapsed = self.start_time.elapsed();
        if elapsed.as_secs_f64() == 0.0 {
            return 0.0;
        }
        let bytes = self.bytes_scanned.load(Ordering::Relaxed) as f64;
        bytes / elapsed.as_secs_f64() / (1024.0 * 1024.0)
    }

    fn record(&self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Infected(_) => {
                self.threats_found.fetch_add(1, Ordering::Relaxed);
            }
            ScanOutcome::Whitelisted { .. } => {
                self.whitelisted.fetch_add(1, Ordering::Relaxed);
            }
            ScanOutcome::Errored(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            ScanOutcome::Clean | ScanOutcome::Skipped(_) => {}
        }
    }
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new()
    }
}

struct ScannerInner {
    options: ScanOptions,
    filter: FileFilter,
    signatures: Arc<SignatureDatabase>,
    whitelist: Option<WhitelistStore>,
    limiter: Arc<Semaphore>,
    retry_delay: Duration,
    stats: ScanStats,
}

/// Cheap to clone; clones share options, signatures, whitelist and stats.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    /// Opens the whitelist store named in `options`, if any.
    pub fn new(signatures: Arc<SignatureDatabase>, options: ScanOptions) -> Result<Self> {
        let store = Self::open_whitelist(&options, None)?;
        Self::with_store(signatures, options, store)
    }

    pub fn with_fatal_hook(
        signatures: Arc<SignatureDatabase>,
        options: ScanOptions,
        hook: FatalHook,
    ) -> Result<Self> {
        let store = Self::open_whitelist(&options, Some(hook))?;
        Self::with_store(signatures, options, store)
    }

    /// Uses `store` as-is and ignores `options.whitelist`.
    pub fn with_store(
        signatures: Arc<SignatureDatabase>,
        options: ScanOptions,
        store: Option<WhitelistStore>,
    ) -> Result<Self> {
        options.validate()?;
        let filter = FileFilter::new(&options)?;

        Ok(Self {
            inner: Arc::new(ScannerInner {
                filter,
                signatures,
                whitelist: store,
                limiter: Arc::new(Semaphore::new(options.max_open_files)),
                retry_delay: Duration::from_millis(options.retry_delay_ms),
                stats: ScanStats::new(),
                options,
            }),
        })
    }

    fn open_whitelist(options: &ScanOptions, hook: Option<FatalHook>) -> Result<Option<WhitelistStore>> {
        let path = match &options.whitelist {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => return Ok(None),
        };
        let store = match hook {
            Some(hook) => WhitelistStore::open_with_hook(Some(path), hook),
            None => WhitelistStore::open(Some(path)),
        }
        .with_context(|| format!("无法打开白名单数据库: {:?}", path))?;
        Ok(Some(store))
    }

    pub fn options(&self) -> &ScanOptions {
        &self.inner.options
    }

    pub fn whitelist(&self) -> Option<&WhitelistStore> {
        self.inner.whitelist.as_ref()
    }

    pub fn stats(&self) -> &ScanStats {
        &self.inner.stats
    }

    pub async fn scan_file<P: AsRef<Path>>(&self, path: P) -> ScanOutcome {
        let path = path.as_ref();
        let outcome = self.inner.scan_file(path).await;
        self.inner.stats.record(&outcome);

        match &outcome {
            ScanOutcome::Errored(e) => log::warn!("扫描失败 {:?}: {}", path, e),
            other => log::debug!("{:?}: {}", path, other.kind()),
        }
        outcome
    }

    /// Walks `path` and streams one event per visited file or excluded
    /// folder. The channel closes once every file task has reported.
    pub fn scan_directory<P: AsRef<Path>>(&self, path: P) -> mpsc::UnboundedReceiver<ScanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scanner = self.clone();
        let root = path.as_ref().to_path_buf();

        tokio::spawn(async move {
            log::info!("开始扫描: {:?} (递归: {})", root, scanner.inner.options.recursive);
            scanner.walk(root, tx).await;
        });

        rx
    }

    pub async fn scan_directory_collect<P: AsRef<Path>>(&self, path: P) -> Vec<ScanEvent> {
        let mut rx = self.scan_directory(path);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(store) = &self.inner.whitelist {
            store.close().await.context("关闭白名单数据库失败")?;
        }
        Ok(())
    }

    async fn walk(&self, root: PathBuf, tx: mpsc::UnboundedSender<ScanEvent>) {
        let mut pending = vec![root];
        let mut visited = HashSet::new();
        while let Some(dir) = pending.pop() {
            self.visit(dir, &mut pending, &mut visited, &tx).await;
        }
        log::debug!("目录遍历完成");
    }

    async fn visit(
        &self,
        dir: PathBuf,
        pending: &mut Vec<PathBuf>,
        visited: &mut HashSet<PathBuf>,
        tx: &mpsc::UnboundedSender<ScanEvent>,
    ) {
        match tokio::fs::try_exists(&dir).await {
            Ok(true) => {}
            Ok(false) => return self.emit(tx, dir, ScanOutcome::Errored(ScanError::FolderNotFound)),
            Err(e) => return self.emit(tx, dir, ScanOutcome::Errored(e.into())),
        }

        let metadata = match tokio::fs::metadata(&dir).await {
            Ok(m) => m,
            Err(e) => return self.emit(tx, dir, ScanOutcome::Errored(e.into())),
        };
        if !metadata.is_dir() {
            return self.spawn_file(dir, tx).await;
        }

        let dir = match tokio::fs::canonicalize(&dir).await {
            Ok(p) => p,
            Err(e) => return self.emit(tx, dir, ScanOutcome::Errored(e.into())),
        };
        // 符号链接环或别名目录只遍历一次
        if !visited.insert(dir.clone()) {
            log::debug!("目录已遍历，跳过: {:?}", dir);
            return;
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Decision::Deny(reason) = self.inner.filter.decide_dir(&name) {
            return self.emit(tx, dir, ScanOutcome::Skipped(reason));
        }

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => return self.emit(tx, dir, ScanOutcome::Errored(e.into())),
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    self.emit(tx, dir.clone(), ScanOutcome::Errored(e.into()));
                    break;
                }
            };

            let target = entry.path();
            match tokio::fs::metadata(&target).await {
                Ok(m) if m.is_dir() => {
                    if self.inner.options.recursive {
                        pending.push(target);
                    }
                }
                Ok(m) if m.is_file() => self.spawn_file(target, tx).await,
                Ok(_) => {}
                Err(e) => self.emit(tx, target, ScanOutcome::Errored(e.into())),
            }
        }
    }

    async fn spawn_file(&self, path: PathBuf, tx: &mpsc::UnboundedSender<ScanEvent>) {
        // 限制同时打开的文件数
        let permit = Arc::clone(&self.inner.limiter).acquire_owned().await.ok();
        let scanner = self.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let outcome = scanner.scan_file(&path).await;
            drop(permit);
            let _ = tx.send(ScanEvent { path, outcome });
        });
    }

    fn emit(&self, tx: &mpsc::UnboundedSender<ScanEvent>, path: PathBuf, outcome: ScanOutcome) {
        self.inner.stats.record(&outcome);
        match &outcome {
            ScanOutcome::Errored(e) => log::warn!("扫描失败 {:?}: {}", path, e),
            ScanOutcome::Skipped(reason) => log::debug!("跳过目录 {:?}: {}", path, reason),
            _ => {}
        }
        let _ = tx.send(ScanEvent { path, outcome });
    }
}

impl ScannerInner {
    async fn scan_file(&self, path: &Path) -> ScanOutcome {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if let Decision::Deny(reason) = self.filter.decide_file(&name) {
            return ScanOutcome::Skipped(reason);
        }

        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => return ScanOutcome::Errored(ScanError::NotFound),
            Err(e) => return ScanOutcome::Errored(e.into()),
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => return ScanOutcome::Errored(e.into()),
        };
        if !metadata.is_file() {
            return ScanOutcome::Errored(ScanError::NotAFile);
        }
        if metadata.len() > self.options.max_size {
            return ScanOutcome::Errored(ScanError::TooLarge);
        }

        self.stats.files_scanned.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_scanned
            .fetch_add(metadata.len() as usize, Ordering::Relaxed);

        if let Some(signature) = self.signatures.match_path(&name) {
            return self.confirm(path, signature.into()).await;
        }

        let text = match self.read_text(path).await {
            Ok(text) => text,
            Err(e) => return ScanOutcome::Errored(e.into()),
        };

        match self.signatures.match_content(&text) {
            Some(signature) => self.confirm(path, signature.into()).await,
            None => ScanOutcome::Clean,
        }
    }

    async fn confirm(&self, path: &Path, detail: MatchDetail) -> ScanOutcome {
        let store = match &self.whitelist {
            Some(store) => store,
            None => return ScanOutcome::Infected(detail),
        };

        match store.lookup_file(path).await {
            Ok(Lookup::Found(origin)) => {
                log::debug!("{:?} 在白名单中 ({})", path, origin.product);
                ScanOutcome::Whitelisted { detail, origin }
            }
            Ok(Lookup::NotFound) => ScanOutcome::Infected(detail),
            Err(e) => ScanOutcome::Errored(ScanError::Storage(e.to_string())),
        }
    }

    async fn read_text(&self, path: &Path) -> io::Result<String> {
        read_with_retry(path, self.retry_delay, || tokio::fs::read(path)).await
    }
}

/// Runs `read` until it succeeds or fails with anything other than
/// descriptor exhaustion, sleeping `retry_delay` between attempts.
pub(crate) async fn read_with_retry<F, Fut>(
    path: &Path,
    retry_delay: Duration,
    mut read: F,
) -> io::Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<Vec<u8>>>,
{
    loop {
        match read().await {
            Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if is_descriptor_exhaustion(&e) => {
                log::debug!("打开文件过多，{:?} 后重试: {:?}", retry_delay, path);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == Errno::EMFILE as i32 || code == Errno::ENFILE as i32
    )
}
