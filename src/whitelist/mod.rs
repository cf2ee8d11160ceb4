//! Known-good file store keyed by SHA-1 content checksum.
//!
//! One SQLite connection is owned by a dedicated worker thread; every
//! handle clone submits requests over a channel, so reads and writes run
//! one at a time in submission order.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use walkdir::WalkDir;

const READ_BUFFER_SIZE: usize = 8192;
const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("{} is not found", .path.display())]
    NotFound { path: PathBuf },

    #[error("IO failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("SQLite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("whitelist store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, WhitelistError>;

/// Invoked when the store cannot be opened at all.
pub type FatalHook = Arc<dyn Fn(&WhitelistError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub checksum: String,
    pub filename: String,
    pub product: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(WhitelistEntry),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFile {
    pub filename: String,
    pub checksum: String,
}

enum Request {
    Insert {
        entry: WhitelistEntry,
        reply: oneshot::Sender<rusqlite::Result<()>>,
    },
    Lookup {
        checksum: String,
        reply: oneshot::Sender<rusqlite::Result<Option<WhitelistEntry>>>,
    },
    Count {
        reply: oneshot::Sender<rusqlite::Result<u64>>,
    },
    Close {
        reply: oneshot::Sender<rusqlite::Result<()>>,
    },
}

#[derive(Clone)]
pub struct WhitelistStore {
    tx: mpsc::UnboundedSender<Request>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    location: Arc<str>,
}

impl std::fmt::Debug for WhitelistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhitelistStore")
            .field("location", &self.location)
            .finish()
    }
}

impl WhitelistStore {
    /// Opens the store at `path`, or an in-memory store when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        Self::open_inner(path)
    }

    pub fn open_with_hook(path: Option<&Path>, hook: FatalHook) -> Result<Self> {
        Self::open_inner(path).map_err(|e| {
            hook(&e);
            e
        })
    }

    fn open_inner(path: Option<&Path>) -> Result<Self> {
        let (conn, location) = match path {
            Some(p) if p.as_os_str() != IN_MEMORY => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|source| WhitelistError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                (Connection::open(p)?, p.display().to_string())
            }
            _ => (Connection::open_in_memory()?, IN_MEMORY.to_string()),
        };
        apply_schema(&conn)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("whitelist-db".to_string())
            .spawn(move || run_worker(conn, rx))
            .map_err(|source| WhitelistError::Io {
                path: PathBuf::from(&location),
                source,
            })?;

        log::debug!("白名单数据库已打开: {}", location);

        Ok(Self {
            tx,
            worker: Arc::new(Mutex::new(Some(worker))),
            location: location.into(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn record_file<P: AsRef<Path>>(&self, path: P, product: &str) -> Result<RecordedFile> {
        let path = path.as_ref();
        let sha1 = checksum(path).await?;
        let filename = path.to_string_lossy().into_owned();

        let entry = WhitelistEntry {
            checksum: sha1.clone(),
            filename: filename.clone(),
            product: product.to_string(),
        };
        self.request(|reply| Request::Insert { entry, reply }).await?;

        log::debug!("已加入白名单: {} ({})", filename, sha1);
        Ok(RecordedFile {
            filename,
            checksum: sha1,
        })
    }

    /// Records every regular file under `path`, one result per file.
    pub fn record_tree<P: AsRef<Path>>(
        &self,
        path: P,
        product: &str,
    ) -> mpsc::UnboundedReceiver<Result<RecordedFile>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let root = path.as_ref().to_path_buf();
        let product = product.to_string();

        tokio::spawn(async move {
            let walk_root = root.clone();
            let files = match tokio::task::spawn_blocking(move || collect_files(&walk_root)).await {
                Ok(files) => files,
                Err(e) => vec![Err(WhitelistError::Io {
                    path: root,
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })],
            };

            for file in files {
                let result = match file {
                    Ok(p) => store.record_file(&p, &product).await,
                    Err(e) => Err(e),
                };
                if tx.send(result).is_err() {
                    break;
                }
            }
        });

        rx
    }

    pub async fn lookup(&self, checksum: &str) -> Result<Lookup> {
        let checksum = checksum.to_lowercase();
        let row = self.request(|reply| Request::Lookup { checksum, reply }).await?;
        Ok(match row {
            Some(entry) => Lookup::Found(entry),
            None => Lookup::NotFound,
        })
    }

    pub async fn lookup_file<P: AsRef<Path>>(&self, path: P) -> Result<Lookup> {
        let sha1 = checksum(path).await?;
        self.lookup(&sha1).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.request(|reply| Request::Count { reply }).await
    }

    /// Waits for queued requests, then closes the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Close { reply }).is_ok() {
            if let Ok(result) = rx.await {
                result?;
            }
        }

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
            log::debug!("白名单数据库已关闭: {}", self.location);
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<rusqlite::Result<T>>) -> Request,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| WhitelistError::Closed)?;
        let result = rx.await.map_err(|_| WhitelistError::Closed)?;
        Ok(result?)
    }
}

/// SHA-1 of the whole file, read incrementally.
pub async fn checksum<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let mut file = tokio::fs::File::open(path).await.map_err(|e| io_error(path, e))?;

    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer).await.map_err(|e| io_error(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn io_error(path: &Path, source: io::Error) -> WhitelistError {
    if source.kind() == io::ErrorKind::NotFound {
        WhitelistError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        WhitelistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Whitelist (checksum TEXT, filename TEXT, product TEXT);
         CREATE INDEX IF NOT EXISTS idx_whitelist_checksum ON Whitelist (checksum);",
    )
}

fn run_worker(conn: Connection, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Insert { entry, reply } => {
                let result = conn
                    .prepare_cached(
                        "INSERT INTO Whitelist (checksum, filename, product) VALUES (?1, ?2, ?3)",
                    )
                    .and_then(|mut stmt| {
                        stmt.execute(params![entry.checksum, entry.filename, entry.product])
                    })
                    .map(|_| ());
                let _ = reply.send(result);
            }
            Request::Lookup { checksum, reply } => {
                // 重复记录时取最早插入的一条
                let result = conn
                    .prepare_cached(
                        "SELECT checksum, filename, product FROM Whitelist
                         WHERE checksum = ?1 ORDER BY rowid LIMIT 1",
                    )
                    .and_then(|mut stmt| {
                        stmt.query_row(params![checksum], |row| {
                            Ok(WhitelistEntry {
                                checksum: row.get(0)?,
                                filename: row.get(1)?,
                                product: row.get(2)?,
                            })
                        })
                        .optional()
                    });
                let _ = reply.send(result);
            }
            Request::Count { reply } => {
                let result = conn
                    .query_row("SELECT COUNT(*) FROM Whitelist", [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64);
                let _ = reply.send(result);
            }
            Request::Close { reply } => {
                rx.close();
                let result = conn.close().map_err(|(_, e)| e);
                let _ = reply.send(result);
                return;
            }
        }
    }
}

fn collect_files(root: &Path) -> Vec<Result<PathBuf>> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) if e.file_type().is_file() => Some(Ok(e.into_path())),
            Ok(_) => None,
            Err(e) => Some(Err(walk_error(root, e))),
        })
        .collect()
}

fn walk_error(root: &Path, e: walkdir::Error) -> WhitelistError {
    let path = e.path().unwrap_or(root).to_path_buf();
    let message = e.to_string();
    match e.into_io_error() {
        Some(source) => io_error(&path, source),
        None => WhitelistError::Io {
            path,
            source: io::Error::new(io::ErrorKind::Other, message),
        },
    }
}
