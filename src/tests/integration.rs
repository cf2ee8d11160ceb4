use crate::scanner::{
    CheckKind, ImpactLevel, MalwareType, ScanError, ScanEvent, ScanOptions, ScanOutcome, Scanner,
    SignatureDatabase, SkipReason,
};
use crate::scanner::engine::is_descriptor_exhaustion;
use crate::whitelist::{Lookup, WhitelistStore};
use nix::errno::Errno;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::os::unix::fs::symlink;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BAD_ASP: &str = "<%@ Language=VBScript %>\n<%eval request(\"cmd\")%>\n";
const BAD_PHP: &str = "<?php\n@eval($_POST['cmd']);\n?>\n";
const BAD_CFM: &str = "<cfexecute name=\"#url.cmd#\" arguments=\"#url.args#\" timeout=\"5\"></cfexecute>\n";
const GOOD_PHP: &str = "<?php\necho 'Hello, world!';\n?>\n";
const GOOD_ASP: &str = "<% Response.Write(\"Hello, world!\") %>\n";

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        std::fs::create_dir_all(root.join("subfolder")).unwrap();
        std::fs::create_dir_all(root.join("excluded")).unwrap();

        std::fs::write(root.join("bad.asp"), BAD_ASP).unwrap();
        std::fs::write(root.join("bad.php"), BAD_PHP).unwrap();
        std::fs::write(root.join("fatal.php"), GOOD_PHP).unwrap();
        std::fs::write(root.join("good.php"), GOOD_PHP).unwrap();
        std::fs::write(root.join("good.asp"), GOOD_ASP).unwrap();
        std::fs::write(root.join("big.txt"), "lorem ipsum dolor sit amet\n".repeat(800)).unwrap();
        std::fs::write(root.join("subfolder").join("bad.cfm"), BAD_CFM).unwrap();
        std::fs::write(root.join("excluded").join("bad.php"), BAD_PHP).unwrap();

        let root = root.canonicalize().unwrap();
        Self { _temp: temp, root }
    }

    fn path(&self, relative: &str) -> PathBuf {
        relative.split('/').fold(self.root.clone(), |p, part| p.join(part))
    }
}

fn signatures() -> Arc<SignatureDatabase> {
    let builtin = SignatureDatabase::builtin().unwrap();
    Arc::new(SignatureDatabase::new(
        vec!["fatal.php".to_string()],
        builtin.rules().to_vec(),
    ))
}

fn scanner(options: ScanOptions) -> Scanner {
    Scanner::new(signatures(), options).unwrap()
}

fn infected(events: &[ScanEvent]) -> HashSet<PathBuf> {
    events
        .iter()
        .filter(|e| e.outcome.is_infected())
        .map(|e| e.path.clone())
        .collect()
}

fn outcome_for<'a>(events: &'a [ScanEvent], path: &Path) -> &'a ScanOutcome {
    let matching: Vec<_> = events.iter().filter(|e| e.path == path).collect();
    assert_eq!(matching.len(), 1, "expected exactly one event for {:?}", path);
    &matching[0].outcome
}

#[tokio::test]
async fn test_scan_asp_backdoor() {
    let fx = Fixture::new();
    match scanner(ScanOptions::default()).scan_file(fx.path("bad.asp")).await {
        ScanOutcome::Infected(detail) => {
            assert_eq!(detail.signature_id, Some(10));
            assert_eq!(detail.check, CheckKind::Regex);
            assert_eq!(detail.malware_type, MalwareType::WebShell);
            assert_eq!(detail.impact_level, ImpactLevel::High);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_scan_php_backdoor() {
    let fx = Fixture::new();
    match scanner(ScanOptions::default()).scan_file(fx.path("bad.php")).await {
        ScanOutcome::Infected(detail) => {
            assert_eq!(detail.signature_id, Some(13));
            assert_eq!(detail.check, CheckKind::Regex);
            assert_eq!(detail.malware_type, MalwareType::WebShell);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_scan_clean_files() {
    let fx = Fixture::new();
    let s = scanner(ScanOptions {
        max_size: 16000,
        ..ScanOptions::default()
    });
    assert_eq!(s.scan_file(fx.path("good.php")).await, ScanOutcome::Clean);
    assert_eq!(s.scan_file(fx.path("good.asp")).await, ScanOutcome::Clean);
    assert_eq!(
        s.scan_file(fx.path("big.txt")).await,
        ScanOutcome::Errored(ScanError::TooLarge)
    );
}

#[tokio::test]
async fn test_scan_missing_folder() {
    let fx = Fixture::new();
    let target = fx.path("missing-folder");

    let events = scanner(ScanOptions::default()).scan_directory_collect(&target).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, target);
    assert_eq!(events[0].outcome, ScanOutcome::Errored(ScanError::FolderNotFound));
    assert_eq!(events[0].outcome.reason().as_deref(), Some("Folder is not found"));
}

#[tokio::test]
async fn test_scan_folder_given_a_file() {
    let fx = Fixture::new();
    let target = fx.path("good.asp");

    let events = scanner(ScanOptions::default()).scan_directory_collect(&target).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, target);
    assert_eq!(events[0].outcome, ScanOutcome::Clean);
}

#[tokio::test]
async fn test_scan_folder() {
    let fx = Fixture::new();
    let events = scanner(ScanOptions::default()).scan_directory_collect(&fx.root).await;

    let expected: HashSet<PathBuf> = ["bad.asp", "bad.php", "fatal.php"]
        .iter()
        .map(|f| fx.path(f))
        .collect();
    assert_eq!(infected(&events), expected);

    // 非递归扫描不应报告子目录中的任何文件
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.path.parent() == Some(fx.root.as_path())));
    for clean in ["good.php", "good.asp", "big.txt"] {
        assert_eq!(outcome_for(&events, &fx.path(clean)), &ScanOutcome::Clean);
    }
}

#[tokio::test]
async fn test_scan_folder_recursively() {
    let fx = Fixture::new();
    let s = scanner(ScanOptions {
        recursive: true,
        ..ScanOptions::default()
    });
    let events = s.scan_directory_collect(&fx.root).await;

    let expected: HashSet<PathBuf> = [
        "bad.asp",
        "bad.php",
        "fatal.php",
        "subfolder/bad.cfm",
        "excluded/bad.php",
    ]
    .iter()
    .map(|f| fx.path(f))
    .collect();
    assert_eq!(infected(&events), expected);
    assert_eq!(events.len(), 8);

    match outcome_for(&events, &fx.path("subfolder/bad.cfm")) {
        ScanOutcome::Infected(detail) => assert_eq!(detail.signature_id, Some(17)),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(s.stats().get_threats_found(), 5);
}

#[tokio::test]
async fn test_exclude_folder_by_exclude_pattern() {
    let fx = Fixture::new();
    let s = scanner(ScanOptions {
        recursive: true,
        include_folders: Some("[dse]".to_string()),
        exclude_folders: Some("excluded".to_string()),
        ..ScanOptions::default()
    });
    let events = s.scan_directory_collect(&fx.root).await;

    let excluded = fx.path("excluded");
    assert_eq!(
        outcome_for(&events, &excluded),
        &ScanOutcome::Skipped(SkipReason::ExcludedFolder)
    );
    assert!(events
        .iter()
        .all(|e| e.path == excluded || !e.path.starts_with(&excluded)));
    assert!(infected(&events).contains(&fx.path("subfolder/bad.cfm")));
}

#[tokio::test]
async fn test_exclude_folder_by_include_pattern() {
    let fx = Fixture::new();
    let s = scanner(ScanOptions {
        recursive: true,
        include_folders: Some("^[ds]".to_string()),
        ..ScanOptions::default()
    });
    let events = s.scan_directory_collect(&fx.root).await;

    let excluded = fx.path("excluded");
    let skipped: Vec<_> = events
        .iter()
        .filter(|e| e.outcome == ScanOutcome::Skipped(SkipReason::ExcludedFolder))
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].path, excluded);
    assert!(!events.iter().any(|e| e.path.starts_with(&excluded) && e.path != excluded));
    assert_eq!(events.len(), 8);
}

#[tokio::test]
async fn test_excluded_files_reported_as_skipped() {
    let fx = Fixture::new();
    let s = scanner(ScanOptions {
        exclude: Some("\\.asp$".to_string()),
        ..ScanOptions::default()
    });
    let events = s.scan_directory_collect(&fx.root).await;

    assert_eq!(
        outcome_for(&events, &fx.path("bad.asp")),
        &ScanOutcome::Skipped(SkipReason::Excluded)
    );
    assert_eq!(
        outcome_for(&events, &fx.path("good.asp")),
        &ScanOutcome::Skipped(SkipReason::Excluded)
    );
    assert!(infected(&events).contains(&fx.path("bad.php")));
}

#[tokio::test]
async fn test_single_open_file_limit_still_reports_everything() {
    let fx = Fixture::new();
    let s = scanner(ScanOptions {
        recursive: true,
        max_open_files: 1,
        ..ScanOptions::default()
    });
    let events = s.scan_directory_collect(&fx.root).await;

    assert_eq!(events.len(), 8);
    let unique: HashSet<_> = events.iter().map(|e| e.path.clone()).collect();
    assert_eq!(unique.len(), events.len());
}

#[tokio::test]
async fn test_whitelisted_content_match() {
    let fx = Fixture::new();
    let store = WhitelistStore::open(None).unwrap();

    let mut rx = store.record_tree(fx.path("subfolder"), "Test");
    let mut recorded = Vec::new();
    while let Some(item) = rx.recv().await {
        recorded.push(item.unwrap());
    }
    assert_eq!(recorded.len(), 1);

    match store.lookup(&recorded[0].checksum).await.unwrap() {
        Lookup::Found(entry) => {
            assert_eq!(entry.filename, recorded[0].filename);
            assert_eq!(entry.product, "Test");
        }
        Lookup::NotFound => panic!("expected whitelist hit"),
    }

    let s = Scanner::with_store(
        signatures(),
        ScanOptions {
            recursive: true,
            ..ScanOptions::default()
        },
        Some(store.clone()),
    )
    .unwrap();

    match s.scan_file(fx.path("subfolder/bad.cfm")).await {
        ScanOutcome::Whitelisted { detail, origin } => {
            assert_eq!(detail.signature_id, Some(17));
            assert_eq!(origin.product, "Test");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    // 其他感染文件不受影响
    assert!(s.scan_file(fx.path("bad.php")).await.is_infected());

    assert_eq!(
        store.lookup("caa8c02a9b471a486466ec6368b349db3fa84984").await.unwrap(),
        Lookup::NotFound
    );
    s.close().await.unwrap();
}

#[tokio::test]
async fn test_whitelisted_path_match_from_persisted_store() {
    let fx = Fixture::new();
    let db_path = fx.root.join("whitelist.db");

    let store = WhitelistStore::open(Some(db_path.as_path())).unwrap();
    store.record_file(fx.path("fatal.php"), "Test").await.unwrap();
    store.close().await.unwrap();

    let s = scanner(ScanOptions {
        whitelist: Some(db_path),
        ..ScanOptions::default()
    });
    match s.scan_file(fx.path("fatal.php")).await {
        ScanOutcome::Whitelisted { detail, origin } => {
            assert_eq!(detail.check, CheckKind::Path);
            assert_eq!(origin.product, "Test");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(s.stats().get_whitelisted(), 1);
    s.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_store_degrades_to_error() {
    let fx = Fixture::new();
    let store = WhitelistStore::open(None).unwrap();
    let s = Scanner::with_store(signatures(), ScanOptions::default(), Some(store)).unwrap();
    s.close().await.unwrap();

    // 数据库错误只影响当前文件
    match s.scan_file(fx.path("bad.php")).await {
        ScanOutcome::Errored(ScanError::Storage(_)) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(s.scan_file(fx.path("good.php")).await, ScanOutcome::Clean);
}

#[test]
fn test_descriptor_exhaustion_detection() {
    assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(Errno::EMFILE as i32)));
    assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(Errno::ENFILE as i32)));
    assert!(!is_descriptor_exhaustion(&io::Error::from_raw_os_error(Errno::ENOENT as i32)));
    assert!(!is_descriptor_exhaustion(&io::Error::new(io::ErrorKind::Other, "boom")));
}

#[tokio::test]
async fn test_symlink_cycle_terminates() {
    let fx = Fixture::new();
    symlink(&fx.root, fx.path("subfolder/loop")).unwrap();

    let s = scanner(ScanOptions {
        recursive: true,
        ..ScanOptions::default()
    });
    let events = tokio::time::timeout(Duration::from_secs(10), s.scan_directory_collect(&fx.root))
        .await
        .expect("recursive scan did not finish");

    assert_eq!(events.len(), 8);
    let unique: HashSet<_> = events.iter().map(|e| e.path.clone()).collect();
    assert_eq!(unique.len(), events.len());
    assert_eq!(s.stats().get_threats_found(), 5);
}

#[tokio::test]
async fn test_symlinked_sibling_reported_once() {
    let fx = Fixture::new();
    symlink(fx.path("subfolder"), fx.path("alias")).unwrap();

    let s = scanner(ScanOptions {
        recursive: true,
        ..ScanOptions::default()
    });
    let events = s.scan_directory_collect(&fx.root).await;

    // 别名目录下的文件以规范路径报告，且只报告一次
    match outcome_for(&events, &fx.path("subfolder/bad.cfm")) {
        ScanOutcome::Infected(detail) => assert_eq!(detail.signature_id, Some(17)),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!events.iter().any(|e| e.path.starts_with(fx.path("alias"))));
    assert_eq!(events.len(), 8);
}
