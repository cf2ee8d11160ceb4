pub mod engine;
pub mod filter;
mod database;


pub use engine::{
    CheckKind, MatchDetail, ScanError, ScanEvent, ScanOptions, ScanOutcome, ScanStats, Scanner,
    SkipReason,
};
pub use filter::{Decision, FileFilter};
pub use database::{ContentRule, DetectionKind, ImpactLevel, MalwareType, Signature, SignatureDatabase};
