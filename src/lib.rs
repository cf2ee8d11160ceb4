pub mod scanner;
pub mod whitelist;
pub mod report;
pub mod cli;
pub mod utils;
pub mod config;

#[cfg(test)]
mod tests;

pub use scanner::{ScanEvent, ScanOptions, ScanOutcome, Scanner, SignatureDatabase};
pub use whitelist::WhitelistStore;
