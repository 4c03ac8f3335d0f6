pub mod config;
pub mod database;
pub mod encoding;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod index;
pub mod logger;
pub mod scheduler;
pub mod slot;
pub mod stats;
pub mod transaction;
pub mod worker;

pub use config::Config;
pub use database::Database;
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use logger::recovery::RecoveryReport;
pub use stats::StatsSnapshot;
pub use transaction::{AbortReason, Transaction, TxStatus};
