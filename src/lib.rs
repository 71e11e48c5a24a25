// BioTeller - Account Ledger Engine Core Library
// Exposes all modules for use in the CLI, API server, and tests

pub mod config;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod processor;
pub mod session;
pub mod storage;
pub mod template;

// Re-export commonly used types
pub use config::{EngineConfig, SessionPolicy};
pub use error::{EngineError, EngineResult};
pub use ledger::{Account, AccountLedger, EntryOutcome, LedgerEntry, OperationKind};
pub use matcher::{Cosine, Euclidean, Hamming, MatchOutcome, Matcher, Similarity};
pub use processor::{Receipt, TransactionProcessor};
pub use session::{Session, SessionAuthenticator};
pub use storage::Storage;
pub use template::{fingerprint, BiometricTemplate, TemplateStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
