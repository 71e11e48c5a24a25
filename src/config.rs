// Engine configuration
//
// Acceptance threshold and ambiguity margin are policy choices with no
// universally correct value, so they live here instead of being hardcoded
// anywhere in the matcher.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// SESSION POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Session stays valid for any number of operations until it expires
    MultiUse,

    /// Session is destroyed when the first mutating operation is admitted
    SingleUse,
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// All recognized configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum similarity score to accept a match (default: 0.85)
    pub match_threshold: f64,

    /// Two candidates above threshold within this margin of each other are
    /// reported as ambiguous, never resolved by rank (default: 0.03)
    pub ambiguity_margin: f64,

    /// Session time-to-live in seconds (default: 120)
    pub session_ttl_secs: u64,

    /// Maximum single-transaction amount (default: 10000)
    pub max_txn_amount: Decimal,

    /// Multi-use or single-use sessions (default: multi_use)
    pub session_policy: SessionPolicy,

    /// Append a rejected ledger entry for failed withdrawals and over-limit
    /// deposits (default: true)
    pub record_rejected_entries: bool,

    /// Expected template vector length (default: 128)
    pub template_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            match_threshold: 0.85,
            ambiguity_margin: 0.03,
            session_ttl_secs: 120,
            max_txn_amount: Decimal::new(10_000, 0),
            session_policy: SessionPolicy::MultiUse,
            record_rejected_entries: true,
            template_len: 128,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: EngineConfig =
            serde_json::from_str(&raw).context("Failed to parse config JSON")?;
        Ok(config)
    }
}
