use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::Arc;

use bioteller::{
    AccountLedger, EngineConfig, Matcher, OperationKind, SessionAuthenticator, Storage,
    TemplateStore, TransactionProcessor,
};

const DEFAULT_DB_PATH: &str = "bioteller.db";
const CONFIG_PATH: &str = "bioteller.json";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") => {
            let csv_path = args
                .get(2)
                .context("Usage: bioteller import <enrollments.csv> [db]")?;
            let db_path = args.get(3).map(String::as_str).unwrap_or(DEFAULT_DB_PATH);
            run_import(Path::new(csv_path), Path::new(db_path))
        }
        Some("verify") => {
            let db_path = args.get(2).map(String::as_str).unwrap_or(DEFAULT_DB_PATH);
            run_verify(Path::new(db_path))
        }
        Some("demo") | None => run_demo(),
        Some(other) => bail!("Unknown mode: {} (expected import, verify or demo)", other),
    }
}

/// Load config from bioteller.json when present, defaults otherwise
fn load_config() -> Result<EngineConfig> {
    let path = Path::new(CONFIG_PATH);
    if path.exists() {
        EngineConfig::load(path)
    } else {
        Ok(EngineConfig::default())
    }
}

// ============================================================================
// IMPORT MODE - bulk enrollment from CSV
// ============================================================================

/// One row of the admin enrollment CSV. The template column holds the
/// feature vector as space-separated floats.
#[derive(Debug, Deserialize)]
struct EnrollmentRecord {
    #[serde(rename = "Account_Id")]
    account_id: String,

    #[serde(rename = "Display_Name")]
    display_name: String,

    #[serde(rename = "Initial_Balance")]
    initial_balance: Decimal,

    #[serde(rename = "Template")]
    template: String,
}

fn parse_template_field(raw: &str) -> Result<Vec<f32>> {
    raw.split_whitespace()
        .map(|part| {
            part.parse::<f32>()
                .with_context(|| format!("Bad template component: {}", part))
        })
        .collect()
}

fn run_import(csv_path: &Path, db_path: &Path) -> Result<()> {
    println!("🏦 BioTeller - Enrollment Import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = load_config()?;
    let storage = Storage::open(db_path)?;
    let templates = TemplateStore::new(storage.clone(), config.template_len);
    let ledger = AccountLedger::new(storage, &config);

    println!("\n📂 Reading {:?}...", csv_path);
    let mut reader = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut enrolled = 0;
    let mut failed = 0;

    for result in reader.deserialize() {
        let record: EnrollmentRecord = result.context("Failed to deserialize enrollment row")?;
        let vector = parse_template_field(&record.template)?;

        match ledger
            .open_account(&record.account_id, &record.display_name, record.initial_balance)
            .and_then(|_| templates.enroll(&record.account_id, vector))
        {
            Ok(template) => {
                enrolled += 1;
                println!(
                    "✓ {} ({}) fingerprint {}…",
                    record.account_id,
                    record.display_name,
                    &template.fingerprint[..12]
                );
            }
            Err(e) => {
                failed += 1;
                eprintln!("✗ {}: {}", record.account_id, e);
            }
        }
    }

    println!("\n✓ Enrolled: {} accounts", enrolled);
    if failed > 0 {
        println!("✗ Failed: {} rows", failed);
    }

    Ok(())
}

// ============================================================================
// VERIFY MODE - replay every ledger against its balance
// ============================================================================

fn run_verify(db_path: &Path) -> Result<()> {
    println!("🔍 BioTeller - Ledger Verification");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !db_path.exists() {
        bail!("Database not found at {:?} (run import first)", db_path);
    }

    let config = load_config()?;
    let storage = Storage::open(db_path)?;
    let ledger = AccountLedger::new(storage, &config);

    let mut mismatches = 0;
    let accounts = ledger.accounts()?;

    for account in &accounts {
        let replayed = ledger.reconstruct_balance(&account.id)?;
        if replayed == account.balance {
            println!("✓ {} balance {} matches replay", account.id, account.balance);
        } else {
            mismatches += 1;
            eprintln!(
                "✗ {} balance {} but replay gives {}",
                account.id, account.balance, replayed
            );
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if mismatches == 0 {
        println!("✅ {} accounts verified, all ledgers consistent", accounts.len());
        Ok(())
    } else {
        bail!("{} of {} accounts have inconsistent ledgers", mismatches, accounts.len());
    }
}

// ============================================================================
// DEMO MODE - end-to-end walkthrough against in-memory storage
// ============================================================================

/// Deterministic sample vector: ones in one half, zeros in the other, so
/// the two demo customers are orthogonal under cosine similarity
fn sample_template(first_half: bool, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let in_first = i < len / 2;
            if in_first == first_half {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn run_demo() -> Result<()> {
    println!("🏦 BioTeller - Account Ledger Engine Demo");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = load_config()?;
    let storage = Storage::in_memory()?;
    let templates = Arc::new(TemplateStore::new(storage.clone(), config.template_len));
    let matcher = Matcher::new(
        Arc::clone(&templates),
        config.match_threshold,
        config.ambiguity_margin,
    );
    let authenticator = Arc::new(SessionAuthenticator::new(matcher, &config));
    let ledger = Arc::new(AccountLedger::new(storage, &config));
    let processor = TransactionProcessor::new(Arc::clone(&authenticator), Arc::clone(&ledger));

    // 1. Enroll two customers
    println!("\n📇 Enrolling customers...");
    let alice_template = sample_template(true, config.template_len);
    let bob_template = sample_template(false, config.template_len);

    ledger.open_account("alice", "Alice Nakamura", "100.00".parse()?)?;
    let enrolled = templates.enroll("alice", alice_template.clone())?;
    println!("✓ alice enrolled, fingerprint {}…", &enrolled.fingerprint[..12]);

    ledger.open_account("bob", "Bob Okafor", "500.00".parse()?)?;
    let enrolled = templates.enroll("bob", bob_template)?;
    println!("✓ bob enrolled, fingerprint {}…", &enrolled.fingerprint[..12]);

    // 2. Authenticate as alice
    println!("\n🔐 Authenticating with alice's template...");
    let session = authenticator.authenticate(&alice_template)?;
    println!(
        "✓ Session issued for {}, expires {}",
        session.account_id, session.expires_at
    );

    // 3. Run transactions
    println!("\n💰 Running transactions...");
    let receipt = processor.execute(&session.token, OperationKind::Deposit, "50.00".parse()?)?;
    println!("✓ Deposit 50.00 → balance {}", receipt.balance);

    match processor.execute(&session.token, OperationKind::Withdraw, "200.00".parse()?) {
        Err(e) => println!("✗ Withdraw 200.00 denied: {}", e),
        Ok(_) => bail!("overdraft unexpectedly allowed"),
    }

    let receipt = processor.execute(&session.token, OperationKind::Withdraw, "150.00".parse()?)?;
    println!("✓ Withdraw 150.00 → balance {}", receipt.balance);

    let receipt = processor.balance(&session.token)?;
    println!("✓ Balance inquiry → {}", receipt.balance);

    // 4. Show the ledger
    println!("\n📜 Ledger for alice:");
    for entry in ledger.entries("alice")? {
        println!(
            "   #{} {} {} requested {} → balance {} [{}]{}",
            entry.seq,
            entry.kind.as_str(),
            entry.amount,
            entry.requested,
            entry.balance_after,
            entry.outcome.as_str(),
            entry
                .reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default(),
        );
    }

    let replayed = ledger.reconstruct_balance("alice")?;
    println!("\n✓ Replay check: {} == {}", replayed, ledger.balance("alice")?);

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Demo complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_template_field() {
        let vector = parse_template_field("1.0 0.5 -0.25").unwrap();
        assert_eq!(vector, vec![1.0, 0.5, -0.25]);
        assert!(parse_template_field("1.0 oops").is_err());
    }

    #[test]
    fn test_sample_templates_are_orthogonal() {
        let a = sample_template(true, 8);
        let b = sample_template(false, 8);
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert_eq!(dot, 0.0);
    }
}
