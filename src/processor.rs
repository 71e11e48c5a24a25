// Transaction Processor - the only path from a session to the ledger
//
// Every mutating call is authenticated here; nothing else in the crate
// hands the Account Ledger a mutation. Session errors propagate verbatim,
// and an operation admitted with a valid session runs to completion even
// if the session expires while it is in flight.

use crate::error::{EngineError, EngineResult};
use crate::ledger::{AccountLedger, OperationKind};
use crate::session::SessionAuthenticator;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// What the caller gets back from a successful operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub account_id: String,
    pub balance: Decimal,
}

pub struct TransactionProcessor {
    authenticator: Arc<SessionAuthenticator>,
    ledger: Arc<AccountLedger>,
}

impl TransactionProcessor {
    pub fn new(authenticator: Arc<SessionAuthenticator>, ledger: Arc<AccountLedger>) -> Self {
        TransactionProcessor {
            authenticator,
            ledger,
        }
    }

    /// Validate the session, then execute the requested operation.
    ///
    /// Amounts must be strictly positive for every kind, inquiry included.
    /// Inquiries read the committed balance and never touch the ledger log.
    pub fn execute(
        &self,
        token: &Uuid,
        kind: OperationKind,
        amount: Decimal,
    ) -> EngineResult<Receipt> {
        let account_id = self.authenticator.validate(token)?;

        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(format!(
                "amount must be strictly positive, got {}",
                amount
            )));
        }

        match kind {
            OperationKind::Inquiry => {
                let balance = self.ledger.balance(&account_id)?;
                Ok(Receipt {
                    account_id,
                    balance,
                })
            }
            OperationKind::Deposit | OperationKind::Withdraw => {
                // Admission is the point where a single-use session is
                // consumed; the ledger call below completes regardless of
                // expiry from here on
                let account_id = self.authenticator.admit_mutation(token)?;
                debug!(account_id = %account_id, kind = kind.as_str(), %amount, "mutation admitted");
                let balance = self.ledger.apply(&account_id, kind, amount)?;
                Ok(Receipt {
                    account_id,
                    balance,
                })
            }
        }
    }

    /// Balance read for an authenticated session (the §6 balance call has
    /// no amount, so it does not go through `execute`)
    pub fn balance(&self, token: &Uuid) -> EngineResult<Receipt> {
        let account_id = self.authenticator.validate(token)?;
        let balance = self.ledger.balance(&account_id)?;
        Ok(Receipt {
            account_id,
            balance,
        })
    }
}
