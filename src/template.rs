// Template Store - enrolled biometric templates keyed by account id
//
// Templates are opaque fixed-length feature vectors produced by the sensor
// collaborator; this module never sees raw images or hardware handles.
// Iteration order is fixed (by account id) so matching is reproducible.

use crate::error::{EngineError, EngineResult};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

// ============================================================================
// BIOMETRIC TEMPLATE
// ============================================================================

/// Enrolled feature vector. Immutable once stored; re-enrollment supersedes
/// the old template, it never merges with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricTemplate {
    /// Fixed-length feature vector
    pub vector: Vec<f32>,

    /// SHA-256 over the vector bytes; safe to log where the vector is not
    pub fingerprint: String,

    /// When this template was enrolled
    pub enrolled_at: DateTime<Utc>,
}

impl BiometricTemplate {
    pub fn new(vector: Vec<f32>) -> Self {
        let fingerprint = fingerprint(&vector);
        BiometricTemplate {
            vector,
            fingerprint,
            enrolled_at: Utc::now(),
        }
    }
}

/// Hex SHA-256 of the vector's little-endian bytes
pub fn fingerprint(vector: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for value in vector {
        hasher.update(value.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TEMPLATE STORE
// ============================================================================

/// Persistent store of enrolled templates, one per account
pub struct TemplateStore {
    storage: Storage,
    template_len: usize,
}

impl TemplateStore {
    pub fn new(storage: Storage, template_len: usize) -> Self {
        TemplateStore {
            storage,
            template_len,
        }
    }

    /// Expected feature vector length for this deployment
    pub fn template_len(&self) -> usize {
        self.template_len
    }

    /// Enroll a template for an account, superseding any prior one
    pub fn enroll(&self, account_id: &str, vector: Vec<f32>) -> EngineResult<BiometricTemplate> {
        if vector.len() != self.template_len {
            return Err(EngineError::TemplateMismatch {
                expected: self.template_len,
                actual: vector.len(),
            });
        }

        // Non-finite components are sensor garbage, not a feature vector
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidTemplate(
                "non-finite component in feature vector".to_string(),
            ));
        }

        let template = BiometricTemplate::new(vector);
        let vector_json = serde_json::to_string(&template.vector).map_err(|e| {
            EngineError::Unavailable {
                attempts: 1,
                message: e.to_string(),
            }
        })?;

        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO templates (account_id, vector, fingerprint, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id) DO UPDATE SET
                     vector = excluded.vector,
                     fingerprint = excluded.fingerprint,
                     enrolled_at = excluded.enrolled_at",
                params![
                    account_id,
                    vector_json,
                    template.fingerprint,
                    template.enrolled_at.to_rfc3339(),
                ],
            )
        })?;

        info!(account_id, fingerprint = %template.fingerprint, "template enrolled");
        Ok(template)
    }

    /// Fetch the template enrolled for an account
    pub fn lookup(&self, account_id: &str) -> EngineResult<BiometricTemplate> {
        let found = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT vector, fingerprint, enrolled_at
                 FROM templates WHERE account_id = ?1",
                params![account_id],
                decode_template_row,
            )
            .optional()
        })?;

        found.ok_or_else(|| EngineError::NotFound(account_id.to_string()))
    }

    /// All enrolled templates, ordered by account id.
    ///
    /// The fixed order makes matcher scans deterministic across runs.
    pub fn all(&self) -> EngineResult<Vec<(String, BiometricTemplate)>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, vector, fingerprint, enrolled_at
                 FROM templates ORDER BY account_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let account_id: String = row.get(0)?;
                    let vector_json: String = row.get(1)?;
                    let vector: Vec<f32> = serde_json::from_str(&vector_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                    })?;
                    let fingerprint: String = row.get(2)?;
                    let enrolled_at = parse_timestamp(row.get::<_, String>(3)?, 3)?;
                    Ok((
                        account_id,
                        BiometricTemplate {
                            vector,
                            fingerprint,
                            enrolled_at,
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn decode_template_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BiometricTemplate> {
    let vector_json: String = row.get(0)?;
    let vector: Vec<f32> = serde_json::from_str(&vector_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let fingerprint: String = row.get(1)?;
    let enrolled_at = parse_timestamp(row.get::<_, String>(2)?, 2)?;
    Ok(BiometricTemplate {
        vector,
        fingerprint,
        enrolled_at,
    })
}

pub(crate) fn parse_timestamp(text: String, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(len: usize) -> TemplateStore {
        TemplateStore::new(Storage::in_memory().unwrap(), len)
    }

    #[test]
    fn test_enroll_and_lookup() {
        let store = store(4);
        let enrolled = store.enroll("acct-1", vec![0.1, 0.2, 0.3, 0.4]).unwrap();

        let found = store.lookup("acct-1").unwrap();
        assert_eq!(found.vector, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(found.fingerprint, enrolled.fingerprint);
    }

    #[test]
    fn test_lookup_unknown_account() {
        let store = store(4);
        assert_eq!(
            store.lookup("ghost"),
            Err(EngineError::NotFound("ghost".to_string()))
        );
    }

    #[test]
    fn test_reenrollment_supersedes() {
        let store = store(4);
        store.enroll("acct-1", vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        store.enroll("acct-1", vec![0.0, 1.0, 0.0, 0.0]).unwrap();

        // Old template is gone, not merged
        let found = store.lookup("acct-1").unwrap();
        assert_eq!(found.vector, vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let store = store(4);
        let result = store.enroll("acct-1", vec![0.1, 0.2]);
        assert_eq!(
            result,
            Err(EngineError::TemplateMismatch {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_non_finite_components_rejected() {
        let store = store(2);
        let result = store.enroll("acct-1", vec![f32::NAN, 0.2]);
        assert!(matches!(result, Err(EngineError::InvalidTemplate(_))));
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_all_is_ordered_by_account_id() {
        let store = store(2);
        store.enroll("charlie", vec![0.3, 0.3]).unwrap();
        store.enroll("alice", vec![0.1, 0.1]).unwrap();
        store.enroll("bob", vec![0.2, 0.2]).unwrap();

        let ids: Vec<String> = store.all().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["alice", "bob", "charlie"]);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint(&[0.5, -0.5]);
        let b = fingerprint(&[0.5, -0.5]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint(&[0.5, 0.5]));
    }
}
