#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use proctor_kernel_contracts::ph1proctor::{
    ExamId, IdentityEmbedding, ProctorSessionId, UserId, ViolationId, ViolationRecord,
    ViolationRecordInput, PH1PROCTOR_CONTRACT_VERSION,
};
use proctor_kernel_contracts::{
    ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate,
};
use sha2::{Digest, Sha256};

pub const VIOLATION_CHAIN_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("hash chain broken on {table} at row {row_id}")]
    HashChainBroken { table: &'static str, row_id: u64 },
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
    #[error("{table} unavailable: {reason}")]
    Unavailable { table: &'static str, reason: String },
}

/// Durable session row. The reference embedding is fixed at insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ProctorSessionRecord {
    pub schema_version: SchemaVersion,
    pub session_id: ProctorSessionId,
    pub exam_id: ExamId,
    pub user_id: UserId,
    pub started_at: MonotonicTimeNs,
    reference_embedding: Option<IdentityEmbedding>,
}

impl ProctorSessionRecord {
    pub fn v1(
        session_id: ProctorSessionId,
        exam_id: ExamId,
        user_id: UserId,
        started_at: MonotonicTimeNs,
        reference_embedding: Option<IdentityEmbedding>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PH1PROCTOR_CONTRACT_VERSION,
            session_id,
            exam_id,
            user_id,
            started_at,
            reference_embedding,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn reference_embedding(&self) -> Option<&IdentityEmbedding> {
        self.reference_embedding.as_ref()
    }
}

impl Validate for ProctorSessionRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1PROCTOR_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "proctor_session_record.schema_version",
                reason: "must match PH1PROCTOR_CONTRACT_VERSION",
            });
        }
        self.session_id.validate()?;
        self.exam_id.validate()?;
        if let Some(e) = &self.reference_embedding {
            e.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ProctorTables {
    proctor_sessions: BTreeMap<ProctorSessionId, ProctorSessionRecord>,
    next_proctor_session_id: u64,
    violation_ledger: Vec<ViolationRecord>,
    next_violation_id: u64,
    violation_idempotency_index: BTreeMap<(ProctorSessionId, String), ViolationId>,
}

/// In-memory reference store for proctoring sessions and the violation ledger.
///
/// All methods take `&self`; the tables sit behind one reader/writer lock that
/// is held only for the duration of a single read or append.
#[derive(Debug)]
pub struct ProctorStore {
    tables: RwLock<ProctorTables>,
}

impl Default for ProctorStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl ProctorStore {
    pub fn new_in_memory() -> Self {
        Self {
            tables: RwLock::new(ProctorTables {
                proctor_sessions: BTreeMap::new(),
                next_proctor_session_id: 1,
                violation_ledger: Vec::new(),
                next_violation_id: 1,
                violation_idempotency_index: BTreeMap::new(),
            }),
        }
    }

    fn read_tables(&self) -> Result<RwLockReadGuard<'_, ProctorTables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::Unavailable {
            table: "proctor_store",
            reason: "table lock poisoned".to_string(),
        })
    }

    fn write_tables(&self) -> Result<RwLockWriteGuard<'_, ProctorTables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::Unavailable {
            table: "proctor_store",
            reason: "table lock poisoned".to_string(),
        })
    }

    pub fn insert_proctor_session(
        &self,
        exam_id: ExamId,
        user_id: UserId,
        started_at: MonotonicTimeNs,
        reference_embedding: Option<IdentityEmbedding>,
    ) -> Result<ProctorSessionRecord, StorageError> {
        let mut t = self.write_tables()?;
        let session_id = ProctorSessionId(t.next_proctor_session_id);
        if t.proctor_sessions.contains_key(&session_id) {
            return Err(StorageError::DuplicateKey {
                table: "proctor_sessions.session_id",
                key: session_id.0.to_string(),
            });
        }
        let rec = ProctorSessionRecord::v1(
            session_id,
            exam_id,
            user_id,
            started_at,
            reference_embedding,
        )?;
        t.next_proctor_session_id = t.next_proctor_session_id.saturating_add(1);
        t.proctor_sessions.insert(session_id, rec.clone());
        Ok(rec)
    }

    pub fn proctor_session(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Option<ProctorSessionRecord>, StorageError> {
        Ok(self.read_tables()?.proctor_sessions.get(&session_id).cloned())
    }

    pub fn proctor_sessions_by_exam(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<ProctorSessionRecord>, StorageError> {
        Ok(self
            .read_tables()?
            .proctor_sessions
            .values()
            .filter(|s| s.exam_id == exam_id)
            .cloned()
            .collect())
    }

    /// Most recently started session of `user_id` for `exam_id`; ties go to the
    /// higher session id.
    pub fn latest_proctor_session_for_user(
        &self,
        exam_id: ExamId,
        user_id: &UserId,
    ) -> Result<Option<ProctorSessionRecord>, StorageError> {
        Ok(self
            .read_tables()?
            .proctor_sessions
            .values()
            .filter(|s| s.exam_id == exam_id && &s.user_id == user_id)
            .max_by_key(|s| (s.started_at, s.session_id))
            .cloned())
    }

    pub fn attempt_overwrite_proctor_session(
        &self,
        _session_id: ProctorSessionId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "proctor_sessions",
        })
    }

    pub fn append_violation(
        &self,
        input: ViolationRecordInput,
    ) -> Result<ViolationId, StorageError> {
        input.validate()?;
        let mut t = self.write_tables()?;

        if !t.proctor_sessions.contains_key(&input.session_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "violation_ledger.session_id",
                key: input.session_id.0.to_string(),
            });
        }

        if let Some(k) = &input.idempotency_key {
            if let Some(existing) = t
                .violation_idempotency_index
                .get(&(input.session_id, k.clone()))
            {
                // Deterministic no-op on retry: return the original violation_id.
                return Ok(*existing);
            }
        }

        let violation_id = ViolationId(t.next_violation_id);
        let prev_row_hash = t
            .violation_ledger
            .last()
            .map(|r| r.row_hash.clone())
            .unwrap_or_else(|| VIOLATION_CHAIN_GENESIS_HASH.to_string());
        let row_hash = violation_row_hash(
            &prev_row_hash,
            violation_id,
            input.session_id,
            input.kind.as_str(),
            input.reason_code,
            input.recorded_at,
            input.idempotency_key.as_deref(),
        );
        let rec = ViolationRecord::from_input_v1(violation_id, input, prev_row_hash, row_hash)?;
        t.next_violation_id = t.next_violation_id.saturating_add(1);

        if let Some(k) = &rec.idempotency_key {
            t.violation_idempotency_index
                .insert((rec.session_id, k.clone()), rec.violation_id);
        }
        t.violation_ledger.push(rec);
        Ok(violation_id)
    }

    pub fn violation_ledger(&self) -> Result<Vec<ViolationRecord>, StorageError> {
        Ok(self.read_tables()?.violation_ledger.clone())
    }

    pub fn violations_by_session(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Vec<ViolationRecord>, StorageError> {
        Ok(self
            .read_tables()?
            .violation_ledger
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    pub fn violation_by_idempotency_key(
        &self,
        session_id: ProctorSessionId,
        idempotency_key: &str,
    ) -> Result<Option<ViolationRecord>, StorageError> {
        let t = self.read_tables()?;
        let Some(id) = t
            .violation_idempotency_index
            .get(&(session_id, idempotency_key.to_string()))
        else {
            return Ok(None);
        };
        Ok(t.violation_ledger
            .iter()
            .find(|r| r.violation_id == *id)
            .cloned())
    }

    pub fn attempt_overwrite_violation_row(
        &self,
        _violation_id: ViolationId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "violation_ledger",
        })
    }

    pub fn verify_violation_chain(&self) -> Result<(), StorageError> {
        let t = self.read_tables()?;
        let mut prev = VIOLATION_CHAIN_GENESIS_HASH.to_string();
        for r in &t.violation_ledger {
            let expected = violation_row_hash(
                &prev,
                r.violation_id,
                r.session_id,
                r.kind.as_str(),
                r.reason_code,
                r.recorded_at,
                r.idempotency_key.as_deref(),
            );
            if r.prev_row_hash != prev || r.row_hash != expected {
                return Err(StorageError::HashChainBroken {
                    table: "violation_ledger",
                    row_id: r.violation_id.0,
                });
            }
            prev = r.row_hash.clone();
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper_violation_kind_for_test(
        &self,
        violation_id: ViolationId,
        kind: proctor_kernel_contracts::ph1proctor::ViolationKind,
    ) {
        let mut t = self.tables.write().unwrap();
        if let Some(r) = t
            .violation_ledger
            .iter_mut()
            .find(|r| r.violation_id == violation_id)
        {
            r.kind = kind;
        }
    }

    #[cfg(test)]
    fn poison_for_test(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.tables.write().unwrap();
            panic!("poison table lock");
        }));
    }
}

fn violation_row_hash(
    prev_row_hash: &str,
    violation_id: ViolationId,
    session_id: ProctorSessionId,
    kind: &str,
    reason_code: ReasonCodeId,
    recorded_at: MonotonicTimeNs,
    idempotency_key: Option<&str>,
) -> String {
    let mut h = Sha256::new();
    h.update(prev_row_hash.as_bytes());
    h.update(b"|");
    h.update(violation_id.0.to_be_bytes());
    h.update(session_id.0.to_be_bytes());
    h.update(kind.as_bytes());
    h.update(b"|");
    h.update(reason_code.0.to_be_bytes());
    h.update(recorded_at.0.to_be_bytes());
    match idempotency_key {
        Some(k) => {
            h.update([1u8]);
            h.update(k.as_bytes());
        }
        None => h.update([0u8]),
    }
    hex::encode(h.finalize())
}
