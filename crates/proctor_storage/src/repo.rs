#![forbid(unsafe_code)]

use proctor_kernel_contracts::ph1proctor::{
    ExamId, IdentityEmbedding, ProctorSessionId, UserId, ViolationId, ViolationRecord,
    ViolationRecordInput,
};
use proctor_kernel_contracts::MonotonicTimeNs;

use crate::ph1f::{ProctorSessionRecord, ProctorStore, StorageError};

/// Typed repository interface for durable proctoring sessions.
///
/// Implementations own their synchronization so callers can share one
/// repository across sessions without an outer lock.
pub trait ProctorSessionRepo: Send + Sync {
    fn insert_proctor_session_row(
        &self,
        exam_id: ExamId,
        user_id: UserId,
        started_at: MonotonicTimeNs,
        reference_embedding: Option<IdentityEmbedding>,
    ) -> Result<ProctorSessionRecord, StorageError>;
    fn proctor_session_row(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Option<ProctorSessionRecord>, StorageError>;
    fn proctor_session_rows_by_exam(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<ProctorSessionRecord>, StorageError>;
    fn latest_proctor_session_row_for_user(
        &self,
        exam_id: ExamId,
        user_id: &UserId,
    ) -> Result<Option<ProctorSessionRecord>, StorageError>;
}

/// Typed repository interface for the append-only violation ledger.
pub trait ViolationLedgerRepo: Send + Sync {
    fn append_violation_row(
        &self,
        input: ViolationRecordInput,
    ) -> Result<ViolationId, StorageError>;
    fn violation_rows(&self) -> Result<Vec<ViolationRecord>, StorageError>;
    fn violation_rows_by_session(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Vec<ViolationRecord>, StorageError>;
    fn violation_row_by_idempotency_key(
        &self,
        session_id: ProctorSessionId,
        idempotency_key: &str,
    ) -> Result<Option<ViolationRecord>, StorageError>;
    fn verify_violation_chain_rows(&self) -> Result<(), StorageError>;
}

pub trait ProctorRepo: ProctorSessionRepo + ViolationLedgerRepo {}

impl<T: ProctorSessionRepo + ViolationLedgerRepo> ProctorRepo for T {}

impl ProctorSessionRepo for ProctorStore {
    fn insert_proctor_session_row(
        &self,
        exam_id: ExamId,
        user_id: UserId,
        started_at: MonotonicTimeNs,
        reference_embedding: Option<IdentityEmbedding>,
    ) -> Result<ProctorSessionRecord, StorageError> {
        self.insert_proctor_session(exam_id, user_id, started_at, reference_embedding)
    }

    fn proctor_session_row(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Option<ProctorSessionRecord>, StorageError> {
        self.proctor_session(session_id)
    }

    fn proctor_session_rows_by_exam(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<ProctorSessionRecord>, StorageError> {
        self.proctor_sessions_by_exam(exam_id)
    }

    fn latest_proctor_session_row_for_user(
        &self,
        exam_id: ExamId,
        user_id: &UserId,
    ) -> Result<Option<ProctorSessionRecord>, StorageError> {
        self.latest_proctor_session_for_user(exam_id, user_id)
    }
}

impl ViolationLedgerRepo for ProctorStore {
    fn append_violation_row(
        &self,
        input: ViolationRecordInput,
    ) -> Result<ViolationId, StorageError> {
        self.append_violation(input)
    }

    fn violation_rows(&self) -> Result<Vec<ViolationRecord>, StorageError> {
        self.violation_ledger()
    }

    fn violation_rows_by_session(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Vec<ViolationRecord>, StorageError> {
        self.violations_by_session(session_id)
    }

    fn violation_row_by_idempotency_key(
        &self,
        session_id: ProctorSessionId,
        idempotency_key: &str,
    ) -> Result<Option<ViolationRecord>, StorageError> {
        self.violation_by_idempotency_key(session_id, idempotency_key)
    }

    fn verify_violation_chain_rows(&self) -> Result<(), StorageError> {
        self.verify_violation_chain()
    }
}
