#![forbid(unsafe_code)]

use proctor_kernel_contracts::ph1proctor::{
    ExamId, IdentityEmbedding, ProctorSessionId, UserId, ViolationId, ViolationKind,
    ViolationRecordInput, ViolationSource,
};
use proctor_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use proctor_storage::ph1f::{ProctorStore, StorageError};
use proctor_storage::repo::{ProctorSessionRepo, ViolationLedgerRepo};

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn store_with_session() -> (ProctorStore, ProctorSessionId) {
    let s = ProctorStore::new_in_memory();
    let rec = s
        .insert_proctor_session_row(
            ExamId(7),
            user("dbw_cand_1"),
            MonotonicTimeNs(1),
            Some(IdentityEmbedding::new(vec![0.1, 0.2, 0.3]).unwrap()),
        )
        .unwrap();
    (s, rec.session_id)
}

fn violation(
    sid: ProctorSessionId,
    kind: ViolationKind,
    t: u64,
    key: Option<&str>,
) -> ViolationRecordInput {
    ViolationRecordInput::v1(
        sid,
        kind,
        ReasonCodeId(0x5052_0001),
        MonotonicTimeNs(t),
        key.map(str::to_string),
    )
    .unwrap()
}

#[test]
fn at_proctor_db_01_session_ids_are_assigned_in_order() {
    let s = ProctorStore::new_in_memory();
    let a = s
        .insert_proctor_session_row(ExamId(1), user("a"), MonotonicTimeNs(1), None)
        .unwrap();
    let b = s
        .insert_proctor_session_row(ExamId(1), user("b"), MonotonicTimeNs(2), None)
        .unwrap();
    assert_eq!(a.session_id, ProctorSessionId(1));
    assert_eq!(b.session_id, ProctorSessionId(2));
    assert!(s.proctor_session_row(ProctorSessionId(3)).unwrap().is_none());
}

#[test]
fn at_proctor_db_02_reference_embedding_survives_round_trip() {
    let (s, sid) = store_with_session();
    let row = s.proctor_session_row(sid).unwrap().unwrap();
    assert_eq!(
        row.reference_embedding().map(|e| e.as_slice().to_vec()),
        Some(vec![0.1, 0.2, 0.3])
    );
}

#[test]
fn at_proctor_db_03_violation_requires_existing_session() {
    let s = ProctorStore::new_in_memory();
    let err = s
        .append_violation_row(violation(
            ProctorSessionId(99),
            ViolationKind::TabSwitch,
            1,
            None,
        ))
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation { .. }));
    assert!(s.violation_rows().unwrap().is_empty());
}

#[test]
fn at_proctor_db_04_idempotent_retry_returns_original_row() {
    let (s, sid) = store_with_session();
    let first = s
        .append_violation_row(violation(sid, ViolationKind::TabSwitch, 5, Some("evt-1")))
        .unwrap();
    let retry = s
        .append_violation_row(violation(sid, ViolationKind::TabSwitch, 9, Some("evt-1")))
        .unwrap();
    assert_eq!(first, retry);
    assert_eq!(s.violation_rows().unwrap().len(), 1);
    let row = s
        .violation_row_by_idempotency_key(sid, "evt-1")
        .unwrap()
        .unwrap();
    assert_eq!(row.recorded_at, MonotonicTimeNs(5));
    assert_eq!(row.source, ViolationSource::Client);
}

#[test]
fn at_proctor_db_05_ledger_is_append_only() {
    let (s, sid) = store_with_session();
    let id = s
        .append_violation_row(violation(sid, ViolationKind::LeftSeat, 5, None))
        .unwrap();
    assert_eq!(id, ViolationId(1));
    assert!(matches!(
        s.attempt_overwrite_violation_row(id),
        Err(StorageError::AppendOnlyViolation {
            table: "violation_ledger"
        })
    ));
    assert!(matches!(
        s.attempt_overwrite_proctor_session(sid),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
}

#[test]
fn at_proctor_db_06_chain_links_rows_across_sessions() {
    let (s, sid) = store_with_session();
    let other = s
        .insert_proctor_session_row(ExamId(7), user("dbw_cand_2"), MonotonicTimeNs(2), None)
        .unwrap()
        .session_id;
    s.append_violation_row(violation(sid, ViolationKind::LeftSeat, 5, None))
        .unwrap();
    s.append_violation_row(violation(other, ViolationKind::SpoofAttack, 6, None))
        .unwrap();
    s.append_violation_row(violation(sid, ViolationKind::RightClick, 7, Some("rc-1")))
        .unwrap();

    let rows = s.violation_rows().unwrap();
    assert_eq!(rows[1].prev_row_hash, rows[0].row_hash);
    assert_eq!(rows[2].prev_row_hash, rows[1].row_hash);
    assert_eq!(rows[1].weight, 2);
    assert!(s.verify_violation_chain_rows().is_ok());
    assert_eq!(s.violation_rows_by_session(sid).unwrap().len(), 2);
    assert_eq!(s.violation_rows_by_session(other).unwrap().len(), 1);
}

#[test]
fn at_proctor_db_07_exam_listing_filters_by_exam() {
    let (s, _) = store_with_session();
    s.insert_proctor_session_row(ExamId(8), user("dbw_cand_3"), MonotonicTimeNs(3), None)
        .unwrap();
    assert_eq!(s.proctor_session_rows_by_exam(ExamId(7)).unwrap().len(), 1);
    assert_eq!(s.proctor_session_rows_by_exam(ExamId(8)).unwrap().len(), 1);
    assert!(s
        .proctor_session_rows_by_exam(ExamId(9))
        .unwrap()
        .is_empty());
    assert!(s
        .latest_proctor_session_row_for_user(ExamId(8), &user("dbw_cand_1"))
        .unwrap()
        .is_none());
}

#[test]
fn at_proctor_db_08_shared_store_accepts_appends_from_many_threads() {
    let (s, sid) = store_with_session();
    let s = std::sync::Arc::new(s);
    std::thread::scope(|scope| {
        for i in 0..4u64 {
            let s = std::sync::Arc::clone(&s);
            scope.spawn(move || {
                s.append_violation_row(violation(sid, ViolationKind::TabSwitch, 10 + i, None))
                    .unwrap();
            });
        }
    });
    assert_eq!(s.violation_rows().unwrap().len(), 4);
    assert!(s.verify_violation_chain_rows().is_ok());
}
