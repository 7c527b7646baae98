#![forbid(unsafe_code)]

use std::sync::Arc;

use proctor_engines::ph1conf::Ph1ConfRuntime;
use proctor_engines::ph1detect::DetectionContext;
use proctor_engines::ph1frame::{FrameExtractError, FrameFeatureExtractor};
use proctor_engines::ph1proctor::{reason_codes, Ph1ProctorRuntime, RuntimeState};
use proctor_kernel_contracts::ph1conf::{ConfidenceReport, ExamReportRow};
use proctor_kernel_contracts::ph1proctor::{
    CallerRole, ClientEventResult, EscalationAction, ExamId, FrameResult, ProctorSessionId,
    UserId, ViolationKind, ViolationRecordInput,
};
use proctor_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use proctor_storage::ph1f::StorageError;
use proctor_storage::repo::ProctorRepo;
use thiserror::Error;

use crate::config::ProctorOsConfig;
use crate::session_registry::{SessionRegistry, SessionSlot, SlotState};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProctorError {
    #[error("proctor session {0:?} not found")]
    SessionNotFound(ProctorSessionId),
    #[error("no proctor session for user in exam {0:?}")]
    NoSessionForUser(ExamId),
    #[error("caller is not authorized for {0}")]
    Unauthorized(&'static str),
    #[error("no face detected in reference frame")]
    NoFaceDetected,
    #[error("{0} faces detected in reference frame; exactly one is required")]
    MultipleFacesDetected(u32),
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameExtractError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
    #[error("state lock poisoned: {0}")]
    StatePoisoned(&'static str),
}

/// Orchestrates the per-session proctoring pipeline against a durable store.
///
/// Sessions serialize only on their own slot. The store is shared without an
/// outer lock, so a slow append in one session never blocks another.
pub struct ProctorService<R> {
    store: Arc<R>,
    registry: SessionRegistry,
    engine: Ph1ProctorRuntime,
    conf: Ph1ConfRuntime,
    extractor: Arc<dyn FrameFeatureExtractor>,
}

impl<R: ProctorRepo> ProctorService<R> {
    pub fn new(
        config: ProctorOsConfig,
        store: Arc<R>,
        extractor: Arc<dyn FrameFeatureExtractor>,
    ) -> Result<Self, ProctorError> {
        let service = Self {
            store,
            registry: SessionRegistry::new(config.registry),
            engine: Ph1ProctorRuntime::new(config.proctor)?,
            conf: Ph1ConfRuntime::new(config.conf),
            extractor,
        };
        let proctor = service.engine.config();
        tracing::info!(
            target: "proctor.session",
            detectors = ?service.engine.detector_names(),
            refire = proctor.refire.as_str(),
            min_frame_interval_ns = proctor.min_frame_interval_ns,
            idle_timeout_ns = service.registry.config().idle_timeout_ns,
            default_penalty = service.conf.config().default_penalty,
            "proctor service configured"
        );
        Ok(service)
    }

    /// Creates the durable session and its fresh runtime state. The reference
    /// frame must show exactly one face.
    pub fn start_session(
        &self,
        exam_id: ExamId,
        user_id: UserId,
        reference_frame: &[u8],
        now: MonotonicTimeNs,
    ) -> Result<ProctorSessionId, ProctorError> {
        let features = self.extractor.extract(reference_frame, true)?;
        match features.face_count {
            None | Some(0) => return Err(ProctorError::NoFaceDetected),
            Some(1) => {}
            Some(n) => return Err(ProctorError::MultipleFacesDetected(n)),
        }

        let record = self
            .store
            .insert_proctor_session_row(exam_id, user_id, now, features.embedding)?;
        self.registry.create(&record, now)?;

        tracing::info!(
            target: "proctor.session",
            session_id = record.session_id.0,
            exam_id = exam_id.0,
            user_id = record.user_id.as_str(),
            has_reference_embedding = record.reference_embedding().is_some(),
            "proctor session started"
        );
        Ok(record.session_id)
    }

    /// Looks up a live session owned by `caller`. A foreign session is
    /// indistinguishable from an unknown one.
    fn owned_slot(
        &self,
        session_id: ProctorSessionId,
        caller: &UserId,
    ) -> Result<Arc<SessionSlot>, ProctorError> {
        match self.registry.get(session_id)? {
            Some(slot) if &slot.owner == caller => Ok(slot),
            _ => Err(ProctorError::SessionNotFound(session_id)),
        }
    }

    pub fn submit_frame(
        &self,
        session_id: ProctorSessionId,
        caller: &UserId,
        frame_bytes: &[u8],
        now: MonotonicTimeNs,
    ) -> Result<FrameResult, ProctorError> {
        let slot = self.owned_slot(session_id, caller)?;
        let mut guard = slot.lock()?;
        if guard.purged {
            return Err(ProctorError::SessionNotFound(session_id));
        }
        let score_before = guard.runtime.cumulative_violation_score;

        if !self.engine.admit(&mut guard.runtime, now) {
            tracing::debug!(
                target: "proctor.frame",
                session_id = session_id.0,
                "frame skipped by rate limiter"
            );
            return Ok(FrameResult::skipped(score_before));
        }
        guard.last_activity_at = now;

        let want_embedding = self
            .engine
            .identity_check_due(&guard.runtime, slot.reference_embedding.is_some());
        let features = match self.extractor.extract(frame_bytes, want_embedding) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(
                    target: "proctor.frame",
                    session_id = session_id.0,
                    error = %err,
                    "invalid frame"
                );
                return Ok(FrameResult::invalid_frame(score_before));
            }
        };

        // Detectors run on a copy; it is committed only once any resulting
        // violation is durably recorded.
        let mut working = guard.runtime.clone();
        let ctx = DetectionContext {
            session_id,
            now,
            features: &features,
            reference_embedding: slot.reference_embedding.as_ref(),
        };
        let verdict = self.engine.evaluate(&mut working, &ctx);

        let Some(detection) = verdict.detection else {
            guard.runtime = working;
            return Ok(FrameResult::accepted(
                verdict.faces_detected,
                None,
                score_before,
                None,
            ));
        };

        let input = ViolationRecordInput::v1(
            session_id,
            detection.kind,
            detection.reason_code,
            now,
            None,
        )?;
        let violation_id = self.store.append_violation_row(input)?;

        let action = self.engine.escalate(&mut working, detection.weight);
        guard.runtime = working;
        let score = guard.runtime.cumulative_violation_score;

        tracing::info!(
            target: "proctor.violation",
            session_id = session_id.0,
            violation_id = violation_id.0,
            kind = detection.kind.as_str(),
            source = detection.kind.source().as_str(),
            weight = detection.weight,
            reason_code = detection.reason_code.0,
            cumulative_score = score,
            "violation recorded"
        );
        self.apply_action(&slot, &mut guard, action)?;

        Ok(FrameResult::accepted(
            verdict.faces_detected,
            Some(detection.kind),
            score,
            action,
        ))
    }

    /// Records a browser-reported event. Bypasses the rate limiter and image
    /// detectors. With `client_event_id`, a retry returns the original row.
    pub fn report_client_event(
        &self,
        session_id: ProctorSessionId,
        caller: &UserId,
        kind: ViolationKind,
        now: MonotonicTimeNs,
        client_event_id: Option<&str>,
    ) -> Result<ClientEventResult, ProctorError> {
        if !kind.is_client_reported() {
            return Err(ProctorError::Contract(ContractViolation::InvalidValue {
                field: "client_event.kind",
                reason: "must be TAB_SWITCH, WINDOW_BLUR or RIGHT_CLICK",
            }));
        }
        let slot = self.owned_slot(session_id, caller)?;
        let mut guard = slot.lock()?;
        if guard.purged {
            return Err(ProctorError::SessionNotFound(session_id));
        }

        if let Some(key) = client_event_id {
            let existing = self
                .store
                .violation_row_by_idempotency_key(session_id, key)?;
            if let Some(existing) = existing {
                return Ok(ClientEventResult {
                    violation_id: existing.violation_id,
                    kind: existing.kind,
                    cumulative_score: guard.runtime.cumulative_violation_score,
                    action: None,
                    replayed: true,
                });
            }
        }

        let input = ViolationRecordInput::v1(
            session_id,
            kind,
            reason_codes::PROCTOR_CLIENT_EVENT,
            now,
            client_event_id.map(str::to_string),
        )?;
        let violation_id = self.store.append_violation_row(input)?;

        guard.last_activity_at = now;
        let action = self.engine.escalate(&mut guard.runtime, kind.weight());
        let score = guard.runtime.cumulative_violation_score;

        tracing::info!(
            target: "proctor.violation",
            session_id = session_id.0,
            violation_id = violation_id.0,
            kind = kind.as_str(),
            source = kind.source().as_str(),
            weight = kind.weight(),
            cumulative_score = score,
            "client violation recorded"
        );
        self.apply_action(&slot, &mut guard, action)?;

        Ok(ClientEventResult {
            violation_id,
            kind,
            cumulative_score: score,
            action,
            replayed: false,
        })
    }

    fn apply_action(
        &self,
        slot: &Arc<SessionSlot>,
        guard: &mut SlotState,
        action: Option<EscalationAction>,
    ) -> Result<(), ProctorError> {
        let Some(action) = action else {
            return Ok(());
        };
        tracing::info!(
            target: "proctor.escalation",
            session_id = slot.session_id.0,
            action = action.as_str(),
            cumulative_score = guard.runtime.cumulative_violation_score,
            "escalation action emitted"
        );
        if action.is_terminal() {
            let final_score = guard.runtime.cumulative_violation_score;
            guard.purged = true;
            guard.runtime = RuntimeState::default();
            self.registry.remove_if_current(slot.session_id, slot)?;
            tracing::info!(
                target: "proctor.session",
                session_id = slot.session_id.0,
                reason = action.as_str(),
                cumulative_score = final_score,
                "proctor session purged"
            );
        }
        Ok(())
    }

    /// External termination. Waits for an in-flight frame of the same session.
    pub fn terminate_session(
        &self,
        session_id: ProctorSessionId,
        reason: &str,
    ) -> Result<(), ProctorError> {
        let last = self
            .registry
            .purge(session_id)?
            .ok_or(ProctorError::SessionNotFound(session_id))?;
        tracing::info!(
            target: "proctor.session",
            session_id = session_id.0,
            reason,
            cumulative_score = last.cumulative_violation_score,
            "proctor session terminated"
        );
        Ok(())
    }

    /// Logout or time-up.
    pub fn end_session(&self, session_id: ProctorSessionId) -> Result<(), ProctorError> {
        let last = self
            .registry
            .purge(session_id)?
            .ok_or(ProctorError::SessionNotFound(session_id))?;
        tracing::info!(
            target: "proctor.session",
            session_id = session_id.0,
            cumulative_score = last.cumulative_violation_score,
            "proctor session ended"
        );
        Ok(())
    }

    pub fn purge_expired_sessions(
        &self,
        now: MonotonicTimeNs,
    ) -> Result<Vec<ProctorSessionId>, ProctorError> {
        let expired = self.registry.purge_expired(now)?;
        for (session_id, last) in &expired {
            tracing::info!(
                target: "proctor.session",
                session_id = session_id.0,
                cumulative_score = last.cumulative_violation_score,
                "proctor session expired"
            );
        }
        Ok(expired.into_iter().map(|(id, _)| id).collect())
    }

    /// Computed from the durable violation history only.
    pub fn get_confidence(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<ConfidenceReport, ProctorError> {
        if self.store.proctor_session_row(session_id)?.is_none() {
            return Err(ProctorError::SessionNotFound(session_id));
        }
        let rows = self.store.violation_rows_by_session(session_id)?;
        Ok(self.conf.score(session_id, &rows)?)
    }

    pub fn get_confidence_for_user(
        &self,
        exam_id: ExamId,
        user_id: &UserId,
    ) -> Result<ConfidenceReport, ProctorError> {
        let session_id = self
            .store
            .latest_proctor_session_row_for_user(exam_id, user_id)?
            .map(|r| r.session_id)
            .ok_or(ProctorError::NoSessionForUser(exam_id))?;
        let rows = self.store.violation_rows_by_session(session_id)?;
        Ok(self.conf.score(session_id, &rows)?)
    }

    pub fn get_exam_report(
        &self,
        exam_id: ExamId,
        caller_role: CallerRole,
    ) -> Result<Vec<ExamReportRow>, ProctorError> {
        if caller_role != CallerRole::Admin {
            return Err(ProctorError::Unauthorized("exam report"));
        }
        self.store
            .proctor_session_rows_by_exam(exam_id)?
            .into_iter()
            .map(|s| -> Result<ExamReportRow, ProctorError> {
                let rows = self.store.violation_rows_by_session(s.session_id)?;
                let report = self.conf.score(s.session_id, &rows)?;
                Ok(ExamReportRow::from_report(s.user_id, &report))
            })
            .collect()
    }

    pub fn verify_violation_ledger(&self) -> Result<(), ProctorError> {
        Ok(self.store.verify_violation_chain_rows()?)
    }

    /// Copy of the live runtime state, or `None` once the session is purged.
    pub fn runtime_snapshot(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Option<RuntimeState>, ProctorError> {
        let Some(slot) = self.registry.get(session_id)? else {
            return Ok(None);
        };
        let g = slot.lock()?;
        Ok((!g.purged).then(|| g.runtime.clone()))
    }

    pub fn active_session_count(&self) -> Result<usize, ProctorError> {
        self.registry.len()
    }
}
