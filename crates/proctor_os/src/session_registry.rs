#![forbid(unsafe_code)]

//! Process-wide registry of live proctoring sessions.
//!
//! Each session owns one [`SessionSlot`] whose mutex serializes its frame
//! pipeline. The registry map lock is only held for lookups and inserts and is
//! never held while waiting on a slot. Locks are always taken slot first, then
//! map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use proctor_engines::ph1proctor::RuntimeState;
use proctor_kernel_contracts::ph1proctor::{ExamId, IdentityEmbedding, ProctorSessionId, UserId};
use proctor_kernel_contracts::MonotonicTimeNs;
use proctor_storage::ph1f::ProctorSessionRecord;

use crate::ph1proctor::ProctorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRegistryConfig {
    pub idle_timeout_ns: u64,
}

impl SessionRegistryConfig {
    pub fn mvp_v1() -> Self {
        Self {
            idle_timeout_ns: MonotonicTimeNs::from_secs(30 * 60).0,
        }
    }
}

#[derive(Debug)]
pub struct SlotState {
    pub runtime: RuntimeState,
    /// Set once the session is terminated, ended or expired. A purged slot
    /// rejects every further frame and event.
    pub purged: bool,
    pub last_activity_at: MonotonicTimeNs,
}

#[derive(Debug)]
pub struct SessionSlot {
    pub session_id: ProctorSessionId,
    pub exam_id: ExamId,
    pub owner: UserId,
    pub reference_embedding: Option<IdentityEmbedding>,
    inner: Mutex<SlotState>,
}

impl SessionSlot {
    fn from_record(record: &ProctorSessionRecord, now: MonotonicTimeNs) -> Self {
        Self {
            session_id: record.session_id,
            exam_id: record.exam_id,
            owner: record.user_id.clone(),
            reference_embedding: record.reference_embedding().cloned(),
            inner: Mutex::new(SlotState {
                runtime: RuntimeState::default(),
                purged: false,
                last_activity_at: now,
            }),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, SlotState>, ProctorError> {
        self.inner
            .lock()
            .map_err(|_| ProctorError::StatePoisoned("session_slot"))
    }
}

type SlotMap = BTreeMap<ProctorSessionId, Arc<SessionSlot>>;

#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionRegistryConfig,
    slots: Mutex<SlotMap>,
}

impl SessionRegistry {
    pub fn new(config: SessionRegistryConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> SessionRegistryConfig {
        self.config
    }

    fn slots(&self) -> Result<MutexGuard<'_, SlotMap>, ProctorError> {
        self.slots
            .lock()
            .map_err(|_| ProctorError::StatePoisoned("session_registry"))
    }

    /// Installs fresh state for `record`. Any slot previously registered under
    /// the same id is marked purged so in-flight holders cannot reuse it.
    pub fn create(
        &self,
        record: &ProctorSessionRecord,
        now: MonotonicTimeNs,
    ) -> Result<Arc<SessionSlot>, ProctorError> {
        let slot = Arc::new(SessionSlot::from_record(record, now));
        let replaced = self.slots()?.insert(record.session_id, slot.clone());
        if let Some(old) = replaced {
            let mut g = old.lock()?;
            g.purged = true;
            g.runtime = RuntimeState::default();
        }
        Ok(slot)
    }

    pub fn get(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Option<Arc<SessionSlot>>, ProctorError> {
        Ok(self.slots()?.get(&session_id).cloned())
    }

    /// Removes the session and waits for any in-flight pipeline on it before
    /// discarding its state. Returns the final state, or `None` if unknown.
    pub fn purge(
        &self,
        session_id: ProctorSessionId,
    ) -> Result<Option<RuntimeState>, ProctorError> {
        let Some(slot) = self.slots()?.remove(&session_id) else {
            return Ok(None);
        };
        let mut g = slot.lock()?;
        if g.purged {
            return Ok(None);
        }
        g.purged = true;
        Ok(Some(std::mem::take(&mut g.runtime)))
    }

    /// Called with the slot lock held, after the slot was marked purged.
    pub fn remove_if_current(
        &self,
        session_id: ProctorSessionId,
        slot: &Arc<SessionSlot>,
    ) -> Result<(), ProctorError> {
        let mut slots = self.slots()?;
        if slots
            .get(&session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(&session_id);
        }
        Ok(())
    }

    /// Purges every session idle for at least the configured timeout.
    pub fn purge_expired(
        &self,
        now: MonotonicTimeNs,
    ) -> Result<Vec<(ProctorSessionId, RuntimeState)>, ProctorError> {
        let candidates: Vec<Arc<SessionSlot>> = self.slots()?.values().cloned().collect();
        let mut expired = Vec::new();
        for slot in candidates {
            let mut g = slot.lock()?;
            if g.purged {
                continue;
            }
            let idle = now.0.saturating_sub(g.last_activity_at.0);
            if idle < self.config.idle_timeout_ns {
                continue;
            }
            g.purged = true;
            let state = std::mem::take(&mut g.runtime);
            self.remove_if_current(slot.session_id, &slot)?;
            expired.push((slot.session_id, state));
        }
        Ok(expired)
    }

    pub fn len(&self) -> Result<usize, ProctorError> {
        Ok(self.slots()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, ProctorError> {
        Ok(self.len()? == 0)
    }
}
