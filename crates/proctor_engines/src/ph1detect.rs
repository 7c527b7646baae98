#![forbid(unsafe_code)]

use std::fmt::Debug;

use proctor_kernel_contracts::ph1proctor::{
    FrameFeatures, IdentityEmbedding, ProctorSessionId, ViolationKind,
};
use proctor_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use thiserror::Error;

use crate::ph1frame::{laplacian_variance, motion_score, PixelStatsError};
use crate::ph1proctor::{reason_codes, RefirePolicy, RuntimeState};

#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub session_id: ProctorSessionId,
    pub now: MonotonicTimeNs,
    pub features: &'a FrameFeatures,
    pub reference_embedding: Option<&'a IdentityEmbedding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub kind: ViolationKind,
    pub weight: u32,
    pub reason_code: ReasonCodeId,
}

impl Detection {
    pub fn of(kind: ViolationKind, reason_code: ReasonCodeId) -> Self {
        Self {
            kind,
            weight: kind.weight(),
            reason_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectorError {
    #[error("embedding dimension mismatch: reference={reference} live={live}")]
    EmbeddingDimensionMismatch { reference: usize, live: usize },
}

/// One heuristic in the per-frame chain.
///
/// A detector may mutate its own counters in `state` whether or not it
/// reports. Returning `Err` never fails the frame; the runtime logs it and
/// treats it as no violation.
pub trait ViolationDetector: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        state: &mut RuntimeState,
    ) -> Result<Option<Detection>, DetectorError>;
}

fn streak_fires(reached: bool, latch: &mut bool, policy: RefirePolicy) -> bool {
    if !reached {
        *latch = false;
        return false;
    }
    match policy {
        RefirePolicy::EveryQualifyingFrame => true,
        RefirePolicy::OncePerStreak => {
            if *latch {
                false
            } else {
                *latch = true;
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcclusionDetector {
    pub dark_brightness_threshold: f64,
    pub streak_len: u32,
    pub refire: RefirePolicy,
}

impl ViolationDetector for OcclusionDetector {
    fn name(&self) -> &'static str {
        "occlusion"
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        state: &mut RuntimeState,
    ) -> Result<Option<Detection>, DetectorError> {
        let Some(brightness) = ctx.features.brightness else {
            return Ok(None);
        };
        if brightness < self.dark_brightness_threshold {
            state.dark_frame_streak = state.dark_frame_streak.saturating_add(1);
        } else {
            state.dark_frame_streak = 0;
        }
        let reached = state.dark_frame_streak >= self.streak_len;
        if streak_fires(reached, &mut state.dark_reported, self.refire) {
            return Ok(Some(Detection::of(
                ViolationKind::CameraCovered,
                reason_codes::PROCTOR_CAMERA_COVERED,
            )));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsenceDetector {
    pub absence_timeout_ns: u64,
    pub refire: RefirePolicy,
}

impl ViolationDetector for AbsenceDetector {
    fn name(&self) -> &'static str {
        "absence"
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        state: &mut RuntimeState,
    ) -> Result<Option<Detection>, DetectorError> {
        match ctx.features.face_count {
            None => Ok(None),
            Some(0) => {
                let Some(since) = state.no_face_since else {
                    state.no_face_since = Some(ctx.now);
                    return Ok(None);
                };
                let reached = ctx.now.0.saturating_sub(since.0) >= self.absence_timeout_ns;
                if streak_fires(reached, &mut state.absence_reported, self.refire) {
                    return Ok(Some(Detection::of(
                        ViolationKind::LeftSeat,
                        reason_codes::PROCTOR_LEFT_SEAT,
                    )));
                }
                Ok(None)
            }
            Some(_) => {
                state.no_face_since = None;
                state.absence_reported = false;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrowdingDetector {
    pub streak_len: u32,
    pub refire: RefirePolicy,
}

impl ViolationDetector for CrowdingDetector {
    fn name(&self) -> &'static str {
        "crowding"
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        state: &mut RuntimeState,
    ) -> Result<Option<Detection>, DetectorError> {
        let Some(faces) = ctx.features.face_count else {
            return Ok(None);
        };
        if faces > 1 {
            state.multi_face_streak = state.multi_face_streak.saturating_add(1);
        } else {
            state.multi_face_streak = 0;
        }
        let reached = state.multi_face_streak >= self.streak_len;
        if streak_fires(reached, &mut state.crowding_reported, self.refire) {
            return Ok(Some(Detection::of(
                ViolationKind::MultipleFaces,
                reason_codes::PROCTOR_MULTIPLE_FACES,
            )));
        }
        Ok(None)
    }
}

/// Replay / photo detection from motion and sharpness of consecutive frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpoofDetector {
    pub low_motion_threshold: f64,
    pub low_motion_streak_len: u32,
    pub blur_variance_threshold: f64,
    pub blur_streak_len: u32,
    pub refire: RefirePolicy,
}

impl ViolationDetector for SpoofDetector {
    fn name(&self) -> &'static str {
        "spoof"
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        state: &mut RuntimeState,
    ) -> Result<Option<Detection>, DetectorError> {
        let Some(gray) = ctx.features.gray.as_ref() else {
            return Ok(None);
        };

        if let Some(prev) = state.previous_grayscale_frame.as_ref() {
            match motion_score(prev, gray) {
                // The streak counts frames in the static run, so the frame the
                // run started from counts too.
                Ok(m) if m < self.low_motion_threshold => {
                    state.low_motion_streak = match state.low_motion_streak {
                        0 => 2,
                        n => n.saturating_add(1),
                    };
                }
                Ok(_) | Err(PixelStatsError::ShapeMismatch { .. }) => {
                    state.low_motion_streak = 0;
                }
                Err(PixelStatsError::TooSmall { .. }) => {}
            }
        }

        // Frames under 3x3 carry no sharpness signal; the streak is left as is.
        if let Ok(v) = laplacian_variance(gray) {
            if v < self.blur_variance_threshold {
                state.blur_streak = state.blur_streak.saturating_add(1);
            } else {
                state.blur_streak = 0;
            }
        }

        state.previous_grayscale_frame = Some(gray.clone());

        let motion_reached = state.low_motion_streak >= self.low_motion_streak_len;
        let blur_reached = state.blur_streak >= self.blur_streak_len;
        if streak_fires(
            motion_reached || blur_reached,
            &mut state.spoof_reported,
            self.refire,
        ) {
            let reason_code = if motion_reached {
                reason_codes::PROCTOR_SPOOF_LOW_MOTION
            } else {
                reason_codes::PROCTOR_SPOOF_BLUR
            };
            return Ok(Some(Detection::of(ViolationKind::SpoofAttack, reason_code)));
        }
        Ok(None)
    }
}

/// Reduced-cadence comparison against the session reference embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityDetector {
    pub check_every: u32,
    pub distance_threshold: f64,
}

impl IdentityDetector {
    pub fn check_due(&self, counter_before_frame: u32) -> bool {
        counter_before_frame.wrapping_add(1) % self.check_every.max(1) == 0
    }
}

impl ViolationDetector for IdentityDetector {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        state: &mut RuntimeState,
    ) -> Result<Option<Detection>, DetectorError> {
        let Some(reference) = ctx.reference_embedding else {
            return Ok(None);
        };
        let due = self.check_due(state.identity_check_counter);
        state.identity_check_counter = state.identity_check_counter.wrapping_add(1);
        if !due {
            return Ok(None);
        }
        let Some(live) = ctx.features.embedding.as_ref() else {
            return Ok(None);
        };
        let distance = reference.euclidean_distance(live).map_err(|_| {
            DetectorError::EmbeddingDimensionMismatch {
                reference: reference.dim(),
                live: live.dim(),
            }
        })?;
        if distance > self.distance_threshold {
            return Ok(Some(Detection::of(
                ViolationKind::Impersonation,
                reason_codes::PROCTOR_IMPERSONATION,
            )));
        }
        Ok(None)
    }
}
