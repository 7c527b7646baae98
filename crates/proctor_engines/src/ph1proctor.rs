#![forbid(unsafe_code)]

use proctor_kernel_contracts::ph1proctor::{EscalationAction, GrayFrame};
use proctor_kernel_contracts::{ContractViolation, MonotonicTimeNs};

use crate::ph1detect::{
    AbsenceDetector, CrowdingDetector, Detection, DetectionContext, IdentityDetector,
    OcclusionDetector, SpoofDetector, ViolationDetector,
};

pub mod reason_codes {
    use proctor_kernel_contracts::ReasonCodeId;

    // PROCTOR reason-code namespace.
    pub const PROCTOR_CAMERA_COVERED: ReasonCodeId = ReasonCodeId(0x5052_0001);
    pub const PROCTOR_LEFT_SEAT: ReasonCodeId = ReasonCodeId(0x5052_0002);
    pub const PROCTOR_MULTIPLE_FACES: ReasonCodeId = ReasonCodeId(0x5052_0003);
    pub const PROCTOR_SPOOF_LOW_MOTION: ReasonCodeId = ReasonCodeId(0x5052_0004);
    pub const PROCTOR_SPOOF_BLUR: ReasonCodeId = ReasonCodeId(0x5052_0005);
    pub const PROCTOR_IMPERSONATION: ReasonCodeId = ReasonCodeId(0x5052_0006);
    pub const PROCTOR_CLIENT_EVENT: ReasonCodeId = ReasonCodeId(0x5052_0007);
}

/// Whether a streak-based detector reports on every qualifying frame or only
/// on the frame where the streak first qualifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefirePolicy {
    #[default]
    EveryQualifyingFrame,
    OncePerStreak,
}

impl RefirePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RefirePolicy::EveryQualifyingFrame => "every_qualifying_frame",
            RefirePolicy::OncePerStreak => "once_per_streak",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "every" | "every_qualifying_frame" => Some(RefirePolicy::EveryQualifyingFrame),
            "once" | "once_per_streak" => Some(RefirePolicy::OncePerStreak),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationThresholds {
    pub warning: u32,
    pub final_warning: u32,
    pub terminate: u32,
}

impl EscalationThresholds {
    pub fn mvp_v1() -> Self {
        Self {
            warning: 1,
            final_warning: 3,
            terminate: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ph1ProctorConfig {
    pub min_frame_interval_ns: u64,
    pub dark_brightness_threshold: f64,
    pub dark_frame_streak: u32,
    pub absence_timeout_ns: u64,
    pub multi_face_streak: u32,
    pub low_motion_threshold: f64,
    pub low_motion_streak: u32,
    pub blur_variance_threshold: f64,
    pub blur_streak: u32,
    pub identity_check_every: u32,
    pub identity_distance_threshold: f64,
    pub refire: RefirePolicy,
    pub escalation: EscalationThresholds,
}

impl Ph1ProctorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            min_frame_interval_ns: MonotonicTimeNs::from_secs(2).0,
            dark_brightness_threshold: 30.0,
            dark_frame_streak: 3,
            absence_timeout_ns: MonotonicTimeNs::from_secs(10).0,
            multi_face_streak: 3,
            low_motion_threshold: 1.5,
            low_motion_streak: 5,
            blur_variance_threshold: 15.0,
            blur_streak: 5,
            identity_check_every: 5,
            identity_distance_threshold: 0.6,
            refire: RefirePolicy::EveryQualifyingFrame,
            escalation: EscalationThresholds::mvp_v1(),
        }
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        for (field, v) in [
            ("ph1proctor_config.dark_frame_streak", self.dark_frame_streak),
            ("ph1proctor_config.multi_face_streak", self.multi_face_streak),
            ("ph1proctor_config.low_motion_streak", self.low_motion_streak),
            ("ph1proctor_config.blur_streak", self.blur_streak),
            ("ph1proctor_config.identity_check_every", self.identity_check_every),
        ] {
            if v == 0 {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must be > 0",
                });
            }
        }
        for (field, v, max) in [
            (
                "ph1proctor_config.dark_brightness_threshold",
                self.dark_brightness_threshold,
                255.0,
            ),
            (
                "ph1proctor_config.low_motion_threshold",
                self.low_motion_threshold,
                255.0,
            ),
            (
                "ph1proctor_config.blur_variance_threshold",
                self.blur_variance_threshold,
                f64::MAX,
            ),
            (
                "ph1proctor_config.identity_distance_threshold",
                self.identity_distance_threshold,
                f64::MAX,
            ),
        ] {
            if !v.is_finite() {
                return Err(ContractViolation::NotFinite { field });
            }
            if !(0.0..=max).contains(&v) {
                return Err(ContractViolation::InvalidRange {
                    field,
                    min: 0.0,
                    max,
                    got: v,
                });
            }
        }
        let e = self.escalation;
        if e.warning == 0 || e.warning > e.final_warning || e.final_warning > e.terminate {
            return Err(ContractViolation::InvalidValue {
                field: "ph1proctor_config.escalation",
                reason: "must satisfy 0 < warning <= final_warning <= terminate",
            });
        }
        Ok(())
    }
}

/// Ephemeral per-session detection state. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeState {
    pub no_face_since: Option<MonotonicTimeNs>,
    pub multi_face_streak: u32,
    pub dark_frame_streak: u32,
    pub low_motion_streak: u32,
    pub blur_streak: u32,
    pub identity_check_counter: u32,
    pub cumulative_violation_score: u32,
    pub last_accepted_frame_time: Option<MonotonicTimeNs>,
    pub previous_grayscale_frame: Option<GrayFrame>,
    // Latches for RefirePolicy::OncePerStreak.
    pub dark_reported: bool,
    pub absence_reported: bool,
    pub crowding_reported: bool,
    pub spoof_reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    min_interval_ns: u64,
}

impl RateLimiter {
    pub fn new(min_interval_ns: u64) -> Self {
        Self { min_interval_ns }
    }

    /// Stamps `last_accepted_frame_time` on admission. A rejected frame leaves
    /// the state untouched. Frames older than the last accepted one are
    /// rejected.
    pub fn admit(&self, state: &mut RuntimeState, now: MonotonicTimeNs) -> bool {
        if let Some(last) = state.last_accepted_frame_time {
            if now.0 < last.0 || now.0 - last.0 < self.min_interval_ns {
                return false;
            }
        }
        state.last_accepted_frame_time = Some(now);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    thresholds: EscalationThresholds,
}

impl EscalationPolicy {
    pub fn new(thresholds: EscalationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn action_for(&self, cumulative_score: u32) -> Option<EscalationAction> {
        let t = self.thresholds;
        if cumulative_score >= t.terminate {
            Some(EscalationAction::TerminateExam)
        } else if cumulative_score >= t.final_warning {
            Some(EscalationAction::FinalWarning)
        } else if cumulative_score >= t.warning {
            Some(EscalationAction::Warning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameVerdict {
    pub faces_detected: Option<u32>,
    pub detection: Option<Detection>,
}

#[derive(Debug)]
pub struct Ph1ProctorRuntime {
    config: Ph1ProctorConfig,
    rate_limiter: RateLimiter,
    escalation: EscalationPolicy,
    identity: IdentityDetector,
    detectors: Vec<Box<dyn ViolationDetector>>,
}

impl Ph1ProctorRuntime {
    pub fn new(config: Ph1ProctorConfig) -> Result<Self, ContractViolation> {
        config.validate()?;
        let identity = IdentityDetector {
            check_every: config.identity_check_every,
            distance_threshold: config.identity_distance_threshold,
        };
        // Evaluation order; a later detection overrides an earlier one.
        let detectors: Vec<Box<dyn ViolationDetector>> = vec![
            Box::new(OcclusionDetector {
                dark_brightness_threshold: config.dark_brightness_threshold,
                streak_len: config.dark_frame_streak,
                refire: config.refire,
            }),
            Box::new(AbsenceDetector {
                absence_timeout_ns: config.absence_timeout_ns,
                refire: config.refire,
            }),
            Box::new(CrowdingDetector {
                streak_len: config.multi_face_streak,
                refire: config.refire,
            }),
            Box::new(SpoofDetector {
                low_motion_threshold: config.low_motion_threshold,
                low_motion_streak_len: config.low_motion_streak,
                blur_variance_threshold: config.blur_variance_threshold,
                blur_streak_len: config.blur_streak,
                refire: config.refire,
            }),
            Box::new(identity),
        ];
        Ok(Self {
            config,
            rate_limiter: RateLimiter::new(config.min_frame_interval_ns),
            escalation: EscalationPolicy::new(config.escalation),
            identity,
            detectors,
        })
    }

    pub fn config(&self) -> &Ph1ProctorConfig {
        &self.config
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn admit(&self, state: &mut RuntimeState, now: MonotonicTimeNs) -> bool {
        self.rate_limiter.admit(state, now)
    }

    /// True when the next accepted frame will run the identity comparison,
    /// so the caller can ask the analyzer for an embedding.
    pub fn identity_check_due(&self, state: &RuntimeState, has_reference: bool) -> bool {
        has_reference && self.identity.check_due(state.identity_check_counter)
    }

    /// Runs every detector in order. Does not touch the cumulative score.
    pub fn evaluate(&self, state: &mut RuntimeState, ctx: &DetectionContext<'_>) -> FrameVerdict {
        let mut detection = None;
        for detector in &self.detectors {
            match detector.detect(ctx, state) {
                Ok(Some(d)) => detection = Some(d),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "proctor.detector",
                        session_id = ctx.session_id.0,
                        detector = detector.name(),
                        error = %err,
                        "detector failed; treating as no violation"
                    );
                }
            }
        }
        FrameVerdict {
            faces_detected: ctx.features.face_count,
            detection,
        }
    }

    /// Adds `weight` to the cumulative score and maps the result to an action.
    pub fn escalate(&self, state: &mut RuntimeState, weight: u32) -> Option<EscalationAction> {
        state.cumulative_violation_score = state.cumulative_violation_score.saturating_add(weight);
        self.escalation.action_for(state.cumulative_violation_score)
    }
}

#[cfg(test)]
mod tests {
    use proctor_kernel_contracts::ph1proctor::{
        FrameFeatures, IdentityEmbedding, ProctorSessionId, ViolationKind,
    };

    use super::*;

    fn runtime(config: Ph1ProctorConfig) -> Ph1ProctorRuntime {
        Ph1ProctorRuntime::new(config).unwrap()
    }

    fn textured(seed: u32, dark: bool) -> GrayFrame {
        let mut px = Vec::with_capacity(256);
        for y in 0..16u32 {
            for x in 0..16u32 {
                let v = (x * 37 + y * 91 + seed * 53 + (x * y + seed) % 17) % 200;
                let luma = if dark { v / 10 } else { v + 40 };
                px.push(luma as u8);
            }
        }
        GrayFrame::v1(16, 16, px).unwrap()
    }

    fn live_frame(seed: u32, faces: u32, dark: bool) -> FrameFeatures {
        let gray = textured(seed, dark);
        let brightness = crate::ph1frame::mean_brightness(&gray);
        FrameFeatures::v1(Some(faces), Some(brightness), Some(gray), None).unwrap()
    }

    /// Admits and evaluates one frame at `now_s` seconds.
    fn step(
        rt: &Ph1ProctorRuntime,
        s: &mut RuntimeState,
        now_s: u64,
        f: &FrameFeatures,
    ) -> Option<ViolationKind> {
        assert!(rt.admit(s, MonotonicTimeNs::from_secs(now_s)));
        let ctx = DetectionContext {
            session_id: ProctorSessionId(1),
            now: MonotonicTimeNs::from_secs(now_s),
            features: f,
            reference_embedding: None,
        };
        rt.evaluate(s, &ctx).detection.map(|d| d.kind)
    }

    #[test]
    fn at_proctor_01_rate_limiter_drops_frames_inside_interval() {
        let rl = RateLimiter::new(MonotonicTimeNs::from_secs(2).0);
        let mut s = RuntimeState::default();
        assert!(rl.admit(&mut s, MonotonicTimeNs::from_millis(10_000)));
        let before = s.clone();
        assert!(!rl.admit(&mut s, MonotonicTimeNs::from_millis(11_999)));
        assert!(!rl.admit(&mut s, MonotonicTimeNs::from_millis(9_000)));
        assert_eq!(s, before);
        assert!(rl.admit(&mut s, MonotonicTimeNs::from_millis(12_000)));
        assert_eq!(
            s.last_accepted_frame_time,
            Some(MonotonicTimeNs::from_millis(12_000))
        );
    }

    #[test]
    fn at_proctor_02_escalation_thresholds_evaluate_highest_first() {
        let p = EscalationPolicy::new(EscalationThresholds::mvp_v1());
        assert_eq!(p.action_for(0), None);
        assert_eq!(p.action_for(1), Some(EscalationAction::Warning));
        assert_eq!(p.action_for(2), Some(EscalationAction::Warning));
        assert_eq!(p.action_for(3), Some(EscalationAction::FinalWarning));
        assert_eq!(p.action_for(5), Some(EscalationAction::TerminateExam));
        assert_eq!(p.action_for(40), Some(EscalationAction::TerminateExam));
    }

    #[test]
    fn at_proctor_03_config_rejects_zero_streak_and_bad_thresholds() {
        let mut c = Ph1ProctorConfig::mvp_v1();
        c.dark_frame_streak = 0;
        assert!(Ph1ProctorRuntime::new(c).is_err());

        let mut c = Ph1ProctorConfig::mvp_v1();
        c.identity_distance_threshold = f64::NAN;
        assert!(Ph1ProctorRuntime::new(c).is_err());

        let mut c = Ph1ProctorConfig::mvp_v1();
        c.escalation.final_warning = 6;
        assert!(Ph1ProctorRuntime::new(c).is_err());

        assert!(Ph1ProctorConfig::mvp_v1().validate().is_ok());
    }

    #[test]
    fn at_proctor_04_dark_streak_reports_from_third_frame_and_bright_resets() {
        let rt = runtime(Ph1ProctorConfig::mvp_v1());
        let mut s = RuntimeState::default();
        let mut out = Vec::new();
        for i in 0..5u32 {
            out.push(step(&rt, &mut s, u64::from(i) * 2, &live_frame(i, 1, true)));
        }
        let cc = Some(ViolationKind::CameraCovered);
        assert_eq!(out, vec![None, None, cc, cc, cc]);

        assert_eq!(step(&rt, &mut s, 10, &live_frame(5, 1, false)), None);
        assert_eq!(s.dark_frame_streak, 0);
        assert_eq!(step(&rt, &mut s, 12, &live_frame(6, 1, true)), None);
        assert_eq!(s.dark_frame_streak, 1);
    }

    #[test]
    fn at_proctor_05_once_per_streak_reports_dark_once() {
        let mut c = Ph1ProctorConfig::mvp_v1();
        c.refire = RefirePolicy::OncePerStreak;
        let rt = runtime(c);
        let mut s = RuntimeState::default();
        let fired: Vec<_> = (0..6u32)
            .map(|i| step(&rt, &mut s, u64::from(i) * 2, &live_frame(i, 1, true)))
            .collect();
        assert_eq!(fired.iter().filter(|v| v.is_some()).count(), 1);
        assert_eq!(fired[2], Some(ViolationKind::CameraCovered));
    }

    #[test]
    fn at_proctor_06_absence_window_reports_left_seat_and_face_clears_clock() {
        let rt = runtime(Ph1ProctorConfig::mvp_v1());
        let mut s = RuntimeState::default();
        let mut out = Vec::new();
        // Zero faces for 12 seconds, sampled every 2 seconds.
        for i in 0..7u32 {
            out.push(step(&rt, &mut s, u64::from(i) * 2, &live_frame(i, 0, false)));
        }
        let ls = Some(ViolationKind::LeftSeat);
        assert_eq!(out, vec![None, None, None, None, None, ls, ls]);
        assert_eq!(s.no_face_since, Some(MonotonicTimeNs::from_secs(0)));

        assert_eq!(step(&rt, &mut s, 14, &live_frame(7, 1, false)), None);
        assert_eq!(s.no_face_since, None);
    }

    #[test]
    fn at_proctor_07_later_detector_overrides_earlier_detection() {
        let rt = runtime(Ph1ProctorConfig::mvp_v1());
        let mut s = RuntimeState::default();
        let mut last = None;
        for i in 0..3u32 {
            last = step(&rt, &mut s, u64::from(i) * 2, &live_frame(i, 2, true));
        }
        // Both occlusion and crowding qualify; crowding runs later.
        assert_eq!(last, Some(ViolationKind::MultipleFaces));
    }

    #[test]
    fn at_proctor_08_identity_due_only_with_reference_on_cadence() {
        let rt = runtime(Ph1ProctorConfig::mvp_v1());
        let mut s = RuntimeState::default();
        assert!(!rt.identity_check_due(&s, false));
        assert!(!rt.identity_check_due(&s, true));
        s.identity_check_counter = 4;
        assert!(rt.identity_check_due(&s, true));
        assert!(!rt.identity_check_due(&s, false));
    }

    #[test]
    fn at_proctor_09_detector_error_is_treated_as_no_violation() {
        let mut c = Ph1ProctorConfig::mvp_v1();
        c.identity_check_every = 1;
        let rt = runtime(c);
        let mut s = RuntimeState::default();
        let reference = IdentityEmbedding::new(vec![0.0; 8]).unwrap();
        let gray = textured(1, false);
        let f = FrameFeatures::v1(
            Some(1),
            Some(crate::ph1frame::mean_brightness(&gray)),
            Some(gray),
            Some(IdentityEmbedding::new(vec![9.0; 3]).unwrap()),
        )
        .unwrap();
        assert!(rt.admit(&mut s, MonotonicTimeNs::from_secs(0)));
        let ctx = DetectionContext {
            session_id: ProctorSessionId(1),
            now: MonotonicTimeNs::from_secs(0),
            features: &f,
            reference_embedding: Some(&reference),
        };
        let v = rt.evaluate(&mut s, &ctx);
        assert_eq!(v.detection, None);
        assert_eq!(v.faces_detected, Some(1));
        assert_eq!(s.identity_check_counter, 1);
    }

    #[test]
    fn at_proctor_10_escalate_accumulates_weights() {
        let rt = runtime(Ph1ProctorConfig::mvp_v1());
        let mut s = RuntimeState::default();
        assert_eq!(rt.escalate(&mut s, 1), Some(EscalationAction::Warning));
        assert_eq!(rt.escalate(&mut s, 2), Some(EscalationAction::FinalWarning));
        assert_eq!(rt.escalate(&mut s, 2), Some(EscalationAction::TerminateExam));
        assert_eq!(s.cumulative_violation_score, 5);
    }

    #[test]
    fn at_proctor_11_detector_chain_order_is_fixed() {
        let rt = runtime(Ph1ProctorConfig::mvp_v1());
        assert_eq!(
            rt.detector_names(),
            vec!["occlusion", "absence", "crowding", "spoof", "identity"]
        );
    }

    #[test]
    fn at_proctor_12_refire_policy_parses_env_spellings() {
        assert_eq!(
            RefirePolicy::parse("ONCE_PER_STREAK"),
            Some(RefirePolicy::OncePerStreak)
        );
        assert_eq!(
            RefirePolicy::parse("every"),
            Some(RefirePolicy::EveryQualifyingFrame)
        );
        assert_eq!(RefirePolicy::parse("sometimes"), None);
        for p in [RefirePolicy::EveryQualifyingFrame, RefirePolicy::OncePerStreak] {
            assert_eq!(RefirePolicy::parse(p.as_str()), Some(p));
        }
    }
}
