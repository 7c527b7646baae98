#![forbid(unsafe_code)]

use std::env;
use std::ops::RangeInclusive;

use proctor_engines::ph1conf::Ph1ConfConfig;
use proctor_engines::ph1proctor::{Ph1ProctorConfig, RefirePolicy};
use proctor_kernel_contracts::MonotonicTimeNs;

use crate::session_registry::SessionRegistryConfig;

pub const ENV_MIN_FRAME_INTERVAL_MS: &str = "PROCTOR_MIN_FRAME_INTERVAL_MS";
pub const ENV_ABSENCE_TIMEOUT_MS: &str = "PROCTOR_ABSENCE_TIMEOUT_MS";
pub const ENV_DARK_BRIGHTNESS_THRESHOLD: &str = "PROCTOR_DARK_BRIGHTNESS_THRESHOLD";
pub const ENV_DARK_STREAK: &str = "PROCTOR_DARK_STREAK";
pub const ENV_MULTI_FACE_STREAK: &str = "PROCTOR_MULTI_FACE_STREAK";
pub const ENV_SPOOF_STREAK: &str = "PROCTOR_SPOOF_STREAK";
pub const ENV_IDENTITY_CHECK_EVERY: &str = "PROCTOR_IDENTITY_CHECK_EVERY";
pub const ENV_IDENTITY_DISTANCE_THRESHOLD: &str = "PROCTOR_IDENTITY_DISTANCE_THRESHOLD";
pub const ENV_REFIRE_POLICY: &str = "PROCTOR_REFIRE_POLICY";
pub const ENV_SESSION_IDLE_TIMEOUT_MS: &str = "PROCTOR_SESSION_IDLE_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct ProctorOsConfig {
    pub proctor: Ph1ProctorConfig,
    pub conf: Ph1ConfConfig,
    pub registry: SessionRegistryConfig,
}

impl ProctorOsConfig {
    pub fn mvp_v1() -> Self {
        Self {
            proctor: Ph1ProctorConfig::mvp_v1(),
            conf: Ph1ConfConfig::mvp_v1(),
            registry: SessionRegistryConfig::mvp_v1(),
        }
    }

    /// Defaults overlaid with process environment overrides. Unparseable or
    /// out-of-range values keep the default.
    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut c = Self::mvp_v1();
        let p = &mut c.proctor;

        if let Some(ms) = parse_u64_in(env_getter(ENV_MIN_FRAME_INTERVAL_MS), 0..=60_000) {
            p.min_frame_interval_ns = MonotonicTimeNs::from_millis(ms).0;
        }
        if let Some(ms) = parse_u64_in(env_getter(ENV_ABSENCE_TIMEOUT_MS), 1_000..=600_000) {
            p.absence_timeout_ns = MonotonicTimeNs::from_millis(ms).0;
        }
        if let Some(v) = parse_f64_in(env_getter(ENV_DARK_BRIGHTNESS_THRESHOLD), 0.0..=255.0) {
            p.dark_brightness_threshold = v;
        }
        if let Some(n) = parse_u32_in(env_getter(ENV_DARK_STREAK), 1..=100) {
            p.dark_frame_streak = n;
        }
        if let Some(n) = parse_u32_in(env_getter(ENV_MULTI_FACE_STREAK), 1..=100) {
            p.multi_face_streak = n;
        }
        if let Some(n) = parse_u32_in(env_getter(ENV_SPOOF_STREAK), 1..=100) {
            p.low_motion_streak = n;
            p.blur_streak = n;
        }
        if let Some(n) = parse_u32_in(env_getter(ENV_IDENTITY_CHECK_EVERY), 1..=1_000) {
            p.identity_check_every = n;
        }
        if let Some(v) = parse_f64_in(env_getter(ENV_IDENTITY_DISTANCE_THRESHOLD), 0.0..=100.0) {
            p.identity_distance_threshold = v;
        }
        if let Some(policy) = env_getter(ENV_REFIRE_POLICY).and_then(|v| RefirePolicy::parse(&v)) {
            p.refire = policy;
        }
        if let Some(ms) =
            parse_u64_in(env_getter(ENV_SESSION_IDLE_TIMEOUT_MS), 1_000..=86_400_000)
        {
            c.registry.idle_timeout_ns = MonotonicTimeNs::from_millis(ms).0;
        }
        c
    }
}

fn parse_u64_in(value: Option<String>, range: RangeInclusive<u64>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
}

fn parse_u32_in(value: Option<String>, range: RangeInclusive<u32>) -> Option<u32> {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| range.contains(v))
}

fn parse_f64_in(value: Option<String>, range: RangeInclusive<f64>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && range.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_os_config_01_no_overrides_yields_defaults() {
        assert_eq!(
            ProctorOsConfig::from_env_var_map(|_| None),
            ProctorOsConfig::mvp_v1()
        );
    }

    #[test]
    fn at_os_config_02_valid_overrides_apply() {
        let c = ProctorOsConfig::from_env_var_map(|key| match key {
            ENV_MIN_FRAME_INTERVAL_MS => Some("500".to_string()),
            ENV_SPOOF_STREAK => Some("7".to_string()),
            ENV_REFIRE_POLICY => Some("once_per_streak".to_string()),
            ENV_IDENTITY_DISTANCE_THRESHOLD => Some(" 0.45 ".to_string()),
            ENV_SESSION_IDLE_TIMEOUT_MS => Some("60000".to_string()),
            _ => None,
        });
        assert_eq!(c.proctor.min_frame_interval_ns, 500_000_000);
        assert_eq!(c.proctor.low_motion_streak, 7);
        assert_eq!(c.proctor.blur_streak, 7);
        assert_eq!(c.proctor.refire, RefirePolicy::OncePerStreak);
        assert_eq!(c.proctor.identity_distance_threshold, 0.45);
        assert_eq!(c.registry.idle_timeout_ns, 60_000_000_000);
        assert!(c.proctor.validate().is_ok());
    }

    #[test]
    fn at_os_config_03_invalid_overrides_fall_back_to_defaults() {
        let c = ProctorOsConfig::from_env_var_map(|key| match key {
            ENV_DARK_STREAK => Some("0".to_string()),
            ENV_ABSENCE_TIMEOUT_MS => Some("ten seconds".to_string()),
            ENV_DARK_BRIGHTNESS_THRESHOLD => Some("NaN".to_string()),
            ENV_REFIRE_POLICY => Some("sometimes".to_string()),
            _ => None,
        });
        assert_eq!(c, ProctorOsConfig::mvp_v1());
    }
}
