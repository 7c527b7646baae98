#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const PH1PROCTOR_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const IDENTITY_EMBEDDING_MAX_DIM: usize = 512;
pub const GRAY_FRAME_MAX_DIMENSION: u32 = 8_192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProctorSessionId(pub u64);

impl Validate for ProctorSessionId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "proctor_session_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExamId(pub u64);

impl Validate for ExamId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "exam_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViolationId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must not be empty",
            });
        }
        if id.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must be <= 128 chars",
            });
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must not contain control characters",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerRole {
    Candidate,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationSource {
    Camera,
    Client,
}

impl ViolationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationSource::Camera => "CAMERA",
            ViolationSource::Client => "CLIENT",
        }
    }
}

/// Closed set of violation kinds. `NoFace` is never recorded on its own; a
/// sustained absence surfaces as `LeftSeat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    NoFace,
    LeftSeat,
    MultipleFaces,
    CameraCovered,
    SpoofAttack,
    Impersonation,
    TabSwitch,
    WindowBlur,
    RightClick,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 9] = [
        ViolationKind::NoFace,
        ViolationKind::LeftSeat,
        ViolationKind::MultipleFaces,
        ViolationKind::CameraCovered,
        ViolationKind::SpoofAttack,
        ViolationKind::Impersonation,
        ViolationKind::TabSwitch,
        ViolationKind::WindowBlur,
        ViolationKind::RightClick,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::NoFace => "NO_FACE",
            ViolationKind::LeftSeat => "LEFT_SEAT",
            ViolationKind::MultipleFaces => "MULTIPLE_FACES",
            ViolationKind::CameraCovered => "CAMERA_COVERED",
            ViolationKind::SpoofAttack => "SPOOF_ATTACK",
            ViolationKind::Impersonation => "IMPERSONATION",
            ViolationKind::TabSwitch => "TAB_SWITCH",
            ViolationKind::WindowBlur => "WINDOW_BLUR",
            ViolationKind::RightClick => "RIGHT_CLICK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ViolationKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Contribution to the live escalation score.
    pub fn weight(self) -> u32 {
        match self {
            ViolationKind::SpoofAttack | ViolationKind::Impersonation => 2,
            _ => 1,
        }
    }

    pub fn source(self) -> ViolationSource {
        match self {
            ViolationKind::TabSwitch | ViolationKind::WindowBlur | ViolationKind::RightClick => {
                ViolationSource::Client
            }
            _ => ViolationSource::Camera,
        }
    }

    pub fn is_client_reported(self) -> bool {
        self.source() == ViolationSource::Client
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationAction {
    Warning,
    FinalWarning,
    TerminateExam,
}

impl EscalationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationAction::Warning => "WARNING",
            EscalationAction::FinalWarning => "FINAL_WARNING",
            EscalationAction::TerminateExam => "TERMINATE_EXAM",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == EscalationAction::TerminateExam
    }
}

/// Fixed-length identity vector produced by the face analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEmbedding(Vec<f32>);

impl IdentityEmbedding {
    pub fn new(values: Vec<f32>) -> Result<Self, ContractViolation> {
        let e = Self(values);
        e.validate()?;
        Ok(e)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn euclidean_distance(&self, other: &IdentityEmbedding) -> Result<f64, ContractViolation> {
        if self.dim() != other.dim() {
            return Err(ContractViolation::InvalidValue {
                field: "identity_embedding.dim",
                reason: "embeddings must have the same dimension",
            });
        }
        let sum: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let d = f64::from(*a) - f64::from(*b);
                d * d
            })
            .sum();
        Ok(sum.sqrt())
    }
}

impl Validate for IdentityEmbedding {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "identity_embedding",
                reason: "must not be empty",
            });
        }
        if self.0.len() > IDENTITY_EMBEDDING_MAX_DIM {
            return Err(ContractViolation::InvalidValue {
                field: "identity_embedding",
                reason: "must be <= 512 dimensions",
            });
        }
        if self.0.iter().any(|v| !v.is_finite()) {
            return Err(ContractViolation::NotFinite {
                field: "identity_embedding",
            });
        }
        Ok(())
    }
}

/// Row-major 8-bit luma raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GrayFrame {
    pub fn v1(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ContractViolation> {
        let f = Self {
            width,
            height,
            pixels,
        };
        f.validate()?;
        Ok(f)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get((y as usize) * (self.width as usize) + (x as usize))
            .copied()
    }

    pub fn same_shape(&self, other: &GrayFrame) -> bool {
        self.width == other.width && self.height == other.height
    }
}

impl Validate for GrayFrame {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.width == 0 || self.height == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "gray_frame.dimensions",
                reason: "width and height must be > 0",
            });
        }
        if self.width > GRAY_FRAME_MAX_DIMENSION || self.height > GRAY_FRAME_MAX_DIMENSION {
            return Err(ContractViolation::InvalidValue {
                field: "gray_frame.dimensions",
                reason: "width and height must be <= 8192",
            });
        }
        if self.pixels.len() != (self.width as usize) * (self.height as usize) {
            return Err(ContractViolation::InvalidValue {
                field: "gray_frame.pixels",
                reason: "length must equal width * height",
            });
        }
        Ok(())
    }
}

/// Per-frame signals handed to the detector chain. Every field is optional:
/// a missing signal means the collaborator could not produce it this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFeatures {
    pub face_count: Option<u32>,
    pub brightness: Option<f64>,
    pub gray: Option<GrayFrame>,
    pub embedding: Option<IdentityEmbedding>,
}

impl FrameFeatures {
    pub fn v1(
        face_count: Option<u32>,
        brightness: Option<f64>,
        gray: Option<GrayFrame>,
        embedding: Option<IdentityEmbedding>,
    ) -> Result<Self, ContractViolation> {
        let f = Self {
            face_count,
            brightness,
            gray,
            embedding,
        };
        f.validate()?;
        Ok(f)
    }
}

impl Validate for FrameFeatures {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(b) = self.brightness {
            if !b.is_finite() {
                return Err(ContractViolation::NotFinite {
                    field: "frame_features.brightness",
                });
            }
            if !(0.0..=255.0).contains(&b) {
                return Err(ContractViolation::InvalidRange {
                    field: "frame_features.brightness",
                    min: 0.0,
                    max: 255.0,
                    got: b,
                });
            }
        }
        if let Some(g) = &self.gray {
            g.validate()?;
        }
        if let Some(e) = &self.embedding {
            e.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecordInput {
    pub schema_version: SchemaVersion,
    pub session_id: ProctorSessionId,
    pub kind: ViolationKind,
    pub reason_code: ReasonCodeId,
    pub recorded_at: MonotonicTimeNs,
    pub idempotency_key: Option<String>,
}

impl ViolationRecordInput {
    pub fn v1(
        session_id: ProctorSessionId,
        kind: ViolationKind,
        reason_code: ReasonCodeId,
        recorded_at: MonotonicTimeNs,
        idempotency_key: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let i = Self {
            schema_version: PH1PROCTOR_CONTRACT_VERSION,
            session_id,
            kind,
            reason_code,
            recorded_at,
            idempotency_key,
        };
        i.validate()?;
        Ok(i)
    }
}

impl Validate for ViolationRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1PROCTOR_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "violation_record_input.schema_version",
                reason: "must match PH1PROCTOR_CONTRACT_VERSION",
            });
        }
        self.session_id.validate()?;
        if self.kind == ViolationKind::NoFace {
            return Err(ContractViolation::InvalidValue {
                field: "violation_record_input.kind",
                reason: "NO_FACE is recorded as LEFT_SEAT",
            });
        }
        validate_idempotency_key(
            "violation_record_input.idempotency_key",
            self.idempotency_key.as_deref(),
        )
    }
}

/// Append-only audit row. `row_hash` chains over `prev_row_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub schema_version: SchemaVersion,
    pub violation_id: ViolationId,
    pub session_id: ProctorSessionId,
    pub kind: ViolationKind,
    pub source: ViolationSource,
    pub weight: u32,
    pub reason_code: ReasonCodeId,
    pub recorded_at: MonotonicTimeNs,
    pub idempotency_key: Option<String>,
    pub prev_row_hash: String,
    pub row_hash: String,
}

impl ViolationRecord {
    pub fn from_input_v1(
        violation_id: ViolationId,
        input: ViolationRecordInput,
        prev_row_hash: String,
        row_hash: String,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PH1PROCTOR_CONTRACT_VERSION,
            violation_id,
            session_id: input.session_id,
            kind: input.kind,
            source: input.kind.source(),
            weight: input.kind.weight(),
            reason_code: input.reason_code,
            recorded_at: input.recorded_at,
            idempotency_key: input.idempotency_key,
            prev_row_hash,
            row_hash,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ViolationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1PROCTOR_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "violation_record.schema_version",
                reason: "must match PH1PROCTOR_CONTRACT_VERSION",
            });
        }
        if self.violation_id.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "violation_record.violation_id",
                reason: "must be > 0",
            });
        }
        self.session_id.validate()?;
        if self.source != self.kind.source() {
            return Err(ContractViolation::InvalidValue {
                field: "violation_record.source",
                reason: "must match kind",
            });
        }
        if self.weight != self.kind.weight() {
            return Err(ContractViolation::InvalidValue {
                field: "violation_record.weight",
                reason: "must match kind",
            });
        }
        validate_hash_hex("violation_record.prev_row_hash", &self.prev_row_hash)?;
        validate_hash_hex("violation_record.row_hash", &self.row_hash)?;
        validate_idempotency_key(
            "violation_record.idempotency_key",
            self.idempotency_key.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStatus {
    Accepted,
    Skipped,
    InvalidFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameResult {
    pub status: FrameStatus,
    pub faces_detected: Option<u32>,
    pub violation: Option<ViolationKind>,
    pub cumulative_score: u32,
    pub action: Option<EscalationAction>,
}

impl FrameResult {
    pub fn skipped(cumulative_score: u32) -> Self {
        Self {
            status: FrameStatus::Skipped,
            faces_detected: None,
            violation: None,
            cumulative_score,
            action: None,
        }
    }

    pub fn invalid_frame(cumulative_score: u32) -> Self {
        Self {
            status: FrameStatus::InvalidFrame,
            faces_detected: None,
            violation: None,
            cumulative_score,
            action: None,
        }
    }

    pub fn accepted(
        faces_detected: Option<u32>,
        violation: Option<ViolationKind>,
        cumulative_score: u32,
        action: Option<EscalationAction>,
    ) -> Self {
        Self {
            status: FrameStatus::Accepted,
            faces_detected,
            violation,
            cumulative_score,
            action,
        }
    }

    pub fn skipped_frame(&self) -> bool {
        self.status == FrameStatus::Skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEventResult {
    pub violation_id: ViolationId,
    pub kind: ViolationKind,
    pub cumulative_score: u32,
    pub action: Option<EscalationAction>,
    /// True when an idempotent retry matched an already recorded event.
    pub replayed: bool,
}

fn validate_idempotency_key(
    field: &'static str,
    key: Option<&str>,
) -> Result<(), ContractViolation> {
    let Some(key) = key else {
        return Ok(());
    };
    if key.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty when provided",
        });
    }
    if key.len() > 128 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be <= 128 chars",
        });
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

fn validate_hash_hex(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() != 64 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be 64 hex chars",
        });
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be lowercase hex",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_hash() -> String {
        "0".repeat(64)
    }

    #[test]
    fn at_proctor_contract_01_weights_double_for_spoof_and_impersonation() {
        for kind in ViolationKind::ALL {
            let expected = match kind {
                ViolationKind::SpoofAttack | ViolationKind::Impersonation => 2,
                _ => 1,
            };
            assert_eq!(kind.weight(), expected, "{}", kind.as_str());
        }
    }

    #[test]
    fn at_proctor_contract_02_client_kinds_are_exactly_the_browser_events() {
        let client: Vec<_> = ViolationKind::ALL
            .into_iter()
            .filter(|k| k.is_client_reported())
            .collect();
        assert_eq!(
            client,
            vec![
                ViolationKind::TabSwitch,
                ViolationKind::WindowBlur,
                ViolationKind::RightClick
            ]
        );
    }

    #[test]
    fn at_proctor_contract_03_kind_parse_matches_wire_names() {
        for kind in ViolationKind::ALL {
            assert_eq!(ViolationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ViolationKind::parse(" tab_switch "), Some(ViolationKind::TabSwitch));
        assert_eq!(ViolationKind::parse("TALKING_DETECTED"), None);
    }

    #[test]
    fn at_proctor_contract_04_gray_frame_rejects_length_mismatch() {
        assert!(GrayFrame::v1(4, 4, vec![0; 15]).is_err());
        assert!(GrayFrame::v1(0, 4, vec![]).is_err());
        assert!(GrayFrame::v1(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn at_proctor_contract_05_embedding_distance_requires_same_dimension() {
        let a = IdentityEmbedding::new(vec![0.0, 0.0]).unwrap();
        let b = IdentityEmbedding::new(vec![3.0, 4.0]).unwrap();
        let c = IdentityEmbedding::new(vec![1.0]).unwrap();
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-9);
        assert!(a.euclidean_distance(&c).is_err());
        assert!(IdentityEmbedding::new(vec![f32::NAN]).is_err());
        assert!(IdentityEmbedding::new(vec![]).is_err());
    }

    #[test]
    fn at_proctor_contract_06_features_reject_out_of_range_brightness() {
        assert!(FrameFeatures::v1(Some(1), Some(256.0), None, None).is_err());
        assert!(FrameFeatures::v1(Some(1), Some(f64::NAN), None, None).is_err());
        assert!(FrameFeatures::v1(None, None, None, None).is_ok());
    }

    #[test]
    fn at_proctor_contract_07_no_face_is_never_recorded() {
        let input = ViolationRecordInput::v1(
            ProctorSessionId(1),
            ViolationKind::NoFace,
            ReasonCodeId(1),
            MonotonicTimeNs(1),
            None,
        );
        assert!(input.is_err());
    }

    #[test]
    fn at_proctor_contract_08_record_derives_source_and_weight_from_kind() {
        let input = ViolationRecordInput::v1(
            ProctorSessionId(7),
            ViolationKind::SpoofAttack,
            ReasonCodeId(9),
            MonotonicTimeNs(10),
            None,
        )
        .unwrap();
        let rec =
            ViolationRecord::from_input_v1(ViolationId(1), input, zero_hash(), "a".repeat(64))
                .unwrap();
        assert_eq!(rec.source, ViolationSource::Camera);
        assert_eq!(rec.weight, 2);
    }

    #[test]
    fn at_proctor_contract_09_record_rejects_malformed_hash() {
        let input = ViolationRecordInput::v1(
            ProctorSessionId(7),
            ViolationKind::TabSwitch,
            ReasonCodeId(9),
            MonotonicTimeNs(10),
            Some("evt-1".to_string()),
        )
        .unwrap();
        let rec = ViolationRecord::from_input_v1(
            ViolationId(1),
            input,
            zero_hash(),
            "ABC".to_string(),
        );
        assert!(rec.is_err());
    }

    #[test]
    fn at_proctor_contract_10_pixel_outside_frame_is_none() {
        let f = GrayFrame::v1(3, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(f.pixel(2, 1), Some(6));
        assert_eq!(f.pixel(3, 0), None);
        assert_eq!(f.pixel(0, 2), None);
        assert_eq!(f.pixel(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn at_proctor_contract_11_contract_violation_displays_field() {
        let e = ContractViolation::InvalidRange {
            field: "frame_features.brightness",
            min: 0.0,
            max: 255.0,
            got: 300.0,
        };
        assert_eq!(e.to_string(), "frame_features.brightness: 300 outside [0, 255]");
        assert_eq!(ViolationKind::TabSwitch.source().as_str(), "CLIENT");
    }
}
