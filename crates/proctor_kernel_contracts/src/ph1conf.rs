#![forbid(unsafe_code)]

use crate::ph1proctor::{ProctorSessionId, UserId, ViolationKind};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1CONF_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const CONFIDENCE_SCORE_MAX: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PenaltyLine {
    pub kind: ViolationKind,
    pub penalty: u32,
}

/// Audit score for one session, derived only from its recorded violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfidenceReport {
    pub schema_version: SchemaVersion,
    pub session_id: ProctorSessionId,
    pub score: u8,
    pub violation_count: u32,
    pub breakdown: Vec<PenaltyLine>,
}

impl ConfidenceReport {
    pub fn v1(
        session_id: ProctorSessionId,
        score: u8,
        breakdown: Vec<PenaltyLine>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PH1CONF_CONTRACT_VERSION,
            session_id,
            score,
            violation_count: u32::try_from(breakdown.len()).unwrap_or(u32::MAX),
            breakdown,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn violation_kinds(&self) -> Vec<ViolationKind> {
        self.breakdown.iter().map(|l| l.kind).collect()
    }
}

impl Validate for ConfidenceReport {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1CONF_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "confidence_report.schema_version",
                reason: "must match PH1CONF_CONTRACT_VERSION",
            });
        }
        self.session_id.validate()?;
        if self.score > CONFIDENCE_SCORE_MAX {
            return Err(ContractViolation::InvalidRange {
                field: "confidence_report.score",
                min: 0.0,
                max: f64::from(CONFIDENCE_SCORE_MAX),
                got: f64::from(self.score),
            });
        }
        if self.violation_count as usize != self.breakdown.len() {
            return Err(ContractViolation::InvalidValue {
                field: "confidence_report.violation_count",
                reason: "must equal breakdown length",
            });
        }
        Ok(())
    }
}

/// One row of the administrative exam report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamReportRow {
    pub session_id: ProctorSessionId,
    pub user_id: UserId,
    pub score: u8,
    pub violation_count: u32,
    pub violations: Vec<ViolationKind>,
}

impl ExamReportRow {
    pub fn from_report(user_id: UserId, report: &ConfidenceReport) -> Self {
        Self {
            session_id: report.session_id,
            user_id,
            score: report.score,
            violation_count: report.violation_count,
            violations: report.violation_kinds(),
        }
    }
}
