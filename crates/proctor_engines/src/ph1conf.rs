#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use proctor_kernel_contracts::ph1conf::{ConfidenceReport, PenaltyLine, CONFIDENCE_SCORE_MAX};
use proctor_kernel_contracts::ph1proctor::{ProctorSessionId, ViolationKind, ViolationRecord};
use proctor_kernel_contracts::ContractViolation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ph1ConfConfig {
    pub penalties: BTreeMap<ViolationKind, u32>,
    pub default_penalty: u32,
}

impl Ph1ConfConfig {
    pub fn mvp_v1() -> Self {
        let penalties = BTreeMap::from([
            (ViolationKind::TabSwitch, 5),
            (ViolationKind::WindowBlur, 5),
            (ViolationKind::RightClick, 5),
            (ViolationKind::LeftSeat, 15),
            (ViolationKind::MultipleFaces, 20),
            (ViolationKind::CameraCovered, 20),
            (ViolationKind::SpoofAttack, 30),
        ]);
        Self {
            penalties,
            default_penalty: 5,
        }
    }

    pub fn penalty_for(&self, kind: ViolationKind) -> u32 {
        self.penalties
            .get(&kind)
            .copied()
            .unwrap_or(self.default_penalty)
    }
}

/// Confidence scorer. A pure function of the recorded violation history.
#[derive(Debug, Clone)]
pub struct Ph1ConfRuntime {
    config: Ph1ConfConfig,
}

impl Ph1ConfRuntime {
    pub fn new(config: Ph1ConfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Ph1ConfConfig {
        &self.config
    }

    /// `score = clamp(100 - sum(penalty), 0, 100)`, one breakdown line per
    /// record in ledger order.
    pub fn score(
        &self,
        session_id: ProctorSessionId,
        history: &[ViolationRecord],
    ) -> Result<ConfidenceReport, ContractViolation> {
        let breakdown: Vec<PenaltyLine> = history
            .iter()
            .map(|r| PenaltyLine {
                kind: r.kind,
                penalty: self.config.penalty_for(r.kind),
            })
            .collect();
        let total: u64 = breakdown.iter().map(|l| u64::from(l.penalty)).sum();
        let remaining = u64::from(CONFIDENCE_SCORE_MAX).saturating_sub(total);
        let score = u8::try_from(remaining).unwrap_or(CONFIDENCE_SCORE_MAX);
        ConfidenceReport::v1(session_id, score, breakdown)
    }
}
