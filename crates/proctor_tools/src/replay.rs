#![forbid(unsafe_code)]

//! Offline replay of a JSONL proctoring script through a [`ProctorService`].
//!
//! The first line starts the session; each following line is a frame or a
//! client event. Face counts and embeddings come from the script itself, so no
//! vision model is loaded.

use std::io::BufRead;
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proctor_engines::ph1frame::{encode_pgm, FaceAnalyzer, FaceAnalyzerError, PgmFrameExtractor};
use proctor_kernel_contracts::ph1conf::ConfidenceReport;
use proctor_kernel_contracts::ph1proctor::{
    ClientEventResult, EscalationAction, ExamId, FrameResult, FrameStatus, GrayFrame,
    IdentityEmbedding, ProctorSessionId, UserId, ViolationKind,
};
use proctor_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use proctor_os::config::ProctorOsConfig;
use proctor_os::ph1proctor::{ProctorError, ProctorService};
use proctor_storage::ph1f::ProctorStore;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

pub const SYNTHETIC_FRAME_WIDTH: u32 = 32;
pub const SYNTHETIC_FRAME_HEIGHT: u32 = 24;
const REFERENCE_FILL: u8 = 128;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("script is empty; the first line must be a start record")]
    MissingStart,
    #[error(transparent)]
    Proctor(#[from] ProctorError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceAnalysis {
    pub faces: u32,
    pub embedding: Option<IdentityEmbedding>,
}

/// Answers every query with the analysis staged for the next frame.
#[derive(Debug, Default)]
pub struct ScriptedFaceAnalyzer {
    staged: Mutex<FaceAnalysis>,
}

impl ScriptedFaceAnalyzer {
    pub fn stage(&self, analysis: FaceAnalysis) {
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = analysis;
    }

    fn staged(&self) -> FaceAnalysis {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FaceAnalyzer for ScriptedFaceAnalyzer {
    fn detect_faces(&self, _frame: &GrayFrame) -> Result<u32, FaceAnalyzerError> {
        Ok(self.staged().faces)
    }

    fn extract_embedding(
        &self,
        _frame: &GrayFrame,
    ) -> Result<Option<IdentityEmbedding>, FaceAnalyzerError> {
        Ok(self.staged().embedding)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartRecord {
    start: StartSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartSpec {
    exam_id: u64,
    user_id: String,
    #[serde(default)]
    at_ms: u64,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptLine {
    Frame(FrameRecord),
    ClientEvent(ClientEventRecord),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrameRecord {
    at_ms: u64,
    frame: FrameSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrameSpec {
    #[serde(default)]
    fill: Option<u8>,
    #[serde(default)]
    pgm_b64: Option<String>,
    #[serde(default)]
    faces: u32,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientEventRecord {
    at_ms: u64,
    client_event: ViolationKind,
    #[serde(default)]
    client_event_id: Option<String>,
}

/// Synthetic frame whose mean sits near `fill`. The texture is re-seeded per
/// frame so consecutive frames differ and keep a sharp Laplacian.
pub fn textured_frame(fill: u8, seed: u64) -> Result<GrayFrame, ContractViolation> {
    let seed = (seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40) as u32;
    let mut px = Vec::with_capacity((SYNTHETIC_FRAME_WIDTH * SYNTHETIC_FRAME_HEIGHT) as usize);
    for y in 0..SYNTHETIC_FRAME_HEIGHT {
        for x in 0..SYNTHETIC_FRAME_WIDTH {
            let texture = x
                .wrapping_mul(37)
                .wrapping_add(y.wrapping_mul(91))
                .wrapping_add(seed.wrapping_mul(53))
                .wrapping_add(x.wrapping_mul(y).wrapping_add(seed) % 17)
                % 64;
            let luma = (i64::from(fill) + i64::from(texture) - 32).clamp(0, 255);
            px.push(luma as u8);
        }
    }
    GrayFrame::v1(SYNTHETIC_FRAME_WIDTH, SYNTHETIC_FRAME_HEIGHT, px)
}

fn embedding(
    line: usize,
    values: Option<Vec<f32>>,
) -> Result<Option<IdentityEmbedding>, ReplayError> {
    values
        .map(|v| {
            IdentityEmbedding::new(v).map_err(|e| ReplayError::InvalidLine {
                line,
                reason: format!("embedding: {e}"),
            })
        })
        .transpose()
}

impl FrameSpec {
    fn frame_bytes(&self, line: usize, at_ms: u64) -> Result<Vec<u8>, ReplayError> {
        match (self.fill, self.pgm_b64.as_deref()) {
            (Some(fill), None) => Ok(encode_pgm(&textured_frame(fill, at_ms)?)),
            (None, Some(b64)) => {
                BASE64
                    .decode(b64.trim())
                    .map_err(|e| ReplayError::InvalidLine {
                        line,
                        reason: format!("pgm_b64: {e}"),
                    })
            }
            _ => Err(ReplayError::InvalidLine {
                line,
                reason: "frame needs exactly one of fill or pgm_b64".to_string(),
            }),
        }
    }
}

fn frame_status_label(status: FrameStatus) -> &'static str {
    match status {
        FrameStatus::Accepted => "ACCEPTED",
        FrameStatus::Skipped => "SKIPPED",
        FrameStatus::InvalidFrame => "INVALID_FRAME",
    }
}

fn frame_result_json(line: usize, at_ms: u64, r: &FrameResult) -> Value {
    json!({
        "line": line,
        "at_ms": at_ms,
        "status": frame_status_label(r.status),
        "faces_detected": r.faces_detected,
        "violation": r.violation.map(ViolationKind::as_str),
        "cumulative_score": r.cumulative_score,
        "action": r.action.map(EscalationAction::as_str),
    })
}

fn client_event_json(line: usize, at_ms: u64, r: &ClientEventResult) -> Value {
    json!({
        "line": line,
        "at_ms": at_ms,
        "violation_id": r.violation_id.0,
        "violation": r.kind.as_str(),
        "cumulative_score": r.cumulative_score,
        "action": r.action.map(EscalationAction::as_str),
        "replayed": r.replayed,
    })
}

fn confidence_json(report: &ConfidenceReport) -> Value {
    json!({
        "session_id": report.session_id.0,
        "score": report.score,
        "violation_count": report.violation_count,
        "breakdown": report.breakdown.iter().map(|l| {
            json!({
                "kind": l.kind.as_str(),
                "penalty": l.penalty
            })
        }).collect::<Vec<_>>()
    })
}

struct Replay {
    service: ProctorService<ProctorStore>,
    analyzer: Arc<ScriptedFaceAnalyzer>,
    session_id: ProctorSessionId,
    user_id: UserId,
}

impl Replay {
    fn start(
        config: ProctorOsConfig,
        line: usize,
        raw: &str,
    ) -> Result<(Self, Value), ReplayError> {
        let record: StartRecord =
            serde_json::from_str(raw).map_err(|source| ReplayError::Parse { line, source })?;
        let spec = record.start;

        let analyzer = Arc::new(ScriptedFaceAnalyzer::default());
        let service = ProctorService::new(
            config,
            Arc::new(ProctorStore::new_in_memory()),
            Arc::new(PgmFrameExtractor::new(analyzer.clone())),
        )?;

        let user_id = UserId::new(spec.user_id)?;
        analyzer.stage(FaceAnalysis {
            faces: 1,
            embedding: embedding(line, spec.embedding)?,
        });
        let reference = encode_pgm(&textured_frame(REFERENCE_FILL, spec.at_ms)?);
        let session_id = service.start_session(
            ExamId(spec.exam_id),
            user_id.clone(),
            &reference,
            MonotonicTimeNs::from_millis(spec.at_ms),
        )?;

        let out = json!({
            "line": line,
            "session_id": session_id.0,
            "exam_id": spec.exam_id,
            "user_id": user_id.as_str(),
        });
        Ok((
            Self {
                service,
                analyzer,
                session_id,
                user_id,
            },
            out,
        ))
    }

    fn step(&self, line: usize, raw: &str) -> Result<Value, ReplayError> {
        let parsed: ScriptLine =
            serde_json::from_str(raw).map_err(|source| ReplayError::Parse { line, source })?;
        match parsed {
            ScriptLine::Frame(FrameRecord { at_ms, frame }) => {
                let bytes = frame.frame_bytes(line, at_ms)?;
                self.analyzer.stage(FaceAnalysis {
                    faces: frame.faces,
                    embedding: embedding(line, frame.embedding)?,
                });
                let outcome = self.service.submit_frame(
                    self.session_id,
                    &self.user_id,
                    &bytes,
                    MonotonicTimeNs::from_millis(at_ms),
                );
                Ok(match outcome {
                    Ok(r) => frame_result_json(line, at_ms, &r),
                    Err(err) => error_json(line, at_ms, &err),
                })
            }
            ScriptLine::ClientEvent(ClientEventRecord {
                at_ms,
                client_event,
                client_event_id,
            }) => {
                let outcome = self.service.report_client_event(
                    self.session_id,
                    &self.user_id,
                    client_event,
                    MonotonicTimeNs::from_millis(at_ms),
                    client_event_id.as_deref(),
                );
                Ok(match outcome {
                    Ok(r) => client_event_json(line, at_ms, &r),
                    Err(err) => error_json(line, at_ms, &err),
                })
            }
        }
    }

    fn finish(self) -> Result<Value, ReplayError> {
        match self.service.end_session(self.session_id) {
            Ok(()) | Err(ProctorError::SessionNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.service.verify_violation_ledger()?;
        let report = self.service.get_confidence(self.session_id)?;
        Ok(json!({
            "confidence": confidence_json(&report),
            "ledger_verified": true,
        }))
    }
}

/// Per-line service rejections (for example a frame after termination) are
/// reported inline and the replay continues.
fn error_json(line: usize, at_ms: u64, err: &ProctorError) -> Value {
    tracing::debug!(target: "proctor.replay", line, error = %err, "line rejected");
    json!({
        "line": line,
        "at_ms": at_ms,
        "error": err.to_string(),
    })
}

/// Runs the whole script and returns one JSON object per non-blank line,
/// followed by the final confidence report.
pub fn run_replay<R: BufRead>(
    config: ProctorOsConfig,
    input: R,
) -> Result<Vec<Value>, ReplayError> {
    let mut outputs = Vec::new();
    let mut replay: Option<Replay> = None;

    for (idx, raw) in input.lines().enumerate() {
        let raw = raw?;
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        match replay.as_ref() {
            None => {
                let (started, out) = Replay::start(config.clone(), line, &raw)?;
                replay = Some(started);
                outputs.push(out);
            }
            Some(r) => outputs.push(r.step(line, &raw)?),
        }
    }

    let replay = replay.ok_or(ReplayError::MissingStart)?;
    tracing::info!(
        target: "proctor.replay",
        session_id = replay.session_id.0,
        lines = outputs.len(),
        "replay finished"
    );
    outputs.push(replay.finish()?);
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(script: &str) -> Vec<Value> {
        run_replay(ProctorOsConfig::mvp_v1(), script.as_bytes()).unwrap()
    }

    const START: &str = r#"{"start":{"exam_id":3,"user_id":"cand_7"}}"#;

    #[test]
    fn at_replay_01_client_events_escalate_and_dedupe() {
        let script = [
            START,
            r#"{"at_ms":1000,"client_event":"TAB_SWITCH","client_event_id":"e1"}"#,
            r#"{"at_ms":1100,"client_event":"TAB_SWITCH","client_event_id":"e1"}"#,
            "",
            r#"{"at_ms":1200,"client_event":"RIGHT_CLICK"}"#,
        ]
        .join("\n");
        let out = replay(&script);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0]["session_id"], 1);
        assert_eq!(out[1]["action"], "WARNING");
        assert_eq!(out[2]["replayed"], true);
        assert_eq!(out[2]["action"], Value::Null);
        assert_eq!(out[3]["line"], 5);
        assert_eq!(out[3]["cumulative_score"], 2);
        assert_eq!(out[4]["confidence"]["score"], 90);
        assert_eq!(out[4]["confidence"]["violation_count"], 2);
        assert_eq!(out[4]["ledger_verified"], true);
    }

    #[test]
    fn at_replay_02_dark_fill_frames_report_camera_covered() {
        let script = [
            START,
            r#"{"at_ms":2000,"frame":{"fill":5,"faces":1}}"#,
            r#"{"at_ms":4000,"frame":{"fill":5,"faces":1}}"#,
            r#"{"at_ms":6000,"frame":{"fill":5,"faces":1}}"#,
            r#"{"at_ms":6500,"frame":{"fill":5,"faces":1}}"#,
        ]
        .join("\n");
        let out = replay(&script);
        assert_eq!(out[1]["status"], "ACCEPTED");
        assert_eq!(out[1]["violation"], Value::Null);
        assert_eq!(out[3]["violation"], "CAMERA_COVERED");
        assert_eq!(out[3]["action"], "WARNING");
        assert_eq!(out[4]["status"], "SKIPPED");
        assert_eq!(out[5]["confidence"]["score"], 80);
    }

    #[test]
    fn at_replay_03_flat_pgm_frames_report_spoof() {
        let flat = GrayFrame::v1(
            SYNTHETIC_FRAME_WIDTH,
            SYNTHETIC_FRAME_HEIGHT,
            vec![120; (SYNTHETIC_FRAME_WIDTH * SYNTHETIC_FRAME_HEIGHT) as usize],
        )
        .unwrap();
        let b64 = BASE64.encode(encode_pgm(&flat));
        let mut lines = vec![START.to_string()];
        for i in 1..=5u64 {
            lines.push(format!(
                r#"{{"at_ms":{},"frame":{{"pgm_b64":"{b64}","faces":1}}}}"#,
                i * 2000
            ));
        }
        let out = replay(&lines.join("\n"));
        for o in &out[1..5] {
            assert_eq!(o["violation"], Value::Null);
        }
        assert_eq!(out[5]["violation"], "SPOOF_ATTACK");
        assert_eq!(out[5]["cumulative_score"], 2);
        assert_eq!(out[6]["confidence"]["score"], 70);
    }

    #[test]
    fn at_replay_04_identity_mismatch_on_check_frame() {
        let mut lines =
            vec![r#"{"start":{"exam_id":3,"user_id":"cand_7","embedding":[0,0,0,0]}}"#.to_string()];
        for i in 1..=5u64 {
            lines.push(format!(
                r#"{{"at_ms":{},"frame":{{"fill":128,"faces":1,"embedding":[1,1,1,1]}}}}"#,
                i * 2000
            ));
        }
        let out = replay(&lines.join("\n"));
        for o in &out[1..5] {
            assert_eq!(o["violation"], Value::Null);
        }
        assert_eq!(out[5]["violation"], "IMPERSONATION");
        assert_eq!(out[5]["cumulative_score"], 2);
    }

    #[test]
    fn at_replay_05_lines_after_termination_are_rejected_inline() {
        let mut lines = vec![START.to_string()];
        for i in 1..=6u64 {
            lines.push(format!(r#"{{"at_ms":{i},"client_event":"WINDOW_BLUR"}}"#));
        }
        let out = replay(&lines.join("\n"));
        assert_eq!(out[5]["action"], "TERMINATE_EXAM");
        assert!(out[6]["error"].as_str().unwrap().contains("not found"));
        assert_eq!(out[7]["confidence"]["violation_count"], 5);
        assert_eq!(out[7]["confidence"]["score"], 75);
    }

    #[test]
    fn at_replay_06_malformed_scripts_fail() {
        assert!(matches!(
            run_replay(ProctorOsConfig::mvp_v1(), "\n\n".as_bytes()),
            Err(ReplayError::MissingStart)
        ));
        assert!(matches!(
            run_replay(
                ProctorOsConfig::mvp_v1(),
                r#"{"at_ms":1,"client_event":"TAB_SWITCH"}"#.as_bytes()
            ),
            Err(ReplayError::Parse { line: 1, .. })
        ));
        let both = [START, r#"{"at_ms":2000,"frame":{"fill":5,"pgm_b64":"AA==","faces":1}}"#]
            .join("\n");
        assert!(matches!(
            run_replay(ProctorOsConfig::mvp_v1(), both.as_bytes()),
            Err(ReplayError::InvalidLine { line: 2, .. })
        ));
    }

    #[test]
    fn at_replay_07_fill_frames_track_requested_brightness() {
        let dark = textured_frame(5, 2000).unwrap();
        let bright = textured_frame(128, 4000).unwrap();
        let mean = |f: &GrayFrame| {
            f.pixels().iter().map(|&p| f64::from(p)).sum::<f64>() / f.pixels().len() as f64
        };
        assert!(mean(&dark) < 30.0);
        assert!((mean(&bright) - 128.0).abs() < 8.0);
        assert_ne!(textured_frame(128, 4000).unwrap(), textured_frame(128, 6000).unwrap());
    }
}
