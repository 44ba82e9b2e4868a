//! Stage results and pipeline runs.
//!
//! A [`PipelineRun`] is assembled by a [`RunRecorder`] while the pipeline
//! executes: one [`StageResult`] is appended per attempted stage and the run is
//! sealed once the pipeline halts. After sealing nothing about a run changes.
//!
//! Invariants upheld here rather than by callers:
//!
//! - stage results are append-only and keep execution order;
//! - cost and elapsed time are recorded for failed stages too;
//! - a run that did not succeed never carries a final artifact.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CallerId, FailureClass, PipelineRunId, RequestId, Timestamp, TokenCost, TokenUsage};

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// The five analysis stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    IntentAnalysis,
    PatternSelection,
    Validation,
    RequirementSynthesis,
    PromptBuilding,
}

impl StageKind {
    /// All stages in the order the pipeline runs them.
    pub const ALL: [StageKind; 5] = [
        StageKind::IntentAnalysis,
        StageKind::PatternSelection,
        StageKind::Validation,
        StageKind::RequirementSynthesis,
        StageKind::PromptBuilding,
    ];

    /// Short name used in logs and at the request boundary.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IntentAnalysis => "intent_analysis",
            Self::PatternSelection => "pattern_selection",
            Self::Validation => "validation",
            Self::RequirementSynthesis => "requirement_synthesis",
            Self::PromptBuilding => "prompt_building",
        }
    }

    /// One-based position of this stage in the pipeline.
    pub fn position(self) -> usize {
        Self::ALL
            .iter()
            .position(|k| *k == self)
            .map_or(0, |i| i + 1)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "class", rename_all = "snake_case")]
pub enum StageFailureKind {
    /// The completion call itself failed.
    Provider(FailureClass),
    /// The provider replied but the reply did not have the expected shape.
    MalformedReply,
    /// The reply was well formed but its content rejects the request.
    Rejected,
    /// The run was cancelled while the stage was in flight.
    Cancelled,
}

impl std::fmt::Display for StageFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(class) => write!(f, "provider error: {class}"),
            Self::MalformedReply => f.write_str("malformed reply"),
            Self::Rejected => f.write_str("rejected"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Failure detail attached to an unsuccessful [`StageResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: StageFailureKind,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

/// Outcome of one stage invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    stage: StageKind,
    payload: Option<Value>,
    failure: Option<StageFailure>,
    usage: TokenUsage,
    cost: TokenCost,
    #[serde(with = "duration_ms")]
    elapsed: Duration,
}

impl StageResult {
    /// A successful stage carrying its structured payload.
    pub fn success(
        stage: StageKind,
        payload: Value,
        usage: TokenUsage,
        cost: TokenCost,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage,
            payload: Some(payload),
            failure: None,
            usage,
            cost,
            elapsed,
        }
    }

    /// A failed stage. Cost and elapsed time are still recorded.
    pub fn failed(
        stage: StageKind,
        kind: StageFailureKind,
        reason: impl Into<String>,
        usage: TokenUsage,
        cost: TokenCost,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage,
            payload: None,
            failure: Some(StageFailure {
                kind,
                reason: reason.into(),
            }),
            usage,
            cost,
            elapsed,
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn cost(&self) -> TokenCost {
        self.cost
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

// ---------------------------------------------------------------------------
// Stage input
// ---------------------------------------------------------------------------

/// What a stage receives: the original prompt plus the payloads of every
/// stage that has already succeeded in this run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageInput {
    prompt: String,
    outputs: BTreeMap<StageKind, Value>,
}

impl StageInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            outputs: BTreeMap::new(),
        }
    }

    /// The caller's original prompt.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Records the payload of a completed stage.
    pub fn insert(&mut self, stage: StageKind, payload: Value) {
        self.outputs.insert(stage, payload);
    }

    /// Raw payload produced by `stage`, if it has run.
    pub fn output(&self, stage: StageKind) -> Option<&Value> {
        self.outputs.get(&stage)
    }

    /// Payload produced by `stage`, decoded into its typed form.
    ///
    /// Returns `None` if the stage has not run or its payload has a different
    /// shape.
    pub fn output_as<T: DeserializeOwned>(&self, stage: StageKind) -> Option<T> {
        self.outputs
            .get(&stage)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Stages whose payloads are available, in pipeline order.
    pub fn completed_stages(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.outputs.keys().copied()
    }
}

// ---------------------------------------------------------------------------
// Pipeline runs
// ---------------------------------------------------------------------------

/// One sealed end-to-end execution of the stages for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    run_id: PipelineRunId,
    request_id: RequestId,
    caller_id: CallerId,
    started_at: Timestamp,
    stage_results: Vec<StageResult>,
    final_artifact: Option<Value>,
    succeeded: bool,
    total_cost: TokenCost,
    #[serde(with = "duration_ms")]
    total_elapsed: Duration,
}

impl PipelineRun {
    pub fn run_id(&self) -> PipelineRunId {
        self.run_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn caller_id(&self) -> &CallerId {
        &self.caller_id
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Results of every attempted stage, in execution order.
    pub fn stage_results(&self) -> &[StageResult] {
        &self.stage_results
    }

    pub fn final_artifact(&self) -> Option<&Value> {
        self.final_artifact.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Sum of the cost of every attempted stage.
    pub fn total_cost(&self) -> TokenCost {
        self.total_cost
    }

    /// Sum of the elapsed time of every attempted stage.
    pub fn total_elapsed(&self) -> Duration {
        self.total_elapsed
    }

    /// The stage that halted the run, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| !r.succeeded())
    }
}

/// Append-only builder for a [`PipelineRun`].
#[derive(Debug)]
pub struct RunRecorder {
    run_id: PipelineRunId,
    request_id: RequestId,
    caller_id: CallerId,
    started_at: Timestamp,
    stage_results: Vec<StageResult>,
}

impl RunRecorder {
    pub fn new(request_id: RequestId, caller_id: CallerId) -> Self {
        Self {
            run_id: PipelineRunId::new_random(),
            request_id,
            caller_id,
            started_at: Timestamp::now(),
            stage_results: Vec::with_capacity(StageKind::ALL.len()),
        }
    }

    pub fn run_id(&self) -> PipelineRunId {
        self.run_id
    }

    /// Appends the result of the stage that just finished.
    pub fn record(&mut self, result: StageResult) {
        self.stage_results.push(result);
    }

    /// Cost accumulated by the stages recorded so far.
    pub fn cost_so_far(&self) -> TokenCost {
        self.stage_results.iter().map(StageResult::cost).sum()
    }

    pub fn results(&self) -> &[StageResult] {
        &self.stage_results
    }

    /// Seals the run.
    ///
    /// The run succeeded only if every stage was attempted and succeeded and a
    /// final artifact is supplied; otherwise the artifact is dropped.
    pub fn seal(self, final_artifact: Option<Value>) -> PipelineRun {
        let complete = self.stage_results.len() == StageKind::ALL.len()
            && self.stage_results.iter().all(StageResult::succeeded);
        let succeeded = complete && final_artifact.is_some();
        let total_cost = self.stage_results.iter().map(StageResult::cost).sum();
        let total_elapsed = self.stage_results.iter().map(StageResult::elapsed).sum();

        tracing::debug!(
            run_id = %self.run_id,
            stages = self.stage_results.len(),
            succeeded,
            total_cost = %total_cost,
            "pipeline run sealed"
        );

        PipelineRun {
            run_id: self.run_id,
            request_id: self.request_id,
            caller_id: self.caller_id,
            started_at: self.started_at,
            stage_results: self.stage_results,
            final_artifact: if succeeded { final_artifact } else { None },
            succeeded,
            total_cost,
            total_elapsed,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helper: durations as whole milliseconds.
// ---------------------------------------------------------------------------
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
