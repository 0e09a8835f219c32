//! Moderation gate: the synchronous ALLOW/BLOCK decision point.
//!
//! Every submitted or edited text unit and every generated reply passes
//! through [`ModerationGate::evaluate`]. The gate calls the classifier
//! once under the configured deadline and always returns a definite
//! outcome: classifier failures are absorbed by the [`FailurePolicy`].

use std::sync::Arc;
use std::time::Duration;

use postgate_state::{ModerationState, UnitId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{FailurePolicy, GatewayConfig, ModerationConfig};
use crate::gateway::{bounded, Classifier, ClassifierVerdict, CLASSIFIER};
use crate::obs;

/// Gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationOutcome {
    Allowed,
    Blocked,
}

impl ModerationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationOutcome::Allowed => "ALLOWED",
            ModerationOutcome::Blocked => "BLOCKED",
        }
    }
}

impl From<ModerationOutcome> for ModerationState {
    fn from(outcome: ModerationOutcome) -> Self {
        match outcome {
            ModerationOutcome::Allowed => ModerationState::Allowed,
            ModerationOutcome::Blocked => ModerationState::Blocked,
        }
    }
}

impl std::fmt::Display for ModerationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the outcome was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// The classifier answered.
    Classifier,
    /// Classification is switched off; everything is allowed.
    Disabled,
    /// The classifier failed and the failure policy decided.
    FailurePolicy,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::Classifier => "classifier",
            VerdictSource::Disabled => "disabled",
            VerdictSource::FailurePolicy => "failure_policy",
        }
    }
}

/// Per-call record of a gate decision. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub unit_id: Option<UnitId>,
    pub outcome: ModerationOutcome,
    pub reason: String,
    pub classifier_latency: Duration,
    pub source: VerdictSource,
}

/// Outcome plus the text to store for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub outcome: ModerationOutcome,
    /// The raw text when allowed, the placeholder when blocked.
    pub stored_text: String,
    pub verdict: ModerationVerdict,
}

impl GateDecision {
    pub fn is_blocked(&self) -> bool {
        self.outcome == ModerationOutcome::Blocked
    }
}

/// The gate. Holds no mutable state, so it is safe to share across tasks.
#[derive(Clone)]
pub struct ModerationGate {
    classifier: Arc<dyn Classifier>,
    config: ModerationConfig,
    gateways: GatewayConfig,
}

impl ModerationGate {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        config: ModerationConfig,
        gateways: GatewayConfig,
    ) -> Self {
        Self {
            classifier,
            config,
            gateways,
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.config.blocked_placeholder
    }

    /// Decide on `raw_text` with no unit attached (dry runs, generated replies).
    pub async fn evaluate(&self, raw_text: &str) -> GateDecision {
        self.decide(None, raw_text).await
    }

    /// Decide on the text of an existing unit.
    pub async fn evaluate_unit(&self, unit_id: &UnitId, raw_text: &str) -> GateDecision {
        self.decide(Some(unit_id.clone()), raw_text).await
    }

    async fn decide(&self, unit_id: Option<UnitId>, raw_text: &str) -> GateDecision {
        let started = Instant::now();

        let (outcome, reason, source) = if !self.gateways.classifier_enabled {
            (
                ModerationOutcome::Allowed,
                "classifier disabled".to_string(),
                VerdictSource::Disabled,
            )
        } else {
            match bounded(
                CLASSIFIER,
                self.gateways.request_timeout(),
                self.classifier.classify(raw_text),
            )
            .await
            {
                Ok(verdict) => {
                    let outcome = self.map_verdict(&verdict);
                    (outcome, verdict.raw_reason, VerdictSource::Classifier)
                }
                Err(err) => {
                    let outcome = match self.config.failure_policy {
                        FailurePolicy::FailClosed => ModerationOutcome::Blocked,
                        FailurePolicy::FailOpen => ModerationOutcome::Allowed,
                    };
                    (outcome, err.to_string(), VerdictSource::FailurePolicy)
                }
            }
        };

        let classifier_latency = started.elapsed();
        obs::emit_gate_evaluated(
            unit_id.as_ref().map(UnitId::as_str),
            raw_text,
            outcome.as_str(),
            source.as_str(),
            classifier_latency.as_millis() as u64,
        );

        let stored_text = match outcome {
            ModerationOutcome::Allowed => raw_text.to_string(),
            ModerationOutcome::Blocked => self.config.blocked_placeholder.clone(),
        };

        GateDecision {
            outcome,
            stored_text,
            verdict: ModerationVerdict {
                unit_id,
                outcome,
                reason,
                classifier_latency,
                source,
            },
        }
    }

    /// Blocked when flagged at or above the threshold. A confidence that is
    /// not a number counts as certain.
    fn map_verdict(&self, verdict: &ClassifierVerdict) -> ModerationOutcome {
        let confidence = if verdict.confidence.is_nan() {
            1.0
        } else {
            verdict.confidence.clamp(0.0, 1.0)
        };
        if verdict.is_flagged && confidence >= self.config.confidence_threshold {
            ModerationOutcome::Blocked
        } else {
            ModerationOutcome::Allowed
        }
    }
}
