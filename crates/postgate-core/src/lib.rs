//! postgate core library
//!
//! Moderation-gated, delay-scheduled reply pipeline: every submitted text
//! unit passes an external classifier before it becomes visible, and
//! comments on opted-in posts trigger a delayed, moderated auto-reply.

pub mod config;
pub mod error;
pub mod gateway;
pub mod moderation;
pub mod obs;
pub mod pipeline;
pub mod reply;
pub mod telemetry;

pub use config::{
    DispatchConfig, FailurePolicy, GatewayConfig, ModerationConfig, PipelineConfig, ReplyConfig,
    UpstreamConfig,
};
pub use error::{GatewayError, PostgateError, Result};
pub use gateway::http::{HttpClassifier, HttpGenerator};
pub use gateway::{bounded, Classifier, ClassifierVerdict, Generator, ReplyContext};
pub use moderation::{
    GateDecision, ModerationGate, ModerationOutcome, ModerationVerdict, VerdictSource,
};
pub use pipeline::{Draft, EditReceipt, Pipeline, SubmitReceipt};
pub use reply::{
    clean_reply, DispatchReport, Dispatcher, ExecutionOutcome, RecoveryReport, ReplyExecutor,
    ReplyScheduler, SkipReason,
};
pub use telemetry::init_tracing;
