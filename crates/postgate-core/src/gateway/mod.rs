//! Gateways to the external text classifier and text generator.
//!
//! Both are plain request/response capabilities: no retries and no local
//! state live here. Callers wrap each call in [`bounded`], which turns an
//! elapsed deadline into `GatewayError::UpstreamUnavailable`.
//!
//! # Modules
//!
//! - [`http`]: `HttpClassifier` / `HttpGenerator` over a `generateContent` API
//! - [`fakes`]: deterministic and fault-injecting stubs for tests

pub mod fakes;
pub mod http;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::error::GatewayError;

pub const CLASSIFIER: &str = "classifier";
pub const GENERATOR: &str = "generator";

/// Raw classifier response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    pub is_flagged: bool,
    /// Confidence in `is_flagged`, in [0, 1].
    pub confidence: f32,
    pub categories: BTreeSet<String>,
    pub raw_reason: String,
}

impl ClassifierVerdict {
    pub fn clean() -> Self {
        Self {
            is_flagged: false,
            confidence: 1.0,
            categories: BTreeSet::new(),
            raw_reason: "none".to_string(),
        }
    }

    pub fn flagged(confidence: f32, categories: &[&str]) -> Self {
        Self {
            is_flagged: true,
            confidence,
            categories: categories.iter().map(|c| c.to_string()).collect(),
            raw_reason: categories.join(", "),
        }
    }
}

/// Context a reply is generated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub post_title: String,
    pub post_content: String,
    pub comment_text: String,
}

/// External text-classification capability.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<ClassifierVerdict, GatewayError>;
}

/// External text-generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, context: &ReplyContext) -> Result<String, GatewayError>;
}

/// Run a gateway call under a hard deadline.
pub async fn bounded<T, Fut>(
    gateway: &'static str,
    limit: Duration,
    call: Fut,
) -> Result<T, GatewayError>
where
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(GatewayError::unavailable(
            gateway,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}
