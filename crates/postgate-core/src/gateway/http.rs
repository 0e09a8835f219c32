//! HTTP gateways over a `generateContent`-style model API.
//!
//! Status mapping: transport errors, timeouts and 5xx responses become
//! `UpstreamUnavailable`; any other non-success status (quota, invalid
//! input) becomes `UpstreamRejected`.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Classifier, ClassifierVerdict, GatewayError, Generator, ReplyContext, CLASSIFIER, GENERATOR,
};
use crate::config::{GatewayConfig, UpstreamConfig};
use crate::error::{PostgateError, Result};

/// Confidence assigned when the classifier answered in prose instead of JSON.
const FALLBACK_CONFIDENCE: f32 = 0.3;

const FLAG_WORDS: [&str; 4] = ["inappropriate", "violation", "block", "reject"];

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
    }
}

/// Shape the classifier prompt asks the model to answer with.
#[derive(Debug, Deserialize)]
struct ModerationAnswer {
    #[serde(default = "default_true")]
    is_appropriate: bool,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    severity: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f32 {
    0.5
}

/// Minimal client for one model endpoint.
#[derive(Debug, Clone)]
struct ModelClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl ModelClient {
    fn new(upstream: &UpstreamConfig, gateways: &GatewayConfig, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("postgate/", env!("CARGO_PKG_VERSION")))
            .timeout(gateways.request_timeout())
            .build()
            .map_err(|e| PostgateError::InvalidConfig(format!("http client: {e}")))?;

        Ok(Self {
            http,
            url: format!(
                "{}/models/{}:generateContent",
                upstream.endpoint.trim_end_matches('/'),
                model
            ),
            api_key: upstream.api_key.clone(),
        })
    }

    async fn generate_content(
        &self,
        gateway: &'static str,
        prompt: &str,
    ) -> std::result::Result<String, GatewayError> {
        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::unavailable(gateway, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(gateway, status));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                GatewayError::rejected(gateway, format!("malformed response: {e}"))
            } else {
                GatewayError::unavailable(gateway, e.to_string())
            }
        })?;

        debug!(gateway, candidates = parsed.candidates.len(), "model responded");
        parsed
            .first_text()
            .ok_or_else(|| GatewayError::rejected(gateway, "response carried no candidates"))
    }
}

fn classify_status(gateway: &'static str, status: reqwest::StatusCode) -> GatewayError {
    if status.is_server_error() {
        GatewayError::unavailable(gateway, format!("HTTP {status}"))
    } else {
        GatewayError::rejected(gateway, format!("HTTP {status}"))
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Classifier that asks a language model for a JSON verdict.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: ModelClient,
    json_block: Regex,
}

impl HttpClassifier {
    pub fn new(upstream: &UpstreamConfig, gateways: &GatewayConfig) -> Result<Self> {
        let json_block = Regex::new(r"(?s)\{.*\}")
            .map_err(|e| PostgateError::InvalidConfig(format!("verdict pattern: {e}")))?;
        Ok(Self {
            client: ModelClient::new(upstream, gateways, &upstream.classifier_model)?,
            json_block,
        })
    }

    /// Turn the model's answer into a verdict.
    ///
    /// The first `{...}` block is read as JSON. Without one, the answer is
    /// scanned for flagging words and the verdict gets a low confidence.
    pub fn parse_verdict(&self, answer: &str) -> std::result::Result<ClassifierVerdict, GatewayError> {
        let Some(block) = self.json_block.find(answer) else {
            return Ok(keyword_verdict(answer));
        };

        let parsed: ModerationAnswer = serde_json::from_str(block.as_str())
            .map_err(|e| GatewayError::rejected(CLASSIFIER, format!("unreadable verdict: {e}")))?;

        let mut categories: std::collections::BTreeSet<String> =
            parsed.issues.iter().map(|i| i.to_lowercase()).collect();
        if let Some(severity) = &parsed.severity {
            if !parsed.is_appropriate {
                categories.insert(format!("severity:{}", severity.to_lowercase()));
            }
        }

        Ok(ClassifierVerdict {
            is_flagged: !parsed.is_appropriate,
            confidence: parsed.confidence,
            raw_reason: if parsed.issues.is_empty() {
                "none".to_string()
            } else {
                parsed.issues.join(", ")
            },
            categories,
        })
    }
}

fn keyword_verdict(answer: &str) -> ClassifierVerdict {
    let lowered = answer.to_lowercase();
    let flagged = FLAG_WORDS.iter().any(|w| lowered.contains(w));
    let mut verdict = if flagged {
        ClassifierVerdict::flagged(FALLBACK_CONFIDENCE, &["fallback"])
    } else {
        ClassifierVerdict::clean()
    };
    verdict.confidence = FALLBACK_CONFIDENCE;
    verdict.raw_reason = "fallback moderation used".to_string();
    verdict
}

fn moderation_prompt(text: &str) -> String {
    format!(
        r#"Analyze the following content for inappropriate language, hate speech, spam, or other violations.

Content: "{text}"

Respond only with a JSON object:
{{
    "is_appropriate": true/false,
    "confidence": 0.0-1.0,
    "issues": ["list", "of", "issues"],
    "severity": "low/medium/high"
}}

Consider profanity, hate speech or discrimination, spam or promotional content,
threats or harassment, and anything inappropriate for a general audience."#
    )
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> std::result::Result<ClassifierVerdict, GatewayError> {
        let answer = self
            .client
            .generate_content(CLASSIFIER, &moderation_prompt(text))
            .await?;
        self.parse_verdict(&answer)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Generator that asks a language model for a short reply.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: ModelClient,
}

impl HttpGenerator {
    pub fn new(upstream: &UpstreamConfig, gateways: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            client: ModelClient::new(upstream, gateways, &upstream.generator_model)?,
        })
    }
}

fn reply_prompt(context: &ReplyContext) -> String {
    format!(
        "Generate a helpful and relevant reply to this comment on a blog post.\n\n\
         Post Title: {}\nPost Content: {}\nComment: {}\n\n\
         Address the comment directly, keep it to one or two friendly sentences, \
         stay constructive if the comment is negative, and avoid promotion.\n\
         Generate only the reply text.",
        context.post_title, context.post_content, context.comment_text
    )
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, context: &ReplyContext) -> std::result::Result<String, GatewayError> {
        self.client
            .generate_content(GENERATOR, &reply_prompt(context))
            .await
    }
}
