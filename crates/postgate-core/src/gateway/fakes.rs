//! Gateway stubs for tests and offline runs.
//!
//! - `KeywordClassifier`: deterministic verdicts from a term list
//! - `FaultyClassifier`: always fails with a chosen [`Fault`]
//! - `ScriptedGenerator`: replays a fixed sequence of replies and faults
//!
//! Every stub counts its calls so tests can assert attempt bounds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    Classifier, ClassifierVerdict, GatewayError, Generator, ReplyContext, CLASSIFIER, GENERATOR,
};

/// Failure mode injected by a stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never answer; the caller's deadline must fire.
    Hang,
    /// Transport-level failure.
    Unavailable,
    /// Well-formed refusal.
    Rejected,
}

impl Fault {
    async fn raise<T>(self, gateway: &'static str) -> Result<T, GatewayError> {
        match self {
            Fault::Hang => std::future::pending().await,
            Fault::Unavailable => Err(GatewayError::unavailable(gateway, "injected outage")),
            Fault::Rejected => Err(GatewayError::rejected(gateway, "injected rejection")),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifiers
// ---------------------------------------------------------------------------

/// Flags any text containing one of its terms (case-insensitive).
#[derive(Debug)]
pub struct KeywordClassifier {
    terms: Vec<String>,
    confidence: f32,
    calls: AtomicU32,
}

impl KeywordClassifier {
    pub fn new(confidence: f32) -> Self {
        Self {
            terms: Vec::new(),
            confidence,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_term(mut self, term: &str) -> Self {
        self.terms.push(term.to_lowercase());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<ClassifierVerdict, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lowered = text.to_lowercase();
        let hits: Vec<&str> = self
            .terms
            .iter()
            .filter(|t| lowered.contains(t.as_str()))
            .map(String::as_str)
            .collect();
        if hits.is_empty() {
            Ok(ClassifierVerdict::clean())
        } else {
            Ok(ClassifierVerdict::flagged(self.confidence, &hits))
        }
    }
}

/// Fails every call with the configured fault.
#[derive(Debug)]
pub struct FaultyClassifier {
    fault: Fault,
    calls: AtomicU32,
}

impl FaultyClassifier {
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FaultyClassifier {
    async fn classify(&self, _text: &str) -> Result<ClassifierVerdict, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fault.raise(CLASSIFIER).await
    }
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// One scripted generator response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Reply(String),
    Fail(Fault),
}

/// Generator that replays `steps` in order and then repeats the last one.
#[derive(Debug)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    last: Step,
    calls: AtomicU32,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<Step>) -> Self {
        let last = steps
            .last()
            .cloned()
            .unwrap_or_else(|| Step::Reply(String::new()));
        Self {
            steps: Mutex::new(steps.into()),
            last,
            calls: AtomicU32::new(0),
        }
    }

    /// Always answer with `text`.
    pub fn replying(text: &str) -> Self {
        Self::new(vec![Step::Reply(text.to_string())])
    }

    /// Always fail with `fault`.
    pub fn failing(fault: Fault) -> Self {
        Self::new(vec![Step::Fail(fault)])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        match self.steps.lock() {
            Ok(mut steps) => steps.pop_front().unwrap_or_else(|| self.last.clone()),
            Err(_) => self.last.clone(),
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _context: &ReplyContext) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Step::Reply(text) => Ok(text),
            Step::Fail(fault) => fault.raise(GENERATOR).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ReplyContext {
        ReplyContext {
            post_title: "t".to_string(),
            post_content: "c".to_string(),
            comment_text: "hi".to_string(),
        }
    }

    #[tokio::test]
    async fn test_keyword_classifier_is_deterministic() {
        let classifier = KeywordClassifier::new(0.95).with_term("Pills");
        let a = classifier.classify("buy cheap pills now").await.unwrap();
        let b = classifier.classify("buy cheap pills now").await.unwrap();
        assert_eq!(a, b);
        assert!(a.is_flagged);
        assert!(!classifier.classify("nice post").await.unwrap().is_flagged);
        assert_eq!(classifier.calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_generator_replays_then_repeats_last() {
        let generator = ScriptedGenerator::new(vec![
            Step::Fail(Fault::Unavailable),
            Step::Reply("thanks!".to_string()),
        ]);
        assert!(generator.generate(&ctx()).await.is_err());
        assert_eq!(generator.generate(&ctx()).await.unwrap(), "thanks!");
        assert_eq!(generator.generate(&ctx()).await.unwrap(), "thanks!");
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_faulty_classifier_rejects() {
        let classifier = FaultyClassifier::new(Fault::Rejected);
        let err = classifier.classify("x").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(classifier.calls(), 1);
    }
}
