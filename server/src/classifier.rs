//! Difficulty Classifier
//!
//! Labels a prompt SIMPLE, COMPLEX or ADVANCED within a bounded latency.
//! The primary path asks the external text-classification service; on
//! timeout or error a local heuristic answers instead, so classification
//! never blocks a task for longer than the configured budget.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use iris_common::{Difficulty, TaskFile};

/// Keywords that usually mark generative or rigorous work.
const ADVANCED_KEYWORDS: &[&str] = &["code", "proof", "prove", "implement", "algorithm"];

/// Keywords that mark analysis over plain recall.
const COMPLEX_KEYWORDS: &[&str] =
    &["analyse", "analyze", "compare", "summarise", "summarize", "translate", "explain"];

/// Keywords that mark lookups answerable by small models.
const SIMPLE_KEYWORDS: &[&str] = &["define", "what is", "who is", "when did"];

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    difficulty: Difficulty,
}

/// Bounded-latency prompt classifier.
pub struct Classifier {
    http: reqwest::Client,
    endpoint: Option<String>,
    timeout: Duration,
}

impl Classifier {
    /// Create a classifier. `endpoint` is the external service; when `None`
    /// every call takes the heuristic path.
    #[must_use]
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }

    /// Classify a prompt. Never fails and never exceeds the budget.
    pub async fn classify(&self, prompt: &str, files: &[TaskFile]) -> Difficulty {
        if let Some(endpoint) = &self.endpoint {
            match self.classify_external(endpoint, prompt).await {
                Ok(difficulty) => {
                    debug!(%difficulty, "External classifier verdict");
                    return difficulty;
                }
                Err(e) => {
                    warn!(error = %e, "External classifier unavailable, using heuristic");
                }
            }
        }

        heuristic(prompt, files)
    }

    async fn classify_external(
        &self,
        endpoint: &str,
        prompt: &str,
    ) -> Result<Difficulty, reqwest::Error> {
        let response: ClassifyResponse = self
            .http
            .post(endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.difficulty)
    }
}

/// Fallback heuristic over word count, keywords and attachments.
#[must_use]
pub fn heuristic(prompt: &str, files: &[TaskFile]) -> Difficulty {
    let lower = prompt.to_lowercase();
    let words = lower.split_whitespace().count();

    let has = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if has(ADVANCED_KEYWORDS) || words > 150 {
        return Difficulty::Advanced;
    }

    // Attachments push recall questions into analysis territory.
    if has(COMPLEX_KEYWORDS) || !files.is_empty() || words > 40 {
        return Difficulty::Complex;
    }

    if has(SIMPLE_KEYWORDS) || is_yes_no(&lower) || words <= 40 {
        return Difficulty::Simple;
    }

    Difficulty::Complex
}

/// Closed questions ("is ...?", "does ...?") stay simple.
fn is_yes_no(lower: &str) -> bool {
    let starters = ["is ", "are ", "does ", "do ", "can ", "was ", "will "];
    lower.trim_end().ends_with('?') && starters.iter().any(|s| lower.starts_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> TaskFile {
        TaskFile { name: name.into(), content: String::new() }
    }

    #[test]
    fn code_prompts_are_advanced() {
        assert_eq!(heuristic("Write code to sort a list", &[]), Difficulty::Advanced);
        assert_eq!(heuristic("Give a proof of the lemma", &[]), Difficulty::Advanced);
    }

    #[test]
    fn long_prompts_are_advanced() {
        let long = "word ".repeat(200);
        assert_eq!(heuristic(&long, &[]), Difficulty::Advanced);
    }

    #[test]
    fn analysis_keywords_are_complex() {
        assert_eq!(heuristic("Summarise these three paragraphs", &[]), Difficulty::Complex);
        assert_eq!(heuristic("Compare these two plans", &[]), Difficulty::Complex);
    }

    #[test]
    fn attachments_bump_to_complex() {
        assert_eq!(heuristic("Thoughts?", &[file("notes.txt")]), Difficulty::Complex);
    }

    #[test]
    fn yes_no_questions_are_simple() {
        assert_eq!(heuristic("Is 1+1 = 2?", &[]), Difficulty::Simple);
    }

    #[test]
    fn short_lookups_are_simple() {
        assert_eq!(heuristic("Define entropy", &[]), Difficulty::Simple);
    }

    #[tokio::test]
    async fn no_endpoint_falls_back_to_heuristic() {
        let classifier = Classifier::new(None, Duration::from_secs(5));
        assert_eq!(classifier.classify("Define entropy", &[]).await, Difficulty::Simple);
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back_within_budget() {
        // Reserved TEST-NET address: connection fails fast or times out.
        let classifier = Classifier::new(
            Some("http://192.0.2.1:9/classify".into()),
            Duration::from_millis(200),
        );
        let verdict = classifier.classify("Is 1+1 = 2?", &[]).await;
        assert_eq!(verdict, Difficulty::Simple);
    }
}
