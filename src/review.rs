//! Code review collaborator backed by a hosted chat-completions model.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ReviewConfig;

const SYSTEM_PROMPT: &str = "You are a code compiler. Return raw JSON.";

const BRANCHING_KEYWORDS: &[&str] = &[
    "if", "else", "elif", "for", "while", "switch", "case", "catch", "?", "&&", "||", "and", "or",
    "except", "with",
];

/// Explanation style requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    #[default]
    Standard,
    Beginner,
    Pro,
}

/// Scores as the model reports them. Numbers in strings are accepted,
/// anything else unreadable becomes `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityScore {
    #[serde(deserialize_with = "lenient_number")]
    pub maintainability: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub security: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub overall: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    pub severity: String,
    #[serde(deserialize_with = "lenient_line")]
    pub line: Option<u32>,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub fix: String,
}

/// Review of one submission. Missing fields from the model default to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewResult {
    pub summary: String,
    pub quality_score: QualityScore,
    pub issues: Vec<Issue>,
    pub rewritten_code: String,
    pub dry_run: String,
    pub teacher_tips: Vec<String>,
    pub complexity_score: u32,
}

impl ReviewResult {
    /// Result returned when the model could not be reached or understood.
    pub fn unavailable(code: &str, reason: &ReviewError) -> Self {
        Self {
            summary: format!("Error: {reason}"),
            quality_score: QualityScore {
                overall: Some(0.0),
                ..QualityScore::default()
            },
            rewritten_code: code.to_string(),
            dry_run: "AI unavailable.".to_string(),
            complexity_score: complexity_score(code),
            ..Self::default()
        }
    }
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_line<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("GROQ_API_KEY is not set")]
    MissingKey,
    #[error("review request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("review API returned status {0}")]
    Status(u16),
    #[error("review response not understood: {0}")]
    Malformed(String),
}

/// Reviews source code. Never fails: errors become a fallback result.
#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn review(&self, code: &str, language: &str, mode: ReviewMode) -> ReviewResult;
}

/// 1 + the number of whitespace separated branching keywords.
pub fn complexity_score(code: &str) -> u32 {
    let branches = code
        .split_whitespace()
        .filter(|word| BRANCHING_KEYWORDS.contains(word))
        .count();
    1 + u32::try_from(branches).unwrap_or(u32::MAX - 1)
}

fn user_prompt(code: &str, language: &str, mode: ReviewMode) -> String {
    let mode = serde_json::to_value(mode)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default();
    format!(
        "Analyze this {language} code. Mode: {mode}. \
         Return strictly valid JSON. Double quotes only. \
         Structure: {{\"summary\": \"Brief overview\", \
         \"quality_score\": {{\"maintainability\": 0-100, \"security\": 0-100, \"overall\": 0-100}}, \
         \"issues\": [{{\"severity\": \"Critical|High|Medium|Low\", \"line\": 1, \"type\": \"Bug|Security\", \
         \"message\": \"Short description\", \"fix\": \"Hint for teaching mode\"}}], \
         \"rewritten_code\": \"Optimized code. Use \\n for newlines.\", \
         \"dry_run\": \"Step-by-step logic explanation. Use \\n for newlines.\", \
         \"teacher_tips\": [\"Concept 1\", \"Concept 2\"]}}\n\n{code}"
    )
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Groq's OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct GroqReviewService {
    http: reqwest::Client,
    config: ReviewConfig,
}

impl GroqReviewService {
    pub fn new(config: ReviewConfig) -> Result<Self, ReviewError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    async fn request(
        &self,
        code: &str,
        language: &str,
        mode: ReviewMode,
    ) -> Result<ReviewResult, ReviewError> {
        let api_key = self.config.api_key.as_deref().ok_or(ReviewError::MissingKey)?;
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "temperature": 0.1,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(code, language, mode)},
            ],
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReviewError::Status(status.as_u16()));
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ReviewError::Malformed("empty completion".into()))?;
        serde_json::from_str(&content).map_err(|e| ReviewError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ReviewService for GroqReviewService {
    async fn review(&self, code: &str, language: &str, mode: ReviewMode) -> ReviewResult {
        debug!(language, ?mode, bytes = code.len(), "Review requested");
        let mut result = match self.request(code, language, mode).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Review unavailable");
                return ReviewResult::unavailable(code, &e);
            }
        };
        result.complexity_score = complexity_score(code);
        result
    }
}
