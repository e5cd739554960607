//! Remote classification of recipients and attachment text.
//!
//! Each mode has its own tagged verdict type. A reply that does not
//! deserialize into that type is reported as [`ClassifierError::Malformed`]
//! and the caller falls back to the verdict's `Default` (nothing flagged).

use crate::alerts::Finding;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_recipients(
        &self,
        recipients: &[String],
    ) -> Result<RecipientVerdict, ClassifierError>;

    async fn classify_content(&self, text: &str) -> Result<ContentVerdict, ClassifierError>;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecipientVerdict {
    pub is_suspicious: bool,
    #[serde(default)]
    pub findings: Vec<RecipientFinding>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecipientFinding {
    pub email: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentVerdict {
    pub contains_sensitive_data: bool,
    #[serde(default)]
    pub findings: Vec<DataFinding>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataFinding {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
}

// Models sometimes emit card or phone numbers as bare JSON numbers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Number(n) => n.to_string(),
    })
}

impl From<&RecipientFinding> for Finding {
    fn from(f: &RecipientFinding) -> Self {
        Finding::recipient(f.email.clone(), f.reason.clone())
    }
}

impl From<&DataFinding> for Finding {
    fn from(f: &DataFinding) -> Self {
        Finding::data(f.kind.clone(), f.value.clone())
    }
}

impl RecipientVerdict {
    pub fn alert_findings(&self) -> Vec<Finding> {
        self.findings.iter().map(Finding::from).collect()
    }
}

impl ContentVerdict {
    pub fn alert_findings(&self) -> Vec<Finding> {
        self.findings.iter().map(Finding::from).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("reasoning service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("reasoning service returned no text")]
    EmptyResponse,
    #[error("malformed verdict: {0}")]
    Malformed(String),
}

pub const SENSITIVE_CATEGORIES: [&str; 6] = [
    "Email Address",
    "Phone Number",
    "Credit Card Number",
    "API Key",
    "Password",
    "Personal Address",
];

pub fn content_prompt(text: &str) -> String {
    let categories = SENSITIVE_CATEGORIES
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are a security analyst scanning a document for sensitive information. \
Look for these categories: {categories}. \
Respond with a JSON object with a boolean \"contains_sensitive_data\" and a \"findings\" array; \
each finding has a \"type\" (one of the categories) and the \"value\" found. \
If nothing sensitive is present, set \"contains_sensitive_data\" to false and return an empty \"findings\" array. \
Return only the JSON object.\n\nTEXT TO ANALYZE:\n---\n{text}\n---"
    )
}

pub fn recipients_prompt(recipients: &[String]) -> String {
    format!(
        "You are a cybersecurity expert reviewing the recipients of an outgoing business email. \
Flag any address that looks suspicious, for example: \
1. a public or disposable mail service (such as mailinator.com) in a professional context; \
2. a personal address (such as @gmail.com) mixed in with corporate addresses; \
3. a misspelled variant of a common corporate domain (typosquatting); \
4. an address that looks randomly generated. \
Respond with a JSON object with a boolean \"is_suspicious\" and a \"findings\" array; \
each finding has the \"email\" and a short \"reason\". \
If nothing is suspicious, set \"is_suspicious\" to false and return an empty \"findings\" array. \
Return only the JSON object.\n\nRECIPIENT LIST: {}",
        recipients.join(", ")
    )
}

/// Parses model output into a verdict, tolerating a Markdown code fence.
pub fn parse_verdict<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, ClassifierError> {
    let trimmed = raw.trim();
    let body = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
            rest.trim_end().trim_end_matches("```")
        }
        None => trimmed,
    };
    serde_json::from_str(body).map_err(|e| ClassifierError::Malformed(e.to_string()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| p.text.as_deref())
    }
}

/// Gemini `generateContent` client in JSON response mode.
pub struct GeminiClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GeminiClassifier {
    pub fn new(client: reqwest::Client, api_base: &str, model: &str, api_key: String) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/models/{}:generateContent",
                api_base.trim_end_matches('/'),
                model
            ),
            api_key,
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, ClassifierError> {
        let request = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status { status, body });
        }

        let body = response.text().await?;
        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifierError::Malformed(format!("response envelope: {e}")))?;
        parsed
            .first_text()
            .map(str::to_string)
            .ok_or(ClassifierError::EmptyResponse)
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    async fn classify_recipients(
        &self,
        recipients: &[String],
    ) -> Result<RecipientVerdict, ClassifierError> {
        let raw = self.generate(&recipients_prompt(recipients)).await?;
        parse_verdict(&raw)
    }

    async fn classify_content(&self, text: &str) -> Result<ContentVerdict, ClassifierError> {
        let raw = self.generate(&content_prompt(text)).await?;
        parse_verdict(&raw)
    }
}
