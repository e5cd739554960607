pub mod gmail;
pub mod oauth;

use async_trait::async_trait;
use regex::Regex;

pub use gmail::GmailMailbox;
pub use oauth::{InstalledAppCredentials, TokenProvider};

pub const DEFAULT_SUBJECT: &str = "No Subject Found";

/// The latest sent message, as seen by one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSnapshot {
    pub subject: String,
    /// Deduplicated, in first-seen order.
    pub recipients: Vec<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Returns the most recent sent message, or `None` when the folder is empty.
    async fn fetch_latest_sent(&self) -> Result<Option<MessageSnapshot>, MailboxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mailbox API returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("failed to decode attachment {filename}: {reason}")]
    Decode { filename: String, reason: String },
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pulls addresses out of `To`/`Cc`/`Bcc` header values.
#[derive(Debug, Clone)]
pub struct RecipientExtractor {
    address: Regex,
}

impl Default for RecipientExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipientExtractor {
    const RECIPIENT_HEADERS: [&'static str; 3] = ["To", "Cc", "Bcc"];

    pub fn new() -> Self {
        Self {
            address: Regex::new(r"[\w.\-]+@[\w.\-]+").unwrap(),
        }
    }

    pub fn is_recipient_header(name: &str) -> bool {
        Self::RECIPIENT_HEADERS
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    }

    /// Appends every address found in `value` that is not already in `out`.
    pub fn collect(&self, value: &str, out: &mut Vec<String>) {
        for m in self.address.find_iter(value) {
            let address = m.as_str();
            if !out.iter().any(|existing| existing == address) {
                out.push(address.to_string());
            }
        }
    }
}
