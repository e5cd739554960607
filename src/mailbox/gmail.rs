use super::oauth::TokenProvider;
use super::{Attachment, Mailbox, MailboxError, MessageSnapshot, RecipientExtractor, DEFAULT_SUBJECT};
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

/// Gmail serves URL-safe base64 and is inconsistent about padding.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    data: Option<String>,
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    data: String,
}

/// Reads the authenticated user's SENT label through the Gmail REST API.
pub struct GmailMailbox {
    client: reqwest::Client,
    api_base: String,
    tokens: Arc<dyn TokenProvider>,
    recipients: RecipientExtractor,
}

impl GmailMailbox {
    pub fn new(client: reqwest::Client, api_base: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            tokens,
            recipients: RecipientExtractor::new(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, MailboxError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .query(query)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailboxError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    /// Collects every named part below `part`. A part that cannot be fetched
    /// or decoded is logged and left out; the rest of the message still counts.
    async fn collect_attachments(&self, message_id: &str, part: &MessagePart) -> Vec<Attachment> {
        let mut out = Vec::new();
        // Depth-first walk; nested multiparts hold the attachments of forwarded
        // and HTML messages.
        let mut stack = vec![part];
        while let Some(part) = stack.pop() {
            stack.extend(part.parts.iter().rev());
            if part.filename.is_empty() {
                continue;
            }
            match self.attachment_data(message_id, part).await {
                Ok(Some(data)) => out.push(Attachment {
                    filename: part.filename.clone(),
                    data,
                }),
                Ok(None) => log::debug!("Attachment {} has no body, skipping", part.filename),
                Err(e) => log::warn!("Skipping attachment {}: {e}", part.filename),
            }
        }
        out
    }

    async fn attachment_data(
        &self,
        message_id: &str,
        part: &MessagePart,
    ) -> Result<Option<Vec<u8>>, MailboxError> {
        let encoded = match (&part.body.data, &part.body.attachment_id) {
            (Some(data), _) => data.clone(),
            (None, Some(attachment_id)) => {
                let body: AttachmentBody = self
                    .get_json(
                        &format!("/messages/{message_id}/attachments/{attachment_id}"),
                        &[],
                    )
                    .await?;
                body.data
            }
            (None, None) => return Ok(None),
        };
        let data = decode_body(&encoded).map_err(|reason| MailboxError::Decode {
            filename: part.filename.clone(),
            reason,
        })?;
        Ok(Some(data))
    }

    fn snapshot_headers(&self, headers: &[Header]) -> (String, Vec<String>) {
        let mut subject = DEFAULT_SUBJECT.to_string();
        let mut recipients = Vec::new();
        for header in headers {
            if header.name.eq_ignore_ascii_case("Subject") {
                subject = header.value.clone();
            }
            if RecipientExtractor::is_recipient_header(&header.name) {
                self.recipients.collect(&header.value, &mut recipients);
            }
        }
        (subject, recipients)
    }
}

pub fn decode_body(encoded: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    GMAIL_BASE64.decode(cleaned).map_err(|e| e.to_string())
}

#[async_trait]
impl Mailbox for GmailMailbox {
    async fn fetch_latest_sent(&self) -> Result<Option<MessageSnapshot>, MailboxError> {
        let list: MessageList = self
            .get_json("/messages", &[("labelIds", "SENT"), ("maxResults", "1")])
            .await?;
        let Some(latest) = list.messages.first() else {
            return Ok(None);
        };

        let message: Message = self
            .get_json(&format!("/messages/{}", latest.id), &[("format", "full")])
            .await?;

        let (subject, recipients) = self.snapshot_headers(&message.payload.headers);
        let attachments = self.collect_attachments(&latest.id, &message.payload).await;

        log::debug!(
            "Fetched sent message {} ({} recipients, {} attachments)",
            latest.id,
            recipients.len(),
            attachments.len()
        );

        Ok(Some(MessageSnapshot {
            subject,
            recipients,
            attachments,
        }))
    }
}
