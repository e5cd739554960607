//! Background loop that watches the sent folder and feeds the alert store.
//!
//! Each adapter call runs in its own task so an error or panic inside one
//! call only costs that call's result; the loop itself never exits.

use crate::alerts::{AlertRecord, AlertStore};
use crate::classifier::Classifier;
use crate::extract::ContentExtractor;
use crate::mailbox::{Attachment, Mailbox, MessageSnapshot};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

/// Subject of the last message that was processed.
///
/// Subject equality is the only identity signal: two different messages with
/// the same subject in a row are treated as one, and a message replaced by a
/// newer one within a single interval is never seen.
#[derive(Debug, Clone, Default)]
pub struct DedupCursor {
    last_subject: Option<String>,
}

impl DedupCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `subject` and returns true if it differs from the previous one.
    pub fn advance(&mut self, subject: &str) -> bool {
        if self.last_subject.as_deref() == Some(subject) {
            return false;
        }
        self.last_subject = Some(subject.to_string());
        true
    }

    pub fn last_subject(&self) -> Option<&str> {
        self.last_subject.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NoMessage,
    MailboxUnavailable,
    Duplicate,
    Processed { alerts_raised: usize },
}

pub struct Poller {
    mailbox: Arc<dyn Mailbox>,
    extractor: Arc<dyn ContentExtractor>,
    classifier: Arc<dyn Classifier>,
    store: AlertStore,
    interval: Duration,
    cursor: DedupCursor,
}

async fn isolated<F>(future: F) -> Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future).await
}

impl Poller {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        extractor: Arc<dyn ContentExtractor>,
        classifier: Arc<dyn Classifier>,
        store: AlertStore,
        interval: Duration,
    ) -> Self {
        Self {
            mailbox,
            extractor,
            classifier,
            store,
            interval,
            cursor: DedupCursor::new(),
        }
    }

    pub fn cursor(&self) -> &DedupCursor {
        &self.cursor
    }

    /// Starts the loop on the runtime. The task lives until the runtime shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        log::info!(
            "Poller started, checking sent mail every {}s",
            self.interval.as_secs()
        );
        loop {
            let outcome = self.poll_once().await;
            log::debug!("Poll cycle finished: {outcome:?}");
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One fetch / dedup / classify pass. Never fails; every adapter error
    /// is logged and treated as "nothing found".
    pub async fn poll_once(&mut self) -> CycleOutcome {
        let message = match self.fetch().await {
            Some(Some(message)) => message,
            Some(None) => return CycleOutcome::NoMessage,
            None => return CycleOutcome::MailboxUnavailable,
        };

        if !self.cursor.advance(&message.subject) {
            log::debug!("Already processed '{}', skipping", message.subject);
            return CycleOutcome::Duplicate;
        }
        log::info!("Found new sent message: '{}'", message.subject);

        let MessageSnapshot {
            subject,
            recipients,
            attachments,
        } = message;

        let mut alerts_raised = 0;
        if !recipients.is_empty() && self.check_recipients(&subject, recipients).await {
            alerts_raised += 1;
        }
        for attachment in attachments {
            if self.check_attachment(&subject, attachment).await {
                alerts_raised += 1;
            }
        }

        CycleOutcome::Processed { alerts_raised }
    }

    async fn fetch(&self) -> Option<Option<MessageSnapshot>> {
        let mailbox = Arc::clone(&self.mailbox);
        match isolated(async move { mailbox.fetch_latest_sent().await }).await {
            Ok(Ok(message)) => Some(message),
            Ok(Err(e)) => {
                log::warn!("Failed to fetch latest sent message: {e}");
                None
            }
            Err(e) => {
                log::error!("Mailbox adapter panicked: {e}");
                None
            }
        }
    }

    async fn check_recipients(&self, subject: &str, recipients: Vec<String>) -> bool {
        let classifier = Arc::clone(&self.classifier);
        let verdict =
            match isolated(async move { classifier.classify_recipients(&recipients).await }).await
            {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(e)) => {
                    log::warn!("Recipient classification failed for '{subject}': {e}");
                    Default::default()
                }
                Err(e) => {
                    log::error!("Recipient classifier panicked for '{subject}': {e}");
                    Default::default()
                }
            };

        if !verdict.is_suspicious {
            return false;
        }
        log::info!(
            "Suspicious recipients on '{subject}': {} finding(s)",
            verdict.findings.len()
        );
        self.store
            .insert_front(AlertRecord::recipient(subject, verdict.alert_findings()));
        true
    }

    async fn check_attachment(&self, subject: &str, attachment: Attachment) -> bool {
        let Attachment { filename, data } = attachment;

        let extractor = Arc::clone(&self.extractor);
        let name = filename.clone();
        let text = match tokio::task::spawn_blocking(move || extractor.extract(&name, &data)).await
        {
            Ok(Some(text)) => text,
            Ok(None) => {
                log::debug!("No readable text in '{filename}', skipping");
                return false;
            }
            Err(e) => {
                log::error!("Extractor panicked on '{filename}': {e}");
                return false;
            }
        };

        let classifier = Arc::clone(&self.classifier);
        let verdict = match isolated(async move { classifier.classify_content(&text).await }).await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                log::warn!("Content classification failed for '{filename}': {e}");
                Default::default()
            }
            Err(e) => {
                log::error!("Content classifier panicked on '{filename}': {e}");
                Default::default()
            }
        };

        if !verdict.contains_sensitive_data {
            return false;
        }
        log::info!(
            "Sensitive data in '{filename}' on '{subject}': {} finding(s)",
            verdict.findings.len()
        );
        self.store.insert_front(AlertRecord::data(
            subject,
            filename,
            verdict.alert_findings(),
        ));
        true
    }
}
