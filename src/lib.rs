pub mod alerts;
pub mod classifier;
pub mod config;
pub mod dashboard;
pub mod extract;
pub mod mailbox;
pub mod poller;

pub use alerts::{AlertKind, AlertRecord, AlertStore, Finding};
pub use classifier::{Classifier, ContentVerdict, GeminiClassifier, RecipientVerdict};
pub use config::Config;
pub use extract::{ContentExtractor, FormatExtractor};
pub use mailbox::{Attachment, GmailMailbox, Mailbox, MessageSnapshot};
pub use poller::{CycleOutcome, DedupCursor, Poller};
