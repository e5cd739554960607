use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// One or more recipients look suspicious.
    Recipient,
    /// An attachment contains sensitive data.
    Data,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::Recipient => write!(f, "Recipient"),
            AlertKind::Data => write!(f, "Data"),
        }
    }
}

/// A single detected item, kept as ordered attribute pairs
/// (`email`/`reason` for recipients, `type`/`value` for data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    fields: Vec<(String, String)>,
}

impl Finding {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn recipient(email: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::from_pairs([("email", email.into()), ("reason", reason.into())])
    }

    pub fn data(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_pairs([("type", kind.into()), ("value", value.into())])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    kind: AlertKind,
    subject: String,
    filename: Option<String>,
    findings: Vec<Finding>,
    detected_at: DateTime<Utc>,
}

impl AlertRecord {
    pub fn recipient(subject: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            kind: AlertKind::Recipient,
            subject: subject.into(),
            filename: None,
            findings,
            detected_at: Utc::now(),
        }
    }

    pub fn data(
        subject: impl Into<String>,
        filename: impl Into<String>,
        findings: Vec<Finding>,
    ) -> Self {
        Self {
            kind: AlertKind::Data,
            subject: subject.into(),
            filename: Some(filename.into()),
            findings,
            detected_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> AlertKind {
        self.kind
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Present only for `Data` alerts.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }
}

/// Newest-first collection of alerts shared between the poller and the dashboard.
///
/// Records are wrapped in `Arc` once inserted, so a snapshot copies pointers
/// rather than findings and is still fully independent of later inserts.
/// Nothing is ever removed or reordered.
#[derive(Debug, Clone, Default)]
pub struct AlertStore {
    inner: Arc<Mutex<VecDeque<Arc<AlertRecord>>>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_front(&self, record: AlertRecord) {
        let record = Arc::new(record);
        self.lock().push_front(record);
    }

    /// Point-in-time copy of every record, newest first.
    pub fn snapshot(&self) -> Vec<Arc<AlertRecord>> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while the guard is held cannot leave a half-inserted record,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<AlertRecord>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_snapshot_is_newest_first() {
        let store = AlertStore::new();
        for i in 0..5 {
            store.insert_front(AlertRecord::recipient(
                format!("subject {i}"),
                vec![Finding::recipient("x@mailinator.com", "disposable")],
            ));
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 5);
        let subjects: Vec<&str> = snapshot.iter().map(|r| r.subject()).collect();
        assert_eq!(
            subjects,
            vec!["subject 4", "subject 3", "subject 2", "subject 1", "subject 0"]
        );
    }

    #[test]
    fn test_snapshot_is_independent_of_later_inserts() {
        let store = AlertStore::new();
        store.insert_front(AlertRecord::data("Q1", "a.txt", vec![]));
        let before = store.snapshot();

        store.insert_front(AlertRecord::data("Q2", "b.txt", vec![]));
        assert_eq!(before.len(), 1);
        assert_eq!(store.len(), 2);

        let after = store.snapshot();
        // Older snapshot is a suffix of the newer one.
        assert!(Arc::ptr_eq(&before[0], &after[1]));
    }

    #[test]
    fn test_record_constructors() {
        let recipient = AlertRecord::recipient("hello", vec![]);
        assert_eq!(recipient.kind(), AlertKind::Recipient);
        assert_eq!(recipient.filename(), None);

        let data = AlertRecord::data(
            "hello",
            "report.pdf",
            vec![Finding::data("Credit Card Number", "4111 1111 1111 1111")],
        );
        assert_eq!(data.kind(), AlertKind::Data);
        assert_eq!(data.filename(), Some("report.pdf"));
        assert_eq!(data.findings()[0].get("type"), Some("Credit Card Number"));
        assert_eq!(data.findings()[0].get("email"), None);
    }

    #[test]
    fn test_concurrent_readers_see_monotonic_prefixes() {
        let store = AlertStore::new();
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    store.insert_front(AlertRecord::recipient(
                        i.to_string(),
                        vec![Finding::recipient("a@b.c", "r")],
                    ));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut last_len = 0;
                    for _ in 0..200 {
                        let snapshot = store.snapshot();
                        assert!(snapshot.len() >= last_len);
                        last_len = snapshot.len();
                        // Reverse insertion order: subjects count down to 0.
                        for (pos, record) in snapshot.iter().rev().enumerate() {
                            assert_eq!(record.subject(), pos.to_string());
                            assert_eq!(record.findings().len(), 1);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.len(), 500);
    }
}
