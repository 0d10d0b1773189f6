use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use super::CollaboratorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub sender: String,
    pub recipient: String,
    pub recipient_name: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub queue: String,
    pub message: serde_json::Value,
}

#[async_trait]
pub trait Messaging: Send + Sync {
    async fn send_email(&self, email: EmailMessage) -> Result<(), CollaboratorError>;
    async fn enqueue(&self, queue: &str, message: serde_json::Value) -> Result<(), CollaboratorError>;
}

/// Appends outgoing mail and queue messages as JSON lines under a directory:
/// `email.jsonl` and one `queue-{name}.jsonl` per queue.
pub struct OutboxMessaging {
    dir: PathBuf,
    // one writer at a time per outbox
    write_lock: Mutex<()>,
}

impl OutboxMessaging {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<(), CollaboratorError> {
        let line = serde_json::to_string(value)?;
        let _g = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        f.flush().await?;
        Ok(())
    }
}

fn valid_queue_name(queue: &str) -> bool {
    !queue.is_empty() && queue.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl Messaging for OutboxMessaging {
    async fn send_email(&self, email: EmailMessage) -> Result<(), CollaboratorError> {
        if !email.recipient.contains('@') {
            return Err(CollaboratorError::Rejected(format!("invalid recipient address '{}'", email.recipient)));
        }
        self.append_line("email.jsonl", &email).await?;
        info!(recipient = %email.recipient, subject = %email.subject, "email queued in outbox");
        Ok(())
    }

    async fn enqueue(&self, queue: &str, message: serde_json::Value) -> Result<(), CollaboratorError> {
        if !valid_queue_name(queue) {
            return Err(CollaboratorError::InvalidId(queue.to_string()));
        }
        self.append_line(&format!("queue-{queue}.jsonl"), &message).await?;
        info!(queue, "message enqueued");
        Ok(())
    }
}

/// Records everything it is asked to send. Sending mail can be forced to fail.
#[derive(Default)]
pub struct InMemoryMessaging {
    emails: Mutex<Vec<EmailMessage>>,
    queued: Mutex<Vec<QueuedMessage>>,
    fail_sends: Option<String>,
}

impl InMemoryMessaging {
    /// A messaging double whose `send_email` always fails with `reason`.
    pub fn failing_sends(reason: impl Into<String>) -> Self {
        Self {
            fail_sends: Some(reason.into()),
            ..Self::default()
        }
    }

    pub async fn sent_emails(&self) -> Vec<EmailMessage> {
        self.emails.lock().await.clone()
    }

    pub async fn queued(&self, queue: &str) -> Vec<serde_json::Value> {
        self.queued
            .lock()
            .await
            .iter()
            .filter(|m| m.queue == queue)
            .map(|m| m.message.clone())
            .collect()
    }
}

#[async_trait]
impl Messaging for InMemoryMessaging {
    async fn send_email(&self, email: EmailMessage) -> Result<(), CollaboratorError> {
        if let Some(reason) = &self.fail_sends {
            return Err(CollaboratorError::Rejected(reason.clone()));
        }
        self.emails.lock().await.push(email);
        Ok(())
    }

    async fn enqueue(&self, queue: &str, message: serde_json::Value) -> Result<(), CollaboratorError> {
        self.queued.lock().await.push(QueuedMessage {
            queue: queue.to_string(),
            message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email(to: &str) -> EmailMessage {
        EmailMessage {
            sender: "claims@example.com".into(),
            recipient: to.into(),
            recipient_name: "Jane".into(),
            subject: "Your claim".into(),
            html: "<p>hi</p>".into(),
        }
    }

    #[tokio::test]
    async fn outbox_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = OutboxMessaging::new(dir.path());
        outbox.send_email(email("jane@example.com")).await.unwrap();
        outbox.send_email(email("joe@example.com")).await.unwrap();
        outbox.enqueue("manual-review", json!({"claimId": "C-1"})).await.unwrap();

        let mail = std::fs::read_to_string(dir.path().join("email.jsonl")).unwrap();
        let lines: Vec<EmailMessage> = mail.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].recipient, "joe@example.com");
        let q = std::fs::read_to_string(dir.path().join("queue-manual-review.jsonl")).unwrap();
        assert!(q.contains("C-1"));
    }

    #[tokio::test]
    async fn outbox_rejects_bad_recipient_and_queue_names() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = OutboxMessaging::new(dir.path());
        assert!(matches!(
            outbox.send_email(email("nobody")).await,
            Err(CollaboratorError::Rejected(_))
        ));
        assert!(matches!(
            outbox.enqueue("../x", json!({})).await,
            Err(CollaboratorError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_failing_sends_still_enqueue() {
        let m = InMemoryMessaging::failing_sends("smtp down");
        assert!(m.send_email(email("jane@example.com")).await.is_err());
        m.enqueue("adjuster-notifications", json!(1)).await.unwrap();
        assert!(m.sent_emails().await.is_empty());
        assert_eq!(m.queued("adjuster-notifications").await, vec![json!(1)]);
    }
}
