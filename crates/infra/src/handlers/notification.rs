use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use scribe_core::UserId;

use crate::jobs::{Job, JobFailure, JobHandler, ResultPointer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: UserId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The recipient cannot be reached at all (unsubscribed, no channel).
    #[error("recipient rejected: {0}")]
    Rejected(String),
}

/// Delivery channel (email, push, webhook).
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(user_id = %notification.user_id, message = %notification.message, "notification delivered");
        Ok(())
    }
}

pub struct NotificationHandler {
    notifier: Arc<dyn Notifier>,
}

impl NotificationHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
        let notification: Notification = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobFailure::permanent(format!("malformed notification payload: {e}")))?;

        self.notifier.notify(&notification).await.map_err(|e| match e {
            NotifyError::Delivery(_) => JobFailure::retryable(e.to_string()),
            NotifyError::Rejected(_) => JobFailure::permanent(e.to_string()),
        })?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::jobs::{FailureKind, QueueName};

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Notification>>,
        fail_with: Option<NotifyError>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn job(payload: serde_json::Value) -> Job {
        Job::new(QueueName::Notification, payload, 5)
    }

    #[tokio::test]
    async fn delivers_payload_to_notifier() {
        let notifier = Arc::new(Recording::default());
        let handler = NotificationHandler::new(notifier.clone());
        let user = UserId::new();

        let out = handler
            .handle(&job(serde_json::json!({"userId": user, "message": "hello"})))
            .await
            .unwrap();

        assert_eq!(out, None);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), [Notification { user_id: user, message: "hello".into() }]);
    }

    #[tokio::test]
    async fn delivery_errors_retry_and_rejections_do_not() {
        let payload = serde_json::json!({"userId": UserId::new(), "message": "hi"});
        for (err, expected) in [
            (NotifyError::Delivery("smtp timeout".into()), FailureKind::Retryable),
            (NotifyError::Rejected("unsubscribed".into()), FailureKind::Permanent),
        ] {
            let handler = NotificationHandler::new(Arc::new(Recording {
                fail_with: Some(err),
                ..Default::default()
            }));
            let failure = handler.handle(&job(payload.clone())).await.unwrap_err();
            assert_eq!(failure.kind, expected);
        }
    }

    #[tokio::test]
    async fn payload_without_recipient_is_permanent() {
        let handler = NotificationHandler::new(Arc::new(LogNotifier));
        let failure = handler.handle(&job(serde_json::json!({"message": "hi"}))).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }
}
