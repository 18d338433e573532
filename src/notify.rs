use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Driver,
    Customer,
}

/// Fire-and-forget push boundary. Delivery is best-effort: implementations
/// log failures and never surface them to the calling operation.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: Recipient, recipient_id: Uuid, event: &str, payload: Value);
}

/// Default notifier: emits a structured log line per notification.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipient: Recipient, recipient_id: Uuid, event: &str, payload: Value) {
        info!(
            recipient = ?recipient,
            recipient_id = %recipient_id,
            event,
            payload = %payload,
            "notification dispatched"
        );
    }
}

/// Captures notifications for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Recipient, Uuid, String)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, recipient: Recipient, recipient_id: Uuid, event: &str, _payload: Value) {
        self.sent
            .lock()
            .expect("notifier lock poisoned")
            .push((recipient, recipient_id, event.to_string()));
    }
}
