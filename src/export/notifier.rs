//! Job lifecycle notifications
//!
//! Delivery is fire-and-forget: a failed notification is logged by the
//! caller and never fails the job.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{ExportError, Result};

use super::job::{ExportItem, ExportStatus};

/// Status change addressed to a job's users
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportNotification {
    pub job_id: String,
    pub file_name: String,
    pub users: Vec<String>,
    pub status: ExportStatus,
    pub error: String,
}

impl ExportNotification {
    /// Snapshot of an item with the given status
    pub fn for_item(item: &ExportItem, status: ExportStatus) -> Self {
        Self {
            job_id: item.id.clone(),
            file_name: item.file_name.clone(),
            users: item.users.clone(),
            status,
            error: item.error.clone(),
        }
    }
}

/// Receiver of job notifications; must not block
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: ExportNotification) -> Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: ExportNotification) -> Result<()> {
        info!(
            job = %notification.job_id,
            status = %notification.status,
            users = ?notification.users,
            "Export {} is {}",
            notification.file_name,
            notification.status
        );
        Ok(())
    }
}

/// Notifier forwarding to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ExportNotification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExportNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: ExportNotification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| ExportError::Generic("notification receiver dropped".to_string()))
    }
}
