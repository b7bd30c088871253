//! Export job items and the codes returned by queue operations

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::source::SourceTarget;
use super::transform::CsvParams;

/// Additional source filters attached to a job (field path to value)
pub type ExtraParams = BTreeMap<String, String>;

/// Lifecycle state of an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    /// Waiting in the queue
    Pending,
    /// Assigned to a worker
    Running,
    /// Output fully written
    Done,
    /// Failed; see the item's error message
    Error,
    /// Stopped at the request of its last owner
    Canceled,
}

impl ExportStatus {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportStatus::Done | ExportStatus::Error | ExportStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Running => "running",
            ExportStatus::Done => "done",
            ExportStatus::Error => "error",
            ExportStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a named fact (a stored data set)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRef {
    pub id: i64,
    pub name: String,
}

impl FactRef {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Raw query export against named indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomQuery {
    pub indices: Vec<String>,
    pub requests: Vec<Value>,
    pub connection: String,
}

/// What a job exports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPayload {
    Facts(Vec<FactRef>),
    Custom(CustomQuery),
}

impl ExportPayload {
    /// Whether two payloads describe the same export
    ///
    /// Facts compare as sets of ids. Custom queries compare by index set and
    /// the ordered request list; the connection name is not part of the key.
    pub fn matches(&self, other: &ExportPayload) -> bool {
        match (self, other) {
            (ExportPayload::Facts(a), ExportPayload::Facts(b)) => {
                let a: BTreeSet<i64> = a.iter().map(|f| f.id).collect();
                let b: BTreeSet<i64> = b.iter().map(|f| f.id).collect();
                a == b
            }
            (ExportPayload::Custom(a), ExportPayload::Custom(b)) => {
                let ai: BTreeSet<&String> = a.indices.iter().collect();
                let bi: BTreeSet<&String> = b.indices.iter().collect();
                ai == bi && a.requests == b.requests
            }
            _ => false,
        }
    }

    /// Source targets in iteration order
    pub fn targets(&self) -> Vec<SourceTarget> {
        match self {
            ExportPayload::Facts(facts) => facts.iter().cloned().map(SourceTarget::Fact).collect(),
            ExportPayload::Custom(query) => {
                let requests = if query.requests.is_empty() {
                    vec![Value::Object(Default::default())]
                } else {
                    query.requests.clone()
                };
                requests
                    .into_iter()
                    .map(|request| SourceTarget::Custom {
                        indices: query.indices.clone(),
                        request,
                        connection: query.connection.clone(),
                    })
                    .collect()
            }
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, ExportPayload::Custom(_))
    }
}

/// One export request, shared by every user who asked for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportItem {
    pub id: String,
    pub file_name: String,
    pub params: CsvParams,
    pub date: DateTime<Utc>,
    pub status: ExportStatus,
    /// Failure message, empty unless `status` is `Error`
    pub error: String,
    pub users: Vec<String>,
    pub payload: ExportPayload,
    #[serde(default)]
    pub extra: ExtraParams,
    /// Send lifecycle notifications to the users
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub size_bytes: u64,
}

impl ExportItem {
    /// Create a pending job owned by `user`
    ///
    /// `file_name` is expected to be normalized already.
    pub fn new(
        payload: ExportPayload,
        file_name: String,
        params: CsvParams,
        user: &str,
        extra: ExtraParams,
        notify: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name,
            params,
            date: Utc::now(),
            status: ExportStatus::Pending,
            error: String::new(),
            users: vec![user.to_string()],
            payload,
            extra,
            notify,
            rows: 0,
            size_bytes: 0,
        }
    }

    /// Same payload, output name and CSV parameters
    pub fn is_same_job(&self, payload: &ExportPayload, file_name: &str, params: &CsvParams) -> bool {
        self.file_name == file_name && self.params == *params && self.payload.matches(payload)
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.users.iter().any(|u| u == user)
    }

    /// Add an owner; false if already present
    pub fn add_user(&mut self, user: &str) -> bool {
        if self.has_user(user) {
            return false;
        }
        self.users.push(user.to_string());
        true
    }

    /// Remove an owner unless it is the last one
    ///
    /// Returns false when `user` is not an owner or is the only owner; the
    /// caller deletes or cancels the item in the latter case.
    pub fn remove_shared_user(&mut self, user: &str) -> bool {
        if self.users.len() < 2 {
            return false;
        }
        let before = self.users.len();
        self.users.retain(|u| u != user);
        self.users.len() != before
    }

    /// Whether `user` is the only owner
    pub fn is_sole_owner(&self, user: &str) -> bool {
        self.users.len() == 1 && self.users[0] == user
    }
}

/// Build the on-disk file name for an export title
///
/// Path separators become `_`, and any `.csv` / `.csv.gz` suffix is replaced
/// with the one matching the compression setting.
pub fn normalize_file_name(title: &str, compressed: bool) -> String {
    let mut base: String = title
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    for suffix in [".csv.gz", ".csv"] {
        if let Some(stripped) = base.strip_suffix(suffix) {
            base = stripped.to_string();
            break;
        }
    }
    if base.is_empty() || base.chars().all(|c| c == '.') {
        base = "export".to_string();
    }
    if compressed {
        format!("{base}.csv.gz")
    } else {
        format!("{base}.csv")
    }
}

/// Result of submitting an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddCode {
    /// A new job was queued
    Added,
    /// The user joined an identical queued job
    UserAdded,
    /// The user already owns an identical queued job
    UserExists,
    /// No room for another distinct job
    QueueFull,
}

/// Result of deleting an export on behalf of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeleteCode {
    /// The job was removed entirely
    Deleted,
    /// Only the user's ownership was removed
    UserDeleted,
    /// The running job was asked to stop
    Canceled,
    /// No live job with that id is owned by the user
    NotFound,
}
