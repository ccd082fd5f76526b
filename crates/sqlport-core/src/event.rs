//! Mutation notifications

use rusqlite::hooks::Action;
use serde::{Deserialize, Serialize};

/// Kind of row mutation reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Map an engine hook action; unknown actions are not reported
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::SQLITE_INSERT => Some(ChangeKind::Insert),
            Action::SQLITE_UPDATE => Some(ChangeKind::Update),
            Action::SQLITE_DELETE => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    /// SQLite's numeric action code
    pub fn code(self) -> i32 {
        match self {
            ChangeKind::Delete => 9,
            ChangeKind::Insert => 18,
            ChangeKind::Update => 23,
        }
    }
}

/// A committed row mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change_kind: ChangeKind,
    pub database_name: Option<String>,
    pub table_name: Option<String>,
    pub row_id: i64,
}

impl ChangeEvent {
    pub(crate) fn from_hook(kind: ChangeKind, db_name: &str, table_name: &str, row_id: i64) -> Self {
        Self {
            change_kind: kind,
            database_name: non_empty(db_name),
            table_name: non_empty(table_name),
            row_id,
        }
    }

    /// Whether this event touched the given table
    pub fn is_table(&self, table: &str) -> bool {
        self.table_name.as_deref() == Some(table)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// What a subscriber observes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A row mutation committed on the subscribed handle
    Change(ChangeEvent),
    /// The backing storage was dropped and recreated
    Reset,
}

impl Notification {
    pub fn as_change(&self) -> Option<&ChangeEvent> {
        match self {
            Notification::Change(event) => Some(event),
            Notification::Reset => None,
        }
    }
}
