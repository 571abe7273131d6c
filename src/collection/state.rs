use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Lifecycle of a handle's backend subscription.
///
/// `Live` means a persistent listener is attached; `Resolved` means the
/// handle holds last-known data with no open backend resource. `Disposed`
/// is terminal: the listener is detached and no further callbacks are
/// accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Idle,
    Attaching,
    Live,
    Resolved,
    Disposed,
}

impl SubscriptionPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionPhase::Live)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, SubscriptionPhase::Disposed)
    }
}

/// A decoded record together with its backend-assigned identity.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentRecord<T> {
    pub id: String,
    pub data: T,
}

impl<T> DocumentRecord<T> {
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// One record-level difference between two committed snapshots.
///
/// For `Removed` changes the record is the last committed value.
#[derive(Clone, Debug)]
pub struct DocumentChange<T> {
    pub change_type: ChangeType,
    pub id: String,
    pub record: T,
}

/// The outcome of one committed snapshot: the new record array plus the
/// changes relative to the previous commit.
#[derive(Clone, Debug)]
pub struct ChangeSet<T> {
    pub records: Arc<Vec<DocumentRecord<T>>>,
    pub changes: Vec<DocumentChange<T>>,
    pub at: DateTime<Utc>,
}

impl<T> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn added(&self) -> impl Iterator<Item = &DocumentChange<T>> {
        self.of_type(ChangeType::Added)
    }

    pub fn modified(&self) -> impl Iterator<Item = &DocumentChange<T>> {
        self.of_type(ChangeType::Modified)
    }

    pub fn removed(&self) -> impl Iterator<Item = &DocumentChange<T>> {
        self.of_type(ChangeType::Removed)
    }

    fn of_type(&self, change_type: ChangeType) -> impl Iterator<Item = &DocumentChange<T>> {
        self.changes
            .iter()
            .filter(move |change| change.change_type == change_type)
    }
}
