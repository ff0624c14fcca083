//! Overlay of pending local mutations on top of a remote snapshot.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::{
    mutation::{Action, PendingMutation},
    remote::RemoteDocument,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "action", rename_all = "snake_case")]
pub enum RecordSource {
    Remote,
    Pending(Action),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergedRecord {
    pub id: String,
    pub body: Value,
    pub source: RecordSource,
    pub remote_key: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    /// The pending payload replaced the remote copy.
    LocalWins,
    /// The remote copy was edited after the local change was queued and was kept.
    ConflictStale,
    /// A pending delete hid the remote copy.
    Masked,
    /// A pending write with no remote counterpart was added.
    Appended,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergeTrace {
    pub id: String,
    pub decision: MergeDecision,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MergedView {
    pub records: Vec<MergedRecord>,
    pub trace: Vec<MergeTrace>,
}

impl MergedView {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&MergedRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn stale_count(&self) -> usize {
        self.trace
            .iter()
            .filter(|t| t.decision == MergeDecision::ConflictStale)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Merge one collection's remote snapshot with that collection's pending entries.
///
/// Remote order is preserved; pending writes with no remote counterpart follow in
/// queue order. A pending delete always removes the record from the result.
pub fn merge_view(remote: &[RemoteDocument], pending: &[PendingMutation]) -> MergedView {
    let mut by_id: HashMap<&str, &PendingMutation> =
        pending.iter().map(|m| (m.id.as_str(), m)).collect();
    let mut view = MergedView::default();

    for doc in remote {
        let Some(m) = by_id.remove(doc.local_id.as_str()) else {
            view.records.push(MergedRecord {
                id: doc.local_id.clone(),
                body: doc.body.clone(),
                source: RecordSource::Remote,
                remote_key: Some(doc.remote_key.clone()),
            });
            continue;
        };

        if m.action == Action::Delete {
            view.trace.push(MergeTrace {
                id: m.id.clone(),
                decision: MergeDecision::Masked,
            });
            continue;
        }

        let remote_newer = doc.updated_at.is_some_and(|at| at > m.enqueued_at);
        match (&m.payload, remote_newer) {
            (Some(payload), false) => {
                view.records.push(MergedRecord {
                    id: m.id.clone(),
                    body: payload.clone(),
                    source: RecordSource::Pending(m.action),
                    remote_key: Some(doc.remote_key.clone()),
                });
                view.trace.push(MergeTrace {
                    id: m.id.clone(),
                    decision: MergeDecision::LocalWins,
                });
            }
            _ => {
                view.records.push(MergedRecord {
                    id: doc.local_id.clone(),
                    body: doc.body.clone(),
                    source: RecordSource::Remote,
                    remote_key: Some(doc.remote_key.clone()),
                });
                if remote_newer {
                    view.trace.push(MergeTrace {
                        id: m.id.clone(),
                        decision: MergeDecision::ConflictStale,
                    });
                }
            }
        }
    }

    let mut leftovers: Vec<&PendingMutation> = by_id.into_values().collect();
    leftovers.sort_by_key(|m| m.seq);
    for m in leftovers {
        if m.action == Action::Delete {
            continue;
        }
        let Some(payload) = &m.payload else { continue };
        view.records.push(MergedRecord {
            id: m.id.clone(),
            body: payload.clone(),
            source: RecordSource::Pending(m.action),
            remote_key: m.remote_ref.clone(),
        });
        view.trace.push(MergeTrace {
            id: m.id.clone(),
            decision: MergeDecision::Appended,
        });
    }

    view
}
