use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change a pending mutation carries to the remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(format!("unknown mutation action `{other}`")),
        }
    }
}

/// A locally recorded, not yet confirmed change to one remote record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub collection: String,
    pub id: String,
    pub action: Action,
    pub payload: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion order; kept when later writes coalesce into this entry.
    pub seq: i64,
    pub revision: i64,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub remote_ref: Option<String>,
}

impl PendingMutation {
    pub fn create(collection: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self::new(collection, id, Action::Create, Some(payload))
    }

    pub fn update(collection: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self::new(collection, id, Action::Update, Some(payload))
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(collection, id, Action::Delete, None)
    }

    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        action: Action,
        payload: Option<Value>,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            action,
            payload,
            enqueued_at: Utc::now(),
            seq: 0,
            revision: 0,
            retry_count: 0,
            last_retry_at: None,
            last_error: None,
            remote_ref: None,
        }
    }

    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self
    }

    pub fn with_remote_ref(mut self, remote_ref: impl Into<String>) -> Self {
        self.remote_ref = Some(remote_ref.into());
        self
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.collection, &self.id)
    }
}

/// Result of folding an incoming write into the entry already queued for that record.
#[derive(Clone, Debug, PartialEq)]
pub enum Coalesced {
    /// Store this entry (new or replacing the existing one in place).
    Keep(PendingMutation),
    /// The two intents cancel out; drop the queued entry without any remote call.
    Discard,
}

/// Fold `incoming` into `existing`.
///
/// The result keeps the existing entry's `seq`, `retry_count` and `remote_ref`, bumps
/// `revision`, and takes the incoming payload and timestamp.
pub fn coalesce(existing: Option<&PendingMutation>, incoming: PendingMutation) -> Coalesced {
    fold(existing, incoming, false)
}

/// Like [`coalesce`], for an entry a drain is sending right now. Its create may land
/// remotely after this call, so a delete never cancels it.
pub fn coalesce_in_flight(existing: Option<&PendingMutation>, incoming: PendingMutation) -> Coalesced {
    fold(existing, incoming, true)
}

fn fold(existing: Option<&PendingMutation>, incoming: PendingMutation, in_flight: bool) -> Coalesced {
    let Some(existing) = existing else {
        return Coalesced::Keep(incoming);
    };

    let action = match (existing.action, incoming.action) {
        (Action::Create, Action::Create | Action::Update) => Action::Create,
        (Action::Create, Action::Delete) => {
            if existing.remote_ref.is_none() && !in_flight {
                return Coalesced::Discard;
            }
            Action::Delete
        }
        (Action::Update, Action::Create | Action::Update) => Action::Update,
        (Action::Update, Action::Delete) => Action::Delete,
        (Action::Delete, Action::Create | Action::Update) => Action::Create,
        (Action::Delete, Action::Delete) => Action::Delete,
    };

    let payload = match action {
        Action::Delete => None,
        _ => incoming.payload,
    };

    Coalesced::Keep(PendingMutation {
        collection: existing.collection.clone(),
        id: existing.id.clone(),
        action,
        payload,
        enqueued_at: incoming.enqueued_at.max(existing.enqueued_at),
        seq: existing.seq,
        revision: existing.revision + 1,
        retry_count: existing.retry_count,
        last_retry_at: existing.last_retry_at,
        last_error: existing.last_error.clone(),
        remote_ref: incoming.remote_ref.or_else(|| existing.remote_ref.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued(m: PendingMutation) -> PendingMutation {
        PendingMutation {
            seq: 7,
            revision: 2,
            retry_count: 1,
            ..m
        }
    }

    #[test]
    fn create_then_update_stays_create_with_latest_payload() {
        let existing = queued(PendingMutation::create("faults", "f1", json!({"v": 1})));
        let out = coalesce(
            Some(&existing),
            PendingMutation::update("faults", "f1", json!({"v": 2})),
        );
        let Coalesced::Keep(m) = out else {
            panic!("expected entry to survive");
        };
        assert_eq!(m.action, Action::Create);
        assert_eq!(m.payload, Some(json!({"v": 2})));
        assert_eq!(m.seq, 7);
        assert_eq!(m.revision, 3);
        assert_eq!(m.retry_count, 1);
    }

    #[test]
    fn unsynced_create_then_delete_cancels_out() {
        let existing = queued(PendingMutation::create("faults", "f1", json!({})));
        let out = coalesce(Some(&existing), PendingMutation::delete("faults", "f1"));
        assert_eq!(out, Coalesced::Discard);
    }

    #[test]
    fn partially_applied_create_then_delete_targets_remote_copy() {
        let existing =
            queued(PendingMutation::create("faults", "f1", json!({})).with_remote_ref("rk-1"));
        let Coalesced::Keep(m) = coalesce(Some(&existing), PendingMutation::delete("faults", "f1"))
        else {
            panic!("delete must survive once the create reached the remote");
        };
        assert_eq!(m.action, Action::Delete);
        assert_eq!(m.payload, None);
        assert_eq!(m.remote_ref.as_deref(), Some("rk-1"));
    }

    #[test]
    fn delete_of_a_create_being_sent_is_kept() {
        let existing = queued(PendingMutation::create("faults", "f1", json!({})));
        let Coalesced::Keep(m) =
            coalesce_in_flight(Some(&existing), PendingMutation::delete("faults", "f1"))
        else {
            panic!("delete must survive a create that may still land");
        };
        assert_eq!(m.action, Action::Delete);
        assert_eq!(m.revision, 3);
        assert_eq!(m.seq, 7);
    }

    #[test]
    fn delete_then_recreate_becomes_create() {
        let existing = queued(PendingMutation::delete("faults", "f1").with_remote_ref("rk-9"));
        let Coalesced::Keep(m) = coalesce(
            Some(&existing),
            PendingMutation::create("faults", "f1", json!({"v": 3})),
        ) else {
            panic!("expected entry");
        };
        assert_eq!(m.action, Action::Create);
        assert_eq!(m.remote_ref.as_deref(), Some("rk-9"));
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        let existing = queued(PendingMutation::update("faults", "f1", json!({})));
        let Coalesced::Keep(m) = coalesce(Some(&existing), PendingMutation::delete("faults", "f1"))
        else {
            panic!("expected entry");
        };
        assert_eq!(m.action, Action::Delete);
    }

    #[test]
    fn action_round_trips_through_text() {
        for action in [Action::Create, Action::Update, Action::Delete] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("upsert".parse::<Action>().is_err());
    }
}
