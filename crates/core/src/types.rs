//! Data model: items, leases and events
//!
//! - [`Item`]: an immutable stored value. A logical update inserts a new item
//!   row; earlier versions stay until purge so event consumers can read them.
//! - [`Lease`]: the current binding of a key to one item. At most one per key.
//! - [`Event`]: an append-only log row recording a mutation, ordered by
//!   `EventID`.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A stored key/value record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Item {
    /// User-visible identifier
    pub key: Vec<u8>,
    /// Opaque payload
    pub value: Vec<u8>,
    /// Item ID assigned at insert time. Zero until inserted.
    pub id: i64,
    /// Absolute expiry, `None` for items that never expire
    pub expires: Option<Timestamp>,
}

impl Item {
    /// Create an item without expiry
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            id: 0,
            expires: None,
        }
    }

    /// Set the absolute expiry
    pub fn with_expires(mut self, expires: Timestamp) -> Self {
        self.expires = Some(expires);
        self
    }

    /// True once `expires` is at or before `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.map_or(false, |e| e <= now)
    }

    /// The lease that binds this item to its key
    pub fn lease(&self) -> Lease {
        Lease {
            key: self.key.clone(),
            id: self.id,
            expires: self.expires,
        }
    }
}

/// Binding of a key to its currently active item
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Lease {
    /// Bound key
    pub key: Vec<u8>,
    /// ID of the active item
    pub id: i64,
    /// Absolute expiry, `None` for leases that never expire
    pub expires: Option<Timestamp>,
}

impl Lease {
    /// True once `expires` is at or before `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.map_or(false, |e| e <= now)
    }
}

/// Kind of mutation recorded by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Key created or rebound
    Put,
    /// Key removed or expired
    Delete,
}

impl OpType {
    /// Column encoding
    pub fn as_i16(self) -> i16 {
        match self {
            OpType::Put => 1,
            OpType::Delete => 2,
        }
    }

    /// Decode the column encoding
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(OpType::Put),
            2 => Some(OpType::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::Put => write!(f, "put"),
            OpType::Delete => write!(f, "delete"),
        }
    }
}

/// One entry of the change-event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Engine-assigned, strictly increasing position in the log
    pub event_id: i64,
    /// Mutation kind
    pub op: OpType,
    /// Snapshot of the affected item at mutation time
    pub item: Item,
}

/// A page of events returned by `get_events`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventBatch {
    /// EventID of the last event in `events`, or the requested starting ID
    /// when the page is empty
    pub last_event_id: i64,
    /// Events in ascending EventID order
    pub events: Vec<Event>,
}

impl EventBatch {
    /// An empty page that leaves the caller's watermark at `from_event_id`
    pub fn empty(from_event_id: i64) -> Self {
        Self {
            last_event_id: from_event_id,
            events: Vec::new(),
        }
    }

    /// Build a page from events fetched after `from_event_id`
    pub fn from_events(from_event_id: i64, events: Vec<Event>) -> Self {
        let last_event_id = events.last().map_or(from_event_id, |e| e.event_id);
        Self {
            last_event_id,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_expiry_is_inclusive() {
        let item = Item::new("a", "1").with_expires(Timestamp::from_secs(10));
        assert!(!item.is_expired(Timestamp::from_secs(9)));
        assert!(item.is_expired(Timestamp::from_secs(10)));
        assert!(!Item::new("a", "1").is_expired(Timestamp::MAX));
    }

    #[test]
    fn test_item_lease_copies_binding() {
        let mut item = Item::new("a", "1").with_expires(Timestamp::from_secs(3));
        item.id = 42;
        let lease = item.lease();
        assert_eq!(lease.key, b"a");
        assert_eq!(lease.id, 42);
        assert_eq!(lease.expires, Some(Timestamp::from_secs(3)));
    }

    #[test]
    fn test_op_type_encoding() {
        for op in [OpType::Put, OpType::Delete] {
            assert_eq!(OpType::from_i16(op.as_i16()), Some(op));
        }
        assert_eq!(OpType::from_i16(0), None);
    }

    #[test]
    fn test_event_batch_keeps_watermark_when_empty() {
        let batch = EventBatch::from_events(17, Vec::new());
        assert_eq!(batch, EventBatch::empty(17));

        let event = Event {
            event_id: 20,
            op: OpType::Put,
            item: Item::new("k", "v"),
        };
        let batch = EventBatch::from_events(17, vec![event]);
        assert_eq!(batch.last_event_id, 20);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event {
            event_id: 3,
            op: OpType::Delete,
            item: Item::new("k", "v").with_expires(Timestamp::from_secs(1)),
        };
        let json = serde_json::to_string(&event).unwrap();
        let restored: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, restored);
    }
}
