//! Persistent storage using sled: one tree per entity, plus two secondary
//! index trees for prefix-based node lookup.
//!
//! Every write goes through a [`Session`] scoped transaction spanning all
//! nine trees, so a handler that touches more than one entity (e.g. a node
//! upsert alongside an advertisement insert) commits or rolls back as a
//! unit rather than leaving the store observable half-written.

use meshbridge_core::*;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] meshbridge_core::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for operations run inside a [`Session`]; `?` on a
/// `TransactionalTree` call converts automatically via sled's blanket
/// `From<UnabortableTransactionError>` impl.
pub type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

fn abort(e: impl Into<StoreError>) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e.into())
}

fn tag_key(node_public_key: &PublicKey, tag_key: &str) -> Vec<u8> {
    format!("{}\0{}", node_public_key.as_str(), tag_key).into_bytes()
}

/// A scoped transaction over every tree in the store. Constructed only by
/// [`Store::transaction`]; commits when the closure returns `Ok`, rolls
/// back on `Err` or panic.
pub struct Session<'a> {
    nodes: &'a TransactionalTree,
    node_prefix2: &'a TransactionalTree,
    node_prefix8: &'a TransactionalTree,
    node_tags: &'a TransactionalTree,
    messages: &'a TransactionalTree,
    advertisements: &'a TransactionalTree,
    trace_paths: &'a TransactionalTree,
    telemetry: &'a TransactionalTree,
    event_log: &'a TransactionalTree,
}

impl<'a> Session<'a> {
    fn put_json<T: serde::Serialize>(tree: &TransactionalTree, key: &[u8], value: &T) -> TxResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| abort(StoreError::from(e)))?;
        tree.insert(key, bytes)?;
        Ok(())
    }

    fn get_json<T: serde::de::DeserializeOwned>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| abort(StoreError::from(e)))?)),
            None => Ok(None),
        }
    }

    fn index_append(tree: &TransactionalTree, prefix: &str, key: &str) -> TxResult<()> {
        let mut members: Vec<String> = Self::get_json(tree, prefix.as_bytes())?.unwrap_or_default();
        if !members.iter().any(|m| m == key) {
            members.push(key.to_string());
            Self::put_json(tree, prefix.as_bytes(), &members)?;
        }
        Ok(())
    }

    pub fn get_node(&self, public_key: &PublicKey) -> TxResult<Option<Node>> {
        Self::get_json(self.nodes, public_key.as_str().as_bytes())
    }

    pub fn upsert_node(&self, node: &Node) -> TxResult<()> {
        let key = node.public_key.as_str();
        Self::put_json(self.nodes, key.as_bytes(), node)?;
        Self::index_append(self.node_prefix2, &node.public_key_prefix2, key)?;
        Self::index_append(self.node_prefix8, &node.public_key_prefix8, key)?;
        Ok(())
    }

    /// Upserts a tag, creating the node lazily if it does not yet exist.
    pub fn upsert_tag(&self, tag: &NodeTag, now: i64) -> TxResult<()> {
        tag.value.validate().map_err(|e| abort(StoreError::from(e)))?;
        if self.get_node(&tag.node_public_key)?.is_none() {
            self.upsert_node(&Node::new(tag.node_public_key.clone(), now))?;
        }
        Self::put_json(self.node_tags, &tag_key(&tag.node_public_key, &tag.key), tag)
    }

    pub fn delete_tag(&self, node_public_key: &PublicKey, key: &str) -> TxResult<()> {
        self.node_tags.remove(tag_key(node_public_key, key))?;
        Ok(())
    }

    pub fn insert_message(&self, id: u64, message: &Message) -> TxResult<()> {
        message.validate().map_err(|e| abort(StoreError::from(e)))?;
        Self::put_json(self.messages, &id.to_be_bytes(), message)
    }

    pub fn insert_advertisement(&self, id: u64, advert: &Advertisement) -> TxResult<()> {
        Self::put_json(self.advertisements, &id.to_be_bytes(), advert)
    }

    pub fn insert_trace_path(&self, id: u64, trace: &TracePath) -> TxResult<()> {
        trace.validate().map_err(|e| abort(StoreError::from(e)))?;
        Self::put_json(self.trace_paths, &id.to_be_bytes(), trace)
    }

    pub fn insert_telemetry(&self, id: u64, telemetry: &Telemetry) -> TxResult<()> {
        Self::put_json(self.telemetry, &id.to_be_bytes(), telemetry)
    }

    /// Append a forensic event-log row. `id` must be pre-allocated via
    /// `Store::next_id` since transaction closures may be retried on
    /// conflict and cannot themselves call `Db::generate_id`.
    pub fn append_event_log(&self, kind: &str, payload_json: &str, id: u64, created_at: i64) -> TxResult<()> {
        let row = EventLogRow { id, kind: kind.to_string(), payload_json: payload_json.to_string(), created_at };
        Self::put_json(self.event_log, &id.to_be_bytes(), &row)
    }
}

/// Storage backend for the bridge.
pub struct Store {
    db: Db,
    nodes: Tree,
    node_prefix2: Tree,
    node_prefix8: Tree,
    node_tags: Tree,
    messages: Tree,
    advertisements: Tree,
    trace_paths: Tree,
    telemetry: Tree,
    event_log: Tree,
}

fn get_json<T: serde::de::DeserializeOwned>(tree: &Tree, key: &[u8]) -> StoreResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            nodes: db.open_tree("nodes")?,
            node_prefix2: db.open_tree("node_prefix2")?,
            node_prefix8: db.open_tree("node_prefix8")?,
            node_tags: db.open_tree("node_tags")?,
            messages: db.open_tree("messages")?,
            advertisements: db.open_tree("advertisements")?,
            trace_paths: db.open_tree("trace_paths")?,
            telemetry: db.open_tree("telemetry")?,
            event_log: db.open_tree("event_log")?,
            db,
        })
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Allocate a monotonic id for use inside a subsequent `transaction`
    /// call. Ids may have gaps if a transaction retries, but are always
    /// unique and increasing.
    pub fn next_id(&self) -> StoreResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Run `f` inside one scoped transaction spanning every tree. Commits on
    /// `Ok`, rolls back on `Err`. This is the only write path into the
    /// store; single-entity convenience methods below are one-operation
    /// transactions.
    pub fn transaction<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: Fn(&Session) -> TxResult<R>,
    {
        let outcome = (
            &self.nodes,
            &self.node_prefix2,
            &self.node_prefix8,
            &self.node_tags,
            &self.messages,
            &self.advertisements,
            &self.trace_paths,
            &self.telemetry,
            &self.event_log,
        )
            .transaction(
                |(nodes, node_prefix2, node_prefix8, node_tags, messages, advertisements, trace_paths, telemetry, event_log)| {
                    let session = Session {
                        nodes,
                        node_prefix2,
                        node_prefix8,
                        node_tags,
                        messages,
                        advertisements,
                        trace_paths,
                        telemetry,
                        event_log,
                    };
                    f(&session)
                },
            );
        match outcome {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        }
    }

    // --- Nodes -----------------------------------------------------------

    pub fn upsert_node(&self, node: &Node) -> StoreResult<()> {
        self.transaction(|session| session.upsert_node(node))
    }

    pub fn get_node(&self, public_key: &PublicKey) -> StoreResult<Option<Node>> {
        get_json(&self.nodes, public_key.as_str().as_bytes())
    }

    /// Node lookup by full key or hex prefix. Prefixes up to 8 hex characters
    /// use the corresponding secondary index tree; longer prefixes fall back
    /// to a full scan, matching the original's tiered index strategy.
    pub fn find_by_prefix(&self, prefix: &HexPrefix) -> StoreResult<Vec<Node>> {
        if prefix.is_full_key() {
            let key = PublicKey::new(prefix.as_str())?;
            return Ok(self.get_node(&key)?.into_iter().collect());
        }
        let candidates: Vec<String> = if prefix.as_str().len() <= 2 {
            get_json(&self.node_prefix2, prefix.as_str().as_bytes())?.unwrap_or_default()
        } else if prefix.as_str().len() <= 8 {
            get_json(&self.node_prefix8, prefix.as_str().as_bytes())?.unwrap_or_default()
        } else {
            self.nodes
                .iter()
                .filter_map(|r| r.ok())
                .filter(|(k, _)| k.starts_with(prefix.as_str().as_bytes()))
                .map(|(k, _)| String::from_utf8_lossy(&k).to_string())
                .collect()
        };
        let mut nodes = Vec::with_capacity(candidates.len());
        for key in candidates {
            if let Some(node) = get_json(&self.nodes, key.as_bytes())? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    // --- Tags ----------------------------------------------------------------

    /// Upserts a tag, creating the node lazily if it does not yet exist.
    pub fn upsert_tag(&self, tag: &NodeTag, now: i64) -> StoreResult<()> {
        self.transaction(|session| session.upsert_tag(tag, now))
    }

    pub fn get_tags(&self, node_public_key: &PublicKey) -> StoreResult<Vec<NodeTag>> {
        let prefix = format!("{}\0", node_public_key.as_str());
        self.node_tags
            .scan_prefix(prefix.as_bytes())
            .values()
            .map(|r| {
                let bytes = r?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    pub fn delete_tag(&self, node_public_key: &PublicKey, key: &str) -> StoreResult<()> {
        self.transaction(|session| session.delete_tag(node_public_key, key))
    }

    pub fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        self.nodes
            .iter()
            .values()
            .map(|r| Ok(serde_json::from_slice(&r?)?))
            .collect()
    }

    // --- Append-only entities --------------------------------------------------

    pub fn insert_message(&self, id: u64, message: &Message) -> StoreResult<()> {
        self.transaction(|session| session.insert_message(id, message))
    }

    pub fn insert_advertisement(&self, id: u64, advert: &Advertisement) -> StoreResult<()> {
        self.transaction(|session| session.insert_advertisement(id, advert))
    }

    pub fn insert_trace_path(&self, id: u64, trace: &TracePath) -> StoreResult<()> {
        self.transaction(|session| session.insert_trace_path(id, trace))
    }

    pub fn insert_telemetry(&self, id: u64, telemetry: &Telemetry) -> StoreResult<()> {
        self.transaction(|session| session.insert_telemetry(id, telemetry))
    }

    fn list_tree<T: serde::de::DeserializeOwned>(tree: &Tree, limit: usize) -> StoreResult<Vec<T>> {
        tree.iter()
            .rev()
            .take(limit)
            .map(|r| {
                let (_, value) = r?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// Most recent `limit` messages, newest first.
    pub fn list_messages(&self, limit: usize) -> StoreResult<Vec<Message>> {
        Self::list_tree(&self.messages, limit)
    }

    pub fn list_advertisements(&self, limit: usize) -> StoreResult<Vec<Advertisement>> {
        Self::list_tree(&self.advertisements, limit)
    }

    pub fn list_trace_paths(&self, limit: usize) -> StoreResult<Vec<TracePath>> {
        Self::list_tree(&self.trace_paths, limit)
    }

    /// Telemetry samples for one node, newest first.
    pub fn list_telemetry(&self, node_public_key: &PublicKey, limit: usize) -> StoreResult<Vec<Telemetry>> {
        let all: Vec<Telemetry> = Self::list_tree(&self.telemetry, usize::MAX)?;
        Ok(all.into_iter().filter(|t| &t.node_public_key == node_public_key).take(limit).collect())
    }

    /// Append a forensic event-log row, returning its assigned id.
    pub fn append_event_log(&self, kind: &str, payload_json: &str, created_at: i64) -> StoreResult<u64> {
        let id = self.next_id()?;
        self.transaction(|session| session.append_event_log(kind, payload_json, id, created_at))?;
        Ok(id)
    }

    // --- Retention -------------------------------------------------------------

    /// Delete rows older than `cutoff` from every retention-swept tree.
    /// Node and NodeTag are never swept.
    pub fn sweep_retention(&self, cutoff: i64) -> StoreResult<RetentionCounts> {
        Ok(RetentionCounts {
            messages: sweep_tree::<Message>(&self.messages, cutoff, |m| m.received_at)?,
            advertisements: sweep_tree::<Advertisement>(&self.advertisements, cutoff, |a| a.received_at)?,
            trace_paths: sweep_tree::<TracePath>(&self.trace_paths, cutoff, |t| t.completed_at)?,
            telemetry: sweep_tree::<Telemetry>(&self.telemetry, cutoff, |t| t.received_at)?,
            event_log: sweep_tree::<EventLogRow>(&self.event_log, cutoff, |e| e.created_at)?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCounts {
    pub messages: usize,
    pub advertisements: usize,
    pub trace_paths: usize,
    pub telemetry: usize,
    pub event_log: usize,
}

fn sweep_tree<T: serde::de::DeserializeOwned>(
    tree: &Tree,
    cutoff: i64,
    timestamp_of: impl Fn(&T) -> i64,
) -> StoreResult<usize> {
    let mut to_delete = Vec::new();
    for row in tree.iter() {
        let (key, value) = row?;
        let decoded: T = serde_json::from_slice(&value)?;
        if timestamp_of(&decoded) < cutoff {
            to_delete.push(key);
        }
    }
    let count = to_delete.len();
    for key in to_delete {
        tree.remove(key)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(n: u8) -> PublicKey {
        PublicKey::new(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    #[test]
    fn upsert_and_get_node() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let node = Node::new(key(1), 100);
        store.upsert_node(&node).unwrap();
        assert_eq!(store.get_node(&key(1)).unwrap().unwrap().first_seen, 100);
    }

    #[test]
    fn find_by_short_prefix_uses_index() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_node(&Node::new(key(0xab), 0)).unwrap();
        let found = store.find_by_prefix(&HexPrefix::new("ab").unwrap()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn find_by_full_key() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_node(&Node::new(key(5), 0)).unwrap();
        let found = store.find_by_prefix(&HexPrefix::new(key(5).as_str()).unwrap()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn tag_upsert_creates_node_lazily() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tag = NodeTag {
            node_public_key: key(9),
            key: "role".into(),
            value: TagValue::String("sensor".into()),
            updated_at: 0,
        };
        store.upsert_tag(&tag, 0).unwrap();
        assert!(store.get_node(&key(9)).unwrap().is_some());
        assert_eq!(store.get_tags(&key(9)).unwrap().len(), 1);
    }

    #[test]
    fn list_messages_returns_newest_first() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for (id, text) in [(1, "first"), (2, "second")] {
            store
                .insert_message(id, &Message {
                    direction: Direction::Inbound,
                    message_type: MessageType::Channel,
                    pubkey_prefix: None,
                    channel_idx: Some(0),
                    text: text.into(),
                    received_at: id as i64,
                })
                .unwrap();
        }
        let listed = store.list_messages(10).unwrap();
        assert_eq!(listed[0].text, "second");
        assert_eq!(listed[1].text, "first");
    }

    #[test]
    fn retention_sweeps_messages_but_not_nodes() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.upsert_node(&Node::new(key(1), 0)).unwrap();
        store
            .insert_message(1, &Message {
                direction: Direction::Inbound,
                message_type: MessageType::Channel,
                pubkey_prefix: None,
                channel_idx: Some(0),
                text: "hi".into(),
                received_at: 0,
            })
            .unwrap();
        let counts = store.sweep_retention(50).unwrap();
        assert_eq!(counts.messages, 1);
        assert!(store.get_node(&key(1)).unwrap().is_some());
    }

    #[test]
    fn transaction_rolls_back_entirely_on_failure() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let node = Node::new(key(3), 0);
        let bad_message = Message {
            direction: Direction::Inbound,
            message_type: MessageType::Contact,
            pubkey_prefix: None,
            channel_idx: None,
            text: "ambiguous target".into(),
            received_at: 0,
        };
        let result = store.transaction(|session| {
            session.upsert_node(&node)?;
            session.insert_message(1, &bad_message)?;
            Ok(())
        });
        assert!(result.is_err());
        // The node write must not survive the failed message validation.
        assert!(store.get_node(&key(3)).unwrap().is_none());
    }
}
