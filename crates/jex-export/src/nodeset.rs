//! On-disk dedup sets of exported node ids
//!
//! One SQLite file per `(object type, partition, shard)` holding the identity
//! digests already exported. Sets are append-only and survive restarts: an
//! id added once is never exported again for the same node set root.

use jex_common::{JexError, PartitionId, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::object::ObjectType;

const CREATE_NODES_TABLE: &str = "CREATE TABLE IF NOT EXISTS nodes (id BLOB PRIMARY KEY) WITHOUT ROWID";

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
"#;

/// A persistent set of fixed-length keys
pub trait NodeStore: Send {
    /// Insert `node_id`; true when it was not present before
    fn add(&mut self, node_id: &[u8]) -> Result<bool>;

    /// Make every insertion so far durable
    fn flush(&mut self) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// How the ids of one partition are spread over files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardPolicy {
    /// One file per partition, suffixed `all`
    #[default]
    Single,
    /// Sixteen files per partition keyed by the low nibble of the first id byte
    Prefix,
}

impl ShardPolicy {
    pub fn shard(&self, node_id: &[u8]) -> String {
        match self {
            ShardPolicy::Single => "all".to_string(),
            ShardPolicy::Prefix => format!("{:x}", node_id.first().copied().unwrap_or(0) % 16),
        }
    }
}

impl std::str::FromStr for ShardPolicy {
    type Err = JexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "all" => Ok(ShardPolicy::Single),
            "prefix" => Ok(ShardPolicy::Prefix),
            other => Err(JexError::Config(format!("unknown shard policy '{}'", other))),
        }
    }
}

/// `{root}/{object_type}/part-{partition}/nodes-{shard}.db`
pub fn shard_path(root: &Path, object_type: ObjectType, partition: PartitionId, shard: &str) -> PathBuf {
    root.join(object_type.as_str())
        .join(format!("part-{}", partition))
        .join(format!("nodes-{}.db", shard))
}

/// SQLite-backed [`NodeStore`]
///
/// Insertions run inside a transaction opened on the first `add` after a
/// flush, so a crash loses at most the unflushed ids.
pub struct SqliteNodeSet {
    conn: Connection,
    path: PathBuf,
    key_len: Option<usize>,
}

impl SqliteNodeSet {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path).map_err(|e| JexError::node_store(&path, e))?;
        conn.execute_batch(PRAGMAS)
            .map_err(|e| JexError::node_store(&path, e))?;
        conn.execute(CREATE_NODES_TABLE, [])
            .map_err(|e| JexError::node_store(&path, e))?;

        let key_len = conn
            .query_row("SELECT length(id) FROM nodes LIMIT 1", [], |row| row.get::<_, i64>(0))
            .optional()
            .map_err(|e| JexError::node_store(&path, e))?
            .map(|len| len as usize);

        debug!(path = %path.display(), "Opened node set");
        Ok(Self { conn, path, key_len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of ids stored, including unflushed ones
    pub fn len(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| JexError::node_store(&self.path, e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl NodeStore for SqliteNodeSet {
    fn add(&mut self, node_id: &[u8]) -> Result<bool> {
        match self.key_len {
            Some(len) if len != node_id.len() => {
                return Err(JexError::node_store(
                    &self.path,
                    format!("key of {} bytes in a set of {}-byte keys", node_id.len(), len),
                ));
            },
            Some(_) => {},
            None => self.key_len = Some(node_id.len()),
        }

        if self.conn.is_autocommit() {
            self.conn
                .execute_batch("BEGIN")
                .map_err(|e| JexError::node_store(&self.path, e))?;
        }

        let changed = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO nodes (id) VALUES (?1)")
            .and_then(|mut stmt| stmt.execute(params![node_id]))
            .map_err(|e| JexError::node_store(&self.path, e))?;
        Ok(changed == 1)
    }

    fn flush(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| JexError::node_store(&self.path, e))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush()
    }
}

impl Drop for SqliteNodeSet {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to flush node set on drop");
        }
    }
}

/// Node sets of one worker, opened lazily per partition and shard and kept
/// open for the worker's lifetime
pub struct NodeSets {
    root: PathBuf,
    object_type: ObjectType,
    policy: ShardPolicy,
    stores: BTreeMap<(PartitionId, String), Box<dyn NodeStore>>,
}

impl NodeSets {
    pub fn new(root: impl Into<PathBuf>, object_type: ObjectType, policy: ShardPolicy) -> Self {
        Self {
            root: root.into(),
            object_type,
            policy,
            stores: BTreeMap::new(),
        }
    }

    /// Number of shards opened so far
    pub fn open_count(&self) -> usize {
        self.stores.len()
    }

    /// Store responsible for `node_id` in `partition`
    pub fn get(&mut self, partition: PartitionId, node_id: &[u8]) -> Result<&mut dyn NodeStore> {
        let shard = self.policy.shard(node_id);
        let store = match self.stores.entry((partition, shard)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = shard_path(&self.root, self.object_type, partition, &entry.key().1);
                entry.insert(Box::new(SqliteNodeSet::open(path)?))
            },
        };
        Ok(store.as_mut())
    }

    /// Add `node_id` to its shard; true when it was never seen before
    pub fn add(&mut self, partition: PartitionId, node_id: &[u8]) -> Result<bool> {
        self.get(partition, node_id)?.add(node_id)
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for store in self.stores.values_mut() {
            store.flush()?;
        }
        Ok(())
    }

    /// Close every store, reporting the first failure
    pub fn close(self) -> Result<()> {
        let mut first_error = None;
        for ((partition, shard), store) in self.stores {
            if let Err(e) = store.close() {
                warn!(partition, shard = %shard, error = %e, "Failed to close node set");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
