//! Append-only, hash-linked audit chain.
//!
//! Every entry embeds the hash of its predecessor; the first entry of a
//! segment links to a fixed all-zero genesis hash. Modifying or deleting
//! any persisted entry breaks recomputation for that entry and everything
//! after it in the same segment. A detected break halts further appends
//! until an operator acknowledges it on the record, opening a fresh
//! segment; the broken history stays in place as evidence.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;

use crate::{now_s, TrustError};

/// First entry of every chain segment links to this well-known hash.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Event type of the entry that opens a fresh segment after a detected
/// break has been acknowledged.
pub const EVENT_TAMPER_ACKNOWLEDGED: &str = "tamper_acknowledged";

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Hashes an entry's canonical bytes with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], canonical: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(canonical);
    hasher.finalize().into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub segment: u64,
    pub event_type: String,
    pub payload_json: String,
    pub timestamp: u64,
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
}

impl AuditEntry {
    /// Canonical byte encoding hashed into `entry_hash`: fixed field order,
    /// little-endian integers, length-prefixed strings. The payload is
    /// hashed as the stored JSON text, so verification never depends on a
    /// tampered blob still parsing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.sequence_no.to_le_bytes());
        out.extend_from_slice(&self.segment.to_le_bytes());
        push_bytes(&mut out, self.event_type.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        push_bytes(&mut out, self.payload_json.as_bytes());
        out
    }

    pub fn payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}

pub(crate) fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

#[derive(Clone, Copy, Debug)]
pub struct ChainTail {
    pub sequence_no: u64,
    pub segment: u64,
    pub entry_hash: [u8; 32],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainVerification {
    pub ok: bool,
    pub entries_verified: u64,
    pub break_at: Option<u64>,
}

/// Persistence contract for audit entries. Implementations only store and
/// retrieve; all linkage and integrity logic lives in [`AuditChain`].
pub trait AuditStore {
    fn tail(&self) -> Result<Option<ChainTail>>;

    fn insert_entry(&mut self, entry: &AuditEntry) -> Result<()>;

    /// Snapshot of all entries in ascending sequence order.
    fn entries(&self) -> Result<Vec<AuditEntry>>;

    fn broken_at(&self) -> Result<Option<u64>>;

    fn set_broken_at(&mut self, broken_at: Option<u64>) -> Result<()>;
}

// -------------------- SQLite store --------------------

pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS audit_log (
              sequence_no INTEGER PRIMARY KEY,
              segment INTEGER NOT NULL DEFAULT 0,
              event_type TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chain_state (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              broken_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
            "#,
        )?;
        Ok(())
    }
}

impl AuditStore for SqliteAuditStore {
    fn tail(&self) -> Result<Option<ChainTail>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_no, segment, entry_hash FROM audit_log ORDER BY sequence_no DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let sequence_no: i64 = row.get(0)?;
            let segment: i64 = row.get(1)?;
            let entry_hash = blob32(row.get(2)?, "audit_log.entry_hash")?;
            Ok(Some(ChainTail {
                sequence_no: sequence_no as u64,
                segment: segment as u64,
                entry_hash,
            }))
        } else {
            Ok(None)
        }
    }

    fn insert_entry(&mut self, entry: &AuditEntry) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO audit_log(sequence_no, segment, event_type, payload_json, created_at, prev_hash, entry_hash)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    entry.sequence_no as i64,
                    entry.segment as i64,
                    entry.event_type,
                    entry.payload_json,
                    entry.timestamp as i64,
                    entry.prev_hash.to_vec(),
                    entry.entry_hash.to_vec()
                ],
            )
            .map_err(|e| TrustError::StorageIo(e.to_string()))?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        load_entries(&self.conn)
    }

    fn broken_at(&self) -> Result<Option<u64>> {
        let broken: Option<Option<i64>> = self
            .conn
            .query_row("SELECT broken_at FROM chain_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(broken.flatten().map(|at| at as u64))
    }

    fn set_broken_at(&mut self, broken_at: Option<u64>) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO chain_state(id, broken_at) VALUES (1, ?1)",
                params![broken_at.map(|at| at as i64)],
            )
            .map_err(|e| TrustError::StorageIo(e.to_string()))?;
        Ok(())
    }
}

/// Loads all audit entries from an open connection in sequence order.
/// Shared with the external verifier, which reads the database without
/// trusting the runtime that wrote it.
pub(crate) fn load_entries(conn: &Connection) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT sequence_no, segment, event_type, payload_json, created_at, prev_hash, entry_hash
         FROM audit_log ORDER BY sequence_no ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let sequence_no: i64 = row.get(0)?;
        let segment: i64 = row.get(1)?;
        let event_type: String = row.get(2)?;
        let payload_json: String = row.get(3)?;
        let created_at: i64 = row.get(4)?;
        let prev_hash = blob32(row.get(5)?, "audit_log.prev_hash")?;
        let entry_hash = blob32(row.get(6)?, "audit_log.entry_hash")?;
        entries.push(AuditEntry {
            sequence_no: sequence_no as u64,
            segment: segment as u64,
            event_type,
            payload_json,
            timestamp: created_at as u64,
            prev_hash,
            entry_hash,
        });
    }
    Ok(entries)
}

fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt {}: expected 32 bytes, got {}",
            context,
            bytes.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// -------------------- In-memory store --------------------

#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    entries: Vec<AuditEntry>,
    broken_at: Option<u64>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn tail(&self) -> Result<Option<ChainTail>> {
        Ok(self.entries.last().map(|entry| ChainTail {
            sequence_no: entry.sequence_no,
            segment: entry.segment,
            entry_hash: entry.entry_hash,
        }))
    }

    fn insert_entry(&mut self, entry: &AuditEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.clone())
    }

    fn broken_at(&self) -> Result<Option<u64>> {
        Ok(self.broken_at)
    }

    fn set_broken_at(&mut self, broken_at: Option<u64>) -> Result<()> {
        self.broken_at = broken_at;
        Ok(())
    }
}

// -------------------- Chain --------------------

/// The single logical writer over an audit store.
///
/// Appends from concurrent producers are serialized through an internal
/// lock so `prev_hash` linkage is never computed from a stale tail.
/// Verification takes a snapshot and walks it outside the writer lock.
pub struct AuditChain {
    store: Mutex<Box<dyn AuditStore + Send>>,
}

impl AuditChain {
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::with_store(Box::new(SqliteAuditStore::open(db_path)?)))
    }

    pub fn in_memory() -> Self {
        Self::with_store(Box::new(InMemoryAuditStore::new()))
    }

    pub fn with_store(store: Box<dyn AuditStore + Send>) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Appends an event, assigning the next gapless sequence number and
    /// linking to the current tail. Refuses with `ChainBroken` once a break
    /// has been detected and not yet acknowledged.
    pub fn append(&self, event_type: &str, payload: serde_json::Value) -> Result<AuditEntry> {
        let mut store = self.lock_store()?;
        if let Some(at) = store.broken_at()? {
            return Err(TrustError::ChainBroken(at).into());
        }
        let (sequence_no, segment, prev_hash) = match store.tail()? {
            Some(tail) => (tail.sequence_no + 1, tail.segment, tail.entry_hash),
            None => (1, 0, GENESIS_HASH),
        };
        let mut entry = AuditEntry {
            sequence_no,
            segment,
            event_type: event_type.to_string(),
            payload_json: serde_json::to_string(&payload)?,
            timestamp: now_s()?,
            prev_hash,
            entry_hash: [0u8; 32],
        };
        entry.entry_hash = hash_entry(&prev_hash, &entry.canonical_bytes());
        store.insert_entry(&entry)?;
        log::debug!(
            "audit append: seq={} segment={} type={}",
            entry.sequence_no,
            entry.segment,
            entry.event_type
        );
        Ok(entry)
    }

    /// Recomputes every entry hash and linkage from genesis. On the first
    /// mismatch the offending sequence number is reported and the broken
    /// state is persisted so appends refuse until acknowledged. Nothing is
    /// ever repaired or skipped silently.
    pub fn verify(&self) -> Result<ChainVerification> {
        self.verify_with(|_| true)
    }

    /// Like [`AuditChain::verify`], invoking `on_entry` for each verified
    /// entry. Returning `false` cancels the walk between entries and yields
    /// the partial verified count.
    pub fn verify_with<F>(&self, on_entry: F) -> Result<ChainVerification>
    where
        F: FnMut(&AuditEntry) -> bool,
    {
        let entries = self.lock_store()?.entries()?;
        let outcome = walk_entries(&entries, on_entry);
        if let Some(at) = outcome.unacknowledged {
            let mut store = self.lock_store()?;
            store.set_broken_at(Some(at))?;
            log::error!("audit chain break detected at sequence {}", at);
        }
        Ok(outcome.verification)
    }

    /// Operator acknowledgment of a detected break: opens a fresh segment
    /// whose first entry records the break and the acknowledging operator,
    /// then lifts the append refusal. The broken history is retained.
    pub fn acknowledge_break(&self, operator_id: &str) -> Result<AuditEntry> {
        let mut store = self.lock_store()?;
        let Some(break_at) = store.broken_at()? else {
            return Err(anyhow!("audit chain is not in a broken state"));
        };
        let (sequence_no, segment) = match store.tail()? {
            Some(tail) => (tail.sequence_no + 1, tail.segment + 1),
            None => (1, 1),
        };
        let mut entry = AuditEntry {
            sequence_no,
            segment,
            event_type: EVENT_TAMPER_ACKNOWLEDGED.to_string(),
            payload_json: serde_json::to_string(&serde_json::json!({
                "operator_id": operator_id,
                "break_at": break_at,
            }))?,
            timestamp: now_s()?,
            prev_hash: GENESIS_HASH,
            entry_hash: [0u8; 32],
        };
        entry.entry_hash = hash_entry(&GENESIS_HASH, &entry.canonical_bytes());
        store.insert_entry(&entry)?;
        store.set_broken_at(None)?;
        log::warn!(
            "audit chain break at {} acknowledged by {}; segment {} opened",
            break_at,
            operator_id,
            segment
        );
        Ok(entry)
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.lock_store()?.entries()?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn tail(&self) -> Result<Option<ChainTail>> {
        self.lock_store()?.tail()
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn AuditStore + Send>>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("audit chain writer lock poisoned"))
    }
}

pub(crate) struct WalkOutcome {
    pub verification: ChainVerification,
    /// First break not followed by an acknowledgment segment; triggers the
    /// append refusal.
    pub unacknowledged: Option<u64>,
}

/// Verifies a snapshot of entries. Public entry point for callers that hold
/// entries from an untrusted database (see `verify` module).
pub fn verify_entries<F>(entries: &[AuditEntry], on_entry: F) -> ChainVerification
where
    F: FnMut(&AuditEntry) -> bool,
{
    walk_entries(entries, on_entry).verification
}

pub(crate) fn walk_entries<F>(entries: &[AuditEntry], mut on_entry: F) -> WalkOutcome
where
    F: FnMut(&AuditEntry) -> bool,
{
    let mut verified = 0u64;
    let mut first_break: Option<u64> = None;
    let mut unacknowledged: Option<u64> = None;

    let mut expected_prev = GENESIS_HASH;
    let mut expected_seq = 1u64;
    let mut current_segment = 0u64;
    let mut idx = 0usize;

    while idx < entries.len() {
        let entry = &entries[idx];

        if entry.segment != current_segment {
            if entry.segment < current_segment {
                // segments may only grow; a regression is tampering
                if first_break.is_none() {
                    first_break = Some(expected_seq);
                }
                unacknowledged = Some(expected_seq);
                break;
            }
            current_segment = entry.segment;
            expected_prev = GENESIS_HASH;
        }

        let entry_ok = entry.sequence_no == expected_seq
            && entry.prev_hash == expected_prev
            && hash_entry(&entry.prev_hash, &entry.canonical_bytes()) == entry.entry_hash;

        if !entry_ok {
            if first_break.is_none() {
                first_break = Some(expected_seq);
            }
            // Entries after a break in the same segment are unverifiable.
            // Resume at the next segment if an acknowledgment opened one.
            match entries[idx..]
                .iter()
                .position(|e| e.segment > current_segment)
            {
                Some(offset) => {
                    idx += offset;
                    let resumed = &entries[idx];
                    current_segment = resumed.segment;
                    expected_prev = GENESIS_HASH;
                    expected_seq = resumed.sequence_no;
                    continue;
                }
                None => {
                    unacknowledged = Some(expected_seq);
                    break;
                }
            }
        }

        verified += 1;
        expected_prev = entry.entry_hash;
        expected_seq = entry.sequence_no + 1;
        if !on_entry(entry) {
            break;
        }
        idx += 1;
    }

    WalkOutcome {
        verification: ChainVerification {
            ok: first_break.is_none(),
            entries_verified: verified,
            break_at: first_break,
        },
        unacknowledged,
    }
}
