//! `SQLite` persistence layer.
//!
//! Events are stored once and never updated. Every append also records a
//! chain link `(device_id, hash, prev_hash)` and moves the device's chain
//! head in the same transaction. TTL pruning deletes event rows but keeps
//! their links, so continuity checks still see the pruned hashes.

use chrono::{DateTime, Utc};
use opsync_core::crypto::{EventSignature, NONCE_SIZE};
use opsync_core::verify::Quarantined;
use opsync_core::{
    Appended, ChainLink, CipherBlob, DeviceId, Event, EventHash, EventLog, PublicKey, SyncError, Timestamp,
    TrustedDevices,
};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Which direction a watermark tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    /// Highest remote HLC fully processed
    Pull,
    /// Highest own HLC acknowledged by the relay
    Push,
}

impl WatermarkKind {
    fn as_str(self) -> &'static str {
        match self {
            WatermarkKind::Pull => "pull",
            WatermarkKind::Push => "push",
        }
    }
}

/// `sync_meta` key holding the local device id.
pub const META_LOCAL_DEVICE: &str = "local_device";
/// `sync_meta` key holding the time of the last completed sync cycle.
pub const META_LAST_SYNC: &str = "last_sync";

const EVENT_COLUMNS: &str = "op_id, physical_ms, logical, device_id, entity_type, entity_id, op, \
                             nonce, ciphertext, prev_hash, hash, signature";

/// `SQLite`-backed event log and sync bookkeeping.
pub struct SqliteStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(storage)?;
        let store = Self { conn };
        store.init_schema().map_err(storage)?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        let store = Self { conn };
        store.init_schema().map_err(storage)?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            r"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            -- Immutable op-log
            CREATE TABLE IF NOT EXISTS events (
                op_id TEXT PRIMARY KEY,
                physical_ms INTEGER NOT NULL,
                logical INTEGER NOT NULL,
                device_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                op TEXT NOT NULL,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                prev_hash BLOB,
                hash BLOB NOT NULL,
                signature BLOB NOT NULL,
                stored_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_hlc
                ON events(physical_ms, logical, device_id);
            CREATE INDEX IF NOT EXISTS idx_events_device ON events(device_id, physical_ms, logical);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(entity_type, physical_ms);

            -- Every hash ever appended per device, kept through pruning
            CREATE TABLE IF NOT EXISTS chain_links (
                device_id TEXT NOT NULL,
                hash BLOB NOT NULL,
                prev_hash BLOB,
                op_id TEXT NOT NULL,
                physical_ms INTEGER NOT NULL,
                logical INTEGER NOT NULL,
                PRIMARY KEY (device_id, hash)
            );
            CREATE INDEX IF NOT EXISTS idx_chain_links_op ON chain_links(op_id);

            CREATE TABLE IF NOT EXISTS chain_heads (
                device_id TEXT PRIMARY KEY,
                hash BLOB NOT NULL,
                physical_ms INTEGER NOT NULL,
                logical INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trusted_devices (
                device_id TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                paired_at INTEGER NOT NULL
            );

            -- Per-relay progress
            CREATE TABLE IF NOT EXISTS sync_watermarks (
                peer TEXT NOT NULL,
                kind TEXT NOT NULL,
                physical_ms INTEGER NOT NULL,
                logical INTEGER NOT NULL,
                device_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (peer, kind)
            );

            CREATE TABLE IF NOT EXISTS quarantine (
                op_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                physical_ms INTEGER NOT NULL,
                logical INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                quarantined_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Read a metadata value.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn meta(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(storage)
    }

    /// Write a metadata value.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
                (key, value),
            )
            .map_err(storage)?;
        Ok(())
    }

    /// Device this store belongs to, if recorded.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored value is malformed.
    pub fn local_device(&self) -> Result<Option<DeviceId>, SyncError> {
        self.meta(META_LOCAL_DEVICE)?
            .map(|s| s.parse().map_err(|e| SyncError::Storage(format!("{e}"))))
            .transpose()
    }

    /// Time of the last completed sync cycle.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self
            .meta(META_LAST_SYNC)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Record the completion time of a sync cycle.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.set_meta(META_LAST_SYNC, &at.to_rfc3339())
    }

    /// Register a device public key. Returns `true` if the device was new.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn trust_device(&self, device_id: DeviceId, key: &PublicKey) -> Result<bool, SyncError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT public_key FROM trusted_devices WHERE device_id = ?1",
                [device_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO trusted_devices (device_id, public_key, paired_at)
                 VALUES (?1, ?2, ?3)",
                (device_id.to_string(), key.to_base64(), now_secs()),
            )
            .map_err(storage)?;
        Ok(existing.is_none())
    }

    /// Load the trusted device directory.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a stored key is malformed.
    pub fn trusted_devices(&self) -> Result<TrustedDevices, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT device_id, public_key FROM trusted_devices")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(storage)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(storage)?;

        let mut trusted = TrustedDevices::new();
        for (device, key) in rows {
            trusted.insert(parse_device(&device)?, PublicKey::from_base64(&key)?);
        }
        Ok(trusted)
    }

    /// Read a sync watermark for a relay.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn watermark(&self, peer: &str, kind: WatermarkKind) -> Result<Option<Timestamp>, SyncError> {
        let row = self
            .conn
            .query_row(
                "SELECT physical_ms, logical, device_id FROM sync_watermarks
                 WHERE peer = ?1 AND kind = ?2",
                (peer, kind.as_str()),
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(|(physical, logical, device)| to_timestamp(physical, logical, &device))
            .transpose()
    }

    /// Highest push watermark across all relays.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn max_push_watermark(&self) -> Result<Option<Timestamp>, SyncError> {
        let row = self
            .conn
            .query_row(
                "SELECT physical_ms, logical, device_id FROM sync_watermarks
                 WHERE kind = 'push'
                 ORDER BY physical_ms DESC, logical DESC, device_id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(|(physical, logical, device)| to_timestamp(physical, logical, &device))
            .transpose()
    }

    /// Persist a sync watermark for a relay.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn set_watermark(
        &self,
        peer: &str,
        kind: WatermarkKind,
        hlc: &Timestamp,
    ) -> Result<(), SyncError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_watermarks
                 (peer, kind, physical_ms, logical, device_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    peer,
                    kind.as_str(),
                    to_i64(hlc.physical_ms).map_err(storage)?,
                    hlc.logical,
                    hlc.device_id.to_string(),
                    now_secs()
                ],
            )
            .map_err(storage)?;
        Ok(())
    }

    /// Events of one device with `hlc > after`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn device_events_after(
        &self,
        device_id: DeviceId,
        after: Option<&Timestamp>,
        limit: usize,
    ) -> Result<Vec<Event>, SyncError> {
        let (physical, logical) = after_key(after)?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE device_id = ?1 AND (physical_ms, logical) > (?2, ?3)
             ORDER BY physical_ms, logical LIMIT ?4"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(storage)?;
        let rows = stmt
            .query_map(
                params![device_id.to_string(), physical, logical, to_limit(limit)],
                read_row,
            )
            .map_err(storage)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(storage)?;
        rows.into_iter().map(RawEvent::into_event).collect()
    }

    /// Number of a device's events with `hlc > after`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn count_device_events_after(
        &self,
        device_id: DeviceId,
        after: Option<&Timestamp>,
    ) -> Result<usize, SyncError> {
        let (physical, logical) = after_key(after)?;
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM events
                 WHERE device_id = ?1 AND (physical_ms, logical) > (?2, ?3)",
                params![device_id.to_string(), physical, logical],
                |row| row.get(0),
            )
            .map_err(storage)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Record a rejected event. Re-recording the same `op_id` keeps the first entry.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn record_quarantine(&self, entry: &Quarantined) -> Result<(), SyncError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO quarantine
                 (op_id, device_id, physical_ms, logical, entity_type, reason, quarantined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.op_id.to_string(),
                    entry.device_id.to_string(),
                    to_i64(entry.hlc.physical_ms).map_err(storage)?,
                    entry.hlc.logical,
                    entry.entity_type,
                    entry.reason.as_str(),
                    now_secs()
                ],
            )
            .map_err(storage)?;
        Ok(())
    }

    /// Forget a rejection once the event has been accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn release_quarantine(&self, op_id: &Uuid) -> Result<bool, SyncError> {
        let removed = self
            .conn
            .execute("DELETE FROM quarantine WHERE op_id = ?1", [op_id.to_string()])
            .map_err(storage)?;
        Ok(removed > 0)
    }

    /// Number of quarantined events.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn quarantined_count(&self) -> Result<usize, SyncError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM quarantine", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Quarantined events, most recent first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a row is malformed.
    pub fn quarantined(&self, limit: usize) -> Result<Vec<Quarantined>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT op_id, device_id, physical_ms, logical, entity_type, reason
                 FROM quarantine ORDER BY quarantined_at DESC, op_id LIMIT ?1",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map([to_limit(limit)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(storage)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(storage)?;

        rows.into_iter()
            .map(|(op_id, device, physical, logical, entity_type, reason)| {
                Ok(Quarantined {
                    op_id: parse_uuid(&op_id)?,
                    device_id: parse_device(&device)?,
                    hlc: to_timestamp(physical, logical, &device)?,
                    entity_type,
                    reason: reason.parse()?,
                })
            })
            .collect()
    }

    /// Lowest push watermark across all relays.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn min_push_watermark(&self) -> Result<Option<Timestamp>, SyncError> {
        let row = self
            .conn
            .query_row(
                "SELECT physical_ms, logical, device_id FROM sync_watermarks
                 WHERE kind = 'push'
                 ORDER BY physical_ms, logical, device_id LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(|(physical, logical, device)| to_timestamp(physical, logical, &device))
            .transpose()
    }

    /// Delete expired events of ephemeral entity types.
    ///
    /// An event expires when its HLC physical time is older than `now_ms - ttl`.
    /// Events of `local` are only deleted once every relay has acknowledged
    /// them, so peers never receive a chain with a hole in it. Chain links and
    /// heads are kept.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub fn prune_expired(
        &mut self,
        ttls: &HashMap<String, Duration>,
        now_ms: u64,
        local: DeviceId,
    ) -> Result<usize, SyncError> {
        let (pushed_physical, pushed_logical) = after_key(self.min_push_watermark()?.as_ref())?;
        let local = local.to_string();
        let tx = self.conn.transaction().map_err(storage)?;
        let mut deleted = 0;
        for (entity_type, ttl) in ttls {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            let cutoff = to_i64(now_ms.saturating_sub(ttl_ms)).map_err(storage)?;
            deleted += tx
                .execute(
                    "DELETE FROM events
                     WHERE entity_type = ?1 AND physical_ms < ?2
                       AND (device_id != ?3 OR (physical_ms, logical) <= (?4, ?5))",
                    params![entity_type, cutoff, local, pushed_physical, pushed_logical],
                )
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(deleted)
    }
}

impl EventLog for SqliteStore {
    fn append(&mut self, event: &Event) -> Result<Appended, SyncError> {
        let tx = self.conn.transaction().map_err(storage)?;
        let op_id = event.op_id.to_string();
        let device = event.device_id.to_string();

        let exists: bool = tx
            .query_row("SELECT 1 FROM events WHERE op_id = ?1", [&op_id], |_| Ok(true))
            .optional()
            .map_err(storage)?
            .unwrap_or(false);
        let pruned: bool = tx
            .query_row("SELECT 1 FROM chain_links WHERE op_id = ?1", [&op_id], |_| Ok(true))
            .optional()
            .map_err(storage)?
            .unwrap_or(false);
        if exists || pruned {
            return Ok(Appended::Duplicate);
        }

        let head = chain_head(&tx, event.device_id)?;
        if event.prev_hash != head {
            return Err(SyncError::ChainIntegrity {
                device_id: event.device_id,
                expected: head,
                found: event.prev_hash,
            });
        }

        let physical = to_i64(event.hlc.physical_ms).map_err(storage)?;
        let prev = event.prev_hash.map(|h| h.as_bytes().to_vec());
        tx.execute(
            &format!(
                "INSERT INTO events ({EVENT_COLUMNS}, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                op_id,
                physical,
                event.hlc.logical,
                device,
                event.entity_type,
                event.entity_id,
                event.op.as_str(),
                event.cipher_blob.nonce.to_vec(),
                event.cipher_blob.ciphertext,
                prev,
                event.hash.as_bytes().to_vec(),
                event.signature.to_bytes().to_vec(),
                now_secs()
            ],
        )
        .map_err(storage)?;
        record_link(&tx, &ChainLink::of(event))?;
        tx.commit().map_err(storage)?;

        Ok(Appended::Inserted)
    }

    fn bridge(&mut self, link: &ChainLink) -> Result<Appended, SyncError> {
        let tx = self.conn.transaction().map_err(storage)?;
        let known: bool = tx
            .query_row(
                "SELECT 1 FROM chain_links WHERE op_id = ?1",
                [link.op_id.to_string()],
                |_| Ok(true),
            )
            .optional()
            .map_err(storage)?
            .unwrap_or(false);
        if known {
            return Ok(Appended::Duplicate);
        }

        let head = chain_head(&tx, link.device_id)?;
        if link.prev_hash != head {
            return Err(SyncError::ChainIntegrity {
                device_id: link.device_id,
                expected: head,
                found: link.prev_hash,
            });
        }

        record_link(&tx, link)?;
        tx.commit().map_err(storage)?;
        Ok(Appended::Inserted)
    }

    fn pruned_links(&self) -> Result<Vec<ChainLink>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT l.op_id, l.physical_ms, l.logical, l.device_id, l.hash, l.prev_hash
                 FROM chain_links l
                 WHERE NOT EXISTS (SELECT 1 FROM events e WHERE e.op_id = l.op_id)
                 ORDER BY l.physical_ms, l.logical, l.device_id",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                ))
            })
            .map_err(storage)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(storage)?;

        rows.into_iter()
            .map(|(op_id, physical, logical, device, hash, prev_hash)| {
                Ok(ChainLink {
                    device_id: parse_device(&device)?,
                    op_id: parse_uuid(&op_id)?,
                    hlc: to_timestamp(physical, logical, &device)?,
                    hash: EventHash::from_slice(&hash)?,
                    prev_hash: prev_hash.map(|h| EventHash::from_slice(&h)).transpose()?,
                })
            })
            .collect()
    }

    fn contains(&self, op_id: &Uuid) -> Result<bool, SyncError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM chain_links WHERE op_id = ?1",
                [op_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        Ok(found.is_some())
    }

    fn head(&self, device_id: DeviceId) -> Result<Option<EventHash>, SyncError> {
        chain_head(&self.conn, device_id)
    }

    fn devices(&self) -> Result<Vec<DeviceId>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT device_id FROM chain_heads ORDER BY device_id")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(storage)?;
        rows.iter().map(|d| parse_device(d)).collect()
    }

    fn latest(&self, device_id: DeviceId) -> Result<Option<Timestamp>, SyncError> {
        let row: Option<(i64, u32)> = self
            .conn
            .query_row(
                "SELECT physical_ms, logical FROM chain_heads WHERE device_id = ?1",
                [device_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage)?;
        row.map(|(physical, logical)| {
            Ok(Timestamp::new(
                u64::try_from(physical).map_err(|e| SyncError::Storage(e.to_string()))?,
                logical,
                device_id,
            ))
        })
        .transpose()
    }

    fn page_after(&self, since: Option<&Timestamp>, limit: usize) -> Result<Vec<Event>, SyncError> {
        let (physical, logical) = after_key(since)?;
        let device = since.map(|s| s.device_id.to_string()).unwrap_or_default();
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (physical_ms, logical, device_id) > (?1, ?2, ?3)
             ORDER BY physical_ms, logical, device_id LIMIT ?4"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(storage)?;
        let rows = stmt
            .query_map(params![physical, logical, device, to_limit(limit)], read_row)
            .map_err(storage)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(storage)?;
        rows.into_iter().map(RawEvent::into_event).collect()
    }

    fn len(&self) -> Result<usize, SyncError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn chain_head(conn: &Connection, device_id: DeviceId) -> Result<Option<EventHash>, SyncError> {
    let head: Option<Vec<u8>> = conn
        .query_row(
            "SELECT hash FROM chain_heads WHERE device_id = ?1",
            [device_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage)?;
    head.map(|h| EventHash::from_slice(&h)).transpose()
}

/// Record a link and make it the head of its device chain.
fn record_link(conn: &Connection, link: &ChainLink) -> Result<(), SyncError> {
    let device = link.device_id.to_string();
    let hash = link.hash.as_bytes().to_vec();
    let physical = to_i64(link.hlc.physical_ms).map_err(storage)?;
    conn.execute(
        "INSERT INTO chain_links (device_id, hash, prev_hash, op_id, physical_ms, logical)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            device,
            hash,
            link.prev_hash.map(|h| h.as_bytes().to_vec()),
            link.op_id.to_string(),
            physical,
            link.hlc.logical
        ],
    )
    .map_err(storage)?;
    conn.execute(
        "INSERT OR REPLACE INTO chain_heads (device_id, hash, physical_ms, logical)
         VALUES (?1, ?2, ?3, ?4)",
        params![device, hash, physical, link.hlc.logical],
    )
    .map_err(storage)?;
    Ok(())
}

/// Columns of one `events` row before validation.
struct RawEvent {
    op_id: String,
    physical_ms: i64,
    logical: u32,
    device_id: String,
    entity_type: String,
    entity_id: String,
    op: String,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    prev_hash: Option<Vec<u8>>,
    hash: Vec<u8>,
    signature: Vec<u8>,
}

fn read_row(row: &Row<'_>) -> SqliteResult<RawEvent> {
    Ok(RawEvent {
        op_id: row.get(0)?,
        physical_ms: row.get(1)?,
        logical: row.get(2)?,
        device_id: row.get(3)?,
        entity_type: row.get(4)?,
        entity_id: row.get(5)?,
        op: row.get(6)?,
        nonce: row.get(7)?,
        ciphertext: row.get(8)?,
        prev_hash: row.get(9)?,
        hash: row.get(10)?,
        signature: row.get(11)?,
    })
}

impl RawEvent {
    fn into_event(self) -> Result<Event, SyncError> {
        let corrupt = |what: &str| SyncError::Storage(format!("corrupt {what} in event {}", self.op_id));

        let nonce: [u8; NONCE_SIZE] = self
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| corrupt("nonce"))?;
        let signature: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| corrupt("signature"))?;

        Ok(Event {
            op_id: parse_uuid(&self.op_id)?,
            hlc: to_timestamp(self.physical_ms, self.logical, &self.device_id)?,
            device_id: parse_device(&self.device_id)?,
            op: self.op.parse()?,
            cipher_blob: CipherBlob {
                nonce,
                ciphertext: self.ciphertext,
            },
            prev_hash: self
                .prev_hash
                .as_deref()
                .map(EventHash::from_slice)
                .transpose()?,
            hash: EventHash::from_slice(&self.hash)?,
            signature: EventSignature::from_bytes(signature),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
        })
    }
}

fn storage(e: rusqlite::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn parse_device(s: &str) -> Result<DeviceId, SyncError> {
    s.parse()
        .map_err(|e| SyncError::Storage(format!("invalid device id '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, SyncError> {
    Uuid::parse_str(s).map_err(|e| SyncError::Storage(format!("invalid op_id '{s}': {e}")))
}

fn to_timestamp(physical: i64, logical: u32, device: &str) -> Result<Timestamp, SyncError> {
    let physical = u64::try_from(physical).map_err(|e| SyncError::Storage(e.to_string()))?;
    Ok(Timestamp::new(physical, logical, parse_device(device)?))
}

/// Keyset lower bound; `(-1, 0)` sorts before every stored event.
fn after_key(after: Option<&Timestamp>) -> Result<(i64, u32), SyncError> {
    match after {
        Some(ts) => Ok((to_i64(ts.physical_ms).map_err(storage)?, ts.logical)),
        None => Ok((-1, 0)),
    }
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn to_i64(value: u64) -> SqliteResult<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::verify::QuarantineReason;
    use opsync_core::{EventBuilder, Hlc, KeyStore, ManualClock, Op, SchemaRegistry, WallClock};
    use serde_json::json;
    use std::sync::Arc;

    struct Writer {
        builder: EventBuilder,
        wall: Arc<ManualClock>,
        keys: Arc<KeyStore>,
    }

    impl Writer {
        fn new(id: u8) -> Self {
            let keys = Arc::new(KeyStore::generate(DeviceId::from_bytes([id; 8])));
            let wall = Arc::new(ManualClock::new(1_000));
            let clock = Hlc::with_clock(keys.device_id(), wall.clone());
            Self {
                builder: EventBuilder::new(keys.clone(), Arc::new(SchemaRegistry::new()), clock),
                wall,
                keys,
            }
        }

        fn write(&mut self, store: &mut SqliteStore, entity_type: &str, n: u64) -> Event {
            self.wall.advance(10);
            self.builder
                .create_event(store, entity_type, "e", Op::Update, &json!({"n": n}))
                .unwrap()
        }
    }

    #[test]
    fn events_roundtrip_through_rows() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut writer = Writer::new(1);
        let first = writer.write(&mut store, "memory", 1);
        let second = writer.write(&mut store, "memory", 2);

        let all = store.export_all().unwrap();
        assert_eq!(all, vec![first.clone(), second.clone()]);
        assert!(all.iter().all(Event::verify_hash));
        assert!(all[1].verify_signature(&writer.keys.public_key()));
        assert_eq!(store.head(writer.keys.device_id()).unwrap(), Some(second.hash));
        assert_eq!(store.latest(writer.keys.device_id()).unwrap(), Some(second.hlc));
    }

    #[test]
    fn append_enforces_chain_and_idempotency() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut writer = Writer::new(1);
        let first = writer.write(&mut store, "memory", 1);

        assert_eq!(store.append(&first).unwrap(), Appended::Duplicate);

        let mut orphan = first.clone();
        orphan.op_id = Uuid::new_v4();
        assert!(matches!(
            store.append(&orphan),
            Err(SyncError::ChainIntegrity { .. })
        ));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn keyset_pages_interleave_devices() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut a = Writer::new(1);
        let mut b = Writer::new(2);
        for n in 0..5 {
            a.write(&mut store, "memory", n);
            b.write(&mut store, "memory", n);
        }

        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = store.page_after(after.as_ref(), 3).unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|e| e.hlc);
            seen.extend(page);
        }
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0].hlc < w[1].hlc));
        assert_eq!(store.devices().unwrap().len(), 2);
    }

    #[test]
    fn watermarks_and_meta_persist() {
        let store = SqliteStore::in_memory().unwrap();
        let hlc = Timestamp::new(42, 7, DeviceId::from_bytes([2; 8]));

        assert_eq!(store.watermark("relay", WatermarkKind::Pull).unwrap(), None);
        store.set_watermark("relay", WatermarkKind::Pull, &hlc).unwrap();
        store
            .set_watermark("relay", WatermarkKind::Push, &Timestamp::new(40, 0, hlc.device_id))
            .unwrap();

        assert_eq!(store.watermark("relay", WatermarkKind::Pull).unwrap(), Some(hlc));
        assert_eq!(
            store.max_push_watermark().unwrap().map(|t| t.physical_ms),
            Some(40)
        );

        let now = Utc::now();
        store.set_last_sync(now).unwrap();
        assert_eq!(
            store.last_sync().unwrap().map(|t| t.timestamp()),
            Some(now.timestamp())
        );
    }

    #[test]
    fn unsynced_counts_own_events_after_watermark() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut writer = Writer::new(1);
        let events: Vec<_> = (0..4).map(|n| writer.write(&mut store, "memory", n)).collect();
        let device = writer.keys.device_id();

        assert_eq!(store.count_device_events_after(device, None).unwrap(), 4);
        assert_eq!(
            store
                .count_device_events_after(device, Some(&events[1].hlc))
                .unwrap(),
            2
        );
        let batch = store
            .device_events_after(device, Some(&events[0].hlc), 2)
            .unwrap();
        assert_eq!(batch, events[1..3].to_vec());
    }

    #[test]
    fn pruning_keeps_chain_links() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut writer = Writer::new(1);
        let presence = writer.write(&mut store, "presence", 1);
        writer.wall.advance(120_000);
        let memory = writer.write(&mut store, "memory", 2);

        // The writer is a remote device here
        let local = DeviceId::from_bytes([7; 8]);
        let ttls = HashMap::from([("presence".to_string(), Duration::from_secs(60))]);
        let now = memory.hlc.physical_ms;
        assert_eq!(store.prune_expired(&ttls, now, local).unwrap(), 1);

        assert_eq!(store.len().unwrap(), 1);
        assert!(store.contains(&presence.op_id).unwrap());
        assert_eq!(store.append(&presence).unwrap(), Appended::Duplicate);
        assert_eq!(store.pruned_links().unwrap(), vec![ChainLink::of(&presence)]);

        // The chain continues across the pruned gap
        let next = writer.write(&mut store, "memory", 3);
        assert_eq!(next.prev_hash, Some(memory.hash));
    }

    #[test]
    fn own_events_are_pruned_only_once_every_relay_has_them() {
        let mut store = SqliteStore::in_memory().unwrap();
        let mut writer = Writer::new(1);
        let local = writer.keys.device_id();
        let first = writer.write(&mut store, "presence", 1);
        let second = writer.write(&mut store, "presence", 2);
        writer.wall.advance(120_000);
        let ttls = HashMap::from([("presence".to_string(), Duration::from_secs(60))]);
        let now = writer.wall.now_ms();

        assert_eq!(store.prune_expired(&ttls, now, local).unwrap(), 0);

        store.set_watermark("a", WatermarkKind::Push, &second.hlc).unwrap();
        store.set_watermark("b", WatermarkKind::Push, &first.hlc).unwrap();
        assert_eq!(store.min_push_watermark().unwrap(), Some(first.hlc));
        assert_eq!(store.prune_expired(&ttls, now, local).unwrap(), 1);
        assert_eq!(store.export_all().unwrap(), vec![second.clone()]);

        store.set_watermark("b", WatermarkKind::Push, &second.hlc).unwrap();
        assert_eq!(store.prune_expired(&ttls, now, local).unwrap(), 1);
        assert!(store.is_empty().unwrap());
        assert_eq!(store.head(local).unwrap(), Some(second.hash));
    }

    #[test]
    fn bridge_requires_the_current_head() {
        let mut source = SqliteStore::in_memory().unwrap();
        let mut writer = Writer::new(1);
        let first = writer.write(&mut source, "memory", 1);
        let gone = writer.write(&mut source, "presence", 2);
        let last = writer.write(&mut source, "memory", 3);

        let mut store = SqliteStore::in_memory().unwrap();
        assert!(matches!(
            store.bridge(&ChainLink::of(&gone)),
            Err(SyncError::ChainIntegrity { .. })
        ));
        store.append(&first).unwrap();
        assert_eq!(store.bridge(&ChainLink::of(&gone)).unwrap(), Appended::Inserted);
        assert_eq!(store.bridge(&ChainLink::of(&gone)).unwrap(), Appended::Duplicate);
        assert_eq!(store.append(&last).unwrap(), Appended::Inserted);

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.latest(writer.keys.device_id()).unwrap(), Some(last.hlc));
        assert_eq!(store.pruned_links().unwrap(), vec![ChainLink::of(&gone)]);
    }

    #[test]
    fn trusted_devices_and_quarantine() {
        let store = SqliteStore::in_memory().unwrap();
        let keys = KeyStore::generate(DeviceId::from_bytes([6; 8]));

        assert!(store.trust_device(keys.device_id(), &keys.public_key()).unwrap());
        assert!(!store.trust_device(keys.device_id(), &keys.public_key()).unwrap());
        let trusted = store.trusted_devices().unwrap();
        assert_eq!(trusted.len(), 1);
        assert!(trusted.get(&keys.device_id()).is_some());

        let entry = Quarantined {
            op_id: Uuid::new_v4(),
            device_id: keys.device_id(),
            hlc: Timestamp::new(5, 0, keys.device_id()),
            entity_type: "memory".to_string(),
            reason: QuarantineReason::BadSignature,
        };
        store.record_quarantine(&entry).unwrap();
        store.record_quarantine(&entry).unwrap();
        assert_eq!(store.quarantined_count().unwrap(), 1);
        assert_eq!(store.quarantined(10).unwrap(), vec![entry.clone()]);

        assert!(store.release_quarantine(&entry.op_id).unwrap());
        assert!(!store.release_quarantine(&entry.op_id).unwrap());
        assert_eq!(store.quarantined_count().unwrap(), 0);
    }

    #[test]
    fn reopening_a_file_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let mut writer = Writer::new(1);
        let event = {
            let mut store = SqliteStore::open(&path).unwrap();
            store.set_meta(META_LOCAL_DEVICE, &writer.keys.device_id().to_string()).unwrap();
            writer.write(&mut store, "memory", 1)
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.export_all().unwrap(), vec![event]);
        assert_eq!(store.local_device().unwrap(), Some(writer.keys.device_id()));
    }
}
