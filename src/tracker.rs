use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::EntityKind;
use crate::plan::UnitKey;
use crate::season::{Season, SeasonType};
use crate::store::Store;

/// An `in_progress` unit older than this is assumed abandoned by a crashed run.
pub const STALE_AFTER_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Complete => "complete",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(UnitStatus::Pending),
            "in_progress" => Some(UnitStatus::InProgress),
            "complete" => Some(UnitStatus::Complete),
            "failed" => Some(UnitStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    pub key: UnitKey,
    pub status: UnitStatus,
    pub entities_processed: i64,
    pub last_attempt_at: Option<String>,
    pub error_message: Option<String>,
}

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS backfill_endpoint_tracker (
            endpoint TEXT NOT NULL,
            year INTEGER NOT NULL,
            season_type INTEGER NOT NULL,
            params TEXT NOT NULL,
            entity TEXT NOT NULL,
            status TEXT NOT NULL,
            entities_processed INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT NULL,
            error_message TEXT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (endpoint, year, season_type, params, entity)
        );
        CREATE INDEX IF NOT EXISTS idx_tracker_status ON backfill_endpoint_tracker(status);
        "#,
    )
    .context("create tracker schema")?;
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Durable completion record per backfill unit.
pub struct Tracker<'a> {
    store: &'a Store,
}

impl<'a> Tracker<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Records the unit as `pending` unless it is already known.
    pub fn ensure_pending(&self, key: &UnitKey) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            r#"
            INSERT INTO backfill_endpoint_tracker
                (endpoint, year, season_type, params, entity, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
            ON CONFLICT(endpoint, year, season_type, params, entity) DO NOTHING
            "#,
            params![
                key.endpoint,
                key.season.end_year(),
                key.season_type.code(),
                key.signature,
                key.entity.as_str(),
                timestamp(Utc::now()),
            ],
        )
        .context("insert pending unit")?;
        Ok(())
    }

    pub fn try_claim(&self, key: &UnitKey, force: bool) -> Result<bool> {
        self.try_claim_at(key, force, Utc::now())
    }

    /// Moves the unit to `in_progress` if it is claimable, in one statement.
    ///
    /// Claimable means pending, failed, stale in-progress, or (with `force`)
    /// complete. Returns whether this caller won the claim.
    pub fn try_claim_at(&self, key: &UnitKey, force: bool, now: DateTime<Utc>) -> Result<bool> {
        let stale_before = timestamp(now - ChronoDuration::minutes(STALE_AFTER_MINUTES));
        let conn = self.store.conn()?;
        let changed = conn
            .execute(
                r#"
                INSERT INTO backfill_endpoint_tracker
                    (endpoint, year, season_type, params, entity, status,
                     entities_processed, last_attempt_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 'in_progress', 0, ?6, ?6)
                ON CONFLICT(endpoint, year, season_type, params, entity) DO UPDATE SET
                    status = 'in_progress',
                    last_attempt_at = excluded.last_attempt_at,
                    updated_at = excluded.updated_at,
                    error_message = NULL
                WHERE backfill_endpoint_tracker.status IN ('pending', 'failed')
                   OR (backfill_endpoint_tracker.status = 'in_progress'
                       AND (backfill_endpoint_tracker.last_attempt_at IS NULL
                            OR backfill_endpoint_tracker.last_attempt_at < ?7))
                   OR (?8 = 1 AND backfill_endpoint_tracker.status = 'complete')
                "#,
                params![
                    key.endpoint,
                    key.season.end_year(),
                    key.season_type.code(),
                    key.signature,
                    key.entity.as_str(),
                    timestamp(now),
                    stale_before,
                    force as i64,
                ],
            )
            .context("claim backfill unit")?;
        Ok(changed == 1)
    }

    pub fn mark_complete(&self, key: &UnitKey, entities_processed: usize) -> Result<()> {
        self.set_status(key, UnitStatus::Complete, entities_processed, None)
    }

    pub fn mark_failed(&self, key: &UnitKey, error: &str, entities_processed: usize) -> Result<()> {
        self.set_status(key, UnitStatus::Failed, entities_processed, Some(error))
    }

    fn set_status(
        &self,
        key: &UnitKey,
        status: UnitStatus,
        entities_processed: usize,
        error: Option<&str>,
    ) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.store.conn()?;
        conn.execute(
            r#"
            INSERT INTO backfill_endpoint_tracker
                (endpoint, year, season_type, params, entity, status,
                 entities_processed, last_attempt_at, error_message, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?8)
            ON CONFLICT(endpoint, year, season_type, params, entity) DO UPDATE SET
                status = excluded.status,
                entities_processed = excluded.entities_processed,
                last_attempt_at = excluded.last_attempt_at,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            "#,
            params![
                key.endpoint,
                key.season.end_year(),
                key.season_type.code(),
                key.signature,
                key.entity.as_str(),
                status.as_str(),
                entities_processed as i64,
                now,
                error,
            ],
        )
        .with_context(|| format!("mark unit {status}"))?;
        Ok(())
    }

    pub fn status(&self, key: &UnitKey) -> Result<Option<UnitRecord>> {
        let conn = self.store.conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT endpoint, year, season_type, params, entity, status,
                       entities_processed, last_attempt_at, error_message
                FROM backfill_endpoint_tracker
                WHERE endpoint = ?1 AND year = ?2 AND season_type = ?3 AND params = ?4 AND entity = ?5
                "#,
                params![
                    key.endpoint,
                    key.season.end_year(),
                    key.season_type.code(),
                    key.signature,
                    key.entity.as_str(),
                ],
                read_raw,
            )
            .optional()
            .context("read unit status")?;
        record.map(RawRecord::into_record).transpose()
    }

    /// Reopens every unit of `endpoint` (optionally one entity kind only).
    pub fn reset_endpoint(&self, endpoint: &str, entity: Option<EntityKind>) -> Result<usize> {
        let now = timestamp(Utc::now());
        let conn = self.store.conn()?;
        let changed = match entity {
            Some(kind) => conn.execute(
                "UPDATE backfill_endpoint_tracker
                 SET status = 'pending', entities_processed = 0, error_message = NULL, updated_at = ?3
                 WHERE endpoint = ?1 AND entity = ?2",
                params![endpoint, kind.row_owner().as_str(), now],
            ),
            None => conn.execute(
                "UPDATE backfill_endpoint_tracker
                 SET status = 'pending', entities_processed = 0, error_message = NULL, updated_at = ?2
                 WHERE endpoint = ?1",
                params![endpoint, now],
            ),
        }
        .with_context(|| format!("reset tracker for {endpoint}"))?;
        Ok(changed)
    }

    pub fn failed_units(&self) -> Result<Vec<UnitRecord>> {
        let conn = self.store.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT endpoint, year, season_type, params, entity, status,
                       entities_processed, last_attempt_at, error_message
                FROM backfill_endpoint_tracker
                WHERE status = 'failed'
                ORDER BY endpoint, year, season_type, params, entity
                "#,
            )
            .context("prepare failed units query")?;
        let raw = stmt
            .query_map([], read_raw)
            .context("query failed units")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read failed units")?;
        raw.into_iter().map(RawRecord::into_record).collect()
    }

    pub fn status_counts(&self) -> Result<BTreeMap<UnitStatus, usize>> {
        let conn = self.store.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM backfill_endpoint_tracker GROUP BY status")
            .context("prepare status counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("query status counts")?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("read status count")?;
            let status =
                UnitStatus::parse(&status).ok_or_else(|| anyhow!("unknown unit status {status}"))?;
            out.insert(status, count as usize);
        }
        Ok(out)
    }
}

struct RawRecord {
    endpoint: String,
    year: i32,
    season_type: i64,
    params: String,
    entity: String,
    status: String,
    entities_processed: i64,
    last_attempt_at: Option<String>,
    error_message: Option<String>,
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        endpoint: row.get(0)?,
        year: row.get(1)?,
        season_type: row.get(2)?,
        params: row.get(3)?,
        entity: row.get(4)?,
        status: row.get(5)?,
        entities_processed: row.get(6)?,
        last_attempt_at: row.get(7)?,
        error_message: row.get(8)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<UnitRecord> {
        let season_type = SeasonType::from_code(self.season_type)
            .ok_or_else(|| anyhow!("unknown season type code {}", self.season_type))?;
        let entity = EntityKind::parse(&self.entity)
            .ok_or_else(|| anyhow!("unknown tracker entity {}", self.entity))?;
        let status = UnitStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown unit status {}", self.status))?;
        Ok(UnitRecord {
            key: UnitKey {
                endpoint: self.endpoint,
                season: Season::from_start_year(self.year - 1),
                season_type,
                signature: self.params,
                entity,
            },
            status,
            entities_processed: self.entities_processed,
            last_attempt_at: self.last_attempt_at,
            error_message: self.error_message,
        })
    }
}
