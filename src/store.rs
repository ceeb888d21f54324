use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};

use crate::model::{ColumnValue, EntityId, EntityKind, Record};
use crate::registry::{ColumnTable, Registry, SqlType};
use crate::season::{Season, SeasonType};
use crate::tracker;

/// SQLite sink for stat rows, entity rows and the backfill tracker.
pub struct Store {
    conn: Mutex<Connection>,
}

pub fn table_name(owner: EntityKind, table: ColumnTable) -> &'static str {
    match (owner.row_owner(), table) {
        (EntityKind::Player, ColumnTable::Stats) => "player_season_stats",
        (EntityKind::Player, ColumnTable::Entity) => "players",
        (_, ColumnTable::Stats) => "team_season_stats",
        (_, ColumnTable::Entity) => "teams",
    }
}

/// Conflict keys of a table: the entity id, plus season and season type for stats.
pub fn conflict_keys(owner: EntityKind, table: ColumnTable) -> Vec<&'static str> {
    match table {
        ColumnTable::Stats => vec![owner.key_column(), "year", "season_type"],
        ColumnTable::Entity => vec![owner.key_column()],
    }
}

impl Store {
    pub fn open(path: &Path, registry: &Registry) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("enable wal journal")?;
        Self::from_connection(conn, registry)
    }

    pub fn open_in_memory(registry: &Registry) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        Self::from_connection(conn, registry)
    }

    fn from_connection(conn: Connection, registry: &Registry) -> Result<Self> {
        init_schema(&conn, registry)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Inserts or updates rows keyed by `conflict_keys`. Only the columns a
    /// row carries are written, so partial rows never clear other columns.
    pub fn upsert(&self, table: &str, rows: &[Record], conflict_keys: &[&str]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("begin upsert transaction")?;
        for row in rows {
            let sql = upsert_sql(table, row, conflict_keys);
            let mut stmt = tx
                .prepare_cached(&sql)
                .with_context(|| format!("prepare upsert into {table}"))?;
            stmt.execute(params_from_iter(row.values()))
                .with_context(|| format!("upsert into {table}"))?;
        }
        tx.commit().context("commit upsert transaction")?;
        Ok(rows.len())
    }

    pub fn games_played(
        &self,
        owner: EntityKind,
        season: Season,
        season_type: SeasonType,
    ) -> Result<HashMap<EntityId, i64>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {key}, games_played FROM {table} WHERE year = ?1 AND season_type = ?2 AND games_played IS NOT NULL",
            key = owner.key_column(),
            table = table_name(owner, ColumnTable::Stats),
        );
        let mut stmt = conn.prepare(&sql).context("prepare games played query")?;
        let rows = stmt
            .query_map(
                (season.end_year(), season_type.code()),
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .context("query games played")?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, gp) = row.context("read games played row")?;
            out.insert(id, gp);
        }
        Ok(out)
    }

    /// Entities with a stats row for the season, in id order.
    pub fn entity_ids(
        &self,
        owner: EntityKind,
        season: Season,
        season_type: SeasonType,
    ) -> Result<Vec<EntityId>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {key} FROM {table} WHERE year = ?1 AND season_type = ?2 ORDER BY {key}",
            key = owner.key_column(),
            table = table_name(owner, ColumnTable::Stats),
        );
        let mut stmt = conn.prepare(&sql).context("prepare entity id query")?;
        let ids = stmt
            .query_map((season.end_year(), season_type.code()), |row| {
                row.get::<_, i64>(0)
            })
            .context("query entity ids")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read entity ids")?;
        Ok(ids)
    }

    /// Entities with a stats row in any stored season, in id order.
    pub fn all_entity_ids(&self, owner: EntityKind) -> Result<Vec<EntityId>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT DISTINCT {key} FROM {table} ORDER BY {key}",
            key = owner.key_column(),
            table = table_name(owner, ColumnTable::Stats),
        );
        let mut stmt = conn.prepare(&sql).context("prepare all entity ids query")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("query all entity ids")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read all entity ids")?;
        Ok(ids)
    }

    pub fn entity_row(&self, owner: EntityKind, id: EntityId) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT * FROM {table} WHERE {key} = ?1",
            key = owner.key_column(),
            table = table_name(owner, ColumnTable::Entity),
        );
        let mut stmt = conn.prepare(&sql).context("prepare entity row query")?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt
            .query_map([id], |row| read_record(row, &names))
            .context("query entity row")?;
        rows.next()
            .transpose()
            .context("read entity row")
    }

    /// Stats rows for one season joined with the entity's name.
    pub fn load_season_rows(
        &self,
        owner: EntityKind,
        season: Season,
        season_type: SeasonType,
    ) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let key = owner.key_column();
        let sql = format!(
            "SELECT e.name AS name, s.* FROM {stats} s LEFT JOIN {entity} e ON e.{key} = s.{key} \
             WHERE s.year = ?1 AND s.season_type = ?2 ORDER BY s.{key}",
            stats = table_name(owner, ColumnTable::Stats),
            entity = table_name(owner, ColumnTable::Entity),
        );
        let mut stmt = conn.prepare(&sql).context("prepare season rows query")?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows = stmt
            .query_map((season.end_year(), season_type.code()), |row| {
                read_record(row, &names)
            })
            .context("query season rows")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read season rows")?;
        Ok(rows)
    }
}

fn read_record(row: &rusqlite::Row<'_>, names: &[String]) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (idx, name) in names.iter().enumerate() {
        let value: SqlValue = row.get(idx)?;
        record.insert(name.clone(), from_sql_value(value));
    }
    Ok(record)
}

fn from_sql_value(value: SqlValue) -> ColumnValue {
    match value {
        SqlValue::Null => ColumnValue::Null,
        SqlValue::Integer(v) => ColumnValue::Int(v),
        SqlValue::Real(v) => ColumnValue::Float(v),
        SqlValue::Text(v) => match NaiveDate::parse_from_str(&v, "%Y-%m-%d") {
            Ok(date) => ColumnValue::Date(date),
            Err(_) => ColumnValue::Text(v),
        },
        SqlValue::Blob(_) => ColumnValue::Null,
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn upsert_sql(table: &str, row: &Record, conflict_keys: &[&str]) -> String {
    let columns: Vec<String> = row.keys().map(|c| quote(c)).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
    let keys: Vec<String> = conflict_keys.iter().map(|k| quote(k)).collect();
    let updates: Vec<String> = row
        .keys()
        .filter(|c| !conflict_keys.contains(&c.as_str()))
        .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {table} ({cols}) VALUES ({vals}) ON CONFLICT({keys}) {action}",
        table = quote(table),
        cols = columns.join(", "),
        vals = placeholders.join(", "),
        keys = keys.join(", "),
    )
}

fn column_ddl(name: &str, sql_type: SqlType, nullable: bool) -> String {
    let mut ddl = format!("{} {}", quote(name), sql_type.ddl());
    if !nullable {
        let fallback = match sql_type {
            SqlType::Integer => "0",
            SqlType::Real => "0.0",
            SqlType::Text | SqlType::Date => "''",
        };
        ddl.push_str(&format!(" NOT NULL DEFAULT {fallback}"));
    }
    ddl
}

/// Creates the stat and entity tables from the registry, then the tracker.
/// Columns added to the registry later are appended with `ALTER TABLE`.
pub fn init_schema(conn: &Connection, registry: &Registry) -> Result<()> {
    for owner in [EntityKind::Player, EntityKind::Team] {
        for table in [ColumnTable::Entity, ColumnTable::Stats] {
            let name = table_name(owner, table);
            let key = owner.key_column();
            let mut defs = vec![format!("{} INTEGER NOT NULL", quote(key))];
            if table == ColumnTable::Stats {
                defs.push("\"year\" INTEGER NOT NULL".to_string());
                defs.push("\"season_type\" INTEGER NOT NULL".to_string());
            }
            let columns = stored_columns(registry, owner, table);
            for (col, sql_type, nullable) in &columns {
                defs.push(column_ddl(col, *sql_type, *nullable));
            }
            let pk: Vec<String> = conflict_keys(owner, table).iter().map(|k| quote(k)).collect();
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
                quote(name),
                defs.join(",\n    ")
            ))
            .with_context(|| format!("create table {name}"))?;
            add_missing_columns(conn, name, &columns)?;
        }
    }
    tracker::init_schema(conn)?;
    Ok(())
}

fn stored_columns(
    registry: &Registry,
    owner: EntityKind,
    table: ColumnTable,
) -> Vec<(String, SqlType, bool)> {
    let nullable: BTreeMap<String, bool> = registry
        .columns()
        .iter()
        .flat_map(|c| {
            [
                (c.stored_name(owner), c.nullable),
                (c.stored_name(EntityKind::Opponent), c.nullable),
            ]
        })
        .collect();
    registry
        .stored_columns(owner, table)
        .into_iter()
        .map(|(name, sql_type)| {
            let is_nullable = nullable.get(&name).copied().unwrap_or(true);
            (name, sql_type, is_nullable)
        })
        .collect()
}

fn add_missing_columns(
    conn: &Connection,
    table: &str,
    columns: &[(String, SqlType, bool)],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote(table)))
        .context("read table info")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .context("query table info")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read table columns")?;
    for (name, sql_type, _) in columns {
        if existing.iter().any(|c| c == name) {
            continue;
        }
        // Added columns stay nullable: SQLite cannot backfill NOT NULL without a default per row.
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote(table),
            column_ddl(name, *sql_type, true)
        ))
        .with_context(|| format!("add column {name} to {table}"))?;
    }
    Ok(())
}
