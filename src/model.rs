use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::NaiveDate;
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type EntityId = i64;

/// Call parameters keyed by their internal (snake_case) names.
pub type ParamSet = BTreeMap<String, Value>;

/// One destination row: column name to value.
pub type Record = BTreeMap<String, ColumnValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Team,
    Opponent,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Team => "team",
            EntityKind::Opponent => "opponent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "player" | "players" => Some(EntityKind::Player),
            "team" | "teams" => Some(EntityKind::Team),
            "opponent" | "opponents" => Some(EntityKind::Opponent),
            _ => None,
        }
    }

    /// Opponent figures live on the team's row, so they share its identity.
    pub fn row_owner(self) -> EntityKind {
        match self {
            EntityKind::Opponent => EntityKind::Team,
            other => other,
        }
    }

    pub fn id_field(self) -> &'static str {
        match self.row_owner() {
            EntityKind::Player => "PLAYER_ID",
            _ => "TEAM_ID",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self.row_owner() {
            EntityKind::Player => "player_id",
            _ => "team_id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granularity of one upstream call. Ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    Player,
    Team,
    League,
}

impl ExecutionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionTier::Player => "player",
            ExecutionTier::Team => "team",
            ExecutionTier::League => "league",
        }
    }
}

impl fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    Daily,
    Annual,
    Never,
}

impl UpdateFrequency {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(UpdateFrequency::Daily),
            "annual" => Some(UpdateFrequency::Annual),
            "never" => Some(UpdateFrequency::Never),
            _ => None,
        }
    }
}

/// A stored cell. `Null` means unknown or not applicable, never zero.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Int(v) => Some(*v as f64),
            ColumnValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            ColumnValue::Float(v) => Some(v.round() as i64),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => Ok(()),
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Text(v) => f.write_str(v),
            ColumnValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
        }
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            ColumnValue::Null => SqlValue::Null,
            ColumnValue::Int(v) => SqlValue::Integer(*v),
            ColumnValue::Float(v) => SqlValue::Real(*v),
            ColumnValue::Text(v) => SqlValue::Text(v.clone()),
            ColumnValue::Date(v) => SqlValue::Text(v.format("%Y-%m-%d").to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// One named table inside an endpoint response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub rows: Vec<HashMap<String, Value>>,
}

impl ResultTable {
    pub fn from_rows(rows: Vec<HashMap<String, Value>>) -> Self {
        Self { rows }
    }

    /// Builds rows from the provider's `headers` + `rowSet` layout.
    pub fn from_header_rows(headers: &[String], row_set: &[Vec<Value>]) -> Self {
        let rows = row_set
            .iter()
            .map(|cells| {
                headers
                    .iter()
                    .cloned()
                    .zip(cells.iter().cloned())
                    .collect::<HashMap<_, _>>()
            })
            .collect();
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.rows.iter().any(|row| row.contains_key(field))
    }
}

/// Every result set returned by one endpoint call, in response order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointResponse {
    pub sets: Vec<(String, ResultTable)>,
}

impl EndpointResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(mut self, name: &str, table: ResultTable) -> Self {
        self.insert(name, table);
        self
    }

    pub fn insert(&mut self, name: &str, table: ResultTable) {
        if let Some(slot) = self.sets.iter_mut().find(|(n, _)| n == name) {
            slot.1 = table;
        } else {
            self.sets.push((name.to_string(), table));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResultTable> {
        self.sets.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn first(&self) -> Option<(&str, &ResultTable)> {
        self.sets.first().map(|(n, t)| (n.as_str(), t))
    }

    /// Concatenates rows of same-named sets; used for per-entity calls.
    pub fn merge(&mut self, other: EndpointResponse) {
        for (name, table) in other.sets {
            if let Some(slot) = self.sets.iter_mut().find(|(n, _)| *n == name) {
                slot.1.rows.extend(table.rows);
            } else {
                self.sets.push((name, table));
            }
        }
    }
}

/// Reads a raw cell as a number; numeric strings count, blanks do not.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
            }
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn value_as_entity_id(v: &Value) -> Option<EntityId> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EndpointResponse, ResultTable, value_as_f64};

    #[test]
    fn header_rows_become_maps() {
        let headers = vec!["TEAM_ID".to_string(), "FG2M".to_string()];
        let table = ResultTable::from_header_rows(&headers, &[vec![json!(1610612748), json!(12)]]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0]["FG2M"], json!(12));
        assert!(table.has_field("TEAM_ID"));
    }

    #[test]
    fn merge_appends_rows_of_matching_sets() {
        let row = |id: i64| {
            ResultTable::from_rows(vec![[("PLAYER_ID".to_string(), json!(id))].into_iter().collect()])
        };
        let mut merged = EndpointResponse::new().with_set("General", row(1));
        merged.merge(EndpointResponse::new().with_set("General", row(2)).with_set("Other", row(3)));
        assert_eq!(merged.get("General").map(|t| t.rows.len()), Some(2));
        assert_eq!(merged.sets.len(), 2);
    }

    #[test]
    fn numeric_strings_parse_and_blanks_do_not() {
        assert_eq!(value_as_f64(&json!("4.5")), Some(4.5));
        assert_eq!(value_as_f64(&json!(" ")), None);
        assert_eq!(value_as_f64(&json!(null)), None);
    }
}
