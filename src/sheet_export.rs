use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Color, Format, Workbook, Worksheet};

use crate::model::{ColumnValue, EntityKind, Record};
use crate::plan::kinds_owned_by;
use crate::registry::{ColumnTable, Registry, SqlType};
use crate::season::{Season, SeasonType};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    Totals,
    PerGame,
    #[default]
    Per36,
    Per100,
}

impl DisplayMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "totals" => Some(DisplayMode::Totals),
            "per_game" | "pergame" => Some(DisplayMode::PerGame),
            "per_36" | "per36" => Some(DisplayMode::Per36),
            "per_100" | "per100" => Some(DisplayMode::Per100),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisplayMode::Totals => "totals",
            DisplayMode::PerGame => "per_game",
            DisplayMode::Per36 => "per_36",
            DisplayMode::Per100 => "per_100",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatKind {
    /// Accumulates over a season; rescaled by the display mode.
    Count,
    /// Already a ratio; shown as stored.
    Rate,
    Games,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetColumn {
    pub stored: String,
    pub header: String,
    scale: i64,
    kind: StatKind,
    pub lower_is_better: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub label: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetTable {
    pub columns: Vec<SheetColumn>,
    pub rows: Vec<SheetRow>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub players: usize,
    pub teams: usize,
}

/// Writes a Players and a Teams worksheet for one season.
pub fn export_season(
    store: &Store,
    registry: &Registry,
    season: Season,
    season_type: SeasonType,
    mode: DisplayMode,
    path: &Path,
) -> Result<ExportReport> {
    let mut workbook = Workbook::new();
    let mut report = ExportReport::default();
    for (owner, sheet_name) in [(EntityKind::Player, "Players"), (EntityKind::Team, "Teams")] {
        let records = store.load_season_rows(owner, season, season_type)?;
        let table = build_table(registry, owner, &records, mode);
        match owner {
            EntityKind::Player => report.players = table.rows.len(),
            _ => report.teams = table.rows.len(),
        }
        let sheet = workbook.add_worksheet();
        sheet.set_name(sheet_name)?;
        write_table(sheet, &table)?;
    }
    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;
    Ok(report)
}

/// Display values for every stored stat column of `owner`'s rows.
pub fn build_table(
    registry: &Registry,
    owner: EntityKind,
    records: &[Record],
    mode: DisplayMode,
) -> SheetTable {
    let mut columns = Vec::new();
    for col in registry.columns().iter().filter(|c| c.table == ColumnTable::Stats) {
        for kind in kinds_owned_by(owner.row_owner()) {
            if !col.applies_to.contains(kind) {
                continue;
            }
            let stored = col.stored_name(*kind);
            let kind_of = if col.name == "games_played" {
                StatKind::Games
            } else if col.sql_type != SqlType::Integer
                || col.name.contains("_pct")
                || col.name.contains("rating")
            {
                StatKind::Rate
            } else {
                StatKind::Count
            };
            columns.push(SheetColumn {
                header: display_header(&stored),
                lower_is_better: lower_is_better(&stored),
                stored,
                scale: col.scale.max(1),
                kind: kind_of,
            });
        }
    }

    let rows = records
        .iter()
        .map(|record| {
            let label = match record.get("name") {
                Some(ColumnValue::Text(name)) => name.clone(),
                _ => record
                    .get(owner.key_column())
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            };
            let ratio = mode_ratio(record, mode);
            let values = columns
                .iter()
                .map(|col| {
                    let raw = record.get(&col.stored).and_then(ColumnValue::as_f64)?;
                    let value = raw / col.scale as f64;
                    match col.kind {
                        StatKind::Count => ratio.map(|(num, den)| value * num / den),
                        StatKind::Rate | StatKind::Games => Some(value),
                    }
                })
                .collect();
            SheetRow { label, values }
        })
        .collect();
    SheetTable { columns, rows }
}

// (numerator, denominator) turning a season total into the requested mode.
// None when the denominator is missing or zero.
fn mode_ratio(record: &Record, mode: DisplayMode) -> Option<(f64, f64)> {
    let stored = |name: &str| {
        record
            .get(name)
            .and_then(ColumnValue::as_f64)
            .filter(|v| *v > 0.0)
    };
    match mode {
        DisplayMode::Totals => Some((1.0, 1.0)),
        DisplayMode::PerGame => stored("games_played").map(|gp| (1.0, gp)),
        DisplayMode::Per36 => stored("minutes_x10").map(|m| (36.0, m / 10.0)),
        DisplayMode::Per100 => stored("possessions").map(|p| (100.0, p)),
    }
}

fn display_header(stored: &str) -> String {
    stored
        .strip_suffix("_x1000")
        .or_else(|| stored.strip_suffix("_x10"))
        .unwrap_or(stored)
        .to_string()
}

fn lower_is_better(stored: &str) -> bool {
    let (base, opponent) = match stored.strip_prefix("opp_") {
        Some(base) => (base, true),
        None => (stored, false),
    };
    let low = matches!(
        base,
        "turnovers" | "fouls" | "d_rating_x10" | "real_d_fg_pct_x1000"
    ) || (base.starts_with("d_") && base.ends_with("fgm"));
    low != opponent
}

/// Rank of each value among the non-empty ones, 0 (worst) to 100 (best).
pub fn percentile_ranks(values: &[Option<f64>], lower_is_better: bool) -> Vec<Option<u8>> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let n = present.len();
    values
        .iter()
        .map(|value| {
            let v = (*value)?;
            if n < 2 {
                return Some(50);
            }
            let below = present.iter().filter(|other| **other < v).count();
            let pct = (below as f64 / (n - 1) as f64 * 100.0).round().clamp(0.0, 100.0) as u8;
            Some(if lower_is_better { 100 - pct } else { pct })
        })
        .collect()
}

const RED: (f64, f64, f64) = (238.0, 75.0, 43.0);
const YELLOW: (f64, f64, f64) = (252.0, 245.0, 95.0);
const GREEN: (f64, f64, f64) = (76.0, 187.0, 23.0);

/// Background for a percentile, snapped to ten-point buckets: red through
/// yellow at the median to green.
pub fn percentile_color(percentile: u8) -> u32 {
    let bucket = (f64::from(percentile.min(100)) / 10.0).round() * 10.0;
    let (from, to, ratio) = if bucket <= 50.0 {
        (RED, YELLOW, bucket / 50.0)
    } else {
        (YELLOW, GREEN, (bucket - 50.0) / 50.0)
    };
    let mix = |a: f64, b: f64| (a + (b - a) * ratio).round() as u32;
    (mix(from.0, to.0) << 16) | (mix(from.1, to.1) << 8) | mix(from.2, to.2)
}

fn write_table(worksheet: &mut Worksheet, table: &SheetTable) -> Result<()> {
    let header = Format::new().set_bold();
    worksheet
        .write_string_with_format(0, 0, "Name", &header)
        .context("write header")?;
    for (idx, col) in table.columns.iter().enumerate() {
        worksheet
            .write_string_with_format(0, (idx + 1) as u16, &col.header, &header)
            .with_context(|| format!("write header {}", col.header))?;
    }

    let ranks: Vec<Vec<Option<u8>>> = (0..table.columns.len())
        .map(|idx| {
            let values: Vec<Option<f64>> = table.rows.iter().map(|r| r.values[idx]).collect();
            percentile_ranks(&values, table.columns[idx].lower_is_better)
        })
        .collect();

    for (row_idx, row) in table.rows.iter().enumerate() {
        let sheet_row = (row_idx + 1) as u32;
        worksheet
            .write_string(sheet_row, 0, &row.label)
            .with_context(|| format!("write cell ({sheet_row},0)"))?;
        for (col_idx, value) in row.values.iter().enumerate() {
            let Some(value) = value else {
                continue;
            };
            let col = &table.columns[col_idx];
            let mut format = Format::new().set_num_format(number_format(col));
            if let Some(pct) = ranks[col_idx][row_idx] {
                format = format.set_background_color(Color::RGB(percentile_color(pct)));
            }
            worksheet
                .write_number_with_format(sheet_row, (col_idx + 1) as u16, *value, &format)
                .with_context(|| format!("write cell ({sheet_row},{})", col_idx + 1))?;
        }
    }
    worksheet
        .set_freeze_panes(1, 1)
        .context("freeze header row")?;
    Ok(())
}

fn number_format(col: &SheetColumn) -> &'static str {
    match (col.kind, col.scale) {
        (StatKind::Games, _) => "0",
        (_, scale) if scale >= 1000 => "0.000",
        _ => "0.0",
    }
}

#[cfg(test)]
mod tests {
    use super::{DisplayMode, build_table, percentile_color, percentile_ranks};
    use crate::model::{ColumnValue, EntityKind, Record};
    use crate::registry::Registry;

    fn player(name: &str, gp: i64, minutes_x10: i64, points: i64, rating_x10: i64) -> Record {
        let mut record = Record::new();
        record.insert("name".to_string(), ColumnValue::Text(name.to_string()));
        record.insert("player_id".to_string(), ColumnValue::Int(1));
        record.insert("games_played".to_string(), ColumnValue::Int(gp));
        record.insert("minutes_x10".to_string(), ColumnValue::Int(minutes_x10));
        record.insert("points".to_string(), ColumnValue::Int(points));
        record.insert("o_rating_x10".to_string(), ColumnValue::Int(rating_x10));
        record
    }

    fn column_value(table: &super::SheetTable, row: usize, header: &str) -> Option<f64> {
        let idx = table.columns.iter().position(|c| c.header == header).unwrap();
        table.rows[row].values[idx]
    }

    #[test]
    fn modes_rescale_counts_but_not_rates() {
        let registry = Registry::builtin().unwrap();
        let records = vec![player("Jalen Brunson", 10, 7200, 300, 1185)];

        let per_game = build_table(registry, EntityKind::Player, &records, DisplayMode::PerGame);
        assert_eq!(per_game.rows[0].label, "Jalen Brunson");
        assert_eq!(column_value(&per_game, 0, "points"), Some(30.0));
        assert_eq!(column_value(&per_game, 0, "o_rating"), Some(118.5));
        assert_eq!(column_value(&per_game, 0, "games_played"), Some(10.0));

        let per_36 = build_table(registry, EntityKind::Player, &records, DisplayMode::Per36);
        assert_eq!(column_value(&per_36, 0, "points"), Some(15.0));
        assert_eq!(column_value(&per_36, 0, "minutes"), Some(36.0));

        // No possessions stored.
        let per_100 = build_table(registry, EntityKind::Player, &records, DisplayMode::Per100);
        assert_eq!(column_value(&per_100, 0, "points"), None);
    }

    #[test]
    fn percentiles_respect_direction() {
        let values = vec![Some(1.0), Some(3.0), None, Some(2.0)];
        assert_eq!(
            percentile_ranks(&values, false),
            vec![Some(0), Some(100), None, Some(50)]
        );
        assert_eq!(
            percentile_ranks(&values, true),
            vec![Some(100), Some(0), None, Some(50)]
        );
        assert_eq!(percentile_color(0), 0xEE4B2B);
        assert_eq!(percentile_color(50), 0xFCF55F);
        assert_eq!(percentile_color(100), 0x4CBB17);
    }

    #[test]
    fn parses_display_modes() {
        assert_eq!(DisplayMode::parse("per-100"), Some(DisplayMode::Per100));
        assert_eq!(DisplayMode::parse("Totals"), Some(DisplayMode::Totals));
        assert_eq!(DisplayMode::parse("per_minute"), None);
    }
}
