use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use glass_etl::config::{self, EtlConfig};
use glass_etl::registry::Registry;
use glass_etl::season::{Season, SeasonType};
use glass_etl::sheet_export::{DisplayMode, export_season};
use glass_etl::store::Store;

fn main() -> Result<()> {
    config::load_dotenv();
    glass_etl::init_logging();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let config = EtlConfig::from_env()?;
    let db_path = arg_value(&args, "--db")
        .map(PathBuf::from)
        .or_else(|| config.resolved_db_path())
        .context("unable to resolve sqlite path")?;

    let season = match arg_value(&args, "--season") {
        Some(raw) => Season::parse(&raw)?,
        None => Season::current(Utc::now().date_naive()),
    };
    let season_type = match arg_value(&args, "--season-type") {
        Some(raw) => {
            SeasonType::parse(&raw).ok_or_else(|| anyhow!("unknown season type {raw:?}"))?
        }
        None => SeasonType::RegularSeason,
    };
    let mode = match arg_value(&args, "--mode") {
        Some(raw) => DisplayMode::parse(&raw).ok_or_else(|| anyhow!("unknown mode {raw:?}"))?,
        None => DisplayMode::default(),
    };
    let out = arg_value(&args, "--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("glass_{season}_{mode}.xlsx")));

    let registry = Registry::builtin()?;
    let store = Store::open(&db_path, registry)?;
    let report = export_season(&store, registry, season, season_type, mode, &out)?;

    println!("Export complete");
    println!("Season: {season} {season_type} ({mode})");
    println!("Players: {}", report.players);
    println!("Teams: {}", report.teams);
    println!("Workbook: {}", out.display());
    Ok(())
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() && !next.starts_with("--") {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}
