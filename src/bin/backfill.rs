use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use glass_etl::backfill::{Backfill, BackfillOptions};
use glass_etl::config::{self, EtlConfig};
use glass_etl::model::{EntityKind, UpdateFrequency};
use glass_etl::registry::Registry;
use glass_etl::retry::{RetryController, RetryPolicy};
use glass_etl::season::{Season, SeasonType};
use glass_etl::stats_api::NbaStatsClient;
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

    let registry = Registry::builtin()?;
    let options = parse_options(&args, &config, registry)?;
    let store = Store::open(&db_path, registry)?;
    let provider = NbaStatsClient::new(config.request_timeout);
    let retry = RetryController::new(RetryPolicy::from_config(&config));

    let summary = Backfill::new(registry, &store, &provider, &retry, &config).run(&options)?;

    println!("Backfill complete");
    println!("DB: {}", db_path.display());
    println!(
        "Seasons: {}",
        match (options.seasons.first(), options.seasons.last()) {
            (Some(first), Some(last)) => format!("{first}..{last}"),
            _ => "none".to_string(),
        }
    );
    println!("Units completed: {}", summary.completed);
    println!("Units not applicable: {}", summary.not_applicable);
    println!("Units already complete: {}", summary.already_complete);
    if summary.busy > 0 {
        println!("Units busy elsewhere: {}", summary.busy);
    }
    println!("Rows upserted: {}", summary.rows_upserted);
    println!("Units failed: {}", summary.failed);
    for (key, error) in summary.failed_units.iter().take(12) {
        println!("   - {key}: {error}");
    }

    if summary.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_options(args: &[String], config: &EtlConfig, registry: &Registry) -> Result<BackfillOptions> {
    let current = Season::current(Utc::now().date_naive());
    let refresh_current = has_flag(args, "--current");

    let seasons = if refresh_current {
        vec![current]
    } else if let Some(raw) = arg_value(args, "--seasons") {
        parse_season_range(&raw)?
    } else {
        Season::range(config.backfill_start, current)
    };

    let season_types = match arg_value(args, "--season-types") {
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| SeasonType::parse(s).ok_or_else(|| anyhow!("unknown season type {s:?}")))
            .collect::<Result<Vec<_>>>()?,
        None => SeasonType::ALL.to_vec(),
    };

    let endpoint = arg_value(args, "--endpoint");
    if let Some(name) = &endpoint {
        if registry.catalog().get(name).is_none() {
            return Err(anyhow!("endpoint {name} is not in the catalog"));
        }
    }

    let entity = arg_value(args, "--entity")
        .map(|raw| EntityKind::parse(&raw).ok_or_else(|| anyhow!("unknown entity {raw:?}")))
        .transpose()?;
    let frequency = arg_value(args, "--frequency")
        .map(|raw| UpdateFrequency::parse(&raw).ok_or_else(|| anyhow!("unknown frequency {raw:?}")))
        .transpose()?;

    Ok(BackfillOptions {
        seasons,
        season_types,
        endpoint,
        entity,
        frequency,
        force: refresh_current || has_flag(args, "--force"),
    })
}

/// `FROM:TO` (inclusive) or a single season.
fn parse_season_range(raw: &str) -> Result<Vec<Season>> {
    let (from, to) = match raw.split_once(':') {
        Some((from, to)) => (Season::parse(from)?, Season::parse(to)?),
        None => {
            let season = Season::parse(raw)?;
            (season, season)
        }
    };
    if to < from {
        return Err(anyhow!("season range {raw:?} is reversed"));
    }
    Ok(Season::range(from, to))
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|arg| arg == name)
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
