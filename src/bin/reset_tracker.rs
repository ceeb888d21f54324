use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use glass_etl::config::{self, EtlConfig};
use glass_etl::model::EntityKind;
use glass_etl::registry::Registry;
use glass_etl::store::Store;
use glass_etl::tracker::Tracker;

fn main() -> Result<()> {
    config::load_dotenv();
    glass_etl::init_logging();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let config = EtlConfig::from_env()?;
    let db_path = arg_value(&args, "--db")
        .map(PathBuf::from)
        .or_else(|| config.resolved_db_path())
        .context("unable to resolve sqlite path")?;
    let endpoint = arg_value(&args, "--endpoint")
        .context("usage: reset_tracker --endpoint NAME [--entity player|team]")?;
    let entity = arg_value(&args, "--entity")
        .map(|raw| EntityKind::parse(&raw).ok_or_else(|| anyhow!("unknown entity {raw:?}")))
        .transpose()?;

    let registry = Registry::builtin()?;
    if registry.catalog().get(&endpoint).is_none() {
        return Err(anyhow!("endpoint {endpoint} is not in the catalog"));
    }
    let store = Store::open(&db_path, registry)?;
    let tracker = Tracker::new(&store);
    let reset = tracker.reset_endpoint(&endpoint, entity)?;

    println!("Tracker reset");
    println!("DB: {}", db_path.display());
    println!(
        "Endpoint: {endpoint}{}",
        entity.map(|e| format!(" ({e})")).unwrap_or_default()
    );
    println!("Units reopened: {reset}");
    for (status, count) in tracker.status_counts()? {
        println!("  {status}: {count}");
    }
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
