use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::model::ExecutionTier;
use crate::season::Season;

const CACHE_DIR: &str = "glass_etl";
const DB_FILE: &str = "glass.sqlite";

/// Runtime knobs, read once from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EtlConfig {
    pub db_path: Option<PathBuf>,
    pub rate_limit_delay: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub league_workers: usize,
    pub team_workers: usize,
    pub player_workers: usize,
    pub backfill_start: Season,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            rate_limit_delay: Duration::from_millis(600),
            request_timeout: Duration::from_secs(20),
            max_retries: 3,
            backoff_base: Duration::from_secs(10),
            failure_threshold: 3,
            cooldown: Duration::from_secs(120),
            league_workers: 10,
            team_workers: 10,
            player_workers: 1,
            backfill_start: Season::from_start_year(1996),
        }
    }
}

impl EtlConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let backfill_start = match env::var("BACKFILL_START_SEASON") {
            Ok(raw) if !raw.trim().is_empty() => {
                Season::parse(&raw).context("invalid BACKFILL_START_SEASON")?
            }
            _ => defaults.backfill_start,
        };
        let db_path = env::var("GLASS_DB_PATH")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            rate_limit_delay: Duration::from_secs_f64(
                env_f64("API_RATE_LIMIT_DELAY", 0.6).clamp(0.0, 30.0),
            ),
            request_timeout: Duration::from_secs(env_u64("API_TIMEOUT_SECS", 20).clamp(1, 300)),
            max_retries: env_u64("API_MAX_RETRIES", 3).clamp(1, 10) as u32,
            backoff_base: Duration::from_secs(env_u64("API_BACKOFF_BASE_SECS", 10).min(600)),
            failure_threshold: env_u64("API_FAILURE_THRESHOLD", 3).clamp(1, 100) as u32,
            cooldown: Duration::from_secs(env_u64("API_COOLDOWN_SECS", 120).min(3600)),
            league_workers: env_u64("LEAGUE_WORKERS", 10).clamp(1, 32) as usize,
            team_workers: env_u64("TEAM_WORKERS", 10).clamp(1, 32) as usize,
            player_workers: env_u64("PLAYER_WORKERS", 1).clamp(1, 16) as usize,
            backfill_start,
        })
    }

    pub fn workers_for(&self, tier: ExecutionTier) -> usize {
        match tier {
            ExecutionTier::League => self.league_workers,
            ExecutionTier::Team => self.team_workers,
            ExecutionTier::Player => self.player_workers,
        }
    }

    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path.clone().or_else(default_db_path)
    }
}

/// Loads `.env.local` first so it wins over `.env`.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join(DB_FILE))
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = env::var("XDG_CACHE_HOME") {
        if !base.trim().is_empty() {
            return Some(PathBuf::from(base).join(CACHE_DIR));
        }
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
