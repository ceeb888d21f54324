use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use glass_etl::backfill::{Backfill, BackfillOptions};
use glass_etl::config::EtlConfig;
use glass_etl::error::EtlError;
use glass_etl::model::{ColumnValue, EndpointResponse, EntityKind, ParamSet, Record, ResultTable};
use glass_etl::plan::UnitKey;
use glass_etl::registry::Registry;
use glass_etl::retry::{RetryController, RetryPolicy, Sleeper};
use glass_etl::season::{Season, SeasonType};
use glass_etl::stats_api::StatsProvider;
use glass_etl::store::Store;
use glass_etl::tracker::{Tracker, UnitStatus};

const WARRIORS: i64 = 1610612744;
const CELTICS: i64 = 1610612738;

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

/// Answers like the stats site for two teams. The Celtics never played,
/// and their rebounding dashboard always times out.
#[derive(Default)]
struct FakeStats {
    calls: Mutex<Vec<String>>,
    drop_shot_tables: AtomicBool,
}

impl FakeStats {
    fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == endpoint)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn row(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

impl StatsProvider for FakeStats {
    fn call_endpoint(&self, endpoint: &str, params: &ParamSet) -> Result<EndpointResponse, EtlError> {
        self.calls.lock().unwrap().push(endpoint.to_string());
        let team_id = params.get("team_id").and_then(Value::as_i64);
        match endpoint {
            "leaguedashteamstats" => {
                let opponent = params.get("measure_type_detailed_defense") == Some(&json!("Opponent"));
                let rows = if opponent {
                    vec![
                        row(&[("TEAM_ID", json!(WARRIORS)), ("OPP_PTS", json!(9400))]),
                        row(&[("TEAM_ID", json!(CELTICS)), ("OPP_PTS", json!(0))]),
                    ]
                } else {
                    vec![
                        row(&[
                            ("TEAM_ID", json!(WARRIORS)),
                            ("TEAM_NAME", json!("Golden State Warriors")),
                            ("GP", json!(82)),
                            ("PTS", json!(9635)),
                        ]),
                        row(&[
                            ("TEAM_ID", json!(CELTICS)),
                            ("TEAM_NAME", json!("Boston Celtics")),
                            ("GP", json!(0)),
                            ("PTS", json!(0)),
                        ]),
                    ]
                };
                Ok(EndpointResponse::new()
                    .with_set("LeagueDashTeamStats", ResultTable::from_rows(rows)))
            }
            "teamdashptshots" => {
                let rows = match team_id {
                    Some(WARRIORS) => vec![
                        row(&[
                            ("TEAM_ID", json!(WARRIORS)),
                            ("CLOSE_DEF_DIST_RANGE", json!("0-2 Feet - Very Tight")),
                            ("FG2M", json!(296)),
                        ]),
                        row(&[
                            ("TEAM_ID", json!(WARRIORS)),
                            ("CLOSE_DEF_DIST_RANGE", json!("2-4 Feet - Tight")),
                            ("FG2M", json!(803)),
                        ]),
                        row(&[
                            ("TEAM_ID", json!(WARRIORS)),
                            ("CLOSE_DEF_DIST_RANGE", json!("6+ Feet - Wide Open")),
                            ("FG2M", json!(273)),
                        ]),
                    ],
                    _ => Vec::new(),
                };
                if self.drop_shot_tables.load(Ordering::SeqCst) {
                    return Ok(EndpointResponse::new()
                        .with_set("ClosestDefender10ftPlusShooting", ResultTable::default()));
                }
                Ok(EndpointResponse::new()
                    .with_set("ClosestDefenderShooting", ResultTable::from_rows(rows))
                    .with_set("ClosestDefender10ftPlusShooting", ResultTable::default()))
            }
            "teamdashptreb" => match team_id {
                Some(WARRIORS) => Ok(EndpointResponse::new().with_set(
                    "OverallRebounding",
                    ResultTable::from_rows(vec![row(&[
                        ("TEAM_ID", json!(WARRIORS)),
                        ("C_OREB", json!(412)),
                    ])]),
                )),
                _ => Err(EtlError::Transient {
                    endpoint: endpoint.to_string(),
                    message: "operation timed out".to_string(),
                }),
            },
            "teamdetails" => {
                let arena = match team_id {
                    Some(WARRIORS) => "Chase Center",
                    _ => "TD Garden",
                };
                Ok(EndpointResponse::new().with_set(
                    "TeamBackground",
                    ResultTable::from_rows(vec![row(&[
                        ("TEAM_ID", json!(team_id)),
                        ("ARENA", json!(arena)),
                    ])]),
                ))
            }
            other => Err(EtlError::Rejected {
                endpoint: other.to_string(),
                status: 404,
                message: "not found".to_string(),
            }),
        }
    }
}

struct Harness {
    registry: Registry,
    store: Store,
    provider: FakeStats,
    retry: RetryController,
    config: EtlConfig,
}

impl Harness {
    fn new() -> Self {
        let registry = Registry::from_json(
            include_str!("fixtures/columns.json"),
            include_str!("fixtures/endpoints.json"),
        )
        .unwrap();
        let store = Store::open_in_memory(&registry).unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            failure_threshold: 100,
            cooldown: Duration::ZERO,
        };
        let config = EtlConfig {
            league_workers: 2,
            team_workers: 2,
            player_workers: 1,
            ..EtlConfig::default()
        };
        Self {
            registry,
            store,
            provider: FakeStats::default(),
            retry: RetryController::with_sleeper(policy, Arc::new(NoSleep)),
            config,
        }
    }

    fn run(&self, options: &BackfillOptions) -> glass_etl::backfill::BackfillSummary {
        Backfill::new(
            &self.registry,
            &self.store,
            &self.provider,
            &self.retry,
            &self.config,
        )
        .run(options)
        .unwrap()
    }

    fn team_rows(&self) -> HashMap<i64, Record> {
        self.store
            .load_season_rows(EntityKind::Team, season(), SeasonType::RegularSeason)
            .unwrap()
            .into_iter()
            .map(|record| {
                let id = record["team_id"].as_i64().unwrap();
                (id, record)
            })
            .collect()
    }

    fn status(&self, endpoint: &str, season: Season) -> Option<UnitStatus> {
        Tracker::new(&self.store)
            .status(&key(endpoint, season))
            .unwrap()
            .map(|record| record.status)
    }
}

fn season() -> Season {
    Season::parse("2023-24").unwrap()
}

fn key(endpoint: &str, season: Season) -> UnitKey {
    UnitKey {
        endpoint: endpoint.to_string(),
        season,
        season_type: SeasonType::RegularSeason,
        signature: "{}".to_string(),
        entity: EntityKind::Team,
    }
}

fn options_for(season: Season) -> BackfillOptions {
    BackfillOptions::new(vec![season], vec![SeasonType::RegularSeason])
}

#[test]
fn full_run_fills_rows_and_isolates_failures() {
    let h = Harness::new();
    let summary = h.run(&options_for(season()));

    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 1);
    assert!(summary.has_failures());
    let (failed_key, message) = &summary.failed_units[0];
    assert_eq!(failed_key.endpoint, "teamdashptreb");
    assert!(message.starts_with("1/2 entities failed"), "{message}");

    let rows = h.team_rows();
    let warriors = &rows[&WARRIORS];
    assert_eq!(warriors["name"], ColumnValue::Text("Golden State Warriors".to_string()));
    assert_eq!(warriors["games_played"], ColumnValue::Int(82));
    assert_eq!(warriors["points"], ColumnValue::Int(9635));
    assert_eq!(warriors["opp_points"], ColumnValue::Int(9400));
    assert_eq!(warriors["cont_2fgm"], ColumnValue::Int(296 + 803));
    // Partial units still keep what succeeded.
    assert_eq!(warriors["cont_o_rebs"], ColumnValue::Int(412));

    let celtics = &rows[&CELTICS];
    assert_eq!(celtics["cont_2fgm"], ColumnValue::Null);
    assert_eq!(celtics["cont_o_rebs"], ColumnValue::Null);

    assert_eq!(h.status("teamdashptshots", season()), Some(UnitStatus::Complete));
    assert_eq!(h.status("teamdashptreb", season()), Some(UnitStatus::Failed));
}

#[test]
fn rerun_only_retries_unfinished_units() {
    let h = Harness::new();
    h.run(&options_for(season()));
    let league_calls = h.provider.calls_to("leaguedashteamstats");
    let shot_calls = h.provider.calls_to("teamdashptshots");

    let summary = h.run(&options_for(season()));
    assert_eq!(summary.already_complete, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(h.provider.calls_to("leaguedashteamstats"), league_calls);
    assert_eq!(h.provider.calls_to("teamdashptshots"), shot_calls);
    assert_eq!(h.status("teamdashptshots", season()), Some(UnitStatus::Complete));
}

#[test]
fn seasons_before_the_floor_complete_without_calls() {
    let h = Harness::new();
    let early = Season::parse("1990-91").unwrap();
    let summary = h.run(&options_for(early));

    assert_eq!(h.provider.total_calls(), 0);
    assert_eq!(summary.not_applicable, 4);
    let record = Tracker::new(&h.store)
        .status(&key("teamdashptshots", early))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, UnitStatus::Complete);
    assert_eq!(record.entities_processed, 0);
}

#[test]
fn per_team_unit_without_stored_teams_fails_instead_of_completing() {
    let h = Harness::new();
    let mut options = options_for(season());
    options.endpoint = Some("teamdashptshots".to_string());
    let summary = h.run(&options);

    assert_eq!(summary.failed, 1);
    assert!(summary.failed_units[0].1.contains("no team rows stored"));
    assert_eq!(h.provider.total_calls(), 0);
    assert_eq!(h.status("teamdashptshots", season()), Some(UnitStatus::Failed));
}

#[test]
fn missing_result_set_aborts_the_unit() {
    let h = Harness::new();
    h.provider.drop_shot_tables.store(true, Ordering::SeqCst);
    let summary = h.run(&options_for(season()));

    let shots = summary
        .failed_units
        .iter()
        .find(|(key, _)| key.endpoint == "teamdashptshots")
        .unwrap();
    assert!(shots.1.contains("no result set ClosestDefenderShooting"), "{}", shots.1);
    // Aborted on the first team; nothing written.
    assert_eq!(h.provider.calls_to("teamdashptshots"), 1);
    assert_eq!(h.team_rows()[&WARRIORS]["cont_2fgm"], ColumnValue::Null);
}

#[test]
fn career_details_are_fetched_once_per_team_across_seasons() {
    let h = Harness::new();
    let options = BackfillOptions::new(
        vec![Season::parse("2022-23").unwrap(), season()],
        vec![SeasonType::RegularSeason, SeasonType::Playoffs],
    );
    let summary = h.run(&options);

    assert_eq!(h.provider.calls_to("teamdetails"), 2);
    assert_eq!(h.provider.calls_to("teamdashptshots"), 2 * 4);
    assert!(!summary.failed_units.iter().any(|(key, _)| key.endpoint == "teamdetails"));
    let warriors = h.store.entity_row(EntityKind::Team, WARRIORS).unwrap().unwrap();
    assert_eq!(warriors["arena"], ColumnValue::Text("Chase Center".to_string()));
    assert_eq!(warriors["name"], ColumnValue::Text("Golden State Warriors".to_string()));
}

#[test]
fn forced_rerun_leaves_stored_rows_unchanged() {
    let h = Harness::new();
    h.run(&options_for(season()));
    let before = h.team_rows();

    let mut options = options_for(season());
    options.force = true;
    let summary = h.run(&options);
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.already_complete, 0);
    assert_eq!(h.team_rows(), before);
    assert_eq!(h.status("teamdashptshots", season()), Some(UnitStatus::Complete));
}

#[test]
fn reset_and_force_reopen_completed_units() {
    let h = Harness::new();
    h.run(&options_for(season()));
    let shot_calls = h.provider.calls_to("teamdashptshots");

    let reopened = Tracker::new(&h.store)
        .reset_endpoint("teamdashptshots", None)
        .unwrap();
    assert_eq!(reopened, 1);
    assert_eq!(h.status("teamdashptshots", season()), Some(UnitStatus::Pending));

    let mut options = options_for(season());
    options.endpoint = Some("teamdashptshots".to_string());
    let summary = h.run(&options);
    assert_eq!(summary.completed, 1);
    assert_eq!(h.provider.calls_to("teamdashptshots"), shot_calls * 2);

    let before = h.team_rows();
    options.force = true;
    let summary = h.run(&options);
    assert_eq!(summary.completed, 1);
    assert_eq!(h.provider.calls_to("teamdashptshots"), shot_calls * 3);
    assert_eq!(h.team_rows(), before);
}
