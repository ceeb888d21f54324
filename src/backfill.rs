use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Result, anyhow};
use rayon::prelude::*;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::catalog::EndpointMeta;
use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::evaluate::{EvalContext, evaluate};
use crate::model::{
    ColumnValue, EndpointResponse, EntityId, EntityKind, ExecutionTier, ParamSet, Record,
    UpdateFrequency,
};
use crate::plan::{BackfillUnit, UnitKey, call_params, enumerate_units, kinds_owned_by};
use crate::registry::{ColumnDescriptor, ColumnTable, Registry, SourceSpec};
use crate::retry::RetryController;
use crate::season::{Season, SeasonType};
use crate::stats_api::StatsProvider;
use crate::store::{Store, conflict_keys, table_name};
use crate::tracker::{Tracker, UnitStatus};

/// Which slice of the unit space one run covers.
#[derive(Debug, Clone, Default)]
pub struct BackfillOptions {
    pub seasons: Vec<Season>,
    pub season_types: Vec<SeasonType>,
    pub endpoint: Option<String>,
    pub entity: Option<EntityKind>,
    pub frequency: Option<UpdateFrequency>,
    /// Re-run units already marked complete.
    pub force: bool,
}

impl BackfillOptions {
    pub fn new(seasons: Vec<Season>, season_types: Vec<SeasonType>) -> Self {
        Self {
            seasons,
            season_types,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed { entities: usize, rows: usize },
    /// Season predates the unit's data; recorded complete without a call.
    NotApplicable,
    AlreadyComplete,
    /// Claimed by another worker that is still within its lease.
    Busy,
    Failed { error: String, rows: usize },
}

#[derive(Debug, Clone, Default)]
pub struct BackfillSummary {
    pub completed: usize,
    pub failed: usize,
    pub not_applicable: usize,
    pub already_complete: usize,
    pub busy: usize,
    pub rows_upserted: usize,
    pub failed_units: Vec<(UnitKey, String)>,
}

impl BackfillSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    fn record(&mut self, key: UnitKey, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Completed { rows, .. } => {
                self.completed += 1;
                self.rows_upserted += rows;
            }
            UnitOutcome::NotApplicable => self.not_applicable += 1,
            UnitOutcome::AlreadyComplete => self.already_complete += 1,
            UnitOutcome::Busy => self.busy += 1,
            UnitOutcome::Failed { error, rows } => {
                self.failed += 1;
                self.rows_upserted += rows;
                self.failed_units.push((key, error));
            }
        }
    }
}

/// Drives every unit of a run through claim, fetch, evaluate, persist.
pub struct Backfill<'a> {
    registry: &'a Registry,
    store: &'a Store,
    provider: &'a dyn StatsProvider,
    retry: &'a RetryController,
    config: &'a EtlConfig,
}

impl<'a> Backfill<'a> {
    pub fn new(
        registry: &'a Registry,
        store: &'a Store,
        provider: &'a dyn StatsProvider,
        retry: &'a RetryController,
        config: &'a EtlConfig,
    ) -> Self {
        Self {
            registry,
            store,
            provider,
            retry,
            config,
        }
    }

    /// Processes endpoints one after another, coarsest tier first. Units of
    /// one endpoint run on a pool sized for their tier.
    pub fn run(&self, options: &BackfillOptions) -> Result<BackfillSummary> {
        let tracker = Tracker::new(self.store);
        let mut summary = BackfillSummary::default();
        for plan in enumerate_units(self.registry, options) {
            for unit in &plan.units {
                tracker.ensure_pending(&unit.key)?;
            }
            let mut by_tier: BTreeMap<ExecutionTier, Vec<&BackfillUnit>> = BTreeMap::new();
            for unit in &plan.units {
                by_tier.entry(unit.tier).or_default().push(unit);
            }
            info!(
                endpoint = %plan.endpoint,
                units = plan.units.len(),
                "processing endpoint"
            );
            for (tier, units) in by_tier.into_iter().rev() {
                let workers = self.config.workers_for(tier);
                let outcomes: Vec<(UnitKey, UnitOutcome)> = with_pool(workers, || {
                    units
                        .par_iter()
                        .map(|unit| (unit.key.clone(), self.settle_unit(unit, options.force)))
                        .collect()
                });
                for (key, outcome) in outcomes {
                    summary.record(key, outcome);
                }
            }
        }
        info!(
            completed = summary.completed,
            failed = summary.failed,
            not_applicable = summary.not_applicable,
            skipped = summary.already_complete,
            rows = summary.rows_upserted,
            "backfill finished"
        );
        Ok(summary)
    }

    // Tracker errors inside a worker become a failed unit rather than
    // aborting the whole run.
    fn settle_unit(&self, unit: &BackfillUnit, force: bool) -> UnitOutcome {
        match self.process_unit(unit, force) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(unit = %unit.key, error = %format!("{err:#}"), "unit bookkeeping failed");
                UnitOutcome::Failed {
                    error: format!("{err:#}"),
                    rows: 0,
                }
            }
        }
    }

    pub fn process_unit(&self, unit: &BackfillUnit, force: bool) -> Result<UnitOutcome> {
        let tracker = Tracker::new(self.store);
        let key = &unit.key;
        if !unit.is_applicable() {
            debug!(unit = %key, floor = ?unit.floor, "season predates endpoint data");
            tracker.mark_complete(key, 0)?;
            return Ok(UnitOutcome::NotApplicable);
        }
        if !tracker.try_claim(key, force)? {
            let status = tracker.status(key)?.map(|record| record.status);
            return Ok(if status == Some(UnitStatus::Complete) {
                UnitOutcome::AlreadyComplete
            } else {
                UnitOutcome::Busy
            });
        }

        match self.execute(unit) {
            Ok(run) if run.failures.is_empty() => {
                tracker.mark_complete(key, run.entities)?;
                info!(
                    endpoint = %key.endpoint,
                    season = %key.season,
                    season_type = %key.season_type,
                    params = %key.signature,
                    entity = %key.entity,
                    entities = run.entities,
                    rows = run.rows,
                    "unit complete"
                );
                Ok(UnitOutcome::Completed {
                    entities: run.entities,
                    rows: run.rows,
                })
            }
            Ok(run) => {
                let message = run.failure_summary();
                tracker.mark_failed(key, &message, run.entities)?;
                warn!(unit = %key, error = %message, "unit partially failed");
                Ok(UnitOutcome::Failed {
                    error: message,
                    rows: run.rows,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracker.mark_failed(key, &message, 0)?;
                error!(unit = %key, error = %message, "unit failed");
                Ok(UnitOutcome::Failed {
                    error: message,
                    rows: 0,
                })
            }
        }
    }

    fn execute(&self, unit: &BackfillUnit) -> Result<UnitRun> {
        let key = &unit.key;
        let meta = self
            .registry
            .catalog()
            .get(&key.endpoint)
            .ok_or_else(|| EtlError::UnknownEndpoint(key.endpoint.clone()))?;
        let columns = self.unit_columns(unit);
        let owner = key.entity;

        let stored_gp = self.store.games_played(owner, key.season, key.season_type)?;
        let games_played = (!stored_gp.is_empty()).then_some(&stored_gp);
        let base_params = call_params(meta, unit);
        let mut rows = RowBuffer::new(owner, key.season, key.season_type);
        let mut run = UnitRun::default();

        match unit.tier {
            ExecutionTier::League => {
                let response = self.call(meta, &base_params)?;
                let known: BTreeSet<EntityId> = if unit.entity_only {
                    self.store.all_entity_ids(owner)?
                } else {
                    self.store.entity_ids(owner, key.season, key.season_type)?
                }
                .into_iter()
                .collect();
                // Entity-only league responses list people we never stored
                // (undrafted combine attendees); only known rows are updated.
                let restrict = unit.entity_only.then_some(&known);
                let written = evaluate_into(
                    &mut rows,
                    meta,
                    &columns,
                    &response,
                    None,
                    &known,
                    restrict,
                    games_played,
                )?;
                run.entities = written;
                run.total = written;
            }
            tier => {
                let call_kind = match tier {
                    ExecutionTier::Player => EntityKind::Player,
                    _ => EntityKind::Team,
                };
                let ids = if unit.entity_only {
                    self.store.all_entity_ids(call_kind)?
                } else {
                    self.store.entity_ids(call_kind, key.season, key.season_type)?
                };
                if ids.is_empty() {
                    return Err(anyhow!(
                        "no {call_kind} rows stored for {} {}",
                        key.season,
                        key.season_type
                    ));
                }
                run.total = ids.len();
                // Rows of a per-entity call belong to that entity only when
                // the call is made for the same kind of entity the unit fills.
                let claims_rows = call_kind == owner;
                for id in ids {
                    let mut params = base_params.clone();
                    params.insert(call_kind.key_column().to_string(), json!(id));
                    match self.call(meta, &params) {
                        Ok(response) => {
                            let (call_entity, expected) = if claims_rows {
                                (Some(id), BTreeSet::from([id]))
                            } else {
                                (None, BTreeSet::new())
                            };
                            evaluate_into(
                                &mut rows,
                                meta,
                                &columns,
                                &response,
                                call_entity,
                                &expected,
                                None,
                                games_played,
                            )?;
                            run.entities += 1;
                        }
                        Err(err) => {
                            warn!(endpoint = %meta.name, entity_id = id, error = %err, "entity call failed");
                            run.failures.push((id, err));
                        }
                    }
                }
            }
        }

        run.rows = rows.flush(self.store)?;
        Ok(run)
    }

    fn call(&self, meta: &EndpointMeta, params: &ParamSet) -> Result<EndpointResponse, EtlError> {
        self.retry
            .with_retry(&meta.name, || self.provider.call_endpoint(&meta.name, params))
    }

    /// Columns the unit fills for its season; later-starting columns are left out.
    fn unit_columns(&self, unit: &BackfillUnit) -> Vec<UnitColumn<'a>> {
        let key = &unit.key;
        let registry: &'a Registry = self.registry;
        let mut out = Vec::new();
        for kind in kinds_owned_by(key.entity) {
            for (descriptor, spec) in registry.columns_for(&key.endpoint, *kind, &key.signature) {
                if descriptor.min_season.is_some_and(|floor| key.season < floor) {
                    continue;
                }
                out.push(UnitColumn {
                    kind: *kind,
                    descriptor,
                    spec,
                });
            }
        }
        out
    }
}

fn with_pool<T>(threads: usize, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(action),
        Err(_) => action(),
    }
}

struct UnitColumn<'a> {
    kind: EntityKind,
    descriptor: &'a ColumnDescriptor,
    spec: &'a SourceSpec,
}

#[derive(Default)]
struct UnitRun {
    entities: usize,
    total: usize,
    rows: usize,
    failures: Vec<(EntityId, EtlError)>,
}

impl UnitRun {
    fn failure_summary(&self) -> String {
        let first = self
            .failures
            .first()
            .map(|(id, err)| format!("; first: {id}: {err}"))
            .unwrap_or_default();
        format!("{}/{} entities failed{first}", self.failures.len(), self.total)
    }
}

/// Evaluates every column against one response. Returns how many distinct
/// entities received a value.
fn evaluate_into(
    rows: &mut RowBuffer,
    meta: &EndpointMeta,
    columns: &[UnitColumn<'_>],
    response: &EndpointResponse,
    call_entity: Option<EntityId>,
    entities: &BTreeSet<EntityId>,
    restrict: Option<&BTreeSet<EntityId>>,
    games_played: Option<&HashMap<EntityId, i64>>,
) -> Result<usize, EtlError> {
    let mut touched = BTreeSet::new();
    for column in columns {
        let ctx = EvalContext {
            id_field: meta.id_field_for(column.kind),
            call_entity,
            entities: entities.clone(),
            games_played,
        };
        let values = evaluate(column.spec, column.descriptor.scale, meta, response, &ctx)?;
        for (id, value) in values {
            if restrict.is_some_and(|allowed| !allowed.contains(&id)) {
                continue;
            }
            touched.insert(id);
            rows.set(column.descriptor, column.kind, id, value);
        }
    }
    Ok(touched.len())
}

/// Pending writes of one unit, grouped by destination table and entity.
struct RowBuffer {
    owner: EntityKind,
    season: Season,
    season_type: SeasonType,
    tables: BTreeMap<ColumnTable, BTreeMap<EntityId, Record>>,
}

impl RowBuffer {
    fn new(owner: EntityKind, season: Season, season_type: SeasonType) -> Self {
        Self {
            owner,
            season,
            season_type,
            tables: BTreeMap::new(),
        }
    }

    fn set(&mut self, column: &ColumnDescriptor, kind: EntityKind, id: EntityId, value: ColumnValue) {
        if value.is_null() && !column.nullable {
            return;
        }
        let owner = self.owner;
        let (season, season_type) = (self.season, self.season_type);
        let record = self
            .tables
            .entry(column.table)
            .or_default()
            .entry(id)
            .or_insert_with(|| {
                let mut record = Record::new();
                record.insert(owner.key_column().to_string(), ColumnValue::Int(id));
                if column.table == ColumnTable::Stats {
                    record.insert("year".to_string(), ColumnValue::Int(season.end_year() as i64));
                    record.insert("season_type".to_string(), ColumnValue::Int(season_type.code()));
                }
                record
            });
        record.insert(column.stored_name(kind), value);
    }

    fn flush(self, store: &Store) -> Result<usize> {
        let mut written = 0;
        // Entity rows first so names exist before stats reference them.
        for table in [ColumnTable::Entity, ColumnTable::Stats] {
            let Some(records) = self.tables.get(&table) else {
                continue;
            };
            let records: Vec<Record> = records.values().cloned().collect();
            written += store.upsert(
                table_name(self.owner, table),
                &records,
                &conflict_keys(self.owner, table),
            )?;
        }
        Ok(written)
    }
}
