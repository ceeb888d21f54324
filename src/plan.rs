use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::backfill::BackfillOptions;
use crate::catalog::{EndpointCatalog, EndpointMeta, infer_tier_from_name};
use crate::model::{EntityKind, ExecutionTier, ParamSet};
use crate::registry::{ColumnTable, Registry};
use crate::season::{Season, SeasonType, effective_floor};

/// Tier one call of `endpoint` runs at.
///
/// A descriptor-level override wins, then the catalog entry, then the
/// endpoint's name prefix. Unknown endpoints fall back to `League`.
pub fn resolve_tier(
    catalog: &EndpointCatalog,
    endpoint: &str,
    override_tier: Option<ExecutionTier>,
) -> ExecutionTier {
    override_tier
        .or_else(|| catalog.get(endpoint).and_then(|meta| meta.execution_tier))
        .unwrap_or_else(|| infer_tier_from_name(endpoint))
}

/// Canonical text of a parameter set: sorted keys, `_`-prefixed hints dropped.
pub fn param_signature(params: &ParamSet) -> String {
    let visible: BTreeMap<&str, &Value> = params
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    serde_json::to_string(&visible).unwrap_or_else(|_| "{}".to_string())
}

/// Distinct parameter sets needed to cover every column reading `endpoint`
/// for rows owned by `kind`. Team rows include their opponent columns.
pub fn expand_params(registry: &Registry, endpoint: &str, kind: EntityKind) -> Vec<ParamSet> {
    let owner = kind.row_owner();
    let mut seen: BTreeMap<String, ParamSet> = BTreeMap::new();
    for source_kind in kinds_owned_by(owner) {
        for (_, spec) in registry.sources_for(endpoint, *source_kind) {
            let params = spec.params();
            seen.entry(param_signature(&params)).or_insert(params);
        }
    }
    seen.into_values().collect()
}

pub(crate) fn kinds_owned_by(owner: EntityKind) -> &'static [EntityKind] {
    match owner {
        EntityKind::Player => &[EntityKind::Player],
        _ => &[EntityKind::Team, EntityKind::Opponent],
    }
}

/// Endpoints that feed at least one column, league-wide first, then
/// per-team, then per-player; catalog order breaks ties.
pub fn endpoint_processing_order(registry: &Registry) -> Vec<&EndpointMeta> {
    let mut endpoints: Vec<&EndpointMeta> = registry
        .catalog()
        .iter()
        .filter(|meta| {
            registry
                .columns()
                .iter()
                .any(|col| col.sources.values().any(|spec| spec.endpoint() == meta.name))
        })
        .collect();
    endpoints.sort_by_key(|meta| {
        std::cmp::Reverse(resolve_tier(registry.catalog(), &meta.name, None))
    });
    endpoints
}

/// Identity of one resumable piece of work, as stored by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub endpoint: String,
    pub season: Season,
    pub season_type: SeasonType,
    pub signature: String,
    /// Row owner: `Player` or `Team` (opponent columns ride with the team).
    pub entity: EntityKind,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.endpoint, self.entity, self.season, self.season_type, self.signature
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillUnit {
    pub key: UnitKey,
    pub params: ParamSet,
    pub tier: ExecutionTier,
    /// Earliest season any of the unit's columns can be filled for.
    pub floor: Option<Season>,
    /// Every column lands on the entity row, so season type does not matter
    /// and per-entity calls cover every stored entity at once.
    pub entity_only: bool,
}

impl BackfillUnit {
    pub fn is_applicable(&self) -> bool {
        self.floor.is_none_or(|floor| self.key.season >= floor)
    }
}

/// All units for one endpoint; finished before the next endpoint starts.
#[derive(Debug, Clone)]
pub struct EndpointPlan {
    pub endpoint: String,
    pub units: Vec<BackfillUnit>,
}

pub fn enumerate_units(registry: &Registry, options: &BackfillOptions) -> Vec<EndpointPlan> {
    let mut plans = Vec::new();
    for meta in endpoint_processing_order(registry) {
        if options
            .endpoint
            .as_deref()
            .is_some_and(|wanted| wanted != meta.name)
        {
            continue;
        }
        let mut units = Vec::new();
        for owner in [EntityKind::Player, EntityKind::Team] {
            if options.entity.is_some_and(|wanted| wanted.row_owner() != owner) {
                continue;
            }
            for params in expand_params(registry, &meta.name, owner) {
                let signature = param_signature(&params);
                let Some(shape) = unit_shape(registry, meta, owner, &signature, options) else {
                    continue;
                };
                let (seasons, season_types) = unit_slots(shape.entity_only, shape.tier, options);
                for season in &seasons {
                    for season_type in &season_types {
                        let floor = effective_floor([
                            meta.min_season,
                            season_type.minimum_season(),
                            shape.column_floor,
                        ]);
                        units.push(BackfillUnit {
                            key: UnitKey {
                                endpoint: meta.name.clone(),
                                season: *season,
                                season_type: *season_type,
                                signature: signature.clone(),
                                entity: owner,
                            },
                            params: params.clone(),
                            tier: shape.tier,
                            floor,
                            entity_only: shape.entity_only,
                        });
                    }
                }
            }
        }
        if !units.is_empty() {
            plans.push(EndpointPlan {
                endpoint: meta.name.clone(),
                units,
            });
        }
    }
    plans
}

struct UnitShape {
    tier: ExecutionTier,
    column_floor: Option<Season>,
    entity_only: bool,
}

/// Seasons and season types a unit is planned for.
///
/// Entity-only units ignore the season type. A per-entity call for them
/// answers for the entity's whole career, so only the latest season is
/// planned; league-wide calls (draft combine) still vary by season.
fn unit_slots(
    entity_only: bool,
    tier: ExecutionTier,
    options: &BackfillOptions,
) -> (Vec<Season>, Vec<SeasonType>) {
    if !entity_only {
        return (options.seasons.clone(), options.season_types.clone());
    }
    let season_type = if options.season_types.contains(&SeasonType::RegularSeason) {
        Some(SeasonType::RegularSeason)
    } else {
        options.season_types.first().copied()
    };
    let seasons = if tier == ExecutionTier::League {
        options.seasons.clone()
    } else {
        options.seasons.iter().max().copied().into_iter().collect()
    };
    (seasons, season_type.into_iter().collect())
}

fn unit_shape(
    registry: &Registry,
    meta: &EndpointMeta,
    owner: EntityKind,
    signature: &str,
    options: &BackfillOptions,
) -> Option<UnitShape> {
    let mut tier: Option<ExecutionTier> = None;
    let mut floors: Vec<Option<Season>> = Vec::new();
    let mut frequency_match = options.frequency.is_none();
    let mut entity_only = true;
    for kind in kinds_owned_by(owner) {
        for (col, spec) in registry.columns_for(&meta.name, *kind, signature) {
            entity_only &= col.table == ColumnTable::Entity;
            let col_tier = resolve_tier(registry.catalog(), &meta.name, spec.tier_override());
            tier = Some(tier.map_or(col_tier, |t| t.min(col_tier)));
            floors.push(col.min_season);
            if options.frequency.is_some() && col.update_frequency == options.frequency {
                frequency_match = true;
            }
        }
    }
    let tier = tier?;
    if !frequency_match {
        return None;
    }
    // The unit is useful as soon as its least restricted column is.
    let column_floor = if floors.iter().any(Option::is_none) {
        None
    } else {
        floors.into_iter().flatten().min()
    };
    Some(UnitShape {
        tier,
        column_floor,
        entity_only,
    })
}

/// Full parameter set sent upstream for one call of `unit`.
pub fn call_params(meta: &EndpointMeta, unit: &BackfillUnit) -> ParamSet {
    let mut params = meta.default_params.clone();
    if let Some(extra) = meta.entity_params.get(&unit.key.entity) {
        params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    params.extend(unit.params.iter().map(|(k, v)| (k.clone(), v.clone())));
    params.insert(
        meta.season_param.as_deref().unwrap_or("season").to_string(),
        Value::String(unit.key.season.to_string()),
    );
    params.insert(
        "season_type".to_string(),
        Value::String(unit.key.season_type.api_name().to_string()),
    );
    params
}
