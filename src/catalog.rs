use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::model::{EntityKind, ExecutionTier, ParamSet};
use crate::season::Season;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointMeta {
    pub name: String,
    #[serde(default)]
    pub min_season: Option<Season>,
    pub entity_types: Vec<EntityKind>,
    #[serde(default)]
    pub execution_tier: Option<ExecutionTier>,
    /// Result set names in response order; the first is the primary table.
    pub result_sets: Vec<String>,
    #[serde(default)]
    pub default_params: ParamSet,
    #[serde(default)]
    pub entity_params: BTreeMap<EntityKind, ParamSet>,
    #[serde(default)]
    pub id_field: Option<String>,
    /// Parameter carrying the season when it is not `season`.
    #[serde(default)]
    pub season_param: Option<String>,
}

impl EndpointMeta {
    pub fn serves(&self, kind: EntityKind) -> bool {
        self.entity_types.contains(&kind)
            || (kind == EntityKind::Opponent && self.entity_types.contains(&EntityKind::Team))
    }

    pub fn primary_result_set(&self) -> Option<&str> {
        self.result_sets.first().map(String::as_str)
    }

    pub fn has_result_set(&self, name: &str) -> bool {
        self.result_sets.iter().any(|rs| rs == name)
    }

    pub fn id_field_for(&self, kind: EntityKind) -> String {
        match (&self.id_field, kind.row_owner()) {
            (Some(field), EntityKind::Player) => field.clone(),
            _ => kind.id_field().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    endpoints: Vec<EndpointMeta>,
}

/// Static per-endpoint metadata, in processing order.
#[derive(Debug, Clone, Default)]
pub struct EndpointCatalog {
    endpoints: Vec<EndpointMeta>,
}

impl EndpointCatalog {
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw).context("invalid endpoint catalog json")?;
        let mut seen = std::collections::HashSet::new();
        for ep in &file.endpoints {
            if !seen.insert(ep.name.as_str()) {
                bail!("endpoint {} is declared twice", ep.name);
            }
            if ep.result_sets.is_empty() {
                bail!("endpoint {} declares no result sets", ep.name);
            }
            if ep.entity_types.is_empty() {
                bail!("endpoint {} serves no entity types", ep.name);
            }
        }
        Ok(Self {
            endpoints: file.endpoints,
        })
    }

    pub fn get(&self, name: &str) -> Option<&EndpointMeta> {
        self.endpoints.iter().find(|ep| ep.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointMeta> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Tier implied by the provider's naming scheme.
///
/// `playerdash*`/`commonplayer*` are checked before `team*` so that
/// `teamplayer*` style names are not mistaken for per-player calls.
pub fn infer_tier_from_name(endpoint: &str) -> ExecutionTier {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("playerdash") || lower.starts_with("commonplayer") {
        return ExecutionTier::Player;
    }
    if lower.starts_with("team") {
        return ExecutionTier::Team;
    }
    ExecutionTier::League
}
