use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result, bail};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;

use crate::catalog::EndpointCatalog;
use crate::formula::Formula;
use crate::model::{EntityKind, ExecutionTier, ParamSet, UpdateFrequency};
use crate::plan::{param_signature, resolve_tier};
use crate::season::Season;
use crate::transforms::{FieldExpr, Transform};

const BUILTIN_COLUMNS: &str = include_str!("../data/columns.json");
const BUILTIN_ENDPOINTS: &str = include_str!("../data/endpoints.json");

static BUILTIN: OnceCell<Registry> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTable {
    #[default]
    Stats,
    Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    #[default]
    Integer,
    Real,
    Text,
    Date,
}

impl SqlType {
    pub fn ddl(self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text | SqlType::Date => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDescriptor {
    pub name: String,
    pub applies_to: BTreeSet<EntityKind>,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub update_frequency: Option<UpdateFrequency>,
    #[serde(default = "default_scale")]
    pub scale: i64,
    #[serde(default)]
    pub table: ColumnTable,
    #[serde(default)]
    pub sql_type: SqlType,
    #[serde(default)]
    pub min_season: Option<Season>,
    #[serde(default)]
    pub sources: BTreeMap<EntityKind, SourceSpec>,
}

impl ColumnDescriptor {
    pub fn source(&self, kind: EntityKind) -> Option<&SourceSpec> {
        self.sources.get(&kind)
    }

    pub fn is_api(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Name of the stored column for `kind`; opponent figures get an `opp_` prefix.
    pub fn stored_name(&self, kind: EntityKind) -> String {
        match kind {
            EntityKind::Opponent => format!("opp_{}", self.name),
            _ => self.name.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scale() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Computed(ComputedSpec),
    Direct(DirectFieldSpec),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectFieldSpec {
    pub endpoint: String,
    /// A field name or a `+`/`-` chain such as `FGM - FG3M`.
    pub field: String,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub scale: Option<i64>,
    #[serde(default)]
    pub params: ParamSet,
    #[serde(default)]
    pub result_set: Option<String>,
    #[serde(default)]
    pub execution_tier: Option<ExecutionTier>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComputedSpec {
    pub endpoint: String,
    #[serde(default)]
    pub execution_tier: Option<ExecutionTier>,
    #[serde(default)]
    pub endpoint_params: ParamSet,
    #[serde(default)]
    pub scale: Option<i64>,
    pub transformation: Transformation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    Sum,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    SimpleExtract {
        result_set: String,
        field: String,
        #[serde(default)]
        transform: Transform,
    },
    FilterAggregate {
        result_set: String,
        filter_field: String,
        filter_values: Vec<String>,
        #[serde(default)]
        aggregate: Aggregate,
        field: String,
    },
    ArithmeticSubtract {
        terms: Vec<Term>,
        formula: Formula,
    },
}

/// Filtered-sum lookup bound to one formula variable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Term {
    pub result_set: String,
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    pub field: String,
}

impl SourceSpec {
    pub fn endpoint(&self) -> &str {
        match self {
            SourceSpec::Direct(d) => &d.endpoint,
            SourceSpec::Computed(c) => &c.endpoint,
        }
    }

    /// Call parameters with internal `_`-prefixed hints removed.
    pub fn params(&self) -> ParamSet {
        let raw = match self {
            SourceSpec::Direct(d) => &d.params,
            SourceSpec::Computed(c) => &c.endpoint_params,
        };
        raw.iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn tier_override(&self) -> Option<ExecutionTier> {
        match self {
            SourceSpec::Direct(d) => d.execution_tier,
            SourceSpec::Computed(c) => c.execution_tier,
        }
    }

    pub fn scale(&self) -> Option<i64> {
        match self {
            SourceSpec::Direct(d) => d.scale,
            SourceSpec::Computed(c) => c.scale,
        }
    }

    pub fn referenced_result_sets(&self) -> Vec<&str> {
        match self {
            SourceSpec::Direct(d) => d.result_set.as_deref().into_iter().collect(),
            SourceSpec::Computed(c) => match &c.transformation {
                Transformation::SimpleExtract { result_set, .. }
                | Transformation::FilterAggregate { result_set, .. } => vec![result_set.as_str()],
                Transformation::ArithmeticSubtract { terms, .. } => {
                    terms.iter().map(|t| t.result_set.as_str()).collect()
                }
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnsFile {
    columns: Vec<Value>,
}

/// Immutable column registry plus the endpoint catalog it refers to.
#[derive(Debug, Clone)]
pub struct Registry {
    columns: Vec<ColumnDescriptor>,
    catalog: EndpointCatalog,
}

impl Registry {
    /// Process-wide registry built from the embedded data files.
    pub fn builtin() -> Result<&'static Registry> {
        BUILTIN.get_or_try_init(|| Registry::from_json(BUILTIN_COLUMNS, BUILTIN_ENDPOINTS))
    }

    pub fn from_json(columns_raw: &str, endpoints_raw: &str) -> Result<Self> {
        let catalog = EndpointCatalog::from_json(endpoints_raw)?;
        let file: ColumnsFile =
            serde_json::from_str(columns_raw).context("invalid column registry json")?;
        let mut columns = Vec::with_capacity(file.columns.len());
        for (idx, raw) in file.columns.into_iter().enumerate() {
            let label = raw
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{idx}"));
            let column: ColumnDescriptor = serde_json::from_value(raw)
                .with_context(|| format!("column {label} does not match the descriptor shape"))?;
            columns.push(column);
        }
        let registry = Self { columns, catalog };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for col in &self.columns {
            if !names.insert(col.name.as_str()) {
                bail!("column {} is declared twice", col.name);
            }
            if col.scale < 1 {
                bail!("column {} has a non-positive scale", col.name);
            }
            for (kind, spec) in &col.sources {
                if !col.applies_to.contains(kind) {
                    bail!("column {} has a {kind} source but does not apply to {kind}", col.name);
                }
                let endpoint = self.catalog.get(spec.endpoint()).with_context(|| {
                    format!("column {} references unknown endpoint {}", col.name, spec.endpoint())
                })?;
                if !endpoint.serves(*kind) {
                    bail!("column {}: endpoint {} does not serve {kind}", col.name, endpoint.name);
                }
                if kind.row_owner() == EntityKind::Team
                    && resolve_tier(&self.catalog, &endpoint.name, spec.tier_override())
                        == ExecutionTier::Player
                {
                    bail!("column {}: {kind} source cannot run per player", col.name);
                }
                for rs in spec.referenced_result_sets() {
                    if !endpoint.has_result_set(rs) {
                        bail!(
                            "column {}: endpoint {} has no result set {rs}",
                            col.name,
                            endpoint.name
                        );
                    }
                }
                if let SourceSpec::Computed(ComputedSpec {
                    transformation: Transformation::ArithmeticSubtract { terms, formula },
                    ..
                }) = spec
                {
                    if terms.is_empty() {
                        bail!("column {}: subtraction declares no terms", col.name);
                    }
                    if formula.max_var().is_some_and(|v| v >= terms.len()) {
                        bail!(
                            "column {}: formula {formula} references more than {} terms",
                            col.name,
                            terms.len()
                        );
                    }
                }
                if let SourceSpec::Direct(d) = spec
                    && FieldExpr::parse(&d.field).fields().next().is_none()
                {
                    bail!("column {}: empty field expression", col.name);
                }
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> &EndpointCatalog {
        &self.catalog
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Every (column, source) pair reading `endpoint` for `kind`.
    pub fn sources_for<'a, 'e>(
        &'a self,
        endpoint: &'e str,
        kind: EntityKind,
    ) -> impl Iterator<Item = (&'a ColumnDescriptor, &'a SourceSpec)> {
        self.columns.iter().filter_map(move |col| {
            col.source(kind)
                .filter(|spec| spec.endpoint() == endpoint)
                .map(|spec| (col, spec))
        })
    }

    /// Columns satisfied by one call of `endpoint` with the given parameter signature.
    pub fn columns_for(
        &self,
        endpoint: &str,
        kind: EntityKind,
        signature: &str,
    ) -> Vec<(&ColumnDescriptor, &SourceSpec)> {
        self.sources_for(endpoint, kind)
            .filter(|(_, spec)| param_signature(&spec.params()) == signature)
            .collect()
    }

    pub fn columns_by_frequency(&self, frequency: UpdateFrequency) -> Vec<&ColumnDescriptor> {
        self.columns
            .iter()
            .filter(|c| c.update_frequency == Some(frequency))
            .collect()
    }

    /// Entity columns a person may correct by hand: nullable and either not
    /// provider-derived or only refreshed annually.
    pub fn editable_columns(&self) -> Vec<&ColumnDescriptor> {
        self.columns
            .iter()
            .filter(|c| c.table == ColumnTable::Entity && c.nullable)
            .filter(|c| !c.is_api() || c.update_frequency == Some(UpdateFrequency::Annual))
            .collect()
    }

    /// Stored columns of a table, in declaration order, for `kind`'s rows.
    pub fn stored_columns(&self, owner: EntityKind, table: ColumnTable) -> Vec<(String, SqlType)> {
        let mut out = Vec::new();
        for col in self.columns.iter().filter(|c| c.table == table) {
            if col.applies_to.contains(&owner) {
                out.push((col.stored_name(owner), col.sql_type));
            }
            if owner == EntityKind::Team && col.applies_to.contains(&EntityKind::Opponent) {
                out.push((col.stored_name(EntityKind::Opponent), col.sql_type));
            }
        }
        out
    }
}
