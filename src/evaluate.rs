use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::catalog::EndpointMeta;
use crate::error::EtlError;
use crate::model::{
    ColumnValue, EndpointResponse, EntityId, ResultTable, value_as_entity_id, value_as_f64,
};
use crate::registry::{ComputedSpec, DirectFieldSpec, SourceSpec, Term, Transformation};
use crate::transforms::{FieldExpr, Transform};

/// What the evaluator needs to know about the call that produced a response.
#[derive(Debug, Clone, Default)]
pub struct EvalContext<'a> {
    /// Row field holding the entity id (`PLAYER_ID`, `TEAM_ID`, `VS_PLAYER_ID`...).
    pub id_field: String,
    /// Entity a per-entity call was made for; claims rows that carry no id.
    pub call_entity: Option<EntityId>,
    /// Entities that must get a value from aggregate columns even with no rows.
    pub entities: BTreeSet<EntityId>,
    /// Stored games played per entity, when known.
    pub games_played: Option<&'a HashMap<EntityId, i64>>,
}

impl EvalContext<'_> {
    fn row_entity(&self, row: &HashMap<String, Value>) -> Option<EntityId> {
        row.get(&self.id_field)
            .and_then(value_as_entity_id)
            .or(self.call_entity)
    }

    /// Value stored when an entity has no qualifying rows: a real zero if it
    /// played, unknown if it did not (or if we cannot tell).
    fn empty_aggregate(&self, entity: EntityId) -> ColumnValue {
        match self.games_played {
            None => ColumnValue::Int(0),
            Some(gp) => match gp.get(&entity) {
                Some(games) if *games > 0 => ColumnValue::Int(0),
                _ => ColumnValue::Null,
            },
        }
    }
}

/// Turns one endpoint response into per-entity values for a single column.
pub fn evaluate(
    spec: &SourceSpec,
    scale: i64,
    endpoint: &EndpointMeta,
    response: &EndpointResponse,
    ctx: &EvalContext<'_>,
) -> Result<BTreeMap<EntityId, ColumnValue>, EtlError> {
    match spec {
        SourceSpec::Direct(direct) => evaluate_direct(direct, scale, endpoint, response, ctx),
        SourceSpec::Computed(computed) => {
            evaluate_computed(computed, scale, endpoint, response, ctx)
        }
    }
}

fn evaluate_direct(
    spec: &DirectFieldSpec,
    scale: i64,
    endpoint: &EndpointMeta,
    response: &EndpointResponse,
    ctx: &EvalContext<'_>,
) -> Result<BTreeMap<EntityId, ColumnValue>, EtlError> {
    let result_set = match spec.result_set.as_deref() {
        Some(name) => name,
        None => endpoint
            .primary_result_set()
            .ok_or_else(|| EtlError::UnknownEndpoint(endpoint.name.clone()))?,
    };
    let table = lookup_table(&endpoint.name, response, result_set)?;
    let expr = FieldExpr::parse(&spec.field);
    for field in expr.fields() {
        require_field(&endpoint.name, result_set, table, field)?;
    }
    Ok(extract(table, &expr, spec.transform, spec.scale.unwrap_or(scale), ctx))
}

fn evaluate_computed(
    spec: &ComputedSpec,
    scale: i64,
    endpoint: &EndpointMeta,
    response: &EndpointResponse,
    ctx: &EvalContext<'_>,
) -> Result<BTreeMap<EntityId, ColumnValue>, EtlError> {
    let scale = spec.scale.unwrap_or(scale);
    match &spec.transformation {
        Transformation::SimpleExtract {
            result_set,
            field,
            transform,
        } => {
            let table = lookup_table(&endpoint.name, response, result_set)?;
            require_field(&endpoint.name, result_set, table, field)?;
            let expr = FieldExpr::parse(field);
            Ok(extract(table, &expr, *transform, scale, ctx))
        }
        Transformation::FilterAggregate {
            result_set,
            filter_field,
            filter_values,
            field,
            ..
        } => {
            let filter = RowFilter::AnyOf {
                field: filter_field,
                values: filter_values,
            };
            let sums = filtered_sums(&endpoint.name, response, result_set, &filter, field, ctx)?;
            let mut out = BTreeMap::new();
            for entity in candidate_entities(&[&sums], ctx) {
                let value = match sums.get(&entity) {
                    Some(total) => ColumnValue::Int(scaled_sum(*total, scale)),
                    None => ctx.empty_aggregate(entity),
                };
                out.insert(entity, value);
            }
            Ok(out)
        }
        Transformation::ArithmeticSubtract { terms, formula } => {
            let term_sums = terms
                .iter()
                .map(|term| term_sums(&endpoint.name, response, term, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let refs: Vec<&HashMap<EntityId, f64>> = term_sums.iter().collect();
            let mut out = BTreeMap::new();
            for entity in candidate_entities(&refs, ctx) {
                if term_sums.iter().all(|sums| !sums.contains_key(&entity)) {
                    out.insert(entity, ctx.empty_aggregate(entity));
                    continue;
                }
                let values: Vec<f64> = term_sums
                    .iter()
                    .map(|sums| sums.get(&entity).copied().unwrap_or(0.0))
                    .collect();
                out.insert(
                    entity,
                    ColumnValue::Int(scaled_sum(formula.evaluate(&values), scale)),
                );
            }
            Ok(out)
        }
    }
}

fn term_sums(
    endpoint: &str,
    response: &EndpointResponse,
    term: &Term,
    ctx: &EvalContext<'_>,
) -> Result<HashMap<EntityId, f64>, EtlError> {
    let filter = RowFilter::AllEqual(&term.filter);
    filtered_sums(endpoint, response, &term.result_set, &filter, &term.field, ctx)
}

enum RowFilter<'a> {
    AnyOf { field: &'a str, values: &'a [String] },
    AllEqual(&'a BTreeMap<String, String>),
}

impl RowFilter<'_> {
    fn fields(&self) -> Vec<&str> {
        match self {
            RowFilter::AnyOf { field, .. } => vec![*field],
            RowFilter::AllEqual(pairs) => pairs.keys().map(String::as_str).collect(),
        }
    }

    fn matches(&self, row: &HashMap<String, Value>) -> bool {
        match self {
            RowFilter::AnyOf { field, values } => row
                .get(*field)
                .is_some_and(|cell| values.iter().any(|v| cell_matches(cell, v))),
            RowFilter::AllEqual(pairs) => pairs
                .iter()
                .all(|(field, want)| row.get(field).is_some_and(|cell| cell_matches(cell, want))),
        }
    }
}

fn cell_matches(cell: &Value, want: &str) -> bool {
    match cell {
        Value::String(s) => s.trim() == want,
        Value::Number(n) => match (n.as_f64(), want.trim().parse::<f64>()) {
            (Some(have), Ok(want)) => have == want,
            _ => n.to_string() == want,
        },
        _ => false,
    }
}

/// Sum of `field` over matching rows, per entity. Entities without a
/// matching row are absent, not zero.
fn filtered_sums(
    endpoint: &str,
    response: &EndpointResponse,
    result_set: &str,
    filter: &RowFilter<'_>,
    field: &str,
    ctx: &EvalContext<'_>,
) -> Result<HashMap<EntityId, f64>, EtlError> {
    let table = lookup_table(endpoint, response, result_set)?;
    require_field(endpoint, result_set, table, field)?;
    for filter_field in filter.fields() {
        require_field(endpoint, result_set, table, filter_field)?;
    }
    let mut sums: HashMap<EntityId, f64> = HashMap::new();
    for row in table.rows.iter().filter(|row| filter.matches(row)) {
        let Some(entity) = ctx.row_entity(row) else {
            continue;
        };
        let value = row.get(field).and_then(value_as_f64).unwrap_or(0.0);
        *sums.entry(entity).or_insert(0.0) += value;
    }
    Ok(sums)
}

fn candidate_entities(
    sums: &[&HashMap<EntityId, f64>],
    ctx: &EvalContext<'_>,
) -> BTreeSet<EntityId> {
    let mut all: BTreeSet<EntityId> = ctx.entities.clone();
    all.extend(ctx.call_entity);
    for map in sums {
        all.extend(map.keys().copied());
    }
    all
}

fn extract(
    table: &ResultTable,
    expr: &FieldExpr,
    transform: Transform,
    scale: i64,
    ctx: &EvalContext<'_>,
) -> BTreeMap<EntityId, ColumnValue> {
    let mut out = BTreeMap::new();
    for row in &table.rows {
        let Some(entity) = ctx.row_entity(row) else {
            continue;
        };
        let value = match expr.resolve(row) {
            Some(raw) => transform.apply(Some(&raw), scale),
            None if expr.is_single() => transform.apply(None, scale),
            None => transform.empty(),
        };
        out.insert(entity, value);
    }
    out
}

fn lookup_table<'r>(
    endpoint: &str,
    response: &'r EndpointResponse,
    result_set: &str,
) -> Result<&'r ResultTable, EtlError> {
    response
        .get(result_set)
        .ok_or_else(|| EtlError::MissingResultSet {
            endpoint: endpoint.to_string(),
            result_set: result_set.to_string(),
        })
}

/// An empty table is a valid "no data"; a populated one must carry the field.
fn require_field(
    endpoint: &str,
    result_set: &str,
    table: &ResultTable,
    field: &str,
) -> Result<(), EtlError> {
    if table.is_empty() || table.has_field(field) {
        return Ok(());
    }
    Err(EtlError::MissingField {
        endpoint: endpoint.to_string(),
        result_set: result_set.to_string(),
        field: field.to_string(),
    })
}

fn scaled_sum(total: f64, scale: i64) -> i64 {
    (total * scale as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use serde_json::{Value, json};

    use super::{EvalContext, evaluate};
    use crate::catalog::EndpointCatalog;
    use crate::error::EtlError;
    use crate::model::{ColumnValue, EndpointResponse, ResultTable};
    use crate::registry::SourceSpec;

    fn row(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn catalog() -> EndpointCatalog {
        EndpointCatalog::from_json(
            r#"{"endpoints": [
                {"name": "leaguedashteamstats", "entity_types": ["team"],
                 "result_sets": ["LeagueDashTeamStats"]},
                {"name": "playerdashptreb", "entity_types": ["player"],
                 "result_sets": ["OverallRebounding", "NumContestedRebounding"]}
            ]}"#,
        )
        .unwrap()
    }

    fn ctx(id_field: &str) -> EvalContext<'static> {
        EvalContext {
            id_field: id_field.to_string(),
            ..EvalContext::default()
        }
    }

    #[test]
    fn direct_field_expression_subtracts_before_transform() {
        let catalog = catalog();
        let meta = catalog.get("leaguedashteamstats").unwrap();
        let spec: SourceSpec = serde_json::from_value(json!({
            "endpoint": "leaguedashteamstats", "field": "FGM - FG3M"
        }))
        .unwrap();
        let response = EndpointResponse::new().with_set(
            "LeagueDashTeamStats",
            ResultTable::from_rows(vec![
                row(&[("TEAM_ID", json!(1)), ("FGM", json!(40)), ("FG3M", json!(12))]),
                row(&[("TEAM_ID", json!(2)), ("FGM", json!("bad")), ("FG3M", json!(10))]),
            ]),
        );
        let out = evaluate(&spec, 1, meta, &response, &ctx("TEAM_ID")).unwrap();
        assert_eq!(out[&1], ColumnValue::Int(28));
        assert_eq!(out[&2], ColumnValue::Int(0));
    }

    #[test]
    fn simple_extract_uses_call_entity_when_rows_carry_no_id() {
        let catalog = catalog();
        let meta = catalog.get("playerdashptreb").unwrap();
        let spec: SourceSpec = serde_json::from_value(json!({
            "endpoint": "playerdashptreb",
            "transformation": {"type": "simple_extract", "result_set": "OverallRebounding", "field": "C_OREB"}
        }))
        .unwrap();
        let response = EndpointResponse::new()
            .with_set(
                "OverallRebounding",
                ResultTable::from_rows(vec![row(&[("C_OREB", json!(17))])]),
            )
            .with_set("NumContestedRebounding", ResultTable::default());
        let mut context = ctx("PLAYER_ID");
        context.call_entity = Some(203999);
        let out = evaluate(&spec, 1, meta, &response, &context).unwrap();
        assert_eq!(out.get(&203999), Some(&ColumnValue::Int(17)));
    }

    #[test]
    fn missing_field_in_populated_table_is_reported() {
        let catalog = catalog();
        let meta = catalog.get("leaguedashteamstats").unwrap();
        let spec: SourceSpec = serde_json::from_value(json!({
            "endpoint": "leaguedashteamstats", "field": "OPP_FGM"
        }))
        .unwrap();
        let response = EndpointResponse::new().with_set(
            "LeagueDashTeamStats",
            ResultTable::from_rows(vec![row(&[("TEAM_ID", json!(1)), ("FGM", json!(40))])]),
        );
        let err = evaluate(&spec, 1, meta, &response, &ctx("TEAM_ID")).unwrap_err();
        assert!(matches!(err, EtlError::MissingField { ref field, .. } if field == "OPP_FGM"));

        let empty = EndpointResponse::new().with_set("LeagueDashTeamStats", ResultTable::default());
        let out = evaluate(&spec, 1, meta, &empty, &ctx("TEAM_ID")).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn interested_entities_without_rows_follow_games_played() {
        let catalog = catalog();
        let meta = catalog.get("playerdashptreb").unwrap();
        let spec: SourceSpec = serde_json::from_value(json!({
            "endpoint": "playerdashptreb",
            "transformation": {"type": "filter_aggregate", "result_set": "NumContestedRebounding",
                "filter_field": "REB_NUM_CONTESTING_RANGE", "filter_values": ["2", "3+"], "field": "OREB"}
        }))
        .unwrap();
        let response = EndpointResponse::new()
            .with_set("OverallRebounding", ResultTable::default())
            .with_set(
                "NumContestedRebounding",
                ResultTable::from_rows(vec![
                    row(&[("PLAYER_ID", json!(1)), ("REB_NUM_CONTESTING_RANGE", json!("2")), ("OREB", json!(3))]),
                    row(&[("PLAYER_ID", json!(1)), ("REB_NUM_CONTESTING_RANGE", json!("3+")), ("OREB", json!(2))]),
                    row(&[("PLAYER_ID", json!(1)), ("REB_NUM_CONTESTING_RANGE", json!("0")), ("OREB", json!(9))]),
                ]),
            );
        let games: HashMap<i64, i64> = [(1, 60), (2, 0)].into_iter().collect();
        let context = EvalContext {
            id_field: "PLAYER_ID".to_string(),
            call_entity: None,
            entities: BTreeSet::from([1, 2, 3]),
            games_played: Some(&games),
        };
        let out = evaluate(&spec, 1, meta, &response, &context).unwrap();
        assert_eq!(out[&1], ColumnValue::Int(5));
        assert_eq!(out[&2], ColumnValue::Null);
        assert_eq!(out[&3], ColumnValue::Null);
    }

    #[test]
    fn numeric_cells_match_filters_by_value() {
        let catalog = catalog();
        let meta = catalog.get("playerdashptreb").unwrap();
        let spec: SourceSpec = serde_json::from_value(json!({
            "endpoint": "playerdashptreb",
            "transformation": {"type": "filter_aggregate", "result_set": "NumContestedRebounding",
                "filter_field": "REB_NUM_CONTESTING", "filter_values": ["2", "3"], "field": "OREB"}
        }))
        .unwrap();
        let response = EndpointResponse::new().with_set(
            "NumContestedRebounding",
            ResultTable::from_rows(vec![
                row(&[("PLAYER_ID", json!(1)), ("REB_NUM_CONTESTING", json!(2.0)), ("OREB", json!(4))]),
                row(&[("PLAYER_ID", json!(1)), ("REB_NUM_CONTESTING", json!(3)), ("OREB", json!(1))]),
                row(&[("PLAYER_ID", json!(1)), ("REB_NUM_CONTESTING", json!(2.5)), ("OREB", json!(8))]),
            ]),
        );
        let out = evaluate(&spec, 1, meta, &response, &ctx("PLAYER_ID")).unwrap();
        assert_eq!(out[&1], ColumnValue::Int(5));
    }
}
