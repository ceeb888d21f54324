use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::EtlError;
use crate::http_client::http_client;
use crate::model::{EndpointResponse, ParamSet, ResultTable};

const STATS_BASE_URL: &str = "https://stats.nba.com/stats/";

/// Anything that can answer an endpoint call. The backfill only talks to this.
pub trait StatsProvider: Send + Sync {
    fn call_endpoint(&self, endpoint: &str, params: &ParamSet) -> Result<EndpointResponse, EtlError>;
}

/// Blocking client for the public stats site.
pub struct NbaStatsClient {
    base_url: String,
    timeout: Duration,
}

impl NbaStatsClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(STATS_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url, timeout }
    }
}

impl StatsProvider for NbaStatsClient {
    fn call_endpoint(&self, endpoint: &str, params: &ParamSet) -> Result<EndpointResponse, EtlError> {
        let client = http_client(self.timeout).map_err(|err| EtlError::Transient {
            endpoint: endpoint.to_string(),
            message: format!("{err:#}"),
        })?;
        let query = query_pairs(params);
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(endpoint, ?query, "calling stats endpoint");

        let resp = client
            .get(&url)
            .query(&query)
            .send()
            .map_err(|err| EtlError::Transient {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })?;
        let status = resp.status();
        let body = resp.text().map_err(|err| EtlError::Transient {
            endpoint: endpoint.to_string(),
            message: format!("failed reading body: {err}"),
        })?;
        if !status.is_success() {
            return Err(status_error(endpoint, status, &body));
        }
        parse_payload(endpoint, &body)
    }
}

fn status_error(endpoint: &str, status: StatusCode, body: &str) -> EtlError {
    let snippet = body
        .trim()
        .replace(['\n', '\r'], " ")
        .chars()
        .take(220)
        .collect::<String>();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EtlError::Transient {
            endpoint: endpoint.to_string(),
            message: format!("http {status}: {snippet}"),
        }
    } else {
        EtlError::Rejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message: snippet,
        }
    }
}

/// Internal parameter keys as the provider spells them. Unknown keys are
/// PascalCased. Defaults the provider insists on are filled in here.
pub fn query_pairs(params: &ParamSet) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (key, value) in params {
        if key.starts_with('_') {
            continue;
        }
        pairs.push((api_param_name(key), query_value(value)));
    }
    for (key, value) in [
        ("LeagueID", "00"),
        ("PerMode", "Totals"),
        ("LastNGames", "0"),
        ("Month", "0"),
        ("OpponentTeamID", "0"),
        ("Period", "0"),
    ] {
        if !pairs.iter().any(|(k, _)| k == key) {
            pairs.push((key.to_string(), value.to_string()));
        }
    }
    pairs
}

pub fn api_param_name(key: &str) -> String {
    match key {
        "season" => "Season".to_string(),
        "season_type" | "season_type_all_star" => "SeasonType".to_string(),
        "measure_type_detailed" | "measure_type_detailed_defense" => "MeasureType".to_string(),
        "pt_measure_type" => "PtMeasureType".to_string(),
        "player_or_team" => "PlayerOrTeam".to_string(),
        "defense_category" => "DefenseCategory".to_string(),
        "per_mode" | "per_mode_simple" => "PerMode".to_string(),
        "team_id" => "TeamID".to_string(),
        "player_id" => "PlayerID".to_string(),
        "league_id" => "LeagueID".to_string(),
        other => other
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect(),
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(rename = "resultSets")]
    result_sets: Option<Value>,
    #[serde(rename = "resultSet")]
    result_set: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawResultSet {
    name: String,
    headers: Vec<Value>,
    #[serde(rename = "rowSet")]
    row_set: Vec<Vec<Value>>,
}

/// Decodes a `resultSets` (list or single object) or `resultSet` payload.
pub fn parse_payload(endpoint: &str, body: &str) -> Result<EndpointResponse, EtlError> {
    let decode = |message: String| EtlError::Decode {
        endpoint: endpoint.to_string(),
        message,
    };
    let payload: RawPayload =
        serde_json::from_str(body.trim()).map_err(|err| decode(format!("invalid json: {err}")))?;
    let sets = payload
        .result_sets
        .or(payload.result_set)
        .ok_or_else(|| decode("payload has no resultSets".to_string()))?;
    let sets: Vec<RawResultSet> = match sets {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>(),
        single => serde_json::from_value(single).map(|set| vec![set]),
    }
    .map_err(|err| decode(format!("malformed result set: {err}")))?;

    let mut response = EndpointResponse::new();
    for set in sets {
        let headers = set
            .headers
            .iter()
            .map(|h| match h {
                Value::String(s) => Ok(s.clone()),
                other => Err(decode(format!("unsupported header {other} in {}", set.name))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        response.insert(&set.name, ResultTable::from_header_rows(&headers, &set.row_set));
    }
    Ok(response)
}
