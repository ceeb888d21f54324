use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ColumnValue, value_as_f64};

/// Conversions applied to raw provider cells. None of them fail: malformed
/// input maps to the transform's empty sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    SafeInt,
    SafeFloat,
    SafeStr,
    ParseHeight,
    ParseBirthdate,
    FormatSeason,
}

impl Transform {
    pub fn apply(self, raw: Option<&Value>, scale: i64) -> ColumnValue {
        let raw = raw.unwrap_or(&Value::Null);
        match self {
            Transform::SafeInt => safe_int(raw, scale),
            Transform::SafeFloat => safe_float(raw, scale),
            Transform::SafeStr => safe_str(raw),
            Transform::ParseHeight => parse_height(raw),
            Transform::ParseBirthdate => parse_birthdate(raw),
            Transform::FormatSeason => format_season(raw),
        }
    }

    /// Sentinel used when a numeric field expression cannot be evaluated.
    pub fn empty(self) -> ColumnValue {
        match self {
            Transform::SafeInt | Transform::ParseHeight => ColumnValue::Int(0),
            _ => ColumnValue::Null,
        }
    }
}

pub fn safe_int(raw: &Value, scale: i64) -> ColumnValue {
    match value_as_f64(raw) {
        Some(v) => ColumnValue::Int(scaled(v, scale)),
        None => ColumnValue::Int(0),
    }
}

/// Rate stats are stored as scaled integers; unknown stays null.
pub fn safe_float(raw: &Value, scale: i64) -> ColumnValue {
    match value_as_f64(raw) {
        Some(v) if scale == 1 => ColumnValue::Float(v),
        Some(v) => ColumnValue::Int(scaled(v, scale)),
        None => ColumnValue::Null,
    }
}

pub fn safe_str(raw: &Value) -> ColumnValue {
    match raw {
        Value::Null => ColumnValue::Null,
        Value::String(s) if s.trim().is_empty() => ColumnValue::Null,
        Value::String(s) => ColumnValue::Text(s.trim().to_string()),
        Value::Number(n) => ColumnValue::Text(n.to_string()),
        Value::Bool(b) => ColumnValue::Text(b.to_string()),
        _ => ColumnValue::Null,
    }
}

/// `"6-8"` -> 80 inches; plain numbers pass through.
pub fn parse_height(raw: &Value) -> ColumnValue {
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return ColumnValue::Int(0),
    };
    if let Some((feet, inches)) = text.split_once('-') {
        let (Ok(feet), Ok(inches)) = (feet.trim().parse::<i64>(), inches.trim().parse::<i64>())
        else {
            return ColumnValue::Int(0);
        };
        return feet
            .checked_mul(12)
            .and_then(|total| total.checked_add(inches))
            .map_or(ColumnValue::Int(0), ColumnValue::Int);
    }
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => ColumnValue::Int(v as i64),
        _ => ColumnValue::Int(0),
    }
}

pub fn parse_birthdate(raw: &Value) -> ColumnValue {
    let Some(text) = raw.as_str() else {
        return ColumnValue::Null;
    };
    let head = text.trim().split('.').next().unwrap_or_default();
    let date_part = head.split('T').next().unwrap_or_default();
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, fmt) {
            return ColumnValue::Date(date);
        }
    }
    ColumnValue::Null
}

/// Draft-style starting year (2012) -> `"2012-13"`.
pub fn format_season(raw: &Value) -> ColumnValue {
    let Some(year) = value_as_f64(raw) else {
        return ColumnValue::Null;
    };
    if !(1900.0..=2200.0).contains(&year) {
        return ColumnValue::Null;
    }
    let year = year as i64;
    ColumnValue::Text(format!("{year}-{:02}", (year + 1) % 100))
}

fn scaled(v: f64, scale: i64) -> i64 {
    // Scaled values are truncated like the provider's own integer fields.
    (v * scale as f64) as i64
}

/// A provider field or a `+`/`-` chain of fields such as `FGM - FG3M`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldExpr {
    terms: Vec<(f64, String)>,
}

impl FieldExpr {
    pub fn parse(raw: &str) -> Self {
        let mut terms = Vec::new();
        let mut sign = 1.0;
        for token in raw.split_whitespace() {
            match token {
                "+" => sign = 1.0,
                "-" => sign = -1.0,
                field => {
                    terms.push((sign, field.to_string()));
                    sign = 1.0;
                }
            }
        }
        Self { terms }
    }

    pub fn is_single(&self) -> bool {
        self.terms.len() == 1
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(_, f)| f.as_str())
    }

    /// The raw cell for single-field expressions, or the computed number.
    pub fn resolve(&self, row: &HashMap<String, Value>) -> Option<Value> {
        if let [(_, field)] = self.terms.as_slice() {
            return row.get(field).cloned();
        }
        let mut total = 0.0;
        for (sign, field) in &self.terms {
            total += sign * value_as_f64(row.get(field)?)?;
        }
        serde_json::Number::from_f64(total).map(Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::NaiveDate;
    use serde_json::json;

    use super::{FieldExpr, Transform};
    use crate::model::ColumnValue;

    #[test]
    fn malformed_values_fall_back_to_sentinels() {
        assert_eq!(Transform::SafeInt.apply(Some(&json!("n/a")), 1), ColumnValue::Int(0));
        assert_eq!(Transform::SafeFloat.apply(Some(&json!("")), 1000), ColumnValue::Null);
        assert_eq!(Transform::SafeStr.apply(None, 1), ColumnValue::Null);
        assert_eq!(Transform::ParseHeight.apply(Some(&json!("six-eight")), 1), ColumnValue::Int(0));
        assert_eq!(Transform::ParseBirthdate.apply(Some(&json!("nan")), 1), ColumnValue::Null);
        assert_eq!(
            Transform::ParseHeight.apply(Some(&json!("1000000000000000000-0")), 1),
            ColumnValue::Int(0)
        );
        assert_eq!(
            Transform::ParseHeight.apply(Some(&json!("7-9223372036854775807")), 1),
            ColumnValue::Int(0)
        );
        assert_eq!(Transform::FormatSeason.apply(Some(&json!(1e30)), 1), ColumnValue::Null);
        assert_eq!(Transform::FormatSeason.apply(Some(&json!(-40)), 1), ColumnValue::Null);
    }

    #[test]
    fn scales_and_parses() {
        assert_eq!(Transform::SafeInt.apply(Some(&json!(34.56)), 10), ColumnValue::Int(345));
        assert_eq!(Transform::SafeFloat.apply(Some(&json!(0.2514)), 1000), ColumnValue::Int(251));
        assert_eq!(Transform::ParseHeight.apply(Some(&json!("6-8")), 1), ColumnValue::Int(80));
        assert_eq!(
            Transform::ParseBirthdate.apply(Some(&json!("2001-02-18T00:00:00")), 1),
            ColumnValue::Date(NaiveDate::from_ymd_opt(2001, 2, 18).unwrap())
        );
        assert_eq!(
            Transform::ParseBirthdate.apply(Some(&json!("02/18/2001")), 1),
            ColumnValue::Date(NaiveDate::from_ymd_opt(2001, 2, 18).unwrap())
        );
        assert_eq!(
            Transform::FormatSeason.apply(Some(&json!(1999)), 1),
            ColumnValue::Text("1999-00".to_string())
        );
    }

    #[test]
    fn field_expressions_subtract() {
        let row: HashMap<String, serde_json::Value> =
            [("FGM".to_string(), json!(10)), ("FG3M".to_string(), json!(4))]
                .into_iter()
                .collect();
        let expr = FieldExpr::parse("FGM - FG3M");
        assert!(!expr.is_single());
        assert_eq!(expr.resolve(&row).and_then(|v| v.as_f64()), Some(6.0));
        assert_eq!(FieldExpr::parse("FGM - OPP_FG3M").resolve(&row), None);
    }
}
