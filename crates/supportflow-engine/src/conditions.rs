//! Rule conditions: the second gate after the trigger-type match.
//!
//! A conditions block is a JSON object whose clauses are ANDed together:
//!
//! ```json
//! {
//!   "business_hours": {"start": "09:00", "end": "18:00", "days": [1,2,3,4,5], "timezone": "Europe/Moscow"},
//!   "user_statuses": ["new", "active"],
//!   "platforms": ["telegram"],
//!   "tags_any": ["vip"],
//!   "tags_none": ["blocked"],
//!   "fields": [{"field": "order.total", "operator": "greater_than", "value": 100}]
//! }
//! ```
//!
//! Parsing is eager ([`Conditions::parse`]); evaluation is pure given the
//! context and the audience snapshot the matcher resolved.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use supportflow_store::SupportUser;

use crate::context::TriggerContext;
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conditions {
    #[serde(default)]
    pub business_hours: Option<BusinessHours>,
    #[serde(default)]
    pub user_statuses: Option<Vec<String>>,
    #[serde(default)]
    pub platforms: Option<Vec<String>>,
    #[serde(default)]
    pub tags_any: Option<Vec<String>>,
    #[serde(default)]
    pub tags_none: Option<Vec<String>>,
    #[serde(default)]
    pub fields: Vec<FieldCondition>,
}

/// A local-time window on selected ISO weekdays (1 = Monday).
///
/// `end < start` describes a window that crosses midnight.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusinessHours {
    pub start: String,
    pub end: String,
    #[serde(default = "every_day")]
    pub days: Vec<u32>,
    #[serde(default = "utc_name")]
    pub timezone: String,
}

fn every_day() -> Vec<u32> {
    (1..=7).collect()
}

fn utc_name() -> String {
    "UTC".to_string()
}

/// A predicate over a dot path into `context.data`.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub operator: FieldOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Regex,
}

/// What the matcher knows about the event's audience.
#[derive(Debug, Clone, Default)]
pub struct Audience {
    pub user: Option<SupportUser>,
    /// Tags of the context conversation, if it resolved.
    pub conversation_tags: Vec<String>,
}

impl Audience {
    fn tags(&self) -> impl Iterator<Item = &String> {
        self.user
            .iter()
            .flat_map(|u| u.tags.iter())
            .chain(self.conversation_tags.iter())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Conditions {
    /// Parse and validate a conditions block. `null` means no conditions.
    pub fn parse(raw: &Value) -> Result<Self> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        let conditions: Conditions =
            serde_json::from_value(raw.clone()).map_err(|e| invalid(e.to_string()))?;

        if let Some(hours) = &conditions.business_hours {
            parse_clock(&hours.start)?;
            parse_clock(&hours.end)?;
            parse_timezone(&hours.timezone)?;
            if let Some(day) = hours.days.iter().find(|d| !(1..=7).contains(*d)) {
                return Err(invalid(format!("weekday {day} is outside 1..=7")));
            }
        }
        for field in &conditions.fields {
            if field.operator == FieldOperator::Regex {
                let pattern = field.value.as_str().unwrap_or_default();
                compiled(pattern)
                    .map_err(|e| invalid(format!("bad regex for `{}`: {e}", field.field)))?;
            }
        }
        Ok(conditions)
    }

    /// Whether any clause needs the user or conversation to be resolved.
    pub fn needs_audience(&self) -> bool {
        self.user_statuses.is_some()
            || self.platforms.is_some()
            || self.tags_any.is_some()
            || self.tags_none.is_some()
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    pub fn evaluate(&self, ctx: &TriggerContext, audience: &Audience) -> bool {
        if let Some(hours) = &self.business_hours
            && !hours.contains(ctx.timestamp)
        {
            return false;
        }

        if self.needs_audience() {
            let Some(user) = &audience.user else {
                return false;
            };
            if let Some(statuses) = &self.user_statuses
                && !statuses.iter().any(|s| s == &user.status)
            {
                return false;
            }
            if let Some(platforms) = &self.platforms
                && !platforms.iter().any(|p| p.eq_ignore_ascii_case(&user.platform))
            {
                return false;
            }
            if let Some(wanted) = &self.tags_any
                && !audience.tags().any(|t| wanted.contains(t))
            {
                return false;
            }
            if let Some(banned) = &self.tags_none
                && audience.tags().any(|t| banned.contains(t))
            {
                return false;
            }
        }

        self.fields.iter().all(|f| f.evaluate(&ctx.data))
    }
}

impl BusinessHours {
    /// Whether the Unix timestamp falls inside the window.
    pub fn contains(&self, timestamp: i64) -> bool {
        let (Ok(start), Ok(end), Ok(tz)) = (
            parse_clock(&self.start),
            parse_clock(&self.end),
            parse_timezone(&self.timezone),
        ) else {
            return false;
        };
        let Some(utc) = Utc.timestamp_opt(timestamp, 0).single() else {
            return false;
        };
        let local = utc.with_timezone(&tz);
        let time = local.time();

        if !self.days.contains(&local.weekday().number_from_monday()) {
            return false;
        }
        if start <= end {
            time >= start && time < end
        } else {
            time >= start || time < end
        }
    }
}

impl FieldCondition {
    pub fn evaluate(&self, data: &Value) -> bool {
        let actual = get_nested_value(data, &self.field);
        let expected = &self.value;

        match self.operator {
            FieldOperator::IsNull => actual.is_none_or(Value::is_null),
            FieldOperator::IsNotNull => actual.is_some_and(|v| !v.is_null()),
            FieldOperator::Equals => actual.is_some_and(|v| loosely_equal(v, expected)),
            FieldOperator::NotEquals => !actual.is_some_and(|v| loosely_equal(v, expected)),
            FieldOperator::Contains => actual.is_some_and(|v| contains(v, expected)),
            FieldOperator::NotContains => !actual.is_some_and(|v| contains(v, expected)),
            FieldOperator::StartsWith => string_pair(actual, expected)
                .is_some_and(|(a, e)| a.to_lowercase().starts_with(&e.to_lowercase())),
            FieldOperator::EndsWith => string_pair(actual, expected)
                .is_some_and(|(a, e)| a.to_lowercase().ends_with(&e.to_lowercase())),
            FieldOperator::GreaterThan => compare(actual, expected).is_some_and(|o| o.is_gt()),
            FieldOperator::GreaterThanOrEquals => {
                compare(actual, expected).is_some_and(|o| o.is_ge())
            }
            FieldOperator::LessThan => compare(actual, expected).is_some_and(|o| o.is_lt()),
            FieldOperator::LessThanOrEquals => compare(actual, expected).is_some_and(|o| o.is_le()),
            FieldOperator::In => in_list(actual, expected),
            FieldOperator::NotIn => !in_list(actual, expected),
            FieldOperator::Regex => string_pair(actual, expected).is_some_and(|(a, pattern)| {
                compiled(pattern).is_ok_and(|re| re.is_match(a))
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compiled `regex` field patterns, keyed by source text.
static PATTERNS: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// Compile `pattern` once per process. Invalid patterns are not cached.
fn compiled(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    if let Some(re) = PATTERNS.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    PATTERNS.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Walk a dot path (`order.items.0.sku`) through objects and arrays.
pub fn get_nested_value<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(json, |current, part| match current {
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        other => other.get(part),
    })
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => a.eq_ignore_ascii_case(e),
        (Value::Number(a), Value::Number(e)) => a.as_f64() == e.as_f64(),
        _ => actual == expected,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => a.to_lowercase().contains(&e.to_lowercase()),
        (Value::Array(items), e) => items.iter().any(|item| loosely_equal(item, e)),
        _ => false,
    }
}

fn in_list(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(v), Value::Array(items)) => items.iter().any(|item| loosely_equal(v, item)),
        _ => false,
    }
}

fn string_pair<'a>(actual: Option<&'a Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual?.as_str()?, expected.as_str()?))
}

/// Numeric comparison, accepting numbers encoded as strings.
fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = as_number(actual?)?;
    let e = as_number(expected)?;
    a.partial_cmp(&e)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_clock(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| invalid(format!("bad time of day `{raw}`: {e}")))
}

pub(crate) fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::InvalidTimezone(name.to_string()))
}

fn invalid(reason: String) -> EngineError {
    EngineError::InvalidTriggerConfig {
        trigger: "conditions".into(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
