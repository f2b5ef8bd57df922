//! Compiles a threshold document into a concrete query plan: window,
//! equality filters, grouping key and threshold predicate.
//!
//! Supported shape:
//!
//! ```yaml
//! id: SSH-Bruteforce
//! severity: high
//! window: 5m              # <int>m or <int>h
//! where:
//!   all:
//!     - event_module: auth
//!     - event_action: ssh_login_failed
//! group_by: [src_ip]
//! threshold:
//!   count: ">= 6"         # only >= is supported
//!   distinct_field: user  # optional
//! ```
//!
//! `filters:` is accepted as a flat alternative to `where.all`, and a filter
//! item may also be written as the string `key=value`.

use chrono::Duration;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use super::ThresholdRuleDoc;
use crate::detect::{DetectError, Severity};
use crate::storage::events::{Aggregate, EventField, Filter};

const DEFAULT_WINDOW: &str = "5m";
const DEFAULT_THRESHOLD: &str = ">= 10";

/// Threshold predicate: `value >= min_count`, over raw rows or distinct
/// values of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Threshold {
    pub min_count: i64,
    pub distinct_field: Option<EventField>,
}

impl Threshold {
    pub fn aggregate(&self) -> Aggregate {
        match self.distinct_field {
            Some(field) => Aggregate::Distinct(field),
            None => Aggregate::Count,
        }
    }

    pub fn is_met(&self, value: i64) -> bool {
        value >= self.min_count
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub id: String,
    pub severity: Severity,
    pub window: Duration,
    /// Window as written, for summaries.
    pub window_expr: String,
    pub filters: Vec<Filter>,
    pub group_by: Vec<EventField>,
    pub threshold: Threshold,
}

fn invalid(msg: impl Into<String>) -> DetectError {
    DetectError::Validation(msg.into())
}

/// Longest window a rule may ask for.
pub const MAX_WINDOW_HOURS: i64 = 24 * 366;

/// Parse `<integer><unit>` where unit is `m` (minutes) or `h` (hours).
pub fn parse_window(expr: &str) -> Result<Duration, DetectError> {
    let s = expr.trim().to_ascii_lowercase();
    let (digits, unit) = match s.char_indices().last() {
        Some((i, c)) => (&s[..i], c),
        None => return Err(invalid("empty window (use 'Xm' or 'Xh')")),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("unsupported window '{expr}' (use 'Xm' or 'Xh')")));
    }
    let n: i64 = digits
        .parse()
        .map_err(|_| invalid(format!("window '{expr}' is out of range")))?;
    if n == 0 {
        return Err(invalid(format!("window '{expr}' must be positive")));
    }

    let window = match unit {
        'm' => Duration::try_minutes(n),
        'h' => Duration::try_hours(n),
        _ => return Err(invalid(format!("unsupported window '{expr}' (use 'Xm' or 'Xh')"))),
    };
    match window {
        Some(w) if w <= Duration::hours(MAX_WINDOW_HOURS) => Ok(w),
        _ => Err(invalid(format!("window '{expr}' exceeds the {MAX_WINDOW_HOURS}h maximum"))),
    }
}

/// Parse `>= N`, tolerating whitespace around both tokens.
pub fn parse_count_expr(expr: &str) -> Result<i64, DetectError> {
    let unsupported = || invalid(format!("only 'count: \">= N\"' is supported, got '{expr}'"));
    let rest = expr.trim().strip_prefix(">=").ok_or_else(unsupported)?;
    let digits = rest.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(unsupported());
    }
    digits.parse().map_err(|_| unsupported())
}

/// Parse the `threshold` mapping.
pub fn parse_threshold(value: &Value) -> Result<Threshold, DetectError> {
    let Value::Mapping(th) = value else {
        return Err(invalid("threshold must be a mapping with a 'count' key"));
    };
    let min_count = match th.get("count") {
        Some(Value::String(expr)) => parse_count_expr(expr)?,
        _ => return Err(invalid("threshold.count must be a string like '>= 6'")),
    };
    let distinct_field = match th.get("distinct_field") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(EventField::from_key(name.trim()).ok_or_else(|| {
            invalid(format!("threshold.distinct_field '{name}' is not a known field"))
        })?),
        Some(_) => return Err(invalid("threshold.distinct_field must be a string when present")),
    };
    Ok(Threshold {
        min_count,
        distinct_field,
    })
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn filter_item(item: &Value) -> Option<Filter> {
    let (key, value) = match item {
        Value::Mapping(m) if m.len() == 1 => {
            let (k, v) = m.iter().next()?;
            (k.as_str()?.to_string(), scalar_to_string(v)?)
        }
        Value::String(s) => {
            let (k, v) = s.split_once('=')?;
            (k.trim().to_string(), v.trim().to_string())
        }
        _ => return None,
    };
    match EventField::from_key(&key) {
        Some(field) => Some(Filter::new(field, value)),
        None => {
            debug!(key = %key, "ignoring unknown filter key");
            None
        }
    }
}

/// Collect equality filters from `where.all` then `filters`, in document
/// order. Malformed items and unknown keys are dropped.
pub fn build_filters(body: &Mapping) -> Vec<Filter> {
    let mut items: Vec<&Value> = Vec::new();
    if let Some(Value::Mapping(w)) = body.get("where") {
        if let Some(Value::Sequence(all)) = w.get("all") {
            items.extend(all.iter());
        }
    }
    if let Some(Value::Sequence(flat)) = body.get("filters") {
        items.extend(flat.iter());
    }
    items.into_iter().filter_map(filter_item).collect()
}

/// Grouping fields in document order. Unknown names are dropped.
pub fn build_group_by(body: &Mapping) -> Result<Vec<EventField>, DetectError> {
    let names: Vec<&str> = match body.get("group_by") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| v.as_str().ok_or_else(|| invalid("group_by entries must be strings")))
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(invalid("group_by must be a list of field names")),
    };

    let mut fields = Vec::with_capacity(names.len());
    for name in names {
        match EventField::from_key(name.trim()) {
            Some(f) => fields.push(f),
            None => debug!(field = %name, "ignoring unknown group_by field"),
        }
    }
    Ok(fields)
}

/// Compile one document.
pub fn compile(doc: &ThresholdRuleDoc) -> Result<CompiledRule, DetectError> {
    let body = &doc.body;

    let severity = match body.get("severity") {
        None | Some(Value::Null) => Severity::Medium,
        Some(Value::String(s)) => s.parse()?,
        Some(_) => return Err(invalid("severity must be a string")),
    };

    let window_expr = match body.get("window") {
        None | Some(Value::Null) => DEFAULT_WINDOW.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(invalid(format!("window must be a string like '5m', got {other:?}")))
        }
    };
    let window = parse_window(&window_expr)?;

    let threshold = match body.get("threshold") {
        None | Some(Value::Null) => Threshold {
            min_count: parse_count_expr(DEFAULT_THRESHOLD)?,
            distinct_field: None,
        },
        Some(v) => parse_threshold(v)?,
    };

    Ok(CompiledRule {
        id: doc.id.clone(),
        severity,
        window,
        window_expr,
        filters: build_filters(body),
        group_by: build_group_by(body)?,
        threshold,
    })
}
