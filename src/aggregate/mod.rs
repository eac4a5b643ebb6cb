//! Batch aggregation - reduce per-item results into one value
//!
//! Strategies: `concat`, `stats`, `filter`, `group`, `summary` and
//! `custom` (user code in a child interpreter, see [`custom`]).

pub mod custom;
pub mod expr;
pub mod stats;

pub use custom::{CustomRunner, Language};
pub use expr::{ExprError, Predicate};
pub use stats::FieldStats;

use crate::config::EngineConfig;
use crate::core::TaskResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const UNSUPPORTED_STRATEGY: &str = "Unsupported aggregation strategy";

/// String fields tried, in order, by `concat`
const TEXT_FIELDS: [&str; 3] = ["text", "output", "result"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    Concat,
    Stats,
    Filter,
    Group,
    Summary,
    Custom,
}

impl AggregationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concat => "concat",
            Self::Stats => "stats",
            Self::Filter => "filter",
            Self::Group => "group",
            Self::Summary => "summary",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationStrategy {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concat" => Ok(Self::Concat),
            "stats" => Ok(Self::Stats),
            "filter" => Ok(Self::Filter),
            "group" => Ok(Self::Group),
            "summary" => Ok(Self::Summary),
            "custom" => Ok(Self::Custom),
            _ => Err(AggregateError::UnsupportedStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Unsupported aggregation strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("Invalid expression: {0}")]
    Expression(#[from] ExprError),

    #[error("{error_type}: {message}")]
    Custom { error_type: String, message: String },
}

impl AggregateError {
    pub fn custom(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Custom {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            Self::UnsupportedStrategy(_) => "UnsupportedStrategy",
            Self::InvalidOptions(_) => "InvalidOptions",
            Self::Expression(_) => "ExpressionError",
            Self::Custom { error_type, .. } => error_type,
        }
    }
}

/// Outcome of one `aggregate` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub strategy: String,
    pub item_count: usize,
}

impl AggregationResult {
    fn ok(strategy: &str, item_count: usize, result: Option<Value>) -> Self {
        Self {
            success: true,
            result,
            error: None,
            error_type: None,
            strategy: strategy.to_string(),
            item_count,
        }
    }

    fn failed(strategy: &str, item_count: usize, err: &AggregateError) -> Self {
        let error = match err {
            AggregateError::UnsupportedStrategy(_) => UNSUPPORTED_STRATEGY.to_string(),
            AggregateError::Custom { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            success: false,
            result: None,
            error: Some(error),
            error_type: Some(err.error_type().to_string()),
            strategy: strategy.to_string(),
            item_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConcatOptions {
    field: Option<String>,
    separator: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatsOptions {
    fields: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterOptions {
    condition: Option<String>,
    field: Option<String>,
    operator: Option<String>,
    value: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GroupOptions {
    field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SummaryField {
    Count,
    CountWhere { condition: String },
    Rate { condition: String },
    Sum { field: String },
    Mean { field: String },
    Min { field: String },
    Max { field: String },
    Unique { field: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryOptions {
    fields: BTreeMap<String, SummaryField>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CustomOptions {
    code: String,
    language: Language,
    timeout_secs: Option<f64>,
    kwargs: Map<String, Value>,
}

/// Reduces batch-mode step outputs into a single value
#[derive(Debug, Clone)]
pub struct BatchAggregator {
    runner: CustomRunner,
}

impl BatchAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            runner: CustomRunner {
                python_command: config.python_command.clone(),
                node_command: config.node_command.clone(),
                default_timeout: config.custom_timeout(),
            },
        }
    }

    /// Run `strategy` over `items`; failures come back as an unsuccessful
    /// [`AggregationResult`], never as a panic
    pub async fn aggregate(&self, items: &[Value], strategy: &str, options: &Value) -> AggregationResult {
        let item_count = items.len();
        let parsed = match strategy.parse::<AggregationStrategy>() {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("Rejected aggregation strategy {:?}", strategy);
                return AggregationResult::failed(strategy, item_count, &err);
            }
        };

        let outcome = match parsed {
            AggregationStrategy::Concat => parse_options(options).map(|o| concat(items, o)),
            AggregationStrategy::Stats => parse_options(options).map(|o| stats(items, o)),
            AggregationStrategy::Filter => parse_options(options).and_then(|o| filter(items, o)),
            AggregationStrategy::Group => parse_options(options).and_then(|o| group(items, o)),
            AggregationStrategy::Summary => parse_options(options).and_then(|o| summary(items, o)),
            AggregationStrategy::Custom => match parse_options::<CustomOptions>(options) {
                Ok(o) => self.custom(items, o).await,
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(result) => {
                log::debug!("Aggregated {} items with {}", item_count, parsed);
                AggregationResult::ok(parsed.as_str(), item_count, result)
            }
            Err(err) => {
                log::warn!("Aggregation {} failed: {}", parsed, err);
                AggregationResult::failed(parsed.as_str(), item_count, &err)
            }
        }
    }

    async fn custom(&self, items: &[Value], options: CustomOptions) -> Result<Option<Value>, AggregateError> {
        if options.code.trim().is_empty() {
            return Err(AggregateError::custom("ValueError", "custom strategy requires `code`"));
        }
        let timeout = match options.timeout_secs {
            Some(secs) if secs > 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => Some(timeout),
                Err(e) => {
                    return Err(AggregateError::custom(
                        "ValueError",
                        format!("timeout_secs {} is out of range: {}", secs, e),
                    ))
                }
            },
            Some(secs) => {
                return Err(AggregateError::custom(
                    "ValueError",
                    format!("timeout_secs must be positive, got {}", secs),
                ))
            }
            None => None,
        };

        self.runner
            .run(options.language, &options.code, items, &options.kwargs, timeout)
            .await
    }
}

impl Default for BatchAggregator {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

/// The `result` of each successful task, in order
pub fn items_from_results(results: &[TaskResult<Value>]) -> Vec<Value> {
    results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.result.clone())
        .collect()
}

fn parse_options<O: DeserializeOwned + Default>(options: &Value) -> Result<O, AggregateError> {
    if options.is_null() {
        return Ok(O::default());
    }
    Ok(serde_json::from_value(options.clone())?)
}

fn path(field: &str) -> Vec<String> {
    field.split('.').map(|s| s.to_string()).collect()
}

fn text_of(item: &Value, field: Option<&[String]>) -> Option<String> {
    if let Value::String(s) = item {
        return Some(s.clone());
    }

    let value = match field {
        Some(field) => expr::lookup(item, field),
        None => TEXT_FIELDS.iter().find_map(|f| item.get(*f).filter(|v| !v.is_null())),
    }?;

    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn concat(items: &[Value], options: ConcatOptions) -> Option<Value> {
    if items.is_empty() {
        return None;
    }
    let field = options.field.as_deref().map(path);
    let separator = options.separator.as_deref().unwrap_or("\n");

    let parts: Vec<String> = items
        .iter()
        .filter_map(|item| text_of(item, field.as_deref()))
        .collect();
    Some(Value::String(parts.join(separator)))
}

fn stats(items: &[Value], options: StatsOptions) -> Option<Value> {
    let fields = options.fields.unwrap_or_else(|| stats::numeric_fields(items));

    let mut out = Map::new();
    for field in fields {
        let values = stats::field_values(items, &path(&field));
        let computed = FieldStats::compute(&values);
        out.insert(field, serde_json::to_value(computed).unwrap_or(Value::Null));
    }
    Some(Value::Object(out))
}

fn predicate_of(options: &FilterOptions) -> Result<Predicate, AggregateError> {
    if let Some(condition) = &options.condition {
        return Ok(Predicate::parse(condition)?);
    }
    match (&options.field, &options.operator) {
        (Some(field), Some(op)) => Ok(Predicate::comparison(field, op, options.value.clone())?),
        (Some(field), None) => Ok(Predicate::comparison(field, "==", options.value.clone())?),
        _ => Err(AggregateError::custom(
            "ValueError",
            "filter requires `condition` or `field`/`operator`/`value`",
        )),
    }
}

fn filter(items: &[Value], options: FilterOptions) -> Result<Option<Value>, AggregateError> {
    let predicate = predicate_of(&options)?;
    let kept = items.iter().filter(|item| predicate.matches(item)).cloned().collect();
    Ok(Some(Value::Array(kept)))
}

/// Bucket key: strings as-is, other values as JSON text, missing as "null"
fn group_key(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

fn group(items: &[Value], options: GroupOptions) -> Result<Option<Value>, AggregateError> {
    let field = options
        .field
        .ok_or_else(|| AggregateError::custom("ValueError", "group requires `field`"))?;
    let field = path(&field);

    let mut buckets: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for item in items {
        let key = group_key(expr::lookup(item, &field));
        buckets.entry(key).or_default().push(item.clone());
    }

    let groups = buckets
        .into_iter()
        .map(|(key, bucket)| (key, Value::Array(bucket)))
        .collect();
    Ok(Some(Value::Object(groups)))
}

fn summary(items: &[Value], options: SummaryOptions) -> Result<Option<Value>, AggregateError> {
    let total = items.len();
    let mut out = Map::new();

    if options.fields.is_empty() {
        out.insert("total_items".to_string(), Value::from(total));
        let flags: Vec<bool> = items
            .iter()
            .filter_map(|i| i.get("success").and_then(Value::as_bool))
            .collect();
        if !flags.is_empty() {
            let rate = flags.iter().filter(|b| **b).count() as f64 / flags.len() as f64;
            out.insert("success_rate".to_string(), Value::from(rate));
        }
        return Ok(Some(Value::Object(out)));
    }

    for (name, kind) in options.fields {
        let value = match kind {
            SummaryField::Count => Value::from(total),
            SummaryField::CountWhere { condition } => {
                let predicate = Predicate::parse(&condition)?;
                Value::from(items.iter().filter(|i| predicate.matches(i)).count())
            }
            SummaryField::Rate { condition } => {
                let predicate = Predicate::parse(&condition)?;
                if total == 0 {
                    Value::from(0.0)
                } else {
                    let hits = items.iter().filter(|i| predicate.matches(i)).count();
                    Value::from(hits as f64 / total as f64)
                }
            }
            SummaryField::Sum { field } => {
                let computed = FieldStats::compute(&stats::field_values(items, &path(&field)));
                Value::from(computed.sum.unwrap_or(0.0))
            }
            SummaryField::Mean { field } => optional_number(FieldStats::compute(&stats::field_values(items, &path(&field))).mean),
            SummaryField::Min { field } => optional_number(FieldStats::compute(&stats::field_values(items, &path(&field))).min),
            SummaryField::Max { field } => optional_number(FieldStats::compute(&stats::field_values(items, &path(&field))).max),
            SummaryField::Unique { field } => {
                let field = path(&field);
                let mut seen: Vec<&Value> = Vec::new();
                for value in items.iter().filter_map(|i| expr::lookup(i, &field)) {
                    if !seen.iter().any(|s| expr::values_equal(s, value)) {
                        seen.push(value);
                    }
                }
                Value::from(seen.len())
            }
        };
        out.insert(name, value);
    }

    Ok(Some(Value::Object(out)))
}

fn optional_number(value: Option<f64>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregator() -> BatchAggregator {
        BatchAggregator::default()
    }

    #[tokio::test]
    async fn test_concat_empty_is_none() {
        let result = aggregator().aggregate(&[], "concat", &Value::Null).await;
        assert!(result.success);
        assert_eq!(result.result, None);
        assert_eq!(result.item_count, 0);
        assert_eq!(result.strategy, "concat");
    }

    #[tokio::test]
    async fn test_concat_picks_first_text_field() {
        let items = vec![
            json!({"text": "a", "output": "ignored"}),
            json!({"output": "b"}),
            json!({"result": 3}),
            json!({"score": 1}),
            json!("d"),
        ];
        let result = aggregator()
            .aggregate(&items, "concat", &json!({"separator": " | "}))
            .await;
        assert_eq!(result.result, Some(json!("a | b | 3 | d")));

        let result = aggregator()
            .aggregate(&items[..2], "concat", &json!({"field": "output"}))
            .await;
        assert_eq!(result.result, Some(json!("ignored\nb")));
    }

    #[tokio::test]
    async fn test_stats_scores() {
        let items = vec![json!({"score": 8}), json!({"score": 10}), json!({"score": 6})];
        let result = aggregator()
            .aggregate(&items, "stats", &json!({"fields": ["score", "missing"]}))
            .await;

        let out = result.result.unwrap();
        assert_eq!(out["score"]["mean"], json!(8.0));
        assert_eq!(out["score"]["max"], json!(10.0));
        assert_eq!(out["score"]["min"], json!(6.0));
        assert_eq!(out["score"]["count"], json!(3));
        assert_eq!(out["missing"]["count"], json!(0));
        assert_eq!(out["missing"]["mean"], Value::Null);
    }

    #[tokio::test]
    async fn test_stats_default_fields() {
        let items = vec![json!({"score": 1, "name": "x"}), json!({"latency": 2.0})];
        let result = aggregator().aggregate(&items, "stats", &Value::Null).await;
        let out = result.result.unwrap();
        assert!(out.get("score").is_some());
        assert!(out.get("latency").is_some());
        assert!(out.get("name").is_none());
    }

    #[tokio::test]
    async fn test_filter_keeps_order() {
        let items = vec![
            json!({"id": 1, "score": 9}),
            json!({"id": 2, "score": 3}),
            json!({"id": 3, "score": 7}),
        ];
        let result = aggregator()
            .aggregate(&items, "filter", &json!({"condition": "score >= 7"}))
            .await;
        assert_eq!(result.result, Some(json!([{"id": 1, "score": 9}, {"id": 3, "score": 7}])));

        let result = aggregator()
            .aggregate(&items, "filter", &json!({"field": "id", "operator": "in", "value": [2]}))
            .await;
        assert_eq!(result.result, Some(json!([{"id": 2, "score": 3}])));
    }

    #[tokio::test]
    async fn test_filter_bad_expression() {
        let result = aggregator()
            .aggregate(&[json!({})], "filter", &json!({"condition": "score >"}))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("ExpressionError"));
    }

    #[tokio::test]
    async fn test_deeply_nested_condition_fails_cleanly() {
        let condition = format!("{}score{}", "(".repeat(200_000), ")".repeat(200_000));
        let result = aggregator()
            .aggregate(&[json!({"score": 1})], "filter", &json!({ "condition": condition }))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("ExpressionError"));
    }

    #[tokio::test]
    async fn test_group_by_field() {
        let items = vec![
            json!({"label": "pos", "id": 1}),
            json!({"label": "neg", "id": 2}),
            json!({"label": "pos", "id": 3}),
            json!({"id": 4}),
        ];
        let result = aggregator()
            .aggregate(&items, "group", &json!({"field": "label"}))
            .await;
        let out = result.result.unwrap();
        assert_eq!(out["pos"], json!([{"label": "pos", "id": 1}, {"label": "pos", "id": 3}]));
        assert_eq!(out["neg"], json!([{"label": "neg", "id": 2}]));
        assert_eq!(out["null"], json!([{"id": 4}]));

        let missing = aggregator().aggregate(&items, "group", &Value::Null).await;
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn test_summary_fields() {
        let items = vec![
            json!({"success": true, "score": 4, "model": "a"}),
            json!({"success": false, "score": 8, "model": "b"}),
            json!({"success": true, "score": 6, "model": "a"}),
            json!({"success": true, "model": "c"}),
        ];
        let options = json!({"fields": {
            "n": {"type": "count"},
            "passed": {"type": "count_where", "condition": "success == true"},
            "pass_rate": {"type": "rate", "condition": "success"},
            "avg_score": {"type": "mean", "field": "score"},
            "total_score": {"type": "sum", "field": "score"},
            "worst": {"type": "min", "field": "score"},
            "best": {"type": "max", "field": "score"},
            "models": {"type": "unique", "field": "model"}
        }});
        let out = aggregator()
            .aggregate(&items, "summary", &options)
            .await
            .result
            .unwrap();

        assert_eq!(out["n"], json!(4));
        assert_eq!(out["passed"], json!(3));
        assert_eq!(out["pass_rate"], json!(0.75));
        assert_eq!(out["avg_score"], json!(6.0));
        assert_eq!(out["total_score"], json!(18.0));
        assert_eq!(out["worst"], json!(4.0));
        assert_eq!(out["best"], json!(8.0));
        assert_eq!(out["models"], json!(3));
    }

    #[tokio::test]
    async fn test_summary_defaults() {
        let items = vec![json!({"success": true}), json!({"success": false})];
        let out = aggregator()
            .aggregate(&items, "summary", &Value::Null)
            .await
            .result
            .unwrap();
        assert_eq!(out, json!({"total_items": 2, "success_rate": 0.5}));
    }

    #[test]
    fn test_unsupported_strategy() {
        let result = tokio_test::block_on(aggregator().aggregate(&[json!(1)], "median-of-means", &Value::Null));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(UNSUPPORTED_STRATEGY));
        assert_eq!(result.strategy, "median-of-means");
        assert_eq!(result.item_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_options() {
        let result = aggregator()
            .aggregate(&[], "stats", &json!({"fields": "score"}))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("InvalidOptions"));
    }

    #[tokio::test]
    async fn test_custom_requires_code() {
        let result = aggregator().aggregate(&[], "custom", &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("ValueError"));
    }

    #[tokio::test]
    async fn test_custom_timeout_out_of_range() {
        for timeout in [json!(1e300), json!(-1), json!(0)] {
            let result = aggregator()
                .aggregate(
                    &[json!(1)],
                    "custom",
                    &json!({"code": "def aggregate(items): return 1", "timeout_secs": timeout}),
                )
                .await;
            assert!(!result.success);
            assert_eq!(result.error_type.as_deref(), Some("ValueError"));
        }
    }

    #[test]
    fn test_items_from_results() {
        let executor_results = vec![
            TaskResult::succeeded("a".into(), true, Default::default(), json!({"score": 1}), Duration::ZERO),
            TaskResult::failed(
                "b".into(),
                true,
                Default::default(),
                crate::core::ErrorKind::Runtime,
                "RuntimeError".into(),
                "boom".into(),
                Duration::ZERO,
            ),
        ];
        assert_eq!(items_from_results(&executor_results), vec![json!({"score": 1})]);
    }
}
