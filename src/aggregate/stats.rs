//! Descriptive statistics over numeric item fields

use serde::Serialize;
use serde_json::Value;

/// Statistics for one field; everything but `count` is `None` when the
/// field had no numeric values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldStats {
    pub count: usize,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    /// Sample standard deviation (n - 1); 0 for a single value
    pub std_dev: Option<f64>,
}

impl FieldStats {
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                count: 0,
                sum: None,
                mean: None,
                min: None,
                max: None,
                median: None,
                std_dev: None,
            };
        }

        let count = values.len();
        let sum: f64 = values.iter().sum();
        let mean = sum / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        };

        let std_dev = if count < 2 {
            0.0
        } else {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        };

        Self {
            count,
            sum: Some(sum),
            mean: Some(mean),
            min: Some(min),
            max: Some(max),
            median: Some(median),
            std_dev: Some(std_dev),
        }
    }
}

/// Numeric values of `field` across items; items without it are skipped
pub fn field_values(items: &[Value], field: &[String]) -> Vec<f64> {
    items
        .iter()
        .filter_map(|item| super::expr::lookup(item, field))
        .filter_map(Value::as_f64)
        .collect()
}

/// Top-level numeric fields in first-seen order
pub fn numeric_fields(items: &[Value]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for map in items.iter().filter_map(Value::as_object) {
        for (key, value) in map {
            if value.is_number() && !fields.contains(key) {
                fields.push(key.clone());
            }
        }
    }
    fields
}
