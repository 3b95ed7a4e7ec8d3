//! Hand-rolled Prometheus text-exposition-format reader for backend
//! `/metrics` endpoints. We are a consumer, not an exporter,
//! of this format, so no metrics client crate is pulled in (see DESIGN.md).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)(\{[^}]*\})?\s+([^\s#]+)").unwrap())
}

/// Parses the text body into a map of metric name (labels stripped) to the
/// sum of every line's value under that name — this sums across label sets
/// for free, which is exactly what `request_success_total` (summed across
/// `finished_reason` labels) needs.
pub fn parse(text: &str) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(caps) = line_re().captures(line) else {
            continue;
        };
        let name = caps.get(1).unwrap().as_str();
        let Ok(value) = caps.get(3).unwrap().as_str().parse::<f64>() else {
            continue;
        };
        *out.entry(name.to_string()).or_insert(0.0) += value;
    }
    out
}

/// Computes a histogram average from its `_sum`/`_count` pair, if both are
/// present and count is positive.
pub fn histogram_avg(metrics: &HashMap<String, f64>, base_name: &str) -> Option<f64> {
    let sum = metrics.get(&format!("{base_name}_sum"))?;
    let count = metrics.get(&format!("{base_name}_count"))?;
    if *count <= 0.0 {
        return None;
    }
    Some(sum / count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gauges_and_ignores_comments() {
        let text = "\
# HELP num_requests_running running requests
# TYPE num_requests_running gauge
num_requests_running 3
num_requests_waiting 0
kv_cache_usage_perc 0.42
";
        let parsed = parse(text);
        assert_eq!(parsed.get("num_requests_running"), Some(&3.0));
        assert_eq!(parsed.get("kv_cache_usage_perc"), Some(&0.42));
    }

    #[test]
    fn sums_counters_across_label_sets() {
        let text = "\
request_success_total{finished_reason=\"stop\"} 10
request_success_total{finished_reason=\"length\"} 2
";
        let parsed = parse(text);
        assert_eq!(parsed.get("request_success_total"), Some(&12.0));
    }

    #[test]
    fn histogram_average_from_sum_and_count() {
        let text = "\
time_to_first_token_sum 100.0
time_to_first_token_count 20
";
        let parsed = parse(text);
        assert_eq!(histogram_avg(&parsed, "time_to_first_token"), Some(5.0));
    }

    #[test]
    fn histogram_missing_count_is_none() {
        let parsed = parse("time_to_first_token_sum 100.0\n");
        assert_eq!(histogram_avg(&parsed, "time_to_first_token"), None);
    }
}
