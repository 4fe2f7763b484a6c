//! Metric extraction from trainer log lines.
//!
//! The trainer prints unstructured text; a fixed table of named patterns is
//! evaluated against every line. The parser holds no state across calls —
//! accumulation and progress reporting belong to the process supervisor.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Named metric patterns: a case-insensitive label, a colon or whitespace
/// separator, and a numeric token (decimal or scientific notation).
///
/// Every pattern is evaluated against every line; the `loss` pattern also
/// matching inside a `val_loss: …` token is intentional, the keys differ.
static METRIC_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("loss", Regex::new(r"(?i)loss[:\s]+([0-9.]+)").unwrap()),
        ("step", Regex::new(r"(?i)step[:\s]+(\d+)").unwrap()),
        ("epoch", Regex::new(r"(?i)epoch[:\s]+(\d+)").unwrap()),
        ("lr", Regex::new(r"(?i)lr[:\s]+([0-9.eE+\-]+)").unwrap()),
        ("val_loss", Regex::new(r"(?i)val[_\s]loss[:\s]+([0-9.]+)").unwrap()),
    ]
});

/// Extracts every recognized metric from one log line.
///
/// A line may yield zero, one, or several metrics. A label whose numeric
/// token fails to parse is skipped for that label only; other metrics on the
/// same line are unaffected.
#[must_use]
pub fn extract_metrics(line: &str) -> HashMap<String, f64> {
    let mut metrics = HashMap::new();
    for (name, pattern) in METRIC_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(line) {
            if let Some(token) = captures.get(1) {
                if let Ok(value) = token.as_str().parse::<f64>() {
                    metrics.insert((*name).to_string(), value);
                }
            }
        }
    }
    metrics
}

/// Progress percentage for `step` out of `target_steps`, floored and clamped
/// to 0..=100. `None` when the target is zero — without a real target there
/// is nothing meaningful to report.
#[must_use]
pub fn progress_percent(step: u64, target_steps: u64) -> Option<u8> {
    if target_steps == 0 {
        return None;
    }
    Some((step.saturating_mul(100) / target_steps).min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_multiple_metrics() {
        let metrics = extract_metrics("step: 1000 loss: 0.5432 lr: 0.0001");
        assert_eq!(metrics["step"], 1000.0);
        assert_eq!(metrics["loss"], 0.5432);
        assert_eq!(metrics["lr"], 0.0001);
    }

    #[test]
    fn test_extract_is_case_insensitive() {
        let upper = extract_metrics("STEP: 100 LOSS: 1.234 LR: 0.001");
        let lower = extract_metrics("step: 100 loss: 1.234 lr: 0.001");
        assert_eq!(upper, lower);
        assert_eq!(upper["loss"], 1.234);
    }

    #[test]
    fn test_extract_whitespace_separator() {
        let metrics = extract_metrics("Training step 5000");
        assert_eq!(metrics["step"], 5000.0);
    }

    #[test]
    fn test_extract_scientific_notation() {
        let metrics = extract_metrics("step: 1000 lr: 1e-4");
        assert_eq!(metrics["lr"], 1e-4);
    }

    #[test]
    fn test_extract_val_loss() {
        let metrics = extract_metrics("Validation val_loss: 0.3456");
        assert_eq!(metrics["val_loss"], 0.3456);
    }

    #[test]
    fn test_extract_epoch() {
        let metrics = extract_metrics("Epoch: 10 completed");
        assert_eq!(metrics["epoch"], 10.0);
    }

    #[test]
    fn test_extract_nothing_from_plain_line() {
        assert!(extract_metrics("Loading checkpoint...").is_empty());
        assert!(extract_metrics("").is_empty());
    }

    #[test]
    fn test_malformed_token_skips_that_label_only() {
        let metrics = extract_metrics("step: 10 lr: abc");
        assert_eq!(metrics["step"], 10.0);
        assert!(!metrics.contains_key("lr"));

        // Matches the lr pattern but is not a number.
        let metrics = extract_metrics("step: 10 lr: ...");
        assert_eq!(metrics["step"], 10.0);
        assert!(!metrics.contains_key("lr"));
    }

    #[test]
    fn test_same_line_same_result() {
        let line = "step: 42 loss: 0.1";
        assert_eq!(extract_metrics(line), extract_metrics(line));
    }

    #[test]
    fn test_progress_percent_floors_and_clamps() {
        assert_eq!(progress_percent(5000, 10_000), Some(50));
        assert_eq!(progress_percent(199, 1000), Some(19));
        assert_eq!(progress_percent(2000, 1000), Some(100));
        assert_eq!(progress_percent(0, 1000), Some(0));
    }

    #[test]
    fn test_progress_percent_zero_target() {
        assert_eq!(progress_percent(500, 0), None);
    }
}
