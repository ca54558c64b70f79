use crate::export::ResultRecord;
use colored::Colorize;

/// Aggregate run statistics, computed once after the worker pool has
/// drained. Response times here are in milliseconds, matching everything
/// else that flows into the ranker and the on-disk output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerformanceMetrics {
    pub total_keys: usize,
    pub available_keys: usize,
    pub failed_keys: usize,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub median_response_time_ms: f64,
    pub total_time_secs: f64,
    pub keys_per_second: f64,
}

pub fn calculate_performance_metrics(
    records: &[ResultRecord],
    response_times_ms: &[f64],
    elapsed: std::time::Duration,
) -> PerformanceMetrics {
    let total_keys = records.len();
    let available_keys = records.iter().filter(|r| r.available).count();
    let failed_keys = total_keys - available_keys;

    let mut sorted = response_times_ms.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let (avg, min, max, median) = if sorted.is_empty() {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        let sum: f64 = sorted.iter().sum();
        let avg = sum / sorted.len() as f64;
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        (avg, min, max, median)
    };

    let elapsed_secs = elapsed.as_secs_f64();
    let keys_per_second = if elapsed_secs > 0.0 {
        total_keys as f64 / elapsed_secs
    } else {
        0.0
    };

    PerformanceMetrics {
        total_keys,
        available_keys,
        failed_keys,
        avg_response_time_ms: avg,
        min_response_time_ms: min,
        max_response_time_ms: max,
        median_response_time_ms: median,
        total_time_secs: elapsed_secs,
        keys_per_second,
    }
}

/// Prints a plain-table summary to stdout. The corpus' rich-console table
/// has no Rust equivalent here, so this renders the same rows with
/// `colored` and fixed-width columns instead.
pub fn print_statistics_table(metrics: &PerformanceMetrics) {
    let success_rate = if metrics.total_keys > 0 {
        metrics.available_keys as f64 / metrics.total_keys as f64 * 100.0
    } else {
        0.0
    };

    println!("\n{}", "Check results".green().bold());
    println!("{:<25}{:>15}", "Total keys", metrics.total_keys);
    println!(
        "{:<25}{:>15}",
        "Available",
        metrics.available_keys.to_string().green()
    );
    println!(
        "{:<25}{:>15}",
        "Unavailable",
        metrics.failed_keys.to_string().red()
    );
    println!("{:<25}{:>14.1}%", "Success rate", success_rate);
    if metrics.avg_response_time_ms > 0.0 {
        println!("{:<25}{:>12.0}ms", "Avg latency", metrics.avg_response_time_ms);
        println!("{:<25}{:>12.0}ms", "Min latency", metrics.min_response_time_ms);
        println!("{:<25}{:>12.0}ms", "Max latency", metrics.max_response_time_ms);
        println!("{:<25}{:>12.0}ms", "Median latency", metrics.median_response_time_ms);
    }
    println!("{:<25}{:>14.1}s", "Elapsed", metrics.total_time_secs);
    println!("{:<25}{:>12.2}/s", "Throughput", metrics.keys_per_second);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<ResultRecord> {
        vec![
            ResultRecord {
                key: "a".into(),
                available: true,
                avg_response_time: 100.0,
                geolocation: None,
                error: None,
            },
            ResultRecord {
                key: "b".into(),
                available: false,
                avg_response_time: 0.0,
                geolocation: None,
                error: None,
            },
        ]
    }

    #[test]
    fn calculates_median_and_rate_from_response_times() {
        let records = sample();
        let metrics = calculate_performance_metrics(
            &records,
            &[100.0, 200.0, 300.0],
            std::time::Duration::from_secs(2),
        );
        assert_eq!(metrics.total_keys, 2);
        assert_eq!(metrics.available_keys, 1);
        assert_eq!(metrics.failed_keys, 1);
        assert_eq!(metrics.median_response_time_ms, 200.0);
        assert_eq!(metrics.keys_per_second, 1.0);
    }

    #[test]
    fn empty_response_times_leave_latency_fields_zero() {
        let records = sample();
        let metrics = calculate_performance_metrics(&records, &[], std::time::Duration::from_secs(1));
        assert_eq!(metrics.avg_response_time_ms, 0.0);
    }
}
