use crate::checker::CheckMetrics;
use crate::parser::strip_latency_prefix;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One surviving key carrying the data the ranker sorts and writes by.
#[derive(Debug, Clone)]
pub struct RankedKey {
    pub full_line: String,
    pub latency_ms: f64,
}

/// Formats a surviving key for the primary output list. With
/// `LOG_RESPONSE_TIME=false` (the common case) this is just the internal
/// `[NNNms] ` sort prefix ahead of the full line. With it enabled, a block
/// of `#`-prefixed metadata lines (checked-at timestamp, latency min/max/avg,
/// geolocation, success counts) is prepended as well — those comment lines
/// are published verbatim; only the `[NNNms] ` prefix is ever stripped.
pub fn format_key_with_metadata(log_response_time: bool, full_line: &str, metrics: &CheckMetrics, avg_latency_ms: f64) -> String {
    let tagged = format!("[{}ms] {full_line}", avg_latency_ms as u64);
    if !log_response_time {
        return tagged;
    }

    let mut lines = Vec::new();
    lines.push(format!("# checked: {}", now_rfc3339_like()));
    if !metrics.response_times.is_empty() {
        let min = metrics.response_times.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = metrics.response_times.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        lines.push(format!(
            "# latency: avg={avg_latency_ms:.0}ms min={min:.0}ms max={max:.0}ms"
        ));
    }
    if let Some(geo) = &metrics.geolocation {
        lines.push(format!("# geo: {geo}"));
    }
    lines.push(format!(
        "# urls: {} successful, requests: {}/{} successful",
        metrics.successful_urls, metrics.successful_requests, metrics.total_requests
    ));
    lines.push(tagged);
    lines.join("\n")
}

fn now_rfc3339_like() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    format!("unix:{secs}")
}

/// Sorts survivors ascending by latency — the order both the primary list
/// and its top-100 slice are written in.
pub fn rank(mut keys: Vec<RankedKey>) -> Vec<RankedKey> {
    keys.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));
    keys
}

/// Writes the primary latency-sorted list and, when at least one key
/// survived, its top-100 sibling. Both strip the internal `[NNNms] `
/// prefix before hitting disk — that annotation exists only to drive the
/// sort, never to be published.
pub fn write_results(output_path: &Path, ranked: &[RankedKey]) -> Result<Option<PathBuf>> {
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if ranked.is_empty() {
        return Ok(None);
    }

    let body = ranked
        .iter()
        .map(|k| strip_entry_latency_prefix(&k.full_line))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(output_path, body)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let top100_path = top100_path(output_path);
    let top100 = &ranked[..ranked.len().min(100)];
    let top100_body = top100
        .iter()
        .map(|k| strip_entry_latency_prefix(&k.full_line))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(&top100_path, top100_body)
        .with_context(|| format!("failed to write {}", top100_path.display()))?;

    Ok(Some(top100_path))
}

/// Strips the `[NNNms] ` sort prefix from only the last line of an entry —
/// any `#`-prefixed metadata lines `format_key_with_metadata` prepended
/// ahead of it are published as-is.
fn strip_entry_latency_prefix(entry: &str) -> String {
    match entry.rsplit_once('\n') {
        Some((head, last)) => format!("{head}\n{}", strip_latency_prefix(last)),
        None => strip_latency_prefix(entry).to_string(),
    }
}

/// `available.txt` -> `available(top100).txt`; an extension-less name gets
/// the suffix appended directly, matching the stem-splitting the original
/// output-path logic uses.
pub fn top100_path(output_path: &Path) -> PathBuf {
    let parent = output_path.parent().unwrap_or_else(|| Path::new(""));
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = output_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    parent.join(format!("{stem}(top100){ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_key_with_metadata_omits_comments_by_default() {
        let metrics = CheckMetrics::default();
        let out = format_key_with_metadata(false, "vless://a@b:443", &metrics, 42.0);
        assert_eq!(out, "[42ms] vless://a@b:443");
    }

    #[test]
    fn format_key_with_metadata_prepends_comment_block_when_enabled() {
        let metrics = CheckMetrics {
            response_times: vec![100.0, 140.0],
            geolocation: Some("US".to_string()),
            successful_urls: 2,
            total_requests: 2,
            successful_requests: 2,
            ..Default::default()
        };
        let out = format_key_with_metadata(true, "vless://a@b:443", &metrics, 120.0);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("# checked:"));
        assert!(lines.iter().any(|l| l.contains("min=100ms") && l.contains("max=140ms")));
        assert!(lines.iter().any(|l| l.contains("# geo: US")));
        assert_eq!(*lines.last().unwrap(), "[120ms] vless://a@b:443");
    }

    #[test]
    fn strip_entry_latency_prefix_only_touches_last_line() {
        let entry = "# checked: unix:1\n[77ms] vless://a@b:443";
        assert_eq!(
            strip_entry_latency_prefix(entry),
            "# checked: unix:1\nvless://a@b:443"
        );
    }

    #[test]
    fn rank_sorts_ascending_by_latency() {
        let keys = vec![
            RankedKey {
                full_line: "b".into(),
                latency_ms: 200.0,
            },
            RankedKey {
                full_line: "a".into(),
                latency_ms: 50.0,
            },
        ];
        let ranked = rank(keys);
        assert_eq!(ranked[0].full_line, "a");
        assert_eq!(ranked[1].full_line, "b");
    }

    #[test]
    fn top100_path_inserts_suffix_before_extension() {
        let p = top100_path(Path::new("configs/available.txt"));
        assert_eq!(p, Path::new("configs/available(top100).txt"));
    }

    #[test]
    fn top100_path_handles_extensionless_name() {
        let p = top100_path(Path::new("configs/available"));
        assert_eq!(p, Path::new("configs/available(top100)"));
    }

    #[test]
    fn write_results_strips_latency_prefix() {
        let dir = std::env::temp_dir().join(format!("herscat_ranker_{}", std::process::id()));
        let out = dir.join("available");
        let ranked = vec![RankedKey {
            full_line: "[42ms] vless://a@b:443".into(),
            latency_ms: 42.0,
        }];
        write_results(&out, &ranked).unwrap();
        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content, "vless://a@b:443");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
