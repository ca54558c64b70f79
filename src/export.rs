use crate::checker::CheckMetrics;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One row of the exported result set, independent of the internal
/// `CheckMetrics` shape so the export formats stay stable even if probing
/// internals change.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub key: String,
    pub available: bool,
    pub avg_response_time: f64,
    pub geolocation: Option<String>,
    pub error: Option<String>,
}

pub fn build_records(all_metrics: &HashMap<String, CheckMetrics>, available_links: &[String]) -> Vec<ResultRecord> {
    let available: std::collections::HashSet<&str> = available_links.iter().map(String::as_str).collect();
    all_metrics
        .iter()
        .map(|(link, metrics)| {
            let avg = if metrics.response_times.is_empty() {
                0.0
            } else {
                metrics.response_times.iter().sum::<f64>() / metrics.response_times.len() as f64
            };
            ResultRecord {
                key: link.clone(),
                available: available.contains(link.as_str()),
                avg_response_time: avg,
                geolocation: metrics.geolocation.clone(),
                error: None,
            }
        })
        .collect()
}

/// `available.txt` -> `available.json`, mirroring the suffix-swap the
/// other export formats use as well.
fn swap_extension(output_path: &Path, new_ext: &str) -> PathBuf {
    output_path.with_extension(new_ext)
}

#[derive(Serialize)]
struct JsonExport<'a> {
    timestamp: String,
    total: usize,
    available: usize,
    results: &'a [ResultRecord],
}

pub fn export_to_json(records: &[ResultRecord], output_path: &Path) -> Result<PathBuf> {
    let path = swap_extension(output_path, "json");
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let data = JsonExport {
        timestamp: chrono::Local::now().to_rfc3339(),
        total: records.len(),
        available: records.iter().filter(|r| r.available).count(),
        results: records,
    };
    let body = serde_json::to_string_pretty(&data).context("failed to serialize JSON export")?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn export_to_csv(records: &[ResultRecord], output_path: &Path) -> Result<PathBuf> {
    let path = swap_extension(output_path, "csv");
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(&path).with_context(|| format!("failed to open {}", path.display()))?;
    writer.write_record(["key", "available", "avg_response_time", "geolocation", "error"])?;
    for record in records {
        writer.write_record([
            record.key.as_str(),
            if record.available { "true" } else { "false" },
            &record.avg_response_time.to_string(),
            record.geolocation.as_deref().unwrap_or(""),
            record.error.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(path)
}

pub fn export_to_html(records: &[ResultRecord], output_path: &Path) -> Result<PathBuf> {
    let path = swap_extension(output_path, "html");
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let total = records.len();
    let available = records.iter().filter(|r| r.available).count();
    let success_rate = if total > 0 {
        available as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let mut rows = String::new();
    for (i, record) in records.iter().enumerate() {
        let truncated: String = record.key.chars().take(100).collect();
        let (status, class) = if record.available {
            ("OK", "available")
        } else {
            ("fail", "unavailable")
        };
        let time_str = if record.avg_response_time > 0.0 {
            format!("{:.0}ms", record.avg_response_time)
        } else {
            String::new()
        };
        rows.push_str(&format!(
            "<tr><td>{}</td><td><code style=\"word-break: break-all;\">{}...</code></td><td class=\"{class}\">{status}</td><td>{time_str}</td><td>{}</td></tr>\n",
            i + 1,
            html_escape(&truncated),
            record.geolocation.as_deref().unwrap_or(""),
        ));
    }

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<title>Proxy check results</title>
<style>
body {{ font-family: Arial, sans-serif; margin: 20px; background-color: #f5f5f5; }}
h1 {{ color: #333; }}
.summary {{ background-color: white; padding: 15px; border-radius: 5px; margin-bottom: 20px; }}
table {{ border-collapse: collapse; width: 100%; background-color: white; }}
th, td {{ border: 1px solid #ddd; padding: 8px; text-align: left; }}
th {{ background-color: #4CAF50; color: white; }}
tr:nth-child(even) {{ background-color: #f2f2f2; }}
.available {{ color: green; font-weight: bold; }}
.unavailable {{ color: red; font-weight: bold; }}
code {{ background-color: #f4f4f4; padding: 2px 4px; border-radius: 3px; }}
</style>
</head>
<body>
<h1>Proxy check results</h1>
<div class="summary">
<p><strong>Checked:</strong> {}</p>
<p><strong>Total:</strong> {total}, <strong>Available:</strong> <span class="available">{available}</span>, <strong>Unavailable:</strong> <span class="unavailable">{}</span></p>
<p><strong>Success rate:</strong> {success_rate:.1}%</p>
</div>
<table>
<tr><th>#</th><th>Key</th><th>Status</th><th>Latency</th><th>Geo</th></tr>
{rows}
</table>
</body>
</html>
"#,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        total - available,
    );

    std::fs::write(&path, html).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<ResultRecord> {
        vec![
            ResultRecord {
                key: "vless://a@b:443".into(),
                available: true,
                avg_response_time: 120.0,
                geolocation: Some("US".into()),
                error: None,
            },
            ResultRecord {
                key: "vless://c@d:443".into(),
                available: false,
                avg_response_time: 0.0,
                geolocation: None,
                error: None,
            },
        ]
    }

    #[test]
    fn swap_extension_replaces_suffix() {
        assert_eq!(
            swap_extension(Path::new("configs/available.txt"), "json"),
            Path::new("configs/available.json")
        );
    }

    #[test]
    fn export_to_json_writes_summary_counts() {
        let dir = std::env::temp_dir().join(format!("herscat_export_{}", std::process::id()));
        let out = dir.join("available.txt");
        let path = export_to_json(&sample(), &out).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("\"total\": 2"));
        assert!(body.contains("\"available\": 1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn export_to_csv_writes_header_and_rows() {
        let dir = std::env::temp_dir().join(format!("herscat_export_csv_{}", std::process::id()));
        let out = dir.join("available.txt");
        let path = export_to_csv(&sample(), &out).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("key,available,avg_response_time,geolocation,error"));
        assert!(body.contains("vless://a@b:443"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
