use crate::config::AppConfig;
use crate::parser::parse_proxy_url;
use crate::port_pool::PortPool;
use crate::prober::{build_probe_client, check_response_valid, make_request};
use crate::relay::RelayHandle;
use reqwest::Method;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Outcome of one key's speed test: the score's meaning depends on mode
/// and metric (ascending latency in ms, or descending throughput in
/// Mbps) — see `score_sort_descending`.
#[derive(Debug, Clone)]
pub struct SpeedTestResult {
    pub line: String,
    pub score: f64,
}

/// True when higher `score` is better (quick/full download modes, or
/// latency mode read through the throughput metric). Mirrors
/// `speedtest_checker.py`'s `sort_by_speed` flag.
pub fn score_sort_descending(cfg: &AppConfig) -> bool {
    matches!(cfg.speed_test_mode.as_str(), "quick" | "full") || cfg.speed_test_metric == "throughput"
}

/// Runs the speed test for one already-validated proxy line: latency
/// phase through a freshly spawned relay (or a plain TCP RTT for the
/// Hysteria family), then an optional throughput phase for quick/full
/// modes. Returns `None` on any failure — a dead key during speed
/// testing is simply dropped from the re-ranked output.
pub async fn speed_test_key(
    cfg: &AppConfig,
    port_pool: &PortPool,
    xray_cmd: &str,
    proxy_line: &str,
) -> Option<SpeedTestResult> {
    let parsed = parse_proxy_url(proxy_line).ok()?;

    if parsed.is_hysteria_family() {
        let (host, port) = parsed.address();
        let probe_timeout = cfg.speed_test_timeout.min(5.0);
        let start = tokio::time::Instant::now();
        let ok = timeout(
            Duration::from_secs_f64(probe_timeout),
            TcpStream::connect((host, port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        if !ok {
            if cfg.speed_test_debug {
                log::info!("speed_test_key: hysteria latency failed for {proxy_line}");
            }
            return None;
        }
        return Some(SpeedTestResult {
            line: proxy_line.to_string(),
            score: start.elapsed().as_secs_f64() * 1000.0,
        });
    }

    let port = port_pool.take()?;
    let result = run_relay_speed_test(cfg, xray_cmd, &parsed, port, proxy_line).await;
    port_pool.give_back(port);
    result
}

async fn run_relay_speed_test(
    cfg: &AppConfig,
    xray_cmd: &str,
    parsed: &crate::parser::ParsedProxy,
    port: u16,
    proxy_line: &str,
) -> Option<SpeedTestResult> {
    let mut handle = RelayHandle::spawn(xray_cmd, parsed, port, cfg.speed_test_debug, "st_")
        .await
        .ok()?;

    let wait_result = handle
        .wait_for_startup(
            Duration::from_secs_f64(cfg.xray_startup_wait),
            Duration::from_secs_f64(cfg.xray_startup_poll_interval),
        )
        .await;
    if wait_result.is_err() {
        if cfg.speed_test_debug {
            log::info!("speed_test_key: xray process exited early for {proxy_line}");
        }
        handle.kill().await;
        return None;
    }

    if !handle
        .wait_for_socks_port(Duration::from_secs_f64(cfg.speed_test_timeout.min(2.5)))
        .await
    {
        if cfg.speed_test_debug {
            log::info!("speed_test_key: port wait timeout for {proxy_line}");
        }
        handle.kill().await;
        return None;
    }

    let avg_latency_ms = match measure_latency(cfg, port).await {
        Some(v) => v,
        None => {
            if cfg.speed_test_debug {
                log::info!("speed_test_key: no valid HTTP response for {proxy_line}");
            }
            handle.kill().await;
            return None;
        }
    };

    let score = match cfg.speed_test_mode.as_str() {
        "quick" if !cfg.speed_test_download_url_small.is_empty() => {
            measure_download_speed(port, &cfg.speed_test_download_url_small, cfg.speed_test_download_timeout.min(10.0)).await
        }
        "full" if !cfg.speed_test_download_url_medium.is_empty() => {
            measure_download_speed(port, &cfg.speed_test_download_url_medium, cfg.speed_test_download_timeout).await
        }
        _ => {
            if cfg.speed_test_metric == "throughput" {
                Some(if avg_latency_ms > 0.0 { 100_000.0 / avg_latency_ms } else { 0.0 })
            } else {
                Some(avg_latency_ms)
            }
        }
    };

    handle.kill().await;
    score.map(|score| SpeedTestResult {
        line: proxy_line.to_string(),
        score,
    })
}

async fn measure_latency(cfg: &AppConfig, port: u16) -> Option<f64> {
    let requests_count = cfg.speed_test_requests.max(1);
    let per_request_timeout = ((cfg.speed_test_timeout - 0.2) / requests_count as f64).max(1.0);
    let connect_t = (per_request_timeout * 0.5).clamp(1.0, 5.0);
    let read_t = (per_request_timeout * 0.6).clamp(3.0, 15.0);

    let client = build_probe_client(port, Duration::from_secs_f64(connect_t), cfg.verify_https_ssl).ok()?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(cfg.speed_test_timeout);
    let mut response_times = Vec::new();
    for _ in 0..requests_count {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        let outcome = make_request(&client, &cfg.speed_test_url, Method::GET, Duration::from_secs_f64(read_t)).await;
        if outcome.error.is_none() && check_response_valid(outcome.status, outcome.content_length, 0, &cfg.speed_test_url) {
            response_times.push(outcome.elapsed.as_secs_f64() * 1000.0);
        }
    }

    if response_times.is_empty() {
        return None;
    }
    Some(response_times.iter().sum::<f64>() / response_times.len() as f64)
}

/// Streams the download body over the SOCKS proxy, counting bytes as they
/// arrive rather than buffering the whole response — the throughput-phase
/// analogue of the chunked `iter_content` read in the original.
async fn measure_download_speed(port: u16, url: &str, timeout_secs: f64) -> Option<f64> {
    use futures::StreamExt;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("socks5h://127.0.0.1:{port}")).ok()?)
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(5))
        .build()
        .ok()?;

    let start = tokio::time::Instant::now();
    let response = timeout(Duration::from_secs_f64(timeout_secs), client.get(url).send())
        .await
        .ok()?
        .ok()?;
    if response.status() != reqwest::StatusCode::OK {
        return None;
    }

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    while let Ok(Some(chunk)) = timeout(Duration::from_secs_f64(timeout_secs), stream.next()).await {
        let chunk = chunk.ok()?;
        downloaded += chunk.len() as u64;
        if start.elapsed().as_secs_f64() > timeout_secs {
            break;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed < 0.3 {
        return None;
    }
    Some(((downloaded as f64 * 8.0) / (elapsed * 1_000_000.0) * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_sort_descending_matches_quick_and_full_modes() {
        let mut cfg_base = test_cfg();
        cfg_base.speed_test_mode = "latency".to_string();
        cfg_base.speed_test_metric = "latency".to_string();
        assert!(!score_sort_descending(&cfg_base));

        cfg_base.speed_test_mode = "quick".to_string();
        assert!(score_sort_descending(&cfg_base));

        cfg_base.speed_test_mode = "latency".to_string();
        cfg_base.speed_test_metric = "throughput".to_string();
        assert!(score_sort_descending(&cfg_base));
    }

    fn test_cfg() -> AppConfig {
        unsafe {
            std::env::set_var("MODE", "single");
        }
        let cfg = AppConfig::load();
        unsafe {
            std::env::remove_var("MODE");
        }
        cfg
    }
}
