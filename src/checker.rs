use crate::cache::VerdictCache;
use crate::config::AppConfig;
use crate::parser::{ParsedProxy, ProxyKey, parse_proxy_url};
use crate::port_pool::PortPool;
use crate::prober::{build_probe_client, check_response_valid, is_connection_error, make_request};
use crate::relay::RelayHandle;
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

/// Per-url-per-round success bookkeeping, tallied into the final verdict.
#[derive(Debug, Default, Clone)]
struct UrlRoundResult {
    successful_requests: u32,
    total_requests: u32,
}

#[derive(Debug, Clone)]
pub struct CheckMetrics {
    pub response_times: Vec<f64>,
    pub geolocation: Option<String>,
    pub successful_urls: u32,
    pub failed_urls: u32,
    pub total_requests: u32,
    pub successful_requests: u32,
    pub cached: bool,
}

impl Default for CheckMetrics {
    fn default() -> Self {
        CheckMetrics {
            response_times: Vec::new(),
            geolocation: None,
            successful_urls: 0,
            failed_urls: 0,
            total_requests: 0,
            successful_requests: 0,
            cached: false,
        }
    }
}

pub struct CheckResult {
    pub line: String,
    pub alive: bool,
    pub metrics: CheckMetrics,
}

/// Registry of relay OS process ids currently in flight, so a SIGINT/SIGTERM
/// handler elsewhere can kill anything still running before exit.
pub type LiveRegistry = std::sync::Arc<Mutex<std::collections::HashSet<u32>>>;

/// Runs the full end-to-end reachability check for one proxy line: cache
/// lookup, parse, relay spin-up (or a plain TCP probe for the Hysteria
/// family), then the stability/strict-mode/retry probing loop, always
/// releasing its port and relay on the way out.
pub async fn check_key_e2e(
    cfg: &AppConfig,
    port_pool: &PortPool,
    cache: &Mutex<VerdictCache>,
    live: &LiveRegistry,
    xray_cmd: &str,
    line: &str,
    debug: bool,
) -> CheckResult {
    if cfg.enable_cache
        && let Some(cached) = cache.lock().await.check(line)
    {
        return CheckResult {
            line: line.to_string(),
            alive: cached,
            metrics: CheckMetrics {
                cached: true,
                ..Default::default()
            },
        };
    }

    let parsed = match parse_proxy_url(line) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("Failed to parse {line}: {e}");
            return dead(cfg, cache, line, CheckMetrics::default()).await;
        }
    };

    if parsed.is_hysteria_family() {
        let (host, port) = parsed.address();
        let probe_timeout = if cfg.use_adaptive_timeout {
            cfg.connect_timeout_slow
        } else {
            cfg.connect_timeout
        };
        let (ok, elapsed_ms) = check_hysteria_reachable(host, port, probe_timeout).await;
        let metrics = CheckMetrics {
            response_times: if ok { vec![elapsed_ms] } else { vec![] },
            successful_urls: if ok { 1 } else { 0 },
            failed_urls: if ok { 0 } else { 1 },
            ..Default::default()
        };
        return finish(cfg, cache, line, ok, metrics).await;
    }

    let Some(port) = port_pool.take() else {
        log::warn!("No free port available, skipping {line}");
        return dead(cfg, cache, line, CheckMetrics::default()).await;
    };

    let result = run_through_relay(cfg, xray_cmd, &parsed, port, live, debug, line).await;
    port_pool.give_back(port);

    match result {
        Ok((alive, metrics)) => finish(cfg, cache, line, alive, metrics).await,
        Err(e) => {
            log::debug!("{line} relay probe failed: {e}");
            dead(cfg, cache, line, CheckMetrics::default()).await
        }
    }
}

async fn run_through_relay(
    cfg: &AppConfig,
    xray_cmd: &str,
    parsed: &ParsedProxy,
    port: u16,
    live: &LiveRegistry,
    debug: bool,
    line: &str,
) -> anyhow::Result<(bool, CheckMetrics)> {
    let mut handle = RelayHandle::spawn(xray_cmd, parsed, port, debug, "").await?;
    if let Some(pid) = handle_pid(&handle) {
        live.lock().await.insert(pid);
    }

    let wait_result = handle
        .wait_for_startup(
            Duration::from_secs_f64(cfg.xray_startup_wait),
            Duration::from_secs_f64(cfg.xray_startup_poll_interval),
        )
        .await;

    if let Err(e) = wait_result {
        if debug {
            log::debug!("{line} relay died on startup: {e}");
        }
        unregister(&handle, live).await;
        handle.kill().await;
        return Err(e.into());
    }

    let outcome = if cfg.strong_style_test {
        run_strict_probe(cfg, port).await
    } else {
        run_normal_probe(cfg, port).await
    };

    if debug && !handle.is_running()
        && let Some(stderr) = handle.dump_stderr_if_debug(true).await
        && !stderr.is_empty()
    {
        log::debug!("{line} relay exited during probing: {stderr}");
    }

    unregister(&handle, live).await;
    handle.kill().await;
    outcome
}

async fn unregister(handle: &RelayHandle, live: &LiveRegistry) {
    if let Some(pid) = handle_pid(handle) {
        live.lock().await.remove(&pid);
    }
}

fn handle_pid(handle: &RelayHandle) -> Option<u32> {
    handle.pid()
}

async fn check_hysteria_reachable(host: &str, port: u16, timeout_secs: f64) -> (bool, f64) {
    let start = tokio::time::Instant::now();
    let result = timeout(
        Duration::from_secs_f64(timeout_secs),
        TcpStream::connect((host, port)),
    )
    .await;
    match result {
        Ok(Ok(_)) => (true, start.elapsed().as_secs_f64() * 1000.0),
        _ => (false, 0.0),
    }
}

async fn run_strict_probe(cfg: &AppConfig, port: u16) -> anyhow::Result<(bool, CheckMetrics)> {
    const STRICT_TEST_URL: &str = "https://www.gstatic.com/generate_204";

    let connect_t = (cfg.strong_style_timeout * 0.4).clamp(3.0, 10.0);
    let read_t = (cfg.strong_style_timeout - connect_t).max(5.0);
    let max_ok_time = if cfg.strong_max_response_time > 0.0 {
        cfg.strong_max_response_time
    } else {
        cfg.max_response_time
    };

    let client = build_probe_client(
        port,
        Duration::from_secs_f64(connect_t),
        cfg.verify_https_ssl,
    )?;

    let mut response_times = Vec::new();
    for attempt in 0..cfg.strong_attempts {
        if attempt > 0 {
            sleep(Duration::from_millis(500)).await;
        }

        let outcome = make_request(
            &client,
            STRICT_TEST_URL,
            Method::GET,
            Duration::from_secs_f64(read_t),
        )
        .await;

        let elapsed_s = outcome.elapsed.as_secs_f64();
        let valid = check_response_valid(outcome.status, outcome.content_length, 0, STRICT_TEST_URL);

        if !valid || (max_ok_time > 0.0 && elapsed_s > max_ok_time) {
            return Ok((
                false,
                CheckMetrics {
                    response_times,
                    failed_urls: 1,
                    total_requests: attempt + 1,
                    successful_requests: attempt,
                    ..Default::default()
                },
            ));
        }

        response_times.push(elapsed_s * 1000.0);
    }

    Ok((
        true,
        CheckMetrics {
            response_times,
            successful_urls: 1,
            failed_urls: 0,
            total_requests: cfg.strong_attempts,
            successful_requests: cfg.strong_attempts,
            ..Default::default()
        },
    ))
}

async fn run_normal_probe(cfg: &AppConfig, port: u16) -> anyhow::Result<(bool, CheckMetrics)> {
    let mut all_urls: Vec<(String, bool)> = cfg
        .test_urls
        .iter()
        .map(|u| (u.clone(), false))
        .chain(cfg.test_urls_https.iter().map(|u| (u.clone(), true)))
        .collect();
    if all_urls.is_empty() {
        all_urls.push((cfg.test_url.clone(), false));
    }

    let connect_timeout = if cfg.use_adaptive_timeout {
        cfg.connect_timeout_slow
    } else {
        cfg.connect_timeout
    };

    let client = build_probe_client(
        port,
        Duration::from_secs_f64(connect_timeout),
        cfg.verify_https_ssl,
    )?;

    let mut response_times = Vec::new();
    let mut total_requests = 0u32;
    let mut successful_requests = 0u32;
    let mut last_round_results: HashMap<String, UrlRoundResult> = HashMap::new();
    let mut stability_results = Vec::new();

    'rounds: for round in 0..cfg.stability_checks {
        if round > 0 {
            sleep(Duration::from_secs_f64(cfg.stability_check_delay)).await;
        }

        let mut round_results: HashMap<String, UrlRoundResult> = HashMap::new();
        let mut https_check_passed = !cfg.require_https;
        let mut successful_urls_count = 0u32;

        for (url, is_https) in &all_urls {
            let mut url_result = UrlRoundResult::default();

            for req_idx in 0..cfg.requests_per_url {
                if req_idx > 0 {
                    sleep(Duration::from_secs_f64(cfg.request_delay)).await;
                }

                for attempt in 0..=cfg.max_retries {
                    if attempt > 0 {
                        let backoff = cfg.retry_delay_base
                            * cfg.retry_delay_multiplier.powi(attempt as i32 - 1);
                        sleep(Duration::from_secs_f64(backoff)).await;
                    }

                    total_requests += 1;
                    url_result.total_requests += 1;

                    let outcome = make_request(
                        &client,
                        url,
                        Method::GET,
                        Duration::from_secs_f64(connect_timeout),
                    )
                    .await;

                    if let Some(err) = &outcome.error {
                        if is_connection_error(err) && attempt < cfg.max_retries {
                            continue;
                        }
                        break;
                    }

                    let valid = check_response_valid(
                        outcome.status,
                        outcome.content_length,
                        cfg.min_response_size,
                        url,
                    ) && (cfg.max_response_time <= 0.0
                        || outcome.elapsed.as_secs_f64() <= cfg.max_response_time);

                    if valid {
                        response_times.push(outcome.elapsed.as_secs_f64() * 1000.0);
                        successful_requests += 1;
                        url_result.successful_requests += 1;
                    }
                    break;
                }
            }

            let url_success = url_result.successful_requests >= cfg.min_successful_requests;
            if url_success {
                successful_urls_count += 1;
                if *is_https {
                    https_check_passed = true;
                }
            }
            round_results.insert(url.clone(), url_result);

            if !cfg.strict_mode
                && successful_urls_count >= cfg.min_successful_urls
                && (!cfg.require_https || https_check_passed)
            {
                break;
            }
        }

        if cfg.test_post_requests {
            let outcome = make_request(
                &client,
                &all_urls[0].0,
                Method::POST,
                Duration::from_secs_f64(connect_timeout),
            )
            .await;
            total_requests += 1;
            if outcome.error.is_none()
                && check_response_valid(outcome.status, outcome.content_length, 0, &all_urls[0].0)
            {
                successful_requests += 1;
            }
        }

        if cfg.check_geolocation {
            match fetch_geolocation(&client, &cfg.geolocation_service).await {
                Some(country) if !cfg.allowed_countries.is_empty() => {
                    if !cfg.allowed_countries.contains(&country) {
                        return Ok((
                            false,
                            CheckMetrics {
                                response_times,
                                geolocation: Some(country),
                                total_requests,
                                successful_requests,
                                ..Default::default()
                            },
                        ));
                    }
                }
                _ => {}
            }
        }

        let round_pass = if cfg.strict_mode && cfg.strict_mode_require_all {
            all_urls
                .iter()
                .all(|(u, _)| round_results[u].successful_requests >= cfg.min_successful_requests)
                && https_check_passed
        } else {
            successful_urls_count >= cfg.min_successful_urls && https_check_passed
        };

        stability_results.push(round_pass);
        last_round_results = round_results;

        if !round_pass && cfg.strict_mode {
            break 'rounds;
        }
    }

    if cfg.stability_checks > 1 && !stability_results.iter().all(|&r| r) {
        return Ok((
            false,
            CheckMetrics {
                response_times,
                total_requests,
                successful_requests,
                ..Default::default()
            },
        ));
    }

    if cfg.min_avg_response_time > 0.0 && !response_times.is_empty() {
        let avg_secs = response_times.iter().sum::<f64>() / response_times.len() as f64 / 1000.0;
        if avg_secs > cfg.min_avg_response_time {
            return Ok((
                false,
                CheckMetrics {
                    response_times,
                    total_requests,
                    successful_requests,
                    ..Default::default()
                },
            ));
        }
    }

    let final_successful = all_urls
        .iter()
        .filter(|(u, _)| {
            last_round_results
                .get(u)
                .map(|r| r.successful_requests >= cfg.min_successful_requests)
                .unwrap_or(false)
        })
        .count() as u32;
    let final_failed = all_urls.len() as u32 - final_successful;

    let mut is_available = final_successful >= cfg.min_successful_urls;
    if cfg.require_https {
        let https_ok = all_urls
            .iter()
            .filter(|(_, is_https)| *is_https)
            .any(|(u, _)| {
                last_round_results
                    .get(u)
                    .map(|r| r.successful_requests >= cfg.min_successful_requests)
                    .unwrap_or(false)
            });
        is_available = is_available && https_ok;
    }
    if cfg.strict_mode {
        is_available = final_successful == all_urls.len() as u32
            && all_urls
                .iter()
                .filter(|(_, is_https)| *is_https)
                .all(|(u, _)| {
                    last_round_results
                        .get(u)
                        .map(|r| r.successful_requests >= cfg.min_successful_requests)
                        .unwrap_or(false)
                });
    }

    Ok((
        is_available,
        CheckMetrics {
            response_times,
            successful_urls: final_successful,
            failed_urls: final_failed,
            total_requests,
            successful_requests,
            ..Default::default()
        },
    ))
}

async fn fetch_geolocation(client: &reqwest::Client, service_url: &str) -> Option<String> {
    let response = client
        .get(service_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let value: serde_json::Value = response.json().await.ok()?;
    value
        .get("countryCode")
        .or_else(|| value.get("country_code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_uppercase())
}

async fn finish(
    cfg: &AppConfig,
    cache: &Mutex<VerdictCache>,
    line: &str,
    alive: bool,
    metrics: CheckMetrics,
) -> CheckResult {
    if cfg.enable_cache {
        cache.lock().await.record(line, alive);
    }
    CheckResult {
        line: line.to_string(),
        alive,
        metrics,
    }
}

async fn dead(
    cfg: &AppConfig,
    cache: &Mutex<VerdictCache>,
    line: &str,
    metrics: CheckMetrics,
) -> CheckResult {
    finish(cfg, cache, line, false, metrics).await
}

pub fn key_for(line: &str) -> ProxyKey {
    ProxyKey::new(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_result_tracks_success_ratio() {
        let mut r = UrlRoundResult::default();
        r.total_requests = 3;
        r.successful_requests = 2;
        assert!(r.successful_requests < r.total_requests);
    }

    #[tokio::test]
    async fn hysteria_reachable_check_fails_fast_on_closed_port() {
        let (ok, _) = check_hysteria_reachable("127.0.0.1", 1, 0.2).await;
        assert!(!ok);
    }
}
