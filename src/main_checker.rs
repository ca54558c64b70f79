use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use herscat::cache::VerdictCache;
use herscat::checker::{self, CheckMetrics, CheckResult, LiveRegistry};
use herscat::cli::{CheckerArgs, Commands, effective_log_level};
use herscat::config::AppConfig;
use herscat::export::{build_records, export_to_csv, export_to_html, export_to_json};
use herscat::ingest::{load_keys_with_cascade, load_merged_keys};
use herscat::metrics::{calculate_performance_metrics, print_statistics_table};
use herscat::notworkers::NotworkersSet;
use herscat::parser::{ProxyKey, parse_proxy_url};
use herscat::pool::{CancellationGuard, run_pool};
use herscat::port_pool::PortPool;
use herscat::ranker::{RankedKey, format_key_with_metadata, rank, write_results};
use herscat::relay::ensure_relay_binary;
use herscat::relay_config::build_relay_config;
use herscat::banner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CheckerArgs::parse();

    if let Some(Commands::Completions { shell }) = args.cmd {
        generate(
            shell,
            &mut CheckerArgs::command(),
            "herscat-checker",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    init_logging(args.debug, args.verbose);

    let cfg = AppConfig::load();

    let fetch_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .context("failed to build fetch client")?;

    let (list_source, keys) = match cfg.mode.as_str() {
        "notworkers" => {
            let keys = keys_from_notworkers_file(&cfg.notworkers_path())?;
            if keys.is_empty() {
                println!("{}", "No keys in the notworkers file to check.".yellow());
                return Ok(());
            }
            println!(
                "{} checking keys from {}",
                "notworkers mode:".cyan(),
                cfg.notworkers_file
            );
            ("notworkers".to_string(), keys)
        }
        "merge" => {
            let links_path = resolve_links_path(&cfg.links_file)?;
            let roots = read_source_list(&links_path)?;
            let keys = load_merged_keys(&fetch_client, &roots)
                .await
                .context("failed to merge source lists")?;
            ("merged".to_string(), keys)
        }
        _ => {
            let source = args.url_or_file.clone().unwrap_or_else(|| cfg.default_list_url.clone());
            if source.is_empty() {
                return Err(anyhow!("no URL/file given and DEFAULT_LIST_URL is unset"));
            }
            let keys = load_keys_with_cascade(&fetch_client, &source)
                .await
                .context("failed to load key list")?;
            (source, keys)
        }
    };

    let output_path = resolve_output_path(&cfg, &list_source);

    if args.print_config {
        let Some(first) = keys.first() else {
            return Err(anyhow!("no keys in the list to print a config for"));
        };
        let parsed = parse_proxy_url(&first.raw).context("failed to parse first key")?;
        let config = build_relay_config(&parsed, 10808).context("failed to build relay config")?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        println!(
            "\n{} save this to config.json and run: xray run -config config.json",
            "Tip:".yellow()
        );
        return Ok(());
    }

    banner::print_banner();
    banner::print_current_config(&cfg, &list_source, &output_path.to_string_lossy());

    println!("{}", "Checking xray-core availability...".cyan());
    let xray_cmd = ensure_relay_binary(&cfg.xray_path, &cfg.xray_cmd, &cfg.xray_dir_name)
        .await
        .context("xray-core is not available")?;
    let xray_cmd = xray_cmd.to_string_lossy().to_string();
    println!("{} xray-core ready.\n", "OK".green());

    println!("Found keys: {}", keys.len());
    if keys.is_empty() {
        println!("{}", "No keys to check.".yellow());
        return Ok(());
    }

    let keys = if cfg.mode != "notworkers" {
        filter_notworkers(&cfg, keys)
    } else {
        keys
    };

    let link_to_full: HashMap<String, String> = keys.iter().map(|k| (k.raw.clone(), k.full_line.clone())).collect();
    let mut lines: Vec<String> = keys.iter().map(|k| k.raw.clone()).collect();

    let port_pool = Arc::new(PortPool::new(cfg.base_port, cfg.max_workers));
    let cache = Arc::new(Mutex::new(if cfg.enable_cache {
        VerdictCache::load(&cfg.cache_path(), cfg.cache_ttl)
    } else {
        VerdictCache::default()
    }));
    let live: LiveRegistry = Arc::new(Mutex::new(std::collections::HashSet::new()));
    let partial_results = Arc::new(Mutex::new(Vec::new()));
    let guard = CancellationGuard::install(live.clone(), partial_results.clone(), output_path.clone());

    let time_start = Instant::now();

    let cfg_arc = Arc::new(cfg.clone());
    let xray_cmd_arc = Arc::new(xray_cmd.clone());
    let port_pool_task = port_pool.clone();
    let cache_task = cache.clone();
    let live_task = live.clone();
    let partial_task = partial_results.clone();

    // The first key is probed in a distinguished debug slot that captures
    // relay stderr on failure; its verdict is folded in with the rest.
    let mut first_result = None;
    if cfg.debug_first_fail && !lines.is_empty() {
        let first_line = lines.remove(0);
        let result = checker::check_key_e2e(&cfg, &port_pool, &cache, &live, &xray_cmd, &first_line, cfg.should_debug(true)).await;
        println!(
            "[1/{}] {}",
            keys.len(),
            if result.alive { "OK".green().to_string() } else { "fail".red().to_string() }
        );
        if result.alive {
            partial_results.lock().await.push(result.line.clone());
        }
        first_result = Some(result);
    }

    let results: Vec<CheckResult> = run_pool(lines, cfg.max_workers, guard.cancelled.clone(), move |line| {
        let cfg = cfg_arc.clone();
        let xray_cmd = xray_cmd_arc.clone();
        let port_pool = port_pool_task.clone();
        let cache = cache_task.clone();
        let live = live_task.clone();
        let partial = partial_task.clone();
        async move {
            let result = checker::check_key_e2e(&cfg, &port_pool, &cache, &live, &xray_cmd, &line, false).await;
            if result.alive {
                partial.lock().await.push(result.line.clone());
            }
            result
        }
    })
    .await;

    let elapsed = time_start.elapsed();

    let mut all_metrics: HashMap<String, CheckMetrics> = HashMap::new();
    let mut ranked_keys = Vec::new();
    let mut alive_keys = Vec::new();
    let mut dead_keys = Vec::new();

    for result in first_result.into_iter().chain(results) {
        let key = checker::key_for(&result.line);
        if result.alive {
            let avg_latency_ms = if result.metrics.response_times.is_empty() {
                0.0
            } else {
                result.metrics.response_times.iter().sum::<f64>() / result.metrics.response_times.len() as f64
            };
            if avg_latency_ms <= cfg.max_latency_ms as f64 {
                let full_line = link_to_full.get(&result.line).cloned().unwrap_or_else(|| result.line.clone());
                ranked_keys.push(RankedKey {
                    full_line: format_key_with_metadata(cfg.log_response_time, &full_line, &result.metrics, avg_latency_ms),
                    latency_ms: avg_latency_ms,
                });
                alive_keys.push(key.clone());
            } else {
                dead_keys.push(key.clone());
            }
        } else {
            dead_keys.push(key.clone());
        }
        all_metrics.insert(result.line.clone(), result.metrics);
    }

    if cfg.enable_cache {
        cache.lock().await.save(&cfg.cache_path())?;
    }

    let ranked = rank(ranked_keys);
    match write_results(&output_path, &ranked)? {
        Some(top100) => println!(
            "{} results saved to {} ({} keys, top100 at {})",
            "OK".green(),
            output_path.display(),
            ranked.len(),
            top100.display()
        ),
        None if ranked.is_empty() => println!("{}", "No available keys to save.".yellow()),
        None => {}
    }

    if cfg.mode != "notworkers" {
        let mut notworkers = NotworkersSet::load(&cfg.notworkers_path());
        let (added, removed) = notworkers.reconcile(&dead_keys, &alive_keys);
        notworkers.save(&cfg.notworkers_path())?;
        if added > 0 || removed > 0 {
            println!(
                "notworkers: added {added}, removed {removed} (revived), total {}",
                notworkers.len()
            );
        } else {
            println!("notworkers: unchanged, total {}", notworkers.len());
        }
    }

    let available_links: Vec<String> = alive_keys.iter().map(|k| k.raw.clone()).collect();
    let records = build_records(&all_metrics, &available_links);
    let response_times_ms: Vec<f64> = all_metrics.values().flat_map(|m| m.response_times.clone()).collect();
    let perf = calculate_performance_metrics(&records, &response_times_ms, elapsed);
    print_statistics_table(&perf);

    if matches!(cfg.export_format.as_str(), "json" | "all") {
        let path = export_to_json(&records, &output_path)?;
        println!("{} JSON export: {}", "OK".green(), path.display());
    }
    if matches!(cfg.export_format.as_str(), "csv" | "all") {
        let path = export_to_csv(&records, &output_path)?;
        println!("{} CSV export: {}", "OK".green(), path.display());
    }
    if matches!(cfg.export_format.as_str(), "html" | "all") {
        let path = export_to_html(&records, &output_path)?;
        println!("{} HTML export: {}", "OK".green(), path.display());
    }

    if cfg.log_metrics && !all_metrics.is_empty() {
        let metrics_path = metrics_output_path(&cfg, &output_path);
        if let Some(parent) = metrics_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&metrics_path, serde_json::to_string_pretty(&perf)?)?;
        println!("{} Metrics saved to: {}", "OK".green(), metrics_path.display());
    }

    Ok(())
}

/// Loads `.env`, resolves the effective level from `-v`/`--debug` floored
/// by `LOG_LEVEL`, and points `env_logger` at `LOG_FILE` (appended, plain
/// text) when one is configured, else stderr.
fn init_logging(debug: bool, verbose: bool) {
    let _ = dotenvy::dotenv();
    let log_level_env = std::env::var("LOG_LEVEL").unwrap_or_default();
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(effective_log_level(debug, verbose, &log_level_env)),
    );
    if let Ok(log_file) = std::env::var("LOG_FILE")
        && !log_file.is_empty()
        && let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_file)
    {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn resolve_links_path(links_file: &str) -> Result<PathBuf> {
    let direct = Path::new(links_file);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }
    Err(anyhow!("links file not found: {links_file}"))
}

fn read_source_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn keys_from_notworkers_file(path: &Path) -> Result<Vec<ProxyKey>> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Ok(Vec::new());
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(ProxyKey::new)
        .collect())
}

fn filter_notworkers(cfg: &AppConfig, keys: Vec<ProxyKey>) -> Vec<ProxyKey> {
    let notworkers = NotworkersSet::load(&cfg.notworkers_path());
    if notworkers.is_empty() {
        return keys;
    }
    let before = keys.len();
    let filtered: Vec<ProxyKey> = keys.into_iter().filter(|k| !notworkers.contains(&k.raw)).collect();
    let dropped = before - filtered.len();
    if dropped > 0 {
        println!(
            "Filtered by {}: {dropped} keys ({} remain)",
            cfg.notworkers_file,
            filtered.len()
        );
    }
    filtered
}

/// Splits `OUTPUT_FILE` into (stem, ext) the way `os.path.splitext` does,
/// then optionally folds in the source name and today's date.
fn resolve_output_path(cfg: &AppConfig, list_source: &str) -> PathBuf {
    let (stem, ext) = split_stem_ext(&cfg.output_file);
    let stem = if stem.is_empty() { "available".to_string() } else { stem };

    let name = if !cfg.output_add_date {
        format!("{stem}{ext}")
    } else {
        let ext = if ext.is_empty() { ".txt".to_string() } else { ext };
        let source = source_name(list_source);
        let date = chrono::Local::now().format("%d%m%Y");
        format!("{stem} ({source}_{date}){ext}")
    };

    if cfg.output_dir.is_empty() {
        PathBuf::from(name)
    } else {
        Path::new(&cfg.output_dir).join(name)
    }
}

fn split_stem_ext(file_name: &str) -> (String, String) {
    let path = Path::new(file_name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

fn source_name(source: &str) -> String {
    if source.starts_with("http://") || source.starts_with("https://") {
        if let Ok(url) = reqwest::Url::parse(source) {
            let trimmed = url.path().trim_end_matches('/');
            if let Some(last) = trimmed.rsplit('/').next()
                && !last.is_empty()
            {
                return last.to_string();
            }
        }
        return "list".to_string();
    }
    let (stem, _) = split_stem_ext(source);
    if stem.is_empty() { "list".to_string() } else { stem }
}

fn metrics_output_path(cfg: &AppConfig, output_path: &Path) -> PathBuf {
    let candidate = Path::new(&cfg.metrics_file);
    if candidate.parent().map(|p| !p.as_os_str().is_empty()).unwrap_or(false) {
        candidate.to_path_buf()
    } else {
        output_path.parent().unwrap_or_else(|| Path::new(".")).join(&cfg.metrics_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_stem_ext_handles_extensionless_name() {
        assert_eq!(split_stem_ext("available"), ("available".to_string(), String::new()));
        assert_eq!(split_stem_ext("available.txt"), ("available".to_string(), ".txt".to_string()));
    }

    #[test]
    fn source_name_extracts_last_url_segment() {
        assert_eq!(source_name("https://example.com/feeds/whitelist.txt"), "whitelist.txt");
    }

    #[test]
    fn source_name_falls_back_to_file_stem() {
        assert_eq!(source_name("links.txt"), "links");
    }
}
