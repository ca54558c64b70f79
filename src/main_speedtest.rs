use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use herscat::checker::LiveRegistry;
use herscat::cli::{Commands, SpeedtestArgs, effective_log_level};
use herscat::config::AppConfig;
use herscat::parser::ProxyKey;
use herscat::pool::{CancellationGuard, run_pool};
use herscat::port_pool::PortPool;
use herscat::ranker::top100_path;
use herscat::relay::ensure_relay_binary;
use herscat::speedtest::{SpeedTestResult, score_sort_descending, speed_test_key};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::collections::HashMap;

#[tokio::main]
async fn main() -> Result<()> {
    let args = SpeedtestArgs::parse();

    if let Some(Commands::Completions { shell }) = args.cmd {
        generate(
            shell,
            &mut SpeedtestArgs::command(),
            "herscat-speedtest",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    init_logging(args.debug, args.verbose);

    let cfg = AppConfig::load();

    if !cfg.speed_test_enabled {
        println!("{}", "Speed test disabled (SPEED_TEST_ENABLED=false).".yellow());
        return Ok(());
    }

    let input_path = Path::new(&args.input_file);
    let content = std::fs::read_to_string(input_path)
        .with_context(|| format!("failed to read input file: {}", args.input_file))?;

    let keys: Vec<ProxyKey> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(ProxyKey::new)
        .collect();

    if keys.is_empty() {
        println!("{}", "No keys in the input file to speed-test.".yellow());
        return Ok(());
    }

    println!(
        "{} {} keys loaded from {}",
        "herscat-speedtest:".cyan(),
        keys.len(),
        args.input_file
    );

    println!("{}", "Checking xray-core availability...".cyan());
    let xray_cmd = ensure_relay_binary(&cfg.xray_path, &cfg.xray_cmd, &cfg.xray_dir_name)
        .await
        .context("xray-core is not available")?;
    let xray_cmd = xray_cmd.to_string_lossy().to_string();
    println!("{} xray-core ready.\n", "OK".green());

    let workers = cfg.speed_test_workers.max(1);
    let port_pool = Arc::new(PortPool::new(cfg.base_port, workers));
    let live: LiveRegistry = Arc::new(tokio::sync::Mutex::new(std::collections::HashSet::new()));
    let partial_results = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let output_path = resolve_output_path(&cfg, input_path);
    let guard = CancellationGuard::install(live, partial_results, output_path.clone());

    let link_to_full: HashMap<String, String> = keys.iter().map(|k| (k.raw.clone(), k.full_line.clone())).collect();
    let lines: Vec<String> = keys.iter().map(|k| k.raw.clone()).collect();

    let cfg_arc = Arc::new(cfg.clone());
    let xray_cmd_arc = Arc::new(xray_cmd);
    let port_pool_task = port_pool.clone();

    let mut results: Vec<SpeedTestResult> = run_pool(lines, workers, guard.cancelled.clone(), move |line| {
        let cfg = cfg_arc.clone();
        let xray_cmd = xray_cmd_arc.clone();
        let port_pool = port_pool_task.clone();
        async move { speed_test_key(&cfg, &port_pool, &xray_cmd, &line).await }
    })
    .await
    .into_iter()
    .flatten()
    .collect();

    if cfg.min_speed_threshold_mbps > 0.0 && score_sort_descending(&cfg) {
        results.retain(|r| r.score >= cfg.min_speed_threshold_mbps);
    }

    let descending = score_sort_descending(&cfg);
    results.sort_by(|a, b| {
        if descending {
            b.score.total_cmp(&a.score)
        } else {
            a.score.total_cmp(&b.score)
        }
    });

    if results.is_empty() {
        println!("{}", "No keys survived the speed test.".yellow());
        return Ok(());
    }

    let body = results
        .iter()
        .map(|r| link_to_full.get(&r.line).cloned().unwrap_or_else(|| r.line.clone()))
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output_path, &body)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let top100 = top100_path(&output_path);
    let top100_body = results
        .iter()
        .take(100)
        .map(|r| link_to_full.get(&r.line).cloned().unwrap_or_else(|| r.line.clone()))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(&top100, &top100_body).with_context(|| format!("failed to write {}", top100.display()))?;

    println!(
        "{} {} keys ranked by {}, saved to {} (top100 at {})",
        "OK".green(),
        results.len(),
        if descending { "throughput" } else { "latency" },
        output_path.display(),
        top100.display()
    );

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

fn resolve_output_path(cfg: &AppConfig, input_path: &Path) -> PathBuf {
    let stem = input_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "available".to_string());
    let name = format!("{stem}_st");
    if cfg.output_dir.is_empty() {
        PathBuf::from(name)
    } else {
        Path::new(&cfg.output_dir).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_output_path_appends_speedtest_suffix() {
        let mut cfg = AppConfig::load();
        cfg.output_dir = String::new();
        let p = resolve_output_path(&cfg, Path::new("available.txt"));
        assert_eq!(p, PathBuf::from("available_st"));
    }
}
