use crate::config::AppConfig;
use colored::Colorize;

/// Prints the startup banner and the resolved configuration summary
/// before any probing starts, so a run can be sanity-checked at a glance.
pub fn print_banner() {
    let art = r#"
         ██╗  ██╗███████╗██████╗ ███████╗ ██████╗ █████╗ ████████╗
         ██║  ██║██╔════╝██╔══██╗██╔════╝██╔════╝██╔══██╗╚══██╔══╝
         ███████║█████╗  ██████╔╝███████╗██║     ███████║   ██║
         ██╔══██║██╔══╝  ██╔══██╗╚════██║██║     ██╔══██║   ██║
         ██║  ██║███████╗██║  ██║███████║╚██████╗██║  ██║   ██║
         ╚═╝  ╚═╝╚══════╝╚═╝  ╚═╝╚══════╝ ╚═════╝╚═╝  ╚═╝   ╚═╝
    "#;
    println!("{}", art.red().bold());
    println!(
        "{} {}",
        "herscat".red().bold(),
        "- end-to-end proxy credential checker".white()
    );
    println!();
}

/// Mirrors the pre-flight config panel: the knobs that actually change
/// behavior for this run, not the full environment dump.
pub fn print_current_config(cfg: &AppConfig, list_source: &str, output_path: &str) {
    println!("{}", "Check parameters".cyan().bold());
    println!("  {:<22}{}", "Mode:".cyan(), cfg.mode.bold());
    if cfg.strong_style_test {
        println!(
            "  {:<22}strict ({} attempts in a row)",
            "Algorithm:".cyan(),
            cfg.strong_attempts
        );
        println!(
            "  {:<22}{} s (connect + read)",
            "Request timeout:".cyan(),
            cfg.strong_style_timeout
        );
        println!(
            "  {:<22}{} s",
            "Max response time:".cyan(),
            cfg.strong_max_response_time
        );
    }
    println!("  {:<22}{}", "Source:".cyan(), list_source);
    println!("  {:<22}{}", "Output file:".cyan(), output_path);

    let test_urls_display = if cfg.strong_style_test {
        "gstatic generate_204".to_string()
    } else if !cfg.test_urls.is_empty() {
        let mut shown: Vec<&str> = cfg.test_urls.iter().take(3).map(String::as_str).collect();
        let suffix = if cfg.test_urls.len() > 3 { "..." } else { "" };
        shown.push(suffix);
        shown.join(", ")
    } else if !cfg.test_url.is_empty() {
        cfg.test_url.clone()
    } else {
        "(none)".to_string()
    };
    println!("  {:<22}{}", "Test URL(s):".cyan(), test_urls_display);
    if !cfg.test_urls_https.is_empty() {
        println!("  {:<22}{} URL(s)", "HTTPS URLs:".cyan(), cfg.test_urls_https.len());
    }

    let timeout_display = if cfg.use_adaptive_timeout {
        format!("{} s (slow: {} s)", cfg.connect_timeout, cfg.connect_timeout_slow)
    } else {
        format!("{} s", cfg.connect_timeout)
    };
    println!("  {:<22}{}", "Request timeout:".cyan(), timeout_display);
    println!("  {:<22}{}", "Retries:".cyan(), cfg.max_retries + 1);
    println!("  {:<22}{}", "Requests per URL:".cyan(), cfg.requests_per_url);
    println!("  {:<22}{} URL(s)", "Min successful:".cyan(), cfg.min_successful_urls);
    if cfg.stability_checks > 1 {
        println!("  {:<22}{}", "Stability checks:".cyan(), cfg.stability_checks);
    }
    if cfg.max_response_time > 0.0 {
        println!("  {:<22}{} s", "Max response time:".cyan(), cfg.max_response_time);
    }
    if cfg.check_geolocation {
        println!("  {:<22}{}", "Geolocation check:".cyan(), "enabled".green());
    }
    if cfg.strict_mode {
        println!("  {:<22}{}", "Strict mode:".cyan(), "enabled".green());
    }
    println!("  {:<22}{}", "Workers:".cyan(), cfg.max_workers);
    println!(
        "  {:<22}{}-{}",
        "SOCKS ports:".cyan(),
        cfg.base_port,
        cfg.base_port as u32 + cfg.max_workers as u32 - 1
    );
    println!(
        "  {:<22}{} s (polled every {} s)",
        "xray startup wait:".cyan(),
        cfg.xray_startup_wait,
        cfg.xray_startup_poll_interval
    );
    if cfg.enable_cache {
        println!("  {:<22}{}", "Caching:".cyan(), "enabled".green());
    }
    println!(
        "  {:<22}{} ms (higher-latency survivors are not written out)",
        "Max latency written:".cyan(),
        cfg.max_latency_ms
    );
    println!();
}
