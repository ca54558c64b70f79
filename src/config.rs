use std::path::PathBuf;

/// Runtime configuration assembled from environment variables (optionally
/// loaded from a `.env` file), mirroring the layout of the original
/// checker's settings module. Every field has a documented default so the
/// tool runs sensibly with no configuration at all.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // --- input ---
    pub mode: String,
    pub links_file: String,
    pub default_list_url: String,

    // --- output ---
    pub output_file: String,
    pub output_dir: String,
    pub output_add_date: bool,
    pub notworkers_file: String,

    // --- probing ---
    pub test_url: String,
    pub test_urls: Vec<String>,
    pub test_urls_https: Vec<String>,
    pub min_successful_urls: u32,
    pub require_https: bool,
    pub requests_per_url: u32,
    pub min_successful_requests: u32,
    pub request_delay: f64,
    pub connect_timeout: f64,
    pub connect_timeout_slow: f64,
    pub use_adaptive_timeout: bool,
    pub max_retries: u32,
    pub retry_delay_base: f64,
    pub retry_delay_multiplier: f64,
    pub max_response_time: f64,
    pub min_response_size: u64,
    pub min_avg_response_time: f64,
    pub verify_https_ssl: bool,
    pub max_latency_ms: u64,
    pub stability_checks: u32,
    pub stability_check_delay: f64,
    pub strict_mode: bool,
    pub strict_mode_require_all: bool,
    pub strong_style_test: bool,
    pub strong_style_timeout: f64,
    pub strong_max_response_time: f64,
    pub strong_attempts: u32,
    pub test_post_requests: bool,

    // --- geolocation ---
    pub check_geolocation: bool,
    pub geolocation_service: String,
    pub allowed_countries: Vec<String>,

    // --- execution ---
    pub max_workers: usize,
    pub base_port: u16,
    pub xray_startup_wait: f64,
    pub xray_startup_poll_interval: f64,
    pub xray_path: String,
    pub xray_dir_name: String,
    pub xray_cmd: String,
    pub debug_first_fail: bool,

    // --- logging ---
    pub log_level: String,
    pub log_file: String,
    pub log_response_time: bool,
    pub log_metrics: bool,
    pub metrics_file: String,

    // --- caching ---
    pub enable_cache: bool,
    pub cache_ttl: u64,
    pub cache_file: String,

    // --- export ---
    pub export_format: String,
    pub export_dir: String,

    // --- speed test ---
    pub speed_test_enabled: bool,
    pub speed_test_timeout: f64,
    pub speed_test_mode: String,
    pub speed_test_metric: String,
    pub speed_test_output: String,
    pub speed_test_requests: u32,
    pub speed_test_url: String,
    pub speed_test_workers: usize,
    pub speed_test_download_timeout: f64,
    pub speed_test_download_url_small: String,
    pub speed_test_download_url_medium: String,
    pub min_speed_threshold_mbps: f64,
    pub speed_test_debug: bool,
}

impl AppConfig {
    /// Loads a `.env` file if present (silently ignored if missing) and
    /// reads every setting from the environment, falling back to defaults
    /// that match running the checker with no configuration at all.
    pub fn load() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded environment overrides from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => log::warn!("Failed to parse .env file: {e}"),
        }

        let max_workers = env_usize("MAX_WORKERS", 120);
        let base_port = env_u16("BASE_PORT", 20000);
        let require_https = env_bool("REQUIRE_HTTPS", false);

        let mut test_urls_https = env_url_list("TEST_URLS_HTTPS");
        if require_https && test_urls_https.is_empty() {
            test_urls_https.push("https://www.gstatic.com/generate_204".to_string());
        }

        let output_dir = env_str("OUTPUT_DIR", "configs");
        let notworkers_file = env_str(
            "NOTWORKERS_FILE",
            &format!("{output_dir}/notworkers"),
        );

        Self {
            mode: env_str("MODE", "single"),
            links_file: env_str("LINKS_FILE", "links.txt"),
            default_list_url: env_str("DEFAULT_LIST_URL", ""),

            output_file: env_str("OUTPUT_FILE", "available"),
            output_dir,
            output_add_date: env_bool("OUTPUT_ADD_DATE", false),
            notworkers_file,

            test_url: env_str("TEST_URL", "http://www.google.com/generate_204"),
            test_urls: env_url_list("TEST_URLS"),
            test_urls_https,
            min_successful_urls: env_u32("MIN_SUCCESSFUL_URLS", 1),
            require_https,
            requests_per_url: env_u32("REQUESTS_PER_URL", 1),
            min_successful_requests: env_u32("MIN_SUCCESSFUL_REQUESTS", 1),
            request_delay: env_f64("REQUEST_DELAY", 0.5),
            connect_timeout: env_f64("CONNECT_TIMEOUT", 8.0),
            connect_timeout_slow: env_f64("CONNECT_TIMEOUT_SLOW", 15.0),
            use_adaptive_timeout: env_bool("USE_ADAPTIVE_TIMEOUT", false),
            max_retries: env_u32("MAX_RETRIES", 1),
            retry_delay_base: env_f64("RETRY_DELAY_BASE", 1.0),
            retry_delay_multiplier: env_f64("RETRY_DELAY_MULTIPLIER", 2.0),
            max_response_time: env_f64("MAX_RESPONSE_TIME", 0.0),
            min_response_size: env_u64("MIN_RESPONSE_SIZE", 0),
            min_avg_response_time: env_f64("MIN_AVG_RESPONSE_TIME", 0.0),
            verify_https_ssl: env_bool("VERIFY_HTTPS_SSL", false),
            max_latency_ms: env_u64("MAX_LATENCY_MS", 3000),
            stability_checks: env_u32("STABILITY_CHECKS", 1),
            stability_check_delay: env_f64("STABILITY_CHECK_DELAY", 2.0),
            strict_mode: env_bool("STRICT_MODE", false),
            strict_mode_require_all: env_bool("STRICT_MODE_REQUIRE_ALL", true),
            strong_style_test: env_bool("STRONG_STYLE_TEST", false),
            strong_style_timeout: env_f64("STRONG_STYLE_TIMEOUT", 12.0),
            strong_max_response_time: env_f64("STRONG_MAX_RESPONSE_TIME", 3.0),
            strong_attempts: env_u32("STRONG_ATTEMPTS", 3),
            test_post_requests: env_bool("TEST_POST_REQUESTS", false),

            check_geolocation: env_bool("CHECK_GEOLOCATION", false),
            geolocation_service: env_str("GEOLOCATION_SERVICE", "http://ip-api.com/json"),
            allowed_countries: env_str_list("ALLOWED_COUNTRIES")
                .into_iter()
                .map(|c| c.to_uppercase())
                .collect(),

            max_workers,
            base_port,
            xray_startup_wait: env_f64("XRAY_STARTUP_WAIT", 1.8),
            xray_startup_poll_interval: env_f64("XRAY_STARTUP_POLL_INTERVAL", 0.2),
            xray_path: env_str("XRAY_PATH", ""),
            xray_dir_name: env_str("XRAY_DIR_NAME", "xray_dist"),
            xray_cmd: env_str("XRAY_CMD", "xray"),
            debug_first_fail: env_bool("DEBUG_FIRST_FAIL", true),

            log_level: env_str("LOG_LEVEL", "INFO"),
            log_file: env_str("LOG_FILE", ""),
            log_response_time: env_bool("LOG_RESPONSE_TIME", false),
            log_metrics: env_bool("LOG_METRICS", false),
            metrics_file: env_str("METRICS_FILE", "metrics.json"),

            enable_cache: env_bool("ENABLE_CACHE", false),
            cache_ttl: env_u64("CACHE_TTL", 3600),
            cache_file: env_str("CACHE_FILE", ".checker_cache.json"),

            export_format: env_str("EXPORT_FORMAT", "txt"),
            export_dir: env_str("EXPORT_DIR", "./exports"),

            speed_test_enabled: env_bool("SPEED_TEST_ENABLED", false),
            speed_test_timeout: env_f64("SPEED_TEST_TIMEOUT", 5.0),
            speed_test_mode: env_str("SPEED_TEST_MODE", "latency"),
            speed_test_metric: env_str("SPEED_TEST_METRIC", "latency"),
            speed_test_output: env_str("SPEED_TEST_OUTPUT", "separate_file"),
            speed_test_requests: env_u32("SPEED_TEST_REQUESTS", 5),
            speed_test_url: env_str("SPEED_TEST_URL", "https://www.gstatic.com/generate_204"),
            speed_test_workers: env_usize("SPEED_TEST_WORKERS", max_workers),
            speed_test_download_timeout: env_f64("SPEED_TEST_DOWNLOAD_TIMEOUT", 30.0),
            speed_test_download_url_small: env_str(
                "SPEED_TEST_DOWNLOAD_URL_SMALL",
                "https://speed.cloudflare.com/__down?bytes=250000",
            ),
            speed_test_download_url_medium: env_str(
                "SPEED_TEST_DOWNLOAD_URL_MEDIUM",
                "https://speed.cloudflare.com/__down?bytes=1000000",
            ),
            min_speed_threshold_mbps: env_f64("MIN_SPEED_THRESHOLD_MBPS", 2.5),
            speed_test_debug: env_bool("SPEED_TEST_DEBUG", false),
        }
    }

    pub fn notworkers_path(&self) -> PathBuf {
        PathBuf::from(&self.notworkers_file)
    }

    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_file)
    }

    /// The distinguished debug slot is only honored when the resolved log
    /// level is actually `DEBUG` — a `--debug` flag with `LOG_LEVEL=INFO`
    /// requests the distinguished slot's extra console noise, not its
    /// relay-stderr capture.
    pub fn should_debug(&self, debug_flag: bool) -> bool {
        debug_flag && self.log_level.eq_ignore_ascii_case("debug")
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_str_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split([',', ';'])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_url_list(key: &str) -> Vec<String> {
    env_str_list(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_common_truthy_values() {
        unsafe {
            std::env::set_var("HERSCAT_TEST_BOOL", "Yes");
        }
        assert!(env_bool("HERSCAT_TEST_BOOL", false));
        unsafe {
            std::env::remove_var("HERSCAT_TEST_BOOL");
        }
    }

    #[test]
    fn env_bool_falls_back_to_default_when_unset() {
        assert!(!env_bool("HERSCAT_TEST_BOOL_UNSET", false));
        assert!(env_bool("HERSCAT_TEST_BOOL_UNSET", true));
    }

    #[test]
    fn env_str_list_splits_on_comma_and_semicolon() {
        unsafe {
            std::env::set_var("HERSCAT_TEST_LIST", "a, b ;c");
        }
        assert_eq!(env_str_list("HERSCAT_TEST_LIST"), vec!["a", "b", "c"]);
        unsafe {
            std::env::remove_var("HERSCAT_TEST_LIST");
        }
    }

    #[test]
    fn should_debug_requires_log_level_debug() {
        let mut cfg = AppConfig::load();
        cfg.log_level = "INFO".to_string();
        assert!(!cfg.should_debug(true));
        cfg.log_level = "DEBUG".to_string();
        assert!(cfg.should_debug(true));
        assert!(!cfg.should_debug(false));
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = AppConfig::load();
        assert_eq!(cfg.mode, "single");
        assert_eq!(cfg.base_port, 20000);
        assert_eq!(cfg.min_successful_urls, 1);
        assert!(!cfg.strict_mode);
    }
}
