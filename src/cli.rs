use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "herscat-checker",
    version,
    about = "End-to-end VLESS/VMess/Trojan/Shadowsocks/Hysteria credential checker",
    long_about = "Loads a list of proxy links (single URL/file, a merged feed list, or the notworkers file), probes each one end-to-end through a local xray-core relay, and writes the survivors sorted by latency."
)]
pub struct CheckerArgs {
    /// Subscription URL or local file to load keys from (defaults to DEFAULT_LIST_URL)
    #[arg(value_name = "URL_OR_FILE")]
    pub url_or_file: Option<String>,

    /// Print the relay JSON config for the first parsed key and exit
    #[arg(short = 'p', long = "print-config", action = clap::ArgAction::SetTrue)]
    pub print_config: bool,

    /// Enable verbose (info-level) logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Enable debug logging, including relay stderr on failure
    #[arg(long = "debug", action = clap::ArgAction::SetTrue)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "herscat-speedtest",
    version,
    about = "Re-ranks an already-validated proxy list by latency or throughput",
    long_about = "Re-runs latency (and, in quick/full modes, download throughput) measurements against a file of already-checked proxy links, producing a resorted output and its top-100 slice."
)]
pub struct SpeedtestArgs {
    /// File of already-validated proxy links to re-rank
    #[arg(value_name = "INPUT_FILE")]
    pub input_file: String,

    /// Enable verbose (info-level) logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(long = "debug", action = clap::ArgAction::SetTrue)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

pub fn log_level(debug: bool, verbose: bool) -> &'static str {
    match (debug, verbose) {
        (true, _) => "debug",
        (false, true) => "info",
        _ => "warn",
    }
}

fn level_rank(level: &str) -> u8 {
    match level.to_lowercase().as_str() {
        "trace" => 4,
        "debug" => 3,
        "info" => 2,
        "warn" | "warning" => 1,
        _ => 0,
    }
}

/// Combines the CLI-derived level with `LOG_LEVEL` from the environment,
/// which acts as a floor: whichever is more verbose wins. An empty or
/// unrecognized `LOG_LEVEL` leaves the CLI-derived level untouched.
pub fn effective_log_level(debug: bool, verbose: bool, log_level_env: &str) -> &'static str {
    let cli_level = log_level(debug, verbose);
    if log_level_env.is_empty() {
        return cli_level;
    }
    if level_rank(log_level_env) > level_rank(cli_level) {
        match log_level_env.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" | "warning" => "warn",
            "error" => "error",
            _ => cli_level,
        }
    } else {
        cli_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_log_level_keeps_cli_level_when_env_unset() {
        assert_eq!(effective_log_level(false, false, ""), "warn");
    }

    #[test]
    fn effective_log_level_floor_raises_verbosity() {
        assert_eq!(effective_log_level(false, false, "DEBUG"), "debug");
    }

    #[test]
    fn effective_log_level_does_not_lower_verbosity() {
        assert_eq!(effective_log_level(true, false, "warn"), "debug");
    }
}
