use crate::error::RelayError;
use crate::parser::ParsedProxy;
use crate::relay_config::build_relay_config;
use anyhow::{Context, Result, anyhow};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};

/// One relay process spun up to probe a single proxy link. Unlike a
/// long-lived worker pool, a handle exists only for the lifetime of one
/// check: it is spawned, waited on briefly for a crash-on-startup, probed
/// through its SOCKS port, then killed.
pub struct RelayHandle {
    pub port: u16,
    process: Child,
    config_path: PathBuf,
}

impl RelayHandle {
    /// Spawns xray-core with a config built for `parsed`, listening on
    /// `port`. Returns `Err` immediately if the process exits before this
    /// call returns (the original spec calls this "instant death").
    pub async fn spawn(
        xray_cmd: &str,
        parsed: &ParsedProxy,
        port: u16,
        debug: bool,
        config_suffix: &str,
    ) -> Result<Self, RelayError> {
        let config = build_relay_config(parsed, port)
            .map_err(|e| RelayError::StartupFailed(e.to_string()))?;

        let config_path = std::env::temp_dir().join(format!("xray_{config_suffix}{port}.json"));
        let body = serde_json::to_vec_pretty(&config)
            .map_err(|e| RelayError::StartupFailed(e.to_string()))?;
        tokio::fs::write(&config_path, body).await?;

        let stderr = if debug {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut cmd = Command::new(xray_cmd);
        cmd.arg("run")
            .arg("-config")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut process = cmd
            .spawn()
            .map_err(|e| RelayError::StartupFailed(format!("failed to spawn {xray_cmd}: {e}")))?;

        match process.try_wait() {
            Ok(Some(status)) => {
                let stderr_text = drain_stderr(&mut process).await;
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(RelayError::StartupFailed(format!(
                    "relay exited immediately with {status}: {stderr_text}"
                )));
            }
            Ok(None) => {}
            Err(e) => return Err(RelayError::Io(e)),
        }

        Ok(RelayHandle {
            port,
            process,
            config_path,
        })
    }

    /// Polls briefly to see whether the relay is still alive shortly after
    /// spawn, the same crash window the original waits out before probing.
    pub async fn wait_for_startup(
        &mut self,
        total_wait: Duration,
        poll_interval: Duration,
    ) -> Result<(), RelayError> {
        let deadline = Instant::now() + total_wait;
        while Instant::now() < deadline {
            match self.process.try_wait() {
                Ok(Some(status)) => {
                    let stderr_text = drain_stderr(&mut self.process).await;
                    return Err(RelayError::StartupFailed(format!(
                        "relay exited during startup with {status}: {stderr_text}"
                    )));
                }
                Ok(None) => sleep(poll_interval).await,
                Err(e) => return Err(RelayError::Io(e)),
            }
        }
        Ok(())
    }

    /// The speed-test path additionally waits for the SOCKS port itself to
    /// accept connections, since xray can report "running" slightly before
    /// its listener is actually bound.
    pub async fn wait_for_socks_port(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        while Instant::now() < deadline {
            if timeout(
                Duration::from_millis(300),
                TcpStream::connect(("127.0.0.1", self.port)),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
            {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Terminates the relay and removes its scratch config file. Mirrors
    /// terminate()+wait(timeout)+SIGKILL-fallback from the process manager
    /// this is adapted from, collapsed to a single best-effort kill since
    /// each handle is private to one probe.
    pub async fn kill(mut self) {
        if self.process.try_wait().ok().flatten().is_none()
            && let Err(e) = self.process.start_kill()
        {
            if !matches!(e.kind(), ErrorKind::InvalidInput | ErrorKind::NotFound) {
                log::debug!("failed to kill relay on port {}: {e}", self.port);
            }
        }
        let _ = timeout(Duration::from_secs(2), self.process.wait()).await;
        if let Err(e) = tokio::fs::remove_file(&self.config_path).await
            && e.kind() != ErrorKind::NotFound
        {
            log::debug!(
                "failed to remove scratch config {}: {e}",
                self.config_path.display()
            );
        }
    }

    pub async fn dump_stderr_if_debug(&mut self, debug: bool) -> Option<String> {
        if !debug {
            return None;
        }
        Some(drain_stderr(&mut self.process).await)
    }
}

async fn drain_stderr(process: &mut Child) -> String {
    let Some(stderr) = process.stderr.as_mut() else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = timeout(Duration::from_millis(200), stderr.read_to_string(&mut buf)).await;
    buf
}

/// Resolves a usable xray-core binary: an explicit `XRAY_PATH`, then
/// whatever `xray_cmd` resolves to on `PATH`, then a binary already present
/// in the local dist directory, and finally a fresh download from the
/// project's GitHub releases.
pub async fn ensure_relay_binary(
    xray_path: &str,
    xray_cmd: &str,
    xray_dir_name: &str,
) -> Result<PathBuf> {
    if !xray_path.is_empty() {
        let path = PathBuf::from(xray_path);
        if check_binary_available(&path.to_string_lossy()).await {
            return Ok(path);
        }
        log::warn!("XRAY_PATH={xray_path} set but binary is not runnable");
    }

    if check_binary_available(xray_cmd).await {
        return Ok(PathBuf::from(xray_cmd));
    }

    let local_dir = PathBuf::from(xray_dir_name);
    let local_binary = local_dir.join(binary_name());
    if local_binary.exists() && check_binary_available(&local_binary.to_string_lossy()).await {
        return Ok(local_binary);
    }

    log::info!("xray-core not found locally, downloading latest release into {xray_dir_name}");
    download_latest_release(&local_dir).await?;
    if check_binary_available(&local_binary.to_string_lossy()).await {
        Ok(local_binary)
    } else {
        Err(anyhow!(
            "downloaded xray-core binary at {} is not runnable",
            local_binary.display()
        ))
    }
}

async fn check_binary_available(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn binary_name() -> &'static str {
    "xray.exe"
}

#[cfg(not(windows))]
fn binary_name() -> &'static str {
    "xray"
}

fn platform_asset_name() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Some("Xray-linux-64.zip"),
        ("linux", "x86") => Some("Xray-linux-32.zip"),
        ("linux", "aarch64") => Some("Xray-linux-arm64-v8a.zip"),
        ("macos", "x86_64") => Some("Xray-macos-64.zip"),
        ("macos", "aarch64") => Some("Xray-macos-arm64-v8a.zip"),
        ("windows", "x86_64") => Some("Xray-windows-64.zip"),
        ("windows", "x86") => Some("Xray-windows-32.zip"),
        ("windows", "aarch64") => Some("Xray-windows-arm64-v8a.zip"),
        _ => None,
    }
}

async fn download_latest_release(dest_dir: &Path) -> Result<()> {
    let asset_name = platform_asset_name()
        .ok_or_else(|| anyhow!("no xray-core release asset known for this platform"))?;

    let client = reqwest::Client::builder()
        .user_agent("herscat")
        .build()
        .context("failed to build release-fetch HTTP client")?;

    let release: serde_json::Value = client
        .get("https://api.github.com/repos/XTLS/Xray-core/releases/latest")
        .send()
        .await
        .context("failed to reach GitHub releases API")?
        .error_for_status()
        .context("GitHub releases API returned an error")?
        .json()
        .await
        .context("failed to parse GitHub releases API response")?;

    let asset_url = release["assets"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|a| a["name"].as_str() == Some(asset_name))
        .and_then(|a| a["browser_download_url"].as_str())
        .ok_or_else(|| anyhow!("release asset {asset_name} not found in latest release"))?
        .to_string();

    let bytes = client
        .get(&asset_url)
        .send()
        .await
        .context("failed to download xray-core release asset")?
        .error_for_status()
        .context("xray-core release download returned an error")?
        .bytes()
        .await
        .context("failed to read xray-core release asset body")?;

    tokio::fs::create_dir_all(dest_dir)
        .await
        .context("failed to create xray dist directory")?;

    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_binary(&bytes, &dest_dir))
        .await
        .context("extraction task panicked")??;

    Ok(())
}

fn extract_binary(bytes: &[u8], dest_dir: &Path) -> Result<()> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).context("xray-core asset is not a valid zip")?;
    let target_name = binary_name();
    let mut extracted = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(entry_name) = entry.enclosed_name() else {
            continue;
        };
        let file_name = entry_name
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if file_name != target_name {
            continue;
        }
        let out_path = dest_dir.join(target_name);
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
        set_executable(&out_path)?;
        extracted = true;
        break;
    }

    if !extracted {
        return Err(anyhow!(
            "xray-core archive did not contain expected binary {target_name}"
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_asset_name_covers_common_targets() {
        assert!(platform_asset_name().is_some() || cfg!(target_os = "freebsd"));
    }
}
