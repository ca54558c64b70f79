use crate::checker::LiveRegistry;
use futures::future::Future;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Runs `items` through `task` with at most `max_workers` in flight at
/// once. Once `cancelled` flips, no new task is dispatched; tasks already
/// running are left to finish their own kill sequence (a probe's cleanup
/// is unconditional regardless of cancellation — see `checker::check_key_e2e`).
pub async fn run_pool<T, R, F, Fut>(
    items: Vec<T>,
    max_workers: usize,
    cancelled: Arc<AtomicBool>,
    task: F,
) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let task = Arc::new(task);
    stream::iter(items)
        .map(move |item| {
            let task = task.clone();
            let cancelled = cancelled.clone();
            async move {
                if cancelled.load(Ordering::SeqCst) {
                    return None;
                }
                Some(task(item).await)
            }
        })
        .buffer_unordered(max_workers.max(1))
        .filter_map(|r| async move { r })
        .collect()
        .await
}

/// Shared cancellation flag plus everything the signal handler needs to
/// kill in-flight relays and flush whatever survived so far.
pub struct CancellationGuard {
    pub cancelled: Arc<AtomicBool>,
}

impl CancellationGuard {
    /// Installs SIGINT/SIGTERM (Ctrl+C on non-unix) handling that flips
    /// `cancelled`, force-kills every relay still in `live` by PID, and
    /// writes whatever is in `partial_results` to `<output>_partial<ext>`.
    /// Mirrors the original's global signal handler plus its atexit
    /// cleanup, collapsed into one async task since tokio owns the signal
    /// loop here instead of the process's default handler.
    pub fn install(
        live: LiveRegistry,
        partial_results: Arc<Mutex<Vec<String>>>,
        output_path: PathBuf,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_task = cancelled.clone();

        tokio::spawn(async move {
            wait_for_termination().await;
            cancelled_task.store(true, Ordering::SeqCst);
            log::warn!("Interrupt received, shutting down gracefully...");
            kill_all(&live).await;
            let results = partial_results.lock().await;
            if let Err(e) = save_partial_results(&output_path, &results) {
                log::error!("Failed to save partial results: {e}");
            }
        });

        CancellationGuard { cancelled }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn kill_all(live: &LiveRegistry) {
    let pids: Vec<u32> = live.lock().await.iter().copied().collect();
    for pid in pids {
        kill_pid(pid);
    }
    live.lock().await.clear();
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status();
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

/// Writes the raw proxy URIs collected so far — deliberately not the
/// latency-annotated/metadata-formatted lines the normal run produces,
/// since a partial flush is a best-effort rescue, not a final result.
fn save_partial_results(output_path: &Path, lines: &[String]) -> anyhow::Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "available".to_string());
    let ext = output_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = output_path.parent().unwrap_or_else(|| Path::new(""));
    let partial_path = parent.join(format!("{stem}_partial{ext}"));

    if let Some(dir) = partial_path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&partial_path, lines.join("\n"))?;
    log::info!("Partial results saved to {}", partial_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn run_pool_processes_every_item_without_cancellation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));
        let items: Vec<u32> = (0..10).collect();
        let counter_clone = counter.clone();
        let results = run_pool(items, 4, cancelled, move |n| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                n * 2
            }
        })
        .await;
        assert_eq!(results.len(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn run_pool_skips_dispatch_once_cancelled() {
        let cancelled = Arc::new(AtomicBool::new(true));
        let items = vec![1, 2, 3];
        let results = run_pool(items, 2, cancelled, |n| async move { n }).await;
        assert!(results.is_empty());
    }

    #[test]
    fn save_partial_results_inserts_suffix_before_extension() {
        let dir = std::env::temp_dir().join(format!("herscat_pool_{}", std::process::id()));
        let out = dir.join("available.txt");
        save_partial_results(&out, &["vless://a@b:443".to_string()]).unwrap();
        let content = std::fs::read_to_string(dir.join("available_partial.txt")).unwrap();
        assert_eq!(content, "vless://a@b:443");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
