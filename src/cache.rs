use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: bool,
    pub timestamp: u64,
}

/// Verdict cache keyed by a truncated hash of the raw proxy line, so a
/// result survives a restart without pinning us to the full (potentially
/// huge) link as a JSON map key.
#[derive(Debug, Default)]
pub struct VerdictCache {
    entries: HashMap<String, CacheEntry>,
}

impl VerdictCache {
    pub fn load(path: &Path, ttl_seconds: u64) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return VerdictCache::default();
        };
        let raw: HashMap<String, CacheEntry> = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to parse cache file {}: {e}", path.display());
                return VerdictCache::default();
            }
        };

        let now = now_unix();
        let entries = raw
            .into_iter()
            .filter(|(_, entry)| now.saturating_sub(entry.timestamp) <= ttl_seconds)
            .collect();
        VerdictCache { entries }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(path, body)?;
        Ok(())
    }

    pub fn check(&self, line: &str) -> Option<bool> {
        self.entries.get(&key_hash(line)).map(|e| e.result)
    }

    pub fn record(&mut self, line: &str, result: bool) {
        self.entries.insert(
            key_hash(line),
            CacheEntry {
                result,
                timestamp: now_unix(),
            },
        );
    }
}

pub fn key_hash(line: &str) -> String {
    let digest = Sha256::digest(line.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(chars);
    out
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("herscat_test_{}_{name}", std::process::id()))
    }

    #[test]
    fn key_hash_is_stable_and_truncated() {
        let h1 = key_hash("vless://a@b:443");
        let h2 = key_hash("vless://a@b:443");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn record_and_check_roundtrip() {
        let mut cache = VerdictCache::default();
        cache.record("vless://a@b:443", true);
        assert_eq!(cache.check("vless://a@b:443"), Some(true));
        assert_eq!(cache.check("vless://other@b:443"), None);
    }

    #[test]
    fn save_and_load_roundtrip_within_ttl() {
        let path = temp_path("cache.json");
        let mut cache = VerdictCache::default();
        cache.record("vless://a@b:443", false);
        cache.save(&path).unwrap();

        let loaded = VerdictCache::load(&path, 3600);
        assert_eq!(loaded.check("vless://a@b:443"), Some(false));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expired_entries_are_dropped_on_load() {
        let path = temp_path("cache_ttl.json");
        let mut entries = HashMap::new();
        entries.insert(
            key_hash("vless://a@b:443"),
            CacheEntry {
                result: true,
                timestamp: 1,
            },
        );
        std::fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let loaded = VerdictCache::load(&path, 3600);
        assert_eq!(loaded.check("vless://a@b:443"), None);

        let _ = std::fs::remove_file(&path);
    }
}
