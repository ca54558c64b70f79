use crate::parser::ProxyKey;
use std::collections::HashMap;
use std::path::Path;

/// Known-bad proxy links persisted between runs. Keyed by normalized link
/// so whitespace/fragment noise doesn't create duplicate entries; values
/// hold the full original line (comments and any trailing metadata) so a
/// re-save doesn't lose information the user might have annotated.
#[derive(Debug, Default)]
pub struct NotworkersSet {
    lines: HashMap<String, String>,
}

impl NotworkersSet {
    pub fn load(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return NotworkersSet::default();
        };
        let mut lines = HashMap::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = ProxyKey::new(trimmed);
            lines.insert(key.normalized, trimmed.to_string());
        }
        NotworkersSet { lines }
    }

    pub fn contains(&self, link: &str) -> bool {
        self.lines.contains_key(&ProxyKey::normalize(link))
    }

    /// Rebuilds the set as `(existing ∪ dead_this_run) \ alive_this_run`,
    /// preserving the original line text wherever it is known, and
    /// returns `(added, removed)` counts for logging.
    pub fn reconcile(
        &mut self,
        dead_this_run: &[ProxyKey],
        alive_this_run: &[ProxyKey],
    ) -> (usize, usize) {
        let alive: std::collections::HashSet<&str> = alive_this_run
            .iter()
            .map(|k| k.normalized.as_str())
            .collect();

        let before = self.lines.len();
        self.lines.retain(|key, _| !alive.contains(key.as_str()));
        let removed = before - self.lines.len();

        let mut added = 0;
        for key in dead_this_run {
            if alive.contains(key.normalized.as_str()) {
                continue;
            }
            if self
                .lines
                .insert(key.normalized.clone(), key.full_line.clone())
                .is_none()
            {
                added += 1;
            }
        }

        (added, removed)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut keys: Vec<&String> = self.lines.keys().collect();
        keys.sort();
        let body = keys
            .into_iter()
            .map(|k| self.lines[k].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(path, body + "\n")?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_adds_dead_and_drops_alive() {
        let mut set = NotworkersSet::default();
        set.lines.insert(
            ProxyKey::normalize("vless://stale@host:443"),
            "vless://stale@host:443".to_string(),
        );

        let dead = vec![ProxyKey::new("vless://new-dead@host:443")];
        let alive = vec![ProxyKey::new("vless://stale@host:443")];

        let (added, removed) = set.reconcile(&dead, &alive);
        assert_eq!(added, 1);
        assert_eq!(removed, 1);
        assert!(set.contains("vless://new-dead@host:443"));
        assert!(!set.contains("vless://stale@host:443"));
    }

    #[test]
    fn contains_ignores_fragment_and_prefix() {
        let mut set = NotworkersSet::default();
        let key = ProxyKey::new("vless://id@host:443#display");
        set.lines.insert(key.normalized, key.full_line);
        assert!(set.contains("[88ms] vless://id@host:443#other-display"));
    }
}
