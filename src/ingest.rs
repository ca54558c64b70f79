use crate::parser::ProxyKey;
use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use std::collections::{HashSet, VecDeque};
use url::Url;

const MAX_CASCADE_DEPTH: u32 = 3;
const SUBSCRIPTION_PROTOCOLS: &[&str] = &[
    "vless://",
    "vmess://",
    "trojan://",
    "ss://",
    "hysteria://",
    "hysteria2://",
    "hy2://",
];

/// One fetched source: keys found directly on the page/file, plus any
/// nested source references (subscription URLs or file paths) discovered
/// while reading it.
struct CollectedSource {
    keys: Vec<ProxyKey>,
    child_sources: Vec<String>,
}

/// Breadth-first cascading fetch starting from `root`. A source can be a
/// URL or a local file path; both may themselves be subscription pages
/// referencing further sources, up to `MAX_CASCADE_DEPTH` hops away.
/// Keys are deduplicated by their normalized form across the whole walk.
pub async fn load_keys_with_cascade(client: &reqwest::Client, root: &str) -> Result<Vec<ProxyKey>> {
    gather_keys(client, root, true).await
}

/// Same traversal, but logs and skips sources that fail to fetch instead
/// of aborting the whole run — used when merging several lists together.
pub async fn load_merged_keys(client: &reqwest::Client, roots: &[String]) -> Result<Vec<ProxyKey>> {
    let mut seen_links = HashSet::new();
    let mut merged = Vec::new();
    for root in roots {
        match gather_keys(client, root, false).await {
            Ok(keys) => {
                for key in keys {
                    if seen_links.insert(key.normalized.clone()) {
                        merged.push(key);
                    }
                }
            }
            Err(e) => log::warn!("Failed to ingest source {root}: {e}"),
        }
    }
    Ok(merged)
}

async fn gather_keys(client: &reqwest::Client, root: &str, stop_on_error: bool) -> Result<Vec<ProxyKey>> {
    let mut visited = HashSet::new();
    let mut scheduled = HashSet::new();
    let mut seen_links = HashSet::new();
    let mut keys = Vec::new();

    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    let root_id = normalize_source_identifier(root);
    queue.push_back((root_id.clone(), 0));
    scheduled.insert(root_id);

    while let Some((source, depth)) = queue.pop_front() {
        if visited.contains(&source) {
            continue;
        }
        visited.insert(source.clone());

        let collected = match collect_source(client, &source).await {
            Ok(c) => c,
            Err(e) => {
                if stop_on_error {
                    return Err(e);
                }
                log::warn!("Skipping source {source} after fetch failure: {e}");
                continue;
            }
        };

        for key in collected.keys {
            if seen_links.insert(key.normalized.clone()) {
                keys.push(key);
            }
        }

        if depth + 1 > MAX_CASCADE_DEPTH {
            if !collected.child_sources.is_empty() {
                log::debug!(
                    "Cascade depth cap reached at {}, dropping {} nested sources",
                    source,
                    collected.child_sources.len()
                );
            }
            continue;
        }

        for child in collected.child_sources {
            let resolved = resolve_child_source(&source, &child);
            if scheduled.contains(&resolved) {
                continue;
            }
            scheduled.insert(resolved.clone());
            queue.push_back((resolved, depth + 1));
        }
    }

    Ok(keys)
}

async fn collect_source(client: &reqwest::Client, source: &str) -> Result<CollectedSource> {
    let content = if is_url(source) {
        fetch_list(client, source).await?
    } else {
        load_urls_from_file(source)?
    };

    let content = decode_subscription_content(&content);
    parse_lines(&content)
}

fn parse_lines(content: &str) -> Result<CollectedSource> {
    let mut keys = Vec::new();
    let mut child_sources = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if has_protocol_prefix(line) {
            keys.push(ProxyKey::new(line));
        } else if looks_like_path(line) || is_url(line) {
            child_sources.push(line.to_string());
        }
    }

    Ok(CollectedSource {
        keys,
        child_sources,
    })
}

async fn fetch_list(client: &reqwest::Client, url: &str) -> Result<String> {
    validate_fetch_url(url)?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("{url} returned an error status"))?;
    response
        .text()
        .await
        .with_context(|| format!("failed to read body from {url}"))
}

fn validate_fetch_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).with_context(|| format!("invalid source URL: {url}"))?;
    if parsed.scheme().is_empty() || parsed.host_str().is_none() {
        return Err(anyhow!("source URL missing scheme or host: {url}"));
    }
    if url.chars().any(|c| (c as u32) < 32 && c != '\t') {
        return Err(anyhow!("source URL contains control characters: {url}"));
    }
    Ok(())
}

fn load_urls_from_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read source file {path}"))
}

fn has_protocol_prefix(line: &str) -> bool {
    let lower = line.to_lowercase();
    SUBSCRIPTION_PROTOCOLS
        .iter()
        .any(|p| lower.starts_with(p))
}

fn content_has_protocol_lines(content: &str) -> bool {
    content
        .lines()
        .any(|line| has_protocol_prefix(line.trim()))
}

/// A subscription page is frequently one base64 blob rather than plain
/// lines. Try both the standard and URL-safe alphabets and only accept the
/// decoded text if it actually contains proxy links — otherwise the
/// content was plain text to begin with.
fn decode_subscription_content(content: &str) -> String {
    let stripped = content.trim();
    if content_has_protocol_lines(stripped) {
        return content.to_string();
    }

    let compact: String = stripped.split_whitespace().collect();
    if let Ok(bytes) = STANDARD.decode(&compact)
        && let Ok(text) = String::from_utf8(bytes)
        && content_has_protocol_lines(&text)
    {
        return text;
    }
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(&compact)
        && let Ok(text) = String::from_utf8(bytes)
        && content_has_protocol_lines(&text)
    {
        return text;
    }

    content.to_string()
}

fn is_url(s: &str) -> bool {
    Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn looks_like_path(s: &str) -> bool {
    if is_url(s) {
        return false;
    }
    s.contains('/')
        || s.contains('\\')
        || s.ends_with(".txt")
        || s.ends_with(".list")
        || s.ends_with(".urls")
        || s.ends_with(".lst")
}

fn normalize_source_identifier(source: &str) -> String {
    if is_url(source) {
        source.to_string()
    } else {
        std::fs::canonicalize(source)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| source.to_string())
    }
}

fn resolve_child_source(parent: &str, child: &str) -> String {
    if is_url(child) {
        return child.to_string();
    }
    if is_url(parent) {
        if let Ok(base) = Url::parse(parent)
            && let Ok(joined) = base.join(child)
        {
            return joined.to_string();
        }
        return child.to_string();
    }

    let parent_dir = std::path::Path::new(parent)
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."));
    normalize_source_identifier(&parent_dir.join(child).to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_protocol_prefix_recognizes_every_scheme() {
        assert!(has_protocol_prefix("vless://a@b:443"));
        assert!(has_protocol_prefix("HY2://a:b@c:443"));
        assert!(!has_protocol_prefix("not-a-proxy-line"));
    }

    #[test]
    fn decode_subscription_content_unwraps_base64_blob() {
        let raw = "vless://a@b:443\ntrojan://p@c:443\n";
        let encoded = STANDARD.encode(raw);
        let decoded = decode_subscription_content(&encoded);
        assert!(decoded.contains("vless://"));
        assert!(decoded.contains("trojan://"));
    }

    #[test]
    fn decode_subscription_content_leaves_plain_text_alone() {
        let plain = "vless://a@b:443\n# just a comment\n";
        assert_eq!(decode_subscription_content(plain), plain);
    }

    #[test]
    fn decode_subscription_content_rejects_non_proxy_base64() {
        let encoded = STANDARD.encode("just some unrelated text");
        let decoded = decode_subscription_content(&encoded);
        assert_eq!(decoded, encoded);
    }

    #[test]
    fn looks_like_path_detects_file_hints() {
        assert!(looks_like_path("./nested/links.txt"));
        assert!(looks_like_path("sources.list"));
        assert!(!looks_like_path("vless://a@b:443"));
    }

    #[test]
    fn resolve_child_source_joins_relative_url() {
        let resolved = resolve_child_source(
            "https://example.com/lists/root.txt",
            "child.txt",
        );
        assert_eq!(resolved, "https://example.com/lists/child.txt");
    }

    #[test]
    fn parse_lines_splits_keys_from_child_sources() {
        let content = "vless://a@b:443\nhttps://example.com/more.txt\n# comment\n";
        let collected = parse_lines(content).unwrap();
        assert_eq!(collected.keys.len(), 1);
        assert_eq!(collected.child_sources, vec!["https://example.com/more.txt"]);
    }
}
