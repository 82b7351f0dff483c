//! Loading of the user-authored configuration directory.
//!
//! Three split files live there: `proxy.yaml` (the routing table, required),
//! `cors.yaml` and `logs.yaml` (optional, inner objects without an outer
//! key). Older installs shipped a single `config.yaml` mixing all three;
//! [`prepare`] migrates that form once, preserving the operator's comments,
//! and materializes any missing split file from the shipped examples.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::info;

const LEGACY_CONFIG_YAML: &str = "config.yaml";
const LEGACY_CONFIG_YML: &str = "config.yml";

pub const PROXY_CONFIG_FILE: &str = "proxy.yaml";
pub const CORS_CONFIG_FILE: &str = "cors.yaml";
pub const LOGS_CONFIG_FILE: &str = "logs.yaml";

const PROXY_EXAMPLE_FILE: &str = "proxy.example.yaml";
const CORS_EXAMPLE_FILE: &str = "cors.example.yaml";
const LOGS_EXAMPLE_FILE: &str = "logs.example.yaml";

/// Mapping key → ordered DomainPath list.
pub type RoutingTable = BTreeMap<String, Vec<String>>;

/// CORS settings for one host (or the `*` wildcard). Zero values mean
/// "use the built-in default" and are resolved by the renderer.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct CorsConfig {
    #[serde(default)]
    pub allow_origin: String,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub max_age: u64,
    #[serde(default)]
    pub allow_credentials: bool,
}

/// Log level for a single component. Empty means `info`.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct LogLevelConfig {
    #[serde(default)]
    pub level: String,
}

/// Log configuration for the proxy child process.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct NginxLogConfig {
    /// Display level for the `nginx` log target (default `info`).
    #[serde(default)]
    pub level: String,
    /// Level nginx stderr lines are treated as: `warn` or `error`
    /// (default `error`).
    #[serde(default)]
    pub stderr_as: String,
    /// Level nginx stderr lines are displayed as (default: same as
    /// `stderr_as`).
    #[serde(default)]
    pub stderr_show: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    #[serde(default)]
    pub sslly: LogLevelConfig,
    #[serde(default)]
    pub nginx: NginxLogConfig,
}

/// The fully-loaded configuration directory.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub log: LogConfig,
    pub cors: BTreeMap<String, CorsConfig>,
    pub ports: RoutingTable,
}

/// Split a DomainPath at the first `/`: everything before is the base host
/// (certificate lookup, virtual-host matching); the rest, including the
/// slash, is the location path.
pub fn split_domain_path(domain_path: &str) -> (&str, &str) {
    match domain_path.find('/') {
        Some(idx) if idx > 0 => (&domain_path[..idx], &domain_path[idx..]),
        _ => (domain_path, ""),
    }
}

/// Lowercased base hosts referenced anywhere in the routing table.
pub fn collect_base_hosts(ports: &RoutingTable) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for domain_paths in ports.values() {
        for domain_path in domain_paths {
            let (host, _) = split_domain_path(domain_path);
            let host = host.trim().to_lowercase();
            if !host.is_empty() {
                out.insert(host);
            }
        }
    }
    out
}

/// Load the configuration directory, running [`prepare`] first.
pub fn load(config_dir: &Path, example_dir: &Path) -> Result<Config> {
    prepare(config_dir, example_dir)?;

    let proxy_path = config_dir.join(PROXY_CONFIG_FILE);
    let proxy_data = std::fs::read_to_string(&proxy_path)
        .with_context(|| format!("failed to read {PROXY_CONFIG_FILE}"))?;

    let raw: BTreeMap<String, serde_yaml::Value> = if proxy_data.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_yaml::from_str(&proxy_data)
            .with_context(|| format!("failed to parse {PROXY_CONFIG_FILE}"))?
    };

    let mut ports = RoutingTable::new();
    for (key, value) in raw {
        // The reserved keys never become routes, even when a stray legacy
        // file leaks them into proxy.yaml.
        if key == "cors" || key == "log" {
            continue;
        }
        let domain_paths: Vec<String> = serde_yaml::from_value(value).with_context(|| {
            format!("failed to parse {PROXY_CONFIG_FILE}: key {key:?} must map to a list of domains")
        })?;
        ports.insert(key, domain_paths);
    }

    if ports.is_empty() {
        bail!("config is empty or invalid ({PROXY_CONFIG_FILE} has no proxy mappings)");
    }

    let mut config = Config {
        ports,
        ..Config::default()
    };

    let logs_path = config_dir.join(LOGS_CONFIG_FILE);
    if let Ok(data) = std::fs::read_to_string(&logs_path) {
        if !data.trim().is_empty() {
            config.log = serde_yaml::from_str(&data)
                .with_context(|| format!("failed to parse {LOGS_CONFIG_FILE}"))?;
        }
    }

    let cors_path = config_dir.join(CORS_CONFIG_FILE);
    if let Ok(data) = std::fs::read_to_string(&cors_path) {
        if !data.trim().is_empty() {
            config.cors = serde_yaml::from_str(&data)
                .with_context(|| format!("failed to parse {CORS_CONFIG_FILE}"))?;
        }
    }

    Ok(config)
}

/// Make the configuration directory ready for loading:
/// - a legacy `config.yaml` / `config.yml` is migrated to the split files;
/// - missing split files are created from the example directory.
///
/// Running this on an already-prepared directory is a no-op.
pub fn prepare(config_dir: &Path, example_dir: &Path) -> Result<()> {
    migrate_legacy_config_if_present(config_dir, example_dir)?;
    ensure_split_config_files(config_dir, example_dir)
}

fn file_exists(path: &Path) -> bool {
    path.is_file()
}

fn migrate_legacy_config_if_present(config_dir: &Path, example_dir: &Path) -> Result<()> {
    let legacy_path = [LEGACY_CONFIG_YAML, LEGACY_CONFIG_YML]
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| file_exists(p));
    let Some(legacy_path) = legacy_path else {
        return Ok(());
    };

    let proxy_path = config_dir.join(PROXY_CONFIG_FILE);
    let cors_path = config_dir.join(CORS_CONFIG_FILE);
    let logs_path = config_dir.join(LOGS_CONFIG_FILE);

    let any_split_exists =
        file_exists(&proxy_path) || file_exists(&cors_path) || file_exists(&logs_path);
    if !any_split_exists {
        let legacy_name = legacy_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = std::fs::read_to_string(&legacy_path)
            .with_context(|| format!("failed to read legacy config {legacy_name}"))?;

        // Validate it actually parses before carving it apart.
        let _: serde_yaml::Value = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse legacy config {legacy_name}"))?;

        let split = split_legacy_document(&data);
        if let Some(cors) = split.cors {
            if !file_exists(&cors_path) {
                write_config_file(&cors_path, &cors)?;
            }
        }
        if let Some(logs) = split.logs {
            if !file_exists(&logs_path) {
                write_config_file(&logs_path, &logs)?;
            }
        }
        if !file_exists(&proxy_path) {
            write_config_file(&proxy_path, &split.proxy)?;
        }
    }

    // Make sure files the legacy document didn't cover exist too.
    ensure_split_config_files(config_dir, example_dir)?;

    // Finally park the legacy file under a backup name.
    let ext = legacy_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("yaml");
    let mut backup_path = config_dir.join(format!("config.backup.{ext}"));
    if file_exists(&backup_path) {
        let ts = utc_compact_timestamp();
        backup_path = config_dir.join(format!("config.backup.{ts}.{ext}"));
    }
    std::fs::rename(&legacy_path, &backup_path).with_context(|| {
        format!(
            "failed to rename legacy config to {}",
            backup_path.display()
        )
    })?;
    info!(
        from = %legacy_path.display(),
        to = %backup_path.display(),
        "migrated legacy config to split files"
    );
    Ok(())
}

fn utc_compact_timestamp() -> String {
    let fmt = time::macros::format_description!("[year][month][day]T[hour][minute][second]Z");
    time::OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| "00000000T000000Z".to_string())
}

struct SplitDocuments {
    proxy: String,
    cors: Option<String>,
    logs: Option<String>,
}

/// Carve the `cors:` and `log:` top-level blocks out of the legacy document
/// text. Working on the raw text (instead of a parsed tree) keeps the
/// operator's comments: lines directly above a block move with it, and the
/// extracted block is dedented so the new file holds only the inner object.
fn split_legacy_document(data: &str) -> SplitDocuments {
    let lines: Vec<&str> = data.lines().collect();

    let is_top_level_key = |line: &str| -> Option<String> {
        let first = line.chars().next()?;
        if first.is_whitespace() || first == '#' || first == '-' {
            return None;
        }
        let colon = line.find(':')?;
        Some(line[..colon].trim().trim_matches('"').to_string())
    };

    let mut key_lines: Vec<(usize, String)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(key) = is_top_level_key(line) {
            key_lines.push((i, key));
        }
    }

    let mut taken = vec![false; lines.len()];
    let mut cors = None;
    let mut logs = None;

    for (pos, (start, key)) in key_lines.iter().enumerate() {
        if key != "cors" && key != "log" {
            continue;
        }
        let next_start = key_lines
            .get(pos + 1)
            .map(|(i, _)| *i)
            .unwrap_or(lines.len());

        // Body runs until the next top-level key; the trailing comment and
        // blank run belongs to the next block as its head comment.
        let mut end = next_start;
        while end > start + 1 {
            let trimmed = lines[end - 1].trim();
            if trimmed.is_empty() || (trimmed.starts_with('#') && !lines[end - 1].starts_with(' '))
            {
                end -= 1;
            } else {
                break;
            }
        }

        // Head comments: contiguous comment/blank lines directly above.
        let mut head = *start;
        while head > 0 {
            let trimmed = lines[head - 1].trim();
            if (trimmed.starts_with('#') || trimmed.is_empty()) && !taken[head - 1] {
                head -= 1;
            } else {
                break;
            }
        }

        for flag in taken.iter_mut().take(end).skip(head) {
            *flag = true;
        }

        let extracted = extract_inner_block(&lines[head..end], *start - head);
        if key == "cors" {
            cors = Some(extracted);
        } else {
            logs = Some(extracted);
        }
    }

    let proxy = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| !taken[*i])
        .map(|(_, l)| *l)
        .collect::<Vec<_>>()
        .join("\n");
    let mut proxy = proxy.trim_start_matches('\n').to_string();
    if !proxy.is_empty() && !proxy.ends_with('\n') {
        proxy.push('\n');
    }

    SplitDocuments { proxy, cors, logs }
}

/// Turn a `key:` block (head comments + key line + indented body) into the
/// standalone inner document: head comments kept, key line dropped (its
/// inline comment re-homed as a head comment), body dedented one level.
fn extract_inner_block(block: &[&str], key_idx: usize) -> String {
    let mut out: Vec<String> = Vec::new();

    for line in &block[..key_idx] {
        out.push((*line).to_string());
    }

    let key_line = block[key_idx];
    if let Some(colon) = key_line.find(':') {
        let after = key_line[colon + 1..].trim();
        if let Some(comment) = after.strip_prefix('#') {
            out.push(format!("# {}", comment.trim()));
        } else if !after.is_empty() {
            // Inline value (e.g. `log: {}`): it already is the inner object.
            out.push(after.to_string());
        }
    }

    let body: Vec<&str> = block[key_idx + 1..].to_vec();
    let indent = body
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    for line in body {
        if line.trim().is_empty() {
            out.push(String::new());
        } else if line.len() >= indent {
            out.push(line[indent..].to_string());
        } else {
            out.push(line.trim_start().to_string());
        }
    }

    let mut doc = out.join("\n");
    while doc.ends_with('\n') {
        doc.pop();
    }
    doc.push('\n');
    doc
}

fn ensure_split_config_files(config_dir: &Path, example_dir: &Path) -> Result<()> {
    ensure_file_from_example(config_dir, example_dir, PROXY_CONFIG_FILE, PROXY_EXAMPLE_FILE)?;
    ensure_file_from_example(config_dir, example_dir, CORS_CONFIG_FILE, CORS_EXAMPLE_FILE)?;
    ensure_file_from_example(config_dir, example_dir, LOGS_CONFIG_FILE, LOGS_EXAMPLE_FILE)?;
    Ok(())
}

fn ensure_file_from_example(
    config_dir: &Path,
    example_dir: &Path,
    filename: &str,
    example_filename: &str,
) -> Result<PathBuf> {
    let dst = config_dir.join(filename);
    if file_exists(&dst) {
        return Ok(dst);
    }

    let example_path = example_dir.join(example_filename);
    if file_exists(&example_path) {
        let data = std::fs::read(&example_path)
            .with_context(|| format!("failed to read example {example_filename}"))?;
        std::fs::create_dir_all(config_dir)?;
        std::fs::write(&dst, data).with_context(|| format!("failed to write {filename}"))?;
        info!(file = filename, "materialized missing config from example");
        return Ok(dst);
    }

    // proxy.yaml is required; never silently create an empty routing table.
    if filename == PROXY_CONFIG_FILE {
        bail!(
            "missing required {PROXY_CONFIG_FILE} and no example found at {}",
            example_path.display()
        );
    }

    std::fs::create_dir_all(config_dir)?;
    std::fs::write(&dst, b"").with_context(|| format!("failed to write {filename}"))?;
    Ok(dst)
}

fn write_config_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}
