// beeagent-core/src/commands/init.rs

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::logbook::write_atomic;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

/// Ensure the agent root has its directory layout and a config file.
/// Idempotent: existing files are never overwritten.
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(root, "", &mut created, &mut existed)?;

    ensure_file(
        root,
        "config.toml",
        Some(DEFAULT_CONFIG_TOML),
        &mut created,
        &mut existed,
    )?;

    initialize_logbook_files(root, &mut created, &mut existed)?;

    Ok(InitReport {
        root: root.to_path_buf(),
        created,
        existed,
    })
}

fn ensure_dir(
    base: &Path,
    rel: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let name = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(name);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(name);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: Option<&str>,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    write_atomic(&p, content_if_absent.unwrap_or("").as_bytes())?;
    created.push(rel_file.to_string());
    Ok(())
}

fn ensure_seeded_jsonl(
    dir: &Path,
    rel_file: &str,
    init_line: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = dir.join(rel_file);
    if !p.exists() {
        return ensure_file(dir, rel_file, Some(&format!("{init_line}\n")), created, existed);
    }
    existed.push(rel_file.to_string());
    // Present but empty: seed it.
    if fs::metadata(&p)?.len() == 0 {
        let mut f = OpenOptions::new().append(true).open(&p)?;
        f.write_all(init_line.as_bytes())?;
        f.write_all(b"\n")?;
    }
    Ok(())
}

fn initialize_logbook_files(
    root: &Path,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let init_event = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "event": "system_init",
        "data": { "version": env!("CARGO_PKG_VERSION") }
    })
    .to_string();

    ensure_dir(root, "logbook", created, existed)?;
    for stream in ["logbook/events.jsonl", "logbook/actions.jsonl", "logbook/reviews.jsonl"] {
        ensure_seeded_jsonl(root, stream, &init_event, created, existed)?;
    }
    Ok(())
}

// ---------- defaults ----------

pub const DEFAULT_CONFIG_TOML: &str = r#"[system]
name = "beeagent"
version = "0.1.0"

[storage]
db_path = "beeagent.db"
busy_timeout_ms = 5000

[agent]
workers = 1
idle_pause_ms = 5000
busy_pause_ms = 100
error_backoff_ms = 1000
status_interval_secs = 10

[scoring]
min_confidence = 0.6
temperature_min = 5.0
temperature_max = 40.0
min_strength = 3
exploration_rate = 0.05

[retrain]
gold_threshold = 10
enabled = true
check_interval_secs = 60
claim_timeout_secs = 1800

[logbook]
enabled = true
path = "logbook"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("agent");
        let first = ensure_initialized(&root).unwrap();
        assert!(first.created.contains(&"config.toml".to_string()));
        assert!(root.join("logbook").join("events.jsonl").exists());

        let second = ensure_initialized(&root).unwrap();
        assert!(second.created.is_empty());
        assert!(second.existed.contains(&"config.toml".to_string()));
    }

    #[test]
    fn default_config_parses_and_validates() {
        let cfg: CoreConfig = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.retrain.gold_threshold, 10);
    }
}
