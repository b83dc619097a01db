//! Loads `docdb_core::CoreConfig` from an optional TOML file, then layers
//! CLI overrides on top: defaults < file < flags.

use std::path::Path;

use anyhow::{Context, Result};
use docdb_core::CoreConfig;
use serde::Deserialize;

use crate::cli::CliOpts;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
	data_dir: Option<std::path::PathBuf>,
	socket_path: Option<std::path::PathBuf>,
	debug_mode: Option<bool>,
	max_connections: Option<usize>,
	queue_depth: Option<usize>,
	max_total_queued: Option<i64>,
	configured_workers: Option<usize>,
	max_workers: Option<usize>,
	worker_idle_expiry_ms: Option<u64>,
	memory_global_capacity_mb: Option<u64>,
	memory_per_db_limit_mb: Option<u64>,
	query_timeout_secs: Option<u64>,
}

pub fn load(cli: &CliOpts) -> Result<CoreConfig> {
	let mut config = CoreConfig::default();
	config.data_dir = default_data_dir();

	if let Some(path) = &cli.config {
		let toml_conf = parse_file(path)?;
		apply(&mut config, toml_conf);
	}

	if let Some(dir) = &cli.data_dir {
		config.data_dir = dir.clone();
	}
	if let Some(socket) = &cli.socket {
		config.socket_path = socket.clone();
	}
	if let Some(workers) = cli.workers {
		config.configured_workers = workers;
	}

	Ok(config)
}

/// Platform-local data directory used when neither a config file nor
/// `--data-dir` names one: `$XDG_DATA_HOME/docdb` on Linux, the analogous
/// per-OS app-data directory elsewhere. Falls back to `./data` if the OS
/// reports no home directory at all.
fn default_data_dir() -> std::path::PathBuf {
	match dirs::BaseDirs::new() {
		Some(base) => base.data_local_dir().join("docdb"),
		None => std::path::PathBuf::from("./data"),
	}
}

fn parse_file(path: &Path) -> Result<TomlConfig> {
	let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
	toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

fn apply(config: &mut CoreConfig, toml: TomlConfig) {
	if let Some(v) = toml.data_dir {
		config.data_dir = v;
	}
	if let Some(v) = toml.socket_path {
		config.socket_path = v;
	}
	if let Some(v) = toml.debug_mode {
		config.debug_mode = v;
	}
	if let Some(v) = toml.max_connections {
		config.max_connections = v;
	}
	if let Some(v) = toml.queue_depth {
		config.queue_depth = v;
	}
	if let Some(v) = toml.max_total_queued {
		config.max_total_queued = v;
	}
	if let Some(v) = toml.configured_workers {
		config.configured_workers = v;
	}
	if let Some(v) = toml.max_workers {
		config.max_workers = v;
	}
	if let Some(v) = toml.worker_idle_expiry_ms {
		config.worker_idle_expiry_ms = v;
	}
	if let Some(v) = toml.memory_global_capacity_mb {
		config.memory.global_capacity_mb = v;
	}
	if let Some(v) = toml.memory_per_db_limit_mb {
		config.memory.per_db_limit_mb = v;
	}
	if let Some(v) = toml.query_timeout_secs {
		config.query.query_timeout_secs = v;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn opts() -> CliOpts {
		CliOpts { config: None, data_dir: None, socket: None, verbose: 0, workers: None }
	}

	#[test]
	fn no_file_uses_defaults() {
		let config = load(&opts()).unwrap();
		assert_eq!(config.queue_depth, CoreConfig::default().queue_depth);
		assert!(config.data_dir.ends_with("docdb") || config.data_dir == std::path::PathBuf::from("./data"));
	}

	#[test]
	fn explicit_data_dir_overrides_platform_default() {
		let mut cli = opts();
		cli.data_dir = Some(std::path::PathBuf::from("/tmp/explicit-docdb"));
		let config = load(&cli).unwrap();
		assert_eq!(config.data_dir, std::path::PathBuf::from("/tmp/explicit-docdb"));
	}

	#[test]
	fn file_values_are_overridden_by_cli() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("docdb.toml");
		std::fs::write(&file, "queue_depth = 7\nmax_workers = 9\n").unwrap();

		let mut cli = opts();
		cli.config = Some(file);
		cli.workers = Some(3);

		let config = load(&cli).unwrap();
		assert_eq!(config.queue_depth, 7);
		assert_eq!(config.max_workers, 9);
		assert_eq!(config.configured_workers, 3);
	}
}
