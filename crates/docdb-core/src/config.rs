//! Configuration options, independent of how a driver obtains them (TOML
//! file, CLI flags, ...). `docdb-server` owns parsing; this module owns the
//! shape and the translation into `PoolConfig` / `SchedulerConfig`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
	pub global_capacity_mb: u64,
	pub per_db_limit_mb: u64,
}

impl Default for MemoryConfig {
	fn default() -> Self {
		Self { global_capacity_mb: 4096, per_db_limit_mb: 256 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
	pub query_timeout_secs: u64,
}

impl Default for QueryConfig {
	fn default() -> Self {
		Self { query_timeout_secs: 30 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
	pub data_dir: PathBuf,
	pub socket_path: PathBuf,
	pub debug_mode: bool,
	/// 0 = unlimited.
	pub max_connections: usize,
	pub queue_depth: usize,
	/// 0 = disabled.
	pub max_total_queued: i64,
	/// 0 = autoscale.
	pub configured_workers: usize,
	pub max_workers: usize,
	pub worker_idle_expiry_ms: u64,
	pub memory: MemoryConfig,
	pub query: QueryConfig,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("./data"),
			socket_path: PathBuf::from("./docdb.sock"),
			debug_mode: false,
			max_connections: 0,
			queue_depth: 1024,
			max_total_queued: 0,
			configured_workers: 0,
			max_workers: 64,
			worker_idle_expiry_ms: 1000,
			memory: MemoryConfig::default(),
			query: QueryConfig::default(),
		}
	}
}

impl CoreConfig {
	pub fn scheduler_config(&self) -> SchedulerConfig {
		SchedulerConfig {
			queue_depth: self.queue_depth,
			max_total_queued: self.max_total_queued,
			configured_workers: self.configured_workers,
			max_workers: self.max_workers,
			worker_idle_expiry: Duration::from_millis(self.worker_idle_expiry_ms),
		}
	}

	pub fn pool_config(&self) -> PoolConfig {
		PoolConfig {
			data_dir: self.data_dir.clone(),
			default_db_memory_limit_bytes: (self.memory.per_db_limit_mb * 1024 * 1024) as i64,
			global_memory_capacity_bytes: (self.memory.global_capacity_mb * 1024 * 1024) as i64,
			query_timeout: Duration::from_secs(self.query.query_timeout_secs),
			scheduler: self.scheduler_config(),
			..Default::default()
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn defaults_translate_to_consistent_pool_config() {
		let cfg = CoreConfig::default();
		let pool_cfg = cfg.pool_config();
		assert_eq!(pool_cfg.global_memory_capacity_bytes, 4096 * 1024 * 1024);
		assert_eq!(pool_cfg.default_db_memory_limit_bytes, 256 * 1024 * 1024);
		assert_eq!(pool_cfg.scheduler.queue_depth, 1024);
	}

	#[test]
	fn json_round_trips() {
		let cfg = CoreConfig::default();
		let text = serde_json::to_string(&cfg).unwrap();
		let back: CoreConfig = serde_json::from_str(&text).unwrap();
		assert_eq!(back.queue_depth, cfg.queue_depth);
	}
}
