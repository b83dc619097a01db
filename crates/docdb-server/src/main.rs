mod cli;
mod config;
mod logger;
mod memory_engine;
mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use docdb_core::{MemoryCaps, Pool};

use cli::CliOpts;
use memory_engine::MemoryEngine;

fn main() -> Result<()> {
	let cli = CliOpts::parse_args();
	let config = config::load(&cli)?;

	logger::init(cli.log_level(), log::LevelFilter::Debug, &config.data_dir.join("logs"))?;
	log::info!("starting docdb-server, data_dir={}", config.data_dir.display());

	let memcaps = Arc::new(MemoryCaps::new((config.memory.global_capacity_mb * 1024 * 1024) as i64));
	let engine = Arc::new(MemoryEngine::new(memcaps.clone()));
	let pool = Pool::new(config.pool_config(), engine, memcaps)?;
	pool.start();

	let shutdown = Arc::new(AtomicBool::new(false));
	let shutdown_handler = shutdown.clone();
	ctrlc::set_handler(move || {
		log::info!("received interrupt, beginning graceful shutdown");
		shutdown_handler.store(true, Ordering::SeqCst);
	})?;

	let config = Arc::new(config);
	let socket_path = config.socket_path.clone();
	let result = async_std::task::block_on(server::serve(config, pool.clone(), &socket_path, shutdown));

	pool.stop();
	let _ = std::fs::remove_file(&socket_path);
	log::info!("docdb-server stopped");
	result
}
