//! Colored dual stdout/file logging built on `fern`, shared by every
//! crate target.

use std::io;
use std::path::Path;

use fern::colors::{Color, ColoredLevelConfig};

pub fn init(std_level: log::LevelFilter, file_level: log::LevelFilter, log_dir: &Path) -> io::Result<()> {
	let colors = ColoredLevelConfig::new().info(Color::Green).warn(Color::Yellow).error(Color::Red).debug(Color::Blue).trace(Color::Magenta);

	std::fs::create_dir_all(log_dir)?;
	let log_file = log_dir.join("docdb-server.log");

	let stdout_dispatch = fern::Dispatch::new()
		.level(std_level)
		.level_for("async_std", log::LevelFilter::Warn)
		.format(move |out, message, record| {
			out.finish(format_args!("{} {} {}", chrono::Local::now().format("[%H:%M:%S]"), colors.color(record.level()), message))
		})
		.chain(std::io::stdout());

	let file_dispatch = fern::Dispatch::new()
		.level(file_level)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{}][{}] {}",
				chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
				record.target(),
				record.level(),
				message,
			))
		})
		.chain(fern::log_file(log_file)?);

	fern::Dispatch::new().chain(stdout_dispatch).chain(file_dispatch).apply().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
	Ok(())
}
