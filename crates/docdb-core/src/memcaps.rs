//! Global and per-DB byte accounting; admission decisions (C3). All
//! counters are atomic; there is no lock on the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::DbId;

struct PerDb {
	usage: AtomicI64,
	limit: i64,
}

pub struct MemoryCaps {
	global_capacity: i64,
	global_usage: AtomicI64,
	per_db: RwLock<HashMap<DbId, PerDb>>,
}

impl MemoryCaps {
	pub fn new(global_capacity_bytes: i64) -> Self {
		Self { global_capacity: global_capacity_bytes, global_usage: AtomicI64::new(0), per_db: RwLock::new(HashMap::new()) }
	}

	pub fn register_db(&self, id: DbId, limit_bytes: i64) {
		self.per_db.write().unwrap().insert(id, PerDb { usage: AtomicI64::new(0), limit: limit_bytes });
	}

	pub fn unregister_db(&self, id: DbId) {
		if let Some(per_db) = self.per_db.write().unwrap().remove(&id) {
			let freed = per_db.usage.load(Ordering::SeqCst);
			if freed > 0 {
				self.global_usage.fetch_sub(freed, Ordering::SeqCst);
			}
		}
	}

	/// Reserve `bytes` against both the per-DB and global caps. Returns
	/// `MemoryLimit` (and reserves nothing) if either cap would be
	/// exceeded.
	pub fn reserve(&self, id: DbId, bytes: i64) -> Result<()> {
		let per_db_guard = self.per_db.read().unwrap();
		let per_db = per_db_guard.get(&id).ok_or_else(|| Error::NotFound(format!("db {id} has no registered memory cap")))?;

		let new_db_usage = per_db.usage.fetch_add(bytes, Ordering::SeqCst) + bytes;
		if new_db_usage > per_db.limit {
			per_db.usage.fetch_sub(bytes, Ordering::SeqCst);
			return Err(Error::MemoryLimit);
		}

		let new_global_usage = self.global_usage.fetch_add(bytes, Ordering::SeqCst) + bytes;
		if new_global_usage > self.global_capacity {
			self.global_usage.fetch_sub(bytes, Ordering::SeqCst);
			per_db.usage.fetch_sub(bytes, Ordering::SeqCst);
			return Err(Error::MemoryLimit);
		}
		Ok(())
	}

	pub fn release(&self, id: DbId, bytes: i64) {
		if let Some(per_db) = self.per_db.read().unwrap().get(&id) {
			per_db.usage.fetch_sub(bytes, Ordering::SeqCst);
		}
		self.global_usage.fetch_sub(bytes, Ordering::SeqCst);
	}

	pub fn global_usage(&self) -> i64 {
		self.global_usage.load(Ordering::SeqCst)
	}

	pub fn db_usage(&self, id: DbId) -> Option<i64> {
		self.per_db.read().unwrap().get(&id).map(|p| p.usage.load(Ordering::SeqCst))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn reserve_respects_per_db_limit() {
		let caps = MemoryCaps::new(1_000_000);
		caps.register_db(1, 100);
		assert!(caps.reserve(1, 60).is_ok());
		assert!(matches!(caps.reserve(1, 60), Err(Error::MemoryLimit)));
		assert_eq!(caps.db_usage(1), Some(60));
	}

	#[test]
	fn reserve_respects_global_limit() {
		let caps = MemoryCaps::new(100);
		caps.register_db(1, 1000);
		caps.register_db(2, 1000);
		assert!(caps.reserve(1, 60).is_ok());
		assert!(matches!(caps.reserve(2, 60), Err(Error::MemoryLimit)));
		assert_eq!(caps.global_usage(), 60);
	}

	#[test]
	fn release_frees_both_counters() {
		let caps = MemoryCaps::new(1000);
		caps.register_db(1, 100);
		caps.reserve(1, 80).unwrap();
		caps.release(1, 80);
		assert_eq!(caps.db_usage(1), Some(0));
		assert_eq!(caps.global_usage(), 0);
		assert!(caps.reserve(1, 90).is_ok());
	}

	#[test]
	fn unregister_frees_global_usage() {
		let caps = MemoryCaps::new(1000);
		caps.register_db(1, 500);
		caps.reserve(1, 200).unwrap();
		caps.unregister_db(1);
		assert_eq!(caps.global_usage(), 0);
	}
}
