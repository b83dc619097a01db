//! Reference [`Engine`] implementation: a plain in-memory document store.
//! Not the real storage engine (no WAL, no indexes, no recovery — those
//! are explicitly out of scope); this exists so the scheduler and pool can
//! be driven end to end without a real storage engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docdb_core::{DbId, DbStats, Engine, EngineError, HealReport, HealStats, MemoryCaps, OpType, Operation};

struct Document {
	bytes: Vec<u8>,
}

#[derive(Default)]
struct Db {
	collections: HashMap<String, HashMap<u64, Document>>,
}

pub struct MemoryEngine {
	memcaps: Arc<MemoryCaps>,
	dbs: Mutex<HashMap<DbId, Db>>,
	heal_stats: Mutex<HealStats>,
}

impl MemoryEngine {
	pub fn new(memcaps: Arc<MemoryCaps>) -> Self {
		Self { memcaps, dbs: Mutex::new(HashMap::new()), heal_stats: Mutex::new(HealStats::default()) }
	}

	fn with_collection<T>(&self, db: DbId, name: &str, f: impl FnOnce(&mut HashMap<u64, Document>) -> Result<T, EngineError>) -> Result<T, EngineError> {
		let mut dbs = self.dbs.lock().unwrap();
		let db = dbs.get_mut(&db).ok_or(EngineError::Other("db not open".into()))?;
		let collection = db.collections.get_mut(name).ok_or_else(|| EngineError::CollectionNotFound(name.to_string()))?;
		f(collection)
	}
}

impl Engine for MemoryEngine {
	fn open(&self, db: DbId, _name: &str) -> Result<(), EngineError> {
		self.dbs.lock().unwrap().entry(db).or_default();
		Ok(())
	}

	fn close(&self, db: DbId) {
		self.dbs.lock().unwrap().remove(&db);
	}

	fn dispatch(&self, db: DbId, op: &Operation) -> Result<Vec<u8>, EngineError> {
		match op.op_type {
			OpType::Create => {
				let size = op.payload.len() as i64;
				self.memcaps.reserve(db, size).map_err(|_| EngineError::MemoryLimit)?;
				let result = self.with_collection(db, &op.collection, |c| {
					if c.contains_key(&op.doc_id) {
						return Err(EngineError::DocExists);
					}
					c.insert(op.doc_id, Document { bytes: op.payload.clone() });
					Ok(Vec::new())
				});
				if result.is_err() {
					self.memcaps.release(db, size);
				}
				result
			}
			OpType::Read => self.with_collection(db, &op.collection, |c| c.get(&op.doc_id).map(|d| d.bytes.clone()).ok_or(EngineError::DocNotFound)),
			OpType::Update => {
				let new_size = op.payload.len() as i64;
				let old_size = self.with_collection(db, &op.collection, |c| {
					c.get(&op.doc_id).map(|d| d.bytes.len() as i64).ok_or(EngineError::DocNotFound)
				})?;
				if new_size > old_size {
					self.memcaps.reserve(db, new_size - old_size).map_err(|_| EngineError::MemoryLimit)?;
				}
				let result = self.with_collection(db, &op.collection, |c| {
					let doc = c.get_mut(&op.doc_id).ok_or(EngineError::DocNotFound)?;
					doc.bytes = op.payload.clone();
					Ok(Vec::new())
				});
				if new_size < old_size {
					self.memcaps.release(db, old_size - new_size);
				} else if result.is_err() && new_size > old_size {
					self.memcaps.release(db, new_size - old_size);
				}
				result
			}
			OpType::Delete => {
				let removed = self.with_collection(db, &op.collection, |c| c.remove(&op.doc_id).ok_or(EngineError::DocNotFound))?;
				self.memcaps.release(db, removed.bytes.len() as i64);
				Ok(Vec::new())
			}
			OpType::Patch => {
				// JSON-merge-patch style shallow replace: a reference engine
				// does not need a real JSON-patch evaluator, only to prove
				// the wire path carries `patch_ops` through.
				let patch = op.patch_ops.clone().unwrap_or_default();
				let new_size = patch.len() as i64;
				let old_size = self.with_collection(db, &op.collection, |c| {
					c.get(&op.doc_id).map(|d| d.bytes.len() as i64).ok_or(EngineError::DocNotFound)
				})?;
				if new_size > old_size {
					self.memcaps.reserve(db, new_size - old_size).map_err(|_| EngineError::MemoryLimit)?;
				}
				let result = self.with_collection(db, &op.collection, |c| {
					let doc = c.get_mut(&op.doc_id).ok_or(EngineError::DocNotFound)?;
					doc.bytes = patch.clone();
					Ok(doc.bytes.clone())
				});
				if new_size < old_size {
					self.memcaps.release(db, old_size - new_size);
				}
				result
			}
			OpType::CreateCollection | OpType::DeleteCollection => {
				unreachable!("Pool dispatches collection ops through its own methods")
			}
		}
	}

	fn create_collection(&self, db: DbId, name: &str) -> Result<(), EngineError> {
		let mut dbs = self.dbs.lock().unwrap();
		let db = dbs.get_mut(&db).ok_or(EngineError::Other("db not open".into()))?;
		db.collections.entry(name.to_string()).or_default();
		Ok(())
	}

	fn delete_collection(&self, db: DbId, name: &str) -> Result<(), EngineError> {
		let freed = {
			let mut dbs = self.dbs.lock().unwrap();
			let entry = dbs.get_mut(&db).ok_or(EngineError::Other("db not open".into()))?;
			entry.collections.remove(name).map(|removed| removed.values().map(|d| d.bytes.len() as i64).sum::<i64>())
		};
		if let Some(freed) = freed {
			self.memcaps.release(db, freed);
		}
		Ok(())
	}

	fn list_collections(&self, db: DbId) -> Result<Vec<String>, EngineError> {
		let dbs = self.dbs.lock().unwrap();
		let db = dbs.get(&db).ok_or(EngineError::Other("db not open".into()))?;
		Ok(db.collections.keys().cloned().collect())
	}

	fn query(&self, db: DbId, collection: &str, filter: &[u8], _timeout: Duration) -> Result<Vec<u8>, EngineError> {
		// Reference query: `filter` is an optional JSON byte-string prefix;
		// documents whose bytes start with it are returned newline-joined.
		self.with_collection(db, collection, |c| {
			let mut out = Vec::new();
			for doc in c.values() {
				if filter.is_empty() || doc.bytes.starts_with(filter) {
					out.extend_from_slice(&doc.bytes);
					out.push(b'\n');
				}
			}
			Ok(out)
		})
	}

	fn heal(&self, db: DbId) -> Result<HealReport, EngineError> {
		let _ = self.dbs.lock().unwrap().get(&db).ok_or(EngineError::Other("db not open".into()))?;
		let mut stats = self.heal_stats.lock().unwrap();
		stats.last_run_ms = Some(0);
		Ok(HealReport { db_id: db, repaired: 0, notes: vec!["in-memory reference engine has nothing to repair".into()] })
	}

	fn heal_all(&self) -> Result<Vec<HealReport>, EngineError> {
		let ids: Vec<DbId> = self.dbs.lock().unwrap().keys().copied().collect();
		ids.into_iter().map(|id| self.heal(id)).collect()
	}

	fn heal_stats(&self) -> Result<HealStats, EngineError> {
		Ok(self.heal_stats.lock().unwrap().clone())
	}

	fn stats(&self, db: DbId) -> Result<DbStats, EngineError> {
		let dbs = self.dbs.lock().unwrap();
		let db_entry = dbs.get(&db).ok_or(EngineError::Other("db not open".into()))?;
		let document_count: u64 = db_entry.collections.values().map(|c| c.len() as u64).sum();
		let bytes_used: u64 = db_entry.collections.values().flat_map(|c| c.values()).map(|d| d.bytes.len() as u64).sum();
		Ok(DbStats { db_id: db, collection_count: db_entry.collections.len() as u64, document_count, bytes_used })
	}
}
