//! Owns open logical DB handles, opens lazily, dispatches ops, orchestrates
//! graceful shutdown (C4).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::catalog::Catalog;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::memcaps::MemoryCaps;
use crate::model::{CatalogEntry, DbId, DbStats, DbStatus, HealReport, HealStats, OpType, Operation, Request, Response};
use crate::scheduler::{RequestHandler, Scheduler, SchedulerConfig};

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub data_dir: PathBuf,
	pub default_db_memory_limit_bytes: i64,
	pub global_memory_capacity_bytes: i64,
	pub query_timeout: Duration,
	pub scheduler: SchedulerConfig,
	/// Budgets for the three shutdown phases: stop accepting work, drain
	/// queued requests, then close DB handles.
	pub shutdown_phase1_budget: Duration,
	pub shutdown_phase2_budget: Duration,
	pub shutdown_phase3_budget: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("."),
			default_db_memory_limit_bytes: 256 * 1024 * 1024,
			global_memory_capacity_bytes: 4 * 1024 * 1024 * 1024,
			query_timeout: crate::model::DEFAULT_QUERY_TIMEOUT,
			scheduler: SchedulerConfig::default(),
			shutdown_phase1_budget: Duration::from_secs(5),
			shutdown_phase2_budget: Duration::from_secs(20),
			shutdown_phase3_budget: Duration::from_secs(5),
		}
	}
}

/// A per-DB pin: the engine is not assumed to serialize writes to one DB
/// internally, so `handle_request` holds this lock for the duration of one
/// dispatch, guaranteeing at most one in-flight worker per DB.
struct OpenDb {
	pin: Mutex<()>,
}

pub struct Pool<E: Engine> {
	catalog: Catalog,
	memcaps: Arc<MemoryCaps>,
	engine: Arc<E>,
	open: RwLock<HashMap<DbId, Arc<OpenDb>>>,
	opening: Mutex<HashMap<DbId, Arc<Mutex<()>>>>,
	scheduler: Arc<Scheduler>,
	config: PoolConfig,
}

/// Forwards Scheduler callbacks into `Pool::handle_request` without the
/// scheduler holding a strong reference back to the pool (arena-style
/// decoupling — see DESIGN.md).
struct Dispatcher<E: Engine>(Weak<Pool<E>>);

impl<E: Engine> RequestHandler for Dispatcher<E> {
	fn handle(&self, req: Request) {
		if let Some(pool) = self.0.upgrade() {
			pool.handle_request(req);
		}
	}
}

impl<E: Engine> Pool<E> {
	/// Load the catalog and construct a pool. Does not yet start the
	/// scheduler — call `start` once wrapped in an `Arc`. `memcaps` is
	/// shared with `engine`: engines call `Reserve`/`Release` themselves
	/// around allocation, while the Pool only registers and unregisters
	/// per-DB budgets as DBs are created and deleted.
	pub fn new(config: PoolConfig, engine: Arc<E>, memcaps: Arc<MemoryCaps>) -> Result<Arc<Self>> {
		let catalog = Catalog::load(&config.data_dir)?;
		for entry in catalog.list() {
			if entry.status == DbStatus::Active {
				memcaps.register_db(entry.id, config.default_db_memory_limit_bytes);
			}
		}
		let scheduler = Scheduler::new(config.scheduler.clone());
		Ok(Arc::new(Self {
			catalog,
			memcaps,
			engine,
			open: RwLock::new(HashMap::new()),
			opening: Mutex::new(HashMap::new()),
			scheduler,
			config,
		}))
	}

	/// Start the scheduler and register this pool as its request handler.
	pub fn start(self: &Arc<Self>) {
		let db_count = self.catalog.list().len();
		let dispatcher: Arc<dyn RequestHandler> = Arc::new(Dispatcher(Arc::downgrade(self)));
		self.scheduler.start(dispatcher, db_count);
	}

	pub fn scheduler(&self) -> &Arc<Scheduler> {
		&self.scheduler
	}

	pub fn memory_caps(&self) -> Arc<MemoryCaps> {
		self.memcaps.clone()
	}

	pub fn list_dbs(&self) -> Vec<CatalogEntry> {
		self.catalog.list()
	}

	/// Create `name` if it doesn't already exist in the catalog, else
	/// return the existing id. Registers a memory cap on creation.
	pub fn open_or_create_db(&self, name: &str) -> Result<DbId> {
		if let Some(entry) = self.catalog.get_by_name(name) {
			return Ok(entry.id);
		}
		match self.catalog.create(name) {
			Ok(id) => {
				self.memcaps.register_db(id, self.config.default_db_memory_limit_bytes);
				Ok(id)
			}
			Err(Error::AlreadyExists(_)) => {
				// lost the create race; the winner's entry is now visible
				self.catalog.get_by_name(name).map(|e| e.id).ok_or_else(|| Error::Internal("db vanished after AlreadyExists".into()))
			}
			Err(e) => Err(e),
		}
	}

	pub fn close_db(&self, id: DbId) {
		if let Some(handle) = self.open.write().unwrap().remove(&id) {
			drop(handle);
			self.engine.close(id);
		}
	}

	/// Mark deleting in the catalog, close the handle if open, unregister
	/// memory.
	pub fn delete_db(&self, id: DbId) -> Result<()> {
		self.catalog.delete(id)?;
		self.close_db(id);
		self.memcaps.unregister_db(id);
		Ok(())
	}

	/// The only code path that may call the engine's `Open`. Concurrent
	/// opens for the same id collapse to a single call.
	fn ensure_open(&self, id: DbId) -> Result<Arc<OpenDb>> {
		if let Some(handle) = self.open.read().unwrap().get(&id) {
			return Ok(handle.clone());
		}

		let open_lock = {
			let mut opening = self.opening.lock().unwrap();
			opening.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
		};
		let _guard = open_lock.lock().unwrap_or_else(|e| e.into_inner());

		if let Some(handle) = self.open.read().unwrap().get(&id) {
			return Ok(handle.clone());
		}

		let entry = self.catalog.get_by_id(id).ok_or_else(|| Error::NotFound(format!("db {id}")))?;
		if entry.status != DbStatus::Active {
			return Err(Error::NotFound(format!("db {id} is not active")));
		}

		self.engine.open(id, &entry.name)?;
		let handle = Arc::new(OpenDb { pin: Mutex::new(()) });
		self.open.write().unwrap().insert(id, handle.clone());
		Ok(handle)
	}

	/// Enqueue `req` via the scheduler. On `QueueFull` (or `PoolStopped`),
	/// reply synchronously instead of letting the caller wait forever.
	pub fn execute(&self, req: Request) {
		let request_id = req.request_id;
		let reply = req.reply.clone();
		if let Err(e) = self.scheduler.enqueue(req) {
			let _ = reply.try_send(Response::from_error(request_id, &e));
		}
	}

	/// Called by a worker. Resolves/opens the target DB, dispatches by
	/// `op_type`, maps engine errors, and always sends exactly one reply.
	fn handle_request(&self, req: Request) {
		let request_id = req.request_id;
		let reply = req.reply.clone();

		let result = catch_unwind(AssertUnwindSafe(|| self.dispatch_op(req.db_id, &req.op)));
		let response = match result {
			Ok(Ok(data)) => Response::ok(request_id, data),
			Ok(Err(e)) => Response::from_error(request_id, &e),
			Err(panic) => {
				let msg = panic_message(&panic);
				log::error!("worker panicked handling request {request_id}: {msg}");
				Response::from_error(request_id, &Error::Internal(format!("worker panicked: {msg}")))
			}
		};
		let _ = reply.try_send(response);
	}

	fn dispatch_op(&self, db_id: DbId, op: &Operation) -> Result<Vec<u8>> {
		let handle = self.ensure_open(db_id)?;
		let _pin = handle.pin.lock().unwrap_or_else(|e| e.into_inner());
		match op.op_type {
			OpType::CreateCollection => {
				self.engine.create_collection(db_id, &op.collection)?;
				Ok(Vec::new())
			}
			OpType::DeleteCollection => {
				self.engine.delete_collection(db_id, &op.collection)?;
				Ok(Vec::new())
			}
			_ => Ok(self.engine.dispatch(db_id, op)?),
		}
	}

	pub fn create_collection(&self, db_id: DbId, name: &str) -> Result<()> {
		let handle = self.ensure_open(db_id)?;
		let _pin = handle.pin.lock().unwrap_or_else(|e| e.into_inner());
		Ok(self.engine.create_collection(db_id, name)?)
	}

	pub fn delete_collection(&self, db_id: DbId, name: &str) -> Result<()> {
		let handle = self.ensure_open(db_id)?;
		let _pin = handle.pin.lock().unwrap_or_else(|e| e.into_inner());
		Ok(self.engine.delete_collection(db_id, name)?)
	}

	pub fn list_collections(&self, db_id: DbId) -> Result<Vec<String>> {
		let handle = self.ensure_open(db_id)?;
		let _pin = handle.pin.lock().unwrap_or_else(|e| e.into_inner());
		Ok(self.engine.list_collections(db_id)?)
	}

	pub fn stats(&self, db_id: DbId) -> Result<DbStats> {
		let handle = self.ensure_open(db_id)?;
		let _pin = handle.pin.lock().unwrap_or_else(|e| e.into_inner());
		Ok(self.engine.stats(db_id)?)
	}

	pub fn heal(&self, db_id: DbId) -> Result<HealReport> {
		let handle = self.ensure_open(db_id)?;
		let _pin = handle.pin.lock().unwrap_or_else(|e| e.into_inner());
		Ok(self.engine.heal(db_id)?)
	}

	pub fn heal_all(&self) -> Result<Vec<HealReport>> {
		Ok(self.engine.heal_all()?)
	}

	pub fn heal_stats(&self) -> Result<HealStats> {
		Ok(self.engine.heal_stats()?)
	}

	/// Query bypasses the scheduler and runs inline on the caller's task,
	/// bounded by `PoolConfig::query_timeout`. Since there is no
	/// general-purpose thread cancellation in safe Rust, the bound is
	/// enforced by racing the engine call on a worker thread against a
	/// timeout; on timeout the spawned thread is abandoned (it cannot be
	/// revoked), so a slow query keeps running in the background even
	/// after the caller gives up on it.
	pub fn query(&self, db_id: DbId, collection: &str, filter: &[u8]) -> Result<Vec<u8>> {
		let handle = self.ensure_open(db_id)?;
		drop(handle); // query does not take the per-DB pin: reads don't need write pinning
		let timeout = self.config.query_timeout;
		let engine = Arc::clone(&self.engine);
		let collection = collection.to_string();
		let filter = filter.to_vec();
		let (tx, rx) = flume::bounded(1);
		std::thread::spawn(move || {
			let result = engine.query(db_id, &collection, &filter, timeout);
			let _ = tx.send(result);
		});
		match rx.recv_timeout(timeout) {
			Ok(Ok(data)) => Ok(data),
			Ok(Err(e)) => Err(e.into()),
			Err(_) => Err(Error::Timeout),
		}
	}

	pub fn memory_usage(&self, db_id: DbId) -> Option<i64> {
		self.memcaps.db_usage(db_id)
	}

	pub fn global_memory_usage(&self) -> i64 {
		self.memcaps.global_usage()
	}

	/// Three-phase graceful shutdown:
	/// 1. mark stopped so new `Execute` calls are rejected;
	/// 2. close per-DB queues and wait for workers to drain;
	/// 3. close DB handles (the catalog is already durable on every
	///    mutation, so there is nothing further to flush).
	/// Each phase has a timeout; a timed-out phase logs a warning and the
	/// shutdown continues regardless.
	pub fn stop(&self) {
		let phase1 = Instant::now();
		self.scheduler.mark_stopped();
		if phase1.elapsed() > self.config.shutdown_phase1_budget {
			log::warn!("shutdown phase 1 exceeded its {:?} budget", self.config.shutdown_phase1_budget);
		}

		let phase2 = Instant::now();
		self.scheduler.drain(self.config.shutdown_phase2_budget);
		if phase2.elapsed() > self.config.shutdown_phase2_budget {
			log::warn!("shutdown phase 2 exceeded its {:?} budget", self.config.shutdown_phase2_budget);
		}

		let phase3 = Instant::now();
		let open: Vec<DbId> = self.open.write().unwrap().drain().map(|(id, _)| id).collect();
		for id in open {
			self.engine.close(id);
		}
		if phase3.elapsed() > self.config.shutdown_phase3_budget {
			log::warn!("shutdown phase 3 exceeded its {:?} budget", self.config.shutdown_phase3_budget);
		}
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic payload".to_string()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::engine::Engine;
	use crate::error::EngineError;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Barrier;

	struct CountingEngine {
		opens: AtomicUsize,
	}

	impl CountingEngine {
		fn new() -> Self {
			Self { opens: AtomicUsize::new(0) }
		}
	}

	impl Engine for CountingEngine {
		fn open(&self, _db: DbId, _name: &str) -> std::result::Result<(), EngineError> {
			self.opens.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
		fn close(&self, _db: DbId) {}
		fn dispatch(&self, _db: DbId, op: &Operation) -> std::result::Result<Vec<u8>, EngineError> {
			Ok(op.payload.clone())
		}
		fn create_collection(&self, _db: DbId, _name: &str) -> std::result::Result<(), EngineError> {
			Ok(())
		}
		fn delete_collection(&self, _db: DbId, _name: &str) -> std::result::Result<(), EngineError> {
			Ok(())
		}
		fn list_collections(&self, _db: DbId) -> std::result::Result<Vec<String>, EngineError> {
			Ok(Vec::new())
		}
		fn query(&self, _db: DbId, _c: &str, _f: &[u8], _t: Duration) -> std::result::Result<Vec<u8>, EngineError> {
			Ok(Vec::new())
		}
		fn heal(&self, db: DbId) -> std::result::Result<HealReport, EngineError> {
			Ok(HealReport { db_id: db, repaired: 0, notes: Vec::new() })
		}
		fn heal_all(&self) -> std::result::Result<Vec<HealReport>, EngineError> {
			Ok(Vec::new())
		}
		fn heal_stats(&self) -> std::result::Result<HealStats, EngineError> {
			Ok(HealStats::default())
		}
		fn stats(&self, db: DbId) -> std::result::Result<DbStats, EngineError> {
			Ok(DbStats { db_id: db, collection_count: 0, document_count: 0, bytes_used: 0 })
		}
	}

	fn test_config() -> PoolConfig {
		let dir = std::env::temp_dir().join(format!("docdb-pool-test-{}-{}", std::process::id(), rand_suffix()));
		PoolConfig {
			data_dir: dir,
			scheduler: SchedulerConfig { queue_depth: 64, configured_workers: 4, ..Default::default() },
			shutdown_phase2_budget: Duration::from_secs(2),
			..Default::default()
		}
	}

	fn rand_suffix() -> u64 {
		use std::sync::atomic::{AtomicU64, Ordering};
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		COUNTER.fetch_add(1, Ordering::SeqCst)
	}

	fn make_request(db_id: DbId, request_id: u64, payload: Vec<u8>) -> (Request, flume::Receiver<Response>) {
		let (tx, rx) = flume::bounded(1);
		let op = Operation { op_type: OpType::Read, collection: "docs".into(), doc_id: 1, patch_ops: None, payload };
		(Request { request_id, db_id, op, reply: tx }, rx)
	}

	#[test]
	fn single_db_echo() {
		let engine = Arc::new(CountingEngine::new());
		let config = test_config();
		let memcaps = Arc::new(MemoryCaps::new(config.global_memory_capacity_bytes));
		let pool = Pool::new(config, engine, memcaps).unwrap();
		pool.start();
		let id = pool.open_or_create_db("a").unwrap();

		let (req, rx) = make_request(id, 1, b"{\"v\":1}".to_vec());
		pool.execute(req);
		let resp = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert_eq!(resp.status, crate::error::Status::Ok);
		assert_eq!(resp.data, b"{\"v\":1}");
		pool.stop();
	}

	#[test]
	fn lazy_open_collapses_concurrent_first_execute() {
		let engine = Arc::new(CountingEngine::new());
		let config = test_config();
		let memcaps = Arc::new(MemoryCaps::new(config.global_memory_capacity_bytes));
		let pool = Pool::new(config, engine.clone(), memcaps).unwrap();
		pool.start();
		let id = pool.open_or_create_db("race").unwrap();

		let n = 16;
		let barrier = Arc::new(Barrier::new(n));
		let mut receivers = Vec::new();
		let handles: Vec<_> = (0..n)
			.map(|i| {
				let pool = pool.clone();
				let barrier = barrier.clone();
				let (tx, rx) = flume::bounded(1);
				receivers.push(rx);
				let op = Operation { op_type: OpType::Read, collection: "docs".into(), doc_id: 1, patch_ops: None, payload: Vec::new() };
				let req = Request { request_id: i as u64, db_id: id, op, reply: tx };
				std::thread::spawn(move || {
					barrier.wait();
					pool.execute(req);
				})
			})
			.collect();
		for h in handles {
			h.join().unwrap();
		}
		for rx in receivers {
			rx.recv_timeout(Duration::from_secs(2)).unwrap();
		}
		assert_eq!(engine.opens.load(Ordering::SeqCst), 1);
		pool.stop();
	}

	#[test]
	fn deleted_db_is_not_found() {
		let engine = Arc::new(CountingEngine::new());
		let config = test_config();
		let memcaps = Arc::new(MemoryCaps::new(config.global_memory_capacity_bytes));
		let pool = Pool::new(config, engine, memcaps).unwrap();
		pool.start();
		let id = pool.open_or_create_db("gone").unwrap();
		pool.delete_db(id).unwrap();

		let (req, rx) = make_request(id, 1, Vec::new());
		pool.execute(req);
		let resp = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert_eq!(resp.status, crate::error::Status::NotFound);
		pool.stop();
	}

	#[test]
	fn graceful_shutdown_replies_to_every_accepted_request() {
		let engine = Arc::new(CountingEngine::new());
		let config = test_config();
		let memcaps = Arc::new(MemoryCaps::new(config.global_memory_capacity_bytes));
		let pool = Pool::new(config, engine, memcaps).unwrap();
		pool.start();
		let id = pool.open_or_create_db("drain").unwrap();

		let mut receivers = Vec::new();
		for i in 0..10u64 {
			let (req, rx) = make_request(id, i, Vec::new());
			pool.execute(req);
			receivers.push(rx);
		}
		pool.stop();

		for rx in receivers {
			let resp = rx.recv_timeout(Duration::from_secs(1)).expect("every accepted request must get exactly one reply");
			assert!(matches!(resp.status, crate::error::Status::Ok | crate::error::Status::Error));
		}
	}
}
