//! Fair scheduler (C5): per-DB bounded FIFO queues, a global total-queued
//! cap, depth-biased worker dispatch, and autoscaled worker count. This is
//! the hardest part of the core: it has to bound both per-DB and global
//! backlog, pick work fairly across DBs without starving a quiet one, and
//! keep the worker count in proportion to the number of open DBs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use threadpool::ThreadPool;

use crate::error::{Error, Result};
use crate::model::{DbId, Request};

/// Injected at `Scheduler::start` so the scheduler has no compile-time
/// dependency on Pool (arena-style decoupling — see DESIGN.md).
pub trait RequestHandler: Send + Sync {
	fn handle(&self, req: Request);
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// Per-DB FIFO capacity.
	pub queue_depth: usize,
	/// Global queued cap. 0 disables.
	pub max_total_queued: i64,
	/// 0 = autoscale.
	pub configured_workers: usize,
	/// Hard cap on worker pool size.
	pub max_workers: usize,
	/// Idle worker reclamation period. The dispatch loop here is
	/// long-lived rather than task-per-job, so this bounds the no-work
	/// sleep granularity rather than thread teardown — see DESIGN.md.
	pub worker_idle_expiry: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self { queue_depth: 1024, max_total_queued: 0, configured_workers: 0, max_workers: 64, worker_idle_expiry: Duration::from_secs(1) }
	}
}

struct QueueEntry {
	receiver: flume::Receiver<Request>,
	depth: AtomicI32,
}

#[derive(Default)]
pub struct SchedulerMetrics {
	pick_total_ns: AtomicU64,
	pick_count: AtomicU64,
}

impl SchedulerMetrics {
	fn record_pick(&self, elapsed: Duration) {
		self.pick_total_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
		self.pick_count.fetch_add(1, Ordering::Relaxed);
	}

	pub fn pick_count(&self) -> u64 {
		self.pick_count.load(Ordering::Relaxed)
	}

	pub fn avg_pick_ns(&self) -> u64 {
		let count = self.pick_count();
		if count == 0 {
			0
		} else {
			self.pick_total_ns.load(Ordering::Relaxed) / count
		}
	}
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum State {
	Init,
	Running,
	Stopped,
}

pub struct Scheduler {
	config: SchedulerConfig,
	queues: RwLock<HashMap<DbId, Arc<QueueEntry>>>,
	senders: RwLock<HashMap<DbId, flume::Sender<Request>>>,
	db_ids: RwLock<Vec<DbId>>,
	total_queued: AtomicI64,
	state: RwLock<State>,
	worker_count: AtomicUsize,
	pool: RwLock<Option<ThreadPool>>,
	stop_requested: AtomicBool,
	pub metrics: SchedulerMetrics,
}

impl Scheduler {
	pub fn new(config: SchedulerConfig) -> Arc<Self> {
		Arc::new(Self {
			config,
			queues: RwLock::new(HashMap::new()),
			senders: RwLock::new(HashMap::new()),
			db_ids: RwLock::new(Vec::new()),
			total_queued: AtomicI64::new(0),
			state: RwLock::new(State::Init),
			worker_count: AtomicUsize::new(0),
			pool: RwLock::new(None),
			stop_requested: AtomicBool::new(false),
			metrics: SchedulerMetrics::default(),
		})
	}

	fn is_stopped(&self) -> bool {
		self.stop_requested.load(Ordering::SeqCst)
	}

	/// Derive the worker count from CPU count and the current number of
	/// open DBs, unless a fixed count was configured.
	fn compute_worker_count(&self, db_count_hint: usize) -> usize {
		if self.config.configured_workers > 0 {
			return self.config.configured_workers.clamp(4, self.config.max_workers.max(4));
		}
		let num_cpu = num_cpus::get();
		let base = 2 * num_cpu;
		let mult = if db_count_hint <= 10 { 2 } else { 4 };
		let mut n = base.max(db_count_hint * mult);
		if self.config.max_workers > 1 && n < 32 {
			n = 32;
		}
		n.clamp(4, self.config.max_workers.max(4))
	}

	/// Start the worker pool. `handler` is invoked synchronously by
	/// whichever worker dequeues a request; `db_count_hint` seeds the
	/// autoscaling formula (typically the catalog's current DB count).
	/// Must be called on an `Arc<Scheduler>` so worker threads can hold
	/// their own strong reference instead of a borrowed one.
	pub fn start(self: &Arc<Self>, handler: Arc<dyn RequestHandler>, db_count_hint: usize) {
		{
			let mut state = self.state.write().unwrap();
			if *state != State::Init {
				return;
			}
			*state = State::Running;
		}

		let n = self.compute_worker_count(db_count_hint);
		self.worker_count.store(n, Ordering::SeqCst);
		let pool = ThreadPool::with_name("docdb-worker".into(), n);
		for _ in 0..n {
			let sched = Arc::clone(self);
			let handler = Arc::clone(&handler);
			pool.execute(move || sched.worker_loop(handler));
		}
		*self.pool.write().unwrap() = Some(pool);
	}

	fn ensure_queue(&self, db_id: DbId) -> Result<()> {
		{
			let queues = self.queues.read().unwrap();
			if queues.contains_key(&db_id) {
				return Ok(());
			}
		}
		let mut queues = self.queues.write().unwrap();
		let mut senders = self.senders.write().unwrap();
		if self.is_stopped() {
			return Err(Error::PoolStopped);
		}
		if queues.contains_key(&db_id) {
			return Ok(());
		}
		let (tx, rx) = flume::bounded(self.config.queue_depth.max(1));
		queues.insert(db_id, Arc::new(QueueEntry { receiver: rx, depth: AtomicI32::new(0) }));
		senders.insert(db_id, tx);
		self.db_ids.write().unwrap().push(db_id);
		Ok(())
	}

	/// Non-blocking admission. Never absorbs backpressure: returns `Ok`
	/// only if the request was actually enqueued.
	pub fn enqueue(&self, req: Request) -> Result<()> {
		if self.is_stopped() {
			return Err(Error::PoolStopped);
		}
		self.ensure_queue(req.db_id)?;

		let reserved_global = if self.config.max_total_queued > 0 {
			let new_total = self.total_queued.fetch_add(1, Ordering::SeqCst) + 1;
			if new_total > self.config.max_total_queued {
				self.total_queued.fetch_sub(1, Ordering::SeqCst);
				return Err(Error::QueueFull);
			}
			true
		} else {
			false
		};

		let db_id = req.db_id;
		let send_result = {
			let senders = self.senders.read().unwrap();
			match senders.get(&db_id) {
				Some(tx) => tx.try_send(req),
				None => return Err(Error::PoolStopped),
			}
		};

		match send_result {
			Ok(()) => {
				let queues = self.queues.read().unwrap();
				if let Some(entry) = queues.get(&db_id) {
					entry.depth.fetch_add(1, Ordering::SeqCst);
				}
				Ok(())
			}
			Err(flume::TrySendError::Full(_)) => {
				if reserved_global {
					self.total_queued.fetch_sub(1, Ordering::SeqCst);
				}
				Err(Error::QueueFull)
			}
			Err(flume::TrySendError::Disconnected(_)) => {
				if reserved_global {
					self.total_queued.fetch_sub(1, Ordering::SeqCst);
				}
				Err(Error::PoolStopped)
			}
		}
	}

	pub fn total_queued(&self) -> i64 {
		self.total_queued.load(Ordering::SeqCst)
	}

	pub fn depth(&self, db_id: DbId) -> i32 {
		self.queues.read().unwrap().get(&db_id).map(|e| e.depth.load(Ordering::SeqCst)).unwrap_or(0)
	}

	pub fn worker_count(&self) -> usize {
		self.worker_count.load(Ordering::SeqCst)
	}

	/// Currently-executing worker tasks, from the underlying thread pool.
	pub fn running_workers(&self) -> usize {
		self.pool.read().unwrap().as_ref().map(|p| p.active_count()).unwrap_or(0)
	}

	/// Submitted-but-not-yet-started worker tasks. The worker loop never
	/// queues more than `worker_count` closures on the pool (one per
	/// worker, each looping internally), so this is normally 0 except
	/// briefly during `start`.
	pub fn waiting_workers(&self) -> usize {
		self.pool.read().unwrap().as_ref().map(|p| p.queued_count()).unwrap_or(0)
	}

	/// Mean depth across every DB that currently has a queue, including
	/// DBs at depth 0. Approximate, same caveat as individual `depth` reads.
	pub fn avg_queue_depth(&self) -> f64 {
		let ids: Vec<DbId> = self.db_ids.read().unwrap().clone();
		if ids.is_empty() {
			return 0.0;
		}
		let queues = self.queues.read().unwrap();
		let total: i64 = ids.iter().filter_map(|id| queues.get(id).map(|e| e.depth.load(Ordering::SeqCst) as i64)).sum();
		total as f64 / ids.len() as f64
	}

	/// Pick the DB id with the largest positive depth without taking a
	/// queue-level lock: read a snapshot of `db_ids`, then scan each DB's
	/// atomic depth under only the queues map's read lock. Ties break by
	/// scan order (deterministic).
	fn pick_next_queue(&self) -> Option<DbId> {
		let started = Instant::now();
		let ids: Vec<DbId> = self.db_ids.read().unwrap().clone();
		let queues = self.queues.read().unwrap();

		let mut best: Option<(DbId, i32)> = None;
		for id in ids {
			if let Some(entry) = queues.get(&id) {
				let depth = entry.depth.load(Ordering::SeqCst);
				if depth > 0 {
					match best {
						Some((_, best_depth)) if depth <= best_depth => {}
						_ => best = Some((id, depth)),
					}
				}
			}
		}
		drop(queues);
		self.metrics.record_pick(started.elapsed());
		best.map(|(id, _)| id)
	}

	fn worker_loop(self: Arc<Self>, handler: Arc<dyn RequestHandler>) {
		loop {
			if self.is_stopped() {
				return;
			}

			let db_id = match self.pick_next_queue() {
				Some(id) => id,
				None => {
					let no_dbs_yet = self.db_ids.read().unwrap().is_empty();
					std::thread::sleep(if no_dbs_yet { Duration::from_millis(10) } else { Duration::from_millis(1) });
					continue;
				}
			};

			let entry = { self.queues.read().unwrap().get(&db_id).cloned() };
			let entry = match entry {
				Some(e) => e,
				None => continue,
			};

			match entry.receiver.recv() {
				Ok(req) => {
					entry.depth.fetch_sub(1, Ordering::SeqCst);
					self.total_queued.fetch_sub(1, Ordering::SeqCst);
					handler.handle(req);
				}
				Err(flume::RecvError::Disconnected) => {
					if self.is_stopped() {
						return;
					}
					continue;
				}
			}
		}
	}

	/// Phase 1 at the scheduler level: flip the stopped flag so `enqueue`
	/// starts rejecting with `PoolStopped` immediately. Does not block.
	pub fn mark_stopped(&self) {
		self.stop_requested.store(true, Ordering::SeqCst);
		*self.state.write().unwrap() = State::Stopped;
	}

	/// Phase 2: close every per-DB queue so blocked workers wake with
	/// `Disconnected`, and wait (bounded by `budget`) for workers to drain.
	/// Assumes `mark_stopped` was already called.
	pub fn drain(&self, budget: Duration) {
		self.senders.write().unwrap().clear();

		let pool = self.pool.write().unwrap().take();
		if let Some(pool) = pool {
			let (done_tx, done_rx) = flume::bounded(1);
			std::thread::spawn(move || {
				pool.join();
				let _ = done_tx.send(());
			});
			if done_rx.recv_timeout(budget).is_err() {
				log::warn!("scheduler shutdown: workers did not drain within {budget:?}, continuing");
			}
		}
	}

	/// Convenience combining `mark_stopped` + `drain`, for callers (and
	/// tests) that don't need Pool's distinct phase-1/phase-3 steps.
	pub fn stop(&self, budget: Duration) {
		self.mark_stopped();
		self.drain(budget);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::Mutex;

	struct RecordingHandler {
		seen: Mutex<Vec<(DbId, u64)>>,
	}

	impl RequestHandler for RecordingHandler {
		fn handle(&self, req: Request) {
			self.seen.lock().unwrap().push((req.db_id, req.request_id));
			let _ = req.reply.try_send(crate::model::Response::ok(req.request_id, Vec::new()));
		}
	}

	fn make_request(db_id: DbId, request_id: u64) -> (Request, flume::Receiver<crate::model::Response>) {
		let (tx, rx) = flume::bounded(1);
		let op = crate::model::Operation {
			op_type: crate::model::OpType::Read,
			collection: "c".into(),
			doc_id: 1,
			patch_ops: None,
			payload: Vec::new(),
		};
		(Request { request_id, db_id, op, reply: tx }, rx)
	}

	#[test]
	fn admission_bounds_per_db() {
		let sched = Scheduler::new(SchedulerConfig { queue_depth: 2, ..Default::default() });
		let mut oks = 0;
		let mut fulls = 0;
		for i in 0..5 {
			let (req, _rx) = make_request(1, i);
			match sched.enqueue(req) {
				Ok(()) => oks += 1,
				Err(Error::QueueFull) => fulls += 1,
				Err(e) => panic!("unexpected error {e}"),
			}
		}
		assert_eq!(oks, 2);
		assert_eq!(fulls, 3);
		assert_eq!(sched.depth(1), 2);
	}

	#[test]
	fn admission_bounds_global() {
		let sched = Scheduler::new(SchedulerConfig { queue_depth: 10, max_total_queued: 4, ..Default::default() });
		let mut oks = 0;
		let mut fulls = 0;
		for db in 1..=5u64 {
			let (req, _rx) = make_request(db, db);
			match sched.enqueue(req) {
				Ok(()) => oks += 1,
				Err(Error::QueueFull) => fulls += 1,
				Err(e) => panic!("unexpected error {e}"),
			}
		}
		assert_eq!(oks, 4);
		assert_eq!(fulls, 1);
		assert_eq!(sched.total_queued(), 4);
	}

	#[test]
	fn enqueue_after_stop_fails() {
		let sched = Scheduler::new(SchedulerConfig::default());
		let handler = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });
		sched.start(handler, 1);
		sched.stop(Duration::from_secs(1));
		let (req, _rx) = make_request(1, 1);
		assert!(matches!(sched.enqueue(req), Err(Error::PoolStopped)));
	}

	#[test]
	fn depth_bias_drains_heaviest_db_first() {
		let sched = Scheduler::new(SchedulerConfig { queue_depth: 200, configured_workers: 1, ..Default::default() });
		let handler = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });

		let mut receivers = Vec::new();
		for i in 0..50u64 {
			let (req, rx) = make_request(1, i);
			sched.enqueue(req).unwrap();
			receivers.push(rx);
		}
		let (req_b, rx_b) = make_request(2, 1000);
		sched.enqueue(req_b).unwrap();

		sched.start(Arc::clone(&handler), 2);

		// B must eventually be served; bounded by 100 + workerCount picks
		// worth of wall-clock as a generous timeout.
		let got = rx_b.recv_timeout(Duration::from_secs(5));
		assert!(got.is_ok(), "db B's sole request should eventually be served");

		for rx in receivers {
			rx.recv_timeout(Duration::from_secs(5)).expect("db A requests should all complete");
		}

		sched.stop(Duration::from_secs(1));
	}

	#[test]
	fn every_enqueued_request_gets_exactly_one_reply() {
		let sched = Scheduler::new(SchedulerConfig { queue_depth: 50, configured_workers: 4, ..Default::default() });
		let handler = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });
		sched.start(handler, 1);

		let mut receivers = Vec::new();
		for i in 0..20u64 {
			let (req, rx) = make_request(1, i);
			sched.enqueue(req).unwrap();
			receivers.push(rx);
		}
		for rx in receivers {
			let resp = rx.recv_timeout(Duration::from_secs(5)).unwrap();
			assert_eq!(resp.status, crate::error::Status::Ok);
		}
		sched.stop(Duration::from_secs(1));
	}

	#[test]
	fn avg_queue_depth_reflects_enqueued_backlog() {
		let sched = Scheduler::new(SchedulerConfig { queue_depth: 50, ..Default::default() });
		assert_eq!(sched.avg_queue_depth(), 0.0);

		for i in 0..4u64 {
			let (req, _rx) = make_request(1, i);
			sched.enqueue(req).unwrap();
		}
		let (req_b, _rx_b) = make_request(2, 100);
		sched.enqueue(req_b).unwrap();

		// db 1 at depth 4, db 2 at depth 1: mean 2.5.
		assert_eq!(sched.avg_queue_depth(), 2.5);
	}
}
