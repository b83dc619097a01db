//! Connection acceptor: one `async-std` task per connection, each reading
//! sequential frames via the core's length-prefix convention and dispatching
//! into `Pool`. `docdb-core`'s codec has no socket awareness (see its module
//! doc comment); the async read/write glue lives here.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::future::timeout;
use async_std::io::{ReadExt, WriteExt};
use async_std::os::unix::net::{UnixListener, UnixStream};
use async_std::task;
use futures::StreamExt;

use docdb_core::{
	decode_request, encode_batch_data, encode_response, write_frame, Command, CoreConfig, DbId, Engine, Operation, OpType, Pool,
	Request, Response, Status, MAX_FRAME_SIZE,
};

async fn read_frame_async(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
	let mut len_buf = [0u8; 4];
	match stream.read_exact(&mut len_buf).await {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e),
	}
	let len = u32::from_le_bytes(len_buf) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame exceeds size limit"));
	}
	let mut body = vec![0u8; len];
	stream.read_exact(&mut body).await?;
	Ok(Some(body))
}

async fn write_frame_async(stream: &mut UnixStream, body: &[u8]) -> std::io::Result<()> {
	let mut framed = Vec::with_capacity(4 + body.len());
	write_frame(&mut framed, body).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
	stream.write_all(&framed).await
}

struct ConnectionSlot {
	active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
	fn drop(&mut self) {
		self.active.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Bind the socket (clearing a stale path left over from an unclean exit)
/// and serve connections until `shutdown` is set. Polls `incoming.next()`
/// under a short timeout so the loop can also observe `shutdown`.
pub async fn serve<E: Engine>(config: Arc<CoreConfig>, pool: Arc<Pool<E>>, socket_path: &Path, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
	if socket_path.exists() {
		std::fs::remove_file(socket_path)?;
	}
	let listener = UnixListener::bind(socket_path).await?;
	log::info!("listening on {}", socket_path.display());

	let active_connections = Arc::new(AtomicUsize::new(0));
	let mut incoming = listener.incoming();

	while !shutdown.load(Ordering::SeqCst) {
		let next = match timeout(Duration::from_millis(200), incoming.next()).await {
			Ok(next) => next,
			Err(_) => continue,
		};
		let stream = match next {
			Some(Ok(s)) => s,
			Some(Err(e)) => {
				log::warn!("accept error: {e}");
				continue;
			}
			None => break,
		};

		if config.max_connections > 0 && active_connections.load(Ordering::SeqCst) >= config.max_connections {
			log::warn!("rejecting connection: at MaxConnections={}", config.max_connections);
			drop(stream);
			continue;
		}
		active_connections.fetch_add(1, Ordering::SeqCst);
		let slot = ConnectionSlot { active: active_connections.clone() };

		let pool = pool.clone();
		let debug_mode = config.debug_mode;
		task::spawn(async move {
			let _slot = slot;
			if let Err(e) = handle_connection(stream, pool, debug_mode).await {
				log::debug!("connection closed: {e}");
			}
		});
	}

	log::info!("accept loop received shutdown signal");
	Ok(())
}

async fn handle_connection<E: Engine>(mut stream: UnixStream, pool: Arc<Pool<E>>, debug_mode: bool) -> anyhow::Result<()> {
	loop {
		let body = match read_frame_async(&mut stream).await {
			Ok(Some(b)) => b,
			Ok(None) => return Ok(()),
			Err(e) => return Err(e.into()),
		};

		let started = Instant::now();
		let decoded = match decode_request(&body) {
			Ok(d) => d,
			Err(e) => {
				log::warn!("closing connection: {e}");
				return Err(e.into());
			}
		};

		let response = dispatch_command(&pool, decoded.request_id, decoded.db_id, decoded.command, decoded.ops).await;

		if debug_mode {
			log::debug!(
				"request_id={} command={:?} db_id={} status={:?} elapsed={:?}",
				response.request_id,
				decoded.command,
				decoded.db_id,
				response.status,
				started.elapsed()
			);
		}

		let encoded = encode_response(&response).map_err(anyhow::Error::from)?;
		write_frame_async(&mut stream, &encoded).await?;
	}
}

/// Single-op commands are handled directly by Pool; `Execute` batches are
/// enqueued per-op via the scheduler and the results reassembled in their
/// original order; `Query` bypasses the scheduler.
async fn dispatch_command<E: Engine>(pool: &Arc<Pool<E>>, request_id: u64, db_id: DbId, command: Command, ops: Vec<Operation>) -> Response {
	// A well-formed frame with a missing required field (no ops where a
	// command needs one) is `InvalidRequest`, not a silent default.
	let first_collection = |ops: &[Operation]| -> Result<String, Response> {
		match ops.first() {
			Some(o) => Ok(o.collection.clone()),
			None => Err(Response::from_error(request_id, &docdb_core::Error::InvalidRequest("command requires at least one op carrying a collection name".into()))),
		}
	};

	match command {
		Command::OpenDb => match first_collection(&ops) {
			Ok(name) => match pool.open_or_create_db(&name) {
				Ok(id) => Response::ok(request_id, id.to_le_bytes().to_vec()),
				Err(e) => Response::from_error(request_id, &e),
			},
			Err(resp) => resp,
		},
		Command::CloseDb => {
			pool.close_db(db_id);
			Response::ok(request_id, Vec::new())
		}
		Command::Execute => {
			if ops.is_empty() {
				return Response::from_error(request_id, &docdb_core::Error::InvalidRequest("Execute requires at least one op".into()));
			}
			execute_batch(pool, request_id, db_id, ops).await
		}
		Command::Stats => match pool.stats(db_id) {
			Ok(stats) => Response::ok(request_id, serde_json::to_vec(&stats).unwrap_or_default()),
			Err(e) => Response::from_error(request_id, &e),
		},
		Command::CreateCollection => match first_collection(&ops) {
			Ok(name) => match pool.create_collection(db_id, &name) {
				Ok(()) => Response::ok(request_id, Vec::new()),
				Err(e) => Response::from_error(request_id, &e),
			},
			Err(resp) => resp,
		},
		Command::DeleteCollection => match first_collection(&ops) {
			Ok(name) => match pool.delete_collection(db_id, &name) {
				Ok(()) => Response::ok(request_id, Vec::new()),
				Err(e) => Response::from_error(request_id, &e),
			},
			Err(resp) => resp,
		},
		Command::ListCollections => match pool.list_collections(db_id) {
			Ok(names) => Response::ok(request_id, serde_json::to_vec(&names).unwrap_or_default()),
			Err(e) => Response::from_error(request_id, &e),
		},
		Command::ListDbs => {
			let entries: Vec<_> = pool.list_dbs().into_iter().map(|e| (e.id, e.name)).collect();
			Response::ok(request_id, serde_json::to_vec(&entries).unwrap_or_default())
		}
		Command::Query => match ops.first() {
			Some(op) => match pool.query(db_id, &op.collection, &op.payload) {
				Ok(data) => Response::ok(request_id, data),
				Err(e) => Response::from_error(request_id, &e),
			},
			None => Response::from_error(request_id, &docdb_core::Error::InvalidRequest("Query requires an op carrying the target collection and filter".into())),
		},
		Command::Heal => match pool.heal(db_id) {
			Ok(report) => Response::ok(request_id, serde_json::to_vec(&report).unwrap_or_default()),
			Err(e) => Response::from_error(request_id, &e),
		},
		Command::HealAll => match pool.heal_all() {
			Ok(reports) => Response::ok(request_id, serde_json::to_vec(&reports).unwrap_or_default()),
			Err(e) => Response::from_error(request_id, &e),
		},
		Command::HealStats => match pool.heal_stats() {
			Ok(stats) => Response::ok(request_id, serde_json::to_vec(&stats).unwrap_or_default()),
			Err(e) => Response::from_error(request_id, &e),
		},
		Command::Metrics => {
			let sched = pool.scheduler();
			let metrics = serde_json::json!({
				"total_queued": sched.total_queued(),
				"worker_count": sched.worker_count(),
				"running_workers": sched.running_workers(),
				"waiting_workers": sched.waiting_workers(),
				"avg_queue_depth": sched.avg_queue_depth(),
				"global_memory_usage": pool.global_memory_usage(),
				"pick_count": sched.metrics.pick_count(),
				"avg_pick_ns": sched.metrics.avg_pick_ns(),
			});
			Response::ok(request_id, serde_json::to_vec(&metrics).unwrap_or_default())
		}
	}
}

/// Enqueue every op in the batch, in order, onto its own reply channel, then
/// await all replies and reassemble them by original index regardless of
/// worker interleaving.
async fn execute_batch<E: Engine>(pool: &Arc<Pool<E>>, request_id: u64, db_id: DbId, ops: Vec<Operation>) -> Response {
	if ops.iter().any(|op| matches!(op.op_type, OpType::CreateCollection | OpType::DeleteCollection)) {
		return Response::from_error(request_id, &docdb_core::Error::InvalidRequest("Execute does not carry collection-management ops".into()));
	}

	let mut receivers = Vec::with_capacity(ops.len());
	for (i, op) in ops.into_iter().enumerate() {
		let (tx, rx) = flume::bounded(1);
		pool.execute(Request { request_id: request_id.wrapping_add(i as u64), db_id, op, reply: tx });
		receivers.push(rx);
	}

	let mut results = Vec::with_capacity(receivers.len());
	for rx in receivers {
		let resp = rx.recv_async().await;
		let result: Result<Vec<u8>, String> = match resp {
			Ok(r) if r.status == Status::Ok => Ok(r.data),
			Ok(r) => Err(r.error.unwrap_or_else(|| "error".to_string())),
			Err(_) => Err("no reply received".to_string()),
		};
		results.push(result);
	}

	Response::ok(request_id, encode_batch_data(&results))
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory_engine::MemoryEngine;
	use docdb_core::{MemoryCaps, OpType, PoolConfig, SchedulerConfig};

	fn test_pool() -> Arc<Pool<MemoryEngine>> {
		let dir = std::env::temp_dir().join(format!("docdb-server-test-{}-{}", std::process::id(), rand_suffix()));
		let config = PoolConfig { data_dir: dir, scheduler: SchedulerConfig { configured_workers: 4, ..Default::default() }, ..Default::default() };
		let memcaps = Arc::new(MemoryCaps::new(config.global_memory_capacity_bytes));
		let engine = Arc::new(MemoryEngine::new(memcaps.clone()));
		let pool = Pool::new(config, engine, memcaps).unwrap();
		pool.start();
		pool
	}

	fn rand_suffix() -> u64 {
		use std::sync::atomic::{AtomicU64, Ordering};
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		COUNTER.fetch_add(1, Ordering::SeqCst)
	}

	fn op(op_type: OpType, collection: &str, doc_id: u64, payload: &[u8]) -> Operation {
		Operation { op_type, collection: collection.into(), doc_id, patch_ops: None, payload: payload.to_vec() }
	}

	#[async_std::test]
	async fn execute_with_no_ops_is_invalid_request() {
		let pool = test_pool();
		let id = pool.open_or_create_db("a").unwrap();
		let resp = dispatch_command(&pool, 1, id, Command::Execute, Vec::new()).await;
		assert_eq!(resp.status, Status::Error);
		pool.stop();
	}

	#[async_std::test]
	async fn open_db_with_no_ops_is_invalid_request() {
		let pool = test_pool();
		let resp = dispatch_command(&pool, 1, 0, Command::OpenDb, Vec::new()).await;
		assert_eq!(resp.status, Status::Error);
		pool.stop();
	}

	#[async_std::test]
	async fn batch_results_preserve_submission_order() {
		let pool = test_pool();
		let id = pool.open_or_create_db("batch").unwrap();
		pool.create_collection(id, "docs").unwrap();

		let ops = vec![
			op(OpType::Create, "docs", 1, b"{\"v\":1}"),
			op(OpType::Read, "docs", 1, b""),
			op(OpType::Delete, "docs", 1, b""),
		];
		let resp = dispatch_command(&pool, 7, id, Command::Execute, ops).await;
		assert_eq!(resp.status, Status::Ok);

		let decoded = docdb_core::decode_batch_data(&resp.data).unwrap();
		assert_eq!(decoded.len(), 3);
		assert_eq!(decoded[1], b"{\"v\":1}");
		pool.stop();
	}
}
