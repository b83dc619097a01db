//! Multi-tenant request scheduler and worker pool fronting a pluggable
//! document storage [`Engine`]. See the individual modules for the
//! catalog, wire codec, memory accounting, scheduler and pool components.

mod catalog;
mod codec;
mod config;
mod engine;
mod error;
mod memcaps;
mod model;
mod pool;
mod scheduler;

pub use catalog::Catalog;
pub use codec::{
	decode_batch_data, decode_request, decode_response, encode_batch_data, encode_request, encode_response, read_length_prefix,
	write_frame, DecodedRequest, MAX_COLLECTION_NAME, MAX_FRAME_SIZE,
};
pub use config::{CoreConfig, MemoryConfig, QueryConfig};
pub use engine::Engine;
pub use error::{EngineError, Error, Result, Status};
pub use memcaps::MemoryCaps;
pub use model::{
	CatalogEntry, Command, DbId, DbStats, DbStatus, HealReport, HealStats, OpType, Operation, Request, Response,
	DEFAULT_QUERY_TIMEOUT,
};
pub use pool::{Pool, PoolConfig};
pub use scheduler::{RequestHandler, Scheduler, SchedulerConfig, SchedulerMetrics};
