//! The interface the core requires of its storage collaborator. The
//! storage engine itself (WAL, page layout, indexes, recovery, the query
//! evaluator) is out of scope; this trait is the seam Pool dispatches
//! through.

use std::time::Duration;

use crate::error::EngineError;
use crate::model::{DbId, DbStats, HealReport, HealStats, Operation};

/// Per-DB CRUD/patch/collection/query/heal operations. Implementations
/// must serialize writes to a single `db` internally, OR rely on the Pool
/// pinning at most one in-flight worker per DB (this implementation's
/// decision — see DESIGN.md); either way `Engine` methods may be called
/// concurrently across *different* `db` ids.
pub trait Engine: Send + Sync + 'static {
	/// Open (or create on-disk state for) a logical DB. Called by Pool's
	/// lazy-open path; concurrent opens for the same id must collapse to
	/// a single call from the Pool's perspective, but Engine implementations
	/// may additionally assert they are never called twice for a live id.
	fn open(&self, db: DbId, name: &str) -> Result<(), EngineError>;

	/// Close the in-memory handle. On-disk state is left intact.
	fn close(&self, db: DbId);

	/// Dispatch one CRUD/patch op against an already-open DB.
	fn dispatch(&self, db: DbId, op: &Operation) -> Result<Vec<u8>, EngineError>;

	fn create_collection(&self, db: DbId, name: &str) -> Result<(), EngineError>;
	fn delete_collection(&self, db: DbId, name: &str) -> Result<(), EngineError>;
	fn list_collections(&self, db: DbId) -> Result<Vec<String>, EngineError>;

	/// Run a query, bounded by `timeout`. Implementations should respect
	/// the timeout themselves; the caller (the connection handler) also
	/// enforces it from the outside.
	fn query(&self, db: DbId, collection: &str, filter: &[u8], timeout: Duration) -> Result<Vec<u8>, EngineError>;

	fn heal(&self, db: DbId) -> Result<HealReport, EngineError>;
	fn heal_all(&self) -> Result<Vec<HealReport>, EngineError>;
	fn heal_stats(&self) -> Result<HealStats, EngineError>;

	fn stats(&self, db: DbId) -> Result<DbStats, EngineError>;
}
