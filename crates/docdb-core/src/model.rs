//! Wire-independent data model: logical DBs, catalog entries, requests,
//! operations and responses.

use std::time::Duration;

/// Numeric id assigned to a logical database by the catalog. Never reused.
pub type DbId = u64;

/// Lifecycle status of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
	Active,
	Deleting,
}

/// A single CRUD/patch/collection action inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
	Create = 1,
	Read = 2,
	Update = 3,
	Delete = 4,
	Patch = 5,
	CreateCollection = 6,
	DeleteCollection = 7,
}

impl OpType {
	pub fn from_u8(b: u8) -> Option<Self> {
		Some(match b {
			1 => OpType::Create,
			2 => OpType::Read,
			3 => OpType::Update,
			4 => OpType::Delete,
			5 => OpType::Patch,
			6 => OpType::CreateCollection,
			7 => OpType::DeleteCollection,
			_ => return None,
		})
	}
}

/// Top-level wire commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
	OpenDb = 1,
	CloseDb = 2,
	Execute = 3,
	Stats = 4,
	CreateCollection = 5,
	DeleteCollection = 6,
	ListCollections = 7,
	ListDbs = 8,
	Query = 9,
	Heal = 10,
	HealAll = 11,
	HealStats = 12,
	Metrics = 13,
}

impl Command {
	pub fn from_u8(b: u8) -> Option<Self> {
		Some(match b {
			1 => Command::OpenDb,
			2 => Command::CloseDb,
			3 => Command::Execute,
			4 => Command::Stats,
			5 => Command::CreateCollection,
			6 => Command::DeleteCollection,
			7 => Command::ListCollections,
			8 => Command::ListDbs,
			9 => Command::Query,
			10 => Command::Heal,
			11 => Command::HealAll,
			12 => Command::HealStats,
			13 => Command::Metrics,
			_ => return None,
		})
	}
}

/// One operation inside a batch `Execute` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
	pub op_type: OpType,
	pub collection: String,
	pub doc_id: u64,
	/// Present only when `op_type == Patch`; raw JSON patch document.
	pub patch_ops: Option<Vec<u8>>,
	pub payload: Vec<u8>,
}

/// The unit delivered to the scheduler. Lifecycle: created by the IPC
/// handler, enqueued exactly once, popped exactly once, replied on exactly
/// once, then discarded.
pub struct Request {
	pub request_id: u64,
	pub db_id: DbId,
	pub op: Operation,
	/// Single-use, single-producer/single-consumer, buffered-to-1 reply
	/// channel so the worker that executes this request never blocks on
	/// send.
	pub reply: flume::Sender<Response>,
}

/// Result of executing a single op or single-op command.
#[derive(Debug, Clone)]
pub struct Response {
	pub request_id: u64,
	pub status: crate::error::Status,
	pub data: Vec<u8>,
	pub error: Option<String>,
}

impl Response {
	pub fn ok(request_id: u64, data: Vec<u8>) -> Self {
		Self { request_id, status: crate::error::Status::Ok, data, error: None }
	}

	pub fn from_error(request_id: u64, err: &crate::error::Error) -> Self {
		let message = err.to_string();
		Self { request_id, status: err.status(), data: message.as_bytes().to_vec(), error: Some(message) }
	}
}

/// Catalog entry, persisted atomically at `Create`/`Delete`.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
	pub id: DbId,
	pub name: String,
	pub status: DbStatus,
	pub created_at: u64,
}

/// Engine-reported per-DB maintenance summary, surfaced verbatim by Heal.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealReport {
	pub db_id: DbId,
	pub repaired: u64,
	pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HealStats {
	pub total_repaired: u64,
	pub last_run_ms: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DbStats {
	pub db_id: DbId,
	pub collection_count: u64,
	pub document_count: u64,
	pub bytes_used: u64,
}

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn from_error_carries_the_message_in_data() {
		let err = crate::error::Error::NotFound("doc 1".into());
		let resp = Response::from_error(7, &err);
		assert_eq!(resp.status, crate::error::Status::NotFound);
		assert_eq!(resp.data, b"not found: doc 1");
		assert_eq!(resp.error.as_deref(), Some("not found: doc 1"));
	}
}
