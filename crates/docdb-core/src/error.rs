use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error enum. One variant per error kind in the core's error
/// handling design; status codes sent on the wire are derived from these via
/// `Error::status`.
#[derive(Error, Debug)]
pub enum Error {
	/// Frame failed to decode, was oversized, or carried an unknown command.
	/// The connection that produced it must be closed.
	#[error("invalid frame: {0}")]
	InvalidFrame(String),

	/// Well-formed frame, but a required field was missing or empty.
	#[error("invalid request: {0}")]
	InvalidRequest(String),

	/// The pool/scheduler is shutting down or has shut down.
	#[error("pool stopped")]
	PoolStopped,

	/// A per-DB or global admission cap was exceeded.
	#[error("queue full")]
	QueueFull,

	/// Document, collection, or DB id not found, or DB not Active.
	#[error("not found: {0}")]
	NotFound(String),

	/// Duplicate create.
	#[error("conflict: {0}")]
	Conflict(String),

	/// A memory cap refused the allocation.
	#[error("memory limit exceeded")]
	MemoryLimit,

	/// A query exceeded its configured timeout.
	#[error("query timeout")]
	Timeout,

	/// Catalog name is already registered.
	#[error("already exists: {0}")]
	AlreadyExists(String),

	/// Anything else, forwarded verbatim from the engine or I/O layer.
	#[error("internal error: {0}")]
	Internal(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl From<String> for Error {
	fn from(e: String) -> Error {
		Error::Internal(e)
	}
}

impl From<&str> for Error {
	fn from(e: &str) -> Error {
		Error::Internal(e.to_string())
	}
}

impl<T> From<flume::SendError<T>> for Error {
	fn from(_: flume::SendError<T>) -> Error {
		Error::PoolStopped
	}
}

/// Status byte sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
	Ok = 0,
	Error = 1,
	NotFound = 2,
	MemoryLimit = 3,
	Conflict = 4,
}

impl Error {
	/// Map an internal error to the wire status byte that represents it.
	pub fn status(&self) -> Status {
		match self {
			Error::NotFound(_) => Status::NotFound,
			Error::Conflict(_) | Error::AlreadyExists(_) => Status::Conflict,
			Error::MemoryLimit => Status::MemoryLimit,
			_ => Status::Error,
		}
	}
}

/// Errors returned by an [`Engine`](crate::engine::Engine) implementation.
/// The Pool maps each variant to the corresponding [`Error`].
#[derive(Error, Debug)]
pub enum EngineError {
	#[error("document not found")]
	DocNotFound,
	#[error("document already exists")]
	DocExists,
	#[error("collection not found: {0}")]
	CollectionNotFound(String),
	#[error("memory limit exceeded")]
	MemoryLimit,
	#[error("{0}")]
	Other(String),
}

impl From<EngineError> for Error {
	fn from(e: EngineError) -> Error {
		match e {
			EngineError::DocNotFound => Error::NotFound("document not found".into()),
			EngineError::CollectionNotFound(c) => Error::NotFound(format!("collection not found: {c}")),
			EngineError::DocExists => Error::Conflict("document already exists".into()),
			EngineError::MemoryLimit => Error::MemoryLimit,
			EngineError::Other(msg) => Error::Internal(msg),
		}
	}
}
