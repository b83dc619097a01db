//! Persistent registry of logical databases (C2). `Create`/`Delete` append
//! a record to `DataDir/.catalog`; `Load` replays that log so that after a
//! crash every previously returned id still resolves.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::model::{CatalogEntry, DbId, DbStatus};

const RECORD_CREATE: u8 = 1;
const RECORD_DELETE: u8 = 2;

struct Inner {
	by_id: HashMap<DbId, CatalogEntry>,
	by_name: HashMap<String, DbId>,
}

pub struct Catalog {
	path: Option<PathBuf>,
	file: Mutex<Option<File>>,
	inner: Mutex<Inner>,
	next_id: AtomicU64,
}

fn validate_name(name: &str) -> Result<()> {
	if name.is_empty() {
		return Err(Error::InvalidRequest("database name must not be empty".into()));
	}
	if name.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
		return Err(Error::InvalidRequest(format!("database name `{name}` contains control characters or path separators")));
	}
	Ok(())
}

fn now_unix() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl Catalog {
	/// In-memory catalog with no on-disk log, for tests that don't need
	/// crash recovery.
	pub fn in_memory() -> Self {
		Self {
			path: None,
			file: Mutex::new(None),
			inner: Mutex::new(Inner { by_id: HashMap::new(), by_name: HashMap::new() }),
			next_id: AtomicU64::new(1),
		}
	}

	/// Load (creating if absent) the catalog log at `data_dir/.catalog`,
	/// replaying every record to reconstruct in-memory state.
	pub fn load(data_dir: &Path) -> Result<Self> {
		std::fs::create_dir_all(data_dir)?;
		let path = data_dir.join(".catalog");
		let mut by_id = HashMap::new();
		let mut by_name = HashMap::new();
		let mut max_id = 0u64;

		if path.exists() {
			let f = File::open(&path)?;
			let mut reader = BufReader::new(f);
			loop {
				let mut len_buf = [0u8; 4];
				match reader.read_exact(&mut len_buf) {
					Ok(()) => {}
					Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
					Err(e) => return Err(e.into()),
				}
				let len = u32::from_le_bytes(len_buf) as usize;
				let mut body = vec![0u8; len];
				reader.read_exact(&mut body).map_err(|_| Error::InvalidFrame("truncated catalog record".into()))?;
				apply_record(&body, &mut by_id, &mut by_name, &mut max_id)?;
			}
		}

		let file = OpenOptions::new().create(true).append(true).open(&path)?;
		Ok(Self {
			path: Some(path),
			file: Mutex::new(Some(file)),
			inner: Mutex::new(Inner { by_id, by_name }),
			next_id: AtomicU64::new(max_id + 1),
		})
	}

	fn append(&self, body: &[u8]) -> Result<()> {
		let mut guard = self.file.lock().unwrap();
		if let Some(file) = guard.as_mut() {
			let mut framed = Vec::with_capacity(4 + body.len());
			framed.write_u32::<LittleEndian>(body.len() as u32)?;
			framed.extend_from_slice(body);
			file.write_all(&framed)?;
			file.flush()?;
		}
		Ok(())
	}

	/// Create a new entry, or fail with `AlreadyExists` if `name` is taken
	/// by a non-deleted entry. Atomic: under the catalog's single lock, a
	/// concurrent `Create` of the same name returns `AlreadyExists` to all
	/// but the first.
	pub fn create(&self, name: &str) -> Result<DbId> {
		validate_name(name)?;
		let mut inner = self.inner.lock().unwrap();
		if inner.by_name.contains_key(name) {
			return Err(Error::AlreadyExists(name.to_string()));
		}
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let created_at = now_unix();

		let mut body = Vec::new();
		body.push(RECORD_CREATE);
		body.write_u64::<LittleEndian>(id)?;
		body.write_u64::<LittleEndian>(created_at)?;
		body.write_u16::<LittleEndian>(name.len() as u16)?;
		body.extend_from_slice(name.as_bytes());
		self.append(&body)?;

		inner.by_id.insert(id, CatalogEntry { id, name: name.to_string(), status: DbStatus::Active, created_at });
		inner.by_name.insert(name.to_string(), id);
		Ok(id)
	}

	/// Mark `id` deleted. Idempotent: deleting an already-deleted or
	/// unknown id succeeds silently.
	pub fn delete(&self, id: DbId) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(entry) = inner.by_id.get_mut(&id) {
			if entry.status == DbStatus::Deleting {
				return Ok(());
			}
			entry.status = DbStatus::Deleting;
			let name = entry.name.clone();
			inner.by_name.remove(&name);

			let mut body = Vec::new();
			body.push(RECORD_DELETE);
			body.write_u64::<LittleEndian>(id)?;
			self.append(&body)?;
		}
		Ok(())
	}

	pub fn get_by_id(&self, id: DbId) -> Option<CatalogEntry> {
		self.inner.lock().unwrap().by_id.get(&id).cloned()
	}

	pub fn get_by_name(&self, name: &str) -> Option<CatalogEntry> {
		let inner = self.inner.lock().unwrap();
		inner.by_name.get(name).and_then(|id| inner.by_id.get(id)).cloned()
	}

	pub fn list(&self) -> Vec<CatalogEntry> {
		let inner = self.inner.lock().unwrap();
		let mut entries: Vec<_> = inner.by_id.values().cloned().collect();
		entries.sort_by_key(|e| e.id);
		entries
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}
}

fn apply_record(
	body: &[u8],
	by_id: &mut HashMap<DbId, CatalogEntry>,
	by_name: &mut HashMap<String, DbId>,
	max_id: &mut u64,
) -> Result<()> {
	let mut c = Cursor::new(body);
	let kind = c.read_u8().map_err(|_| Error::InvalidFrame("truncated catalog record kind".into()))?;
	match kind {
		RECORD_CREATE => {
			let id = c.read_u64::<LittleEndian>().map_err(|_| Error::InvalidFrame("truncated catalog id".into()))?;
			let created_at = c.read_u64::<LittleEndian>().map_err(|_| Error::InvalidFrame("truncated catalog timestamp".into()))?;
			let name_len = c.read_u16::<LittleEndian>().map_err(|_| Error::InvalidFrame("truncated catalog name len".into()))? as usize;
			let mut name_buf = vec![0u8; name_len];
			c.read_exact(&mut name_buf).map_err(|_| Error::InvalidFrame("truncated catalog name".into()))?;
			let name = String::from_utf8(name_buf).map_err(|_| Error::InvalidFrame("catalog name is not utf8".into()))?;
			*max_id = (*max_id).max(id);
			by_name.insert(name.clone(), id);
			by_id.insert(id, CatalogEntry { id, name, status: DbStatus::Active, created_at });
		}
		RECORD_DELETE => {
			let id = c.read_u64::<LittleEndian>().map_err(|_| Error::InvalidFrame("truncated catalog id".into()))?;
			*max_id = (*max_id).max(id);
			if let Some(entry) = by_id.get_mut(&id) {
				entry.status = DbStatus::Deleting;
				by_name.remove(&entry.name.clone());
			}
		}
		other => return Err(Error::InvalidFrame(format!("unknown catalog record kind {other}"))),
	}
	Ok(())
}
