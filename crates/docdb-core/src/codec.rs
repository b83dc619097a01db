//! Length-prefixed frame codec (C1). Bodies are packed little-endian
//! structs; this module has no socket awareness — callers hand it a fully
//! buffered frame body (or, for encoding, receive one back) and own the
//! length-prefix read/write on the transport themselves.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::error::{Error, Status};
use crate::model::{Command, Operation, OpType, Request, Response};

/// Hard cap on a frame body, matching the `u32` length prefix's practical
/// ceiling used throughout the protocol.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard cap on a collection name.
pub const MAX_COLLECTION_NAME: usize = 64;

fn invalid(msg: impl Into<String>) -> Error {
	Error::InvalidFrame(msg.into())
}

/// Read the `u32` LE length prefix from `r`. Returns `Ok(None)` on a clean
/// EOF before any bytes were read (the caller should close the connection);
/// any other short read is an `InvalidFrame`.
pub fn read_length_prefix<R: Read>(r: &mut R) -> Result<Option<u32>, Error> {
	let mut buf = [0u8; 4];
	match r.read_exact(&mut buf) {
		Ok(()) => {}
		Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	}
	let len = u32::from_le_bytes(buf);
	if len as usize > MAX_FRAME_SIZE {
		return Err(invalid(format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE} byte limit")));
	}
	Ok(Some(len))
}

/// Write the `u32` LE length prefix followed by `body`.
pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> Result<(), Error> {
	if body.len() > MAX_FRAME_SIZE {
		return Err(invalid(format!("frame of {} bytes exceeds {MAX_FRAME_SIZE} byte limit", body.len())));
	}
	w.write_u32::<LittleEndian>(body.len() as u32)?;
	w.write_all(body)?;
	Ok(())
}

fn read_bytes<R: Read>(r: &mut R, len: usize, what: &str) -> Result<Vec<u8>, Error> {
	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf).map_err(|_| invalid(format!("truncated {what}")))?;
	Ok(buf)
}

/// A decoded request frame body, plus the command it carries. `Execute`
/// carries `ops`; single-op commands (OpenDb, Stats, ...) carry at most one
/// synthetic `Operation` built by the caller as needed.
pub struct DecodedRequest {
	pub request_id: u64,
	pub db_id: u64,
	pub command: Command,
	pub ops: Vec<Operation>,
}

/// Decode a request frame body.
pub fn decode_request(body: &[u8]) -> Result<DecodedRequest, Error> {
	let mut c = Cursor::new(body);
	let request_id = c.read_u64::<LittleEndian>().map_err(|_| invalid("truncated request_id"))?;
	let db_id = c.read_u64::<LittleEndian>().map_err(|_| invalid("truncated db_id"))?;
	let command_byte = c.read_u8().map_err(|_| invalid("truncated command"))?;
	let command = Command::from_u8(command_byte).ok_or_else(|| invalid(format!("unknown command {command_byte}")))?;
	let op_count = c.read_u32::<LittleEndian>().map_err(|_| invalid("truncated op_count"))?;

	let mut ops = Vec::with_capacity(op_count as usize);
	for _ in 0..op_count {
		ops.push(decode_operation(&mut c)?);
	}
	Ok(DecodedRequest { request_id, db_id, command, ops })
}

fn decode_operation<R: Read>(r: &mut R) -> Result<Operation, Error> {
	let op_byte = r.read_u8().map_err(|_| invalid("truncated op_type"))?;
	let op_type = OpType::from_u8(op_byte).ok_or_else(|| invalid(format!("unknown op_type {op_byte}")))?;

	let collection_len = r.read_u16::<LittleEndian>().map_err(|_| invalid("truncated collection_len"))? as usize;
	if collection_len > MAX_COLLECTION_NAME {
		return Err(invalid(format!("collection name of {collection_len} bytes exceeds {MAX_COLLECTION_NAME} byte limit")));
	}
	let collection_bytes = read_bytes(r, collection_len, "collection name")?;
	let collection = String::from_utf8(collection_bytes).map_err(|_| invalid("collection name is not utf8"))?;

	let doc_id = r.read_u64::<LittleEndian>().map_err(|_| invalid("truncated doc_id"))?;

	let patch_ops = if op_type == OpType::Patch {
		let len = r.read_u32::<LittleEndian>().map_err(|_| invalid("truncated patch_ops_len"))? as usize;
		Some(read_bytes(r, len, "patch_ops")?)
	} else {
		None
	};

	let payload_len = r.read_u32::<LittleEndian>().map_err(|_| invalid("truncated payload_len"))? as usize;
	let payload = read_bytes(r, payload_len, "payload")?;

	Ok(Operation { op_type, collection, doc_id, patch_ops, payload })
}

fn encode_operation<W: Write>(w: &mut W, op: &Operation) -> Result<(), Error> {
	w.write_u8(op.op_type as u8)?;
	w.write_u16::<LittleEndian>(op.collection.len() as u16)?;
	w.write_all(op.collection.as_bytes())?;
	w.write_u64::<LittleEndian>(op.doc_id)?;
	if op.op_type == OpType::Patch {
		let patch = op.patch_ops.as_deref().unwrap_or(&[]);
		w.write_u32::<LittleEndian>(patch.len() as u32)?;
		w.write_all(patch)?;
	}
	w.write_u32::<LittleEndian>(op.payload.len() as u32)?;
	w.write_all(&op.payload)?;
	Ok(())
}

/// Encode a request frame body. Used by tests and by any in-process caller
/// constructing requests without going through a socket.
pub fn encode_request(req: &DecodedRequest) -> Result<Vec<u8>, Error> {
	let mut buf = Vec::new();
	buf.write_u64::<LittleEndian>(req.request_id)?;
	buf.write_u64::<LittleEndian>(req.db_id)?;
	buf.write_u8(req.command as u8)?;
	buf.write_u32::<LittleEndian>(req.ops.len() as u32)?;
	for op in &req.ops {
		encode_operation(&mut buf, op)?;
	}
	Ok(buf)
}

/// Encode a response frame body: `u64 request_id; u8 status; u32 data_len; data_bytes`.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>, Error> {
	let mut buf = Vec::new();
	buf.write_u64::<LittleEndian>(resp.request_id)?;
	buf.write_u8(resp.status as u8)?;
	buf.write_u32::<LittleEndian>(resp.data.len() as u32)?;
	buf.write_all(&resp.data)?;
	Ok(buf)
}

pub fn decode_response(body: &[u8]) -> Result<Response, Error> {
	let mut c = Cursor::new(body);
	let request_id = c.read_u64::<LittleEndian>().map_err(|_| invalid("truncated request_id"))?;
	let status_byte = c.read_u8().map_err(|_| invalid("truncated status"))?;
	let status = match status_byte {
		0 => Status::Ok,
		1 => Status::Error,
		2 => Status::NotFound,
		3 => Status::MemoryLimit,
		4 => Status::Conflict,
		b => return Err(invalid(format!("unknown status byte {b}"))),
	};
	let data_len = c.read_u32::<LittleEndian>().map_err(|_| invalid("truncated data_len"))? as usize;
	let data = read_bytes(&mut c, data_len, "data")?;
	Ok(Response { request_id, status, data, error: None })
}

/// Encode the `Execute` batch response payload: `u32 count; count x (u32 len; len bytes)`.
/// A non-OK individual op result's bytes are the UTF-8 error text.
pub fn encode_batch_data(results: &[Result<Vec<u8>, String>]) -> Vec<u8> {
	let mut buf = Vec::new();
	buf.write_u32::<LittleEndian>(results.len() as u32).unwrap();
	for r in results {
		let bytes: &[u8] = match r {
			Ok(data) => data,
			Err(msg) => msg.as_bytes(),
		};
		buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
		buf.write_all(bytes).unwrap();
	}
	buf
}

pub fn decode_batch_data(body: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
	let mut c = Cursor::new(body);
	let count = c.read_u32::<LittleEndian>().map_err(|_| invalid("truncated batch count"))?;
	let mut out = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let len = c.read_u32::<LittleEndian>().map_err(|_| invalid("truncated batch entry len"))? as usize;
		out.push(read_bytes(&mut c, len, "batch entry")?);
	}
	Ok(out)
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample_request() -> DecodedRequest {
		DecodedRequest {
			request_id: 42,
			db_id: 7,
			command: Command::Execute,
			ops: vec![
				Operation { op_type: OpType::Create, collection: "docs".into(), doc_id: 1, patch_ops: None, payload: b"{\"v\":1}".to_vec() },
				Operation { op_type: OpType::Patch, collection: "docs".into(), doc_id: 1, patch_ops: Some(b"[{\"op\":\"replace\"}]".to_vec()), payload: Vec::new() },
			],
		}
	}

	#[test]
	fn request_round_trips() {
		let req = sample_request();
		let encoded = encode_request(&req).unwrap();
		let decoded = decode_request(&encoded).unwrap();
		assert_eq!(decoded.request_id, req.request_id);
		assert_eq!(decoded.db_id, req.db_id);
		assert_eq!(decoded.command, req.command);
		assert_eq!(decoded.ops, req.ops);
	}

	#[test]
	fn response_round_trips() {
		let resp = Response::ok(1, b"hello".to_vec());
		let encoded = encode_response(&resp).unwrap();
		let decoded = decode_response(&encoded).unwrap();
		assert_eq!(decoded.request_id, resp.request_id);
		assert_eq!(decoded.status, resp.status);
		assert_eq!(decoded.data, resp.data);
	}

	#[test]
	fn batch_data_round_trips() {
		let results: Vec<Result<Vec<u8>, String>> =
			vec![Ok(b"one".to_vec()), Err("boom".to_string()), Ok(Vec::new())];
		let encoded = encode_batch_data(&results);
		let decoded = decode_batch_data(&encoded).unwrap();
		assert_eq!(decoded, vec![b"one".to_vec(), b"boom".to_vec(), Vec::new()]);
	}

	#[test]
	fn truncated_frames_are_invalid() {
		let req = sample_request();
		let encoded = encode_request(&req).unwrap();
		for cut in [0, 1, 8, 16, 17, encoded.len() - 1] {
			let truncated = &encoded[..cut.min(encoded.len())];
			assert!(decode_request(truncated).is_err(), "cut={cut} should have failed to decode");
		}
	}

	#[test]
	fn unknown_command_is_invalid() {
		let mut buf = Vec::new();
		buf.write_u64::<LittleEndian>(1).unwrap();
		buf.write_u64::<LittleEndian>(1).unwrap();
		buf.write_u8(200).unwrap();
		buf.write_u32::<LittleEndian>(0).unwrap();
		assert!(decode_request(&buf).is_err());
	}

	#[test]
	fn oversized_collection_name_is_rejected() {
		let mut op = Vec::new();
		op.write_u8(OpType::Create as u8).unwrap();
		op.write_u16::<LittleEndian>((MAX_COLLECTION_NAME + 1) as u16).unwrap();
		op.extend(vec![b'a'; MAX_COLLECTION_NAME + 1]);
		op.write_u64::<LittleEndian>(1).unwrap();
		op.write_u32::<LittleEndian>(0).unwrap();
		let mut c = Cursor::new(op.as_slice());
		assert!(decode_operation(&mut c).is_err());
	}

	#[test]
	fn oversized_frame_is_rejected_at_length_prefix() {
		let mut bogus_len = Vec::new();
		bogus_len.write_u32::<LittleEndian>((MAX_FRAME_SIZE + 1) as u32).unwrap();
		let mut r = Cursor::new(bogus_len);
		assert!(read_length_prefix(&mut r).is_err());
	}
}
