// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

// Entries and their storage encoding.
//
// Encoded entry:
// [NAMESPACE][SUBSPACE][TIMESTAMP: 8][PAYLOAD_LEN: 8][DIGEST][PATH_LEN: 4][PATH]
// NAMESPACE, SUBSPACE, DIGEST - scheme-encoded, self-delimiting.
// TIMESTAMP, PAYLOAD_LEN - big-endian u64.
// PATH_LEN - big-endian u32 byte length of the encoded PATH.

use std::cmp::Ordering;
use crate::error::{Error, Result};
use crate::path::Path;
use crate::scheme::{
	NamespaceScheme, PayloadScheme, SchemeEntry, Schemes, SubspaceScheme,
};

/// Microseconds since the Unix epoch. Not required to be monotonic; ordering
/// is lexicographic on the big-endian encoding, which matches numeric order.
pub type Timestamp = u64;

pub fn now_microseconds() -> Timestamp {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_micros() as u64)
		.unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry<N, S, D> {
	pub namespace: N,
	pub subspace: S,
	pub path: Path,
	pub timestamp: Timestamp,
	pub payload_length: u64,
	pub payload_digest: D,
}

impl<N, S, D: Ord> Entry<N, S, D> {
	/// An entry is newer than another when its timestamp is greater, with
	/// ties broken by payload digest and then payload length, each
	/// greater-wins.
	pub fn cmp_newer_than(&self, other: &Self) -> Ordering {
		self.timestamp
			.cmp(&other.timestamp)
			.then_with(|| self.payload_digest.cmp(&other.payload_digest))
			.then_with(|| self.payload_length.cmp(&other.payload_length))
	}

	pub fn is_newer_than(&self, other: &Self) -> bool {
		self.cmp_newer_than(other) == Ordering::Greater
	}
}

pub fn encode_entry<S: Schemes>(schemes: &S, entry: &SchemeEntry<S>) -> Vec<u8> {
	let encoded_path = entry.path.encode();
	let mut out = schemes.namespace().encode(&entry.namespace);
	out.extend_from_slice(&schemes.subspace().encode(&entry.subspace));
	out.extend_from_slice(&entry.timestamp.to_be_bytes());
	out.extend_from_slice(&entry.payload_length.to_be_bytes());
	out.extend_from_slice(&schemes.payload().encode(&entry.payload_digest));
	out.extend_from_slice(&(encoded_path.len() as u32).to_be_bytes());
	out.extend_from_slice(&encoded_path);
	out
}

fn read_u64(bytes: &[u8], pos: usize) -> Result<u64> {
	let slice = bytes
		.get(pos..pos + 8)
		.ok_or_else(|| Error::Corruption("truncated entry".into()))?;
	let mut buf = [0u8; 8];
	buf.copy_from_slice(slice);
	Ok(u64::from_be_bytes(buf))
}

pub fn decode_entry<S: Schemes>(
	schemes: &S,
	bytes: &[u8],
) -> Result<(SchemeEntry<S>, usize)> {
	let (namespace, mut pos) = schemes.namespace().decode(bytes)?;
	let (subspace, used) = schemes
		.subspace()
		.decode(bytes.get(pos..).ok_or_else(|| Error::Corruption("truncated entry".into()))?)?;
	pos += used;
	let timestamp = read_u64(bytes, pos)?;
	pos += 8;
	let payload_length = read_u64(bytes, pos)?;
	pos += 8;
	let (payload_digest, used) = schemes
		.payload()
		.decode(bytes.get(pos..).ok_or_else(|| Error::Corruption("truncated entry".into()))?)?;
	pos += used;
	let path_len = {
		let slice = bytes
			.get(pos..pos + 4)
			.ok_or_else(|| Error::Corruption("truncated entry".into()))?;
		let mut buf = [0u8; 4];
		buf.copy_from_slice(slice);
		u32::from_be_bytes(buf) as usize
	};
	pos += 4;
	let path = Path::decode(
		bytes
			.get(pos..pos + path_len)
			.ok_or_else(|| Error::Corruption("truncated entry".into()))?,
	)?;
	pos += path_len;
	Ok((
		Entry { namespace, subspace, path, timestamp, payload_length, payload_digest },
		pos,
	))
}
