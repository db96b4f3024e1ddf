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

// Three-dimensional entry index: one summarisable storage per ordering of
// the (subspace, path, timestamp) triple, all holding the same entries.
//
// Storage keys:
// SPT - [SUBSPACE][PATH][TIMESTAMP: 8]
// PTS - [PATH][TIMESTAMP: 8][SUBSPACE]
// TSP - [TIMESTAMP: 8][SUBSPACE][PATH]
// PATH is the escaped encoding of path.rs; its byte length is recoverable
// only from the stored value, which is why every key decode starts there.
//
// Stored value:
// [PATH_LEN: 4][PAYLOAD_LEN: 8][PAYLOAD_DIGEST][TOKEN_DIGEST]

use std::sync::Arc;
use crate::driver::{Atom, Driver};
use crate::entry::{Entry, Timestamp};
use crate::error::{Error, Result};
use crate::monoid::{RangeSummary, SummarisableStorage, SummaryMonoid};
use crate::path::{successor_bytes, Path};
use crate::scheme::{
	FingerprintScheme, Fingerprint, NamespaceId, PayloadDigest, PayloadScheme,
	SchemeEntry, Schemes, SubspaceScheme,
};
use crate::skiplist::SkipList;
use crate::tree::MonoidTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
	Subspace,
	Path,
	Timestamp,
}

/// Half-open range of timestamps; `end` `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
	pub start: Timestamp,
	pub end: Option<Timestamp>,
}

impl TimeRange {
	pub fn new(start: Timestamp, end: Option<Timestamp>) -> TimeRange {
		TimeRange { start, end }
	}

	pub fn all() -> TimeRange {
		TimeRange { start: 0, end: None }
	}

	pub fn contains(&self, timestamp: Timestamp) -> bool {
		timestamp >= self.start && self.end.map_or(true, |end| timestamp < end)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AreaSubspace<S> {
	Any,
	Id(S),
}

/// Restriction of the index to one subspace (or all), a path prefix, and a
/// time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area<S> {
	pub subspace: AreaSubspace<S>,
	pub path_prefix: Path,
	pub times: TimeRange,
}

impl<S: Clone + Ord> Area<S> {
	pub fn full() -> Area<S> {
		Area {
			subspace: AreaSubspace::Any,
			path_prefix: Path::empty(),
			times: TimeRange::all(),
		}
	}

	pub fn subspace_path(subspace: S, path_prefix: Path) -> Area<S> {
		Area { subspace: AreaSubspace::Id(subspace), path_prefix, times: TimeRange::all() }
	}

	pub fn includes<N, D>(&self, entry: &Entry<N, S, D>) -> bool {
		let subspace_ok = match &self.subspace {
			AreaSubspace::Any => true,
			AreaSubspace::Id(id) => *id == entry.subspace,
		};
		subspace_ok
			&& self.path_prefix.is_prefix_of(&entry.path)
			&& self.times.contains(entry.timestamp)
	}
}

pub(crate) fn encode_index_value<S: Schemes>(
	schemes: &S,
	entry: &SchemeEntry<S>,
	token_digest: &PayloadDigest<S>,
) -> Vec<u8> {
	let encoded_path = entry.path.encode();
	let mut out = (encoded_path.len() as u32).to_be_bytes().to_vec();
	out.extend_from_slice(&entry.payload_length.to_be_bytes());
	out.extend_from_slice(&schemes.payload().encode(&entry.payload_digest));
	out.extend_from_slice(&schemes.payload().encode(token_digest));
	out
}

fn split_u64(bytes: &[u8], pos: usize) -> Result<u64> {
	let slice = bytes
		.get(pos..pos + 8)
		.ok_or_else(|| Error::Corruption("truncated index data".into()))?;
	let mut buf = [0u8; 8];
	buf.copy_from_slice(slice);
	Ok(u64::from_be_bytes(buf))
}

struct IndexValue<D> {
	path_len: usize,
	payload_length: u64,
	payload_digest: D,
	token_digest: D,
}

fn decode_index_value<S: Schemes>(
	schemes: &S,
	bytes: &[u8],
) -> Result<IndexValue<PayloadDigest<S>>> {
	let path_len = {
		let slice = bytes
			.get(..4)
			.ok_or_else(|| Error::Corruption("truncated index value".into()))?;
		u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]) as usize
	};
	let payload_length = split_u64(bytes, 4)?;
	let (payload_digest, used) = schemes
		.payload()
		.decode(bytes.get(12..).ok_or_else(|| Error::Corruption("truncated index value".into()))?)?;
	let (token_digest, _) = schemes.payload().decode(
		bytes
			.get(12 + used..)
			.ok_or_else(|| Error::Corruption("truncated index value".into()))?,
	)?;
	Ok(IndexValue { path_len, payload_length, payload_digest, token_digest })
}

pub(crate) fn decode_index_kv<S: Schemes>(
	schemes: &S,
	namespace: &NamespaceId<S>,
	order: QueryOrder,
	key: &[u8],
	value: &[u8],
) -> Result<(SchemeEntry<S>, PayloadDigest<S>)> {
	let truncated = || Error::Corruption("truncated index key".into());
	let parsed = decode_index_value(schemes, value)?;
	let (subspace, path, timestamp) = match order {
		QueryOrder::Subspace => {
			let (subspace, used) = schemes.subspace().decode(key)?;
			let path = Path::decode(
				key.get(used..used + parsed.path_len).ok_or_else(truncated)?,
			)?;
			let timestamp = split_u64(key, used + parsed.path_len)?;
			(subspace, path, timestamp)
		}
		QueryOrder::Path => {
			let path =
				Path::decode(key.get(..parsed.path_len).ok_or_else(truncated)?)?;
			let timestamp = split_u64(key, parsed.path_len)?;
			let (subspace, _) = schemes
				.subspace()
				.decode(key.get(parsed.path_len + 8..).ok_or_else(truncated)?)?;
			(subspace, path, timestamp)
		}
		QueryOrder::Timestamp => {
			let timestamp = split_u64(key, 0)?;
			let (subspace, used) =
				schemes.subspace().decode(key.get(8..).ok_or_else(truncated)?)?;
			let path = Path::decode(
				key.get(8 + used..8 + used + parsed.path_len).ok_or_else(truncated)?,
			)?;
			(subspace, path, timestamp)
		}
	};
	Ok((
		Entry {
			namespace: namespace.clone(),
			subspace,
			path,
			timestamp,
			payload_length: parsed.payload_length,
			payload_digest: parsed.payload_digest,
		},
		parsed.token_digest,
	))
}

/// Lifts raw index pairs into entry fingerprints for the summarisable
/// storages.
pub struct EntryMonoid<S: Schemes> {
	schemes: Arc<S>,
	namespace: NamespaceId<S>,
	order: QueryOrder,
}

impl<S: Schemes> EntryMonoid<S> {
	pub fn new(schemes: Arc<S>, namespace: NamespaceId<S>, order: QueryOrder) -> Self {
		EntryMonoid { schemes, namespace, order }
	}
}

impl<S: Schemes> SummaryMonoid for EntryMonoid<S> {
	type Summary = Fingerprint<S>;

	fn neutral(&self) -> Fingerprint<S> {
		self.schemes.fingerprint().neutral()
	}

	fn lift(&self, key: &[u8], value: &[u8]) -> Result<Fingerprint<S>> {
		let (entry, _) =
			decode_index_kv(&*self.schemes, &self.namespace, self.order, key, value)?;
		Ok(self.schemes.fingerprint().lift_singleton(&entry))
	}

	fn combine(&self, a: &Fingerprint<S>, b: &Fingerprint<S>) -> Fingerprint<S> {
		self.schemes.fingerprint().combine(a, b)
	}

	fn encode(&self, summary: &Fingerprint<S>) -> Vec<u8> {
		self.schemes.fingerprint().encode_fingerprint(summary)
	}

	fn decode(&self, bytes: &[u8]) -> Result<(Fingerprint<S>, usize)> {
		self.schemes.fingerprint().decode_fingerprint(bytes)
	}
}

pub struct TripleStorage<S: Schemes, St> {
	schemes: Arc<S>,
	namespace: NamespaceId<S>,
	spt: St,
	pts: St,
	tsp: St,
}

pub type PersistentIndex<S, D> = TripleStorage<S, SkipList<EntryMonoid<S>, D>>;
pub type MemoryIndex<S> = TripleStorage<S, MonoidTree<EntryMonoid<S>>>;

impl<S: Schemes, D: Driver> PersistentIndex<S, D> {
	pub fn persistent(
		schemes: Arc<S>,
		namespace: NamespaceId<S>,
		driver: Arc<D>,
	) -> Self {
		let storage = |order: QueryOrder, tag: &str| {
			SkipList::open(
				driver.clone(),
				vec![Atom::Str("entries".into()), Atom::Str(tag.into())],
				EntryMonoid::new(schemes.clone(), namespace.clone(), order),
			)
		};
		TripleStorage {
			spt: storage(QueryOrder::Subspace, "spt"),
			pts: storage(QueryOrder::Path, "pts"),
			tsp: storage(QueryOrder::Timestamp, "tsp"),
			schemes,
			namespace,
		}
	}
}

impl<S: Schemes> MemoryIndex<S> {
	pub fn in_memory(schemes: Arc<S>, namespace: NamespaceId<S>) -> Self {
		let storage = |order: QueryOrder| {
			MonoidTree::new(EntryMonoid::new(schemes.clone(), namespace.clone(), order))
		};
		TripleStorage {
			spt: storage(QueryOrder::Subspace),
			pts: storage(QueryOrder::Path),
			tsp: storage(QueryOrder::Timestamp),
			schemes,
			namespace,
		}
	}
}

impl<S, St> TripleStorage<S, St>
where
	S: Schemes,
	St: SummarisableStorage<Summary = Fingerprint<S>>,
{
	fn keys_for(&self, entry: &SchemeEntry<S>) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
		let subspace = self.schemes.subspace().encode(&entry.subspace);
		let path = entry.path.encode();
		let timestamp = entry.timestamp.to_be_bytes();

		let mut spt = subspace.clone();
		spt.extend_from_slice(&path);
		spt.extend_from_slice(&timestamp);

		let mut pts = path.clone();
		pts.extend_from_slice(&timestamp);
		pts.extend_from_slice(&subspace);

		let mut tsp = timestamp.to_vec();
		tsp.extend_from_slice(&subspace);
		tsp.extend_from_slice(&path);

		(spt, pts, tsp)
	}

	fn subspace_range(
		&self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
	) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
		match &area.subspace {
			AreaSubspace::Any => (None, None),
			AreaSubspace::Id(id) => {
				let mut lower = self.schemes.subspace().encode(id);
				lower.extend_from_slice(&area.path_prefix.encode());
				let upper = successor_bytes(&lower);
				(Some(lower), upper)
			}
		}
	}

	fn path_range(
		&self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
	) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
		let lower = area.path_prefix.encode();
		if lower.is_empty() {
			(None, None)
		} else {
			let upper = successor_bytes(&lower);
			(Some(lower), upper)
		}
	}

	fn time_range(
		&self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
	) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
		let lower = if area.times.start == 0 {
			None
		} else {
			Some(area.times.start.to_be_bytes().to_vec())
		};
		let upper = area.times.end.map(|end| end.to_be_bytes().to_vec());
		(lower, upper)
	}

	/// The entry at exactly (subspace, path), via a bounded scan of the
	/// subspace ordering. Entries under longer paths share the key prefix
	/// and are skipped.
	pub fn get(
		&self,
		subspace: &<S::Subspace as SubspaceScheme>::Id,
		path: &Path,
	) -> Result<Option<(SchemeEntry<S>, PayloadDigest<S>)>> {
		let mut lower = self.schemes.subspace().encode(subspace);
		lower.extend_from_slice(&path.encode());
		let upper = successor_bytes(&lower);
		for kv in self.spt.entries(Some(&lower), upper.as_deref(), false, None) {
			let (key, value) = kv?;
			let (entry, token_digest) = decode_index_kv(
				&*self.schemes,
				&self.namespace,
				QueryOrder::Subspace,
				&key,
				&value,
			)?;
			if entry.path == *path {
				return Ok(Some((entry, token_digest)));
			}
		}
		Ok(None)
	}

	/// Writes the entry under all three orderings.
	pub fn insert(
		&mut self,
		entry: &SchemeEntry<S>,
		token_digest: &PayloadDigest<S>,
	) -> Result<()> {
		let value = encode_index_value(&*self.schemes, entry, token_digest);
		let (spt, pts, tsp) = self.keys_for(entry);
		self.spt.insert(&spt, &value)?;
		self.pts.insert(&pts, &value)?;
		self.tsp.insert(&tsp, &value)?;
		Ok(())
	}

	pub fn remove(&mut self, entry: &SchemeEntry<S>) -> Result<bool> {
		let (spt, pts, tsp) = self.keys_for(entry);
		let present = self.spt.remove(&spt)?;
		let present = self.pts.remove(&pts)? || present;
		let present = self.tsp.remove(&tsp)? || present;
		Ok(present)
	}

	/// Fingerprint and count of the entries inside `area`, capped by
	/// `count_limit` entries and `size_limit` payload bytes (0 meaning
	/// unlimited). Entries are folded in descending subspace-key order, and
	/// contiguous included runs are summarised through the storage monoid
	/// instead of entry by entry.
	pub fn summarise(
		&self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
		count_limit: u64,
		size_limit: u64,
	) -> Result<RangeSummary<Fingerprint<S>>> {
		let (lower, upper) = self.subspace_range(area);
		let fingerprints = self.schemes.fingerprint();
		let mut fingerprint = fingerprints.neutral();
		let mut size: u64 = 0;
		let mut used_bytes: u64 = 0;
		// Lowest key of the current run and its exclusive upper bound.
		let mut run: Option<(Vec<u8>, Vec<u8>)> = None;
		for kv in self.spt.entries(lower.as_deref(), upper.as_deref(), true, None) {
			let (key, value) = kv?;
			let (entry, _) = decode_index_kv(
				&*self.schemes,
				&self.namespace,
				QueryOrder::Subspace,
				&key,
				&value,
			)?;
			if !area.includes(&entry) {
				if let Some((lo, end)) = run.take() {
					let part = self.spt.summarise(Some(&lo), Some(&end))?;
					fingerprint = fingerprints.combine(&fingerprint, &part.fingerprint);
				}
				continue;
			}
			let over_count = count_limit != 0 && size >= count_limit;
			let over_size =
				size_limit != 0 && used_bytes + entry.payload_length > size_limit;
			if over_count || over_size {
				break;
			}
			size += 1;
			used_bytes += entry.payload_length;
			// Descending scan: the current key becomes the run's lower end.
			run = match run.take() {
				None => {
					let mut end = key.clone();
					end.push(0x00);
					Some((key, end))
				}
				Some((_, end)) => Some((key, end)),
			};
		}
		if let Some((lo, end)) = run.take() {
			let part = self.spt.summarise(Some(&lo), Some(&end))?;
			fingerprint = fingerprints.combine(&fingerprint, &part.fingerprint);
		}
		Ok(RangeSummary { fingerprint, size })
	}

	/// Entries inside `area`, ordered by the requested dimension.
	/// `max_count` and `max_size` cap results and total payload bytes, 0
	/// meaning unlimited.
	pub fn query<'a>(
		&'a self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
		order: QueryOrder,
		reverse: bool,
		max_count: u64,
		max_size: u64,
	) -> Box<dyn Iterator<Item = Result<(SchemeEntry<S>, PayloadDigest<S>)>> + 'a> {
		let (storage, (lower, upper)) = match order {
			QueryOrder::Subspace => (&self.spt, self.subspace_range(area)),
			QueryOrder::Path => (&self.pts, self.path_range(area)),
			QueryOrder::Timestamp => (&self.tsp, self.time_range(area)),
		};
		let inner = storage.entries(lower.as_deref(), upper.as_deref(), reverse, None);
		Box::new(QueryIter {
			inner,
			schemes: self.schemes.clone(),
			namespace: self.namespace.clone(),
			area: area.clone(),
			order,
			yielded: 0,
			used_bytes: 0,
			max_count,
			max_size,
			done: false,
		})
	}

	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.spt.all_entries(false).next().is_none())
	}
}

struct QueryIter<'a, S: Schemes> {
	inner: Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>,
	schemes: Arc<S>,
	namespace: NamespaceId<S>,
	area: Area<<S::Subspace as SubspaceScheme>::Id>,
	order: QueryOrder,
	yielded: u64,
	used_bytes: u64,
	max_count: u64,
	max_size: u64,
	done: bool,
}

impl<'a, S: Schemes> Iterator for QueryIter<'a, S> {
	type Item = Result<(SchemeEntry<S>, PayloadDigest<S>)>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}
		loop {
			let (key, value) = match self.inner.next()? {
				Ok(kv) => kv,
				Err(e) => {
					self.done = true;
					return Some(Err(e));
				}
			};
			let decoded = decode_index_kv(
				&*self.schemes,
				&self.namespace,
				self.order,
				&key,
				&value,
			);
			let (entry, token_digest) = match decoded {
				Ok(decoded) => decoded,
				Err(e) => {
					self.done = true;
					return Some(Err(e));
				}
			};
			if !self.area.includes(&entry) {
				continue;
			}
			if self.max_count != 0 && self.yielded >= self.max_count {
				self.done = true;
				return None;
			}
			if self.max_size != 0 && self.used_bytes + entry.payload_length > self.max_size
			{
				self.done = true;
				return None;
			}
			self.yielded += 1;
			self.used_bytes += entry.payload_length;
			return Some(Ok((entry, token_digest)));
		}
	}
}
