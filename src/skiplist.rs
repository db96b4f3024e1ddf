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

// Driver-backed summarisable storage: a multi-level skip list kept entirely
// in the key-value driver.
//
// Node at (LAYER, KEY):
// [HEIGHT: 1][COUNT: 8][LABEL][VALUE]
// HEIGHT - number of layers the key occupies; sampled geometrically with
// probability 1/2 on first insert, capped at MAX_HEIGHT, and preserved on
// upsert.
// COUNT - number of base keys in the segment this node heads.
// LABEL - monoid-encoded combined lift of the segment [KEY, next key on
// LAYER). On layer 0 this is the lift of the single pair.
// VALUE - the user value, layer 0 only.
//
// Every mutation is computed against an overlay of pending node writes and
// committed as a single driver batch, so a crash leaves either the old or
// the new state.

use std::collections::BTreeMap;
use std::sync::Arc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::display::hex;
use crate::driver::{Atom, Batch, Driver, Key, ListOptions};
use crate::error::{Error, Result};
use crate::monoid::{range_legs, KvPair, RangeSummary, SummarisableStorage, SummaryMonoid};

pub const MAX_HEIGHT: u8 = 64;

#[derive(Debug, Clone)]
struct NodeRecord<F> {
	height: u8,
	count: u64,
	label: F,
	value: Option<Vec<u8>>,
}

type Overlay<F> = BTreeMap<(u64, Vec<u8>), Option<NodeRecord<F>>>;

pub struct SkipList<M: SummaryMonoid, D: Driver> {
	driver: Arc<D>,
	prefix: Key,
	monoid: M,
	rng: StdRng,
}

impl<M: SummaryMonoid, D: Driver> SkipList<M, D> {
	pub fn open(driver: Arc<D>, prefix: Key, monoid: M) -> SkipList<M, D> {
		SkipList { driver, prefix, monoid, rng: StdRng::from_entropy() }
	}

	fn node_key(&self, layer: u64, key: &[u8]) -> Key {
		let mut out = self.prefix.clone();
		out.push(Atom::Uint(layer));
		out.push(Atom::Bytes(key.to_vec()));
		out
	}

	fn layer_prefix(&self, layer: u64) -> Key {
		let mut out = self.prefix.clone();
		out.push(Atom::Uint(layer));
		out
	}

	fn encode_record(&self, record: &NodeRecord<M::Summary>) -> Vec<u8> {
		let mut out = vec![record.height];
		out.extend_from_slice(&record.count.to_be_bytes());
		out.extend_from_slice(&self.monoid.encode(&record.label));
		if let Some(value) = &record.value {
			out.extend_from_slice(value);
		}
		out
	}

	fn decode_record(&self, layer: u64, bytes: &[u8]) -> Result<NodeRecord<M::Summary>> {
		if bytes.len() < 9 {
			return Err(Error::Corruption("truncated skip node".into()));
		}
		let height = bytes[0];
		let mut count_buf = [0u8; 8];
		count_buf.copy_from_slice(&bytes[1..9]);
		let count = u64::from_be_bytes(count_buf);
		let (label, used) = self.monoid.decode(&bytes[9..])?;
		let rest = &bytes[9 + used..];
		let value = if layer == 0 { Some(rest.to_vec()) } else { None };
		Ok(NodeRecord { height, count, label, value })
	}

	fn byte_key_of(&self, key: &[Atom]) -> Result<Vec<u8>> {
		match key.last() {
			Some(Atom::Bytes(bytes)) => Ok(bytes.clone()),
			_ => Err(Error::Corruption("malformed skip node key".into())),
		}
	}

	fn node(
		&self,
		overlay: &Overlay<M::Summary>,
		layer: u64,
		key: &[u8],
	) -> Result<Option<NodeRecord<M::Summary>>> {
		if let Some(pending) = overlay.get(&(layer, key.to_vec())) {
			return Ok(pending.clone());
		}
		match self.driver.get(&self.node_key(layer, key))? {
			Some(bytes) => Ok(Some(self.decode_record(layer, &bytes)?)),
			None => Ok(None),
		}
	}

	fn sample_height(&mut self) -> u8 {
		let mut height = 1;
		while height < MAX_HEIGHT && self.rng.gen::<bool>() {
			height += 1;
		}
		height
	}

	/// First key on `layer` strictly greater than `after`, overlay applied.
	fn next_key_at(
		&self,
		overlay: &Overlay<M::Summary>,
		layer: u64,
		after: &[u8],
	) -> Result<Option<Vec<u8>>> {
		let mut start = after.to_vec();
		start.push(0x00);
		let listed = self.driver.list(&ListOptions {
			prefix: Some(self.layer_prefix(layer)),
			start: Some(self.node_key(layer, &start)),
			limit: Some(2),
			..Default::default()
		})?;
		let mut best: Option<Vec<u8>> = None;
		for (key, _) in listed {
			let key = self.byte_key_of(&key)?;
			if overlay.get(&(layer, key.clone())).map_or(false, |pending| pending.is_none()) {
				continue;
			}
			best = Some(key);
			break;
		}
		for ((l, key), pending) in
			overlay.range((layer, start)..(layer + 1, Vec::new()))
		{
			debug_assert_eq!(*l, layer);
			if pending.is_none() {
				continue;
			}
			if best.as_ref().map_or(true, |b| key < b) {
				best = Some(key.clone());
			}
			break;
		}
		Ok(best)
	}

	/// Last key on `layer` strictly less than `before`, overlay applied.
	/// Mutations never introduce new keys below the mutated one, so the
	/// driver view is authoritative for presence.
	fn prev_at(
		&self,
		overlay: &Overlay<M::Summary>,
		layer: u64,
		before: &[u8],
	) -> Result<Option<(Vec<u8>, NodeRecord<M::Summary>)>> {
		let listed = self.driver.list(&ListOptions {
			prefix: Some(self.layer_prefix(layer)),
			end: Some(self.node_key(layer, before)),
			reverse: true,
			limit: Some(1),
			..Default::default()
		})?;
		for (key, _) in listed {
			let key = self.byte_key_of(&key)?;
			if let Some(record) = self.node(overlay, layer, &key)? {
				return Ok(Some((key, record)));
			}
		}
		Ok(None)
	}

	/// Combined label and count of the layer-below nodes in
	/// `[start, end)` (`end` `None` means to the end of the layer).
	fn combine_below(
		&self,
		overlay: &Overlay<M::Summary>,
		layer: u64,
		start: &[u8],
		end: Option<&[u8]>,
	) -> Result<(M::Summary, u64)> {
		let below = layer - 1;
		let listed = self.driver.list(&ListOptions {
			prefix: Some(self.layer_prefix(below)),
			start: Some(self.node_key(below, start)),
			end: end.map(|e| self.node_key(below, e)),
			..Default::default()
		})?;
		let mut segment: BTreeMap<Vec<u8>, NodeRecord<M::Summary>> = BTreeMap::new();
		for (key, value) in listed {
			let key = self.byte_key_of(&key)?;
			segment.insert(key.clone(), self.decode_record(below, &value)?);
		}
		for ((l, key), pending) in
			overlay.range((below, start.to_vec())..(below + 1, Vec::new()))
		{
			debug_assert_eq!(*l, below);
			if end.map_or(false, |e| key[..] >= *e) {
				break;
			}
			match pending {
				Some(record) => {
					segment.insert(key.clone(), record.clone());
				}
				None => {
					segment.remove(key);
				}
			}
		}
		let mut label = self.monoid.neutral();
		let mut count = 0;
		for record in segment.values() {
			label = self.monoid.combine(&label, &record.label);
			count += record.count;
		}
		Ok((label, count))
	}

	/// Recompute the label of the layer-`layer` predecessor whose segment
	/// contains `key`, if there is one.
	fn refresh_predecessor(
		&self,
		overlay: &mut Overlay<M::Summary>,
		layer: u64,
		key: &[u8],
	) -> Result<bool> {
		let (pred_key, pred) = match self.prev_at(overlay, layer, key)? {
			Some(found) => found,
			None => return Ok(false),
		};
		let next = self.next_key_at(overlay, layer, &pred_key)?;
		let (label, count) =
			self.combine_below(overlay, layer, &pred_key, next.as_deref())?;
		overlay.insert(
			(layer, pred_key),
			Some(NodeRecord { height: pred.height, count, label, value: None }),
		);
		Ok(true)
	}

	fn commit(&self, overlay: Overlay<M::Summary>) -> Result<()> {
		let mut batch = Batch::new();
		for ((layer, key), pending) in overlay {
			let node_key = self.node_key(layer, &key);
			match pending {
				Some(record) => batch.set(node_key, self.encode_record(&record)),
				None => batch.delete(node_key),
			}
		}
		self.driver.commit(batch)
	}

	fn summarise_leg(
		&self,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
	) -> Result<(M::Summary, u64)> {
		let overlay = Overlay::default();
		let mut acc = self.monoid.neutral();
		let mut count = 0;
		// First stored key >= lower; an exact hit included.
		let mut current = {
			let listed = self.driver.list(&ListOptions {
				prefix: Some(self.layer_prefix(0)),
				start: lower.map(|l| self.node_key(0, l)),
				limit: Some(1),
				..Default::default()
			})?;
			let mut first = None;
			for (key, _) in listed {
				first = Some(self.byte_key_of(&key)?);
			}
			first
		};
		while let Some(cur) = current.clone() {
			if upper.map_or(false, |u| cur[..] >= *u) {
				break;
			}
			let base = self
				.node(&overlay, 0, &cur)?
				.ok_or_else(|| Error::Corruption("skip walk lost its key".into()))?;
			// Greedily take the highest layer whose segment stays below the
			// upper bound; fall back to the single-key base segment.
			let mut taken = false;
			for layer in (1..base.height as u64).rev() {
				let next = self.next_key_at(&overlay, layer, &cur)?;
				let fits = match (&next, upper) {
					(_, None) => true,
					(Some(next), Some(upper)) => next[..] <= *upper,
					(None, Some(_)) => false,
				};
				if !fits {
					continue;
				}
				let record = self
					.node(&overlay, layer, &cur)?
					.ok_or_else(|| Error::Corruption("missing skip node layer".into()))?;
				acc = self.monoid.combine(&acc, &record.label);
				count += record.count;
				current = next;
				taken = true;
				break;
			}
			if !taken {
				acc = self.monoid.combine(&acc, &base.label);
				count += base.count;
				current = self.next_key_at(&overlay, 0, &cur)?;
			}
		}
		Ok((acc, count))
	}
}

impl<M: SummaryMonoid, D: Driver> SummarisableStorage for SkipList<M, D> {
	type Summary = M::Summary;

	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let overlay = Overlay::default();
		Ok(self.node(&overlay, 0, key)?.and_then(|record| record.value))
	}

	fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		let mut overlay = Overlay::default();
		let existing = self.node(&overlay, 0, key)?;
		let height = match &existing {
			Some(record) => record.height,
			None => self.sample_height(),
		};
		log::trace!(
			target: "meadow-db",
			"skiplist: insert {} height {} ({})",
			hex(key),
			height,
			if existing.is_some() { "upsert" } else { "new" },
		);
		overlay.insert(
			(0, key.to_vec()),
			Some(NodeRecord {
				height,
				count: 1,
				label: self.monoid.lift(key, value)?,
				value: Some(value.to_vec()),
			}),
		);
		for layer in 1..MAX_HEIGHT as u64 {
			if layer < height as u64 {
				let next = self.next_key_at(&overlay, layer, key)?;
				let (label, count) =
					self.combine_below(&overlay, layer, key, next.as_deref())?;
				overlay.insert(
					(layer, key.to_vec()),
					Some(NodeRecord { height, count, label, value: None }),
				);
				let _ = self.refresh_predecessor(&mut overlay, layer, key)?;
			} else {
				// No predecessor here means none above either: a node on a
				// higher layer would also occupy this one.
				if !self.refresh_predecessor(&mut overlay, layer, key)? {
					break;
				}
			}
		}
		self.commit(overlay)
	}

	fn remove(&mut self, key: &[u8]) -> Result<bool> {
		let mut overlay = Overlay::default();
		let existing = match self.node(&overlay, 0, key)? {
			Some(record) => record,
			None => return Ok(false),
		};
		log::trace!(
			target: "meadow-db",
			"skiplist: remove {} height {}",
			hex(key),
			existing.height,
		);
		for layer in 0..existing.height as u64 {
			overlay.insert((layer, key.to_vec()), None);
		}
		for layer in 1..MAX_HEIGHT as u64 {
			if !self.refresh_predecessor(&mut overlay, layer, key)? {
				break;
			}
		}
		self.commit(overlay)?;
		Ok(true)
	}

	fn entries<'a>(
		&'a self,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
		reverse: bool,
		limit: Option<usize>,
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
		let mut legs = range_legs(lower, upper);
		if reverse {
			legs.reverse();
		}
		let mut sequences = Vec::new();
		for (lo, up) in legs {
			let listed = self.driver.list(&ListOptions {
				prefix: Some(self.layer_prefix(0)),
				start: lo.map(|l| self.node_key(0, l)),
				end: up.map(|u| self.node_key(0, u)),
				reverse,
				..Default::default()
			});
			sequences.push(listed);
		}
		Box::new(
			sequences
				.into_iter()
				.flat_map(move |listed| -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
					match listed {
						Err(e) => Box::new(std::iter::once(Err(e))),
						Ok(iter) => Box::new(iter.map(move |(key, value)| {
							let key = self.byte_key_of(&key)?;
							let record = self.decode_record(0, &value)?;
							let value = record
								.value
								.ok_or_else(|| Error::Corruption("valueless base node".into()))?;
							Ok((key, value))
						})),
					}
				})
				.take(limit.unwrap_or(usize::MAX)),
		)
	}

	fn summarise(
		&self,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
	) -> Result<RangeSummary<M::Summary>> {
		let mut fingerprint = self.monoid.neutral();
		let mut size = 0;
		for (lo, up) in range_legs(lower, upper) {
			let (leg, count) = self.summarise_leg(lo, up)?;
			fingerprint = self.monoid.combine(&fingerprint, &leg);
			size += count;
		}
		Ok(RangeSummary { fingerprint, size })
	}
}
