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

// Backing key-value driver.
//
// Keys are sequences of atoms. Atoms order first by kind
// (bytes < string < uint < int < bool), then by value; key sequences order
// lexicographically atom-wise. A prefix of a key sorts before the key.
//
// Writes issued through a batch become visible atomically on commit. A
// partially applied batch is impossible by contract; callers rely on this
// for crash safety.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use parking_lot::RwLock;
use crate::error::Result;

pub type Value = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Atom {
	Bytes(Vec<u8>),
	Str(String),
	Uint(u64),
	Int(i64),
	Bool(bool),
}

impl Atom {
	fn kind(&self) -> u8 {
		match self {
			Atom::Bytes(_) => 0,
			Atom::Str(_) => 1,
			Atom::Uint(_) => 2,
			Atom::Int(_) => 3,
			Atom::Bool(_) => 4,
		}
	}
}

impl Ord for Atom {
	fn cmp(&self, other: &Atom) -> std::cmp::Ordering {
		match (self, other) {
			(Atom::Bytes(a), Atom::Bytes(b)) => a.cmp(b),
			(Atom::Str(a), Atom::Str(b)) => a.cmp(b),
			(Atom::Uint(a), Atom::Uint(b)) => a.cmp(b),
			(Atom::Int(a), Atom::Int(b)) => a.cmp(b),
			(Atom::Bool(a), Atom::Bool(b)) => a.cmp(b),
			(a, b) => a.kind().cmp(&b.kind()),
		}
	}
}

impl PartialOrd for Atom {
	fn partial_cmp(&self, other: &Atom) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

pub type Key = Vec<Atom>;

pub fn concat_key(prefix: &[Atom], suffix: &[Atom]) -> Key {
	let mut key = Vec::with_capacity(prefix.len() + suffix.len());
	key.extend_from_slice(prefix);
	key.extend_from_slice(suffix);
	key
}

#[derive(Debug, Default, Clone)]
pub struct ListOptions {
	pub prefix: Option<Key>,
	pub start: Option<Key>,
	pub end: Option<Key>,
	pub reverse: bool,
	pub limit: Option<usize>,
}

impl ListOptions {
	pub fn prefixed(prefix: Key) -> ListOptions {
		ListOptions { prefix: Some(prefix), ..Default::default() }
	}
}

#[derive(Debug)]
enum BatchOp {
	Set(Key, Value),
	Delete(Key),
}

/// Buffered writes, applied atomically by `Driver::commit`.
#[derive(Debug, Default)]
pub struct Batch {
	ops: Vec<BatchOp>,
}

impl Batch {
	pub fn new() -> Batch {
		Default::default()
	}

	pub fn set(&mut self, key: Key, value: Value) {
		self.ops.push(BatchOp::Set(key, value));
	}

	pub fn delete(&mut self, key: Key) {
		self.ops.push(BatchOp::Delete(key));
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}
}

pub trait Driver: Send + Sync + 'static {
	fn get(&self, key: &[Atom]) -> Result<Option<Value>>;
	fn set(&self, key: Key, value: Value) -> Result<()>;
	fn delete(&self, key: &[Atom]) -> Result<()>;
	/// Entries within the requested range, in key order. The sequence is
	/// detached from later writes.
	fn list(&self, options: &ListOptions) -> Result<Box<dyn Iterator<Item = (Key, Value)>>>;
	fn clear(&self, prefix: &[Atom]) -> Result<()>;
	fn commit(&self, batch: Batch) -> Result<()>;
}

fn key_has_prefix(key: &[Atom], prefix: &[Atom]) -> bool {
	key.len() >= prefix.len() && &key[..prefix.len()] == prefix
}

/// Reference driver over a `BTreeMap`. Commits apply under one write lock,
/// which gives the atomic batch contract for free.
#[derive(Default, Clone)]
pub struct MemDriver {
	map: Arc<RwLock<BTreeMap<Key, Value>>>,
}

impl MemDriver {
	pub fn new() -> MemDriver {
		Default::default()
	}
}

impl Driver for MemDriver {
	fn get(&self, key: &[Atom]) -> Result<Option<Value>> {
		Ok(self.map.read().get(key).cloned())
	}

	fn set(&self, key: Key, value: Value) -> Result<()> {
		self.map.write().insert(key, value);
		Ok(())
	}

	fn delete(&self, key: &[Atom]) -> Result<()> {
		self.map.write().remove(key);
		Ok(())
	}

	fn list(&self, options: &ListOptions) -> Result<Box<dyn Iterator<Item = (Key, Value)>>> {
		let map = self.map.read();
		let lower = match (&options.prefix, &options.start) {
			(Some(p), Some(s)) => Some(std::cmp::max(p.clone(), s.clone())),
			(Some(p), None) => Some(p.clone()),
			(None, s) => s.clone(),
		};
		let lower = match lower {
			Some(k) => Bound::Included(k),
			None => Bound::Unbounded,
		};
		let upper = match &options.end {
			Some(k) => Bound::Excluded(k.clone()),
			None => Bound::Unbounded,
		};
		let mut selected: Vec<(Key, Value)> = map
			.range((lower, upper))
			.filter(|(k, _)| options.prefix.as_ref().map_or(true, |p| key_has_prefix(k, p)))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		if options.reverse {
			selected.reverse();
		}
		if let Some(limit) = options.limit {
			selected.truncate(limit);
		}
		Ok(Box::new(selected.into_iter()))
	}

	fn clear(&self, prefix: &[Atom]) -> Result<()> {
		let mut map = self.map.write();
		let doomed: Vec<Key> =
			map.keys().filter(|k| key_has_prefix(k, prefix)).cloned().collect();
		for key in doomed {
			map.remove(&key);
		}
		Ok(())
	}

	fn commit(&self, batch: Batch) -> Result<()> {
		let mut map = self.map.write();
		for op in batch.ops {
			match op {
				BatchOp::Set(key, value) => {
					map.insert(key, value);
				}
				BatchOp::Delete(key) => {
					map.remove(&key);
				}
			}
		}
		Ok(())
	}
}
