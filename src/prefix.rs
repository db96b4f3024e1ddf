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

// Driver-backed prefix iterator: a compressed trie whose nodes are keyed by
// their cumulative byte prefix, so a subtree is one contiguous driver range
// and `prefixed_by` is a plain range scan.
//
// Node at (PREFIX):
// [PHANTOMNESS: 1][EDGE_COUNT: 2][EDGE: LEN: 2, BYTES]*[VALUE]
// PHANTOMNESS - 0: branch point only. 1: carries a user value. 2: carries a
// user value and is also a branch point.
// EDGE - labels to child nodes, sorted, distinct first bytes. A child's
// driver key is PREFIX followed by its edge, so splits and merges never
// rewrite a subtree.
// VALUE - user value, absent on phantoms.
//
// The root node lives at the empty prefix and is exempt from the rule that
// a phantom has at least two children. Removal performs a full local merge:
// a valueless node left with a single child is absorbed into its parent's
// edge, and the check is repeated at the parent.

use std::sync::Arc;
use crate::display::hex;
use crate::driver::{Atom, Batch, Driver, Key, ListOptions};
use crate::error::{Error, Result};
use crate::monoid::KvPair;
use crate::path::successor_bytes;

/// Byte-keyed store answering which stored keys prefix a given key and
/// which stored keys it prefixes.
pub trait PrefixIterator {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
	fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
	/// Returns whether the key was present.
	fn remove(&mut self, key: &[u8]) -> Result<bool>;
	/// Stored pairs whose key is a proper prefix of `key`, shortest first.
	fn prefixes_of<'a>(
		&'a self,
		key: &[u8],
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a>;
	/// Stored pairs whose key `key` properly prefixes, in lexicographic
	/// order.
	fn prefixed_by<'a>(
		&'a self,
		key: &[u8],
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phantomness {
	Phantom,
	Real,
	RealWithPhantom,
}

impl Phantomness {
	fn from_u8(raw: u8) -> Result<Phantomness> {
		match raw {
			0 => Ok(Phantomness::Phantom),
			1 => Ok(Phantomness::Real),
			2 => Ok(Phantomness::RealWithPhantom),
			_ => Err(Error::Corruption("bad phantomness tag".into())),
		}
	}

	fn as_u8(self) -> u8 {
		match self {
			Phantomness::Phantom => 0,
			Phantomness::Real => 1,
			Phantomness::RealWithPhantom => 2,
		}
	}

	fn of(value_present: bool, children: usize) -> Phantomness {
		match (value_present, children) {
			(false, _) => Phantomness::Phantom,
			(true, n) if n >= 2 => Phantomness::RealWithPhantom,
			(true, _) => Phantomness::Real,
		}
	}
}

#[derive(Debug, Clone)]
struct TrieRecord {
	edges: Vec<Vec<u8>>,
	value: Option<Vec<u8>>,
}

impl TrieRecord {
	fn encode(&self) -> Vec<u8> {
		let mut out =
			vec![Phantomness::of(self.value.is_some(), self.edges.len()).as_u8()];
		out.extend_from_slice(&(self.edges.len() as u16).to_be_bytes());
		for edge in &self.edges {
			out.extend_from_slice(&(edge.len() as u16).to_be_bytes());
			out.extend_from_slice(edge);
		}
		if let Some(value) = &self.value {
			out.extend_from_slice(value);
		}
		out
	}

	fn decode(bytes: &[u8]) -> Result<TrieRecord> {
		let truncated = || Error::Corruption("truncated trie node".into());
		let phantomness = Phantomness::from_u8(*bytes.get(0).ok_or_else(truncated)?)?;
		let count = {
			let slice = bytes.get(1..3).ok_or_else(truncated)?;
			u16::from_be_bytes([slice[0], slice[1]]) as usize
		};
		let mut pos = 3;
		let mut edges = Vec::with_capacity(count);
		for _ in 0..count {
			let slice = bytes.get(pos..pos + 2).ok_or_else(truncated)?;
			let len = u16::from_be_bytes([slice[0], slice[1]]) as usize;
			pos += 2;
			edges.push(bytes.get(pos..pos + len).ok_or_else(truncated)?.to_vec());
			pos += len;
		}
		let value = match phantomness {
			Phantomness::Phantom => None,
			_ => Some(bytes.get(pos..).ok_or_else(truncated)?.to_vec()),
		};
		Ok(TrieRecord { edges, value })
	}

	fn edge_towards(&self, byte: u8) -> Option<&Vec<u8>> {
		self.edges.iter().find(|e| e.first() == Some(&byte))
	}

	fn replace_edge(&mut self, old: &[u8], new: Vec<u8>) {
		for edge in &mut self.edges {
			if edge[..] == *old {
				*edge = new;
				break;
			}
		}
		self.edges.sort();
	}

	fn add_edge(&mut self, edge: Vec<u8>) {
		self.edges.push(edge);
		self.edges.sort();
	}

	fn drop_edge(&mut self, edge: &[u8]) {
		self.edges.retain(|e| e[..] != *edge);
	}
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
	a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

pub struct DriverTrie<D: Driver> {
	driver: Arc<D>,
	prefix: Key,
}

impl<D: Driver> DriverTrie<D> {
	pub fn open(driver: Arc<D>, prefix: Key) -> DriverTrie<D> {
		DriverTrie { driver, prefix }
	}

	fn node_key(&self, key: &[u8]) -> Key {
		let mut out = self.prefix.clone();
		out.push(Atom::Bytes(key.to_vec()));
		out
	}

	fn read_node(&self, key: &[u8]) -> Result<Option<TrieRecord>> {
		match self.driver.get(&self.node_key(key))? {
			Some(bytes) => Ok(Some(TrieRecord::decode(&bytes)?)),
			None => Ok(None),
		}
	}

	fn write_node(&self, batch: &mut Batch, key: &[u8], record: &TrieRecord) {
		batch.set(self.node_key(key), record.encode());
	}

	/// Nodes from the root towards `key`, ending with the node at `key`
	/// itself when it exists.
	fn chain_to(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, TrieRecord)>> {
		let mut chain = Vec::new();
		let mut node_key: Vec<u8> = Vec::new();
		let mut node = match self.read_node(&node_key)? {
			Some(root) => root,
			None => return Ok(chain),
		};
		loop {
			let remaining = &key[node_key.len()..];
			if remaining.is_empty() {
				chain.push((node_key, node));
				return Ok(chain);
			}
			let edge = node
				.edge_towards(remaining[0])
				.filter(|edge| remaining.starts_with(&edge[..]))
				.cloned();
			let edge = match edge {
				Some(edge) => edge,
				None => {
					chain.push((node_key, node));
					return Ok(chain);
				}
			};
			chain.push((node_key.clone(), node));
			node_key.extend_from_slice(&edge);
			node = self
				.read_node(&node_key)?
				.ok_or_else(|| Error::Corruption("dangling trie edge".into()))?;
		}
	}
}

impl<D: Driver> PrefixIterator for DriverTrie<D> {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.read_node(key)?.and_then(|record| record.value))
	}

	fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		let mut batch = Batch::new();
		let mut node_key: Vec<u8> = Vec::new();
		let mut node = match self.read_node(&node_key)? {
			Some(root) => root,
			None => {
				// First key; materialise the root.
				if key.is_empty() {
					let root =
						TrieRecord { edges: Vec::new(), value: Some(value.to_vec()) };
					self.write_node(&mut batch, &[], &root);
				} else {
					let root =
						TrieRecord { edges: vec![key.to_vec()], value: None };
					self.write_node(&mut batch, &[], &root);
					let leaf =
						TrieRecord { edges: Vec::new(), value: Some(value.to_vec()) };
					self.write_node(&mut batch, key, &leaf);
				}
				return self.driver.commit(batch);
			}
		};
		loop {
			let remaining = &key[node_key.len()..];
			if remaining.is_empty() {
				node.value = Some(value.to_vec());
				self.write_node(&mut batch, &node_key, &node);
				return self.driver.commit(batch);
			}
			let edge = match node.edge_towards(remaining[0]).cloned() {
				None => {
					node.add_edge(remaining.to_vec());
					self.write_node(&mut batch, &node_key, &node);
					let leaf =
						TrieRecord { edges: Vec::new(), value: Some(value.to_vec()) };
					self.write_node(&mut batch, key, &leaf);
					return self.driver.commit(batch);
				}
				Some(edge) => edge,
			};
			let shared = common_prefix(&edge, remaining);
			if shared == edge.len() {
				node_key.extend_from_slice(&edge);
				node = self
					.read_node(&node_key)?
					.ok_or_else(|| Error::Corruption("dangling trie edge".into()))?;
				continue;
			}
			// The edge splits; the child keeps its key, only linkage moves.
			log::trace!(
				target: "meadow-db",
				"trie: split {} at {}",
				hex(&node_key),
				shared,
			);
			node.replace_edge(&edge, edge[..shared].to_vec());
			self.write_node(&mut batch, &node_key, &node);
			let mut mid_key = node_key.clone();
			mid_key.extend_from_slice(&edge[..shared]);
			if shared == remaining.len() {
				let mid = TrieRecord {
					edges: vec![edge[shared..].to_vec()],
					value: Some(value.to_vec()),
				};
				self.write_node(&mut batch, &mid_key, &mid);
			} else {
				let mut mid = TrieRecord {
					edges: vec![edge[shared..].to_vec()],
					value: None,
				};
				mid.add_edge(remaining[shared..].to_vec());
				self.write_node(&mut batch, &mid_key, &mid);
				let leaf =
					TrieRecord { edges: Vec::new(), value: Some(value.to_vec()) };
				self.write_node(&mut batch, key, &leaf);
			}
			return self.driver.commit(batch);
		}
	}

	fn remove(&mut self, key: &[u8]) -> Result<bool> {
		let mut chain = self.chain_to(key)?;
		let (node_key, mut node) = match chain.pop() {
			Some(found) if found.0[..] == *key => found,
			_ => return Ok(false),
		};
		if node.value.is_none() {
			return Ok(false);
		}
		let mut batch = Batch::new();
		match node.edges.len() {
			n if n >= 2 => {
				// Still a branch point; keep it as a phantom.
				node.value = None;
				self.write_node(&mut batch, &node_key, &node);
			}
			1 if node_key.is_empty() => {
				// Root is exempt from merging.
				node.value = None;
				self.write_node(&mut batch, &node_key, &node);
			}
			1 => {
				// Valueless with one child: absorb into the parent edge.
				batch.delete(self.node_key(&node_key));
				let (parent_key, mut parent) =
					chain.pop().expect("non-root node has a parent");
				let mut extended = node_key[parent_key.len()..].to_vec();
				extended.extend_from_slice(&node.edges[0]);
				parent.replace_edge(&node_key[parent_key.len()..], extended);
				self.write_node(&mut batch, &parent_key, &parent);
			}
			_ => {
				// Leaf; the parent may now merge in turn.
				batch.delete(self.node_key(&node_key));
				match chain.pop() {
					None => {}
					Some((parent_key, mut parent)) => {
						parent.drop_edge(&node_key[parent_key.len()..]);
						if parent.value.is_none() && parent_key.is_empty() {
							if parent.edges.is_empty() {
								batch.delete(self.node_key(&parent_key));
							} else {
								self.write_node(&mut batch, &parent_key, &parent);
							}
						} else if parent.value.is_none() && parent.edges.len() == 1 {
							log::trace!(
								target: "meadow-db",
								"trie: merging phantom {}",
								hex(&parent_key),
							);
							batch.delete(self.node_key(&parent_key));
							let (grand_key, mut grand) =
								chain.pop().expect("non-root node has a parent");
							let mut extended =
								parent_key[grand_key.len()..].to_vec();
							extended.extend_from_slice(&parent.edges[0]);
							grand.replace_edge(
								&parent_key[grand_key.len()..],
								extended,
							);
							self.write_node(&mut batch, &grand_key, &grand);
						} else {
							self.write_node(&mut batch, &parent_key, &parent);
						}
					}
				}
			}
		}
		self.driver.commit(batch)?;
		Ok(true)
	}

	fn prefixes_of<'a>(
		&'a self,
		key: &[u8],
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
		let chain = match self.chain_to(key) {
			Ok(chain) => chain,
			Err(e) => return Box::new(std::iter::once(Err(e))),
		};
		let mut found = Vec::new();
		for (node_key, node) in chain {
			if node_key.len() >= key.len() {
				break;
			}
			if let Some(value) = node.value {
				found.push(Ok((node_key, value)));
			}
		}
		Box::new(found.into_iter())
	}

	fn prefixed_by<'a>(
		&'a self,
		key: &[u8],
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
		let mut start = key.to_vec();
		start.push(0x00);
		let listed = self.driver.list(&ListOptions {
			prefix: Some(self.prefix.clone()),
			start: Some(self.node_key(&start)),
			end: successor_bytes(key).map(|s| self.node_key(&s)),
			..Default::default()
		});
		match listed {
			Err(e) => Box::new(std::iter::once(Err(e))),
			Ok(iter) => Box::new(iter.filter_map(move |(key, bytes)| {
				let stored = match key.last() {
					Some(Atom::Bytes(stored)) => stored.clone(),
					_ => {
						return Some(Err(Error::Corruption(
							"malformed trie node key".into(),
						)))
					}
				};
				match TrieRecord::decode(&bytes) {
					Err(e) => Some(Err(e)),
					Ok(record) => record.value.map(|value| Ok((stored, value))),
				}
			})),
		}
	}
}
