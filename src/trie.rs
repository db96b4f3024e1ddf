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

// In-memory compressed radix trie, the reference prefix iterator.
//
// Nodes own their children; there are no parent pointers, and iteration
// works through an explicit work-list. Insertion splits an edge at the
// longest common prefix; removal merges a valueless node with its only
// child, so no valueless single-child node ever survives an operation.

use std::collections::BTreeMap;
use crate::error::Result;
use crate::monoid::KvPair;
use crate::prefix::PrefixIterator;

#[derive(Debug, Default)]
struct TrieNode {
	// Edge label from the parent; empty only at the root.
	label: Vec<u8>,
	value: Option<Vec<u8>>,
	children: BTreeMap<u8, TrieNode>,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
	a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[derive(Debug, Default)]
pub struct RadixTree {
	root: TrieNode,
}

impl RadixTree {
	pub fn new() -> RadixTree {
		Default::default()
	}

	fn node(&self, key: &[u8]) -> Option<&TrieNode> {
		let mut node = &self.root;
		let mut remaining = key;
		loop {
			if remaining.is_empty() {
				return Some(node);
			}
			let child = node.children.get(&remaining[0])?;
			if remaining.len() < child.label.len()
				|| child.label[..] != remaining[..child.label.len()]
			{
				return None;
			}
			remaining = &remaining[child.label.len()..];
			node = child;
		}
	}
}

impl PrefixIterator for RadixTree {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.node(key).and_then(|n| n.value.clone()))
	}

	fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		let mut node = &mut self.root;
		let mut remaining = key;
		loop {
			if remaining.is_empty() {
				node.value = Some(value.to_vec());
				return Ok(());
			}
			let first = remaining[0];
			if !node.children.contains_key(&first) {
				node.children.insert(
					first,
					TrieNode {
						label: remaining.to_vec(),
						value: Some(value.to_vec()),
						children: BTreeMap::new(),
					},
				);
				return Ok(());
			}
			let shared = common_prefix(&node.children.get_mut(&first).expect("checked above").label, remaining);
			if shared == node.children.get_mut(&first).expect("checked above").label.len() {
				remaining = &remaining[shared..];
				node = node.children.get_mut(&first).expect("checked above");
				continue;
			}
			// Split the edge at the divergence point.
			let mut old = node.children.remove(&first).expect("checked above");
			let tail = old.label.split_off(shared);
			let mut split = TrieNode {
				label: std::mem::replace(&mut old.label, tail),
				value: None,
				children: BTreeMap::new(),
			};
			split.children.insert(old.label[0], old);
			if remaining.len() == shared {
				split.value = Some(value.to_vec());
			} else {
				let rest = &remaining[shared..];
				split.children.insert(
					rest[0],
					TrieNode {
						label: rest.to_vec(),
						value: Some(value.to_vec()),
						children: BTreeMap::new(),
					},
				);
			}
			node.children.insert(first, split);
			return Ok(());
		}
	}

	fn remove(&mut self, key: &[u8]) -> Result<bool> {
		fn merge_single_child(node: &mut TrieNode) {
			if node.value.is_none() && node.children.len() == 1 && !node.label.is_empty() {
				let branch = *node.children.keys().next().expect("length checked");
				let mut child = node.children.remove(&branch).expect("length checked");
				node.label.extend_from_slice(&child.label);
				node.value = child.value.take();
				node.children = std::mem::take(&mut child.children);
			}
		}

		fn remove_in(node: &mut TrieNode, key: &[u8]) -> bool {
			if key.is_empty() {
				return node.value.take().is_some();
			}
			let first = key[0];
			let removed = match node.children.get_mut(&first) {
				None => return false,
				Some(child) => {
					if key.len() < child.label.len()
						|| child.label[..] != key[..child.label.len()]
					{
						return false;
					}
					let remaining = &key[child.label.len()..];
					let removed = remove_in(child, remaining);
					if removed {
						if child.value.is_none() && child.children.is_empty() {
							node.children.remove(&first);
						} else {
							merge_single_child(child);
						}
					}
					removed
				}
			};
			removed
		}

		Ok(remove_in(&mut self.root, key))
	}

	fn prefixes_of<'a>(
		&'a self,
		key: &[u8],
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
		let mut found = Vec::new();
		let mut node = &self.root;
		let mut consumed = 0;
		loop {
			if consumed < key.len() {
				if let Some(value) = &node.value {
					found.push(Ok((key[..consumed].to_vec(), value.clone())));
				}
			}
			let remaining = &key[consumed..];
			if remaining.is_empty() {
				break;
			}
			match node.children.get(&remaining[0]) {
				Some(child)
					if remaining.len() >= child.label.len()
						&& child.label[..] == remaining[..child.label.len()] =>
				{
					consumed += child.label.len();
					node = child;
				}
				_ => break,
			}
		}
		Box::new(found.into_iter())
	}

	fn prefixed_by<'a>(
		&'a self,
		key: &[u8],
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
		// Locate the subtree of keys extending `key`; the boundary may fall
		// inside an edge label.
		let mut node = &self.root;
		let mut consumed = Vec::new();
		let mut remaining = key;
		let top = loop {
			if remaining.is_empty() {
				break Some((consumed, node, false));
			}
			match node.children.get(&remaining[0]) {
				None => break None,
				Some(child) => {
					let shared = common_prefix(&child.label, remaining);
					if shared == child.label.len() {
						consumed.extend_from_slice(&child.label);
						remaining = &remaining[shared..];
						node = child;
					} else if shared == remaining.len() {
						// `key` ends inside this edge; the whole child
						// subtree extends it.
						let mut full = consumed;
						full.extend_from_slice(&child.label);
						break Some((full, child, true));
					} else {
						break None;
					}
				}
			}
		};
		Box::new(SubtreeIter {
			work: match top {
				None => Vec::new(),
				Some((prefix, node, include_self)) => vec![(prefix, node, include_self)],
			},
		})
	}
}

struct SubtreeIter<'a> {
	// (accumulated key, node, whether the node's own value qualifies)
	work: Vec<(Vec<u8>, &'a TrieNode, bool)>,
}

impl<'a> Iterator for SubtreeIter<'a> {
	type Item = Result<KvPair>;

	fn next(&mut self) -> Option<Result<KvPair>> {
		loop {
			let (prefix, node, include_self) = self.work.pop()?;
			for (_, child) in node.children.iter().rev() {
				let mut key = prefix.clone();
				key.extend_from_slice(&child.label);
				self.work.push((key, child, true));
			}
			if include_self {
				if let Some(value) = &node.value {
					return Some(Ok((prefix, value.clone())));
				}
			}
		}
	}
}
