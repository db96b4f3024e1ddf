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

// In-memory summarisable storage: a treap whose every node caches the
// combined lift and item count of its subtree. Rebalancing is by sampled
// priority; labels are recomputed on the unwind of each insert, removal and
// rotation, so `summarise` can answer any range from the cached labels along
// the two boundary paths.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::error::Result;
use crate::monoid::{range_legs, KvPair, RangeSummary, SummarisableStorage, SummaryMonoid};

struct Node<F> {
	key: Vec<u8>,
	value: Vec<u8>,
	priority: u64,
	// Lift of this pair alone, cached so label maintenance never re-lifts.
	lift: F,
	summary: F,
	count: u64,
	left: Option<Box<Node<F>>>,
	right: Option<Box<Node<F>>>,
}

pub struct MonoidTree<M: SummaryMonoid> {
	monoid: M,
	root: Option<Box<Node<M::Summary>>>,
	rng: StdRng,
}

fn update<M: SummaryMonoid>(monoid: &M, node: &mut Node<M::Summary>) {
	let mut summary = node.lift.clone();
	let mut count = 1;
	if let Some(left) = &node.left {
		summary = monoid.combine(&left.summary, &summary);
		count += left.count;
	}
	if let Some(right) = &node.right {
		summary = monoid.combine(&summary, &right.summary);
		count += right.count;
	}
	node.summary = summary;
	node.count = count;
}

fn rotate_right<M: SummaryMonoid>(
	monoid: &M,
	mut node: Box<Node<M::Summary>>,
) -> Box<Node<M::Summary>> {
	let mut pivot = node.left.take().expect("rotation requires a left child");
	node.left = pivot.right.take();
	update(monoid, &mut node);
	pivot.right = Some(node);
	update(monoid, &mut pivot);
	pivot
}

fn rotate_left<M: SummaryMonoid>(
	monoid: &M,
	mut node: Box<Node<M::Summary>>,
) -> Box<Node<M::Summary>> {
	let mut pivot = node.right.take().expect("rotation requires a right child");
	node.right = pivot.left.take();
	update(monoid, &mut node);
	pivot.left = Some(node);
	update(monoid, &mut pivot);
	pivot
}

fn insert_node<M: SummaryMonoid>(
	monoid: &M,
	node: Option<Box<Node<M::Summary>>>,
	key: &[u8],
	value: &[u8],
	lift: M::Summary,
	priority: u64,
) -> Box<Node<M::Summary>> {
	let mut node = match node {
		None => {
			let mut leaf = Box::new(Node {
				key: key.to_vec(),
				value: value.to_vec(),
				priority,
				summary: lift.clone(),
				lift,
				count: 1,
				left: None,
				right: None,
			});
			update(monoid, &mut leaf);
			return leaf;
		}
		Some(node) => node,
	};
	match key.cmp(&node.key[..]) {
		std::cmp::Ordering::Equal => {
			// Upsert keeps the node in place.
			node.value = value.to_vec();
			node.lift = lift;
			update(monoid, &mut node);
			node
		}
		std::cmp::Ordering::Less => {
			node.left =
				Some(insert_node(monoid, node.left.take(), key, value, lift, priority));
			if node.left.as_ref().map_or(false, |l| l.priority > node.priority) {
				rotate_right(monoid, node)
			} else {
				update(monoid, &mut node);
				node
			}
		}
		std::cmp::Ordering::Greater => {
			node.right =
				Some(insert_node(monoid, node.right.take(), key, value, lift, priority));
			if node.right.as_ref().map_or(false, |r| r.priority > node.priority) {
				rotate_left(monoid, node)
			} else {
				update(monoid, &mut node);
				node
			}
		}
	}
}

fn merge_nodes<M: SummaryMonoid>(
	monoid: &M,
	a: Option<Box<Node<M::Summary>>>,
	b: Option<Box<Node<M::Summary>>>,
) -> Option<Box<Node<M::Summary>>> {
	match (a, b) {
		(None, b) => b,
		(a, None) => a,
		(Some(mut a), Some(mut b)) => {
			if a.priority > b.priority {
				a.right = merge_nodes(monoid, a.right.take(), Some(b));
				update(monoid, &mut a);
				Some(a)
			} else {
				b.left = merge_nodes(monoid, Some(a), b.left.take());
				update(monoid, &mut b);
				Some(b)
			}
		}
	}
}

fn remove_node<M: SummaryMonoid>(
	monoid: &M,
	node: Option<Box<Node<M::Summary>>>,
	key: &[u8],
) -> (Option<Box<Node<M::Summary>>>, bool) {
	let mut node = match node {
		None => return (None, false),
		Some(node) => node,
	};
	match key.cmp(&node.key[..]) {
		std::cmp::Ordering::Equal =>
			(merge_nodes(monoid, node.left.take(), node.right.take()), true),
		std::cmp::Ordering::Less => {
			let (left, removed) = remove_node(monoid, node.left.take(), key);
			node.left = left;
			update(monoid, &mut node);
			(Some(node), removed)
		}
		std::cmp::Ordering::Greater => {
			let (right, removed) = remove_node(monoid, node.right.take(), key);
			node.right = right;
			update(monoid, &mut node);
			(Some(node), removed)
		}
	}
}

struct RangeIter<'a, F> {
	stack: Vec<&'a Node<F>>,
	lower: Option<Vec<u8>>,
	upper: Option<Vec<u8>>,
	descending: bool,
}

impl<'a, F> RangeIter<'a, F> {
	fn new(
		root: Option<&'a Node<F>>,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
		descending: bool,
	) -> RangeIter<'a, F> {
		let mut iter = RangeIter {
			stack: Vec::new(),
			lower: lower.map(|b| b.to_vec()),
			upper: upper.map(|b| b.to_vec()),
			descending,
		};
		iter.descend(root);
		iter
	}

	// Push the spine towards the first in-range key in iteration order,
	// skipping subtrees that lie entirely before it.
	fn descend(&mut self, mut node: Option<&'a Node<F>>) {
		while let Some(n) = node {
			if self.descending {
				if self.upper.as_ref().map_or(false, |u| n.key[..] >= u[..]) {
					node = n.left.as_deref();
				} else {
					self.stack.push(n);
					node = n.right.as_deref();
				}
			} else {
				if self.lower.as_ref().map_or(false, |l| n.key[..] < l[..]) {
					node = n.right.as_deref();
				} else {
					self.stack.push(n);
					node = n.left.as_deref();
				}
			}
		}
	}
}

impl<'a, F> Iterator for RangeIter<'a, F> {
	type Item = KvPair;

	fn next(&mut self) -> Option<KvPair> {
		let node = self.stack.pop()?;
		if self.descending {
			if self.lower.as_ref().map_or(false, |l| node.key[..] < l[..]) {
				self.stack.clear();
				return None;
			}
			self.descend(node.left.as_deref());
		} else {
			if self.upper.as_ref().map_or(false, |u| node.key[..] >= u[..]) {
				self.stack.clear();
				return None;
			}
			self.descend(node.right.as_deref());
		}
		Some((node.key.clone(), node.value.clone()))
	}
}

impl<M: SummaryMonoid> MonoidTree<M> {
	pub fn new(monoid: M) -> MonoidTree<M> {
		MonoidTree { monoid, root: None, rng: StdRng::from_entropy() }
	}

	pub fn len(&self) -> u64 {
		self.root.as_ref().map_or(0, |n| n.count)
	}

	pub fn is_empty(&self) -> bool {
		self.root.is_none()
	}

	fn summarise_leg(
		&self,
		node: Option<&Node<M::Summary>>,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
	) -> (M::Summary, u64) {
		let node = match node {
			None => return (self.monoid.neutral(), 0),
			Some(node) => node,
		};
		if lower.is_none() && upper.is_none() {
			return (node.summary.clone(), node.count);
		}
		if lower.map_or(false, |l| node.key[..] < *l) {
			return self.summarise_leg(node.right.as_deref(), lower, upper);
		}
		if upper.map_or(false, |u| node.key[..] >= *u) {
			return self.summarise_leg(node.left.as_deref(), lower, upper);
		}
		let (left, left_count) = self.summarise_leg(node.left.as_deref(), lower, None);
		let (right, right_count) = self.summarise_leg(node.right.as_deref(), None, upper);
		let combined =
			self.monoid.combine(&self.monoid.combine(&left, &node.lift), &right);
		(combined, left_count + 1 + right_count)
	}
}

impl<M: SummaryMonoid> SummarisableStorage for MonoidTree<M> {
	type Summary = M::Summary;

	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let mut node = self.root.as_deref();
		while let Some(n) = node {
			match key.cmp(&n.key[..]) {
				std::cmp::Ordering::Equal => return Ok(Some(n.value.clone())),
				std::cmp::Ordering::Less => node = n.left.as_deref(),
				std::cmp::Ordering::Greater => node = n.right.as_deref(),
			}
		}
		Ok(None)
	}

	fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		let lift = self.monoid.lift(key, value)?;
		let priority = self.rng.gen();
		let root = self.root.take();
		self.root = Some(insert_node(&self.monoid, root, key, value, lift, priority));
		Ok(())
	}

	fn remove(&mut self, key: &[u8]) -> Result<bool> {
		let root = self.root.take();
		let (root, removed) = remove_node(&self.monoid, root, key);
		self.root = root;
		Ok(removed)
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
		let iters: Vec<RangeIter<'a, M::Summary>> = legs
			.into_iter()
			.map(|(lo, up)| RangeIter::new(self.root.as_deref(), lo, up, reverse))
			.collect();
		Box::new(
			iters
				.into_iter()
				.flatten()
				.take(limit.unwrap_or(usize::MAX))
				.map(Ok),
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
			let (leg, count) = self.summarise_leg(self.root.as_deref(), lo, up);
			fingerprint = self.monoid.combine(&fingerprint, &leg);
			size += count;
		}
		Ok(RangeSummary { fingerprint, size })
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testing::XorMonoid;
	use std::collections::BTreeMap;

	fn keyed(i: u32) -> (Vec<u8>, Vec<u8>) {
		(i.to_be_bytes().to_vec(), vec![i as u8; (i % 7) as usize + 1])
	}

	fn filled(keys: &[u32]) -> (MonoidTree<XorMonoid>, BTreeMap<Vec<u8>, Vec<u8>>) {
		let mut tree = MonoidTree::new(XorMonoid);
		let mut model = BTreeMap::new();
		for i in keys {
			let (k, v) = keyed(*i);
			tree.insert(&k, &v).unwrap();
			model.insert(k, v);
		}
		(tree, model)
	}

	fn naive_summary(
		model: &BTreeMap<Vec<u8>, Vec<u8>>,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
	) -> RangeSummary<<XorMonoid as SummaryMonoid>::Summary> {
		let monoid = XorMonoid;
		let in_range = |k: &[u8]| match (lower, upper) {
			(Some(l), Some(u)) if l == u => true,
			(Some(l), Some(u)) if l > u => k >= l || k < u,
			(l, u) => l.map_or(true, |l| k >= l) && u.map_or(true, |u| k < u),
		};
		let mut fingerprint = monoid.neutral();
		let mut size = 0;
		for (k, v) in model {
			if in_range(k) {
				fingerprint = monoid.combine(&fingerprint, &monoid.lift(k, v).unwrap());
				size += 1;
			}
		}
		RangeSummary { fingerprint, size }
	}

	#[test]
	fn matches_model_map() {
		let script: Vec<u32> = (0..200).map(|i| (i * 37) % 101).collect();
		let (mut tree, mut model) = filled(&script);
		for i in script.iter().step_by(3) {
			let (k, _) = keyed(*i);
			assert_eq!(tree.remove(&k).unwrap(), model.remove(&k).is_some());
		}
		assert_eq!(tree.len(), model.len() as u64);
		for i in 0..101 {
			let (k, _) = keyed(i);
			assert_eq!(tree.get(&k).unwrap(), model.get(&k).cloned());
		}
		let all: Vec<KvPair> =
			tree.all_entries(false).map(|e| e.unwrap()).collect();
		let expected: Vec<KvPair> =
			model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
		assert_eq!(all, expected);
	}

	#[test]
	fn remove_missing_reports_absence() {
		let (mut tree, _) = filled(&[1, 2, 3]);
		assert!(!tree.remove(b"absent").unwrap());
		assert_eq!(tree.len(), 3);
	}

	#[test]
	fn summarise_equals_naive_fold() {
		let script: Vec<u32> = (0..80).map(|i| (i * 53) % 97).collect();
		let (tree, model) = filled(&script);
		let probes: Vec<Option<Vec<u8>>> = vec![
			None,
			Some(keyed(0).0),
			Some(keyed(20).0),
			Some(keyed(50).0),
			Some(keyed(96).0),
			Some(b"\xff\xff\xff\xff\xff".to_vec()),
		];
		for lower in &probes {
			for upper in &probes {
				let got = tree.summarise(lower.as_deref(), upper.as_deref()).unwrap();
				let expected = naive_summary(&model, lower.as_deref(), upper.as_deref());
				assert_eq!(got, expected, "range {:?}..{:?}", lower, upper);
			}
		}
	}

	#[test]
	fn circular_entries_wrap_around() {
		let (tree, _) = filled(&[1, 2, 3, 4, 5]);
		let lower = keyed(4).0;
		let upper = keyed(2).0;
		let keys: Vec<Vec<u8>> = tree
			.entries(Some(&lower), Some(&upper), false, None)
			.map(|e| e.unwrap().0)
			.collect();
		assert_eq!(keys, vec![keyed(4).0, keyed(5).0, keyed(1).0]);

		let reversed: Vec<Vec<u8>> = tree
			.entries(Some(&lower), Some(&upper), true, None)
			.map(|e| e.unwrap().0)
			.collect();
		assert_eq!(reversed, vec![keyed(1).0, keyed(5).0, keyed(4).0]);
	}

	#[test]
	fn entries_honour_reverse_and_limit() {
		let (tree, model) = filled(&[9, 3, 7, 1, 5]);
		let forward: Vec<Vec<u8>> = tree
			.entries(None, None, false, Some(2))
			.map(|e| e.unwrap().0)
			.collect();
		let expected: Vec<Vec<u8>> = model.keys().take(2).cloned().collect();
		assert_eq!(forward, expected);

		let backward: Vec<Vec<u8>> = tree
			.entries(None, None, true, Some(2))
			.map(|e| e.unwrap().0)
			.collect();
		let expected: Vec<Vec<u8>> = model.keys().rev().take(2).cloned().collect();
		assert_eq!(backward, expected);
	}

	#[test]
	fn upsert_replaces_value_and_summary() {
		let mut tree = MonoidTree::new(XorMonoid);
		tree.insert(b"k", b"one").unwrap();
		tree.insert(b"k", b"two").unwrap();
		assert_eq!(tree.get(b"k").unwrap(), Some(b"two".to_vec()));
		assert_eq!(tree.len(), 1);
		let summary = tree.summarise(None, None).unwrap();
		let monoid = XorMonoid;
		assert_eq!(summary.fingerprint, monoid.lift(b"k", b"two").unwrap());
		assert_eq!(summary.size, 1);
	}
}
