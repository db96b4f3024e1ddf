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

// Summarisable storage contract.
//
// An ordered byte-key map whose implementations cache monoid labels so that
// any half-open range can be fingerprinted in O(log n + k). Two
// implementations share this trait: the in-memory tree (`tree`) and the
// driver-backed skip list (`skiplist`). They must be observably identical.
//
// Range semantics, shared by `entries` and `summarise`:
// - lower < upper: the half-open range [lower, upper).
// - lower > upper: the range wraps, [lower, end) then [start, upper).
// - lower == upper, or both absent: the full domain.

use crate::error::Result;

pub trait SummaryMonoid: Send + Sync {
	type Summary: Clone + Eq + std::fmt::Debug;

	fn neutral(&self) -> Self::Summary;
	fn lift(&self, key: &[u8], value: &[u8]) -> Result<Self::Summary>;
	fn combine(&self, a: &Self::Summary, b: &Self::Summary) -> Self::Summary;
	fn encode(&self, summary: &Self::Summary) -> Vec<u8>;
	fn decode(&self, bytes: &[u8]) -> Result<(Self::Summary, usize)>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSummary<F> {
	pub fingerprint: F,
	pub size: u64,
}

pub type KvPair = (Vec<u8>, Vec<u8>);

pub trait SummarisableStorage {
	type Summary: Clone + Eq + std::fmt::Debug;

	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
	/// Upsert.
	fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
	/// Returns whether the key was present.
	fn remove(&mut self, key: &[u8]) -> Result<bool>;
	fn entries<'a>(
		&'a self,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
		reverse: bool,
		limit: Option<usize>,
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a>;
	fn summarise(
		&self,
		lower: Option<&[u8]>,
		upper: Option<&[u8]>,
	) -> Result<RangeSummary<Self::Summary>>;

	fn all_entries<'a>(
		&'a self,
		reverse: bool,
	) -> Box<dyn Iterator<Item = Result<KvPair>> + 'a> {
		self.entries(None, None, reverse, None)
	}
}

/// Splits a possibly circular range into linear legs. `None` legs are
/// unbounded on that side.
pub(crate) fn range_legs<'a>(
	lower: Option<&'a [u8]>,
	upper: Option<&'a [u8]>,
) -> Vec<(Option<&'a [u8]>, Option<&'a [u8]>)> {
	match (lower, upper) {
		(Some(x), Some(y)) if x == y => vec![(None, None)],
		(Some(x), Some(y)) if x > y => vec![(Some(x), None), (None, Some(y))],
		other => vec![other],
	}
}
