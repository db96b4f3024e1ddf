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

//! Local replica for a multi-writer, prefix-pruning, timestamped key-value
//! store. Entries are addressed by (subspace, path, timestamp), indexed
//! under all three orderings, and any range can be fingerprinted in
//! logarithmic time for set reconciliation.

mod display;
mod driver;
mod entry;
mod error;
mod index;
mod monoid;
mod path;
mod payload;
mod prefix;
mod replica;
mod scheme;
mod skiplist;
mod tree;
mod trie;
mod waf;

#[cfg(test)]
mod testing;

pub use driver::{Atom, Batch, Driver, Key, ListOptions, MemDriver, Value};
pub use entry::{now_microseconds, Entry, Timestamp};
pub use error::{Error, Result};
pub use index::{
	Area, AreaSubspace, EntryMonoid, MemoryIndex, PersistentIndex, QueryOrder,
	TimeRange, TripleStorage,
};
pub use monoid::{KvPair, RangeSummary, SummarisableStorage, SummaryMonoid};
pub use path::Path;
pub use payload::{MemPayloadStore, PayloadStore, StageReceipt};
pub use prefix::{DriverTrie, PrefixIterator};
pub use replica::{
	Event, FailureReason, IngestOutcome, NoOpReason, PayloadOutcome, Replica,
	SetInput, SourceId,
};
pub use scheme::{
	AuthOptions, AuthToken, AuthorisationScheme, Fingerprint, FingerprintScheme,
	NamespaceId, NamespaceScheme, PathScheme, PayloadDigest, PayloadScheme,
	SchemeEntry, Schemes, SubspaceId, SubspaceScheme,
};
pub use skiplist::SkipList;
pub use tree::MonoidTree;
pub use trie::RadixTree;
pub use waf::WriteAheadFlag;
