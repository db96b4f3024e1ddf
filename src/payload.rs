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

// Content-addressed payload storage. Bytes are staged first; a staged
// payload becomes visible only through `commit`, and `reject` discards it.
// Both entry payloads and encoded authorisation tokens live here, keyed by
// their digests.

use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::error::{Error, Result};
use crate::scheme::PayloadScheme;

/// Receipt for staged bytes; passed back to `commit` or `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReceipt<D> {
	pub digest: D,
	pub length: u64,
}

pub trait PayloadStore<D>: Send + Sync {
	/// Committed bytes for `digest` from `offset` onward.
	fn get(&self, digest: &D, offset: u64) -> Result<Option<Vec<u8>>>;
	fn has(&self, digest: &D) -> Result<bool>;
	fn stage(&self, bytes: &[u8]) -> Result<StageReceipt<D>>;
	/// Atomic; the payload is either fully visible or not at all.
	fn commit(&self, receipt: &StageReceipt<D>) -> Result<()>;
	fn reject(&self, receipt: &StageReceipt<D>) -> Result<()>;
	/// Fails with `UnknownDigest` when nothing is committed under `digest`.
	fn erase(&self, digest: &D) -> Result<()>;
}

#[derive(Default)]
struct Inner<D: Ord> {
	committed: BTreeMap<D, Vec<u8>>,
	staged: BTreeMap<D, Vec<u8>>,
}

/// Reference in-memory store, hashing through the payload scheme.
pub struct MemPayloadStore<P: PayloadScheme> {
	scheme: P,
	inner: Arc<Mutex<Inner<P::Digest>>>,
}

impl<P: PayloadScheme> Clone for MemPayloadStore<P>
where
	P: Clone,
{
	fn clone(&self) -> Self {
		MemPayloadStore { scheme: self.scheme.clone(), inner: self.inner.clone() }
	}
}

impl<P: PayloadScheme> MemPayloadStore<P> {
	pub fn new(scheme: P) -> MemPayloadStore<P> {
		MemPayloadStore {
			scheme,
			inner: Arc::new(Mutex::new(Inner {
				committed: BTreeMap::new(),
				staged: BTreeMap::new(),
			})),
		}
	}
}

impl<P: PayloadScheme> PayloadStore<P::Digest> for MemPayloadStore<P> {
	fn get(&self, digest: &P::Digest, offset: u64) -> Result<Option<Vec<u8>>> {
		let inner = self.inner.lock();
		Ok(inner.committed.get(digest).map(|bytes| {
			let start = std::cmp::min(offset as usize, bytes.len());
			bytes[start..].to_vec()
		}))
	}

	fn has(&self, digest: &P::Digest) -> Result<bool> {
		Ok(self.inner.lock().committed.contains_key(digest))
	}

	fn stage(&self, bytes: &[u8]) -> Result<StageReceipt<P::Digest>> {
		let digest = self.scheme.digest(bytes);
		let receipt = StageReceipt { digest: digest.clone(), length: bytes.len() as u64 };
		self.inner.lock().staged.insert(digest, bytes.to_vec());
		Ok(receipt)
	}

	fn commit(&self, receipt: &StageReceipt<P::Digest>) -> Result<()> {
		let mut inner = self.inner.lock();
		match inner.staged.remove(&receipt.digest) {
			Some(bytes) => {
				inner.committed.insert(receipt.digest.clone(), bytes);
				Ok(())
			}
			// Re-committing already visible bytes is not an error; recovery
			// replays commits.
			None if inner.committed.contains_key(&receipt.digest) => Ok(()),
			None => Err(Error::StagingGone),
		}
	}

	fn reject(&self, receipt: &StageReceipt<P::Digest>) -> Result<()> {
		self.inner.lock().staged.remove(&receipt.digest);
		Ok(())
	}

	fn erase(&self, digest: &P::Digest) -> Result<()> {
		match self.inner.lock().committed.remove(digest) {
			Some(_) => Ok(()),
			None => Err(Error::UnknownDigest),
		}
	}
}
