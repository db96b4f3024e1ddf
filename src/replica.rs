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

// The ingestion engine: policy and coordination over the 3D index, the
// prefix iterator, the write-ahead flag and the payload store.
//
// One replica pins one namespace. Ingestion is serialised end to end by
// `&mut self`; queries borrow shared and therefore never observe the
// intermediate states between the three index writes. Construction replays
// the write-ahead flag before any work is accepted, silently.

use std::sync::mpsc;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::display::hex;
use crate::driver::{Atom, Driver};
use crate::entry::{now_microseconds, Entry, Timestamp};
use crate::error::{Error, Result};
use crate::index::{Area, PersistentIndex, QueryOrder};
use crate::monoid::RangeSummary;
use crate::path::Path;
use crate::payload::PayloadStore;
use crate::prefix::{DriverTrie, PrefixIterator};
use crate::scheme::{
	AuthOptions, AuthToken, AuthorisationScheme, Fingerprint, NamespaceId,
	PayloadDigest, PayloadScheme, SchemeEntry, Schemes, SubspaceScheme,
};
use crate::waf::WriteAheadFlag;

/// Identifies where an externally ingested entry came from, for event
/// consumers; local `set` passes none.
pub type SourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
	NewerPrefixFound,
	ObsoleteFromSameSubspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
	NamespaceMismatch,
	Unauthorised,
}

pub enum IngestOutcome<S: Schemes> {
	Success {
		entry: SchemeEntry<S>,
		token: AuthToken<S>,
		source: Option<SourceId>,
	},
	NoOp(NoOpReason),
	Failure(FailureReason),
}

impl<S: Schemes> IngestOutcome<S> {
	pub fn is_success(&self) -> bool {
		matches!(self, IngestOutcome::Success { .. })
	}
}

// Tokens are opaque and carry no `Debug` requirement, so these cannot be
// derived.
impl<S: Schemes> std::fmt::Debug for IngestOutcome<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			IngestOutcome::Success { entry, source, .. } => f
				.debug_struct("Success")
				.field("entry", entry)
				.field("source", source)
				.finish(),
			IngestOutcome::NoOp(reason) => f.debug_tuple("NoOp").field(reason).finish(),
			IngestOutcome::Failure(reason) =>
				f.debug_tuple("Failure").field(reason).finish(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOutcome {
	Success,
	AlreadyHaveIt,
	NoEntry,
	MismatchedHash,
}

pub enum Event<S: Schemes> {
	EntryIngest { entry: SchemeEntry<S>, token: AuthToken<S> },
	EntryPayloadSet { entry: SchemeEntry<S> },
	PayloadIngest { entry: SchemeEntry<S> },
	EntryRemove { entry: SchemeEntry<S> },
}

impl<S: Schemes> Clone for Event<S> {
	fn clone(&self) -> Self {
		match self {
			Event::EntryIngest { entry, token } =>
				Event::EntryIngest { entry: entry.clone(), token: token.clone() },
			Event::EntryPayloadSet { entry } =>
				Event::EntryPayloadSet { entry: entry.clone() },
			Event::PayloadIngest { entry } =>
				Event::PayloadIngest { entry: entry.clone() },
			Event::EntryRemove { entry } => Event::EntryRemove { entry: entry.clone() },
		}
	}
}

impl<S: Schemes> std::fmt::Debug for Event<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let (name, entry) = match self {
			Event::EntryIngest { entry, .. } => ("EntryIngest", entry),
			Event::EntryPayloadSet { entry } => ("EntryPayloadSet", entry),
			Event::PayloadIngest { entry } => ("PayloadIngest", entry),
			Event::EntryRemove { entry } => ("EntryRemove", entry),
		};
		f.debug_struct(name).field("entry", entry).finish()
	}
}

pub struct SetInput<S: Schemes> {
	pub subspace: <S::Subspace as SubspaceScheme>::Id,
	pub path: Path,
	pub payload: Vec<u8>,
	/// Microseconds; taken from the clock when absent.
	pub timestamp: Option<Timestamp>,
}

pub struct Replica<S, D, P>
where
	S: Schemes,
	D: Driver,
	P: PayloadStore<PayloadDigest<S>>,
{
	schemes: Arc<S>,
	namespace: NamespaceId<S>,
	payloads: P,
	index: PersistentIndex<S, D>,
	prefixes: DriverTrie<D>,
	waf: WriteAheadFlag<S, D>,
	subscribers: Mutex<Vec<mpsc::Sender<Event<S>>>>,
}

impl<S, D, P> Replica<S, D, P>
where
	S: Schemes,
	D: Driver,
	P: PayloadStore<PayloadDigest<S>>,
{
	/// Opens the replica over `driver` and replays any interrupted
	/// ingestion before returning.
	pub fn open(
		schemes: Arc<S>,
		namespace: NamespaceId<S>,
		driver: Arc<D>,
		payloads: P,
	) -> Result<Replica<S, D, P>> {
		let index =
			PersistentIndex::persistent(schemes.clone(), namespace.clone(), driver.clone());
		let prefixes = DriverTrie::open(driver.clone(), vec![Atom::Str("prefix".into())]);
		let waf = WriteAheadFlag::new(schemes.clone(), driver);
		let mut replica = Replica {
			schemes,
			namespace,
			payloads,
			index,
			prefixes,
			waf,
			subscribers: Mutex::new(Vec::new()),
		};
		replica.recover()?;
		Ok(replica)
	}

	pub fn namespace(&self) -> &NamespaceId<S> {
		&self.namespace
	}

	/// Events are delivered in the order the corresponding state changes
	/// take effect; recovery emits nothing.
	pub fn subscribe(&self) -> mpsc::Receiver<Event<S>> {
		let (tx, rx) = mpsc::channel();
		self.subscribers.lock().push(tx);
		rx
	}

	fn emit(&self, event: Event<S>) {
		self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
	}

	fn subspace_prefix_key(&self, entry: &SchemeEntry<S>) -> Vec<u8> {
		let mut key = self.schemes.subspace().encode(&entry.subspace);
		key.extend_from_slice(&entry.path.encode());
		key
	}

	fn token_digest(&self, token: &AuthToken<S>) -> PayloadDigest<S> {
		let encoded = self.schemes.authorisation().encode_token(token);
		self.schemes.payload().digest(&encoded)
	}

	/// Stages a payload, authorises the resulting entry and ingests it.
	/// The payload becomes visible only when ingestion succeeds.
	pub fn set(
		&mut self,
		input: SetInput<S>,
		options: &AuthOptions<S>,
	) -> Result<IngestOutcome<S>> {
		let receipt = self.payloads.stage(&input.payload)?;
		let timestamp = input.timestamp.unwrap_or_else(now_microseconds);
		let entry = Entry {
			namespace: self.namespace.clone(),
			subspace: input.subspace,
			path: input.path,
			timestamp,
			payload_length: receipt.length,
			payload_digest: receipt.digest.clone(),
		};
		let token = self.schemes.authorisation().authorise(&entry, options)?;
		let outcome = self.ingest(entry, token, None)?;
		match &outcome {
			IngestOutcome::Success { entry, .. } => {
				self.payloads.commit(&receipt)?;
				let entry = entry.clone();
				self.emit(Event::EntryPayloadSet { entry });
			}
			_ => self.payloads.reject(&receipt)?,
		}
		Ok(outcome)
	}

	/// Ingests an authorised entry. Policy rejections are returned values;
	/// errors are reserved for driver faults.
	pub fn ingest(
		&mut self,
		entry: SchemeEntry<S>,
		token: AuthToken<S>,
		source: Option<SourceId>,
	) -> Result<IngestOutcome<S>> {
		if entry.namespace != self.namespace {
			log::debug!(target: "meadow-db", "ingest: namespace mismatch");
			return Ok(IngestOutcome::Failure(FailureReason::NamespaceMismatch));
		}
		if !self.schemes.authorisation().is_authorised_write(&entry, &token) {
			log::debug!(target: "meadow-db", "ingest: unauthorised write");
			return Ok(IngestOutcome::Failure(FailureReason::Unauthorised));
		}

		let prefix_key = self.subspace_prefix_key(&entry);
		// A strictly newer (or equal) entry above this path wins outright.
		for found in self.prefixes.prefixes_of(&prefix_key) {
			let (key, value) = found?;
			let timestamp = decode_timestamp(&value)?;
			if timestamp >= entry.timestamp {
				log::trace!(
					target: "meadow-db",
					"ingest: newer prefix {} at {}",
					hex(&key),
					timestamp,
				);
				return Ok(IngestOutcome::NoOp(NoOpReason::NewerPrefixFound));
			}
		}

		// Same-coordinate supersession: at most one entry per
		// (subspace, path) survives, newest-wins on
		// (timestamp, digest, length).
		if let Some((other, other_token_digest)) =
			self.index.get(&entry.subspace, &entry.path)?
		{
			if entry.is_newer_than(&other) {
				log::trace!(
					target: "meadow-db",
					"ingest: superseding entry at {}",
					hex(&prefix_key),
				);
				self.index.remove(&other)?;
				self.prefixes.remove(&prefix_key)?;
				self.erase_payloads(&other, &other_token_digest);
				self.emit(Event::EntryRemove { entry: other });
			} else {
				return Ok(IngestOutcome::NoOp(NoOpReason::ObsoleteFromSameSubspace));
			}
		}

		let token_digest = self.token_digest(&token);
		self.insert_entry(&entry, &token, &token_digest, true)?;

		if source.is_some() {
			self.emit(Event::EntryIngest {
				entry: entry.clone(),
				token: token.clone(),
			});
		}
		Ok(IngestOutcome::Success { entry, token, source })
	}

	/// The atomic insert procedure: flag, write everywhere, sweep out
	/// pruned descendants, unflag.
	fn insert_entry(
		&mut self,
		entry: &SchemeEntry<S>,
		token: &AuthToken<S>,
		token_digest: &PayloadDigest<S>,
		notify: bool,
	) -> Result<()> {
		let prefix_key = self.subspace_prefix_key(entry);
		self.waf.flag_insertion(entry, token_digest)?;
		self.index.insert(entry, token_digest)?;
		let encoded_token = self.schemes.authorisation().encode_token(token);
		let receipt = self.payloads.stage(&encoded_token)?;
		self.payloads.commit(&receipt)?;
		self.prefixes.insert(&prefix_key, &entry.timestamp.to_be_bytes())?;
		self.sweep_descendants(entry, &prefix_key, notify)?;
		self.waf.unflag_insertion()?;
		log::trace!(
			target: "meadow-db",
			"ingest: inserted {} at {}",
			hex(&prefix_key),
			entry.timestamp,
		);
		Ok(())
	}

	/// Prefix pruning: evict every strictly older same-subspace entry whose
	/// path the new entry prefixes.
	fn sweep_descendants(
		&mut self,
		entry: &SchemeEntry<S>,
		prefix_key: &[u8],
		notify: bool,
	) -> Result<()> {
		let descendants: Vec<(Vec<u8>, Vec<u8>)> =
			self.prefixes.prefixed_by(prefix_key).collect::<Result<_>>()?;
		for (key, value) in descendants {
			let timestamp = decode_timestamp(&value)?;
			if timestamp >= entry.timestamp {
				continue;
			}
			let (subspace, path) = self.decode_prefix_key(&key)?;
			match self.index.get(&subspace, &path)? {
				Some((victim, victim_token_digest)) => {
					log::trace!(
						target: "meadow-db",
						"ingest: pruning {} at {}",
						hex(&key),
						victim.timestamp,
					);
					self.waf.flag_removal(&victim)?;
					self.index.remove(&victim)?;
					self.erase_payloads(&victim, &victim_token_digest);
					self.prefixes.remove(&key)?;
					self.waf.unflag_removal()?;
					if notify {
						self.emit(Event::EntryRemove { entry: victim });
					}
				}
				// A prefix key without an index entry is replay residue.
				None => {
					self.prefixes.remove(&key)?;
				}
			}
		}
		Ok(())
	}

	fn decode_prefix_key(
		&self,
		key: &[u8],
	) -> Result<(<S::Subspace as SubspaceScheme>::Id, Path)> {
		let (subspace, used) = self.schemes.subspace().decode(key)?;
		let path = Path::decode(
			key.get(used..)
				.ok_or_else(|| Error::Corruption("truncated prefix key".into()))?,
		)?;
		Ok((subspace, path))
	}

	/// Payload and token bytes share the entry's lifecycle; either may
	/// legitimately be absent already.
	fn erase_payloads(&self, entry: &SchemeEntry<S>, token_digest: &PayloadDigest<S>) {
		if let Err(Error::UnknownDigest) = self.payloads.erase(&entry.payload_digest) {
			log::debug!(target: "meadow-db", "no payload to erase for pruned entry");
		}
		if let Err(Error::UnknownDigest) = self.payloads.erase(token_digest) {
			log::debug!(target: "meadow-db", "no token to erase for pruned entry");
		}
	}

	/// Attaches payload bytes to an entry ingested without them.
	pub fn ingest_payload(
		&mut self,
		subspace: &<S::Subspace as SubspaceScheme>::Id,
		path: &Path,
		payload: &[u8],
	) -> Result<PayloadOutcome> {
		let (entry, _) = match self.index.get(subspace, path)? {
			None => return Ok(PayloadOutcome::NoEntry),
			Some(found) => found,
		};
		if self.payloads.has(&entry.payload_digest)? {
			return Ok(PayloadOutcome::AlreadyHaveIt);
		}
		let receipt = self.payloads.stage(payload)?;
		if receipt.digest != entry.payload_digest {
			self.payloads.reject(&receipt)?;
			return Ok(PayloadOutcome::MismatchedHash);
		}
		self.payloads.commit(&receipt)?;
		self.emit(Event::PayloadIngest { entry });
		Ok(PayloadOutcome::Success)
	}

	/// Explicitly drops the entry at (subspace, path) together with its
	/// payload and token.
	pub fn forget(
		&mut self,
		subspace: &<S::Subspace as SubspaceScheme>::Id,
		path: &Path,
	) -> Result<bool> {
		let (entry, token_digest) = match self.index.get(subspace, path)? {
			None => return Ok(false),
			Some(found) => found,
		};
		let prefix_key = self.subspace_prefix_key(&entry);
		self.waf.flag_removal(&entry)?;
		self.index.remove(&entry)?;
		self.erase_payloads(&entry, &token_digest);
		self.prefixes.remove(&prefix_key)?;
		self.waf.unflag_removal()?;
		self.emit(Event::EntryRemove { entry });
		Ok(true)
	}

	pub fn get_entry(
		&self,
		subspace: &<S::Subspace as SubspaceScheme>::Id,
		path: &Path,
	) -> Result<Option<SchemeEntry<S>>> {
		Ok(self.index.get(subspace, path)?.map(|(entry, _)| entry))
	}

	pub fn get_payload(
		&self,
		subspace: &<S::Subspace as SubspaceScheme>::Id,
		path: &Path,
	) -> Result<Option<Vec<u8>>> {
		match self.index.get(subspace, path)? {
			None => Ok(None),
			Some((entry, _)) => self.payloads.get(&entry.payload_digest, 0),
		}
	}

	/// Entries in `area` with their tokens and payload bytes. Entries whose
	/// token bytes are gone cannot be replayed faithfully and are skipped.
	pub fn query<'a>(
		&'a self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
		order: QueryOrder,
		reverse: bool,
		max_count: u64,
		max_size: u64,
	) -> impl Iterator<Item = Result<(SchemeEntry<S>, AuthToken<S>, Option<Vec<u8>>)>> + 'a
	{
		self.index
			.query(area, order, reverse, max_count, max_size)
			.filter_map(move |found| {
				let (entry, token_digest) = match found {
					Ok(found) => found,
					Err(e) => return Some(Err(e)),
				};
				let token_bytes = match self.payloads.get(&token_digest, 0) {
					Ok(Some(bytes)) => bytes,
					Ok(None) => {
						log::warn!(
							target: "meadow-db",
							"query: missing token bytes, skipping entry",
						);
						return None;
					}
					Err(e) => return Some(Err(e)),
				};
				let token =
					match self.schemes.authorisation().decode_token(&token_bytes) {
						Ok((token, _)) => token,
						Err(e) => return Some(Err(e)),
					};
				let payload = match self.payloads.get(&entry.payload_digest, 0) {
					Ok(payload) => payload,
					Err(e) => return Some(Err(e)),
				};
				Some(Ok((entry, token, payload)))
			})
	}

	/// Fingerprint and size of `area`, as used by range reconciliation.
	pub fn summarise(
		&self,
		area: &Area<<S::Subspace as SubspaceScheme>::Id>,
		count_limit: u64,
		size_limit: u64,
	) -> Result<RangeSummary<Fingerprint<S>>> {
		self.index.summarise(area, count_limit, size_limit)
	}

	/// Write-ahead replay. A pending removal is completed; a pending
	/// insertion is rolled forward when its token bytes survived and rolled
	/// back otherwise. No events are emitted.
	fn recover(&mut self) -> Result<()> {
		if let Some(entry) = self.waf.was_removing()? {
			log::info!(
				target: "meadow-db",
				"recovery: completing interrupted removal",
			);
			self.index.remove(&entry)?;
			let prefix_key = self.subspace_prefix_key(&entry);
			// Only clear the prefix slot if it still belongs to this entry.
			if let Some(value) = self.prefixes.get(&prefix_key)? {
				if decode_timestamp(&value)? == entry.timestamp {
					self.prefixes.remove(&prefix_key)?;
				}
			}
			self.waf.unflag_removal()?;
		}
		if let Some((entry, token_digest)) = self.waf.was_inserting()? {
			let prefix_key = self.subspace_prefix_key(&entry);
			if self.payloads.has(&token_digest)? {
				log::info!(
					target: "meadow-db",
					"recovery: replaying interrupted insertion",
				);
				self.index.insert(&entry, &token_digest)?;
				self.prefixes.insert(&prefix_key, &entry.timestamp.to_be_bytes())?;
				self.sweep_descendants(&entry, &prefix_key, false)?;
			} else {
				// The token never became durable; the insert cannot be
				// completed, so undo what reached the index.
				log::info!(
					target: "meadow-db",
					"recovery: rolling back interrupted insertion",
				);
				self.index.remove(&entry)?;
				if let Some(value) = self.prefixes.get(&prefix_key)? {
					if decode_timestamp(&value)? == entry.timestamp {
						self.prefixes.remove(&prefix_key)?;
					}
				}
			}
			self.waf.unflag_insertion()?;
		}
		Ok(())
	}
}

fn decode_timestamp(value: &[u8]) -> Result<Timestamp> {
	if value.len() != 8 {
		return Err(Error::Corruption("malformed prefix timestamp".into()));
	}
	let mut buf = [0u8; 8];
	buf.copy_from_slice(value);
	Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::driver::MemDriver;
	use crate::index::PersistentIndex;
	use crate::payload::MemPayloadStore;
	use crate::scheme::FingerprintScheme;
	use crate::testing::{
		entry_at, fresh_replica, open_replica, test_path, token_for, TestEntry,
		TestPayloadScheme, TestReplica, TestSchemes, TEST_NAMESPACE, TEST_SECRET,
	};

	fn set_at(
		replica: &mut TestReplica,
		subspace: u64,
		path: Path,
		timestamp: u64,
		payload: &[u8],
	) -> IngestOutcome<TestSchemes> {
		replica
			.set(
				SetInput {
					subspace,
					path,
					payload: payload.to_vec(),
					timestamp: Some(timestamp),
				},
				&TEST_SECRET,
			)
			.unwrap()
	}

	fn all_entries(replica: &TestReplica) -> Vec<TestEntry> {
		replica
			.query(&Area::full(), QueryOrder::Subspace, false, 0, 0)
			.map(|r| r.unwrap().0)
			.collect()
	}

	fn prefix_key(entry: &TestEntry) -> Vec<u8> {
		let mut key = entry.subspace.to_be_bytes().to_vec();
		key.extend_from_slice(&entry.path.encode());
		key
	}

	// P1, P2 and P4 over the live state.
	fn check_invariants(replica: &TestReplica) {
		let entries = all_entries(replica);
		for a in &entries {
			for b in &entries {
				if a.subspace == b.subspace && a.path.is_proper_prefix_of(&b.path) {
					assert!(
						a.timestamp < b.timestamp,
						"prefix {:?} not older than {:?}",
						a,
						b,
					);
				}
				if a.subspace == b.subspace && a.path == b.path {
					assert_eq!(a, b, "two entries at one coordinate");
				}
			}
			let stored = replica.prefixes.get(&prefix_key(a)).unwrap();
			assert_eq!(stored, Some(a.timestamp.to_be_bytes().to_vec()));
		}
		let trie_keys = replica
			.prefixes
			.prefixed_by(&[])
			.collect::<Result<Vec<_>>>()
			.unwrap();
		assert_eq!(trie_keys.len(), entries.len());
	}

	#[test]
	fn two_subspaces_keep_the_same_path() {
		let mut replica = fresh_replica();
		assert!(set_at(&mut replica, 1, test_path(&[b"p", b"a", b"t", b"h"]), 1, b"x")
			.is_success());
		assert!(set_at(&mut replica, 2, test_path(&[b"p", b"a", b"t", b"h"]), 1, b"y")
			.is_success());
		let by_path: Vec<TestEntry> = replica
			.query(&Area::full(), QueryOrder::Path, false, 0, 0)
			.map(|r| r.unwrap().0)
			.collect();
		assert_eq!(by_path.len(), 2);
		assert_eq!(by_path[0].path, by_path[1].path);
		check_invariants(&replica);
	}

	#[test]
	fn same_coordinates_keep_only_the_newest() {
		let mut replica = fresh_replica();
		let path = test_path(&[b"p", b"a", b"t", b"h", b"b"]);
		assert!(set_at(&mut replica, 1, path.clone(), 1, b"first").is_success());
		assert!(set_at(&mut replica, 1, path.clone(), 2, b"second").is_success());
		let entries = all_entries(&replica);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].timestamp, 2);
		assert_eq!(
			replica.get_payload(&1, &path).unwrap(),
			Some(b"second".to_vec()),
		);
		check_invariants(&replica);
	}

	#[test]
	fn newer_parent_prunes_children() {
		let mut replica = fresh_replica();
		assert!(set_at(&mut replica, 1, test_path(&[&[0], &[1]]), 0, b"a").is_success());
		assert!(set_at(&mut replica, 1, test_path(&[&[0], &[2]]), 0, b"b").is_success());
		assert!(set_at(&mut replica, 1, test_path(&[&[0]]), 1, b"parent").is_success());
		let entries = all_entries(&replica);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].path, test_path(&[&[0]]));
		assert_eq!(
			replica.get_payload(&1, &test_path(&[&[0]])).unwrap(),
			Some(b"parent".to_vec()),
		);
		// Pruned payloads are erased with their entries.
		assert_eq!(replica.get_payload(&1, &test_path(&[&[0], &[1]])).unwrap(), None);
		check_invariants(&replica);
	}

	#[test]
	fn newer_prefix_rejects_child() {
		let mut replica = fresh_replica();
		assert!(set_at(&mut replica, 1, test_path(&[&[0], &[0], &[0], &[0]]), 2000, b"big")
			.is_success());
		let outcome = set_at(
			&mut replica,
			1,
			test_path(&[&[0], &[0], &[0], &[0], &[1]]),
			1000,
			b"child",
		);
		assert!(matches!(
			outcome,
			IngestOutcome::NoOp(NoOpReason::NewerPrefixFound)
		));
		assert_eq!(all_entries(&replica).len(), 1);
		// The rejected payload was never committed.
		assert_eq!(
			replica
				.get_payload(&1, &test_path(&[&[0], &[0], &[0], &[0], &[1]]))
				.unwrap(),
			None,
		);
		check_invariants(&replica);
	}

	#[test]
	fn equal_timestamp_ties_break_by_digest_then_length() {
		let mut replica = fresh_replica();
		let path = test_path(&[b"tie"]);
		assert!(set_at(&mut replica, 1, path.clone(), 5, b"aaa").is_success());
		let first = all_entries(&replica)[0].clone();
		// Same timestamp; whichever payload digests higher must win.
		let outcome = set_at(&mut replica, 1, path.clone(), 5, b"bbb");
		let second = entry_at(1, path.clone(), 5, b"bbb");
		if second.payload_digest > first.payload_digest {
			assert!(outcome.is_success());
			assert_eq!(replica.get_payload(&1, &path).unwrap(), Some(b"bbb".to_vec()));
		} else {
			assert!(matches!(
				outcome,
				IngestOutcome::NoOp(NoOpReason::ObsoleteFromSameSubspace)
			));
			assert_eq!(replica.get_payload(&1, &path).unwrap(), Some(b"aaa".to_vec()));
		}
		assert_eq!(all_entries(&replica).len(), 1);
	}

	#[test]
	fn reingesting_a_stored_entry_changes_nothing() {
		let mut replica = fresh_replica();
		let entry = entry_at(1, test_path(&[b"doc"]), 77, b"payload");
		let token = token_for(&entry);
		assert!(replica.ingest(entry.clone(), token, None).unwrap().is_success());
		let before = all_entries(&replica);
		let again = replica.ingest(entry, token, None).unwrap();
		assert!(matches!(
			again,
			IngestOutcome::NoOp(NoOpReason::ObsoleteFromSameSubspace)
		));
		assert_eq!(all_entries(&replica), before);
		check_invariants(&replica);
	}

	#[test]
	fn rejects_foreign_namespace_and_bad_tokens() {
		let mut replica = fresh_replica();
		let mut foreign = entry_at(1, test_path(&[b"doc"]), 1, b"x");
		foreign.namespace = TEST_NAMESPACE + 1;
		let outcome = replica
			.ingest(foreign.clone(), token_for(&foreign), None)
			.unwrap();
		assert!(matches!(
			outcome,
			IngestOutcome::Failure(FailureReason::NamespaceMismatch)
		));

		let entry = entry_at(1, test_path(&[b"doc"]), 1, b"x");
		let outcome = replica.ingest(entry, [0u8; 32], None).unwrap();
		assert!(matches!(
			outcome,
			IngestOutcome::Failure(FailureReason::Unauthorised)
		));
		assert!(all_entries(&replica).is_empty());
	}

	#[test]
	fn payload_ingestion_checks_digest() {
		let mut replica = fresh_replica();
		let path = test_path(&[b"file"]);
		let entry = entry_at(1, path.clone(), 9, b"contents");
		let token = token_for(&entry);
		assert!(replica.ingest(entry, token, None).unwrap().is_success());
		assert_eq!(replica.get_payload(&1, &path).unwrap(), None);

		assert_eq!(
			replica.ingest_payload(&1, &test_path(&[b"nope"]), b"contents").unwrap(),
			PayloadOutcome::NoEntry,
		);
		assert_eq!(
			replica.ingest_payload(&1, &path, b"wrong bytes").unwrap(),
			PayloadOutcome::MismatchedHash,
		);
		assert_eq!(
			replica.ingest_payload(&1, &path, b"contents").unwrap(),
			PayloadOutcome::Success,
		);
		assert_eq!(replica.get_payload(&1, &path).unwrap(), Some(b"contents".to_vec()));
		assert_eq!(
			replica.ingest_payload(&1, &path, b"contents").unwrap(),
			PayloadOutcome::AlreadyHaveIt,
		);
	}

	#[test]
	fn forget_erases_entry_payload_and_prefix() {
		let mut replica = fresh_replica();
		let path = test_path(&[b"gone"]);
		assert!(set_at(&mut replica, 1, path.clone(), 3, b"bytes").is_success());
		assert!(replica.forget(&1, &path).unwrap());
		assert!(!replica.forget(&1, &path).unwrap());
		assert!(replica.get_entry(&1, &path).unwrap().is_none());
		assert!(replica.get_payload(&1, &path).unwrap().is_none());
		assert!(all_entries(&replica).is_empty());
		check_invariants(&replica);
	}

	#[test]
	fn events_follow_state_changes() {
		let mut replica = fresh_replica();
		let events = replica.subscribe();
		assert!(set_at(&mut replica, 1, test_path(&[b"a", b"b"]), 1, b"child")
			.is_success());
		assert!(set_at(&mut replica, 1, test_path(&[b"a"]), 2, b"parent").is_success());

		let entry = entry_at(2, test_path(&[b"remote"]), 4, b"r");
		let token = token_for(&entry);
		assert!(replica.ingest(entry, token, Some(17)).unwrap().is_success());

		let seen: Vec<Event<TestSchemes>> = events.try_iter().collect();
		let kinds: Vec<&'static str> = seen
			.iter()
			.map(|e| match e {
				Event::EntryIngest { .. } => "ingest",
				Event::EntryPayloadSet { .. } => "payload_set",
				Event::PayloadIngest { .. } => "payload_ingest",
				Event::EntryRemove { .. } => "remove",
			})
			.collect();
		// Child set, then parent set pruning the child, then remote ingest.
		assert_eq!(kinds, vec!["payload_set", "remove", "payload_set", "ingest"]);
		match &seen[1] {
			Event::EntryRemove { entry } => {
				assert_eq!(entry.path, test_path(&[b"a", b"b"]))
			}
			other => panic!("unexpected event {:?}", other),
		}
	}

	#[test]
	fn query_skips_entries_with_missing_tokens() {
		let mut replica = fresh_replica();
		let entry = entry_at(1, test_path(&[b"doc"]), 1, b"x");
		let token = token_for(&entry);
		assert!(replica.ingest(entry.clone(), token, None).unwrap().is_success());
		let token_digest = replica.token_digest(&token);
		replica.payloads.erase(&token_digest).unwrap();
		assert!(all_entries(&replica).is_empty());
		// The entry itself is still indexed.
		assert_eq!(replica.get_entry(&1, &test_path(&[b"doc"])).unwrap(), Some(entry));
	}

	#[test]
	fn summarise_matches_entry_fold() {
		let mut replica = fresh_replica();
		assert!(set_at(&mut replica, 1, test_path(&[b"a"]), 10, b"x").is_success());
		assert!(set_at(&mut replica, 1, test_path(&[b"b"]), 20, b"yy").is_success());
		assert!(set_at(&mut replica, 2, test_path(&[b"c"]), 30, b"zzz").is_success());
		let schemes = TestSchemes::new();
		let fingerprints = schemes.fingerprint();
		let area = Area::full();
		let summary = replica.summarise(&area, 0, 0).unwrap();
		let mut expected = fingerprints.neutral();
		let mut count = 0;
		for entry in all_entries(&replica) {
			expected =
				fingerprints.combine(&expected, &fingerprints.lift_singleton(&entry));
			count += 1;
		}
		assert_eq!(summary.fingerprint, expected);
		assert_eq!(summary.size, count);
	}

	#[test]
	fn recovery_replays_flagged_insertion() {
		let driver = MemDriver::new();
		let payloads = MemPayloadStore::new(TestPayloadScheme);
		let schemes = Arc::new(TestSchemes::new());
		let entry = entry_at(1, test_path(&[b"crash"]), 500, b"payload");
		let token = token_for(&entry);
		let encoded_token = token.to_vec();
		let token_digest = TestPayloadScheme.digest(&encoded_token);
		{
			// Crash after the flag and the token commit, before any index
			// write.
			let waf: WriteAheadFlag<TestSchemes, MemDriver> =
				WriteAheadFlag::new(schemes.clone(), Arc::new(driver.clone()));
			waf.flag_insertion(&entry, &token_digest).unwrap();
			let receipt = payloads.stage(&encoded_token).unwrap();
			payloads.commit(&receipt).unwrap();
		}
		let recovered = open_replica(driver.clone(), payloads.clone());
		assert_eq!(
			recovered.get_entry(&1, &test_path(&[b"crash"])).unwrap(),
			Some(entry.clone()),
		);
		check_invariants(&recovered);

		// Same state as a clean ingest on a fresh driver.
		let mut clean = fresh_replica();
		assert!(clean.ingest(entry, token, None).unwrap().is_success());
		assert_eq!(all_entries(&recovered), all_entries(&clean));
		assert_eq!(
			recovered.summarise(&Area::full(), 0, 0).unwrap(),
			clean.summarise(&Area::full(), 0, 0).unwrap(),
		);

		// The flag is cleared; reopening again replays nothing.
		let reopened = open_replica(driver, payloads);
		assert_eq!(all_entries(&reopened), all_entries(&recovered));
	}

	#[test]
	fn recovery_rolls_back_insertion_without_token() {
		let driver = MemDriver::new();
		let payloads = MemPayloadStore::new(TestPayloadScheme);
		let schemes = Arc::new(TestSchemes::new());
		let entry = entry_at(1, test_path(&[b"halfway"]), 600, b"payload");
		let token_digest = TestPayloadScheme.digest(&token_for(&entry));
		{
			// Crash after the flag and a partial index write; the token
			// never became durable.
			let waf: WriteAheadFlag<TestSchemes, MemDriver> =
				WriteAheadFlag::new(schemes.clone(), Arc::new(driver.clone()));
			waf.flag_insertion(&entry, &token_digest).unwrap();
			let mut index = PersistentIndex::persistent(
				schemes.clone(),
				TEST_NAMESPACE,
				Arc::new(driver.clone()),
			);
			index.insert(&entry, &token_digest).unwrap();
		}
		let recovered = open_replica(driver, payloads);
		assert!(recovered.get_entry(&1, &test_path(&[b"halfway"])).unwrap().is_none());
		assert!(all_entries(&recovered).is_empty());
		check_invariants(&recovered);
	}

	#[test]
	fn recovery_completes_interrupted_sweep_removal() {
		let driver = MemDriver::new();
		let payloads = MemPayloadStore::new(TestPayloadScheme);
		let schemes = Arc::new(TestSchemes::new());
		let child = entry_at(1, test_path(&[b"dir", b"leaf"]), 1, b"old");
		let parent = entry_at(1, test_path(&[b"dir"]), 9, b"new");
		{
			let mut replica = open_replica(driver.clone(), payloads.clone());
			assert!(replica
				.ingest(child.clone(), token_for(&child), None)
				.unwrap()
				.is_success());
		}
		{
			// Mid-ingestion crash: the parent is flagged and written, the
			// child's removal is flagged but unfinished.
			let waf: WriteAheadFlag<TestSchemes, MemDriver> =
				WriteAheadFlag::new(schemes.clone(), Arc::new(driver.clone()));
			let encoded_token = token_for(&parent).to_vec();
			let token_digest = TestPayloadScheme.digest(&encoded_token);
			waf.flag_insertion(&parent, &token_digest).unwrap();
			let receipt = payloads.stage(&encoded_token).unwrap();
			payloads.commit(&receipt).unwrap();
			let mut index = PersistentIndex::persistent(
				schemes.clone(),
				TEST_NAMESPACE,
				Arc::new(driver.clone()),
			);
			index.insert(&parent, &token_digest).unwrap();
			waf.flag_removal(&child).unwrap();
		}
		let recovered = open_replica(driver, payloads);
		let entries = all_entries(&recovered);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0], parent);
		check_invariants(&recovered);
	}
}
