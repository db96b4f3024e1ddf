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

// Shared test fixtures: a concrete scheme bundle over u64 identifiers,
// SHA-256 payload digests, a keyed-hash authorisation token and an
// xor-of-hashes fingerprint.

use std::sync::Arc;
use sha2::Digest as _;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::monoid::SummaryMonoid;
use crate::path::Path;
use crate::scheme::{
	AuthorisationScheme, FingerprintScheme, NamespaceScheme, PathScheme, PayloadScheme,
	SchemeEntry, Schemes, SubspaceScheme,
};

pub const TEST_NAMESPACE: u64 = 0xbeef;
pub const TEST_SECRET: u64 = 0x5ec1e7;

pub type TestEntry = SchemeEntry<TestSchemes>;

fn blake32(parts: &[&[u8]]) -> [u8; 32] {
	let mut hasher = blake2_rfc::blake2b::Blake2b::new(32);
	for part in parts {
		hasher.update(&(part.len() as u64).to_be_bytes());
		hasher.update(part);
	}
	let mut out = [0u8; 32];
	out.copy_from_slice(hasher.finalize().as_bytes());
	out
}

fn take32(bytes: &[u8]) -> Result<([u8; 32], usize)> {
	let slice = bytes
		.get(..32)
		.ok_or_else(|| Error::Corruption("truncated 32 byte value".into()))?;
	let mut out = [0u8; 32];
	out.copy_from_slice(slice);
	Ok((out, 32))
}

fn take_u64(bytes: &[u8]) -> Result<(u64, usize)> {
	let slice = bytes
		.get(..8)
		.ok_or_else(|| Error::Corruption("truncated u64".into()))?;
	let mut buf = [0u8; 8];
	buf.copy_from_slice(slice);
	Ok((u64::from_be_bytes(buf), 8))
}

fn entry_bytes(entry: &TestEntry) -> Vec<u8> {
	let mut out = entry.namespace.to_be_bytes().to_vec();
	out.extend_from_slice(&entry.subspace.to_be_bytes());
	out.extend_from_slice(&entry.timestamp.to_be_bytes());
	out.extend_from_slice(&entry.payload_length.to_be_bytes());
	out.extend_from_slice(&entry.payload_digest);
	out.extend_from_slice(&entry.path.encode());
	out
}

/// Xor-of-hashes monoid over raw key/value pairs, for driving the storage
/// layers directly.
#[derive(Debug, Clone, Copy)]
pub struct XorMonoid;

impl SummaryMonoid for XorMonoid {
	type Summary = [u8; 32];

	fn neutral(&self) -> [u8; 32] {
		[0u8; 32]
	}

	fn lift(&self, key: &[u8], value: &[u8]) -> Result<[u8; 32]> {
		Ok(blake32(&[key, value]))
	}

	fn combine(&self, a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
		let mut out = [0u8; 32];
		for i in 0..32 {
			out[i] = a[i] ^ b[i];
		}
		out
	}

	fn encode(&self, summary: &[u8; 32]) -> Vec<u8> {
		summary.to_vec()
	}

	fn decode(&self, bytes: &[u8]) -> Result<([u8; 32], usize)> {
		take32(bytes)
	}
}

pub struct TestNamespaceScheme;

impl NamespaceScheme for TestNamespaceScheme {
	type Id = u64;

	fn encode(&self, id: &u64) -> Vec<u8> {
		id.to_be_bytes().to_vec()
	}

	fn decode(&self, bytes: &[u8]) -> Result<(u64, usize)> {
		take_u64(bytes)
	}
}

pub struct TestSubspaceScheme;

impl SubspaceScheme for TestSubspaceScheme {
	type Id = u64;

	fn encode(&self, id: &u64) -> Vec<u8> {
		id.to_be_bytes().to_vec()
	}

	fn decode(&self, bytes: &[u8]) -> Result<(u64, usize)> {
		take_u64(bytes)
	}

	fn successor(&self, id: &u64) -> Option<u64> {
		id.checked_add(1)
	}

	fn minimum(&self) -> u64 {
		0
	}
}

pub struct TestPathScheme;

impl PathScheme for TestPathScheme {
	fn max_component_length(&self) -> usize {
		64
	}

	fn max_component_count(&self) -> usize {
		16
	}

	fn max_total_length(&self) -> usize {
		1024
	}
}

#[derive(Clone)]
pub struct TestPayloadScheme;

impl PayloadScheme for TestPayloadScheme {
	type Digest = [u8; 32];

	fn encode(&self, digest: &[u8; 32]) -> Vec<u8> {
		digest.to_vec()
	}

	fn decode(&self, bytes: &[u8]) -> Result<([u8; 32], usize)> {
		take32(bytes)
	}

	fn digest(&self, payload: &[u8]) -> [u8; 32] {
		let mut out = [0u8; 32];
		out.copy_from_slice(&sha2::Sha256::digest(payload));
		out
	}
}

/// Keyed-hash token: authorising with the right secret produces a token the
/// verifier accepts; any other secret fails verification.
pub struct TestAuthorisationScheme {
	secret: u64,
}

impl AuthorisationScheme<u64, u64, [u8; 32]> for TestAuthorisationScheme {
	type Token = [u8; 32];
	type Options = u64;

	fn authorise(
		&self,
		entry: &Entry<u64, u64, [u8; 32]>,
		options: &u64,
	) -> Result<[u8; 32]> {
		Ok(blake32(&[&options.to_be_bytes(), &entry_bytes(entry)]))
	}

	fn is_authorised_write(
		&self,
		entry: &Entry<u64, u64, [u8; 32]>,
		token: &[u8; 32],
	) -> bool {
		*token == blake32(&[&self.secret.to_be_bytes(), &entry_bytes(entry)])
	}

	fn encode_token(&self, token: &[u8; 32]) -> Vec<u8> {
		token.to_vec()
	}

	fn decode_token(&self, bytes: &[u8]) -> Result<([u8; 32], usize)> {
		take32(bytes)
	}
}

pub struct TestFingerprintScheme;

impl FingerprintScheme<u64, u64, [u8; 32]> for TestFingerprintScheme {
	type Fingerprint = [u8; 32];

	fn neutral(&self) -> [u8; 32] {
		[0u8; 32]
	}

	fn lift_singleton(&self, entry: &Entry<u64, u64, [u8; 32]>) -> [u8; 32] {
		blake32(&[&entry_bytes(entry)])
	}

	fn combine(&self, a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
		XorMonoid.combine(a, b)
	}

	fn encode_fingerprint(&self, fingerprint: &[u8; 32]) -> Vec<u8> {
		fingerprint.to_vec()
	}

	fn decode_fingerprint(&self, bytes: &[u8]) -> Result<([u8; 32], usize)> {
		take32(bytes)
	}
}

pub struct TestSchemes {
	namespace: TestNamespaceScheme,
	subspace: TestSubspaceScheme,
	path: TestPathScheme,
	payload: TestPayloadScheme,
	authorisation: TestAuthorisationScheme,
	fingerprint: TestFingerprintScheme,
}

impl TestSchemes {
	pub fn new() -> TestSchemes {
		TestSchemes::with_secret(TEST_SECRET)
	}

	pub fn with_secret(secret: u64) -> TestSchemes {
		TestSchemes {
			namespace: TestNamespaceScheme,
			subspace: TestSubspaceScheme,
			path: TestPathScheme,
			payload: TestPayloadScheme,
			authorisation: TestAuthorisationScheme { secret },
			fingerprint: TestFingerprintScheme,
		}
	}
}

impl Schemes for TestSchemes {
	type Namespace = TestNamespaceScheme;
	type Subspace = TestSubspaceScheme;
	type Path = TestPathScheme;
	type Payload = TestPayloadScheme;
	type Authorisation = TestAuthorisationScheme;
	type Fingerprint = TestFingerprintScheme;

	fn namespace(&self) -> &TestNamespaceScheme {
		&self.namespace
	}

	fn subspace(&self) -> &TestSubspaceScheme {
		&self.subspace
	}

	fn path(&self) -> &TestPathScheme {
		&self.path
	}

	fn payload(&self) -> &TestPayloadScheme {
		&self.payload
	}

	fn authorisation(&self) -> &TestAuthorisationScheme {
		&self.authorisation
	}

	fn fingerprint(&self) -> &TestFingerprintScheme {
		&self.fingerprint
	}
}

pub fn test_path(components: &[&[u8]]) -> Path {
	Path::new(components.iter().map(|c| c.to_vec()).collect(), &TestPathScheme).unwrap()
}

pub fn entry_at(subspace: u64, path: Path, timestamp: u64, payload: &[u8]) -> TestEntry {
	Entry {
		namespace: TEST_NAMESPACE,
		subspace,
		path,
		timestamp,
		payload_length: payload.len() as u64,
		payload_digest: TestPayloadScheme.digest(payload),
	}
}

/// Token the verifying side accepts for `entry`.
pub fn token_for(entry: &TestEntry) -> [u8; 32] {
	blake32(&[&TEST_SECRET.to_be_bytes(), &entry_bytes(entry)])
}

pub type TestReplica = crate::replica::Replica<
	TestSchemes,
	crate::driver::MemDriver,
	crate::payload::MemPayloadStore<TestPayloadScheme>,
>;

pub fn open_replica(
	driver: crate::driver::MemDriver,
	payloads: crate::payload::MemPayloadStore<TestPayloadScheme>,
) -> TestReplica {
	let _ = env_logger::try_init();
	crate::replica::Replica::open(
		Arc::new(TestSchemes::new()),
		TEST_NAMESPACE,
		Arc::new(driver),
		payloads,
	)
	.unwrap()
}

pub fn fresh_replica() -> TestReplica {
	open_replica(
		crate::driver::MemDriver::new(),
		crate::payload::MemPayloadStore::new(TestPayloadScheme),
	)
}
