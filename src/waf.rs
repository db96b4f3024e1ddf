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

// Write-ahead flag: a minimal redo log for the single in-flight insert
// and/or remove of one ingestion.
//
// ["waf", "insert"] -> encoded entry
// ["waf", "insert", "auth_token_hash"] -> encoded token digest
// ["waf", "remove"] -> encoded entry
//
// At most one of each is ever flagged. Replica construction reads both and
// replays before accepting work.

use std::sync::Arc;
use crate::driver::{Atom, Batch, Driver, Key};
use crate::entry::{decode_entry, encode_entry};
use crate::error::{Error, Result};
use crate::scheme::{PayloadDigest, PayloadScheme, SchemeEntry, Schemes};

pub struct WriteAheadFlag<S: Schemes, D: Driver> {
	schemes: Arc<S>,
	driver: Arc<D>,
}

fn insert_key() -> Key {
	vec![Atom::Str("waf".into()), Atom::Str("insert".into())]
}

fn insert_token_key() -> Key {
	vec![
		Atom::Str("waf".into()),
		Atom::Str("insert".into()),
		Atom::Str("auth_token_hash".into()),
	]
}

fn remove_key() -> Key {
	vec![Atom::Str("waf".into()), Atom::Str("remove".into())]
}

impl<S: Schemes, D: Driver> WriteAheadFlag<S, D> {
	pub fn new(schemes: Arc<S>, driver: Arc<D>) -> WriteAheadFlag<S, D> {
		WriteAheadFlag { schemes, driver }
	}

	pub fn was_inserting(&self) -> Result<Option<(SchemeEntry<S>, PayloadDigest<S>)>> {
		let entry = match self.driver.get(&insert_key())? {
			None => return Ok(None),
			Some(bytes) => decode_entry(&*self.schemes, &bytes)?.0,
		};
		let digest = match self.driver.get(&insert_token_key())? {
			None => {
				return Err(Error::Corruption(
					"insertion flagged without token digest".into(),
				))
			}
			Some(bytes) => self.schemes.payload().decode(&bytes)?.0,
		};
		Ok(Some((entry, digest)))
	}

	pub fn was_removing(&self) -> Result<Option<SchemeEntry<S>>> {
		match self.driver.get(&remove_key())? {
			None => Ok(None),
			Some(bytes) => Ok(Some(decode_entry(&*self.schemes, &bytes)?.0)),
		}
	}

	pub fn flag_insertion(
		&self,
		entry: &SchemeEntry<S>,
		token_digest: &PayloadDigest<S>,
	) -> Result<()> {
		let mut batch = Batch::new();
		batch.set(insert_key(), encode_entry(&*self.schemes, entry));
		batch.set(insert_token_key(), self.schemes.payload().encode(token_digest));
		self.driver.commit(batch)
	}

	pub fn unflag_insertion(&self) -> Result<()> {
		let mut batch = Batch::new();
		batch.delete(insert_key());
		batch.delete(insert_token_key());
		self.driver.commit(batch)
	}

	pub fn flag_removal(&self, entry: &SchemeEntry<S>) -> Result<()> {
		self.driver.set(remove_key(), encode_entry(&*self.schemes, entry))
	}

	pub fn unflag_removal(&self) -> Result<()> {
		self.driver.delete(&remove_key())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::driver::MemDriver;
	use crate::testing::{entry_at, test_path, TestSchemes};

	#[test]
	fn flags_roundtrip_and_clear() {
		let waf = WriteAheadFlag::new(
			Arc::new(TestSchemes::new()),
			Arc::new(MemDriver::new()),
		);
		assert!(waf.was_inserting().unwrap().is_none());
		assert!(waf.was_removing().unwrap().is_none());

		let entry = entry_at(3, test_path(&[b"a", b"b"]), 42, b"payload");
		let digest = [7u8; 32];
		waf.flag_insertion(&entry, &digest).unwrap();
		assert_eq!(waf.was_inserting().unwrap(), Some((entry.clone(), digest)));

		let victim = entry_at(3, test_path(&[b"a", b"b", b"c"]), 7, b"old");
		waf.flag_removal(&victim).unwrap();
		assert_eq!(waf.was_removing().unwrap(), Some(victim));

		waf.unflag_removal().unwrap();
		assert!(waf.was_removing().unwrap().is_none());
		// The insertion flag is untouched by removal bookkeeping.
		assert!(waf.was_inserting().unwrap().is_some());
		waf.unflag_insertion().unwrap();
		assert!(waf.was_inserting().unwrap().is_none());
	}
}
