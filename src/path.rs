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

// Entry paths and their byte encoding.
//
// A path is a sequence of byte-string components, compared component-wise
// lexicographically. The encoding escapes 0x00 inside a component as
// [0x00, 0x01] and terminates every component with [0x00, 0x00], so the
// encoded bytes order exactly as the paths do and a path that is a
// component-prefix of another encodes to a byte-prefix of the other's
// encoding. The encoding does not delimit the whole path; stored values
// carry the encoded length.

use crate::error::{Error, Result};
use crate::scheme::PathScheme;

const ESCAPE: u8 = 0x01;
const TERMINATOR: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path {
	components: Vec<Vec<u8>>,
}

impl Path {
	pub fn new(components: Vec<Vec<u8>>, scheme: &impl PathScheme) -> Result<Path> {
		if components.len() > scheme.max_component_count() {
			return Err(Error::InvalidPath(format!(
				"{} components, at most {} allowed",
				components.len(),
				scheme.max_component_count(),
			)));
		}
		let mut total = 0;
		for component in &components {
			if component.len() > scheme.max_component_length() {
				return Err(Error::InvalidPath(format!(
					"component of {} bytes, at most {} allowed",
					component.len(),
					scheme.max_component_length(),
				)));
			}
			total += component.len();
		}
		if total > scheme.max_total_length() {
			return Err(Error::InvalidPath(format!(
				"{} bytes total, at most {} allowed",
				total,
				scheme.max_total_length(),
			)));
		}
		Ok(Path { components })
	}

	pub fn empty() -> Path {
		Default::default()
	}

	pub fn components(&self) -> &[Vec<u8>] {
		&self.components
	}

	pub fn is_empty(&self) -> bool {
		self.components.is_empty()
	}

	/// Component-prefix relation, the path itself included.
	pub fn is_prefix_of(&self, other: &Path) -> bool {
		self.components.len() <= other.components.len()
			&& self.components.iter().zip(other.components.iter()).all(|(a, b)| a == b)
	}

	pub fn is_proper_prefix_of(&self, other: &Path) -> bool {
		self.components.len() < other.components.len() && self.is_prefix_of(other)
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.components.iter().map(|c| c.len() + 2).sum());
		for component in &self.components {
			for byte in component {
				if *byte == 0x00 {
					out.push(0x00);
					out.push(ESCAPE);
				} else {
					out.push(*byte);
				}
			}
			out.push(0x00);
			out.push(TERMINATOR);
		}
		out
	}

	pub fn encoded_length(&self) -> usize {
		self.components
			.iter()
			.map(|c| c.len() + 2 + c.iter().filter(|b| **b == 0x00).count())
			.sum()
	}

	/// Inverse of `encode`; the slice must hold exactly one encoded path.
	pub fn decode(bytes: &[u8]) -> Result<Path> {
		let mut components = Vec::new();
		let mut current = Vec::new();
		let mut pos = 0;
		while pos < bytes.len() {
			let byte = bytes[pos];
			if byte == 0x00 {
				match bytes.get(pos + 1) {
					Some(&ESCAPE) => current.push(0x00),
					Some(&TERMINATOR) => components.push(std::mem::take(&mut current)),
					_ => return Err(Error::Corruption("truncated path escape".into())),
				}
				pos += 2;
			} else {
				current.push(byte);
				pos += 1;
			}
		}
		if !current.is_empty() {
			return Err(Error::Corruption("unterminated path component".into()));
		}
		Ok(Path { components })
	}
}

/// Upper bound for the half-open range of byte strings starting with
/// `prefix`. `None` when no such bound exists (all 0xff).
pub fn successor_bytes(prefix: &[u8]) -> Option<Vec<u8>> {
	let mut out = prefix.to_vec();
	while let Some(last) = out.pop() {
		if last < 0xff {
			out.push(last + 1);
			return Some(out);
		}
	}
	None
}
