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

// Protocol parameterisation.
//
// The store is polymorphic in exactly six places: how namespaces, subspaces
// and payload digests are represented and encoded, the path size limits, how
// entries are authorised, and how entries are lifted into range
// fingerprints. Each is a scheme trait here, bundled by `Schemes` and passed
// at construction.
//
// Every `decode` returns the number of bytes consumed. Encoded forms must be
// parseable without out-of-band length information, so stored data survives
// scheme evolution.

use crate::entry::Entry;
use crate::error::Result;

pub trait NamespaceScheme: Send + Sync {
	type Id: Clone + Eq + std::fmt::Debug + Send + Sync;

	fn encode(&self, id: &Self::Id) -> Vec<u8>;
	fn decode(&self, bytes: &[u8]) -> Result<(Self::Id, usize)>;

	fn encoded_length(&self, id: &Self::Id) -> usize {
		self.encode(id).len()
	}
}

pub trait SubspaceScheme: Send + Sync {
	type Id: Clone + Ord + std::fmt::Debug + Send + Sync;

	fn encode(&self, id: &Self::Id) -> Vec<u8>;
	fn decode(&self, bytes: &[u8]) -> Result<(Self::Id, usize)>;
	/// Smallest id strictly greater than `id`, if one exists.
	fn successor(&self, id: &Self::Id) -> Option<Self::Id>;
	fn minimum(&self) -> Self::Id;

	fn encoded_length(&self, id: &Self::Id) -> usize {
		self.encode(id).len()
	}
}

pub trait PathScheme: Send + Sync {
	fn max_component_length(&self) -> usize;
	fn max_component_count(&self) -> usize;
	fn max_total_length(&self) -> usize;
}

pub trait PayloadScheme: Send + Sync {
	type Digest: Clone + Ord + std::fmt::Debug + Send + Sync;

	fn encode(&self, digest: &Self::Digest) -> Vec<u8>;
	fn decode(&self, bytes: &[u8]) -> Result<(Self::Digest, usize)>;
	fn digest(&self, payload: &[u8]) -> Self::Digest;

	fn encoded_length(&self, digest: &Self::Digest) -> usize {
		self.encode(digest).len()
	}
}

pub trait AuthorisationScheme<N, S, D>: Send + Sync {
	type Token: Clone + Send + Sync;
	type Options;

	fn authorise(&self, entry: &Entry<N, S, D>, options: &Self::Options)
		-> Result<Self::Token>;
	fn is_authorised_write(&self, entry: &Entry<N, S, D>, token: &Self::Token) -> bool;
	fn encode_token(&self, token: &Self::Token) -> Vec<u8>;
	fn decode_token(&self, bytes: &[u8]) -> Result<(Self::Token, usize)>;
}

/// Lifting monoid over entries: `combine` is associative and `neutral` is a
/// two-sided identity. Fingerprints are persisted as skip node labels, hence
/// the codec methods.
pub trait FingerprintScheme<N, S, D>: Send + Sync {
	type Fingerprint: Clone + Eq + std::fmt::Debug + Send + Sync;

	fn neutral(&self) -> Self::Fingerprint;
	fn lift_singleton(&self, entry: &Entry<N, S, D>) -> Self::Fingerprint;
	fn combine(
		&self,
		a: &Self::Fingerprint,
		b: &Self::Fingerprint,
	) -> Self::Fingerprint;
	fn encode_fingerprint(&self, fingerprint: &Self::Fingerprint) -> Vec<u8>;
	fn decode_fingerprint(&self, bytes: &[u8]) -> Result<(Self::Fingerprint, usize)>;
}

/// The capability set a replica is constructed with.
pub trait Schemes: Sized + Send + Sync + 'static {
	type Namespace: NamespaceScheme;
	type Subspace: SubspaceScheme;
	type Path: PathScheme;
	type Payload: PayloadScheme;
	type Authorisation: AuthorisationScheme<
		NamespaceId<Self>,
		SubspaceId<Self>,
		PayloadDigest<Self>,
	>;
	type Fingerprint: FingerprintScheme<
		NamespaceId<Self>,
		SubspaceId<Self>,
		PayloadDigest<Self>,
	>;

	fn namespace(&self) -> &Self::Namespace;
	fn subspace(&self) -> &Self::Subspace;
	fn path(&self) -> &Self::Path;
	fn payload(&self) -> &Self::Payload;
	fn authorisation(&self) -> &Self::Authorisation;
	fn fingerprint(&self) -> &Self::Fingerprint;
}

pub type NamespaceId<S> = <<S as Schemes>::Namespace as NamespaceScheme>::Id;
pub type SubspaceId<S> = <<S as Schemes>::Subspace as SubspaceScheme>::Id;
pub type PayloadDigest<S> = <<S as Schemes>::Payload as PayloadScheme>::Digest;
pub type AuthToken<S> = <<S as Schemes>::Authorisation as AuthorisationScheme<
	NamespaceId<S>,
	SubspaceId<S>,
	PayloadDigest<S>,
>>::Token;
pub type AuthOptions<S> = <<S as Schemes>::Authorisation as AuthorisationScheme<
	NamespaceId<S>,
	SubspaceId<S>,
	PayloadDigest<S>,
>>::Options;
pub type Fingerprint<S> = <<S as Schemes>::Fingerprint as FingerprintScheme<
	NamespaceId<S>,
	SubspaceId<S>,
	PayloadDigest<S>,
>>::Fingerprint;

/// Same as [`Entry`] with type arguments from the given [`Schemes`].
pub type SchemeEntry<S> = Entry<NamespaceId<S>, SubspaceId<S>, PayloadDigest<S>>;
