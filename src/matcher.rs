//! Candidate selection for merging.
//!
//! Two tables match when their signature columns are equal ignoring case and
//! surrounding whitespace. The signature value is deliberately not part of
//! the key: tables describing the same kind of attribute are grouped even
//! when their dominant values differ.
//!
//! Matching always runs against the full current store, so merged tables
//! registered by earlier ingestions are candidates too.

use crate::models::Signature;
use crate::store::SignatureStore;

/// Identifiers in `store` that should be merged with `identifier`.
///
/// Never includes `identifier` itself. Order is ascending by identifier.
pub fn find_candidates(
    store: &SignatureStore,
    identifier: &str,
    signature: &Signature,
) -> Vec<String> {
    store.find_matches(identifier, &signature.column)
}
