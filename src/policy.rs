//! # Secure Value-Type Policies
//!
//! Storage nodes consult a value type's store and edit predicates before
//! accepting a new or replacement value. [`secure_type`] wraps those
//! predicates with the overlay's cryptographic checks:
//!
//! - stored signed values must carry a valid signature from their owner
//! - edits must preserve ownership, be signed by the original owner, and
//!   advance the sequence number (an unchanged sequence number is accepted
//!   only for a byte-identical re-announce, possibly by another forwarder)
//! - encrypted values are opaque to storage nodes and pass through to the
//!   inner policies untouched
//!
//! The wrappers close over the inner predicates, so type-specific rules
//! still apply after the cryptographic checks succeed.

use std::sync::Arc;

use tracing::warn;

use crate::value::TypeSpec;

/// Wrap a value type's policies with signature, ownership and sequence
/// enforcement.
pub fn secure_type(spec: TypeSpec) -> TypeSpec {
    let inner_store = spec.store_policy.clone();
    let store_policy = Arc::new(
        move |key: &crate::InfoHash,
              value: &crate::Value,
              from: &crate::InfoHash,
              addr: Option<std::net::SocketAddr>| {
            if value.is_signed() && !value.is_encrypted() {
                let Some(owner) = &value.owner else {
                    warn!(key = %key, "store rejected: signed value without owner");
                    return false;
                };
                if !owner.check_signature(&value.to_sign(), &value.signature) {
                    warn!(key = %key, value_id = value.id, "store rejected: signature verification failed");
                    return false;
                }
            }
            inner_store(key, value, from, addr)
        },
    );

    let inner_edit = spec.edit_policy.clone();
    let edit_policy = Arc::new(
        move |key: &crate::InfoHash,
              old: &crate::Value,
              new: &crate::Value,
              from: &crate::InfoHash,
              addr: Option<std::net::SocketAddr>| {
            if !old.is_signed() || old.is_encrypted() {
                return inner_edit(key, old, new, from, addr);
            }
            let Some(owner) = &old.owner else {
                return false;
            };
            if new.owner.as_ref() != Some(owner) {
                warn!(key = %key, value_id = old.id, "edit rejected: owner changed");
                return false;
            }
            if !owner.check_signature(&new.to_sign(), &new.signature) {
                warn!(key = %key, value_id = old.id, "edit rejected: signature verification failed");
                return false;
            }
            if new.seq == old.seq {
                // Identical data can be re-announced, possibly by someone
                // else; anything changed needs a higher sequence number.
                if old.to_sign() != new.to_sign() {
                    warn!(key = %key, value_id = old.id, "edit rejected: sequence number must increase");
                    return false;
                }
            } else if new.seq < old.seq {
                warn!(
                    key = %key,
                    value_id = old.id,
                    old_seq = old.seq,
                    new_seq = new.seq,
                    "edit rejected: stale sequence number"
                );
                return false;
            }
            inner_edit(key, old, new, from, addr)
        },
    );

    TypeSpec { store_policy, edit_policy, ..spec }
}
