//! Rendezvous (highest-random-weight) member selection.
//!
//! Every member scores each key; the highest score owns it. Adding a member
//! only moves the keys that member now wins, about `1/n` of them, and
//! removing one only moves the keys it owned.

use sha2::{Digest, Sha256};

use super::Member;

/// Score of `member` for `key`: the first 8 bytes of
/// `sha256(member || 0x00 || key)`, big endian.
pub fn score(member: &str, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(member.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Picks the owner of `key` among `members`. Ties break on the address so
/// the result does not depend on slice order.
pub fn select<'a>(members: &'a [Member], key: &str) -> Option<&'a Member> {
    members
        .iter()
        .map(|m| (score(m.as_str(), key), m))
        .max_by(|(sa, ma), (sb, mb)| sa.cmp(sb).then_with(|| mb.as_str().cmp(ma.as_str())))
        .map(|(_, m)| m)
}
