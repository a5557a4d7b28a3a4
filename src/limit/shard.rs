//! Power-of-two-choices shard selection.
//!
//! Splitting a hot limit record into shards bounds write contention: a
//! consume touches at most two of the N records, and only collisions on the
//! same shard force a transaction retry. Selection is a pure function over
//! an explicit random source so tests can seed it.

use rand::Rng;

/// Draw two candidate shard indices, independently and uniformly, with
/// replacement. For an unsharded limit both candidates are shard 0.
pub fn pick_candidates<R: Rng>(rng: &mut R, shard_count: u32) -> (u32, u32) {
    if shard_count <= 1 {
        return (0, 0);
    }
    (rng.gen_range(0..shard_count), rng.gen_range(0..shard_count))
}
