//! Zero-sized hash builder for identity-keyed internal maps.
//!
//! Holder keys and subscriber keys are pointer addresses, so HashDoS
//! resistance buys nothing here. `FastHashBuilder` hashes them with
//! foldhash under a fixed seed.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` backed by foldhash with a fixed seed.
///
/// Used by the instrumented-holder side table and by every subscriber set,
/// both of which are keyed by pointer addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x2d35_8dcc_aa6c_78a5).build_hasher()
    }
}
