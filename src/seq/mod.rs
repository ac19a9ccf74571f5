//! Lazy-sequence runtime: tail-chaining producers and the memoized cache.
//!
//! [`chain`] flattens corecursive producer chains into one driving loop;
//! [`memo`] gives a producer shared, replayable, lock-protected backing
//! storage with independent per-cursor read positions. The two compose: a
//! memoized factory's source can itself be a [`chain::ChainIter`].

pub mod chain;
pub mod memo;
