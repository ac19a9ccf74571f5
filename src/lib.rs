//! Rebound - Recursion-Control Runtime
//!
//! A small set of cooperating primitives that let pure or semi-pure routines
//! recurse, corecurse, and self-reference without blowing the call stack,
//! without repeating identical subcomputations, and without looping forever
//! when recursion is accidentally (or intentionally) cyclic.
//!
//! # Architecture
//!
//! Leaf to root:
//!
//! 1. **Trampoline** ([`trampoline`]) - a routine signals a tail call by
//!    returning a [`Bounce::Call`] request; the driving loop performs the
//!    call itself, so chains of any length run in O(1) stack depth.
//! 2. **Sequence trampoline** ([`seq::chain`]) - a lazy producer may finish
//!    by tail-chaining into another producer instance; the chain is absorbed
//!    into one flat loop instead of nesting a driver per link.
//! 3. **Memoized sequence cache** ([`seq::memo`]) - many independent cursors
//!    share one computation of a (possibly infinite) sequence; each item is
//!    produced at most once, under a reentrant per-record lock so
//!    self-referential sequences can read their own prefix.
//! 4. **Cycle-breaking fixed point** ([`fixpoint`]) - a wrapped routine that
//!    revisits an already-seen call signature in one recursion tree is cut
//!    with a configured bottom value instead of diverging, with tail-chained
//!    hops checked exactly like direct calls.
//!
//! # Example
//!
//! ```
//! use rebound::{Bounce, Trampoline};
//!
//! let gcd = Trampoline::recursive("gcd", |this, (a, b): (u64, u64)| {
//!     if b == 0 {
//!         Bounce::Done(a)
//!     } else {
//!         this.tail_call((b, a % b))
//!     }
//! });
//! assert_eq!(gcd.call((252, 105)), 21);
//! ```
//!
//! # Concurrency
//!
//! No shared mutable state crosses unrelated calls: trampoline loop state is
//! per-call, the sequence drive flag and the fixpoint seen-set are
//! thread-local, and memoized records serialize on a per-record reentrant
//! lock. The same wrapped routine or memoized sequence is safe to use from
//! any number of threads.
//!
//! # Error handling
//!
//! The core defines no error kinds of its own. User panics propagate
//! unchanged; memoized producers yield `Result` items and the first failure
//! is cached and replayed; a detected cycle is not an error but a designed
//! first-class return value (the bottom).

pub mod fixpoint;
pub mod seq;
pub mod trampoline;

pub use fixpoint::{Bottom, FixPoint};
pub use seq::chain::{BoxProducer, ChainIter, SeqFactory, SeqStep};
pub use seq::memo::{MemoSeq, SeqCursor, SourceIter};
pub use trampoline::{Bounce, TailCall, TailTarget, Trampoline};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports_compose() {
        // Trampolined factorial feeding a memoized sequence of factorials.
        let fact = Trampoline::recursive("fact", |this, (n, acc): (u64, u64)| {
            if n <= 1 {
                Bounce::Done(acc)
            } else {
                this.tail_call((n - 1, acc * n))
            }
        });
        let facts: MemoSeq<(), u64> = {
            let fact = fact.clone();
            MemoSeq::infallible("facts", move |_, ()| {
                let fact = fact.clone();
                Box::new((1u64..).map(move |n| fact.call((n, 1))))
            })
        };
        let first: Vec<u64> = facts.call(()).items().take(5).collect();
        assert_eq!(first, vec![1, 2, 6, 24, 120]);
    }
}
