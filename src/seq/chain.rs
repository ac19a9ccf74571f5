//! Tail-chaining for lazy sequence producers.
//!
//! A producer is a suspendable routine: each pull answers with a
//! [`SeqStep`]: an item, normal end, an explicit remaining-items tail, or
//! another not-yet-driven producer to *tail-chain* into. Naively driving a
//! self-chaining producer (`ones = 1, then ones again`) recursively would
//! grow the stack by one driver frame per item; [`ChainIter`] absorbs the
//! chained-into producer in place instead, so arbitrarily long chains run in
//! one flat loop.
//!
//! A thread-local drive-depth slot records that a loop is already active on
//! this thread. A [`SeqFactory`] called from inside an active drive hands
//! back a raw, not-yet-driven iterator for the outer loop to absorb rather
//! than a second driver.
//!
//! # Example
//!
//! ```
//! use rebound::{SeqFactory, SeqStep};
//!
//! let ones = SeqFactory::new("ones", |ones: &SeqFactory<(), i64>, ()| {
//!     let again = ones.clone();
//!     let mut emitted = false;
//!     Box::new(move || {
//!         if !emitted {
//!             emitted = true;
//!             SeqStep::Yield(1)
//!         } else {
//!             SeqStep::Chain(again.call(()))
//!         }
//!     })
//! });
//!
//! let first: Vec<i64> = ones.call(()).take(5).collect();
//! assert_eq!(first, vec![1, 1, 1, 1, 1]);
//! ```

use std::cell::Cell;
use std::sync::Arc;

use tracing::trace;

thread_local! {
    /// Nesting depth of active driving loops on this thread.
    static DRIVE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while a [`ChainIter`] loop is pulling on the current thread.
pub(crate) fn drive_active() -> bool {
    DRIVE_DEPTH.with(|depth| depth.get() > 0)
}

/// Restores the depth slot even when a producer panics mid-pull.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DRIVE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DRIVE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// A suspendable producer: each call answers with the next step.
pub type BoxProducer<T> = Box<dyn FnMut() -> SeqStep<T> + Send>;

/// One pull's worth of answer from a producer.
pub enum SeqStep<T> {
    /// The next item.
    Yield(T),
    /// The sequence is finished with no remaining items.
    Done,
    /// The sequence is finished; these are the remaining items.
    Rest(Box<dyn Iterator<Item = T> + Send>),
    /// Tail-chain into this not-yet-driven producer instance. The driving
    /// loop absorbs it in place; no second loop is started.
    Chain(ChainIter<T>),
}

/// A sequence-producer factory wrapped for tail-chaining. Cheap to clone;
/// clones share the underlying maker, so a producer can hold a handle to its
/// own factory and chain back into itself.
pub struct SeqFactory<A, T> {
    inner: Arc<FactoryInner<A, T>>,
}

struct FactoryInner<A, T> {
    name: String,
    #[allow(clippy::type_complexity)]
    make: Box<dyn Fn(&SeqFactory<A, T>, A) -> BoxProducer<T> + Send + Sync>,
}

impl<A, T> Clone for SeqFactory<A, T> {
    fn clone(&self) -> Self {
        SeqFactory {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> SeqFactory<A, T> {
    /// Wrap a producer maker. The maker receives a handle to the factory so
    /// the producer can tail-chain into another instance of itself; makers
    /// that never self-chain simply ignore it.
    pub fn new(
        name: impl Into<String>,
        make: impl Fn(&SeqFactory<A, T>, A) -> BoxProducer<T> + Send + Sync + 'static,
    ) -> Self {
        SeqFactory {
            inner: Arc::new(FactoryInner {
                name: name.into(),
                make: Box::new(make),
            }),
        }
    }

    /// The factory's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Instantiate a producer and return the (lazy) driving iterator.
    ///
    /// When called from inside an already-running drive on this thread, the
    /// returned iterator is raw and not yet driven; handing it back through
    /// [`SeqStep::Chain`] lets the outer loop absorb it instead of nesting.
    pub fn call(&self, args: A) -> ChainIter<T> {
        let producer = (self.inner.make)(self, args);
        if drive_active() {
            trace!(factory = %self.inner.name, "re-entered from active drive; returning raw producer");
        }
        ChainIter {
            state: DriveState::Producer(producer),
            driven: false,
        }
    }
}

/// Current source of the driving loop.
enum DriveState<T> {
    /// Pulling steps from a live producer.
    Producer(BoxProducer<T>),
    /// Draining an explicit remaining-items tail.
    Rest(Box<dyn Iterator<Item = T> + Send>),
    /// Fully finished.
    Spent,
}

/// The flat driving loop over a producer chain. Yields every item of every
/// producer in the chain, in order, replacing the driven producer in place
/// whenever one finishes by tail-chaining.
pub struct ChainIter<T> {
    state: DriveState<T>,
    driven: bool,
}

impl<T> ChainIter<T> {
    /// Drive a standalone producer (no factory involved).
    pub fn from_producer(producer: BoxProducer<T>) -> Self {
        ChainIter {
            state: DriveState::Producer(producer),
            driven: false,
        }
    }

    /// True until the first pull. A raw iterator is safe to hand to an outer
    /// loop through [`SeqStep::Chain`].
    pub fn is_raw(&self) -> bool {
        !self.driven
    }
}

impl<T> Iterator for ChainIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.driven = true;
        let _active = DepthGuard::enter();
        loop {
            match &mut self.state {
                DriveState::Spent => return None,
                DriveState::Rest(tail) => match tail.next() {
                    Some(item) => return Some(item),
                    None => self.state = DriveState::Spent,
                },
                DriveState::Producer(producer) => match producer() {
                    SeqStep::Yield(item) => return Some(item),
                    SeqStep::Done => self.state = DriveState::Spent,
                    SeqStep::Rest(tail) => self.state = DriveState::Rest(tail),
                    SeqStep::Chain(inner) => {
                        // Absorb the chained-into producer; the inner
                        // iterator never runs its own loop.
                        trace!("absorbing tail-chained producer");
                        self.state = inner.state;
                    }
                },
            }
        }
    }
}
