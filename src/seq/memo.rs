//! Shared, replayable backing storage for lazy sequence producers.
//!
//! [`MemoSeq`] wraps a sequence-producer factory. Each call with the same
//! (canonicalized) arguments returns a fresh [`SeqCursor`] over one shared
//! [`SeqRecord`]: an append-only buffer plus the live source iterator,
//! guarded by a reentrant lock. Every item is produced at most once, in
//! position order, no matter how many cursors on however many threads
//! race to read it; cursors advance independently.
//!
//! The lock is reentrant so that a *self-referential* sequence (its producer
//! reads earlier positions of its own record through recursive cursors, as
//! in the classic corecursive Fibonacci) can pull while the record is
//! already locked on the same thread. Buffer entries are never mutated once
//! written.
//!
//! # Design
//!
//! - Registry: `DashMap<args, Arc<SeqRecord>>`: lock-free lookup, one
//!   record per unique argument value.
//! - Record: `ReentrantMutex<RefCell<state>>`; the source iterator is
//!   checked out of the cell before pulling so recursive reads never hit an
//!   active borrow.
//! - Errors: producers yield `Result<T, E>`; the first `Err` becomes the
//!   record's cached terminal outcome and replays (cloned) to every cursor
//!   reaching that position. A finished source replays as exhaustion.

use std::cell::RefCell;
use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use tracing::{debug, trace};

/// The underlying producer: a fallible, possibly infinite item source.
pub type SourceIter<T, E> = Box<dyn Iterator<Item = Result<T, E>> + Send>;

/// A sequence-producer factory wrapped for memoization. Cheap to clone;
/// clones share the registry, so a producer can hold a handle to its own
/// factory and read the sequence it is producing.
pub struct MemoSeq<A, T, E = Infallible> {
    inner: Arc<MemoInner<A, T, E>>,
}

struct MemoInner<A, T, E> {
    name: String,
    #[allow(clippy::type_complexity)]
    make: Box<dyn Fn(&MemoSeq<A, T, E>, A) -> SourceIter<T, E> + Send + Sync>,
    records: DashMap<A, Arc<SeqRecord<T, E>>>,
}

impl<A, T, E> Clone for MemoSeq<A, T, E> {
    fn clone(&self) -> Self {
        MemoSeq {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> MemoSeq<A, T, E>
where
    A: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Wrap a source maker. The maker receives a handle to the factory so a
    /// self-referential sequence can open cursors into its own record.
    pub fn new(
        name: impl Into<String>,
        make: impl Fn(&MemoSeq<A, T, E>, A) -> SourceIter<T, E> + Send + Sync + 'static,
    ) -> Self {
        MemoSeq {
            inner: Arc::new(MemoInner {
                name: name.into(),
                make: Box::new(make),
                records: DashMap::new(),
            }),
        }
    }

    /// The factory's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Return a fresh cursor over the record for `args`, creating the record
    /// on first use. The underlying producer is not started here: the maker
    /// runs at the first pull, outside the registry lock, so a
    /// self-referential maker can safely call back into the factory.
    pub fn call(&self, args: A) -> SeqCursor<T, E> {
        let record = self
            .inner
            .records
            .entry(args.clone())
            .or_insert_with(|| {
                debug!(factory = %self.inner.name, "creating memoized sequence record");
                let factory = self.clone();
                let init = Box::new(move || (factory.inner.make)(&factory, args));
                Arc::new(SeqRecord::new(self.inner.name.clone(), init))
            })
            .clone();
        SeqCursor {
            record,
            pos: 0,
            spent: false,
        }
    }

    /// Number of distinct argument values with live records.
    pub fn records(&self) -> usize {
        self.inner.records.len()
    }
}

impl<A, T> MemoSeq<A, T, Infallible>
where
    A: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    /// Wrap a maker over plain (infallible) item iterators.
    pub fn infallible(
        name: impl Into<String>,
        make: impl Fn(&MemoSeq<A, T, Infallible>, A) -> Box<dyn Iterator<Item = T> + Send>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        MemoSeq::new(name, move |factory, args| {
            Box::new(make(factory, args).map(Ok))
        })
    }
}

/// Terminal outcome of a record's source, cached once reached.
enum Terminal<E> {
    /// The source finished normally.
    End,
    /// The source failed; the error replays at this position.
    Failed(E),
}

/// Deferred producer construction; runs at the first pull.
type SourceInit<T, E> = Box<dyn FnOnce() -> SourceIter<T, E> + Send>;

/// Where the record's source currently is.
enum Source<T, E> {
    /// Not yet started; the maker runs on the first pull.
    Unstarted(SourceInit<T, E>),
    /// Live and available for the next pull.
    Live(SourceIter<T, E>),
    /// Checked out by an in-flight pull on some thread.
    InFlight,
    /// Finished or failed; see the terminal outcome.
    Finished,
}

/// A source taken out of the cell for this pull.
enum Checkout<T, E> {
    /// First pull: run the deferred maker, then pull.
    Start(SourceInit<T, E>),
    /// Pull the live source.
    Pull(SourceIter<T, E>),
}

struct RecordState<T, E> {
    source: Source<T, E>,
    buffer: Vec<T>,
    terminal: Option<Terminal<E>>,
}

/// One memoized sequence: append-only buffer + live source, shared by every
/// cursor obtained for the same arguments.
pub struct SeqRecord<T, E> {
    label: String,
    state: ReentrantMutex<RefCell<RecordState<T, E>>>,
}

impl<T, E> SeqRecord<T, E>
where
    T: Clone,
    E: Clone,
{
    fn new(label: String, init: SourceInit<T, E>) -> Self {
        SeqRecord {
            label,
            state: ReentrantMutex::new(RefCell::new(RecordState {
                source: Source::Unstarted(init),
                buffer: Vec::new(),
                terminal: None,
            })),
        }
    }

    /// Number of items buffered so far.
    pub(crate) fn buffered(&self) -> usize {
        let guard = self.state.lock();
        let len = guard.borrow().buffer.len();
        len
    }

    /// The item at `pos`, producing forward as needed. `None` past a normal
    /// end; a cached error for every position at or past a failure.
    fn next_at(&self, pos: usize) -> Option<Result<T, E>> {
        let guard = self.state.lock();
        loop {
            // Short borrow: serve from the buffer or the cached outcome.
            {
                let state = guard.borrow();
                if pos < state.buffer.len() {
                    trace!(record = %self.label, pos, "replaying buffered item");
                    return Some(Ok(state.buffer[pos].clone()));
                }
                match &state.terminal {
                    Some(Terminal::End) => return None,
                    Some(Terminal::Failed(error)) => {
                        trace!(record = %self.label, pos, "replaying cached failure");
                        return Some(Err(error.clone()));
                    }
                    None => {}
                }
            }

            // Check the source out of the cell before pulling: the pull (or
            // the deferred maker) may recursively read this record, which
            // re-acquires the (reentrant) lock and must find the cell
            // unborrowed.
            let checkout = {
                let mut state = guard.borrow_mut();
                match std::mem::replace(&mut state.source, Source::InFlight) {
                    Source::Unstarted(init) => Checkout::Start(init),
                    Source::Live(source) => Checkout::Pull(source),
                    Source::InFlight => panic!(
                        "memoized sequence '{}' reads its own in-flight position {}",
                        self.label, pos
                    ),
                    // A concurrent pull finished the source between our
                    // borrows; loop around and read the cached outcome.
                    Source::Finished => continue,
                }
            };
            let mut source = match checkout {
                Checkout::Start(init) => {
                    trace!(record = %self.label, "starting underlying producer");
                    init()
                }
                Checkout::Pull(source) => source,
            };

            let produced = source.next();

            let mut state = guard.borrow_mut();
            match produced {
                Some(Ok(item)) => {
                    state.buffer.push(item);
                    state.source = Source::Live(source);
                }
                Some(Err(error)) => {
                    debug!(record = %self.label, pos = state.buffer.len(), "caching producer failure");
                    state.terminal = Some(Terminal::Failed(error));
                    state.source = Source::Finished;
                }
                None => {
                    trace!(record = %self.label, len = state.buffer.len(), "source exhausted");
                    state.terminal = Some(Terminal::End);
                    state.source = Source::Finished;
                }
            }
            // Loop: pos may now be buffered, or covered by the outcome.
        }
    }
}

/// An independent read position over a shared [`SeqRecord`]. Advancing one
/// cursor never affects another; all cursors replay identical items.
pub struct SeqCursor<T, E = Infallible> {
    record: Arc<SeqRecord<T, E>>,
    pos: usize,
    spent: bool,
}

impl<T, E> SeqCursor<T, E>
where
    T: Clone,
    E: Clone,
{
    /// The cursor's current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of items buffered so far in the shared record.
    pub fn buffered(&self) -> usize {
        self.record.buffered()
    }
}

impl<T, E> Iterator for SeqCursor<T, E>
where
    T: Clone,
    E: Clone,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Result<T, E>> {
        if self.spent {
            return None;
        }
        match self.record.next_at(self.pos) {
            Some(Ok(item)) => {
                self.pos += 1;
                Some(Ok(item))
            }
            Some(Err(error)) => {
                // Yield the cached failure once, then fuse. A new cursor
                // reaching this position replays the same error.
                self.pos += 1;
                self.spent = true;
                Some(Err(error))
            }
            None => {
                self.spent = true;
                None
            }
        }
    }
}

impl<T> SeqCursor<T, Infallible>
where
    T: Clone,
{
    /// Consume the cursor as a plain item iterator.
    pub fn items(self) -> impl Iterator<Item = T> {
        self.map(|result| match result {
            Ok(item) => item,
            Err(never) => match never {},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Factory whose producer counts every item it actually computes.
    fn counting_naturals(counter: Arc<AtomicUsize>) -> MemoSeq<u64, u64> {
        MemoSeq::infallible("naturals", move |_, start| {
            let counter = Arc::clone(&counter);
            Box::new((start..).map(move |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                n
            }))
        })
    }

    #[test]
    fn test_cursors_share_one_computation() {
        let produced = Arc::new(AtomicUsize::new(0));
        let naturals = counting_naturals(Arc::clone(&produced));

        let first: Vec<u64> = naturals.call(5).items().take(4).collect();
        let second: Vec<u64> = naturals.call(5).items().take(4).collect();

        assert_eq!(first, vec![5, 6, 7, 8]);
        assert_eq!(first, second);
        // Each index computed exactly once despite two full reads.
        assert_eq!(produced.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_distinct_args_get_distinct_records() {
        let produced = Arc::new(AtomicUsize::new(0));
        let naturals = counting_naturals(Arc::clone(&produced));

        let from_zero: Vec<u64> = naturals.call(0).items().take(3).collect();
        let from_ten: Vec<u64> = naturals.call(10).items().take(3).collect();

        assert_eq!(from_zero, vec![0, 1, 2]);
        assert_eq!(from_ten, vec![10, 11, 12]);
        assert_eq!(naturals.records(), 2);
        assert_eq!(produced.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_cursor_positions_are_independent() {
        let naturals = counting_naturals(Arc::new(AtomicUsize::new(0)));
        let mut ahead = naturals.call(0);
        let mut behind = naturals.call(0);

        assert_eq!(ahead.next(), Some(Ok(0)));
        assert_eq!(ahead.next(), Some(Ok(1)));
        assert_eq!(ahead.next(), Some(Ok(2)));
        // `behind` still starts from the beginning.
        assert_eq!(behind.next(), Some(Ok(0)));
        assert_eq!(behind.position(), 1);
        assert_eq!(ahead.position(), 3);
        // Both cursors see the same shared buffer.
        assert_eq!(behind.buffered(), 3);
        assert_eq!(ahead.buffered(), 3);
    }

    #[test]
    fn test_finite_source_end_is_cached() {
        let finite: MemoSeq<(), u64> =
            MemoSeq::infallible("finite", |_, ()| Box::new(vec![1, 2, 3].into_iter()));

        let all: Vec<u64> = finite.call(()).items().collect();
        assert_eq!(all, vec![1, 2, 3]);
        // Replays from the buffer, including the cached end.
        let again: Vec<u64> = finite.call(()).items().collect();
        assert_eq!(again, vec![1, 2, 3]);
    }

    #[test]
    fn test_failure_is_cached_and_replayed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let flaky: MemoSeq<(), u64, String> = {
            let attempts = Arc::clone(&attempts);
            MemoSeq::new("flaky", move |_, ()| {
                let attempts = Arc::clone(&attempts);
                Box::new((0u64..).map(move |n| {
                    if n == 2 {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("item 2 unavailable".to_string())
                    } else {
                        Ok(n)
                    }
                }))
            })
        };

        let first: Vec<Result<u64, String>> = flaky.call(()).collect();
        assert_eq!(
            first,
            vec![Ok(0), Ok(1), Err("item 2 unavailable".to_string())]
        );

        // A fresh cursor replays the cached outcome; the producer is not
        // consulted again.
        let second: Vec<Result<u64, String>> = flaky.call(()).collect();
        assert_eq!(first, second);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_referential_fibonacci() {
        let fib: MemoSeq<(), u64> = MemoSeq::infallible("fib", |fib, ()| {
            let head = vec![1u64, 1].into_iter();
            let pairs = fib
                .call(())
                .items()
                .zip(fib.call(()).items().skip(1))
                .map(|(a, b)| a + b);
            Box::new(head.chain(pairs))
        });

        let first_ten: Vec<u64> = fib.call(()).items().take(10).collect();
        assert_eq!(first_ten, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 55]);
        // Only one record exists despite the recursive self-reads.
        assert_eq!(fib.records(), 1);
    }

    #[test]
    #[should_panic(expected = "in-flight position")]
    fn test_reading_own_inflight_position_panics() {
        // Item 0 depends on itself: an unresolvable self-reference.
        let degenerate: MemoSeq<(), u64> = MemoSeq::infallible("degenerate", |this, ()| {
            let this = this.clone();
            Box::new(std::iter::from_fn(move || {
                this.call(()).items().next().map(|n| n + 1)
            }))
        });
        let _ = degenerate.call(()).items().next();
    }

    #[test]
    fn test_concurrent_readers_produce_each_item_once() {
        let produced = Arc::new(AtomicUsize::new(0));
        let naturals = counting_naturals(Arc::clone(&produced));
        // Materialize the record before spawning so all threads share it.
        let _ = naturals.call(0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let naturals = naturals.clone();
            handles.push(std::thread::spawn(move || {
                naturals.call(0).items().take(100).collect::<Vec<u64>>()
            }));
        }
        let expected: Vec<u64> = (0..100).collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
        assert_eq!(produced.load(Ordering::SeqCst), 100);
    }
}
