//! Cycle-breaking fixed points for pure recursive routines.
//!
//! A pure routine whose recursive call graph revisits an exact
//! previously-seen call (same target, same arguments) is certain to
//! diverge if allowed to continue: identical inputs reproduce identical
//! behavior indefinitely. [`FixPoint`] wraps a routine so that such repeats
//! are cut with a configured [`Bottom`] value instead of recursing forever.
//!
//! Cycle tracking covers one *recursion tree*: the outermost call on a
//! thread and everything it recurses into, whether by direct nested calls
//! or by tail-call chaining through the trampoline. Tail-chained hops never
//! "return" in the stack sense, so the repeat check also runs when the
//! driving loop is about to follow a tail-call request; a request whose
//! signature was already seen is claimed and replaced by the bottom value.
//!
//! The seen-set is thread-local: concurrent trees on different threads,
//! even with overlapping arguments, track cycles independently. The
//! outermost call tears the tree down on exit, whether by normal return, bottom
//! return, or panic.
//!
//! Purity is a precondition, documented and not enforced: the wrapper
//! cannot detect non-termination caused by side effects or
//! non-determinism.
//!
//! # Example
//!
//! ```
//! use rebound::{Bottom, Bounce, FixPoint};
//!
//! // f(k) = f((k + 1) % 3): every start loops after three hops.
//! let looping = FixPoint::recursive("looping", Bottom::value(-1), |this, k: u64| {
//!     this.tail_call((k + 1) % 3)
//! });
//! assert_eq!(looping.call(0), -1);
//! ```

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::trampoline::{self, Bounce, TailCall, TailTarget};

/// The designated "this recursion would not terminate" result.
pub enum Bottom<A, R> {
    /// A fixed sentinel value, cloned per cut.
    Value(R),
    /// A callback given the offending target's name and arguments.
    Compute(Arc<dyn Fn(&str, &A) -> R + Send + Sync>),
}

impl<A, R: Clone> Bottom<A, R> {
    /// Bottom as a fixed sentinel.
    pub fn value(sentinel: R) -> Self {
        Bottom::Value(sentinel)
    }

    /// Bottom computed from the offending target's name and arguments.
    pub fn compute(f: impl Fn(&str, &A) -> R + Send + Sync + 'static) -> Self {
        Bottom::Compute(Arc::new(f))
    }

    fn produce(&self, name: &str, args: &A) -> R {
        match self {
            Bottom::Value(sentinel) => sentinel.clone(),
            Bottom::Compute(f) => f(name, args),
        }
    }
}

/// Type-erased argument value with `Eq + Hash` semantics, so recursion trees
/// spanning wrappers of different argument types share one seen-set.
trait SigArgs: Any {
    fn eq_dyn(&self, other: &dyn SigArgs) -> bool;
    fn hash_dyn(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

impl<A: Eq + Hash + 'static> SigArgs for A {
    fn eq_dyn(&self, other: &dyn SigArgs) -> bool {
        match other.as_any().downcast_ref::<A>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn hash_dyn(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        TypeId::of::<A>().hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One call signature: target identity + canonicalized arguments.
struct Signature {
    target: usize,
    args: Box<dyn SigArgs>,
}

impl Signature {
    fn new<A: Eq + Hash + 'static>(target: usize, args: A) -> Self {
        Signature {
            target,
            args: Box::new(args),
        }
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.args.eq_dyn(&*other.args)
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.target);
        state.write_u64(self.args.hash_dyn());
    }
}

/// State of the recursion tree currently active on this thread.
#[derive(Default)]
struct TreeState {
    /// Signatures seen anywhere in the tree.
    seen: HashSet<Signature>,
    /// Number of cycle cuts so far; used to keep bottomed results out of
    /// the memo table.
    cuts: u64,
}

thread_local! {
    /// The active recursion tree, if any. Installed by the outermost call
    /// into a cycle-protected routine, torn down when it exits.
    static TREE: RefCell<Option<TreeState>> = const { RefCell::new(None) };
}

fn tree_contains(sig: &Signature) -> bool {
    TREE.with(|tree| {
        tree.borrow()
            .as_ref()
            .map(|state| state.seen.contains(sig))
            .unwrap_or(false)
    })
}

fn tree_insert(sig: Signature) {
    TREE.with(|tree| {
        if let Some(state) = tree.borrow_mut().as_mut() {
            state.seen.insert(sig);
        }
    });
}

fn tree_record_cut() {
    TREE.with(|tree| {
        if let Some(state) = tree.borrow_mut().as_mut() {
            state.cuts += 1;
        }
    });
}

fn tree_cuts() -> u64 {
    TREE.with(|tree| tree.borrow().as_ref().map(|state| state.cuts).unwrap_or(0))
}

#[cfg(test)]
pub(crate) fn tree_is_idle() -> bool {
    TREE.with(|tree| tree.borrow().is_none())
}

/// Per-call cleanup: the outermost call clears the whole tree; an inner call
/// retires exactly the signatures it added. Runs on drop, so teardown also
/// happens when the wrapped routine panics.
struct TreeGuard<A: Eq + Hash + 'static> {
    owner: bool,
    added: SmallVec<[(usize, A); 4]>,
}

impl<A: Eq + Hash + 'static> Drop for TreeGuard<A> {
    fn drop(&mut self) {
        if self.owner {
            trace!("recursion tree torn down");
            TREE.with(|tree| *tree.borrow_mut() = None);
        } else {
            TREE.with(|tree| {
                if let Some(state) = tree.borrow_mut().as_mut() {
                    for (target, args) in self.added.drain(..) {
                        state.seen.remove(&Signature::new(target, args));
                    }
                }
            });
        }
    }
}

struct FixCore<A, R> {
    name: String,
    f: Box<dyn Fn(A) -> Bounce<A, R> + Send + Sync>,
    bottom: Bottom<A, R>,
    /// Results of cycle-free calls, shared across threads and trees.
    memo: Option<DashMap<A, R>>,
}

impl<A, R> TailTarget<A, R> for FixCore<A, R>
where
    A: Clone + Eq + Hash + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    /// One raw step of the routine, through the memo table when enabled.
    /// The repeat check for this hop has already run in the driving loop.
    fn invoke(&self, args: A) -> Bounce<A, R> {
        if let Some(memo) = &self.memo {
            if let Some(hit) = memo.get(&args) {
                trace!(routine = %self.name, "memoized result served");
                return Bounce::Done(hit.clone());
            }
        }
        (self.f)(args)
    }
}

/// A routine wrapped for cycle detection. See the module docs for the
/// contract; all configuration is fixed at construction.
pub struct FixPoint<A, R> {
    core: Arc<FixCore<A, R>>,
}

impl<A, R> Clone for FixPoint<A, R> {
    fn clone(&self) -> Self {
        FixPoint {
            core: Arc::clone(&self.core),
        }
    }
}

impl<A, R> FixPoint<A, R>
where
    A: Clone + Eq + Hash + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Wrap `f` with cycle breaking and result memoization.
    pub fn new(
        name: impl Into<String>,
        bottom: Bottom<A, R>,
        f: impl Fn(A) -> Bounce<A, R> + Send + Sync + 'static,
    ) -> Self {
        Self::build(name, bottom, f, true)
    }

    /// Wrap `f` with cycle breaking only; every fresh call re-runs `f`.
    pub fn without_memo(
        name: impl Into<String>,
        bottom: Bottom<A, R>,
        f: impl Fn(A) -> Bounce<A, R> + Send + Sync + 'static,
    ) -> Self {
        Self::build(name, bottom, f, false)
    }

    /// Wrap a self-recursive routine; the closure receives a handle to the
    /// wrapper so it can tail-call back into itself.
    ///
    /// The self-handle held by the closure is weak: dropping the last outside
    /// handle frees the wrapper, its memo table, and the captures.
    pub fn recursive(
        name: impl Into<String>,
        bottom: Bottom<A, R>,
        f: impl Fn(&FixPoint<A, R>, A) -> Bounce<A, R> + Send + Sync + 'static,
    ) -> Self {
        let slot: Arc<std::sync::OnceLock<Weak<FixCore<A, R>>>> =
            Arc::new(std::sync::OnceLock::new());
        let inner = Arc::clone(&slot);
        let wrapper = Self::new(name, bottom, move |args| {
            // The slot is filled before the wrapper can be called, and a
            // strong handle is invoking us, so the upgrade succeeds.
            match inner.get().and_then(Weak::upgrade) {
                Some(core) => f(&FixPoint { core }, args),
                None => unreachable!("fixpoint invoked before construction finished"),
            }
        });
        let _ = slot.set(Arc::downgrade(&wrapper.core));
        wrapper
    }

    fn build(
        name: impl Into<String>,
        bottom: Bottom<A, R>,
        f: impl Fn(A) -> Bounce<A, R> + Send + Sync + 'static,
        memoize: bool,
    ) -> Self {
        FixPoint {
            core: Arc::new(FixCore {
                name: name.into(),
                f: Box::new(f),
                bottom,
                memo: memoize.then(DashMap::new),
            }),
        }
    }

    /// The routine's name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Identity used in call signatures; matches [`TailCall::target_id`] of
    /// tail calls aimed at this wrapper.
    fn id(&self) -> usize {
        Arc::as_ptr(&self.core) as *const () as usize
    }

    /// Hand out the wrapper as a tail-call target for mutually recursive
    /// routines. Targets obtained here are checked by whichever guarded
    /// call drives the chain.
    pub fn target(&self) -> Arc<dyn TailTarget<A, R>> {
        Arc::clone(&self.core) as Arc<dyn TailTarget<A, R>>
    }

    /// Build a tail-call step aimed back at this wrapper.
    pub fn tail_call(&self, args: A) -> Bounce<A, R> {
        Bounce::Call(TailCall::new(self.target(), args))
    }

    /// Invoke the wrapped routine with cycle protection.
    ///
    /// A repeated signature, seen earlier in this thread's recursion tree
    /// whether entered directly or about to be tail-chained into, produces
    /// the bottom value for the offending target's name and arguments
    /// without invoking the routine. Tail-chained hops add no stack frames;
    /// a direct (non-tail) recursive call into this method still costs one
    /// native frame per nesting level.
    pub fn call(&self, args: A) -> R {
        let owner = TREE.with(|tree| {
            let mut tree = tree.borrow_mut();
            if tree.is_none() {
                debug!(routine = %self.core.name, "recursion tree installed");
                *tree = Some(TreeState::default());
                true
            } else {
                false
            }
        });
        let mut guard = TreeGuard::<A> {
            owner,
            added: SmallVec::new(),
        };

        let entry_sig = Signature::new(self.id(), args.clone());
        if tree_contains(&entry_sig) {
            debug!(routine = %self.core.name, "cycle detected on direct entry");
            tree_record_cut();
            return self.core.bottom.produce(&self.core.name, &args);
        }
        guard.added.push((self.id(), args.clone()));
        tree_insert(entry_sig);

        let cuts_before = tree_cuts();
        let entry_args = args.clone();
        let first = self.core.invoke(args);

        let added = &mut guard.added;
        let bottom = &self.core.bottom;
        let result = trampoline::drive(first, |call: &mut TailCall<A, R>| {
            let hop_sig = Signature::new(call.target_id(), call.args().clone());
            if tree_contains(&hop_sig) {
                debug!(
                    target_name = call.target_name(),
                    "cycle detected on tail-call hop"
                );
                tree_record_cut();
                let substitute = bottom.produce(call.target_name(), call.args());
                call.claim(substitute);
            } else {
                added.push((call.target_id(), call.args().clone()));
                tree_insert(hop_sig);
            }
        });

        // Memoize only results whose subtree saw no cuts: a value computed
        // past a cycle cut embeds a position-dependent bottom.
        if tree_cuts() == cuts_before {
            if let Some(memo) = &self.core.memo {
                memo.insert(entry_args, result.clone());
            }
        }
        result
    }

    /// Number of memoized results, zero when memoization is disabled.
    pub fn memoized(&self) -> usize {
        self.core.memo.as_ref().map(DashMap::len).unwrap_or(0)
    }
}
