//! Trampolined tail calls.
//!
//! A routine that wants tail-position redirection returns a [`Bounce`]: either
//! a final value, or a [`TailCall`] describing the next call. The driving loop
//! performs the described call itself instead of letting the routine recurse,
//! so a chain of N tail calls runs in O(1) stack depth.
//!
//! # Design
//!
//! - "Return value says what to do next": `Bounce` is a plain tagged enum, so
//!   the loop is a single `match` per hop with no dynamic probing.
//! - Tail calls name their target through the [`TailTarget`] trait, which lets
//!   independent wrapped routines refer to each other (mutual recursion).
//! - A request carries a `claimed` flag. An outer mechanism (the cycle breaker
//!   in [`crate::fixpoint`]) may claim a request and supply its final value;
//!   the loop then passes the resolution through without performing the call.
//!
//! # Example
//!
//! ```
//! use rebound::{Bounce, Trampoline};
//!
//! let countdown = Trampoline::recursive("countdown", |this, n: u64| {
//!     if n == 0 {
//!         Bounce::Done("done")
//!     } else {
//!         this.tail_call(n - 1)
//!     }
//! });
//!
//! assert_eq!(countdown.call(1_000_000), "done");
//! ```

use std::sync::{Arc, Weak};

use tracing::trace;

/// What a trampolined routine hands back per step: a final value, or a
/// description of the tail call to perform next.
pub enum Bounce<A, R> {
    /// The chain is finished; this is the result.
    Done(R),
    /// Perform this call instead of returning a value directly.
    Call(TailCall<A, R>),
}

impl<A, R> Bounce<A, R> {
    /// Build a tail-call step targeting `target` with `args`.
    pub fn call_to(target: &Arc<dyn TailTarget<A, R>>, args: A) -> Self {
        Bounce::Call(TailCall::new(Arc::clone(target), args))
    }
}

/// A named callable that can stand in tail position.
///
/// Implemented by [`Trampoline`] and by [`crate::fixpoint::FixPoint`] cores,
/// so either kind of wrapped routine can be the next hop of a chain.
pub trait TailTarget<A, R>: Send + Sync {
    /// The routine's name, used for tracing and for bottom-value callbacks.
    fn name(&self) -> &str;

    /// Run one step of the routine.
    fn invoke(&self, args: A) -> Bounce<A, R>;
}

/// Resolution state of a tail-call request.
enum Claim<R> {
    /// Nothing has acted on the request yet.
    Open,
    /// An outer mechanism already handled the request; this is its value.
    Resolved(R),
}

/// An immutable-by-convention description of "call `target` with `args`
/// instead of returning". Created fresh per tail call and consumed by
/// whichever loop acts on it.
pub struct TailCall<A, R> {
    target: Arc<dyn TailTarget<A, R>>,
    args: A,
    claim: Claim<R>,
}

impl<A, R> TailCall<A, R> {
    /// Create a new, unclaimed request.
    pub fn new(target: Arc<dyn TailTarget<A, R>>, args: A) -> Self {
        TailCall {
            target,
            args,
            claim: Claim::Open,
        }
    }

    /// The pending arguments.
    pub fn args(&self) -> &A {
        &self.args
    }

    /// The target routine's name.
    pub fn target_name(&self) -> &str {
        self.target.name()
    }

    /// Identity of the target, stable for the life of the wrapped routine.
    /// Two requests aimed at the same wrapper report the same id.
    pub fn target_id(&self) -> usize {
        Arc::as_ptr(&self.target) as *const () as usize
    }

    /// Mark the request as fully handled, supplying the value the chain
    /// should finish with. The driving loop will not perform the call.
    pub fn claim(&mut self, resolution: R) {
        self.claim = Claim::Resolved(resolution);
    }

    /// Whether an outer mechanism has already handled this request.
    pub fn is_claimed(&self) -> bool {
        matches!(self.claim, Claim::Resolved(_))
    }

    /// Consume the request: a claimed request yields its resolution, an open
    /// one performs the described call.
    pub(crate) fn step(self) -> Bounce<A, R> {
        match self.claim {
            Claim::Resolved(value) => {
                trace!(target_name = self.target.name(), "claimed tail call passed through");
                Bounce::Done(value)
            }
            Claim::Open => self.target.invoke(self.args),
        }
    }
}

/// The one driving loop. Each `Call` step is offered to `intercept` before
/// being followed; an interceptor that claims the request ends the chain with
/// the claimed value. Panics from any hop propagate to the caller unchanged.
pub(crate) fn drive<A, R>(
    first: Bounce<A, R>,
    mut intercept: impl FnMut(&mut TailCall<A, R>),
) -> R {
    let mut bounce = first;
    let mut hops: u64 = 0;
    loop {
        match bounce {
            Bounce::Done(value) => {
                trace!(hops, "tail-call chain finished");
                return value;
            }
            Bounce::Call(mut call) => {
                if !call.is_claimed() {
                    intercept(&mut call);
                }
                hops += 1;
                bounce = call.step();
            }
        }
    }
}

/// Target wrapping a plain closure.
struct FnTarget<A, R> {
    name: String,
    f: Box<dyn Fn(A) -> Bounce<A, R> + Send + Sync>,
}

impl<A, R> TailTarget<A, R> for FnTarget<A, R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, args: A) -> Bounce<A, R> {
        (self.f)(args)
    }
}

/// A routine wrapped for tail-call redirection. Calling it behaves like the
/// underlying routine, except that returned [`TailCall`]s are followed in a
/// loop rather than on the stack.
///
/// Holds no state beyond the wrapped closure; every invocation is independent.
pub struct Trampoline<A, R> {
    target: Arc<dyn TailTarget<A, R>>,
}

impl<A, R> Clone for Trampoline<A, R> {
    fn clone(&self) -> Self {
        Trampoline {
            target: Arc::clone(&self.target),
        }
    }
}

impl<A: 'static, R: 'static> Trampoline<A, R> {
    /// Wrap `f`. The routine signals a tail call by returning
    /// [`Bounce::Call`] instead of a value.
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(A) -> Bounce<A, R> + Send + Sync + 'static,
    ) -> Self {
        Trampoline {
            target: Arc::new(FnTarget {
                name: name.into(),
                f: Box::new(f),
            }),
        }
    }

    /// Wrap a self-recursive routine. The closure receives a handle to the
    /// wrapper itself so it can tail-call back without external plumbing.
    ///
    /// The self-handle held by the closure is weak: dropping the last outside
    /// handle frees the wrapper and everything the closure captured.
    pub fn recursive(
        name: impl Into<String>,
        f: impl Fn(&Trampoline<A, R>, A) -> Bounce<A, R> + Send + Sync + 'static,
    ) -> Self {
        let slot: Arc<std::sync::OnceLock<Weak<dyn TailTarget<A, R>>>> =
            Arc::new(std::sync::OnceLock::new());
        let inner = Arc::clone(&slot);
        let wrapper = Trampoline::new(name, move |args| {
            // The slot is filled before the wrapper can be called, and a
            // strong handle is invoking us, so the upgrade succeeds.
            match inner.get().and_then(Weak::upgrade) {
                Some(target) => f(&Trampoline { target }, args),
                None => unreachable!("trampoline invoked before construction finished"),
            }
        });
        let _ = slot.set(Arc::downgrade(&wrapper.target));
        wrapper
    }

    /// Invoke the wrapped routine, following tail calls iteratively until a
    /// final value is produced.
    pub fn call(&self, args: A) -> R {
        drive(self.target.invoke(args), |_call| {})
    }

    /// Hand out the wrapper as a tail-call target, for routines that name
    /// each other in tail position.
    pub fn target(&self) -> Arc<dyn TailTarget<A, R>> {
        Arc::clone(&self.target)
    }

    /// Build a tail-call step aimed back at this wrapper.
    pub fn tail_call(&self, args: A) -> Bounce<A, R> {
        Bounce::Call(TailCall::new(Arc::clone(&self.target), args))
    }
}
