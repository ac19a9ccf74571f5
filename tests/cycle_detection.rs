//! Cycle detection: direct recursion, loops entered from outside, mutual
//! tail-chained recursion, custom bottoms, cleanup, and thread isolation.

mod common;

use std::sync::Arc;

use rebound::{Bottom, Bounce, FixPoint};

#[test]
fn test_direct_cycle_cut_with_custom_sentinel() {
    common::init_tracing();
    // Not the default-looking zero: a custom sentinel must come through.
    let looping = FixPoint::recursive("looping", Bottom::value(-1234i64), |this, k: u64| {
        this.tail_call((k + 1) % 3)
    });
    assert_eq!(looping.call(0), -1234);
    assert_eq!(looping.call(2), -1234);
}

#[test]
fn test_cycle_entered_from_outside_the_loop() {
    // g(0) -> g(1) -> g(2) -> g(1) -> ...: entered at 0, the repeat is g(1).
    let g = FixPoint::recursive("g", Bottom::value(i64::MIN), |this, k: u32| {
        this.tail_call(if k == 2 { 1 } else { k + 1 })
    });
    assert_eq!(g.call(0), i64::MIN);
}

#[test]
fn test_bottom_callback_reports_name_and_args() {
    let spin = FixPoint::recursive(
        "spin",
        Bottom::compute(|name, k: &u64| format!("cut {name}({k})")),
        |this, k: u64| this.tail_call((k + 1) % 4),
    );
    // 0 -> 1 -> 2 -> 3 -> 0: the repeat is the entry argument.
    assert_eq!(spin.call(0), "cut spin(0)");
    assert_eq!(spin.call(3), "cut spin(3)");
}

#[test]
fn test_mutual_cycle_via_tail_chaining() {
    // a(k) tail-calls b((k+1) % 3), b(k) tail-calls a((k+1) % 3).
    let b_slot: Arc<std::sync::OnceLock<FixPoint<u64, &'static str>>> =
        Arc::new(std::sync::OnceLock::new());
    let a = {
        let b_slot = Arc::clone(&b_slot);
        FixPoint::new("a", Bottom::value("bottom-of-a"), move |k: u64| {
            b_slot.get().unwrap().tail_call((k + 1) % 3)
        })
    };
    let b = {
        let a = a.clone();
        FixPoint::new("b", Bottom::value("bottom-of-b"), move |k: u64| {
            a.tail_call((k + 1) % 3)
        })
    };
    let _ = b_slot.set(b.clone());

    // Started from a(0) the chain revisits a(0) after six hops; the entry
    // wrapper's bottom is the one substituted.
    assert_eq!(a.call(0), "bottom-of-a");
    assert_eq!(b.call(0), "bottom-of-b");
}

#[test]
fn test_terminating_routines_never_see_bottom() {
    let fib = FixPoint::recursive("fib", Bottom::value(u64::MAX), |this, n: u64| {
        if n < 2 {
            Bounce::Done(n)
        } else {
            Bounce::Done(this.call(n - 1) + this.call(n - 2))
        }
    });
    assert_eq!(fib.call(10), 55);
    assert_eq!(fib.call(30), 832_040);
}

#[test]
fn test_cleanup_leaves_no_stale_state() {
    let looping = FixPoint::recursive("looping", Bottom::value(-1i64), |this, k: u64| {
        this.tail_call((k + 1) % 3)
    });
    let terminating = FixPoint::recursive("term", Bottom::value(-1i64), |this, k: u64| {
        if k == 0 {
            Bounce::Done(7)
        } else {
            this.tail_call(k - 1)
        }
    });

    // The same call sequence twice must behave identically: a leaked
    // signature from round one would turn a fresh call into a false repeat.
    let round = || {
        let mut outcomes = Vec::new();
        for k in 0..3 {
            outcomes.push(looping.call(k));
            outcomes.push(terminating.call(k));
        }
        outcomes
    };
    assert_eq!(round(), round());
}

#[test]
fn test_concurrent_trees_detect_cycles_independently() {
    let spin = FixPoint::recursive(
        "spin",
        Bottom::compute(|name, k: &u64| format!("{name}:{k}")),
        |this, k: u64| this.tail_call((k + 1) % 5),
    );

    let (sender, receiver) = crossbeam_channel::unbounded();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let spin = spin.clone();
        let sender = sender.clone();
        handles.push(std::thread::spawn(move || {
            // Same wrapper, same arguments, simultaneously: every thread
            // must detect its own cycle, not a neighbor's.
            for _ in 0..50 {
                sender.send(spin.call(2)).unwrap();
            }
        }));
    }
    drop(sender);
    for handle in handles {
        handle.join().unwrap();
    }

    let mut count = 0;
    for outcome in receiver.iter() {
        assert_eq!(outcome, "spin:2");
        count += 1;
    }
    assert_eq!(count, 8 * 50);
}

#[test]
fn test_trampolined_hops_add_no_false_repeats() {
    // A long but finite tail chain: every hop has a distinct signature, so
    // nothing is ever cut and the chain runs to completion.
    let countdown = FixPoint::recursive("countdown", Bottom::value(-1i64), |this, n: u64| {
        if n == 0 {
            Bounce::Done(0)
        } else {
            this.tail_call(n - 1)
        }
    });
    assert_eq!(countdown.call(100_000), 0);
}
