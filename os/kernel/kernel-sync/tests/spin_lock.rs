use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u64);
    {
        let mut g = l.lock();
        *g = 0x1000;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 0x1000);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new([0_u8; 16]);

    let held = l.try_lock();
    assert!(held.is_some());
    assert!(l.try_lock().is_none());

    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(Vec::<u64>::new());
    let len = l.with_lock(|v| {
        v.extend([0x10_0000, 0x10_1000]);
        v.len()
    });
    assert_eq!(len, 2);
    assert!(!l.is_locked());
}

#[test]
fn two_locks_in_fixed_order() {
    // Context lock, then allocator lock; both released in reverse.
    let ctx = SpinLock::new(0_u32);
    let pmm = SpinLock::new(0_u32);
    ctx.with_lock(|c| {
        *c += 1;
        pmm.with_lock(|p| *p += 1);
        assert!(!pmm.is_locked());
    });
    assert_eq!(ctx.into_inner() + pmm.into_inner(), 2);
}

#[test]
fn debug_shows_locked_state() {
    let l = SpinLock::new(7_u8);
    assert_eq!(format!("{l:?}"), "SpinLock { value: 7 }");
    let _g = l.lock();
    assert_eq!(format!("{l:?}"), "SpinLock { <locked> }");
}

#[test]
fn contended_counter_stays_exact() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0_usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *v += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn panic_inside_critical_section_unlocks() {
    let l = SpinLock::new(0_u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 9;
            panic!("double free");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 9);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinLock::new(0_u8));
}
