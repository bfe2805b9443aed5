mod common;

use common::validated;
use listing_harvester::proxy::{FailureOutcome, Membership, ProxyPool};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_concurrent_checkouts_never_share_an_identity() {
    let proxies: Vec<_> = (0..8).map(|i| validated(&format!("10.0.1.{i}"), 10 + i)).collect();
    let pool = Arc::new(ProxyPool::with_proxies(1_000, proxies).unwrap());
    let held = Arc::new(Mutex::new(HashSet::new()));

    let workers: Vec<_> = (0..16)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let held = Arc::clone(&held);
            thread::spawn(move || {
                for round in 0..500 {
                    let Some(proxy) = pool.checkout() else {
                        thread::yield_now();
                        continue;
                    };
                    assert!(held.lock().insert(proxy.id()), "identity checked out twice");
                    assert_eq!(pool.membership(&proxy.id()), Some(Membership::CheckedOut));
                    held.lock().remove(&proxy.id());
                    if (worker + round) % 3 == 0 {
                        pool.return_failure(&proxy).unwrap();
                    } else {
                        pool.return_success(&proxy).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let size = pool.size();
    assert_eq!(size.checked_out, 0);
    assert_eq!(size.total(), 8);
}

#[test]
fn test_blacklisted_proxy_is_never_checked_out_again() {
    let pool = ProxyPool::with_proxies(3, [validated("bad", 50), validated("good", 5)]).unwrap();

    let good = pool.checkout().unwrap();
    assert_eq!(good.candidate.host, "good");
    let outcomes: Vec<_> = (0..3)
        .map(|_| {
            let bad = pool.checkout().unwrap();
            assert_eq!(bad.candidate.host, "bad");
            pool.return_failure(&bad).unwrap()
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            FailureOutcome::Requeued {
                consecutive_failures: 1
            },
            FailureOutcome::Requeued {
                consecutive_failures: 2
            },
            FailureOutcome::Blacklisted,
        ]
    );
    assert!(pool.checkout().is_none());
    pool.return_success(&good).unwrap();

    for _ in 0..10 {
        let proxy = pool.checkout().unwrap();
        assert_eq!(proxy.candidate.host, "good");
        pool.return_success(&proxy).unwrap();
    }
    assert_eq!(pool.blacklisted().len(), 1);
    assert_eq!(pool.working().len(), 1);
}

#[test]
fn test_double_return_is_rejected() {
    let pool = ProxyPool::with_proxies(3, [validated("a", 5)]).unwrap();
    let proxy = pool.checkout().unwrap();
    pool.return_success(&proxy).unwrap();
    assert!(pool.return_success(&proxy).is_err());
    assert!(pool.return_failure(&proxy).is_err());
    assert_eq!(pool.size().available, 1);
}

#[test]
fn test_extend_ignores_known_identities() {
    let pool = ProxyPool::with_proxies(3, [validated("a", 5)]).unwrap();
    let held = pool.checkout().unwrap();
    assert_eq!(pool.extend([validated("a", 1), validated("b", 7)]), 1);

    let size = pool.size();
    assert_eq!((size.available, size.checked_out), (1, 1));
    pool.return_success(&held).unwrap();
    assert_eq!(pool.size().available, 2);
}
