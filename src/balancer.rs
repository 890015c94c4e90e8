//! The selection policy consulted by a specific (fixed-target) pool once
//! more than one target is configured. Modeled as a capability object
//! (`select`), the same shape used for load-balancing in
//! `volo::loadbalance` -- no inheritance, just a trait the pool holds a
//! handle to.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitvec::vec::BitVec;
use rand::Rng;

use crate::origin::Origin;

/// A read-only view of one target, as seen by a balancer.
pub struct TargetSnapshot<'a> {
    pub origin: &'a Origin,
    pub request_count: usize,
}

/// Picks an untried target index. Implementations must return an index
/// whose corresponding bit in `tried` is unset; the pool asserts this and
/// treats a violation as a programming error.
pub trait Balancer: Send + Sync + fmt::Debug {
    fn select(
        &self,
        targets: &[TargetSnapshot<'_>],
        tried: &BitVec,
        extra: Option<&(dyn Any + Send + Sync)>,
    ) -> usize;
}

fn assert_untried(tried: &BitVec, idx: usize) {
    assert!(
        !tried[idx],
        "balancer selected an already-tried target index {idx}"
    );
}

/// Round-robins across untried targets using a shared cursor, so repeated
/// `connect` calls spread load even when each call only sees its own
/// `tried` bitmap.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn select(
        &self,
        targets: &[TargetSnapshot<'_>],
        tried: &BitVec,
        _extra: Option<&(dyn Any + Send + Sync)>,
    ) -> usize {
        let len = targets.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if !tried[idx] {
                return idx;
            }
        }
        unreachable!("select called with no untried targets remaining")
    }
}

/// Picks uniformly among untried targets.
#[derive(Debug, Default)]
pub struct Random;

impl Balancer for Random {
    fn select(
        &self,
        targets: &[TargetSnapshot<'_>],
        tried: &BitVec,
        _extra: Option<&(dyn Any + Send + Sync)>,
    ) -> usize {
        let untried: Vec<usize> = (0..targets.len()).filter(|&i| !tried[i]).collect();
        let pick = untried[rand::thread_rng().gen_range(0..untried.len())];
        assert_untried(tried, pick);
        pick
    }
}
