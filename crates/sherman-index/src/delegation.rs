//! Request delegation / coalescing table: lets one caller per hot key
//! become the *delegate* that performs the RDMA work, while others wait on
//! or piggyback onto its result within a short window.
//!
//! The original design uses per-shard mutexes and condition variables;
//! since everything here runs under the single-threaded event loop, the
//! shard map is kept (for modeled contention realism) but the locking is
//! dropped — nothing else can run between a shard lookup and its update.

use sim_types::SimTime;
use std::collections::HashMap;

const NUM_SHARDS: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DelegationState {
    Active,
    Completed,
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollisionPolicy {
    Bypass,
    Queue,
}

struct Waiter {
    callback: Box<dyn FnOnce(bool, String)>,
}

struct DelegationEntry {
    unique_key: u64,
    state: DelegationState,
    waiters: Vec<Waiter>,
    pending_writes: Vec<Box<dyn FnOnce()>>,
    created_at: SimTime,
    result: String,
}

impl DelegationEntry {
    fn fresh(key: u64, now: SimTime) -> Self {
        Self {
            unique_key: key,
            state: DelegationState::Active,
            waiters: Vec::new(),
            pending_writes: Vec::new(),
            created_at: now,
            result: String::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DelegationStats {
    pub delegations_created: u64,
    pub delegation_hits: u64,
    pub delegation_bypasses: u64,
    pub write_combines: u64,
}

pub struct DelegationTable {
    enable: bool,
    window_us: f64,
    collision_policy: CollisionPolicy,
    shards: Vec<HashMap<u64, DelegationEntry>>,
    pub stats: DelegationStats,
}

fn hash_key(key: u64) -> u64 {
    let mut x = key;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

impl DelegationTable {
    pub fn new(enable: bool, window_us: f64, collision_policy: CollisionPolicy) -> Self {
        Self {
            enable,
            window_us,
            collision_policy,
            shards: (0..NUM_SHARDS).map(|_| HashMap::new()).collect(),
            stats: DelegationStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enable
    }

    fn shard_of(hash: u64) -> usize {
        (hash % NUM_SHARDS as u64) as usize
    }

    /// Attempts to join (or start) a GET delegation for `key`. Returns
    /// `(is_delegate, key_hash)`. When `is_delegate` is true, the caller
    /// must perform the read itself and call [`complete_delegation`] with
    /// `key_hash`; otherwise it has either been served immediately (cached
    /// result, via `callback`) or queued as a waiter.
    pub fn try_delegate_get(
        &mut self,
        key: u64,
        now: SimTime,
        callback: impl FnOnce(bool, String) + 'static,
    ) -> (bool, Option<u64>) {
        if !self.enable {
            return (true, None);
        }
        let hash = hash_key(key);
        let idx = Self::shard_of(hash);

        if !self.shards[idx].contains_key(&hash) {
            self.shards[idx].insert(hash, DelegationEntry::fresh(key, now));
            self.stats.delegations_created += 1;
            return (true, Some(hash));
        }

        let collides = self.shards[idx].get(&hash).unwrap().unique_key != key;
        if collides && self.collision_policy == CollisionPolicy::Bypass {
            self.stats.delegation_bypasses += 1;
            return (true, None);
        }

        let expired = now - self.shards[idx].get(&hash).unwrap().created_at > self.window_us;
        if expired {
            self.shards[idx].insert(hash, DelegationEntry::fresh(key, now));
            self.stats.delegations_created += 1;
            return (true, Some(hash));
        }

        let entry = self.shards[idx].get_mut(&hash).unwrap();
        if entry.state == DelegationState::Completed {
            let result = entry.result.clone();
            callback(true, result);
            self.stats.delegation_hits += 1;
            return (false, Some(hash));
        }
        entry.waiters.push(Waiter {
            callback: Box::new(callback),
        });
        self.stats.delegation_hits += 1;
        (false, Some(hash))
    }

    /// Same coalescing protocol for writes: the delegate's `write_op` runs
    /// once; joiners' `write_op`s are accumulated as combined writes.
    pub fn try_delegate_put(
        &mut self,
        key: u64,
        now: SimTime,
        write_op: impl FnOnce() + 'static,
    ) -> (bool, Option<u64>) {
        if !self.enable {
            return (true, None);
        }
        let hash = hash_key(key);
        let idx = Self::shard_of(hash);

        if !self.shards[idx].contains_key(&hash) {
            let mut entry = DelegationEntry::fresh(key, now);
            entry.pending_writes.push(Box::new(write_op));
            self.shards[idx].insert(hash, entry);
            self.stats.delegations_created += 1;
            return (true, Some(hash));
        }

        let collides = self.shards[idx].get(&hash).unwrap().unique_key != key;
        if collides && self.collision_policy == CollisionPolicy::Bypass {
            self.stats.delegation_bypasses += 1;
            return (true, None);
        }

        let expired = now - self.shards[idx].get(&hash).unwrap().created_at > self.window_us;
        if expired {
            let mut entry = DelegationEntry::fresh(key, now);
            entry.pending_writes.push(Box::new(write_op));
            self.shards[idx].insert(hash, entry);
            self.stats.delegations_created += 1;
            return (true, Some(hash));
        }

        let entry = self.shards[idx].get_mut(&hash).unwrap();
        entry.pending_writes.push(Box::new(write_op));
        self.stats.write_combines += 1;
        (false, Some(hash))
    }

    /// Removes the entry for `key_hash`, marks it COMPLETED/FAILED, and
    /// invokes every waiting GET callback and pending write.
    pub fn complete_delegation(&mut self, key_hash: u64, success: bool, result: String) {
        let idx = Self::shard_of(key_hash);
        let Some(mut entry) = self.shards[idx].remove(&key_hash) else {
            return;
        };
        entry.state = if success {
            DelegationState::Completed
        } else {
            DelegationState::Failed
        };
        entry.result = result.clone();
        for w in entry.waiters {
            (w.callback)(success, result.clone());
        }
        for w in entry.pending_writes {
            w();
        }
    }

    /// Fails and removes entries older than twice the delegation window.
    pub fn cleanup_expired(&mut self, now: SimTime) {
        let stale_limit = self.window_us * 2.0;
        for idx in 0..NUM_SHARDS {
            let stale: Vec<u64> = self.shards[idx]
                .iter()
                .filter(|(_, e)| now - e.created_at > stale_limit)
                .map(|(h, _)| *h)
                .collect();
            for hash in stale {
                self.complete_delegation(hash, false, "expired".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn first_caller_becomes_delegate() {
        let mut t = DelegationTable::new(true, 100.0, CollisionPolicy::Bypass);
        let (is_delegate, hash) = t.try_delegate_get(5, 0.0, |_, _| {});
        assert!(is_delegate);
        assert!(hash.is_some());
        assert_eq!(t.stats.delegations_created, 1);
    }

    #[test]
    fn later_callers_join_as_waiters_until_completion() {
        let mut t = DelegationTable::new(true, 100.0, CollisionPolicy::Bypass);
        let (_, hash) = t.try_delegate_get(5, 0.0, |_, _| {});
        let hash = hash.unwrap();
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        let (is_delegate, _) = t.try_delegate_get(5, 1.0, move |ok, _| {
            *seen2.borrow_mut() = ok;
        });
        assert!(!is_delegate);
        assert!(!*seen.borrow());
        t.complete_delegation(hash, true, "ok".into());
        assert!(*seen.borrow());
        assert_eq!(t.stats.delegation_hits, 1);
    }

    #[test]
    fn expired_window_starts_a_fresh_delegation() {
        let mut t = DelegationTable::new(true, 10.0, CollisionPolicy::Bypass);
        t.try_delegate_get(5, 0.0, |_, _| {});
        let (is_delegate, _) = t.try_delegate_get(5, 50.0, |_, _| {});
        assert!(is_delegate);
        assert_eq!(t.stats.delegations_created, 2);
    }

    #[test]
    fn disabled_table_always_makes_caller_the_delegate() {
        let mut t = DelegationTable::new(false, 100.0, CollisionPolicy::Bypass);
        let (is_delegate, hash) = t.try_delegate_get(5, 0.0, |_, _| {});
        assert!(is_delegate);
        assert!(hash.is_none());
    }

    #[test]
    fn put_joiners_combine_writes() {
        let mut t = DelegationTable::new(true, 100.0, CollisionPolicy::Queue);
        let (_, hash) = t.try_delegate_put(9, 0.0, || {});
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        let (is_delegate, _) = t.try_delegate_put(9, 1.0, move || *ran2.borrow_mut() = true);
        assert!(!is_delegate);
        assert_eq!(t.stats.write_combines, 1);
        t.complete_delegation(hash.unwrap(), true, String::new());
        assert!(*ran.borrow());
    }
}
