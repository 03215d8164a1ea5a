use std::collections::{HashMap, HashSet};

use crate::models::{ParallelConstraint, TestDescriptor};

/// Resources held by one in-flight test
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Lease {
    keys: Vec<String>,
    group: Option<String>,
    limiter: Option<String>,
    exclusive: bool,
}

/// Admission bookkeeping for parallel constraints
///
/// Owned by the coordinator task alone, so it needs no locking.
#[derive(Debug)]
pub struct ConstraintTracker {
    max_parallelism: usize,
    in_flight: usize,
    held_keys: HashSet<String>,
    exclusive_running: bool,
    /// Active parallel group and how many of its tests are in flight
    group: Option<(String, usize)>,
    limiters: HashMap<String, usize>,
}

impl ConstraintTracker {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            in_flight: 0,
            held_keys: HashSet::new(),
            exclusive_running: false,
            group: None,
            limiters: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    fn group_in_flight(&self) -> usize {
        self.group.as_ref().map_or(0, |(_, count)| *count)
    }

    /// Whether `test` could start right now
    pub fn admits(&self, test: &TestDescriptor) -> bool {
        if self.in_flight >= self.max_parallelism || self.exclusive_running {
            return false;
        }

        match &test.constraint {
            ParallelConstraint::NotInParallel(keys) if keys.is_empty() => {
                if self.in_flight > 0 {
                    return false;
                }
            }
            ParallelConstraint::NotInParallel(_) => {
                if test
                    .exclusion_keys()
                    .iter()
                    .any(|k| self.held_keys.contains(k))
                {
                    return false;
                }
            }
            ParallelConstraint::ParallelGroup(name) => {
                if matches!(&self.group, Some((active, _)) if active != name) {
                    return false;
                }
                // A group runs as its own phase: nothing outside it may be in flight
                if self.in_flight > self.group_in_flight() {
                    return false;
                }
            }
            ParallelConstraint::Unconstrained => {}
        }
        if self.group.is_some() && !matches!(test.constraint, ParallelConstraint::ParallelGroup(_)) {
            return false;
        }

        match &test.parallel_limit {
            Some(limit) => self.limiters.get(&limit.key).copied().unwrap_or(0) < limit.max.max(1),
            None => true,
        }
    }

    /// Reserve everything `test` needs, or `None` if it must wait
    pub fn try_acquire(&mut self, test: &TestDescriptor) -> Option<Lease> {
        if !self.admits(test) {
            return None;
        }

        let mut lease = Lease::default();
        match &test.constraint {
            ParallelConstraint::NotInParallel(keys) if keys.is_empty() => {
                self.exclusive_running = true;
                lease.exclusive = true;
            }
            ParallelConstraint::NotInParallel(_) => {
                lease.keys = test.exclusion_keys();
                self.held_keys.extend(lease.keys.iter().cloned());
            }
            ParallelConstraint::ParallelGroup(name) => {
                let entry = self.group.get_or_insert_with(|| (name.clone(), 0));
                entry.1 += 1;
                lease.group = Some(name.clone());
            }
            ParallelConstraint::Unconstrained => {}
        }
        if let Some(limit) = &test.parallel_limit {
            *self.limiters.entry(limit.key.clone()).or_insert(0) += 1;
            lease.limiter = Some(limit.key.clone());
        }

        self.in_flight += 1;
        Some(lease)
    }

    pub fn release(&mut self, lease: Lease) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if lease.exclusive {
            self.exclusive_running = false;
        }
        for key in &lease.keys {
            self.held_keys.remove(key);
        }
        if lease.group.is_some() {
            if let Some((_, count)) = &mut self.group {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.group = None;
                }
            }
        }
        if let Some(key) = lease.limiter {
            if let Some(count) = self.limiters.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
        }
    }
}
