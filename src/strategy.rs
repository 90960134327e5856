//! Injection strategies consulted for every scanned word.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ptrace::ProcessController;
use crate::region::{PointerClass, Region};

/// Policy hooks the scanner engine calls for each classified word.
///
/// Workers invoke the hooks concurrently, so implementations carry their
/// own synchronization for any shared state. Hooks must not block or
/// perform I/O; the region reference is only valid for the duration of a
/// single call. Returning `Some(v)` replaces the word with `v` in the page
/// buffer (written back iff the region is writable); `None` keeps it.
pub trait InjectionStrategy: Sync {
    /// Runs once before the scan. Returning `false` cancels it cleanly.
    fn pre_scan(&self) -> bool {
        true
    }

    /// Called once per region before its word loop begins, for policies
    /// that only need per-region context.
    fn set_current_region(&self, _region: &Region) {}

    fn on_pointer(
        &self,
        _addr: u64,
        _value: u64,
        _writable: bool,
        _region: &Region,
    ) -> Option<u64> {
        None
    }

    fn on_nonpointer(
        &self,
        _addr: u64,
        _value: u64,
        _writable: bool,
        _region: &Region,
    ) -> Option<u64> {
        None
    }

    /// Runs once after every worker has finished.
    fn post_scan(&self) {}
}

/// Read-only strategy for plain scan passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStrategy;

impl InjectionStrategy for NullStrategy {}

/// The kind of fault applied to a selected word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// XOR one uniformly chosen bit.
    BitFlip,
    /// Clear one uniformly chosen bit.
    StuckAtZero,
    /// Set one uniformly chosen bit.
    StuckAtOne,
}

/// Log record for one injected mutation, keyed by remote address.
#[derive(Debug, Clone)]
pub struct ValueChange {
    pub original: u64,
    pub modified: u64,
    pub pointer_class: PointerClass,
    pub region_name: String,
    pub injected_at: Instant,
}

/// What a later observation of an injected address found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The word holds its pre-injection value again (restored, or the
    /// target overwrote it with the same value).
    Reverted,
    /// The injected value is still in place.
    Retained,
    /// The target has written something else entirely.
    Diverged(u64),
    /// The word could not be read back.
    Unreadable,
}

/// Classifies a value read back from an injected address.
pub fn classify_observed(change: &ValueChange, observed: u64) -> ChangeOutcome {
    if observed == change.original {
        ChangeOutcome::Reverted
    } else if observed == change.modified {
        ChangeOutcome::Retained
    } else {
        ChangeOutcome::Diverged(observed)
    }
}

/// Per-class injection budgets with a wildcard pool absorbing overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectionQuota {
    pub heap_errors: usize,
    pub stack_errors: usize,
    pub static_errors: usize,
    pub wildcard_errors: usize,

    pub heap_quota: usize,
    pub stack_quota: usize,
    pub static_quota: usize,
    pub wildcard_quota: usize,
}

impl InjectionQuota {
    /// Quota with only the wildcard pool funded, as the CLI's
    /// `--error-limit` configures it.
    pub fn with_wildcard(limit: usize) -> Self {
        Self {
            wildcard_quota: limit,
            ..Self::default()
        }
    }

    /// Whether a mutation in `class` is still admissible. `Unknown` words
    /// are never eligible.
    pub fn available(&self, class: PointerClass) -> bool {
        let wildcard_avail = self.wildcard_errors < self.wildcard_quota;
        match class {
            PointerClass::Heap => self.heap_errors < self.heap_quota || wildcard_avail,
            PointerClass::Stack => self.stack_errors < self.stack_quota || wildcard_avail,
            PointerClass::Static => self.static_errors < self.static_quota || wildcard_avail,
            PointerClass::Unknown => false,
        }
    }

    /// Records an accepted mutation. The wildcard counter absorbs the hit
    /// exactly when the class budget is already spent.
    pub fn increment(&mut self, class: PointerClass) {
        let (errors, quota) = match class {
            PointerClass::Heap => (&mut self.heap_errors, self.heap_quota),
            PointerClass::Stack => (&mut self.stack_errors, self.stack_quota),
            PointerClass::Static => (&mut self.static_errors, self.static_quota),
            PointerClass::Unknown => return,
        };
        if *errors == quota {
            self.wildcard_errors += 1;
        } else {
            *errors += 1;
        }
    }

    pub fn total_errors(&self) -> usize {
        self.heap_errors + self.stack_errors + self.static_errors + self.wildcard_errors
    }

    fn reset_counters(&mut self) {
        self.heap_errors = 0;
        self.stack_errors = 0;
        self.static_errors = 0;
        self.wildcard_errors = 0;
    }
}

struct InjectionState {
    rng: StdRng,
    quota: InjectionQuota,
    changes: HashMap<u64, ValueChange>,
}

/// Reference injection policy: two Bernoulli rates over pointer and
/// non-pointer words, a per-class quota, and a configured fault kind.
///
/// All mutable state sits behind one mutex, so a single instance may be
/// shared by every scan worker.
pub struct ErrorInjectionStrategy {
    error_type: ErrorType,
    pointer_error_rate: f64,
    non_pointer_error_rate: f64,
    state: Mutex<InjectionState>,
}

impl ErrorInjectionStrategy {
    /// A zero seed draws a nondeterministic seed from the clock.
    pub fn new(
        error_type: ErrorType,
        pointer_error_rate: f64,
        non_pointer_error_rate: f64,
        error_limit: usize,
        seed: u64,
    ) -> Self {
        Self::with_quota(
            error_type,
            pointer_error_rate,
            non_pointer_error_rate,
            InjectionQuota::with_wildcard(error_limit),
            seed,
        )
    }

    pub fn with_quota(
        error_type: ErrorType,
        pointer_error_rate: f64,
        non_pointer_error_rate: f64,
        quota: InjectionQuota,
        seed: u64,
    ) -> Self {
        let seed = if seed != 0 { seed } else { clock_seed() };
        Self {
            error_type,
            pointer_error_rate,
            non_pointer_error_rate,
            state: Mutex::new(InjectionState {
                rng: StdRng::seed_from_u64(seed),
                quota,
                changes: HashMap::new(),
            }),
        }
    }

    /// Snapshot of the change log, keyed by remote address.
    pub fn changes(&self) -> HashMap<u64, ValueChange> {
        self.state.lock().unwrap().changes.clone()
    }

    /// Snapshot of the quota counters.
    pub fn quota(&self) -> InjectionQuota {
        self.state.lock().unwrap().quota
    }

    /// Clears the quota counters and the change log so the strategy can be
    /// reused for another campaign. Limits are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.quota.reset_counters();
        state.changes.clear();
    }

    /// Re-reads every injected address from the attached target and reports
    /// whether each mutation reverted, survived, or was overwritten.
    /// Addresses are visited in sorted order so campaign logs line up
    /// between runs.
    pub fn audit_changes(&self, controller: &ProcessController) -> Vec<(u64, ChangeOutcome)> {
        let changes = self.changes();
        let mut addrs: Vec<u64> = changes.keys().copied().collect();
        addrs.sort_unstable();

        let mut outcomes = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let change = &changes[&addr];
            let mut word = [0u8; 8];
            let outcome = match controller.read_memory(addr, &mut word) {
                Ok(()) => classify_observed(change, u64::from_ne_bytes(word)),
                Err(e) => {
                    log::warn!("audit read at {:#x} failed: {}", addr, e);
                    ChangeOutcome::Unreadable
                }
            };
            match outcome {
                ChangeOutcome::Reverted => log::info!(
                    "address {:#x} reverted to original value {:#x}",
                    addr,
                    change.original
                ),
                ChangeOutcome::Retained => log::info!(
                    "address {:#x} retained modified value {:#x}",
                    addr,
                    change.modified
                ),
                ChangeOutcome::Diverged(now) => log::info!(
                    "address {:#x} changed to new value {:#x} (orig={:#x}, mod={:#x})",
                    addr,
                    now,
                    change.original,
                    change.modified
                ),
                ChangeOutcome::Unreadable => {}
            }
            outcomes.push((addr, outcome));
        }
        outcomes
    }

    fn inject(&self, rate: f64, addr: u64, value: u64, writable: bool, region: &Region) -> Option<u64> {
        if !writable {
            return None;
        }

        let class = region.pointer_class();
        let mut state = self.state.lock().unwrap();
        if state.rng.gen::<f64>() > rate || !state.quota.available(class) {
            return None;
        }

        let bit = state.rng.gen_range(0..u64::BITS as u64);
        let modified = match self.error_type {
            ErrorType::BitFlip => value ^ (1u64 << bit),
            ErrorType::StuckAtZero => value & !(1u64 << bit),
            ErrorType::StuckAtOne => value | (1u64 << bit),
        };

        state.changes.insert(
            addr,
            ValueChange {
                original: value,
                modified,
                pointer_class: class,
                region_name: region.mapping_name.clone(),
                injected_at: Instant::now(),
            },
        );
        state.quota.increment(class);

        log::info!(
            "injected {:?} fault in {} region {:?} at {:#x}: {:#x} -> {:#x}",
            self.error_type,
            class,
            region.mapping_name,
            addr,
            value,
            modified
        );

        Some(modified)
    }
}

impl InjectionStrategy for ErrorInjectionStrategy {
    fn on_pointer(&self, addr: u64, value: u64, writable: bool, region: &Region) -> Option<u64> {
        self.inject(self.pointer_error_rate, addr, value, writable, region)
    }

    fn on_nonpointer(&self, addr: u64, value: u64, writable: bool, region: &Region) -> Option<u64> {
        self.inject(self.non_pointer_error_rate, addr, value, writable, region)
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_region() -> Region {
        Region {
            start: 0x1000,
            end: 0x2000,
            readable: true,
            writable: true,
            executable: false,
            private: true,
            mapping_name: "[heap]".to_string(),
        }
    }

    fn anon_region() -> Region {
        Region {
            mapping_name: String::new(),
            ..heap_region()
        }
    }

    // ==================== InjectionQuota Tests ====================

    #[test]
    fn test_quota_class_budget_consumed_first() {
        let mut quota = InjectionQuota {
            heap_quota: 3,
            wildcard_quota: 2,
            ..InjectionQuota::default()
        };

        for _ in 0..5 {
            assert!(quota.available(PointerClass::Heap));
            quota.increment(PointerClass::Heap);
        }

        assert_eq!(quota.heap_errors, 3);
        assert_eq!(quota.wildcard_errors, 2);
        assert_eq!(quota.total_errors(), 5);
        assert!(!quota.available(PointerClass::Heap));
    }

    #[test]
    fn test_quota_wildcard_shared_across_classes() {
        let mut quota = InjectionQuota::with_wildcard(1);

        assert!(quota.available(PointerClass::Stack));
        quota.increment(PointerClass::Stack);

        // The single wildcard slot is gone for every class.
        assert!(!quota.available(PointerClass::Heap));
        assert!(!quota.available(PointerClass::Stack));
        assert!(!quota.available(PointerClass::Static));
        assert_eq!(quota.wildcard_errors, 1);
    }

    #[test]
    fn test_quota_unknown_class_never_eligible() {
        let mut quota = InjectionQuota::with_wildcard(10);
        assert!(!quota.available(PointerClass::Unknown));
        quota.increment(PointerClass::Unknown);
        assert_eq!(quota.total_errors(), 0);
    }

    #[test]
    fn test_quota_respects_combined_bound() {
        // count(c) <= limit(c) + limit(wildcard) for every class.
        let mut quota = InjectionQuota {
            heap_quota: 2,
            stack_quota: 1,
            wildcard_quota: 3,
            ..InjectionQuota::default()
        };

        let mut accepted = 0;
        for class in [PointerClass::Heap, PointerClass::Stack].iter().cycle().take(32) {
            if quota.available(*class) {
                quota.increment(*class);
                accepted += 1;
            }
        }

        assert_eq!(accepted, 6);
        assert!(quota.heap_errors <= quota.heap_quota);
        assert!(quota.stack_errors <= quota.stack_quota);
        assert!(quota.wildcard_errors <= quota.wildcard_quota);
    }

    // ==================== ErrorInjectionStrategy Tests ====================

    #[test]
    fn test_bitflip_changes_exactly_one_bit() {
        let strategy =
            ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 1.0, usize::MAX, 42);
        let region = heap_region();

        for i in 0..32u64 {
            let value = 0xdead_beef_0000_0001u64.wrapping_add(i * 8);
            let modified = strategy
                .on_nonpointer(0x1000 + i * 8, value, true, &region)
                .expect("rate 1.0 with open quota always injects");
            assert_eq!((modified ^ value).count_ones(), 1);
        }
        assert_eq!(strategy.changes().len(), 32);
    }

    #[test]
    fn test_stuck_at_zero_only_clears() {
        let strategy =
            ErrorInjectionStrategy::new(ErrorType::StuckAtZero, 0.0, 1.0, usize::MAX, 7);
        let region = heap_region();

        for i in 0..32u64 {
            let value = u64::MAX;
            if let Some(modified) = strategy.on_nonpointer(0x1000 + i * 8, value, true, &region) {
                assert_eq!(modified | value, value);
                assert_eq!((value ^ modified).count_ones(), 1);
            }
        }
    }

    #[test]
    fn test_stuck_at_one_only_sets() {
        let strategy =
            ErrorInjectionStrategy::new(ErrorType::StuckAtOne, 0.0, 1.0, usize::MAX, 7);
        let region = heap_region();

        for i in 0..32u64 {
            if let Some(modified) = strategy.on_nonpointer(0x1000 + i * 8, 0, true, &region) {
                assert_eq!(modified.count_ones(), 1);
            }
        }
    }

    #[test]
    fn test_error_limit_bounds_injections() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 1.0, 10, 42);
        let region = heap_region();

        let mut injected = 0;
        for i in 0..100u64 {
            if strategy
                .on_nonpointer(0x1000 + i * 8, 0x10, true, &region)
                .is_some()
            {
                injected += 1;
            }
        }

        assert_eq!(injected, 10);
        assert_eq!(strategy.changes().len(), 10);
        assert_eq!(strategy.quota().wildcard_errors, 10);
    }

    #[test]
    fn test_quota_overflow_into_wildcard_through_strategy() {
        // Class budget 3 plus wildcard 2: five mutations total, the last
        // two absorbed by the wildcard.
        let quota = InjectionQuota {
            heap_quota: 3,
            wildcard_quota: 2,
            ..InjectionQuota::default()
        };
        let strategy =
            ErrorInjectionStrategy::with_quota(ErrorType::BitFlip, 0.0, 1.0, quota, 42);
        let region = heap_region();

        let mut injected = 0;
        for i in 0..50u64 {
            if strategy
                .on_nonpointer(0x1000 + i * 8, 0x10, true, &region)
                .is_some()
            {
                injected += 1;
            }
        }

        let final_quota = strategy.quota();
        assert_eq!(injected, 5);
        assert_eq!(final_quota.heap_errors, 3);
        assert_eq!(final_quota.wildcard_errors, 2);
        assert_eq!(final_quota.total_errors(), 5);
    }

    #[test]
    fn test_zero_rate_never_injects() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 0.0, usize::MAX, 42);
        let region = heap_region();

        for i in 0..64u64 {
            assert!(strategy
                .on_nonpointer(0x1000 + i * 8, 0x10, true, &region)
                .is_none());
            assert!(strategy
                .on_pointer(0x1000 + i * 8, 0x10, true, &region)
                .is_none());
        }
        assert!(strategy.changes().is_empty());
    }

    #[test]
    fn test_non_writable_words_never_injected() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 1.0, 1.0, usize::MAX, 42);
        let region = heap_region();

        assert!(strategy.on_pointer(0x1000, 0x10, false, &region).is_none());
        assert!(strategy
            .on_nonpointer(0x1008, 0x11, false, &region)
            .is_none());
        assert!(strategy.changes().is_empty());
    }

    #[test]
    fn test_unknown_region_never_injected() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 1.0, usize::MAX, 42);
        let region = anon_region();

        assert!(strategy.on_nonpointer(0x1000, 0x10, true, &region).is_none());
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let region = heap_region();
        let run = || {
            let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 0.5, 64, 1234);
            (0..64u64)
                .filter_map(|i| strategy.on_nonpointer(0x1000 + i * 8, 0x10, true, &region))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_reset_clears_counters_and_changes() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 1.0, 5, 42);
        let region = heap_region();

        for i in 0..10u64 {
            let _ = strategy.on_nonpointer(0x1000 + i * 8, 0x10, true, &region);
        }
        assert_eq!(strategy.quota().total_errors(), 5);

        strategy.reset();
        assert_eq!(strategy.quota().total_errors(), 0);
        assert!(strategy.changes().is_empty());
        // Limits survive the reset.
        assert_eq!(strategy.quota().wildcard_quota, 5);
    }

    #[test]
    fn test_change_log_records_original_and_class() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 1.0, 1, 42);
        let region = heap_region();

        let modified = strategy
            .on_nonpointer(0x1010, 0xabcd, true, &region)
            .unwrap();

        let changes = strategy.changes();
        let change = changes.get(&0x1010).unwrap();
        assert_eq!(change.original, 0xabcd);
        assert_eq!(change.modified, modified);
        assert_eq!(change.pointer_class, PointerClass::Heap);
        assert_eq!(change.region_name, "[heap]");
    }

    // ==================== Change Audit Tests ====================

    #[test]
    fn test_classify_observed_outcomes() {
        let change = ValueChange {
            original: 0x10,
            modified: 0x30,
            pointer_class: PointerClass::Heap,
            region_name: "[heap]".to_string(),
            injected_at: Instant::now(),
        };

        assert_eq!(classify_observed(&change, 0x10), ChangeOutcome::Reverted);
        assert_eq!(classify_observed(&change, 0x30), ChangeOutcome::Retained);
        assert_eq!(
            classify_observed(&change, 0x99),
            ChangeOutcome::Diverged(0x99)
        );
    }

    #[test]
    fn test_audit_without_changes_is_empty() {
        let strategy = ErrorInjectionStrategy::new(ErrorType::BitFlip, 0.0, 0.0, 0, 1);
        let controller = ProcessController::new(1234).unwrap();
        assert!(strategy.audit_changes(&controller).is_empty());
    }

    #[test]
    fn test_null_strategy_keeps_everything() {
        let strategy = NullStrategy;
        let region = heap_region();

        assert!(strategy.pre_scan());
        assert!(strategy.on_pointer(0x1000, 0x10, true, &region).is_none());
        assert!(strategy.on_nonpointer(0x1008, 0x11, true, &region).is_none());
    }
}
