//! Bitrate allocation across encoders
//!
//! Distributes the estimated send rate over registered observers under
//! their min/max constraints. Allocation is computed under the internal
//! lock; observer callbacks run after it is released, in registration
//! order, so an observer may call back into the allocator.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use rtcore_config::AllocatorConfig;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Ceiling reported when no observer declares a maximum
pub const DEFAULT_MAX_BITRATE_BPS: u32 = 1_000_000_000;
/// Floor cap reported when min-bitrate enforcement is off
pub const UNENFORCED_MIN_BITRATE_BPS: u32 = 10_000;

/// Receives bitrate updates from the allocator
pub trait BitrateObserver: Send + Sync {
    /// `fraction_loss` is loss as `n / 256`
    fn on_network_changed(&self, bitrate_bps: u32, fraction_loss: u8, rtt_ms: i64);
}

/// Caller-chosen observer identity
pub type ObserverId = u32;

/// Per-observer constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObserverConfig {
    pub observer_id: ObserverId,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub start_bitrate_bps: u32,
    /// Never pause this observer below its minimum
    pub enforce_min: bool,
}

/// Last network update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NetworkState {
    pub target_bps: u32,
    pub fraction_loss: u8,
    pub rtt_ms: i64,
}

/// Resume hysteresis for paused observers
#[derive(Debug, Clone, Copy, PartialEq)]
struct Hysteresis {
    fraction: f64,
    min_toggle_bps: u32,
}

impl Hysteresis {
    /// Budget a paused observer with minimum `min` needs to resume
    fn resume_threshold(&self, min: u32) -> u64 {
        let extra = (f64::from(min) * self.fraction) as u64;
        u64::from(min) + extra.max(u64::from(self.min_toggle_bps))
    }
}

struct ObserverEntry {
    config: ObserverConfig,
    observer: Arc<dyn BitrateObserver>,
    last_allocation: Option<u32>,
}

struct AllocatorState {
    /// Registration order
    observers: Vec<ObserverEntry>,
    network: Option<NetworkState>,
    enforce_min_bitrate: bool,
}

/// Multi-observer bitrate allocator
pub struct BitrateAllocator {
    state: Mutex<AllocatorState>,
    hysteresis: Hysteresis,
}

impl Default for BitrateAllocator {
    fn default() -> Self {
        Self::new(&AllocatorConfig::default())
    }
}

impl BitrateAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        BitrateAllocator {
            state: Mutex::new(AllocatorState {
                observers: Vec::new(),
                network: None,
                enforce_min_bitrate: config.enforce_min_bitrate,
            }),
            hysteresis: Hysteresis {
                fraction: config.toggle_hysteresis_fraction,
                min_toggle_bps: config.min_toggle_bitrate_bps,
            },
        }
    }

    // Callbacks never run under the lock, so a poisoned guard is still consistent
    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register or update an observer.
    ///
    /// On update, returns the sum of start bitrates as a proposed estimator
    /// floor. On first registration, returns `start` for the first observer
    /// and `None` otherwise.
    pub fn add_observer(
        &self,
        observer_id: ObserverId,
        observer: Arc<dyn BitrateObserver>,
        min_bitrate_bps: u32,
        max_bitrate_bps: u32,
        enforce_min: bool,
        start_bitrate_bps: u32,
    ) -> Option<u32> {
        debug_assert!(
            min_bitrate_bps <= max_bitrate_bps,
            "observer {} min {} above max {}",
            observer_id,
            min_bitrate_bps,
            max_bitrate_bps
        );

        let config = ObserverConfig {
            observer_id,
            min_bitrate_bps,
            max_bitrate_bps,
            start_bitrate_bps,
            enforce_min,
        };

        let mut state = self.lock();
        if let Some(entry) = state
            .observers
            .iter_mut()
            .find(|entry| entry.config.observer_id == observer_id)
        {
            entry.config = config;
            entry.observer = observer;
            let sum_start: u64 = state
                .observers
                .iter()
                .map(|entry| u64::from(entry.config.start_bitrate_bps))
                .sum();
            debug!(observer_id, sum_start, "Updated bitrate observer");
            return Some(saturate(sum_start));
        }

        state.observers.push(ObserverEntry {
            config,
            observer,
            last_allocation: None,
        });
        info!(
            observer_id,
            min_bitrate_bps,
            max_bitrate_bps,
            enforce_min,
            observers = state.observers.len(),
            "Added bitrate observer"
        );
        (state.observers.len() == 1).then_some(start_bitrate_bps)
    }

    /// Unlink an observer; remaining allocations are left as they are
    pub fn remove_observer(&self, observer_id: ObserverId) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state
            .observers
            .retain(|entry| entry.config.observer_id != observer_id);
        let removed = state.observers.len() != before;
        if removed {
            info!(observer_id, "Removed bitrate observer");
        }
        removed
    }

    /// Distribute `target_bps` and notify every observer
    pub fn on_network_changed(&self, target_bps: u32, fraction_loss: u8, rtt_ms: i64) {
        let updates: Vec<(Arc<dyn BitrateObserver>, ObserverId, u32)> = {
            let mut state = self.lock();
            let allocation = allocate(&state.observers, target_bps, &self.hysteresis);
            state.network = Some(NetworkState {
                target_bps,
                fraction_loss,
                rtt_ms,
            });
            state
                .observers
                .iter_mut()
                .zip(allocation)
                .map(|(entry, bitrate)| {
                    entry.last_allocation = Some(bitrate);
                    (Arc::clone(&entry.observer), entry.config.observer_id, bitrate)
                })
                .collect()
        };

        for (observer, observer_id, bitrate) in updates {
            debug!(observer_id, bitrate, fraction_loss, rtt_ms, "Bitrate allocated");
            observer.on_network_changed(bitrate, fraction_loss, rtt_ms);
        }
    }

    /// `(Σ min, Σ max)` over registered observers
    pub fn min_max_sum(&self) -> (u32, u32) {
        let state = self.lock();
        let sum_min: u64 = state
            .observers
            .iter()
            .map(|entry| u64::from(entry.config.min_bitrate_bps))
            .sum();
        let sum_max: u64 = state
            .observers
            .iter()
            .map(|entry| u64::from(entry.config.max_bitrate_bps))
            .sum();

        let sum_max = if sum_max == 0 {
            DEFAULT_MAX_BITRATE_BPS
        } else {
            saturate(sum_max)
        };
        let sum_min = if state.enforce_min_bitrate {
            saturate(sum_min)
        } else {
            saturate(sum_min).min(UNENFORCED_MIN_BITRATE_BPS)
        };
        (sum_min, sum_max)
    }

    pub fn set_enforce_min_bitrate(&self, enforce: bool) {
        self.lock().enforce_min_bitrate = enforce;
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Bitrate given to `observer_id` by the last network update
    pub fn last_allocation(&self, observer_id: ObserverId) -> Option<u32> {
        self.lock()
            .observers
            .iter()
            .find(|entry| entry.config.observer_id == observer_id)
            .and_then(|entry| entry.last_allocation)
    }

    pub fn network_state(&self) -> Option<NetworkState> {
        self.lock().network
    }

    pub fn observer_config(&self, observer_id: ObserverId) -> Option<ObserverConfig> {
        self.lock()
            .observers
            .iter()
            .find(|entry| entry.config.observer_id == observer_id)
            .map(|entry| entry.config)
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Per-observer bitrates, indexed like `observers`
fn allocate(observers: &[ObserverEntry], target_bps: u32, hysteresis: &Hysteresis) -> Vec<u32> {
    if observers.is_empty() {
        return Vec::new();
    }

    let target = u64::from(target_bps);
    let sum_min: u64 = observers
        .iter()
        .map(|entry| u64::from(entry.config.min_bitrate_bps))
        .sum();

    if target <= sum_min {
        low_rate_allocation(observers, target, hysteresis)
    } else {
        normal_rate_allocation(observers, target - sum_min)
    }
}

fn low_rate_allocation(observers: &[ObserverEntry], target: u64, hysteresis: &Hysteresis) -> Vec<u32> {
    if observers.iter().any(|entry| entry.config.enforce_min) {
        return observers
            .iter()
            .map(|entry| entry.config.min_bitrate_bps)
            .collect();
    }

    // Registration order; each observer gets its full minimum or nothing.
    // A partial min(remaining, min) award would fall outside {0} ∪ [min, max].
    let mut remaining = target;
    observers
        .iter()
        .map(|entry| {
            let min = entry.config.min_bitrate_bps;
            let needed = match entry.last_allocation {
                Some(0) => hysteresis.resume_threshold(min),
                _ => u64::from(min),
            };
            if remaining >= needed {
                remaining -= u64::from(min);
                min
            } else {
                0
            }
        })
        .collect()
}

fn normal_rate_allocation(observers: &[ObserverEntry], surplus: u64) -> Vec<u32> {
    let count = observers.len() as u64;
    let mut per_observer = surplus / count;

    let mut order: Vec<usize> = (0..observers.len()).collect();
    // Stable: equal maxima keep registration order
    order.sort_by_key(|&i| observers[i].config.max_bitrate_bps);

    let mut allocation = vec![0u32; observers.len()];
    for (seen, &index) in order.iter().enumerate() {
        let config = &observers[index].config;
        let allowance = u64::from(config.min_bitrate_bps) + per_observer;
        let max = u64::from(config.max_bitrate_bps);
        if allowance >= max {
            allocation[index] = config.max_bitrate_bps;
            let remaining = count - seen as u64 - 1;
            if remaining > 0 {
                per_observer += (allowance - max) / remaining;
            }
        } else {
            allocation[index] = saturate(allowance);
        }
    }
    allocation
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingObserver {
        bitrate: AtomicU32,
        calls: AtomicU32,
    }

    impl BitrateObserver for RecordingObserver {
        fn on_network_changed(&self, bitrate_bps: u32, _fraction_loss: u8, _rtt_ms: i64) {
            self.bitrate.store(bitrate_bps, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn allocator(enforce: bool) -> BitrateAllocator {
        BitrateAllocator::new(&AllocatorConfig {
            enforce_min_bitrate: enforce,
            ..AllocatorConfig::default()
        })
    }

    #[test]
    fn test_add_observer_return_values() {
        let allocator = allocator(true);
        let a = Arc::new(RecordingObserver::default());
        let b = Arc::new(RecordingObserver::default());

        assert_eq!(allocator.add_observer(1, a.clone(), 100, 500, true, 300), Some(300));
        assert_eq!(allocator.add_observer(2, b.clone(), 100, 500, true, 200), None);
        // Update in place
        assert_eq!(allocator.add_observer(1, a, 150, 600, false, 400), Some(600));
        assert_eq!(allocator.observer_count(), 2);
        assert_eq!(allocator.observer_config(1).unwrap().min_bitrate_bps, 150);
    }

    #[test]
    fn test_remove_observer_does_not_reallocate() {
        let allocator = allocator(true);
        let a = Arc::new(RecordingObserver::default());
        let b = Arc::new(RecordingObserver::default());
        allocator.add_observer(1, a.clone(), 100_000, 1_000_000, false, 0);
        allocator.add_observer(2, b.clone(), 100_000, 1_000_000, false, 0);
        allocator.on_network_changed(400_000, 0, 50);

        assert!(allocator.remove_observer(2));
        assert!(!allocator.remove_observer(2));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.last_allocation(1), Some(200_000));
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        struct OrderObserver {
            id: u32,
            log: Arc<Mutex<Vec<u32>>>,
        }
        impl BitrateObserver for OrderObserver {
            fn on_network_changed(&self, _: u32, _: u8, _: i64) {
                self.log.lock().unwrap().push(self.id);
            }
        }

        let allocator = allocator(true);
        let log = Arc::new(Mutex::new(Vec::new()));
        // Registered with descending max so the sorted traversal differs
        for (id, max) in [(1, 900_000), (2, 500_000), (3, 200_000)] {
            let observer = Arc::new(OrderObserver { id, log: log.clone() });
            allocator.add_observer(id, observer, 0, max, false, 0);
        }
        allocator.on_network_changed(1_000_000, 0, 0);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_observer_may_reenter_allocator() {
        struct Reentrant {
            allocator: Arc<BitrateAllocator>,
            seen: AtomicU32,
        }
        impl BitrateObserver for Reentrant {
            fn on_network_changed(&self, bitrate_bps: u32, _: u8, _: i64) {
                // Would deadlock if called under the lock
                let _ = self.allocator.min_max_sum();
                self.seen.store(bitrate_bps, Ordering::SeqCst);
            }
        }

        let allocator = Arc::new(BitrateAllocator::default());
        let observer = Arc::new(Reentrant {
            allocator: allocator.clone(),
            seen: AtomicU32::new(0),
        });
        allocator.add_observer(7, observer.clone(), 0, 300_000, false, 0);
        allocator.on_network_changed(250_000, 10, 20);
        assert_eq!(observer.seen.load(Ordering::SeqCst), 250_000);
        assert_eq!(
            allocator.network_state(),
            Some(NetworkState {
                target_bps: 250_000,
                fraction_loss: 10,
                rtt_ms: 20
            })
        );
    }

    #[test]
    fn test_excess_capped_at_max() {
        let allocator = allocator(true);
        let a = Arc::new(RecordingObserver::default());
        allocator.add_observer(1, a.clone(), 50_000, 300_000, false, 0);
        allocator.on_network_changed(5_000_000, 0, 0);
        assert_eq!(a.bitrate.load(Ordering::SeqCst), 300_000);
    }

    #[test]
    fn test_low_rate_pauses_later_observers() {
        let allocator = allocator(false);
        let a = Arc::new(RecordingObserver::default());
        let b = Arc::new(RecordingObserver::default());
        allocator.add_observer(1, a.clone(), 100_000, 500_000, false, 0);
        allocator.add_observer(2, b.clone(), 100_000, 500_000, false, 0);

        allocator.on_network_changed(150_000, 0, 0);
        assert_eq!(allocator.last_allocation(1), Some(100_000));
        assert_eq!(allocator.last_allocation(2), Some(0));
    }

    #[test]
    fn test_paused_observer_needs_hysteresis_to_resume() {
        let allocator = allocator(false);
        let a = Arc::new(RecordingObserver::default());
        allocator.add_observer(1, a, 100_000, 500_000, false, 0);
        let b = Arc::new(RecordingObserver::default());
        allocator.add_observer(2, b, 100_000, 500_000, false, 0);

        allocator.on_network_changed(150_000, 0, 0);
        assert_eq!(allocator.last_allocation(2), Some(0));

        // At target == sum_min A keeps 100k; B needs 100k + max(10k, 20k)
        allocator.on_network_changed(200_000, 0, 0);
        assert_eq!(allocator.last_allocation(2), Some(0));

        // Above sum_min everyone gets at least min
        allocator.on_network_changed(200_001, 0, 0);
        assert!(allocator.last_allocation(2).unwrap() >= 100_000);
    }

    #[test]
    fn test_min_max_sum() {
        let allocator = allocator(true);
        assert_eq!(allocator.min_max_sum(), (0, DEFAULT_MAX_BITRATE_BPS));

        allocator.add_observer(1, Arc::new(RecordingObserver::default()), 30_000, 300_000, false, 0);
        allocator.add_observer(2, Arc::new(RecordingObserver::default()), 50_000, 700_000, false, 0);
        assert_eq!(allocator.min_max_sum(), (80_000, 1_000_000));

        allocator.set_enforce_min_bitrate(false);
        assert_eq!(allocator.min_max_sum(), (10_000, 1_000_000));
    }

    #[test]
    fn test_no_observers() {
        let allocator = BitrateAllocator::default();
        allocator.on_network_changed(100_000, 0, 0);
        assert_eq!(allocator.observer_count(), 0);
        assert_eq!(allocator.last_allocation(1), None);
    }
}
