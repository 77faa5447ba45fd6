use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::attributes::KeyValue;
use crate::data::Exemplar;
use crate::internal::Number;

use super::{Reservoir, ReservoirCell, TraceContext};

/// Source of uniform random indices for reservoir slot selection.
///
/// Injectable so sampling decisions can be scripted in tests.
pub(crate) trait RandomSource: Send + Sync {
    /// A uniform draw from `0..bound`. `bound` is at least 1.
    fn next_index(&self, bound: usize) -> usize;
}

struct ThreadLocalRandom;

impl RandomSource for ThreadLocalRandom {
    fn next_index(&self, bound: usize) -> usize {
        rand::rng().random_range(0..bound)
    }
}

/// A reservoir holding a uniform sample of the measurements offered since the
/// last collection.
///
/// Single-pass weighted reservoir sampling: the `i`-th offer (0-indexed) draws
/// `j` uniformly from `0..=i` and overwrites slot `j` when `j` is within the
/// reservoir. Early offers always land; later offers replace a uniformly
/// chosen slot with probability `k/(i+1)`.
pub(crate) struct FixedSizeReservoir<T> {
    cells: Vec<ReservoirCell<T>>,
    offered: AtomicUsize,
    random: Box<dyn RandomSource>,
}

impl<T: Number> FixedSizeReservoir<T> {
    pub(crate) fn new(size: usize) -> Self {
        Self::with_random_source(size, Box::new(ThreadLocalRandom))
    }

    pub(crate) fn with_random_source(size: usize, random: Box<dyn RandomSource>) -> Self {
        FixedSizeReservoir {
            cells: (0..size.max(1)).map(|_| ReservoirCell::new()).collect(),
            offered: AtomicUsize::new(0),
            random,
        }
    }
}

impl<T: Number> Reservoir<T> for FixedSizeReservoir<T> {
    fn offer(&self, value: T, attributes: &[KeyValue], context: Option<&TraceContext>) {
        let seen = self.offered.fetch_add(1, Ordering::Relaxed);
        let slot = self.random.next_index(seen.saturating_add(1));
        if slot < self.cells.len() {
            self.cells[slot].offer(value, attributes, context);
        }
    }

    fn collect(&self, series_attributes: &[KeyValue]) -> Vec<Exemplar<T>> {
        let exemplars = self
            .cells
            .iter()
            .filter_map(|cell| cell.collect(series_attributes))
            .collect();
        self.offered.store(0, Ordering::Relaxed);
        exemplars
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    struct ScriptedRandom(Mutex<VecDeque<usize>>);

    impl ScriptedRandom {
        fn new(draws: impl IntoIterator<Item = usize>) -> Self {
            ScriptedRandom(Mutex::new(draws.into_iter().collect()))
        }
    }

    impl RandomSource for ScriptedRandom {
        fn next_index(&self, _bound: usize) -> usize {
            self.0
                .lock()
                .expect("script lock")
                .pop_front()
                .expect("enough scripted draws")
        }
    }

    struct SeededRandom(Mutex<SmallRng>);

    impl RandomSource for SeededRandom {
        fn next_index(&self, bound: usize) -> usize {
            self.0.lock().expect("rng lock").random_range(0..bound)
        }
    }

    #[test]
    fn scripted_draws_decide_evictions() {
        // draws 0, 1, 0 for offers of 1, 2, 3 into two slots: value 1 lands in
        // slot 0, value 2 in slot 1, then value 3 evicts value 1.
        let reservoir =
            FixedSizeReservoir::with_random_source(2, Box::new(ScriptedRandom::new([0, 1, 0])));
        for value in [1u64, 2, 3] {
            reservoir.offer(value, &[], None);
        }

        let mut values: Vec<u64> = reservoir.collect(&[]).iter().map(|e| e.value).collect();
        values.sort_unstable();
        assert_eq!(values, vec![2, 3]);
    }

    #[test]
    fn collect_resets_the_sampling_epoch() {
        let reservoir =
            FixedSizeReservoir::with_random_source(2, Box::new(ScriptedRandom::new([0, 1, 0, 1])));
        reservoir.offer(1u64, &[], None);
        reservoir.offer(2u64, &[], None);
        assert_eq!(reservoir.collect(&[]).len(), 2);

        // the next offers see a fresh epoch and fill the reservoir again
        reservoir.offer(3u64, &[], None);
        reservoir.offer(4u64, &[], None);
        let mut values: Vec<u64> = reservoir.collect(&[]).iter().map(|e| e.value).collect();
        values.sort_unstable();
        assert_eq!(values, vec![3, 4]);
    }

    #[test]
    fn sampling_is_uniform_over_the_stream() {
        const STREAM: usize = 100;
        const SLOTS: usize = 10;
        const RUNS: usize = 2000;

        let mut selections: HashMap<u64, usize> = HashMap::new();
        for run in 0..RUNS {
            let reservoir = FixedSizeReservoir::with_random_source(
                SLOTS,
                Box::new(SeededRandom(Mutex::new(SmallRng::seed_from_u64(run as u64)))),
            );
            for value in 0..STREAM as u64 {
                reservoir.offer(value, &[], None);
            }
            for exemplar in reservoir.collect(&[]) {
                *selections.entry(exemplar.value).or_default() += 1;
            }
        }

        let total: usize = selections.values().sum();
        assert_eq!(total, RUNS * SLOTS);

        // every value should be kept with empirical probability close to
        // SLOTS/STREAM = 0.1, i.e. around 200 selections over 2000 runs
        let expected = RUNS * SLOTS / STREAM;
        for value in 0..STREAM as u64 {
            let count = selections.get(&value).copied().unwrap_or(0);
            assert!(
                count > expected / 2 && count < expected * 2,
                "value {value} selected {count} times, expected around {expected}"
            );
        }
    }
}
