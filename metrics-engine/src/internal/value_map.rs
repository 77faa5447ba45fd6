use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use once_cell::sync::Lazy;

use crate::attributes::{AttributeSet, KeyValue};
use crate::exemplar::{FilteredReservoir, TraceContext};
use crate::metric_warn;

use super::Number;

/// Measurements recorded once the cardinality limit is reached fold into a
/// series carrying only this marker attribute.
pub(crate) static OVERFLOW_ATTRIBUTES: Lazy<AttributeSet> =
    Lazy::new(|| AttributeSet::from(&[KeyValue::new("metric.overflow", true)][..]));

/// Per-series kernel state.
///
/// Implementations must be internally thread-safe; `update` races freely with
/// other updates. A tracker is only read during collection, while the owning
/// [ValueMap] holds its write lock.
pub(crate) trait Aggregator: Send + Sync + 'static {
    /// Configuration fixed at creation, e.g. the bucket count.
    type InitConfig: Send + Sync;

    /// The value laid down per measurement, e.g. the value plus its bucket index.
    type PreComputedValue;

    /// Called when a series is first observed.
    fn create(init: &Self::InitConfig) -> Self;

    /// Called for every valid measurement on the series.
    fn update(&self, value: Self::PreComputedValue);
}

/// One live series: the kernel tracker, its exemplar reservoir, an activity
/// flag for cold-series eviction, and the time the series was first observed.
pub(crate) struct Series<T, A> {
    pub(crate) tracker: A,
    pub(crate) reservoir: FilteredReservoir<T>,
    pub(crate) start: SystemTime,
    active: AtomicBool,
}

impl<T: Number, A: Aggregator> Series<T, A> {
    fn record(
        &self,
        value: A::PreComputedValue,
        raw: T,
        exemplar_attrs: &[KeyValue],
        context: Option<&TraceContext>,
    ) {
        self.tracker.update(value);
        self.reservoir.offer(raw, exemplar_attrs, context);
        self.active.store(true, Ordering::Release);
    }
}

pub(crate) type ReservoirFactory<T> = Arc<dyn Fn() -> FilteredReservoir<T> + Send + Sync>;

/// The concurrent map from attribute set to live series for one instrument.
///
/// Writers take the read lock and update trackers in place; a missing series
/// is inserted under the write lock with a re-check. Collection holds the
/// write lock for the duration of the snapshot, so a concurrent recording
/// serializes to either side of it: it is visible to this collection or the
/// next one, never neither and never both.
pub(crate) struct ValueMap<T: Number, A: Aggregator> {
    series: RwLock<HashMap<AttributeSet, Arc<Series<T, A>>>>,
    config: A::InitConfig,
    new_reservoir: ReservoirFactory<T>,
    cardinality_limit: usize,
    overflow_logged: AtomicBool,
}

impl<T: Number, A: Aggregator> ValueMap<T, A> {
    pub(crate) fn new(
        config: A::InitConfig,
        new_reservoir: ReservoirFactory<T>,
        cardinality_limit: usize,
    ) -> Self {
        ValueMap {
            series: RwLock::new(HashMap::default()),
            config,
            new_reservoir,
            cardinality_limit,
            overflow_logged: AtomicBool::new(false),
        }
    }

    /// Routes one measurement to its series, creating the series on first use.
    ///
    /// `series_attrs` identify the series (already view-filtered);
    /// `exemplar_attrs` are the attributes as recorded, offered to the
    /// reservoir so attributes dropped from the series key survive on
    /// exemplars.
    pub(crate) fn measure(
        &self,
        precomputed: A::PreComputedValue,
        raw: T,
        series_attrs: &[KeyValue],
        exemplar_attrs: &[KeyValue],
        context: Option<&TraceContext>,
    ) {
        let key = AttributeSet::from(series_attrs);

        let Ok(map) = self.series.read() else { return };
        if let Some(series) = map.get(&key) {
            series.record(precomputed, raw, exemplar_attrs, context);
            return;
        }
        drop(map);

        let Ok(mut map) = self.series.write() else {
            return;
        };
        // Re-check in case another writer inserted while the read lock was
        // released.
        if let Some(series) = map.get(&key) {
            series.record(precomputed, raw, exemplar_attrs, context);
        } else if map.len() < self.cardinality_limit {
            let series = self.new_series();
            series.record(precomputed, raw, exemplar_attrs, context);
            map.insert(key, series);
        } else {
            let series = map
                .entry(OVERFLOW_ATTRIBUTES.clone())
                .or_insert_with(|| self.new_series());
            series.record(precomputed, raw, exemplar_attrs, context);
            if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                metric_warn!(
                    name: "MetricCardinalityLimitReached",
                    limit = self.cardinality_limit,
                );
            }
        }
    }

    fn new_series(&self) -> Arc<Series<T, A>> {
        Arc::new(Series {
            tracker: A::create(&self.config),
            reservoir: (self.new_reservoir)(),
            start: SystemTime::now(),
            active: AtomicBool::new(false),
        })
    }

    /// Drains every series into `dest`, resetting the map for the next cycle.
    pub(crate) fn collect_and_reset<Res, MapFn>(&self, dest: &mut Vec<Res>, mut map_fn: MapFn)
    where
        MapFn: FnMut(Vec<KeyValue>, &Series<T, A>) -> Res,
    {
        let Ok(mut map) = self.series.write() else {
            return;
        };
        prepare_data(dest, map.len());
        for (attrs, series) in map.drain() {
            dest.push(map_fn(attrs.into_inner(), &series));
        }
    }

    /// Emits every series that recorded since the previous cycle and evicts
    /// the rest. Kernel state of surviving series is untouched.
    pub(crate) fn collect_and_prune<Res, MapFn>(&self, dest: &mut Vec<Res>, mut map_fn: MapFn)
    where
        MapFn: FnMut(Vec<KeyValue>, &Series<T, A>) -> Res,
    {
        let Ok(mut map) = self.series.write() else {
            return;
        };
        prepare_data(dest, map.len());
        map.retain(|attrs, series| {
            let touched = series.active.swap(false, Ordering::AcqRel);
            if touched {
                dest.push(map_fn(attrs.to_vec(), series));
            }
            touched
        });
    }
}

/// Clear and allocate exactly the required amount of space for all series.
fn prepare_data<T>(data: &mut Vec<T>, map_len: usize) {
    data.clear();
    if map_len > data.capacity() {
        data.reserve_exact(map_len - data.capacity());
    }
}
