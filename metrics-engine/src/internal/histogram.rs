use std::mem::replace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::attributes::KeyValue;
use crate::data::{self, Aggregation, Temporality};
use crate::exemplar::TraceContext;
use crate::metric_warn;

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::value_map::{Aggregator, ReservoirFactory, ValueMap};
use super::{ComputeAggregation, Measure, Number};

/// The tracker for a single explicit-bucket histogram series.
struct BucketTracker<T> {
    buckets: Mutex<Buckets<T>>,
}

impl<T: Number> Aggregator for BucketTracker<T> {
    type InitConfig = usize;
    /// Value and bucket index.
    type PreComputedValue = (T, usize);

    fn create(count: &usize) -> Self {
        BucketTracker {
            buckets: Mutex::new(Buckets::new(*count)),
        }
    }

    fn update(&self, (value, index): (T, usize)) {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        buckets.bin(index, value);
        buckets.sum(value);
    }
}

#[derive(Default)]
struct Buckets<T> {
    counts: Vec<u64>,
    count: u64,
    total: T,
    min: T,
    max: T,
}

impl<T: Number> Buckets<T> {
    /// returns buckets with `n` bins.
    fn new(n: usize) -> Buckets<T> {
        Buckets {
            counts: vec![0; n],
            min: T::max(),
            max: T::min(),
            ..Default::default()
        }
    }

    fn sum(&mut self, value: T) {
        self.total += value;
    }

    fn bin(&mut self, idx: usize, value: T) {
        self.counts[idx] += 1;
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value
        }
    }
}

/// Summarizes a set of measurements as a histogram with explicitly defined
/// buckets.
pub(crate) struct Histogram<T: Number> {
    value_map: ValueMap<T, BucketTracker<T>>,
    init_time: AggregateTimeInitiator,
    filter: AttributeSetFilter,
    temporality: Temporality,
    bounds: Vec<f64>,
    record_min_max: bool,
    record_sum: bool,
    dropped_logged: AtomicBool,
}

impl<T: Number> Histogram<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        mut boundaries: Vec<f64>,
        record_min_max: bool,
        record_sum: bool,
        reservoirs: ReservoirFactory<T>,
        cardinality_limit: usize,
    ) -> Self {
        boundaries.retain(|v| !v.is_nan());
        boundaries.sort_by(|a, b| a.partial_cmp(b).expect("NaNs filtered out"));
        let buckets_count = boundaries.len() + 1;

        Histogram {
            value_map: ValueMap::new(buckets_count, reservoirs, cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            filter,
            temporality,
            bounds: boundaries,
            record_min_max,
            record_sum,
            dropped_logged: AtomicBool::new(false),
        }
    }

    fn delta(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>) {
        let time = self.init_time.delta();

        let h = dest.and_then(|d| d.as_mut().downcast_mut::<data::Histogram<T>>());
        let mut new_agg = if h.is_none() {
            Some(data::Histogram {
                data_points: vec![],
                temporality: Temporality::Delta,
            })
        } else {
            None
        };
        let h = h.unwrap_or_else(|| new_agg.as_mut().expect("present if h is none"));
        h.temporality = Temporality::Delta;

        self.value_map
            .collect_and_reset(&mut h.data_points, |attributes, series| {
                let b = {
                    let mut guard = series
                        .tracker
                        .buckets
                        .lock()
                        .unwrap_or_else(|err| err.into_inner());
                    replace(&mut *guard, Buckets::new(self.bounds.len() + 1))
                };
                let exemplars = series.reservoir.collect(&attributes);
                data::HistogramDataPoint {
                    attributes,
                    start_time: time.start,
                    time: time.current,
                    count: b.count,
                    bounds: self.bounds.clone(),
                    bucket_counts: b.counts,
                    sum: if self.record_sum { b.total } else { T::default() },
                    min: if self.record_min_max {
                        Some(b.min)
                    } else {
                        None
                    },
                    max: if self.record_min_max {
                        Some(b.max)
                    } else {
                        None
                    },
                    exemplars,
                }
            });

        (h.data_points.len(), new_agg.map(|a| Box::new(a) as Box<_>))
    }

    fn cumulative(
        &self,
        dest: Option<&mut dyn Aggregation>,
    ) -> (usize, Option<Box<dyn Aggregation>>) {
        let time = self.init_time.cumulative();

        let h = dest.and_then(|d| d.as_mut().downcast_mut::<data::Histogram<T>>());
        let mut new_agg = if h.is_none() {
            Some(data::Histogram {
                data_points: vec![],
                temporality: Temporality::Cumulative,
            })
        } else {
            None
        };
        let h = h.unwrap_or_else(|| new_agg.as_mut().expect("present if h is none"));
        h.temporality = Temporality::Cumulative;

        self.value_map
            .collect_and_prune(&mut h.data_points, |attributes, series| {
                let guard = series
                    .tracker
                    .buckets
                    .lock()
                    .unwrap_or_else(|err| err.into_inner());
                let exemplars = series.reservoir.collect(&attributes);
                data::HistogramDataPoint {
                    attributes,
                    start_time: series.start,
                    time: time.current,
                    count: guard.count,
                    bounds: self.bounds.clone(),
                    bucket_counts: guard.counts.clone(),
                    sum: if self.record_sum {
                        guard.total
                    } else {
                        T::default()
                    },
                    min: if self.record_min_max {
                        Some(guard.min)
                    } else {
                        None
                    },
                    max: if self.record_min_max {
                        Some(guard.max)
                    } else {
                        None
                    },
                    exemplars,
                }
            });

        (h.data_points.len(), new_agg.map(|a| Box::new(a) as Box<_>))
    }
}

impl<T: Number> Measure<T> for Histogram<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue], context: Option<&TraceContext>) {
        let f = measurement.into_float();
        if f.is_nan() || f.is_infinite() {
            if !self.dropped_logged.swap(true, Ordering::Relaxed) {
                metric_warn!(
                    name: "InvalidHistogramMeasurement",
                    message = "NaN or infinite measurement dropped",
                );
            }
            return;
        }
        // This search will return an index in the range `[0, bounds.len()]`, where
        // it will return `bounds.len()` if value is greater than the last element
        // of `bounds`. This aligns with the buckets in that the length of buckets
        // is `bounds.len()+1`, with the last bucket representing:
        // `(bounds[bounds.len()-1], +∞)`.
        let index = self.bounds.partition_point(|&x| x < f);

        self.filter.apply(attrs, |filtered| {
            self.value_map
                .measure((measurement, index), measurement, filtered, attrs, context);
        });
    }
}

impl<T: Number> ComputeAggregation for Histogram<T> {
    fn call(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>) {
        self.dropped_logged.store(false, Ordering::Relaxed);
        match self.temporality {
            Temporality::Delta => self.delta(dest),
            _ => self.cumulative(dest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::{ExemplarFilter, FilteredReservoir, HistogramReservoir};
    use std::sync::Arc;

    fn histogram_of(temporality: Temporality, bounds: Vec<f64>) -> Histogram<f64> {
        let reservoir_bounds = bounds.clone();
        Histogram::new(
            temporality,
            AttributeSetFilter::new(None),
            bounds,
            true,
            true,
            Arc::new(move || {
                FilteredReservoir::new(
                    ExemplarFilter::AlwaysOff,
                    Box::new(HistogramReservoir::new(reservoir_bounds.clone())),
                )
            }),
            2000,
        )
    }

    fn collected(agg: &Histogram<f64>) -> data::Histogram<f64> {
        let (_, data) = ComputeAggregation::call(agg, None);
        let data = data.expect("no destination passed");
        data.as_any()
            .downcast_ref::<data::Histogram<f64>>()
            .expect("histogram aggregation")
            .clone()
    }

    #[test]
    fn values_land_in_their_buckets() {
        let agg = histogram_of(Temporality::Cumulative, vec![0.0, 10.0, 20.0]);
        let attrs = [KeyValue::new("k", "v")];
        for value in [-1.0, 1.0, 10.0, 11.0, 21.0] {
            Measure::call(&agg, value, &attrs, None);
        }

        let h = collected(&agg);
        assert_eq!(h.data_points.len(), 1);
        let dp = &h.data_points[0];
        // a value equal to a boundary belongs to that boundary's bucket
        assert_eq!(dp.bucket_counts, vec![1, 2, 1, 1]);
        assert_eq!(dp.count, 5);
        assert_eq!(dp.min, Some(-1.0));
        assert_eq!(dp.max, Some(21.0));
        assert!((dp.sum - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn nan_and_infinite_measurements_ignored() {
        let agg = histogram_of(Temporality::Cumulative, vec![1.0]);
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 2.0, &attrs, None);
        Measure::call(&agg, f64::NAN, &attrs, None);
        Measure::call(&agg, f64::INFINITY, &attrs, None);

        let h = collected(&agg);
        assert_eq!(h.data_points[0].count, 1);
    }

    #[test]
    fn delta_resets_bucket_state() {
        let agg = histogram_of(Temporality::Delta, vec![10.0]);
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 5.0, &attrs, None);
        assert_eq!(collected(&agg).data_points[0].count, 1);

        Measure::call(&agg, 5.0, &attrs, None);
        let h = collected(&agg);
        assert_eq!(h.data_points[0].count, 1);
        assert_eq!(h.data_points[0].bucket_counts, vec![1, 0]);
    }

    #[test]
    fn unsorted_boundaries_are_sorted_at_construction() {
        let agg = histogram_of(Temporality::Cumulative, vec![20.0, 0.0, 10.0]);
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 15.0, &attrs, None);

        let h = collected(&agg);
        assert_eq!(h.data_points[0].bounds, vec![0.0, 10.0, 20.0]);
        assert_eq!(h.data_points[0].bucket_counts, vec![0, 0, 1, 0]);
    }
}
