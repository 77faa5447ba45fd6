use std::sync::atomic::{AtomicBool, Ordering};

use crate::attributes::KeyValue;
use crate::data::{self, Aggregation, Temporality};
use crate::exemplar::TraceContext;
use crate::metric_warn;

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::value_map::{Aggregator, ReservoirFactory, ValueMap};
use super::{AtomicValue, ComputeAggregation, Measure, Number};

/// The tracker for a single sum series: a thread-safe running total.
struct Increment<T: Number> {
    total: T::AtomicValue,
}

impl<T: Number> Aggregator for Increment<T> {
    type InitConfig = ();
    type PreComputedValue = T;

    fn create(_init: &()) -> Self {
        Increment {
            total: T::new_atomic(),
        }
    }

    fn update(&self, value: T) {
        self.total.add(value)
    }
}

/// Summarizes a set of measurements made as their arithmetic sum.
pub(crate) struct Sum<T: Number> {
    value_map: ValueMap<T, Increment<T>>,
    init_time: AggregateTimeInitiator,
    filter: AttributeSetFilter,
    temporality: Temporality,
    monotonic: bool,
    dropped_logged: AtomicBool,
}

impl<T: Number> Sum<T> {
    /// Returns an aggregator that summarizes a set of measurements as their
    /// arithmetic sum.
    ///
    /// Each sum is scoped by attributes and the aggregation cycle the measurements
    /// were made in.
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        monotonic: bool,
        reservoirs: ReservoirFactory<T>,
        cardinality_limit: usize,
    ) -> Self {
        Sum {
            value_map: ValueMap::new((), reservoirs, cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            filter,
            temporality,
            monotonic,
            dropped_logged: AtomicBool::new(false),
        }
    }

    fn delta(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>) {
        let time = self.init_time.delta();

        let s_data = dest.and_then(|d| d.as_mut().downcast_mut::<data::Sum<T>>());
        let mut new_agg = if s_data.is_none() {
            Some(data::Sum {
                data_points: vec![],
                temporality: Temporality::Delta,
                is_monotonic: self.monotonic,
            })
        } else {
            None
        };
        let s_data = s_data.unwrap_or_else(|| new_agg.as_mut().expect("present if s_data is none"));
        s_data.temporality = Temporality::Delta;
        s_data.is_monotonic = self.monotonic;

        self.value_map
            .collect_and_reset(&mut s_data.data_points, |attributes, series| {
                let exemplars = series.reservoir.collect(&attributes);
                data::SumDataPoint {
                    value: series.tracker.total.get_value(false),
                    start_time: time.start,
                    time: time.current,
                    attributes,
                    exemplars,
                }
            });

        (
            s_data.data_points.len(),
            new_agg.map(|a| Box::new(a) as Box<_>),
        )
    }

    fn cumulative(
        &self,
        dest: Option<&mut dyn Aggregation>,
    ) -> (usize, Option<Box<dyn Aggregation>>) {
        let time = self.init_time.cumulative();

        let s_data = dest.and_then(|d| d.as_mut().downcast_mut::<data::Sum<T>>());
        let mut new_agg = if s_data.is_none() {
            Some(data::Sum {
                data_points: vec![],
                temporality: Temporality::Cumulative,
                is_monotonic: self.monotonic,
            })
        } else {
            None
        };
        let s_data = s_data.unwrap_or_else(|| new_agg.as_mut().expect("present if s_data is none"));
        s_data.temporality = Temporality::Cumulative;
        s_data.is_monotonic = self.monotonic;

        self.value_map
            .collect_and_prune(&mut s_data.data_points, |attributes, series| {
                let exemplars = series.reservoir.collect(&attributes);
                data::SumDataPoint {
                    value: series.tracker.total.get_value(false),
                    start_time: series.start,
                    time: time.current,
                    attributes,
                    exemplars,
                }
            });

        (
            s_data.data_points.len(),
            new_agg.map(|a| Box::new(a) as Box<_>),
        )
    }

    fn report_dropped(&self, value: T) {
        if !self.dropped_logged.swap(true, Ordering::Relaxed) {
            metric_warn!(
                name: "InvalidSumMeasurement",
                message = "NaN or negative-monotonic measurement dropped",
                value = format!("{value:?}"),
            );
        }
    }
}

impl<T: Number> Measure<T> for Sum<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue], context: Option<&TraceContext>) {
        let f = measurement.into_float();
        if f.is_nan() || (self.monotonic && f < 0.0) {
            self.report_dropped(measurement);
            return;
        }

        self.filter.apply(attrs, |filtered| {
            self.value_map
                .measure(measurement, measurement, filtered, attrs, context);
        });
    }
}

impl<T: Number> ComputeAggregation for Sum<T> {
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
    use crate::exemplar::ExemplarFilter;
    use crate::exemplar::FixedSizeReservoir;
    use crate::exemplar::FilteredReservoir;
    use std::sync::Arc;

    fn sum_of(temporality: Temporality, monotonic: bool) -> Sum<u64> {
        Sum::new(
            temporality,
            AttributeSetFilter::new(None),
            monotonic,
            Arc::new(|| {
                FilteredReservoir::new(
                    ExemplarFilter::AlwaysOff,
                    Box::new(FixedSizeReservoir::new(1)),
                )
            }),
            2000,
        )
    }

    fn collected_values(agg: &Sum<u64>) -> Vec<u64> {
        let (_, data) = ComputeAggregation::call(agg, None);
        let data = data.expect("no destination passed");
        let sum = data
            .as_any()
            .downcast_ref::<data::Sum<u64>>()
            .expect("sum aggregation");
        sum.data_points.iter().map(|dp| dp.value).collect()
    }

    #[test]
    fn delta_reports_each_interval_separately() {
        let agg = sum_of(Temporality::Delta, true);
        let attrs = [KeyValue::new("k", "v")];

        Measure::call(&agg, 3, &attrs, None);
        assert_eq!(collected_values(&agg), vec![3]);

        Measure::call(&agg, 4, &attrs, None);
        assert_eq!(collected_values(&agg), vec![4]);
    }

    #[test]
    fn cumulative_keeps_accumulating() {
        let agg = sum_of(Temporality::Cumulative, true);
        let attrs = [KeyValue::new("k", "v")];

        Measure::call(&agg, 3, &attrs, None);
        assert_eq!(collected_values(&agg), vec![3]);

        Measure::call(&agg, 4, &attrs, None);
        assert_eq!(collected_values(&agg), vec![7]);
    }

    #[test]
    fn negative_monotonic_measurements_are_dropped() {
        let agg = Sum::<f64>::new(
            Temporality::Cumulative,
            AttributeSetFilter::new(None),
            true,
            Arc::new(|| {
                FilteredReservoir::new(
                    ExemplarFilter::AlwaysOff,
                    Box::new(FixedSizeReservoir::new(1)),
                )
            }),
            2000,
        );
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 5.0, &attrs, None);
        Measure::call(&agg, -2.0, &attrs, None);
        Measure::call(&agg, f64::NAN, &attrs, None);

        let (_, data) = ComputeAggregation::call(&agg, None);
        let data = data.expect("no destination passed");
        let sum = data
            .as_any()
            .downcast_ref::<data::Sum<f64>>()
            .expect("sum aggregation");
        assert_eq!(sum.data_points.len(), 1);
        assert!((sum.data_points[0].value - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn non_monotonic_sum_accepts_negative_values() {
        let agg = Sum::<i64>::new(
            Temporality::Cumulative,
            AttributeSetFilter::new(None),
            false,
            Arc::new(|| {
                FilteredReservoir::new(
                    ExemplarFilter::AlwaysOff,
                    Box::new(FixedSizeReservoir::new(1)),
                )
            }),
            2000,
        );
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 5, &attrs, None);
        Measure::call(&agg, -2, &attrs, None);

        let (_, data) = ComputeAggregation::call(&agg, None);
        let data = data.expect("no destination passed");
        let sum = data
            .as_any()
            .downcast_ref::<data::Sum<i64>>()
            .expect("sum aggregation");
        assert_eq!(sum.data_points[0].value, 3);
    }
}
