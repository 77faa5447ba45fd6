use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::attributes::KeyValue;
use crate::data::{self, Aggregation, Temporality};
use crate::exemplar::TraceContext;
use crate::metric_warn;

use super::aggregate::AttributeSetFilter;
use super::value_map::{Aggregator, ReservoirFactory, ValueMap};
use super::{ComputeAggregation, Measure, Number};

/// The tracker for a single gauge series: the most recently written value.
///
/// The mutex serializes racing writers; whoever acquires it last wins, so
/// "most recent" follows arrival order rather than cross-thread wall-clock
/// comparison. The timestamp is reporting data only.
struct Latest<T> {
    current: Mutex<(T, SystemTime)>,
}

impl<T: Number> Aggregator for Latest<T> {
    type InitConfig = ();
    type PreComputedValue = T;

    fn create(_init: &()) -> Self {
        Latest {
            current: Mutex::new((T::default(), SystemTime::now())),
        }
    }

    fn update(&self, value: T) {
        let mut guard = self.current.lock().unwrap_or_else(|err| err.into_inner());
        *guard = (value, SystemTime::now());
    }
}

/// Summarizes a set of measurements as the last one made.
pub(crate) struct LastValue<T: Number> {
    value_map: ValueMap<T, Latest<T>>,
    filter: AttributeSetFilter,
    temporality: Temporality,
    dropped_logged: AtomicBool,
}

impl<T: Number> LastValue<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        reservoirs: ReservoirFactory<T>,
        cardinality_limit: usize,
    ) -> Self {
        LastValue {
            value_map: ValueMap::new((), reservoirs, cardinality_limit),
            filter,
            temporality,
            dropped_logged: AtomicBool::new(false),
        }
    }
}

impl<T: Number> Measure<T> for LastValue<T> {
    fn call(&self, measurement: T, attrs: &[KeyValue], context: Option<&TraceContext>) {
        if measurement.into_float().is_nan() {
            if !self.dropped_logged.swap(true, Ordering::Relaxed) {
                metric_warn!(name: "InvalidGaugeMeasurement", message = "NaN measurement dropped");
            }
            return;
        }

        self.filter.apply(attrs, |filtered| {
            self.value_map
                .measure(measurement, measurement, filtered, attrs, context);
        });
    }
}

impl<T: Number> ComputeAggregation for LastValue<T> {
    fn call(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>) {
        self.dropped_logged.store(false, Ordering::Relaxed);

        let g_data = dest.and_then(|d| d.as_mut().downcast_mut::<data::Gauge<T>>());
        let mut new_agg = if g_data.is_none() {
            Some(data::Gauge {
                data_points: vec![],
            })
        } else {
            None
        };
        let g_data = g_data.unwrap_or_else(|| new_agg.as_mut().expect("present if g_data is none"));

        let map_fn = |attributes: Vec<KeyValue>, series: &super::value_map::Series<T, Latest<T>>| {
            let (value, time) = *series
                .tracker
                .current
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            let exemplars = series.reservoir.collect(&attributes);
            data::GaugeDataPoint {
                attributes,
                time,
                value,
                exemplars,
            }
        };

        // gauge points have no temporality of their own; the configured
        // temporality only decides whether series state is retained
        match self.temporality {
            Temporality::Delta => self
                .value_map
                .collect_and_reset(&mut g_data.data_points, map_fn),
            _ => self
                .value_map
                .collect_and_prune(&mut g_data.data_points, map_fn),
        }

        (
            g_data.data_points.len(),
            new_agg.map(|a| Box::new(a) as Box<_>),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::{ExemplarFilter, FilteredReservoir, FixedSizeReservoir};
    use std::sync::Arc;

    fn last_value_of(temporality: Temporality) -> LastValue<i64> {
        LastValue::new(
            temporality,
            AttributeSetFilter::new(None),
            Arc::new(|| {
                FilteredReservoir::new(
                    ExemplarFilter::AlwaysOff,
                    Box::new(FixedSizeReservoir::new(1)),
                )
            }),
            2000,
        )
    }

    fn collected_values(agg: &LastValue<i64>) -> Vec<i64> {
        let (_, data) = ComputeAggregation::call(agg, None);
        data.map(|data| {
            data.as_any()
                .downcast_ref::<data::Gauge<i64>>()
                .expect("gauge aggregation")
                .data_points
                .iter()
                .map(|dp| dp.value)
                .collect()
        })
        .unwrap_or_default()
    }

    #[test]
    fn last_write_wins() {
        let agg = last_value_of(Temporality::Cumulative);
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 10, &attrs, None);
        Measure::call(&agg, -3, &attrs, None);

        assert_eq!(collected_values(&agg), vec![-3]);
    }

    #[test]
    fn stale_series_not_reported_again() {
        let agg = last_value_of(Temporality::Cumulative);
        let attrs = [KeyValue::new("k", "v")];
        Measure::call(&agg, 1, &attrs, None);

        assert_eq!(collected_values(&agg), vec![1]);
        assert!(collected_values(&agg).is_empty());
    }
}
