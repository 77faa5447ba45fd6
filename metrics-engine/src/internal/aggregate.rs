use std::{
    marker,
    mem::replace,
    num::NonZeroUsize,
    ops::DerefMut,
    sync::{Arc, Mutex},
    thread,
    time::SystemTime,
};

use crate::attributes::KeyValue;
use crate::data::{Aggregation, Temporality};
use crate::exemplar::{
    ExemplarFilter, FilteredReservoir, FixedSizeReservoir, HistogramReservoir, TraceContext,
};

use super::exponential_histogram::ExpoHistogram;
use super::histogram::Histogram;
use super::last_value::LastValue;
use super::sum::Sum;
use super::value_map::ReservoirFactory;
use super::Number;

/// Streams with more attribute sets than this fold the excess into an
/// overflow series unless the stream configures its own limit.
pub(crate) const DEFAULT_CARDINALITY_LIMIT: usize = 2000;

/// Receives measurements to be aggregated.
pub(crate) trait Measure<T>: Send + Sync + 'static {
    fn call(&self, measurement: T, attrs: &[KeyValue], context: Option<&TraceContext>);
}

/// Stores the aggregate of measurements into the aggregation and returns the number
/// of aggregate data-points output.
pub(crate) trait ComputeAggregation: Send + Sync + 'static {
    /// Compute the new aggregation and store in `dest`.
    ///
    /// If no initial aggregation exists, `dest` will be `None`, in which case the
    /// returned option is expected to contain a new aggregation with the data from
    /// the current collection cycle.
    fn call(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>);
}

/// Separate `measure` and `collect` functions for an aggregate.
pub(crate) struct AggregateFns<T> {
    pub(crate) measure: Arc<dyn Measure<T>>,
    pub(crate) collect: Arc<dyn ComputeAggregation>,
}

/// Creates aggregate functions out of an aggregate instance.
impl<A, T> From<A> for AggregateFns<T>
where
    A: Measure<T> + ComputeAggregation,
{
    fn from(value: A) -> Self {
        let inst = Arc::new(value);
        Self {
            measure: inst.clone(),
            collect: inst,
        }
    }
}

pub(crate) struct AggregateTime {
    pub start: SystemTime,
    pub current: SystemTime,
}

/// Initialized [`AggregateTime`] for a specific [`Temporality`].
pub(crate) struct AggregateTimeInitiator(Mutex<SystemTime>);

impl AggregateTimeInitiator {
    pub(crate) fn delta(&self) -> AggregateTime {
        let current_time = SystemTime::now();
        let start_time = self
            .0
            .lock()
            .map(|mut start| replace(start.deref_mut(), current_time))
            .unwrap_or(current_time);
        AggregateTime {
            start: start_time,
            current: current_time,
        }
    }

    pub(crate) fn cumulative(&self) -> AggregateTime {
        let current_time = SystemTime::now();
        let start_time = self.0.lock().map(|start| *start).unwrap_or(current_time);
        AggregateTime {
            start: start_time,
            current: current_time,
        }
    }
}

impl Default for AggregateTimeInitiator {
    fn default() -> Self {
        Self(Mutex::new(SystemTime::now()))
    }
}

pub(crate) type Filter = Arc<dyn Fn(&KeyValue) -> bool + Send + Sync>;

/// Applies a view's attribute filter to the series key of each measurement.
/// No-op if no filter is set.
#[derive(Clone)]
pub(crate) struct AttributeSetFilter {
    filter: Option<Filter>,
}

impl AttributeSetFilter {
    pub(crate) fn new(filter: Option<Filter>) -> Self {
        Self { filter }
    }

    pub(crate) fn apply(&self, attrs: &[KeyValue], run: impl FnOnce(&[KeyValue])) {
        if let Some(filter) = &self.filter {
            let filtered_attrs: Vec<KeyValue> =
                attrs.iter().filter(|kv| filter(kv)).cloned().collect();
            run(&filtered_attrs);
        } else {
            run(attrs);
        };
    }
}

/// Builds aggregate functions.
pub(crate) struct AggregateBuilder<T> {
    /// The temporality used for the returned aggregate functions.
    temporality: Temporality,

    /// The attribute filter the aggregate function will use on the input of
    /// measurements.
    filter: AttributeSetFilter,

    /// The sampling policy applied ahead of every exemplar reservoir.
    exemplar_filter: ExemplarFilter,

    /// Maximum live series per stream before overflow.
    cardinality_limit: usize,

    _marker: marker::PhantomData<T>,
}

impl<T: Number> AggregateBuilder<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: Option<Filter>,
        exemplar_filter: ExemplarFilter,
        cardinality_limit: usize,
    ) -> Self {
        AggregateBuilder {
            temporality,
            filter: AttributeSetFilter::new(filter),
            exemplar_filter,
            cardinality_limit,
            _marker: marker::PhantomData,
        }
    }

    fn fixed_size_reservoirs(&self) -> ReservoirFactory<T> {
        let filter = self.exemplar_filter;
        let size = default_reservoir_size();
        Arc::new(move || {
            FilteredReservoir::new(filter, Box::new(FixedSizeReservoir::new(size)))
        })
    }

    fn bucket_reservoirs(&self, bounds: &[f64]) -> ReservoirFactory<T> {
        let filter = self.exemplar_filter;
        let bounds = bounds.to_vec();
        Arc::new(move || {
            FilteredReservoir::new(filter, Box::new(HistogramReservoir::new(bounds.clone())))
        })
    }

    /// Builds a last-value aggregate function input and output.
    pub(crate) fn last_value(&self) -> AggregateFns<T> {
        LastValue::new(
            self.temporality,
            self.filter.clone(),
            self.fixed_size_reservoirs(),
            self.cardinality_limit,
        )
        .into()
    }

    /// Builds a sum aggregate function input and output.
    pub(crate) fn sum(&self, monotonic: bool) -> AggregateFns<T> {
        Sum::new(
            self.temporality,
            self.filter.clone(),
            monotonic,
            self.fixed_size_reservoirs(),
            self.cardinality_limit,
        )
        .into()
    }

    /// Builds a histogram aggregate function input and output.
    pub(crate) fn explicit_bucket_histogram(
        &self,
        boundaries: Vec<f64>,
        record_min_max: bool,
        record_sum: bool,
    ) -> AggregateFns<T> {
        let reservoirs = self.bucket_reservoirs(&boundaries);
        Histogram::new(
            self.temporality,
            self.filter.clone(),
            boundaries,
            record_min_max,
            record_sum,
            reservoirs,
            self.cardinality_limit,
        )
        .into()
    }

    /// Builds an exponential histogram aggregate function input and output.
    pub(crate) fn exponential_bucket_histogram(
        &self,
        max_size: u32,
        max_scale: i8,
        record_min_max: bool,
        record_sum: bool,
    ) -> AggregateFns<T> {
        ExpoHistogram::new(
            self.temporality,
            self.filter.clone(),
            max_size,
            max_scale,
            record_min_max,
            record_sum,
            self.bucket_reservoirs(&[]),
            self.cardinality_limit,
        )
        .into()
    }
}

/// Default slot count for fixed-size reservoirs: one per hardware thread.
fn default_reservoir_size() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_filter_drops_unlisted_keys() {
        let filter =
            AttributeSetFilter::new(Some(Arc::new(|kv: &KeyValue| kv.key.as_str() == "keep")));
        let attrs = [KeyValue::new("keep", 1), KeyValue::new("drop", 2)];
        filter.apply(&attrs, |filtered| {
            assert_eq!(filtered, &[KeyValue::new("keep", 1)]);
        });
    }

    #[test]
    fn no_filter_passes_attributes_through() {
        let filter = AttributeSetFilter::new(None);
        let attrs = [KeyValue::new("a", 1)];
        filter.apply(&attrs, |filtered| assert_eq!(filtered, &attrs));
    }

    #[test]
    fn delta_time_advances_each_cycle() {
        let init = AggregateTimeInitiator::default();
        let first = init.delta();
        let second = init.delta();
        assert_eq!(first.current, second.start);
    }

    #[test]
    fn cumulative_time_keeps_its_start() {
        let init = AggregateTimeInitiator::default();
        let first = init.cumulative();
        let second = init.cumulative();
        assert_eq!(first.start, second.start);
    }
}
