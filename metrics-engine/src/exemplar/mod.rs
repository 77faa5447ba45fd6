//! Bounded sampling of raw measurements alongside their aggregates.
//!
//! Every recording is offered to the reservoir of its series before
//! aggregation. What the reservoir keeps depends on the strategy: a fixed
//! number of uniformly sampled measurements for sums and gauges, or the most
//! recent measurement per bucket for histograms. Collection drains the
//! reservoir and starts a new sampling epoch.

use std::sync::Mutex;
use std::time::SystemTime;

use crate::attributes::KeyValue;
use crate::data::Exemplar;

mod filter;
mod fixed_size;
mod histogram;

pub use filter::ExemplarFilter;
pub(crate) use fixed_size::FixedSizeReservoir;
pub(crate) use histogram::HistogramReservoir;

/// The trace state active while a measurement was recorded.
///
/// The engine never inspects trace data beyond this: the ids are copied into
/// collected exemplars and `sampled` feeds the [ExemplarFilter].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// The ID of the trace the active span belongs to.
    pub trace_id: [u8; 16],
    /// The ID of the active span.
    pub span_id: [u8; 8],
    /// Whether the active trace was chosen for sampling.
    pub sampled: bool,
}

/// A bounded store of candidate exemplars for one series.
pub(crate) trait Reservoir<T>: Send + Sync {
    /// Offer a measurement for sampling. Must be cheap; called on the hot path.
    fn offer(&self, value: T, attributes: &[KeyValue], context: Option<&TraceContext>);

    /// Returns the held exemplars and resets sampling state for a new epoch.
    ///
    /// `series_attributes` are the attributes that already identify the
    /// series; collected exemplars only carry attributes outside that set.
    fn collect(&self, series_attributes: &[KeyValue]) -> Vec<Exemplar<T>>;
}

/// Applies the configured [ExemplarFilter] before forwarding to a reservoir.
pub(crate) struct FilteredReservoir<T> {
    filter: ExemplarFilter,
    inner: Box<dyn Reservoir<T>>,
}

impl<T> FilteredReservoir<T> {
    pub(crate) fn new(filter: ExemplarFilter, inner: Box<dyn Reservoir<T>>) -> Self {
        FilteredReservoir { filter, inner }
    }

    pub(crate) fn offer(&self, value: T, attributes: &[KeyValue], context: Option<&TraceContext>) {
        if self.filter.should_sample(context) {
            self.inner.offer(value, attributes, context);
        }
    }

    pub(crate) fn collect(&self, series_attributes: &[KeyValue]) -> Vec<Exemplar<T>> {
        self.inner.collect(series_attributes)
    }
}

/// One slot of a reservoir, holding at most one sampled measurement.
pub(crate) struct ReservoirCell<T> {
    slot: Mutex<Option<SampledMeasurement<T>>>,
}

struct SampledMeasurement<T> {
    value: T,
    time: SystemTime,
    attributes: Vec<KeyValue>,
    trace: Option<TraceContext>,
}

impl<T: Copy> ReservoirCell<T> {
    pub(crate) fn new() -> Self {
        ReservoirCell {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn offer(&self, value: T, attributes: &[KeyValue], context: Option<&TraceContext>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(SampledMeasurement {
                value,
                time: SystemTime::now(),
                attributes: attributes.to_vec(),
                trace: context.copied(),
            });
        }
    }

    pub(crate) fn collect(&self, series_attributes: &[KeyValue]) -> Option<Exemplar<T>> {
        let mut slot = self.slot.lock().ok()?;
        let taken = slot.take()?;
        Some(Exemplar {
            filtered_attributes: taken
                .attributes
                .into_iter()
                .filter(|kv| !series_attributes.iter().any(|s| s.key == kv.key))
                .collect(),
            time: taken.time,
            value: taken.value,
            span_id: taken.trace.map(|t| t.span_id).unwrap_or([0; 8]),
            trace_id: taken.trace.map(|t| t.trace_id).unwrap_or([0; 16]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_filters_series_attributes_out_of_exemplar() {
        let cell = ReservoirCell::new();
        cell.offer(
            7u64,
            &[KeyValue::new("series", "a"), KeyValue::new("extra", "b")],
            None,
        );

        let exemplar = cell
            .collect(&[KeyValue::new("series", "a")])
            .expect("one sampled measurement");
        assert_eq!(exemplar.value, 7);
        assert_eq!(
            exemplar.filtered_attributes,
            vec![KeyValue::new("extra", "b")]
        );
        assert_eq!(exemplar.trace_id, [0; 16]);

        // collect starts a new epoch
        assert!(cell.collect(&[]).is_none());
    }
}
