use crate::attributes::KeyValue;
use crate::data::Exemplar;
use crate::internal::Number;

use super::{Reservoir, ReservoirCell, TraceContext};

/// A reservoir aligned to a histogram's buckets: one slot per bucket, the most
/// recent measurement per bucket wins.
///
/// With no boundaries configured this degenerates to a single catch-all slot.
pub(crate) struct HistogramReservoir<T> {
    bounds: Vec<f64>,
    cells: Vec<ReservoirCell<T>>,
}

impl<T: Number> HistogramReservoir<T> {
    pub(crate) fn new(bounds: Vec<f64>) -> Self {
        let cells = (0..bounds.len() + 1).map(|_| ReservoirCell::new()).collect();
        HistogramReservoir { bounds, cells }
    }
}

impl<T: Number> Reservoir<T> for HistogramReservoir<T> {
    fn offer(&self, value: T, attributes: &[KeyValue], context: Option<&TraceContext>) {
        // index of the bucket whose upper bound is the smallest boundary >= value
        let index = self.bounds.partition_point(|&bound| bound < value.into_float());
        self.cells[index].offer(value, attributes, context);
    }

    fn collect(&self, series_attributes: &[KeyValue]) -> Vec<Exemplar<T>> {
        self.cells
            .iter()
            .filter_map(|cell| cell.collect(series_attributes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_exemplar_per_bucket() {
        let reservoir = HistogramReservoir::new(vec![0.0, 10.0, 20.0]);
        for (value, label) in [(-1.0, "under"), (1.0, "low"), (11.0, "mid"), (21.0, "over")] {
            reservoir.offer(value, &[KeyValue::new("bucket", label)], None);
        }

        let exemplars = reservoir.collect(&[]);
        assert_eq!(exemplars.len(), 4);
        let labels: Vec<_> = exemplars
            .iter()
            .map(|e| e.filtered_attributes[0].clone())
            .collect();
        for label in ["under", "low", "mid", "over"] {
            assert!(labels.contains(&KeyValue::new("bucket", label)));
        }
    }

    #[test]
    fn latest_measurement_wins_within_a_bucket() {
        let reservoir = HistogramReservoir::new(vec![10.0]);
        reservoir.offer(1.0, &[KeyValue::new("n", 1)], None);
        reservoir.offer(2.0, &[KeyValue::new("n", 2)], None);

        let exemplars = reservoir.collect(&[]);
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].value, 2.0);
        assert_eq!(exemplars[0].filtered_attributes, vec![KeyValue::new("n", 2)]);
    }

    #[test]
    fn no_boundaries_single_catch_all_slot() {
        let reservoir = HistogramReservoir::new(vec![]);
        reservoir.offer(1u64, &[], None);
        reservoir.offer(1_000_000u64, &[], None);
        assert_eq!(reservoir.collect(&[]).len(), 1);
    }
}
