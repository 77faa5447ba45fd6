//! The aggregation kinds a stream can apply to its instrument's measurements.

use crate::error::{MetricError, MetricResult};
use crate::internal::{EXPO_MAX_SCALE, EXPO_MIN_SCALE};

/// The way recorded measurements are summarized into a metric stream.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Aggregation {
    /// Disables the instrument for this stream; measurements are discarded.
    Drop,

    /// Uses the default aggregation for the instrument kind.
    Default,

    /// An aggregation that summarizes a set of measurements as their
    /// arithmetic sum.
    Sum,

    /// An aggregation that summarizes a set of measurements as the last one
    /// made.
    LastValue,

    /// An aggregation that summarizes a set of measurements as a histogram
    /// with explicitly defined buckets.
    ExplicitBucketHistogram {
        /// The increasing bucket boundary values.
        ///
        /// Boundary values define bucket upper bounds. Buckets are exclusive
        /// of their lower bound and inclusive of their upper bound.
        boundaries: Vec<f64>,
        /// Whether to record min and max.
        record_min_max: bool,
    },

    /// An aggregation that summarizes a set of measurements as a histogram
    /// with buckets widths defined by a base-2 exponential function.
    Base2ExponentialHistogram {
        /// The maximum number of buckets to use for the histogram.
        max_size: u32,
        /// The maximum resolution scale to use for the histogram.
        ///
        /// The maximum value is 20, in which case the maximum number of
        /// buckets able to represent the full normal floating point range is
        /// used.
        max_scale: i8,
        /// Whether to record min and max.
        record_min_max: bool,
    },
}

impl Aggregation {
    /// Validate that this aggregation's configuration is usable.
    pub fn validate(&self) -> MetricResult<()> {
        match self {
            Aggregation::Drop | Aggregation::Default | Aggregation::Sum | Aggregation::LastValue => {
                Ok(())
            }
            Aggregation::ExplicitBucketHistogram { boundaries, .. } => {
                for boundary in boundaries {
                    if boundary.is_nan() || boundary.is_infinite() {
                        return Err(MetricError::InvalidInstrumentConfiguration(
                            "bucket boundaries must not contain NaN, Infinity, or -Infinity",
                        ));
                    }
                }

                // Validate that buckets are sorted and non-duplicate.
                for window in boundaries.windows(2) {
                    if window[1] <= window[0] {
                        return Err(MetricError::InvalidInstrumentConfiguration(
                            "bucket boundaries must be sorted and not contain any duplicates",
                        ));
                    }
                }

                Ok(())
            }
            Aggregation::Base2ExponentialHistogram {
                max_size, max_scale, ..
            } => {
                if *max_size == 0 {
                    return Err(MetricError::InvalidInstrumentConfiguration(
                        "exponential histogram max size must be greater than 0",
                    ));
                }
                if *max_scale > EXPO_MAX_SCALE || *max_scale < EXPO_MIN_SCALE {
                    return Err(MetricError::InvalidInstrumentConfiguration(
                        "exponential histogram max scale must be in the range [-10, 20]",
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_boundaries_must_be_finite_and_increasing() {
        let valid = Aggregation::ExplicitBucketHistogram {
            boundaries: vec![0.0, 5.0, 10.0],
            record_min_max: true,
        };
        assert!(valid.validate().is_ok());

        for bad in [
            vec![1.0, f64::NAN],
            vec![1.0, f64::INFINITY],
            vec![5.0, 1.0],
            vec![1.0, 1.0],
        ] {
            let agg = Aggregation::ExplicitBucketHistogram {
                boundaries: bad,
                record_min_max: true,
            };
            assert!(agg.validate().is_err());
        }
    }

    #[test]
    fn exponential_scale_and_size_are_bounded() {
        let valid = Aggregation::Base2ExponentialHistogram {
            max_size: 160,
            max_scale: 20,
            record_min_max: true,
        };
        assert!(valid.validate().is_ok());

        let zero_size = Aggregation::Base2ExponentialHistogram {
            max_size: 0,
            max_scale: 20,
            record_min_max: true,
        };
        assert!(zero_size.validate().is_err());

        let scale_too_high = Aggregation::Base2ExponentialHistogram {
            max_size: 160,
            max_scale: 21,
            record_min_max: true,
        };
        assert!(scale_too_high.validate().is_err());
    }
}
