use std::f64::consts::LOG2_E;
use std::mem::replace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::attributes::KeyValue;
use crate::data::{self, Aggregation, Temporality};
use crate::exemplar::TraceContext;
use crate::{metric_error, metric_warn};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::value_map::{Aggregator, ReservoirFactory, ValueMap};
use super::{ComputeAggregation, Measure, Number};

pub(crate) const EXPO_MAX_SCALE: i8 = 20;
pub(crate) const EXPO_MIN_SCALE: i8 = -10;

/// Constants used in calculating the logarithm index, one per positive scale.
static SCALE_FACTORS: Lazy<[f64; 21]> =
    Lazy::new(|| std::array::from_fn(|scale| LOG2_E * 2f64.powi(scale as i32)));

/// Breaks the number into a normalized fraction and a base-2 exponent.
///
/// This impl is necessary as rust removed this functionality from std in
/// <https://github.com/rust-lang/rust/pull/41437>
#[inline(always)]
fn frexp(x: f64) -> (f64, i32) {
    let mut y = x.to_bits();
    let ee = ((y >> 52) & 0x7ff) as i32;

    if ee == 0 {
        if x != 0.0 {
            let x1p64 = f64::from_bits(0x43f0000000000000);
            let (x, e) = frexp(x * x1p64);
            return (x, e - 64);
        }
        return (x, 0);
    } else if ee == 0x7ff {
        return (x, 0);
    }

    let e = ee - 0x3fe;
    y &= 0x800fffffffffffff;
    y |= 0x3fe0000000000000;

    (f64::from_bits(y), e)
}

/// The magnitude of the scale change needed to fit `bin` alongside the
/// currently populated range without exceeding `max_size` buckets.
///
/// If no scale change is needed 0 is returned.
fn scale_change(max_size: i32, bin: i32, first_bin: i32, length: i32) -> u32 {
    if length == 0 {
        // No need to rescale if there are no buckets.
        return 0;
    }

    let mut low = first_bin;
    let mut high = bin;
    if first_bin >= bin {
        low = bin;
        high = first_bin + length - 1;
    }

    let mut count = 0u32;
    while high - low >= max_size {
        low >>= 1;
        high >>= 1;
        count += 1;

        if count > (EXPO_MAX_SCALE - EXPO_MIN_SCALE) as u32 {
            return count;
        }
    }

    count
}

/// A contiguous run of bucket counters for one sign of the value range.
#[derive(Default, Debug, PartialEq, Clone)]
struct BucketRun {
    first_bin: i32,
    counts: Vec<u64>,
}

impl BucketRun {
    /// Increments the count for `bin`, growing the run as needed.
    ///
    /// Any required scale change must have happened before this is called.
    fn increment(&mut self, bin: i32) {
        if self.counts.is_empty() {
            self.counts.push(1);
            self.first_bin = bin;
            return;
        }

        let end_bin = self.first_bin + self.counts.len() as i32 - 1;
        if bin >= self.first_bin && bin <= end_bin {
            self.counts[(bin - self.first_bin) as usize] += 1;
        } else if bin < self.first_bin {
            let shift = (self.first_bin - bin) as usize;
            let mut counts = vec![0; self.counts.len() + shift];
            counts[shift..].copy_from_slice(&self.counts);
            counts[0] = 1;
            self.counts = counts;
            self.first_bin = bin;
        } else {
            self.counts.resize((bin - self.first_bin + 1) as usize, 0);
            self.counts[(bin - self.first_bin) as usize] = 1;
        }
    }

    /// Shrinks the run by a factor of 2^delta, merging adjacent buckets into
    /// the lower resolution bucket that covers them. Preserves the total count.
    fn merge_down(&mut self, delta: u32) {
        // Example
        // delta = 2
        // original first_bin: -6
        // counts: [ 3,  1,  2,  3,  4,  5, 6, 7, 8, 9, 10]
        // bins:    -6  -5, -4, -3, -2, -1, 0, 1, 2, 3, 4
        // new bins:-2, -2, -1, -1, -1, -1, 0, 0, 0, 0, 1
        // new first_bin: -2
        // new counts: [4, 14, 30, 10]

        if self.counts.len() <= 1 || delta < 1 {
            self.first_bin >>= delta;
            return;
        }

        let steps = 1 << delta;
        let mut offset = self.first_bin % steps;
        offset = (offset + steps) % steps; // to make offset positive
        for i in 1..self.counts.len() {
            let idx = i + offset as usize;
            if idx % steps as usize == 0 {
                self.counts[idx / steps as usize] = self.counts[i];
                continue;
            }
            self.counts[idx / steps as usize] += self.counts[i];
        }

        let last_idx = (self.counts.len() as i32 - 1 + offset) / steps;
        self.counts.truncate(last_idx as usize + 1);
        self.first_bin >>= delta;
    }
}

/// Static configuration shared by every series of one exponential histogram.
#[derive(Clone, Copy)]
pub(crate) struct ExpoConfig {
    max_size: i32,
    max_scale: i8,
    record_min_max: bool,
    record_sum: bool,
}

/// The bucket state of a single exponential histogram series.
#[derive(Clone, Debug, PartialEq)]
struct ExpoState<T> {
    count: usize,
    min: T,
    max: T,
    sum: T,

    max_size: i32,
    record_min_max: bool,
    record_sum: bool,

    scale: i8,

    positive: BucketRun,
    negative: BucketRun,
    zero_count: u64,
}

impl<T: Number> ExpoState<T> {
    fn new(config: &ExpoConfig) -> Self {
        ExpoState {
            count: 0,
            min: T::max(),
            max: T::min(),
            sum: T::default(),
            max_size: config.max_size,
            record_min_max: config.record_min_max,
            record_sum: config.record_sum,
            scale: config.max_scale,
            positive: BucketRun::default(),
            negative: BucketRun::default(),
            zero_count: 0,
        }
    }

    /// Adds a new measurement, downscaling the buckets if needed.
    fn record(&mut self, v: T) {
        self.count += 1;

        if self.record_min_max {
            if v < self.min {
                self.min = v;
            }
            if v > self.max {
                self.max = v;
            }
        }
        if self.record_sum {
            self.sum += v;
        }

        let abs_v = v.into_float().abs();
        if abs_v == 0.0 {
            self.zero_count += 1;
            return;
        }

        let mut bin = self.bucket_index(abs_v);
        let v_is_negative = v < T::default();

        // If the new bin would make the run larger than `max_size`, the
        // current measurements need to be downscaled first.
        let scale_delta = {
            let run = if v_is_negative {
                &self.negative
            } else {
                &self.positive
            };
            scale_change(self.max_size, bin, run.first_bin, run.counts.len() as i32)
        };
        if scale_delta > 0 {
            if (self.scale - scale_delta as i8) < EXPO_MIN_SCALE {
                // With a scale of -10 there is only two buckets for the whole
                // range of f64 values. This can only happen with a max size of 1.
                metric_error!(name: "ExponentialHistogramScaleUnderflow");
                return;
            }
            self.scale -= scale_delta as i8;
            self.positive.merge_down(scale_delta);
            self.negative.merge_down(scale_delta);

            bin = self.bucket_index(abs_v);
        }

        if v_is_negative {
            self.negative.increment(bin)
        } else {
            self.positive.increment(bin)
        }
    }

    /// The bin `v` should be recorded into at the current scale.
    ///
    /// Equal to `ceil(log2(v) * 2^scale) - 1` without the rounding error of
    /// computing `log2` directly.
    fn bucket_index(&self, v: f64) -> i32 {
        let (frac, exp) = frexp(v);
        if self.scale <= 0 {
            // With negative scale `frac` is always 1 power of two higher than we want.
            let mut correction = 1;
            if frac == 0.5 {
                // If `v` is an exact power of two, `frac` will be `0.5` and the exp
                // will be then be two higher than we want.
                correction = 2;
            }
            return (exp - correction) >> -self.scale;
        }
        (exp << self.scale) + (frac.ln() * SCALE_FACTORS[self.scale as usize]) as i32 - 1
    }
}

/// The tracker for a single exponential histogram series.
struct ExpoTracker<T> {
    state: Mutex<ExpoState<T>>,
}

impl<T: Number> Aggregator for ExpoTracker<T> {
    type InitConfig = ExpoConfig;
    type PreComputedValue = T;

    fn create(config: &ExpoConfig) -> Self {
        ExpoTracker {
            state: Mutex::new(ExpoState::new(config)),
        }
    }

    fn update(&self, value: T) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        state.record(value);
    }
}

/// An aggregator that summarizes a set of measurements as an exponential
/// histogram.
///
/// Each histogram is scoped by attributes and the aggregation cycle the
/// measurements were made in.
pub(crate) struct ExpoHistogram<T: Number> {
    value_map: ValueMap<T, ExpoTracker<T>>,
    init_time: AggregateTimeInitiator,
    filter: AttributeSetFilter,
    temporality: Temporality,
    config: ExpoConfig,
    dropped_logged: AtomicBool,
}

impl<T: Number> ExpoHistogram<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        max_size: u32,
        max_scale: i8,
        record_min_max: bool,
        record_sum: bool,
        reservoirs: ReservoirFactory<T>,
        cardinality_limit: usize,
    ) -> Self {
        let config = ExpoConfig {
            max_size: max_size as i32,
            max_scale: max_scale.clamp(EXPO_MIN_SCALE, EXPO_MAX_SCALE),
            record_min_max,
            record_sum,
        };
        ExpoHistogram {
            value_map: ValueMap::new(config, reservoirs, cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            filter,
            temporality,
            config,
            dropped_logged: AtomicBool::new(false),
        }
    }

    fn data_point(
        &self,
        attributes: Vec<KeyValue>,
        start_time: std::time::SystemTime,
        time: std::time::SystemTime,
        state: ExpoState<T>,
        exemplars: Vec<data::Exemplar<T>>,
    ) -> data::ExponentialHistogramDataPoint<T> {
        data::ExponentialHistogramDataPoint {
            attributes,
            start_time,
            time,
            count: state.count,
            min: if self.config.record_min_max {
                Some(state.min)
            } else {
                None
            },
            max: if self.config.record_min_max {
                Some(state.max)
            } else {
                None
            },
            sum: if self.config.record_sum {
                state.sum
            } else {
                T::default()
            },
            scale: state.scale,
            zero_count: state.zero_count,
            positive_bucket: data::ExponentialBucket {
                offset: state.positive.first_bin,
                counts: state.positive.counts,
            },
            negative_bucket: data::ExponentialBucket {
                offset: state.negative.first_bin,
                counts: state.negative.counts,
            },
            zero_threshold: 0.0,
            exemplars,
        }
    }

    fn delta(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>) {
        let time = self.init_time.delta();

        let h = dest.and_then(|d| d.as_mut().downcast_mut::<data::ExponentialHistogram<T>>());
        let mut new_agg = if h.is_none() {
            Some(data::ExponentialHistogram {
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
                let state = {
                    let mut guard = series
                        .tracker
                        .state
                        .lock()
                        .unwrap_or_else(|err| err.into_inner());
                    replace(&mut *guard, ExpoState::new(&self.config))
                };
                let exemplars = series.reservoir.collect(&attributes);
                self.data_point(attributes, time.start, time.current, state, exemplars)
            });

        (h.data_points.len(), new_agg.map(|a| Box::new(a) as Box<_>))
    }

    fn cumulative(
        &self,
        dest: Option<&mut dyn Aggregation>,
    ) -> (usize, Option<Box<dyn Aggregation>>) {
        let time = self.init_time.cumulative();

        let h = dest.and_then(|d| d.as_mut().downcast_mut::<data::ExponentialHistogram<T>>());
        let mut new_agg = if h.is_none() {
            Some(data::ExponentialHistogram {
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
                let state = series
                    .tracker
                    .state
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .clone();
                let exemplars = series.reservoir.collect(&attributes);
                self.data_point(attributes, series.start, time.current, state, exemplars)
            });

        (h.data_points.len(), new_agg.map(|a| Box::new(a) as Box<_>))
    }
}

impl<T: Number> Measure<T> for ExpoHistogram<T> {
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

        self.filter.apply(attrs, |filtered| {
            self.value_map
                .measure(measurement, measurement, filtered, attrs, context);
        });
    }
}

impl<T: Number> ComputeAggregation for ExpoHistogram<T> {
    fn call(&self, dest: Option<&mut dyn Aggregation>) -> (usize, Option<Box<dyn Aggregation>>) {
        self.dropped_logged.store(false, Ordering::Relaxed);
        match self.temporality {
            Temporality::Delta => self.delta(dest),
            _ => self.cumulative(dest),
        }
    }
}
