//! Connects registered instruments to their aggregate state and drives
//! collection cycles.

use std::any;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::aggregation::Aggregation;
use crate::attributes::KeyValue;
use crate::data::{Metric, MetricsData, Temporality};
use crate::error::{MetricError, MetricResult};
use crate::exemplar::ExemplarFilter;
use crate::instrument::{
    Advice, InstrumentDescriptor, InstrumentId, InstrumentKind, Recorder, Stream,
};
use crate::internal::{self, AggregateBuilder, AggregateFns, Measure, Number};
use crate::view::View;
use crate::{metric_debug, metric_warn};

/// Default boundaries applied to explicit-bucket histograms when neither a
/// view nor the instrument's advice configures them.
const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// A cache that holds aggregate function inputs whose outputs have been
/// inserted into the collection pipeline.
///
/// This cache ensures no duplicate aggregate functions are created for the
/// same output stream identity.
type Cache<T> = Mutex<HashMap<InstrumentId, MetricResult<Option<Arc<dyn Measure<T>>>>>>;

/// A synchronization point between the collection cycle and one stream's
/// aggregate function.
struct InstrumentSync {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    comp_agg: Arc<dyn internal::ComputeAggregation>,
}

impl fmt::Debug for InstrumentSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSync")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("unit", &self.unit)
            .finish()
    }
}

/// The aggregation engine: routes recorded measurements into per-series state
/// and produces immutable snapshots on demand.
///
/// The engine is an explicitly constructed value; its lifecycle belongs to the
/// embedding application. Recording through [Recorder] handles is safe from
/// arbitrary threads. [collect](MetricsEngine::collect) is driven externally
/// (a periodic timer or pull-based reader) and must not be called
/// concurrently with itself; concurrent calls serialize internally.
pub struct MetricsEngine {
    temporality: Temporality,
    exemplar_filter: ExemplarFilter,
    cardinality_limit: usize,
    views: Vec<Arc<dyn View>>,

    /// Output stream identities by normalized name, for duplicate detection.
    stream_ids: Mutex<HashMap<String, (InstrumentId, &'static str)>>,
    instruments: Mutex<Vec<InstrumentSync>>,

    u64_cache: Cache<u64>,
    i64_cache: Cache<i64>,
    f64_cache: Cache<f64>,
}

impl fmt::Debug for MetricsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEngine")
            .field("temporality", &self.temporality)
            .field("exemplar_filter", &self.exemplar_filter)
            .finish()
    }
}

impl MetricsEngine {
    /// Starts building an engine.
    pub fn builder() -> MetricsEngineBuilder {
        MetricsEngineBuilder::default()
    }

    /// Registers a `u64`-valued instrument and returns its recording handle.
    pub fn register_u64(&self, descriptor: &InstrumentDescriptor) -> MetricResult<Recorder<u64>> {
        self.register_measures(&self.u64_cache, descriptor)
    }

    /// Registers an `i64`-valued instrument and returns its recording handle.
    pub fn register_i64(&self, descriptor: &InstrumentDescriptor) -> MetricResult<Recorder<i64>> {
        self.register_measures(&self.i64_cache, descriptor)
    }

    /// Registers an `f64`-valued instrument and returns its recording handle.
    pub fn register_f64(&self, descriptor: &InstrumentDescriptor) -> MetricResult<Recorder<f64>> {
        self.register_measures(&self.f64_cache, descriptor)
    }

    /// Runs one collection cycle into `dest`.
    ///
    /// Allocations in `dest` are reused across cycles where the aggregation
    /// shapes match; stale trailing entries are truncated. Delta streams reset
    /// on extraction, cumulative streams keep accumulating, and series with no
    /// recordings since the previous cycle are evicted.
    pub fn collect(&self, dest: &mut MetricsData) -> MetricResult<()> {
        let instruments = self.instruments.lock()?;
        metric_debug!(
            name: "MetricsCollectionStarted",
            instrument_count = instruments.len(),
        );

        let mut j = 0;
        for inst in instruments.iter() {
            let mut m = dest.metrics.get_mut(j);
            match (inst.comp_agg.call(m.as_mut().map(|m| m.data.as_mut())), m) {
                // No metric to re-use, expect the aggregate to create new data.
                ((len, Some(initial_agg)), None) if len > 0 => dest.metrics.push(Metric {
                    name: inst.name.clone(),
                    description: inst.description.clone(),
                    unit: inst.unit.clone(),
                    data: initial_agg,
                }),
                // Existing metric can be re-used, update its values.
                ((len, data), Some(prev_agg)) if len > 0 => {
                    if let Some(data) = data {
                        // previous aggregation was of a different type
                        prev_agg.data = data;
                    }
                    prev_agg.name.clone_from(&inst.name);
                    prev_agg.description.clone_from(&inst.description);
                    prev_agg.unit.clone_from(&inst.unit);
                }
                _ => continue,
            }

            j += 1;
        }
        dest.metrics.truncate(j);

        Ok(())
    }

    fn register_measures<T: Number>(
        &self,
        cache: &Cache<T>,
        descriptor: &InstrumentDescriptor,
    ) -> MetricResult<Recorder<T>> {
        if descriptor.value_type() != T::VALUE_TYPE {
            return Err(MetricError::InvalidInstrumentConfiguration(
                "instrument value type does not match the recorder type",
            ));
        }

        let mut measures = Vec::new();
        let mut seen = HashSet::new();
        let mut matched = false;
        for view in &self.views {
            if let Some(stream) = view.match_inst(descriptor) {
                matched = true;
                if let Some(measure) = self.cached_aggregator(cache, descriptor, stream, &mut seen)?
                {
                    measures.push(measure);
                }
            }
        }

        if !matched {
            if let Some(measure) =
                self.cached_aggregator(cache, descriptor, Stream::default(), &mut seen)?
            {
                measures.push(measure);
            }
        }

        Ok(Recorder::new(measures))
    }

    /// Returns the appropriate aggregate function for a stream configuration.
    ///
    /// If the exact output stream has been created before, the cached
    /// aggregate function instance is returned. Otherwise a new one is built,
    /// inserted into the collection pipeline, cached, and returned.
    fn cached_aggregator<T: Number>(
        &self,
        cache: &Cache<T>,
        descriptor: &InstrumentDescriptor,
        stream: Stream,
        seen: &mut HashSet<InstrumentId>,
    ) -> MetricResult<Option<Arc<dyn Measure<T>>>> {
        let Stream {
            name,
            description,
            unit,
            aggregation,
            allowed_attribute_keys,
            cardinality_limit,
        } = stream;
        let kind = descriptor.kind();

        let mut agg =
            aggregation.unwrap_or_else(|| default_aggregation(kind, descriptor.advice()));
        if matches!(agg, Aggregation::Default) {
            agg = default_aggregation(kind, descriptor.advice());
        }
        agg.validate()?;
        is_aggregator_compatible(kind, &agg)?;

        let name = name.unwrap_or_else(|| descriptor.name_cow());
        let description = description.unwrap_or_else(|| descriptor.description_cow());
        let unit = unit.unwrap_or_else(|| descriptor.unit_cow());

        // Requests for the same stream with different name casing must map to
        // the first-seen stream; the normalized id is the cache key.
        let mut id = InstrumentId {
            name: name.clone(),
            description: description.clone(),
            kind,
            unit: unit.clone(),
            number: Cow::Borrowed(any::type_name::<T>()),
        };
        id.normalize();

        // Multiple views mapping one registration onto the same stream fan in
        // to a single measure.
        if !seen.insert(id.clone()) {
            return Ok(None);
        }

        self.check_conflict(&id, aggregation_kind_name(&agg))?;

        let mut cache = cache.lock()?;
        let cached = cache.entry(id).or_insert_with(|| {
            let filter = allowed_attribute_keys.clone().map(|allowed| {
                Arc::new(move |kv: &KeyValue| allowed.contains(&kv.key)) as internal::Filter
            });

            let b = AggregateBuilder::new(
                kind.temporality_preference(self.temporality),
                filter,
                self.exemplar_filter,
                cardinality_limit.unwrap_or(self.cardinality_limit),
            );
            let AggregateFns { measure, collect } = match aggregate_fns(b, &agg, kind) {
                Ok(Some(fns)) => fns,
                other => return other.map(|fns| fns.map(|f| f.measure)),
            };

            let mut instruments = match self.instruments.lock() {
                Ok(guard) => guard,
                Err(err) => return Err(MetricError::Other(err.to_string())),
            };
            metric_debug!(name: "InstrumentCreated", instrument_name = name.as_ref());
            instruments.push(InstrumentSync {
                name,
                description,
                unit,
                comp_agg: collect,
            });

            Ok(Some(measure))
        });

        match cached {
            Ok(opt) => Ok(opt.clone()),
            Err(err) => Err(MetricError::Other(err.to_string())),
        }
    }

    /// Validates that a stream with the same output name has a compatible
    /// shape.
    ///
    /// Identical identities reuse the cached aggregate; incompatible ones are
    /// a structured error (the existing stream keeps serving); benign metadata
    /// differences are logged and both streams serve.
    fn check_conflict(&self, id: &InstrumentId, agg_kind: &'static str) -> MetricResult<()> {
        let mut stream_ids = self.stream_ids.lock()?;
        if let Some((existing, existing_agg)) = stream_ids.get(id.name.as_ref()) {
            if existing == id && *existing_agg == agg_kind {
                return Ok(());
            }
            if existing.kind != id.kind
                || existing.number != id.number
                || *existing_agg != agg_kind
            {
                return Err(MetricError::DuplicateInstrument {
                    name: id.name.to_string(),
                    existing: format!("{existing:?} aggregated as {existing_agg}"),
                    requested: format!("{id:?} aggregated as {agg_kind}"),
                });
            }
            metric_warn!(
                name: "DuplicateMetricStreamDefinitions",
                reason = format!(
                    "names: ({} and {}), descriptions: ({} and {}), units: ({} and {})",
                    existing.name, id.name,
                    existing.description, id.description,
                    existing.unit, id.unit,
                ),
            );
            return Ok(());
        }
        stream_ids.insert(id.name.to_string(), (id.clone(), agg_kind));
        Ok(())
    }
}

/// The default aggregation for an instrument of [InstrumentKind].
///
/// * Counter ⇨ Sum
/// * UpDownCounter ⇨ Sum
/// * Gauge ⇨ LastValue
/// * Histogram ⇨ ExplicitBucketHistogram
fn default_aggregation(kind: InstrumentKind, advice: &Advice) -> Aggregation {
    match kind {
        InstrumentKind::Counter | InstrumentKind::UpDownCounter => Aggregation::Sum,
        InstrumentKind::Gauge => Aggregation::LastValue,
        InstrumentKind::Histogram => Aggregation::ExplicitBucketHistogram {
            boundaries: advice
                .explicit_bucket_boundaries
                .clone()
                .unwrap_or_else(|| DEFAULT_HISTOGRAM_BOUNDARIES.to_vec()),
            record_min_max: true,
        },
    }
}

fn aggregation_kind_name(agg: &Aggregation) -> &'static str {
    match agg {
        Aggregation::Drop => "drop",
        Aggregation::Default => "default",
        Aggregation::Sum => "sum",
        Aggregation::LastValue => "last_value",
        Aggregation::ExplicitBucketHistogram { .. } => "explicit_bucket_histogram",
        Aggregation::Base2ExponentialHistogram { .. } => "base2_exponential_histogram",
    }
}

/// Returns new aggregate functions for the given params.
fn aggregate_fns<T: Number>(
    b: AggregateBuilder<T>,
    agg: &Aggregation,
    kind: InstrumentKind,
) -> MetricResult<Option<AggregateFns<T>>> {
    match agg {
        Aggregation::Default => {
            aggregate_fns(b, &default_aggregation(kind, &Advice::default()), kind)
        }
        Aggregation::Drop => Ok(None),
        Aggregation::LastValue => Ok(Some(b.last_value())),
        Aggregation::Sum => {
            let monotonic = matches!(kind, InstrumentKind::Counter | InstrumentKind::Histogram);
            Ok(Some(b.sum(monotonic)))
        }
        Aggregation::ExplicitBucketHistogram {
            boundaries,
            record_min_max,
        } => {
            let record_sum = !matches!(kind, InstrumentKind::UpDownCounter | InstrumentKind::Gauge);
            Ok(Some(b.explicit_bucket_histogram(
                boundaries.to_vec(),
                *record_min_max,
                record_sum,
            )))
        }
        Aggregation::Base2ExponentialHistogram {
            max_size,
            max_scale,
            record_min_max,
        } => {
            let record_sum = !matches!(kind, InstrumentKind::UpDownCounter | InstrumentKind::Gauge);
            Ok(Some(b.exponential_bucket_histogram(
                *max_size,
                *max_scale,
                *record_min_max,
                record_sum,
            )))
        }
    }
}

/// Checks if the aggregation can be used by the instrument kind.
///
/// | Instrument Kind | Drop | LastValue | Sum | Histogram | Exponential Histogram |
/// |-----------------|------|-----------|-----|-----------|-----------------------|
/// | Counter         | ✓    |           | ✓   | ✓         | ✓                     |
/// | UpDownCounter   | ✓    |           | ✓   | ✓         | ✓                     |
/// | Histogram       | ✓    |           | ✓   | ✓         | ✓                     |
/// | Gauge           | ✓    | ✓         |     | ✓         | ✓                     |
fn is_aggregator_compatible(kind: InstrumentKind, agg: &Aggregation) -> MetricResult<()> {
    match agg {
        Aggregation::Default | Aggregation::Drop => Ok(()),
        Aggregation::ExplicitBucketHistogram { .. }
        | Aggregation::Base2ExponentialHistogram { .. } => Ok(()),
        Aggregation::Sum => match kind {
            InstrumentKind::Counter | InstrumentKind::UpDownCounter | InstrumentKind::Histogram => {
                Ok(())
            }
            _ => Err(MetricError::InvalidInstrumentConfiguration(
                "sum aggregation requires a counter, up-down counter, or histogram instrument",
            )),
        },
        Aggregation::LastValue => match kind {
            InstrumentKind::Gauge => Ok(()),
            _ => Err(MetricError::InvalidInstrumentConfiguration(
                "last-value aggregation requires a gauge instrument",
            )),
        },
    }
}

/// Configuration for a [MetricsEngine].
pub struct MetricsEngineBuilder {
    temporality: Temporality,
    exemplar_filter: ExemplarFilter,
    cardinality_limit: usize,
    views: Vec<Arc<dyn View>>,
}

impl Default for MetricsEngineBuilder {
    fn default() -> Self {
        MetricsEngineBuilder {
            temporality: Temporality::default(),
            exemplar_filter: ExemplarFilter::default(),
            cardinality_limit: internal::DEFAULT_CARDINALITY_LIMIT,
            views: vec![],
        }
    }
}

impl fmt::Debug for MetricsEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEngineBuilder")
            .field("temporality", &self.temporality)
            .field("exemplar_filter", &self.exemplar_filter)
            .field("cardinality_limit", &self.cardinality_limit)
            .field("views", &self.views.len())
            .finish()
    }
}

impl MetricsEngineBuilder {
    /// Sets the output temporality for all streams.
    ///
    /// Non-monotonic counters report cumulative values regardless.
    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    /// Sets the sampling policy applied ahead of every exemplar reservoir.
    pub fn with_exemplar_filter(mut self, filter: ExemplarFilter) -> Self {
        self.exemplar_filter = filter;
        self
    }

    /// Adds a view mapping instruments onto customized output streams.
    ///
    /// All matching views apply; an instrument matched by no view gets its
    /// default stream.
    pub fn with_view(mut self, view: impl View) -> Self {
        self.views.push(Arc::new(view));
        self
    }

    /// Sets the default per-stream cardinality limit.
    pub fn with_cardinality_limit(mut self, limit: usize) -> Self {
        self.cardinality_limit = limit;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> MetricsEngine {
        MetricsEngine {
            temporality: self.temporality,
            exemplar_filter: self.exemplar_filter,
            cardinality_limit: self.cardinality_limit,
            views: self.views,
            stream_ids: Mutex::new(HashMap::new()),
            instruments: Mutex::new(Vec::new()),
            u64_cache: Mutex::new(HashMap::new()),
            i64_cache: Mutex::new(HashMap::new()),
            f64_cache: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::ValueType;

    fn counter(name: &'static str) -> InstrumentDescriptor {
        InstrumentDescriptor::builder(name, InstrumentKind::Counter, ValueType::U64).build()
    }

    #[test]
    fn mismatched_value_type_rejected() {
        let engine = MetricsEngine::builder().build();
        let descriptor = counter("requests");
        assert!(engine.register_f64(&descriptor).is_err());
    }

    #[test]
    fn incompatible_duplicate_is_a_structured_error() {
        let engine = MetricsEngine::builder().build();
        engine.register_u64(&counter("requests")).expect("first registration");

        let clash =
            InstrumentDescriptor::builder("Requests", InstrumentKind::Histogram, ValueType::F64)
                .build();
        let err = engine.register_f64(&clash).expect_err("conflicting kind");
        assert!(matches!(
            err,
            MetricError::DuplicateInstrument { ref name, .. } if name == "requests"
        ));

        // the original stream keeps serving
        let recorder = engine.register_u64(&counter("requests")).expect("re-register");
        recorder.record(1, &[], None);
        let mut data = MetricsData::default();
        engine.collect(&mut data).expect("collect");
        assert_eq!(data.metrics.len(), 1);
    }

    #[test]
    fn same_identity_shares_one_stream() {
        let engine = MetricsEngine::builder().build();
        let lower = engine.register_u64(&counter("requests")).expect("register");
        let upper = engine
            .register_u64(
                &InstrumentDescriptor::builder(
                    "REQUESTS",
                    InstrumentKind::Counter,
                    ValueType::U64,
                )
                .build(),
            )
            .expect("register case variant");

        lower.record(2, &[], None);
        upper.record(3, &[], None);

        let mut data = MetricsData::default();
        engine.collect(&mut data).expect("collect");
        assert_eq!(data.metrics.len(), 1);
        let sum = data.metrics[0]
            .data
            .as_any()
            .downcast_ref::<crate::data::Sum<u64>>()
            .expect("sum aggregation");
        assert_eq!(sum.data_points[0].value, 5);
    }

    #[test]
    fn drop_aggregation_discards_measurements() {
        let engine = MetricsEngine::builder()
            .with_view(|inst: &InstrumentDescriptor| {
                (inst.name() == "noise").then(|| {
                    Stream::builder()
                        .with_aggregation(Aggregation::Drop)
                        .build()
                        .expect("valid stream")
                })
            })
            .build();

        let recorder = engine.register_u64(&counter("noise")).expect("register");
        recorder.record(10, &[], None);

        let mut data = MetricsData::default();
        engine.collect(&mut data).expect("collect");
        assert!(data.metrics.is_empty());
    }

    #[test]
    fn views_rename_streams() {
        let engine = MetricsEngine::builder()
            .with_view(|inst: &InstrumentDescriptor| {
                (inst.name() == "latency").then(|| {
                    Stream::builder()
                        .with_name("request.latency")
                        .build()
                        .expect("valid stream")
                })
            })
            .build();

        let recorder = engine.register_u64(&counter("latency")).expect("register");
        recorder.record(1, &[], None);

        let mut data = MetricsData::default();
        engine.collect(&mut data).expect("collect");
        assert_eq!(data.metrics[0].name, "request.latency");
    }

    #[test]
    fn untouched_instruments_produce_no_metrics() {
        let engine = MetricsEngine::builder().build();
        engine.register_u64(&counter("idle")).expect("register");

        let mut data = MetricsData::default();
        engine.collect(&mut data).expect("collect");
        assert!(data.metrics.is_empty());
    }
}
