//! Instrument identity and per-stream configuration.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::aggregation::Aggregation;
use crate::attributes::{Key, KeyValue};
use crate::data::Temporality;
use crate::error::{MetricError, MetricResult};
use crate::exemplar::TraceContext;
use crate::internal::{Measure, Number};

/// The identifier of a group of instruments that all perform the same function.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum InstrumentKind {
    /// Identifies a group of instruments that record increasing values
    /// synchronously with the code path they are measuring.
    Counter,
    /// A group of instruments that record increasing and decreasing values
    /// synchronously with the code path they are measuring.
    UpDownCounter,
    /// A group of instruments that record a distribution of values
    /// synchronously with the code path they are measuring.
    Histogram,
    /// A group of instruments that record the current value synchronously with
    /// the code path they are measuring.
    Gauge,
}

impl InstrumentKind {
    /// Selects the effective [Temporality] for this kind given the engine-wide
    /// preference.
    ///
    /// Non-monotonic counters always report cumulative values; a delta stream
    /// of increments and decrements is not meaningfully aggregatable
    /// downstream.
    pub(crate) fn temporality_preference(&self, temporality: Temporality) -> Temporality {
        match temporality {
            Temporality::Cumulative => Temporality::Cumulative,
            Temporality::Delta => match self {
                Self::Counter | Self::Histogram | Self::Gauge => Temporality::Delta,
                Self::UpDownCounter => Temporality::Cumulative,
            },
        }
    }
}

/// The numeric type an instrument records.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ValueType {
    /// Signed 64-bit integers.
    I64,
    /// Unsigned 64-bit integers.
    U64,
    /// 64-bit floating point.
    F64,
}

/// Non-identifying hints attached to an instrument at creation.
///
/// Two descriptors that differ only in advice describe the same instrument.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Advice {
    /// Suggested boundaries when the instrument is aggregated as an
    /// explicit-bucket histogram and no view overrides them.
    pub explicit_bucket_boundaries: Option<Vec<f64>>,
}

/// The immutable identity of an instrument as supplied by the API layer.
///
/// Name comparison is ASCII case-insensitive and [Advice] is excluded from
/// equality and hashing.
#[derive(Clone, Debug)]
pub struct InstrumentDescriptor {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    kind: InstrumentKind,
    value_type: ValueType,
    advice: Advice,
}

impl InstrumentDescriptor {
    /// Starts building a descriptor for `name`.
    ///
    /// Name and unit syntax are the API layer's concern and are not validated
    /// here.
    pub fn builder(
        name: impl Into<Cow<'static, str>>,
        kind: InstrumentKind,
        value_type: ValueType,
    ) -> InstrumentDescriptorBuilder {
        InstrumentDescriptorBuilder {
            name: name.into(),
            description: Cow::Borrowed(""),
            unit: Cow::Borrowed(""),
            kind,
            value_type,
            advice: Advice::default(),
        }
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// Instrument description.
    pub fn description(&self) -> &str {
        self.description.as_ref()
    }

    /// Instrument unit.
    pub fn unit(&self) -> &str {
        self.unit.as_ref()
    }

    /// Instrument kind.
    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    /// The numeric type the instrument records.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Non-identifying hints.
    pub fn advice(&self) -> &Advice {
        &self.advice
    }

    pub(crate) fn name_cow(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    pub(crate) fn description_cow(&self) -> Cow<'static, str> {
        self.description.clone()
    }

    pub(crate) fn unit_cow(&self) -> Cow<'static, str> {
        self.unit.clone()
    }
}

impl PartialEq for InstrumentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.description == other.description
            && self.unit == other.unit
            && self.kind == other.kind
            && self.value_type == other.value_type
    }
}

impl Eq for InstrumentDescriptor {}

impl Hash for InstrumentDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.name.as_bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        self.description.hash(state);
        self.unit.hash(state);
        self.kind.hash(state);
        self.value_type.hash(state);
    }
}

/// A mutable builder frozen into an [InstrumentDescriptor] by `build`.
#[derive(Debug)]
pub struct InstrumentDescriptorBuilder {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    kind: InstrumentKind,
    value_type: ValueType,
    advice: Advice,
}

impl InstrumentDescriptorBuilder {
    /// Sets the human-readable description.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the unit of measurement.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Attaches non-identifying hints.
    pub fn with_advice(mut self, advice: Advice) -> Self {
        self.advice = advice;
        self
    }

    /// Freezes the builder into an immutable descriptor.
    pub fn build(self) -> InstrumentDescriptor {
        InstrumentDescriptor {
            name: self.name,
            description: self.description,
            unit: self.unit,
            kind: self.kind,
            value_type: self.value_type,
            advice: self.advice,
        }
    }
}

/// The identifying properties of one output metric stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct InstrumentId {
    /// The human-readable identifier of the stream.
    pub(crate) name: Cow<'static, str>,
    /// Describes the purpose of the data.
    pub(crate) description: Cow<'static, str>,
    /// Defines the functional group of the instrument.
    pub(crate) kind: InstrumentKind,
    /// The unit of measurement recorded.
    pub(crate) unit: Cow<'static, str>,
    /// The underlying data type of the stream.
    pub(crate) number: Cow<'static, str>,
}

impl InstrumentId {
    /// Instrument names are considered case-insensitive ASCII.
    ///
    /// Standardize the name to always be lowercase so it can be compared via
    /// hash.
    pub(crate) fn normalize(&mut self) {
        if self.name.chars().any(|c| c.is_ascii_uppercase()) {
            self.name = self.name.to_ascii_lowercase().into();
        }
    }
}

/// Describes the stream of data an instrument produces.
///
/// Returned from [View](crate::View)s to customize the output of matching
/// instruments.
#[derive(Default, Debug)]
pub struct Stream {
    /// The human-readable identifier of the stream.
    pub(crate) name: Option<Cow<'static, str>>,
    /// Describes the purpose of the data.
    pub(crate) description: Option<Cow<'static, str>>,
    /// The unit of measurement recorded.
    pub(crate) unit: Option<Cow<'static, str>>,
    /// Aggregation the stream uses for an instrument.
    pub(crate) aggregation: Option<Aggregation>,
    /// An allow-list of attribute keys that will be preserved for the stream.
    ///
    /// Any attribute recorded for the stream with a key not in this set will
    /// be dropped from the series key (it still reaches exemplars). If the set
    /// is empty all attributes are dropped; if `None` all attributes are kept.
    pub(crate) allowed_attribute_keys: Option<Arc<HashSet<Key>>>,
    /// Cardinality limit for the stream.
    pub(crate) cardinality_limit: Option<usize>,
}

impl Stream {
    /// Create a new stream builder with default values.
    pub fn builder() -> StreamBuilder {
        StreamBuilder::default()
    }
}

/// A builder for creating [Stream] objects.
#[derive(Default, Debug)]
pub struct StreamBuilder {
    name: Option<Cow<'static, str>>,
    description: Option<Cow<'static, str>>,
    unit: Option<Cow<'static, str>>,
    aggregation: Option<Aggregation>,
    allowed_attribute_keys: Option<Arc<HashSet<Key>>>,
    cardinality_limit: Option<usize>,
}

impl StreamBuilder {
    /// Set the stream name. If not set, the instrument name is used.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the stream description. If not set, the instrument description is used.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the stream unit. If not set, the instrument unit is used.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the stream aggregation, overriding the default for the instrument
    /// kind.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// Set the stream allowed attribute keys.
    ///
    /// Any attribute recorded for the stream with a key not in this set will be
    /// dropped from the series key. If this method is not used, all attributes
    /// will be kept.
    pub fn with_allowed_attribute_keys(
        mut self,
        attribute_keys: impl IntoIterator<Item = Key>,
    ) -> Self {
        self.allowed_attribute_keys = Some(Arc::new(attribute_keys.into_iter().collect()));
        self
    }

    /// Set the stream cardinality limit. If this is not set, the default limit
    /// of 2000 is used.
    pub fn with_cardinality_limit(mut self, limit: usize) -> Self {
        self.cardinality_limit = Some(limit);
        self
    }

    /// Build a new [Stream], validating the configuration.
    pub fn build(self) -> MetricResult<Stream> {
        if let Some(aggregation) = &self.aggregation {
            aggregation.validate()?;
        }

        if let Some(limit) = self.cardinality_limit {
            if limit == 0 {
                return Err(MetricError::InvalidInstrumentConfiguration(
                    "cardinality limit must be greater than 0",
                ));
            }
        }

        Ok(Stream {
            name: self.name,
            description: self.description,
            unit: self.unit,
            aggregation: self.aggregation,
            allowed_attribute_keys: self.allowed_attribute_keys,
            cardinality_limit: self.cardinality_limit,
        })
    }
}

/// The recording handle returned when an instrument is registered.
///
/// One handle fans a measurement out to every stream a view mapped the
/// instrument onto. Recording is safe from any thread and never blocks beyond
/// short internal critical sections.
pub struct Recorder<T> {
    measures: Vec<Arc<dyn Measure<T>>>,
}

impl<T> Recorder<T> {
    pub(crate) fn new(measures: Vec<Arc<dyn Measure<T>>>) -> Self {
        Recorder { measures }
    }
}

impl<T: Number> Recorder<T> {
    /// Records one measurement against every stream of this instrument.
    ///
    /// `context` is the trace state active at the call site, if any; it feeds
    /// exemplar sampling only.
    pub fn record(&self, value: T, attributes: &[KeyValue], context: Option<&TraceContext>) {
        for measure in &self.measures {
            measure.call(value, attributes, context)
        }
    }
}

impl<T> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("streams", &self.measures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::DefaultHasher;

    fn hash_of(descriptor: &InstrumentDescriptor) -> u64 {
        let mut hasher = DefaultHasher::new();
        descriptor.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identity_is_case_insensitive_on_name() {
        let a = InstrumentDescriptor::builder("Requests", InstrumentKind::Counter, ValueType::U64)
            .with_unit("1")
            .build();
        let b = InstrumentDescriptor::builder("requests", InstrumentKind::Counter, ValueType::U64)
            .with_unit("1")
            .build();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn advice_is_excluded_from_identity() {
        let plain =
            InstrumentDescriptor::builder("latency", InstrumentKind::Histogram, ValueType::F64)
                .build();
        let advised =
            InstrumentDescriptor::builder("latency", InstrumentKind::Histogram, ValueType::F64)
                .with_advice(Advice {
                    explicit_bucket_boundaries: Some(vec![0.5, 1.0]),
                })
                .build();

        assert_eq!(plain, advised);
        assert_eq!(hash_of(&plain), hash_of(&advised));
    }

    #[test]
    fn kind_and_value_type_are_identifying() {
        let counter = InstrumentDescriptor::builder("n", InstrumentKind::Counter, ValueType::U64)
            .build();
        let gauge =
            InstrumentDescriptor::builder("n", InstrumentKind::Gauge, ValueType::U64).build();
        let float_counter =
            InstrumentDescriptor::builder("n", InstrumentKind::Counter, ValueType::F64).build();

        assert_ne!(counter, gauge);
        assert_ne!(counter, float_counter);
    }

    #[test]
    fn normalize_lowercases_stream_names() {
        let mut id = InstrumentId {
            name: "MiXeD".into(),
            description: "".into(),
            kind: InstrumentKind::Counter,
            unit: "".into(),
            number: "u64".into(),
        };
        id.normalize();
        assert_eq!(id.name, "mixed");
    }

    #[test]
    fn zero_cardinality_limit_rejected() {
        let result = Stream::builder().with_cardinality_limit(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn updown_counters_stay_cumulative_under_delta_preference() {
        assert_eq!(
            InstrumentKind::UpDownCounter.temporality_preference(Temporality::Delta),
            Temporality::Cumulative
        );
        assert_eq!(
            InstrumentKind::Counter.temporality_preference(Temporality::Delta),
            Temporality::Delta
        );
    }
}
