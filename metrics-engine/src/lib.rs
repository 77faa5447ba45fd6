//! # Metrics Aggregation Engine
//!
//! The aggregation and exemplar-sampling core of a metrics SDK: it turns
//! high-frequency measurement calls into periodic, temporally consistent
//! snapshots suitable for export.
//!
//! The engine maintains per-instrument, per-attribute-set running state under
//! unbounded concurrent writers, supports cumulative and delta output
//! temporalities without losing or double-counting measurements across
//! collection boundaries, and attaches trace-correlated exemplars to each
//! aggregated series without materially affecting the recording path.
//!
//! Instrument builders, view configuration parsing, wire formats, and
//! transport are collaborators, not part of this crate: registration consumes
//! already-validated [InstrumentDescriptor]s, and collection hands immutable
//! [data::MetricsData] to whatever exporter the application wires up.
//!
//! ```
//! use metrics_engine::{
//!     data::MetricsData, InstrumentDescriptor, InstrumentKind, KeyValue, MetricsEngine,
//!     Temporality, ValueType,
//! };
//!
//! let engine = MetricsEngine::builder()
//!     .with_temporality(Temporality::Delta)
//!     .build();
//!
//! let requests = engine
//!     .register_u64(
//!         &InstrumentDescriptor::builder("requests", InstrumentKind::Counter, ValueType::U64)
//!             .with_unit("1")
//!             .build(),
//!     )
//!     .expect("free instrument name");
//!
//! requests.record(1, &[KeyValue::new("route", "/health")], None);
//!
//! let mut snapshot = MetricsData::default();
//! engine.collect(&mut snapshot).expect("collection cycle");
//! assert_eq!(snapshot.metrics.len(), 1);
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(test, deny(warnings))]

mod aggregation;
mod attributes;
pub mod data;
mod error;
mod exemplar;
mod instrument;
mod internal_logging;
#[doc(hidden)]
pub mod internal;
mod pipeline;
mod view;

pub use aggregation::Aggregation;
pub use attributes::{Array, Key, KeyValue, StringValue, Value};
pub use data::Temporality;
pub use error::{MetricError, MetricResult};
pub use exemplar::{ExemplarFilter, TraceContext};
pub use instrument::{
    Advice, InstrumentDescriptor, InstrumentDescriptorBuilder, InstrumentKind, Recorder, Stream,
    StreamBuilder, ValueType,
};
pub use internal::Number;
pub use pipeline::{MetricsEngine, MetricsEngineBuilder};
pub use view::View;

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
