use crate::instrument::{InstrumentDescriptor, Stream};

/// Used to customize the metric streams the engine outputs.
///
/// A view maps registered instruments onto output [Stream]s: renaming,
/// changing the aggregation, or restricting the attribute keys that form the
/// series identity. The engine applies views as given; building them from
/// external configuration belongs to the registration layer.
///
/// `View` is implemented for all `Fn(&InstrumentDescriptor) -> Option<Stream>`.
///
/// ```
/// use metrics_engine::{InstrumentDescriptor, MetricsEngine, Stream};
///
/// let rename = |inst: &InstrumentDescriptor| {
///     if inst.name() == "latency" {
///         Stream::builder().with_name("request.latency").build().ok()
///     } else {
///         None
///     }
/// };
///
/// let engine = MetricsEngine::builder().with_view(rename).build();
/// # drop(engine)
/// ```
pub trait View: Send + Sync + 'static {
    /// Defines how data should be collected for certain instruments.
    ///
    /// Return the [Stream] to use for matching instruments, or `None` if there
    /// is no match.
    fn match_inst(&self, inst: &InstrumentDescriptor) -> Option<Stream>;
}

impl<T> View for T
where
    T: Fn(&InstrumentDescriptor) -> Option<Stream> + Send + Sync + 'static,
{
    fn match_inst(&self, inst: &InstrumentDescriptor) -> Option<Stream> {
        self(inst)
    }
}
