use crate::exemplar::TraceContext;

/// Policy deciding which measurements are offered to an exemplar reservoir.
///
/// The filter is evaluated once per measurement, before the reservoir sees it.
/// It is the only point where the tracing subsystem and the metrics subsystem
/// meet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExemplarFilter {
    /// Never sample. Disables exemplar collection entirely.
    AlwaysOff,
    /// Sample every measurement.
    AlwaysOn,
    /// Sample only measurements recorded while a sampled trace was active.
    #[default]
    TraceBased,
}

impl ExemplarFilter {
    pub(crate) fn should_sample(&self, context: Option<&TraceContext>) -> bool {
        match self {
            ExemplarFilter::AlwaysOff => false,
            ExemplarFilter::AlwaysOn => true,
            ExemplarFilter::TraceBased => context.is_some_and(|ctx| ctx.sampled),
        }
    }
}
