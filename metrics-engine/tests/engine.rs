//! End-to-end tests of the aggregation engine: registration, concurrent
//! recording, collection-cycle semantics, and exemplar sampling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use rstest::rstest;

use metrics_engine::{
    data::{self, MetricsData},
    Advice, Aggregation, ExemplarFilter, InstrumentDescriptor, InstrumentKind, Key, KeyValue,
    MetricsEngine, Stream, Temporality, TraceContext, ValueType,
};

fn u64_counter(name: &'static str) -> InstrumentDescriptor {
    InstrumentDescriptor::builder(name, InstrumentKind::Counter, ValueType::U64).build()
}

fn sum_points(snapshot: &MetricsData) -> u64 {
    snapshot
        .metrics
        .iter()
        .filter_map(|m| m.data.as_any().downcast_ref::<data::Sum<u64>>())
        .flat_map(|sum| sum.data_points.iter())
        .map(|dp| dp.value)
        .sum()
}

#[test]
fn no_lost_updates_under_concurrent_writers() {
    const THREADS: usize = 8;
    const UPDATES: usize = 1000;

    let engine = MetricsEngine::builder()
        .with_temporality(Temporality::Cumulative)
        .build();
    let recorder = engine.register_u64(&u64_counter("hits")).expect("register");
    let attrs = [KeyValue::new("shared", "series")];

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..UPDATES {
                    recorder.record(1, &attrs, None);
                }
            });
        }
    });

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    assert_eq!(sum_points(&snapshot), (THREADS * UPDATES) as u64);
}

#[test]
fn measurements_attributed_to_exactly_one_delta_cycle() {
    const THREADS: usize = 4;
    const UPDATES: usize = 5000;

    let engine = MetricsEngine::builder()
        .with_temporality(Temporality::Delta)
        .build();
    let recorder = engine.register_u64(&u64_counter("hits")).expect("register");
    let attrs = [KeyValue::new("shared", "series")];
    let observed = AtomicU64::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..UPDATES {
                    recorder.record(1, &attrs, None);
                }
            });
        }

        // collect repeatedly while the writers are still recording; every
        // measurement must land in exactly one cycle
        for _ in 0..50 {
            let mut snapshot = MetricsData::default();
            engine.collect(&mut snapshot).expect("collect");
            observed.fetch_add(sum_points(&snapshot), Ordering::Relaxed);
            thread::yield_now();
        }
    });

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("final collect");
    observed.fetch_add(sum_points(&snapshot), Ordering::Relaxed);

    assert_eq!(
        observed.load(Ordering::Relaxed),
        (THREADS * UPDATES) as u64
    );
}

#[rstest]
#[case::delta(Temporality::Delta, 3, 4)]
#[case::cumulative(Temporality::Cumulative, 3, 7)]
fn temporality_decides_what_consecutive_collections_report(
    #[case] temporality: Temporality,
    #[case] first: u64,
    #[case] second: u64,
) {
    let engine = MetricsEngine::builder()
        .with_temporality(temporality)
        .build();
    let recorder = engine.register_u64(&u64_counter("hits")).expect("register");
    let attrs = [KeyValue::new("k", "v")];

    let mut snapshot = MetricsData::default();

    recorder.record(3, &attrs, None);
    engine.collect(&mut snapshot).expect("collect");
    assert_eq!(sum_points(&snapshot), first);

    recorder.record(4, &attrs, None);
    engine.collect(&mut snapshot).expect("collect");
    assert_eq!(sum_points(&snapshot), second);
}

#[test]
fn cumulative_series_evicted_only_when_cold() {
    let engine = MetricsEngine::builder().build();
    let recorder = engine.register_u64(&u64_counter("hits")).expect("register");
    let attrs = [KeyValue::new("k", "v")];
    let mut snapshot = MetricsData::default();

    recorder.record(5, &attrs, None);
    engine.collect(&mut snapshot).expect("collect");
    assert_eq!(sum_points(&snapshot), 5);

    // untouched since the last cycle: evicted, nothing reported
    engine.collect(&mut snapshot).expect("collect");
    assert_eq!(snapshot.metrics.len(), 0);

    // recording again restarts the series
    recorder.record(2, &attrs, None);
    engine.collect(&mut snapshot).expect("collect");
    assert_eq!(sum_points(&snapshot), 2);
}

#[test]
fn gauge_reports_last_written_value() {
    let engine = MetricsEngine::builder().build();
    let gauge = engine
        .register_i64(
            &InstrumentDescriptor::builder("queue.depth", InstrumentKind::Gauge, ValueType::I64)
                .build(),
        )
        .expect("register");
    let attrs = [KeyValue::new("queue", "inbound")];

    gauge.record(10, &attrs, None);
    gauge.record(7, &attrs, None);

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let points = &snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Gauge<i64>>()
        .expect("gauge aggregation")
        .data_points;
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 7);
}

#[test]
fn advice_supplies_default_histogram_boundaries() {
    let engine = MetricsEngine::builder().build();
    let histogram = engine
        .register_f64(
            &InstrumentDescriptor::builder("latency", InstrumentKind::Histogram, ValueType::F64)
                .with_advice(Advice {
                    explicit_bucket_boundaries: Some(vec![1.0, 2.0]),
                })
                .build(),
        )
        .expect("register");

    histogram.record(1.5, &[], None);

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let dp = &snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Histogram<f64>>()
        .expect("histogram aggregation")
        .data_points[0];
    assert_eq!(dp.bounds, vec![1.0, 2.0]);
    assert_eq!(dp.bucket_counts, vec![0, 1, 0]);
}

#[test]
fn trace_based_exemplars_require_a_sampled_trace() {
    let engine = MetricsEngine::builder()
        .with_exemplar_filter(ExemplarFilter::TraceBased)
        .build();
    let recorder = engine.register_u64(&u64_counter("hits")).expect("register");
    let attrs = [KeyValue::new("k", "v")];

    let sampled = TraceContext {
        trace_id: [0xAB; 16],
        span_id: [0xCD; 8],
        sampled: true,
    };
    let unsampled = TraceContext {
        trace_id: [0x01; 16],
        span_id: [0x02; 8],
        sampled: false,
    };

    recorder.record(1, &attrs, Some(&unsampled));
    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let sum = snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Sum<u64>>()
        .expect("sum aggregation");
    assert!(sum.data_points[0].exemplars.is_empty());

    recorder.record(1, &attrs, Some(&sampled));
    engine.collect(&mut snapshot).expect("collect");
    let sum = snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Sum<u64>>()
        .expect("sum aggregation");
    let exemplar = sum.data_points[0]
        .exemplars
        .first()
        .expect("sampled trace produced an exemplar");
    assert_eq!(exemplar.trace_id, [0xAB; 16]);
    assert_eq!(exemplar.span_id, [0xCD; 8]);
}

#[test]
fn histogram_streams_keep_one_exemplar_per_bucket() {
    let engine = MetricsEngine::builder()
        .with_exemplar_filter(ExemplarFilter::AlwaysOn)
        // drop every attribute from the series key so all recordings share
        // one series and the distinguishing attribute survives on exemplars
        .with_view(|inst: &InstrumentDescriptor| {
            (inst.name() == "latency").then(|| {
                Stream::builder()
                    .with_allowed_attribute_keys(Vec::<Key>::new())
                    .build()
                    .expect("valid stream")
            })
        })
        .build();

    let histogram = engine
        .register_f64(
            &InstrumentDescriptor::builder("latency", InstrumentKind::Histogram, ValueType::F64)
                .with_advice(Advice {
                    explicit_bucket_boundaries: Some(vec![0.0, 10.0, 20.0]),
                })
                .build(),
        )
        .expect("register");

    for (value, label) in [(-1.0, "under"), (1.0, "low"), (11.0, "mid"), (21.0, "over")] {
        histogram.record(value, &[KeyValue::new("bucket", label)], None);
    }

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let dp = &snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Histogram<f64>>()
        .expect("histogram aggregation")
        .data_points[0];

    assert_eq!(dp.count, 4);
    assert_eq!(dp.exemplars.len(), 4);
    for label in ["under", "low", "mid", "over"] {
        assert!(dp
            .exemplars
            .iter()
            .any(|e| e.filtered_attributes == vec![KeyValue::new("bucket", label)]));
    }
}

#[test]
fn view_attribute_filter_narrows_series_but_not_exemplars() {
    let engine = MetricsEngine::builder()
        .with_exemplar_filter(ExemplarFilter::AlwaysOn)
        .with_view(|inst: &InstrumentDescriptor| {
            (inst.name() == "hits").then(|| {
                Stream::builder()
                    .with_allowed_attribute_keys([Key::new("route")])
                    .build()
                    .expect("valid stream")
            })
        })
        .build();

    let recorder = engine.register_u64(&u64_counter("hits")).expect("register");
    recorder.record(
        1,
        &[KeyValue::new("route", "/users"), KeyValue::new("user", "u1")],
        None,
    );
    recorder.record(
        1,
        &[KeyValue::new("route", "/users"), KeyValue::new("user", "u2")],
        None,
    );

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let sum = snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Sum<u64>>()
        .expect("sum aggregation");

    // both recordings collapse onto the route-keyed series
    assert_eq!(sum.data_points.len(), 1);
    assert_eq!(sum.data_points[0].value, 2);
    assert_eq!(
        sum.data_points[0].attributes,
        vec![KeyValue::new("route", "/users")]
    );

    // the filtered-out key survives on the exemplar
    let exemplar = sum.data_points[0].exemplars.first().expect("exemplar");
    assert!(exemplar
        .filtered_attributes
        .iter()
        .any(|kv| kv.key == Key::new("user")));
}

#[test]
fn exponential_histogram_stream_via_view() {
    let engine = MetricsEngine::builder()
        .with_view(|inst: &InstrumentDescriptor| {
            (inst.name() == "latency").then(|| {
                Stream::builder()
                    .with_aggregation(Aggregation::Base2ExponentialHistogram {
                        max_size: 160,
                        max_scale: 20,
                        record_min_max: true,
                    })
                    .build()
                    .expect("valid stream")
            })
        })
        .build();

    let histogram = engine
        .register_f64(
            &InstrumentDescriptor::builder("latency", InstrumentKind::Histogram, ValueType::F64)
                .build(),
        )
        .expect("register");

    for value in [0.5, 1.0, 2.0, 4.0] {
        histogram.record(value, &[], None);
    }

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let dp = &snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::ExponentialHistogram<f64>>()
        .expect("exponential histogram aggregation")
        .data_points[0];

    assert_eq!(dp.count, 4);
    assert_eq!(dp.min, Some(0.5));
    assert_eq!(dp.max, Some(4.0));
    assert_eq!(dp.positive_bucket.counts.iter().sum::<u64>(), 4);
}

#[test]
fn monotonic_counter_drops_invalid_measurements() {
    let engine = MetricsEngine::builder().build();
    let recorder = engine
        .register_f64(
            &InstrumentDescriptor::builder("total", InstrumentKind::Counter, ValueType::F64)
                .build(),
        )
        .expect("register");
    let attrs = [KeyValue::new("k", "v")];

    recorder.record(2.5, &attrs, None);
    recorder.record(-1.0, &attrs, None);
    recorder.record(f64::NAN, &attrs, None);

    let mut snapshot = MetricsData::default();
    engine.collect(&mut snapshot).expect("collect");
    let sum = snapshot.metrics[0]
        .data
        .as_any()
        .downcast_ref::<data::Sum<f64>>()
        .expect("sum aggregation");
    assert!((sum.data_points[0].value - 2.5).abs() < f64::EPSILON);
}
