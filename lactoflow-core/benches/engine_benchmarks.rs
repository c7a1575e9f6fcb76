use chrono::{Duration, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

use lactoflow_core::aggregator::{AggregationConfig, HierarchicalAggregator, RunningStats};
use lactoflow_core::alerts::{AlertConfig, AlertEngine};
use lactoflow_core::drift::DriftDetector;
use lactoflow_core::normalizer::{NormalizerConfig, SampleNormalizer};
use lactoflow_core::types::QualityMetrics;
use lactoflow_core::{RawReading, Sample, SampleStatus, default_rules};

fn sample(i: usize, fat: f64) -> Sample {
    Sample {
        id: format!("bench-{i}"),
        timestamp: Utc::now() - Duration::hours(1) + Duration::seconds(i as i64),
        device_id: "dev".into(),
        supplier_id: format!("sup-{}", i % 64),
        route_id: format!("route-{}", i % 8),
        batch_id: "batch".into(),
        spectral_features: Vec::new(),
        metrics: QualityMetrics {
            fat: Some(fat),
            snf: Some(8.5),
            ts: Some(fat + 8.5),
            adulteration_risk: Some(12.0),
            is_adulterated: Some(false),
            quality_score: Some(7.5),
            ..Default::default()
        },
        status: SampleStatus::Processed,
        degraded_reason: None,
    }
}

fn bench_running_stats(c: &mut Criterion) {
    c.bench_function("running_stats_push_1k", |b| {
        b.iter(|| {
            let mut stats = RunningStats::default();
            for i in 0..1000 {
                stats.push(black_box(4.0 + (i % 7) as f64 * 0.1));
            }
            stats.variance()
        })
    });
}

fn bench_aggregator(c: &mut Criterion) {
    c.bench_function("aggregator_update", |b| {
        let aggregator = HierarchicalAggregator::new(AggregationConfig::default());
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            aggregator.update(black_box(&sample(i, 4.0 + (i % 5) as f64 * 0.2)))
        })
    });
}

fn bench_detection(c: &mut Criterion) {
    let aggregator = HierarchicalAggregator::new(AggregationConfig::default());
    let mut snapshots = Vec::new();
    for i in 0..200 {
        snapshots = aggregator.update(&sample(i * 64, 4.0 + (i % 5) as f64 * 0.2)).unwrap_or_default();
    }
    let detector = DriftDetector::new(Arc::new(default_rules()));
    let trigger = sample(200 * 64, 2.0);

    c.bench_function("detector_evaluate_default_rules", |b| {
        b.iter(|| detector.evaluate(black_box(&trigger), black_box(&snapshots)))
    });

    c.bench_function("detect_and_record", |b| {
        let alerts = AlertEngine::new(AlertConfig::default(), &default_rules());
        b.iter(|| {
            for violation in detector.evaluate(&trigger, &snapshots) {
                black_box(alerts.record(&violation));
            }
        })
    });
}

fn bench_normalizer(c: &mut Criterion) {
    let normalizer = SampleNormalizer::new(NormalizerConfig::default());
    let features: Vec<f64> = (0..256).map(|i| (i as f64 * 0.01).sin()).collect();
    let mut i = 0usize;
    c.bench_function("normalize_256_features", |b| {
        b.iter(|| {
            i += 1;
            normalizer.normalize(black_box(RawReading {
                sample_id: Some(format!("n-{i}")),
                timestamp: Some(Utc::now()),
                supplier_id: Some("sup".into()),
                route_id: Some("route".into()),
                batch_id: Some("batch".into()),
                device_id: Some("dev".into()),
                spectral_features: Some(features.clone()),
            }))
        })
    });
}

criterion_group!(
    benches,
    bench_running_stats,
    bench_aggregator,
    bench_detection,
    bench_normalizer,
);
criterion_main!(benches);
