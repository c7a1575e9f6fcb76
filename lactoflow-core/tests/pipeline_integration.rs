//! End-to-end pipeline scenarios driven through `QualityEngine` with
//! deterministic port stubs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use lactoflow_core::alerts::AlertStatus;
use lactoflow_core::dispatch::RecommendationSource;
use lactoflow_core::drift::{Direction, Statistic};
use lactoflow_core::retry::RetryConfig;
use lactoflow_core::sinks::load_jsonl;
use lactoflow_core::{
    AlertFilter, AlertRule, EngineConfig, EntityKey, ExplainTarget, Level, MemorySink, Metric,
    MockAdvisor, MockExplainer, MockPredictor, Prediction, QualityEngine, RawReading, Record,
    RuleKind, SeverityMapping, Severity,
};

fn reading(id: &str, supplier: &str, at: DateTime<Utc>, features: Vec<f64>) -> RawReading {
    RawReading {
        sample_id: Some(id.into()),
        timestamp: Some(at),
        supplier_id: Some(supplier.into()),
        route_id: Some("route-a".into()),
        batch_id: Some("batch-a".into()),
        device_id: Some("analyser-1".into()),
        spectral_features: Some(features),
    }
}

fn supplier_rule(id: &str, kind: RuleKind, severity: Severity) -> AlertRule {
    AlertRule {
        id: id.into(),
        description: String::new(),
        level: Level::Supplier,
        metric: Metric::Fat,
        kind,
        min_consecutive: 1,
        min_samples: 0,
        severity: SeverityMapping::fixed(severity),
        cooldown_secs: None,
    }
}

async fn wait_for_completed(engine: &QualityEngine, n: u64) {
    for _ in 0..500 {
        let m = engine.metrics();
        if m.samples_processed + m.samples_degraded >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine did not complete {n} samples in time");
}

fn start(config: EngineConfig) -> QualityEngine {
    QualityEngine::builder(config)
        .predictor(Arc::new(MockPredictor::echo()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn fat_drop_over_three_samples_opens_one_high_alert() {
    let mut config = EngineConfig::default();
    config.rules = vec![supplier_rule(
        "fat_drop",
        RuleKind::Trend {
            direction: Direction::Falling,
            min_change: 1.5,
            span: 3,
        },
        Severity::High,
    )];
    let engine = start(config);
    let t0 = Utc::now() - ChronoDuration::hours(1);

    for (i, fat) in [4.0, 3.0].into_iter().enumerate() {
        let at = t0 + ChronoDuration::seconds(i as i64);
        assert!(engine.ingest(reading(&format!("s{i}"), "sup-1", at, vec![fat])).is_ack());
        wait_for_completed(&engine, i as u64 + 1).await;
        assert!(engine.get_alerts(&AlertFilter::default()).is_empty());
    }

    let at = t0 + ChronoDuration::seconds(2);
    assert!(engine.ingest(reading("s2", "sup-1", at, vec![2.0])).is_ack());
    wait_for_completed(&engine, 3).await;

    let alerts = engine.get_alerts(&AlertFilter::default());
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_id, "fat_drop");
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].status, AlertStatus::Open);
    assert_eq!(alerts[0].entity, EntityKey::new(Level::Supplier, "sup-1"));
    assert_eq!(alerts[0].sample_id, "s2");

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(engine.metrics().alerts_opened, 1);
}

#[tokio::test]
async fn cooldown_resolves_once_and_reviolation_opens_fresh_alert() {
    let mut config = EngineConfig::default();
    config.alerts.cooldown_secs = 60;
    config.rules = vec![supplier_rule(
        "supplier_low_fat",
        RuleKind::Absolute {
            min: Some(2.5),
            max: None,
            statistic: Statistic::Value,
        },
        Severity::Medium,
    )];
    let engine = start(config);
    let t0 = Utc::now() - ChronoDuration::hours(1);
    let steps = [(0, 2.0), (30, 2.0), (200, 4.0), (300, 2.0)];

    for (i, (offset, fat)) in steps.into_iter().enumerate() {
        let at = t0 + ChronoDuration::seconds(offset);
        assert!(engine.ingest(reading(&format!("c{i}"), "sup-c", at, vec![fat])).is_ack());
        wait_for_completed(&engine, i as u64 + 1).await;
    }
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    let alerts = engine.get_alerts(&AlertFilter {
        rule_id: Some("supplier_low_fat".into()),
        ..Default::default()
    });
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].status, AlertStatus::Resolved);
    assert_eq!(alerts[0].trigger_count, 2);
    assert!(alerts[0].resolved_at.is_some());
    assert_eq!(alerts[1].status, AlertStatus::Open);
    assert_ne!(alerts[0].id, alerts[1].id);

    let metrics = engine.metrics();
    assert_eq!(metrics.alerts_opened, 2);
    assert_eq!(metrics.alerts_suppressed, 1);
    assert_eq!(metrics.alerts_resolved, 1);
}

#[tokio::test]
async fn inference_failures_degrade_only_affected_samples() {
    let mut config = EngineConfig::default();
    config.pipeline.workers = 4;
    let engine = Arc::new(start(config));
    let t0 = Utc::now() - ChronoDuration::hours(1);

    let mut tasks = Vec::new();
    for supplier in ["healthy", "flaky"] {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..20 {
                // Negative first feature makes the echo predictor fail.
                let fat = if supplier == "flaky" && i % 2 == 0 { -1.0 } else { 4.0 };
                let at = t0 + ChronoDuration::seconds(i);
                let ack = engine.ingest(reading(&format!("{supplier}-{i}"), supplier, at, vec![fat]));
                assert!(ack.is_ack());
            }
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    let healthy = engine.get_aggregate(Level::Supplier, "healthy", None).unwrap();
    let flaky = engine.get_aggregate(Level::Supplier, "flaky", None).unwrap();
    assert_eq!(healthy.count, 20);
    assert_eq!(flaky.count, 10);
    assert_eq!(engine.get_aggregate(Level::Route, "route-a", None).unwrap().count, 30);

    let metrics = engine.metrics();
    assert_eq!(metrics.samples_processed, 30);
    assert_eq!(metrics.samples_degraded, 10);
}

#[tokio::test]
async fn concurrent_workers_never_duplicate_live_alerts() {
    let mut config = EngineConfig::default();
    config.pipeline.workers = 8;
    let engine = Arc::new(start(config));
    let t0 = Utc::now() - ChronoDuration::hours(1);

    // Low fat everywhere: route, batch and sample rules fire from every worker.
    let mut tasks = Vec::new();
    for s in 0..32 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let at = t0 + ChronoDuration::seconds(i);
                let id = format!("sup{s}-{i}");
                let ack = engine.ingest(reading(&id, &format!("sup{s}"), at, vec![1.5, 7.0, 9.0, 5.0]));
                assert!(ack.is_ack());
            }
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    engine.shutdown(Duration::from_secs(10)).await.unwrap();

    let mut live: HashMap<(String, EntityKey), usize> = HashMap::new();
    for alert in engine.get_alerts(&AlertFilter::default()) {
        if alert.is_active() {
            *live.entry((alert.rule_id.clone(), alert.entity.clone())).or_default() += 1;
        }
    }
    assert!(live.values().all(|n| *n == 1), "duplicate live alerts: {live:?}");
    assert_eq!(
        live.keys()
            .filter(|(rule, _)| rule == "route_quality_low")
            .count(),
        1
    );
    assert_eq!(live.keys().filter(|(rule, _)| rule == "low_fat").count(), 320);
}

#[tokio::test]
async fn on_demand_explanation_is_single_flight() {
    let mut config = EngineConfig::default();
    config.explain.enabled = false;
    let explainer = Arc::new(MockExplainer::new().with_delay(Duration::from_millis(50)));
    let engine = Arc::new(
        QualityEngine::builder(config)
            .predictor(Arc::new(MockPredictor::echo()))
            .explainer(explainer.clone())
            .build()
            .unwrap(),
    );
    let at = Utc::now() - ChronoDuration::minutes(5);
    assert!(engine.ingest(reading("x-1", "sup-x", at, vec![4.0, 8.5, 12.5])).is_ack());
    wait_for_completed(&engine, 1).await;
    assert_eq!(explainer.calls(), 0);

    let requests = (0..16).map(|_| {
        let engine = engine.clone();
        async move { engine.get_explanation("x-1", ExplainTarget::Fat).await }
    });
    let records: Vec<_> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(Option::unwrap)
        .collect();

    assert_eq!(explainer.calls(), 1);
    assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
    assert_eq!(records[0].attributions, vec![4.0, 17.0, 37.5]);

    engine.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn failing_advisor_leaves_fallback_recommendation() {
    let mut config = EngineConfig::default();
    config.dispatch.timeout_ms = 100;
    config.dispatch.retry = RetryConfig {
        max_retries: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        backoff_multiplier: 2.0,
        jitter: false,
    };
    let advisor = Arc::new(MockAdvisor::failing());
    let engine = QualityEngine::builder(config)
        .predictor(Arc::new(MockPredictor::echo()))
        .advisor(advisor.clone())
        .build()
        .unwrap();
    let at = Utc::now() - ChronoDuration::minutes(5);
    assert!(engine.ingest(reading("f-1", "sup-f", at, vec![2.0])).is_ack());
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    let alerts = engine.get_alerts(&AlertFilter {
        rule_id: Some("low_fat".into()),
        ..Default::default()
    });
    assert_eq!(alerts.len(), 1);
    let recommendation = alerts[0].recommendation.as_ref().unwrap();
    assert_eq!(recommendation.source, RecommendationSource::Fallback);
    assert_eq!(recommendation.urgency, Severity::Medium);
    assert!(advisor.calls() >= 2);
}

#[tokio::test]
async fn jsonl_sink_receives_every_record_kind() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.sinks.jsonl_dir = Some(dir.path().to_path_buf());
    let memory = Arc::new(MemorySink::new());
    let engine = QualityEngine::builder(config)
        .predictor(Arc::new(MockPredictor::echo()))
        .sync_sink(memory.clone())
        .build()
        .unwrap();
    let t0 = Utc::now() - ChronoDuration::minutes(30);

    assert!(engine.ingest(reading("j-1", "sup-j", t0, vec![4.0])).is_ack());
    assert!(engine
        .ingest(reading("j-2", "sup-j", t0 + ChronoDuration::seconds(1), vec![2.0]))
        .is_ack());
    let report = engine.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(!report.timed_out);

    let sink = lactoflow_core::JsonlSink::new(dir.path());
    let samples = load_jsonl(&sink.path_for("sample")).unwrap();
    assert_eq!(samples.len(), 2);
    assert!(matches!(&samples[0], Record::Sample(s) if s.id == "j-1"));
    assert_eq!(load_jsonl(&sink.path_for("aggregate")).unwrap().len(), 8);
    let alerts = load_jsonl(&sink.path_for("alert")).unwrap();
    assert!(alerts
        .iter()
        .any(|r| matches!(r, Record::Alert(a) if a.rule_id == "low_fat")));

    let payloads = memory.payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1].aggregates.len(), 4);
    assert!(payloads[1].alerts.iter().any(|a| a.rule_id == "low_fat"));
}

#[tokio::test]
async fn erratic_supplier_fat_raises_stability_alert() {
    let engine = start(EngineConfig::default());
    let t0 = Utc::now() - ChronoDuration::hours(1);

    for (i, fat) in [4.1, 4.0, 4.2, 4.1, 4.0, 4.1].into_iter().enumerate() {
        let at = t0 + ChronoDuration::minutes(i as i64);
        assert!(engine.ingest(reading(&format!("st{i}"), "sup-steady", at, vec![fat])).is_ack());
    }
    for (i, fat) in [3.0, 6.0, 3.0, 6.0, 3.0, 6.0].into_iter().enumerate() {
        let at = t0 + ChronoDuration::minutes(i as i64);
        assert!(engine.ingest(reading(&format!("er{i}"), "sup-erratic", at, vec![fat])).is_ack());
    }
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    let alerts = engine.get_alerts(&AlertFilter {
        rule_id: Some("supplier_stability_drop".into()),
        ..Default::default()
    });
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].entity, EntityKey::new(Level::Supplier, "sup-erratic"));
    assert_eq!(alerts[0].severity, Severity::Low);
    // Rules on derived statistics wait for five samples.
    assert_eq!(alerts[0].sample_id, "er4");
    assert!(alerts[0].measured < 0.5);

    // Alternating readings hold or rise on half the steps.
    assert!(engine
        .get_alerts(&AlertFilter {
            rule_id: Some("supplier_persistence_low".into()),
            ..Default::default()
        })
        .is_empty());
}

#[tokio::test]
async fn flagged_adulteration_opens_one_high_alert() {
    // Risk above the 50 flag threshold but below 80.
    let predictor = MockPredictor::new(|features| {
        Ok(Prediction {
            fat: 4.0,
            snf: 8.5,
            ts: 12.5,
            milk_type: None,
            adulteration_risk: if features[0] > 0.0 { 60.0 } else { 40.0 },
            confidence: 0.95,
            model_version: None,
        })
    });
    let engine = QualityEngine::builder(EngineConfig::default())
        .predictor(Arc::new(predictor))
        .build()
        .unwrap();
    let at = Utc::now() - ChronoDuration::minutes(5);
    assert!(engine.ingest(reading("a-60", "sup-a", at, vec![1.0])).is_ack());
    assert!(engine.ingest(reading("a-40", "sup-a", at, vec![-1.0])).is_ack());
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    let alerts = engine.get_alerts(&AlertFilter {
        rule_id: Some("critical_adulteration".into()),
        ..Default::default()
    });
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].sample_id, "a-60");
    assert_eq!(alerts[0].entity.level, Level::Sample);
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].status, AlertStatus::Open);
}

#[tokio::test]
async fn aggregate_as_of_returns_state_at_that_instant() {
    let engine = start(EngineConfig::default());
    let t0 = Utc::now() - ChronoDuration::hours(1);

    for (i, fat) in [4.0, 3.0, 2.0].into_iter().enumerate() {
        let at = t0 + ChronoDuration::minutes(5 * i as i64);
        assert!(engine.ingest(reading(&format!("h{i}"), "sup-h", at, vec![fat])).is_ack());
    }
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    let past = engine
        .get_aggregate(Level::Supplier, "sup-h", Some(t0 + ChronoDuration::minutes(6)))
        .unwrap();
    assert_eq!(past.count, 2);
    assert_eq!(past.mean(Metric::Fat), Some(3.5));
    assert_eq!(past.last_sample_id, "h1");
    assert_eq!(past.window.len(), 2);

    let now = engine.get_aggregate(Level::Supplier, "sup-h", None).unwrap();
    assert_eq!(now.count, 3);
    assert_eq!(now.mean(Metric::Fat), Some(3.0));

    // The route saw the same three samples.
    let route = engine
        .get_aggregate(Level::Route, "route-a", Some(t0 + ChronoDuration::minutes(6)))
        .unwrap();
    assert_eq!(route.count, 2);

    assert!(engine
        .get_aggregate(Level::Supplier, "sup-h", Some(t0 - ChronoDuration::minutes(1)))
        .is_none());
}
