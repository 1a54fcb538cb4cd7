#![forbid(unsafe_code)]

mod common;

use common::*;
use lso_core::{meta, ArtifactStore, ElementKind, ObjectKind};
use lso_reconcile::{handle_element, reconcile_deployment, reconcile_pipeline, ElementEvent, ReconcileError};
use serde_json::json;

const ARTIFACT: &str = "logstash-pipeline-main";

#[tokio::test]
async fn applied_filter_updates_matching_pipeline_and_marks_status() {
    let (mem, ctx) = setup();
    seed(&mem, ObjectKind::Pipeline, pipeline("main", &[("pipeline", "main")]));
    seed(&mem, ObjectKind::Pipeline, pipeline("audit", &[("pipeline", "audit")]));
    let f = seed(&mem, ObjectKind::Filter, filter("grok", 2, "grok {}", &[("pipeline", "main")]));

    let out = handle_element(&ctx, ElementKind::Filter, &ElementEvent::Applied(f)).await.unwrap();
    assert!(!out.skipped);
    assert_eq!(out.refreshed, vec!["main"]);
    assert_eq!(out.report.pipelines, 2);

    let data = meta::data(&live(&mem, ObjectKind::ConfigMap, ARTIFACT));
    assert_eq!(data.get("2-grok.conf").map(String::as_str), Some("filter {\ngrok {}\n}"));
    let status = &live(&mem, ObjectKind::Filter, "grok")["status"];
    assert!(status["propagated"].is_string());
    assert!(status["error"].is_null());
}

#[tokio::test]
async fn redelivered_event_is_skipped() {
    let (mem, ctx) = setup();
    seed(&mem, ObjectKind::Pipeline, pipeline("main", &[("pipeline", "main")]));
    let f = seed(&mem, ObjectKind::Filter, filter("grok", 2, "grok {}", &[("pipeline", "main")]));
    handle_element(&ctx, ElementKind::Filter, &ElementEvent::Applied(f)).await.unwrap();
    mem.clear_ops();

    let again = live(&mem, ObjectKind::Filter, "grok");
    let out = handle_element(&ctx, ElementKind::Filter, &ElementEvent::Applied(again)).await.unwrap();
    assert!(out.skipped);
    assert!(mem.writes().is_empty());
    assert_eq!(meta::generation_counter(&live(&mem, ObjectKind::Pipeline, "main")), 1);
}

#[tokio::test]
async fn config_change_after_propagation_is_handled_again() {
    let (mem, ctx) = setup();
    seed(&mem, ObjectKind::Pipeline, pipeline("main", &[("pipeline", "main")]));
    let f = seed(&mem, ObjectKind::Filter, filter("grok", 2, "grok {}", &[("pipeline", "main")]));
    handle_element(&ctx, ElementKind::Filter, &ElementEvent::Applied(f)).await.unwrap();

    let changed = mem
        .patch(ObjectKind::Filter, NS, "grok", &json!({"spec": {"config": "grok { match => {} }"}}))
        .await
        .unwrap();
    let out = handle_element(&ctx, ElementKind::Filter, &ElementEvent::Applied(changed)).await.unwrap();
    assert!(!out.skipped);
    let data = meta::data(&live(&mem, ObjectKind::ConfigMap, ARTIFACT));
    assert_eq!(data.get("2-grok.conf").map(String::as_str), Some("filter {\ngrok { match => {} }\n}"));
    assert_eq!(meta::generation_counter(&live(&mem, ObjectKind::Pipeline, "main")), 2);
}

#[tokio::test]
async fn deleted_filter_removes_its_key() {
    let (mem, ctx) = setup();
    seed(&mem, ObjectKind::Pipeline, pipeline("main", &[("pipeline", "main")]));
    let f = seed(&mem, ObjectKind::Filter, filter("grok", 2, "grok {}", &[("pipeline", "main")]));
    seed(&mem, ObjectKind::Filter, filter("mutate", 1, "mutate {}", &[("pipeline", "main")]));
    reconcile_pipeline(&ctx, &live(&mem, ObjectKind::Pipeline, "main")).await.unwrap();

    mem.delete(ObjectKind::Filter, NS, "grok").await.unwrap();
    let out = handle_element(&ctx, ElementKind::Filter, &ElementEvent::Deleted(f)).await.unwrap();
    assert_eq!(out.refreshed, vec!["main"]);
    let keys: Vec<String> = meta::data(&live(&mem, ObjectKind::ConfigMap, ARTIFACT)).into_keys().collect();
    assert_eq!(keys, vec!["1-mutate.conf", "input.conf", "output.conf"]);
}

#[tokio::test]
async fn invalid_element_is_reported_and_not_propagated() {
    let (mem, ctx) = setup();
    seed(&mem, ObjectKind::Pipeline, pipeline("main", &[]));
    let i = seed(&mem, ObjectKind::Input, input("bad", Some(70000), "tcp {}", &[]));

    let err = handle_element(&ctx, ElementKind::Input, &ElementEvent::Applied(i)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Permanent(_)));
    assert!(live(&mem, ObjectKind::Input, "bad")["status"]["error"].as_str().unwrap_or_default().contains("port"));
    assert_eq!(meta::generation_counter(&live(&mem, ObjectKind::Pipeline, "main")), 0);
}

#[tokio::test]
async fn input_change_reaches_the_deployment() {
    let (mem, ctx) = setup();
    seed(&mem, ObjectKind::Pipeline, pipeline("main", &[("tier", "edge")]));
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(1), &["main"], Some(&[("tier", "edge")])));
    reconcile_deployment(&ctx, &d).await.unwrap();
    assert!(mem.snapshot(ObjectKind::Service, NS).is_empty());

    let i = seed(&mem, ObjectKind::Input, input("beats", Some(5044), "beats {}", &[("tier", "edge")]));
    let out = handle_element(&ctx, ElementKind::Input, &ElementEvent::Applied(i)).await.unwrap();
    assert_eq!(out.report.deployments, 1);

    // the bump is what the controller reacts to; run the reconcile it would trigger
    let bumped = live(&mem, ObjectKind::Deployment, "ls");
    assert_eq!(meta::generation_counter(&bumped), 1);
    let outcome = reconcile_deployment(&ctx, &bumped).await.unwrap();
    assert_eq!(outcome.exposures, vec!["ls-beats"]);
    assert!(mem.peek(ObjectKind::Service, NS, "ls-beats").is_some());
}
