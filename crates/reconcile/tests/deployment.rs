#![forbid(unsafe_code)]

mod common;

use common::*;
use lso_core::{ArtifactStore, ObjectKind, StoreError};
use lso_reconcile::{reconcile_deployment, ApplyPath};
use lso_store::{Op, Verb};
use serde_json::json;

fn op(verb: Verb, kind: ObjectKind, name: &str) -> Op {
    Op { verb, kind, namespace: NS.to_string(), name: name.to_string() }
}

fn seed_inputs(mem: &lso_store::MemStore) {
    seed(mem, ObjectKind::Input, input("beats", Some(5044), "beats {}", &[("tier", "edge")]));
    seed(mem, ObjectKind::Input, input("syslog", Some(5514), "syslog {}", &[("tier", "edge")]));
    seed(mem, ObjectKind::Input, input("internal", None, "generator {}", &[("tier", "edge")]));
    seed(mem, ObjectKind::Input, input("core", Some(6000), "tcp {}", &[("tier", "core")]));
}

fn container_ports(mem: &lso_store::MemStore) -> Vec<i64> {
    let sts = live(mem, ObjectKind::StatefulSet, "ls");
    sts["spec"]["template"]["spec"]["containers"][0]["ports"]
        .as_array()
        .map(|a| a.iter().filter_map(|p| p["containerPort"].as_i64()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn first_reconcile_creates_every_artifact_in_order() {
    let (mem, ctx) = setup();
    seed_inputs(&mem);
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(3), &["main"], Some(&[("tier", "edge")])));

    let out = reconcile_deployment(&ctx, &d).await.unwrap();
    assert_eq!(out.path, ApplyPath::Create);
    assert_eq!(out.exposures, vec!["ls-beats", "ls-syslog"]);
    assert_eq!(
        mem.writes(),
        vec![
            op(Verb::Create, ObjectKind::ConfigMap, "ls-config"),
            op(Verb::Create, ObjectKind::ConfigMap, "ls-pipelines"),
            op(Verb::Create, ObjectKind::StatefulSet, "ls"),
            op(Verb::Create, ObjectKind::Service, "ls-beats"),
            op(Verb::Create, ObjectKind::Service, "ls-syslog"),
            op(Verb::PatchStatus, ObjectKind::Deployment, "ls"),
        ]
    );
    assert_eq!(container_ports(&mem), vec![5044, 5514]);
    let sts = live(&mem, ObjectKind::StatefulSet, "ls");
    assert_eq!(sts["spec"]["replicas"], 3);
    assert_eq!(sts["metadata"]["ownerReferences"][0]["uid"], d["metadata"]["uid"]);

    let status = live(&mem, ObjectKind::Deployment, "ls")["status"].clone();
    assert_eq!(status["statefulSet"], "ls");
    assert_eq!(status["replicas"], 3);
}

#[tokio::test]
async fn interrupted_creation_resumes_on_retry() {
    let (mem, ctx) = setup();
    seed_inputs(&mem);
    seed(&mem, ObjectKind::Deployment, deployment("ls", Some(2), &["main"], Some(&[("tier", "edge")])));
    mem.fail_next(Verb::Create, ObjectKind::StatefulSet, Some("ls"), StoreError::Backend("connection reset".into()));

    let err = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(mem.peek(ObjectKind::ConfigMap, NS, "ls-config").is_some());
    assert!(mem.peek(ObjectKind::StatefulSet, NS, "ls").is_none());
    assert!(live(&mem, ObjectKind::Deployment, "ls").get("status").is_none());

    let out = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();
    assert_eq!(out.path, ApplyPath::Create);
    assert!(mem.peek(ObjectKind::StatefulSet, NS, "ls").is_some());
    assert!(mem.peek(ObjectKind::Service, NS, "ls-syslog").is_some());
}

#[tokio::test]
async fn replica_change_only_touches_the_workload() {
    let (mem, ctx) = setup();
    seed_inputs(&mem);
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(3), &["main"], Some(&[("tier", "edge")])));
    reconcile_deployment(&ctx, &d).await.unwrap();

    mem.patch(ObjectKind::Deployment, NS, "ls", &json!({"spec": {"replicas": 5}})).await.unwrap();
    mem.clear_ops();
    let out = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();

    assert_eq!(out.path, ApplyPath::Scale);
    assert_eq!(
        mem.writes(),
        vec![op(Verb::Patch, ObjectKind::StatefulSet, "ls"), op(Verb::PatchStatus, ObjectKind::Deployment, "ls")]
    );
    assert_eq!(live(&mem, ObjectKind::StatefulSet, "ls")["spec"]["replicas"], 5);
    assert_eq!(live(&mem, ObjectKind::Deployment, "ls")["status"]["replicas"], 5);
}

#[tokio::test]
async fn scale_recreates_a_missing_workload() {
    let (mem, ctx) = setup();
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(1), &["main"], None));
    reconcile_deployment(&ctx, &d).await.unwrap();
    mem.delete(ObjectKind::StatefulSet, NS, "ls").await.unwrap();

    mem.patch(ObjectKind::Deployment, NS, "ls", &json!({"spec": {"replicas": 4}})).await.unwrap();
    let out = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();
    assert_eq!(out.path, ApplyPath::Full);
    assert_eq!(live(&mem, ObjectKind::StatefulSet, "ls")["spec"]["replicas"], 4);
}

#[tokio::test]
async fn removed_input_drops_its_service_and_port() {
    let (mem, ctx) = setup();
    seed_inputs(&mem);
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(3), &["main"], Some(&[("tier", "edge")])));
    reconcile_deployment(&ctx, &d).await.unwrap();

    mem.delete(ObjectKind::Input, NS, "beats").await.unwrap();
    let out = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();

    assert_eq!(out.path, ApplyPath::Full);
    assert_eq!(out.removed, vec!["ls-beats"]);
    assert!(mem.peek(ObjectKind::Service, NS, "ls-beats").is_none());
    assert!(mem.peek(ObjectKind::Service, NS, "ls-syslog").is_some());
    assert_eq!(container_ports(&mem), vec![5514]);
}

#[tokio::test]
async fn new_input_gets_an_exposure() {
    let (mem, ctx) = setup();
    seed_inputs(&mem);
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(1), &["main"], Some(&[("tier", "edge")])));
    reconcile_deployment(&ctx, &d).await.unwrap();

    seed(&mem, ObjectKind::Input, input("http", Some(8080), "http {}", &[("tier", "edge")]));
    let out = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();
    assert_eq!(out.exposures, vec!["ls-beats", "ls-http", "ls-syslog"]);
    assert_eq!(live(&mem, ObjectKind::Service, "ls-http")["spec"]["ports"][0]["port"], 8080);
    assert_eq!(container_ports(&mem), vec![5044, 5514, 8080]);
}

#[tokio::test]
async fn missing_replicas_is_a_reported_configuration_error() {
    let (mem, ctx) = setup();
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", None, &["main"], None));

    let err = reconcile_deployment(&ctx, &d).await.unwrap_err();
    assert!(err.is_permanent());
    let status = live(&mem, ObjectKind::Deployment, "ls")["status"].clone();
    assert!(status["error"].as_str().unwrap_or_default().contains("replicas"));
    assert!(mem.snapshot(ObjectKind::StatefulSet, NS).is_empty());
    assert!(mem.snapshot(ObjectKind::ConfigMap, NS).is_empty());
}

#[tokio::test]
async fn fixed_configuration_clears_the_reported_error() {
    let (mem, ctx) = setup();
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", None, &["main"], None));
    reconcile_deployment(&ctx, &d).await.unwrap_err();

    mem.patch(ObjectKind::Deployment, NS, "ls", &json!({"spec": {"replicas": 2}})).await.unwrap();
    reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();
    let status = live(&mem, ObjectKind::Deployment, "ls")["status"].clone();
    assert!(status.get("error").is_none(), "stale error kept: {}", status);
    assert_eq!(status["replicas"], 2);

    mem.clear_ops();
    reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();
    assert!(
        mem.writes().iter().all(|o| o.verb != Verb::PatchStatus),
        "status rewritten on a converged deployment: {:?}",
        mem.writes()
    );
}

#[tokio::test]
async fn engine_config_drift_is_converged() {
    let (mem, ctx) = setup();
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(1), &["main"], None));
    reconcile_deployment(&ctx, &d).await.unwrap();
    let expected = live(&mem, ObjectKind::ConfigMap, "ls-config")["data"].clone();

    mem.patch(ObjectKind::ConfigMap, NS, "ls-config", &json!({"data": {"logstash.yml": "tampered", "extra": "x"}}))
        .await
        .unwrap();
    let out = reconcile_deployment(&ctx, &live(&mem, ObjectKind::Deployment, "ls")).await.unwrap();
    assert_eq!(out.path, ApplyPath::Full);
    assert_eq!(live(&mem, ObjectKind::ConfigMap, "ls-config")["data"], expected);
}

#[tokio::test]
async fn deleting_the_deployment_collects_its_artifacts() {
    let (mem, ctx) = setup();
    seed_inputs(&mem);
    let d = seed(&mem, ObjectKind::Deployment, deployment("ls", Some(1), &["main"], Some(&[("tier", "edge")])));
    reconcile_deployment(&ctx, &d).await.unwrap();

    mem.delete(ObjectKind::Deployment, NS, "ls").await.unwrap();
    assert!(mem.snapshot(ObjectKind::ConfigMap, NS).is_empty());
    assert!(mem.snapshot(ObjectKind::StatefulSet, NS).is_empty());
    assert!(mem.snapshot(ObjectKind::Service, NS).is_empty());
}
