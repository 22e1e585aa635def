mod support;

use fleetbench_core::scenario::{RepeatNode, ScaleNode, ScenarioNode, StageNode};
use fleetbench_core::stages::PUT;
use fleetbench_core::{FailureKind, ServiceState, StageResult};
use fleetbench_testservice::MemberOptions;
use fleetbench_value::Value;

fn load(iteration: &str, num_requests: impl Into<Value>) -> StageNode {
    StageNode::new("basic-operations")
        .property("test-name", "load")
        .property("iteration-name", iteration)
        .property("num-requests", num_requests)
        .property("write-percentage", 100i64)
}

fn iteration_names(outcome: &fleetbench_core::RunOutcome) -> Vec<String> {
    outcome
        .report
        .test("load")
        .map(|t| {
            t.iterations()
                .iter()
                .map(|it| it.name().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn repeat_binds_counter_per_iteration() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(1);
    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").into(),
            RepeatNode::range(0i64, 2i64, 1i64, vec![load("iter-${repeat.counter}", 1i64).into()])
                .named("outer")
                .into(),
        ])
        .await;
    cluster.shutdown().await;

    anyhow::ensure!(outcome.is_success(), "run failed: {:?}", outcome.failure);
    assert_eq!(outcome.dispatches, 4);
    assert_eq!(iteration_names(&outcome), vec!["iter-0", "iter-1", "iter-2"]);
    assert!(outcome.env.get("repeat.counter").is_none());
    assert!(outcome.env.get("repeat.outer.counter").is_none());
    Ok(())
}

#[tokio::test]
async fn analyze_picks_iteration_with_most_requests() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(1);
    let analyze = ScenarioNode::AnalyzeTest {
        properties: [
            ("testName", Value::string("load")),
            ("operation", Value::string(PUT)),
            ("statisticsType", Value::string("requests")),
            ("analysisType", Value::string("max")),
            ("resultType", Value::string("iteration")),
            ("storeResultTo", Value::string("best")),
            ("reportResult", Value::string("best-iteration")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect(),
    };

    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").into(),
            RepeatNode::times(
                3i64,
                vec![load("i", "#{[100, 250, 180].get(repeat.counter)}").into()],
            )
            .into(),
            analyze,
            StageNode::new("sleep")
                .property("duration", "#{${best} * 10}ms")
                .into(),
        ])
        .await;
    cluster.shutdown().await;

    anyhow::ensure!(outcome.is_success(), "run failed: {:?}", outcome.failure);
    assert_eq!(outcome.env.get("best"), Some(&Value::I64(1)));
    assert_eq!(
        outcome.report.results().get("best-iteration"),
        Some(&Value::I64(1))
    );
    Ok(())
}

#[tokio::test]
async fn scale_limits_dispatch_targets() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(3);
    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").into(),
            ScaleNode {
                from: Some(Value::I64(1)),
                to: Some(Value::I64(3)),
                inc: Some(Value::I64(2)),
                body: vec![load("size-${cluster.size}", 1i64).into()],
            }
            .into(),
        ])
        .await;
    cluster.shutdown().await;

    anyhow::ensure!(outcome.is_success(), "run failed: {:?}", outcome.failure);
    assert_eq!(iteration_names(&outcome), vec!["size-1", "size-3"]);
    let test = outcome
        .report
        .test("load")
        .ok_or_else(|| anyhow::anyhow!("missing test"))?;
    assert_eq!(test.iterations()[0].slaves().len(), 1);
    assert_eq!(test.iterations()[1].slaves().len(), 3);
    assert_eq!(outcome.env.get("cluster.size"), Some(&Value::I64(3)));
    Ok(())
}

#[tokio::test]
async fn advisory_failure_does_not_stop_the_run() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(2);
    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").into(),
            StageNode::new("check-cluster")
                .property("expected-members", 5i64)
                .advisory()
                .into(),
            StageNode::new("check-cluster").into(),
        ])
        .await;
    cluster.shutdown().await;

    anyhow::ensure!(outcome.is_success(), "run failed: {:?}", outcome.failure);
    assert_eq!(outcome.advisory_failures.len(), 1);
    let advisory = &outcome.advisory_failures[0];
    assert_eq!(advisory.position, "1");
    assert_eq!(advisory.result, StageResult::Failure);
    assert_eq!(advisory.details.len(), 2);
    Ok(())
}

#[tokio::test]
async fn failed_stage_aborts_and_stops_services() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(2);
    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").into(),
            RepeatNode::times(
                2i64,
                vec![
                    load("ok", 1i64).into(),
                    StageNode::new("check-cluster")
                        .property("expected-members", "#{2 + repeat.counter}")
                        .into(),
                ],
            )
            .into(),
            load("never", 1i64).into(),
        ])
        .await;

    let failure = outcome
        .failure
        .clone()
        .ok_or_else(|| anyhow::anyhow!("run should fail"))?;
    assert_eq!(failure.kind, FailureKind::Stage(StageResult::Failure));
    assert_eq!(failure.stage, "check-cluster");
    assert_eq!(failure.position, "1[1].1");
    assert_eq!(iteration_names(&outcome), vec!["ok", "ok"]);

    assert_eq!(cluster.grid.running_members(), 0);
    assert!(cluster.members.iter().all(|m| !m.is_running()));
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn undefined_variable_is_a_configuration_error() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(1);
    let outcome = cluster
        .run(vec![
            ScenarioNode::Define {
                name: "threads".to_string(),
                value: Value::string("${cores:4}"),
            },
            load("x", "${missing}").property("total-threads", "${threads}").into(),
        ])
        .await;
    cluster.shutdown().await;

    let failure = outcome
        .failure
        .ok_or_else(|| anyhow::anyhow!("run should fail"))?;
    assert_eq!(failure.kind, FailureKind::Configuration);
    assert_eq!(failure.position, "1");
    assert!(failure.message.contains("missing"), "{}", failure.message);
    assert_eq!(outcome.dispatches, 0);
    assert_eq!(outcome.env.get("threads"), Some(&Value::I64(4)));
    Ok(())
}

#[tokio::test]
async fn unknown_stage_is_rejected_before_dispatch() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster(1);
    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").into(),
            RepeatNode::times(1i64, vec![StageNode::new("warm-up").into()]).into(),
        ])
        .await;
    cluster.shutdown().await;

    let failure = outcome
        .failure
        .ok_or_else(|| anyhow::anyhow!("run should fail"))?;
    assert_eq!(failure.kind, FailureKind::Configuration);
    assert_eq!(failure.position, "1.0");
    assert_eq!(outcome.dispatches, 0);
    Ok(())
}

#[tokio::test]
async fn failed_start_leaves_service_failed() -> anyhow::Result<()> {
    let mut cluster = support::grid_cluster_with(2, |i| MemberOptions {
        fail_on_start: i == 1,
        ..MemberOptions::default()
    });
    let outcome = cluster
        .run(vec![
            StageNode::new("service-start").advisory().into(),
            StageNode::new("service-start").advisory().into(),
            load("after", 1i64).into(),
        ])
        .await;

    // The second start is a no-op on both slaves: one is started, the other stays failed.
    assert_eq!(outcome.advisory_failures.len(), 1);
    let failure = outcome
        .failure
        .ok_or_else(|| anyhow::anyhow!("load on a failed service should fail"))?;
    assert!(
        failure.message.contains(&ServiceState::Failed.to_string()),
        "{}",
        failure.message
    );
    cluster.shutdown().await;
    Ok(())
}
