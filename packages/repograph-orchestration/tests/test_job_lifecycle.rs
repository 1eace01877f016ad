/// Job lifecycle integration tests
///
/// Drives whole jobs through the orchestrator with scripted stages: retry budgets,
/// failure propagation, stop/cancel and the derived job status.
mod common;

use common::{orchestrator, Attempt, ScriptedStage};
use proptest::prelude::*;
use repograph_orchestration::{
    ErrorCategory, JobEvent, JobOptions, JobStatus, JobStatusReport, Schedule, StageSettings,
    StepStatus,
};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn settled(report: &JobStatusReport) -> usize {
    report
        .steps
        .iter()
        .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_transient_step_retried_then_pipeline_completes() {
    let a = ScriptedStage::ok("A");
    let b = ScriptedStage::new("B", [Attempt::Transient, Attempt::Transient]);
    let c = ScriptedStage::ok("C");
    let orch = orchestrator(
        &[a.clone(), b.clone(), c.clone()],
        vec![
            StageSettings::new("A").max_retries(0),
            StageSettings::new("B").max_retries(2).back_off_seconds(1.0),
            StageSettings::new("C"),
        ],
    );

    let submitted = tokio::time::Instant::now();
    let id = orch.submit("repo-abc", JobOptions::new(), None).unwrap();
    let report = orch.wait_for(id).await.unwrap();
    let elapsed = submitted.elapsed();

    assert_eq!(report.status, JobStatus::Completed);
    let step_b = report.step("B").unwrap();
    assert_eq!(step_b.retry_count, 2);
    assert_eq!(step_b.status, StepStatus::Completed);
    assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 3, 1));

    // Two back-offs of one second between B's attempts
    let starts = b.started();
    assert!(starts[1] - starts[0] >= Duration::from_secs(1));
    assert!(starts[2] - starts[1] >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_retry_events_are_published() {
    let b = ScriptedStage::new("B", [Attempt::Transient]);
    let orch = orchestrator(
        &[b.clone()],
        vec![StageSettings::new("B").max_retries(1).back_off_seconds(0.5)],
    );
    let mut events = orch.subscribe();

    let id = orch.submit("repo", JobOptions::new(), None).unwrap();
    orch.wait_for(id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&JobEvent::JobAdmitted { job_id: id }));
    assert!(seen.iter().any(|e| matches!(
        e,
        JobEvent::StepRetrying { retry_count: 1, delay_ms: 500, .. }
    )));
    assert_eq!(
        seen.last(),
        Some(&JobEvent::JobFinished {
            job_id: id,
            status: JobStatus::Completed
        })
    );
}

#[tokio::test]
async fn test_fatal_failure_skips_later_steps() {
    let a = ScriptedStage::new("A", [Attempt::Fatal]);
    let b = ScriptedStage::ok("B");
    let orch = orchestrator(
        &[a.clone(), b.clone()],
        vec![StageSettings::new("A").max_retries(5), StageSettings::new("B")],
    );

    let id = orch.submit("repo", JobOptions::new(), None).unwrap();
    let report = orch.wait_for(id).await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    let step_a = report.step("A").unwrap();
    assert_eq!(step_a.status, StepStatus::Failed);
    assert_eq!(step_a.retry_count, 0);
    assert_eq!(step_a.last_error.as_ref().unwrap().category, ErrorCategory::Fatal);
    assert_eq!(report.step("B").unwrap().status, StepStatus::Skipped);
    assert_eq!(b.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_scheduled_job_cancels_every_step() {
    let stages = [ScriptedStage::ok("A"), ScriptedStage::ok("B"), ScriptedStage::ok("C")];
    let orch = orchestrator(
        &stages,
        vec![StageSettings::new("A"), StageSettings::new("B"), StageSettings::new("C")],
    );

    let id = orch
        .submit("repo", JobOptions::new(), Some(Schedule::after_secs(120)))
        .unwrap();
    assert_ok!(orch.cancel(id));

    let report = orch.status(id).unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.steps.len(), 3);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Cancelled));
    assert!(orch.scheduled().is_empty());

    // The scheduler never releases it
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(orch.status(id).unwrap().status, JobStatus::Cancelled);
    assert!(stages.iter().all(|s| s.calls() == 0));
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_cancel_is_a_no_op_once_finished() {
    let a = ScriptedStage::new("A", [Attempt::Block]);
    let b = ScriptedStage::ok("B");
    let orch = orchestrator(
        &[a.clone(), b.clone()],
        vec![StageSettings::new("A"), StageSettings::new("B")],
    );

    let id = orch.submit("repo", JobOptions::new(), None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ok!(orch.stop(id));
    assert_ok!(orch.stop(id));

    let report = orch.wait_for(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.step("A").unwrap().status, StepStatus::Cancelled);
    assert_eq!(report.step("B").unwrap().status, StepStatus::Skipped);

    assert_ok!(orch.cancel(id));
    assert_eq!(orch.status(id).unwrap(), report);
    assert_err!(orch.purge(uuid::Uuid::new_v4()));
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_counts_against_retry_budget() {
    let a = ScriptedStage::new(
        "A",
        [Attempt::Sleep(Duration::from_secs(30)), Attempt::Succeed],
    );
    let orch = orchestrator(
        &[a.clone()],
        vec![StageSettings::new("A")
            .timeout_seconds(5.0)
            .max_retries(1)
            .back_off_seconds(1.0)],
    );

    let id = orch.submit("repo", JobOptions::new(), None).unwrap();
    let report = orch.wait_for(id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps[0].retry_count, 1);
    assert_eq!(a.calls(), 2);
}

/// Script for one step: how many transient failures, whether it ends fatally, its
/// retry budget and whether it is optional
#[derive(Debug, Clone)]
struct StepScript {
    transient: u32,
    fatal: bool,
    max_retries: u32,
    optional: bool,
}

fn step_script() -> impl Strategy<Value = StepScript> {
    (0u32..4, any::<bool>(), 0u32..3, any::<bool>()).prop_map(
        |(transient, fatal, max_retries, optional)| StepScript {
            transient,
            fatal,
            max_retries,
            optional,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_job_status_and_retry_bounds(scripts in prop::collection::vec(step_script(), 1..5)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let names: Vec<String> = (0..scripts.len()).map(|i| format!("s{}", i)).collect();
            let stages: Vec<_> = scripts
                .iter()
                .zip(&names)
                .map(|(script, name)| {
                    let mut attempts = vec![Attempt::Transient; script.transient as usize];
                    if script.fatal {
                        attempts.push(Attempt::Fatal);
                    }
                    ScriptedStage::new(name, attempts)
                })
                .collect();
            let settings = scripts
                .iter()
                .zip(&names)
                .map(|(script, name)| {
                    StageSettings::new(name.as_str())
                        .max_retries(script.max_retries)
                        .back_off_seconds(0.1)
                        .optional(script.optional)
                })
                .collect();
            let orch = orchestrator(&stages, settings);

            let id = orch.submit("repo", JobOptions::new(), None).unwrap();
            let report = orch.wait_for(id).await.unwrap();

            // completed iff every step settled as completed or skipped
            prop_assert_eq!(
                report.status == JobStatus::Completed,
                settled(&report) == report.steps.len()
            );

            for (step, script) in report.steps.iter().zip(&scripts) {
                prop_assert!(step.retry_count <= step.max_retries);
                let failed_here = step.status == StepStatus::Failed
                    || (step.status == StepStatus::Skipped && step.last_error.is_some());
                if failed_here {
                    let last = step.last_error.as_ref().unwrap();
                    match last.category {
                        ErrorCategory::Transient => {
                            prop_assert_eq!(step.retry_count, step.max_retries)
                        }
                        ErrorCategory::Fatal => {
                            prop_assert!(script.fatal);
                            prop_assert_eq!(step.retry_count, script.transient);
                        }
                        other => prop_assert!(false, "unexpected category {}", other),
                    }
                }
            }
            orch.shutdown().await;
            Ok(())
        })?;
    }
}
