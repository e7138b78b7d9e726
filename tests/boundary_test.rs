mod common;

use bpmnflow::dsl::builder::ProcessBuilder;
use bpmnflow::handlers::{FailureKind, TaskFailure};
use bpmnflow::runtime::event::EventKind;
use bpmnflow::runtime::runner::CancelDisposition;
use bpmnflow::runtime::token::CancelCause;
use bpmnflow::runtime::{ExecutionSession, SessionStatus};
use common::{EscalatingHandler, ScriptedHandler, SlowAtomicHandler, SlowCleanupHandler, registry_with, run, run_builtin, started_tasks, wait_for};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn timed_review(task_ms: u64) -> ProcessBuilder {
    ProcessBuilder::new("timed-review")
        .start("start")
        .task("review", "sleep").param("duration_ms", task_ms).build()
        .task("on_time", "assign").param("value", "reviewed").output("outcome").build()
        .end("end")
        .connect("start", "review")
        .connect("review", "on_time")
        .connect("on_time", "end")
}

#[tokio::test(start_paused = true)]
async fn test_interrupting_timer_reroutes_token() {
    let process = timed_review(20_000)
        .timer_boundary("deadline", "review", "5s", true)
        .task("escalate", "assign").param("value", "timed out").output("outcome").build()
        .end("late_end")
        .connect("deadline", "escalate")
        .connect("escalate", "late_end")
        .build();

    let report = run_builtin(process).await;

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.variables.get("outcome"), Some(&json!("timed out")));
    assert_eq!(report.events_for(EventKind::BoundaryArmed, "deadline").len(), 1);
    assert_eq!(report.events_for(EventKind::BoundaryFired, "deadline").len(), 1);

    let cancelled = report.events_for(EventKind::TaskCancelled, "review");
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].payload["boundary"], json!("deadline"));
    assert!(report.events_for(EventKind::TaskCompleted, "review").is_empty());
    assert!(report.events_for(EventKind::TaskStarted, "on_time").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timer_disarmed_when_task_finishes_first() {
    let process = timed_review(10_000)
        .timer_boundary("reminder", "review", "30s", false)
        .task("remind", "log").build()
        .connect("reminder", "remind")
        .build();

    let report = run_builtin(process).await;

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.variables.get("outcome"), Some(&json!("reviewed")));
    assert_eq!(report.events_for(EventKind::BoundaryArmed, "reminder").len(), 1);
    assert_eq!(report.count(EventKind::BoundaryFired), 0);
    assert!(report.events_for(EventKind::TaskStarted, "remind").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_non_interrupting_timer_spawns_parallel_token() {
    let process = timed_review(10_000)
        .timer_boundary("reminder", "review", "2s", false)
        .task("remind", "assign").param("value", true).output("reminded").build()
        .end("remind_end")
        .connect("reminder", "remind")
        .connect("remind", "remind_end")
        .build();

    let report = run_builtin(process).await;

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.variables.get("reminded"), Some(&json!(true)));
    assert_eq!(report.variables.get("outcome"), Some(&json!("reviewed")));
    assert_eq!(report.events_for(EventKind::TaskCompleted, "review").len(), 1);
    assert_eq!(report.count(EventKind::TaskCancelled), 0);

    let fired = report.events_for(EventKind::BoundaryFired, "reminder");
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].payload["interrupting"], json!(false));

    // the reminder runs while the review is still going
    let remind_done = report.events_for(EventKind::TaskCompleted, "remind")[0].sequence;
    let review_done = report.events_for(EventKind::TaskCompleted, "review")[0].sequence;
    assert!(remind_done < review_done);
}

#[tokio::test(start_paused = true)]
async fn test_interrupting_fire_disarms_other_boundaries() {
    let process = timed_review(20_000)
        .timer_boundary("hard_stop", "review", "5s", true)
        .timer_boundary("nudge", "review", "10s", false)
        .task("stopped", "log").build()
        .task("nudged", "log").build()
        .end("stop_end")
        .connect("hard_stop", "stopped")
        .connect("stopped", "stop_end")
        .connect("nudge", "nudged")
        .build();

    let report = run_builtin(process).await;

    assert_eq!(report.events_for(EventKind::BoundaryFired, "hard_stop").len(), 1);
    assert!(report.events_for(EventKind::BoundaryFired, "nudge").is_empty());
    assert!(report.events_for(EventKind::TaskStarted, "nudged").is_empty());
    assert_eq!(started_tasks(&report), vec!["review", "stopped"]);
}

#[tokio::test(start_paused = true)]
async fn test_atomic_task_never_arms_timer() {
    let process = ProcessBuilder::new("atomic-timer")
        .start("start")
        .task("charge", "slow_atomic").build()
        .timer_boundary("too_slow", "charge", "1s", true)
        .end("end")
        .end("late_end")
        .connect("start", "charge")
        .connect("charge", "end")
        .connect("too_slow", "late_end")
        .build();

    let slow = Arc::new(SlowAtomicHandler { delay: Duration::from_secs(3) });
    let report = run(process, registry_with(vec![slow])).await;

    assert_eq!(report.count(EventKind::TaskCancellable), 0);
    assert_eq!(report.count(EventKind::BoundaryArmed), 0);
    assert_eq!(report.events_for(EventKind::TaskCompleted, "charge").len(), 1);
}

fn signal_process() -> ProcessBuilder {
    ProcessBuilder::new("withdrawable")
        .start("start")
        .task("review", "sleep").param("duration_ms", 30_000).build()
        .signal_boundary("withdrawn", "review", "withdraw", true)
        .end("approved")
        .end("withdrawn_end")
        .connect("start", "review")
        .connect("review", "approved")
        .connect("withdrawn", "withdrawn_end")
}

#[tokio::test(start_paused = true)]
async fn test_signal_interrupts_armed_task() {
    let session = ExecutionSession::from_process(signal_process().build(), registry_with(Vec::new()), common::test_config())
        .expect("Session setup failed");
    let handle = session.handle();
    let mut feed = session.subscribe();
    let running = tokio::spawn(session.run());

    wait_for(&mut feed, EventKind::BoundaryArmed, "withdrawn").await;
    assert_eq!(handle.broadcast_signal("unrelated").await.expect("Session closed"), 0);
    assert_eq!(handle.broadcast_signal("withdraw").await.expect("Session closed"), 1);

    let report = running.await.expect("Session task panicked");
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.events_for(EventKind::BoundaryFired, "withdrawn").len(), 1);
    assert_eq!(report.events_for(EventKind::TaskCancelled, "review").len(), 1);
    let ended_at: Vec<_> = report.events_of(EventKind::TokenRetired)
        .into_iter()
        .filter(|e| e.payload["reason"] == "end")
        .filter_map(|e| e.node_id.clone())
        .collect();
    assert_eq!(ended_at, vec!["withdrawn_end"]);
}

#[tokio::test(start_paused = true)]
async fn test_signal_after_session_finished_reports_closed() {
    let process = ProcessBuilder::new("quick")
        .start("start")
        .task("noop", "log").build()
        .end("end")
        .connect("start", "noop")
        .connect("noop", "end")
        .build();
    let session = ExecutionSession::from_process(process, registry_with(Vec::new()), common::test_config())
        .expect("Session setup failed");
    let handle = session.handle();
    session.run().await;

    assert!(handle.broadcast_signal("anything").await.is_err());
    assert!(handle.cancel_task(uuid::Uuid::new_v4()).await.is_err());
}

fn failing_payment(failure: TaskFailure) -> (ProcessBuilder, Arc<ScriptedHandler>) {
    let process = ProcessBuilder::new("payment")
        .start("start")
        .task("charge", "payments").build()
        .error_boundary("any_error", "charge", None)
        .error_boundary("declined", "charge", Some("PAYMENT_DECLINED"))
        .task("handle_declined", "log").build()
        .task("handle_other", "log").build()
        .end("end")
        .connect("start", "charge")
        .connect("charge", "end")
        .connect("declined", "handle_declined")
        .connect("any_error", "handle_other")
        .connect("handle_declined", "end")
        .connect("handle_other", "end");
    (process, ScriptedHandler::new("payments", vec![Err(failure)]))
}

#[tokio::test]
async fn test_error_boundary_prefers_exact_code() {
    let (process, handler) = failing_payment(
        TaskFailure::new(FailureKind::Auth, "card declined").with_code("PAYMENT_DECLINED"),
    );
    let report = run(process.build(), registry_with(vec![handler])).await;

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(started_tasks(&report), vec!["charge", "handle_declined"]);
    assert_eq!(report.events_for(EventKind::BoundaryFired, "declined").len(), 1);
    assert_eq!(report.events_for(EventKind::TaskFailed, "charge").len(), 1);
    assert_eq!(report.variables["charge_error"]["code"], json!("PAYMENT_DECLINED"));
    assert_eq!(report.count(EventKind::SessionFault), 0);
}

#[tokio::test]
async fn test_error_boundary_catch_all() {
    let (process, handler) = failing_payment(TaskFailure::new(FailureKind::MalformedRequest, "bad card number"));
    let report = run(process.build(), registry_with(vec![handler])).await;

    assert_eq!(started_tasks(&report), vec!["charge", "handle_other"]);
    let fired = report.events_for(EventKind::BoundaryFired, "any_error");
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].payload["error"], json!("malformed-request"));
}

#[tokio::test]
async fn test_uncaught_failure_is_session_fault() {
    let process = ProcessBuilder::new("uncaught")
        .start("start")
        .task("charge", "payments").build()
        .error_boundary("declined", "charge", Some("PAYMENT_DECLINED"))
        .end("end")
        .connect("start", "charge")
        .connect("charge", "end")
        .connect("declined", "end")
        .build();
    let handler = ScriptedHandler::new("payments", vec![Err(TaskFailure::new(FailureKind::Auth, "expired key"))]);

    let report = run(process, registry_with(vec![handler])).await;

    assert_eq!(report.status, SessionStatus::Failed);
    let fault = &report.events_of(EventKind::SessionFault)[0];
    assert_eq!(fault.payload["error"], json!("task-failed"));
    assert_eq!(fault.payload["kind"], json!("auth"));
    assert_eq!(fault.node_id.as_deref(), Some("charge"));
}

#[tokio::test(start_paused = true)]
async fn test_escalation_fires_once_per_arm() {
    let process = ProcessBuilder::new("escalation")
        .start("start")
        .task("work", "escalating").build()
        .escalation_boundary("notify", "work", Some("late"), false)
        .task("notify_owner", "log").build()
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .connect("notify", "notify_owner")
        .build();
    let handler = Arc::new(EscalatingHandler { codes: vec!["late".into(), "late".into(), "other".into()] });

    let report = run(process, registry_with(vec![handler])).await;

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.events_for(EventKind::BoundaryFired, "notify").len(), 1);
    assert_eq!(report.events_for(EventKind::TaskStarted, "notify_owner").len(), 1);
    assert_eq!(report.events_for(EventKind::TaskCompleted, "work").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interrupting_escalation_cancels_task() {
    let process = ProcessBuilder::new("escalation-interrupt")
        .start("start")
        .task("work", "escalating").build()
        .escalation_boundary("abort", "work", None, true)
        .end("end")
        .end("aborted")
        .connect("start", "work")
        .connect("work", "end")
        .connect("abort", "aborted")
        .build();
    let handler = Arc::new(EscalatingHandler { codes: vec!["anything".into()] });

    let report = run(process, registry_with(vec![handler])).await;

    assert_eq!(report.events_for(EventKind::TaskCancelled, "work").len(), 1);
    assert!(report.events_for(EventKind::TaskCompleted, "work").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_after_boundary_fired_is_already_requested() {
    let process = timed_review(20_000)
        .timer_boundary("deadline", "review", "5s", true)
        .end("late_end")
        .connect("deadline", "late_end")
        .build();
    let session = ExecutionSession::from_process(process, registry_with(Vec::new()), common::test_config())
        .expect("Session setup failed");
    let handle = session.handle();
    let mut feed = session.subscribe();
    let running = tokio::spawn(session.run());

    let fired = wait_for(&mut feed, EventKind::BoundaryFired, "deadline").await;
    let execution_id = fired.execution_id.expect("Fired boundary carries its execution");
    let disposition = handle.cancel_task(execution_id).await.expect("Session closed");
    assert!(matches!(disposition, CancelDisposition::AlreadyRequested | CancelDisposition::Ignored));

    let report = running.await.expect("Session task panicked");
    assert_eq!(report.events_for(EventKind::TaskCancelled, "review").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_disarms_interrupting_timer() {
    let process = ProcessBuilder::new("user-first")
        .start("start")
        .task("review", "slow_cleanup").build()
        .timer_boundary("deadline", "review", "5s", true)
        .end("end")
        .end("late_end")
        .connect("start", "review")
        .connect("review", "end")
        .connect("deadline", "late_end")
        .build();
    let handler = Arc::new(SlowCleanupHandler {
        work: Duration::from_secs(20),
        cancel_delay: Duration::from_secs(10),
    });
    let session = ExecutionSession::from_process(process, registry_with(vec![handler]), common::test_config())
        .expect("Session setup failed");
    let handle = session.handle();
    let mut feed = session.subscribe();
    let running = tokio::spawn(session.run());

    let cancellable = wait_for(&mut feed, EventKind::TaskCancellable, "review").await;
    let execution_id = cancellable.execution_id.expect("Task event carries its execution");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.cancel_task(execution_id).await.expect("Cancel rejected"), CancelDisposition::Signalled);

    // cleanup runs well past the 5s deadline
    let report = running.await.expect("Session task panicked");
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert!(report.events_for(EventKind::BoundaryFired, "deadline").is_empty());
    let cancelled = report.events_for(EventKind::TaskCancelled, "review");
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].payload["cause"], json!("user"));
    assert!(report.events_for(EventKind::TokenRetired, "late_end").is_empty());
    assert_eq!(report.tokens.len(), 1);
    assert_eq!(report.tokens[0].cancel_cause, Some(CancelCause::User));
}
