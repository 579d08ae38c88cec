//! End-to-end pipeline behaviour over in-memory stores, driven by a manual clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use augur_ai::{FailureKind, ScriptedSummarizer};
use augur_core::{Currency, ManualClock, OrderId, OwnerId};
use augur_infra::jobs::FailureClass;
use augur_infra::queue::IndexRebuilder;
use augur_infra::{ExpirySweeper, PipelineConfig, PipelineContext, QueueError, QueueService};
use augur_orders::{OrderStatus, QueueSlot};

struct Pipeline {
    svc: QueueService,
    clock: Arc<ManualClock>,
    model: Arc<ScriptedSummarizer>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
}

fn pipeline() -> Pipeline {
    let clock = Arc::new(ManualClock::new(start()));
    let model = Arc::new(ScriptedSummarizer::new());
    let ctx = PipelineContext::in_memory(PipelineConfig::default(), model.clone(), clock.clone());
    Pipeline {
        svc: QueueService::new(ctx),
        clock,
        model,
    }
}

impl Pipeline {
    fn paid_order(&self, amount_cad: i64, urgent: bool) -> OrderId {
        let id = self
            .svc
            .create_order(OwnerId::new(), "is this the right time to move", amount_cad * 100, Currency::Cad, urgent)
            .unwrap();
        self.svc.on_payment_confirmed(id).unwrap();
        id
    }

    fn rebuild(&self) {
        IndexRebuilder::new(self.svc.context()).rebuild().unwrap();
    }
}

#[test]
fn exhausted_retries_dead_letter_then_replay_recovers() {
    let p = pipeline();
    for _ in 0..3 {
        p.model.push_err(FailureKind::transient("connection reset"));
    }
    let id = p.paid_order(80, false);

    let scheduler = p.svc.scheduler();
    scheduler.dispatch_tick();
    p.clock.advance(Duration::minutes(1));
    scheduler.dispatch_tick();
    p.clock.advance(Duration::minutes(2));
    let report = scheduler.dispatch_tick();
    assert_eq!(report.dead_lettered, 1);

    let letters = p.svc.dead_letters(10).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].class, FailureClass::TransientExhausted);
    assert_eq!(letters[0].last_error, "connection reset");
    assert_eq!(p.svc.get_order(id).unwrap().keyword(), None);

    p.model.push_ok("“moving, timing”");
    assert_eq!(scheduler.replay_dead_letters().requeued, 1);
    assert_eq!(scheduler.dispatch_tick().succeeded, 1);

    assert!(p.svc.dead_letters(10).unwrap().is_empty());
    assert_eq!(p.svc.get_order(id).unwrap().keyword(), Some("moving, timing"));
    assert_eq!(p.model.calls(), 4);
}

#[test]
fn permanent_failure_dead_letters_on_first_attempt() {
    let p = pipeline();
    p.model.push_err(FailureKind::permanent("HTTP 401: invalid api key"));
    p.paid_order(80, false);

    assert_eq!(p.svc.scheduler().dispatch_tick().dead_lettered, 1);

    let letters = p.svc.dead_letters(10).unwrap();
    assert_eq!(letters[0].attempts, 0);
    assert_eq!(letters[0].class, FailureClass::Permanent);
    assert_eq!(p.svc.pipeline_stats().unwrap().awaiting_keyword, 1);
}

#[test]
fn age_does_not_reorder_equally_aged_orders() {
    let p = pipeline();
    let a = p.paid_order(100, true);
    let b = p.paid_order(250, false);

    p.rebuild();
    let snapshot = p.svc.context().index.snapshot();
    assert_eq!(snapshot.entries()[0].order_id, b);
    assert_eq!(snapshot.entries()[0].score, 250.0);
    assert_eq!(snapshot.entries()[1].score, 200.0);

    p.clock.advance(Duration::hours(10));
    p.rebuild();
    let snapshot = p.svc.context().index.snapshot();
    assert_eq!(snapshot.order_ids().collect::<Vec<_>>(), vec![b, a]);
    assert!((snapshot.entries()[0].score - 500.0).abs() < 1e-9);
    assert!((snapshot.entries()[1].score - 400.0).abs() < 1e-9);
}

#[test]
fn stored_slot_lags_until_the_next_rebuild() {
    let p = pipeline();
    let first = p.paid_order(50, false);
    p.rebuild();
    assert_eq!(p.svc.get_queue_position(first).unwrap(), QueueSlot::new(1, 1));

    // A bigger order arrives; the live index knows, the stored slot does not.
    let second = p.paid_order(500, false);
    assert_eq!(p.svc.context().index.slot(first).map(|s| s.position), Some(2));
    assert_eq!(p.svc.get_queue_position(first).unwrap(), QueueSlot::new(1, 1));
    // Never rebuilt: falls back to the live index.
    assert_eq!(p.svc.get_queue_position(second).unwrap(), QueueSlot::new(1, 2));

    p.rebuild();
    assert_eq!(p.svc.get_queue_position(first).unwrap(), QueueSlot::new(2, 2));
}

#[test]
fn unpaid_order_expires_and_never_ranks() {
    let p = pipeline();
    let unpaid = p
        .svc
        .create_order(OwnerId::new(), "will I find a job", 9_900, Currency::Usd, true)
        .unwrap();
    let paid = p.paid_order(30, false);

    p.clock.advance(Duration::hours(25));
    let report = ExpirySweeper::new(p.svc.context()).sweep().unwrap();
    assert_eq!(report.expired, 1);

    let order = p.svc.get_order(unpaid).unwrap();
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert!(matches!(
        p.svc.on_payment_confirmed(unpaid),
        Err(QueueError::InvalidState(_))
    ));

    p.rebuild();
    let snapshot = p.svc.context().index.snapshot();
    assert!(!snapshot.contains(unpaid));
    assert!(snapshot.contains(paid));
    assert_eq!(p.svc.get_order(paid).unwrap().status(), OrderStatus::Queued);
}

#[test]
fn window_budget_caps_calls_per_tick_run() {
    let p = pipeline();
    for _ in 0..12 {
        p.paid_order(40, false);
    }

    // Batches of five: 5 + 5 succeed, the third batch hits the 10-per-window cap.
    let scheduler = p.svc.scheduler();
    let reports: Vec<_> = (0..3).map(|_| scheduler.dispatch_tick()).collect();
    assert_eq!(reports.iter().map(|r| r.succeeded).sum::<usize>(), 10);
    assert_eq!(reports[2].deferred, 2);
    assert_eq!(p.model.calls(), 10);

    let status = p.svc.get_rate_limit_status().unwrap();
    assert_eq!(status.window.used, 10);
    assert_eq!(status.window.remaining, 0);
    assert_eq!(status.window.window_minutes, 5);
    assert_eq!(status.daily.used, 10);

    // 09:00 bucket ends at 09:05.
    p.clock.advance(Duration::minutes(5));
    assert_eq!(scheduler.dispatch_tick().succeeded, 2);
    assert_eq!(p.svc.pipeline_stats().unwrap().enriched, 12);
}
