//! Scheduler timing on tokio's paused clock: recurring and one-time jobs feed the bus.

use crier::bus::{ChannelFilter, DeliveryTarget, MessageBus, TriggerKind};
use crier::cron::{CronSchedule, CronService, CronStore, NewJob, TokioClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn scheduler() -> (Arc<CronService>, Arc<MessageBus>) {
    let service = CronService::new(CronStore::in_memory(), Arc::new(TokioClock::new()));
    (Arc::new(service), Arc::new(MessageBus::default()))
}

#[tokio::test(start_paused = true)]
async fn every_second_job_fires_repeatedly_as_cron_trigger() {
    let (cron, bus) = scheduler();
    let mut inbound = bus.subscribe_inbound(ChannelFilter::Any);
    let job = cron
        .add_job(NewJob::new("ping", CronSchedule::Every { every_seconds: 1 }, "ping"))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(cron.clone().run(bus.clone(), Duration::from_millis(100), shutdown.clone()));

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut fires = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, inbound.recv()).await {
        fires.push(msg);
    }
    shutdown.cancel();
    task.await.unwrap();

    assert!(fires.len() >= 2, "only {} fires in 3s", fires.len());
    for msg in &fires {
        assert_eq!(msg.trigger, TriggerKind::Cron);
        assert_eq!(msg.content, "ping");
        assert_eq!(msg.session_key(), format!("cron:{}", job.id));
        assert!(msg.delivery.is_none());
    }
    for pair in fires.windows(2) {
        let gap = pair[1].timestamp - pair[0].timestamp;
        assert!(gap >= chrono::Duration::seconds(1), "fires only {:?} apart", gap);
    }

    let stored = cron.list_jobs(true).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].last_run_at.is_some());
    assert!(stored[0].next_run_at > stored[0].last_run_at);
}

#[tokio::test(start_paused = true)]
async fn one_time_job_fires_once_with_delivery_then_disappears() {
    let (cron, bus) = scheduler();
    let mut inbound = bus.subscribe_inbound(ChannelFilter::Any);
    let at = cron.now() + chrono::Duration::seconds(2);
    cron.add_job(
        NewJob::new("call", CronSchedule::At { at }, "remind me to call mom").deliver_to("telegram", "42"),
    )
    .await
    .unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(cron.clone().run(bus.clone(), Duration::from_millis(100), shutdown.clone()));

    let started = Instant::now();
    let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("fired within 5s")
        .expect("bus open");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(msg.trigger, TriggerKind::Cron);
    assert_eq!(msg.delivery, Some(DeliveryTarget::new("telegram", "42")));
    assert_eq!(msg.reply_target(), DeliveryTarget::new("telegram", "42"));

    assert!(tokio::time::timeout(Duration::from_secs(3), inbound.recv()).await.is_err());
    assert!(cron.list_jobs(true).await.unwrap().is_empty());

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disabled_job_does_not_fire() {
    let (cron, bus) = scheduler();
    let mut inbound = bus.subscribe_inbound(ChannelFilter::Any);
    let job = cron
        .add_job(NewJob::new("quiet", CronSchedule::Every { every_seconds: 1 }, "psst"))
        .await
        .unwrap();
    cron.enable_job(&job.id, false).await.unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(cron.clone().run(bus.clone(), Duration::from_millis(100), shutdown.clone()));
    assert!(tokio::time::timeout(Duration::from_secs(3), inbound.recv()).await.is_err());
    shutdown.cancel();
    task.await.unwrap();

    assert_eq!(cron.list_jobs(false).await.unwrap().len(), 0);
    assert_eq!(cron.list_jobs(true).await.unwrap().len(), 1);
}
