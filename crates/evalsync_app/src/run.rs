//! Follow loop: prints store events until every followed id is terminal.

use std::time::Duration;

use anyhow::bail;
use evalsync_core::{EvaluationRecord, EvaluationStatus, Phase, StoreEvent, StoreSnapshot};
use evalsync_engine::ClientHandle;
use evalsync_logging::{sync_info, sync_warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

pub struct RunOptions {
    pub ids: Vec<String>,
    pub user: Option<String>,
    pub broadcast: bool,
    pub list: bool,
    pub timeout: Option<Duration>,
}

pub fn run(handle: &ClientHandle, options: RunOptions) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(follow(handle, options))
}

async fn follow(handle: &ClientHandle, options: RunOptions) -> anyhow::Result<()> {
    let mut events = handle.events();
    let guards: Vec<_> = options.ids.iter().map(|id| handle.track(id.as_str())).collect();
    if let Some(user) = &options.user {
        handle.subscribe_user(user.as_str());
    }
    if options.broadcast {
        handle.subscribe_broadcast();
    }
    if options.list {
        handle.refresh_list();
    }

    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut timed_out = false;
    loop {
        if !options.ids.is_empty() && all_terminal(&handle.snapshot(), &options.ids) {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                sync_info!("interrupted");
                break;
            }
            _ = sleep_until(deadline) => {
                timed_out = true;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = describe(&event) {
                        println!("{} {}", chrono::Local::now().format("%H:%M:%S"), line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => sync_warn!("skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let snapshot = handle.snapshot();
    drop(guards);
    for id in &options.ids {
        match snapshot.get(id) {
            Some(record) => println!("{}", summary(record)),
            None => println!("{id}: unknown"),
        }
    }
    if timed_out {
        bail!("timed out waiting for {}", pending(&snapshot, &options.ids).join(", "));
    }
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn all_terminal(snapshot: &StoreSnapshot, ids: &[String]) -> bool {
    pending(snapshot, ids).is_empty()
}

fn pending<'a>(snapshot: &StoreSnapshot, ids: &'a [String]) -> Vec<&'a str> {
    ids.iter()
        .filter(|id| !snapshot.get(id).is_some_and(EvaluationRecord::is_terminal))
        .map(String::as_str)
        .collect()
}

fn describe(event: &StoreEvent) -> Option<String> {
    match event {
        StoreEvent::RecordChanged(record) => Some(summary(record)),
        StoreEvent::RecordStale {
            evaluation_id,
            stale: true,
        } => Some(format!("{evaluation_id}: no live data (push and poll failing)")),
        StoreEvent::RecordStale { .. } => None,
        StoreEvent::TrackingReleased(_) => None,
        StoreEvent::Notification(notification) => Some(format!(
            "[{}] {}: {}",
            notification.kind, notification.title, notification.body
        )),
        StoreEvent::Broadcast(payload) => Some(format!("broadcast {payload}")),
        StoreEvent::ChannelPhaseChanged { channel, phase } => match phase {
            Phase::Open | Phase::Closed => Some(format!("{channel} {phase:?}")),
            _ => None,
        },
    }
}

fn summary(record: &EvaluationRecord) -> String {
    let mut line = format!("{}: {}", record.id, record.status);
    match record.status {
        EvaluationStatus::Completed => {
            if let Some(score) = record.overall_score {
                line.push_str(&format!(" score={score:.1}"));
            }
        }
        EvaluationStatus::Failed | EvaluationStatus::Cancelled => {
            if let Some(error) = &record.error_message {
                line.push_str(&format!(" ({error})"));
            }
        }
        EvaluationStatus::Pending | EvaluationStatus::Running => {
            line.push_str(&format!(" {:.0}%", record.progress_percent));
            if let Some(step) = &record.current_step {
                line.push_str(&format!(" {step}"));
            }
        }
    }
    if !record.pillar_results.is_empty() {
        let pillars: Vec<String> = record
            .pillar_results
            .iter()
            .map(|(pillar, result)| match result.score {
                Some(score) => format!("{pillar}={score:.1}"),
                None => pillar.clone(),
            })
            .collect();
        line.push_str(&format!(" [{}]", pillars.join(" ")));
    }
    if record.stale {
        line.push_str(" (stale)");
    }
    line
}
