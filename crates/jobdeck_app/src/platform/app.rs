//! Command runners: each drives the engine and follows its notices until the
//! operation settles or the user interrupts.

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Local;
use deck_logging::{deck_info, deck_warn};
use jobdeck_core::{
    BulkEnd, JobAction, JobId, JobMode, JobRowView, JobStatus, MessageId, Notice, ResourceKey,
    VmStatus,
};
use jobdeck_engine::EngineHandle;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};

use crate::cli::{BulkReplyArgs, RunArgs, VmCmd};

const PROGRESS_EVERY: Duration = Duration::from_secs(1);

pub async fn run_job(engine: &EngineHandle, args: RunArgs) -> anyhow::Result<()> {
    let mut notices = engine.notices();
    let mode = JobMode::from(args.mode);
    let job_id = engine
        .create_job(args.kind.into(), mode, args.items)
        .await
        .context("create job")?;
    println!("created {job_id} ({:?} backend)", engine.mode());

    if mode == JobMode::InteractiveBrowser {
        engine
            .control_job(&job_id, JobAction::Launch)
            .await
            .context("launch browser session")?;
        if let Some(endpoint) = engine.view().job(&job_id).and_then(|row| row.endpoint.clone()) {
            println!("watch at {endpoint}");
        }
        wait_for_waiting(engine, &job_id).await?;
    }

    engine
        .control_job(&job_id, JobAction::Start)
        .await
        .context("start job")?;

    let mut ticker = interval(PROGRESS_EVERY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_line = String::new();
    let status = loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(Notice::JobSettled { job_id: settled, status }) if settled == job_id => break status,
                Ok(Notice::Failure { resource: ResourceKey::Job(failed), code, message }) if failed == job_id => {
                    eprintln!("job {job_id}: {code}: {message}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => lagged(skipped),
                Err(RecvError::Closed) => bail!("engine stopped while following {job_id}"),
            },
            _ = ticker.tick() => {
                let Some(row) = engine.view().job(&job_id).cloned() else {
                    bail!("job {job_id} disappeared");
                };
                let line = progress_line(&row);
                if line != last_line {
                    println!("[{}] {line}", Local::now().format("%H:%M:%S"));
                    last_line = line;
                }
                if row.status.is_terminal() {
                    break row.status;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                deck_info!("Interrupted; stopping {}", job_id);
                break engine
                    .control_job(&job_id, JobAction::Stop)
                    .await
                    .context("stop job")?;
            }
        }
    };

    println!("job {job_id} finished: {status}");
    if let Some(row) = engine.view().job(&job_id) {
        println!("{}", progress_line(row));
        if let Some(error) = &row.last_error {
            println!("last error: {error}");
        }
    }
    match engine.job_results(&job_id).await {
        Ok(results) => {
            for result in results {
                let detail = result.detail.as_deref().unwrap_or("");
                println!("  #{:<4} {:<16} {:?} {detail}", result.index, result.item, result.outcome);
            }
        }
        Err(err) => deck_warn!("Results for {} unavailable: {}", job_id, err),
    }
    if status == JobStatus::Error {
        bail!("job {job_id} ended in error");
    }
    Ok(())
}

async fn wait_for_waiting(engine: &EngineHandle, job_id: &JobId) -> anyhow::Result<()> {
    let mut ticker = interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.job(job_id).map(|job| job.status()) {
                    Some(JobStatus::Waiting) => return Ok(()),
                    Some(status) if status.is_terminal() => bail!("job {job_id} ended as {status} before it was ready"),
                    Some(_) => {}
                    None => bail!("job {job_id} disappeared"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                engine.control_job(job_id, JobAction::Stop).await.context("stop job")?;
                bail!("interrupted while the browser session was starting");
            }
        }
    }
}

fn progress_line(row: &JobRowView) -> String {
    format!(
        "{:<10} {}/{} ({}%) passed {} errors {}",
        row.status.as_str(),
        row.current_index,
        row.total_items,
        row.percent(),
        row.passed_count,
        row.error_count
    )
}

pub async fn bulk_reply(engine: &EngineHandle, args: BulkReplyArgs) -> anyhow::Result<()> {
    let mut notices = engine.notices();
    let ids = args.message_ids.into_iter().map(MessageId::new).collect();
    engine.start_bulk_reply(ids).await.context("start bulk reply")?;

    let mut ticker = interval(PROGRESS_EVERY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reported = 0;
    let end = loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(Notice::BulkSettled { end, .. }) => break end,
                Ok(Notice::Failure { resource: ResourceKey::BulkReply, code, message }) => {
                    eprintln!("bulk reply: {code}: {message}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => lagged(skipped),
                Err(RecvError::Closed) => bail!("engine stopped during bulk reply"),
            },
            _ = ticker.tick() => {
                if let Some(bulk) = engine.view().bulk {
                    if bulk.completed != reported {
                        reported = bulk.completed;
                        println!("[{}] {}/{} processed", Local::now().format("%H:%M:%S"), bulk.completed, bulk.total);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if engine.cancel_bulk_reply() {
                    println!("cancelled");
                }
            }
        }
    };

    if let Some(bulk) = engine.view().bulk {
        for result in &bulk.results {
            let error = result.error.as_deref().unwrap_or("");
            println!("  {:<24} {:?} {error}", result.message_id.as_str(), result.outcome);
        }
        println!(
            "replied {} failed {} no mapping {} no video {}",
            bulk.replied, bulk.failed, bulk.no_mapping, bulk.no_video
        );
    }
    match end {
        BulkEnd::Complete | BulkEnd::Cancelled => Ok(()),
        BulkEnd::Failed(reason) => bail!("bulk reply failed: {reason}"),
    }
}

pub async fn vm(engine: &EngineHandle, cmd: VmCmd) -> anyhow::Result<()> {
    let mut notices = engine.notices();
    let status = match cmd {
        VmCmd::Status => engine.refresh_vm().await?,
        VmCmd::Start => engine.start_vm().await.context("start vm")?,
        VmCmd::Stop => engine.stop_vm().await.context("stop vm")?,
    };
    println!("vm {status}");
    if cmd == VmCmd::Status || !engine.is_subscribed(&ResourceKey::Vm) {
        print_vm_endpoint(engine);
        return Ok(());
    }

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(Notice::VmSettled { status }) => {
                    println!("vm {status}");
                    break;
                }
                Ok(Notice::Failure { resource: ResourceKey::Vm, code, message }) => {
                    bail!("vm {}: {code}: {message}", engine.view().vm.status);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => lagged(skipped),
                Err(RecvError::Closed) => bail!("engine stopped while waiting for the vm"),
            },
            _ = tokio::signal::ctrl_c() => {
                println!("no longer waiting; vm is {}", engine.view().vm.status);
                return Ok(());
            }
        }
    }
    if engine.view().vm.status == VmStatus::Running {
        print_vm_endpoint(engine);
    }
    Ok(())
}

fn print_vm_endpoint(engine: &EngineHandle) {
    if let Some(endpoint) = engine.view().vm.endpoint {
        println!("endpoint {endpoint}");
    }
}

fn lagged(skipped: u64) {
    deck_warn!("Skipped {} notices", skipped);
}
