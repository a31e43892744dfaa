use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::pipeline::{Pipeline, SyncReport};
use crate::store::EmailRepository;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub interval: Duration,
    /// Prune records older than this many days after each poll.
    pub retention_days: Option<u32>,
}

impl From<&SyncConfig> for DaemonConfig {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            interval: Duration::from_secs(sync.poll_interval_secs),
            retention_days: sync.retention_days,
        }
    }
}

/// Background thread polling the mailbox on a fixed interval.
pub struct Poller {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn(pipeline: Arc<Pipeline>, cfg: DaemonConfig) -> std::io::Result<Self> {
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("mail-poller".into())
            .spawn(move || poll_loop(&pipeline, &cfg, &stop_rx))?;
        Ok(Self { stop, handle })
    }

    /// Interrupts the wait between polls; an in-flight poll runs to completion.
    pub fn stop(self) {
        let _ = self.stop.try_send(());
        if let Err(e) = self.handle.join() {
            error!("poller thread panicked: {e:?}");
        }
    }
}

fn poll_loop(pipeline: &Pipeline, cfg: &DaemonConfig, stop: &Receiver<()>) {
    info!("polling every {}s", cfg.interval.as_secs());
    loop {
        poll_once(pipeline, cfg);

        match stop.recv_timeout(cfg.interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("poller stopped");
}

/// One background cycle. Errors are logged, never fatal.
pub fn poll_once(pipeline: &Pipeline, cfg: &DaemonConfig) -> Option<SyncReport> {
    let report = match pipeline.sync_since_last_sync() {
        Ok(report) => report,
        Err(e) if e.needs_reauth() => {
            error!("background sync needs a new login (run `mail_triage login`): {e}");
            return None;
        }
        Err(e) => {
            warn!("background sync failed: {e}");
            return None;
        }
    };

    for record in &report.records {
        info!(
            "new email from {}: {} [{}]",
            record.sender, record.subject, record.priority
        );
    }

    if let Some(days) = cfg.retention_days {
        match pipeline.store().prune_older_than(days) {
            Ok(0) => {}
            Ok(n) => info!("pruned {n} emails older than {days} days"),
            Err(e) => warn!("prune failed: {e}"),
        }
    }
    Some(report)
}

/// Runs the poller until ctrl-c.
pub fn run_daemon(pipeline: Arc<Pipeline>, cfg: DaemonConfig) -> Result<()> {
    let (interrupt_tx, interrupt_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })?;

    let poller = Poller::spawn(pipeline, cfg)?;
    // a disconnect means the handler is gone; treat it like an interrupt
    let _ = interrupt_rx.recv();
    info!("interrupt received, stopping");
    poller.stop();
    Ok(())
}
