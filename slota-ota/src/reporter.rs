//! Push-style progress notifications for whoever drives the UI

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{Notice, Phase, TargetDevice, TransferFailure};

/// What a finished transfer did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub device: TargetDevice,
    pub bytes: usize,
    pub frames: usize,
    pub mtu: u16,
    /// `false` when `mtu` is only what was requested; the link could not
    /// confirm what the peer agreed to.
    pub mtu_negotiated: bool,
    pub frame_size: usize,
    /// Backpressure retries across all frames.
    pub frame_retries: u64,
    /// Whether the peripheral had to be rebooted into its bootloader first.
    pub rebooted_to_bootloader: bool,
    pub elapsed: Duration,
}

pub type TransferOutcome = Result<TransferSummary, TransferFailure>;

pub trait ProgressReporter: Send + Sync {
    fn phase_changed(&self, phase: Phase);

    fn notice(&self, _notice: &Notice) {}

    fn upload_progress(&self, _sent: usize, _total: usize) {}

    /// Called exactly once per session.
    fn finished(&self, outcome: &TransferOutcome);
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for Arc<R> {
    fn phase_changed(&self, phase: Phase) {
        (**self).phase_changed(phase)
    }

    fn notice(&self, notice: &Notice) {
        (**self).notice(notice)
    }

    fn upload_progress(&self, sent: usize, total: usize) {
        (**self).upload_progress(sent, total)
    }

    fn finished(&self, outcome: &TransferOutcome) {
        (**self).finished(outcome)
    }
}

/// Reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn phase_changed(&self, phase: Phase) {
        info!(%phase, "ota phase");
    }

    fn notice(&self, notice: &Notice) {
        info!("{notice}");
    }

    fn upload_progress(&self, sent: usize, total: usize) {
        info!(sent, total, "ota upload progress");
    }

    fn finished(&self, outcome: &TransferOutcome) {
        match outcome {
            Ok(summary) => info!(
                device = %summary.device,
                bytes = summary.bytes,
                frames = summary.frames,
                "ota transfer complete"
            ),
            Err(e) => warn!("{e}"),
        }
    }
}

/// Everything a [`ProgressReporter`] can be told, as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Phase(Phase),
    Notice(Notice),
    Progress { sent: usize, total: usize },
    Finished(TransferOutcome),
}

/// Forwards reports into a channel; a dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<Report>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn phase_changed(&self, phase: Phase) {
        let _ = self.tx.send(Report::Phase(phase));
    }

    fn notice(&self, notice: &Notice) {
        let _ = self.tx.send(Report::Notice(notice.clone()));
    }

    fn upload_progress(&self, sent: usize, total: usize) {
        let _ = self.tx.send(Report::Progress { sent, total });
    }

    fn finished(&self, outcome: &TransferOutcome) {
        let _ = self.tx.send(Report::Finished(outcome.clone()));
    }
}
