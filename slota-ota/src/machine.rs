//! OTA transfer state machine
//!
//! The machine does no I/O. Each entry point consumes one event, checks it
//! against the current phase and connection generation, and returns the
//! [`Action`]s the driver has to carry out. Events that make no sense for the
//! current phase are logged and dropped.
//!
//! ```text
//! Ready -> Connecting -> ResettingToBootloader -> Reconnecting -> BeginningTransfer
//!                     \___________________________________________/
//!       -> NegotiatingMtu -> Uploading -> Ending -> Disconnecting -> Ready
//! ```

use std::num::NonZeroUsize;
use std::time::Duration;

use slota_proto::{ControlCommand, DeviceAddress, frame_count, frame_size_for_mtu, mtu_request};
use tracing::{debug, info, warn};

use crate::{
    DisconnectPolicy, FailureKind, Generation, LinkEvent, Notice, OtaConfig, OtaError, Phase,
    ServiceMap, TargetDevice, TransferFailure, TransferOutcome, TransferSummary, UploadError,
    UploadStats,
};

/// Fixed waits between protocol steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayKind {
    /// Peripheral is rebooting into its bootloader; nothing tells us when it is done.
    RebootWait,
    BeginTransfer,
    EndTransfer,
    RebootToApplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub kind: DelayKind,
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Report(Phase),
    Notify(Notice),
    ArmConnectTimeout,
    DisarmConnectTimeout,
    Connect { address: DeviceAddress, generation: Generation },
    DiscoverServices { generation: Generation },
    WriteControl { generation: Generation, command: ControlCommand },
    RequestMtu { generation: Generation, mtu: u16 },
    Schedule { timer: Timer, after: Duration },
    StartUpload { generation: Generation, frame_size: NonZeroUsize },
    Disconnect { generation: Generation },
    Finish(TransferOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Link(LinkEvent),
    Timer(Timer),
    /// Handed to the machine only under [`crate::TimeoutPolicy::Authoritative`].
    ConnectTimedOut,
    UploadFinished(Result<UploadStats, UploadError>),
    /// The link refused a request outright.
    RequestFailed(String),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingControl {
    command: ControlCommand,
    attempts: u32,
}

/// Mutable state of the one transfer in flight.
#[derive(Debug, Clone)]
pub struct TransferSession {
    device: TargetDevice,
    image_len: usize,
    generation: Generation,
    connected: bool,
    // set between the reboot-to-bootloader ack and the reconnect
    awaiting_reboot: bool,
    rebooted_to_bootloader: bool,
    mtu: Option<u16>,
    frame_size: Option<NonZeroUsize>,
    upload_started: bool,
    upload: Option<UploadStats>,
    pending: Option<PendingControl>,
}

impl TransferSession {
    fn new(device: TargetDevice, image_len: usize, generation: Generation) -> Self {
        Self {
            device,
            image_len,
            generation,
            connected: false,
            awaiting_reboot: false,
            rebooted_to_bootloader: false,
            mtu: None,
            frame_size: None,
            upload_started: false,
            upload: None,
            pending: None,
        }
    }

    pub fn device(&self) -> &TargetDevice {
        &self.device
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn frame_size(&self) -> Option<NonZeroUsize> {
        self.frame_size
    }

    pub fn upload_started(&self) -> bool {
        self.upload_started
    }
}

pub struct TransferMachine {
    config: OtaConfig,
    phase: Phase,
    next_generation: Generation,
    session: Option<TransferSession>,
}

impl TransferMachine {
    pub fn new(config: OtaConfig) -> Self {
        Self {
            config,
            phase: Phase::Ready,
            next_generation: Generation::FIRST,
            session: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn start(
        &mut self,
        address: DeviceAddress,
        image_len: usize,
    ) -> Result<Vec<Action>, OtaError> {
        if let Some(session) = &self.session {
            return Err(OtaError::SessionActive(session.device.address));
        }
        if image_len == 0 {
            return Err(OtaError::EmptyImage);
        }

        let generation = self.take_generation();
        self.session = Some(TransferSession::new(
            TargetDevice::new(address),
            image_len,
            generation,
        ));
        info!(%address, image_len, %generation, "starting ota transfer");

        let mut actions = Vec::new();
        set_phase(&mut self.phase, Phase::Connecting, &mut actions);
        actions.push(Action::ArmConnectTimeout);
        actions.push(Action::Connect { address, generation });
        Ok(actions)
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Link(LinkEvent::Connected { generation, name }) => {
                self.on_connected(generation, name)
            }
            Event::Link(LinkEvent::Disconnected { generation }) => self.on_disconnected(generation),
            Event::Link(LinkEvent::ServicesDiscovered {
                generation,
                services,
            }) => self.on_services_discovered(generation, services),
            Event::Link(LinkEvent::WriteComplete {
                generation,
                value,
                success,
            }) => self.on_write_complete(generation, value, success),
            Event::Link(LinkEvent::MtuChanged {
                generation,
                mtu,
                success,
            }) => self.on_mtu_changed(generation, mtu, success),
            Event::Link(LinkEvent::DataWriteFailed { generation, reason }) => {
                self.on_data_write_failed(generation, reason)
            }
            Event::Timer(timer) => self.on_timer(timer),
            Event::ConnectTimedOut => self.on_connect_timeout(),
            Event::UploadFinished(result) => self.on_upload_finished(result),
            Event::RequestFailed(reason) => self.on_request_failed(reason),
            Event::Cancel => self.cancel(),
        }
    }

    pub fn on_connected(&mut self, generation: Generation, name: Option<String>) -> Vec<Action> {
        let phase = self.phase;
        let Some(session) = current(&mut self.session, generation, "connect") else {
            return Vec::new();
        };
        if session.connected || !matches!(phase, Phase::Connecting | Phase::Reconnecting) {
            debug!(%phase, %generation, "ignoring connect event");
            return Vec::new();
        }

        session.connected = true;
        if name.is_some() {
            session.device.name = name;
        }
        info!(device = %session.device, %generation, "connected");

        let mut actions = Vec::new();
        if phase == Phase::Connecting {
            actions.push(Action::DisarmConnectTimeout);
        }
        actions.push(Action::DiscoverServices { generation });
        actions
    }

    pub fn on_services_discovered(
        &mut self,
        generation: Generation,
        services: ServiceMap,
    ) -> Vec<Action> {
        let phase = self.phase;
        let Some(session) = current(&mut self.session, generation, "discovery") else {
            return Vec::new();
        };
        if !matches!(phase, Phase::Connecting | Phase::Reconnecting)
            || !session.connected
            || session.awaiting_reboot
        {
            debug!(%phase, %generation, "ignoring service discovery");
            return Vec::new();
        }
        if !services.has_control() {
            let reason = format!("{} exposes no OTA control characteristic", session.device);
            return self.fail(FailureKind::Protocol(reason));
        }

        let mut actions = Vec::new();
        match phase {
            Phase::Connecting if services.in_bootloader() => {
                info!(%generation, "peripheral already in bootloader mode");
                set_phase(&mut self.phase, Phase::BeginningTransfer, &mut actions);
                actions.push(schedule(&self.config, DelayKind::BeginTransfer, generation));
            }
            Phase::Connecting => {
                set_phase(&mut self.phase, Phase::ResettingToBootloader, &mut actions);
                actions.push(issue_control(session, ControlCommand::RebootToBootloader));
            }
            _ if !services.in_bootloader() => {
                let reason = "bootloader exposes no OTA data characteristic".to_string();
                return self.fail(FailureKind::Protocol(reason));
            }
            _ => {
                set_phase(&mut self.phase, Phase::BeginningTransfer, &mut actions);
                actions.push(schedule(&self.config, DelayKind::BeginTransfer, generation));
            }
        }
        actions
    }

    /// Acks carry only the raw byte; it is matched against the command this
    /// connection is waiting on, never interpreted on its own.
    pub fn on_write_complete(
        &mut self,
        generation: Generation,
        value: u8,
        success: bool,
    ) -> Vec<Action> {
        let phase = self.phase;
        let retries = self.config.control_write_retries;
        let Some(session) = current(&mut self.session, generation, "write ack") else {
            return Vec::new();
        };
        let Some(pending) = session.pending else {
            debug!(value, %generation, "ignoring unsolicited write ack");
            return Vec::new();
        };
        if value != pending.command.byte() {
            warn!(value, expected = %pending.command, "ignoring ack for a command not in flight");
            return Vec::new();
        }

        if !success {
            if pending.attempts <= retries {
                warn!(command = %pending.command, attempt = pending.attempts, "control write failed, retrying");
                session.pending = Some(PendingControl {
                    command: pending.command,
                    attempts: pending.attempts + 1,
                });
                return vec![Action::WriteControl {
                    generation,
                    command: pending.command,
                }];
            }
            return self.fail(FailureKind::WriteFailed {
                command: pending.command,
                attempts: pending.attempts,
            });
        }

        session.pending = None;
        debug!(command = %pending.command, %generation, "control write acknowledged");

        let mut actions = Vec::new();
        match (phase, pending.command) {
            (Phase::ResettingToBootloader, ControlCommand::RebootToBootloader) => {
                session.awaiting_reboot = true;
                session.rebooted_to_bootloader = true;
                set_phase(&mut self.phase, Phase::Reconnecting, &mut actions);
                actions.push(schedule(&self.config, DelayKind::RebootWait, generation));
            }
            (Phase::BeginningTransfer, ControlCommand::BeginTransfer) => {
                set_phase(&mut self.phase, Phase::NegotiatingMtu, &mut actions);
                actions.push(Action::RequestMtu {
                    generation,
                    mtu: mtu_request(self.config.target_mtu),
                });
            }
            (Phase::Ending, ControlCommand::EndTransfer) => {
                actions.push(Action::Notify(Notice::UploadDone));
                set_phase(&mut self.phase, Phase::Disconnecting, &mut actions);
                actions.push(schedule(&self.config, DelayKind::RebootToApplication, generation));
            }
            (Phase::Disconnecting, ControlCommand::RebootToApplication) => return self.complete(),
            (phase, command) => warn!(%phase, %command, "ignoring ack in this phase"),
        }
        actions
    }

    pub fn on_mtu_changed(&mut self, generation: Generation, mtu: u16, success: bool) -> Vec<Action> {
        let phase = self.phase;
        let Some(session) = current(&mut self.session, generation, "mtu change") else {
            return Vec::new();
        };
        if phase != Phase::NegotiatingMtu || session.upload_started {
            debug!(%phase, mtu, "ignoring mtu change");
            return Vec::new();
        }
        if !success {
            return self.fail(FailureKind::Protocol("mtu exchange rejected".to_string()));
        }
        let Some(frame_size) = frame_size_for_mtu(mtu) else {
            let reason = format!("negotiated mtu {mtu} leaves no room for data");
            return self.fail(FailureKind::Protocol(reason));
        };
        let frame_size = match NonZeroUsize::new(self.config.target_mtu as usize) {
            Some(cap) => frame_size.min(cap),
            None => frame_size,
        };

        session.mtu = Some(mtu);
        session.frame_size = Some(frame_size);
        session.upload_started = true;
        let frames = frame_count(session.image_len, frame_size);
        info!(mtu, frame_size = frame_size.get(), frames, "mtu negotiated, starting upload");

        let mut actions = Vec::new();
        set_phase(&mut self.phase, Phase::Uploading, &mut actions);
        actions.push(Action::Notify(Notice::UploadStarted {
            frames,
            frame_size: frame_size.get(),
        }));
        actions.push(Action::StartUpload {
            generation,
            frame_size,
        });
        actions
    }

    pub fn on_upload_finished(&mut self, result: Result<UploadStats, UploadError>) -> Vec<Action> {
        if self.phase != Phase::Uploading {
            warn!(phase = %self.phase, "ignoring upload completion");
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        match result {
            Ok(stats) => {
                info!(frames = stats.frames, retries = stats.retries, "all frames written");
                let generation = session.generation;
                session.upload = Some(stats);
                let mut actions = Vec::new();
                set_phase(&mut self.phase, Phase::Ending, &mut actions);
                actions.push(schedule(&self.config, DelayKind::EndTransfer, generation));
                actions
            }
            Err(UploadError::Rejected { offset, attempts }) => {
                self.fail(FailureKind::UploadRejected { offset, attempts })
            }
            Err(UploadError::Cancelled { .. }) => self.fail(FailureKind::Cancelled),
        }
    }

    pub fn on_timer(&mut self, timer: Timer) -> Vec<Action> {
        let phase = self.phase;
        let Some(session) = current(&mut self.session, timer.generation, "timer") else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        match (phase, timer.kind) {
            (Phase::Reconnecting, DelayKind::RebootWait) if session.awaiting_reboot => {
                let old = session.generation;
                let generation = self.next_generation;
                self.next_generation = generation.next();
                session.generation = generation;
                session.connected = false;
                session.awaiting_reboot = false;
                info!(%old, %generation, "reconnecting to bootloader");
                actions.push(Action::Disconnect { generation: old });
                actions.push(Action::Connect {
                    address: session.device.address,
                    generation,
                });
            }
            (Phase::BeginningTransfer, DelayKind::BeginTransfer) => {
                actions.push(issue_control(session, ControlCommand::BeginTransfer));
            }
            (Phase::Ending, DelayKind::EndTransfer) => {
                actions.push(issue_control(session, ControlCommand::EndTransfer));
            }
            (Phase::Disconnecting, DelayKind::RebootToApplication) => {
                actions.push(issue_control(session, ControlCommand::RebootToApplication));
            }
            (phase, kind) => debug!(%phase, ?kind, "ignoring timer"),
        }
        actions
    }

    pub fn on_disconnected(&mut self, generation: Generation) -> Vec<Action> {
        let phase = self.phase;
        let policy = self.config.disconnect_policy;
        let Some(session) = current(&mut self.session, generation, "disconnect") else {
            return Vec::new();
        };
        session.connected = false;

        if phase == Phase::Reconnecting && session.awaiting_reboot {
            info!(%generation, "peripheral dropped off to reboot into its bootloader");
            return Vec::new();
        }
        let reboot_sent = session
            .pending
            .is_some_and(|p| p.command == ControlCommand::RebootToApplication);
        if phase == Phase::Disconnecting && reboot_sent {
            info!(%generation, "peripheral rebooted into the new application");
            return self.complete();
        }

        match policy {
            DisconnectPolicy::LogOnly => {
                warn!(%phase, %generation, "peripheral disconnected, carrying on");
                vec![Action::Disconnect { generation }]
            }
            DisconnectPolicy::Abort => self.fail(FailureKind::Aborted),
        }
    }

    /// A frame the uploader counted as sent was lost, so the image on the
    /// peripheral is incomplete.
    pub fn on_data_write_failed(&mut self, generation: Generation, reason: String) -> Vec<Action> {
        let Some(session) = current(&mut self.session, generation, "data write failure") else {
            return Vec::new();
        };
        if !session.upload_started {
            debug!(%generation, %reason, "ignoring data write failure before upload");
            return Vec::new();
        }
        self.fail(FailureKind::Link(format!("data write failed: {reason}")))
    }

    /// Still waiting on the first connection of the session.
    pub fn awaiting_connection(&self) -> bool {
        self.phase == Phase::Connecting && self.session.as_ref().is_some_and(|s| !s.connected)
    }

    pub fn on_connect_timeout(&mut self) -> Vec<Action> {
        if self.awaiting_connection() {
            return self.fail(FailureKind::ConnectTimeout);
        }
        debug!(phase = %self.phase, "ignoring connect timeout");
        Vec::new()
    }

    pub fn on_request_failed(&mut self, reason: String) -> Vec<Action> {
        if self.session.is_none() {
            debug!(%reason, "ignoring link failure outside a session");
            return Vec::new();
        }
        self.fail(FailureKind::Link(reason))
    }

    /// User abort. Disconnects and finishes the session as cancelled.
    pub fn cancel(&mut self) -> Vec<Action> {
        if self.session.is_none() {
            return Vec::new();
        }
        info!(phase = %self.phase, "ota transfer cancelled");
        self.fail(FailureKind::Cancelled)
    }

    fn take_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation = generation.next();
        generation
    }

    fn fail(&mut self, kind: FailureKind) -> Vec<Action> {
        let phase = self.phase;
        let mut actions = vec![Action::DisarmConnectTimeout];
        if let Some(session) = self.session.take() {
            actions.push(Action::Disconnect {
                generation: session.generation,
            });
        }
        warn!(%phase, %kind, "ota transfer failed");
        set_phase(&mut self.phase, Phase::Aborted, &mut actions);
        actions.push(Action::Finish(Err(TransferFailure { phase, kind })));
        actions
    }

    fn complete(&mut self) -> Vec<Action> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        let upload = session.upload.unwrap_or_default();
        let summary = TransferSummary {
            device: session.device,
            bytes: session.image_len,
            frames: upload.frames,
            mtu: session.mtu.unwrap_or_default(),
            // the driver knows whether the link negotiates
            mtu_negotiated: true,
            frame_size: session.frame_size.map_or(0, NonZeroUsize::get),
            frame_retries: upload.retries,
            rebooted_to_bootloader: session.rebooted_to_bootloader,
            // the driver owns the clock
            elapsed: Duration::ZERO,
        };
        info!(device = %summary.device, bytes = summary.bytes, "ota transfer complete");

        let mut actions = vec![Action::Disconnect {
            generation: session.generation,
        }];
        set_phase(&mut self.phase, Phase::Ready, &mut actions);
        actions.push(Action::Finish(Ok(summary)));
        actions
    }
}

fn current<'a>(
    session: &'a mut Option<TransferSession>,
    generation: Generation,
    what: &str,
) -> Option<&'a mut TransferSession> {
    match session.as_ref().map(|s| s.generation) {
        Some(current) if current == generation => session.as_mut(),
        Some(current) => {
            debug!(%generation, %current, "ignoring stale {what}");
            None
        }
        None => {
            debug!(%generation, "ignoring {what} outside a session");
            None
        }
    }
}

fn set_phase(slot: &mut Phase, phase: Phase, actions: &mut Vec<Action>) {
    debug!(from = %slot, to = %phase, "ota phase change");
    *slot = phase;
    actions.push(Action::Report(phase));
}

fn issue_control(session: &mut TransferSession, command: ControlCommand) -> Action {
    session.pending = Some(PendingControl {
        command,
        attempts: 1,
    });
    Action::WriteControl {
        generation: session.generation,
        command,
    }
}

fn schedule(config: &OtaConfig, kind: DelayKind, generation: Generation) -> Action {
    let after = match kind {
        DelayKind::RebootWait => config.reboot_wait(),
        DelayKind::BeginTransfer => config.begin_delay(),
        DelayKind::EndTransfer => config.end_delay(),
        DelayKind::RebootToApplication => config.app_reboot_delay(),
    };
    Action::Schedule {
        timer: Timer { kind, generation },
        after,
    }
}
