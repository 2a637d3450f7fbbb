//! Drives a [`TransferMachine`] against a real link
//!
//! One task owns the machine. Link events, timer expiries, the connect
//! timeout and the uploader's result all funnel into that task's loop, so the
//! machine only ever sees one event at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slota_proto::DeviceAddress;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::{
    Action, CancelToken, ChunkUploader, Event, EventStream, FirmwareImage, LinkError, Notice,
    OtaConfig, OtaError, Phase, PeripheralLink, ProgressReporter, TimeoutPolicy, TransferMachine,
    TransferOutcome, TransferSummary,
};

/// Runs OTA transfers over one link, one at a time.
pub struct Updater<L> {
    link: Arc<L>,
    events: tokio::sync::Mutex<EventStream>,
    reporter: Arc<dyn ProgressReporter>,
    config: OtaConfig,
    machine: Mutex<TransferMachine>,
    active: Mutex<Option<DeviceAddress>>,
}

impl<L: PeripheralLink> Updater<L> {
    /// `events` must be the receiving end of the sink `link` reports into.
    pub fn new(
        link: Arc<L>,
        events: EventStream,
        config: OtaConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            link,
            events: tokio::sync::Mutex::new(events),
            reporter,
            machine: Mutex::new(TransferMachine::new(config.clone())),
            config,
            active: Mutex::new(None),
        }
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.machine().phase()
    }

    /// Transfer `image` to the peripheral at `address` and wait for the outcome.
    ///
    /// Fails with [`OtaError::SessionActive`] while another transfer is running.
    /// The reporter's `finished` is called once for every session that gets
    /// past that check. Dropping the future abandons the session and closes
    /// its connection without a report.
    pub async fn run(
        &self,
        address: DeviceAddress,
        image: FirmwareImage,
        cancel: CancelToken,
    ) -> Result<TransferSummary, OtaError> {
        let _guard = SessionGuard::claim(self, address)?;
        let mut events = self.events.lock().await;
        while let Ok(stale) = events.try_recv() {
            trace!(?stale, "dropping event from an earlier session");
        }

        let actions = self.machine().start(address, image.len())?;
        let started = Instant::now();
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            link: self.link.clone(),
            reporter: self.reporter.clone(),
            config: &self.config,
            address,
            image: image.clone(),
            cancel: cancel.clone(),
            internal: internal_tx,
            timeout: None,
            uploader: None,
            timers: Vec::new(),
            outcome: None,
        };
        driver.execute(actions);

        let mut progress = tokio::time::interval(self.config.progress_interval());
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sent = None;
        let mut cancel = cancel;

        let outcome = loop {
            if let Some(outcome) = driver.outcome.take() {
                break outcome;
            }
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancel,
                Some(event) = internal_rx.recv() => event,
                Some(event) = events.recv() => Event::Link(event),
                _ = progress.tick() => {
                    if self.phase() == Phase::Uploading {
                        let sent = image.cursor();
                        if last_sent != Some(sent) {
                            last_sent = Some(sent);
                            self.reporter.upload_progress(sent, image.len());
                        }
                    }
                    continue;
                }
            };

            let actions = match event {
                Event::ConnectTimedOut => self.connect_timed_out(),
                event => self.machine().handle(event),
            };
            driver.execute(actions);
        };

        driver.shutdown();
        let outcome = outcome.map(|mut summary| {
            summary.elapsed = started.elapsed();
            summary.mtu_negotiated = self.link.negotiates_mtu();
            summary
        });
        if outcome.is_ok() {
            self.reporter.upload_progress(image.len(), image.len());
        }
        self.reporter.finished(&outcome);
        outcome.map_err(OtaError::from)
    }

    fn connect_timed_out(&self) -> Vec<Action> {
        let mut machine = self.machine();
        if !machine.awaiting_connection() {
            debug!("connect timeout fired after the connection came up");
            return Vec::new();
        }

        let after = self.config.connect_timeout();
        let Some(address) = machine.session().map(|s| s.device().address) else {
            return Vec::new();
        };
        warn!(%address, ?after, "peripheral has not connected yet");
        self.reporter.notice(&Notice::ConnectTimeout { address, after });

        match self.config.timeout_policy {
            TimeoutPolicy::Advisory => Vec::new(),
            TimeoutPolicy::Authoritative => machine.on_connect_timeout(),
        }
    }

    fn machine(&self) -> MutexGuard<'_, TransferMachine> {
        lock(&self.machine)
    }
}

/// Claims the single session slot; releasing it cancels whatever is left of the session.
struct SessionGuard<'a, L: PeripheralLink> {
    updater: &'a Updater<L>,
}

impl<'a, L: PeripheralLink> SessionGuard<'a, L> {
    fn claim(updater: &'a Updater<L>, address: DeviceAddress) -> Result<Self, OtaError> {
        let mut active = lock(&updater.active);
        if let Some(current) = *active {
            return Err(OtaError::SessionActive(current));
        }
        *active = Some(address);
        Ok(Self { updater })
    }
}

impl<L: PeripheralLink> Drop for SessionGuard<'_, L> {
    fn drop(&mut self) {
        let leftovers = self.updater.machine().cancel();
        for action in leftovers {
            if let Action::Disconnect { generation } = action {
                self.updater.link.disconnect(generation);
            }
        }
        *lock(&self.updater.active) = None;
    }
}

/// Carries out machine actions for one session.
struct Driver<'a, L> {
    link: Arc<L>,
    reporter: Arc<dyn ProgressReporter>,
    config: &'a OtaConfig,
    address: DeviceAddress,
    image: FirmwareImage,
    cancel: CancelToken,
    internal: mpsc::UnboundedSender<Event>,
    timeout: Option<JoinHandle<()>>,
    uploader: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    outcome: Option<TransferOutcome>,
}

impl<L: PeripheralLink> Driver<'_, L> {
    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Report(phase) => self.reporter.phase_changed(phase),
                Action::Notify(notice) => self.reporter.notice(&notice),
                Action::ArmConnectTimeout => self.arm_connect_timeout(),
                Action::DisarmConnectTimeout => {
                    if let Some(timeout) = self.timeout.take() {
                        timeout.abort();
                    }
                }
                Action::Connect {
                    address,
                    generation,
                } => {
                    debug!(%address, %generation, "connecting");
                    let result = self.link.connect(address, generation);
                    self.check(result);
                }
                Action::DiscoverServices { generation } => {
                    let result = self.link.discover_services(generation);
                    self.check(result);
                }
                Action::WriteControl {
                    generation,
                    command,
                } => {
                    if self.cancel.is_cancelled() {
                        debug!(%command, "cancelled, not writing");
                        continue;
                    }
                    debug!(%command, %generation, "writing control");
                    let result = self.link.write_control(generation, command);
                    self.check(result);
                }
                Action::RequestMtu { generation, mtu } => {
                    debug!(mtu, %generation, "requesting mtu");
                    let result = self.link.request_mtu(generation, mtu);
                    self.check(result);
                }
                Action::Schedule { timer, after } => {
                    let internal = self.internal.clone();
                    self.timers.retain(|t| !t.is_finished());
                    self.timers.push(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = internal.send(Event::Timer(timer));
                    }));
                }
                Action::StartUpload {
                    generation,
                    frame_size,
                } => {
                    let uploader =
                        ChunkUploader::new(self.link.clone(), generation, frame_size, self.cancel.clone())
                            .with_backoff(self.config.write_backoff())
                            .with_max_retries(self.config.max_frame_retries);
                    let image = self.image.clone();
                    let internal = self.internal.clone();
                    self.uploader = Some(tokio::spawn(async move {
                        let result = uploader.run(image).await;
                        let _ = internal.send(Event::UploadFinished(result));
                    }));
                }
                Action::Disconnect { generation } => self.link.disconnect(generation),
                Action::Finish(outcome) => self.outcome = Some(outcome),
            }
        }
    }

    fn arm_connect_timeout(&mut self) {
        if let Some(old) = self.timeout.take() {
            old.abort();
        }
        let after = self.config.connect_timeout();
        let internal = self.internal.clone();
        debug!(address = %self.address, ?after, "connect timeout armed");
        self.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = internal.send(Event::ConnectTimedOut);
        }));
    }

    fn check(&self, result: Result<(), LinkError>) {
        if let Err(err) = result {
            warn!(%err, "link refused request");
            let _ = self.internal.send(Event::RequestFailed(err.to_string()));
        }
    }
}

impl<L> Driver<'_, L> {
    fn shutdown(&mut self) {
        for task in self
            .timeout
            .take()
            .into_iter()
            .chain(self.uploader.take())
            .chain(self.timers.drain(..))
        {
            task.abort();
        }
    }
}

impl<L> Drop for Driver<'_, L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
