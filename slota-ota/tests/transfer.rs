//! End-to-end transfers through `Updater` against a scripted peripheral.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use slota_ota::{
    CancelToken, ChannelReporter, ControlCommand, DeviceAddress, DisconnectPolicy, EventSink,
    EventStream, FailureKind, FirmwareImage, Generation, LinkError, LinkEvent, Notice, OtaConfig,
    OtaError, PeripheralLink, Phase, Report, ServiceMap, TimeoutPolicy, TransferFailure, Updater,
    cancel_pair, event_channel,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const LATENCY: Duration = Duration::from_millis(20);
const NAME: &str = "EFR32 OTA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Busy {
    Never,
    EveryOther,
    Always,
}

struct FakeState {
    in_bootloader: bool,
    /// `None` never answers a connect.
    connect_delay: Option<Duration>,
    busy: Busy,
    refuse_next: bool,
    drop_after_frames: Option<usize>,
    /// Frame number whose write is accepted and then fails on the air.
    lose_frame: Option<usize>,
    peer_mtu: u16,
    negotiates_mtu: bool,
    commands: Vec<(Generation, ControlCommand)>,
    frames: Vec<Vec<u8>>,
    connects: Vec<Generation>,
    disconnects: Vec<Generation>,
}

/// Answers requests after a short delay, the way a radio would.
struct FakePeripheral {
    sink: EventSink,
    state: Mutex<FakeState>,
}

impl FakePeripheral {
    fn new(in_bootloader: bool) -> (Arc<Self>, EventStream) {
        let (sink, events) = event_channel();
        let fake = Self {
            sink,
            state: Mutex::new(FakeState {
                in_bootloader,
                connect_delay: Some(LATENCY),
                busy: Busy::Never,
                refuse_next: false,
                drop_after_frames: None,
                lose_frame: None,
                peer_mtu: 250,
                negotiates_mtu: true,
                commands: Vec::new(),
                frames: Vec::new(),
                connects: Vec::new(),
                disconnects: Vec::new(),
            }),
        };
        (Arc::new(fake), events)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn send_later(&self, after: Duration, event: LinkEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = sink.send(event);
        });
    }

    fn commands(&self) -> Vec<(Generation, ControlCommand)> {
        self.state().commands.clone()
    }

    fn received(&self) -> Vec<u8> {
        self.state().frames.concat()
    }
}

impl PeripheralLink for FakePeripheral {
    fn connect(&self, _: DeviceAddress, generation: Generation) -> Result<(), LinkError> {
        let mut state = self.state();
        state.connects.push(generation);
        if let Some(delay) = state.connect_delay {
            self.send_later(
                delay,
                LinkEvent::Connected {
                    generation,
                    name: Some(NAME.to_string()),
                },
            );
        }
        Ok(())
    }

    fn discover_services(&self, generation: Generation) -> Result<(), LinkError> {
        let services = if self.state().in_bootloader {
            ServiceMap::bootloader()
        } else {
            ServiceMap::application()
        };
        self.send_later(
            LATENCY,
            LinkEvent::ServicesDiscovered {
                generation,
                services,
            },
        );
        Ok(())
    }

    fn write_control(&self, generation: Generation, command: ControlCommand) -> Result<(), LinkError> {
        let mut state = self.state();
        state.commands.push((generation, command));
        self.send_later(
            LATENCY,
            LinkEvent::WriteComplete {
                generation,
                value: command.byte(),
                success: true,
            },
        );
        if command == ControlCommand::RebootToBootloader {
            state.in_bootloader = true;
            self.send_later(LATENCY * 5, LinkEvent::Disconnected { generation });
        }
        Ok(())
    }

    fn write_data(&self, generation: Generation, frame: &[u8]) -> bool {
        let mut state = self.state();
        let refuse = match state.busy {
            Busy::Never => false,
            Busy::Always => true,
            Busy::EveryOther => {
                state.refuse_next = !state.refuse_next;
                state.refuse_next
            }
        };
        if refuse {
            return false;
        }
        state.frames.push(frame.to_vec());
        if state.drop_after_frames == Some(state.frames.len()) {
            self.send_later(Duration::ZERO, LinkEvent::Disconnected { generation });
        }
        if state.lose_frame == Some(state.frames.len()) {
            self.send_later(
                LATENCY,
                LinkEvent::DataWriteFailed {
                    generation,
                    reason: "att error".to_string(),
                },
            );
        }
        true
    }

    fn request_mtu(&self, generation: Generation, mtu: u16) -> Result<(), LinkError> {
        let mtu = mtu.min(self.state().peer_mtu);
        self.send_later(
            LATENCY,
            LinkEvent::MtuChanged {
                generation,
                mtu,
                success: true,
            },
        );
        Ok(())
    }

    fn negotiates_mtu(&self) -> bool {
        self.state().negotiates_mtu
    }

    fn disconnect(&self, generation: Generation) {
        self.state().disconnects.push(generation);
    }
}

fn address() -> DeviceAddress {
    "0C:43:14:F2:A1:9B".parse().unwrap()
}

fn image(len: usize) -> FirmwareImage {
    FirmwareImage::new((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>())
}

fn updater(
    fake: &Arc<FakePeripheral>,
    events: EventStream,
    config: OtaConfig,
) -> (Updater<FakePeripheral>, UnboundedReceiver<Report>) {
    let (reporter, reports) = ChannelReporter::new();
    (Updater::new(fake.clone(), events, config, Arc::new(reporter)), reports)
}

fn drain(reports: &mut UnboundedReceiver<Report>) -> Vec<Report> {
    let mut out = Vec::new();
    while let Ok(report) = reports.try_recv() {
        out.push(report);
    }
    out
}

fn phases(reports: &[Report]) -> Vec<Phase> {
    reports
        .iter()
        .filter_map(|r| match r {
            Report::Phase(phase) => Some(*phase),
            _ => None,
        })
        .collect()
}

fn finished_count(reports: &[Report]) -> usize {
    reports.iter().filter(|r| matches!(r, Report::Finished(_))).count()
}

fn g(n: u32) -> Generation {
    Generation::new(n)
}

#[tokio::test(start_paused = true)]
async fn bootloader_peripheral_gets_begin_end_reboot() {
    let (fake, events) = FakePeripheral::new(true);
    let (updater, mut reports) = updater(&fake, events, OtaConfig::default());
    let image = image(500);

    let summary = updater
        .run(address(), image.clone(), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(
        fake.commands(),
        vec![
            (g(1), ControlCommand::BeginTransfer),
            (g(1), ControlCommand::EndTransfer),
            (g(1), ControlCommand::RebootToApplication),
        ]
    );
    let sizes: Vec<_> = fake.state().frames.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![247, 247, 6]);
    assert_eq!(fake.received(), image.bytes().to_vec());

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.frame_size, 247);
    assert_eq!(summary.mtu, 250);
    assert!(summary.mtu_negotiated);
    assert_eq!(summary.device.name.as_deref(), Some(NAME));
    assert!(!summary.rebooted_to_bootloader);
    assert_eq!(updater.phase(), Phase::Ready);

    let reports = drain(&mut reports);
    assert_eq!(
        phases(&reports),
        vec![
            Phase::Connecting,
            Phase::BeginningTransfer,
            Phase::NegotiatingMtu,
            Phase::Uploading,
            Phase::Ending,
            Phase::Disconnecting,
            Phase::Ready,
        ]
    );
    assert!(reports.contains(&Report::Notice(Notice::UploadStarted {
        frames: 3,
        frame_size: 247,
    })));
    assert!(reports.contains(&Report::Notice(Notice::UploadDone)));
    assert_eq!(finished_count(&reports), 1);
}

#[tokio::test(start_paused = true)]
async fn application_peripheral_is_rebooted_into_bootloader_first() {
    let (fake, events) = FakePeripheral::new(false);
    let (updater, mut reports) = updater(&fake, events, OtaConfig::default());
    let started = Instant::now();

    let summary = updater
        .run(address(), image(1000), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(
        fake.commands(),
        vec![
            (g(1), ControlCommand::RebootToBootloader),
            (g(2), ControlCommand::BeginTransfer),
            (g(2), ControlCommand::EndTransfer),
            (g(2), ControlCommand::RebootToApplication),
        ]
    );
    assert_eq!(fake.state().connects, vec![g(1), g(2)]);
    assert!(fake.state().disconnects.contains(&g(1)));
    assert!(summary.rebooted_to_bootloader);
    assert_eq!(summary.frames, 5);
    // reboot wait, begin, end and reboot-to-app delays
    assert!(started.elapsed() >= Duration::from_millis(7_500));
    assert!(summary.elapsed >= Duration::from_millis(7_500));

    let phases = phases(&drain(&mut reports));
    assert_eq!(
        &phases[..4],
        &[
            Phase::Connecting,
            Phase::ResettingToBootloader,
            Phase::Reconnecting,
            Phase::BeginningTransfer,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn advisory_timeout_tolerates_a_late_connection() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().connect_delay = Some(Duration::from_millis(10_200));
    let (updater, mut reports) = updater(&fake, events, OtaConfig::default());

    let result = updater.run(address(), image(300), CancelToken::never()).await;
    assert!(result.is_ok());

    let reports = drain(&mut reports);
    let timeouts: Vec<_> = reports
        .iter()
        .filter(|r| matches!(r, Report::Notice(Notice::ConnectTimeout { .. })))
        .collect();
    assert_eq!(
        timeouts,
        vec![&Report::Notice(Notice::ConnectTimeout {
            address: address(),
            after: Duration::from_secs(10),
        })]
    );
    assert!(!phases(&reports).contains(&Phase::Aborted));
}

#[tokio::test(start_paused = true)]
async fn no_timeout_notice_when_connected_in_time() {
    let (fake, events) = FakePeripheral::new(false);
    let config = OtaConfig {
        reboot_wait_ms: 12_000,
        ..OtaConfig::default()
    };
    let (updater, mut reports) = updater(&fake, events, config);
    updater
        .run(address(), image(300), CancelToken::never())
        .await
        .unwrap();

    // the session outlives the connect timeout; the disarmed timer stays quiet
    let reports = drain(&mut reports);
    assert!(
        !reports
            .iter()
            .any(|r| matches!(r, Report::Notice(Notice::ConnectTimeout { .. })))
    );
}

#[tokio::test(start_paused = true)]
async fn authoritative_timeout_fails_the_session() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().connect_delay = None;
    let config = OtaConfig {
        timeout_policy: TimeoutPolicy::Authoritative,
        ..OtaConfig::default()
    };
    let (updater, mut reports) = updater(&fake, events, config);

    let err = updater
        .run(address(), image(300), CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OtaError::Transfer(TransferFailure {
            phase: Phase::Connecting,
            kind: FailureKind::ConnectTimeout,
        })
    ));
    assert_eq!(updater.phase(), Phase::Aborted);
    assert!(fake.commands().is_empty());
    assert_eq!(finished_count(&drain(&mut reports)), 1);
}

#[tokio::test(start_paused = true)]
async fn second_session_is_rejected_while_one_is_running() {
    let (fake, events) = FakePeripheral::new(true);
    let (updater, _reports) = updater(&fake, events, OtaConfig::default());
    let updater = Arc::new(updater);

    let first = tokio::spawn({
        let updater = updater.clone();
        async move { updater.run(address(), image(300), CancelToken::never()).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    let other: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
    let err = updater
        .run(other, image(10), CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, OtaError::SessionActive(a) if a == address()));

    assert!(first.await.unwrap().is_ok());
    assert_eq!(fake.state().connects, vec![g(1)]);
}

#[tokio::test(start_paused = true)]
async fn sessions_can_run_back_to_back() {
    let (fake, events) = FakePeripheral::new(true);
    let (updater, mut reports) = updater(&fake, events, OtaConfig::default());

    updater
        .run(address(), image(300), CancelToken::never())
        .await
        .unwrap();
    updater
        .run(address(), image(300), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(fake.state().connects, vec![g(1), g(2)]);
    assert_eq!(fake.commands().len(), 6);
    assert_eq!(finished_count(&drain(&mut reports)), 2);
}

#[tokio::test(start_paused = true)]
async fn empty_image_is_rejected_and_frees_the_slot() {
    let (fake, events) = FakePeripheral::new(true);
    let (updater, _reports) = updater(&fake, events, OtaConfig::default());

    let err = updater
        .run(address(), FirmwareImage::new(Vec::new()), CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, OtaError::EmptyImage));
    assert!(fake.state().connects.is_empty());

    assert!(
        updater
            .run(address(), image(10), CancelToken::never())
            .await
            .is_ok()
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_during_upload_stops_before_ending() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().busy = Busy::Always;
    let (updater, mut reports) = updater(&fake, events, OtaConfig::default());
    let (handle, token) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.cancel();
    });
    let err = updater.run(address(), image(500), token).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(
        err,
        OtaError::Transfer(TransferFailure {
            phase: Phase::Uploading,
            kind: FailureKind::Cancelled,
        })
    ));
    assert_eq!(fake.commands(), vec![(g(1), ControlCommand::BeginTransfer)]);
    assert!(fake.state().disconnects.contains(&g(1)));
    assert!(fake.state().frames.is_empty());

    let reports = drain(&mut reports);
    assert_eq!(phases(&reports).last(), Some(&Phase::Aborted));
    assert_eq!(finished_count(&reports), 1);
}

#[tokio::test(start_paused = true)]
async fn bounded_frame_retries_fail_the_upload() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().busy = Busy::Always;
    let config = OtaConfig {
        max_frame_retries: Some(10),
        ..OtaConfig::default()
    };
    let (updater, _reports) = updater(&fake, events, config);

    let err = updater
        .run(address(), image(500), CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OtaError::Transfer(TransferFailure {
            phase: Phase::Uploading,
            kind: FailureKind::UploadRejected {
                offset: 0,
                attempts: 11,
            },
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_upload_aborts() {
    let (fake, events) = FakePeripheral::new(true);
    {
        let mut state = fake.state();
        state.busy = Busy::EveryOther;
        state.drop_after_frames = Some(1);
    }
    let (updater, _reports) = updater(&fake, events, OtaConfig::default());

    let err = updater
        .run(address(), image(2_000), CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OtaError::Transfer(TransferFailure {
            phase: Phase::Uploading,
            kind: FailureKind::Aborted,
        })
    ));
    assert!(
        !fake
            .commands()
            .iter()
            .any(|(_, c)| *c == ControlCommand::EndTransfer)
    );
}

#[tokio::test(start_paused = true)]
async fn log_only_disconnect_lets_the_upload_finish() {
    let (fake, events) = FakePeripheral::new(true);
    {
        let mut state = fake.state();
        state.busy = Busy::EveryOther;
        state.drop_after_frames = Some(1);
    }
    let config = OtaConfig {
        disconnect_policy: DisconnectPolicy::LogOnly,
        ..OtaConfig::default()
    };
    let (updater, _reports) = updater(&fake, events, config);

    let image = image(2_000);
    updater
        .run(address(), image.clone(), CancelToken::never())
        .await
        .unwrap();
    assert_eq!(fake.received(), image.bytes().to_vec());
}

#[tokio::test(start_paused = true)]
async fn lost_data_write_fails_the_session() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().lose_frame = Some(2);
    let config = OtaConfig {
        disconnect_policy: DisconnectPolicy::LogOnly,
        ..OtaConfig::default()
    };
    let (updater, mut reports) = updater(&fake, events, config);

    let err = updater
        .run(address(), image(500), CancelToken::never())
        .await
        .unwrap_err();
    match err {
        OtaError::Transfer(TransferFailure {
            kind: FailureKind::Link(reason),
            ..
        }) => assert!(reason.contains("att error"), "{reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(
        !fake
            .commands()
            .iter()
            .any(|(_, c)| *c == ControlCommand::RebootToApplication)
    );
    assert_eq!(updater.phase(), Phase::Aborted);

    let reports = drain(&mut reports);
    assert_eq!(finished_count(&reports), 1);
    assert!(matches!(reports.last(), Some(Report::Finished(Err(_)))));
}

#[tokio::test(start_paused = true)]
async fn echoed_mtu_is_not_reported_as_negotiated() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().negotiates_mtu = false;
    let (updater, _reports) = updater(&fake, events, OtaConfig::default());

    let summary = updater
        .run(address(), image(500), CancelToken::never())
        .await
        .unwrap();
    assert_eq!(summary.mtu, 250);
    assert!(!summary.mtu_negotiated);
}

#[tokio::test(start_paused = true)]
async fn upload_progress_is_reported_in_order() {
    let (fake, events) = FakePeripheral::new(true);
    fake.state().busy = Busy::EveryOther;
    let (updater, mut reports) = updater(&fake, events, OtaConfig::default());

    updater
        .run(address(), image(50_000), CancelToken::never())
        .await
        .unwrap();

    let progress: Vec<_> = drain(&mut reports)
        .into_iter()
        .filter_map(|r| match r {
            Report::Progress { sent, total } => Some((sent, total)),
            _ => None,
        })
        .collect();
    assert!(progress.len() >= 2);
    assert!(progress.iter().all(|(_, total)| *total == 50_000));
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(progress.last(), Some(&(50_000, 50_000)));
}
