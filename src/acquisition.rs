//! The acquisition loop and its controller.
//!
//! [`Acquisition`] lives in the UI/control context. `start` moves the
//! [`DeviceSession`] into a background worker which runs
//!
//! ```text
//! Idle -> Arming -> Waiting -> Reading -> Idle     (single shot)
//!           ^                     |
//!           +---------------------+                (continuous)
//! ```
//!
//! and hands it back on `stop`. Configuration requested while the worker runs
//! is queued and applied at the next `Idle -> Arming` boundary.

use crate::{
    config::validate_capture, AcqError, AcquisitionConfig, AcquisitionMode, ChannelConfig,
    DeviceSession, DisplaySink, Instrument, LoopSettings, SampleBuffer,
};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const EVENT_CAPACITY: usize = 64;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    Idle = 0,
    Arming = 1,
    Waiting = 2,
    Reading = 3,
}

impl From<u8> for AcqState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Arming,
            2 => Self::Waiting,
            3 => Self::Reading,
            _ => Self::Idle,
        }
    }
}

/// Progress reported by the worker to the control context.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// `samples` counts every channel of the capture.
    Captured {
        sequence: u64,
        channels: usize,
        samples: usize,
    },
    Reconfigured,
    Error(AcqError),
    Finished,
}

type PendingConfig = (Vec<ChannelConfig>, AcquisitionConfig);

#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    finished: AtomicBool,
    state: AtomicU8,
    pending: Mutex<Option<PendingConfig>>,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn state(&self) -> AcqState {
        AcqState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: AcqState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn queue(&self, config: PendingConfig) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    fn take_pending(&self) -> Option<PendingConfig> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

pub struct Acquisition<I: Instrument + Send + 'static> {
    session: Option<DeviceSession<I>>,
    worker: Option<JoinHandle<DeviceSession<I>>>,
    shared: Arc<Shared>,
    channels: Vec<ChannelConfig>,
    acq: AcquisitionConfig,
    settings: LoopSettings,
    channel_count: usize,
    tx_events: Sender<LoopEvent>,
    rx_events: Receiver<LoopEvent>,
}

impl<I: Instrument + Send + 'static> Acquisition<I> {
    pub fn new(
        session: DeviceSession<I>,
        channels: Vec<ChannelConfig>,
        acq: AcquisitionConfig,
        settings: LoopSettings,
    ) -> Result<Self, AcqError> {
        settings.validate()?;
        let (tx_events, rx_events) = bounded(EVENT_CAPACITY);
        Ok(Self {
            channel_count: session.channel_count(),
            session: Some(session),
            worker: None,
            shared: Arc::new(Shared::default()),
            channels,
            acq,
            settings,
            tx_events,
            rx_events,
        })
    }

    pub fn state(&self) -> AcqState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && !self.worker_done()
    }

    fn worker_done(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
            || self.worker.as_ref().is_some_and(|w| w.is_finished())
    }

    /// Events published by the worker. The channel is bounded and never blocks
    /// the loop: when nobody drains it, `Captured` and `Reconfigured` are
    /// dropped, while `Error` and `Finished` displace the oldest queued event.
    pub fn events(&self) -> Receiver<LoopEvent> {
        self.rx_events.clone()
    }

    /// The session, while no worker holds it.
    pub fn session(&self) -> Option<&DeviceSession<I>> {
        self.session.as_ref()
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn acquisition_config(&self) -> &AcquisitionConfig {
        &self.acq
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn start<S>(&mut self, mode: AcquisitionMode, sink: S) -> Result<(), AcqError>
    where
        S: DisplaySink + 'static,
    {
        self.reap()?;
        if self.worker.is_some() {
            return Err(AcqError::AlreadyRunning);
        }
        let Some(session) = self.session.as_ref() else {
            return Err(AcqError::SessionNotOpen);
        };
        if !session.is_open() {
            return Err(AcqError::SessionNotOpen);
        }
        if session.is_armed() {
            return Err(AcqError::CaptureInFlight);
        }
        validate_capture(&self.channels, &self.acq, session.channel_count())?;
        let Some(session) = self.session.take() else {
            return Err(AcqError::SessionNotOpen);
        };

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.finished.store(false, Ordering::SeqCst);
        self.shared.take_pending();
        self.shared.set_state(AcqState::Arming);

        let worker = Worker {
            session,
            sink: Box::new(sink),
            shared: Arc::clone(&self.shared),
            tx_events: self.tx_events.clone(),
            stale_events: self.rx_events.clone(),
            channels: self.channels.clone(),
            acq: self.acq.clone(),
            settings: self.settings.clone(),
            mode,
        };
        info!("Starting {:?} acquisition", mode);
        self.worker = Some(thread::spawn(move || worker.run()));
        Ok(())
    }

    /// Stop the worker and take the session back. The session stays open.
    pub fn stop(&mut self) -> Result<(), AcqError> {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.reap_blocking()
    }

    /// Request a new configuration. Applied at once when idle, otherwise
    /// deferred to the next capture boundary (latest request wins).
    pub fn reconfigure(
        &mut self,
        channels: Vec<ChannelConfig>,
        acq: AcquisitionConfig,
    ) -> Result<(), AcqError> {
        validate_capture(&channels, &acq, self.channel_count)?;
        if self.is_running() {
            debug!("Deferring reconfiguration until the current capture completes");
            self.shared.queue((channels.clone(), acq.clone()));
        }
        self.channels = channels;
        self.acq = acq;
        Ok(())
    }

    /// Full stop: stop the worker, then close the session.
    pub fn close(&mut self) -> Result<(), AcqError> {
        let stopped = self.stop();
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
        stopped
    }

    fn reap(&mut self) -> Result<(), AcqError> {
        if self.worker.is_some() && self.worker_done() {
            self.reap_blocking()?;
        }
        Ok(())
    }

    fn reap_blocking(&mut self) -> Result<(), AcqError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = worker.join();
        self.shared.set_state(AcqState::Idle);
        match result {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(_) => {
                error!("Acquisition worker panicked; session released");
                Err(AcqError::WorkerPanicked)
            }
        }
    }
}

impl<I: Instrument + Send + 'static> Drop for Acquisition<I> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct Worker<I: Instrument> {
    session: DeviceSession<I>,
    sink: Box<dyn DisplaySink>,
    shared: Arc<Shared>,
    tx_events: Sender<LoopEvent>,
    stale_events: Receiver<LoopEvent>,
    channels: Vec<ChannelConfig>,
    acq: AcquisitionConfig,
    settings: LoopSettings,
    mode: AcquisitionMode,
}

impl<I: Instrument> Worker<I> {
    fn run(mut self) -> DeviceSession<I> {
        let started = Instant::now();
        let mut sequence = 0u64;
        let mut needs_config = true;

        loop {
            self.shared.set_state(AcqState::Idle);
            if self.shared.stopped() {
                break;
            }
            let mut reconfigured = false;
            if let Some((channels, acq)) = self.shared.take_pending() {
                self.channels = channels;
                self.acq = acq;
                needs_config = true;
                reconfigured = true;
            }
            if needs_config {
                if let Err(e) = self.session.configure(&self.channels, &self.acq) {
                    if self.recover(e) {
                        continue;
                    }
                    break;
                }
                needs_config = false;
                if reconfigured {
                    info!("Applied deferred reconfiguration");
                    self.emit(LoopEvent::Reconfigured);
                }
            }

            match self.cycle(started, sequence) {
                Ok(Some(capture)) => {
                    let channels = capture.len();
                    let samples = capture.iter().map(SampleBuffer::len).sum();
                    self.sink.deliver_capture(capture);
                    self.emit(LoopEvent::Captured {
                        sequence,
                        channels,
                        samples,
                    });
                    sequence += 1;
                    if self.mode == AcquisitionMode::Single {
                        break;
                    }
                    self.pause(self.settings.frame_interval);
                }
                Ok(None) => break,
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                }
            }
        }

        self.session.abort();
        self.shared.set_state(AcqState::Idle);
        self.shared.finished.store(true, Ordering::SeqCst);
        self.emit(LoopEvent::Finished);
        debug!("Acquisition worker finished after {} capture(s)", sequence);
        self.session
    }

    /// One arm/wait/read cycle. `Ok(None)` means the stop signal was seen.
    fn cycle(
        &mut self,
        started: Instant,
        sequence: u64,
    ) -> Result<Option<Vec<SampleBuffer>>, AcqError> {
        self.shared.set_state(AcqState::Arming);
        let timestamp_base = started.elapsed().as_secs_f64();
        self.session.arm()?;

        self.shared.set_state(AcqState::Waiting);
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            if self.shared.stopped() {
                self.session.abort();
                return Ok(None);
            }
            let status = match self.session.status() {
                Ok(status) => status,
                Err(e) => {
                    self.session.abort();
                    return Err(e);
                }
            };
            if status.is_done() {
                break;
            }
            if Instant::now() >= deadline {
                self.session.abort();
                return Err(AcqError::AcquisitionTimeout(self.settings.timeout));
            }
            thread::sleep(self.settings.poll_interval);
        }

        if self.shared.stopped() {
            self.session.abort();
            return Ok(None);
        }
        self.shared.set_state(AcqState::Reading);
        let capture = self.session.read_capture(sequence, timestamp_base)?;
        Ok(Some(capture))
    }

    /// Report a failed cycle. Returns whether the loop should carry on.
    fn recover(&mut self, e: AcqError) -> bool {
        self.shared.set_state(AcqState::Idle);
        let retry = self.mode == AcquisitionMode::Continuous
            && self.settings.retry_on_error
            && e.is_recoverable();
        if retry {
            warn!("Acquisition cycle failed, retrying: {}", e);
        } else {
            error!("Acquisition cycle failed: {}", e);
        }
        self.emit(LoopEvent::Error(e));
        if retry {
            self.pause(self.settings.retry_delay);
        }
        retry && !self.shared.stopped()
    }

    /// Sleep in poll-sized slices so a stop request is seen promptly.
    fn pause(&self, duration: Duration) {
        let until = Instant::now() + duration;
        loop {
            if self.shared.stopped() {
                return;
            }
            let now = Instant::now();
            if now >= until {
                return;
            }
            thread::sleep((until - now).min(self.settings.poll_interval));
        }
    }

    fn emit(&self, mut event: LoopEvent) {
        loop {
            match self.tx_events.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back))
                    if matches!(back, LoopEvent::Error(_) | LoopEvent::Finished) =>
                {
                    let _ = self.stale_events.try_recv();
                    event = back;
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handoff, CallLog, SimCall, SimSettings, SimulatedInstrument, TriggerSource};

    const DEADLINE: Duration = Duration::from_secs(5);

    fn fast_settings() -> LoopSettings {
        LoopSettings {
            poll_interval: Duration::from_micros(200),
            timeout: Duration::from_secs(1),
            frame_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn scenario() -> (Vec<ChannelConfig>, AcquisitionConfig) {
        (
            vec![ChannelConfig::new(0, 5.0), ChannelConfig::disabled(1)],
            AcquisitionConfig {
                sample_rate_hz: 1e6,
                buffer_size: 4096,
                ..Default::default()
            },
        )
    }

    fn acquisition(
        sim: SimSettings,
        settings: LoopSettings,
    ) -> (Acquisition<SimulatedInstrument>, CallLog) {
        let instrument = SimulatedInstrument::new(sim);
        let calls = instrument.calls();
        let session = DeviceSession::open(instrument).unwrap();
        let (channels, acq) = scenario();
        (
            Acquisition::new(session, channels, acq, settings).unwrap(),
            calls,
        )
    }

    fn collector() -> (
        Arc<Mutex<Vec<SampleBuffer>>>,
        impl FnMut(SampleBuffer) + Send + 'static,
    ) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&store);
        (store, move |b: SampleBuffer| {
            sink_store.lock().unwrap().push(b)
        })
    }

    fn wait_for(rx: &Receiver<LoopEvent>, pred: impl Fn(&LoopEvent) -> bool) -> LoopEvent {
        let until = Instant::now() + DEADLINE;
        loop {
            let left = until.saturating_duration_since(Instant::now());
            let event = rx.recv_timeout(left).expect("event not received in time");
            if pred(&event) {
                return event;
            }
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let until = Instant::now() + DEADLINE;
        while !cond() {
            assert!(Instant::now() < until, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn single_shot_delivers_enabled_channel_only() {
        let (mut acq, _) = acquisition(SimSettings::default(), fast_settings());
        let (store, sink) = collector();
        let events = acq.events();

        acq.start(AcquisitionMode::Single, sink).unwrap();
        wait_for(&events, |e| *e == LoopEvent::Finished);
        acq.stop().unwrap();

        let buffers = store.lock().unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].channel_index, 0);
        assert!(buffers[0].len() <= 4096);
        assert_eq!(buffers[0].sequence, 0);
        assert_eq!(acq.state(), AcqState::Idle);
        assert!(acq.session().unwrap().is_open());
    }

    #[test]
    fn requests_buffer_size_and_delivers_at_most_that() {
        let (mut acq, calls) = acquisition(
            SimSettings {
                valid_samples: Some(5000),
                ..Default::default()
            },
            fast_settings(),
        );
        let (store, sink) = collector();
        let events = acq.events();
        acq.start(AcquisitionMode::Single, sink).unwrap();
        wait_for(&events, |e| *e == LoopEvent::Finished);
        acq.stop().unwrap();

        assert_eq!(calls.count(|c| matches!(c, SimCall::Read { len: 4096, .. })), 1);
        assert!(store.lock().unwrap().iter().all(|b| b.len() <= 4096));
    }

    #[test]
    fn start_on_closed_session_makes_no_calls() {
        let instrument = SimulatedInstrument::new(SimSettings::default());
        let calls = instrument.calls();
        let session = DeviceSession::new(instrument);
        let (channels, config) = scenario();
        let mut acq = Acquisition::new(session, channels, config, fast_settings()).unwrap();

        let (store, sink) = collector();
        assert_eq!(
            acq.start(AcquisitionMode::Continuous, sink),
            Err(AcqError::SessionNotOpen)
        );
        assert!(calls.is_empty());
        assert!(store.lock().unwrap().is_empty());
        assert!(!acq.is_running());
    }

    #[test]
    fn stop_while_waiting_is_prompt_and_keeps_session_open() {
        let (mut acq, calls) = acquisition(
            SimSettings {
                never_done: true,
                ..Default::default()
            },
            LoopSettings {
                timeout: Duration::from_secs(30),
                ..fast_settings()
            },
        );
        let (store, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        wait_until(|| acq.state() == AcqState::Waiting);

        let asked = Instant::now();
        acq.stop().unwrap();
        assert!(asked.elapsed() < Duration::from_millis(250));
        assert!(store.lock().unwrap().is_empty());
        assert_eq!(acq.state(), AcqState::Idle);

        let session = acq.session().unwrap();
        assert!(session.is_open());
        assert!(!session.is_armed());
        assert_eq!(calls.count(|c| *c == SimCall::Abort), 1);
        assert_eq!(calls.count(|c| *c == SimCall::Close), 0);

        acq.stop().unwrap();
        assert!(acq.session().unwrap().is_open());
    }

    #[test]
    fn timeout_delivers_nothing_and_goes_idle() {
        let (mut acq, _) = acquisition(
            SimSettings {
                never_done: true,
                ..Default::default()
            },
            LoopSettings {
                timeout: Duration::from_millis(20),
                ..fast_settings()
            },
        );
        let (store, sink) = collector();
        let events = acq.events();
        acq.start(AcquisitionMode::Single, sink).unwrap();

        let event = wait_for(&events, |e| matches!(e, LoopEvent::Error(_)));
        assert_eq!(
            event,
            LoopEvent::Error(AcqError::AcquisitionTimeout(Duration::from_millis(20)))
        );
        wait_for(&events, |e| *e == LoopEvent::Finished);
        acq.stop().unwrap();
        assert!(store.lock().unwrap().is_empty());
        assert_eq!(acq.state(), AcqState::Idle);
        assert!(!acq.session().unwrap().is_armed());
    }

    #[test]
    fn continuous_delivers_in_capture_order() {
        const N: usize = 20;
        let (mut acq, _) = acquisition(SimSettings::default(), fast_settings());
        let channels = vec![ChannelConfig::new(0, 5.0), ChannelConfig::new(1, 2.0)];
        acq.reconfigure(channels, acq.acquisition_config().clone())
            .unwrap();
        let (store, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        wait_until(|| store.lock().unwrap().len() >= 2 * N);
        acq.stop().unwrap();

        let buffers = store.lock().unwrap();
        let order: Vec<(u64, usize)> = buffers
            .iter()
            .map(|b| (b.sequence, b.channel_index))
            .collect();
        for (i, pair) in order.chunks(2).take(N).enumerate() {
            assert_eq!(pair, &[(i as u64, 0), (i as u64, 1)]);
        }
        assert!(buffers
            .windows(2)
            .all(|w| w[0].timestamp_base <= w[1].timestamp_base));
    }

    #[test]
    fn reconfigure_while_waiting_is_deferred() {
        let (mut acq, calls) = acquisition(
            SimSettings {
                polls_to_done: 40,
                ..Default::default()
            },
            fast_settings(),
        );
        let events = acq.events();
        let (store, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        wait_until(|| acq.state() == AcqState::Waiting);

        let mut channels = acq.channels().to_vec();
        channels[0].range_volts = 10.0;
        acq.reconfigure(channels, acq.acquisition_config().clone())
            .unwrap();
        wait_for(&events, |e| *e == LoopEvent::Reconfigured);
        wait_until(|| store.lock().unwrap().len() >= 2);
        acq.stop().unwrap();

        // No configuration call may land between an arm and the read or abort that ends it.
        let mut armed = false;
        for call in calls.snapshot() {
            match call {
                SimCall::Arm => armed = true,
                SimCall::Read { .. } | SimCall::Abort => armed = false,
                SimCall::ConfigureChannel(_) | SimCall::ConfigureAcquisition(_) => {
                    assert!(!armed, "configuration applied mid-capture")
                }
                _ => {}
            }
        }
        assert!(calls.snapshot().iter().any(|c| matches!(
            c,
            SimCall::ConfigureChannel(ch) if ch.index == 0 && ch.range_volts == 10.0
        )));
        assert_eq!(acq.channels()[0].range_volts, 10.0);
    }

    #[test]
    fn reconfigure_validates_immediately() {
        let (mut acq, _) = acquisition(SimSettings::default(), fast_settings());
        let bad = vec![ChannelConfig::new(0, 7.0)];
        assert!(matches!(
            acq.reconfigure(bad, AcquisitionConfig::default()),
            Err(AcqError::InvalidParameter(_))
        ));
        assert_eq!(acq.channels()[0].range_volts, 5.0);
    }

    #[test]
    fn arm_failure_reports_and_returns_to_idle() {
        let (mut acq, _) = acquisition(
            SimSettings {
                fail_arm: true,
                ..Default::default()
            },
            fast_settings(),
        );
        let events = acq.events();
        let (store, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        let event = wait_for(&events, |e| matches!(e, LoopEvent::Error(_)));
        assert!(matches!(event, LoopEvent::Error(AcqError::ArmFailed(_))));
        wait_for(&events, |e| *e == LoopEvent::Finished);
        acq.stop().unwrap();
        assert!(store.lock().unwrap().is_empty());
        assert!(acq.session().unwrap().is_open());
    }

    #[test]
    fn retry_policy_keeps_continuous_loop_alive() {
        let (mut acq, calls) = acquisition(
            SimSettings {
                fail_read: true,
                ..Default::default()
            },
            LoopSettings {
                retry_on_error: true,
                retry_delay: Duration::from_millis(2),
                ..fast_settings()
            },
        );
        let events = acq.events();
        let (_, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        for _ in 0..3 {
            let event = wait_for(&events, |e| matches!(e, LoopEvent::Error(_)));
            assert!(matches!(event, LoopEvent::Error(AcqError::ReadFailed(_))));
        }
        assert!(acq.is_running());
        acq.stop().unwrap();
        assert!(calls.count(|c| *c == SimCall::Arm) >= 3);
    }

    #[test]
    fn second_start_while_running_is_refused() {
        let (mut acq, _) = acquisition(SimSettings::default(), fast_settings());
        let (_, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        let (_, other) = collector();
        assert_eq!(
            acq.start(AcquisitionMode::Single, other),
            Err(AcqError::AlreadyRunning)
        );
        acq.stop().unwrap();
    }

    #[test]
    fn restart_after_single_shot() {
        let (mut acq, _) = acquisition(SimSettings::default(), fast_settings());
        let events = acq.events();
        let (store, sink) = collector();
        acq.start(AcquisitionMode::Single, sink).unwrap();
        wait_for(&events, |e| *e == LoopEvent::Finished);

        let (second, sink) = collector();
        acq.start(AcquisitionMode::Single, sink).unwrap();
        wait_for(&events, |e| *e == LoopEvent::Finished);
        acq.stop().unwrap();
        assert_eq!(store.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn latest_wins_handoff_never_reorders() {
        let (mut acq, _) = acquisition(SimSettings::default(), fast_settings());
        let (tx, rx) = handoff(1);
        acq.start(AcquisitionMode::Continuous, tx).unwrap();

        let mut last = None;
        let until = Instant::now() + Duration::from_millis(200);
        while Instant::now() < until {
            if let Some(capture) = rx.recv_timeout(Duration::from_millis(10)) {
                let seq = capture[0].sequence;
                assert!(last.map_or(true, |l| seq > l));
                last = Some(seq);
            }
        }
        acq.stop().unwrap();
        assert!(last.is_some());
    }

    #[test]
    fn close_releases_handle() {
        let (mut acq, calls) = acquisition(SimSettings::default(), fast_settings());
        let (_, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        acq.close().unwrap();
        assert!(!acq.session().unwrap().is_open());
        assert_eq!(calls.count(|c| *c == SimCall::Close), 1);
        assert_eq!(
            acq.start(AcquisitionMode::Single, |_b: SampleBuffer| {}),
            Err(AcqError::SessionNotOpen)
        );
    }

    #[test]
    fn triggered_config_is_passed_to_device() {
        let (mut acq, calls) = acquisition(SimSettings::default(), fast_settings());
        let config = AcquisitionConfig {
            trigger_source: TriggerSource::Channel1,
            trigger_level_volts: 0.5,
            ..acq.acquisition_config().clone()
        };
        acq.reconfigure(acq.channels().to_vec(), config.clone())
            .unwrap();
        let events = acq.events();
        let (_, sink) = collector();
        acq.start(AcquisitionMode::Single, sink).unwrap();
        wait_for(&events, |e| *e == LoopEvent::Finished);
        acq.stop().unwrap();
        assert!(calls
            .snapshot()
            .contains(&SimCall::ConfigureAcquisition(config)));
    }

    #[test]
    fn terminal_events_survive_a_full_event_channel() {
        let (mut acq, _) = acquisition(
            SimSettings {
                fail_read_after: Some(80),
                ..Default::default()
            },
            fast_settings(),
        );
        let events = acq.events();
        let (store, sink) = collector();
        acq.start(AcquisitionMode::Continuous, sink).unwrap();
        wait_until(|| !acq.is_running());
        acq.stop().unwrap();

        let queued: Vec<LoopEvent> = events.try_iter().collect();
        assert_eq!(queued.len(), EVENT_CAPACITY);
        assert!(matches!(
            queued[queued.len() - 2],
            LoopEvent::Error(AcqError::ReadFailed(_))
        ));
        assert_eq!(queued.last(), Some(&LoopEvent::Finished));
        assert_eq!(store.lock().unwrap().len(), 80);
    }
}
