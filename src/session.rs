//! Session controller: owns the configuration, statistics and transmit
//! loop, and supervises the GOOSE listener task.
//!
//! Two cooperating tasks share a single atomic `running` flag. The transmit
//! loop runs on the caller's thread; the listener runs on its own thread,
//! opens its own L2 endpoint and is always joined before `run` returns.

use crate::comtrade::ComtradeRecording;
use crate::config::{ReplayConfig, SessionConfig, SourceConfig, CHANNEL_LABELS};
use crate::error::SessionError;
use crate::frame::{build_prefix, MacAddr, VlanTag};
use crate::goose;
use crate::resample;
use crate::stats::SessionStats;
use crate::sv::{self, SvPduBuilder, SV_CHANNELS};
use crate::timer::PeriodicClock;
use crate::transport::L2Transport;
use log::{info, warn};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

const LISTENER_POLL_SLEEP: Duration = Duration::from_millis(10);

/// Session lifecycle. `stop` moves Running to Stopping; Terminated is
/// reached only after the transmit loop has observed the flag and the
/// listener has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    Stopping,
    Terminated,
}

/// Cloneable cooperative stop token; safe to trigger from any thread or a
/// signal handler wrapper.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

type GooseCallback = Arc<dyn Fn(&str, u32, u32) + Send + Sync>;
type ProgressCallback = Box<dyn Fn(u64, f64)>;

struct ReplayStream {
    /// Eight channels of resampled INT32 samples, equal lengths.
    channels: Vec<Vec<i32>>,
    num_samples: usize,
}

impl ReplayStream {
    fn samples_at(&self, index: usize) -> [i32; SV_CHANNELS] {
        let mut out = [0i32; SV_CHANNELS];
        for (sample, channel) in out.iter_mut().zip(self.channels.iter()) {
            *sample = channel[index];
        }
        out
    }
}

pub struct SvSession<T, C> {
    config: SessionConfig,
    clock: C,
    state: SessionState,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<SessionStats>>,
    last_error: String,
    prefix: Vec<u8>,
    stream: Option<ReplayStream>,
    goose_callback: Option<GooseCallback>,
    progress_callback: Option<ProgressCallback>,
    _transport: PhantomData<T>,
}

impl<T, C> SvSession<T, C>
where
    T: L2Transport + 'static,
    C: PeriodicClock,
{
    pub fn new(clock: C) -> SvSession<T, C> {
        SvSession {
            config: SessionConfig::default(),
            clock,
            state: SessionState::Idle,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(SessionStats::default())),
            last_error: String::new(),
            prefix: Vec::new(),
            stream: None,
            goose_callback: None,
            progress_callback: None,
            _transport: PhantomData,
        }
    }

    /// Validate the configuration, resolve the source MAC, load and
    /// resample the COMTRADE recording when replaying, and build the
    /// static frame prefix.
    pub fn configure(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        let result = self.configure_inner(config);
        if let Err(ref err) = result {
            self.last_error = err.to_string();
        }
        result
    }

    fn configure_inner(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Running | SessionState::Stopping) {
            return Err(SessionError::State("cannot configure while running".into()));
        }

        config.validate()?;

        let dst = MacAddr::parse(&config.dst_mac)?;
        let src = if config.src_mac.is_empty() {
            let probe = T::open(&config.iface)?;
            let mac = probe.local_mac();
            drop(probe);
            if mac.is_zero() {
                return Err(SessionError::Transport(format!(
                    "failed to detect MAC address for interface {}",
                    config.iface
                )));
            }
            info!("auto-detected source MAC {} on {}", mac, config.iface);
            mac
        } else {
            MacAddr::parse(&config.src_mac)?
        };

        let vlan = if config.vlan_id != 0 || config.vlan_priority != 0 {
            Some(VlanTag::new(config.vlan_priority, false, config.vlan_id)?)
        } else {
            None
        };

        self.stream = match &config.source {
            SourceConfig::Replay(replay) => Some(load_replay(replay, config.sample_rate)?),
            SourceConfig::Phasors(_) => None,
        };

        self.prefix = build_prefix(dst, src, vlan);
        self.config = config;
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Execute the transmit loop until the source is exhausted or the
    /// session is stopped. Blocks the calling thread; the GOOSE listener
    /// is joined before this returns.
    pub fn run(&mut self) -> Result<(), SessionError> {
        let result = self.run_inner();
        if let Err(ref err) = result {
            self.last_error = err.to_string();
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Configured => {}
            SessionState::Running | SessionState::Stopping => {
                return Err(SessionError::State("session is already running".into()));
            }
            SessionState::Idle | SessionState::Terminated => {
                return Err(SessionError::State("session is not configured".into()));
            }
        }

        let mut tx = T::open(&self.config.iface)?;

        if let Ok(mut stats) = self.stats.write() {
            *stats = SessionStats::default();
            stats.start_time = Some(Instant::now());
        }
        self.running.store(true, Ordering::Release);
        self.state = SessionState::Running;

        let listener = if self.config.enable_goose_monitoring {
            let iface = self.config.iface.clone();
            let trigger = self.config.goose_trigger.clone();
            let running = Arc::clone(&self.running);
            let stats = Arc::clone(&self.stats);
            let callback = self.goose_callback.clone();
            Some(thread::spawn(move || {
                goose_listener_loop::<T>(&iface, &trigger, &running, &stats, callback)
            }))
        } else {
            None
        };

        self.transmit_loop(&mut tx);

        self.running.store(false, Ordering::Release);
        if let Some(handle) = listener {
            let _ = handle.join();
        }

        if let Ok(mut stats) = self.stats.write() {
            stats.end_time = Some(Instant::now());
        }
        self.state = SessionState::Terminated;
        Ok(())
    }

    fn transmit_loop(&mut self, tx: &mut T) {
        let sample_rate = self.config.sample_rate;
        let period_ns = 1_000_000_000u64 / u64::from(sample_rate);
        let mut builder = SvPduBuilder::new(self.config.app_id, &self.config.sv_id, sample_rate);
        let mut frame = Vec::with_capacity(self.prefix.len() + 160);
        let mut sample_idx = 0usize;

        self.clock.align_start(period_ns);
        self.clock.wait_period(period_ns);

        while self.running.load(Ordering::Acquire) {
            let samples = match (&self.config.source, &self.stream) {
                (SourceConfig::Phasors(phasors), _) => {
                    sv::synthesize(phasors, builder.smp_cnt(), sample_rate)
                }
                (SourceConfig::Replay(_), Some(stream)) => stream.samples_at(sample_idx),
                (SourceConfig::Replay(_), None) => break,
            };

            frame.clear();
            frame.extend_from_slice(&self.prefix);
            builder.encode_into(&mut frame, &samples, None);

            match tx.send(&frame) {
                Ok(n) if n > 0 => {
                    let mut sent = 0;
                    if let Ok(mut stats) = self.stats.write() {
                        stats.packets_sent += 1;
                        sent = stats.packets_sent;
                    }
                    let interval = u64::from(self.config.progress_interval);
                    if interval > 0 && sent % interval == 0 {
                        let elapsed = self.stats.read().map(|s| s.elapsed_seconds()).unwrap_or(0.0);
                        match &self.stream {
                            Some(stream) => info!(
                                "sent {} packets in {:.1}s (sample {}/{}, smpCnt: {})",
                                sent, elapsed, sample_idx, stream.num_samples, builder.smp_cnt()
                            ),
                            None => info!(
                                "sent {} packets in {:.1}s (smpCnt: {})",
                                sent, elapsed, builder.smp_cnt()
                            ),
                        }
                        if let Some(callback) = &self.progress_callback {
                            callback(sent, elapsed);
                        }
                    }
                }
                _ => {
                    let mut failed = 0;
                    if let Ok(mut stats) = self.stats.write() {
                        stats.packets_failed += 1;
                        failed = stats.packets_failed;
                    }
                    if failed % 100 == 1 {
                        warn!("failed to send packet (total failures: {})", failed);
                    }
                }
            }

            builder.advance();
            if let Some(stream) = &self.stream {
                sample_idx += 1;
                if sample_idx >= stream.num_samples {
                    let looping = matches!(
                        &self.config.source,
                        SourceConfig::Replay(ReplayConfig { loop_playback: true, .. })
                    );
                    if looping {
                        sample_idx = 0;
                    } else {
                        break;
                    }
                }
            }

            self.clock.wait_period(period_ns);
        }
    }

    /// Request a cooperative stop. A no-op before `run`.
    pub fn stop(&mut self) {
        if self.state == SessionState::Running {
            self.state = SessionState::Stopping;
        }
        self.running.store(false, Ordering::Release);
    }

    /// Stop token usable from other threads and signal handlers.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running && self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn statistics(&self) -> SessionStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// The static `[dst | src | VLAN]` bytes assembled at configure time.
    pub fn frame_prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Invoked on the listener thread for every valid GOOSE frame.
    pub fn set_goose_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str, u32, u32) + Send + Sync + 'static,
    {
        self.goose_callback = Some(Arc::new(callback));
    }

    /// Invoked on the transmit thread at every progress interval.
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(u64, f64) + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn log_configuration(&self) {
        let c = &self.config;
        let src = if c.src_mac.is_empty() { "(auto)" } else { c.src_mac.as_str() };
        info!("interface: {}, dst {}, src {}", c.iface, c.dst_mac, src);
        info!("VLAN id {} priority {}, APPID 0x{:04X}, svID '{}', {} Hz", c.vlan_id, c.vlan_priority, c.app_id, c.sv_id, c.sample_rate);
        if c.enable_goose_monitoring {
            info!("GOOSE stop enabled (gocbRef containing '{}')", c.goose_trigger);
        }
        match &c.source {
            SourceConfig::Phasors(phasors) => {
                for (label, ph) in CHANNEL_LABELS.iter().zip(phasors.iter()) {
                    info!("  {}: {:.2} @ {:.2} deg", label, ph.magnitude, ph.angle_deg);
                }
            }
            SourceConfig::Replay(replay) => {
                info!("replaying {} (loop: {})", replay.cfg_path.display(), replay.loop_playback);
                for (name, sv_channel) in &replay.channel_mapping {
                    info!("  {} -> SV[{}] ({})", name, sv_channel, CHANNEL_LABELS[*sv_channel]);
                }
            }
        }
    }

    pub fn log_statistics(&self) {
        let stats = self.statistics();
        info!(
            "sent {} packets, {} failed, {:.3}s elapsed ({:.1} packets/sec)",
            stats.packets_sent,
            stats.packets_failed,
            stats.elapsed_seconds(),
            stats.average_rate()
        );
        if stats.stopped_by_goose {
            info!("stopped by GOOSE: {}", stats.goose_stop_reason);
        }
    }
}

fn load_replay(replay: &ReplayConfig, sample_rate: u16) -> Result<ReplayStream, SessionError> {
    let recording = ComtradeRecording::load(&replay.cfg_path, replay.dat_path.as_deref())?;
    if recording.samples().is_empty() {
        return Err(SessionError::File("COMTRADE recording contains no samples".into()));
    }
    let in_rate = recording.sample_rate_at(0);
    if in_rate <= 0.0 {
        return Err(SessionError::File("COMTRADE recording declares no sample rate".into()));
    }

    let num_input = recording.samples().len();
    let mut channels: Vec<Vec<f64>> = vec![vec![0.0; num_input]; SV_CHANNELS];
    for (name, sv_channel) in &replay.channel_mapping {
        let channel = recording.analog_channel(name).ok_or_else(|| {
            let available: Vec<&str> = recording.config().analog.iter().map(|c| c.name.as_str()).collect();
            SessionError::Channel(format!(
                "COMTRADE channel '{}' not found (available: {})",
                name,
                available.join(", ")
            ))
        })?;
        channels[*sv_channel] = recording.analog_series(channel.index);
    }

    let resampled = resample::resample(&channels, in_rate, f64::from(sample_rate));
    let num_samples = resampled[0].len();
    let channels: Vec<Vec<i32>> = resampled
        .iter()
        .map(|channel| channel.iter().map(|v| sv::saturating_sample(*v)).collect())
        .collect();

    info!(
        "loaded COMTRADE recording '{}': {} samples @ {} Hz -> {} samples @ {} Hz",
        recording.config().station_name,
        num_input,
        in_rate,
        num_samples,
        sample_rate
    );

    Ok(ReplayStream { channels, num_samples })
}

/// Listener task: opens its own endpoint, watches for GOOSE frames and
/// clears the running flag when the trigger substring matches. Transport
/// errors end the task without affecting the session.
fn goose_listener_loop<T: L2Transport>(
    iface: &str,
    trigger: &str,
    running: &AtomicBool,
    stats: &RwLock<SessionStats>,
    callback: Option<GooseCallback>,
) {
    let mut rx = match T::open(iface) {
        Ok(rx) => rx,
        Err(err) => {
            warn!("failed to open endpoint for GOOSE capture: {}", err);
            return;
        }
    };
    info!("GOOSE capture started on {} (trigger: '{}')", iface, trigger);

    while running.load(Ordering::Acquire) {
        match rx.recv() {
            Ok(Some(frame)) => {
                if goose::is_goose_frame(&frame) {
                    let msg = goose::decode(&frame);
                    if msg.valid {
                        info!(
                            "GOOSE received: appID 0x{:04X}, gocbRef '{}', datSet '{}', stNum {}, sqNum {}",
                            msg.app_id, msg.gocb_ref, msg.dat_set, msg.st_num, msg.sq_num
                        );
                        if let Some(callback) = &callback {
                            callback(&msg.gocb_ref, msg.st_num, msg.sq_num);
                        }
                        if msg.gocb_ref.contains(trigger) {
                            info!("stop GOOSE detected, stopping transmission");
                            if let Ok(mut stats) = stats.write() {
                                stats.stopped_by_goose = true;
                                stats.goose_stop_reason = msg.gocb_ref.clone();
                            }
                            running.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("GOOSE capture error: {}", err);
                break;
            }
        }
        thread::sleep(LISTENER_POLL_SLEEP);
    }

    info!("GOOSE capture stopped");
}

// ============================================================================
// TESTS
// ============================================================================
