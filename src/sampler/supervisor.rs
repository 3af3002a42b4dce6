//! Sampler process supervisor
//!
//! Two threads:
//!
//! - `asmon-ingest` owns the child process. It reads records from the child's stdout and
//!   hands each one to the [`RecordSink`] before reading the next, reaps the child on end of
//!   stream and applies the [`RestartPolicy`].
//! - `asmon-control` consumes [`Control`] commands and turns them into signals for the
//!   current child. A stop request terminates the child's process group, which closes its
//!   stdout and unblocks the ingest thread's read; the group is killed if it outlives the
//!   grace period.

use super::command::{check_privilege, SamplerCommand, SamplerProcess};
use super::policy::{ExitReport, RestartDecision, RestartPolicy};
use super::{SamplerState, SamplerStatus};
use crate::config::{RestartConfig, SamplerConfig};
use crate::error::{Error, Result};
use crate::stream::{RawRecord, RecordReader};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Downstream consumer of the supervised stream
///
/// Called only from the ingest thread, never concurrently.
pub trait RecordSink: Send + 'static {
    /// One complete record, in stream order
    fn on_record(&mut self, record: RawRecord);

    /// Supervisor status changed
    fn on_status(&mut self, status: SamplerStatus);

    /// A new sampler process is about to be read
    fn on_generation(&mut self, _generation: u64) {}
}

/// Out-of-band requests for the running sampler
#[derive(Debug)]
pub enum Control {
    /// Take a sample immediately (SIGINFO)
    SampleNow,
    /// Flush buffered output (SIGIO)
    Flush,
    /// Terminate and do not restart; acknowledged with whether the ingest thread ended
    Stop(Sender<bool>),
}

#[derive(Debug, Clone, Copy)]
enum ProcessSignal {
    SampleNow,
    Flush,
    Terminate,
    Kill,
}

#[derive(Default)]
struct Shared {
    /// pid of the live child, 0 when none
    pid: AtomicU32,
    stopping: AtomicBool,
}

/// Entry point for launching a supervised sampler
pub struct Supervisor;

impl Supervisor {
    /// Launch the sampler and start supervising it
    ///
    /// The first launch happens before this returns, so a missing binary or missing
    /// privilege surfaces here as a fatal error instead of a restart loop.
    pub fn start<S: RecordSink>(
        command: SamplerCommand,
        sampler: &SamplerConfig,
        restart: &RestartConfig,
        sink: S,
    ) -> Result<SupervisorHandle> {
        if sampler.require_root {
            check_privilege(command.program())?;
        }

        let process = command.spawn()?;
        let shared = Arc::new(Shared::default());
        shared.pid.store(process.id(), Ordering::SeqCst);

        let (control_tx, control_rx) = mpsc::channel();
        let (wake_tx, wake_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let ingest = Ingest {
            command,
            policy: RestartPolicy::new(sampler, restart),
            sink,
            shared: Arc::clone(&shared),
            status: SamplerStatus::default(),
            wake: wake_rx,
            _done: done_tx,
        };
        let ingest = thread::Builder::new()
            .name("asmon-ingest".into())
            .spawn(move || ingest.run(process))?;

        let stop_timeout = sampler.stop_timeout();
        let controller = thread::Builder::new()
            .name("asmon-control".into())
            .spawn(move || control_loop(control_rx, shared, wake_tx, done_rx, stop_timeout))?;

        Ok(SupervisorHandle {
            control: control_tx,
            ingest: Some(ingest),
            controller: Some(controller),
        })
    }
}

/// Handle to a running supervisor; dropping it stops the sampler
pub struct SupervisorHandle {
    control: Sender<Control>,
    ingest: Option<JoinHandle<()>>,
    controller: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Ask the sampler for an immediate sample
    pub fn sample_now(&self) -> Result<()> {
        self.send(Control::SampleNow)
    }

    /// Ask the sampler to flush buffered output
    pub fn flush(&self) -> Result<()> {
        self.send(Control::Flush)
    }

    /// Sender for issuing commands from other threads
    pub fn controls(&self) -> Sender<Control> {
        self.control.clone()
    }

    /// Whether the ingest thread has ended (stopped or failed)
    pub fn is_finished(&self) -> bool {
        self.ingest.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Terminate the sampler and wait until its stream is closed and both threads exit
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn send(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| Error::Supervisor("supervisor is not running".into()))
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(controller) = self.controller.take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = mpsc::channel();
        let mut ended = true;
        if self.control.send(Control::Stop(ack_tx)).is_ok() {
            ended = ack_rx.recv().unwrap_or(true);
        }
        controller
            .join()
            .map_err(|_| Error::Supervisor("control thread panicked".into()))?;
        if let Some(ingest) = self.ingest.take() {
            // still blocked on a stream some escaped process holds open; it drops records
            // once stopping is set, so leave it detached
            if !ended && !ingest.is_finished() {
                log::warn!("Ingest thread still running after stop, detaching it");
                return Ok(());
            }
            ingest
                .join()
                .map_err(|_| Error::Supervisor("ingest thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Sampler shutdown failed: {}", e);
        }
    }
}

struct Ingest<S> {
    command: SamplerCommand,
    policy: RestartPolicy,
    sink: S,
    shared: Arc<Shared>,
    status: SamplerStatus,
    wake: Receiver<()>,
    /// Dropped when this thread ends, which the control thread waits for
    _done: Sender<()>,
}

impl<S: RecordSink> Ingest<S> {
    fn run(mut self, mut process: SamplerProcess) {
        loop {
            self.status.generation += 1;
            self.sink.on_generation(self.status.generation);
            self.set_state(SamplerState::Running);

            let samples = self.drain(&mut process);
            let exit = process.wait();
            self.shared.pid.store(0, Ordering::SeqCst);

            let success = match exit {
                Ok(status) => {
                    self.status.last_exit_code = status.code();
                    log::info!(
                        "Sampler generation {} exited ({}) after {} samples",
                        self.status.generation,
                        status,
                        samples
                    );
                    status.success()
                }
                Err(e) => {
                    log::warn!("Failed to reap sampler: {}", e);
                    self.status.last_exit_code = None;
                    false
                }
            };

            if self.shared.stopping.load(Ordering::SeqCst) {
                self.set_state(SamplerState::Stopped);
                return;
            }

            let delay = match self.policy.decide(ExitReport { success, samples }, Instant::now()) {
                RestartDecision::Immediate => {
                    self.status.planned_restarts += 1;
                    Duration::ZERO
                }
                RestartDecision::Backoff { delay, flapping } => {
                    self.status.failed_restarts += 1;
                    if flapping && !self.status.flapping {
                        log::warn!("Sampler is flapping ({} failed restarts)", self.status.failed_restarts);
                    }
                    self.status.flapping = flapping;
                    log::warn!("Sampler exited unexpectedly, restarting in {:?}", delay);
                    delay
                }
            };
            self.set_state(SamplerState::Restarting);

            if !delay.is_zero() {
                // woken early only by a stop request
                let _ = self.wake.recv_timeout(delay);
            }
            if self.shared.stopping.load(Ordering::SeqCst) {
                self.set_state(SamplerState::Stopped);
                return;
            }

            process = match self.command.spawn() {
                Ok(process) => process,
                Err(e) => {
                    log::error!("Sampler restart failed: {}", e);
                    self.set_state(SamplerState::Failed);
                    return;
                }
            };
            self.shared.pid.store(process.id(), Ordering::SeqCst);

            // a stop that raced the respawn saw no pid to signal
            if self.shared.stopping.load(Ordering::SeqCst) {
                let _ = process.kill();
                let _ = process.wait();
                self.shared.pid.store(0, Ordering::SeqCst);
                self.set_state(SamplerState::Stopped);
                return;
            }
        }
    }

    /// Read records until end of stream; the stream is closed on return
    fn drain(&mut self, process: &mut SamplerProcess) -> u64 {
        let Some(stream) = process.take_stream() else {
            return 0;
        };

        let mut samples = 0;
        for record in RecordReader::new(stream) {
            match record {
                Ok(record) => {
                    if self.shared.stopping.load(Ordering::SeqCst) {
                        log::debug!("Dropping record read after stop");
                        continue;
                    }
                    samples += 1;
                    self.sink.on_record(record);
                    if self.status.flapping && !self.policy.is_flapping(Instant::now()) {
                        log::info!("Sampler recovered from flapping");
                        self.status.flapping = false;
                        self.sink.on_status(self.status);
                    }
                }
                Err(e) => {
                    log::warn!("Sampler stream read failed: {}", e);
                    break;
                }
            }
        }
        samples
    }

    fn set_state(&mut self, state: SamplerState) {
        self.status.state = state;
        self.sink.on_status(self.status);
    }
}

fn control_loop(
    commands: Receiver<Control>,
    shared: Arc<Shared>,
    wake: Sender<()>,
    done: Receiver<()>,
    stop_timeout: Duration,
) {
    while let Ok(command) = commands.recv() {
        match command {
            Control::SampleNow => deliver(&shared, ProcessSignal::SampleNow),
            Control::Flush => deliver(&shared, ProcessSignal::Flush),
            Control::Stop(ack) => {
                let ended = terminate(&shared, &wake, &done, stop_timeout);
                let _ = ack.send(ended);
                return;
            }
        }
    }
    terminate(&shared, &wake, &done, stop_timeout);
}

fn deliver(shared: &Shared, signal: ProcessSignal) {
    let pid = shared.pid.load(Ordering::SeqCst);
    if pid == 0 {
        log::debug!("No sampler running, dropping {:?}", signal);
        return;
    }
    if let Err(e) = send_signal(pid, signal) {
        log::warn!("Failed to deliver {:?} to sampler {}: {}", signal, pid, e);
    }
}

/// Stop the sampler; returns whether the ingest thread ended
fn terminate(shared: &Shared, wake: &Sender<()>, done: &Receiver<()>, grace: Duration) -> bool {
    shared.stopping.store(true, Ordering::SeqCst);
    let _ = wake.send(());
    deliver(shared, ProcessSignal::Terminate);

    if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(grace) {
        log::warn!("Sampler did not exit within {:?}, killing it", grace);
        deliver(shared, ProcessSignal::Kill);
        if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(grace) {
            log::error!("Sampler stream still open {:?} after kill, abandoning it", grace);
            return false;
        }
    }
    true
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ProcessSignal) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let whole_group = matches!(signal, ProcessSignal::Terminate | ProcessSignal::Kill);
    let signal = match signal {
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        ProcessSignal::SampleNow => Signal::SIGINFO,
        #[cfg(not(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd",
            target_os = "openbsd"
        )))]
        ProcessSignal::SampleNow => {
            return Err(Error::Unsupported("SIGINFO on this platform".into()))
        }
        ProcessSignal::Flush => Signal::SIGIO,
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    let pid = i32::try_from(pid).map_err(|_| Error::Supervisor(format!("pid {} out of range", pid)))?;
    // control requests go to the sampler; stop signals to its whole process group
    if whole_group {
        killpg(Pid::from_raw(pid), signal)?;
    } else {
        kill(Pid::from_raw(pid), signal)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: ProcessSignal) -> Result<()> {
    Err(Error::Unsupported(format!("{:?} requires Unix signals", signal)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        records: Vec<Vec<u8>>,
        statuses: Vec<SamplerStatus>,
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Recorded>>);

    impl RecordSink for Collect {
        fn on_record(&mut self, record: RawRecord) {
            self.0.lock().unwrap().records.push(record.as_bytes().to_vec());
        }

        fn on_status(&mut self, status: SamplerStatus) {
            self.0.lock().unwrap().statuses.push(status);
        }
    }

    impl Collect {
        fn wait_for(&self, what: impl Fn(&Recorded) -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if what(&self.0.lock().unwrap()) {
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            false
        }

        fn last_status(&self) -> SamplerStatus {
            *self.0.lock().unwrap().statuses.last().unwrap()
        }
    }

    fn sh(script: &str) -> SamplerCommand {
        SamplerCommand::custom("sh", ["-c", script])
    }

    fn sampler(max_sample_count: u64) -> SamplerConfig {
        SamplerConfig {
            max_sample_count,
            stop_timeout_ms: 300,
            require_root: false,
            ..SamplerConfig::default()
        }
    }

    fn restart() -> RestartConfig {
        RestartConfig {
            backoff_initial_ms: 10,
            backoff_max_ms: 40,
            flap_threshold: 3,
            flap_window_secs: 60,
        }
    }

    #[test]
    fn test_planned_restart_after_max_samples() {
        let sink = Collect::default();
        let handle = Supervisor::start(
            sh("printf 'r1\\0r2\\0'"),
            &sampler(2),
            &restart(),
            sink.clone(),
        )
        .unwrap();

        assert!(sink.wait_for(|r| r.records.len() >= 6));
        handle.stop().unwrap();

        let recorded = sink.0.lock().unwrap();
        // each generation was restarted exactly once, without backoff
        for status in recorded.statuses.iter().filter(|s| s.state == SamplerState::Running) {
            assert_eq!(status.planned_restarts, status.generation - 1);
            assert_eq!(status.failed_restarts, 0);
        }
        // records stay in stream order across restarts
        for pair in recorded.records.chunks_exact(2) {
            assert_eq!(pair[0], b"r1");
            assert_eq!(pair[1], b"r2");
        }
        assert_eq!(recorded.statuses.last().unwrap().state, SamplerState::Stopped);
    }

    #[test]
    fn test_unexpected_exit_backs_off_and_flaps() {
        let sink = Collect::default();
        let handle = Supervisor::start(
            sh("printf 'x\\0'; exit 3"),
            &sampler(0),
            &restart(),
            sink.clone(),
        )
        .unwrap();

        assert!(sink.wait_for(|r| r.statuses.iter().any(|s| s.flapping)));
        handle.stop().unwrap();

        let recorded = sink.0.lock().unwrap();
        let flapping = recorded.statuses.iter().find(|s| s.flapping).unwrap();
        assert!(flapping.failed_restarts >= 3);
        assert_eq!(flapping.planned_restarts, 0);
        assert_eq!(flapping.last_exit_code, Some(3));
    }

    #[test]
    fn test_stop_closes_stream_of_long_running_sampler() {
        let sink = Collect::default();
        let handle = Supervisor::start(
            sh("printf 'a\\0'; exec sleep 30"),
            &sampler(0),
            &restart(),
            sink.clone(),
        )
        .unwrap();

        assert!(sink.wait_for(|r| r.records.len() == 1));
        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let status = sink.last_status();
        assert_eq!(status.state, SamplerState::Stopped);
        assert_eq!(status.generation, 1);
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        let sink = Collect::default();
        let handle = Supervisor::start(
            sh("trap '' TERM; printf 'a\\0'; while :; do sleep 1; done"),
            &sampler(0),
            &restart(),
            sink.clone(),
        )
        .unwrap();

        assert!(sink.wait_for(|r| r.records.len() == 1));
        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(sink.last_status().state, SamplerState::Stopped);
    }

    #[test]
    fn test_stop_reaches_grandchild_holding_stream() {
        // the shell forks sleep instead of exec'ing it, so sleep inherits stdout
        let sink = Collect::default();
        let handle = Supervisor::start(
            sh("printf 'a\\0'; sleep 8; :"),
            &sampler(0),
            &restart(),
            sink.clone(),
        )
        .unwrap();

        assert!(sink.wait_for(|r| r.records.len() == 1));
        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(sink.last_status().state, SamplerState::Stopped);
    }

    #[test]
    fn test_flush_signal_reaches_sampler() {
        let sink = Collect::default();
        let handle = Supervisor::start(
            sh("trap 'printf \"flushed\\0\"' IO; printf 'ready\\0'; while :; do sleep 0.05; done"),
            &sampler(0),
            &restart(),
            sink.clone(),
        )
        .unwrap();

        assert!(sink.wait_for(|r| r.records.len() == 1));
        handle.flush().unwrap();
        assert!(sink.wait_for(|r| r.records.iter().any(|rec| rec == b"flushed")));
        handle.stop().unwrap();
    }

    #[test]
    fn test_missing_sampler_is_fatal() {
        let err = Supervisor::start(
            SamplerCommand::custom("/nonexistent/powermetrics", Vec::<String>::new()),
            &sampler(0),
            &restart(),
            Collect::default(),
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }
}
