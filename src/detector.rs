//! Run detection state machine.
//!
//! The external computation gives no completion signal, so start and end are
//! inferred from snapshots with deliberately different evidence:
//!
//! - **Start** (`Waiting → Running`): a newly established connection on the watched
//!   port, a matching process that was absent from the baseline, or a matching
//!   process spiking above the high CPU threshold, checked in that order.
//! - **End** (`Running → Idle`): every matching process is gone, or the hottest
//!   matching process stays below the low CPU threshold for the confirmation window.
//!
//! The established connection only lives for the initial handshake, which is why it
//! can start a run but never end one.

use crate::config::DetectorConfig;
use crate::observer::{RunEvent, RunObserver};
use crate::signal_source::Snapshot;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Waiting,
    Running,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Waiting => "waiting",
            Phase::Running => "running",
        })
    }
}

/// How a transition was decided. Recorded for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Established,
    NewProcessPid,
    CpuSpike,
    ProcessExit,
    LowCpuConfirmed,
    FallbackArtifact,
    Timeout,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DetectionMethod::Established => "established",
            DetectionMethod::NewProcessPid => "new_process_pid",
            DetectionMethod::CpuSpike => "cpu_spike",
            DetectionMethod::ProcessExit => "process_exit",
            DetectionMethod::LowCpuConfirmed => "low_cpu_confirmed",
            DetectionMethod::FallbackArtifact => "fallback_artifact",
            DetectionMethod::Timeout => "timeout",
        })
    }
}

/// Thresholds and identity of what is being watched.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub port: u16,
    pub process_pattern: String,
    /// A sample strictly above this starts a run.
    pub high_cpu_percent: f32,
    /// A sample strictly below this counts toward completion.
    pub low_cpu_percent: f32,
    pub low_cpu_confirm: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        DetectorSettings::from(&DetectorConfig::default())
    }
}

impl From<&DetectorConfig> for DetectorSettings {
    fn from(c: &DetectorConfig) -> Self {
        Self {
            port: c.port,
            process_pattern: c.process_pattern.clone(),
            high_cpu_percent: c.high_cpu_percent,
            low_cpu_percent: c.low_cpu_percent,
            low_cpu_confirm: c.low_cpu_confirm(),
            heartbeat_interval: c.heartbeat_interval(),
        }
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    pub finished: bool,
    pub phase: Phase,
    pub method: Option<DetectionMethod>,
}

/// Identity of an established connection, used to tell fresh ones from the baseline.
type ConnKey = (Option<u32>, Option<SocketAddr>);

pub struct RunDetector {
    settings: DetectorSettings,
    observer: Arc<dyn RunObserver>,

    phase: Phase,
    finished: bool,
    method: Option<DetectionMethod>,
    started_at: Option<Instant>,
    run_start_time: Option<Instant>,
    detected_pid: Option<u32>,
    low_cpu_since: Option<Instant>,
    connection_seen: bool,
    duration: Option<Duration>,
    last_heartbeat: Option<Instant>,

    baseline_pids: HashSet<u32>,
    baseline_established: HashSet<ConnKey>,
}

impl RunDetector {
    pub fn new(settings: DetectorSettings, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            settings,
            observer,
            phase: Phase::Idle,
            finished: false,
            method: None,
            started_at: None,
            run_start_time: None,
            detected_pid: None,
            low_cpu_since: None,
            connection_seen: false,
            duration: None,
            last_heartbeat: None,
            baseline_pids: HashSet::new(),
            baseline_established: HashSet::new(),
        }
    }

    /// Return to `Idle` with every field cleared. Idempotent.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.finished = false;
        self.method = None;
        self.started_at = None;
        self.run_start_time = None;
        self.detected_pid = None;
        self.low_cpu_since = None;
        self.connection_seen = false;
        self.duration = None;
        self.last_heartbeat = None;
        self.baseline_pids.clear();
        self.baseline_established.clear();
    }

    /// Begin waiting for a run, remembering what already existed in `baseline`.
    pub fn start(&mut self, baseline: &Snapshot) {
        self.start_at(baseline, Instant::now());
    }

    pub fn start_at(&mut self, baseline: &Snapshot, now: Instant) {
        if self.phase != Phase::Idle {
            tracing::debug!(phase = %self.phase, "monitor restarted while active, resetting");
        }
        self.reset();
        self.baseline_pids = baseline.processes.pids().collect();
        self.baseline_established = baseline.ports.established().map(conn_key).collect();
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.phase = Phase::Waiting;

        self.observer.on_event(&RunEvent::Started {
            port: self.settings.port,
            pattern: self.settings.process_pattern.clone(),
            baseline_processes: self.baseline_pids.len(),
            baseline_established: self.baseline_established.len(),
        });
    }

    pub fn poll(&mut self, snapshot: &Snapshot) -> PollResult {
        self.poll_at(snapshot, Instant::now())
    }

    /// Evaluate one snapshot taken at `now`.
    pub fn poll_at(&mut self, snapshot: &Snapshot, now: Instant) -> PollResult {
        match self.phase {
            Phase::Idle => {}
            Phase::Waiting => self.detect_start(snapshot, now),
            Phase::Running => self.detect_end(snapshot, now),
        }
        if self.phase != Phase::Idle {
            self.heartbeat(snapshot, now);
        }
        self.result()
    }

    fn detect_start(&mut self, snapshot: &Snapshot, now: Instant) {
        let fresh_connection = snapshot
            .ports
            .established()
            .find(|c| !self.baseline_established.contains(&conn_key(c)));
        if let Some(conn) = fresh_connection {
            self.connection_seen = true;
            self.enter_running(DetectionMethod::Established, conn.pid, now);
            return;
        }

        let new_pid = snapshot
            .processes
            .pids()
            .find(|pid| !self.baseline_pids.contains(pid));
        if let Some(pid) = new_pid {
            self.enter_running(DetectionMethod::NewProcessPid, Some(pid), now);
            return;
        }

        let spiking = snapshot
            .processes
            .processes
            .iter()
            .find(|p| p.cpu_percent > self.settings.high_cpu_percent);
        if let Some(p) = spiking {
            self.enter_running(DetectionMethod::CpuSpike, Some(p.pid), now);
        }
    }

    fn enter_running(&mut self, method: DetectionMethod, pid: Option<u32>, now: Instant) {
        self.phase = Phase::Running;
        self.method = Some(method);
        self.run_start_time = Some(now);
        if pid.is_some() {
            self.detected_pid = pid;
        }
        self.observer
            .on_event(&RunEvent::RunDetected { method, pid });
    }

    fn detect_end(&mut self, snapshot: &Snapshot, now: Instant) {
        let Some(max_cpu) = snapshot.processes.max_cpu() else {
            // No matching process left: the worker exited.
            self.finish(DetectionMethod::ProcessExit, now);
            return;
        };

        if max_cpu >= self.settings.low_cpu_percent {
            if self.low_cpu_since.take().is_some() {
                self.observer.on_event(&RunEvent::LowCpuReset { max_cpu });
            }
            return;
        }

        match self.low_cpu_since {
            None => {
                self.low_cpu_since = Some(now);
                self.observer.on_event(&RunEvent::LowCpu { max_cpu });
            }
            Some(since) => {
                if now.saturating_duration_since(since) >= self.settings.low_cpu_confirm {
                    self.finish(DetectionMethod::LowCpuConfirmed, now);
                }
            }
        }
    }

    fn finish(&mut self, method: DetectionMethod, now: Instant) {
        self.duration = self
            .run_start_time
            .map(|start| now.saturating_duration_since(start));
        self.finished = true;
        self.method = Some(method);
        self.phase = Phase::Idle;
        self.low_cpu_since = None;
        self.observer.on_event(&RunEvent::Finished {
            method,
            duration: self.duration,
        });
    }

    fn heartbeat(&mut self, snapshot: &Snapshot, now: Instant) {
        let due = match self.last_heartbeat {
            Some(last) => now.saturating_duration_since(last) >= self.settings.heartbeat_interval,
            None => true,
        };
        if !due {
            return;
        }
        self.last_heartbeat = Some(now);
        let origin = match self.phase {
            Phase::Running => self.run_start_time,
            _ => self.started_at,
        };
        self.observer.on_event(&RunEvent::Heartbeat {
            phase: self.phase,
            elapsed: origin.map_or(Duration::ZERO, |t| now.saturating_duration_since(t)),
            processes: snapshot.processes.len(),
            max_cpu: snapshot.processes.max_cpu(),
        });
    }

    /// Mark the run finished on evidence from outside the state machine.
    pub fn confirm_external(&mut self, method: DetectionMethod) {
        self.finish(method, Instant::now());
    }

    /// Record that the wait gave up. `finished` stays false.
    ///
    /// The run start time is only kept after a completion, so it is cleared
    /// here. The detected pid is kept for the report.
    pub fn expire(&mut self) {
        self.phase = Phase::Idle;
        self.method = Some(DetectionMethod::Timeout);
        self.run_start_time = None;
        self.low_cpu_since = None;
    }

    fn result(&self) -> PollResult {
        PollResult {
            finished: self.finished,
            phase: self.phase,
            method: self.method,
        }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn detection_method(&self) -> Option<DetectionMethod> {
        self.method
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn detected_pid(&self) -> Option<u32> {
        self.detected_pid
    }

    pub fn run_start_time(&self) -> Option<Instant> {
        self.run_start_time
    }

    pub fn low_cpu_since(&self) -> Option<Instant> {
        self.low_cpu_since
    }

    pub fn connection_seen(&self) -> bool {
        self.connection_seen
    }

    /// When `start()` was called; the wait timeout counts from here.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }
}

fn conn_key(c: &crate::signal_source::Connection) -> ConnKey {
    (c.pid, c.remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::signal_source::{
        Connection, PortSnapshot, ProcessSample, ProcessSnapshot,
    };
    use crate::sockets::TcpState;

    fn settings() -> DetectorSettings {
        DetectorSettings {
            port: 3000,
            process_pattern: "worker".to_string(),
            high_cpu_percent: 20.0,
            low_cpu_percent: 5.0,
            low_cpu_confirm: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    fn detector() -> (RunDetector, Arc<RecordingObserver>) {
        let rec = Arc::new(RecordingObserver::default());
        (RunDetector::new(settings(), rec.clone()), rec)
    }

    fn procs(list: &[(u32, f32)]) -> ProcessSnapshot {
        ProcessSnapshot::new(
            list.iter()
                .map(|&(pid, cpu)| ProcessSample {
                    pid,
                    name: "worker-A".to_string(),
                    cpu_percent: cpu,
                })
                .collect(),
        )
    }

    fn snap(list: &[(u32, f32)]) -> Snapshot {
        Snapshot {
            ports: PortSnapshot::default(),
            processes: procs(list),
        }
    }

    fn established(pid: Option<u32>, remote_port: u16) -> Connection {
        Connection {
            status: TcpState::Established,
            pid,
            local: "127.0.0.1:3000".parse().unwrap(),
            remote: Some(SocketAddr::from(([127, 0, 0, 1], remote_port))),
        }
    }

    fn secs(t0: Instant, s: f64) -> Instant {
        t0 + Duration::from_secs_f64(s)
    }

    /// Start with an empty baseline and drive into Running via a new pid.
    fn running(t0: Instant) -> (RunDetector, Arc<RecordingObserver>) {
        let (mut d, rec) = detector();
        d.start_at(&Snapshot::default(), t0);
        let r = d.poll_at(&snap(&[(500, 45.0)]), t0);
        assert_eq!(r.phase, Phase::Running);
        (d, rec)
    }

    #[test]
    fn test_new_detector_is_idle() {
        let (d, _) = detector();
        assert_eq!(d.phase(), Phase::Idle);
        assert!(!d.finished());
        assert_eq!(d.detection_method(), None);
    }

    #[test]
    fn test_idle_poll_is_inert() {
        let (mut d, rec) = detector();
        let r = d.poll(&snap(&[(1, 90.0)]));
        assert_eq!(r.phase, Phase::Idle);
        assert!(!r.finished);
        assert!(rec.events().is_empty());
    }

    #[test]
    fn test_never_finished_while_waiting() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&snap(&[(7, 1.0)]), t0);

        // Silence, a lone baseline process at low CPU, and a process vanishing
        // must all leave the detector waiting and unfinished.
        let sequence = [snap(&[]), snap(&[(7, 1.0)]), snap(&[(7, 20.0)]), snap(&[])];
        for (i, s) in sequence.iter().enumerate() {
            let r = d.poll_at(s, secs(t0, i as f64 + 1.0));
            assert_eq!(r.phase, Phase::Waiting);
            assert!(!r.finished);
        }
    }

    #[test]
    fn test_duration_is_non_negative() {
        let t0 = Instant::now();
        let (mut d, _) = running(t0);
        let r = d.poll_at(&snap(&[]), t0);
        assert!(r.finished);
        assert_eq!(d.duration(), Some(Duration::ZERO));
    }

    #[test]
    fn test_hysteresis_resets_on_active_sample() {
        let t0 = Instant::now();
        let (mut d, rec) = running(t0);

        // 1 poll per second: [10, 2, 2, 8, 2, ...]
        assert!(!d.poll_at(&snap(&[(500, 10.0)]), secs(t0, 1.0)).finished);
        assert!(d.low_cpu_since().is_none());

        assert!(!d.poll_at(&snap(&[(500, 2.0)]), secs(t0, 2.0)).finished);
        assert_eq!(d.low_cpu_since(), Some(secs(t0, 2.0)));
        assert!(!d.poll_at(&snap(&[(500, 2.0)]), secs(t0, 3.0)).finished);

        assert!(!d.poll_at(&snap(&[(500, 8.0)]), secs(t0, 4.0)).finished);
        assert!(d.low_cpu_since().is_none());

        // The quiet period starts over from the next low sample.
        assert!(!d.poll_at(&snap(&[(500, 2.0)]), secs(t0, 5.0)).finished);
        assert_eq!(d.low_cpu_since(), Some(secs(t0, 5.0)));
        assert!(!d.poll_at(&snap(&[(500, 2.0)]), secs(t0, 6.0)).finished);
        let r = d.poll_at(&snap(&[(500, 2.0)]), secs(t0, 7.0));
        assert!(r.finished);
        assert_eq!(r.method, Some(DetectionMethod::LowCpuConfirmed));
        assert_eq!(d.duration(), Some(Duration::from_secs(7)));

        assert!(rec
            .events()
            .contains(&RunEvent::LowCpuReset { max_cpu: 8.0 }));
    }

    #[test]
    fn test_exit_confirms_immediately() {
        let t0 = Instant::now();
        let (mut d, _) = running(t0);
        // Mid quiet period, but the process is simply gone.
        d.poll_at(&snap(&[(500, 1.0)]), secs(t0, 3.0));
        let r = d.poll_at(&snap(&[]), secs(t0, 3.5));
        assert!(r.finished);
        assert_eq!(r.phase, Phase::Idle);
        assert_eq!(r.method, Some(DetectionMethod::ProcessExit));
        assert_eq!(d.duration(), Some(Duration::from_millis(3500)));
    }

    #[test]
    fn test_reset_twice_equals_direct_start() {
        let t0 = Instant::now();
        let (mut a, _) = running(t0);
        a.poll_at(&snap(&[(500, 1.0)]), secs(t0, 1.0));
        a.reset();
        a.reset();
        a.start_at(&Snapshot::default(), secs(t0, 5.0));

        let (mut b, _) = running(t0);
        b.poll_at(&snap(&[(500, 1.0)]), secs(t0, 1.0));
        b.start_at(&Snapshot::default(), secs(t0, 5.0));

        for d in [&a, &b] {
            assert_eq!(d.phase(), Phase::Waiting);
            assert!(!d.finished());
            assert_eq!(d.detection_method(), None);
            assert_eq!(d.run_start_time(), None);
            assert_eq!(d.detected_pid(), None);
            assert_eq!(d.low_cpu_since(), None);
            assert!(!d.connection_seen());
            assert_eq!(d.duration(), None);
            assert_eq!(d.started_at(), Some(secs(t0, 5.0)));
        }
    }

    #[test]
    fn test_reset_is_idempotent_from_idle() {
        let (mut d, _) = detector();
        d.reset();
        d.reset();
        assert_eq!(d.phase(), Phase::Idle);
        assert_eq!(d.started_at(), None);
    }

    #[test]
    fn test_scenario_new_process_then_low_cpu() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&Snapshot::default(), t0);

        let r = d.poll_at(&snap(&[(500, 45.0)]), t0);
        assert_eq!(r.phase, Phase::Running);
        assert_eq!(r.method, Some(DetectionMethod::NewProcessPid));
        assert_eq!(d.detected_pid(), Some(500));

        // Busy for ten seconds at two polls per second.
        let mut t = 0.5;
        while t < 10.0 {
            assert!(!d.poll_at(&snap(&[(500, 45.0)]), secs(t0, t)).finished);
            t += 0.5;
        }
        // Quiet at 1% for 2.5 s.
        let mut finished_at = None;
        while t <= 12.5 {
            if d.poll_at(&snap(&[(500, 1.0)]), secs(t0, t)).finished {
                finished_at = Some(t);
                break;
            }
            t += 0.5;
        }

        assert_eq!(finished_at, Some(12.0));
        assert_eq!(d.detection_method(), Some(DetectionMethod::LowCpuConfirmed));
        let secs = d.duration().unwrap().as_secs_f64();
        assert!((10.0..=12.5).contains(&secs), "duration {secs}");
        assert_eq!(d.phase(), Phase::Idle);
        // Retained for reporting
        assert_eq!(d.detected_pid(), Some(500));
        assert!(d.run_start_time().is_some());
    }

    #[test]
    fn test_scenario_warm_process_established_then_exit() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&snap(&[(500, 3.0)]), t0);

        // The warm process alone does not start a run.
        assert_eq!(d.poll_at(&snap(&[(500, 3.0)]), t0).phase, Phase::Waiting);

        let mut s = snap(&[(500, 3.0)]);
        s.ports = PortSnapshot::from_connections(vec![established(Some(500), 50001)]);
        let r = d.poll_at(&s, secs(t0, 0.5));
        assert_eq!(r.method, Some(DetectionMethod::Established));
        assert_eq!(d.detected_pid(), Some(500));
        assert!(d.connection_seen());

        // The connection closes after the handshake; the worker keeps running.
        for i in 1..10 {
            let r = d.poll_at(&snap(&[(500, 60.0)]), secs(t0, 0.5 + i as f64 * 0.5));
            assert!(!r.finished);
        }

        let r = d.poll_at(&snap(&[]), secs(t0, 5.5));
        assert!(r.finished);
        assert_eq!(r.method, Some(DetectionMethod::ProcessExit));
        let secs = d.duration().unwrap().as_secs_f64();
        assert!((4.5..=5.5).contains(&secs), "duration {secs}");
    }

    #[test]
    fn test_baseline_connection_does_not_start_run() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        let mut baseline = Snapshot::default();
        baseline.ports = PortSnapshot::from_connections(vec![established(Some(42), 40000)]);
        d.start_at(&baseline, t0);

        assert_eq!(d.poll_at(&baseline, secs(t0, 1.0)).phase, Phase::Waiting);

        let mut fresh = baseline.clone();
        fresh.ports = PortSnapshot::from_connections(vec![
            established(Some(42), 40000),
            established(Some(42), 40001),
        ]);
        assert_eq!(
            d.poll_at(&fresh, secs(t0, 2.0)).method,
            Some(DetectionMethod::Established)
        );
    }

    #[test]
    fn test_established_without_pid_keeps_detected_pid_empty() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&Snapshot::default(), t0);
        let mut s = Snapshot::default();
        s.ports = PortSnapshot::from_connections(vec![established(None, 45000)]);
        d.poll_at(&s, t0);
        assert_eq!(d.phase(), Phase::Running);
        assert_eq!(d.detected_pid(), None);
    }

    #[test]
    fn test_established_wins_over_new_pid() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&Snapshot::default(), t0);
        let mut s = snap(&[(600, 80.0)]);
        s.ports = PortSnapshot::from_connections(vec![established(Some(500), 50001)]);
        let r = d.poll_at(&s, t0);
        assert_eq!(r.method, Some(DetectionMethod::Established));
        assert_eq!(d.detected_pid(), Some(500));
    }

    #[test]
    fn test_new_pid_wins_over_cpu_spike() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&snap(&[(100, 1.0)]), t0);
        let r = d.poll_at(&snap(&[(100, 90.0), (200, 0.0)]), t0);
        assert_eq!(r.method, Some(DetectionMethod::NewProcessPid));
        assert_eq!(d.detected_pid(), Some(200));
    }

    #[test]
    fn test_cpu_spike_on_warm_process() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&snap(&[(100, 1.0)]), t0);
        let r = d.poll_at(&snap(&[(100, 35.0)]), secs(t0, 1.0));
        assert_eq!(r.method, Some(DetectionMethod::CpuSpike));
        assert_eq!(d.detected_pid(), Some(100));
        assert_eq!(d.run_start_time(), Some(secs(t0, 1.0)));
    }

    #[test]
    fn test_cpu_exactly_at_high_threshold_does_not_spike() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&snap(&[(100, 1.0)]), t0);
        assert_eq!(d.poll_at(&snap(&[(100, 20.0)]), t0).phase, Phase::Waiting);
        assert_eq!(
            d.poll_at(&snap(&[(100, 20.01)]), t0).phase,
            Phase::Running
        );
    }

    #[test]
    fn test_cpu_exactly_at_low_threshold_is_still_active() {
        let t0 = Instant::now();
        let (mut d, _) = running(t0);
        for i in 1..=10 {
            let r = d.poll_at(&snap(&[(500, 5.0)]), secs(t0, i as f64));
            assert!(!r.finished);
            assert!(d.low_cpu_since().is_none());
        }
        d.poll_at(&snap(&[(500, 4.99)]), secs(t0, 11.0));
        assert_eq!(d.low_cpu_since(), Some(secs(t0, 11.0)));
    }

    #[test]
    fn test_max_cpu_across_processes_drives_completion() {
        let t0 = Instant::now();
        let (mut d, _) = running(t0);
        // One worker idle, another still busy.
        d.poll_at(&snap(&[(500, 0.0), (501, 30.0)]), secs(t0, 1.0));
        d.poll_at(&snap(&[(500, 0.0), (501, 30.0)]), secs(t0, 4.0));
        assert!(d.low_cpu_since().is_none());
        assert!(!d.finished());
    }

    #[test]
    fn test_start_and_end_never_in_same_poll() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&snap(&[(500, 0.0)]), t0);
        let mut s = snap(&[]);
        s.ports = PortSnapshot::from_connections(vec![established(Some(500), 50001)]);
        // Start fires, and the empty process list must wait for the next poll.
        let r = d.poll_at(&s, t0);
        assert_eq!(r.phase, Phase::Running);
        assert!(!r.finished);
        assert!(d.poll_at(&snap(&[]), secs(t0, 0.5)).finished);
    }

    #[test]
    fn test_heartbeat_does_not_touch_hysteresis() {
        let t0 = Instant::now();
        let (mut d, rec) = detector();
        d.start_at(&Snapshot::default(), t0);
        for i in 1..=25 {
            d.poll_at(&Snapshot::default(), secs(t0, i as f64));
        }
        let beats = rec
            .events()
            .iter()
            .filter(|e| matches!(e, RunEvent::Heartbeat { .. }))
            .count();
        assert_eq!(beats, 2);
        assert_eq!(d.phase(), Phase::Waiting);
        assert!(d.low_cpu_since().is_none());
        assert!(d.run_start_time().is_none());
    }

    #[test]
    fn test_confirm_external_from_waiting() {
        let t0 = Instant::now();
        let (mut d, _) = detector();
        d.start_at(&Snapshot::default(), t0);
        d.confirm_external(DetectionMethod::FallbackArtifact);
        assert!(d.finished());
        assert_eq!(d.phase(), Phase::Idle);
        assert_eq!(d.detection_method(), Some(DetectionMethod::FallbackArtifact));
        assert_eq!(d.duration(), None);
    }

    #[test]
    fn test_expire_records_timeout_without_finishing() {
        let t0 = Instant::now();
        let (mut d, _) = running(t0);
        assert!(d.run_start_time().is_some());
        d.expire();
        assert!(!d.finished());
        assert_eq!(d.phase(), Phase::Idle);
        assert_eq!(d.detection_method(), Some(DetectionMethod::Timeout));
        assert_eq!(d.run_start_time(), None);
        assert_eq!(d.duration(), None);
        // Inert afterwards
        assert!(!d.poll_at(&snap(&[]), secs(t0, 1.0)).finished);
    }

    #[test]
    fn test_method_display_names() {
        assert_eq!(DetectionMethod::NewProcessPid.to_string(), "new_process_pid");
        assert_eq!(
            serde_json::to_string(&DetectionMethod::LowCpuConfirmed).unwrap(),
            "\"low_cpu_confirmed\""
        );
        assert_eq!(Phase::Running.to_string(), "running");
    }
}
