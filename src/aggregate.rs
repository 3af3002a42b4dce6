//! Rolling aggregation
//!
//! Time-bounded power averages per rail and a hysteresis-filtered throttle indicator.
//! Windows evict by each sample's own timestamp, not by count, since the sampling interval
//! can drift at runtime.

use crate::extract::{MetricSnapshot, Provenance};
use crate::parser::ThermalPressure;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Tracked power rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PowerRail {
    Package,
    Cpu,
    Gpu,
    Ane,
}

impl PowerRail {
    pub const ALL: [PowerRail; 4] = [
        PowerRail::Package,
        PowerRail::Cpu,
        PowerRail::Gpu,
        PowerRail::Ane,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// (timestamp, value) pairs no older than `window` relative to the newest entry
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    entries: VecDeque<(SystemTime, f64)>,
    latest: Option<SystemTime>,
    sum: f64,
}

impl RollingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
            latest: None,
            sum: 0.0,
        }
    }

    /// Append a value and evict everything `window` or more older than the newest entry
    pub fn push(&mut self, at: SystemTime, value: f64) {
        self.entries.push_back((at, value));
        self.sum += value;

        let latest = self.latest.map_or(at, |l| l.max(at));
        self.latest = Some(latest);
        while let Some(&(t, v)) = self.entries.front() {
            let expired = latest
                .duration_since(t)
                .map(|age| age >= self.window)
                .unwrap_or(false);
            if !expired {
                break;
            }
            self.entries.pop_front();
            self.sum -= v;
        }
        // re-sum occasionally to shed float drift from the running total
        if self.entries.is_empty() {
            self.sum = 0.0;
        } else if self.entries.len() % 1024 == 0 {
            self.sum = self.entries.iter().map(|(_, v)| v).sum();
        }
    }

    pub fn average(&self) -> Option<f64> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.sum / self.entries.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.latest = None;
        self.sum = 0.0;
    }
}

/// Windowed average per rail in milliwatts, `None` before any value arrived
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerAverages {
    pub package_mw: Option<f64>,
    pub cpu_mw: Option<f64>,
    pub gpu_mw: Option<f64>,
    pub ane_mw: Option<f64>,
}

/// Highest fresh reading per rail since start, in milliwatts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerPeaks {
    pub package_mw: f64,
    pub cpu_mw: f64,
    pub gpu_mw: f64,
    pub ane_mw: f64,
}

/// Debounced thermal throttle indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleState {
    pub throttled: bool,
    /// Pressure level while throttled, `Nominal` otherwise
    pub severity: ThermalPressure,
    /// When the current state was entered
    pub since: Option<SystemTime>,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            throttled: false,
            severity: ThermalPressure::Nominal,
            since: None,
        }
    }
}

/// Hysteresis over thermal pressure: a change must hold for `dwell` before it shows
///
/// Applies both to engaging/clearing the throttle and to severity changes while throttled.
#[derive(Debug, Clone)]
pub struct ThrottleTracker {
    dwell: Duration,
    state: ThrottleState,
    /// Start of a run of samples disagreeing with the throttled flag
    pending_since: Option<SystemTime>,
    /// Start of a run at a severity other than the shown one
    pending_severity: Option<(ThermalPressure, SystemTime)>,
}

impl ThrottleTracker {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            state: ThrottleState::default(),
            pending_since: None,
            pending_severity: None,
        }
    }

    pub fn observe(&mut self, at: SystemTime, pressure: ThermalPressure) -> ThrottleState {
        let elevated = !pressure.is_nominal();

        if elevated != self.state.throttled {
            self.pending_severity = None;
            let since = *self.pending_since.get_or_insert(at);
            if self.held(since, at) {
                self.state = ThrottleState {
                    throttled: elevated,
                    severity: pressure,
                    since: Some(at),
                };
                self.pending_since = None;
                log::info!(
                    "Thermal throttle {} ({})",
                    if elevated { "engaged" } else { "cleared" },
                    pressure
                );
            }
            return self.state;
        }

        self.pending_since = None;
        if !elevated || pressure == self.state.severity {
            self.pending_severity = None;
            return self.state;
        }

        let since = match self.pending_severity {
            Some((level, since)) if level == pressure => since,
            _ => at,
        };
        if self.held(since, at) {
            log::info!("Thermal pressure {} -> {}", self.state.severity, pressure);
            self.state.severity = pressure;
            self.pending_severity = None;
        } else {
            self.pending_severity = Some((pressure, since));
        }
        self.state
    }

    pub fn state(&self) -> ThrottleState {
        self.state
    }

    /// Forget partial runs, keeping the shown state
    pub fn reset_pending(&mut self) {
        self.pending_since = None;
        self.pending_severity = None;
    }

    fn held(&self, since: SystemTime, at: SystemTime) -> bool {
        at.duration_since(since).unwrap_or(Duration::ZERO) >= self.dwell
    }
}

/// What one `ingest` call reports back
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub snapshot: Arc<MetricSnapshot>,
    pub averages: PowerAverages,
    pub peaks: PowerPeaks,
    pub throttle: ThrottleState,
}

/// Owner of the current snapshot and every rolling window
pub struct Aggregator {
    rails: [RollingWindow; 4],
    peaks: PowerPeaks,
    throttle: ThrottleTracker,
    current: Option<Arc<MetricSnapshot>>,
}

impl Aggregator {
    pub fn new(window: Duration, dwell: Duration) -> Self {
        Self {
            rails: std::array::from_fn(|_| RollingWindow::new(window)),
            peaks: PowerPeaks::default(),
            throttle: ThrottleTracker::new(dwell),
            current: None,
        }
    }

    /// Fold one snapshot into the windows
    ///
    /// Fresh and carried-forward power values enter the windows; provisional defaults do
    /// not, so a rail that was never reported averages to `None` instead of zero.
    pub fn ingest(&mut self, snapshot: MetricSnapshot) -> Aggregate {
        let at = snapshot.timestamp;
        for rail in PowerRail::ALL {
            let field = rail_field(&snapshot, rail);
            if field.provenance != Provenance::Provisional {
                self.rails[rail.index()].push(at, field.value);
            }
            if field.is_fresh() {
                let peak = self.peak_mut(rail);
                *peak = peak.max(field.value);
            }
        }

        let throttle = self.throttle.observe(at, snapshot.thermal_pressure.value);
        let snapshot = Arc::new(snapshot);
        self.current = Some(Arc::clone(&snapshot));

        Aggregate {
            snapshot,
            averages: self.averages(),
            peaks: self.peaks,
            throttle,
        }
    }

    pub fn averages(&self) -> PowerAverages {
        PowerAverages {
            package_mw: self.average(PowerRail::Package),
            cpu_mw: self.average(PowerRail::Cpu),
            gpu_mw: self.average(PowerRail::Gpu),
            ane_mw: self.average(PowerRail::Ane),
        }
    }

    pub fn average(&self, rail: PowerRail) -> Option<f64> {
        self.rails[rail.index()].average()
    }

    pub fn current(&self) -> Option<&Arc<MetricSnapshot>> {
        self.current.as_ref()
    }

    /// Drop windowed history after the record clock jumped backwards
    ///
    /// Peaks and the shown throttle state survive; averages restart from the next snapshot.
    pub fn rebase(&mut self) {
        for rail in &mut self.rails {
            rail.clear();
        }
        self.throttle.reset_pending();
    }

    fn peak_mut(&mut self, rail: PowerRail) -> &mut f64 {
        match rail {
            PowerRail::Package => &mut self.peaks.package_mw,
            PowerRail::Cpu => &mut self.peaks.cpu_mw,
            PowerRail::Gpu => &mut self.peaks.gpu_mw,
            PowerRail::Ane => &mut self.peaks.ane_mw,
        }
    }
}

fn rail_field(snapshot: &MetricSnapshot, rail: PowerRail) -> crate::extract::Field<f64> {
    match rail {
        PowerRail::Package => snapshot.power.package_mw,
        PowerRail::Cpu => snapshot.power.cpu_mw,
        PowerRail::Gpu => snapshot.power.gpu_mw,
        PowerRail::Ane => snapshot.power.ane_mw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extractor;
    use crate::parser::{ParsedPower, ParsedSample};
    use crate::profile::HardwareProfile;
    use std::time::UNIX_EPOCH;

    fn t(secs: f64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_secs_f64(secs)
    }

    fn extractor() -> Extractor {
        Extractor::new(
            Arc::new(HardwareProfile::from_brand("Apple M2").unwrap()),
            false,
        )
    }

    fn power_sample(at: f64, package_mw: f64) -> ParsedSample {
        ParsedSample {
            timestamp: Some(t(at)),
            power: ParsedPower {
                package_mw: Some(package_mw),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pressure_sample(at: f64, pressure: ThermalPressure) -> ParsedSample {
        ParsedSample {
            timestamp: Some(t(at)),
            thermal_pressure: Some(pressure),
            ..Default::default()
        }
    }

    #[test]
    fn test_window_scenario() {
        // 10, 20, 30 mW at t=0,1,2 with a 2 s window
        let mut extractor = extractor();
        let mut aggregator = Aggregator::new(Duration::from_secs(2), Duration::from_secs(3));
        let mut last = None;
        for (at, mw) in [(0.0, 10.0), (1.0, 20.0), (2.0, 30.0)] {
            last = Some(aggregator.ingest(extractor.extract(&power_sample(at, mw), t(at))));
        }
        assert_eq!(last.unwrap().averages.package_mw, Some(25.0));
    }

    #[test]
    fn test_window_mean_matches_values_within_window() {
        let window = Duration::from_secs(5);
        let mut w = RollingWindow::new(window);
        let points: Vec<(f64, f64)> = (0..40)
            .map(|i| (i as f64 * 0.37, (i * 7 % 13) as f64 * 100.0))
            .collect();
        for &(at, v) in &points {
            w.push(t(at), v);
        }

        let latest = points.last().unwrap().0;
        let inside: Vec<f64> = points
            .iter()
            .filter(|(at, _)| latest - at < window.as_secs_f64())
            .map(|(_, v)| *v)
            .collect();
        let expected = inside.iter().sum::<f64>() / inside.len() as f64;

        assert_eq!(w.len(), inside.len());
        assert!((w.average().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_window_irregular_interval() {
        let mut w = RollingWindow::new(Duration::from_secs(10));
        w.push(t(0.0), 100.0);
        w.push(t(0.5), 100.0);
        w.push(t(9.0), 400.0);
        assert_eq!(w.len(), 3);
        w.push(t(10.6), 400.0);
        // 0.0 and 0.5 are 10 s or more behind 10.6
        assert_eq!(w.len(), 2);
        assert_eq!(w.average(), Some(400.0));
    }

    #[test]
    fn test_provisional_power_not_averaged() {
        let mut extractor = extractor();
        let mut aggregator = Aggregator::new(Duration::from_secs(30), Duration::from_secs(3));
        let agg = aggregator.ingest(extractor.extract(&power_sample(0.0, 500.0), t(0.0)));

        assert_eq!(agg.averages.package_mw, Some(500.0));
        assert_eq!(agg.averages.gpu_mw, None);
        assert_eq!(agg.peaks.package_mw, 500.0);

        // carried-forward package value is averaged but does not move the peak
        let agg = aggregator.ingest(extractor.extract(&ParsedSample {
            timestamp: Some(t(1.0)),
            ..Default::default()
        }, t(1.0)));
        assert_eq!(agg.averages.package_mw, Some(500.0));
        assert_eq!(aggregator.average(PowerRail::Package), Some(500.0));
        assert!(aggregator.current().is_some());
    }

    #[test]
    fn test_sustained_pressure_throttles_once() {
        let mut tracker = ThrottleTracker::new(Duration::from_secs(2));
        let mut transitions = 0;
        let mut previous = false;
        let mut engaged_at = None;

        for i in 0..8 {
            let state = tracker.observe(t(i as f64), ThermalPressure::Heavy);
            if state.throttled && !previous {
                transitions += 1;
                engaged_at = Some(i);
            }
            previous = state.throttled;
        }

        assert_eq!(transitions, 1);
        assert_eq!(engaged_at, Some(2));
        assert_eq!(tracker.state().severity, ThermalPressure::Heavy);
    }

    #[test]
    fn test_single_spike_ignored() {
        let mut tracker = ThrottleTracker::new(Duration::from_secs(2));
        for (at, p) in [
            (0.0, ThermalPressure::Nominal),
            (1.0, ThermalPressure::Nominal),
            (2.0, ThermalPressure::Trapping),
            (3.0, ThermalPressure::Nominal),
            (4.0, ThermalPressure::Nominal),
            (5.0, ThermalPressure::Nominal),
        ] {
            assert!(!tracker.observe(t(at), p).throttled);
        }
    }

    #[test]
    fn test_throttle_clears_after_dwell() {
        let mut tracker = ThrottleTracker::new(Duration::from_secs(2));
        for i in 0..3 {
            tracker.observe(t(i as f64), ThermalPressure::Moderate);
        }
        assert!(tracker.state().throttled);

        // one nominal dip does not clear it, one heavy sample does not escalate it
        assert!(tracker.observe(t(3.0), ThermalPressure::Nominal).throttled);
        assert!(tracker.observe(t(4.0), ThermalPressure::Heavy).throttled);
        assert_eq!(tracker.state().severity, ThermalPressure::Moderate);

        tracker.observe(t(5.0), ThermalPressure::Nominal);
        tracker.observe(t(6.0), ThermalPressure::Nominal);
        let state = tracker.observe(t(7.0), ThermalPressure::Nominal);
        assert!(!state.throttled);
        assert_eq!(state.severity, ThermalPressure::Nominal);
        assert_eq!(state.since, Some(t(7.0)));
    }

    #[test]
    fn test_severity_needs_dwell() {
        let mut tracker = ThrottleTracker::new(Duration::from_secs(2));
        for i in 0..3 {
            tracker.observe(t(i as f64), ThermalPressure::Moderate);
        }
        assert!(tracker.state().throttled);
        let engaged = tracker.state().since;

        for i in 3..13 {
            let pressure = if i % 2 == 1 {
                ThermalPressure::Heavy
            } else {
                ThermalPressure::Moderate
            };
            let state = tracker.observe(t(i as f64), pressure);
            assert!(state.throttled);
            assert_eq!(state.severity, ThermalPressure::Moderate);
        }

        assert_eq!(
            tracker.observe(t(13.0), ThermalPressure::Heavy).severity,
            ThermalPressure::Moderate
        );
        assert_eq!(
            tracker.observe(t(14.0), ThermalPressure::Heavy).severity,
            ThermalPressure::Moderate
        );
        let state = tracker.observe(t(15.0), ThermalPressure::Heavy);
        assert_eq!(state.severity, ThermalPressure::Heavy);
        // escalation is not a new throttle episode
        assert_eq!(state.since, engaged);
    }

    #[test]
    fn test_rebase_restarts_averages_after_clock_step() {
        let mut extractor = extractor();
        let mut aggregator = Aggregator::new(Duration::from_secs(30), Duration::from_secs(3));
        aggregator.ingest(extractor.extract(&power_sample(3600.0, 9000.0), t(3600.0)));
        aggregator.rebase();

        let agg = aggregator.ingest(extractor.extract(&power_sample(0.0, 100.0), t(0.0)));
        assert_eq!(agg.averages.package_mw, Some(100.0));
        assert_eq!(agg.peaks.package_mw, 9000.0);
        let agg = aggregator.ingest(extractor.extract(&power_sample(1.0, 300.0), t(1.0)));
        assert_eq!(agg.averages.package_mw, Some(200.0));
    }

    #[test]
    fn test_aggregator_feeds_throttle() {
        let mut extractor = extractor();
        let mut aggregator = Aggregator::new(Duration::from_secs(30), Duration::from_secs(1));
        aggregator.ingest(extractor.extract(&pressure_sample(0.0, ThermalPressure::Heavy), t(0.0)));
        let agg = aggregator.ingest(
            extractor.extract(&pressure_sample(1.0, ThermalPressure::Heavy), t(1.0)),
        );
        assert!(agg.throttle.throttled);
        assert_eq!(agg.snapshot.sequence, 2);
    }
}
