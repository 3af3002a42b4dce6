//! Presentation adapter
//!
//! The ingest thread builds a complete [`View`] and swaps it in atomically; readers get an
//! `Arc` to a frozen view that later publishes never touch. Neither side waits on the other.

use crate::aggregate::{Aggregate, PowerAverages, PowerPeaks, ThrottleState};
use crate::extract::MetricSnapshot;
use crate::memory::MemoryInfo;
use crate::profile::HardwareProfile;
use crate::sampler::SamplerStatus;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;

/// Pipeline health as shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Health {
    /// Sustained run of unparsable records
    pub degraded: bool,
    /// Sampler restart flapping
    pub flapping: bool,
    pub consecutive_unparsable: u32,
    pub unparsable_total: u64,
    /// Records dropped for carrying a timestamp no newer than the last accepted one
    pub skipped_stale: u64,
    /// Current run of stale records; a long run is taken as the clock stepping back
    pub consecutive_stale: u32,
}

impl Health {
    /// Whether the display should show the degraded indicator
    pub fn is_degraded(&self) -> bool {
        self.degraded || self.flapping
    }
}

/// Instantaneous power as a percentage of the profile's ceilings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerGauges {
    pub cpu_percent: f64,
    pub gpu_percent: f64,
    pub package_percent: f64,
}

impl PowerGauges {
    pub fn compute(snapshot: &MetricSnapshot, profile: &HardwareProfile) -> Self {
        Self {
            cpu_percent: percent_of(snapshot.power.cpu_mw.value, profile.cpu_max_power_w),
            gpu_percent: percent_of(snapshot.power.gpu_mw.value, profile.gpu_max_power_w),
            package_percent: percent_of(
                snapshot.power.package_mw.value,
                profile.package_max_power_w(),
            ),
        }
    }
}

fn percent_of(mw: f64, ceiling_w: f64) -> f64 {
    if ceiling_w <= 0.0 {
        return 0.0;
    }
    (mw / (ceiling_w * 1000.0) * 100.0).clamp(0.0, 100.0)
}

/// Everything the renderer may show, frozen at publish time
#[derive(Debug, Clone, Serialize)]
pub struct View {
    pub profile: Arc<HardwareProfile>,
    /// `None` until the first record has been processed
    pub snapshot: Option<Arc<MetricSnapshot>>,
    pub averages: PowerAverages,
    pub peaks: PowerPeaks,
    pub gauges: PowerGauges,
    pub throttle: ThrottleState,
    pub sampler: SamplerStatus,
    pub health: Health,
    /// `None` until the memory poller has reported, or where it is unsupported
    pub memory: Option<MemoryInfo>,
}

impl View {
    pub fn new(profile: Arc<HardwareProfile>) -> Self {
        Self {
            profile,
            snapshot: None,
            averages: PowerAverages::default(),
            peaks: PowerPeaks::default(),
            gauges: PowerGauges::default(),
            throttle: ThrottleState::default(),
            sampler: SamplerStatus::default(),
            health: Health::default(),
            memory: None,
        }
    }

    /// Fold in the result of one aggregation step
    pub fn apply(&mut self, aggregate: Aggregate) {
        self.gauges = PowerGauges::compute(&aggregate.snapshot, &self.profile);
        self.averages = aggregate.averages;
        self.peaks = aggregate.peaks;
        self.throttle = aggregate.throttle;
        self.snapshot = Some(aggregate.snapshot);
    }
}

/// Write side, held by the ingest path and the memory poller
#[derive(Clone)]
pub struct ViewPublisher {
    current: Arc<ArcSwap<View>>,
}

impl ViewPublisher {
    pub fn new(profile: Arc<HardwareProfile>) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(View::new(profile))),
        }
    }

    pub fn reader(&self) -> ViewReader {
        ViewReader {
            current: Arc::clone(&self.current),
        }
    }

    /// Copy the current view, modify the copy, then swap it in
    ///
    /// `modify` runs again on a fresh copy if another writer swapped in between.
    pub fn update(&self, mut modify: impl FnMut(&mut View)) {
        self.current.rcu(|current| {
            let mut next = View::clone(current);
            modify(&mut next);
            next
        });
    }
}

/// Read side, cheap to clone and safe to use from any thread
#[derive(Clone)]
pub struct ViewReader {
    current: Arc<ArcSwap<View>>,
}

impl ViewReader {
    /// The most recently published view
    pub fn latest(&self) -> Arc<View> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::extract::Extractor;
    use crate::parser::fixtures::{base_time, encode, record};
    use crate::parser::parse_record;
    use std::time::Duration;

    fn m1() -> Arc<HardwareProfile> {
        Arc::new(HardwareProfile::from_brand("Apple M1").unwrap())
    }

    fn aggregate(package_mw: f64) -> Aggregate {
        let mut extractor = Extractor::new(m1(), false);
        let mut aggregator = Aggregator::new(Duration::from_secs(30), Duration::from_secs(3));
        let sample = parse_record(&encode(record(1, package_mw))).unwrap();
        aggregator.ingest(extractor.extract(&sample, base_time(1)))
    }

    #[test]
    fn test_initial_view_is_empty() {
        let publisher = ViewPublisher::new(m1());
        let view = publisher.reader().latest();
        assert!(view.snapshot.is_none());
        assert_eq!(view.averages.package_mw, None);
        assert!(!view.health.is_degraded());
    }

    #[test]
    fn test_published_views_are_frozen() {
        let publisher = ViewPublisher::new(m1());
        let reader = publisher.reader();

        publisher.update(|v| v.apply(aggregate(4000.0)));
        let first = reader.latest();
        publisher.update(|v| v.health.flapping = true);
        let second = reader.latest();

        assert!(!first.health.flapping);
        assert!(second.health.is_degraded());
        // unchanged parts are shared, not rebuilt
        assert!(Arc::ptr_eq(
            first.snapshot.as_ref().unwrap(),
            second.snapshot.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_concurrent_writers_keep_both_updates() {
        let publisher = ViewPublisher::new(m1());
        let reader = publisher.reader();

        let writer = publisher.clone();
        let other = std::thread::spawn(move || {
            for i in 0..500u64 {
                writer.update(|v| v.health.unparsable_total = i + 1);
            }
        });
        for i in 0..500u64 {
            publisher.update(|v| v.health.skipped_stale = i + 1);
        }
        other.join().unwrap();

        let health = reader.latest().health;
        assert_eq!(health.unparsable_total, 500);
        assert_eq!(health.skipped_stale, 500);
    }

    #[test]
    fn test_power_gauges() {
        let mut view = View::new(m1());
        // M1: 20 W CPU, 20 W GPU, 48 W package ceiling
        view.apply(aggregate(24_000.0));
        assert!((view.gauges.cpu_percent - 60.0).abs() < 1e-9);
        assert!((view.gauges.gpu_percent - 30.0).abs() < 1e-9);
        assert!((view.gauges.package_percent - 50.0).abs() < 1e-9);

        view.apply(aggregate(1_000_000.0));
        assert_eq!(view.gauges.cpu_percent, 100.0);
    }

    #[test]
    fn test_view_serializes() {
        let mut view = View::new(m1());
        view.apply(aggregate(4000.0));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["averages"]["package_mw"], 4000.0);
        assert_eq!(json["profile"]["name"], "Apple M1");
    }
}
