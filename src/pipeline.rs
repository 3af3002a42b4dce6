//! Ingestion path wiring
//!
//! [`Pipeline`] is the supervisor's [`RecordSink`]: every record is parsed, extracted,
//! aggregated and published before the supervisor reads the next one. Recoverable
//! problems (unparsable records, stale records, profile re-validation failures) are absorbed
//! here and only surface as [`Health`] flags on the view.
//!
//! A run of `unparsable_threshold` stale records in a row is read as the record clock
//! having stepped backwards: the windows are rebased and the run is accepted from there.

use crate::aggregate::{Aggregate, Aggregator};
use crate::config::Config;
use crate::extract::Extractor;
use crate::parser::parse_record;
use crate::profile::{HardwareProfile, ProfileResolver};
use crate::sampler::{RecordSink, SamplerStatus};
use crate::stream::RawRecord;
use crate::view::{Health, ViewPublisher, ViewReader};
use std::sync::Arc;
use std::time::SystemTime;

/// Parser, extractor, aggregator and view publisher in one linear path
pub struct Pipeline {
    resolver: ProfileResolver,
    extractor: Extractor,
    aggregator: Aggregator,
    publisher: ViewPublisher,
    unparsable_threshold: u32,
    health: Health,
    last_timestamp: Option<SystemTime>,
}

impl Pipeline {
    /// Build the path for an already resolved profile
    ///
    /// `resolver` is kept to re-validate the profile whenever the sampler is restarted.
    pub fn new(config: &Config, resolver: ProfileResolver, profile: HardwareProfile) -> Self {
        let profile = Arc::new(profile);
        Self {
            resolver,
            extractor: Extractor::new(Arc::clone(&profile), config.display.show_cores),
            aggregator: Aggregator::new(
                config.aggregation.power_window(),
                config.aggregation.throttle_dwell(),
            ),
            publisher: ViewPublisher::new(profile),
            unparsable_threshold: config.aggregation.unparsable_threshold.max(1),
            health: Health::default(),
            last_timestamp: None,
        }
    }

    pub fn reader(&self) -> ViewReader {
        self.publisher.reader()
    }

    /// Extra write handle for publishers outside the ingest path
    pub fn publisher(&self) -> ViewPublisher {
        self.publisher.clone()
    }

    pub fn health(&self) -> Health {
        self.health
    }

    /// Run one record through the path
    ///
    /// Returns `None` when the record was skipped, either unparsable or not newer than the
    /// last accepted record.
    pub fn process(&mut self, record: &RawRecord) -> Option<Aggregate> {
        let sample = match parse_record(record) {
            Ok(sample) => sample,
            Err(e) => {
                self.record_unparsable(record, &e);
                return None;
            }
        };

        if self.health.consecutive_unparsable > 0 {
            if self.health.degraded {
                log::info!(
                    "Records parse again after {} failures",
                    self.health.consecutive_unparsable
                );
            }
            self.health.consecutive_unparsable = 0;
            self.health.degraded = false;
        }

        if let (Some(ts), Some(last)) = (sample.timestamp, self.last_timestamp) {
            if ts <= last {
                self.health.consecutive_stale += 1;
                if self.health.consecutive_stale < self.unparsable_threshold {
                    log::debug!("Skipping record not newer than the last one ({:?})", ts);
                    self.health.skipped_stale += 1;
                    self.publish_health();
                    return None;
                }
                log::warn!(
                    "{} records in a row behind {:?}, clock stepped back; restarting averages",
                    self.health.consecutive_stale,
                    last
                );
                self.aggregator.rebase();
            }
        }
        self.health.consecutive_stale = 0;

        let snapshot = self.extractor.extract(&sample, SystemTime::now());
        self.last_timestamp = Some(snapshot.timestamp);
        log::debug!(
            "Snapshot {} ({} bytes, {:.0} mW package)",
            snapshot.sequence,
            record.len(),
            snapshot.power.package_mw.value
        );

        let aggregate = self.aggregator.ingest(snapshot);
        let health = self.health;
        self.publisher.update(|view| {
            view.apply(aggregate.clone());
            view.health = health;
        });
        Some(aggregate)
    }

    fn record_unparsable(&mut self, record: &RawRecord, error: &crate::error::Error) {
        self.health.consecutive_unparsable += 1;
        self.health.unparsable_total += 1;
        log::warn!(
            "Skipping unparsable record ({} bytes): {}",
            record.len(),
            error
        );

        if !self.health.degraded && self.health.consecutive_unparsable >= self.unparsable_threshold
        {
            log::warn!(
                "{} consecutive unparsable records, marking pipeline degraded",
                self.health.consecutive_unparsable
            );
            self.health.degraded = true;
        }
        self.publish_health();
    }

    fn publish_health(&self) {
        let health = self.health;
        self.publisher.update(|view| view.health = health);
    }

    /// Re-resolve the profile; keeps the current one if resolution fails
    fn revalidate_profile(&mut self) {
        match self.resolver.resolve() {
            Ok(profile) => {
                if profile != **self.extractor.profile() {
                    log::warn!(
                        "Hardware profile changed from {} to {}",
                        self.extractor.profile(),
                        profile
                    );
                    let profile = Arc::new(profile);
                    self.extractor.set_profile(Arc::clone(&profile));
                    self.publisher.update(|view| view.profile = Arc::clone(&profile));
                }
            }
            Err(e) => log::warn!("Profile re-validation failed, keeping current: {}", e),
        }
    }
}

impl RecordSink for Pipeline {
    fn on_record(&mut self, record: RawRecord) {
        self.process(&record);
    }

    fn on_status(&mut self, status: SamplerStatus) {
        self.health.flapping = status.flapping;
        let health = self.health;
        self.publisher.update(|view| {
            view.sampler = status;
            view.health = health;
        });
    }

    fn on_generation(&mut self, generation: u64) {
        if generation > 1 {
            self.revalidate_profile();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::fixtures::{base_time, encode, record};
    use crate::sampler::SamplerState;

    fn pipeline(configure: impl FnOnce(&mut Config)) -> Pipeline {
        let mut config = Config::default();
        configure(&mut config);
        let resolver = ProfileResolver::new(Some("Apple M1".into()));
        let profile = resolver.resolve().unwrap();
        Pipeline::new(&config, resolver, profile)
    }

    fn garbage() -> RawRecord {
        RawRecord::new(b"<?xml version=\"1.0\"?><plist><dict><key>elapsed_ns</key>".to_vec())
    }

    #[test]
    fn test_scenario_average_through_pipeline() {
        let mut pipeline = pipeline(|c| c.aggregation.power_window_secs = 2);
        let reader = pipeline.reader();
        for (at, mw) in [(0, 10.0), (1, 20.0), (2, 30.0)] {
            assert!(pipeline.process(&encode(record(at, mw))).is_some());
        }

        let view = reader.latest();
        assert_eq!(view.averages.package_mw, Some(25.0));
        assert_eq!(view.peaks.package_mw, 30.0);
        assert_eq!(view.snapshot.as_ref().unwrap().timestamp, base_time(2));
    }

    #[test]
    fn test_unparsable_record_skipped() {
        let mut pipeline = pipeline(|_| {});
        let reader = pipeline.reader();

        assert!(pipeline.process(&encode(record(1, 1000.0))).is_some());
        assert!(pipeline.process(&garbage()).is_none());
        assert_eq!(reader.latest().snapshot.as_ref().unwrap().sequence, 1);

        let next = pipeline.process(&encode(record(2, 2000.0))).unwrap();
        assert_eq!(next.snapshot.sequence, 2);

        let view = reader.latest();
        assert_eq!(view.health.unparsable_total, 1);
        assert_eq!(view.health.consecutive_unparsable, 0);
        assert!(!view.health.is_degraded());
    }

    #[test]
    fn test_sustained_unparsable_degrades() {
        let mut pipeline = pipeline(|c| c.aggregation.unparsable_threshold = 3);
        let reader = pipeline.reader();

        pipeline.process(&garbage());
        pipeline.process(&garbage());
        assert!(!reader.latest().health.degraded);
        pipeline.process(&garbage());
        assert!(reader.latest().health.degraded);
        // no snapshot was ever produced
        assert!(reader.latest().snapshot.is_none());

        pipeline.process(&encode(record(1, 1000.0)));
        let health = reader.latest().health;
        assert!(!health.degraded);
        assert_eq!(health.unparsable_total, 3);
    }

    #[test]
    fn test_stale_record_skipped() {
        let mut pipeline = pipeline(|_| {});
        assert!(pipeline.process(&encode(record(5, 1000.0))).is_some());
        assert!(pipeline.process(&encode(record(5, 9000.0))).is_none());
        assert!(pipeline.process(&encode(record(4, 9000.0))).is_none());
        assert_eq!(pipeline.health().skipped_stale, 2);

        let agg = pipeline.process(&encode(record(6, 3000.0))).unwrap();
        assert_eq!(agg.averages.package_mw, Some(2000.0));
    }

    #[test]
    fn test_clock_step_back_recovers() {
        let mut pipeline = pipeline(|c| c.aggregation.unparsable_threshold = 5);
        let reader = pipeline.reader();
        assert!(pipeline.process(&encode(record(3600, 9000.0))).is_some());

        let accepted = (0..100)
            .filter(|&at| pipeline.process(&encode(record(at, 1000.0))).is_some())
            .count();
        assert_eq!(accepted, 96);

        let view = reader.latest();
        let snapshot = view.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.sequence, 97);
        assert_eq!(snapshot.timestamp, base_time(99));
        assert_eq!(view.health.skipped_stale, 4);
        assert_eq!(view.health.consecutive_stale, 0);
        // the pre-step value left the window
        assert_eq!(view.averages.package_mw, Some(1000.0));
    }

    #[test]
    fn test_sampler_status_reaches_view() {
        let mut pipeline = pipeline(|_| {});
        let reader = pipeline.reader();

        pipeline.on_status(SamplerStatus {
            state: SamplerState::Restarting,
            generation: 4,
            failed_restarts: 5,
            flapping: true,
            ..SamplerStatus::default()
        });
        let view = reader.latest();
        assert_eq!(view.sampler.state, SamplerState::Restarting);
        assert!(view.health.flapping);
        assert!(view.health.is_degraded());
    }

    #[test]
    fn test_sequence_continues_across_generations() {
        let mut pipeline = pipeline(|c| c.display.show_cores = true);
        pipeline.on_generation(1);
        pipeline.on_record(encode(record(1, 1000.0)));
        pipeline.on_generation(2);
        pipeline.on_record(encode(record(2, 1000.0)));

        let view = pipeline.reader().latest();
        let snapshot = view.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(view.profile.name, "Apple M1");
        assert_eq!(snapshot.cores(crate::profile::CoreKind::Efficiency).count(), 4);
    }
}
