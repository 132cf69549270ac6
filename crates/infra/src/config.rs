//! Configuration loading and representation.
//!
//! Values come from the process environment (`SBM_*` variables) with sane
//! defaults. Anything that could produce a busy loop or a wedged queue is
//! clamped by [`EngineConfig::normalized`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use smartbill_core::ResourceClass;

pub const IDLE_MIN_FLOOR: Duration = Duration::from_millis(50);
pub const IDLE_MAX_CEILING: Duration = Duration::from_secs(60);
pub const REAPER_INTERVAL_FLOOR: Duration = Duration::from_secs(5);
pub const REAPER_INTERVAL_CEILING: Duration = Duration::from_secs(24 * 3600);
pub const PROCESSING_TTL_FLOOR: Duration = Duration::from_secs(30);
pub const PROCESSING_TTL_CEILING: Duration = Duration::from_secs(7 * 24 * 3600);
pub const CLASS_CAPACITY_CEILING: usize = 1024;
pub const ACQUIRE_TIMEOUT_CEILING: Duration = Duration::from_secs(600);

/// Tunables of the worker loop and the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First idle sleep after an empty poll.
    pub idle_min: Duration,
    /// Cap of the doubling idle sleep.
    pub idle_max: Duration,
    /// How often the reaper sweeps for stuck tasks.
    pub reaper_interval: Duration,
    /// How long a task may stay `processing` without an update.
    pub processing_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_min: Duration::from_millis(200),
            idle_max: Duration::from_millis(5000),
            reaper_interval: Duration::from_secs(30),
            processing_ttl: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Read `SBM_TASK_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, file, test map).
    ///
    /// Missing, unparseable and non-positive values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            idle_min: millis(&lookup, "SBM_TASK_IDLE_MIN_MS").unwrap_or(defaults.idle_min),
            idle_max: millis(&lookup, "SBM_TASK_IDLE_MAX_MS").unwrap_or(defaults.idle_max),
            reaper_interval: seconds(&lookup, "SBM_TASK_REAPER_INTERVAL_SECONDS")
                .unwrap_or(defaults.reaper_interval),
            processing_ttl: seconds(&lookup, "SBM_TASK_PROCESSING_TTL_SECONDS")
                .unwrap_or(defaults.processing_ttl),
        }
        .normalized()
    }

    pub fn with_idle(mut self, min: Duration, max: Duration) -> Self {
        self.idle_min = min;
        self.idle_max = max;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_processing_ttl(mut self, ttl: Duration) -> Self {
        self.processing_ttl = ttl;
        self
    }

    /// Clamp every field into its allowed range.
    pub fn normalized(self) -> Self {
        let idle_min = self.idle_min.clamp(IDLE_MIN_FLOOR, IDLE_MAX_CEILING);
        Self {
            idle_min,
            idle_max: self.idle_max.clamp(idle_min, IDLE_MAX_CEILING),
            reaper_interval: self
                .reaper_interval
                .clamp(REAPER_INTERVAL_FLOOR, REAPER_INTERVAL_CEILING),
            processing_ttl: self
                .processing_ttl
                .clamp(PROCESSING_TTL_FLOOR, PROCESSING_TTL_CEILING),
        }
    }
}

/// Capacity and acquire timeout of one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimit {
    /// Simultaneous holders allowed; 0 disables gating for the class.
    pub capacity: usize,
    /// How long `acquire` waits for a slot; zero waits indefinitely.
    pub acquire_timeout: Duration,
}

impl ClassLimit {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            capacity,
            acquire_timeout,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_unbounded(&self) -> bool {
        self.capacity == 0
    }

    /// Cap capacity and acquire timeout. Zero stays zero for both.
    pub fn normalized(self) -> Self {
        Self {
            capacity: self.capacity.min(CLASS_CAPACITY_CEILING),
            acquire_timeout: self.acquire_timeout.min(ACQUIRE_TIMEOUT_CEILING),
        }
    }
}

/// Per-class limits of the concurrency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub ocr: ClassLimit,
    pub bulk_export: ClassLimit,
    pub email_download: ClassLimit,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ocr: ClassLimit::new(2, Duration::from_secs(30)),
            bulk_export: ClassLimit::new(1, Duration::from_secs(5)),
            email_download: ClassLimit::new(2, Duration::from_secs(10)),
        }
    }
}

impl GateConfig {
    /// Read `SBM_LIMIT_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    ///
    /// Capacities accept any integer; zero or negative means unbounded.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let class = |prefix: &str, default: ClassLimit| ClassLimit {
            capacity: capacity(&lookup, prefix).unwrap_or(default.capacity),
            acquire_timeout: millis(&lookup, &format!("{prefix}_TIMEOUT_MS"))
                .unwrap_or(default.acquire_timeout),
        };
        Self {
            ocr: class("SBM_LIMIT_OCR", defaults.ocr),
            bulk_export: class("SBM_LIMIT_EXPORT", defaults.bulk_export),
            email_download: class("SBM_LIMIT_EMAIL_DOWNLOAD", defaults.email_download),
        }
        .normalized()
    }

    /// Clamp every class into its allowed range.
    pub fn normalized(self) -> Self {
        Self {
            ocr: self.ocr.normalized(),
            bulk_export: self.bulk_export.normalized(),
            email_download: self.email_download.normalized(),
        }
    }

    pub fn with_limit(mut self, class: ResourceClass, limit: ClassLimit) -> Self {
        match class {
            ResourceClass::Ocr => self.ocr = limit,
            ResourceClass::BulkExport => self.bulk_export = limit,
            ResourceClass::EmailDownload => self.email_download = limit,
        }
        self
    }

    pub fn limit(&self, class: ResourceClass) -> ClassLimit {
        match class {
            ResourceClass::Ocr => self.ocr,
            ResourceClass::BulkExport => self.bulk_export,
            ResourceClass::EmailDownload => self.email_download,
        }
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    positive(lookup, key).map(Duration::from_millis)
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    positive(lookup, key).map(Duration::from_secs)
}

fn capacity(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let n = lookup(key)?.trim().parse::<i64>().ok()?;
    Some(usize::try_from(n).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, EngineConfig::default());

        let gate = GateConfig::from_lookup(lookup(&[]));
        assert_eq!(gate, GateConfig::default());
        assert_eq!(gate.ocr.capacity, 2);
        assert_eq!(gate.bulk_export.capacity, 1);
        assert_eq!(gate.email_download.capacity, 2);
    }

    #[test]
    fn reads_overrides() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SBM_TASK_IDLE_MIN_MS", "100"),
            ("SBM_TASK_IDLE_MAX_MS", "800"),
            ("SBM_TASK_REAPER_INTERVAL_SECONDS", "60"),
            ("SBM_TASK_PROCESSING_TTL_SECONDS", "120"),
        ]));
        assert_eq!(cfg.idle_min, Duration::from_millis(100));
        assert_eq!(cfg.idle_max, Duration::from_millis(800));
        assert_eq!(cfg.reaper_interval, Duration::from_secs(60));
        assert_eq!(cfg.processing_ttl, Duration::from_secs(120));
    }

    #[test]
    fn garbage_and_non_positive_values_fall_back() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SBM_TASK_IDLE_MIN_MS", "fast"),
            ("SBM_TASK_PROCESSING_TTL_SECONDS", "0"),
            ("SBM_TASK_REAPER_INTERVAL_SECONDS", "-3"),
        ]));
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn floors_are_enforced() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SBM_TASK_IDLE_MIN_MS", "1"),
            ("SBM_TASK_IDLE_MAX_MS", "2"),
            ("SBM_TASK_REAPER_INTERVAL_SECONDS", "1"),
            ("SBM_TASK_PROCESSING_TTL_SECONDS", "1"),
        ]));
        assert_eq!(cfg.idle_min, IDLE_MIN_FLOOR);
        assert_eq!(cfg.idle_max, IDLE_MIN_FLOOR);
        assert_eq!(cfg.reaper_interval, REAPER_INTERVAL_FLOOR);
        assert_eq!(cfg.processing_ttl, PROCESSING_TTL_FLOOR);
    }

    #[test]
    fn gate_capacity_zero_or_negative_is_unbounded() {
        let gate = GateConfig::from_lookup(lookup(&[
            ("SBM_LIMIT_OCR", "0"),
            ("SBM_LIMIT_EXPORT", "-1"),
            ("SBM_LIMIT_EMAIL_DOWNLOAD", "4"),
            ("SBM_LIMIT_EMAIL_DOWNLOAD_TIMEOUT_MS", "250"),
        ]));
        assert!(gate.ocr.is_unbounded());
        assert!(gate.limit(ResourceClass::BulkExport).is_unbounded());
        assert_eq!(
            gate.limit(ResourceClass::EmailDownload),
            ClassLimit::new(4, Duration::from_millis(250))
        );
    }

    #[test]
    fn oversized_gate_limits_are_capped() {
        let gate = GateConfig::from_lookup(lookup(&[
            ("SBM_LIMIT_OCR", "9223372036854775807"),
            ("SBM_LIMIT_EXPORT_TIMEOUT_MS", "18446744073709551615"),
        ]));
        assert_eq!(gate.ocr.capacity, CLASS_CAPACITY_CEILING);
        assert_eq!(gate.bulk_export.acquire_timeout, ACQUIRE_TIMEOUT_CEILING);
        assert_eq!(gate.bulk_export.capacity, 1);
        assert_eq!(gate.email_download, GateConfig::default().email_download);

        let manual = GateConfig::default()
            .with_limit(ResourceClass::Ocr, ClassLimit::new(usize::MAX, Duration::MAX))
            .normalized();
        assert_eq!(
            manual.ocr,
            ClassLimit::new(CLASS_CAPACITY_CEILING, ACQUIRE_TIMEOUT_CEILING)
        );
        assert!(ClassLimit::unbounded().normalized().is_unbounded());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever is configured, the normalized config can neither
        /// busy-loop nor reap before the floor.
        #[test]
        fn normalized_config_is_always_within_bounds(
            idle_min in 0u64..120_000,
            idle_max in 0u64..120_000,
            reaper in 0u64..200_000,
            ttl in 0u64..1_000_000,
        ) {
            let cfg = EngineConfig {
                idle_min: Duration::from_millis(idle_min),
                idle_max: Duration::from_millis(idle_max),
                reaper_interval: Duration::from_secs(reaper),
                processing_ttl: Duration::from_secs(ttl),
            }
            .normalized();

            prop_assert!(cfg.idle_min >= IDLE_MIN_FLOOR);
            prop_assert!(cfg.idle_max >= cfg.idle_min);
            prop_assert!(cfg.idle_max <= IDLE_MAX_CEILING);
            prop_assert!(cfg.reaper_interval >= REAPER_INTERVAL_FLOOR);
            prop_assert!(cfg.processing_ttl >= PROCESSING_TTL_FLOOR);
            prop_assert!(cfg.reaper_interval <= REAPER_INTERVAL_CEILING);
            prop_assert!(cfg.processing_ttl <= PROCESSING_TTL_CEILING);
        }
    }
}
