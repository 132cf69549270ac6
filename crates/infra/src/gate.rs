//! Process-wide concurrency gate for resource-intensive operations.
//!
//! Each [`ResourceClass`] owns a fixed-size slot pool backed by a Tokio
//! semaphore. Handlers (or synchronous request paths running on the runtime)
//! acquire a [`GatePermit`] before doing the expensive work; the slot is
//! returned when the permit is dropped, on every exit path.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use smartbill_core::{ResourceClass, TaskError};

use crate::config::{ClassLimit, GateConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// No slot became free within the acquire timeout.
    #[error("{class} busy")]
    ResourceBusy { class: ResourceClass },
}

impl From<GateError> for TaskError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::ResourceBusy { class } => TaskError::ResourceBusy(class),
        }
    }
}

/// A held slot. Dropping it (or calling [`GatePermit::release`]) frees the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct GatePermit {
    class: ResourceClass,
    permit: Option<OwnedSemaphorePermit>,
}

impl GatePermit {
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Whether this permit actually occupies a slot (false for unbounded classes).
    pub fn is_gated(&self) -> bool {
        self.permit.is_some()
    }

    /// Release the slot now.
    pub fn release(self) {
        drop(self);
    }
}

#[derive(Debug)]
struct Pool {
    semaphore: Option<Arc<Semaphore>>,
    limit: ClassLimit,
}

impl Pool {
    fn new(limit: ClassLimit) -> Self {
        Self {
            semaphore: (!limit.is_unbounded()).then(|| Arc::new(Semaphore::new(limit.capacity))),
            limit,
        }
    }
}

/// Bounded slot pools, one per resource class.
///
/// Construct once per process and share it (`Arc<ConcurrencyGate>`).
#[derive(Debug)]
pub struct ConcurrencyGate {
    ocr: Pool,
    bulk_export: Pool,
    email_download: Pool,
}

impl ConcurrencyGate {
    /// Build the pools; limits are clamped with [`GateConfig::normalized`].
    pub fn new(config: GateConfig) -> Self {
        let config = config.normalized();
        Self {
            ocr: Pool::new(config.ocr),
            bulk_export: Pool::new(config.bulk_export),
            email_download: Pool::new(config.email_download),
        }
    }

    /// A gate that never blocks.
    pub fn unbounded() -> Self {
        let open = ClassLimit::unbounded();
        Self::new(GateConfig {
            ocr: open,
            bulk_export: open,
            email_download: open,
        })
    }

    fn pool(&self, class: ResourceClass) -> &Pool {
        match class {
            ResourceClass::Ocr => &self.ocr,
            ResourceClass::BulkExport => &self.bulk_export,
            ResourceClass::EmailDownload => &self.email_download,
        }
    }

    /// Acquire a slot, waiting at most the class's configured timeout.
    pub async fn acquire(&self, class: ResourceClass) -> Result<GatePermit, GateError> {
        let timeout = self.pool(class).limit.acquire_timeout;
        self.acquire_timeout(class, timeout).await
    }

    /// Acquire a slot, waiting at most `timeout` (zero waits indefinitely).
    pub async fn acquire_timeout(
        &self,
        class: ResourceClass,
        timeout: Duration,
    ) -> Result<GatePermit, GateError> {
        let Some(semaphore) = self.pool(class).semaphore.clone() else {
            return Ok(GatePermit {
                class,
                permit: None,
            });
        };

        let acquired = if timeout.is_zero() {
            semaphore.acquire_owned().await.ok()
        } else {
            match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                Ok(permit) => permit.ok(),
                Err(_elapsed) => None,
            }
        };

        match acquired {
            Some(permit) => {
                debug!(class = %class, "gate slot acquired");
                Ok(GatePermit {
                    class,
                    permit: Some(permit),
                })
            }
            None => {
                warn!(class = %class, timeout_ms = timeout.as_millis() as u64, "gate saturated");
                Err(GateError::ResourceBusy { class })
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, class: ResourceClass) -> Result<GatePermit, GateError> {
        let Some(semaphore) = self.pool(class).semaphore.clone() else {
            return Ok(GatePermit {
                class,
                permit: None,
            });
        };

        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(GatePermit {
                class,
                permit: Some(permit),
            }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                Err(GateError::ResourceBusy { class })
            }
        }
    }

    /// Free slots for `class`; `None` when the class is unbounded.
    pub fn available(&self, class: ResourceClass) -> Option<usize> {
        self.pool(class)
            .semaphore
            .as_ref()
            .map(|s| s.available_permits())
    }

    pub fn limit(&self, class: ResourceClass) -> ClassLimit {
        self.pool(class).limit
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CLASS_CAPACITY_CEILING;

    fn single_ocr_slot(timeout: Duration) -> Arc<ConcurrencyGate> {
        Arc::new(ConcurrencyGate::new(
            GateConfig::default().with_limit(ResourceClass::Ocr, ClassLimit::new(1, timeout)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_waits_for_release() {
        let gate = single_ocr_slot(Duration::from_secs(5));
        let first = gate.acquire(ResourceClass::Ocr).await.unwrap();
        assert_eq!(gate.available(ResourceClass::Ocr), Some(0));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(ResourceClass::Ocr).await.map(|p| p.is_gated()) })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        first.release();
        assert_eq!(waiter.await.unwrap(), Ok(true));
        assert_eq!(gate.available(ResourceClass::Ocr), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_times_out_when_never_released() {
        let gate = single_ocr_slot(Duration::from_secs(5));
        let _held = gate.acquire(ResourceClass::Ocr).await.unwrap();

        let err = gate.acquire(ResourceClass::Ocr).await.unwrap_err();
        assert_eq!(err, GateError::ResourceBusy { class: ResourceClass::Ocr });
        assert_eq!(TaskError::from(err), TaskError::ResourceBusy(ResourceClass::Ocr));
        assert_eq!(err.to_string(), "ocr busy");
    }

    #[tokio::test]
    async fn permit_is_released_on_error_paths() {
        let gate = single_ocr_slot(Duration::from_millis(50));

        async fn failing_work(gate: &ConcurrencyGate) -> anyhow::Result<()> {
            let _permit = gate.acquire(ResourceClass::Ocr).await?;
            anyhow::bail!("ocr engine crashed")
        }

        assert!(failing_work(&gate).await.is_err());
        assert_eq!(gate.available(ResourceClass::Ocr), Some(1));
        assert!(gate.try_acquire(ResourceClass::Ocr).is_ok());
    }

    #[tokio::test]
    async fn unbounded_class_never_blocks() {
        let gate = ConcurrencyGate::new(
            GateConfig::default().with_limit(ResourceClass::BulkExport, ClassLimit::unbounded()),
        );
        let permits: Vec<_> = (0..100)
            .map(|_| gate.try_acquire(ResourceClass::BulkExport).unwrap())
            .collect();
        assert!(permits.iter().all(|p| !p.is_gated()));
        assert_eq!(gate.available(ResourceClass::BulkExport), None);
    }

    #[test]
    fn huge_capacity_is_capped_instead_of_panicking() {
        let gate = ConcurrencyGate::new(GateConfig::default().with_limit(
            ResourceClass::Ocr,
            ClassLimit::new(usize::MAX, Duration::from_secs(1)),
        ));
        assert_eq!(gate.available(ResourceClass::Ocr), Some(CLASS_CAPACITY_CEILING));
        assert_eq!(gate.limit(ResourceClass::Ocr).capacity, CLASS_CAPACITY_CEILING);
    }

    #[tokio::test]
    async fn classes_are_independent() {
        let gate = ConcurrencyGate::default();
        let _export = gate.try_acquire(ResourceClass::BulkExport).unwrap();
        assert!(gate.try_acquire(ResourceClass::BulkExport).is_err());
        assert!(gate.try_acquire(ResourceClass::Ocr).is_ok());
        assert!(gate.try_acquire(ResourceClass::EmailDownload).is_ok());
    }
}
