//! Capacity ratio subscription
//!
//! A `RatioPublisher` owns the current full/nearfull ratios; every
//! `RatioObserver` sees the latest value through a watch channel. The server
//! holds one observer and turns changes into `PgMonitor::update_full_ratios`.

use crate::common::{MonitorConfig, Result};
use crate::coordinator::monitor::parse_ratio;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityRatios {
    pub full: f32,
    pub nearfull: f32,
}

impl CapacityRatios {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            full: config.full_ratio,
            nearfull: config.nearfull_ratio,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatioPublisher {
    tx: watch::Sender<CapacityRatios>,
}

pub struct RatioObserver {
    rx: watch::Receiver<CapacityRatios>,
}

/// Create a publisher and its first observer
pub fn channel(initial: CapacityRatios) -> (RatioPublisher, RatioObserver) {
    let (tx, rx) = watch::channel(initial);
    (RatioPublisher { tx }, RatioObserver { rx })
}

impl RatioPublisher {
    pub fn current(&self) -> CapacityRatios {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> RatioObserver {
        RatioObserver {
            rx: self.tx.subscribe(),
        }
    }

    /// Update one ratio by config key. Zero means "no change" and leaves the
    /// current ratios in place. Observers are only woken when the value
    /// actually changes.
    pub fn set(&self, key: &str, value: &str) -> Result<CapacityRatios> {
        let ratio = parse_ratio(value)?;
        let mut updated = self.current();
        let slot = match key {
            "full_ratio" | "mon_osd_full_ratio" => &mut updated.full,
            "nearfull_ratio" | "mon_osd_nearfull_ratio" => &mut updated.nearfull,
            _ => {
                return Err(crate::Error::InvalidConfig(format!(
                    "unknown config key: {}",
                    key
                )))
            }
        };
        if ratio == 0.0 {
            return Ok(updated);
        }
        *slot = ratio;
        self.tx.send_if_modified(|current| {
            if *current == updated {
                false
            } else {
                *current = updated;
                true
            }
        });
        tracing::debug!(key, ratio, "capacity ratio set");
        Ok(updated)
    }
}

impl RatioObserver {
    /// Wait for the next change. `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<CapacityRatios> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn current(&self) -> CapacityRatios {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial() -> CapacityRatios {
        CapacityRatios::from_config(&MonitorConfig::default())
    }

    #[tokio::test]
    async fn test_observer_sees_change() {
        let (publisher, mut observer) = channel(initial());
        publisher.set("mon_osd_full_ratio", "0.90").unwrap();

        let seen = observer.changed().await.unwrap();
        assert_eq!(seen.full, 0.90);
        assert_eq!(seen.nearfull, 0.85);
    }

    #[tokio::test]
    async fn test_same_value_does_not_wake() {
        let (publisher, mut observer) = channel(initial());
        publisher.set("full_ratio", "0.95").unwrap();
        publisher.set("nearfull_ratio", "0.8").unwrap();

        let seen = observer.changed().await.unwrap();
        assert_eq!(seen.nearfull, 0.8);
        assert!(!observer.rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_zero_means_no_change() {
        let (publisher, observer) = channel(initial());
        let ratios = publisher.set("full_ratio", "0").unwrap();
        assert_eq!(ratios, initial());
        assert_eq!(publisher.set("mon_osd_nearfull_ratio", "0.0").unwrap(), initial());
        assert!(!observer.rx.has_changed().unwrap());

        // Unknown keys are still rejected
        assert!(publisher.set("osd_max_backfills", "0").is_err());
    }

    #[tokio::test]
    async fn test_closed_publisher() {
        let (publisher, mut observer) = channel(initial());
        drop(publisher);
        assert!(observer.changed().await.is_none());
    }

    #[test]
    fn test_rejects_bad_input() {
        let (publisher, _observer) = channel(initial());
        assert!(publisher.set("full_ratio", "1.2").is_err());
        assert!(publisher.set("full_ratio", "half").is_err());
        assert!(publisher.set("osd_max_backfills", "0.5").is_err());
        assert_eq!(publisher.current(), initial());
    }
}
