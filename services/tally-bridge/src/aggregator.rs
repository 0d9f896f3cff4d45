//! Fleet-wide activity aggregation.
//!
//! The aggregator holds the latest [`InstanceState`] snapshot reported by
//! every connection loop and publishes the logical OR of their activity
//! whenever it differs from the last value the bus accepted.
//!
//! Storing a snapshot, recomputing the aggregate, comparing it against the
//! last published value and publishing all happen under one async mutex, so
//! concurrent reports from different devices can neither double-publish nor
//! leave `last_published` out of step with what the bus has seen.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::bus::{PublishTarget, Publisher};
use crate::instance::{Endpoint, InstanceState};

/// Fleet-wide tally value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    On,
    Off,
}

impl Activity {
    /// Payload sent on the bus.
    pub const fn payload(self) -> &'static str {
        match self {
            Activity::On => "ON",
            Activity::Off => "OFF",
        }
    }
}

impl From<bool> for Activity {
    fn from(active: bool) -> Self {
        if active {
            Activity::On
        } else {
            Activity::Off
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload())
    }
}

/// State guarded by the aggregator lock.
#[derive(Debug, Default)]
struct FleetState {
    instances: HashMap<Endpoint, InstanceState>,

    /// Last value the bus accepted; `None` until the first success.
    last_published: Option<Activity>,
}

impl FleetState {
    fn aggregate(&self) -> Activity {
        Activity::from(self.instances.values().any(InstanceState::is_active))
    }
}

/// Single serialization point for fleet state and publication.
pub struct FleetAggregator {
    publisher: Arc<dyn Publisher>,
    target: PublishTarget,
    state: Mutex<FleetState>,
}

impl FleetAggregator {
    pub fn new(publisher: Arc<dyn Publisher>, target: PublishTarget) -> Self {
        Self {
            publisher,
            target,
            state: Mutex::new(FleetState::default()),
        }
    }

    /// Track a device with all flags cleared. Existing records are kept.
    pub async fn register(&self, endpoint: Endpoint) {
        let mut state = self.state.lock().await;
        state.instances.entry(endpoint).or_default();
    }

    /// Publish the current aggregate unconditionally.
    ///
    /// Called once at startup, before any device connects, so consumers get
    /// a baseline `OFF` immediately.
    pub async fn publish_baseline(&self) {
        let mut state = self.state.lock().await;
        let aggregate = state.aggregate();
        self.publish_locked(&mut state, aggregate).await;
    }

    /// Record a device's latest flags and publish the aggregate if it changed.
    ///
    /// Every decoded line and every connection reset ends up here, so this
    /// runs far more often than the aggregate actually changes.
    pub async fn on_instance_changed(&self, endpoint: &Endpoint, instance: InstanceState) {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(endpoint) {
            Some(slot) => *slot = instance,
            None => {
                state.instances.insert(endpoint.clone(), instance);
            }
        }

        let aggregate = state.aggregate();
        if state.last_published == Some(aggregate) {
            return;
        }
        self.publish_locked(&mut state, aggregate).await;
    }

    /// Aggregate over the current snapshots.
    pub async fn current(&self) -> Activity {
        self.state.lock().await.aggregate()
    }

    /// Last value the bus accepted.
    pub async fn last_published(&self) -> Option<Activity> {
        self.state.lock().await.last_published
    }

    /// Number of tracked devices.
    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Number of devices with at least one activator set.
    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.is_active())
            .count()
    }

    async fn publish_locked(&self, state: &mut FleetState, aggregate: Activity) {
        let active_instances = state.instances.values().filter(|i| i.is_active()).count();
        let result = self
            .publisher
            .publish(
                &self.target.topic,
                aggregate.payload(),
                self.target.delivery,
                self.target.retain,
            )
            .await;

        match result {
            Ok(()) => {
                info!(
                    topic = %self.target.topic,
                    payload = aggregate.payload(),
                    active_instances,
                    "Published fleet activity"
                );
                state.last_published = Some(aggregate);
            }
            Err(e) => {
                // last_published is left alone so the next report retries.
                error!(
                    topic = %self.target.topic,
                    payload = aggregate.payload(),
                    error = %e,
                    "Failed to publish fleet activity"
                );
            }
        }
        debug!(last_published = ?state.last_published, "Aggregate evaluated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Delivery, MemoryPublisher};
    use vtally_proto::Activator;

    fn active(activator: Activator) -> InstanceState {
        let mut state = InstanceState::default();
        state.set(activator, true);
        state
    }

    async fn setup(endpoints: &[Endpoint]) -> (Arc<MemoryPublisher>, FleetAggregator) {
        let publisher = Arc::new(MemoryPublisher::new());
        let aggregator = FleetAggregator::new(publisher.clone(), PublishTarget::new("tally"));
        for endpoint in endpoints {
            aggregator.register(endpoint.clone()).await;
        }
        (publisher, aggregator)
    }

    #[tokio::test]
    async fn test_baseline_publishes_off() {
        let a = Endpoint::new("a", 8099);
        let (publisher, aggregator) = setup(&[a]).await;

        aggregator.publish_baseline().await;

        let publications = publisher.publications();
        assert_eq!(publications.len(), 1);
        assert_eq!(publications[0].topic, "tally");
        assert_eq!(publications[0].payload, "OFF");
        assert_eq!(publications[0].delivery, Delivery::AtLeastOnce);
        assert!(!publications[0].retain);
        assert_eq!(aggregator.last_published().await, Some(Activity::Off));
    }

    #[tokio::test]
    async fn test_two_instance_scenario() {
        let a = Endpoint::new("a", 8099);
        let b = Endpoint::new("b", 8099);
        let (publisher, aggregator) = setup(&[a.clone(), b.clone()]).await;
        aggregator.publish_baseline().await;

        aggregator
            .on_instance_changed(&a, active(Activator::Recording))
            .await;
        assert_eq!(publisher.payloads(), vec!["OFF", "ON"]);

        aggregator
            .on_instance_changed(&b, active(Activator::Streaming))
            .await;
        assert_eq!(publisher.len(), 2);

        aggregator
            .on_instance_changed(&a, InstanceState::default())
            .await;
        assert_eq!(publisher.len(), 2);
        assert_eq!(aggregator.current().await, Activity::On);

        aggregator
            .on_instance_changed(&b, InstanceState::default())
            .await;
        assert_eq!(publisher.payloads(), vec!["OFF", "ON", "OFF"]);
    }

    #[tokio::test]
    async fn test_unchanged_aggregate_is_not_republished() {
        let a = Endpoint::new("a", 8099);
        let (publisher, aggregator) = setup(&[a.clone()]).await;
        aggregator.publish_baseline().await;

        for _ in 0..5 {
            aggregator
                .on_instance_changed(&a, InstanceState::default())
                .await;
        }
        assert_eq!(publisher.len(), 1);

        let mut state = active(Activator::External);
        aggregator.on_instance_changed(&a, state).await;
        state.set(Activator::MultiCorder, true);
        aggregator.on_instance_changed(&a, state).await;
        assert_eq!(publisher.payloads(), vec!["OFF", "ON"]);
    }

    #[tokio::test]
    async fn test_aggregate_is_or_of_all_instances() {
        let endpoints: Vec<Endpoint> = (0..3).map(|i| Endpoint::new(format!("h{i}"), 8099)).collect();
        let (_publisher, aggregator) = setup(&endpoints).await;

        for mask in 0u8..8 {
            for (bit, endpoint) in endpoints.iter().enumerate() {
                let state = if mask & (1 << bit) != 0 {
                    active(Activator::Recording)
                } else {
                    InstanceState::default()
                };
                aggregator.on_instance_changed(endpoint, state).await;
            }
            assert_eq!(aggregator.current().await, Activity::from(mask != 0));
            assert_eq!(aggregator.last_published().await, Some(Activity::from(mask != 0)));
            assert_eq!(aggregator.active_count().await, mask.count_ones() as usize);
        }
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_on_next_report() {
        let a = Endpoint::new("a", 8099);
        let (publisher, aggregator) = setup(&[a.clone()]).await;
        aggregator.publish_baseline().await;

        publisher.set_failing(true);
        aggregator
            .on_instance_changed(&a, active(Activator::Recording))
            .await;
        assert_eq!(aggregator.last_published().await, Some(Activity::Off));

        publisher.set_failing(false);
        aggregator
            .on_instance_changed(&a, active(Activator::Recording))
            .await;
        assert_eq!(publisher.payloads(), vec!["OFF", "ON"]);
        assert_eq!(aggregator.last_published().await, Some(Activity::On));
    }

    #[tokio::test]
    async fn test_failed_baseline_is_published_on_first_report() {
        let a = Endpoint::new("a", 8099);
        let (publisher, aggregator) = setup(&[a.clone()]).await;

        publisher.set_failing(true);
        aggregator.publish_baseline().await;
        assert_eq!(aggregator.last_published().await, None);

        publisher.set_failing(false);
        aggregator
            .on_instance_changed(&a, InstanceState::default())
            .await;
        assert_eq!(publisher.payloads(), vec!["OFF"]);
    }

    #[tokio::test]
    async fn test_concurrent_reports_publish_once() {
        let endpoints: Vec<Endpoint> = (0..16).map(|i| Endpoint::new(format!("h{i}"), 8099)).collect();
        let (publisher, aggregator) = setup(&endpoints).await;
        let aggregator = Arc::new(aggregator);
        aggregator.publish_baseline().await;

        let mut handles = Vec::new();
        for endpoint in endpoints.clone() {
            let aggregator = Arc::clone(&aggregator);
            handles.push(tokio::spawn(async move {
                aggregator
                    .on_instance_changed(&endpoint, active(Activator::Streaming))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(publisher.payloads(), vec!["OFF", "ON"]);
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_is_tracked() {
        let (_publisher, aggregator) = setup(&[]).await;
        let a = Endpoint::new("late", 8099);

        aggregator
            .on_instance_changed(&a, active(Activator::Recording))
            .await;
        assert_eq!(aggregator.instance_count().await, 1);
        assert_eq!(aggregator.current().await, Activity::On);
    }

    #[test]
    fn test_activity_payloads() {
        assert_eq!(Activity::from(true).payload(), "ON");
        assert_eq!(Activity::from(false).payload(), "OFF");
        assert_eq!(Activity::On.to_string(), "ON");
    }
}
