// Event publisher
//
// The boundary between platform actions and the event log:
// expand -> append (atomic) -> publish each row on its channel.
//
// Publishing is best effort. Rows are durable once appended and reach clients
// through catch-up or polling even when no broadcast goes out.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::channels::ChannelRouter;
use crate::error::PublishError;
use crate::event::{BroadcastMessage, Event};
use crate::registry::EventTypeRegistry;
use crate::traits::{Broadcaster, EventLog};

/// What an action produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub events: Vec<Event>,
    /// Total subscribers reached across all broadcasts
    pub delivered: usize,
    /// Broadcasts that failed; the rows are still in the log
    pub publish_failures: usize,
}

#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<EventTypeRegistry>,
    log: Arc<dyn EventLog>,
    broadcaster: Arc<dyn Broadcaster>,
    use_broadcaster: bool,
}

impl EventPublisher {
    pub fn new(
        registry: Arc<EventTypeRegistry>,
        log: Arc<dyn EventLog>,
        broadcaster: Arc<dyn Broadcaster>,
        use_broadcaster: bool,
    ) -> Self {
        Self {
            registry,
            log,
            broadcaster,
            use_broadcaster,
        }
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// Run one platform action through the registry and into the log
    #[instrument(skip(self, input), fields(action = %action))]
    pub async fn publish_action(
        &self,
        action: &str,
        input: &Map<String, Value>,
    ) -> Result<PublishReport, PublishError> {
        let rows = self.registry.expand(action, input)?;
        if rows.is_empty() {
            debug!("Action emits no events");
            return Ok(PublishReport {
                events: Vec::new(),
                delivered: 0,
                publish_failures: 0,
            });
        }

        let events = self.log.append(rows).await?;
        info!(
            count = events.len(),
            first_id = events.first().map(|e| e.id),
            "Appended events"
        );

        let (delivered, publish_failures) = self.broadcast(&events).await;
        Ok(PublishReport {
            events,
            delivered,
            publish_failures,
        })
    }

    async fn broadcast(&self, events: &[Event]) -> (usize, usize) {
        if !self.use_broadcaster || !self.broadcaster.is_available().await {
            debug!("Broadcaster disabled or unavailable, relying on polling");
            return (0, 0);
        }

        let mut delivered = 0;
        let mut failures = 0;
        for event in events {
            let Some(channel) = ChannelRouter::channel_for(event) else {
                continue;
            };

            let result = match BroadcastMessage::from_event(event).encode() {
                Ok(message) => self.broadcaster.publish(&channel, &message).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(count) => delivered += count,
                Err(e) => {
                    failures += 1;
                    warn!(
                        channel = %channel,
                        event_id = event.id,
                        error = %e,
                        "Broadcast failed, event stays available via catch-up"
                    );
                }
            }
        }
        (delivered, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::event::RelatedTable;
    use crate::memory::{InMemoryBroadcaster, InMemoryEventLog, NoopBroadcaster};
    use crate::traits::ReadScope;
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn publisher(
        log: Arc<InMemoryEventLog>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> EventPublisher {
        EventPublisher::new(
            Arc::new(EventTypeRegistry::builtin().unwrap()),
            log,
            broadcaster,
            true,
        )
    }

    #[tokio::test]
    async fn test_publish_appends_rows() {
        let log = Arc::new(InMemoryEventLog::new());
        let publisher = publisher(log.clone(), Arc::new(InMemoryBroadcaster::new()));

        let report = publisher
            .publish_action(
                "text_added",
                &input(json!({"textId": 11, "rootStoryId": 1, "gameId": 3, "writerId": 7})),
            )
            .await
            .unwrap();

        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].related_table, RelatedTable::Text);
        assert_eq!(report.events[1].related_table, RelatedTable::Game);
        // Nobody subscribed yet
        assert_eq!(report.delivered, 0);
        assert_eq!(report.publish_failures, 0);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_configuration_error_appends_nothing() {
        let log = Arc::new(InMemoryEventLog::new());
        let publisher = publisher(log.clone(), Arc::new(InMemoryBroadcaster::new()));

        let err = publisher
            .publish_action("game_closed", &input(json!({"textId": 1, "gameId": 2})))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Configuration(RegistryError::MissingRequiredField { .. })
        ));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_broadcaster_still_appends() {
        let log = Arc::new(InMemoryEventLog::new());
        let publisher = publisher(log.clone(), Arc::new(NoopBroadcaster));

        let report = publisher
            .publish_action(
                "notification_created",
                &input(json!({"notificationId": 5, "recipientId": 7, "message": "hi"})),
            )
            .await
            .unwrap();

        assert_eq!(report.events.len(), 1);
        let visible = log
            .read_since(0, &ReadScope::new(Some(7), None))
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let log = Arc::new(InMemoryEventLog::new());
        log.set_failing(true);
        let publisher = publisher(log, Arc::new(InMemoryBroadcaster::new()));

        let err = publisher
            .publish_action("game_joined", &input(json!({"gameId": 1, "writerId": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Store(_)));
    }

    #[tokio::test]
    async fn test_zero_emission_action() {
        let log = Arc::new(InMemoryEventLog::new());
        let publisher = publisher(log.clone(), Arc::new(InMemoryBroadcaster::new()));

        let report = publisher
            .publish_action("draft_saved", &input(json!({"textId": 1, "writerId": 2})))
            .await
            .unwrap();
        assert!(report.events.is_empty());
        assert!(log.is_empty());
    }
}
