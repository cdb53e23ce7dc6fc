//! Scenario scripts and their events.

use crate::ScenarioError;
use distlab_types::EventId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One scripted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: EventId,

    /// Logical milliseconds since the start of the scenario.
    pub timestamp: u64,

    /// Type tag used to look up the bound handler.
    #[serde(rename = "type")]
    pub kind: String,

    /// Handler arguments. Opaque to the controller.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TimelineEvent {
    /// Create an event.
    pub fn new(id: u64, timestamp: u64, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId(id),
            timestamp,
            kind: kind.into(),
            data,
        }
    }

    /// Decode `data` into typed handler arguments.
    ///
    /// Malformed data is logged and yields `None`.
    pub fn args<T: DeserializeOwned>(&self) -> Option<T> {
        let data = if self.data.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.data.clone()
        };
        match serde_json::from_value(data) {
            Ok(args) => Some(args),
            Err(e) => {
                warn!(event = %self.id, kind = %self.kind, error = %e, "Malformed event data");
                None
            }
        }
    }
}

/// A named, ordered script of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub learning_objectives: Vec<String>,

    pub events: Vec<TimelineEvent>,
}

impl Scenario {
    /// Create a scenario from already ordered events.
    pub fn new(name: impl Into<String>, events: Vec<TimelineEvent>) -> Result<Self, ScenarioError> {
        let scenario = Self {
            name: name.into(),
            events,
            ..Default::default()
        };
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse and validate a scenario file.
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check that timestamps never decrease and ids strictly increase.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        for pair in self.events.windows(2) {
            let (previous, event) = (&pair[0], &pair[1]);
            if event.timestamp < previous.timestamp {
                return Err(ScenarioError::Unsorted {
                    id: event.id,
                    timestamp: event.timestamp,
                    previous: previous.timestamp,
                });
            }
            if event.id <= previous.id {
                return Err(ScenarioError::NonIncreasingId {
                    id: event.id,
                    previous: previous.id,
                });
            }
        }
        Ok(())
    }

    /// Timestamp of the last event, in logical milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.events.last().map_or(0, |e| e.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tracing_test::traced_test;

    const SCRIPT: &str = r#"{
        "name": "Leader election",
        "description": "Five nodes elect a leader",
        "learning_objectives": ["Terms", "Majorities"],
        "events": [
            { "id": 1, "timestamp": 0, "type": "start_election", "data": { "node": "node-0" } },
            { "id": 2, "timestamp": 500, "type": "deliver_all" },
            { "id": 3, "timestamp": 500, "type": "fail_node", "data": { "node": "node-0" } }
        ]
    }"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_json(SCRIPT).unwrap();
        assert_eq!(scenario.name, "Leader election");
        assert_eq!(scenario.learning_objectives.len(), 2);
        assert_eq!(scenario.events.len(), 3);
        assert_eq!(scenario.events[1].kind, "deliver_all");
        assert!(scenario.events[1].data.is_null());
        assert_eq!(scenario.duration_ms(), 500);
    }

    #[test]
    fn test_rejects_unsorted_timestamps() {
        let events = vec![
            TimelineEvent::new(1, 100, "tick", json!({})),
            TimelineEvent::new(2, 50, "tick", json!({})),
        ];
        assert!(matches!(
            Scenario::new("bad", events),
            Err(ScenarioError::Unsorted { timestamp: 50, previous: 100, .. })
        ));
    }

    #[test]
    fn test_rejects_repeated_ids() {
        let events = vec![
            TimelineEvent::new(3, 0, "tick", json!({})),
            TimelineEvent::new(3, 0, "tick", json!({})),
        ];
        assert!(matches!(
            Scenario::new("bad", events),
            Err(ScenarioError::NonIncreasingId { .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            Scenario::from_json("{ \"name\": 1 }"),
            Err(ScenarioError::Parse(_))
        ));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct NodeArgs {
        node: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct CountArgs {
        #[serde(default)]
        count: Option<u32>,
    }

    #[traced_test]
    #[test]
    fn test_typed_args() {
        let scenario = Scenario::from_json(SCRIPT).unwrap();
        let args: NodeArgs = scenario.events[0].args().unwrap();
        assert_eq!(args.node, "node-0");

        // Missing data decodes as an empty object.
        let args: CountArgs = scenario.events[1].args().unwrap();
        assert_eq!(args.count, None);

        // Wrong shape is reported, not panicked on.
        assert!(scenario.events[1].args::<NodeArgs>().is_none());
        assert!(logs_contain("Malformed event data"));
    }
}
