// ft-test-utils: Shared test utilities for the field telemetry suite.
//
// Provides a mock MQTT broker and a mock storage query endpoint for
// integration testing of the ingestor, plus upstream payload fixtures.

pub mod fixtures;
pub mod mock_mqtt_broker;
pub mod mock_storage_server;

pub use mock_mqtt_broker::{ConnectInfo, MockMqttBroker};
pub use mock_storage_server::{MockStorageServer, RecordedRequest};
