// mtx-test-utils: Shared test utilities for the relay suite.
//
// Provides a mock relay-protocol WebSocket client used by the relayd
// integration tests to act as publishers and readers.

pub mod mock_client;

pub use mock_client::MockClient;
