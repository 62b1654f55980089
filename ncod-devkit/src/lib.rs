/*!
# NCOD DevKit - in-memory command channel for tests

Lets master and slave code be exercised without an MQTT broker:
- `MockTransport` / `MockLink`: a scripted link with connect/drop injection
- `EnvelopeBuilder`: contract-shaped envelopes for test input
- `TestHarness`: plays the master side against a running slave
*/

pub mod transport_stub;
pub mod test_utils;

pub use transport_stub::{mock_transport, EnvelopeBuilder, MockLink, MockSink, MockTransport};
pub use test_utils::TestHarness;
