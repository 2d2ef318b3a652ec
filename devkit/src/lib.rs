/*!
Fieldwatch DevKit - development and test support

Runs the dashboard engine end to end without a broker or a field device:
- `producer_sim`: plays the field backend against a `MemoryStore`
- `records`: builders for sample, status and config payloads
- `test_utils`: harness wiring a `Dashboard` to the simulator
*/

pub mod producer_sim;
pub mod records;
pub mod test_utils;

pub use producer_sim::ProducerSim;
pub use records::RecordBuilder;
pub use test_utils::TestHarness;
