//! Hardware abstraction: capability traits and simulated devices.
//!
//! Devices implement the fine-grained capability traits in
//! [`capabilities`]; the simulated rig and mock devices in [`mock`] back the
//! whole stack for tests and dry runs.

pub mod capabilities;
pub mod mock;
