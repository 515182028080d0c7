//! time driver: section loop, time transformation, parameter addressing
//! and solution recording
pub mod parameters;
pub mod recorder;
pub mod simulator_api;
