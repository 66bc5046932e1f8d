pub mod client;
pub mod timing;

pub use client::{probe, ProbeOptions, ProbeRequest, ProbeResponse};
pub use timing::PhaseTimings;
