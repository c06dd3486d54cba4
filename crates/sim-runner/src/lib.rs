//! Owns the simulated cluster for one workload run: builds the configured
//! number of index client instances, drives a Zipf-sampled read/write
//! stream through them, and emits the resulting CSV reports.

pub mod workload;

pub use workload::{SimError, WorkloadReport, WorkloadRunner};
