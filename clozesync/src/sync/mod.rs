pub mod backoff;
pub mod claims;
#[cfg(test)]
pub(crate) mod fake_store;
mod file_job;
pub mod fingerprint;
pub mod orchestrator;
pub mod orphan;
pub mod paths;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod report;
pub mod store;
pub mod writeback;
