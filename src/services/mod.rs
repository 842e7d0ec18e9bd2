pub mod access;
pub mod cache;
pub mod metrics;
pub mod orchestrator;
pub mod provision_scheduler;
pub mod schools;
pub mod tenant_cache;
