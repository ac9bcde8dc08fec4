pub mod cache;
pub mod metrics;
pub mod retry;
