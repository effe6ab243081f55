pub mod backoff;
pub mod executor;
pub mod rate_limit;
pub mod store;
