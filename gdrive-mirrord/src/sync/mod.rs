pub mod backoff;
pub mod engine;
pub mod events;
pub mod files;
pub mod paths;
pub mod persist;
pub mod queue;
pub mod quota;
pub mod transfer;
pub mod transform;
