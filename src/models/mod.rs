pub mod event;
pub mod metrics;
pub mod request;
pub mod threat;
