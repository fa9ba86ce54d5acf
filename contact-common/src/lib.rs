pub mod contact;
pub mod event;
pub mod metrics;
pub mod retry;
pub mod routing;
pub mod transform;
pub mod vendor;
