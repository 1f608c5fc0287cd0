//! Outbound webhook delivery: wire format, executor, worker pool.

pub mod executor;
pub mod payload;
pub mod worker;

pub use executor::{DeliverySettings, JobResolution, ReqwestTransport, WebhookTransport};
pub use worker::spawn_delivery_workers;
