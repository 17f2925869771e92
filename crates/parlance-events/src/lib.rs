pub mod deliverer;
pub mod error;
pub mod producer;
pub mod webhook;

pub use deliverer::{DelivererConfig, EventDeliverer};
pub use error::EventsError;
pub use producer::EventProducer;
pub use webhook::WebhookFanout;
