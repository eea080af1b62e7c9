pub mod client;
pub mod confirm;
pub mod consumer;
pub mod error;
pub mod queue;
