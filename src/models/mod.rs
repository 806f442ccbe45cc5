// Data models for the backend wire format

pub mod envelope;

pub use envelope::{ErrorEnvelope, ResponseEnvelope};
