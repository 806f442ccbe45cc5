use serde::{Deserialize, Serialize};

/// Uniform `{message, data}` body returned by every backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub message: String,
    pub data: T,
}

/// Failure body; only `message` is meaningful
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
}
