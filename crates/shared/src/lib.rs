pub mod body;
pub mod domain;
pub mod error;
pub mod message;
pub mod protocol;
pub mod serde_b64;
