pub mod message_dto;

/// Flat key-value body of every bus message.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
