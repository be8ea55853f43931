use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("site token not found")]
    InvalidSiteToken,
    #[error("zone token not found")]
    InvalidZoneToken,
    #[error("device token not found")]
    InvalidDeviceToken,
    #[error("device assignment token not found")]
    InvalidAssignmentToken,
    #[error("device specification token not found")]
    InvalidSpecificationToken,
    #[error("device command token not found")]
    InvalidCommandToken,
    #[error("device group token not found")]
    InvalidGroupToken,
    #[error("device network token not found")]
    InvalidNetworkToken,
    #[error("batch operation token not found")]
    InvalidBatchToken,
    #[error("event id is not in the expected format")]
    InvalidEventId,
    #[error("token '{0}' is already in use")]
    TokenInUse(String),
    #[error("device is already assigned")]
    DeviceAlreadyAssigned,
    #[error("event buffer is closed")]
    BufferClosed,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for StoreError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
