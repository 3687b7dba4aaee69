//! Error types shared by the backend clients and the control channel

/// Failure of an inbound read (latest metric, registry poll)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Network failure: {0}")]
    NetworkFailure(String),
    #[error("Unexpected HTTP status: {0}")]
    BadStatus(u16),
    #[error("Malformed response body: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::BadStatus(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::NetworkFailure(e.to_string())
        }
    }
}

/// Failure of a registry poll; the fleet is left untouched in every case
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry rejected credentials (401)")]
    Unauthorized,
    #[error("Registry poll failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("Device agent {0} is no longer running")]
    AgentGone(i64),
}
