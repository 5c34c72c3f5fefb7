//! Registry error types

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Identity is already registered
    DuplicateIdentity(String),
    /// Identity is empty, too long or contains control characters
    InvalidIdentity(String),
    /// No connection with this identity
    NotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateIdentity(identity) => {
                write!(f, "Identity already registered: {}", identity)
            }
            RegistryError::InvalidIdentity(identity) => {
                write!(f, "Invalid identity: {:?}", identity)
            }
            RegistryError::NotFound(identity) => write!(f, "Connection not found: {}", identity),
        }
    }
}

impl std::error::Error for RegistryError {}
