use thiserror::Error;

/// Unified error type for the modem proxy pool
#[derive(Error, Debug)]
pub enum RotaError {
    // Hardware errors
    #[error("Modem error on {interface}: {message}")]
    Hardware { interface: String, message: String },

    // Session errors
    #[error("Cannot resolve upstream: {0}")]
    CannotResolveUpstream(String),

    #[error("Cannot connect upstream: {0}")]
    CannotConnect(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    // Pool errors
    #[error("Proxy instance not found: {id}")]
    InstanceNotFound { id: u32 },

    #[error("Proxy instance {id} is not bound to an interface")]
    InstanceUnbound { id: u32 },

    // Startup errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to bind control listener: {0}")]
    ControlBind(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Operation timed out")]
    Timeout,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, RotaError>;

/// Coarse error category, used as a log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Hardware,
    Session,
    Pool,
    Startup,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Hardware => "hardware",
            ErrorKind::Session => "session",
            ErrorKind::Pool => "pool",
            ErrorKind::Startup => "startup",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RotaError {
    /// Build a hardware error for the given interface
    pub fn hardware(interface: impl Into<String>, message: impl ToString) -> Self {
        RotaError::Hardware {
            interface: interface.into(),
            message: message.to_string(),
        }
    }

    /// Get the category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RotaError::Hardware { .. } => ErrorKind::Hardware,

            RotaError::CannotResolveUpstream(_)
            | RotaError::CannotConnect(_)
            | RotaError::MalformedRequest(_)
            | RotaError::Io(_)
            | RotaError::Timeout => ErrorKind::Session,

            RotaError::InstanceNotFound { .. } | RotaError::InstanceUnbound { .. } => {
                ErrorKind::Pool
            }

            RotaError::InvalidConfig(_) | RotaError::ControlBind(_) => ErrorKind::Startup,

            RotaError::Http(_) | RotaError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only a failure to bind the control plane stops the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, RotaError::ControlBind(_))
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RotaError {
    fn from(err: hyper::Error) -> Self {
        RotaError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotaError {
    fn from(err: url::ParseError) -> Self {
        RotaError::InvalidConfig(err.to_string())
    }
}
