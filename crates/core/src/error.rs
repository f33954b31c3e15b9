/// Result alias that carries the custom [`LedRouterError`] type.
pub type Result<T> = std::result::Result<T, LedRouterError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LedRouterError {
    /// A submitted frame does not fit the device it targets. The slot keeps
    /// whatever valid frame it held before.
    #[error("malformed frame from `{module_id}` for `{device_id}`: {reason}")]
    MalformedFrame {
        module_id: String,
        device_id: String,
        reason: String,
    },
    /// The frame or pin names a device the registry does not know.
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
    /// Device definition violates a registration precondition.
    #[error("invalid device `{device_id}`: {reason}")]
    InvalidDevice { device_id: String, reason: String },
    /// Module capability declaration violates a registration precondition.
    #[error("invalid capability for module `{module_id}`: {reason}")]
    InvalidCapability { module_id: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A shared lock was poisoned by a panicking writer.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// Free-form message, mostly surfaced by the command line front end.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LedRouterError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn malformed(
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedFrame {
            module_id: module_id.into(),
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<&str> for LedRouterError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LedRouterError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure reported by a transport sink. Never fatal for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum TransportError {
    #[error("device `{0}` is unreachable")]
    Unreachable(String),
    #[error("transport io error: {0}")]
    Io(String),
    #[error("frame could not be encoded: {0}")]
    Encode(String),
    #[error("transport has been closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
