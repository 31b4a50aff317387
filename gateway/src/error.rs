use thiserror::Error;

/// Error kinds a listener's `setup()` or a protocol engine's request path can
/// surface. Initialization failures are caught by the caller and turned
/// into a disabled [`crate::listener::ListenerHandle`]; they never
/// propagate into the fusion controller or `main`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("CAN interface {0} unavailable: {1}")]
    CanUnavailable(String, String),

    #[error("serial device {0} unavailable: {1}")]
    SerialUnavailable(String, String),

    #[error("bus topic registry unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("protocol negative response: {0}")]
    ProtocolNegative(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("failed to load route: {0}")]
    RouteLoad(String),
}
