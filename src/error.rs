use thiserror::Error;

/// Failures that can occur while turning a raw proxy link into something we
/// can actually probe. The distinction between the two variants matters to
/// callers: a malformed link just means a dead key, while an unsupported
/// protocol is a configuration problem worth surfacing loudly.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed proxy link: {0}")]
    Malformed(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Errors raised while driving a relay (xray-core) subprocess through its
/// lifecycle.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no xray-core binary available: {0}")]
    BinaryUnavailable(String),

    #[error("relay process exited immediately: {0}")]
    StartupFailed(String),

    #[error("no free SOCKS port available")]
    PortPoolExhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
