use thiserror::Error;

/// Crate wide error taxonomy.
///
/// `Connection` and `Protocol` are the two wire-level classes: the first is
/// retried transparently on the next use of the endpoint, the second means the
/// device answered with a modbus exception and the register in question must
/// not be asked again until a re-probe.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("writes are disabled by configuration")]
    WriteNotPermitted,

    #[error("unknown register: {0}")]
    UnknownRegister(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that mark the whole endpoint as unhealthy, as opposed
    /// to a rejection of one specific request.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
