use std::{error::Error, fmt};

const ERR_MSG_FIFO_FULL: &str = "fifo is full";
const ERR_MSG_FIFO_RELEASED: &str = "fifo is released";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

/// Why a fifo `put` did not complete.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Full,
    Released,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Full => write!(f, "{ERR_MSG_FIFO_FULL}"),
            SendFailReason::Released => write!(f, "{ERR_MSG_FIFO_RELEASED}"),
        }
    }
}

/// Failed `put`; gives the rejected value back to the caller.
#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn full(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Full,
        }
    }

    pub fn released(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Released,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Timeout,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvError {
    Timeout,
    Disconnected,
    Cancelled,
}

impl Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            RecvError::Disconnected => write!(f, "{ERR_MSG_FIFO_RELEASED}"),
            RecvError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
        }
    }
}

/// Domain faults the framework distinguishes.
///
/// `NotFound` and `Conflict` are deliberately absent: path-resolution
/// failures travel inside [`crate::tree::TreeResult`] records, never as
/// Rust errors.
#[derive(Debug, Clone)]
pub enum MatrixError {
    /// Missing or mistyped configuration key. Fatal at startup.
    Config(String),
    /// A transport or client could not be built (unregistered scheme,
    /// mixed factories, bind failure).
    Creation(String),
    /// An RPC or wait exceeded its deadline. Recoverable.
    Timeout(String),
    /// Send/recv failure on a socket.
    Transport(String),
    /// Unrecoverable state; the owning worker exits.
    Fatal(String),
}

impl MatrixError {
    pub fn config(msg: impl Into<String>) -> Self {
        MatrixError::Config(msg.into())
    }

    pub fn creation(msg: impl Into<String>) -> Self {
        MatrixError::Creation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        MatrixError::Timeout(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        MatrixError::Transport(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        MatrixError::Fatal(msg.into())
    }

    /// True for faults the caller may retry after resetting its socket.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MatrixError::Timeout(_) | MatrixError::Transport(_))
    }
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixError::Config(m) => write!(f, "configuration error: {m}"),
            MatrixError::Creation(m) => write!(f, "creation error: {m}"),
            MatrixError::Timeout(m) => write!(f, "timeout: {m}"),
            MatrixError::Transport(m) => write!(f, "transport error: {m}"),
            MatrixError::Fatal(m) => write!(f, "fatal: {m}"),
        }
    }
}

impl Error for MatrixError {}

impl From<zmq::Error> for MatrixError {
    fn from(e: zmq::Error) -> Self {
        match e {
            zmq::Error::EAGAIN => MatrixError::Timeout(e.to_string()),
            zmq::Error::ETERM => MatrixError::Fatal("Context was terminated".into()),
            _ => MatrixError::Transport(e.to_string()),
        }
    }
}
