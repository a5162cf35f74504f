//! Error taxonomy for the gateway core (see spec.md §7).
//!
//! Every worker thread catches at this boundary and logs-and-continues;
//! errors never propagate across a thread join.

use thiserror::Error;

/// Top level error returned by core operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transient or fatal I/O on a physical interface.
    #[error("i/o error on transport {interface}: {source}")]
    Io {
        interface: String,
        #[source]
        source: std::io::Error,
    },
    /// The wire protocol was violated (bad CRC, unexpected frame, etc).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The device appears desynchronized (garbage/oversized frames) and
    /// the transport must be closed and reopened.
    #[error("transport desynchronized, reopening: {0}")]
    Desync(String),
    /// A queue exhausted its retry budget without an ACK.
    #[error("queue exhausted retries for address 0x{address:06x}")]
    QueueExhausted { address: u32 },
    /// A serial radio reported the 1% duty-cycle limit (LOVF).
    #[error("duty cycle limit reached on {interface}")]
    DutyCycleLimit { interface: String },
    /// A timed lock (e.g. the SPI TX mutex) could not be acquired in time.
    #[error("timed out acquiring lock: {0}")]
    LockTimeout(&'static str),
    /// The AES handshake engine rejected a frame.
    #[error(transparent)]
    Aes(#[from] AesError),
}

/// Errors specific to the three-frame AES handshake (spec.md §4.B).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AesError {
    #[error("no m-frame stored for destination 0x{0:06x}")]
    NoMFrame(u32),
    #[error("no handshake in progress for sender 0x{0:06x}")]
    NoHandshake(u32),
    #[error("signature verification failed")]
    BadSignature,
    #[error("key index {given} does not match current index {current} or old index {current}-1")]
    WrongKeyIndex { given: u8, current: u8 },
}

/// Errors specific to a single physical transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not open")]
    NotOpen,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("spi/gpio error: {0}")]
    Hardware(String),
}
