//! Error kinds and their exit-code policy (spec §7).

use std::io;
use std::path::PathBuf;

/// Every failure mode the core can report, matching spec §7's taxonomy.
///
/// Variants carry enough context to log a useful message at the call site;
/// `main` maps each one to the exit code §6/§7 assigns it.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad flag, bad mode name, or a missing/oversized image path. Exit 2.
    #[error("configuration error: {0}")]
    Config(String),

    /// UART or socket open/bind/listen failure. Fatal, exit 1.
    #[error("failed to open {what}: {source}")]
    IoOpen {
        what: String,
        #[source]
        source: io::Error,
    },

    /// Image file exceeds the 64 KiB + header budget (spec §3, §6).
    #[error("image {path:?} is {len} bytes, exceeding the 65535-byte cap")]
    ImageTooLarge { path: PathBuf, len: u64 },

    /// Image file vanished or shrank between stat and read.
    #[error("short read of image {path:?}: expected {expected} bytes, got {actual}")]
    ImageReadShort {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    /// Target rejected the upload (`>W`, `>C`, `>B`, compal NACK/MAGIC_NACK/FTMTOOL).
    #[error("protocol nack: {0}")]
    ProtocolNack(String),

    /// A tool socket session failed; the server and other sessions continue.
    #[error("tool session I/O error on {dlci:?}: {source}")]
    SessionIo {
        dlci: crate::dlci::Dlci,
        #[source]
        source: io::Error,
    },

    /// Zero-byte read from the UART. Fatal, exit 2.
    #[error("serial port reached EOF")]
    SerialEof,

    /// Any other I/O failure not covered above (e.g. a mid-stream UART
    /// write failure that is not itself a protocol nack). The core has no
    /// recovery path for this beyond the process-fatal ones above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Process exit codes per spec §6: 2 on usage error or UART EOF, 1 on fatal
/// initialization error, 0 never in normal operation.
impl CoreError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Config(_) | CoreError::SerialEof => 2,
            CoreError::IoOpen { .. } | CoreError::Io(_) => 1,
            // These are recoverable at the orchestrator level and are never
            // allowed to propagate out of `run()`; listed for completeness.
            CoreError::ImageTooLarge { .. }
            | CoreError::ImageReadShort { .. }
            | CoreError::ProtocolNack(_)
            | CoreError::SessionIo { .. } => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
