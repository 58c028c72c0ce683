//! `SerialPort`: opens a UART, sets raw mode and baud rate, and exposes
//! non-blocking byte I/O (spec §4.1).

use std::io::{self, Read, Write};
use std::path::Path;

use log::debug;
use mio_serial::{DataBits, FlowControl, Parity, SerialPort as _, SerialStream, StopBits};

use crate::error::{CoreError, Result};

/// Baud the calypso loader starts at before `>p` bumps it (spec §4.5).
pub const CALYPSO_INIT_BAUD: u32 = 19_200;
/// Baud both loaders run at once the handshake completes.
pub const HANDOVER_BAUD: u32 = 115_200;

pub struct SerialPort {
    stream: SerialStream,
}

impl SerialPort {
    /// Opens `path` non-blocking, 8N1, no parity, no flow control, DTR+RTS
    /// asserted, both directions at 115200 baud. Any failure here is fatal
    /// (spec §4.1, §7 `IoOpen`).
    pub fn open(path: &Path) -> Result<Self> {
        let path_str = path.to_string_lossy();
        let mut stream = mio_serial::new(path_str.as_ref(), HANDOVER_BAUD)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| CoreError::IoOpen {
                what: format!("serial port {path:?}"),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?;

        stream
            .write_data_terminal_ready(true)
            .and_then(|()| stream.write_request_to_send(true))
            .map_err(|e| CoreError::IoOpen {
                what: format!("asserting DTR/RTS on {path:?}"),
                source: e,
            })?;

        debug!("opened {path:?} at {HANDOVER_BAUD} baud, raw 8N1, DTR+RTS asserted");
        Ok(SerialPort { stream })
    }

    /// Changes both input and output baud without flushing (spec §4.1).
    /// The two rates the core ever requests are [`CALYPSO_INIT_BAUD`] and
    /// [`HANDOVER_BAUD`].
    pub fn set_baud(&mut self, rate: u32) -> io::Result<()> {
        self.stream.set_baud_rate(rate)
    }

    /// Non-blocking read. `Ok(0)` is EOF and is fatal to normal operation
    /// (spec §4.1, §7 `SerialEof`); `WouldBlock` means "nothing to read
    /// right now, return to the event loop."
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Non-blocking write. Partial writes are expected; the caller's
    /// `UploadCursor` accounts for them.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    pub fn as_source(&mut self) -> &mut SerialStream {
        &mut self.stream
    }
}
