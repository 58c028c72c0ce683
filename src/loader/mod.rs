//! The two upload-protocol dialects (spec §4.4, §4.5), unified behind one
//! enum the Orchestrator drives without caring which dialect is active.

pub mod calypso;
pub mod compal;

pub use calypso::CalypsoLoader;
pub use compal::CompalLoader;

use std::io;
use std::path::PathBuf;

use crate::mode::{Dialect, Mode};

/// The active loader's control-flow response to an event, telling the
/// Orchestrator what shared resources (WRITE interest, the beacon timer)
/// need to change. Keeps the state machines themselves free of `EventLoop`
/// and `TimerFd` types (spec §9: "model as discriminated unions").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderAction {
    /// Nothing external needs to change.
    None,
    /// Enable or disable WRITE interest on the UART.
    SetWriteInterest(bool),
    /// (Re)start the periodic beacon timer (calypso only).
    StartBeacon,
    /// Stop the periodic beacon timer (calypso only).
    StopBeacon,
    /// The upload finished; the UART now carries link-mux frames only.
    Handover,
}

/// The narrow UART surface a loader state machine needs: writing bytes and
/// changing the baud rate. Letting loaders depend on this instead of the
/// concrete `SerialPort` keeps them unit-testable with an in-memory fake.
pub trait SerialIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn set_baud(&mut self, rate: u32) -> io::Result<()>;
}

impl SerialIo for crate::serial::SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        crate::serial::SerialPort::write(self, buf)
    }

    fn set_baud(&mut self, rate: u32) -> io::Result<()> {
        crate::serial::SerialPort::set_baud(self, rate)
    }
}

/// Either dialect, selected once at startup from `Mode` (spec §4.8).
pub enum Loader {
    Compal(CompalLoader),
    Calypso(CalypsoLoader),
}

impl Loader {
    pub fn new(mode: Mode, image_path: PathBuf) -> Self {
        match mode.dialect() {
            Dialect::Compal => Loader::Compal(CompalLoader::new(image_path, mode)),
            Dialect::Calypso => Loader::Calypso(CalypsoLoader::new(image_path)),
        }
    }

    pub fn is_handed_over(&self) -> bool {
        match self {
            Loader::Compal(l) => l.is_handed_over(),
            Loader::Calypso(l) => l.is_handed_over(),
        }
    }

    pub fn on_rx_byte(&mut self, byte: u8, serial: &mut dyn SerialIo) -> crate::error::Result<LoaderAction> {
        match self {
            Loader::Compal(l) => l.on_rx_byte(byte, serial),
            Loader::Calypso(l) => l.on_rx_byte(byte, serial),
        }
    }

    pub fn on_writable(&mut self, serial: &mut dyn SerialIo) -> crate::error::Result<LoaderAction> {
        match self {
            Loader::Compal(l) => l.on_writable(serial),
            Loader::Calypso(l) => l.on_writable(serial),
        }
    }

    /// Beacon tick; only the calypso dialect does anything with it.
    pub fn on_beacon(&mut self, serial: &mut dyn SerialIo) -> crate::error::Result<()> {
        match self {
            Loader::Compal(_) => Ok(()),
            Loader::Calypso(l) => l.on_beacon(serial),
        }
    }

    /// `Some` only for the calypso dialect, which alone uses the beacon
    /// timer (spec §4.5).
    pub fn beacon_interval(&self) -> Option<std::time::Duration> {
        match self {
            Loader::Compal(_) => None,
            Loader::Calypso(l) => Some(l.beacon_interval()),
        }
    }
}
