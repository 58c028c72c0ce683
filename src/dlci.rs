//! DLCI: an 8-bit subchannel tag within the link multiplexer (spec §3, §6).

use std::fmt;

/// A Data Link Connection Identifier. Reserved values are pinned to the
/// constants below; any other byte value is a legal DLCI as far as the
/// core is concerned (it just won't have a tool server registered on it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dlci(pub u8);

impl Dlci {
    /// Raw console byte stream; payload goes straight to stdout.
    pub const CONSOLE: Dlci = Dlci(0x00);
    /// Debug trace output from the target.
    pub const DEBUG: Dlci = Dlci(0x01);
    /// Layer1/Layer2-3 tool channel, exported via the `-s` socket.
    pub const L1A_L23: Dlci = Dlci(0x02);
    /// Loader tool channel, exported via the `-l` socket.
    pub const LOADER: Dlci = Dlci(0x03);

    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Dlci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Dlci::CONSOLE => "CONSOLE",
            Dlci::DEBUG => "DEBUG",
            Dlci::L1A_L23 => "L1A_L23",
            Dlci::LOADER => "LOADER",
            _ => return write!(f, "DLCI({})", self.0),
        };
        f.write_str(name)
    }
}
