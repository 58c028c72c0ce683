//! Upload `Mode`: selects loader dialect and image shape (spec §3, §6).

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lower")]
pub enum Mode {
    C123,
    C123xor,
    C140,
    C140xor,
    C155,
    Romload,
}

impl Mode {
    /// Fixed 4-byte header inserted between the length prefix and payload.
    /// `Romload` images carry no header (spec §3).
    pub const fn header(self) -> Option<[u8; 4]> {
        match self {
            Mode::C123 | Mode::C123xor | Mode::C140 | Mode::C140xor => {
                Some([0xEE, 0x4C, 0x9F, 0x63])
            }
            Mode::C155 => Some([0x78, 0x47, 0xC0, 0x46]),
            Mode::Romload => None,
        }
    }

    /// Variants where the compal ramloader expects a `0x02` XOR seed as the
    /// first transmitted byte (spec §4.4, DOWNLOADING state).
    pub const fn uses_xor_seed(self) -> bool {
        matches!(self, Mode::C155 | Mode::C123xor)
    }

    /// C140 variants pad the image so the "1003" magic lands at 0x3BE2.
    pub const fn is_c140(self) -> bool {
        matches!(self, Mode::C140 | Mode::C140xor)
    }

    pub const fn is_romload(self) -> bool {
        matches!(self, Mode::Romload)
    }

    /// Whether this mode drives the compal ramloader dialect or the
    /// calypso romloader dialect.
    pub const fn dialect(self) -> Dialect {
        if self.is_romload() {
            Dialect::Calypso
        } else {
            Dialect::Compal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Compal,
    Calypso,
}
