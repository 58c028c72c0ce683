//! `CompalLoader`: drives the compal-brand ramloader handshake, then
//! streams a prepared `UploadImage` (spec §4.4).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use log::{info, warn};

use crate::error::{CoreError, Result};
use crate::image::{ImageBuilder, UploadCursor, UploadImage};
use crate::mode::Mode;

use super::{LoaderAction, SerialIo};

const PROMPT1: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x01, 0x40];
const DNLOAD_CMD: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x52, 0x01, 0x53];
const PROMPT2: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x02, 0x43];
const ACK: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x03, 0x42];
const NACK: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x45, 0x53, 0x16];
const MAGIC_NACK: [u8; 7] = [0x1B, 0xF6, 0x02, 0x00, 0x41, 0x03, 0x57];
const FTMTOOL: [u8; 7] = *b"ftmtool";

const UPLOAD_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingPrompt1,
    WaitingPrompt2,
    Downloading,
    HandedOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Prompt1,
    Prompt2,
    Ack,
    Nack,
    MagicNack,
    Ftmtool,
}

pub struct CompalLoader {
    image_path: PathBuf,
    mode: Mode,
    state: State,
    window: VecDeque<u8>,
    image: Option<UploadImage>,
    cursor: UploadCursor,
    seed_sent: bool,
}

impl CompalLoader {
    pub fn new(image_path: PathBuf, mode: Mode) -> Self {
        CompalLoader {
            image_path,
            mode,
            state: State::WaitingPrompt1,
            window: VecDeque::with_capacity(7),
            image: None,
            cursor: UploadCursor::new(UPLOAD_CHUNK),
            seed_sent: false,
        }
    }

    pub fn is_handed_over(&self) -> bool {
        matches!(self.state, State::HandedOver)
    }

    /// Pushes one received byte into the 7-byte rolling window and, on a
    /// literal match, applies the matching state transition (spec §4.4).
    pub fn on_rx_byte(&mut self, byte: u8, serial: &mut dyn SerialIo) -> Result<LoaderAction> {
        let event = match self.push_window(byte) {
            Some(e) => e,
            None => return Ok(LoaderAction::None),
        };

        match (self.state, event) {
            (State::WaitingPrompt1, Event::Prompt1) => {
                match ImageBuilder::build(&self.image_path, self.mode) {
                    Ok(image) => {
                        self.image = Some(image);
                        self.cursor = UploadCursor::new(UPLOAD_CHUNK);
                        self.seed_sent = false;
                        serial.write(&DNLOAD_CMD)?;
                        self.state = State::WaitingPrompt2;
                        Ok(LoaderAction::None)
                    }
                    // Abort just this attempt; the loader stays in its
                    // initial state and waits for the target to retry
                    // (spec §7 `ImageTooLarge`/`ImageReadShort`).
                    Err(e @ (CoreError::ImageTooLarge { .. } | CoreError::ImageReadShort { .. })) => {
                        warn!("aborting upload attempt: {e}");
                        self.rollback();
                        Ok(LoaderAction::None)
                    }
                    Err(e) => Err(e),
                }
            }
            (State::WaitingPrompt2, Event::Prompt2) => {
                self.state = State::Downloading;
                Ok(LoaderAction::SetWriteInterest(true))
            }
            (_, Event::Ack) => {
                info!("target ACKed image, becoming a link-mux endpoint");
                self.state = State::HandedOver;
                Ok(LoaderAction::Handover)
            }
            (_, Event::Nack) | (_, Event::MagicNack) | (_, Event::Ftmtool) => {
                let err = CoreError::ProtocolNack(format!("{:?}", event));
                warn!("{err}; rolling back to WAITING_PROMPT1");
                self.rollback();
                Ok(LoaderAction::SetWriteInterest(false))
            }
            _ => Ok(LoaderAction::None),
        }
    }

    /// Drives one WRITE-readiness notification while `DOWNLOADING` (spec
    /// §4.4's writable rows). No-op in any other state.
    pub fn on_writable(&mut self, serial: &mut dyn SerialIo) -> Result<LoaderAction> {
        if self.state != State::Downloading {
            return Ok(LoaderAction::None);
        }
        let image = self.image.as_ref().expect("image present while downloading");

        if self.cursor.is_at_start() && !self.seed_sent {
            if self.mode.uses_xor_seed() {
                match serial.write(&[0x02]) {
                    Ok(n) if n > 0 => self.seed_sent = true,
                    Ok(_) => {}
                    Err(e) if would_block(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                self.seed_sent = true;
                std::thread::sleep(Duration::from_micros(1));
            }
            return Ok(LoaderAction::None);
        }

        if !self.cursor.is_at_end(image.as_bytes()) {
            let chunk = self.cursor.next_chunk(image.as_bytes());
            match serial.write(chunk) {
                Ok(n) => self.cursor.advance(n),
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(LoaderAction::None);
        }

        self.state = State::WaitingPrompt1;
        Ok(LoaderAction::SetWriteInterest(false))
    }

    fn rollback(&mut self) {
        self.cursor.rewind();
        self.image = None;
        self.seed_sent = false;
        self.state = State::WaitingPrompt1;
    }

    fn push_window(&mut self, byte: u8) -> Option<Event> {
        self.window.push_back(byte);
        if self.window.len() > 7 {
            self.window.pop_front();
        }
        if self.window.len() < 7 {
            return None;
        }

        let w: Vec<u8> = self.window.iter().copied().collect();
        let event = if w == PROMPT1 {
            Some(Event::Prompt1)
        } else if w == PROMPT2 {
            Some(Event::Prompt2)
        } else if w == ACK {
            Some(Event::Ack)
        } else if w == NACK {
            Some(Event::Nack)
        } else if w == MAGIC_NACK {
            Some(Event::MagicNack)
        } else if w == FTMTOOL {
            Some(Event::Ftmtool)
        } else {
            None
        };

        if event.is_some() {
            self.window.clear();
        }
        event
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}
