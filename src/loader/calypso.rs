//! `CalypsoLoader`: drives the calypso-brand mask-ROM loader, which must be
//! woken by periodic beacons rather than sending an unsolicited prompt
//! (spec §4.5).

use std::path::PathBuf;
use std::time::Duration;

use log::{info, warn};

use crate::error::{CoreError, Result};
use crate::image::{ImageBuilder, UploadCursor, UploadImage};
use crate::mode::Mode;

use super::{LoaderAction, SerialIo};

/// `<p` parameter packet body the core always sends: baud nibble, DPLL,
/// mem-config, strobe/AF, UART timeout — all constant (spec §4.5).
const PARAM_PACKET: [u8; 11] = [0x3C, 0x70, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];

const ROMLOAD_ADDRESS: u32 = 0x0082_0000;
const BLOCK_HEADER_LEN: usize = 10;

const IDENT_BAUD: u32 = 19_200;
const UPLOAD_BAUD: u32 = 115_200;

const BEACON_INTERVAL: Duration = Duration::from_micros(50_000);
const NACK_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingIdentification,
    WaitingParamAck,
    SendingBlocks,
    WaitingBlockAck,
    SendingLastBlock,
    LastBlockSent,
    WaitingChecksumAck,
    WaitingBranchAck,
    Finished,
}

#[derive(Debug, Clone, Copy)]
enum Event {
    IdentAck,
    ParamAck(u16),
    ParamNack,
    BlockAck,
    BlockNack,
    ChecksumAck,
    ChecksumNack(u8),
    BranchAck,
    BranchNack,
}

struct Trailer {
    expect_param_ack: bool,
    need: usize,
    buf: Vec<u8>,
}

/// One 10-byte-header block ready to stream (spec §3 Block invariants,
/// §8's worked example).
struct Block {
    address: u32,
    payload: Vec<u8>,
    is_last: bool,
}

impl Block {
    fn build(index: u32, payload_size: usize, remaining: &[u8]) -> Block {
        let address = ROMLOAD_ADDRESS + index * payload_size as u32;
        let is_last = remaining.len() <= payload_size;
        let payload = if is_last {
            let mut p = remaining.to_vec();
            p.resize(payload_size, 0);
            p
        } else {
            remaining[..payload_size].to_vec()
        };
        Block { address, payload, is_last }
    }

    /// Header `3C 77 01 01 <len_be16> <addr_be32>` followed by the payload.
    /// The block-number nibble is hard-coded to `0x01` for every block
    /// (spec §4.5, §9): sending the true index hangs the target firmware.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&[0x3C, 0x77, 0x01, 0x01]);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.address.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Low byte of `!(5 + sum(bytes[5..]))` (spec §3, §8).
    fn checksum(&self) -> u8 {
        let bytes = self.to_bytes();
        let sum: u32 = 5 + bytes[5..].iter().map(|&b| b as u32).sum::<u32>();
        !(sum as u8)
    }
}

pub struct CalypsoLoader {
    image_path: PathBuf,
    state: State,
    rx_pair: [u8; 2],
    rx_len: usize,
    trailer: Option<Trailer>,
    image: Option<UploadImage>,
    image_offset: usize,
    payload_size: usize,
    block_index: u32,
    current_block: Option<Block>,
    block_cursor: UploadCursor,
    dl_checksum: u8,
}

impl CalypsoLoader {
    pub fn new(image_path: PathBuf) -> Self {
        CalypsoLoader {
            image_path,
            state: State::WaitingIdentification,
            rx_pair: [0; 2],
            rx_len: 0,
            trailer: None,
            image: None,
            image_offset: 0,
            payload_size: 0,
            block_index: 0,
            current_block: None,
            block_cursor: UploadCursor::new(BLOCK_HEADER_LEN + 512),
            dl_checksum: 0,
        }
    }

    pub fn is_handed_over(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    pub fn beacon_interval(&self) -> Duration {
        BEACON_INTERVAL
    }

    /// Writes `<i` if currently waiting for a romloader to wake up (spec
    /// §4.5's `WAITING_IDENTIFICATION | timer tick` row). No-op otherwise,
    /// since the beacon timer keeps ticking even once the handshake has
    /// moved on; the timer gets disarmed by the Orchestrator on `StartBeacon`
    /// / `StopBeacon` actions instead of here.
    pub fn on_beacon(&mut self, serial: &mut dyn SerialIo) -> Result<()> {
        if self.state == State::WaitingIdentification {
            match serial.write(b"<i") {
                Ok(_) => {}
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn on_rx_byte(&mut self, byte: u8, serial: &mut dyn SerialIo) -> Result<LoaderAction> {
        let event = match self.feed_byte(byte) {
            Some(e) => e,
            None => return Ok(LoaderAction::None),
        };
        self.handle_event(event, serial)
    }

    /// Drives one WRITE-readiness notification while a block is in flight
    /// (spec §4.5's `SENDING_BLOCKS`/`SENDING_LAST_BLOCK` writable rows).
    pub fn on_writable(&mut self, serial: &mut dyn SerialIo) -> Result<LoaderAction> {
        if !matches!(self.state, State::SendingBlocks | State::SendingLastBlock) {
            return Ok(LoaderAction::None);
        }
        let block = self.current_block.as_ref().expect("block present while sending");
        let bytes = block.to_bytes();

        if self.block_cursor.is_at_end(&bytes) {
            self.dl_checksum = self.dl_checksum.wrapping_add(!block.checksum());
            self.state = if self.state == State::SendingLastBlock {
                State::LastBlockSent
            } else {
                State::WaitingBlockAck
            };
            return Ok(LoaderAction::SetWriteInterest(false));
        }

        let chunk = self.block_cursor.next_chunk(&bytes);
        match serial.write(chunk) {
            Ok(n) => self.block_cursor.advance(n),
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(LoaderAction::None)
    }

    fn handle_event(&mut self, event: Event, serial: &mut dyn SerialIo) -> Result<LoaderAction> {
        match (self.state, event) {
            (State::WaitingIdentification, Event::IdentAck) => {
                match ImageBuilder::build(&self.image_path, Mode::Romload) {
                    Ok(image) => {
                        self.image = Some(image);
                        self.image_offset = 0;
                        serial.write(&PARAM_PACKET)?;
                        self.state = State::WaitingParamAck;
                        Ok(LoaderAction::None)
                    }
                    Err(e @ (CoreError::ImageTooLarge { .. } | CoreError::ImageReadShort { .. })) => {
                        warn!("aborting upload attempt: {e}");
                        Ok(LoaderAction::None)
                    }
                    Err(e) => Err(e),
                }
            }
            (State::WaitingParamAck, Event::ParamAck(advertised)) => {
                std::thread::sleep(BEACON_INTERVAL * 2);
                serial.set_baud(UPLOAD_BAUD)?;
                self.payload_size = advertised as usize - BLOCK_HEADER_LEN;
                self.block_index = 0;
                self.dl_checksum = 0;
                self.image_offset = 0;
                self.build_next_block();
                self.block_cursor = UploadCursor::new(BLOCK_HEADER_LEN + self.payload_size);
                info!("calypso param ack: block payload size {}", self.payload_size);
                Ok(LoaderAction::SetWriteInterest(true))
            }
            (State::WaitingParamAck, Event::ParamNack) => {
                let err = CoreError::ProtocolNack("calypso rejected parameter packet".to_string());
                warn!("{err}");
                Ok(self.restart_at_identification_baud(serial)?)
            }
            (State::WaitingBlockAck, Event::BlockAck) => {
                self.block_index += 1;
                self.build_next_block();
                Ok(LoaderAction::SetWriteInterest(true))
            }
            (State::LastBlockSent, Event::BlockAck) => {
                let checksum = !self.dl_checksum;
                let mut frame = vec![b'<', b'c'];
                frame.push(checksum);
                serial.write(&frame)?;
                self.state = State::WaitingChecksumAck;
                Ok(LoaderAction::None)
            }
            (State::WaitingBlockAck, Event::BlockNack) | (State::LastBlockSent, Event::BlockNack) => {
                let err = CoreError::ProtocolNack("target NACKed a block mid-stream".to_string());
                warn!("{err}; restarting identification");
                Ok(self.restart_at_identification_baud(serial)?)
            }
            (State::WaitingChecksumAck, Event::ChecksumAck) => {
                let mut frame = vec![b'<', b'b'];
                frame.extend_from_slice(&ROMLOAD_ADDRESS.to_be_bytes());
                serial.write(&frame)?;
                self.state = State::WaitingBranchAck;
                Ok(LoaderAction::None)
            }
            (State::WaitingChecksumAck, Event::ChecksumNack(target_checksum)) => {
                let err = CoreError::ProtocolNack(format!(
                    "target reports checksum 0x{target_checksum:02X}, expected 0x{:02X}",
                    !self.dl_checksum
                ));
                warn!("{err}");
                Ok(self.restart_at_identification_baud(serial)?)
            }
            (State::WaitingBranchAck, Event::BranchAck) => {
                info!("target branched into image, becoming a link-mux endpoint");
                self.state = State::Finished;
                Ok(LoaderAction::Handover)
            }
            (State::WaitingBranchAck, Event::BranchNack) => {
                let err = CoreError::ProtocolNack("target NACKed the branch address".to_string());
                warn!("{err}");
                Ok(self.restart_at_identification_baud(serial)?)
            }
            _ => Ok(LoaderAction::None),
        }
    }

    /// Settles, drops back to the 19200-baud identification rate, and
    /// restarts the beacon (spec §4.5's nack rows all converge here).
    fn restart_at_identification_baud(&mut self, serial: &mut dyn SerialIo) -> Result<LoaderAction> {
        std::thread::sleep(NACK_SETTLE);
        serial.set_baud(IDENT_BAUD)?;
        self.reset_to_identification();
        Ok(LoaderAction::StartBeacon)
    }

    fn reset_to_identification(&mut self) {
        self.state = State::WaitingIdentification;
        self.image = None;
        self.current_block = None;
        self.trailer = None;
        self.rx_len = 0;
    }

    fn build_next_block(&mut self) {
        let image = self.image.as_ref().expect("image present while building blocks");
        let remaining = &image.as_bytes()[self.image_offset..];
        let block = Block::build(self.block_index, self.payload_size, remaining);
        self.image_offset += block.payload.len().min(remaining.len());
        self.state = if block.is_last {
            State::SendingLastBlock
        } else {
            State::SendingBlocks
        };
        self.block_cursor.rewind();
        self.current_block = Some(block);
    }

    /// Rolling 2-byte prefix matcher, extended with a per-prefix trailer
    /// read for the acks that carry a trailing value (spec §4.5's
    /// per-state receive-length table, realized here as a per-prefix
    /// trailer length since the trailer length is fully determined by
    /// which 2-byte ack was just matched).
    fn feed_byte(&mut self, byte: u8) -> Option<Event> {
        if let Some(trailer) = &mut self.trailer {
            trailer.buf.push(byte);
            if trailer.buf.len() < trailer.need {
                return None;
            }
            let t = self.trailer.take().unwrap();
            return Some(if t.expect_param_ack {
                Event::ParamAck(u16::from_le_bytes([t.buf[0], t.buf[1]]))
            } else {
                Event::ChecksumNack(t.buf[0])
            });
        }

        if self.rx_len == 2 {
            self.rx_pair[0] = self.rx_pair[1];
            self.rx_len = 1;
        }
        self.rx_pair[self.rx_len] = byte;
        self.rx_len += 1;
        if self.rx_len < 2 {
            return None;
        }

        let event = match &self.rx_pair {
            b">i" => Some(Event::IdentAck),
            b">P" => Some(Event::ParamNack),
            b">p" => {
                self.trailer = Some(Trailer { expect_param_ack: true, need: 2, buf: Vec::new() });
                None
            }
            b">w" => Some(Event::BlockAck),
            b">W" => Some(Event::BlockNack),
            b">c" => Some(Event::ChecksumAck),
            b">C" => {
                self.trailer = Some(Trailer { expect_param_ack: false, need: 1, buf: Vec::new() });
                None
            }
            b">b" => Some(Event::BranchAck),
            b">B" => Some(Event::BranchNack),
            _ => None,
        };

        if event.is_some() || self.trailer.is_some() {
            self.rx_len = 0;
        }
        event
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(bytes: &[u8]) -> (tempfile::NamedTempFile, PathBuf) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        let path = f.path().to_path_buf();
        (f, path)
    }

    struct FakeSerial {
        written: Vec<u8>,
        baud: u32,
    }

    impl SerialIo for FakeSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn set_baud(&mut self, rate: u32) -> std::io::Result<()> {
            self.baud = rate;
            Ok(())
        }
    }

    fn feed(loader: &mut CalypsoLoader, bytes: &[u8], serial: &mut FakeSerial) -> LoaderAction {
        let mut last = LoaderAction::None;
        for &b in bytes {
            last = loader.on_rx_byte(b, serial).unwrap();
        }
        last
    }

    #[test]
    fn block_address_and_checksum_match_worked_example() {
        // spec §8 scenario 3's worked example: advertised size 0x020A.
        let block = Block::build(0, 0x020A - BLOCK_HEADER_LEN, &[0u8; 0x0200]);
        assert_eq!(block.address, ROMLOAD_ADDRESS);
        assert_eq!(&block.to_bytes()[..10], &[0x3C, 0x77, 0x01, 0x01, 0x02, 0x00, 0x00, 0x82, 0x00, 0x00]);
    }

    #[test]
    fn happy_path_through_branch_ack() {
        let (_f, path) = write_temp(&[0xCD; 600]);
        let mut loader = CalypsoLoader::new(path);
        let mut serial = FakeSerial { written: Vec::new(), baud: IDENT_BAUD };

        let action = feed(&mut loader, b">i", &mut serial);
        assert_eq!(action, LoaderAction::None);
        assert_eq!(serial.written, PARAM_PACKET.to_vec());

        serial.written.clear();
        let action = feed(&mut loader, &[b'>', b'p', 0x0A, 0x02], &mut serial);
        assert_eq!(action, LoaderAction::SetWriteInterest(true));
        assert_eq!(loader.payload_size, 0x020A - BLOCK_HEADER_LEN);
        assert_eq!(serial.baud, UPLOAD_BAUD);

        // Drive every block to completion via on_writable + >w acks.
        loop {
            loop {
                let a = loader.on_writable(&mut serial).unwrap();
                if a == LoaderAction::SetWriteInterest(false) {
                    break;
                }
            }
            if loader.state == State::LastBlockSent {
                break;
            }
            let action = feed(&mut loader, b">w", &mut serial);
            assert_eq!(action, LoaderAction::SetWriteInterest(true));
        }

        let action = feed(&mut loader, b">w", &mut serial);
        assert_eq!(action, LoaderAction::None);
        assert_eq!(loader.state, State::WaitingChecksumAck);

        let action = feed(&mut loader, b">c", &mut serial);
        assert_eq!(action, LoaderAction::None);
        assert_eq!(loader.state, State::WaitingBranchAck);

        let action = feed(&mut loader, b">b", &mut serial);
        assert_eq!(action, LoaderAction::Handover);
        assert!(loader.is_handed_over());
    }

    #[test]
    fn block_nack_resets_to_identification_and_restarts_beacon() {
        let (_f, path) = write_temp(&[0u8; 100]);
        let mut loader = CalypsoLoader::new(path);
        let mut serial = FakeSerial { written: Vec::new(), baud: IDENT_BAUD };
        feed(&mut loader, b">i", &mut serial);
        feed(&mut loader, &[b'>', b'p', 0x0A, 0x02], &mut serial);
        loop {
            let a = loader.on_writable(&mut serial).unwrap();
            if a == LoaderAction::SetWriteInterest(false) {
                break;
            }
        }

        let action = feed(&mut loader, b">W", &mut serial);
        assert_eq!(action, LoaderAction::StartBeacon);
        assert_eq!(loader.state, State::WaitingIdentification);
        assert!(loader.image.is_none());
        assert_eq!(serial.baud, IDENT_BAUD);
    }
}
