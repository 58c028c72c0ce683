//! `Orchestrator`: owns every long-lived resource and drives the event loop
//! forever, selecting the upload dialect from `Mode` and handing off to the
//! link multiplexer once the loader reports `Handover` (spec §4.8).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, warn};
use mio::{Interest, Token};
use nix::sys::timerfd::TimerFd;

use crate::config::Config;
use crate::dlci::Dlci;
use crate::error::{CoreError, Result};
use crate::event_loop::EventLoop;
use crate::linkmux::{self, LinkMux};
use crate::loader::{Loader, LoaderAction, SerialIo};
use crate::serial::SerialPort;
use crate::toolserver::ToolServer;

/// Poll timeout when nothing else bounds it: bounds how stale a
/// just-registered interest change can be before the next `poll()` sees it.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Orchestrator {
    serial: SerialPort,
    serial_token: Token,
    serial_write_interest: bool,
    event_loop: EventLoop,
    loader: Loader,
    link_mux: LinkMux,
    beacon: Option<(TimerFd, Token)>,
    l1a_tool: Rc<RefCell<ToolServer>>,
    loader_tool: Rc<RefCell<ToolServer>>,
}

impl Orchestrator {
    pub fn new(config: &Config) -> Result<Self> {
        let mut event_loop = EventLoop::new().map_err(|source| CoreError::IoOpen {
            what: "event loop".to_string(),
            source,
        })?;

        let mut serial = SerialPort::open(&config.port)?;
        let serial_token = event_loop.alloc_token();
        event_loop
            .register(serial.as_source(), serial_token, Interest::READABLE)
            .map_err(|source| CoreError::IoOpen {
                what: format!("registering serial port {:?}", config.port),
                source,
            })?;

        let loader = Loader::new(config.mode, config.image.clone());
        let beacon = match loader.beacon_interval() {
            Some(interval) => {
                let (timer, token) = event_loop.register_timer(interval).map_err(|source| CoreError::IoOpen {
                    what: "beacon timerfd".to_string(),
                    source,
                })?;
                Some((timer, token))
            }
            None => None,
        };

        let l1a_tool = Rc::new(RefCell::new(ToolServer::bind(&config.l1a_socket, Dlci::L1A_L23, &mut event_loop)?));
        let loader_tool = Rc::new(RefCell::new(ToolServer::bind(&config.loader_socket, Dlci::LOADER, &mut event_loop)?));

        let mut link_mux = LinkMux::new();
        link_mux.register_rx(Dlci::CONSOLE, |payload| linkmux::write_console(payload));

        let l1a_sink = Rc::clone(&l1a_tool);
        link_mux.register_rx(Dlci::L1A_L23, move |payload| {
            let mut server = l1a_sink.borrow_mut();
            // `broadcast` needs the event loop to deregister failing
            // sessions; a registered-rx closure has no access to it, so a
            // failure here is logged by `broadcast` itself and the session
            // fd is simply left registered until the next readable
            // notification discovers it is gone.
            server.broadcast_detached(payload);
        });

        let loader_sink = Rc::clone(&loader_tool);
        link_mux.register_rx(Dlci::LOADER, move |payload| {
            let mut server = loader_sink.borrow_mut();
            server.broadcast_detached(payload);
        });

        Ok(Orchestrator {
            serial,
            serial_token,
            serial_write_interest: false,
            event_loop,
            loader,
            link_mux,
            beacon,
            l1a_tool,
            loader_tool,
        })
    }

    /// Runs until the serial port hits EOF or an unrecoverable I/O error
    /// occurs. Protocol-level failures (nacks, oversized images, a single
    /// tool session dying) are handled internally and never reach here
    /// (spec §7).
    pub fn run(mut self) -> Result<()> {
        info!("starting event loop");
        loop {
            let timeout = if self.link_mux.has_pending() || self.serial_write_interest {
                Some(Duration::from_millis(0))
            } else {
                Some(IDLE_POLL_TIMEOUT)
            };

            let ready: Vec<(Token, bool, bool)> = {
                let events = self.event_loop.poll(timeout).map_err(CoreError::Io)?;
                events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect()
            };

            for (token, readable, writable) in ready {
                if token == self.serial_token {
                    if readable {
                        self.handle_serial_readable()?;
                    }
                    if writable {
                        self.handle_serial_writable()?;
                    }
                    continue;
                }
                if let Some((_, beacon_token)) = &self.beacon {
                    if token == *beacon_token {
                        self.handle_beacon()?;
                        continue;
                    }
                }
                self.handle_tool_event(token, readable);
            }

            self.sync_write_interest()?;
        }
    }

    fn handle_serial_readable(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            match self.serial.read(&mut buf) {
                Ok(0) => return Err(CoreError::SerialEof),
                Ok(n) => {
                    for &byte in &buf[..n] {
                        self.feed_serial_byte(byte)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn feed_serial_byte(&mut self, byte: u8) -> Result<()> {
        if self.loader.is_handed_over() {
            self.link_mux.feed(byte);
            return Ok(());
        }

        let action = self.loader.on_rx_byte(byte, &mut self.serial)?;
        self.apply_action(action)
    }

    fn handle_serial_writable(&mut self) -> Result<()> {
        if self.loader.is_handed_over() {
            let mut byte = 0u8;
            while self.link_mux.pull(&mut byte) {
                match self.serial.write(&[byte]) {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(());
        }

        let action = self.loader.on_writable(&mut self.serial)?;
        self.apply_action(action)
    }

    fn handle_beacon(&mut self) -> Result<()> {
        if let Some((timer, _)) = &self.beacon {
            // Drain the timerfd expiration counter; otherwise it stays
            // readable and the event loop busy-spins.
            let _ = timer.wait();
        }
        self.loader.on_beacon(&mut self.serial)
    }

    fn apply_action(&mut self, action: LoaderAction) -> Result<()> {
        match action {
            LoaderAction::None => Ok(()),
            LoaderAction::SetWriteInterest(on) => {
                self.serial_write_interest = on;
                Ok(())
            }
            LoaderAction::StartBeacon => {
                if let Some((timer, token)) = &self.beacon {
                    self.event_loop
                        .reregister_timer(timer, *token, Interest::READABLE)
                        .map_err(CoreError::Io)?;
                }
                Ok(())
            }
            LoaderAction::StopBeacon => {
                if let Some((timer, _)) = &self.beacon {
                    let _ = self.event_loop.deregister_timer(timer);
                }
                Ok(())
            }
            LoaderAction::Handover => {
                info!("upload complete; now relaying link-mux frames");
                self.serial_write_interest = false;
                Ok(())
            }
        }
    }

    fn sync_write_interest(&mut self) -> Result<()> {
        let want_write = self.serial_write_interest || self.link_mux.has_pending();
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.event_loop
            .reregister(self.serial.as_source(), self.serial_token, interest)
            .map_err(CoreError::Io)
    }

    fn handle_tool_event(&mut self, token: Token, readable: bool) {
        for server in [&self.l1a_tool, &self.loader_tool] {
            let mut server = server.borrow_mut();
            if token == server.listener_token() {
                if readable {
                    server.accept_all(&mut self.event_loop);
                }
                return;
            }
            if server.owns_token(token) {
                if readable {
                    let dlci = server.dlci();
                    if let Some(payload) = server.poll_session(token, &self.event_loop) {
                        drop(server);
                        if let Err(e) = self.link_mux.enqueue(dlci, &payload) {
                            warn!("dropping {dlci} tool-session frame: {e}");
                        }
                    }
                }
                return;
            }
        }
        error!("readiness event for unrecognized token {token:?}");
    }
}
