//! Single-threaded, readiness-based dispatcher (spec §4.2, §5).
//!
//! Wraps `mio::Poll`: registers fds with an interest mask, delivers
//! readiness events, and turns the periodic beacon into an ordinary
//! readable fd (an OS timerfd) instead of a `SIGALRM` handler — the
//! redesign spec §9 calls out explicitly, since it removes the
//! async-signal-safety constraint without changing observable behavior.
//!
//! No parallelism: callbacks run to completion before the next `poll()`
//! call, and may freely reregister their own fd with a new interest mask
//! before returning.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

pub use mio::{Interest, Token};
use mio::unix::SourceFd;
use mio::{Events, Poll};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

pub struct EventLoop {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            next_token: 0,
        })
    }

    /// Hands out a fresh `Token` for a new registration. Callers own the
    /// fd/stream itself; the event loop only tracks interest via mio.
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Registers an OS timerfd armed to fire every `interval`. The caller
    /// must keep the returned `TimerFd` alive for as long as the beacon is
    /// wanted; each readiness notification must be drained with
    /// [`TimerFd::wait`]-style read or the fd stays readable.
    pub fn register_timer(&mut self, interval: Duration) -> io::Result<(TimerFd, Token)> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .map_err(nix_to_io)?;
        let spec = TimeSpec::from_duration(interval);
        timer
            .set(Expiration::IntervalDelay(spec, spec), TimerSetTimeFlags::empty())
            .map_err(nix_to_io)?;

        let token = self.alloc_token();
        let raw = timer.as_raw_fd();
        self.register(&mut SourceFd(&raw), token, Interest::READABLE)?;
        Ok((timer, token))
    }

    pub fn reregister_timer(&self, timer: &TimerFd, token: Token, interest: Interest) -> io::Result<()> {
        let raw = timer.as_raw_fd();
        self.reregister(&mut SourceFd(&raw), token, interest)
    }

    pub fn deregister_timer(&self, timer: &TimerFd) -> io::Result<()> {
        let raw = timer.as_raw_fd();
        self.deregister(&mut SourceFd(&raw))
    }

    /// Blocks until at least one fd is ready or `timeout` elapses, then
    /// returns the batch of readiness events for the caller to dispatch.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<&Events> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(&self.events)
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
