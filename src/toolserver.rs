//! `ToolServer`/`ToolSession`: a Unix-domain stream socket per registered
//! DLCI, relaying length-prefixed messages between connected clients and
//! the link mux (spec §4.7).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;

use log::{debug, warn};
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Token};

use crate::dlci::Dlci;
use crate::error::{CoreError, Result};
use crate::event_loop::EventLoop;

enum Stage {
    Len,
    Payload(u16),
}

/// One connected peer. Lifecycle: created on accept, destroyed on peer
/// close or read/write error (spec §3 glossary).
struct ToolSession {
    stream: UnixStream,
    buf: Vec<u8>,
    want: usize,
    stage: Stage,
}

impl ToolSession {
    fn new(stream: UnixStream) -> Self {
        ToolSession {
            stream,
            buf: Vec::new(),
            want: 2,
            stage: Stage::Len,
        }
    }

    /// Drives one readable notification to completion: reads as many bytes
    /// as are available without blocking, assembling at most one message.
    /// `Ok(Some(payload))` is a complete message; `Ok(None)` means more
    /// reads are needed; `Err` means the session must be torn down (spec
    /// §4.7: zero bytes read, or any non-`EAGAIN` error, terminates it).
    fn poll_read(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let mut chunk = vec![0u8; self.want];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tool session closed"))
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.want -= n;
                    if self.want > 0 {
                        continue;
                    }
                    match self.stage {
                        Stage::Len => {
                            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]);
                            self.buf.clear();
                            if len == 0 {
                                self.want = 2;
                                self.stage = Stage::Len;
                                return Ok(Some(Vec::new()));
                            }
                            self.want = len as usize;
                            self.stage = Stage::Payload(len);
                        }
                        Stage::Payload(_) => {
                            let payload = std::mem::take(&mut self.buf);
                            self.want = 2;
                            self.stage = Stage::Len;
                            return Ok(Some(payload));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes one envelope (2-byte big-endian length + payload). A failed
    /// or short write is treated as a session failure; the caller drops
    /// this session but keeps fanning the frame out to the others (spec
    /// §4.3, §7 `SessionIoError`).
    fn write_envelope(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut envelope = Vec::with_capacity(2 + payload.len());
        envelope.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        envelope.extend_from_slice(payload);
        self.stream.write_all(&envelope)
    }
}

/// A listener on a filesystem stream socket, bound to one DLCI, owning the
/// sessions connected to it (spec §3 glossary, §4.7).
pub struct ToolServer {
    dlci: Dlci,
    listener: UnixListener,
    listener_token: Token,
    sessions: HashMap<Token, ToolSession>,
}

impl ToolServer {
    /// Unlinks a stale socket path before binding, as the source does
    /// (spec §4.7).
    pub fn bind(path: &Path, dlci: Dlci, event_loop: &mut EventLoop) -> Result<Self> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }

        let mut listener = UnixListener::bind(path).map_err(|source| CoreError::IoOpen {
            what: format!("tool socket {path:?}"),
            source,
        })?;

        let token = event_loop.alloc_token();
        event_loop
            .register(&mut listener, token, Interest::READABLE)
            .map_err(|source| CoreError::IoOpen {
                what: format!("registering tool socket {path:?}"),
                source,
            })?;

        debug!("listening for {dlci} tool clients on {path:?}");
        Ok(ToolServer {
            dlci,
            listener,
            listener_token: token,
            sessions: HashMap::new(),
        })
    }

    pub fn dlci(&self) -> Dlci {
        self.dlci
    }

    pub fn listener_token(&self) -> Token {
        self.listener_token
    }

    pub fn owns_token(&self, token: Token) -> bool {
        self.sessions.contains_key(&token)
    }

    /// Drains every pending connection on the listener (spec §4.7: "on
    /// accept, creates a ToolSession and registers its fd for READ").
    pub fn accept_all(&mut self, event_loop: &mut EventLoop) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let token = event_loop.alloc_token();
                    if let Err(e) = event_loop.register(&mut stream, token, Interest::READABLE) {
                        warn!("failed to register new {} tool session: {e}", self.dlci);
                        continue;
                    }
                    debug!("accepted {} tool session", self.dlci);
                    self.sessions.insert(token, ToolSession::new(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed on {} tool socket: {e}", self.dlci);
                    break;
                }
            }
        }
    }

    /// Drives a readable session. Returns an assembled message to forward
    /// to the link mux, tearing the session down on EOF/error.
    pub fn poll_session(&mut self, token: Token, event_loop: &EventLoop) -> Option<Vec<u8>> {
        let outcome = self.sessions.get_mut(&token).map(ToolSession::poll_read);
        match outcome {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                let err = CoreError::SessionIo { dlci: self.dlci, source: e };
                warn!("{err}");
                if let Some(mut session) = self.sessions.remove(&token) {
                    let _ = event_loop.deregister(&mut session.stream);
                }
                None
            }
            None => None,
        }
    }

    /// Fans `payload` out to every connected session as one envelope.
    /// A failing write logs and drops only that session; the others still
    /// receive the frame (spec §4.3, §5, §8 scenario 5).
    pub fn broadcast(&mut self, payload: &[u8], event_loop: &EventLoop) {
        let dlci = self.dlci;
        self.sessions.retain(|_, session| match session.write_envelope(payload) {
            Ok(()) => true,
            Err(e) => {
                let err = CoreError::SessionIo { dlci, source: e };
                warn!("dropping session after {err}");
                let _ = event_loop.deregister(&mut session.stream);
                false
            }
        });
    }

    /// Same as [`ToolServer::broadcast`], for call sites (the link mux's
    /// registered receive callback) that have no `EventLoop` handle in
    /// scope. A session dropped here still closes its socket fd; the stale
    /// mio registration is harmless and is cleaned up the next time the
    /// event loop happens to reregister this token.
    pub fn broadcast_detached(&mut self, payload: &[u8]) {
        let dlci = self.dlci;
        self.sessions.retain(|_, session| match session.write_envelope(payload) {
            Ok(()) => true,
            Err(e) => {
                let err = CoreError::SessionIo { dlci, source: e };
                warn!("dropping session after {err}");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn make_session_pair() -> (ToolSession, StdUnixStream) {
        let (ours, theirs) = StdUnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let session = ToolSession::new(UnixStream::from_std(ours));
        (session, theirs)
    }

    #[test]
    fn assembles_envelope_across_partial_reads() {
        let (mut session, mut peer) = make_session_pair();

        peer.write_all(&[0x00]).unwrap(); // half the length prefix
        assert!(matches!(session.poll_read(), Ok(None)));

        peer.write_all(&[0x03, 0xAA]).unwrap(); // rest of length + first payload byte
        assert!(matches!(session.poll_read(), Ok(None)));

        peer.write_all(&[0xBB, 0xCC]).unwrap();
        let msg = session.poll_read().unwrap();
        assert_eq!(msg, Some(vec![0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn peer_close_is_reported_as_error() {
        let (mut session, peer) = make_session_pair();
        drop(peer);
        assert!(session.poll_read().is_err());
    }

    #[test]
    fn write_envelope_prepends_big_endian_length() {
        let (mut session, mut peer) = make_session_pair();
        session.write_envelope(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x03, 1, 2, 3]);
    }
}
