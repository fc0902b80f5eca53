//! The TLS session table: 6-character session ids, length-prefixed frames,
//! per-session replay timestamps, and non-blocking reads for the monitor.

use std::{
    collections::BTreeMap,
    io::{
        self,
        Read,
        Write,
    },
    net::TcpStream,
    sync::Arc,
    thread,
    time::Duration,
};

use byteorder::{
    ByteOrder,
    LittleEndian,
};
use durability::{
    NotificationId,
    NotificationSink,
};
use parking_lot::Mutex;
use rand::Rng;
use rustls::ServerConnection;

use crate::{
    metrics,
    protocol::ResponseMessage,
};

const SESSION_ID_LEN: usize = 6;

/// One authenticated client connection. The socket is non-blocking once
/// registered; reads accumulate into `inbox` until a whole frame arrives.
pub struct Session {
    conn: ServerConnection,
    stream: TcpStream,
    inbox: Vec<u8>,
    latest_timestamp: (i64, i64),
    closed: bool,
}

/// What one monitor pass over a session produced.
pub enum SessionRead {
    Idle,
    Frames(Vec<Vec<u8>>),
    Closed,
}

impl Session {
    pub fn new(conn: ServerConnection, stream: TcpStream) -> Self {
        Self {
            conn,
            stream,
            inbox: Vec::new(),
            latest_timestamp: (0, 0),
            closed: false,
        }
    }

    /// Pump TLS input without blocking and peel off complete frames.
    fn try_read(&mut self) -> SessionRead {
        if self.closed {
            return SessionRead::Closed;
        }
        loop {
            match self.conn.read_tls(&mut self.stream) {
                Ok(0) => return SessionRead::Closed,
                Ok(_) => {},
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return SessionRead::Closed,
            }
            if self.conn.process_new_packets().is_err() {
                return SessionRead::Closed;
            }
        }
        if self.conn.process_new_packets().is_err() {
            return SessionRead::Closed;
        }
        let mut plaintext = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut plaintext) {
                Ok(0) => break,
                Ok(n) => self.inbox.extend_from_slice(&plaintext[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return SessionRead::Closed,
            }
        }

        let mut frames = Vec::new();
        loop {
            if self.inbox.len() < 8 {
                break;
            }
            let frame_len = LittleEndian::read_u64(&self.inbox[..8]) as usize;
            if self.inbox.len() < 8 + frame_len {
                break;
            }
            let frame = self.inbox[8..8 + frame_len].to_vec();
            self.inbox.drain(..8 + frame_len);
            frames.push(frame);
        }
        if frames.is_empty() {
            SessionRead::Idle
        } else {
            SessionRead::Frames(frames)
        }
    }

    /// Write one length-prefixed frame, flushing the TLS buffers through
    /// the non-blocking socket.
    fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut len_prefix = [0u8; 8];
        LittleEndian::write_u64(&mut len_prefix, payload.len() as u64);
        self.conn.writer().write_all(&len_prefix)?;
        self.conn.writer().write_all(payload)?;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.stream) {
                Ok(_) => {},
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_micros(100));
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// The shared session table, keyed by server-generated session id.
pub struct SessionHandler {
    sessions: Mutex<BTreeMap<String, Arc<Mutex<Session>>>>,
}

impl SessionHandler {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn generate_session_id(&self) -> String {
        let mut rng = rand::rng();
        (0..SESSION_ID_LEN)
            .map(|_| {
                let n = rng.random_range(0..36u32);
                if n < 26 {
                    (b'A' + n as u8) as char
                } else {
                    (b'0' + (n - 26) as u8) as char
                }
            })
            .collect()
    }

    /// Register a handshaken connection under a fresh session id.
    pub fn add_session(&self, session: Session) -> String {
        let mut sessions = self.sessions.lock();
        let session_id = loop {
            let candidate = self.generate_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));
        metrics::log_active_sessions(sessions.len());
        session_id
    }

    pub fn remove_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        if sessions.remove(session_id).is_some() {
            tracing::info!("Session {session_id} closed");
            metrics::log_active_sessions(sessions.len());
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// One non-blocking read pass for the monitor.
    pub fn try_read(&self, session_id: &str) -> SessionRead {
        let Some(session) = self.sessions.lock().get(session_id).cloned() else {
            return SessionRead::Closed;
        };
        let result = session.lock().try_read();
        result
    }

    /// Update the session's replay timestamp; false means the request is
    /// stale and must be dropped.
    pub fn check_and_update_timestamp(&self, session_id: &str, timestamp: (i64, i64)) -> bool {
        let Some(session) = self.sessions.lock().get(session_id).cloned() else {
            return false;
        };
        let mut session = session.lock();
        if timestamp <= session.latest_timestamp {
            return false;
        }
        session.latest_timestamp = timestamp;
        true
    }

    /// Send one frame to a session; drops the session on write failure.
    pub fn send(&self, session_id: &str, payload: &[u8]) -> bool {
        let Some(session) = self.sessions.lock().get(session_id).cloned() else {
            tracing::debug!("Session {session_id} is gone; dropping response");
            return false;
        };
        let result = session.lock().write_frame(payload);
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Write to session {session_id} failed: {err}");
                self.remove_session(session_id);
                false
            },
        }
    }

    pub fn send_response(&self, session_id: &str, response: &ResponseMessage) -> bool {
        self.send(session_id, &response.to_bytes())
    }

    /// Switch a registered session's socket to non-blocking for the
    /// monitor. The handshake and the session-id push happen blocking.
    pub fn set_nonblocking(&self, session_id: &str) -> io::Result<()> {
        let Some(session) = self.sessions.lock().get(session_id).cloned() else {
            return Ok(());
        };
        let session = session.lock();
        session.stream.set_nonblocking(true)
    }

    /// Mark a session closed so the monitor reaps it.
    pub fn close_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().get(session_id).cloned() {
            let mut guard = session.lock();
            let session = &mut *guard;
            session.closed = true;
            session.conn.send_close_notify();
            let _ = session.conn.write_tls(&mut session.stream);
        }
    }
}

/// Commit acknowledgements released by the notifier go straight to the
/// session that issued the transaction.
pub struct SessionNotificationSink {
    handler: Arc<SessionHandler>,
}

impl SessionNotificationSink {
    pub fn new(handler: Arc<SessionHandler>) -> Self {
        Self { handler }
    }
}

impl NotificationSink for SessionNotificationSink {
    fn deliver_commit(&self, nid: &NotificationId) {
        let response =
            ResponseMessage::new(0, "Notifier: OK").with_read_values(&nid.read_values);
        if !self.handler.send_response(&nid.session_id, &response) {
            tracing::debug!(
                "Session {} gone; commit notification dropped",
                nid.session_id
            );
        }
    }
}
