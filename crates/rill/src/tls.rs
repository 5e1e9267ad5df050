//! Byte pump over the TLS primitive.
//!
//! The socket never sees TLS message types. It pushes incoming ciphertext in,
//! pops incoming plaintext out, pushes outgoing plaintext down and pops
//! outgoing ciphertext for the normal send path; the close-notify handshake
//! drives the downgrade protocol the same way.

use std::sync::Arc;

use rustls::{ClientConnection, Connection, ServerConnection};
use rustls_pki_types::{CertificateDer, ServerName};

use crate::error::Error;

/// Which side of the handshake this socket plays.
pub enum UpgradeMode {
    Client { config: Arc<rustls::ClientConfig>, server_name: String },
    Server { config: Arc<rustls::ServerConfig> },
}

pub struct TlsPipeline {
    conn: Connection,
    plaintext_available: usize,
    peer_closed: bool,
    shutdown_sent: bool,
    handshake_reported: bool,
}

impl TlsPipeline {
    pub fn new(mode: UpgradeMode) -> Result<Self, Error> {
        let conn = match mode {
            UpgradeMode::Client { config, server_name } => {
                let name = ServerName::try_from(server_name)
                    .map_err(|e| Error::Tls(e.to_string()))?;
                Connection::from(
                    ClientConnection::new(config, name).map_err(|e| Error::Tls(e.to_string()))?,
                )
            }
            UpgradeMode::Server { config } => Connection::from(
                ServerConnection::new(config).map_err(|e| Error::Tls(e.to_string()))?,
            ),
        };
        Ok(Self {
            conn,
            plaintext_available: 0,
            peer_closed: false,
            shutdown_sent: false,
            handshake_reported: false,
        })
    }

    /// Feed ciphertext read from the transport.
    pub fn push_incoming_ciphertext(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        while !bytes.is_empty() {
            let consumed =
                self.conn.read_tls(&mut bytes).map_err(|e| Error::Tls(e.to_string()))?;
            if consumed == 0 {
                break;
            }
            self.process()?;
        }
        Ok(())
    }

    fn process(&mut self) -> Result<(), Error> {
        let state = self.conn.process_new_packets().map_err(|e| Error::Tls(e.to_string()))?;
        self.plaintext_available = state.plaintext_bytes_to_read();
        if state.peer_has_closed() {
            self.peer_closed = true;
        }
        Ok(())
    }

    pub fn has_incoming_plaintext(&self) -> bool {
        self.plaintext_available > 0
    }

    /// Append all decrypted application bytes to `out`.
    pub fn pop_incoming_plaintext(&mut self, out: &mut Vec<u8>) -> Result<usize, Error> {
        use std::io::Read;

        let mut total = 0;
        let mut chunk = [0u8; 4096];
        while self.plaintext_available > 0 {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    self.plaintext_available = 0;
                }
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                    self.plaintext_available = self.plaintext_available.saturating_sub(n);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.plaintext_available = 0;
                }
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
        }
        Ok(total)
    }

    /// Encrypt application bytes for the send path.
    pub fn push_outgoing_plaintext(&mut self, bytes: &[u8]) -> Result<(), Error> {
        use std::io::Write;

        self.conn.writer().write_all(bytes).map_err(|e| Error::Tls(e.to_string()))
    }

    pub fn has_outgoing_ciphertext(&self) -> bool {
        self.conn.wants_write()
    }

    /// Append pending ciphertext (handshake records, data, close-notify) to
    /// `out`.
    pub fn pop_outgoing_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut total = 0;
        while self.conn.wants_write() {
            total += self.conn.write_tls(out).map_err(|e| Error::Tls(e.to_string()))?;
        }
        Ok(total)
    }

    /// Queue a close-notify toward the peer.
    pub fn shutdown(&mut self) {
        if !self.shutdown_sent {
            self.conn.send_close_notify();
            self.shutdown_sent = true;
        }
    }

    pub fn is_shutdown_sent(&self) -> bool {
        self.shutdown_sent
    }

    pub fn is_shutdown_received(&self) -> bool {
        self.peer_closed
    }

    /// Close-notify has gone both ways and nothing remains to flush.
    pub fn is_shutdown_finished(&self) -> bool {
        self.shutdown_sent && self.peer_closed && !self.conn.wants_write()
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Reports handshake completion exactly once, with the peer certificate
    /// when one was presented.
    pub fn poll_handshake_complete(&mut self) -> Option<Option<CertificateDer<'static>>> {
        if self.handshake_reported || self.conn.is_handshaking() {
            return None;
        }
        self.handshake_reported = true;
        Some(self.peer_certificate())
    }

    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.conn.peer_certificates().and_then(|certs| certs.first()).map(|c| c.clone().into_owned())
    }
}
