//! Frame-granular TLS.
//!
//! The phone is the TLS server; the head unit connects as a client
//! presenting a client certificate and accepting whatever (self-signed)
//! certificate the phone offers. No sockets are involved: handshake
//! blobs and record fragments move through in-memory buffers, because
//! the ciphertext rides inside protocol frames on the control channel.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use aalink_io::{Data, Error, Result};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::debug;

/// Compiled-in head-unit identity, used when [`TlsConfig`] carries no
/// override.
const DEFAULT_CERT_PEM: &str = include_str!("../certs/headunit-cert.pem");
const DEFAULT_KEY_PEM: &str = include_str!("../certs/headunit-key.pem");

/// Progress of [`Cryptor::do_handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// More peer handshake bytes are needed; send whatever
    /// [`Cryptor::take_handshake_data`] returns and feed the reply.
    NeedMoreData,
    /// The session is established; encrypted frames may flow.
    Done,
}

/// TLS engine bridged to the frame pipeline through byte buffers.
///
/// All methods take `&mut self`; the in and out streams share one
/// cryptor behind a mutex, each serializing access through its own
/// strand.
pub trait Cryptor: Send {
    /// Advance the handshake with whatever has been fed so far.
    fn do_handshake(&mut self) -> Result<HandshakeState>;

    /// Push peer ciphertext (handshake or record fragments) into the
    /// engine. Partial records are buffered internally.
    fn feed(&mut self, ciphertext: &[u8]) -> Result<()>;

    /// Drain the next outgoing handshake bytes; empty when the engine
    /// has nothing to say.
    fn take_handshake_data(&mut self) -> Result<Data>;

    /// Encrypt one plaintext chunk, appending ciphertext to `dst`.
    /// Returns the ciphertext byte count.
    fn encrypt(&mut self, plaintext: &[u8], dst: &mut Data) -> Result<usize>;

    /// Feed one ciphertext fragment and append whatever plaintext
    /// becomes available to `dst`. Returns the plaintext byte count,
    /// which is zero while a record is still incomplete.
    fn decrypt(&mut self, ciphertext: &[u8], dst: &mut Data) -> Result<usize>;

    /// Whether the handshake has completed.
    fn is_active(&self) -> bool;
}

/// PEM material for the head-unit identity; empty fields fall back to
/// the compiled-in pair.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// [`Cryptor`] over a rustls client connection.
pub struct TlsCryptor {
    connection: rustls::client::ClientConnection,
    active: bool,
}

impl TlsCryptor {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let cert_pem: &[u8] = if config.cert_pem.is_empty() {
            DEFAULT_CERT_PEM.as_bytes()
        } else {
            &config.cert_pem
        };
        let key_pem: &[u8] = if config.key_pem.is_empty() {
            DEFAULT_KEY_PEM.as_bytes()
        } else {
            &config.key_pem
        };

        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| Error::SslHandshake(format!("invalid certificate pem: {err:?}")))?;
        if certs.is_empty() {
            return Err(Error::SslHandshake("no certificate in pem".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|err| Error::SslHandshake(format!("invalid key pem: {err:?}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let schemes = provider
            .signature_verification_algorithms
            .supported_schemes();

        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .map_err(|err| Error::SslHandshake(err.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { schemes }))
            .with_client_auth_cert(certs, key)
            .map_err(|err| Error::SslHandshake(err.to_string()))?;

        let server_name = ServerName::try_from("android-device")
            .map_err(|err| Error::SslHandshake(err.to_string()))?
            .to_owned();
        let connection =
            rustls::client::ClientConnection::new(Arc::new(tls_config), server_name)
                .map_err(|err| Error::SslHandshake(err.to_string()))?;

        Ok(Self {
            connection,
            active: false,
        })
    }

    fn drain_tls(&mut self) -> Result<Data> {
        let mut out = Data::new();
        while self.connection.wants_write() {
            self.connection
                .write_tls(&mut out)
                .map_err(|err| Error::SslWrite(err.to_string()))?;
        }
        Ok(out)
    }
}

impl Cryptor for TlsCryptor {
    fn do_handshake(&mut self) -> Result<HandshakeState> {
        if self.connection.is_handshaking() {
            Ok(HandshakeState::NeedMoreData)
        } else {
            if !self.active {
                debug!("tls handshake complete");
                self.active = true;
            }
            Ok(HandshakeState::Done)
        }
    }

    fn feed(&mut self, ciphertext: &[u8]) -> Result<()> {
        let mut remaining = ciphertext;
        while !remaining.is_empty() {
            let consumed = self
                .connection
                .read_tls(&mut remaining)
                .map_err(|err| Error::SslRead(err.to_string()))?;
            if consumed == 0 {
                return Err(Error::SslRead("tls engine refused input".to_string()));
            }
            self.connection
                .process_new_packets()
                .map_err(|err| Error::SslRead(err.to_string()))?;
        }
        Ok(())
    }

    fn take_handshake_data(&mut self) -> Result<Data> {
        self.drain_tls()
    }

    fn encrypt(&mut self, plaintext: &[u8], dst: &mut Data) -> Result<usize> {
        self.connection
            .writer()
            .write_all(plaintext)
            .map_err(|err| Error::SslWrite(err.to_string()))?;
        let ciphertext = self.drain_tls()?;
        dst.extend_from_slice(&ciphertext);
        Ok(ciphertext.len())
    }

    fn decrypt(&mut self, ciphertext: &[u8], dst: &mut Data) -> Result<usize> {
        self.feed(ciphertext)?;
        let mut produced = 0;
        let mut chunk = [0u8; 4096];
        loop {
            match self.connection.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => {
                    dst.extend_from_slice(&chunk[..count]);
                    produced += count;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(Error::SslRead(err.to_string())),
            }
        }
        Ok(produced)
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// The phone presents a self-signed certificate; trust is anchored in
/// the pairing flow above this layer, not in PKI.
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
