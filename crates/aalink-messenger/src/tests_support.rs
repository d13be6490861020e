//! Fakes shared by the stream and messenger tests: a scripted
//! transport and two toy cryptors.

use std::collections::VecDeque;

use aalink_frame::{EncryptionType, FrameHeader, FrameType, MessageType};
use aalink_io::{Data, Error, Promise, Result};
use aalink_transport::Transport;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::cryptor::{Cryptor, HandshakeState};

#[derive(Default)]
struct MockTransportState {
    wire: VecDeque<u8>,
    receives: VecDeque<(usize, Promise<Data>)>,
    sent: Vec<Data>,
    pending_sends: VecDeque<Promise<()>>,
    auto_resolve_sends: bool,
    fail_next_send: Option<Error>,
    stopped: bool,
}

/// Transport fake: incoming bytes are scripted with
/// [`push_wire`](Self::push_wire); receive requests resolve as soon as
/// enough scripted bytes exist. Sends are recorded and by default
/// resolve immediately.
pub(crate) struct MockTransport {
    state: Mutex<MockTransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockTransportState {
                auto_resolve_sends: true,
                ..MockTransportState::default()
            }),
        }
    }

    /// Keep send promises pending until [`complete_send`](Self::complete_send).
    pub fn manual_sends(&self) {
        self.state.lock().auto_resolve_sends = false;
    }

    pub fn push_wire(&self, bytes: &[u8]) {
        self.state.lock().wire.extend(bytes.iter().copied());
        self.pump();
    }

    pub fn sent(&self) -> Vec<Data> {
        self.state.lock().sent.clone()
    }

    pub fn pending_receives(&self) -> usize {
        self.state.lock().receives.len()
    }

    pub fn complete_send(&self) {
        let promise = self
            .state
            .lock()
            .pending_sends
            .pop_front()
            .expect("no pending send");
        promise.resolve(());
    }

    pub fn fail_next_send(&self, error: Error) {
        self.state.lock().fail_next_send = Some(error);
    }

    pub fn fail_pending_receives(&self, error: Error) {
        let drained: Vec<_> = self.state.lock().receives.drain(..).collect();
        for (_, promise) in drained {
            promise.reject(error.clone());
        }
    }

    fn pump(&self) {
        loop {
            let ready = {
                let mut state = self.state.lock();
                match state.receives.front() {
                    Some((size, _)) if state.wire.len() >= *size => {
                        let size = *size;
                        let (_, promise) = state.receives.pop_front().expect("front checked");
                        let data: Data = state.wire.drain(..size).collect();
                        Some((promise, data))
                    }
                    _ => None,
                }
            };
            match ready {
                Some((promise, data)) => promise.resolve(data),
                None => return,
            }
        }
    }
}

impl Transport for MockTransport {
    fn receive(&self, size: usize, promise: Promise<Data>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                drop(state);
                promise.reject(Error::OperationAborted);
                return;
            }
            state.receives.push_back((size, promise));
        }
        self.pump();
    }

    fn send(&self, data: Data, promise: Promise<()>) {
        let (failure, auto) = {
            let mut state = self.state.lock();
            if state.stopped {
                drop(state);
                promise.reject(Error::OperationAborted);
                return;
            }
            state.sent.push(data);
            (state.fail_next_send.take(), state.auto_resolve_sends)
        };
        if let Some(error) = failure {
            promise.reject(error);
        } else if auto {
            promise.resolve(());
        } else {
            self.state.lock().pending_sends.push_back(promise);
        }
    }

    fn stop(&self) {
        let (receives, sends) = {
            let mut state = self.state.lock();
            state.stopped = true;
            (
                state.receives.drain(..).collect::<Vec<_>>(),
                state.pending_sends.drain(..).collect::<Vec<_>>(),
            )
        };
        for (_, promise) in receives {
            promise.reject(Error::OperationAborted);
        }
        for promise in sends {
            promise.reject(Error::OperationAborted);
        }
    }
}

/// Pass-through cryptor for plaintext-only tests.
pub(crate) struct NullCryptor;

impl Cryptor for NullCryptor {
    fn do_handshake(&mut self) -> Result<HandshakeState> {
        Ok(HandshakeState::Done)
    }

    fn feed(&mut self, _ciphertext: &[u8]) -> Result<()> {
        Ok(())
    }

    fn take_handshake_data(&mut self) -> Result<Data> {
        Ok(Data::new())
    }

    fn encrypt(&mut self, plaintext: &[u8], dst: &mut Data) -> Result<usize> {
        dst.extend_from_slice(plaintext);
        Ok(plaintext.len())
    }

    fn decrypt(&mut self, ciphertext: &[u8], dst: &mut Data) -> Result<usize> {
        dst.extend_from_slice(ciphertext);
        Ok(ciphertext.len())
    }

    fn is_active(&self) -> bool {
        true
    }
}

pub(crate) const MARK: u8 = 0xE5;

/// Cryptor fake that tags every ciphertext with a leading marker byte,
/// so tests can tell which path a payload took.
#[derive(Default)]
pub(crate) struct MarkCryptor {
    pub encrypt_calls: usize,
    pub decrypt_calls: usize,
}

impl Cryptor for MarkCryptor {
    fn do_handshake(&mut self) -> Result<HandshakeState> {
        Ok(HandshakeState::Done)
    }

    fn feed(&mut self, _ciphertext: &[u8]) -> Result<()> {
        Ok(())
    }

    fn take_handshake_data(&mut self) -> Result<Data> {
        Ok(Data::new())
    }

    fn encrypt(&mut self, plaintext: &[u8], dst: &mut Data) -> Result<usize> {
        self.encrypt_calls += 1;
        dst.push(MARK);
        dst.extend_from_slice(plaintext);
        Ok(plaintext.len() + 1)
    }

    fn decrypt(&mut self, ciphertext: &[u8], dst: &mut Data) -> Result<usize> {
        self.decrypt_calls += 1;
        match ciphertext.split_first() {
            Some((&MARK, body)) => {
                dst.extend_from_slice(body);
                Ok(body.len())
            }
            _ => Err(Error::SslRead("missing mark".to_string())),
        }
    }

    fn is_active(&self) -> bool {
        true
    }
}

/// Build the wire bytes of one frame.
pub(crate) fn frame_bytes(
    channel_id: aalink_frame::ChannelId,
    frame_type: FrameType,
    encryption: EncryptionType,
    message_type: MessageType,
    payload: &[u8],
    total: Option<u32>,
) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    FrameHeader {
        channel_id,
        frame_type,
        encryption,
        message_type,
    }
    .encode(payload.len() as u16, &mut bytes);
    if let Some(total) = total {
        bytes.put_u32(total);
    }
    bytes.extend_from_slice(payload);
    bytes.to_vec()
}
