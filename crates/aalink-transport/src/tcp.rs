//! TCP endpoint and transport for wireless connections.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use aalink_io::{Data, Error, Promise, Result, WorkQueue};
use tracing::debug;

use crate::transport::{Transport, TransportCore, TransportIo};

/// Error code reported when the peer closes the connection cleanly.
const PEER_CLOSED: i32 = 0;

struct ReadJob {
    max: usize,
    promise: Promise<Data>,
}

struct WriteJob {
    data: Data,
    promise: Promise<usize>,
}

/// Async facade over one connected stream socket.
///
/// Reads and writes are carried out on two dedicated worker threads so
/// either direction can block independently; completions settle the
/// submitted promises. `close` shuts the socket down in both
/// directions, unblocking the workers, and flips every later
/// completion to [`Error::OperationAborted`].
pub struct TcpEndpoint {
    inner: Arc<TcpEndpointInner>,
}

struct TcpEndpointInner {
    stream: TcpStream,
    read_jobs: mpsc::Sender<ReadJob>,
    write_jobs: mpsc::Sender<WriteJob>,
    /// Shared with the worker threads, which must not keep the whole
    /// endpoint alive: dropping the endpoint drops the job senders,
    /// which is what lets the workers exit.
    closed: Arc<AtomicBool>,
}

impl TcpEndpoint {
    /// Connect synchronously (blocking; only used during setup) and
    /// disable Nagle's algorithm.
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(address).map_err(tcp_error)?;
        stream.set_nodelay(true).map_err(tcp_error)?;
        Self::from_stream(stream)
    }

    /// Connect on a worker thread; the promise resolves with the ready
    /// endpoint.
    pub fn async_connect(address: String, port: u16, promise: Promise<TcpEndpoint>) {
        std::thread::spawn(move || match Self::connect((address.as_str(), port)) {
            Ok(endpoint) => promise.resolve(endpoint),
            Err(err) => promise.reject(err),
        });
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone().map_err(tcp_error)?;
        let writer = stream.try_clone().map_err(tcp_error)?;
        let (read_jobs, read_queue) = mpsc::channel::<ReadJob>();
        let (write_jobs, write_queue) = mpsc::channel::<WriteJob>();
        let closed = Arc::new(AtomicBool::new(false));

        let read_closed = Arc::clone(&closed);
        std::thread::Builder::new()
            .name("aalink-tcp-read".to_string())
            .spawn(move || read_loop(read_closed, reader, read_queue))
            .map_err(tcp_error)?;

        let write_closed = Arc::clone(&closed);
        std::thread::Builder::new()
            .name("aalink-tcp-write".to_string())
            .spawn(move || write_loop(write_closed, writer, write_queue))
            .map_err(tcp_error)?;

        Ok(Self {
            inner: Arc::new(TcpEndpointInner {
                stream,
                read_jobs,
                write_jobs,
                closed,
            }),
        })
    }

    /// Read up to `max` bytes; resolves with whatever arrived first.
    pub fn async_read_some(&self, max: usize, promise: Promise<Data>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            promise.reject(Error::OperationAborted);
            return;
        }
        // A send failure means the worker is gone; the job's promise is
        // dropped with it and rejects itself as aborted.
        let _ = self.inner.read_jobs.send(ReadJob { max, promise });
    }

    /// Write the whole buffer; resolves with its length.
    pub fn async_write(&self, data: Data, promise: Promise<usize>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            promise.reject(Error::OperationAborted);
            return;
        }
        let _ = self.inner.write_jobs.send(WriteJob { data, promise });
    }

    /// Shut the socket down in both directions. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing tcp endpoint");
        let _ = self.inner.stream.shutdown(Shutdown::Both);
    }
}

fn read_loop(closed: Arc<AtomicBool>, mut stream: TcpStream, jobs: mpsc::Receiver<ReadJob>) {
    while let Ok(job) = jobs.recv() {
        if closed.load(Ordering::SeqCst) {
            job.promise.reject(Error::OperationAborted);
            continue;
        }
        let mut buffer = vec![0u8; job.max];
        match stream.read(&mut buffer) {
            Ok(0) => job
                .promise
                .reject(map_error(&closed, Error::TcpTransfer(PEER_CLOSED))),
            Ok(count) => {
                buffer.truncate(count);
                job.promise.resolve(buffer);
            }
            Err(err) => job.promise.reject(map_error(&closed, tcp_error(err))),
        }
    }
}

fn write_loop(closed: Arc<AtomicBool>, mut stream: TcpStream, jobs: mpsc::Receiver<WriteJob>) {
    while let Ok(job) = jobs.recv() {
        if closed.load(Ordering::SeqCst) {
            job.promise.reject(Error::OperationAborted);
            continue;
        }
        match stream.write_all(&job.data).and_then(|()| stream.flush()) {
            Ok(()) => job.promise.resolve(job.data.len()),
            Err(err) => job.promise.reject(map_error(&closed, tcp_error(err))),
        }
    }
}

/// After a local close, every failure reads as a cancellation.
fn map_error(closed: &AtomicBool, error: Error) -> Error {
    if closed.load(Ordering::SeqCst) {
        Error::OperationAborted
    } else {
        error
    }
}

fn tcp_error(err: std::io::Error) -> Error {
    Error::TcpTransfer(err.raw_os_error().unwrap_or(-1))
}

struct TcpIo {
    endpoint: TcpEndpoint,
}

impl TransportIo for TcpIo {
    fn start_receive(&self, max: usize, promise: Promise<Data>) {
        self.endpoint.async_read_some(max, promise);
    }

    fn start_send(&self, chunk: &[u8], promise: Promise<usize>) {
        self.endpoint.async_write(chunk.to_vec(), promise);
    }

    fn cancel(&self) {
        self.endpoint.close();
    }
}

/// [`Transport`] over a connected TCP socket. One message goes out as
/// one contiguous write.
pub struct TcpTransport {
    core: TransportCore<TcpIo>,
}

impl TcpTransport {
    pub fn new(endpoint: TcpEndpoint, queue: &WorkQueue) -> Self {
        Self {
            core: TransportCore::new(TcpIo { endpoint }, queue, usize::MAX),
        }
    }
}

impl Transport for TcpTransport {
    fn receive(&self, size: usize, promise: Promise<Data>) {
        self.core.receive(size, promise);
    }

    fn send(&self, data: Data, promise: Promise<()>) {
        self.core.send(data, promise);
    }

    fn stop(&self) {
        self.core.stop();
    }
}
