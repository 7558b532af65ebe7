use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::core::{Error, FileTransferError, Result, CHUNK_SIZE};
use crate::network::Router;
use crate::protocol::{Body, FileMode, Telegram, TelegramKind};

/// Reads and writes whole files on one device.
///
/// Writes are chunked into acknowledged `FileWrite` telegrams. Reads open
/// the file, request the full length once and reassemble the streamed
/// `FileContent` telegrams. Only one read may run at a time per device.
#[derive(Clone)]
pub struct FileTransferManager {
    router: Router,
    reading: Arc<AtomicBool>,
}

impl FileTransferManager {
    /// Creates a new file transfer manager on top of `router`
    pub fn new(router: Router) -> Self {
        FileTransferManager {
            router,
            reading: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the file `name` with `data`.
    ///
    /// The handle is closed whether or not the chunk writes succeed. The
    /// first failure is the one reported.
    pub async fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let (handle, _) = self.open(name, FileMode::CREATE_ALWAYS | FileMode::WRITE).await?;
        debug!(peer = %self.router.transport().peer(), name, handle, len = data.len(), "writing file");

        let written = self.write_chunks(handle, data).await;
        let closed = self.close(handle).await;
        written.and(closed)
    }

    /// Reads the whole file `name`
    pub async fn read_file(&self, name: &str) -> Result<Bytes> {
        let _guard = ReadGuard::acquire(&self.reading)?;

        let (handle, size) = self.open(name, FileMode::READ).await?;
        debug!(peer = %self.router.transport().peer(), name, handle, size, "reading file");

        let content = self.stream_content(handle, size).await;
        if let Err(e) = self.close(handle).await {
            warn!(peer = %self.router.transport().peer(), name, error = %e, "failed to close file after read");
        }
        content
    }

    async fn open(&self, name: &str, mode: FileMode) -> Result<(u8, u32)> {
        let request = Telegram::new(Body::FileOpen {
            mode,
            name: name.to_string(),
        });
        let reply = self
            .router
            .send_with_response(request, TelegramKind::FileOpenResponse)
            .await?;
        match reply.body {
            Body::FileOpenResponse { status, handle, size } => {
                FileTransferError::check("open", status)?;
                Ok((handle, size))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self, handle: u8) -> Result<()> {
        let reply = self
            .router
            .send_with_response(Telegram::new(Body::FileClose { handle }), TelegramKind::FileCloseResponse)
            .await?;
        match reply.body {
            Body::FileCloseResponse { status } => Ok(FileTransferError::check("close", status)?),
            other => Err(unexpected(other)),
        }
    }

    async fn write_chunks(&self, handle: u8, data: &[u8]) -> Result<()> {
        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let offset = (index * CHUNK_SIZE) as u32;
            let request = Telegram::new(Body::FileWrite {
                handle,
                offset,
                data: Bytes::copy_from_slice(chunk),
            });
            let reply = self
                .router
                .send_with_response(request, TelegramKind::FileWriteResponse)
                .await?;
            let status = match reply.body {
                Body::FileWriteResponse { status, .. } => status,
                other => return Err(unexpected(other)),
            };
            FileTransferError::check("write", status)?;
            trace!(handle, offset, len = chunk.len(), "chunk written");
        }
        Ok(())
    }

    async fn stream_content(&self, handle: u8, size: u32) -> Result<Bytes> {
        let mut assembly = Reassembly::new(size);
        if assembly.is_complete() {
            return Ok(assembly.into_bytes());
        }

        // Subscribe first so no content can slip past between send and receive
        let mut inbound = self.router.transport().subscribe();
        self.router.send(&Telegram::new(Body::FileRead {
            handle,
            offset: 0,
            length: size,
        }))?;

        while !assembly.is_complete() {
            let telegram = inbound.recv().await.ok_or(FileTransferError::ChannelClosed)?;
            if let Body::FileContent { position, data, .. } = telegram.body {
                if !assembly.push(position, &data) {
                    trace!(position, received = assembly.len(), "ignoring out-of-sequence content");
                }
            }
        }

        Ok(assembly.into_bytes())
    }
}

fn unexpected(body: Body) -> Error {
    Error::malformed(body.type_code(), "unexpected reply kind")
}

/// Most a read reserves up front; larger files grow the buffer as content
/// arrives
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates streamed file content in order
#[derive(Debug)]
pub(crate) struct Reassembly {
    total: usize,
    buf: BytesMut,
}

impl Reassembly {
    pub(crate) fn new(total: u32) -> Self {
        Reassembly {
            total: total as usize,
            buf: BytesMut::with_capacity((total as usize).min(INITIAL_CAPACITY)),
        }
    }

    /// Appends `data` if it starts exactly where the buffer ends. Returns
    /// whether the data was taken.
    pub(crate) fn push(&mut self, position: u32, data: &[u8]) -> bool {
        if data.is_empty() || position as usize != self.buf.len() || self.is_complete() {
            return false;
        }
        let room = self.total - self.buf.len();
        self.buf.extend_from_slice(&data[..data.len().min(room)]);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.buf.len() >= self.total
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Holds the per-device read flag, clearing it when dropped
struct ReadGuard<'a>(&'a AtomicBool);

impl<'a> ReadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> std::result::Result<Self, FileTransferError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FileTransferError::NotReentrant)?;
        Ok(ReadGuard(flag))
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
