//! Scripted device used by the session-level tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::CHUNK_SIZE;
use crate::network::transport::Datagram;
use crate::protocol::{Body, FileMode, FileStatus, Telegram, TelegramCodec};

const READ_HANDLE: u8 = 1;
const WRITE_HANDLE: u8 = 2;

/// What the fake device saw
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub received: Vec<Telegram>,
    pub writes: Vec<(u32, usize)>,
    pub closes: usize,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, Vec<u8>>,
    open_read: Option<String>,
    open_write: Option<(String, Vec<u8>)>,
    fail_write_at: Option<u32>,
    fail_open: bool,
    fail_close: bool,
    duplicate_chunks: bool,
    silent: Vec<String>,
    log: DeviceLog,
}

/// Device double answering the telegrams a session sends
#[derive(Clone, Default)]
pub struct FakeDevice {
    inner: Arc<Mutex<Inner>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, name: &str, content: &[u8]) -> Self {
        self.inner().files.insert(name.to_string(), content.to_vec());
        self
    }

    pub fn fail_write_at(self, offset: u32) -> Self {
        self.inner().fail_write_at = Some(offset);
        self
    }

    pub fn fail_open(self) -> Self {
        self.inner().fail_open = true;
        self
    }

    pub fn fail_close(self) -> Self {
        self.inner().fail_close = true;
        self
    }

    pub fn duplicate_chunks(self) -> Self {
        self.inner().duplicate_chunks = true;
        self
    }

    /// Never answers text commands equal to `command`
    pub fn ignore(self, command: &str) -> Self {
        self.inner().silent.push(command.to_string());
        self
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.inner().files.get(name).cloned()
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&DeviceLog) -> R) -> R {
        f(&self.inner().log)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Answers every datagram on `outbound`, handing replies to `deliver`
    pub fn spawn<F>(&self, mut outbound: mpsc::UnboundedReceiver<Datagram>, deliver: F) -> JoinHandle<()>
    where
        F: Fn(Datagram, Telegram) + Send + 'static,
    {
        let device = self.clone();
        tokio::spawn(async move {
            let codec = TelegramCodec::new();
            while let Some(datagram) = outbound.recv().await {
                let Ok(request) = codec.decode_datagram(&datagram.bytes) else {
                    continue;
                };
                for reply in device.answer(&request) {
                    deliver(datagram.clone(), reply);
                }
            }
        })
    }

    /// Replies the device sends for `request`
    pub fn answer(&self, request: &Telegram) -> Vec<Telegram> {
        let mut inner = self.inner();
        inner.log.received.push(request.clone());
        let reply = |body: Body| Telegram::new(body).with_addresses(request.src, 0);

        match &request.body {
            Body::Text(text) if inner.silent.iter().any(|c| c == text) => Vec::new(),
            Body::Text(text) if text == "#S7?" => vec![reply(Body::Text("#S7=H1000 3 1234".into()))],
            Body::Text(text) if text == "GETALLSTATES?" => vec![
                Telegram::text("#Y1$100,'on'"),
                Telegram::text("#Y2$[1,2]"),
            ],
            Body::Text(text) => vec![reply(Body::Text(format!("OK:{}", text)))],
            Body::FileOpen { mode, name } => {
                if inner.fail_open {
                    return vec![reply(Body::FileOpenResponse {
                        status: FileStatus::Denied,
                        handle: 0,
                        size: 0,
                    })];
                }
                if mode.contains(FileMode::WRITE) {
                    inner.open_write = Some((name.clone(), Vec::new()));
                    return vec![reply(Body::FileOpenResponse {
                        status: FileStatus::Ok,
                        handle: WRITE_HANDLE,
                        size: 0,
                    })];
                }
                let size = inner.files.get(name).map(|content| content.len() as u32);
                inner.open_read = Some(name.clone());
                let body = match size {
                    Some(size) => Body::FileOpenResponse {
                        status: FileStatus::Ok,
                        handle: READ_HANDLE,
                        size,
                    },
                    None => Body::FileOpenResponse {
                        status: FileStatus::NoFile,
                        handle: 0,
                        size: 0,
                    },
                };
                vec![reply(body)]
            }
            Body::FileWrite { handle, offset, data } => {
                inner.log.writes.push((*offset, data.len()));
                let status = if inner.fail_write_at == Some(*offset) {
                    FileStatus::DiskErr
                } else {
                    if let Some((_, buf)) = inner.open_write.as_mut() {
                        buf.truncate(*offset as usize);
                        buf.extend_from_slice(data);
                    }
                    FileStatus::Ok
                };
                vec![reply(Body::FileWriteResponse {
                    status,
                    handle: *handle,
                    offset: *offset,
                })]
            }
            Body::FileClose { handle } => {
                inner.log.closes += 1;
                if inner.fail_close {
                    inner.open_write = None;
                    return vec![reply(Body::FileCloseResponse { status: FileStatus::DiskErr })];
                }
                if *handle == WRITE_HANDLE {
                    if let Some((name, content)) = inner.open_write.take() {
                        inner.files.insert(name, content);
                    }
                }
                vec![reply(Body::FileCloseResponse { status: FileStatus::Ok })]
            }
            Body::FileRead { handle, offset, length } => {
                let open = inner.open_read.clone().unwrap_or_default();
                let Some(content) = inner.files.get(&open).cloned() else {
                    return Vec::new();
                };
                let end = (*offset + *length) as usize;
                let mut replies = Vec::new();
                for (index, chunk) in content[*offset as usize..end.min(content.len())]
                    .chunks(CHUNK_SIZE)
                    .enumerate()
                {
                    let telegram = Telegram::new(Body::FileContent {
                        handle: *handle,
                        position: *offset + (index * CHUNK_SIZE) as u32,
                        data: Bytes::copy_from_slice(chunk),
                    });
                    if inner.duplicate_chunks {
                        replies.push(telegram.clone());
                    }
                    replies.push(telegram);
                }
                replies
            }
            _ => Vec::new(),
        }
    }
}
