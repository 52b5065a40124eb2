//! Upload sources and part readers

use bytes::Bytes;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::Mutex;

use super::planner::{PartJob, SourceDescriptor};

/// Readers that can also seek
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// Bytes to upload
pub enum UploadSource {
    /// In-memory payload
    Bytes(Bytes),

    /// Seekable reader; a missing length is resolved by seeking to the end.
    /// Parts are read relative to the reader's position at entry.
    Seekable {
        reader: Box<dyn SeekableRead>,
        length: Option<u64>,
    },

    /// Forward-only reader, uploaded strictly in stream order
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: Option<u64>,
    },

    /// Local file, opened independently by every worker
    File(PathBuf),
}

impl UploadSource {
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        UploadSource::Bytes(data.into())
    }

    pub fn seekable(reader: impl SeekableRead + 'static, length: Option<u64>) -> Self {
        UploadSource::Seekable {
            reader: Box::new(reader),
            length,
        }
    }

    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static, length: Option<u64>) -> Self {
        UploadSource::Stream {
            reader: Box::new(reader),
            length,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        UploadSource::File(path.into())
    }

    /// Probe capabilities once and turn the source into a shareable part reader
    pub(crate) async fn prepare(self) -> io::Result<(SourceDescriptor, PartSource)> {
        match self {
            UploadSource::Bytes(data) => Ok((
                SourceDescriptor::new(true, Some(data.len() as u64)),
                PartSource::Memory(data),
            )),
            UploadSource::Seekable { mut reader, length } => {
                let base = reader.stream_position().await?;
                let length = match length {
                    Some(length) => length,
                    None => {
                        let end = reader.seek(SeekFrom::End(0)).await?;
                        reader.seek(SeekFrom::Start(base)).await?;
                        end.saturating_sub(base)
                    }
                };
                Ok((
                    SourceDescriptor::new(true, Some(length)),
                    PartSource::Seekable {
                        reader: Mutex::new(reader),
                        base,
                    },
                ))
            }
            UploadSource::Stream { reader, length } => Ok((
                SourceDescriptor::new(false, length),
                PartSource::Stream(Mutex::new(StreamState {
                    reader,
                    pending: None,
                    position: 0,
                })),
            )),
            UploadSource::File(path) => {
                let length = tokio::fs::metadata(&path).await?.len();
                Ok((
                    SourceDescriptor::new(true, Some(length)),
                    PartSource::File(path),
                ))
            }
        }
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            UploadSource::Seekable { length, .. } => {
                f.debug_struct("Seekable").field("length", length).finish()
            }
            UploadSource::Stream { length, .. } => {
                f.debug_struct("Stream").field("length", length).finish()
            }
            UploadSource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

pub(crate) struct StreamState {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Chunk handed back by the coordinator after probing the first part
    pending: Option<Bytes>,
    position: u64,
}

/// Reads part payloads out of a prepared source
pub(crate) enum PartSource {
    Memory(Bytes),
    Seekable {
        reader: Mutex<Box<dyn SeekableRead>>,
        base: u64,
    },
    File(PathBuf),
    Stream(Mutex<StreamState>),
}

impl PartSource {
    /// Read up to `job.length` bytes at `job.offset`. Returns fewer only at EOF.
    pub(crate) async fn read_part(&self, job: &PartJob) -> io::Result<Bytes> {
        match self {
            PartSource::Memory(data) => {
                let len = data.len() as u64;
                let start = job.offset.min(len) as usize;
                let end = job.offset.saturating_add(job.length).min(len) as usize;
                Ok(data.slice(start..end))
            }
            PartSource::Seekable { reader, base } => {
                let mut reader = reader.lock().await;
                reader.seek(SeekFrom::Start(base + job.offset)).await?;
                read_up_to(&mut *reader, job.length).await
            }
            PartSource::File(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(job.offset)).await?;
                read_up_to(&mut file, job.length).await
            }
            PartSource::Stream(state) => {
                let mut state = state.lock().await;
                if job.offset != state.position {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "stream is at offset {}, part {} wants {}",
                            state.position, job.index, job.offset
                        ),
                    ));
                }

                let data = match state.pending.take() {
                    Some(data) => data,
                    None => read_up_to(&mut state.reader, job.length).await?,
                };
                state.position += data.len() as u64;
                Ok(data)
            }
        }
    }

    /// Push a chunk read from the front of a stream back so the next read
    /// returns it again
    pub(crate) async fn unread(&self, data: Bytes) {
        if let PartSource::Stream(state) = self {
            let mut state = state.lock().await;
            state.position -= data.len() as u64;
            state.pending = Some(data);
        }
    }
}

async fn read_up_to<R>(reader: &mut R, len: u64) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(len as usize);
    let mut limited = reader.take(len);
    limited.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}
