use std::{
    io::Write,
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
        TryLockError,
    },
};

use flate2::{
    Compress,
    Compression,
    Crc,
    FlushCompress,
    Status,
};

use crate::coredump::{
    error::{
        CompressError,
        SinkError,
    },
    writer::CoreSink,
    DumpError,
};

/// Default name stored in the gzip header
pub const DEFAULT_GZIP_NAME: &str = "Coredump.gz";
/// Default amount of input that is deflated at once
pub const DEFAULT_CHUNK_SIZE: usize = 3 * 1024 * 1024;
/// Room for the output of the final flush
pub const STREAM_END_SPACE: usize = 12;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_METHOD_DEFLATE: u8 = 8;
const GZIP_FLAG_NAME: u8 = 0x08;
/// Extra flags: maximum compression
const GZIP_XFL: u8 = 2;
/// Operating system: Unix
const GZIP_OS: u8 = 3;

const COMPRESSION_LEVEL: u32 = 8;

/// The input buffer shared by all compressing dumps
static DEFLATE_WORKSPACE: Mutex<Vec<u8>> = Mutex::new(Vec::new());

/// Exclusive use of the deflate workspace for the duration of one dump
pub struct CompressionSession {
    workspace: MutexGuard<'static, Vec<u8>>,
}

impl CompressionSession {
    /// Wait until no other dump is compressing
    pub fn acquire() -> Self {
        Self {
            workspace: DEFLATE_WORKSPACE.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Like [`acquire`](Self::acquire) but returns `None` if the workspace is in use
    pub fn try_acquire() -> Option<Self> {
        let workspace = match DEFLATE_WORKSPACE.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(err)) => err.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };

        Some(Self {
            workspace,
        })
    }

    fn prepare(&mut self, chunk_size: usize) -> Result<(), DumpError> {
        self.workspace.clear();
        let missing = chunk_size.saturating_sub(self.workspace.capacity());
        self.workspace.try_reserve_exact(missing).map_err(|_| DumpError::OutOfMemory(chunk_size))
    }
}

/// Compresses a core file into a gzip container on the fly
pub struct GzipSink<W: Write> {
    session: CompressionSession,
    inner: W,
    header: Option<Vec<u8>>,
    compress: Compress,
    crc: Crc,
    output: Vec<u8>,
    chunk_size: usize,
}

impl<W: Write> GzipSink<W> {
    /// Start a gzip stream into `inner`. The header is written together with the first content.
    pub fn new(mut session: CompressionSession, inner: W, name: &str, mtime: u32, chunk_size: usize) -> Result<Self, DumpError> {
        session.prepare(chunk_size)?;

        let output_size = chunk_size + chunk_size / 1000 + STREAM_END_SPACE + 64;
        let mut output = Vec::new();
        output.try_reserve_exact(output_size).map_err(|_| DumpError::OutOfMemory(output_size))?;

        let mut header = Vec::with_capacity(10 + name.len() + 1);
        header.extend_from_slice(&GZIP_MAGIC);
        header.push(GZIP_METHOD_DEFLATE);
        header.push(GZIP_FLAG_NAME);
        header.extend_from_slice(&mtime.to_le_bytes());
        header.push(GZIP_XFL);
        header.push(GZIP_OS);
        header.extend_from_slice(name.as_bytes());
        header.push(0);

        Ok(Self {
            session,
            inner,
            header: Some(header),
            compress: Compress::new(Compression::new(COMPRESSION_LEVEL), false),
            crc: Crc::new(),
            output,
            chunk_size,
        })
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        if let Some(header) = self.header.take() {
            self.inner.write_all(&header)?;
        }

        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn deflate_chunk(&mut self, finish: bool) -> Result<(), SinkError> {
        self.write_header()?;

        let flush = if finish { FlushCompress::Finish } else { FlushCompress::Partial };
        let mut consumed = 0;

        loop {
            let total_in = self.compress.total_in();
            let input = &self.session.workspace[consumed..];

            self.output.clear();
            let status = self.compress.compress_vec(input, &mut self.output, flush).map_err(|err| CompressError::Deflate(err.to_string()))?;

            let used = (self.compress.total_in() - total_in) as usize;
            consumed += used;
            self.inner.write_all(&self.output)?;

            let progress = used > 0 || !self.output.is_empty();
            let output_full = self.output.len() == self.output.capacity();

            match status {
                Status::StreamEnd if finish => break,
                Status::Ok if finish && progress => continue,
                Status::Ok | Status::BufError if !finish && progress && (consumed < self.session.workspace.len() || output_full) => continue,
                Status::Ok | Status::BufError if !finish && consumed == self.session.workspace.len() => break,
                status => return Err(CompressError::UnexpectedStatus(format!("{:?}", status)).into()),
            }
        }

        self.session.workspace.clear();
        Ok(())
    }

    fn feed(&mut self, mut data: &[u8]) -> Result<(), SinkError> {
        while !data.is_empty() {
            let room = self.chunk_size - self.session.workspace.len();
            let count = room.min(data.len());

            self.session.workspace.extend_from_slice(&data[..count]);
            self.crc.update(&data[..count]);
            data = &data[count..];

            if self.session.workspace.len() == self.chunk_size {
                self.deflate_chunk(false)?;
            }
        }

        Ok(())
    }
}

impl<W: Write> CoreSink for GzipSink<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.feed(data)
    }

    fn skip(&mut self, mut len: u64) -> Result<(), SinkError> {
        let zeros = [0u8; 4096];

        while len > 0 {
            let count = len.min(zeros.len() as u64) as usize;
            self.feed(&zeros[..count])?;
            len -= count as u64;
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.deflate_chunk(true)?;

        let mut trailer = [0u8; 8];
        trailer[..4].copy_from_slice(&self.crc.sum().to_le_bytes());
        trailer[4..].copy_from_slice(&self.crc.amount().to_le_bytes());
        self.inner.write_all(&trailer)?;
        self.inner.flush()?;
        Ok(())
    }
}
