use std::io::{
    Seek,
    SeekFrom,
    Write,
};

use crate::{
    coredump::{
        error::SinkError,
        layout::CoreDumpLayout,
        process::ProcessView,
        DumpError,
    },
    Logger,
};

/// The destination of the bytes of a core file.
///
/// Content is delivered strictly in file order. Holes are announced with
/// [`skip`](CoreSink::skip) and read back as zeros.
pub trait CoreSink {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;

    fn skip(&mut self, len: u64) -> Result<(), SinkError>;

    /// Called once after the last byte, also when the dump was cut short
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Writes an uncompressed core file and leaves holes for absent pages
pub struct RawSink<W: Write + Seek> {
    inner: W,
    pending: u64,
}

impl<W: Write + Seek> RawSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn seek_pending(&mut self, keep: u64) -> Result<(), SinkError> {
        if self.pending > keep {
            let distance = i64::try_from(self.pending - keep).map_err(|_| SinkError::Io(std::io::ErrorKind::InvalidInput.into()))?;
            self.inner.seek(SeekFrom::Current(distance))?;
            self.pending = keep;
        }

        Ok(())
    }
}

impl<W: Write + Seek> CoreSink for RawSink<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.seek_pending(0)?;
        self.inner.write_all(data)?;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> Result<(), SinkError> {
        self.pending += len;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        /* A trailing hole needs one real byte to give the file its size */
        if self.pending > 0 {
            self.seek_pending(1)?;
            self.pending = 0;
            self.inner.write_all(&[0])?;
        }

        self.inner.flush()?;
        Ok(())
    }
}

/// Why a dump ended early
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The size limit would have been exceeded
    Limit,
    /// The destination failed
    Io,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DumpStatus {
    Complete,
    Incomplete(StopReason),
}

/// The outcome of a dump that could be started
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpReport {
    pub status: DumpStatus,
    /// Bytes that were actually written, excluding holes. This is what the limit applies to.
    pub bytes_written: u64,
    /// Size of the core image up to where it ended, holes included
    pub logical_size: u64,
    /// Pages whose content was written
    pub present_pages: u64,
    /// Absent pages that were left as holes
    pub zero_pages: u64,
}

impl DumpReport {
    pub fn is_complete(&self) -> bool {
        self.status == DumpStatus::Complete
    }
}

enum Interrupt {
    Stopped(StopReason),
    Failed(DumpError),
}

/// Emits the parts of a core file in order and enforces the size limit
pub(crate) struct CoreWriter<'a, S: CoreSink> {
    sink: S,
    limit: u64,
    written: u64,
    pos: u64,
    present_pages: u64,
    zero_pages: u64,
    logger: &'a Logger,
}

impl<'a, S: CoreSink> CoreWriter<'a, S> {
    pub(crate) fn new(sink: S, limit: u64, logger: &'a Logger) -> Self {
        Self {
            sink,
            limit,
            written: 0,
            pos: 0,
            present_pages: 0,
            zero_pages: 0,
            logger,
        }
    }

    fn interrupt(&self, err: SinkError) -> Interrupt {
        match err {
            SinkError::Io(err) => {
                self.logger.error(format!("Could not write core dump: {}", err));
                Interrupt::Stopped(StopReason::Io)
            },
            SinkError::Compress(err) => Interrupt::Failed(DumpError::Compression(err)),
        }
    }

    fn emit(&mut self, data: &[u8]) -> Result<(), Interrupt> {
        let len = data.len() as u64;

        match self.written.checked_add(len) {
            Some(total) if total <= self.limit => {},
            _ => return Err(Interrupt::Stopped(StopReason::Limit)),
        }

        if let Err(err) = self.sink.write(data) {
            return Err(self.interrupt(err));
        }

        self.written += len;
        self.pos += len;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> Result<(), Interrupt> {
        if let Err(err) = self.sink.skip(len) {
            return Err(self.interrupt(err));
        }

        self.pos += len;
        Ok(())
    }

    fn write_parts(&mut self, layout: &CoreDumpLayout, notes: &[u8], process: &dyn ProcessView, page_size: u64) -> Result<(), Interrupt> {
        self.emit(&layout.header_bytes())?;
        self.emit(notes)?;

        debug_assert!(self.pos <= layout.data_offset);
        self.skip(layout.data_offset - self.pos)?;

        for region in &layout.regions {
            debug_assert_eq!(self.pos, region.offset);

            let end = region.start + region.dump_size;
            let mut addr = region.start;
            let mut absent = 0;

            while addr < end {
                let len = page_size.min(end - addr);

                match process.dump_page(addr) {
                    Some(page) => {
                        self.emit(&page[..len as usize])?;
                        self.present_pages += 1;
                    },
                    None => {
                        self.skip(len)?;
                        self.zero_pages += 1;
                        absent += 1;
                    },
                }

                addr += len;
            }

            self.logger.debug(format!("Dumped {:#x}-{:#x}: {:#x} bytes, {} absent pages", region.start, region.end, region.dump_size, absent));
        }

        if let Some(shdr) = &layout.extnum {
            debug_assert_eq!(self.pos, layout.shoff);
            self.emit(&shdr.to_bytes())?;
        }

        Ok(())
    }

    /// Write the whole core file described by `layout`
    pub(crate) fn write_dump(mut self, layout: &CoreDumpLayout, notes: &[u8], process: &dyn ProcessView, page_size: u64) -> Result<DumpReport, DumpError> {
        let mut status = match self.write_parts(layout, notes, process, page_size) {
            Ok(()) => DumpStatus::Complete,
            Err(Interrupt::Stopped(reason)) => DumpStatus::Incomplete(reason),
            Err(Interrupt::Failed(err)) => return Err(err),
        };

        if let DumpStatus::Incomplete(StopReason::Limit) = status {
            self.logger.warning(format!("Core dump truncated at {:#x} bytes", self.written));
        }

        if let Err(err) = self.sink.finish() {
            match self.interrupt(err) {
                Interrupt::Stopped(reason) => {
                    if status == DumpStatus::Complete {
                        status = DumpStatus::Incomplete(reason);
                    }
                },
                Interrupt::Failed(err) => return Err(err),
            }
        }

        Ok(DumpReport {
            status,
            bytes_written: self.written,
            logical_size: self.pos,
            present_pages: self.present_pages,
            zero_pages: self.zero_pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn sparse_tail() {
        let mut sink = RawSink::new(Cursor::new(Vec::new()));
        sink.write(b"abc").unwrap();
        sink.skip(5).unwrap();
        sink.write(b"d").unwrap();
        sink.skip(4).unwrap();
        sink.finish().unwrap();

        let data = sink.into_inner().into_inner();
        assert_eq!(data.len(), 13);
        assert_eq!(&data[..4], b"abc\0");
        assert_eq!(data[8], b'd');
        assert!(data[9..].iter().all(|b| *b == 0));
    }

    struct FailingSink;

    impl CoreSink for FailingSink {
        fn write(&mut self, _data: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn skip(&mut self, _len: u64) -> Result<(), SinkError> {
            Ok(())
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn limit_counts_written_bytes() {
        let logger = Logger::spinner();
        let mut writer = CoreWriter::new(RawSink::new(Cursor::new(Vec::new())), 10, &logger);

        assert!(writer.emit(&[1; 6]).is_ok());
        assert!(writer.skip(0x1000).is_ok());
        assert!(writer.emit(&[2; 4]).is_ok());
        assert!(matches!(writer.emit(&[3; 1]), Err(Interrupt::Stopped(StopReason::Limit))));
        assert_eq!(writer.written, 10);
        assert_eq!(writer.pos, 0x100a);

        let mut writer = CoreWriter::new(FailingSink, u64::MAX, &logger);
        assert!(matches!(writer.emit(&[1]), Err(Interrupt::Stopped(StopReason::Io))));
    }
}
