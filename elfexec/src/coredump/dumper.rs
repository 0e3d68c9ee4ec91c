use std::io::{
    Seek,
    Write,
};

use crate::{
    coredump::{
        collect::collect_notes,
        compress::{
            CompressionSession,
            GzipSink,
            DEFAULT_CHUNK_SIZE,
            DEFAULT_GZIP_NAME,
        },
        layout::CoreDumpLayout,
        policy::{
            DumpFilter,
            DumpPolicy,
        },
        process::ProcessView,
        regs::RegisterView,
        writer::{
            CoreSink,
            CoreWriter,
            DumpReport,
            DumpStatus,
            RawSink,
        },
        DumpError,
    },
    elf::Arch,
    Logger,
};

/// Writes ELF core dumps of processes.
///
/// Collection and compression failures are a [`DumpError`]. Everything else produces
/// a [`DumpReport`]. A dump that hit the size limit or a write error is reported as
/// [`DumpStatus::Incomplete`] and its output is a valid prefix of the full core file.
#[derive(Clone, Debug)]
pub struct CoreDumper {
    arch: Arch,
    view: RegisterView,
    policy: DumpPolicy,
    limit: u64,
    compress: bool,
    gzip_name: String,
    gzip_mtime: u32,
    chunk_size: usize,
}

impl CoreDumper {
    /// Create a [`CoreDumperBuilder`]
    pub fn builder() -> CoreDumperBuilder {
        CoreDumperBuilder {
            arch: Arch::default(),
            view: None,
            filter: DumpFilter::default(),
            dump_whole_shared: false,
            limit: u64::MAX,
            compress: false,
            gzip_name: DEFAULT_GZIP_NAME.to_string(),
            gzip_mtime: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    pub fn policy(&self) -> &DumpPolicy {
        &self.policy
    }

    pub fn register_view(&self) -> &RegisterView {
        &self.view
    }

    /// Write a core dump of `process` to `out`
    pub fn dump<W: Write + Seek>(&self, process: &dyn ProcessView, out: W) -> Result<DumpReport, DumpError> {
        let logger = Logger::for_task("Writing core dump", process.info().comm.clone());

        let ret = self.dump_process(process, out, &logger);

        match &ret {
            Ok(report) if report.status == DumpStatus::Complete => {
                logger.info(format!("Wrote {:#x} bytes, {} pages present, {} pages zero", report.logical_size, report.present_pages, report.zero_pages))
            },
            Ok(report) => logger.warning(format!("Core dump is incomplete ({:?}) after {:#x} bytes", report.status, report.logical_size)),
            Err(err) => logger.error(err.to_string()),
        }

        ret
    }

    fn dump_process<W: Write + Seek>(&self, process: &dyn ProcessView, out: W, logger: &Logger) -> Result<DumpReport, DumpError> {
        let page_size = self.arch.page_size();
        let regions = process.regions();

        let notes = collect_notes(process, &self.view, &regions, page_size, logger)?;
        let dump_sizes: Vec<u64> = regions.iter().map(|region| self.policy.dump_size(region, process, page_size)).collect();

        let layout = CoreDumpLayout::new(&self.arch, self.view.machine(), self.view.flags(), &regions, &dump_sizes, notes.size() as u64);
        let note_bytes = notes.to_bytes()?;

        logger.debug(format!("{} segments, {} threads, data at {:#x}", layout.segments(), notes.threads().len(), layout.data_offset));

        if self.compress {
            let session = CompressionSession::acquire();
            let sink = GzipSink::new(session, out, &self.gzip_name, self.gzip_mtime, self.chunk_size)?;
            self.write(sink, &layout, &note_bytes, process, logger)
        } else {
            self.write(RawSink::new(out), &layout, &note_bytes, process, logger)
        }
    }

    fn write<S: CoreSink>(&self, sink: S, layout: &CoreDumpLayout, notes: &[u8], process: &dyn ProcessView, logger: &Logger) -> Result<DumpReport, DumpError> {
        CoreWriter::new(sink, self.limit, logger).write_dump(layout, notes, process, self.arch.page_size())
    }
}

/// Configures a [`CoreDumper`]
pub struct CoreDumperBuilder {
    arch: Arch,
    view: Option<RegisterView>,
    filter: DumpFilter,
    dump_whole_shared: bool,
    limit: u64,
    compress: bool,
    gzip_name: String,
    gzip_mtime: u32,
    chunk_size: usize,
}

impl CoreDumperBuilder {
    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// How registers are read. Defaults to [`RegisterView::for_arch`].
    pub fn register_view(mut self, view: RegisterView) -> Self {
        self.view = Some(view);
        self
    }

    pub fn filter(mut self, filter: DumpFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Dump shared mappings completely, ignoring the filter bits for them
    pub fn dump_whole_shared(mut self, dump_whole_shared: bool) -> Self {
        self.dump_whole_shared = dump_whole_shared;
        self
    }

    /// Maximum number of bytes that are written. Holes do not count.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Wrap the core file in a gzip container
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn gzip_name<S: Into<String>>(mut self, name: S) -> Self {
        self.gzip_name = name.into();
        self
    }

    pub fn gzip_mtime(mut self, mtime: u32) -> Self {
        self.gzip_mtime = mtime;
        self
    }

    /// Amount of uncompressed data that is deflated at once
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn build(self) -> Result<CoreDumper, &'static str> {
        if self.chunk_size == 0 {
            return Err("Chunk size must not be zero");
        }

        if self.gzip_name.as_bytes().contains(&0) {
            return Err("Gzip name must not contain NUL bytes");
        }

        let view = self.view.unwrap_or_else(|| RegisterView::for_arch(&self.arch));

        Ok(CoreDumper {
            arch: self.arch,
            view,
            policy: DumpPolicy::new(self.filter, self.dump_whole_shared),
            limit: self.limit,
            compress: self.compress,
            gzip_name: self.gzip_name,
            gzip_mtime: self.gzip_mtime,
            chunk_size: self.chunk_size,
        })
    }
}
