//! Runs the exhaustive buffer allocator self-test on the host.
//!
//! A region is set up the way the IPC layer would set one up for a process, and then several
//! threads race to start the self-test on it, which must still only run once.
#![deny(missing_docs)]

use std::{num::NonZeroU32, process::ExitCode, sync::Arc, thread};

use clap::Parser;
use ipc_buffers_core::{
    memory::{BufferAllocator as _, BufferRegion, FramePool, PageSize, ReclaimList},
    selftest::{SelfTest, DEFAULT_BUFFER_COUNT},
};
use log::{debug, error, info, LevelFilter};
use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};

mod logging;

/// Exhaustively test the page-backed IPC buffer allocator.
#[derive(Parser, Debug)]
#[command(name = "ipc-buffers", version)]
struct Args {
    /// Page size of the region in bytes (4096, 16384 or 65536).
    #[arg(long, default_value_t = 4096)]
    page_size: usize,

    /// Number of pages in the region.
    #[arg(long, default_value_t = 16)]
    region_pages: usize,

    /// Number of physical frames available to back the region. Defaults to one per page.
    #[arg(long)]
    frames: Option<u32>,

    /// Number of threads that concurrently try to start the self-test.
    #[arg(long, default_value_t = 4)]
    callers: usize,

    /// Log level, unless overridden by `RUST_LOG`.
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

/// Errors that stop the runner before or while starting the self-test.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("unsupported page size of {size} bytes"))]
    PageSize {
        size: usize,
        source: ipc_buffers_core::memory::Error,
    },
    #[snafu(display("region of {pages} pages is too small, the self-test needs at least {min}"))]
    RegionTooSmall { pages: usize, min: usize },
    #[snafu(display("need at least one frame to back the region"))]
    NoFrames,
    #[snafu(display("failed to start caller thread {index}"))]
    SpawnCaller {
        index: usize,
        source: std::io::Error,
    },
    #[snafu(display("caller thread {index} panicked"))]
    CallerPanicked { index: usize },
}

type Result<T, E = Error> = std::result::Result<T, E>;

fn run(args: &Args) -> Result<()> {
    let page_size = PageSize::try_from(args.page_size).context(PageSizeSnafu {
        size: args.page_size,
    })?;
    let min = SelfTest::<DEFAULT_BUFFER_COUNT>::MIN_REGION_PAGES;
    ensure!(
        args.region_pages >= min,
        RegionTooSmallSnafu {
            pages: args.region_pages,
            min
        }
    );
    let frames = args
        .frames
        .or_else(|| u32::try_from(args.region_pages).ok())
        .and_then(NonZeroU32::new)
        .context(NoFramesSnafu)?;

    let frames = Arc::new(FramePool::new(frames));
    let lru = Arc::new(ReclaimList::new());
    let region = BufferRegion::new(page_size, args.region_pages, frames.clone(), lru);
    region.map();
    info!(
        "region: {} pages of {} bytes, {} frames",
        args.region_pages,
        page_size.bytes(),
        frames.capacity()
    );

    let selftest: SelfTest = SelfTest::new();
    let (test, target) = (&selftest, &region);
    thread::scope(|s| -> Result<()> {
        let callers = (0..args.callers)
            .map(|index| {
                thread::Builder::new()
                    .name(format!("caller-{index}"))
                    .spawn_scoped(s, move || test.run(target))
                    .context(SpawnCallerSnafu { index })
            })
            .collect::<Result<Vec<_>>>()?;
        for (index, caller) in callers.into_iter().enumerate() {
            caller
                .join()
                .ok()
                .context(CallerPanickedSnafu { index })?;
        }
        Ok(())
    })?;

    // a no-op once any caller has finished the run
    selftest.run(&region);
    debug!(
        "self-test completed: {}, {} frames free, {} pages reclaimable",
        selftest.has_run(),
        frames.free_count(),
        region.reclaimable_pages()
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(args.log_level);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
