use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use backtrack::{Backtracer, CaptureConfig};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

// Architecture info helper
fn get_architecture_info() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    return "x86_64";
    #[cfg(target_arch = "aarch64")]
    return "aarch64";
}

/// Which threads to report on
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// The process's main thread
    Main,
    /// The thread running the capture
    Current,
    /// Every live thread
    All,
}

#[derive(Parser, Debug)]
#[command(name = "backtrack")]
#[command(version)]
#[command(about = "Print backtraces of this process's own threads", long_about = None)]
struct Cli {
    /// Threads to capture
    #[arg(short, long, value_enum, default_value = "all")]
    mode: Mode,

    /// Number of named worker threads to spawn before capturing
    #[arg(short, long, value_name = "N", default_value = "2")]
    workers: usize,

    /// Maximum frames per thread (overrides BACKTRACK_MAX_DEPTH)
    #[arg(long = "max-depth", value_name = "N")]
    max_depth: Option<usize>,

    /// Show the captured registers of each thread
    #[arg(long)]
    registers: bool,

    /// Append the list of loaded executable images
    #[arg(long)]
    images: bool,

    /// Resolve source file and line from DWARF
    #[arg(long = "source-lines")]
    source_lines: bool,

    /// Enable debug logging to stderr
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Named threads parked a few calls deep until told to stop.
struct Workers {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Workers {
    fn spawn(count: usize) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(Barrier::new(count + 1));
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    ready.wait();
                    worker_outer(&stop);
                })
                .with_context(|| format!("Failed to spawn worker-{i}"))?;
            handles.push(handle);
        }
        ready.wait();
        Ok(Workers { stop, handles })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

#[inline(never)]
fn worker_outer(stop: &AtomicBool) {
    black_box(worker_middle(stop));
}

#[inline(never)]
fn worker_middle(stop: &AtomicBool) -> u64 {
    black_box(worker_park(stop)) + 1
}

#[inline(never)]
fn worker_park(stop: &AtomicBool) -> u64 {
    let mut naps = 0u64;
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(5));
        naps = black_box(naps + 1);
    }
    naps
}

fn main() -> anyhow::Result<()> {
    backtrack::init();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    tracing::debug!(arch = get_architecture_info(), mode = ?cli.mode, workers = cli.workers, "starting");

    // Flags only switch things on; the environment may already have.
    let env = CaptureConfig::from_env();
    let mut config = env
        .clone()
        .with_registers(env.include_registers || cli.registers)
        .with_images(env.include_images || cli.images)
        .with_source_locations(env.source_locations || cli.source_lines);
    if let Some(max_depth) = cli.max_depth {
        config = config.with_max_depth(max_depth);
    }
    let backtracer = Backtracer::new(config);

    let workers = Workers::spawn(cli.workers)?;
    let report = match cli.mode {
        Mode::Main => backtracer.capture_main_thread(),
        Mode::Current => backtracer.capture_current_thread(),
        Mode::All => backtracer.capture_all_threads(),
    };
    workers.stop();

    print!("{report}");
    Ok(())
}
