use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use safequeue::{QueueError, Record, RecordWriter, WriterConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "safequeue-writer.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "1000000")]
    count: u64,
    #[clap(long = "payload-size", default_value = "32")]
    payload_size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    info!(config = %opts.config, ?cfg, "starting writer");

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    {
        let closing = Arc::clone(&closing);
        thread::spawn(move || {
            for signal in signals.forever() {
                warn!(signal, "stopping writer");
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    let writer = &mut RecordWriter::new(&cfg)?;
    run(writer, &opts, &closing)?;
    Ok(())
}

fn message(seq: u64, payload: &str, pid: u32) -> Record {
    Record::new()
        .with("seq", seq as f64)
        .with("payload", payload)
        .with("meta", Record::new().with("pid", pid).with("even", seq % 2 == 0))
}

/// Pushes `record`, spinning while the reader catches up.
/// `false` when interrupted before the record went in.
fn push_blocking(writer: &mut RecordWriter, record: &Record, closing: &AtomicBool) -> Result<bool, QueueError> {
    loop {
        match writer.push(record) {
            Ok(()) => return Ok(true),
            Err(e) if e.is_retryable() => {
                if closing.load(Ordering::Relaxed) {
                    return Ok(false);
                }
                thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}

fn run(writer: &mut RecordWriter, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let payload = "x".repeat(opts.payload_size);
    let pid = process::id();
    let mut called = 0u64;

    while called < opts.count && !closing.load(Ordering::Relaxed) {
        if !push_blocking(writer, &message(called, &payload, pid), closing)? {
            break;
        }
        called += 1;
        if called % 100_000 == 0 {
            eprint!("\rTotal {} ops", called);
        }
    }

    let end = Record::new().with("end", true);
    if !push_blocking(writer, &end, closing)? {
        warn!("end marker not written");
    }

    let duration = start.elapsed();
    let iops = (called as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K records write/s. Total {} records in {:#?}",
        (iops / 1000f64) as u64,
        called,
        duration
    );
    info!(status = ?writer.status(), "writer done");
    Ok(())
}
