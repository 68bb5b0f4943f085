use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use safequeue::{ReaderConfig, Record, RecordReader, Value};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "safequeue-reader.toml")]
    config: String,
    /// Give up after this long without a record. 0 waits forever.
    #[clap(long = "idle-timeout-ms", default_value = "0")]
    idle_timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    info!(config = %opts.config, ?cfg, "starting reader");

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    {
        let closing = Arc::clone(&closing);
        thread::spawn(move || {
            for signal in signals.forever() {
                warn!(signal, "stopping reader");
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    let reader = &mut RecordReader::new(&cfg)?;
    if let Err(e) = run(reader, &opts, &closing) {
        error!(error = %e, "reader failed");
        process::exit(1);
    }
    Ok(())
}

fn is_end(record: &Record) -> bool {
    record.get("end").and_then(Value::as_bool).unwrap_or(false)
}

fn run(reader: &mut RecordReader, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let idle_timeout = Duration::from_millis(opts.idle_timeout_ms);
    let start = Instant::now();
    let mut last_seen = Instant::now();
    let mut expected = 0u64;

    loop {
        let record = match reader.pop()? {
            Some(record) => record,
            None => {
                if closing.load(Ordering::Relaxed) {
                    return Err(format!("interrupted before the end marker, after seq {}", expected).into());
                }
                if !idle_timeout.is_zero() && last_seen.elapsed() > idle_timeout {
                    return Err(format!("no record for {:?} after seq {}", idle_timeout, expected).into());
                }
                thread::yield_now();
                continue;
            }
        };
        last_seen = Instant::now();
        if is_end(&record) {
            println!("\nFinished after {} records", expected);
            break;
        }
        let seq = record
            .get("seq")
            .and_then(Value::as_number)
            .ok_or_else(|| format!("record without seq: {:?}", record))?;
        if seq != expected as f64 {
            return Err(format!("gap in sequence: expected {}, got {}", expected, seq).into());
        }
        expected += 1;
        if expected % 100_000 == 0 {
            eprint!("\rTotal {} ops (current seq: {})", expected, seq);
        }
    }

    let duration = start.elapsed();
    let iops = (expected as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K records read/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    info!(status = ?reader.status(), "reader done");
    Ok(())
}
