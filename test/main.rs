//! Runs `writer_bench` and `reader_bench` as two real processes sharing one
//! queue, then checks the reader saw every record in order.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

use safequeue::core::remove_regions;
use safequeue::{ShmemConfig, Terminator, WriterConfig};
use tempfile::Builder;

const RECORDS: u64 = 200_000;

fn bench(cargo: &str, manifest: &Path, package: &str, config: &Path, extra: &[&str]) -> io::Result<Child> {
    Command::new(cargo)
        .arg("run")
        .arg("--release")
        .arg("--manifest-path")
        .arg(manifest)
        .arg("--package")
        .arg(package)
        .arg("--")
        .arg("--config")
        .arg(config)
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn report(name: &str, output: &Output) -> bool {
    println!("{} stdout:\n{}", name, String::from_utf8_lossy(&output.stdout));
    println!("{} stderr:\n{}", name, String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        eprintln!("{} failed with status: {}", name, output.status);
    }
    output.status.success()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = Builder::new().prefix("safequeue_bench").tempdir()?;
    let config_file_path: PathBuf = temp_dir.path().join("bench_config.toml");

    let shmem = ShmemConfig::builder()
        .data_dir(temp_dir.path().to_string_lossy())
        .control_file_name("bench.ctrl")
        .data_file_name("bench.data")
        .capacity(64)
        .slot_size(256)
        .build()?;
    let cfg = WriterConfig {
        shmem: shmem.clone(),
        terminator: Terminator::Explicit,
    };
    confy::store_path(&config_file_path, &cfg)?;
    println!("Temporary benchmark config created at: {}", config_file_path.display());

    let cargo_executable = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("../Cargo.toml");

    // Build once up front so neither process spends its idle timeout compiling.
    let build = Command::new(&cargo_executable)
        .arg("build")
        .arg("--release")
        .arg("--manifest-path")
        .arg(&manifest)
        .args(["--package", "writer_bench", "--package", "reader_bench"])
        .status()?;
    if !build.success() {
        return Err(Box::new(io::Error::new(io::ErrorKind::Other, "bench build failed")));
    }

    let reader = bench(
        &cargo_executable,
        &manifest,
        "reader_bench",
        &config_file_path,
        &["--idle-timeout-ms", "30000"],
    )?;
    let count = RECORDS.to_string();
    let writer = bench(
        &cargo_executable,
        &manifest,
        "writer_bench",
        &config_file_path,
        &["--count", &count, "--payload-size", "64"],
    )?;

    let writer_ok = report("writer_bench", &writer.wait_with_output()?);
    let reader_output = reader.wait_with_output()?;
    let reader_ok = report("reader_bench", &reader_output);
    remove_regions(&shmem)?;

    let finished = format!("Finished after {} records", RECORDS);
    if writer_ok && reader_ok && String::from_utf8_lossy(&reader_output.stdout).contains(&finished) {
        println!("\nSimulation successful! All records sent and received in order.");
        Ok(())
    } else {
        eprintln!("\nSimulation failed.");
        Err(Box::new(io::Error::new(io::ErrorKind::Other, "Simulation failed")))
    }
}
