mod config;
mod device;
mod geometry;
mod observer;
mod runner;
mod unit;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use argon2_hash_spec::{HashParams, ProgramContext, ARGON2_BLOCK_SIZE};

use config::{Config, Mode};
use device::{memory_budget_mib, query_devices, select_device, CudaDeviceBinding};
use observer::{SilentObserver, StderrObserver, UnitObserver};
use runner::cuda::{CudaKernelRunner, CudaRunnerOptions};
use unit::ProcessingUnit;

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;

    if cfg.mode == Mode::ListDevices {
        return list_devices();
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let devices = query_devices()?;
    let device = select_device(&devices, cfg.device_index)?.clone();

    let params = HashParams::new(
        cfg.hash_len,
        cfg.salt.as_bytes(),
        cfg.time_cost,
        cfg.memory_kib,
        cfg.lanes,
    )?;
    let context = ProgramContext {
        kind: cfg.kind,
        version: cfg.version,
    };

    let required_mib = required_memory_mib(&params, cfg.batch_size);
    let budget_mib = memory_budget_mib(device.memory_total_mib, device.memory_free_mib);
    if required_mib > budget_mib {
        eprintln!(
            "[warn] batch needs ~{required_mib} MiB but device {} has ~{budget_mib} MiB to spare; expect allocation failures",
            device.index
        );
    }

    println!(
        "using device {} ({}, {} MiB) | {} v{} m={} KiB t={} lanes={} | batch={}",
        device.index,
        device.name,
        device.memory_total_mib,
        cfg.kind,
        cfg.version,
        cfg.memory_kib,
        cfg.time_cost,
        cfg.lanes,
        cfg.batch_size,
    );

    let binding = CudaDeviceBinding::new(device.index)?;
    let runner = CudaKernelRunner::new(
        &binding,
        &params,
        context,
        cfg.batch_size,
        CudaRunnerOptions {
            by_segment: cfg.by_segment,
            precompute_refs: cfg.precompute_refs,
        },
    )?;

    let observer: Box<dyn UnitObserver> = if cfg.verbose || geometry::debug_env_enabled() {
        Box::new(StderrObserver)
    } else {
        Box::new(SilentObserver)
    };

    let mut unit = ProcessingUnit::new(
        Box::new(binding),
        Box::new(runner),
        observer,
        params,
        context,
        cfg.batch_size,
    )?;
    println!("tuned geometry: {}", unit.tuned_geometry());

    if cfg.mode == Mode::Bench {
        run_benchmark(&cfg, &mut unit, &shutdown)
    } else {
        run_hashing(&cfg, &mut unit, &shutdown)
    }
}

fn list_devices() -> Result<()> {
    let devices = query_devices()?;
    for device in &devices {
        let free = device
            .memory_free_mib
            .map(|mib| format!("{mib} MiB free"))
            .unwrap_or_else(|| "free unknown".to_string());
        println!(
            "[{}] {} | {} MiB total | {} | ~{} MiB usable",
            device.index,
            device.name,
            device.memory_total_mib,
            free,
            memory_budget_mib(device.memory_total_mib, device.memory_free_mib),
        );
    }
    Ok(())
}

/// Hashes passwords read line by line, one batch at a time, and prints one
/// lowercase hex hash per input line in input order. A partial final chunk
/// leaves the remaining job slots untouched; their results are not read.
fn run_hashing(cfg: &Config, unit: &mut ProcessingUnit, shutdown: &AtomicBool) -> Result<()> {
    let passwords = read_password_lines(cfg.input.as_deref())?;
    if passwords.is_empty() {
        println!("no passwords to hash");
        return Ok(());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut hash = vec![0u8; unit.output_len()];
    let started = Instant::now();
    let mut hashed = 0usize;

    for chunk in passwords.chunks(unit.batch_size()) {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        for (index, password) in chunk.iter().enumerate() {
            unit.set_password(index, password.as_bytes())
                .with_context(|| format!("staging password for job slot {index}"))?;
        }

        unit.begin_processing()?;
        unit.end_processing()?;

        for index in 0..chunk.len() {
            unit.get_hash(index, &mut hash)
                .with_context(|| format!("reading hash for job slot {index}"))?;
            writeln!(out, "{}", hex::encode(&hash))?;
        }
        hashed += chunk.len();
    }

    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    eprintln!(
        "[done] {hashed} hashes in {elapsed:.2}s ({})",
        format_hashrate(hashed as f64 / elapsed)
    );
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BenchRun {
    round: u32,
    hashes: u64,
    elapsed_secs: f64,
    hps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BenchReport {
    kind: String,
    version: u32,
    memory_kib: u32,
    time_cost: u32,
    lanes: u32,
    batch_size: usize,
    device_index: u32,
    tuned_lanes_per_block: u32,
    tuned_jobs_per_block: u32,
    bench_secs: u64,
    rounds: u32,
    avg_hps: f64,
    median_hps: f64,
    min_hps: f64,
    max_hps: f64,
    runs: Vec<BenchRun>,
}

/// Each round stages one deterministic batch, then re-dispatches it until the
/// configured seconds elapse. Slots keep their staged inputs between
/// dispatches, so only dispatch-to-completion work lands in the timed window.
fn run_benchmark(cfg: &Config, unit: &mut ProcessingUnit, shutdown: &AtomicBool) -> Result<()> {
    let tuned = unit.tuned_geometry();
    println!(
        "benchmark mode | rounds={} | seconds_per_round={} | batch={}",
        cfg.bench_rounds,
        cfg.bench_secs,
        unit.batch_size(),
    );

    let mut runs = Vec::with_capacity(cfg.bench_rounds as usize);
    for round in 0..cfg.bench_rounds {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        for index in 0..unit.batch_size() {
            let password = benchmark_password(round, index);
            unit.set_password(index, &password)
                .with_context(|| format!("staging benchmark password {index}"))?;
        }

        let round_start = Instant::now();
        let stop_at = round_start + Duration::from_secs(cfg.bench_secs);
        let mut hashes = 0u64;
        loop {
            unit.begin_processing()?;
            unit.end_processing()?;
            hashes += unit.batch_size() as u64;
            if Instant::now() >= stop_at || shutdown.load(Ordering::Relaxed) {
                break;
            }
        }
        let elapsed = round_start.elapsed().as_secs_f64().max(0.001);

        let hps = hashes as f64 / elapsed;
        println!(
            "[bench] round {}/{} | hashes={} | elapsed={:.2}s | {}",
            round + 1,
            cfg.bench_rounds,
            hashes,
            elapsed,
            format_hashrate(hps),
        );

        runs.push(BenchRun {
            round: round + 1,
            hashes,
            elapsed_secs: elapsed,
            hps,
        });
    }

    summarize_benchmark(
        cfg,
        BenchReport {
            kind: cfg.kind.to_string(),
            version: cfg.version.as_u32(),
            memory_kib: cfg.memory_kib,
            time_cost: cfg.time_cost,
            lanes: cfg.lanes,
            batch_size: unit.batch_size(),
            device_index: unit.device_index(),
            tuned_lanes_per_block: tuned.lanes_per_block,
            tuned_jobs_per_block: tuned.jobs_per_block,
            bench_secs: cfg.bench_secs,
            rounds: runs.len() as u32,
            avg_hps: 0.0,
            median_hps: 0.0,
            min_hps: 0.0,
            max_hps: 0.0,
            runs,
        },
    )
}

fn summarize_benchmark(cfg: &Config, mut report: BenchReport) -> Result<()> {
    if report.runs.is_empty() {
        println!("benchmark aborted before first round");
        return Ok(());
    }

    let mut sorted_hps: Vec<f64> = report.runs.iter().map(|r| r.hps).collect();
    sorted_hps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    report.avg_hps = sorted_hps.iter().sum::<f64>() / sorted_hps.len() as f64;
    report.median_hps = median(&sorted_hps);
    report.min_hps = *sorted_hps.first().unwrap_or(&0.0);
    report.max_hps = *sorted_hps.last().unwrap_or(&0.0);

    println!(
        "[bench] summary | avg={} | median={} | min={} | max={}",
        format_hashrate(report.avg_hps),
        format_hashrate(report.median_hps),
        format_hashrate(report.min_hps),
        format_hashrate(report.max_hps),
    );

    if let Some(path) = &cfg.bench_baseline {
        let baseline_text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read baseline file {}", path.display()))?;
        let baseline: BenchReport = serde_json::from_str(&baseline_text)
            .with_context(|| format!("failed to parse baseline JSON {}", path.display()))?;
        if baseline.avg_hps > 0.0 {
            let delta_pct = ((report.avg_hps - baseline.avg_hps) / baseline.avg_hps) * 100.0;
            println!(
                "[bench] baseline compare | baseline_avg={} | delta={:+.2}%",
                format_hashrate(baseline.avg_hps),
                delta_pct
            );
        }
    }

    if let Some(path) = &cfg.bench_output {
        let json = serde_json::to_string_pretty(&report)
            .context("failed to serialize benchmark report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write benchmark report {}", path.display()))?;
        println!("[bench] wrote report to {}", path.display());
    }

    Ok(())
}

/// Deterministic per-round, per-slot candidate so repeated benchmark runs
/// hash identical inputs.
fn benchmark_password(round: u32, index: usize) -> Vec<u8> {
    let mut data = vec![0u8; 24];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i as u8)
            .wrapping_mul(37)
            .wrapping_add(11)
            .wrapping_add((round % 251) as u8)
            .wrapping_mul((index % 251) as u8 | 1);
    }
    data
}

fn required_memory_mib(params: &HashParams, batch_size: usize) -> u64 {
    let bytes = params.memory_blocks() as u64 * ARGON2_BLOCK_SIZE as u64 * batch_size as u64;
    bytes.div_ceil(1024 * 1024)
}

fn read_password_lines(input: Option<&Path>) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open password file {}", path.display()))?;
            collect_password_lines(BufReader::new(file), &mut lines)?;
        }
        None => {
            let stdin = io::stdin();
            collect_password_lines(stdin.lock(), &mut lines)?;
        }
    }
    Ok(lines)
}

/// One candidate per line; a trailing `\r` from CRLF input is stripped,
/// empty lines stay as empty passwords.
fn collect_password_lines(reader: impl BufRead, out: &mut Vec<String>) -> Result<()> {
    for line in reader.lines() {
        let mut line = line.context("failed to read password line")?;
        if line.ends_with('\r') {
            line.pop();
        }
        out.push(line);
    }
    Ok(())
}

fn format_hashrate(hps: f64) -> String {
    if hps >= 1_000_000_000.0 {
        return format!("{:.3} GH/s", hps / 1_000_000_000.0);
    }
    if hps >= 1_000_000.0 {
        return format!("{:.3} MH/s", hps / 1_000_000.0);
    }
    if hps >= 1_000.0 {
        return format!("{:.3} KH/s", hps / 1_000.0);
    }
    format!("{hps:.3} H/s")
}

fn median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len().is_multiple_of(2) {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[5.0]), 5.0);
        assert_eq!(median(&[1.0, 3.0, 5.0]), 3.0);
        assert_eq!(median(&[1.0, 3.0, 5.0, 7.0]), 4.0);
    }

    #[test]
    fn format_hashrate_units() {
        assert_eq!(format_hashrate(5.0), "5.000 H/s");
        assert_eq!(format_hashrate(5_000.0), "5.000 KH/s");
        assert_eq!(format_hashrate(5_000_000.0), "5.000 MH/s");
    }

    #[test]
    fn benchmark_password_is_deterministic_per_slot() {
        assert_eq!(benchmark_password(3, 7), benchmark_password(3, 7));
        assert_ne!(benchmark_password(3, 7), benchmark_password(4, 7));
        assert_ne!(benchmark_password(3, 7), benchmark_password(3, 8));
        assert_eq!(benchmark_password(0, 0).len(), 24);
    }

    #[test]
    fn required_memory_rounds_up_to_whole_mib() {
        let exact = HashParams::new(32, b"somesalt", 1, 1024, 1)
            .expect("1 MiB parameters should validate");
        assert_eq!(required_memory_mib(&exact, 3), 3);

        let fractional = HashParams::new(32, b"somesalt", 1, 1000, 1)
            .expect("sub-MiB parameters should validate");
        assert_eq!(required_memory_mib(&fractional, 1), 1);
    }

    #[test]
    fn collect_password_lines_strips_crlf() {
        let mut lines = Vec::new();
        collect_password_lines("alpha\r\nbeta\n\ngamma".as_bytes(), &mut lines)
            .expect("fixture should read");
        assert_eq!(lines, vec!["alpha", "beta", "", "gamma"]);
    }
}
