use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

use argon2_hash_spec::{Argon2Kind, Argon2Version};

const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
const DEFAULT_TIME_COST: u32 = 3;
const DEFAULT_LANES: u32 = 1;
const DEFAULT_HASH_LEN: usize = 32;
const DEFAULT_SALT: &str = "argon2batchsalt";
const DEFAULT_BENCH_ROUNDS: u32 = 5;
const DEFAULT_BENCH_SECS: u64 = 10;

const USAGE: &str = "\
argon2-batch: batched Argon2 hashing on CUDA devices

usage: argon2-batch [options]

modes:
      --bench               time batch fills instead of printing hashes
      --list-devices        print the devices nvidia-smi reports and exit
                            (default: hash passwords line by line)

device and batch:
      --device <index>      CUDA device index (default: first reported)
      --batch <n>           job slots per batch (default: 16)
      --oneshot             fill all passes in one kernel launch instead of
                            one launch per pass/slice wave
      --precompute          resolve data-independent references up front

Argon2 parameters:
      --type <kind>         argon2d, argon2i or argon2id (default: argon2id)
      --version <v>         16 or 19 (default: 19)
  -m, --memory <KiB>        memory cost (default: 65536)
  -t, --time <n>            time cost / passes (default: 3)
  -l, --lanes <n>           lanes per hash (default: 1)
      --hash-len <bytes>    output length (default: 32)
      --salt <text>         salt, at least 8 bytes (default: argon2batchsalt)

hashing:
  -i, --input <path>        read passwords from a file (default: stdin)

benchmarking:
      --rounds <n>          timed rounds (default: 5)
      --secs <n>            seconds per round (default: 10)
      --bench-output <path> write the report as JSON
      --baseline <path>     compare against an earlier JSON report

  -v, --verbose             report tuning and dispatch on stderr
  -h, --help                show this help

Geometry overrides are read from the environment before every dispatch:
A2_LPB (lanes per block), A2_JPB (jobs per block), A2_FORCE (use maxima
for unset dimensions), A2_DEBUG (dispatch diagnostics on stderr).
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Hash,
    Bench,
    ListDevices,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub device_index: Option<u32>,
    pub batch_size: usize,
    pub kind: Argon2Kind,
    pub version: Argon2Version,
    pub memory_kib: u32,
    pub time_cost: u32,
    pub lanes: u32,
    pub hash_len: usize,
    pub salt: String,
    pub by_segment: bool,
    pub precompute_refs: bool,
    pub verbose: bool,
    pub input: Option<PathBuf>,
    pub bench_rounds: u32,
    pub bench_secs: u64,
    pub bench_output: Option<PathBuf>,
    pub bench_baseline: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Hash,
            device_index: None,
            batch_size: DEFAULT_BATCH_SIZE,
            kind: Argon2Kind::Argon2id,
            version: Argon2Version::V0x13,
            memory_kib: DEFAULT_MEMORY_KIB,
            time_cost: DEFAULT_TIME_COST,
            lanes: DEFAULT_LANES,
            hash_len: DEFAULT_HASH_LEN,
            salt: DEFAULT_SALT.to_string(),
            by_segment: true,
            precompute_refs: false,
            verbose: false,
            input: None,
            bench_rounds: DEFAULT_BENCH_ROUNDS,
            bench_secs: DEFAULT_BENCH_SECS,
            bench_output: None,
            bench_baseline: None,
        }
    }
}

impl Config {
    pub fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().skip(1).collect();
        if args.iter().any(|arg| arg == "-h" || arg == "--help") {
            print!("{USAGE}");
            std::process::exit(0);
        }
        Self::parse_from(args)
    }

    fn parse_from(args: Vec<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--bench" => cfg.mode = Mode::Bench,
                "--list-devices" => cfg.mode = Mode::ListDevices,
                "--device" => cfg.device_index = Some(next_value(&mut args, "--device")?),
                "--batch" => cfg.batch_size = next_value(&mut args, "--batch")?,
                "--oneshot" => cfg.by_segment = false,
                "--precompute" => cfg.precompute_refs = true,
                "--type" => cfg.kind = next_value(&mut args, "--type")?,
                "--version" => cfg.version = next_value(&mut args, "--version")?,
                "-m" | "--memory" => cfg.memory_kib = next_value(&mut args, "--memory")?,
                "-t" | "--time" => cfg.time_cost = next_value(&mut args, "--time")?,
                "-l" | "--lanes" => cfg.lanes = next_value(&mut args, "--lanes")?,
                "--hash-len" => cfg.hash_len = next_value(&mut args, "--hash-len")?,
                "--salt" => cfg.salt = next_value(&mut args, "--salt")?,
                "-i" | "--input" => cfg.input = Some(next_value(&mut args, "--input")?),
                "--rounds" => cfg.bench_rounds = next_value(&mut args, "--rounds")?,
                "--secs" => cfg.bench_secs = next_value(&mut args, "--secs")?,
                "--bench-output" => {
                    cfg.bench_output = Some(next_value(&mut args, "--bench-output")?)
                }
                "--baseline" => cfg.bench_baseline = Some(next_value(&mut args, "--baseline")?),
                "-v" | "--verbose" => cfg.verbose = true,
                other => bail!("unknown option '{other}' (try --help)"),
            }
        }

        if cfg.batch_size == 0 {
            bail!("--batch must be at least 1");
        }
        if cfg.bench_rounds == 0 {
            bail!("--rounds must be at least 1");
        }
        if cfg.bench_secs == 0 {
            bail!("--secs must be at least 1");
        }

        Ok(cfg)
    }
}

fn next_value<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = args
        .next()
        .ok_or_else(|| anyhow!("missing value for {flag}"))?;
    raw.parse::<T>()
        .map_err(|err| anyhow!("invalid value '{raw}' for {flag}: {err}"))
}
