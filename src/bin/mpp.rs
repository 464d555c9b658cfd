/// mpp – driver for the parallel primitives.
///
///   mpp scan [N]         → prefix sum of N generated values, CPU vs device
///   mpp hash [N]         → build a table of N random unique keys, verify lookups
///   mpp --opencl scan    → run on an OpenCL device instead of the host executor
///   RUST_LOG=mpp=debug   → per-attempt and per-dispatch detail
use std::collections::HashSet;
use std::env;
use std::process::{self, ExitCode};
use std::time::Instant;

use mpp::cuckoo::{suggested_max_iterations, Construction, CuckooConfig, CuckooHashTable};
use mpp::device::Device;
use mpp::host::HostDevice;
use mpp::scan::{calculate_cpu, PrefixSum};
use mpp::sizing::EMPTY_32;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

const DEFAULT_SCAN_LEN: usize = 1 << 20;
const DEFAULT_HASH_LEN: usize = 1 << 16;

fn usage() {
    eprintln!("mpp - GPU cuckoo hashing and prefix sum");
    eprintln!();
    eprintln!("Usage: mpp [OPTIONS] <scan|hash> [N]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  scan [N]                   Exclusive prefix sum of N values (default {DEFAULT_SCAN_LEN})");
    eprintln!("  hash [N]                   Cuckoo table of N unique keys (default {DEFAULT_HASH_LEN})");
    eprintln!();
    eprintln!("Options:");
    #[cfg(feature = "opencl")]
    eprintln!("  -g, --opencl               Run on an OpenCL device");
    eprintln!("  --factor F                 Table size factor (default 1.25)");
    eprintln!("  --max-iterations N         Eviction bound per key (default ceil(7 ln N))");
    eprintln!("  --max-reconstructions N    Rebuild attempts (default 3)");
    eprintln!("  --seed S                   Seed for data and hash functions");
    eprintln!("  -v, --verbose              Debug logging and device timings");
    eprintln!("  -h, --help                 Show this help");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Scan,
    Hash,
}

#[derive(Debug)]
struct Opts {
    command: Command,
    len: Option<usize>,
    opencl: bool,
    verbose: bool,
    factor: Option<f64>,
    max_iterations: Option<u32>,
    max_reconstructions: Option<u32>,
    seed: Option<u64>,
}

/// Value following a flag, parsed, or exit with a message.
fn flag_value<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> T {
    *i += 1;
    let Some(raw) = args.get(*i) else {
        eprintln!("mpp: missing argument for {flag}");
        process::exit(1);
    };
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("mpp: invalid value '{raw}' for {flag}");
            process::exit(1);
        }
    }
}

fn parse_args() -> Opts {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut command = None;
    let mut opts = Opts {
        command: Command::Scan,
        len: None,
        opencl: false,
        verbose: false,
        factor: None,
        max_iterations: None,
        max_reconstructions: None,
        seed: None,
    };

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "-g" | "--opencl" => opts.opencl = true,
            "-v" | "--verbose" => opts.verbose = true,
            "-h" | "--help" => {
                usage();
                process::exit(0);
            }
            "--factor" => opts.factor = Some(flag_value(&args, &mut i, "--factor")),
            "--max-iterations" => {
                opts.max_iterations = Some(flag_value(&args, &mut i, "--max-iterations"))
            }
            "--max-reconstructions" => {
                opts.max_reconstructions = Some(flag_value(&args, &mut i, "--max-reconstructions"))
            }
            "--seed" => opts.seed = Some(flag_value(&args, &mut i, "--seed")),
            "scan" if command.is_none() => command = Some(Command::Scan),
            "hash" if command.is_none() => command = Some(Command::Hash),
            s if s.starts_with('-') => {
                eprintln!("mpp: unknown flag '{s}'");
                process::exit(1);
            }
            s if command.is_some() && opts.len.is_none() => match s.parse::<usize>() {
                Ok(n) => opts.len = Some(n),
                Err(_) => {
                    eprintln!("mpp: invalid length '{s}'");
                    process::exit(1);
                }
            },
            other => {
                eprintln!("mpp: unexpected argument '{other}'");
                usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    match command {
        Some(c) => opts.command = c,
        None => {
            usage();
            process::exit(1);
        }
    }
    opts
}

fn init_logging(verbose: bool) {
    let default = if verbose { "mpp=debug" } else { "mpp=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn rng_for(opts: &Opts) -> StdRng {
    match opts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn run_scan<D: Device>(device: &D, opts: &Opts) -> Result<(), ()> {
    let len = opts.len.unwrap_or(DEFAULT_SCAN_LEN);
    let mut rng = rng_for(opts);
    let elements: Vec<i32> = (0..len).map(|_| rng.gen_range(-100..100)).collect();

    let t0 = Instant::now();
    let expected = calculate_cpu(&elements);
    let cpu_time = t0.elapsed();

    let scan = PrefixSum::new(device);
    let t0 = Instant::now();
    let actual = scan.calculate_gpu(&elements).map_err(|e| {
        eprintln!("mpp: scan failed: {e}");
    })?;
    let device_time = t0.elapsed();

    println!("scan: {len} elements on {}", device.name());
    println!("  cpu:    {:>10.3} ms", cpu_time.as_secs_f64() * 1e3);
    println!("  device: {:>10.3} ms", device_time.as_secs_f64() * 1e3);

    match expected.iter().zip(&actual).position(|(a, b)| a != b) {
        None if expected.len() == actual.len() => {
            println!("  results agree");
            Ok(())
        }
        None => {
            eprintln!(
                "mpp: length mismatch: cpu {} vs device {}",
                expected.len(),
                actual.len()
            );
            Err(())
        }
        Some(i) => {
            eprintln!(
                "mpp: first mismatch at {i}: cpu {} vs device {}",
                expected[i], actual[i]
            );
            Err(())
        }
    }
}

fn run_hash<D: Device>(device: &D, opts: &Opts) -> Result<(), ()> {
    let len = opts.len.unwrap_or(DEFAULT_HASH_LEN);
    let mut rng = rng_for(opts);

    let mut seen = HashSet::with_capacity(len);
    let mut keys = Vec::with_capacity(len);
    while keys.len() < len {
        let key = rng.gen_range(0..EMPTY_32);
        if seen.insert(key) {
            keys.push(key);
        }
    }
    let values: Vec<u32> = (0..len).map(|_| rng.gen_range(0..EMPTY_32)).collect();

    let mut config = CuckooConfig::default()
        .with_max_iterations(opts.max_iterations.unwrap_or(suggested_max_iterations(len)));
    if let Some(factor) = opts.factor {
        config = config.with_table_size_factor(factor);
    }
    if let Some(n) = opts.max_reconstructions {
        config = config.with_max_reconstructions(n);
    }
    if let Some(seed) = opts.seed {
        config = config.with_seed(seed);
    }

    let mut table = CuckooHashTable::new(device, config);
    let t0 = Instant::now();
    let built = table.build(len, &keys, &values).map_err(|e| {
        eprintln!("mpp: build failed: {e}");
    })?;
    let build_time = t0.elapsed();

    println!(
        "hash: {len} keys on {}, capacity {}",
        device.name(),
        table.capacity()
    );
    println!(
        "  build:  {:>10.3} ms ({} attempt(s))",
        build_time.as_secs_f64() * 1e3,
        built.attempts()
    );
    if let Construction::Exhausted { attempts } = built {
        eprintln!("mpp: construction failed after {attempts} attempt(s)");
        return Err(());
    }

    let t0 = Instant::now();
    let found = table.get(&keys).map_err(|e| {
        eprintln!("mpp: lookup failed: {e}");
    })?;
    let lookup_time = t0.elapsed();
    println!("  lookup: {:>10.3} ms", lookup_time.as_secs_f64() * 1e3);

    let wrong = found.iter().zip(&values).filter(|(a, b)| a != b).count();
    if wrong > 0 {
        eprintln!("mpp: {wrong} of {len} lookups returned the wrong value");
        return Err(());
    }
    println!("  all lookups verified");
    Ok(())
}

fn run_on<D: Device>(device: &mut D, opts: &Opts) -> Result<(), ()> {
    let loaded = match opts.command {
        Command::Scan => PrefixSum::load_kernels(device),
        Command::Hash => CuckooHashTable::load_kernels(device),
    };
    if let Err(e) = loaded {
        eprintln!("mpp: cannot load kernels on {}: {e}", device.name());
        return Err(());
    }

    let result = match opts.command {
        Command::Scan => run_scan(device, opts),
        Command::Hash => run_hash(device, opts),
    };
    device.teardown();
    result
}

#[cfg(feature = "opencl")]
fn run_opencl(opts: &Opts) -> Result<(), ()> {
    let options = mpp::opencl::OpenClOptions {
        profiling: opts.verbose,
        ..Default::default()
    };
    match mpp::opencl::OpenClDevice::with_options(options) {
        Ok(mut device) => {
            if device.is_cpu_device() {
                tracing::warn!(device = device.device_name(), "OpenCL device is a CPU");
            }
            if device.profiling() {
                tracing::debug!("OpenCL command timings enabled");
            }
            run_on(&mut device, opts)
        }
        Err(e) => {
            eprintln!("mpp: OpenCL unavailable: {e}");
            Err(())
        }
    }
}

#[cfg(not(feature = "opencl"))]
fn run_opencl(_opts: &Opts) -> Result<(), ()> {
    eprintln!("mpp: built without the 'opencl' feature");
    Err(())
}

fn run() -> Result<(), ()> {
    let opts = parse_args();
    init_logging(opts.verbose);

    if opts.opencl {
        run_opencl(&opts)
    } else {
        run_on(&mut HostDevice::new(), &opts)
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}
