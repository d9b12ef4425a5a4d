use std::env;
use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::Instant;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use flake::{FlakeGen, ID_LEN, parse_flake, validate};

const WORKER_ENV: &str = "FLAKE_WORKER_ID";
const LOG_ENV: &str = "FLAKE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Raw,
    Hex,
    B64,
}

impl Format {
    fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Hex => "hex",
            Self::B64 => "b64",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "hex" => Some(Self::Hex),
            "b64" | "base64" => Some(Self::B64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct EmitOpts {
    worker: u32,
    format: Format,
    count: usize,
    threads: usize,
    json: bool,
}

#[derive(Debug, Clone)]
struct InspectOpts {
    format: Format,
    json: bool,
}

fn print_help() {
    eprintln!(
        "flake - Flake v1 identifier CLI\n\n\
Usage:\n  flake next [--worker <id>] [--format hex|b64]\n  flake stream [--worker <id>] [--format hex|b64] [--count <n>]\n  flake validate <id> [--format hex|b64]\n  flake parse <id> [--format hex|b64] [--json]\n  flake healthcheck [--worker <id>] [--json]\n  flake bench [--worker <id>] [--format raw|hex|b64] [--count <n>] [--threads <n>]\n  flake selftest\n\n\
Worker ids accept decimal or 0x-prefixed hex and default to ${WORKER_ENV}.\n\
For stream, --count 0 means infinite. Log filter is read from ${LOG_ENV}.\n"
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_worker(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => s.parse::<u32>(),
    };
    let worker = parsed.map_err(|_| format!("invalid worker id: {s}"))?;
    if worker > flake::MAX_WORKER_ID {
        return Err(format!("worker id {s} does not fit in 24 bits"));
    }
    Ok(worker)
}

fn default_worker() -> Result<u32, String> {
    match env::var(WORKER_ENV) {
        Ok(v) => parse_worker(&v),
        Err(_) => Ok(0),
    }
}

fn parse_format(s: &str) -> Result<Format, String> {
    Format::parse(s).ok_or_else(|| "format must be raw, hex or b64".to_string())
}

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {}", args[i]))
}

fn parse_emit_flags(args: &[String], allow_count: bool) -> Result<EmitOpts, String> {
    let mut opts = EmitOpts {
        worker: default_worker()?,
        format: Format::Hex,
        count: 0,
        threads: 1,
        json: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--worker" | "-w" => {
                opts.worker = parse_worker(flag_value(args, i)?)?;
                i += 2;
            }
            "--format" | "-f" => {
                opts.format = parse_format(flag_value(args, i)?)?;
                i += 2;
            }
            "--count" | "-n" if allow_count => {
                opts.count = flag_value(args, i)?
                    .parse::<usize>()
                    .map_err(|_| "invalid integer for --count".to_string())?;
                i += 2;
            }
            "--threads" if allow_count => {
                opts.threads = flag_value(args, i)?
                    .parse::<usize>()
                    .map_err(|_| "invalid integer for --threads".to_string())?
                    .max(1);
                i += 2;
            }
            "--json" => {
                opts.json = true;
                i += 1;
            }
            _ => return Err(format!("unknown flag: {}", args[i])),
        }
    }

    Ok(opts)
}

fn parse_inspect_flags(args: &[String]) -> Result<InspectOpts, String> {
    let mut opts = InspectOpts {
        format: Format::Hex,
        json: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--format" | "-f" => {
                opts.format = parse_format(flag_value(args, i)?)?;
                i += 2;
            }
            "--json" => {
                opts.json = true;
                i += 1;
            }
            _ => return Err(format!("unknown flag: {}", args[i])),
        }
    }

    if opts.format == Format::Raw {
        return Err("textual ids must be hex or b64".to_string());
    }
    Ok(opts)
}

fn decode_id(text: &str, format: Format) -> Result<Vec<u8>, String> {
    match format {
        Format::Hex => hex::decode(text).map_err(|e| format!("invalid hex id: {e}")),
        Format::B64 => URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| format!("invalid base64 id: {e}")),
        Format::Raw => Err("textual ids must be hex or b64".to_string()),
    }
}

fn emit(generator: &FlakeGen, format: Format) -> Result<String, String> {
    match format {
        Format::Hex => Ok(generator.next_hex()),
        Format::B64 => Ok(generator.next_b64()),
        Format::Raw => Err("emitted ids must be hex or b64".to_string()),
    }
}

fn new_generator(worker: u32) -> Result<FlakeGen, String> {
    FlakeGen::new(worker).map_err(|e| e.to_string())
}

fn run_next(args: &[String]) -> Result<(), String> {
    let opts = parse_emit_flags(args, false)?;
    let generator = new_generator(opts.worker)?;
    println!("{}", emit(&generator, opts.format)?);
    Ok(())
}

fn run_stream(args: &[String]) -> Result<(), String> {
    let opts = parse_emit_flags(args, true)?;
    let generator = new_generator(opts.worker)?;
    let mut out = io::stdout().lock();
    let mut emitted = 0usize;

    loop {
        if opts.count > 0 && emitted >= opts.count {
            break;
        }
        let id = emit(&generator, opts.format)?;
        writeln!(out, "{id}").map_err(|e| e.to_string())?;
        out.flush().map_err(|e| e.to_string())?;
        emitted += 1;
    }

    Ok(())
}

fn run_healthcheck(args: &[String]) -> Result<(), String> {
    let opts = parse_emit_flags(args, false)?;
    let generator = new_generator(opts.worker)?;

    let first = generator.next_raw();
    let second = generator.next_raw();
    let ok = validate(&first).is_ok() && validate(&second).is_ok() && first < second;
    let sample = hex::encode(second);

    if opts.json {
        let payload = json!({
            "ok": ok,
            "worker": opts.worker,
            "sample_id": sample,
        });
        println!(
            "{}",
            serde_json::to_string(&payload).map_err(|e| e.to_string())?
        );
    } else {
        println!("ok={} worker={} sample={}", ok, opts.worker, sample);
    }

    if ok {
        Ok(())
    } else {
        Err("healthcheck failed".to_string())
    }
}

fn run_validate(args: &[String]) -> Result<(), String> {
    let Some(text) = args.first() else {
        return Err("validate requires an id".to_string());
    };
    let opts = parse_inspect_flags(&args[1..])?;

    let result =
        decode_id(text, opts.format).and_then(|id| validate(&id).map_err(|e| e.to_string()));
    println!("{}", result.is_ok());
    result.map_err(|e| format!("invalid flake: {e}"))
}

fn run_parse(args: &[String]) -> Result<(), String> {
    let Some(text) = args.first() else {
        return Err("parse requires an id".to_string());
    };
    let opts = parse_inspect_flags(&args[1..])?;

    let id = decode_id(text, opts.format)?;
    let parsed = parse_flake(&id).map_err(|e| e.to_string())?;

    if opts.json {
        println!(
            "{}",
            serde_json::to_string(&parsed).map_err(|e| e.to_string())?
        );
    } else {
        println!("version={}", parsed.version);
        println!("timestamp={}", parsed.timestamp.to_rfc3339());
        println!("timestamp_micros={}", parsed.timestamp_micros);
        println!("counter={}", parsed.counter);
        println!("worker={:#08x}", parsed.worker_id);
        println!("checksum={:02x}", parsed.checksum);
    }

    Ok(())
}

fn run_bench(args: &[String]) -> Result<(), String> {
    let mut opts = parse_emit_flags(args, true)?;
    if opts.count == 0 {
        opts.count = 100_000;
    }

    let generator = new_generator(opts.worker)?;
    let per_thread = opts.count.div_ceil(opts.threads);
    debug!(threads = opts.threads, per_thread, "starting bench");

    let start = Instant::now();
    thread::scope(|s| {
        for _ in 0..opts.threads {
            s.spawn(|| {
                for _ in 0..per_thread {
                    match opts.format {
                        Format::Raw => {
                            std::hint::black_box(generator.next_raw());
                        }
                        Format::Hex => {
                            std::hint::black_box(generator.next_hex());
                        }
                        Format::B64 => {
                            std::hint::black_box(generator.next_b64());
                        }
                    }
                }
            });
        }
    });

    let total = per_thread * opts.threads;
    let secs = start.elapsed().as_secs_f64().max(1e-9);
    let payload = json!({
        "impl": "rust",
        "format": opts.format.as_str(),
        "threads": opts.threads,
        "n": total,
        "seconds": secs,
        "ids_per_sec": total as f64 / secs,
    });
    println!(
        "{}",
        serde_json::to_string(&payload).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn run_selftest() -> Result<(), String> {
    let generator = new_generator(default_worker()?)?;
    let a = generator.next_raw();
    let b = generator.next_raw();
    validate(&a).map_err(|e| format!("selftest failed: {e}"))?;
    validate(&b).map_err(|e| format!("selftest failed: {e}"))?;
    if a >= b {
        return Err("selftest failed: non-monotonic".to_string());
    }

    let hex_id = decode_id(&generator.next_hex(), Format::Hex)?;
    let b64_id = decode_id(&generator.next_b64(), Format::B64)?;
    if hex_id.len() != ID_LEN || b64_id.len() != ID_LEN {
        return Err("selftest failed: bad text length".to_string());
    }
    validate(&hex_id).map_err(|e| format!("selftest failed: {e}"))?;
    validate(&b64_id).map_err(|e| format!("selftest failed: {e}"))?;
    Ok(())
}

fn main() {
    init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_help();
        process::exit(1);
    }

    if args[0] == "-h" || args[0] == "--help" || args[0] == "help" {
        print_help();
        return;
    }

    let cmd = args[0].as_str();
    let rest = &args[1..];

    let res = match cmd {
        "next" => run_next(rest),
        "stream" => run_stream(rest),
        "healthcheck" => run_healthcheck(rest),
        "validate" => run_validate(rest),
        "parse" => run_parse(rest),
        "bench" => run_bench(rest),
        "selftest" => run_selftest(),
        _ => Err(format!("unknown command: {}", cmd)),
    };

    if let Err(err) = res {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}
