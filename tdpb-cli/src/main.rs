use std::collections::VecDeque;
use std::error::Error;
use std::fs;
use std::time::Instant;

use rayon::prelude::*;
use tdpb::{CompileOptions, MessageType, Profile, Shared, UnmarshalOptions, compile_file_set_bytes};

struct Args {
    /// Serialized `FileDescriptorSet` containing the schema.
    schema: String,

    /// Fully qualified name of the message type to decode.
    message: String,

    /// Files containing encoded messages.
    inputs: Vec<String>,

    /// Only print a summary, not the decoded messages.
    quiet: bool,

    /// Record a profile and print its statistics.
    profile: bool,

    /// Record a profile, recompile and decode the inputs again.
    recompile: bool,

    /// Let decoded strings and bytes reference the input.
    alias: bool,

    /// Fail after this many unknown fields in one input.
    max_misses: Option<u64>,

    /// Enable verbose logging.
    verbose: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut quiet = false;
    let mut profile = false;
    let mut recompile = false;
    let mut alias = false;
    let mut max_misses = None;
    let mut verbose = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Short('a') | Long("alias") => alias = true,
            Short('m') | Long("max-misses") => max_misses = Some(parser.value()?.parse()?),
            Short('p') | Long("profile") => profile = true,
            Short('q') | Long("quiet") => quiet = true,
            Short('r') | Long("recompile") => recompile = true,
            Short('v') | Long("verbose") => verbose = true,
            Short('h') | Long("help") => {
                println!(
                    "Decode Protocol Buffers messages using a schema loaded at runtime.

Usage: {bin_name} [OPTIONS] <schema> <message> <input>...

Args:
  <schema>   FileDescriptorSet, as written by `protoc --descriptor_set_out`
  <message>  Fully qualified name of the message type
  <input>    File containing one encoded message

Options:
  -a, --alias          Reference string and bytes fields in the input
  -m, --max-misses <n> Fail after <n> unknown fields in an input
  -p, --profile        Print field statistics collected while decoding
  -q, --quiet          Don't print decoded messages
  -r, --recompile      Recompile using a profile and decode again
  -v, --verbose        Enable verbose logging
  -h, --help           Print help
",
                    bin_name = parser.bin_name().unwrap_or("tdpb")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let schema = values.pop_front().ok_or("missing `<schema>` arg")?;
    let message = values.pop_front().ok_or("missing `<message>` arg")?;
    if values.is_empty() {
        return Err("missing `<input>` arg".into());
    }

    Ok(Args {
        schema,
        message,
        inputs: values.into(),
        quiet,
        profile,
        recompile,
        alias,
        max_misses,
        verbose,
    })
}

/// Result of decoding one input.
struct Decoded {
    /// Debug representation of the message, or the error.
    text: String,
    ok: bool,
}

/// Decode each input in parallel, using one [`Shared`] per worker.
fn decode_all(ty: &MessageType, inputs: &[Vec<u8>], opts: &UnmarshalOptions) -> Vec<Decoded> {
    inputs
        .par_iter()
        .map_init(Shared::new, |shared, input| {
            shared.reset();
            match shared.unmarshal(ty, input, opts) {
                Ok(msg) => Decoded {
                    text: format!("{:#?}", msg),
                    ok: true,
                },
                Err(err) => Decoded {
                    text: err.to_string(),
                    ok: false,
                },
            }
        })
        .collect()
}

fn report(label: &str, paths: &[String], results: &[Decoded], quiet: bool, elapsed_ms: f64) {
    let failed = results.iter().filter(|r| !r.ok).count();
    if !quiet {
        for (path, result) in paths.iter().zip(results) {
            if result.ok {
                println!("{}:\n{}", path, result.text);
            } else {
                println!("{}: error: {}", path, result.text);
            }
        }
    }
    println!(
        "{}: decoded {} of {} inputs in {:.2}ms",
        label,
        results.len() - failed,
        results.len(),
        elapsed_ms
    );
}

/// Tool for decoding binary Protocol Buffers messages given a schema.
///
/// ```text
/// protoc --include_imports --descriptor_set_out=schema.pb schema.proto
/// cargo run -p tdpb-cli --release schema.pb pkg.Message input.bin
/// ```
///
/// Set `RUST_LOG=debug` or pass `-v` to log compilation and decode details.
fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let schema = fs::read(&args.schema)?;
    let ty = compile_file_set_bytes(&schema, &args.message, &CompileOptions::default())?;
    log::debug!(
        "Compiled {} with {} types, record size {} bytes",
        ty.full_name(),
        ty.library_size(),
        ty.layout().size
    );

    let inputs = args
        .inputs
        .iter()
        .map(fs::read)
        .collect::<Result<Vec<_>, _>>()?;

    let profile: Option<Profile> = (args.profile || args.recompile).then(|| ty.new_profile());

    let mut opts = UnmarshalOptions::new().allow_alias(args.alias);
    if let Some(max) = args.max_misses {
        opts = opts.max_decode_misses(max);
    }
    let mut first_opts = opts.clone();
    if let Some(profile) = &profile {
        first_opts = first_opts.record_profile(profile, 1.0);
    }

    let start = Instant::now();
    let results = decode_all(&ty, &inputs, &first_opts);
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    report(ty.full_name(), &args.inputs, &results, args.quiet, elapsed_ms);

    let Some(profile) = profile else {
        return Ok(());
    };
    if args.profile {
        print!("{}", profile.stats());
    }
    if args.recompile {
        let recompiled = ty.recompile(&profile)?;
        let start = Instant::now();
        let results = decode_all(&recompiled, &inputs, &opts);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        report("recompiled", &args.inputs, &results, true, elapsed_ms);
    }

    Ok(())
}
