//! Command line front end of PGR.
//!
//! `pgr opt` rewrites the hot routines of an executable using the profile of
//! an earlier run, `pgr show` prints the decisions stored in a profile.

use clap::{Args, Parser, Subcommand};
use pgr::core::Config;
use pgr::image::load_elf;
use pgr::profile::load_profile;
use pgr::rewrite::Rewriter;
use pgr::x64::disasm::{linked_listing, map_listing};
use std::path::PathBuf;
use std::process;

/// Profile-guided rewriting of x86-64 routines.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Cli {
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite the hottest routines of an executable.
    Opt(OptArgs),
    /// Print the decisions stored in a profile.
    Show(ProfileArgs),
}

#[derive(Args, Debug)]
struct ProfileArgs {
    /// The profile written by the profiling pass.
    #[arg(short, long, default_value = pgr::profile::PROFILE_FILE_NAME)]
    profile: PathBuf,
}

#[derive(Args, Debug)]
struct OptArgs {
    /// The executable to rewrite.
    #[arg(short, long)]
    binary: PathBuf,

    #[command(flatten)]
    profile: ProfileArgs,

    /// Number of hottest routines to rewrite.
    #[arg(long, default_value_t = pgr::core::config::DEFAULT_HOT_ROUTINE_LIMIT)]
    hot: usize,

    /// Taken ratio a branch needs before it is reordered.
    #[arg(long, default_value_t = pgr::core::config::DEFAULT_BIAS_THRESHOLD)]
    threshold: f64,

    /// Number of calls an inlined callee may contain.
    #[arg(long, default_value_t = pgr::core::config::DEFAULT_MAX_CALLS)]
    max_calls: usize,

    /// Link rewritten routines at this address (hex, `0x` prefix optional).
    #[arg(long, value_parser = parse_addr)]
    code_cache_base: Option<u64>,

    /// Print every rewritten routine.
    #[arg(short, long)]
    dump: bool,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(hex, 16).map_err(|e| format!("invalid address `{s}`: {e}"))
}

fn opt(args: OptArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::new();
    config
        .bias_threshold(args.threshold)?
        .hot_routine_limit(args.hot)
        .max_calls(args.max_calls)
        .profile_path(args.profile.profile)
        .code_cache_base(args.code_cache_base)
        .dump(args.dump);

    // The profile is checked before the binary so a missing profile is
    // reported first.
    let profile = load_profile(config.profile())?;
    let image = load_elf(&args.binary)?;
    let rewriter = Rewriter::new(&image, profile, config);
    let session = rewriter.run();

    for routine in session.routines() {
        println!("{}: {}", routine.name, routine.decision);
        if !rewriter.config().dumps() {
            continue;
        }
        match (routine.map(), routine.linked()) {
            (Some(map), Some(code)) => print!("{}", linked_listing(map, code)),
            (Some(map), None) => print!("{}", map_listing(map)),
            (None, _) => println!("  unmodified"),
        }
    }
    print!("{}", session.stats());
    Ok(())
}

fn show(args: ProfileArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_profile(&args.profile)?;
    for record in table.iter() {
        println!("{record}");
    }
    if table.rejected() > 0 {
        println!("{} malformed lines dropped", table.rejected());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match cli.command {
        Command::Opt(args) => opt(args),
        Command::Show(args) => show(args),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
