use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, LevelFilter};

use leech_core::adapter::Registry;
use leech_core::{ops, Error, Fingerprint, Primary, TableId};
use leech_paths::Workdir;

fn main() -> ExitCode {
    // clap itself exits with code 2 on a bad invocation.
    let matches = command().get_matches();
    init_logging(&matches);

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Map error kinds to the documented exit codes. `0` is success and `2` (bad
/// invocation) is produced by the argument parser.
fn exit_code(err: &Error) -> u8 {
    match err {
        Error::Config(_) => 2,
        Error::CorruptBlock { .. }
        | Error::CorruptPatch { .. }
        | Error::CorruptStore(_)
        | Error::UnknownBlock(_)
        | Error::UnreachableAncestor { .. } => 3,
        Error::Adapter { .. } => 4,
        Error::PatchFailed(_) | Error::PartialCommit { .. } => 5,
        Error::LockBusy | Error::Io(_) => 1,
    }
}

fn command() -> Command {
    Command::new("leech")
        .about("Track table state in a content-addressed block store and sync it via patches")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("workdir")
                .long("workdir")
                .value_name("PATH")
                .global(true)
                .help("Work directory holding leech.json and the block store [default: .]"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log at debug level"),
        )
        .arg(
            Arg::new("info")
                .long("info")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log at info level"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log everything"),
        )
        .subcommands([
            Command::new("commit").about("Snapshot every configured table into the block store"),
            Command::new("diff")
                .about("Write a patch holding the composite diff from a block to every current head")
                .arg(
                    Arg::new("block")
                        .long("block")
                        .value_name("FINGERPRINT")
                        .required(true)
                        .help("Ancestor block fingerprint; all zeros means a full rebuild"),
                )
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("PATH")
                        .required(true)
                        .help("Where to write the patch"),
                ),
            Command::new("patch")
                .about("Apply a patch file against the destination tables")
                .arg(
                    Arg::new("field")
                        .long("field")
                        .value_name("NAME")
                        .required(true)
                        .help("Host qualifier field name, e.g. host_id"),
                )
                .arg(
                    Arg::new("value")
                        .long("value")
                        .value_name("VALUE")
                        .required(true)
                        .help("Host qualifier value identifying the originating host"),
                )
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("PATH")
                        .required(true)
                        .help("The patch file to apply"),
                ),
            Command::new("rebase")
                .about("Write a patch that replaces this host's slice of the destination")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("PATH")
                        .required(true)
                        .help("Where to write the patch"),
                ),
            Command::new("purge").about("Truncate chains to the configured chain_length"),
            Command::new("history")
                .about("Write the change history of one primary tuple as JSON")
                .arg(
                    Arg::new("table")
                        .long("table")
                        .value_name("ID")
                        .required(true)
                        .help("Table id, e.g. BTL"),
                )
                .arg(
                    Arg::new("primary")
                        .long("primary")
                        .value_name("CSV")
                        .required(true)
                        .help("Comma-separated primary tuple, e.g. Paul,McCartney"),
                )
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("UNIX")
                        .value_parser(clap::value_parser!(u64))
                        .help("Oldest timestamp to include (inclusive)"),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .value_name("UNIX")
                        .value_parser(clap::value_parser!(u64))
                        .help("Newest timestamp to include (inclusive)"),
                )
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("PATH")
                        .required(true)
                        .help("Where to write the JSON output"),
                ),
        ])
}

fn init_logging(matches: &ArgMatches) {
    let level = if matches.get_flag("verbose") {
        LevelFilter::Trace
    } else if matches.get_flag("debug") {
        LevelFilter::Debug
    } else if matches.get_flag("info") {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new().filter_level(level).format_timestamp(None).init();
}

fn run(matches: &ArgMatches) -> Result<(), Error> {
    let workdir = matches
        .get_one::<String>("workdir")
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    let workdir = Workdir::from_path_unchecked(workdir);

    let mut registry = Registry::new();
    leech_csv::register(&mut registry);

    let ctx = ops::Context::open(workdir, registry)?;

    match matches.subcommand() {
        Some(("commit", _)) => {
            ops::commit(&ctx)?;
            Ok(())
        }
        Some(("diff", sub)) => {
            let from = parse_fingerprint(arg(sub, "block"))?;
            ops::diff(&ctx, from, Path::new(arg(sub, "file")))
        }
        Some(("patch", sub)) => {
            ops::patch(&ctx, arg(sub, "field"), arg(sub, "value"), Path::new(arg(sub, "file")))?;
            Ok(())
        }
        Some(("rebase", sub)) => ops::rebase(&ctx, Path::new(arg(sub, "file"))),
        Some(("purge", _)) => {
            ops::purge(&ctx)?;
            Ok(())
        }
        Some(("history", sub)) => {
            let table_id: TableId = arg(sub, "table")
                .parse()
                .map_err(|_| Error::Config(format!("invalid table id '{}'", arg(sub, "table"))))?;
            let primary = Primary::new(arg(sub, "primary").split(',').map(|f| f.as_bytes().to_vec()).collect());
            let from = sub.get_one::<u64>("from").copied();
            let to = sub.get_one::<u64>("to").copied();
            ops::history(&ctx, table_id, &primary, from, to, Path::new(arg(sub, "file")))
        }
        _ => Ok(()),
    }
}

/// A required argument, guaranteed present by the parser.
fn arg<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches.get_one::<String>(name).map_or("", String::as_str)
}

fn parse_fingerprint(s: &str) -> Result<Fingerprint, Error> {
    s.parse()
        .map_err(|_| Error::Config(format!("invalid block fingerprint '{s}'")))
}
