//! Purpose: `tally` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All counter access goes through `api::LocalClient` (locks + durable writes).
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Value, json};

mod command_dispatch;

use tally::api::{Error, ErrorKind, LocalClient, normalize, to_exit_code};
use tally::server;

const DEFAULT_BIND: &str = "127.0.0.1:8787";
const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                let message = clap_error_summary(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint("Run `tally --help` for usage."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let client = match cli.dir {
        Some(dir) => LocalClient::new().with_data_dir(dir),
        None => LocalClient::new(),
    };
    let color_mode = cli.color;

    command_dispatch::dispatch_command(cli.command, client, color_mode)
        .map_err(add_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Durable per-key hit counters over HTTP",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tally serve                         # http://127.0.0.1:8787
  $ curl -X POST localhost:8787/api/hit/my-song
  $ tally get my-song
  $ tally key '../My Song!'             # show the normalized key"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Counter data directory (default: ~/.tally/counters)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and pretty JSON output: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve counters over HTTP (loopback default)",
        after_help = r#"ROUTES
  OPTIONS *                    204 with CORS headers
  GET     /api/get/<key>       {"value": <n>}
  GET|POST /api/hit/<key>      {"value": <n>} after incrementing

NOTES
  - Keys are normalized: [a-zA-Z0-9._:-], max 120 UTF-16 units, empty -> "global"
  - Non-loopback binds require --allow-non-loopback
  - Set RUST_LOG to adjust logging (default: info)"#
    )]
    Serve(ServeRunArgs),
    #[command(about = "Print a counter's current value")]
    Get {
        #[arg(help = "Counter key (normalized before use)")]
        key: String,
    },
    #[command(about = "Increment a counter and print the new value")]
    Hit {
        #[arg(help = "Counter key (normalized before use)")]
        key: String,
    },
    #[command(about = "Print the normalized form of a key")]
    Key {
        #[arg(help = "Raw key text")]
        raw: String,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeRunArgs {
    #[arg(
        long,
        default_value = DEFAULT_BIND,
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        help = "Allow non-loopback binds (the API is unauthenticated)",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_IO_TIMEOUT_MS,
        help = "Per-operation timeout for lock + storage I/O in milliseconds",
        help_heading = "Safety"
    )]
    io_timeout_ms: u64,
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy | ErrorKind::Timeout => {
            err.with_hint("Counter is busy (another writer holds the lock). Retry with backoff.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        ErrorKind::Corrupt => err.with_hint(
            "Counter record appears corrupt. Inspect or remove the file named in `path`.",
        ),
        ErrorKind::Internal => err.with_hint(
            "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
        ),
        _ => err,
    }
}

fn emit_json(value: Value, color_mode: ColorMode) {
    let pretty = color_mode.use_color(io::stdout().is_terminal());
    let json = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    println!(
        "{}",
        json.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    );
}

// JSON for pipes and scripts; a short labelled block for people at a terminal.
fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }
    match serde_json::to_string(&err.report()) {
        Ok(json) => eprintln!("{json}"),
        Err(_) => eprintln!("{err}"),
    }
}

fn error_text(err: &Error, use_color: bool) -> String {
    let report = err.report();
    let body = &report.error;
    let label = if use_color {
        "\u{1b}[31merror:\u{1b}[0m"
    } else {
        "error:"
    };
    let mut text = format!("{label} {}", body.message);
    let details = [
        ("hint", body.hint),
        ("key", body.key),
        ("path", body.path.as_deref()),
    ];
    for (name, value) in details {
        if let Some(value) = value {
            text.push_str(&format!("\n  {name}: {value}"));
        }
    }
    if let Some(cause) = err.source() {
        text.push_str(&format!("\n  cause: {cause}"));
    }
    text
}
