//! Purpose: Hold top-level CLI command dispatch for `tally`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Local `get`/`hit` go through the same stores the server uses.

use super::*;

use std::net::SocketAddr;

pub(super) fn dispatch_command(
    command: Command,
    client: LocalClient,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "tally", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Key { raw } => {
            let key = normalize(&raw);
            emit_json(json!({ "raw": raw, "key": key }), color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Get { key } => {
            let value = block_on(client.get(&key))?;
            emit_json(json!({ "key": normalize(&key), "value": value }), color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Hit { key } => {
            let value = block_on(client.hit(&key))?;
            emit_json(json!({ "key": normalize(&key), "value": value }), color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let bind: SocketAddr = args.bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid bind address")
                    .with_hint("Use a host:port value like 127.0.0.1:8787.")
            })?;
            let config = server::ServeConfig {
                bind,
                data_dir: client.data_dir().to_path_buf(),
                allow_non_loopback: args.allow_non_loopback,
                io_timeout_ms: args.io_timeout_ms,
            };
            server::validate_config(&config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(server::serve(config))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn block_on<T>(future: impl std::future::Future<Output = Result<T, Error>>) -> Result<T, Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(future)
}
