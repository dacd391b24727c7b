use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use shmkv::{BrokerServer, Config, Context, LogLevel, ProcessMode, CACHE_VAR, ROOT_VAR};
use shmkv_fd::BrokerEnv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let HostCommand {
        root,
        cache,
        log_level,
        name,
        suffix,
        socket,
        ashmem,
        ashmem_size,
        check_mode,
        command,
        args,
    } = HostCommand::parse();

    let mut config = Config::from_env();
    if let Some(root) = root {
        config.cache_dir = root.join(".cache");
        config.root_dir = root;
    }
    if let Some(cache) = cache {
        config.cache_dir = cache;
    }
    if let Some(level) = log_level {
        config.log_level = level;
    }
    if name.is_some() {
        config.process_name = name;
    }
    if check_mode {
        config.process_mode_checker = true;
    }
    // We are the owner, not a client of some other broker.
    config.broker_endpoint = None;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.directive().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ctx = Context::initialize(config);
    let owner = ctx.process_name().expect("failed to determine the process name");
    if !ctx.is_owner().expect("failed to determine the process name") {
        eprintln!("`{owner}` is a sub-process name, refusing to act as the owner");
        std::process::exit(2);
    }

    // Created before the child starts, and kept alive for as long as we serve.
    let preloaded: Vec<_> = ashmem
        .iter()
        .map(|id| {
            ctx.obtain_ashmem(id.as_str(), ashmem_size, ProcessMode::Multi, None)
                .expect("failed to create anonymous store")
        })
        .collect();

    let socket = match socket {
        Some(socket) => socket,
        None => ctx
            .default_broker_endpoint()
            .expect("failed to determine the broker endpoint"),
    };
    let server = BrokerServer::bind(Arc::clone(&ctx), socket).expect("failed to bind the broker");

    let mut proc = Command::new(&command);
    proc.args(&args);
    proc.env(ROOT_VAR, ctx.root_dir());
    proc.env(CACHE_VAR, &ctx.config().cache_dir);
    BrokerEnv::for_child(server.path(), &owner, &suffix).wrap_proc(&mut proc);

    let mut child = match proc.spawn() {
        Ok(child) => child,
        Err(err) => {
            eprintln!("Failed to spawn {}: {err}", command.to_string_lossy());
            std::process::exit(127);
        }
    };
    tracing::info!(pid = child.id(), owner = %owner, stores = preloaded.len(), "serving sub-process");

    let stop = Arc::new(AtomicBool::new(false));
    let serving = std::thread::spawn({
        let stop = Arc::clone(&stop);
        move || server.serve_until(&stop)
    });

    let status = child.wait().expect("can receive status");
    stop.store(true, Ordering::Release);

    match serving.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "broker stopped serving"),
        Err(_) => tracing::error!("broker thread panicked"),
    }

    drop(preloaded);
    if let Some(code) = status.code() {
        std::process::exit(code);
    }

    // Killed by a signal.
    std::process::exit(1)
}

/// Run a command as a sub-process of this one, handing out anonymous stores to it.
#[derive(Parser)]
#[command(name = "shmkv-host")]
struct HostCommand {
    /// Directory of file-backed stores.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory of the broker socket, unless `--socket` is given.
    #[arg(long)]
    cache: Option<PathBuf>,

    /// One of debug, info, warning, error or none. `RUST_LOG` takes precedence.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Name of this process, the owner. Sub-processes are named after it.
    #[arg(long)]
    name: Option<String>,

    /// The sub-process is named `<owner>:<suffix>`.
    #[arg(long, default_value = "sub")]
    suffix: String,

    /// Path of the broker socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Create an anonymous store of this name before starting the command.
    #[arg(long)]
    ashmem: Vec<String>,

    /// Size of each store created with `--ashmem`.
    #[arg(long, default_value_t = 4096)]
    ashmem_size: usize,

    /// Reject requests for a store in another process mode than the one it is held in.
    #[arg(long)]
    check_mode: bool,

    #[arg(help = "The command to execute with the broker environment set")]
    command: OsString,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}
