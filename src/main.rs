use std::sync::Arc;

use clap::Parser;
use slog_scope::error;
use tokio_util::sync::CancellationToken;

use wireproxy::cli::{self, Cli};
use wireproxy::config::{self, Configuration};
use wireproxy::error::AppError;
use wireproxy::sandbox::{self, Stage};
use wireproxy::{health, logging, ping, tunnel};

fn main() {
    if let Err(e) = run() {
        eprintln!("wireproxy: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    sandbox::lock(Stage::Boot)?;

    let mut args: Vec<String> = std::env::args().collect();
    let exe_path = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| args[0].clone());

    // The daemon child is marked by an argv[1] sentinel which must be
    // stripped before flag parsing.
    let is_daemon_process = args.len() > 1 && args[1] == cli::DAEMON_PROCESS;
    if is_daemon_process {
        sandbox::lock(Stage::BootDaemon)?;
        args.remove(1);
    }

    let cli = Cli::parse_from(&args);

    if cli.print_version {
        println!("wireproxy, version {}", cli::version());
        return Ok(());
    }

    let Some(config_path) = cli.config.clone().or_else(cli::default_config_path) else {
        anyhow::bail!("configuration path is required");
    };

    let mut daemon = cli.daemon;
    if !daemon {
        sandbox::lock(Stage::ReadConfig)?;
    }

    let conf = config::parse_config(&config_path)?;

    if cli.configtest {
        println!("Config OK");
        return Ok(());
    }

    sandbox::lock_network(&conf.routines, cli.info.as_deref())?;

    if is_daemon_process {
        redirect_stdio_to_null()?;
        daemon = false;
    }

    if daemon {
        // Re-exec with the sentinel prepended; the parent returns at once.
        let mut child_args = vec![cli::DAEMON_PROCESS.to_string()];
        child_args.extend(args.iter().skip(1).cloned());
        std::process::Command::new(&exe_path)
            .args(&child_args)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start daemon process: {e}"))?;
        return Ok(());
    }

    logging::init_terminal(!cli.silent);
    let device_logger = logging::device_logger(cli.silent);

    sandbox::lock(Stage::Ready)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(conf, device_logger, cli.info))
}

async fn serve(
    conf: Configuration,
    device_logger: slog::Logger,
    info_addr: Option<String>,
) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    install_signal_handler(token.clone())?;

    let tun = tunnel::start_tunnel(conf.device, device_logger).await?;

    for routine in conf.routines {
        let tun = Arc::clone(&tun);
        let routine_token = token.clone();
        let shutdown = token.clone();
        tokio::spawn(async move {
            if let Err(e) = routine.spawn(tun, routine_token).await {
                error!("routine failed"; "error" => %e);
                if matches!(e, AppError::Bind { .. }) {
                    // A routine that cannot serve takes the process down.
                    shutdown.cancel();
                }
            }
        });
    }

    tokio::spawn(ping::run(Arc::clone(&tun), token.clone()));

    if let Some(addr) = info_addr {
        let tun = Arc::clone(&tun);
        let health_token = token.clone();
        let shutdown = token.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&addr, tun, health_token).await {
                error!("health endpoint failed"; "error" => %e);
                shutdown.cancel();
            }
        });
    }

    token.cancelled().await;
    Ok(())
}

#[cfg(unix)]
fn install_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = quit.recv() => {}
        }
        token.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        token.cancel();
    });
    Ok(())
}

#[cfg(unix)]
fn redirect_stdio_to_null() -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    nix::unistd::dup2(fd, 1)?; // stdout
    nix::unistd::dup2(fd, 2)?; // stderr
    Ok(())
}

#[cfg(not(unix))]
fn redirect_stdio_to_null() -> anyhow::Result<()> {
    Ok(())
}
