use std::{
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use hearth::{AppContext, Server, ServerConfig};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "hearth", about = "Event-driven HTTP/1.x file server", disable_version_flag = true)]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 80)]
    port: u16,

    /// Connection backlog passed to listen
    #[arg(short = 'b', long, default_value_t = 50)]
    backlog: u32,

    /// Worker threads; defaults to one per logical CPU, pinned
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Only log errors
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Log per-connection activity
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log everything, including request payloads
    #[arg(short = 'V', long)]
    very_verbose: bool,

    /// Redirect stdout and stderr into FILE (truncated, created 0644)
    #[arg(short = 'l', long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Document root URIs are served from
    #[arg(short = 'r', long, default_value = "public")]
    root: PathBuf,

    /// Seconds a connection may stay idle before it is closed
    #[arg(long, default_value_t = 5)]
    idle_timeout: u64,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    if let Some(path) = &args.log_file {
        if let Err(e) = redirect_output(path) {
            eprintln!("couldn't open log file {}: {e}", path.display());
            return ExitCode::from(1);
        }
    }

    let level = if args.very_verbose {
        Level::TRACE
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let ctx = match AppContext::new(args.root.clone()) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("request grammar failed to compile: {e}");
            return ExitCode::from(1);
        }
    };

    let cfg = ServerConfig {
        port: args.port,
        backlog: args.backlog,
        threads: args.threads.unwrap_or(0),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        ..ServerConfig::default()
    };

    let server = match Server::bind(cfg, ctx) {
        Ok(server) => server,
        Err(e) => {
            error!("initialization failed: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = server.trap_signals() {
        error!("couldn't install signal handlers: {e}");
        return ExitCode::from(1);
    }

    info!(root = %args.root.display(), "serving files");
    if let Err(e) = server.run() {
        error!("server failed: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

/// Points stdout and stderr at `path` so every log line lands in the file.
fn redirect_output(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    unsafe {
        if libc::dup2(file.as_raw_fd(), libc::STDOUT_FILENO) == -1
            || libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
