//! Corral CLI - run and supervise a pool of forked workers.

mod colors;
mod echo;
mod call;
mod run;
mod serve;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use corral_core::{IpcMode, PoolConfig, ProtocolType};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Multi-process worker pool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a pool, push tasks through it and shut it down
    Run {
        #[command(flatten)]
        pool: PoolArgs,

        /// Number of tasks to dispatch
        #[arg(short, long, default_value = "8")]
        tasks: u32,

        /// Perform a rolling reload after the replies are in
        #[arg(long)]
        reload: bool,

        /// Seconds to wait for replies
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Start a pool and supervise it until SIGTERM or SIGINT (SIGUSR1 reloads)
    Serve {
        #[command(flatten)]
        pool: PoolArgs,

        /// Also accept stream peers on this address (unix:/path, a socket path, or host:port)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Send one request frame to a listening pool and print the replies
    Call {
        /// Address the pool listens on
        addr: String,

        /// Request payload
        payload: String,

        /// Largest frame accepted in either direction
        #[arg(long, default_value = "67108864")]
        max_frame_size: usize,
    },

    /// Validate a pool configuration file
    Check {
        /// Path to the JSON configuration
        config: PathBuf,
    },
}

#[derive(Args)]
struct PoolArgs {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of worker processes
    #[arg(short, long)]
    workers: Option<u32>,

    /// Transport: none, unix_socket, msg_queue, stream_socket
    #[arg(long, value_parser = parse_ipc_mode)]
    ipc: Option<IpcMode>,

    /// Framing: task, message, stream
    #[arg(long, value_parser = parse_protocol)]
    protocol: Option<ProtocolType>,
}

impl PoolArgs {
    fn into_config(self) -> anyhow::Result<PoolConfig> {
        let mut config = match &self.config {
            Some(path) => PoolConfig::from_json_file(path)?,
            None => PoolConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.worker_num = workers;
        }
        if let Some(ipc) = self.ipc {
            config.ipc_mode = ipc;
            // Pick the framing the transport requires unless one was given.
            if self.protocol.is_none() {
                config.protocol = match ipc {
                    IpcMode::StreamSocket => ProtocolType::Stream,
                    IpcMode::MsgQueue => ProtocolType::Task,
                    _ => config.protocol,
                };
            }
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_ipc_mode(s: &str) -> Result<IpcMode, String> {
    match s.replace('-', "_").as_str() {
        "none" => Ok(IpcMode::None),
        "unix_socket" => Ok(IpcMode::UnixSocket),
        "msg_queue" => Ok(IpcMode::MsgQueue),
        "stream_socket" => Ok(IpcMode::StreamSocket),
        other => Err(format!("unknown ipc mode '{}'", other)),
    }
}

fn parse_protocol(s: &str) -> Result<ProtocolType, String> {
    match s {
        "task" => Ok(ProtocolType::Task),
        "message" => Ok(ProtocolType::Message),
        "stream" => Ok(ProtocolType::Stream),
        other => Err(format!("unknown protocol '{}'", other)),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pool,
            tasks,
            reload,
            timeout,
        } => run::execute(pool.into_config()?, tasks, reload, timeout)?,

        Commands::Serve { pool, listen } => serve::execute(pool.into_config()?, listen)?,

        Commands::Call {
            addr,
            payload,
            max_frame_size,
        } => call::execute(&addr, &payload, max_frame_size)?,

        Commands::Check { config } => {
            let config = PoolConfig::from_json_file(&config)?;
            println!(
                "{}ok{}: {} workers, {:?} over {:?}",
                colors::GREEN,
                colors::RESET,
                config.worker_num,
                config.protocol,
                config.ipc_mode
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipc_mode() {
        assert_eq!(parse_ipc_mode("unix_socket"), Ok(IpcMode::UnixSocket));
        assert_eq!(parse_ipc_mode("stream-socket"), Ok(IpcMode::StreamSocket));
        assert!(parse_ipc_mode("pipe").is_err());
    }

    #[test]
    fn test_stream_socket_defaults_to_stream_protocol() {
        let args = PoolArgs {
            config: None,
            workers: Some(3),
            ipc: Some(IpcMode::StreamSocket),
            protocol: None,
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.worker_num, 3);
        assert_eq!(config.protocol, ProtocolType::Stream);
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        let args = PoolArgs {
            config: None,
            workers: None,
            ipc: Some(IpcMode::MsgQueue),
            protocol: Some(ProtocolType::Stream),
        };
        assert!(args.into_config().is_err());
    }
}
