//! duosock CLI
//!
//! A small netcat-style client for exercising the socket engine.

mod session;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duosock::{Config, LoggingUdpDelegate, TcpSocket, TlsSettings, UdpSocket};

use session::{read_line, SessionEvent, TcpSession, UdpPrinter};

/// Dual-stack TCP/UDP test client
#[derive(Parser)]
#[command(name = "duosock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file; built-in defaults when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a TCP connection and pipe stdin to it
    Connect {
        host: String,
        port: u16,

        /// Upgrade to TLS right after connecting
        #[arg(long)]
        tls: bool,

        /// Accept any server certificate (implies manual trust)
        #[arg(long)]
        insecure: bool,

        /// Local interface name or address to connect from
        #[arg(short, long)]
        interface: Option<String>,

        /// Connect timeout in seconds
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Print datagrams arriving on a port
    UdpListen {
        port: u16,

        /// Multicast group to join
        #[arg(short, long)]
        group: Option<String>,

        /// Interface to bind and join on
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Send one datagram
    UdpSend {
        host: String,
        port: u16,
        message: String,

        /// Enable broadcast before sending
        #[arg(long)]
        broadcast: bool,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "duosock.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Connect {
            host,
            port,
            tls,
            insecure,
            interface,
            timeout,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = ConnectOptions {
                tls: tls || insecure,
                insecure,
                interface,
                timeout: Duration::from_secs(timeout),
            };
            run_connect(&config, &host, port, options).await
        }
        Commands::UdpListen {
            port,
            group,
            interface,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_udp_listen(&config, port, group, interface).await
        }
        Commands::UdpSend {
            host,
            port,
            message,
            broadcast,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_udp_send(&config, &host, port, message, broadcast).await
        }
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct ConnectOptions {
    tls: bool,
    insecure: bool,
    interface: Option<String>,
    timeout: Duration,
}

fn tls_settings(config: &Config, host: &str, insecure: bool) -> Result<TlsSettings> {
    if insecure {
        return TlsSettings::builder()
            .manual_trust(true)
            .build()
            .context("Failed to build TLS settings");
    }
    match &config.tls {
        Some(tls) => tls
            .to_settings()
            .context("Failed to load TLS settings from configuration"),
        None => TlsSettings::builder()
            .peer_name(host)
            .build()
            .context("Failed to build TLS settings"),
    }
}

async fn run_connect(config: &Config, host: &str, port: u16, options: ConnectOptions) -> Result<()> {
    let (session, mut events) = TcpSession::new(options.insecure);
    let sock = TcpSocket::builder()
        .config(&config.tcp)
        .delegate(session)
        .build()
        .context("Failed to create TCP socket")?;

    let timeout = Some(options.timeout);
    let requested = match &options.interface {
        Some(interface) => sock.connect_via_interface(host, port, interface, timeout).await,
        None => sock.connect(host, port, timeout).await,
    };
    requested.with_context(|| format!("Failed to connect to {}:{}", host, port))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut line_tag = 1;
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Connected) => {
                    if options.tls {
                        sock.start_tls(tls_settings(config, host, options.insecure)?);
                    }
                    read_line(&sock)?;
                }
                Some(SessionEvent::Secured) => {}
                Some(SessionEvent::Data(data)) => {
                    print!("{}", String::from_utf8_lossy(&data));
                }
                Some(SessionEvent::Closed(None)) | None => {
                    info!("Connection closed");
                    return Ok(());
                }
                Some(SessionEvent::Closed(Some(e))) => {
                    bail!("Connection closed: {}", e);
                }
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    sock.write_data(format!("{}\r\n", line), None, line_tag)?;
                    line_tag += 1;
                }
                None => {
                    // stdin ended, close once the queued lines are out
                    stdin_open = false;
                    sock.disconnect_after_writing();
                }
            },
            result = &mut shutdown => {
                result?;
                info!("Disconnecting...");
                sock.disconnect();
                let _ = tokio::time::timeout(Duration::from_secs(5), sock.closed()).await;
                return Ok(());
            }
        }
    }
}

async fn run_udp_listen(
    config: &Config,
    port: u16,
    group: Option<String>,
    interface: Option<String>,
) -> Result<()> {
    let (printer, mut done) = UdpPrinter::new();
    let sock = UdpSocket::builder()
        .config(&config.udp)
        .delegate(printer)
        .build()
        .context("Failed to create UDP socket")?;

    sock.bind_to_port(port, interface.as_deref())
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    if let Some(group) = &group {
        sock.join_multicast_group(group, interface.as_deref())
            .await
            .with_context(|| format!("Failed to join multicast group {}", group))?;
        info!("Joined multicast group {}", group);
    }
    sock.begin_receiving().await?;
    info!(
        "Listening on {:?} / {:?}",
        sock.local_address_v4(),
        sock.local_address_v6()
    );

    tokio::select! {
        result = wait_for_shutdown() => {
            result?;
            info!("Shutting down listener...");
            sock.close();
        }
        reason = done.recv() => {
            if let Some(Some(e)) = reason {
                error!("Socket closed: {}", e);
            }
        }
    }
    Ok(())
}

async fn run_udp_send(
    config: &Config,
    host: &str,
    port: u16,
    message: String,
    broadcast: bool,
) -> Result<()> {
    let sock = UdpSocket::builder()
        .config(&config.udp)
        .delegate(LoggingUdpDelegate)
        .build()
        .context("Failed to create UDP socket")?;

    if broadcast {
        sock.enable_broadcast(true)
            .await
            .context("Failed to enable broadcast")?;
    }
    sock.send_to_host(message.into_bytes(), host, port, Some(Duration::from_secs(5)), 1);
    sock.close_after_sending();

    if tokio::time::timeout(Duration::from_secs(10), sock.closed())
        .await
        .is_err()
    {
        warn!("Send did not finish in time");
        sock.close();
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => Ok(Config::default()),
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
