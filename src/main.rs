// src/main.rs - printer-link daemon entry point
use clap::Parser;
use printer_link::config::{self, Config};
use printer_link::printer::Printer;
use printer_link::serial::Transport;
use printer_link::serial::mock::{mock_pair, spawn_simulator};
use printer_link::serial::port::SerialTransport;
use printer_link::web;
use std::path::PathBuf;
use std::sync::Arc;

/// Serial host daemon for Prusa printers
#[derive(Parser, Debug)]
#[command(name = "printer-link", version, about = "Serial host daemon for Prusa printers")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port (overrides the config file)
    #[arg(long)]
    serial_port: Option<String>,

    /// HTTP listen address (overrides the config file)
    #[arg(long)]
    address: Option<String>,

    /// HTTP listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Talk to a built-in simulated printer instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// G-code file to print once the printer is identified
    #[arg(long)]
    print: Option<PathBuf>,
}

fn load(cli: &Cli) -> Result<Config, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(&path.to_string_lossy())?,
        None => Config::default(),
    };
    if let Some(port) = &cli.serial_port {
        config.serial.port = port.clone();
    }
    if let Some(address) = &cli.address {
        config.http.address = address.clone();
    }
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();
    let config = load(&cli)?;

    // Initialize logging
    let level = config.logging.level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting printer-link {}", env!("CARGO_PKG_VERSION"));

    let transport: Box<dyn Transport> = if cli.simulate {
        tracing::info!("Using the simulated printer");
        let (transport, firmware) = mock_pair();
        spawn_simulator(firmware);
        Box::new(transport)
    } else {
        Box::new(SerialTransport::open(&config.serial.port, config.serial.baudrate)?)
    };

    let address = config.http.address.clone();
    let port = config.http.port;
    let printer = Arc::new(Printer::new(config, transport)?);
    printer.start()?;

    let startup = {
        let printer = printer.clone();
        let print = cli.print.clone();
        tokio::spawn(async move {
            match printer.identify().await {
                Ok(info) => tracing::info!("Printer ready: {:?}", info),
                Err(e) => {
                    tracing::error!("Printer identification failed: {}", e);
                    return;
                }
            }
            if let Some(path) = print {
                if let Err(e) = printer.start_print(&path).await {
                    tracing::error!("Could not start print of {}: {}", path.display(), e);
                }
            }
        })
    };

    let server = tokio::spawn(web::serve(printer.clone(), address, port, printer.shutdown_token()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted");
    startup.abort();
    printer.shutdown().await;
    server.await??;
    Ok(())
}
