//! Rack probe tool.
//!
//! Opens the controller link, performs the unlock handshake and prints the
//! chassis telemetry (firmware version, temperature, battery rails). Handy
//! as a first smoke test of a rack: if this works, module traffic will too.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use modrack::adapters::SerialTransport;
use modrack::config::Settings;
use modrack::LinkSession;

#[derive(Parser)]
#[command(name = "rack_probe", about = "Probe a rack controller and print chassis telemetry")]
struct Args {
    /// Optional TOML settings file (overridden by RACK_* environment
    /// variables and the flags below).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the controller.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate for the link.
    #[arg(long)]
    baud: Option<u32>,

    /// Receive timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Leave the controller locked again after probing.
    #[arg(long)]
    relock: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = Settings::new(args.config.as_deref()).context("loading settings")?;
    if let Some(port) = args.port {
        settings.link.port = port;
    }
    if let Some(baud) = args.baud {
        settings.link.baud_rate = baud;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        settings.link.timeout_ms = timeout_ms;
    }

    let transport = SerialTransport::open(
        &settings.link.port,
        settings.link.baud_rate,
        settings.link.timeout(),
    )
    .with_context(|| format!("opening rack controller on {}", settings.link.port))?;

    let link = LinkSession::new(Box::new(transport));
    link.unlock().context("unlock handshake")?;
    if let Some(reference) = settings.reference_frequency_hz {
        link.set_ref_frequency(reference);
    }

    let firmware = link.get_firmware_version().context("firmware version")?;
    let temperature = link.get_temperature().context("temperature")?;
    let battery = link.get_battery().context("battery voltages")?;

    println!("controller on {}", settings.link.port);
    println!("  firmware:    {}", firmware);
    println!("  temperature: {:.1} C", temperature);
    println!("  battery:     {:+.2} V / {:+.2} V", battery.plus, battery.minus);

    if args.relock {
        link.lock().context("relocking")?;
    }
    link.close();
    Ok(())
}
