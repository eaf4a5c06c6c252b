//! Configure a pulse generator over its command UART.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use pulsegen_common::{
    config::{Configuration, MAX_LEN},
    protocol::{Command, MAX_FRAME_LEN},
};

/// Sent by the device after a frame was applied or stored
const ACK: u8 = 0x01;
/// Sent by the device after a discarded byte or a failed store
const NACK: u8 = 0x00;

/// This doc string acts as a help message when the user runs '--help'
/// as do all doc strings on fields
#[derive(Parser)]
#[clap(version)]
struct Opts {
    /// Serial port the pulse generator is connected to.
    #[clap(short, long, default_value = "/dev/ttyACM0")]
    port: String,
    /// Baud rate of the command UART.
    #[clap(short, long, default_value = "9600")]
    baud: u32,
    /// How long to wait for the acknowledgement of a frame, in milliseconds.
    #[clap(short, long, default_value = "500")]
    timeout: u64,
    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Set low and/or high time, in units of 100 ns.
    Set {
        #[clap(long, parse(try_from_str = parse_len))]
        pause: Option<u32>,
        #[clap(long, parse(try_from_str = parse_len))]
        pulse: Option<u32>,
        /// Persist the configuration afterwards.
        #[clap(short, long)]
        store: bool,
    },
    /// Persist the current configuration to EEPROM.
    Store,
    /// Apply a preset from a TOML file with `pause` and `pulse` keys.
    Apply {
        preset: PathBuf,
        /// Persist the configuration afterwards.
        #[clap(short, long)]
        store: bool,
    },
    /// Print the frames for a configuration as hex, without a device.
    Encode {
        #[clap(long, parse(try_from_str = parse_len))]
        pause: Option<u32>,
        #[clap(long, parse(try_from_str = parse_len))]
        pulse: Option<u32>,
        #[clap(short, long)]
        store: bool,
    },
    /// List available serial ports.
    Ports,
}

/// Parse a length in units of 100 ns, decimal or `0x` prefixed hex.
fn parse_len(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("Invalid length {:?}: {}", value, e))
}

/// Read a preset file.
fn load_preset(path: &Path) -> Result<Configuration> {
    let source = fs::read_to_string(path).context("Could not read preset file")?;
    parse_preset(&source)
}

fn parse_preset(source: &str) -> Result<Configuration> {
    toml::from_str(source).context("Could not parse preset file")
}

/// Build the list of commands to send, in order.
fn commands(pause: Option<u32>, pulse: Option<u32>, store: bool) -> Vec<Command> {
    let mut commands = Vec::with_capacity(3);
    if let Some(pause) = pause {
        commands.push(Command::SetPause(pause));
    }
    if let Some(pulse) = pulse {
        commands.push(Command::SetPulse(pulse));
    }
    if store {
        commands.push(Command::Store);
    }
    commands
}

/// Commands that apply a preset, optionally persisting it.
fn preset_commands(config: Configuration, store: bool) -> Vec<Command> {
    let mut commands = Command::for_configuration(config).to_vec();
    if store {
        commands.push(Command::Store);
    }
    commands
}

fn encode(command: &Command) -> Vec<u8> {
    let mut frame = [0; MAX_FRAME_LEN];
    let len = command.encode(&mut frame);
    frame[..len].to_vec()
}

/// Write one frame and wait for the device to acknowledge it.
fn send_command<P: Read + Write>(port: &mut P, command: &Command) -> Result<()> {
    let frame = encode(command);
    debug!("Sending {}: {}", command, hex::encode(&frame));
    port.write_all(&frame)
        .with_context(|| format!("Could not write {}", command))?;
    port.flush().context("Could not flush serial port")?;

    let mut reply = [0; 1];
    match port.read_exact(&mut reply) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            bail!("No acknowledgement for {}", command)
        }
        Err(e) => return Err(e).context("Could not read acknowledgement"),
    }
    match reply[0] {
        ACK => {
            info!("{}: ok", command);
            Ok(())
        }
        NACK => bail!("Device rejected {}", command),
        other => bail!("Unexpected reply 0x{:02x} to {}", other, command),
    }
}

fn send_all<P: Read + Write>(port: &mut P, commands: &[Command]) -> Result<()> {
    if commands.is_empty() {
        warn!("Nothing to send");
    }
    for command in commands {
        send_command(port, command)?;
    }
    Ok(())
}

fn warn_if_clamped(commands: &[Command]) {
    for command in commands {
        if let Command::SetPause(value) | Command::SetPulse(value) = command {
            if *value > MAX_LEN {
                warn!("{} exceeds {}, the device will clamp it", command, MAX_LEN);
            }
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Could not enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(info) => println!(
                "- {} (USB {:04x}:{:04x} {})",
                port.port_name,
                info.vid,
                info.pid,
                info.product.unwrap_or_default()
            ),
            _ => println!("- {}", port.port_name),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    // Parse command line args
    let opts: Opts = Opts::parse();

    let commands = match opts.action {
        Action::Ports => return list_ports(),
        Action::Encode {
            pause,
            pulse,
            store,
        } => {
            for command in commands(pause, pulse, store) {
                println!("{:<20} {}", command.to_string(), hex::encode(encode(&command)));
            }
            return Ok(());
        }
        Action::Set {
            pause,
            pulse,
            store,
        } => commands(pause, pulse, store),
        Action::Store => commands(None, None, true),
        Action::Apply { preset, store } => {
            let config = load_preset(&preset)?;
            info!("Preset {}: {}", preset.display(), config);
            preset_commands(config, store)
        }
    };
    warn_if_clamped(&commands);

    let mut port = serialport::new(&opts.port, opts.baud)
        .timeout(Duration::from_millis(opts.timeout))
        .open()
        .with_context(|| format!("Could not open {}", opts.port))?;
    send_all(&mut port, &commands)
}
