use std::path::PathBuf;
use std::{thread::sleep, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rtdisp::constants::{DEFAULT_READ_SIZE, MAX_FLASH_SIZE};
use rtdisp::device::parse_size_str;
use rtdisp::transport::{self, I2cTransport};
use rtdisp::{ChipDB, Flashing, Session};

#[derive(Parser)]
#[command(
    name = "rtdisp",
    version,
    about = "Firmware programmer for RTD2660/RTD2662 display controllers over I2C"
)]
struct Cli {
    /// Interface backend, see `rtdisp interfaces`
    #[arg(long, short, global = true, default_value = "mcp2221")]
    interface: String,

    /// Interface device number, the first one with a controller is used if omitted
    #[arg(long, short, global = true)]
    device: Option<u32>,

    /// Backend options, `key=value,key=value`
    #[arg(long, short, global = true)]
    settings: Option<String>,

    /// Verbose output, repeat for register traces
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List interface backends usable on this machine
    Interfaces {},
    /// List devices of the selected interface and probe them for a controller
    Devices {},
    /// Decode a GFF container into a raw image
    Decode { input: PathBuf, output: PathBuf },
    #[command(flatten)]
    Device(DeviceCommands),
}

/// Commands that talk to the controller in ISP mode.
#[derive(Subcommand)]
enum DeviceCommands {
    /// Get info about the connected controller and its flash
    Info {},
    /// Erase the whole flash
    Erase {},
    /// Program a firmware image (GFF, Intel HEX, hex text or raw binary)
    Flash {
        path: PathBuf,
        /// Skip the chip erase, pages that are blank in the image are left untouched
        #[arg(long)]
        no_erase: bool,
    },
    /// Dump the flash to a file
    Read {
        path: PathBuf,
        /// Bytes to read, e.g. 512KiB or 0x80000. Defaults to the detected flash size
        #[arg(long, value_parser = parse_size_arg)]
        size: Option<u32>,
    },
    /// Compare flash content with a firmware image
    Verify { path: PathBuf },
    /// Reboot the controller into its firmware
    Reset {},
}

fn parse_size_arg(s: &str) -> std::result::Result<u32, String> {
    let size = parse_size_str(s).map_err(|e| e.to_string())?;
    if size > MAX_FLASH_SIZE {
        return Err(format!("{} exceeds the 24-bit address space", s));
    }
    Ok(size)
}

fn progress_bar(total: u32, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message);
    pb
}

fn list_interfaces() {
    for info in transport::available() {
        println!("{:<14} {}", info.name, info.description);
        for line in info.help.lines() {
            println!("{:<14} {}", "", line);
        }
        println!();
    }
}

fn list_devices(transport: &mut dyn I2cTransport, settings: Option<&str>) -> Result<()> {
    let devices = transport::scan(transport, settings)?;
    if devices.is_empty() {
        log::warn!("No devices found");
    }
    for dev in devices {
        println!(
            "{:>4}: {}{}",
            dev.id,
            dev.name,
            if dev.detected { " [RTD controller]" } else { "" }
        );
    }
    Ok(())
}

/// First device of the backend on which the controller answers.
fn find_device(transport: &mut dyn I2cTransport, settings: Option<&str>) -> Result<u32> {
    transport::scan(transport, settings)?
        .into_iter()
        .find(|d| d.detected)
        .map(|d| {
            log::info!("Using device {}: {}", d.id, d.name);
            d.id
        })
        .ok_or_else(|| anyhow::format_err!("No RTD controller found on any device"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let settings = cli.settings.as_deref();
    match cli.command {
        Commands::Interfaces {} => {
            list_interfaces();
            Ok(())
        }
        Commands::Decode { input, output } => {
            let raw = std::fs::read(&input)?;
            let image = rtdisp::gff::decode_file(&raw)?;
            std::fs::write(&output, &image)?;
            log::info!("Decoded {} bytes to {}", image.len(), output.display());
            Ok(())
        }
        Commands::Devices {} => {
            let mut transport = transport::open(&cli.interface)?;
            list_devices(transport.as_mut(), settings)
        }
        Commands::Device(command) => {
            let mut transport = transport::open(&cli.interface)?;
            let device = match cli.device {
                Some(device) => device,
                None => find_device(transport.as_mut(), settings)?,
            };

            let mut session = Session::new(transport);
            session.init(device, settings)?;
            let db = ChipDB::load()?;
            let mut flashing = Flashing::new(session, &db)?;

            match run(&mut flashing, command) {
                Ok(()) => {
                    flashing.close()?;
                    Ok(())
                }
                Err(e) => {
                    // the controller stays in ISP mode so the operation can be retried
                    if let Err(deinit) = flashing.into_session().deinit() {
                        log::warn!("Closing interface failed: {}", deinit);
                    }
                    Err(e)
                }
            }
        }
    }
}

fn run<T: I2cTransport>(flashing: &mut Flashing<T>, command: DeviceCommands) -> Result<()> {
    match command {
        DeviceCommands::Info {} => {
            flashing.dump_info();
        }
        // the controller is rebooted when the session closes
        DeviceCommands::Reset {} => {}
        DeviceCommands::Erase {} => {
            flashing.dump_info();
            flashing.erase()?;
        }
        DeviceCommands::Flash { path, no_erase } => {
            flashing.dump_info();
            let binary = rtdisp::format::read_firmware_from_file(&path)?;
            log::info!("Firmware size: {}", binary.len());
            if !no_erase {
                flashing.erase()?;
            }

            let pb = progress_bar(binary.len() as u32, "Programming");
            flashing.program(&binary, |_, _, cur| pb.set_position(cur as u64))?;
            pb.finish_and_clear();
            log::info!("Programmed and verified {} bytes", binary.len());

            sleep(Duration::from_millis(100));
        }
        DeviceCommands::Read { path, size } => {
            flashing.dump_info();
            let size = match (size, flashing.flash_size()) {
                (Some(size), _) => size,
                (None, Some(size)) => size,
                (None, None) => {
                    log::warn!("Flash size unknown, reading {} bytes", DEFAULT_READ_SIZE);
                    DEFAULT_READ_SIZE
                }
            };

            let pb = progress_bar(size, "Reading");
            let data = flashing.read(size, |_, _, cur| pb.set_position(cur as u64))?;
            pb.finish_and_clear();
            std::fs::write(&path, &data)?;
            log::info!("Wrote {} bytes to {}", data.len(), path.display());
        }
        DeviceCommands::Verify { path } => {
            let binary = rtdisp::format::read_firmware_from_file(&path)?;
            log::info!("Firmware size: {}", binary.len());
            flashing.verify(&binary)?;
            log::info!("Verified!");
        }
    }
    Ok(())
}
