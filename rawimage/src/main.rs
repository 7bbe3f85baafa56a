mod ui;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use rawimage_core::device::{Access, BusType, Device};
use rawimage_core::enumerate::scan_physical_drives;
use rawimage_core::ignore::{DEFAULT_FILE_NAME, IgnoreList};
use rawimage_core::image::{Compression, Oversize, sha256_file};
use rawimage_core::platform::{self, BlockDevice, SystemProbe};
use rawimage_core::read::ReadOptions;
use rawimage_core::session::{OperationContext, Outcome, ensure_distinct};
use rawimage_core::space::SystemFreeSpace;
use rawimage_core::write::WriteOptions;
use rawimage_core::{detect, read, verify, write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use ui::ProgressUi;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "rawimage")]
#[command(about = "Image removable media to and from raw files", version)]
struct Cli {
    /// Increase log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Drive-ignore list [default: ignored_drives.cfg next to the executable]
    #[arg(long, value_name = "PATH", global = true)]
    ignore_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Device id, name or path; prompts when omitted
    #[arg(short, long, value_name = "DEVICE")]
    device: Option<String>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device
    Write {
        /// Image file to write (.gz, .xz and .zst are unpacked first)
        image: PathBuf,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        #[command(flatten)]
        target: Target,
    },
    /// Read a device to an image file
    Read {
        /// Output image file
        image: PathBuf,

        /// Stop at the end of the last MBR partition
        #[arg(short, long)]
        allocated_only: bool,

        #[command(flatten)]
        target: Target,
    },
    /// Compare a device with an image file
    Verify {
        /// Image file to compare against
        image: PathBuf,

        #[command(flatten)]
        target: Target,
    },
    /// Print the GPT partition table of a device
    Detect {
        /// Device id, name or path; prompts when omitted
        #[arg(short, long, value_name = "DEVICE")]
        device: Option<String>,
    },
    /// Print the SHA-256 digest of an image file
    Hash {
        image: PathBuf,
    },
    /// List removable devices eligible for imaging
    List {
        /// List every physical drive, eligible or not
        #[arg(short, long)]
        all: bool,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// With it off, cancelling leaves the progress bars intact. The original
/// terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_ignore_list(path: Option<PathBuf>) -> Result<IgnoreList> {
    let path = match path {
        Some(path) => path,
        None => std::env::current_exe()
            .context("cannot locate the executable")?
            .with_file_name(DEFAULT_FILE_NAME),
    };
    let list = IgnoreList::load(&path)?;
    debug!("ignoring {} drive(s) from {}", list.len(), path.display());
    Ok(list)
}

/// Lists eligible devices, printing any unexpected query failures once.
fn discover(ignored: &IgnoreList) -> Result<Vec<Device>> {
    let found = platform::get_removable_devices(ignored)?;
    for warning in &found.warnings {
        let mut message = warning.to_string();
        let mut cause = std::error::Error::source(warning);
        while let Some(e) = cause {
            message.push_str(&format!(": {e}"));
            cause = std::error::Error::source(e);
        }
        eprintln!("{} {message}", style("warning:").yellow().bold());
    }
    Ok(found.devices)
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Finds the device named on the command line, or asks for one.
///
/// A path to a regular file is accepted as a target, which makes it
/// possible to image into and out of file-backed disks.
fn resolve_device(ignored: &IgnoreList, wanted: Option<&str>, prompt: &str) -> Result<Device> {
    let Some(wanted) = wanted else {
        return select_device(&discover(ignored)?, prompt);
    };
    let devices = discover(ignored)?;
    let by_id = wanted.parse::<u32>().ok();
    if let Some(device) = devices
        .iter()
        .find(|d| Some(d.id) == by_id || d.name == wanted || d.path == Path::new(wanted))
    {
        return Ok(device.clone());
    }

    let path = PathBuf::from(wanted);
    let meta = path
        .metadata()
        .with_context(|| format!("'{wanted}' is not an eligible device"))?;
    if !meta.is_file() {
        return Err(anyhow!("'{wanted}' is not an eligible device"));
    }
    Ok(Device {
        id: 0,
        name: path
            .file_name()
            .map_or_else(|| wanted.to_string(), |n| n.to_string_lossy().into_owned()),
        size_bytes: meta.len(),
        bus: BusType::Unknown,
        removable: false,
        letter: None,
        mount_points: Vec::new(),
        path,
    })
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Asks whether an image larger than the device may be truncated.
///
/// Unattended runs only truncate when the part cut off is all zeros.
fn confirm_oversize(oversize: &Oversize, yes: bool) -> bool {
    println!(
        "{} The image has {} sectors but the device only {}.",
        style("WARNING:").yellow().bold(),
        oversize.image_sectors,
        oversize.device_sectors
    );
    if oversize.trailing_data {
        println!("  The part that does not fit contains data and would be lost.");
    } else {
        println!("  The part that does not fit is empty.");
    }
    if yes {
        return !oversize.trailing_data;
    }
    confirm_operation("Write only the part that fits?", false).unwrap_or(false)
}

fn print_outcome(outcome: Outcome, ui: ProgressUi, success: String) {
    match outcome {
        Outcome::Completed => {
            ui.finish();
            println!("\n✨ {success}");
        }
        Outcome::Canceled => {
            ui.abandon("Cancelled.");
            println!("\nOperation cancelled.");
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cleared by Ctrl+C; the engine stops at the next chunk boundary.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    let ctx = OperationContext::new(running);

    let ignored = load_ignore_list(cli.ignore_file)?;

    match cli.command {
        Commands::Write {
            image,
            no_verify,
            target,
        } => {
            let device = resolve_device(
                &ignored,
                target.device.as_deref(),
                "Select the target device to WRITE to",
            )?;
            ensure_distinct(&image, &device)?;

            println!(
                "{} This will erase all data on '{}' ({:.1} GB).",
                style("WARNING:").red().bold(),
                device.name,
                device.size_gb(),
            );
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            if Compression::from_path(&image) != Compression::None {
                println!("  The image is compressed and will be unpacked first.");
            }
            println!();

            if !confirm_operation("Are you sure you want to proceed?", target.yes)? {
                println!("Write operation cancelled.");
                return Ok(());
            }
            println!();

            let handle = BlockDevice::open(&device, Access::ReadWrite)?;
            let mut ui = ProgressUi::new();
            let result = write::run(
                &ctx,
                handle,
                &image,
                &WriteOptions { verify: !no_verify },
                |o| confirm_oversize(o, target.yes),
                |event| ui.on_event(event),
            );
            match result {
                Ok(outcome) => print_outcome(
                    outcome,
                    ui,
                    format!(
                        "Successfully flashed {} with {}{}.",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan(),
                        if no_verify { " (verification skipped)" } else { "" }
                    ),
                ),
                Err(e) => {
                    ui.abandon("❌ Operation failed.");
                    return Err(e.into());
                }
            }
        }
        Commands::Read {
            image,
            allocated_only,
            target,
        } => {
            let device = resolve_device(
                &ignored,
                target.device.as_deref(),
                "Select the source device to READ from",
            )?;
            ensure_distinct(&image, &device)?;

            println!("This will read {:.1} GB from '{}'.", device.size_gb(), device.name);
            if allocated_only {
                println!("  Only the space allocated to MBR partitions is read.");
            }
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if image.exists()
                && !confirm_operation("The output file exists. Overwrite it?", target.yes)?
            {
                println!("Read operation cancelled.");
                return Ok(());
            }
            if !confirm_operation("Are you sure you want to proceed?", target.yes)? {
                println!("Read operation cancelled.");
                return Ok(());
            }
            println!();

            let handle = BlockDevice::open(&device, Access::Read)?;
            let mut ui = ProgressUi::new();
            let result = read::run(
                &ctx,
                handle,
                &image,
                &ReadOptions { allocated_only },
                &SystemFreeSpace,
                |event| ui.on_event(event),
            );
            match result {
                Ok(outcome) => print_outcome(
                    outcome,
                    ui,
                    format!(
                        "Successfully read {} to {}.",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan()
                    ),
                ),
                Err(e) => {
                    ui.abandon("❌ Operation failed.");
                    return Err(e.into());
                }
            }
        }
        Commands::Verify { image, target } => {
            let device =
                resolve_device(&ignored, target.device.as_deref(), "Select the device to VERIFY")?;
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            let handle = BlockDevice::open(&device, Access::Read)?;
            let mut ui = ProgressUi::new();
            let result = verify::run(
                &ctx,
                handle,
                &image,
                |o| confirm_oversize(o, target.yes),
                |event| ui.on_event(event),
            );
            match result {
                Ok(outcome) => print_outcome(
                    outcome,
                    ui,
                    format!(
                        "{} matches {}.",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan()
                    ),
                ),
                Err(e) => {
                    ui.abandon("❌ Verification failed.");
                    return Err(e.into());
                }
            }
        }
        Commands::Detect { device } => {
            let device =
                resolve_device(&ignored, device.as_deref(), "Select the device to inspect")?;
            let handle = BlockDevice::open(&device, Access::Read)?;
            let detection = detect::run(&ctx, handle)?;
            let Some(gpt) = &detection.gpt else {
                println!("{}: no GPT header found", style(&device.name).bold());
                if let Some(extent) = detection.mbr_extent {
                    println!("  MBR extent: {extent} sectors");
                }
                return Ok(());
            };

            println!(
                "{}: GPT header at byte {}, {} byte blocks ({})",
                style(&device.name).bold(),
                gpt.header_offset,
                gpt.block_size,
                gpt.flash_kind()
            );
            if let Some(extent) = detection.mbr_extent {
                println!("  MBR extent: {extent} sectors");
            }
            println!("\n  {:<24} {:>16} {:>16} {:>16}", "NAME", "START", "SIZE", "END");
            println!("  {:-<24} {:-<16} {:-<16} {:-<16}", "", "", "", "");
            for p in &gpt.partitions {
                println!(
                    "  {:<24} {:>16} {:>16} {:>16}",
                    p.name, p.start_byte, p.size_bytes, p.end_byte
                );
            }
        }
        Commands::Hash { image } => {
            let pb = ui::spinner("Hashing");
            let digest = sha256_file(&image, ctx.running(), |bytes| pb.set_position(bytes));
            pb.finish_and_clear();
            println!("{}  {}", digest?, image.display());
        }
        Commands::List { all } => {
            if all {
                let mut probe = SystemProbe::new()?;
                let drives = scan_physical_drives(&mut probe);
                println!("\n  {:<6} {:<8} {:<10} {:>10}", "INDEX", "BUS", "REMOVABLE", "SIZE");
                println!("  {:-<6} {:-<8} {:-<10} {:-<10}", "", "", "", "");
                for (index, storage, size) in drives {
                    println!(
                        "  {:<6} {:<8} {:<10} {:>7.1} GB",
                        index,
                        storage.bus.to_string(),
                        if storage.removable { "yes" } else { "no" },
                        size as f64 / (1024.0 * 1024.0 * 1024.0)
                    );
                }
                return Ok(());
            }

            let devices = discover(&ignored)?;
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<4} {:<22} {:<16} {:<6} {:<10} {}",
                "ID", "DEVICE", "NAME", "BUS", "SIZE", "LOCATION"
            );
            println!("  {:-<4} {:-<22} {:-<16} {:-<6} {:-<10} {:-<20}", "", "", "", "", "", "");
            for device in devices {
                let location = if device.mount_points.is_empty() {
                    "(Not mounted)".to_string()
                } else {
                    device
                        .mount_points
                        .iter()
                        .map(|mp| mp.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                println!(
                    "  {:<4} {:<22} {:<16} {:<6} {:>7.1} GB  {}",
                    device.id,
                    device.path.display(),
                    device.name,
                    device.bus.to_string(),
                    device.size_gb(),
                    location
                );
            }
        }
    }

    Ok(())
}
