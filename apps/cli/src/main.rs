use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fwup_core::transport::{LinkTransport, SimulatedDevice, link_pair};
use fwup_core::{
    CodeBlockSource, FirmwareImage, FirmwareVersion, LocalUpdateSource, ResponseCode,
    SuspendReason, TracingObserver, TransferOutcome, UpdateAvailability, UpdateConfig,
    UpdateOrchestrator, UpdateSource, UpdateStage,
};
use tracing::{error, info, warn};

/// Link drops tolerated by `simulate` before giving up.
const MAX_RECONNECTS: u32 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "Wearable OTA firmware update tool", long_about = None)]
struct Args {
    /// Config file (TOML). Flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the running version against an update manifest
    Check {
        /// Version running on the device
        #[arg(long)]
        current: String,

        /// Directory holding manifest.toml and the image
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Show how an image splits into code blocks
    Inspect {
        /// Firmware image file
        image: PathBuf,

        #[arg(long)]
        block_size: Option<usize>,

        /// Print the CRC of every block
        #[arg(long)]
        crcs: bool,
    },
    /// Run a complete update against the simulated device
    Simulate(SimulateArgs),
    /// Write a default config file
    Config {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Firmware image file. Without it the image is downloaded from the source.
    #[arg(long, conflicts_with = "source")]
    image: Option<PathBuf>,

    /// Directory holding manifest.toml and the image
    #[arg(long)]
    source: Option<PathBuf>,

    /// Version the simulated device is running
    #[arg(long, default_value = "0.0.0")]
    current: String,

    #[arg(long)]
    block_size: Option<usize>,

    #[arg(long)]
    max_retries: Option<u8>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Persist the session snapshot to this file
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Drop the link when this block is stored, then reconnect
    #[arg(long)]
    drop_at: Option<u16>,

    /// Flip a bit in this block once so its CRC check fails
    #[arg(long)]
    corrupt_block: Option<u16>,

    /// Answer InvalidCRC to the first CRC read of this block
    #[arg(long)]
    flaky_crc: Option<u16>,

    /// Start with the device off its charger
    #[arg(long)]
    off_charger: bool,

    /// Stop after verification without applying
    #[arg(long)]
    no_apply: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => UpdateConfig::load_from_file(path)?,
        None => UpdateConfig::default(),
    };

    match args.command {
        Command::Check { current, source } => check(&config, &current, source),
        Command::Inspect {
            image,
            block_size,
            crcs,
        } => inspect(&image, block_size.unwrap_or(config.block_size), crcs),
        Command::Simulate(sim) => simulate(config, sim),
        Command::Config { path, force } => write_config(&config, &path, force),
    }
}

fn check(config: &UpdateConfig, current: &str, source: Option<PathBuf>) -> Result<()> {
    let current: FirmwareVersion = current.parse()?;
    let Some(dir) = source.or_else(|| config.source_dir.clone()) else {
        bail!("No update source: pass --source or set source_dir in the config");
    };

    match LocalUpdateSource::new(&dir).check(&current)? {
        UpdateAvailability::UpToDate { current } => {
            println!("Up to date ({})", current);
        }
        UpdateAvailability::Available(manifest) => {
            println!(
                "Update available: {} -> {} ({}, {} bytes)",
                current, manifest.version, manifest.image, manifest.size
            );
        }
    }
    Ok(())
}

fn inspect(path: &Path, block_size: usize, crcs: bool) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let image = FirmwareImage::from_bytes(data, block_size)?;

    println!("Image:       {}", path.display());
    println!("Size:        {} bytes", image.len());
    println!("Block size:  {} bytes", image.block_size());
    println!("Blocks:      {}", image.total_blocks());
    println!("Fingerprint: 0x{:08X}", image.fingerprint());

    if crcs {
        for block in image.blocks() {
            println!("  block {:5}  crc 0x{:04X}", block.index, block.crc());
        }
    }
    Ok(())
}

fn write_config(config: &UpdateConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config.save_to_file(path)?;
    info!(path = %path.display(), "Config written");
    Ok(())
}

fn simulate(mut config: UpdateConfig, args: SimulateArgs) -> Result<()> {
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.response_timeout_ms = timeout_ms;
    }
    if args.snapshot.is_some() {
        config.snapshot_path = args.snapshot.clone();
    }
    if args.source.is_some() {
        config.source_dir = args.source.clone();
    }
    config.validate()?;

    let device = SimulatedDevice::new();
    if let Some(index) = args.drop_at {
        device.disconnect_at_store(index);
    }
    if let Some(index) = args.corrupt_block {
        device.corrupt_store(index, 1);
    }
    if let Some(index) = args.flaky_crc {
        device.fail_crc_read(index, ResponseCode::InvalidCrc, 1);
    }
    device.set_on_charger(!args.off_charger);

    let (transport, endpoint) = link_pair();
    let mut links = vec![device.serve(endpoint)];
    let mut orchestrator = UpdateOrchestrator::new(transport, config);

    let result = drive_update(&mut orchestrator, &device, &mut links, &args);

    // Closing the session side ends any link thread still serving.
    drop(orchestrator);
    for link in links {
        if link.join().is_err() {
            warn!("Simulated link thread panicked");
        }
    }

    result?;
    println!(
        "Device now holds {} staged blocks, applied: {}",
        device.staged_blocks(),
        device.is_applied()
    );
    Ok(())
}

fn drive_update(
    orchestrator: &mut UpdateOrchestrator<LinkTransport, TracingObserver>,
    device: &SimulatedDevice,
    links: &mut Vec<JoinHandle<()>>,
    args: &SimulateArgs,
) -> Result<()> {
    match &args.image {
        Some(path) => {
            let data =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let image = FirmwareImage::from_bytes(data, orchestrator.config().block_size)?;
            orchestrator.load_image(image)?;
        }
        None => {
            let current: FirmwareVersion = args.current.parse()?;
            let manifest = match orchestrator.check_update(&current)? {
                UpdateAvailability::Available(manifest) => manifest,
                UpdateAvailability::UpToDate { current } => {
                    println!("Up to date ({}), nothing to do", current);
                    return Ok(());
                }
            };
            orchestrator.download(&manifest, |_| {})?;
        }
    }

    let mut reporter = StageReporter::default();
    let mut outcome = orchestrator.transfer_and_verify(|s, f| reporter.report(s, f), false)?;
    let mut reconnects = 0;

    loop {
        match outcome {
            TransferOutcome::Verified if args.no_apply => {
                println!("All blocks verified, not applying");
                return Ok(());
            }
            TransferOutcome::Verified => {
                outcome = orchestrator.apply()?;
            }
            TransferOutcome::Applied => {
                println!("Firmware update applied");
                return Ok(());
            }
            TransferOutcome::Suspended {
                phase,
                index,
                reason,
            } => {
                reconnects += 1;
                if reconnects > MAX_RECONNECTS {
                    bail!(
                        "Giving up after {} interruptions at {} block {}",
                        MAX_RECONNECTS,
                        phase,
                        index
                    );
                }
                match reason {
                    SuspendReason::Disconnected => {
                        info!(phase = %phase, index, "Reconnecting simulated device");
                        device.reconnect();
                        let (transport, endpoint) = link_pair();
                        links.push(device.serve(endpoint));
                        orchestrator.on_device_reconnected(transport);
                    }
                    SuspendReason::NotOnCharger => {
                        info!("Placing simulated device on the charger");
                        device.set_on_charger(true);
                    }
                }
                outcome = orchestrator.continue_from_current_state(|s, f| reporter.report(s, f))?;
            }
            TransferOutcome::Paused { phase, index } => {
                bail!("Update paused at {} block {}", phase, index);
            }
            TransferOutcome::Canceled => {
                bail!("Update canceled");
            }
        }
    }
}

/// Logs stage changes and every tenth of progress.
#[derive(Default)]
struct StageReporter {
    stage: Option<UpdateStage>,
    step: u32,
}

impl StageReporter {
    fn report(&mut self, stage: UpdateStage, fraction: f64) {
        if self.stage != Some(stage) {
            self.stage = Some(stage);
            self.step = 0;
            println!("{}", stage);
        }
        let step = (fraction * 10.0) as u32;
        if step > self.step {
            self.step = step;
            println!("  {:3.0}%", fraction * 100.0);
        }
    }
}
