mod transport_btleplug;

use transport_btleplug::{BleDiscovery, BleTransport, dfu_uuids};

use anyhow::Context;
use btleplug::api::BDAddr;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secure_dfu::protocol::ObjectType;
use secure_dfu::transport::ControlChannel;
use secure_dfu::waiter::ResponseWaiter;
use secure_dfu::{DeviceFilter, DfuConfig, DfuEvent, DfuSession, FirmwareImage, RetryPolicy, find_device};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Update firmware on nRF secure DFU targets
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name or address
    target: String,

    /// Match the target as a suffix of the device address
    #[arg(long)]
    suffix: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start DFU mode using Buttonless DFU Service
    Trigger {
        /// Response timeout in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
    },
    /// Upload an init packet and firmware image
    Update {
        /// Init packet (.dat)
        #[arg(long)]
        init: PathBuf,
        /// Firmware image (.bin)
        firmware: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(clap::Args)]
struct TransferArgs {
    /// Largest single write, including 3 bytes of ATT overhead
    #[arg(long, default_value_t = 247)]
    mtu: usize,
    /// Control point response timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
    /// Packets per receipt notification (0 disables them)
    #[arg(long, default_value_t = 0)]
    prn: u16,
    /// Pause before every data packet in milliseconds
    #[arg(long, default_value_t = 1)]
    packet_delay_ms: u64,
    /// Attempts of the checksum request
    #[arg(long, default_value_t = 3)]
    checksum_attempts: u32,
    /// Pause between attempts of a request in milliseconds
    #[arg(long, default_value_t = 100)]
    retry_delay_ms: u64,
    /// Attempts of every other control point request
    #[arg(long, default_value_t = 1)]
    request_attempts: u32,
    /// Do not send the terminal frame after the last object
    #[arg(long)]
    no_exit: bool,
}

impl TransferArgs {
    fn config(&self) -> DfuConfig {
        DfuConfig {
            mtu: self.mtu,
            operation_timeout: Duration::from_millis(self.timeout_ms),
            prn: self.prn,
            inter_packet_delay: Duration::from_millis(self.packet_delay_ms),
            checksum_retry: RetryPolicy::new(self.checksum_attempts, Duration::from_millis(self.retry_delay_ms)),
            request_retry: RetryPolicy::new(self.request_attempts, Duration::from_millis(self.retry_delay_ms)),
            exit_on_complete: !self.no_exit,
        }
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")
}

async fn connect(discovery: &BleDiscovery, target: &str, suffix: bool) -> anyhow::Result<BleTransport> {
    let filter = if suffix || BDAddr::from_str(target).is_ok() {
        DeviceFilter::IdSuffix(target.to_string())
    } else {
        DeviceFilter::Name(target.to_string())
    };

    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(64));
    pb.set_message(format!("Searching for `{}`...", target));
    let found = find_device(discovery, &filter).await?;
    pb.finish_with_message(format!("Found {} ({})", found.descriptor.id, target));

    discovery.connect(found.device).await
}

/// Trigger DFU mode using the Buttonless DFU service
async fn dfu_trigger(transport: &BleTransport, timeout: Duration) -> anyhow::Result<()> {
    let control = transport.control(dfu_uuids::BTTNLSS)?;
    let mut waiter = ResponseWaiter::subscribe(&control, timeout).await?;
    control.write(&[0x01]).await?;
    let res = waiter.await_response(None).await?;
    anyhow::ensure!(res.eq(&[0x20, 0x01, 0x01]), "DFU trigger failed");
    Ok(())
}

async fn dfu_update(transport: &BleTransport, init: &Path, firmware: &Path, config: DfuConfig) -> anyhow::Result<()> {
    let image = FirmwareImage {
        init_packet: std::fs::File::open(init).with_context(|| format!("cannot open {}", init.display()))?,
        firmware: std::fs::File::open(firmware).with_context(|| format!("cannot open {}", firmware.display()))?,
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{elapsed}] [{wide_bar:.blue/white}] {bytes}/{total_bytes} ({bytes_per_sec})")?
            .progress_chars("#> "),
    );
    pb.set_message("Uploading...");
    let observer = |event: &DfuEvent| match event {
        DfuEvent::Progress {
            object: ObjectType::Data,
            sent,
            total,
        } => {
            pb.set_length(*total);
            pb.set_position(*sent);
        }
        DfuEvent::RequestRetry { phase, attempt, of } => {
            pb.println(format!("No response while {}, retrying ({}/{})...", phase, attempt, of));
        }
        DfuEvent::Completed => pb.finish_with_message("Done"),
        DfuEvent::Failed { .. } => pb.abandon_with_message("Failed"),
        _ => {}
    };

    let control = transport.control(dfu_uuids::CTRL_PT)?;
    let data = transport.data(dfu_uuids::DATA_PT)?;
    let mut session = DfuSession::new(control, data, config);
    session.run(image, &observer).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let discovery = BleDiscovery::new().await?;
    let transport = connect(&discovery, &args.target, args.suffix).await?;
    let result = match &args.command {
        Commands::Trigger { timeout_ms } => dfu_trigger(&transport, Duration::from_millis(*timeout_ms)).await,
        Commands::Update {
            init,
            firmware,
            transfer,
        } => dfu_update(&transport, init, firmware, transfer.config()).await,
    };
    if let Err(e) = transport.disconnect().await {
        info!(error = %e, "disconnect failed");
    }
    result
}
