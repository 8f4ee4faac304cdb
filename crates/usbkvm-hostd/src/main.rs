//! usbkvm host daemon entry point.
//!
//! ```text
//! main()
//!  ├─ usbkvm  – one dongle from config/usbkvm.json, flat routes
//!  ├─ ipkvm   – scan the device tree, one instance per dongle,
//!  │            UUID-addressed /api/v1 routes
//!  ├─ scan    – print discovered device groups as JSON and exit
//!  └─ cfgchip – reprogram the HID chip's stored baud rate (the chip
//!               ships at 9600; the protocol engine runs it at 115200)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use usbkvm_device::capture::v4l2::V4l2CtlBackend;
use usbkvm_device::capture::VideoBackend;
use usbkvm_device::hid::{HidConfig, HidController};
use usbkvm_device::{discovery, KvmRegistry};

use usbkvm_hostd::api;
use usbkvm_hostd::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Single dongle described by the JSON config file.
    Usbkvm,
    /// Every dongle found on the USB tree, addressed by UUID.
    Ipkvm,
    /// Print discovered device groups as JSON and exit.
    Scan,
    /// Rewrite the HID chip's stored baud rate to 115200.
    Cfgchip,
}

#[derive(Debug, Parser)]
#[command(name = "usbkvm-hostd", about = "Multi-instance USB-KVM host daemon")]
struct Args {
    /// Mode of operation.
    #[arg(long, value_enum, default_value_t = Mode::Ipkvm)]
    mode: Mode,

    /// Directory holding usbkvm.json and uuid.cfg.
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    /// Listen address override, e.g. 0.0.0.0:9000.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.config_dir)
        .with_context(|| format!("failed to create config dir {}", args.config_dir.display()))?;
    let node_uuid = config::node_uuid(&args.config_dir)?;
    info!(%node_uuid, "usbkvm host starting");

    match args.mode {
        Mode::Scan => run_scan().await,
        Mode::Cfgchip => run_cfgchip(&args).await,
        Mode::Usbkvm => run_usbkvm(&args).await,
        Mode::Ipkvm => run_ipkvm(&args).await,
    }
}

// ── Modes ─────────────────────────────────────────────────────────────────────

/// Debug tool: dump the discovered device groups.
async fn run_scan() -> anyhow::Result<()> {
    let groups = discovery::discover_device_groups().await?;
    println!("{}", serde_json::to_string_pretty(&groups)?);
    Ok(())
}

/// One-shot chip configuration.  The CH9329 ships talking 9600 baud;
/// this opens it at that rate and stores 115200.  The change applies on
/// the next replug.
async fn run_cfgchip(args: &Args) -> anyhow::Result<()> {
    let cfg = config::load_or_create(&args.config_dir)?;
    let hid = HidController::new(HidConfig {
        port_name: cfg.usb_kvm_device_path.clone(),
        baud_rate: 9_600,
        scroll_sensitivity: 0x01,
    });
    hid.connect().await.context("failed to open HID serial")?;

    let chip_cfg = hid
        .current_config()
        .await
        .context("failed to read chip configuration")?;
    info!(config = ?chip_cfg, "current chip parameter block");

    hid.configure_baudrate(115_200)
        .await
        .context("failed to write chip configuration")?;
    hid.close().await;

    println!("Configuration sent. Unplug the device and plug it back in to apply.");
    Ok(())
}

/// Single-dongle mode.
async fn run_usbkvm(args: &Args) -> anyhow::Result<()> {
    dependency_precheck()?;
    let cfg = config::load_or_create(&args.config_dir)?;

    let backend: Arc<dyn VideoBackend> = Arc::new(V4l2CtlBackend);
    let registry = Arc::new(KvmRegistry::new(backend));
    registry
        .add(cfg.instance_options())
        .await
        .context("invalid usbkvm configuration")?;
    registry.start_all().await.context("failed to start dongle")?;

    let instance = registry
        .first()
        .await
        .context("no instance after start")?;
    if !instance.aux_available() {
        warn!("no responding aux MCU; /aux endpoints will answer 501");
    }

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| cfg.listening_address.clone());
    let app = api::single_instance_router(instance);
    serve(app, &listen, Arc::clone(&registry)).await
}

/// Multi-dongle mode.
async fn run_ipkvm(args: &Args) -> anyhow::Result<()> {
    dependency_precheck()?;

    let backend: Arc<dyn VideoBackend> = Arc::new(V4l2CtlBackend);
    let discovered = discovery::scan_usb_kvm_devices(backend.as_ref())
        .await
        .context("device scan failed")?;
    info!(count = discovered.len(), "USB KVM dongles discovered");

    let registry = Arc::new(KvmRegistry::new(backend));
    for options in discovered {
        if let Err(e) = registry.add(options).await {
            // One malformed dongle (e.g. video-only hub) must not keep
            // the rest offline.
            warn!(error = %e, "skipping unusable device group");
        }
    }
    if registry.is_empty().await {
        anyhow::bail!("no usable USB KVM devices found");
    }
    registry.start_all().await.context("failed to start dongles")?;

    let listen = args.listen.clone().unwrap_or_else(|| "0.0.0.0:9000".into());
    let app = api::multi_instance_router(Arc::clone(&registry));
    serve(app, &listen, registry).await
}

// ── Serving & shutdown ────────────────────────────────────────────────────────

async fn serve(
    app: axum::Router,
    listen: &str,
    registry: Arc<KvmRegistry>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down instances");
    registry.stop_all().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

// ── Environment pre-check ─────────────────────────────────────────────────────

/// Verifies the external capture tooling is present before any mode that
/// needs it starts opening devices.
fn dependency_precheck() -> anyhow::Result<()> {
    for tool in ["v4l2-ctl", "arecord", "udevadm"] {
        if !binary_on_path(tool) {
            anyhow::bail!("{tool} not found in PATH");
        }
    }
    info!("capture tooling present (v4l2-ctl, arecord, udevadm)");
    Ok(())
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}
