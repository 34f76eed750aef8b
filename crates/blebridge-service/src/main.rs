//! blebridge - BLE sensor telemetry bridge.
//!
//! Run with: `cargo run -p blebridge-service -- run`
//!
//! The management subcommands edit the same registry file as `run` and open
//! the radio themselves; stop the bridge before using them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use blebridge_core::{
    BtleplugHost, DeviceFlags, HistoryRequest, JsonFileStore, PairingState, PinHandle, Registry,
    Scheduler, TelemetryDispatcher, Watchdog, normalize_address,
};
use blebridge_service::bridge::{self, Shutdown, fatal_watchdog, flush_before_exit};
use blebridge_service::{Config, EX_TEMPFAIL, InfluxSink, MqttSink};

/// Attempts to run a queued pairing flow while the radio is still held.
const PAIR_ATTEMPTS: u32 = 3;

/// blebridge - forwards BLE sensor readings to InfluxDB and MQTT.
#[derive(Parser, Debug)]
#[command(name = "blebridge")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge in the foreground (default).
    Run,

    /// Scan once and print what was heard.
    Scan,

    /// List registered devices.
    Devices,

    /// Register a device heard by a scan.
    Add { mac: String },

    /// Unregister a device and forget its bond.
    Remove { mac: String },

    /// Change a device's settings.
    Set {
        mac: String,
        /// Acquire readings from this device.
        #[arg(long)]
        enabled: Option<bool>,
        /// Allow connecting when the advertisement carries no reading.
        #[arg(long)]
        gatt: Option<bool>,
        /// Backfill missed samples from the on-board log.
        #[arg(long)]
        history: Option<bool>,
    },

    /// Request history records, fetched on the next cycle.
    #[command(group(ArgGroup::new("amount").required(true).args(["records", "hours"])))]
    History {
        mac: String,
        #[arg(long)]
        records: Option<u32>,
        #[arg(long)]
        hours: Option<u32>,
    },

    /// Pair with a device, prompting for the PIN it displays.
    Pair {
        mac: String,
        /// PIN shown on the device; prompted for when omitted.
        #[arg(long)]
        pin: Option<u32>,
    },

    /// Remove the pairing with a device.
    Unpair { mac: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("blebridge={level}").parse()?),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.validate()?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_bridge(config).await,
        command => run_command(command, config).await,
    }
}

async fn open_scheduler(
    config: &Config,
    dispatcher: TelemetryDispatcher,
    watchdog: Watchdog,
) -> anyhow::Result<Scheduler> {
    let host = BtleplugHost::new()
        .await
        .context("Failed to open the Bluetooth adapter")?
        .connect_timeout(config.bridge.connect_timeout());
    let registry = Registry::load(JsonFileStore::new(&config.bridge.registry_path))
        .with_context(|| format!("Failed to load {:?}", config.bridge.registry_path))?;
    Ok(Scheduler::new(
        Arc::new(host),
        registry,
        dispatcher,
        watchdog,
        config.bridge.scheduler_config(),
    ))
}

async fn run_bridge(config: Config) -> anyhow::Result<()> {
    let mut dispatcher = TelemetryDispatcher::default();
    if config.influx.enabled {
        dispatcher.add_sink(Arc::new(InfluxSink::new(
            config.influx.clone(),
            &config.bridge.name,
        )?));
    }
    let _mqtt = if config.mqtt.enabled {
        let (sink, task) = MqttSink::connect(config.mqtt.clone())?;
        dispatcher.add_sink(Arc::new(sink));
        Some(task)
    } else {
        None
    };
    if dispatcher.sinks().is_empty() {
        info!("No sinks enabled; readings are only logged");
    }

    let fatal = CancellationToken::new();
    let shutdown = CancellationToken::new();
    let mut scheduler =
        open_scheduler(&config, dispatcher.clone(), fatal_watchdog(fatal.clone())).await?;

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current step");
            ctrl_c.cancel();
        }
    });

    match bridge::run(
        &mut scheduler,
        config.bridge.cycle_pause(),
        &shutdown,
        &fatal,
    )
    .await
    {
        Shutdown::Requested => {
            flush_before_exit(&dispatcher).await;
            info!("Bridge stopped");
            Ok(())
        }
        Shutdown::Fatal(e) => {
            error!("Fatal: {}", e);
            flush_before_exit(&dispatcher).await;
            std::process::exit(EX_TEMPFAIL);
        }
    }
}

async fn run_command(command: Command, config: Config) -> anyhow::Result<()> {
    let mut scheduler =
        open_scheduler(&config, TelemetryDispatcher::default(), Watchdog::default()).await?;

    match command {
        Command::Run => bail!("`run` is not a management command"),
        Command::Scan => {
            let heard = scheduler.observe_scan().await?;
            println!("Heard {} advertisement(s):", heard.len());
            for (adv, family) in heard {
                let registered = if scheduler.registry().contains(&adv.address) {
                    "registered"
                } else {
                    ""
                };
                println!(
                    "  {}  {:<16} {:>8}  {:<24} {}",
                    adv.address,
                    family.to_string(),
                    adv.rssi.map_or_else(|| "-".to_string(), |r| format!("{r} dBm")),
                    adv.name.as_deref().unwrap_or("-"),
                    registered
                );
            }
        }
        Command::Devices => {
            let devices = scheduler.list_devices();
            if devices.is_empty() {
                println!("No registered devices. Use `blebridge scan` and `blebridge add <mac>`.");
            }
            for d in devices {
                println!(
                    "{}  {:<16} {:<24} enabled={} gatt={} history={} {:?}{}",
                    d.address,
                    d.family.to_string(),
                    d.name,
                    d.flags.enabled,
                    d.flags.gatt_allowed,
                    d.flags.history_enabled,
                    d.pairing,
                    if d.pending_history > 0 {
                        format!(" ({} history records pending)", d.pending_history)
                    } else {
                        String::new()
                    }
                );
            }
        }
        Command::Add { mac } => {
            scheduler.observe_scan().await?;
            let device = scheduler
                .add_device(&mac)
                .with_context(|| format!("{mac} was not heard; is it in range?"))?;
            println!("Registered {} ({}, {})", device.address, device.name, device.family);
        }
        Command::Remove { mac } => {
            let device = scheduler.remove_device(&mac).await?;
            println!("Removed {} ({})", device.address, device.name);
        }
        Command::Set {
            mac,
            enabled,
            gatt,
            history,
        } => {
            let current = scheduler
                .registry()
                .get(&mac)
                .map(|d| d.flags)
                .with_context(|| format!("{mac} is not registered"))?;
            let flags = DeviceFlags {
                enabled: enabled.unwrap_or(current.enabled),
                gatt_allowed: gatt.unwrap_or(current.gatt_allowed),
                history_enabled: history.unwrap_or(current.history_enabled),
            };
            scheduler.set_flags(&mac, flags)?;
            println!("{}: {:?}", normalize_address(&mac), flags);
        }
        Command::History {
            mac,
            records,
            hours,
        } => {
            let request = match (records, hours) {
                (Some(n), _) => HistoryRequest::Records(n),
                (None, Some(h)) => HistoryRequest::Hours(h),
                (None, None) => bail!("--records or --hours is required"),
            };
            let n = scheduler.request_history(&mac, request)?;
            println!("{n} records will be fetched on the next cycle");
        }
        Command::Pair { mac, pin } => pair(&mut scheduler, &mac, pin).await?,
        Command::Unpair { mac } => {
            scheduler.unpair(&mac).await?;
            println!("Unpaired {}", normalize_address(&mac));
        }
    }
    Ok(())
}

async fn pair(scheduler: &mut Scheduler, mac: &str, pin: Option<u32>) -> anyhow::Result<()> {
    // The host only connects to peripherals it has heard.
    scheduler.observe_scan().await?;
    scheduler.request_pairing(mac)?;

    let handle = scheduler.pin_handle();
    let prompt = match pin {
        Some(pin) => {
            handle.supply_pin(pin);
            None
        }
        None => Some(tokio::spawn(prompt_pin(handle.clone()))),
    };

    let mut outcome = None;
    for _ in 0..PAIR_ATTEMPTS {
        outcome = scheduler.run_pending_pairing().await?;
        if !matches!(outcome, Some(PairingState::PairingRequested)) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    if let Some(task) = prompt {
        task.abort();
    }

    match outcome {
        Some(PairingState::Paired) => {
            println!("Paired with {}", normalize_address(mac));
            Ok(())
        }
        Some(PairingState::PairingRequested) => bail!("the radio stayed busy; try again"),
        _ => bail!("pairing with {mac} failed"),
    }
}

/// Ask for the PIN on stdin once the device requests it.
async fn prompt_pin(handle: PinHandle) {
    while !handle.pin_requested() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    println!("Enter the PIN shown on the device (empty to cancel):");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(line)) => match line.trim().parse::<u32>() {
            Ok(pin) => {
                handle.supply_pin(pin);
            }
            Err(_) => handle.cancel(),
        },
        _ => handle.cancel(),
    }
}
