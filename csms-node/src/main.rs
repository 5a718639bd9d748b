//! CSMS Node - OCPP 1.6-J central system
//!
//! Runs the central system, optionally with a fleet of simulated charge points,
//! logs a snapshot table periodically and accepts operator commands on stdin.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address
//! csms-node
//!
//! # Listen on all interfaces with three simulated charge points
//! csms-node --bind 0.0.0.0:9000 --simulate 3
//!
//! # Simulators waiting for a remote start, verbose logging
//! csms-node --simulate 2 --auto-start-secs 0 --log-level debug
//! ```
//!
//! Charge points connect to `ws://<bind>/ocpp/<identity>`.

mod console;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use csms_adapter_ocpp::{
    CentralSystem, CentralSystemConfig, ChargePointSimulator, SimulatorConfig, SimulatorHandle,
};
use csms_core::CoreConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use console::{parse_line, render_snapshot, truncate, ConsoleCommand, HELP};

/// OCPP 1.6-J central system for EV charge points
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    bind: SocketAddr,

    /// Number of simulated charge points to run against this node
    #[arg(short, long, default_value = "0")]
    simulate: u32,

    /// Identity prefix of simulated charge points
    #[arg(long, default_value = "SIM")]
    sim_prefix: String,

    /// Seconds before a simulated charge point starts charging on its own (0 waits for remote start)
    #[arg(long, default_value = "5")]
    auto_start_secs: u64,

    /// Current drawn by simulated charge points (A)
    #[arg(long, default_value = "8")]
    sim_current: f64,

    /// Nominal line voltage (V)
    #[arg(long, default_value = "230")]
    voltage: f64,

    /// Default charging setpoint for new charge points (A)
    #[arg(long, default_value = "8")]
    setpoint: f64,

    /// Heartbeat interval announced at boot (seconds)
    #[arg(long, default_value = "10")]
    heartbeat_secs: u64,

    /// Close connections silent for this long (seconds)
    #[arg(long, default_value = "30")]
    idle_timeout_secs: u64,

    /// Fail commands not answered within this time (seconds)
    #[arg(long, default_value = "30")]
    command_timeout_secs: u64,

    /// Snapshot log interval (seconds, 0 disables)
    #[arg(long, default_value = "5")]
    snapshot_secs: u64,

    /// Time given to connections to close on shutdown (seconds)
    #[arg(long, default_value = "5")]
    shutdown_grace_secs: u64,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_console: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    let url = format!("ws://{}/ocpp/<identity>", args.bind);
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CSMS Node - OCPP 1.6-J Central System           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:     {:<47} ║", truncate(&url, 47));
    println!("║  Setpoint:   {:<47} ║", format!("{} A @ {} V", args.setpoint, args.voltage));
    println!("║  Heartbeat:  {:<47} ║", format!("{} s", args.heartbeat_secs));
    println!("║  Simulated:  {:<47} ║", args.simulate);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let core = CoreConfig::default()
        .with_nominal_voltage(args.voltage)
        .with_default_setpoint(args.setpoint)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_secs));
    let config = CentralSystemConfig::new(args.bind)
        .with_core(core)
        .with_idle_timeout(Duration::from_secs(args.idle_timeout_secs))
        .with_command_timeout(Duration::from_secs(args.command_timeout_secs))
        .with_shutdown_grace(Duration::from_secs(args.shutdown_grace_secs));

    let csms = CentralSystem::start(config).await?;

    // Simulated fleet
    let csms_url = format!("ws://{}/ocpp", csms.local_addr());
    let auto_start = (args.auto_start_secs > 0).then(|| Duration::from_secs(args.auto_start_secs));
    let mut simulators = JoinSet::new();
    let mut handles: HashMap<String, SimulatorHandle> = HashMap::new();

    for i in 1..=args.simulate {
        let identity = format!("{}-{:03}", args.sim_prefix, i);
        let config = SimulatorConfig::new(&csms_url, &identity)
            .with_auto_start(auto_start)
            .with_max_current(args.sim_current);
        let (simulator, handle) = ChargePointSimulator::new(config);
        handles.insert(identity.clone(), handle);
        simulators.spawn(async move {
            if let Err(e) = simulator.run().await {
                error!("Simulator {} stopped: {}", identity, e);
            }
        });
    }
    if args.simulate > 0 {
        info!("Started {} simulated charge point(s)", args.simulate);
    }

    // Main loop
    let mut snapshot_timer = tokio::time::interval(Duration::from_secs(args.snapshot_secs.max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = !args.no_console;
    if console_open {
        println!("{}", HELP);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }

            _ = snapshot_timer.tick(), if args.snapshot_secs > 0 => {
                info!("Snapshot:\n{}", render_snapshot(&csms.snapshot()));
            }

            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => execute(&csms, &handles, command).await,
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                },
                Ok(None) => {
                    info!("stdin closed; console disabled");
                    console_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    console_open = false;
                }
            },
        }
    }

    // Shutdown
    for handle in handles.values() {
        handle.disconnect().await;
    }
    let drained = tokio::time::timeout(Duration::from_secs(1), async {
        while simulators.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        simulators.abort_all();
    }

    csms.shutdown().await;
    Ok(())
}

async fn execute(csms: &CentralSystem, simulators: &HashMap<String, SimulatorHandle>, command: ConsoleCommand) {
    match command {
        ConsoleCommand::List => println!("{}", render_snapshot(&csms.snapshot())),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}

        ConsoleCommand::Submit { identity, command } => {
            // Do not block the console while the charge point answers
            let dispatcher = csms.dispatcher();
            tokio::spawn(async move {
                match dispatcher.submit(&identity, command).await {
                    Ok(confirmation) => info!(
                        "{} confirmed by {} (now {})",
                        confirmation.command, confirmation.identity, confirmation.state
                    ),
                    Err(e) => warn!("{} to {} failed: {}", command, identity, e),
                }
            });
        }

        ConsoleCommand::Fault { identity, code } => match simulators.get(&identity) {
            Some(handle) => {
                if !handle.inject_fault(code).await {
                    println!("simulator {} is not running", identity);
                }
            }
            None => println!("{} is not a simulated charge point", identity),
        },

        ConsoleCommand::Drop { identity } => match simulators.get(&identity) {
            Some(handle) => {
                if !handle.disconnect().await {
                    println!("simulator {} is not running", identity);
                }
            }
            None => println!("{} is not a simulated charge point", identity),
        },

        ConsoleCommand::Remove { identity } => match csms.registry().remove(&identity) {
            Ok(_) => println!("removed {}", identity),
            Err(e) => println!("{}", e),
        },
    }
}
