//! Tracker simulator - command line entry point
//!
//! Modes: interactive (default), `--headless`, `--drive <minutes>` and
//! `--spike <N>`. Exit codes: 0 success, 1 configuration error, 2
//! connection failure, 3 certificate error, 4 runtime error.

use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracksim::config::SimulatorConfig;
use tracksim::error::{TrackerError, EXIT_CONFIG_ERROR, EXIT_CONNECTION_FAILURE, EXIT_OK};
use tracksim::logging::init_default_logging;
use tracksim::sim::{Simulator, SystemRng};
use tracksim::transport::MqttTransportFactory;
use tracksim::ManagerState;
use tracing::{error, info};

/// GPS tracker device simulator
#[derive(Parser)]
#[command(name = "tracksim")]
#[command(about = "GPS tracker device client and simulator")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, value_name = "FILE", default_value = "simulator.toml")]
    config: PathBuf,

    /// Run an automated driving session for the given number of minutes
    #[arg(long, value_name = "MINUTES")]
    drive: Option<f64>,

    /// Emit N random events with 100 ms spacing and exit
    #[arg(long, value_name = "COUNT")]
    spike: Option<u32>,

    /// Run without interactive input
    #[arg(long)]
    headless: bool,
}

/// Interactive commands read from stdin
enum Command {
    ToggleIgnition,
    SetSpeed(f64),
    SetBattery(f64),
    Drive(f64),
    Spike(u32),
    Quit,
}

#[tokio::main]
async fn main() {
    init_default_logging();
    let cli = Cli::parse();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Some(dps) = &config.dps {
        info!(
            id_scope = %dps.id_scope,
            imei = %dps.imei,
            "connection mode: provisioned (X.509)"
        );
    } else {
        info!(
            hub = %config.iot_hub_host,
            device_id = %config.device_id,
            "connection mode: legacy (shared access key)"
        );
    }

    let mut simulator =
        match Simulator::new(config, MqttTransportFactory, Box::new(SystemRng::new())) {
            Ok(simulator) => simulator,
            Err(e) => {
                error!("configuration error: {e}");
                process::exit(EXIT_CONFIG_ERROR);
            }
        };

    if let Err(e) = simulator.start().await {
        error!("failed to start: {e}");
        process::exit(e.exit_code());
    }

    let exit_code = if let Some(count) = cli.spike {
        run_spike(&mut simulator, count).await
    } else if let Some(minutes) = cli.drive {
        run_drive(&mut simulator, minutes).await
    } else if cli.headless {
        run_headless(&mut simulator).await
    } else {
        run_interactive(&mut simulator).await
    };

    simulator.stop().await;
    info!("simulator shut down");
    process::exit(exit_code);
}

fn load_configuration(path: &PathBuf) -> Result<SimulatorConfig, tracksim::config::ConfigError> {
    let mut config = if path.exists() {
        info!("loading configuration from {}", path.display());
        SimulatorConfig::load(path)?
    } else {
        info!(
            "config file {} not found, using environment configuration",
            path.display()
        );
        SimulatorConfig::sample()
    };

    config.apply_env_overrides()?;

    if !config.has_dps() && !config.has_legacy() {
        return Err(tracksim::config::ConfigError::MissingConnectionSettings);
    }

    Ok(config)
}

/// Map a terminal manager failure to an exit code, if one has occurred
fn check_terminal_failure(simulator: &Simulator<MqttTransportFactory>) -> Option<i32> {
    if simulator.manager().state() != ManagerState::Failed {
        return None;
    }

    let code = simulator
        .manager()
        .failure()
        .map(|failure| TrackerError::from(failure.clone()).exit_code())
        .unwrap_or(EXIT_CONNECTION_FAILURE);
    error!("connection terminally failed");
    Some(code)
}

async fn run_spike(simulator: &mut Simulator<MqttTransportFactory>, count: u32) -> i32 {
    // Give the connection a moment to come up so the burst publishes live
    for _ in 0..5 {
        simulator.tick().await;
        if simulator.manager().is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    simulator.generate_spike(count).await;

    // Flush retries
    while simulator.pending_work() > 0 {
        simulator.tick().await;
        if let Some(code) = check_terminal_failure(simulator) {
            return code;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    EXIT_OK
}

async fn run_drive(simulator: &mut Simulator<MqttTransportFactory>, minutes: f64) -> i32 {
    simulator.start_driving(minutes);

    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(minutes * 60.0);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                simulator.tick().await;
                if let Some(code) = check_terminal_failure(simulator) {
                    return code;
                }
                if tokio::time::Instant::now() >= deadline {
                    simulator.set_speed(0.0);
                    simulator.set_ignition(false);
                    return EXIT_OK;
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupted");
                return EXIT_OK;
            }
        }
    }
}

async fn run_headless(simulator: &mut Simulator<MqttTransportFactory>) -> i32 {
    info!("running headless; press Ctrl+C to stop");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                simulator.tick().await;
                if let Some(code) = check_terminal_failure(simulator) {
                    return code;
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupted");
                return EXIT_OK;
            }
        }
    }
}

async fn run_interactive(simulator: &mut Simulator<MqttTransportFactory>) -> i32 {
    println!("Interactive mode. Commands:");
    println!("  i - toggle ignition");
    println!("  s - set speed");
    println!("  b - set battery percentage");
    println!("  d - start driving");
    println!("  p - generate spike");
    println!("  q - quit");

    let (command_tx, mut command_rx) = mpsc::channel(8);
    std::thread::spawn(move || read_commands(command_tx));

    let mut ignition_on = false;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                simulator.tick().await;
                if let Some(code) = check_terminal_failure(simulator) {
                    return code;
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(Command::ToggleIgnition) => {
                        ignition_on = !ignition_on;
                        simulator.set_ignition(ignition_on);
                        println!("Ignition {}", if ignition_on { "ON" } else { "OFF" });
                    }
                    Some(Command::SetSpeed(speed)) => {
                        simulator.set_speed(speed);
                        println!("Speed set to {speed} km/h");
                    }
                    Some(Command::SetBattery(pct)) => {
                        simulator.set_battery_percentage(pct);
                        println!("Battery set to {pct}%");
                    }
                    Some(Command::Drive(minutes)) => {
                        simulator.start_driving(minutes);
                        println!("Driving for {minutes} minutes");
                    }
                    Some(Command::Spike(count)) => {
                        simulator.generate_spike(count).await;
                        println!("Generated {count} events");
                    }
                    Some(Command::Quit) | None => {
                        return EXIT_OK;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupted");
                return EXIT_OK;
            }
        }
    }
}

/// Blocking stdin reader feeding the interactive loop. Prompts for the
/// numeric argument where a command takes one.
fn read_commands(tx: mpsc::Sender<Command>) {
    use std::io::{BufRead, Write};

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        let Some(Ok(line)) = lines.next() else { break };
        let command = match line.trim() {
            "i" => Some(Command::ToggleIgnition),
            "s" => prompt_number(&mut lines, "Enter speed (km/h): ").map(Command::SetSpeed),
            "b" => prompt_number(&mut lines, "Enter battery percentage: ")
                .map(Command::SetBattery),
            "d" => prompt_number(&mut lines, "Enter duration (minutes): ").map(Command::Drive),
            "p" => prompt_number(&mut lines, "Enter event count: ")
                .map(|n: f64| Command::Spike(n as u32)),
            "q" => Some(Command::Quit),
            "" => None,
            other => {
                println!("Unknown command: {other}");
                None
            }
        };

        if let Some(command) = command {
            let quit = matches!(command, Command::Quit);
            if tx.blocking_send(command).is_err() || quit {
                break;
            }
        }
        let _ = std::io::stdout().flush();
    }
}

fn prompt_number<B: std::io::BufRead>(
    lines: &mut std::io::Lines<B>,
    prompt: &str,
) -> Option<f64> {
    use std::io::Write;

    print!("{prompt}");
    let _ = std::io::stdout().flush();

    let Some(Ok(line)) = lines.next() else {
        return None;
    };
    match line.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            println!("Not a number: {}", line.trim());
            None
        }
    }
}
