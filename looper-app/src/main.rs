//! Headless looper entry point.
//!
//! ## Threads
//!
//! - cpal audio threads: capture and playback callbacks, engine inside.
//! - stdin reader: parses console lines into [`ConsoleCommand`]s.
//! - main thread: owns the `AudioHost` and the `LooperController`, applies
//!   commands and runs the display tick.

mod console;
mod settings;

use std::io::BufRead;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use console::{execute, parse_command, ConsoleCommand};
use crossbeam_channel::{select, tick, Receiver};
use looper_core::{
    audio::{
        device::{list_input_devices, list_output_devices},
        AudioHost, StreamPlan,
    },
    new_looper, LooperController,
};
use settings::{default_settings_path, load_settings, save_settings};
use tracing::{debug, error, info, warn};

fn main() -> ExitCode {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("looper_app=info,looper_core=info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    info!("Looper starting");

    let settings_path = default_settings_path();
    let first_run = !settings_path.exists();
    let mut app_settings = load_settings(&settings_path);
    if first_run {
        if let Err(e) = save_settings(&settings_path, &app_settings) {
            warn!("could not write default settings: {e}");
        }
    }
    app_settings.apply_env_overrides();
    info!(
        settings_path = ?settings_path,
        n_scenes = app_settings.n_scenes,
        monitor_inputs = app_settings.monitor_inputs,
        auto_scene_change = app_settings.auto_scene_change,
        rollover_policy = ?app_settings.rollover_policy,
        "runtime settings loaded"
    );

    for device in list_input_devices() {
        debug!(name = %device.name, is_default = device.is_default, loopback = device.is_loopback_like, "input device");
    }
    for device in list_output_devices() {
        debug!(name = %device.name, is_default = device.is_default, "output device");
    }

    // ── Engine setup ──────────────────────────────────────────────────────
    let plan = StreamPlan::negotiate(&app_settings.host_options())
        .context("failed to negotiate audio devices")?;
    let (engine, mut controller) = new_looper(
        app_settings.engine_config(),
        plan.sample_rate,
        plan.frames_per_period,
    )
    .context("failed to build looper engine")?;
    let host = AudioHost::start(plan, engine).context("failed to start audio streams")?;

    let commands = spawn_console_reader();
    let ticker = tick(Duration::from_millis(app_settings.gui_interval_ms));
    info!("ready: t=record/overdub s=scene m=mute l/+/- <n>=loop d=delete r/R=reset p=status q=quit");

    // ── Control loop ──────────────────────────────────────────────────────
    loop {
        select! {
            recv(commands) -> command => match command {
                Ok(ConsoleCommand::Quit) | Err(_) => break,
                Ok(ConsoleCommand::PrintStatus) => print_status(&controller),
                Ok(command) => {
                    if let Err(e) = execute(&mut controller, command) {
                        warn!("command failed: {e}");
                    }
                }
            },
            recv(ticker) -> _ => {
                for event in controller.poll() {
                    debug!(notice = ?event.notice(), "engine event");
                }
                controller.scan_peaks();
                let peaks = controller.transient_peaks();
                debug!(
                    in_left = peaks.in_left,
                    in_right = peaks.in_right,
                    out_left = peaks.out_left,
                    out_right = peaks.out_right,
                    "peaks"
                );
            }
        }

        if host.is_disconnected() {
            host.stop();
            let status = host.status();
            bail!(
                "audio device disconnected: {}",
                status.last_error.unwrap_or_else(|| "unknown error".into())
            );
        }
    }

    host.stop();
    info!("Looper stopped");
    Ok(())
}

/// Read stdin on its own thread. End of input quits.
fn spawn_console_reader() -> Receiver<ConsoleCommand> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }
        let _ = tx.send(ConsoleCommand::Quit);
    });
    rx
}

fn print_status(controller: &LooperController) {
    match serde_json::to_string_pretty(&controller.status()) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("failed to serialize status: {e}"),
    }
}
