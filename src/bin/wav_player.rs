//! WAV Player
//!
//! Lists output endpoints with their volume, or plays a file through one of
//! them while following device and volume changes.
//!
//! Usage: `wav-player [--simulate] [--config <path>] list | play <index> <file.wav>`

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use endpoint_player::{
    audio::playback::NullOutput,
    config::AppConfig,
    controller::Controller,
    native::{self, simulated::SimulatedSubsystem, AudioSubsystem},
    AudioFacade, PlaybackEngine,
};

const USAGE: &str =
    "usage: wav-player [--simulate] [--config <path>] list | play <index> <file.wav>";

enum Command {
    List,
    Play { index: usize, file: PathBuf },
}

struct Args {
    simulate: bool,
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let mut simulate = false;
    let mut config = None;
    let mut rest = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--simulate" => simulate = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            _ => rest.push(arg),
        }
    }

    let command = match rest.as_slice() {
        [cmd] if cmd == "list" => Command::List,
        [cmd, index, file] if cmd == "play" => Command::Play {
            index: index.parse().context("device index must be a number")?,
            file: PathBuf::from(file),
        },
        _ => bail!(USAGE),
    };

    Ok(Args {
        simulate,
        config,
        command,
    })
}

fn main() -> Result<()> {
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default()?,
    };
    config.validate()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting WAV player");

    let (subsystem, engine): (Arc<dyn AudioSubsystem>, PlaybackEngine) = if args.simulate {
        let sim = SimulatedSubsystem::new();
        sim.add_device("Speakers (Simulated)", 2);
        sim.add_device("Headset (Simulated)", 1);
        (
            Arc::new(sim),
            PlaybackEngine::new(Arc::new(NullOutput), config.playback.clone()),
        )
    } else {
        (
            native::default_subsystem()?,
            PlaybackEngine::with_cpal(config.playback.clone()),
        )
    };

    let mut controller = Controller::new(AudioFacade::new(subsystem), engine, &config)?;

    match args.command {
        Command::List => list(&mut controller),
        Command::Play { index, file } => play(&mut controller, index, &file),
    }
}

fn list(controller: &mut Controller) -> Result<()> {
    println!("\n=== Output Devices ===");
    for index in 0..controller.devices().len() {
        controller.select_device(index)?;
        let device = &controller.devices()[index];
        print!("  [{}] {} ({} ch)", index, device.name, device.max_output_channels);
        match controller.volume_display() {
            Some(display) => println!(
                " volume {}%{}",
                display.percent,
                if display.muted { " [MUTED]" } else { "" }
            ),
            None => println!(),
        }
        println!("      ID: {}", device.id);
    }
    println!();
    controller.shutdown();
    Ok(())
}

fn play(controller: &mut Controller, index: usize, file: &Path) -> Result<()> {
    controller.select_device(index)?;
    controller.play(file)?;

    let ticker = crossbeam_channel::tick(controller.poll_interval());
    let mut last_display = controller.volume_display();

    loop {
        if ticker.recv().is_err() {
            break;
        }

        let report = controller.pump(Instant::now());

        let display = controller.volume_display();
        if display != last_display {
            if let Some(volume) = display {
                let muted = if volume.muted { " (muted)" } else { "" };
                tracing::info!("Volume {}%{}", volume.percent, muted);
            }
            last_display = display;
        }

        if let Some(reason) = report.finished {
            tracing::info!("Playback finished: {}", reason);
            break;
        }
        if report.device_events > 0 && !controller.is_playing() {
            tracing::warn!("Output devices changed, playback stopped");
            break;
        }
    }

    controller.shutdown();
    Ok(())
}
