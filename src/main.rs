use clap::{Arg, Command};
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use streamwall::config::{app_name, version, EngineConfig, RoomEntry};
use streamwall::output::AudioSink;
use streamwall::session::GridSessionManager;
use streamwall::source::{BackendRegistry, FileBackend, LogCodec, SynthBackend};
use streamwall::SourceHealth;
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt::init();

    let app_name = Box::leak(app_name().to_owned().into_boxed_str());

    let matches = Command::new(&*app_name)
        .version(version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Wall configuration file (JSON); omit for a 2x2 synth demo wall.")
                .required(false),
        )
        .arg(
            Arg::new("logs-dir")
                .long("logs-dir")
                .value_name("DIR")
                .help("Base directory for the file backend's packet logs.")
                .required(false)
                .default_value("."),
        )
        .arg(
            Arg::new("audio")
                .short('a')
                .long("audio")
                .value_name("AUDIO")
                .help("Play the mixed output on the default device (yes/no).")
                .required(false)
                .ignore_case(true)
                .default_value("yes"),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => match EngineConfig::load(&PathBuf::from(path)) {
            Ok(config) => config,
            Err(e) => {
                error!("{e:#}");
                std::process::exit(1);
            }
        },
        None => demo_config(),
    };

    let logs_dir = matches
        .get_one::<String>("logs-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let with_audio = matches
        .get_one::<String>("audio")
        .map(|v| v.to_lowercase() == "yes")
        .unwrap_or(true);

    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_token.cancel();
    })
    .expect("Error setting Ctrl-C handler");

    run(config, logs_dir, with_audio, shutdown);
}

/// A 2x2 wall of synthetic rooms, used when no config is given
fn demo_config() -> EngineConfig {
    serde_json::from_str(
        r#"{
            "rows": 2,
            "cols": 2,
            "rooms": [
                {"room": "demo-a", "backend": "synth", "position": {"x": -1.0, "y": 0.0, "z": 1.0}},
                {"room": "demo-b", "backend": "synth", "position": {"x": 1.0, "y": 0.0, "z": 1.0}},
                {"room": "demo-c", "backend": "synth", "position": {"x": -1.0, "y": 0.0, "z": -1.0}},
                {"room": "demo-d", "backend": "synth", "position": {"x": 1.0, "y": 0.0, "z": -1.0}}
            ]
        }"#,
    )
    .expect("demo config is valid")
}

#[tokio::main]
async fn run(config: EngineConfig, logs_dir: PathBuf, with_audio: bool, shutdown: CancellationToken) {
    let mut registry = BackendRegistry::new();
    registry.register("synth", Arc::new(SynthBackend::default()));
    registry.register(
        "file",
        Arc::new(FileBackend::new(logs_dir, LogCodec::Raw).with_realtime_pacing()),
    );

    let manager = GridSessionManager::new(config.session_config(), registry);
    for entry in &config.rooms {
        if let Err(e) = place_room(&manager, entry) {
            error!("{}: {e}", entry.room);
        }
    }

    let sink = if with_audio {
        match AudioSink::new(config.tuning.sample_rate) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("audio output unavailable ({e}), running silent");
                None
            }
        }
    } else {
        None
    };

    info!(
        "{} {}: wall {}x{}, {} rooms",
        app_name(),
        version(),
        config.rows,
        config.cols,
        manager.source_count()
    );

    let mut ticker = tokio::time::interval(config.tick_interval());
    let mut last_report = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let out = manager.tick();
        if let Some(sink) = &sink {
            sink.push(&out.mixed);
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = tokio::time::Instant::now();
            for (cell, status) in &out.cells {
                let marker = match status.health {
                    SourceHealth::Healthy => "",
                    SourceHealth::Degraded => " [degraded]",
                    SourceHealth::Resyncing => " [resyncing]",
                    SourceHealth::Failed => " [FAILED]",
                };
                info!("{cell} {}{marker}: {}", status.display_name, status.stats);
            }
        }
    }

    info!("shutting down");
    manager.clear();
}

fn place_room(
    manager: &GridSessionManager,
    entry: &RoomEntry,
) -> Result<(), streamwall::SessionError> {
    let id = manager.add_room(entry.to_room(), entry.cell)?;
    manager.set_position(id, entry.position)?;
    manager.set_volume(id, entry.volume)?;
    if entry.muted {
        manager.set_muted(id, true)?;
    }
    if !entry.enabled {
        manager.set_enabled(id, false)?;
    }
    Ok(())
}
