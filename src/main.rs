use std::sync::Arc;

use log::{error, info, warn};
use pcap2db::configuration::Configuration;
use pcap2db::controller::FlowCorrelationEngine;
use pcap2db::data_capture::FilePayloadSink;
use pcap2db::network::CaptureSource;
use pcap2db::storage::{FlowStore, SqliteStore};

fn main() {
    let config = Configuration::from_args();

    let settings = config.settings().unwrap_or_else(|e| {
        eprintln!("Unable to load settings: {}", e);
        std::process::exit(1);
    });
    let level = settings.logging.level_filter().unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    });

    // RUST_LOG still takes precedence over the configured level.
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_target(false)
        .init();

    info!("pcap2db v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let store = match SqliteStore::new_file(&config.database) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Unable to open flow database {:?}: {}", config.database, e);
            std::process::exit(1);
        }
    };

    let mut source = match CaptureSource::open(&config.capture_file) {
        Ok(source) => source,
        Err(e) => {
            error!("{}", e);
            close_store(store.as_ref());
            std::process::exit(1);
        }
    };

    let sink = Arc::new(FilePayloadSink::with_prefix(
        &config.workdir,
        &settings.sink.file_prefix,
    ));
    let mut engine = FlowCorrelationEngine::new(store.clone(), sink, settings.store.embed_payload);

    info!(
        "Replaying {:?} into {:?}",
        config.capture_file, config.workdir
    );
    let result = engine.run(&mut source);
    info!(
        "Decoded {} frames, skipped {}",
        source.frames(),
        source.skipped()
    );
    close_store(store.as_ref());

    match result {
        Ok(summary) => {
            if summary.truncated {
                warn!("Capture was truncated; flows seen before the damage were persisted");
            }
        }
        Err(e) => {
            error!("Fatal: {}, exiting...", e);
            std::process::exit(1);
        }
    }
}

fn close_store(store: &dyn FlowStore) {
    if let Err(e) = store.close() {
        error!("Unable to close flow database: {}", e);
    }
}
