use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use video_ingest::{SoftwareConverter, synth::SyntheticFactory};

use infer_core::{EngineConfig, InferenceEngine, stub::StubRuntime};
use infer_server::{
    api::{self, ApiState},
    cache::ImageCache,
    cli::Cli,
    config::{ConfigStore, ServerConfig},
    publish::TcpFanoutPublisher,
    stream::{CacheSettings, StreamManager, SupervisorContext},
    telemetry,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match ConfigStore::load_server_config(&cli.config) {
        Ok(config) => {
            println!("loaded config from {}", cli.config.display());
            config
        }
        Err(err) => {
            println!("using default config ({err:#})");
            ServerConfig::default()
        }
    };
    cli.apply_overrides(&mut config);

    telemetry::init_tracing(&config.log_level);
    let prometheus = telemetry::init_metrics_recorder().clone();

    info!("infer-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  http port:     {}", config.http_port);
    info!("  publish bind:  {}", config.publish_bind);
    info!("  infer workers: {}", config.num_infer_workers);
    info!("  streams save:  {}", config.streams_save_path.display());

    // Result publisher and inference engine. The accelerator driver binding
    // plugs in behind `AcceleratorRuntime`; the stub runtime keeps the
    // server bootable without hardware.
    let publisher = TcpFanoutPublisher::bind(&config.publish_bind)
        .context("starting result publisher")?;
    let engine = InferenceEngine::new(
        EngineConfig {
            num_workers: config.num_infer_workers,
            num_cores: config.num_npu_cores,
            queue_capacity: config.infer_queue_capacity,
        },
        Arc::new(StubRuntime::default()),
        publisher.clone(),
    );
    engine.init();

    let cache = config
        .cache_enabled
        .then(|| {
            Arc::new(ImageCache::new(
                config.cache_duration_sec,
                config.cache_max_memory_mb,
            ))
        });

    let manager = Arc::new(StreamManager::new(
        SupervisorContext {
            engine: engine.clone(),
            cache: cache.clone(),
            source_factory: Arc::new(
                SyntheticFactory::new(1280, 720).with_frame_interval(Duration::from_millis(40)),
            ),
            converter: Arc::new(SoftwareConverter),
            cache_settings: CacheSettings {
                resize_width: config.cache_resize_width,
                jpeg_quality: config.cache_jpeg_quality,
            },
        },
        config.streams_save_path.clone(),
    ));

    // Per-stream inferred counters update as results publish.
    let callback_manager = Arc::downgrade(&manager);
    engine.set_result_callback(move |result| {
        if let Some(manager) = callback_manager.upgrade() {
            manager.on_infer_result(result);
        }
    });

    // Recreate streams persisted by the previous run.
    match ConfigStore::load_streams(&config.streams_save_path) {
        Ok(streams) if !streams.is_empty() => manager.load_and_start(&streams),
        Ok(_) => {}
        Err(err) => debug!("no persisted streams to restore: {err:#}"),
    }

    let api_server = api::spawn_api_server(
        ApiState {
            manager: manager.clone(),
            engine: engine.clone(),
            cache: cache.clone(),
            started_at: Instant::now(),
            prometheus: Some(prometheus),
        },
        config.http_port,
    )
    .context("starting REST API")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install signal handler: {err}");
        }
    }

    info!("server started, press Ctrl+C to stop");
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    api_server.stop();
    manager.shutdown();
    engine.shutdown();
    info!("server stopped");
    Ok(())
}
