use std::{fs::File, sync::Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use epics_fe::{
    config::Settings,
    frontend::{Frontend, FrontendConfig},
    midas::{EventSink, JsonRpcOdb, LogSink, MemoryOdb, MidFileSink, Odb},
};
use tracing::{error, info, warn};

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() -> Result<()> {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let settings = Settings::parse();

    let subscriber = tracing_subscriber::fmt().with_env_filter(settings.log_filter());
    if let Some(path) = &settings.log_file {
        let file = File::create(path)
            .with_context(|| format!("Could not open log file {}", path.display()))?;
        subscriber
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        subscriber.init();
    }

    let config = settings.frontend_config();
    match &settings.offline {
        Some(seed) => {
            let odb = match seed {
                Some(path) => MemoryOdb::load(path)
                    .with_context(|| format!("Could not load ODB from {}", path.display()))?,
                None => MemoryOdb::new(),
            };
            info!("Running offline with an in-memory ODB");
            with_sink(odb, &settings, config).await
        }
        None => {
            let odb = JsonRpcOdb::new(&settings.mhttpd)?;
            info!("Connecting to experiment at {}", settings.mhttpd);
            with_sink(odb, &settings, config).await
        }
    }
}

async fn with_sink<O: Odb>(odb: O, settings: &Settings, config: FrontendConfig) -> Result<()> {
    match &settings.output {
        Some(path) => {
            let sink = MidFileSink::create(path)
                .with_context(|| format!("Could not create {}", path.display()))?;
            run(odb, sink, config).await
        }
        None => run(odb, LogSink, config).await,
    }
}

async fn run<O: Odb, S: EventSink>(odb: O, sink: S, config: FrontendConfig) -> Result<()> {
    let mut frontend = Frontend::new(odb, sink, config);
    if let Err(e) = frontend.init().await {
        error!("Frontend initialisation failed: {e}");
        frontend.mark_failed(&e.to_string()).await;
        return Err(e).context("Frontend initialisation failed");
    }

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => {
                warn!("Cannot listen for interrupts: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    if let Err(e) = frontend.run(shutdown).await {
        frontend.mark_failed(&e.to_string()).await;
        return Err(e).context("Frontend stopped");
    }
    Ok(())
}
