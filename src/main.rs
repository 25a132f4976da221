//! Main entry point for the stream admission controller

use clap::error::ErrorKind;
use clap::{Arg, Command};
use gstreamer::glib;
use std::cell::RefCell;
use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use stream_admission_gstreamer::{
    error::{Error, Result},
    pipeline::{BatchPipeline, BusEvent, PipelineCommon, SourceWorkerFactory},
    resource::SystemResourceSampler,
    scheduler::{AdmissionScheduler, TickOutcome},
    types::{resolve_location, AdmissionConfig},
};

fn cli() -> Command {
    Command::new("stream-admission")
        .version("0.1.0")
        .about("Loops a video file into a batched GStreamer pipeline, adding streams while load allows")
        .arg(
            Arg::new("input")
                .value_name("PATH_OR_URI")
                .help("H.264 elementary stream file, as a path or file:// URI")
                .required(true),
        )
        .arg(
            Arg::new("num-sources")
                .value_name("NUM_SOURCES")
                .help("Number of streams to start with")
                .required(true)
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("JSON file overriding the default thresholds and element names"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() {
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Usage: stream-admission <uri1> <num_sources>");
            process::exit(-1);
        }
    };

    let verbose = matches.get_flag("verbose");
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match load_config(
        matches.get_one::<String>("config").map(String::as_str),
        matches.get_one::<String>("input").map(String::as_str).unwrap_or_default(),
        matches.get_one::<u32>("num-sources").copied().unwrap_or_default(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(-1);
        }
    };

    info!("Input: {}", config.uri);
    info!("Initial workers: {}", config.initial_workers);
    info!(
        "Admission gate: decoder > {}% and cpu > {}% defers new workers",
        config.decoder_gate_percent, config.cpu_gate_percent
    );

    let runtime = tokio::runtime::Handle::current();
    let main_loop = glib::MainLoop::new(None, false);
    let stop_requested = Arc::new(AtomicBool::new(false));
    let mut controller = {
        let main_loop = main_loop.clone();
        let stop_requested = stop_requested.clone();
        tokio::task::spawn_blocking(move || {
            run_admission_pipeline(config, main_loop, stop_requested, runtime)
        })
    };

    let outcome = tokio::select! {
        result = &mut controller => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping pipeline...");
            stop_requested.store(true, Ordering::SeqCst);
            PipelineCommon::post_quit(&main_loop);
            controller.await
        }
    };

    match outcome {
        Ok(Ok(())) => info!("Pipeline completed"),
        Ok(Err(e)) => {
            error!("Pipeline error: {}", e);
            process::exit(1);
        }
        Err(e) => {
            error!("Control loop aborted: {}", e);
            process::exit(1);
        }
    }
}

/// Defaults, then the optional JSON file, then the positional arguments
fn load_config(
    config_path: Option<&str>,
    input: &str,
    initial_workers: u32,
) -> Result<AdmissionConfig> {
    let mut config = match config_path {
        Some(path) => AdmissionConfig::from_json_file(path)?,
        None => AdmissionConfig::default(),
    };
    config.uri = resolve_location(input)?;
    config.initial_workers = initial_workers;
    config.validate()?;
    Ok(config)
}

/// Build the pipeline, admit the initial workers and run the GLib loop with
/// the admission timer until the loop is quit or a stop is requested
fn run_admission_pipeline(
    config: AdmissionConfig,
    main_loop: glib::MainLoop,
    stop_requested: Arc<AtomicBool>,
    runtime: tokio::runtime::Handle,
) -> Result<()> {
    gstreamer::init()?;

    let context = glib::MainContext::default();
    let _owner = context.acquire()?;

    let batch = BatchPipeline::new(&config.muxer)?;
    let sampler = SystemResourceSampler::new(&config.sampler, runtime);
    let factory = SourceWorkerFactory::new(config.source.clone(), config.restart_delay());
    let scheduler = Rc::new(RefCell::new(AdmissionScheduler::new(
        &config,
        sampler,
        factory,
        batch.host(),
    )));

    scheduler.borrow_mut().admit_initial()?;

    let fatal: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let _bus_watch = {
        let main_loop = main_loop.clone();
        let fatal = fatal.clone();
        PipelineCommon::setup_bus_handler(batch.pipeline(), batch.pipeline_id(), move |event| {
            if let BusEvent::Fatal { source_name, message } = event {
                *fatal.borrow_mut() = Some(Error::pipeline_fatal(source_name, message));
            }
            main_loop.quit();
        })?
    };

    batch.play()?;
    info!("Running...");

    let ticker = {
        let scheduler = scheduler.clone();
        glib::timeout_add_local(config.tick_interval(), move || {
            match scheduler.borrow_mut().tick() {
                TickOutcome::Admitted { id, backend } => {
                    debug!("Tick admitted worker {} ({})", id, backend)
                }
                TickOutcome::AtCapacity { admitted } => {
                    debug!("Tick skipped, {} workers at the configured ceiling", admitted)
                }
                TickOutcome::Deferred { .. } | TickOutcome::Failed { .. } => {}
            }
            glib::ControlFlow::Continue
        })
    };

    if stop_requested.load(Ordering::SeqCst) {
        info!("Stop requested during startup, not entering the main loop");
    } else {
        main_loop.run();
    }
    ticker.remove();

    {
        let mut scheduler = scheduler.borrow_mut();
        let counts = scheduler.registry().backend_counts();
        info!(
            "Returned, stopping playback; {} workers admitted (hardware={} software={})",
            scheduler.state().admitted(),
            counts.hardware,
            counts.software
        );
        scheduler.shutdown();
    }
    batch.shutdown()?;

    let fatal = fatal.borrow_mut().take();
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
