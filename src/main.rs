use clap::Parser;
use facecap::capture::{FrameSource, SyntheticSource};
use facecap::config::Configuration;
use facecap::error::PipelineError;
use facecap::pipeline::controller::{IngestOutcome, PipelineController};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "facecap", version, about = "Facial marker capture pipeline")]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames to capture (0 runs until interrupted)
    #[arg(short, long)]
    frames: Option<u64>,

    /// Write frame records to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Drop frames instead of waiting when the pipeline is full
    #[arg(long)]
    low_latency: bool,
}

fn init_logging() {
    // Frame records may go to stdout, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    init_logging();
    let args = Args::parse();

    let mut configuration = Configuration::load(args.config.as_deref())?;
    if let Some(frames) = args.frames {
        configuration.capture.frames = frames;
    }
    if let Some(output) = args.output {
        configuration.output.path = Some(output);
    }
    if args.low_latency {
        configuration.frame_store.low_latency = true;
    }
    configuration.validate()?;

    let controller = PipelineController::builder(configuration.clone()).build()?;

    let (drained_tx, drained_rx) = oneshot::channel::<()>();
    let drained_tx = Mutex::new(Some(drained_tx));
    controller.on_drained(move || {
        if let Some(tx) = drained_tx.lock().take() {
            let _ = tx.send(());
        }
    });

    let mut source = SyntheticSource::new(&configuration.capture);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / configuration.capture.fps));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Capturing {} frames at {} fps",
        configuration.capture.frames, configuration.capture.fps
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, draining in-flight frames");
                break;
            }
            _ = ticker.tick() => {
                let outcome = tokio::task::block_in_place(|| match source.next_frame() {
                    Some((image, timestamps)) => controller.ingest(image, timestamps).map(Some),
                    None => Ok(None),
                })?;
                match outcome {
                    None => {
                        info!("End of stream");
                        break;
                    }
                    Some(IngestOutcome::Draining) => break,
                    Some(_) => {}
                }
            }
        }
    }

    controller.set_draining();
    tokio::select! {
        _ = drained_rx => {}
        _ = tokio::signal::ctrl_c() => warn!("Interrupted again, stopping without draining"),
    }

    let metrics = controller.metrics();
    info!(
        "Done: {} frames completed ({:.1} fps), {} dropped",
        metrics.frames_completed,
        metrics.frames_per_second,
        controller.frames_dropped()
    );

    // Joins the herder and worker threads.
    tokio::task::block_in_place(move || drop(controller));
    Ok(())
}
