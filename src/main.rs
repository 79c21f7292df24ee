//! Display-output exerciser.
//!
//! Enumerates the connected outputs, allocates raw pixel buffers and paints a
//! shifting solid color on a fixed timer, synchronized to page-flip completion
//! where the backend supports it.

mod backend;
mod paint;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use calloop::signals::{Signal, Signals};
use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::backend::{BackendKind, Presenter};
use crate::paint::PaintLoop;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Presentation backend.
    #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
    backend: BackendKind,
    /// Device node to open instead of the default DRM card or framebuffer.
    #[arg(long)]
    device: Option<PathBuf>,
    /// Paint timer interval in milliseconds.
    #[arg(long, default_value_t = 16)]
    interval_ms: u64,
    /// How long to run, in seconds; 0 runs until interrupted.
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

struct App<'a> {
    backend: &'a mut dyn Presenter,
    paint: PaintLoop,
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let mut backend = backend::create(cli.backend, cli.device.as_deref())?;

    // Tear down whatever did get set up, also on a failed start.
    let result = run(backend.as_mut(), &cli);
    backend.teardown();
    result
}

fn run(backend: &mut dyn Presenter, cli: &Cli) -> anyhow::Result<()> {
    backend.allocate_buffers()?;
    backend.present_initial()?;

    let mut event_loop: EventLoop<App> =
        EventLoop::try_new().context("error creating the event loop")?;
    let handle = event_loop.handle();

    let interval = Duration::from_millis(cli.interval_ms.max(1));
    handle
        .insert_source(Timer::immediate(), move |_, _, app: &mut App| {
            app.paint.tick(app.backend);
            TimeoutAction::ToDuration(interval)
        })
        .unwrap();

    let signal = event_loop.get_signal();
    let signals =
        Signals::new(&[Signal::SIGINT, Signal::SIGTERM]).context("error setting up signals")?;
    handle
        .insert_source(signals, move |event, _, _| {
            info!("received {:?}, shutting down", event.signal());
            signal.stop();
        })
        .unwrap();

    if cli.duration > 0 {
        info!("running for {} seconds", cli.duration);
        let signal = event_loop.get_signal();
        handle
            .insert_source(
                Timer::from_duration(Duration::from_secs(cli.duration)),
                move |_, _, _| {
                    info!("run duration elapsed, shutting down");
                    signal.stop();
                    TimeoutAction::Drop
                },
            )
            .unwrap();
    }

    let mut app = App {
        backend,
        paint: PaintLoop::new(),
    };
    event_loop
        .run(None, &mut app, |_| ())
        .context("error running the event loop")?;

    Ok(())
}
