//! hyprcast - ScreenCast portal backend daemon.
//!
//! Startup order matters: acquire the bus name and the compositor
//! connection first (both fatal), stand the PipeWire loop up, enumerate
//! globals with two roundtrips (registry, then dmabuf feedback and output
//! metadata), then enter the reactor.

use anyhow::Context as _;
use calloop::channel;
use calloop::EventLoop;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hyprcast::event_loop::{self, LoopData};
use hyprcast::pw::Pipewire;
use hyprcast::state::State;
use hyprcast::wayland::{self, WaylandState};
use hyprcast::{dbus, Config};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        tracing::error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = Config::load();

    match std::env::var("XDG_CURRENT_DESKTOP") {
        Ok(desktop) => {
            info!("XDG_CURRENT_DESKTOP set to {desktop}");
            if desktop != "Hyprland" {
                warn!("not running on Hyprland, some features might be unavailable");
            }
        }
        Err(_) => warn!("XDG_CURRENT_DESKTOP unset, running on an unknown desktop"),
    }

    // Bus first: failing to acquire the portal name means another backend
    // owns the desktop, nothing to do here.
    let (portal_tx, portal_rx) = channel::channel();
    let _bus = dbus::start(portal_tx).context("couldn't create the dbus connection")?;

    let (conn, globals, queue) = wayland::connect()?;
    let qh = queue.handle();

    let (pw_tx, pw_rx) = channel::channel();
    let pw = Pipewire::new(pw_tx).context("couldn't stand up the PipeWire loop")?;
    let pw_loop = pw.main_loop.clone();

    let wayland_state = WaylandState::new(conn.clone(), &globals, qh);
    let state = State::new(config, wayland_state, pw);

    let mut event_loop: EventLoop<'static, LoopData> =
        EventLoop::try_new().context("couldn't create the event loop")?;
    event_loop::setup_sources(&event_loop, &conn, pw_loop, portal_rx, pw_rx)?;

    let mut data = LoopData { state, queue };

    // First roundtrip finishes global binding, second collects output
    // metadata and the dmabuf feedback exchange.
    info!("gathering exported interfaces");
    data.queue
        .roundtrip(&mut data.state)
        .context("initial compositor roundtrip failed")?;
    data.queue
        .roundtrip(&mut data.state)
        .context("compositor roundtrip failed")?;

    if data.state.wayland.screencopy.is_none() {
        warn!("screencopy not available: compositor doesn't support zwlr_screencopy_v1");
    }
    if data.state.wayland.toplevel_export.is_none() {
        warn!("window sharing not available: compositor doesn't support toplevel export");
    } else if !data.state.wayland.toplevels.has_global() {
        warn!("window sharing not available: compositor doesn't export its toplevel list");
    } else {
        info!("registered for toplevel export");
    }

    if !data.state.config.general.toplevel_dynamic_bind {
        data.state.activate_toplevels();
    }

    data.state.init_renderer();

    event_loop::run(&mut event_loop, &mut data)
}
