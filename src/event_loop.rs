//! The reactor: one calloop event loop on the main thread fuses the wayland
//! fd, the PipeWire loop fd, the two signal channels and the timer wheel.
//!
//! Per wake, the dispatch order is fixed: ready sources drain (bus requests,
//! compositor events via the prepare-read dance, PipeWire iteration), then
//! due timers fire, then the compositor queue is flushed until quiet.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use calloop::channel::{Channel, Event};
use calloop::generic::Generic;
use calloop::{EventLoop, Interest, Mode, PostAction};
use pipewire::spa::sys::SPA_ID_INVALID;
use tracing::{debug, error, info, trace};
use wayland_client::{Connection, EventQueue};
use zbus::zvariant::OwnedValue;

use crate::dbus::screencast::{build_restore_value, build_streams_value};
use crate::dbus::{PortalReply, PortalRequest};
use crate::pw::{LoopFd, PwEvent};
use crate::state::State;

/// Fallback wake interval when no timer is pending.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Quantum for the active PipeWire drain inside Start.
const START_DRAIN_QUANTUM: Duration = Duration::from_millis(10);

/// Bound on the Start drain: 1000 quanta, ten seconds of wall clock.
const START_DRAIN_LIMIT: u32 = 1000;

/// Pending one-shot callbacks with deadlines. Callbacks fire on the main
/// loop only; the wheel itself never runs anything from another thread.
pub struct TimerWheel<S> {
    timers: Vec<(Instant, Box<dyn FnOnce(&mut S)>)>,
}

impl<S> TimerWheel<S> {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    pub fn schedule(&mut self, delay: Duration, callback: impl FnOnce(&mut S) + 'static) {
        trace!("adding timer for {delay:?}");
        self.timers.push((Instant::now() + delay, Box::new(callback)));
    }

    /// Duration until the nearest deadline, bounded by the 60 s fallback.
    pub fn nearest_deadline(&self) -> Duration {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
            .min()
            .map_or(IDLE_TIMEOUT, |nearest| nearest.min(IDLE_TIMEOUT))
    }

    /// Remove and return every timer whose deadline passed. Taking them out
    /// first lets the caller run them against the same state that owns the
    /// wheel.
    pub fn take_due(&mut self) -> Vec<Box<dyn FnOnce(&mut S)>> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.timers.len() {
            if self.timers[index].0 <= now {
                due.push(self.timers.swap_remove(index).1);
            } else {
                index += 1;
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<S> Default for TimerWheel<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop-level data: the state plus the wayland event queue, which has to
/// stay outside [`State`] so dispatching can borrow both.
pub struct LoopData {
    pub state: State,
    pub queue: EventQueue<State>,
}

struct ConnectionFd(wayland_backend::client::Backend);

impl AsFd for ConnectionFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.poll_fd()
    }
}

/// Wire every event source into the loop.
pub fn setup_sources(
    event_loop: &EventLoop<'static, LoopData>,
    conn: &Connection,
    pw_loop: pipewire::main_loop::MainLoop,
    portal_requests: Channel<PortalRequest>,
    pw_events: Channel<PwEvent>,
) -> anyhow::Result<()> {
    let handle = event_loop.handle();

    // Compositor fd: prepare-read / read / dispatch-pending, so a wake-up
    // can't be lost between reading and dispatching.
    let wayland_source = Generic::new(ConnectionFd(conn.backend()), Interest::READ, Mode::Level);
    handle
        .insert_source(wayland_source, |readiness, _, data: &mut LoopData| {
            if readiness.error {
                error!("disconnected from the compositor");
                data.state.terminate();
                return Ok(PostAction::Continue);
            }
            if let Err(err) = data.read_compositor_events() {
                error!("compositor connection failed: {err}");
                data.state.terminate();
            }
            Ok(PostAction::Continue)
        })
        .map_err(|err| anyhow::anyhow!("error inserting wayland source: {err}"))?;

    // Media loop fd: iterate to exhaustion without blocking.
    let pw_source = Generic::new(LoopFd(pw_loop), Interest::READ, Mode::Level);
    handle
        .insert_source(pw_source, |readiness, wrapper, data: &mut LoopData| {
            if readiness.error {
                error!("disconnected from the media loop");
                data.state.terminate();
                return Ok(PostAction::Continue);
            }
            wrapper.0.loop_().iterate(Duration::ZERO);
            Ok(PostAction::Continue)
        })
        .map_err(|err| anyhow::anyhow!("error inserting pipewire source: {err}"))?;

    // Bus requests from the zbus executor. The channel closing means the
    // bus connection (and with it the portal) is gone.
    handle
        .insert_source(portal_requests, |event, _, data: &mut LoopData| match event {
            Event::Msg(request) => data.handle_portal_request(request),
            Event::Closed => {
                error!("disconnected from the session bus");
                data.state.terminate();
            }
        })
        .map_err(|err| anyhow::anyhow!("error inserting portal channel: {err}"))?;

    // Stream lifecycle events from PipeWire callbacks.
    handle
        .insert_source(pw_events, |event, _, data: &mut LoopData| {
            if let Event::Msg(event) = event {
                data.state.handle_pw_event(event);
            }
        })
        .map_err(|err| anyhow::anyhow!("error inserting pw event channel: {err}"))?;

    Ok(())
}

/// Run until termination. Each turn: dispatch with the timer wheel's nearest
/// deadline as timeout, fire due timers, flush the compositor until quiet.
pub fn run(event_loop: &mut EventLoop<'static, LoopData>, data: &mut LoopData) -> anyhow::Result<()> {
    info!("entering event loop");

    while !data.state.terminating {
        let timeout = data.state.timers.nearest_deadline();
        if let Err(err) = event_loop.dispatch(Some(timeout), data) {
            error!("event loop dispatch failed: {err}");
            data.state.terminate();
            break;
        }

        let due = data.state.timers.take_due();
        for callback in due {
            callback(&mut data.state);
        }

        if let Err(err) = data.flush_compositor() {
            error!("compositor flush failed: {err}");
            data.state.terminate();
        }
    }

    info!("event loop terminated");
    Ok(())
}

impl LoopData {
    /// Non-blocking read of compositor events, then dispatch.
    pub fn read_compositor_events(&mut self) -> anyhow::Result<()> {
        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(wayland_client::backend::WaylandError::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err).context("error reading compositor events"),
            }
        }
        self.queue
            .dispatch_pending(&mut self.state)
            .context("error dispatching compositor events")?;
        Ok(())
    }

    /// Dispatch pending compositor events and flush until nothing remains.
    pub fn flush_compositor(&mut self) -> anyhow::Result<()> {
        loop {
            let dispatched = self
                .queue
                .dispatch_pending(&mut self.state)
                .context("error dispatching compositor events")?;
            self.state.wayland.conn.flush().context("error flushing compositor")?;
            if dispatched == 0 {
                return Ok(());
            }
        }
    }

    pub fn handle_portal_request(&mut self, request: PortalRequest) {
        match request {
            PortalRequest::CreateSession { request_handle, session_handle, app_id, reply } => {
                let response = self.state.on_create_session(request_handle, session_handle, app_id);
                let _ = reply.send(response);
            }
            PortalRequest::SelectSources { session_handle, options, reply } => {
                let response = self.state.on_select_sources(&session_handle, options);
                let _ = reply.send(response);
            }
            PortalRequest::Start { session_handle, reply } => {
                let response = self.on_start(&session_handle);
                let _ = reply.send(response);
            }
            PortalRequest::CloseSession { session_handle } => {
                self.state.on_close_session(&session_handle);
            }
        }
    }

    /// The Start call: begin the first frame copy, wait for the compositor
    /// to report the frame's formats, stand the stream up, and actively
    /// drain the media loop until it has a node id.
    fn on_start(&mut self, session_handle: &str) -> PortalReply {
        let Some(key) = self.state.session_by_handle(session_handle) else {
            error!("Start: no session found");
            return PortalReply::NoSession;
        };

        {
            let session = self.state.sessions.get_mut(&key).expect("looked up above");
            session.sharing.active = true;
        }

        self.state.start_frame_copy(key);

        let _ = self.state.wayland.conn.flush();
        if let Err(err) = self.queue.roundtrip(&mut self.state) {
            error!("compositor roundtrip failed during Start: {err}");
            self.state.terminate();
            return PortalReply::failed();
        }

        {
            let session = self.state.sessions.get(&key).expect("looked up above");
            if session.sharing.frame_info_dma.fourcc.is_none()
                && session.sharing.frame_info_shm.fourcc.is_none()
            {
                error!("couldn't obtain a frame format from the compositor");
                return PortalReply::failed();
            }
        }

        if self.state.pw.stream(key).is_none() && !self.state.create_session_stream(key) {
            return PortalReply::failed();
        }

        // Active drain: stream readiness is observed via the media loop
        // itself, so blocking on the reactor here would deadlock.
        let mut ready = false;
        for _ in 0..START_DRAIN_LIMIT {
            if self.state.terminating {
                break;
            }
            match self.state.pw.stream(key) {
                Some(stream) if stream.shared.node_id.get() != SPA_ID_INVALID => {
                    ready = true;
                    break;
                }
                Some(_) => {}
                None => break,
            }
            self.state.pw.iterate(START_DRAIN_QUANTUM);
        }

        if !ready {
            error!("stream did not become ready");
            return PortalReply::failed();
        }

        info!("sharing initialized");
        self.state.queue_next_frame(key);

        let session = self.state.sessions.get(&key).expect("looked up above");
        let node_id = self
            .state
            .pw
            .stream(key)
            .map(|stream| stream.shared.node_id.get())
            .unwrap_or(SPA_ID_INVALID);
        let (width, height) = session.target_dimensions();
        let source_type = session.selection.source_type_bits();

        debug!(node_id, width, height, source_type, "Start response");

        let mut results = HashMap::new();
        if let Some(streams) = build_streams_value(node_id, width, height, source_type) {
            results.insert("streams".to_string(), streams);
        }
        results.insert("source_type".to_string(), OwnedValue::from(source_type));

        if session.selection.allow_token {
            if let Some(restore) = build_restore_value(&session.selection, session.cursor_mode) {
                results.insert("restore_data".to_string(), restore);
                results.insert("persist_mode".to_string(), OwnedValue::from(2u32));
                debug!(session = session_handle, "sent restore token");
            }
        }

        PortalReply::ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_wheel_fires_due_only() {
        let mut wheel: TimerWheel<Vec<u32>> = TimerWheel::new();
        wheel.schedule(Duration::ZERO, |log| log.push(1));
        wheel.schedule(Duration::from_secs(30), |log| log.push(2));

        std::thread::sleep(Duration::from_millis(2));

        let mut log = Vec::new();
        for callback in wheel.take_due() {
            callback(&mut log);
        }
        assert_eq!(log, vec![1]);
        assert!(!wheel.is_empty());
    }

    #[test]
    fn test_timer_wheel_nearest_deadline() {
        let mut wheel: TimerWheel<()> = TimerWheel::new();
        assert_eq!(wheel.nearest_deadline(), IDLE_TIMEOUT);

        wheel.schedule(Duration::from_secs(5), |_| {});
        let nearest = wheel.nearest_deadline();
        assert!(nearest <= Duration::from_secs(5));
        assert!(nearest > Duration::from_secs(4));

        wheel.schedule(Duration::from_millis(10), |_| {});
        assert!(wheel.nearest_deadline() <= Duration::from_millis(10));
    }

    #[test]
    fn test_timer_wheel_consumed_exactly_once() {
        let mut wheel: TimerWheel<Vec<u32>> = TimerWheel::new();
        wheel.schedule(Duration::ZERO, |log| log.push(7));
        std::thread::sleep(Duration::from_millis(2));

        let mut log = Vec::new();
        for callback in wheel.take_due() {
            callback(&mut log);
        }
        for callback in wheel.take_due() {
            callback(&mut log);
        }
        assert_eq!(log, vec![7]);
        assert!(wheel.is_empty());
    }
}
