//! Per-client capture sessions and the frame state machine.
//!
//! A session walks selection → negotiation → streaming. Each frame is one
//! compositor capture: request a frame, collect buffer info and damage,
//! copy into a ring buffer (or the dedicated compositor buffer when the
//! renderer has to rotate/crop), then enqueue on the PipeWire stream and
//! schedule the next tick.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};
use wayland_backend::client::ObjectId;
use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_output;
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols_wlr::foreign_toplevel::v1::client::zwlr_foreign_toplevel_handle_v1::ZwlrForeignToplevelHandleV1;
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_frame_v1::{
    self, ZwlrScreencopyFrameV1,
};

use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::Fourcc;

use crate::buffer::{allocate_dmabuf, find_preferred_modifier, import_dmabuf_wl_buffer};
use crate::pw::stream::{format_matches, StreamParams};
use crate::pw::PwEvent;
use crate::render::{logical_dimensions, physical_crop, transform_from_wl, Box2};
use crate::state::State;
use crate::utils::fourcc_from_shm;
use crate::wayland::protocols::hyprland_toplevel_export_v1::hyprland_toplevel_export_frame_v1::{
    self, HyprlandToplevelExportFrameV1,
};

pub type SessionKey = u64;

/// Give up on the current frame after this many consecutive failed copies.
pub const MAX_RETRIES: u32 = 10;

/// Portal cursor modes (bitmask values).
pub const CURSOR_HIDDEN: u32 = 1;
pub const CURSOR_EMBEDDED: u32 = 2;

/// Portal source types (bit positions).
pub const SOURCE_MONITOR: u32 = 1 << 0;
pub const SOURCE_WINDOW: u32 = 1 << 1;
pub const SOURCE_VIRTUAL: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionKind {
    Output,
    Window,
    Geometry,
    Workspace,
    #[default]
    Invalid,
}

/// The user's answer to "what should this session capture".
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub kind: SelectionKind,
    pub output: String,
    pub window: Option<ZwlrForeignToplevelHandleV1>,
    pub window_class: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// The capture has to go through the renderer (rotate and/or crop).
    pub needs_transform: bool,
    /// The user allowed issuing a restore token.
    pub allow_token: bool,
}

impl Selection {
    /// source_type bitmask reported back to the portal frontend.
    pub fn source_type_bits(&self) -> u32 {
        match self.kind {
            SelectionKind::Output => SOURCE_MONITOR,
            SelectionKind::Window => SOURCE_WINDOW,
            SelectionKind::Geometry | SelectionKind::Workspace => SOURCE_VIRTUAL,
            SelectionKind::Invalid => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    None,
    Queued,
    Ready,
    Failed,
    Reneg,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfoShm {
    pub width: u32,
    pub height: u32,
    pub size: u32,
    pub stride: u32,
    pub fourcc: Option<Fourcc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfoDma {
    pub width: u32,
    pub height: u32,
    pub fourcc: Option<Fourcc>,
}

/// The compositor-side scratch buffer used when `needs_transform` is set:
/// the compositor copies the physical frame here, the renderer blits it into
/// the PipeWire buffer.
#[derive(Debug)]
pub struct CompositorBuffer {
    pub dmabuf: Dmabuf,
    pub wl_buffer: WlBuffer,
}

impl Drop for CompositorBuffer {
    fn drop(&mut self) {
        self.wl_buffer.destroy();
    }
}

/// The in-flight compositor frame. Holding at most one of these per session
/// is what makes callback cancellation work: events for anything that isn't
/// the current holder are dropped.
#[derive(Debug)]
pub enum FrameCallback {
    Screencopy(ZwlrScreencopyFrameV1),
    Toplevel(HyprlandToplevelExportFrameV1),
}

impl FrameCallback {
    pub fn id(&self) -> ObjectId {
        match self {
            FrameCallback::Screencopy(frame) => frame.id(),
            FrameCallback::Toplevel(frame) => frame.id(),
        }
    }

    pub fn destroy(&self) {
        match self {
            FrameCallback::Screencopy(frame) => frame.destroy(),
            FrameCallback::Toplevel(frame) => frame.destroy(),
        }
    }
}

/// Per-session streaming state.
#[derive(Debug)]
pub struct SharingData {
    pub active: bool,
    pub status: FrameStatus,
    pub tv_sec: u64,
    pub tv_nsec: u32,
    pub timestamp_ns: u64,
    pub framerate: u32,
    pub transform: wl_output::Transform,
    pub begun_frame: Option<Instant>,
    pub copy_retries: u32,
    pub frame_info_shm: FrameInfoShm,
    pub frame_info_dma: FrameInfoDma,
    pub damage: [Box2; 4],
    pub damage_count: u32,
    pub frame_callback: Option<FrameCallback>,
    pub compositor_buffer: Option<CompositorBuffer>,
}

impl Default for SharingData {
    fn default() -> Self {
        Self {
            active: false,
            status: FrameStatus::None,
            tv_sec: 0,
            tv_nsec: 0,
            timestamp_ns: 0,
            framerate: 60,
            transform: wl_output::Transform::Normal,
            begun_frame: None,
            copy_retries: 0,
            frame_info_shm: FrameInfoShm::default(),
            frame_info_dma: FrameInfoDma::default(),
            damage: [Box2::new(0, 0, 0, 0); 4],
            damage_count: 0,
            frame_callback: None,
            compositor_buffer: None,
        }
    }
}

impl SharingData {
    fn reset_frame(&mut self) {
        if let Some(callback) = self.frame_callback.take() {
            callback.destroy();
        }
        self.status = FrameStatus::None;
    }
}

/// One client's capture contract, created by CreateSession and owned by the
/// portal façade until the bus releases it.
#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub app_id: String,
    pub request_handle: String,
    pub session_handle: String,
    pub cursor_mode: u32,
    pub persist_mode: u32,
    pub selection: Selection,
    pub sharing: SharingData,
}

impl Session {
    pub fn new(key: SessionKey, app_id: String, request: String, session: String) -> Self {
        Self {
            key,
            app_id,
            request_handle: request,
            session_handle: session,
            cursor_mode: CURSOR_HIDDEN,
            persist_mode: 0,
            selection: Selection::default(),
            sharing: SharingData::default(),
        }
    }

    /// Stream dimensions: the logical size when the renderer transforms, the
    /// raw frame size otherwise.
    pub fn target_dimensions(&self) -> (u32, u32) {
        let dma = &self.sharing.frame_info_dma;
        if self.selection.needs_transform {
            if self.selection.kind == SelectionKind::Geometry {
                return (self.selection.w.max(0) as u32, self.selection.h.max(0) as u32);
            }
            let transform = transform_from_wl(self.sharing.transform);
            let (w, h) = logical_dimensions(transform, dma.width as i32, dma.height as i32);
            return (w as u32, h as u32);
        }
        if dma.width > 0 {
            (dma.width, dma.height)
        } else {
            (self.sharing.frame_info_shm.width, self.sharing.frame_info_shm.height)
        }
    }
}

/// Tagged compositor frame event; both capture protocols funnel into this.
#[derive(Debug)]
pub enum FrameEvent {
    Buffer { fourcc: Option<Fourcc>, width: u32, height: u32, stride: u32 },
    LinuxDmabuf { fourcc: Option<Fourcc>, width: u32, height: u32 },
    Damage { x: i32, y: i32, w: i32, h: i32 },
    BufferDone,
    Ready { tv_sec: u64, tv_nsec: u32 },
    Failed,
}

/// Record a damage rectangle, collapsing to a whole-frame rectangle once the
/// bound is exceeded.
pub fn push_damage(sharing: &mut SharingData, rect: Box2) {
    if sharing.damage_count > 3 {
        sharing.damage[0] = Box2::new(
            0,
            0,
            sharing.frame_info_dma.width as i32,
            sharing.frame_info_dma.height as i32,
        );
        return;
    }
    sharing.damage[sharing.damage_count as usize] = rect;
    sharing.damage_count += 1;
}

/// Delay until the next frame copy: the remainder of the frame interval
/// minus a 1 ms safety margin, clamped to [6 ms, 1000 ms].
pub fn next_frame_delay(framerate: u32, elapsed: Duration) -> Duration {
    let interval_ms = 1000.0 / framerate.max(1) as f64;
    let delay = interval_ms - elapsed.as_secs_f64() * 1000.0 - 1.0;
    Duration::from_micros((delay.clamp(6.0, 1000.0) * 1000.0) as u64)
}

impl State {
    /// Begin one frame copy: ask the compositor for a capture of the
    /// session's selection and arm the frame callbacks.
    pub fn start_frame_copy(&mut self, key: SessionKey) {
        let qh = self.wayland.qh.clone();

        let Some(session) = self.sessions.get(&key) else {
            return;
        };
        if !session.sharing.active {
            trace!("start_frame_copy: inactive session, not copying");
            return;
        }
        if session.sharing.frame_callback.is_some() {
            error!(
                kind = ?session.selection.kind,
                "tried scheduling a frame on an already scheduled callback"
            );
            return;
        }

        let selection = &session.selection;
        let output = self.wayland.outputs.by_name(&selection.output);
        let overlay_cursor = i32::from(session.cursor_mode & CURSOR_EMBEDDED != 0);

        let (callback, transform) = match selection.kind {
            SelectionKind::Output | SelectionKind::Geometry => {
                let Some(output) = output else {
                    error!(output = %selection.output, "selected output not found");
                    return;
                };
                let Some(screencopy) = &self.wayland.screencopy else {
                    error!("no screencopy protocol");
                    return;
                };
                let frame = if selection.kind == SelectionKind::Geometry
                    && !selection.needs_transform
                {
                    screencopy.capture_output_region(
                        overlay_cursor,
                        &output.output,
                        selection.x,
                        selection.y,
                        selection.w,
                        selection.h,
                        &qh,
                        key,
                    )
                } else {
                    screencopy.capture_output(overlay_cursor, &output.output, &qh, key)
                };
                debug!(output = %output.name, transform = ?output.transform, "frame copy for output");
                (FrameCallback::Screencopy(frame), output.transform)
            }
            SelectionKind::Window => {
                let Some(window) = &selection.window else {
                    error!("selected invalid window");
                    return;
                };
                let Some(export) = &self.wayland.toplevel_export else {
                    error!("no toplevel export protocol");
                    return;
                };
                let frame =
                    export.capture_toplevel_with_wlr_toplevel_handle(overlay_cursor, window, &qh, key);
                debug!("frame copy for window");
                (FrameCallback::Toplevel(frame), wl_output::Transform::Normal)
            }
            other => {
                error!(?other, "unsupported selection in frame copy");
                return;
            }
        };

        let session = self.sessions.get_mut(&key).expect("session checked above");
        session.sharing.transform = transform;
        session.sharing.frame_callback = Some(callback);
        session.sharing.status = FrameStatus::Queued;
        session.sharing.damage_count = 0;
    }

    /// Entry point for compositor frame events. Events whose frame object is
    /// no longer the session's holder are stale and ignored.
    pub fn on_frame_event(&mut self, key: SessionKey, frame: ObjectId, event: FrameEvent) {
        {
            let Some(session) = self.sessions.get_mut(&key) else {
                return;
            };
            match &session.sharing.frame_callback {
                Some(callback) if callback.id() == frame => {}
                _ => return,
            }

            match event {
                FrameEvent::Buffer { fourcc, width, height, stride } => {
                    let info = &mut session.sharing.frame_info_shm;
                    info.width = width;
                    info.height = height;
                    info.stride = stride;
                    info.size = stride * height;
                    info.fourcc = fourcc;
                    return;
                }
                FrameEvent::LinuxDmabuf { fourcc, width, height } => {
                    let info = &mut session.sharing.frame_info_dma;
                    info.width = width;
                    info.height = height;
                    info.fourcc = fourcc;
                    return;
                }
                FrameEvent::Damage { x, y, w, h } => {
                    trace!("frame damage: {x} {y} {w} {h}");
                    push_damage(&mut session.sharing, Box2::new(x, y, w, h));
                    return;
                }
                FrameEvent::Failed => {
                    debug!("frame copy failed");
                    session.sharing.reset_frame();
                    session.sharing.status = FrameStatus::Failed;
                    self.queue_next_frame(key);
                    return;
                }
                FrameEvent::BufferDone => {}
                FrameEvent::Ready { tv_sec, tv_nsec } => {
                    self.on_frame_ready(key, tv_sec, tv_nsec);
                    return;
                }
            }
        }

        self.on_buffer_done(key);
    }

    /// All buffer parameters for this frame are known; pick (or create) the
    /// destination and request the copy.
    fn on_buffer_done(&mut self, key: SessionKey) {
        // Lazy stream construction: the first frame's info seeds the format
        // negotiation, the copy restarts once the stream reaches STREAMING.
        if self.pw.stream(key).is_none() {
            let created = self.create_session_stream(key);
            if let Some(session) = self.sessions.get_mut(&key) {
                session.sharing.reset_frame();
            }
            if !created {
                trace!("buffer_done without stream parameters, dropping frame");
            }
            return;
        }

        if self.ensure_compositor_buffer(key).is_err() {
            if let Some(session) = self.sessions.get_mut(&key) {
                session.sharing.reset_frame();
            }
            return;
        }

        // Renegotiate when the consumer's format no longer matches what the
        // compositor is handing us. Transforming sessions are exempt: their
        // stream geometry is the logical size, not the frame size.
        let mismatch = {
            let Some(session) = self.sessions.get(&key) else { return };
            let Some(stream) = self.pw.stream(key) else { return };
            let sharing = &session.sharing;
            if session.selection.needs_transform || !stream.shared.have_format.get() {
                false
            } else {
                let fourcc = if stream.shared.is_dma.get() {
                    sharing.frame_info_dma.fourcc
                } else {
                    sharing.frame_info_shm.fourcc
                };
                let info = stream.shared.video_info.borrow();
                match fourcc {
                    Some(fourcc) => {
                        !format_matches(info.format(), fourcc)
                            || info.size().width != sharing.frame_info_dma.width
                            || info.size().height != sharing.frame_info_dma.height
                    }
                    None => false,
                }
            }
        };
        if mismatch {
            info!("incompatible formats, renegotiating stream");
            if let Some(session) = self.sessions.get_mut(&key) {
                session.sharing.status = FrameStatus::Reneg;
                if let Some(callback) = session.sharing.frame_callback.take() {
                    callback.destroy();
                }
            }
            self.refresh_stream_params(key);
            self.queue_next_frame(key);
            if let Some(session) = self.sessions.get_mut(&key) {
                session.sharing.status = FrameStatus::None;
            }
            return;
        }

        // Grab a writable ring buffer.
        let current = {
            let has_current = self
                .pw
                .stream(key)
                .is_some_and(|stream| stream.shared.current.get().is_some());
            if !has_current {
                self.pw.dequeue(key);
            }
            self.pw.stream(key).and_then(|stream| stream.shared.current.get())
        };

        let Some(current) = current else {
            info!("out of buffers");
            let retry = {
                let Some(session) = self.sessions.get_mut(&key) else { return };
                session.sharing.reset_frame();
                if session.sharing.copy_retries < MAX_RETRIES {
                    session.sharing.copy_retries += 1;
                    info!(
                        "retrying frame copy ({}/{})",
                        session.sharing.copy_retries, MAX_RETRIES
                    );
                    true
                } else {
                    false
                }
            };
            if retry {
                self.pw.update_stream_params(key);
                self.queue_next_frame(key);
            }
            return;
        };

        // Ask the compositor to copy into the destination buffer.
        let Some(session) = self.sessions.get(&key) else { return };
        let Some(stream) = self.pw.stream(key) else { return };

        let target: WlBuffer = if session.selection.needs_transform {
            let Some(compositor_buffer) = &session.sharing.compositor_buffer else {
                return;
            };
            compositor_buffer.wl_buffer.clone()
        } else {
            let buffers = stream.shared.buffers.borrow();
            let Some(buffer) = buffers.get(&current) else {
                warn!("dequeued buffer vanished");
                return;
            };
            buffer.wl_buffer.clone()
        };

        match &session.sharing.frame_callback {
            Some(FrameCallback::Screencopy(frame)) => frame.copy_with_damage(&target),
            Some(FrameCallback::Toplevel(frame)) => frame.copy(&target, 0),
            None => return,
        }

        if let Some(session) = self.sessions.get_mut(&key) {
            session.sharing.copy_retries = 0;
        }
        trace!("frame copy requested");
    }

    /// The compositor finished the copy: transform if needed, then hand the
    /// frame to the consumer and schedule the next one.
    fn on_frame_ready(&mut self, key: SessionKey, tv_sec: u64, tv_nsec: u32) {
        {
            let Some(session) = self.sessions.get_mut(&key) else { return };
            let sharing = &mut session.sharing;
            sharing.status = FrameStatus::Ready;
            sharing.tv_sec = tv_sec;
            sharing.tv_nsec = tv_nsec;
            sharing.timestamp_ns = tv_sec * 1_000_000_000 + tv_nsec as u64;
            trace!(
                "frame timestamp sec: {} nsec: {} combined: {}ns",
                sharing.tv_sec,
                sharing.tv_nsec,
                sharing.timestamp_ns
            );
        }

        let needs_transform = self
            .sessions
            .get(&key)
            .map(|session| session.selection.needs_transform)
            .unwrap_or(false);

        if needs_transform {
            if let Err(err) = self.render_transformed_frame(key) {
                error!("transform render failed: {err}");
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.sharing.reset_frame();
                }
                self.timers.schedule(Duration::from_millis(100), move |state| {
                    state.start_frame_copy(key);
                });
                return;
            }
        }

        let State { pw, sessions, .. } = self;
        if let Some(session) = sessions.get(&key) {
            pw.enqueue(key, &session.sharing, session.selection.needs_transform);
        }
        let has_stream = pw.streams.contains_key(&key);

        if has_stream {
            self.queue_next_frame(key);
        }
        if let Some(session) = self.sessions.get_mut(&key) {
            if let Some(callback) = session.sharing.frame_callback.take() {
                callback.destroy();
            }
        }
    }

    /// Blit the dedicated compositor buffer into the current ring buffer,
    /// applying the output transform and (for region selections) the crop
    /// box in physical coordinates.
    fn render_transformed_frame(&mut self, key: SessionKey) -> Result<(), String> {
        let Some(session) = self.sessions.get(&key) else {
            return Err("session gone".into());
        };
        let Some(stream) = self.pw.stream(key) else {
            return Err("stream gone".into());
        };
        let Some(current) = stream.shared.current.get() else {
            return Err("no dequeued buffer".into());
        };

        let target = stream
            .shared
            .buffers
            .borrow()
            .get(&current)
            .and_then(|buffer| buffer.dmabuf.clone())
            .ok_or_else(|| "target buffer is not a dmabuf".to_string())?;
        let source = session
            .sharing
            .compositor_buffer
            .as_ref()
            .map(|buffer| buffer.dmabuf.clone())
            .ok_or_else(|| "no compositor buffer".to_string())?;

        let transform = transform_from_wl(session.sharing.transform);
        let crop = (session.selection.kind == SelectionKind::Geometry).then(|| {
            physical_crop(
                transform,
                Box2::new(
                    session.selection.x,
                    session.selection.y,
                    session.selection.w,
                    session.selection.h,
                ),
                session.sharing.frame_info_dma.width as i32,
                session.sharing.frame_info_dma.height as i32,
            )
        });

        let renderer = self.renderer.as_mut().ok_or_else(|| "no renderer".to_string())?;
        renderer
            .render(&target, &source, transform, crop)
            .map_err(|err| err.to_string())
    }

    /// Pace the next frame from the configured framerate and how long this
    /// frame took.
    pub fn queue_next_frame(&mut self, key: SessionKey) {
        if let Some(stream) = self.pw.stream(key) {
            if !stream.shared.streaming.get() {
                return;
            }
        }

        let Some(session) = self.sessions.get_mut(&key) else { return };
        let elapsed = session
            .sharing
            .begun_frame
            .map(|instant| instant.elapsed())
            .unwrap_or_default();
        let delay = next_frame_delay(session.sharing.framerate, elapsed);
        session.sharing.begun_frame = Some(Instant::now());

        trace!(
            framerate = session.sharing.framerate,
            ?elapsed,
            ?delay,
            "queueing next frame"
        );
        self.timers.schedule(delay, move |state| state.start_frame_copy(key));
    }

    /// Create the PipeWire stream from the first frame's parameters.
    /// Returns false while the parameters are still unknown.
    pub(crate) fn create_session_stream(&mut self, key: SessionKey) -> bool {
        let Some(session) = self.sessions.get(&key) else { return false };

        if session.sharing.frame_info_dma.fourcc.is_none()
            && session.sharing.frame_info_shm.fourcc.is_none()
        {
            return false;
        }

        let params = self.stream_params_for(session);
        let gbm = self.wayland.gbm.clone();
        let qh = self.wayland.qh.clone();
        let linux_dmabuf = self.wayland.linux_dmabuf.clone();
        let shm = self.wayland.shm.clone();

        match self.pw.create_stream(key, params, gbm, qh, linux_dmabuf, shm) {
            Ok(node_id) => {
                trace!(node_id, "stream created");
                true
            }
            Err(err) => {
                error!("failed to create stream: {err}");
                self.terminate();
                false
            }
        }
    }

    fn stream_params_for(&self, session: &Session) -> StreamParams {
        let (target_width, target_height) = session.target_dimensions();
        let modifiers = match (session.sharing.frame_info_dma.fourcc, &self.wayland.gbm) {
            (Some(fourcc), Some(_)) => self.wayland.modifiers_for(fourcc),
            _ => Vec::new(),
        };
        StreamParams {
            dma: session.sharing.frame_info_dma,
            shm: session.sharing.frame_info_shm,
            framerate: session.sharing.framerate,
            target_width,
            target_height,
            modifiers,
        }
    }

    /// Re-seed the stream's negotiation snapshot from current session state
    /// and push the updated parameter set.
    fn refresh_stream_params(&mut self, key: SessionKey) {
        let Some(session) = self.sessions.get(&key) else { return };
        let params = self.stream_params_for(session);
        if let Some(stream) = self.pw.stream(key) {
            *stream.shared.params.borrow_mut() = params;
        }
        self.pw.update_stream_params(key);
    }

    /// Allocate the dedicated compositor-side buffer for transforming
    /// sessions, sized to the reported native DMA geometry.
    fn ensure_compositor_buffer(&mut self, key: SessionKey) -> Result<(), ()> {
        let Some(session) = self.sessions.get(&key) else { return Err(()) };
        if !session.selection.needs_transform || session.sharing.compositor_buffer.is_some() {
            return Ok(());
        }

        let dma = session.sharing.frame_info_dma;
        let Some(fourcc) = dma.fourcc else {
            error!("transforming session without dma format");
            return Err(());
        };
        let Some(gbm) = &self.wayland.gbm else {
            error!("transforming session without GPU device");
            return Err(());
        };
        let Some(linux_dmabuf) = &self.wayland.linux_dmabuf else {
            error!("transforming session without linux-dmabuf");
            return Err(());
        };

        let modifiers = self.wayland.modifiers_for(fourcc);
        let (modifier, _planes) =
            find_preferred_modifier(gbm, dma.width, dma.height, fourcc, &modifiers).map_err(
                |err| {
                    error!("compositor buffer allocation failed: {err}");
                },
            )?;
        let dmabuf = allocate_dmabuf(gbm, dma.width, dma.height, fourcc, modifier)
            .map_err(|err| {
                error!("compositor buffer allocation failed: {err}");
            })?;
        let wl_buffer = import_dmabuf_wl_buffer(&self.wayland.qh, linux_dmabuf, &dmabuf);

        debug!(width = dma.width, height = dma.height, "created dedicated compositor buffer");
        let session = self.sessions.get_mut(&key).expect("session checked above");
        session.sharing.compositor_buffer = Some(CompositorBuffer { dmabuf, wl_buffer });
        Ok(())
    }

    /// React to stream lifecycle notifications from the PipeWire loop.
    pub fn handle_pw_event(&mut self, event: PwEvent) {
        match event {
            PwEvent::Streaming { session: key } => {
                debug!(key, "stream is active");
                let restart = match self.sessions.get_mut(&key) {
                    Some(session) => {
                        if session.sharing.status != FrameStatus::None {
                            session.sharing.reset_frame();
                        }
                        true
                    }
                    None => false,
                };
                if restart {
                    self.start_frame_copy(key);
                }
            }
            PwEvent::Paused { session: key } | PwEvent::Error { session: key } => {
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.sharing.reset_frame();
                }
            }
            PwEvent::Unconnected { session: key } => {
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.sharing.reset_frame();
                    session.sharing.active = false;
                }
                self.pw.destroy_stream(key);
            }
            PwEvent::FramerateChanged { session: key, framerate } => {
                if let Some(session) = self.sessions.get_mut(&key) {
                    debug!(key, framerate, "consumer negotiated framerate");
                    session.sharing.framerate = framerate;
                }
            }
            PwEvent::BuffersAvailable { session: key } => {
                let resume = match self.sessions.get_mut(&key) {
                    Some(session)
                        if session.sharing.active
                            && session.sharing.status == FrameStatus::None
                            && session.sharing.frame_callback.is_none() =>
                    {
                        session.sharing.copy_retries = 0;
                        true
                    }
                    _ => false,
                };
                if resume {
                    debug!(key, "buffers available again, resuming");
                    self.start_frame_copy(key);
                }
            }
            PwEvent::FatalError => {
                error!("media loop disconnected");
                self.terminate();
            }
        }
    }

    /// Destroy a session: cancel the in-flight frame, tear down the stream
    /// and the dedicated buffer, release the toplevel activation.
    pub fn teardown_session(&mut self, key: SessionKey) {
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };
        debug!(session = %session.session_handle, "session destroyed");

        session.sharing.reset_frame();
        if session.sharing.active {
            self.pw.destroy_stream(key);
            session.sharing.active = false;
        }
        session.sharing.compositor_buffer = None;

        self.wayland.toplevels.deactivate();
    }
}

impl Dispatch<ZwlrScreencopyFrameV1, SessionKey> for State {
    fn event(
        state: &mut Self,
        frame: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        key: &SessionKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            zwlr_screencopy_frame_v1::Event::Buffer { format, width, height, stride } => {
                FrameEvent::Buffer {
                    fourcc: shm_format_fourcc(format),
                    width,
                    height,
                    stride,
                }
            }
            zwlr_screencopy_frame_v1::Event::LinuxDmabuf { format, width, height } => {
                FrameEvent::LinuxDmabuf {
                    fourcc: Fourcc::try_from(format).ok(),
                    width,
                    height,
                }
            }
            zwlr_screencopy_frame_v1::Event::Damage { x, y, width, height } => FrameEvent::Damage {
                x: x as i32,
                y: y as i32,
                w: width as i32,
                h: height as i32,
            },
            zwlr_screencopy_frame_v1::Event::BufferDone => FrameEvent::BufferDone,
            zwlr_screencopy_frame_v1::Event::Ready { tv_sec_hi, tv_sec_lo, tv_nsec } => {
                FrameEvent::Ready {
                    tv_sec: ((tv_sec_hi as u64) << 32) | tv_sec_lo as u64,
                    tv_nsec,
                }
            }
            zwlr_screencopy_frame_v1::Event::Failed => FrameEvent::Failed,
            _ => return,
        };
        state.on_frame_event(*key, frame.id(), event);
    }
}

impl Dispatch<HyprlandToplevelExportFrameV1, SessionKey> for State {
    fn event(
        state: &mut Self,
        frame: &HyprlandToplevelExportFrameV1,
        event: hyprland_toplevel_export_frame_v1::Event,
        key: &SessionKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            hyprland_toplevel_export_frame_v1::Event::Buffer { format, width, height, stride } => {
                FrameEvent::Buffer {
                    fourcc: shm_format_fourcc(format),
                    width,
                    height,
                    stride,
                }
            }
            hyprland_toplevel_export_frame_v1::Event::LinuxDmabuf { format, width, height } => {
                FrameEvent::LinuxDmabuf {
                    fourcc: Fourcc::try_from(format).ok(),
                    width,
                    height,
                }
            }
            hyprland_toplevel_export_frame_v1::Event::Damage { x, y, width, height } => {
                FrameEvent::Damage {
                    x: x as i32,
                    y: y as i32,
                    w: width as i32,
                    h: height as i32,
                }
            }
            hyprland_toplevel_export_frame_v1::Event::BufferDone => FrameEvent::BufferDone,
            hyprland_toplevel_export_frame_v1::Event::Ready { tv_sec_hi, tv_sec_lo, tv_nsec } => {
                FrameEvent::Ready {
                    tv_sec: ((tv_sec_hi as u64) << 32) | tv_sec_lo as u64,
                    tv_nsec,
                }
            }
            hyprland_toplevel_export_frame_v1::Event::Failed => FrameEvent::Failed,
            _ => return,
        };
        state.on_frame_event(*key, frame.id(), event);
    }
}

fn shm_format_fourcc(format: WEnum<wayland_client::protocol::wl_shm::Format>) -> Option<Fourcc> {
    match format {
        WEnum::Value(format) => fourcc_from_shm(format),
        WEnum::Unknown(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_frame_delay_clamps() {
        // 60 fps, instant frame: ~15.6 ms.
        let delay = next_frame_delay(60, Duration::ZERO);
        assert!(delay >= Duration::from_millis(15) && delay <= Duration::from_millis(16));

        // Slow frame eats the whole interval: floor at 6 ms.
        assert_eq!(
            next_frame_delay(60, Duration::from_millis(500)),
            Duration::from_millis(6)
        );

        // 1 fps with no elapsed time: the full second minus the safety margin.
        assert_eq!(
            next_frame_delay(1, Duration::ZERO),
            Duration::from_millis(999)
        );
        assert_eq!(next_frame_delay(0, Duration::ZERO), Duration::from_millis(999));

        // Absurd framerates floor at 6 ms.
        assert_eq!(
            next_frame_delay(100_000, Duration::ZERO),
            Duration::from_millis(6)
        );
    }

    #[test]
    fn test_damage_overflow_collapses_to_full_frame() {
        let mut sharing = SharingData {
            frame_info_dma: FrameInfoDma {
                width: 1920,
                height: 1080,
                fourcc: Some(Fourcc::Xrgb8888),
            },
            ..Default::default()
        };

        for i in 0..4 {
            push_damage(&mut sharing, Box2::new(i, i, 1, 1));
        }
        assert_eq!(sharing.damage_count, 4);
        assert_eq!(sharing.damage[3], Box2::new(3, 3, 1, 1));

        // The fifth rectangle overflows: slot 0 becomes the whole frame.
        push_damage(&mut sharing, Box2::new(9, 9, 1, 1));
        assert_eq!(sharing.damage_count, 4);
        assert_eq!(sharing.damage[0], Box2::new(0, 0, 1920, 1080));
    }

    #[test]
    fn test_source_type_bits() {
        let mut selection = Selection::default();
        assert_eq!(selection.source_type_bits(), 0);
        selection.kind = SelectionKind::Output;
        assert_eq!(selection.source_type_bits(), SOURCE_MONITOR);
        selection.kind = SelectionKind::Window;
        assert_eq!(selection.source_type_bits(), SOURCE_WINDOW);
        selection.kind = SelectionKind::Geometry;
        assert_eq!(selection.source_type_bits(), SOURCE_VIRTUAL);
        selection.kind = SelectionKind::Workspace;
        assert_eq!(selection.source_type_bits(), SOURCE_VIRTUAL);
    }

    #[test]
    fn test_target_dimensions_geometry_transform() {
        let mut session = Session::new(1, "app".into(), "/req".into(), "/sess".into());
        session.selection.kind = SelectionKind::Geometry;
        session.selection.needs_transform = true;
        session.selection.w = 640;
        session.selection.h = 480;
        session.sharing.frame_info_dma =
            FrameInfoDma { width: 1920, height: 1080, fourcc: Some(Fourcc::Xrgb8888) };
        assert_eq!(session.target_dimensions(), (640, 480));

        // Full-output transform on a rotated output streams the logical size.
        session.selection.kind = SelectionKind::Output;
        session.sharing.transform = wl_output::Transform::_90;
        assert_eq!(session.target_dimensions(), (1080, 1920));

        // No transform: raw frame size.
        session.selection.needs_transform = false;
        assert_eq!(session.target_dimensions(), (1920, 1080));
    }
}
