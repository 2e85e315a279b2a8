//! The root state aggregate. Everything the portal mutates lives here and is
//! only ever touched from the main loop thread.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dbus::{PortalReply, SelectSourcesOptions};
use crate::event_loop::TimerWheel;
use crate::picker;
use crate::pw::Pipewire;
use crate::render::TransformRenderer;
use crate::session::{Session, SessionKey, Selection, SelectionKind};
use crate::wayland::WaylandState;

pub struct State {
    pub config: Config,
    pub terminating: bool,
    pub timers: TimerWheel<State>,
    pub wayland: WaylandState,
    pub pw: Pipewire,
    pub sessions: HashMap<SessionKey, Session>,
    pub renderer: Option<TransformRenderer>,
    next_session_key: SessionKey,
}

impl State {
    pub fn new(config: Config, wayland: WaylandState, pw: Pipewire) -> Self {
        Self {
            config,
            terminating: false,
            timers: TimerWheel::new(),
            wayland,
            pw,
            sessions: HashMap::new(),
            renderer: None,
            next_session_key: 1,
        }
    }

    /// Initiate shutdown. A watchdog subprocess bounds the remaining
    /// lifetime to 5 seconds no matter what the libraries do on the way
    /// down. PIDs don't wrap around within that window.
    pub fn terminate(&mut self) {
        if self.terminating {
            return;
        }
        self.terminating = true;
        warn!("terminating");

        let pid = std::process::id();
        let result = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("sleep 5 && kill -9 {pid}"))
            .spawn();
        if let Err(err) = result {
            warn!("couldn't spawn shutdown watchdog: {err}");
        }
    }

    /// Create the GLES renderer once the GBM device is known. Without it,
    /// transforming selections fall back to untransformed streams.
    pub fn init_renderer(&mut self) {
        let Some(gbm) = &self.wayland.gbm else {
            return;
        };
        match TransformRenderer::new(gbm) {
            Ok(renderer) => {
                info!("GLES renderer initialized");
                self.renderer = Some(renderer);
            }
            Err(err) => warn!("renderer unavailable: {err}"),
        }
    }

    /// Take a standing toplevel activation (used for non-dynamic binding and
    /// by each session).
    pub fn activate_toplevels(&mut self) {
        let registry = self.wayland.registry.clone();
        let qh = self.wayland.qh.clone();
        self.wayland.toplevels.activate(&registry, &qh);
    }

    pub fn session_by_handle(&self, handle: &str) -> Option<SessionKey> {
        self.sessions
            .values()
            .find(|session| session.session_handle == handle)
            .map(|session| session.key)
    }

    pub fn on_create_session(
        &mut self,
        request_handle: String,
        session_handle: String,
        app_id: String,
    ) -> PortalReply {
        info!("new session:");
        info!(" | {request_handle}");
        info!(" | {session_handle}");
        info!(" | appid: {app_id}");

        self.activate_toplevels();

        let key = self.next_session_key;
        self.next_session_key += 1;
        self.sessions
            .insert(key, Session::new(key, app_id, request_handle, session_handle));

        PortalReply::ok(HashMap::new())
    }

    pub fn on_select_sources(
        &mut self,
        session_handle: &str,
        options: SelectSourcesOptions,
    ) -> PortalReply {
        let Some(key) = self.session_by_handle(session_handle) else {
            error!("SelectSources: no session found");
            return PortalReply::NoSession;
        };

        {
            let session = self.sessions.get_mut(&key).expect("looked up above");
            if let Some(cursor_mode) = options.cursor_mode {
                session.cursor_mode = cursor_mode;
            }
            if let Some(persist_mode) = options.persist_mode {
                session.persist_mode = persist_mode;
            }
        }

        let restored = options.restore.as_ref().and_then(|restore| {
            picker::selection_from_restore(restore, &self.wayland.outputs, &self.wayland.toplevels)
                .map(|selection| (selection, restore.with_cursor))
        });

        let mut selection = match restored {
            Some((selection, with_cursor)) => {
                info!("restore data valid, not prompting");
                let session = self.sessions.get_mut(&key).expect("looked up above");
                session.cursor_mode = with_cursor;
                selection
            }
            None => {
                if options.restore.is_some() {
                    info!("restore data invalid / missing target, prompting");
                }
                picker::prompt(
                    &self.config,
                    &self.wayland.toplevels,
                    self.wayland.toplevel_export.is_some(),
                )
            }
        };

        debug!(kind = ?selection.kind, "selection returned");

        selection = self.validate_selection(selection);

        if matches!(selection.kind, SelectionKind::Output | SelectionKind::Geometry) {
            if let Some(output) = self.wayland.outputs.by_name(&selection.output) {
                let max_fps = self.config.screencopy.max_fps;
                let framerate = if max_fps > 0 {
                    output.refresh.clamp(1, max_fps)
                } else {
                    output.refresh
                };
                let session = self.sessions.get_mut(&key).expect("looked up above");
                session.sharing.framerate = framerate;
            }
        }

        let invalid = selection.kind == SelectionKind::Invalid;
        let session = self.sessions.get_mut(&key).expect("looked up above");
        session.selection = selection;

        if invalid {
            PortalReply::failed()
        } else {
            PortalReply::ok(HashMap::new())
        }
    }

    /// Reject selections the compositor can't serve.
    fn validate_selection(&self, mut selection: Selection) -> Selection {
        match selection.kind {
            SelectionKind::Window => {
                if self.wayland.toplevel_export.is_none() {
                    error!("window selected but the compositor lacks toplevel export");
                    selection.kind = SelectionKind::Invalid;
                } else if selection.window.is_none() {
                    error!("window selection didn't resolve to a live toplevel");
                    selection.kind = SelectionKind::Invalid;
                }
            }
            SelectionKind::Output | SelectionKind::Geometry => {
                if self.wayland.screencopy.is_none() {
                    error!("output selected but the compositor lacks screencopy");
                    selection.kind = SelectionKind::Invalid;
                }
            }
            _ => {}
        }
        selection
    }

    pub fn on_close_session(&mut self, session_handle: &str) {
        if let Some(key) = self.session_by_handle(session_handle) {
            self.teardown_session(key);
        }
    }
}
