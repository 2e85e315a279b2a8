//! Session-bus surface: the portal object, plus the per-call Request and
//! per-session Session objects the frontend expects at its supplied paths.
//!
//! The zbus executor never touches portal state. Every method is parsed into
//! a [`PortalRequest`], pushed over a calloop channel into the reactor, and
//! the executor blocks on a plain mpsc reply. That keeps all mutation on the
//! main thread and makes the bus a pure signal source.

pub mod screencast;

use std::collections::HashMap;
use std::sync::mpsc;

use anyhow::Context as _;
use calloop::channel::Sender;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedValue;
use zbus::{fdo, interface, ObjectServer};

use crate::picker::RestoreData;
use crate::{PORTAL_BUS_NAME, PORTAL_OBJECT_PATH};

pub use screencast::ScreenCastPortal;

/// Typed request forwarded from the bus executor to the reactor.
pub enum PortalRequest {
    CreateSession {
        request_handle: String,
        session_handle: String,
        app_id: String,
        reply: mpsc::Sender<PortalReply>,
    },
    SelectSources {
        session_handle: String,
        options: SelectSourcesOptions,
        reply: mpsc::Sender<PortalReply>,
    },
    Start {
        session_handle: String,
        reply: mpsc::Sender<PortalReply>,
    },
    CloseSession {
        session_handle: String,
    },
}

/// Parsed SelectSources options. Unknown keys are dropped at parse time.
#[derive(Debug, Default)]
pub struct SelectSourcesOptions {
    pub cursor_mode: Option<u32>,
    pub persist_mode: Option<u32>,
    pub restore: Option<RestoreData>,
}

/// Reactor-side outcome of a portal call.
pub enum PortalReply {
    Response {
        code: u32,
        results: HashMap<String, OwnedValue>,
    },
    /// The call referenced a session we don't know.
    NoSession,
}

impl PortalReply {
    pub fn ok(results: HashMap<String, OwnedValue>) -> Self {
        Self::Response { code: 0, results }
    }

    pub fn failed() -> Self {
        Self::Response { code: 1, results: HashMap::new() }
    }
}

/// Errors surfaced to portal clients.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.freedesktop.impl.portal.desktop.hyprland.Error")]
pub enum PortalError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Bus call references an unknown session.
    NoSession(String),
    /// The reactor went away mid-call.
    Disconnected(String),
}

/// Acquire the portal bus name and publish the ScreenCast interface.
pub fn start(to_loop: Sender<PortalRequest>) -> anyhow::Result<zbus::blocking::Connection> {
    let connection = zbus::blocking::connection::Builder::session()
        .context("couldn't connect to the session bus")?
        .name(PORTAL_BUS_NAME)
        .context("couldn't acquire the portal bus name")?
        .serve_at(PORTAL_OBJECT_PATH, ScreenCastPortal::new(to_loop))
        .context("couldn't export the ScreenCast interface")?
        .build()
        .context("couldn't build the bus connection")?;

    info!(name = PORTAL_BUS_NAME, "portal bus name acquired");
    Ok(connection)
}

/// Send a request into the reactor and wait for its reply.
pub(crate) fn forward(
    to_loop: &Sender<PortalRequest>,
    build: impl FnOnce(mpsc::Sender<PortalReply>) -> PortalRequest,
) -> Result<(u32, HashMap<String, OwnedValue>), PortalError> {
    let (reply_tx, reply_rx) = mpsc::channel();
    to_loop
        .send(build(reply_tx))
        .map_err(|_| PortalError::Disconnected("portal loop is gone".into()))?;

    match reply_rx.recv() {
        Ok(PortalReply::Response { code, results }) => Ok((code, results)),
        Ok(PortalReply::NoSession) => Err(PortalError::NoSession("no session found".into())),
        Err(_) => Err(PortalError::Disconnected("portal loop dropped the request".into())),
    }
}

/// `org.freedesktop.impl.portal.Request`: a temporary object exported for
/// the duration of a call so the frontend can cancel it. Our calls complete
/// synchronously, so Close has nothing to do.
pub struct Request;

#[interface(name = "org.freedesktop.impl.portal.Request")]
impl Request {
    fn close(&self) {
        debug!("request close");
    }
}

pub(crate) async fn register_request(server: &ObjectServer, path: &str) -> fdo::Result<()> {
    server
        .at(path, Request)
        .await
        .map(|_| ())
        .map_err(|err| fdo::Error::Failed(format!("failed to export request object: {err}")))
}

pub(crate) async fn unregister_request(server: &ObjectServer, path: &str) {
    if let Err(err) = server.remove::<Request, _>(path).await {
        warn!(request = path, "failed to unregister request object: {err}");
    }
}

/// `org.freedesktop.impl.portal.Session`: lives at the frontend-supplied
/// session path until the client releases it.
pub struct SessionObject {
    handle: String,
    to_loop: Sender<PortalRequest>,
}

impl SessionObject {
    pub fn new(handle: String, to_loop: Sender<PortalRequest>) -> Self {
        Self { handle, to_loop }
    }
}

#[interface(name = "org.freedesktop.impl.portal.Session")]
impl SessionObject {
    async fn close(
        &self,
        #[zbus(object_server)] server: &ObjectServer,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) {
        debug!(session = %self.handle, "session close");

        let _ = self.to_loop.send(PortalRequest::CloseSession {
            session_handle: self.handle.clone(),
        });

        if let Err(err) = Self::closed(&emitter).await {
            warn!("failed to emit Closed: {err}");
        }

        let path = emitter.path().to_owned();
        if let Err(err) = server.remove::<SessionObject, _>(&path).await {
            warn!(session = %path, "failed to remove session object: {err}");
        }
    }

    #[zbus(property, name = "version")]
    fn version(&self) -> u32 {
        1
    }

    #[zbus(signal)]
    async fn closed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}
