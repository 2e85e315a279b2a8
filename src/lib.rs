//! hyprcast - ScreenCast portal backend for Hyprland-style compositors
//!
//! A user-session daemon that brokers screen capture between portal clients
//! (speaking `org.freedesktop.impl.portal.ScreenCast` on the session bus) and
//! a Wayland compositor offering wlr-screencopy, hyprland-toplevel-export and
//! linux-dmabuf, publishing captured frames as PipeWire video streams.
//!
//! # Design Invariants
//!
//! 1. **Single-thread actor**: all portal state lives in [`state::State`] and
//!    is only ever mutated on the main calloop thread. The zbus executor is a
//!    pure signal source: it parses bus calls into typed requests, pushes them
//!    over a channel and blocks for the reply.
//!
//! 2. **Frame callback holder**: a session holds at most one in-flight
//!    compositor frame (screencopy *or* toplevel-export, never both). Events
//!    for a frame that is no longer the holder are dropped by object-id
//!    comparison, so resetting the holder cancels the callback.
//!
//! 3. **Buffer fd ownership**: every fd stored in a [`pw::Buffer`] is owned by
//!    that record until the media library removes the buffer; removal closes
//!    all plane fds exactly once. The renderer only ever sees borrowed dmabuf
//!    handles.
//!
//! 4. **Frame pacing**: the inter-frame delay is
//!    `1000 / framerate - elapsed - 1 ms`, clamped to `[6 ms, 1000 ms]`,
//!    regardless of what the compositor or the consumer are doing.

pub mod buffer;
pub mod config;
pub mod dbus;
pub mod event_loop;
pub mod picker;
pub mod pw;
pub mod render;
pub mod session;
pub mod state;
pub mod utils;
pub mod wayland;

pub use config::Config;
pub use state::State;

/// Bus name acquired at startup. Clients reach us through the portal
/// frontend, which routes `ScreenCast` calls to this name.
pub const PORTAL_BUS_NAME: &str = "org.freedesktop.impl.portal.desktop.hyprland";

/// Object path all portal interfaces live on.
pub const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/desktop";

/// Issuer string embedded in restore tokens. Tokens from other issuers are
/// ignored on restore.
pub const RESTORE_TOKEN_ISSUER: &str = "hyprland";

/// Restore token payload version we emit (open key/value map).
pub const RESTORE_TOKEN_VERSION: u32 = 3;
