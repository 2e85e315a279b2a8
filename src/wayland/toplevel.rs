//! Toplevel registry: mirrors the compositor's exported toplevels.
//!
//! Bookkeeping is refcounted by sessions: the foreign-toplevel manager is
//! bound on the first `activate` and stopped again when the last session
//! drops its lock, so the table doesn't burn listener work while nobody
//! shares windows.

use std::collections::HashMap;

use wayland_backend::client::ObjectId;
use wayland_client::protocol::wl_registry::WlRegistry;
use wayland_client::{event_created_child, Connection, Dispatch, Proxy, QueueHandle};
use wayland_protocols_wlr::foreign_toplevel::v1::client::zwlr_foreign_toplevel_handle_v1::{
    self, ZwlrForeignToplevelHandleV1,
};
use wayland_protocols_wlr::foreign_toplevel::v1::client::zwlr_foreign_toplevel_manager_v1::{
    self, ZwlrForeignToplevelManagerV1, EVT_TOPLEVEL_OPCODE,
};

use crate::state::State;
use crate::wayland::protocols::hyprland_toplevel_mapping_v1::hyprland_toplevel_mapping_manager_v1::HyprlandToplevelMappingManagerV1;
use crate::wayland::protocols::hyprland_toplevel_mapping_v1::hyprland_toplevel_window_mapping_handle_v1::{
    self, HyprlandToplevelWindowMappingHandleV1,
};

#[derive(Debug)]
pub struct ToplevelHandle {
    pub handle: ZwlrForeignToplevelHandleV1,
    pub title: String,
    pub class: String,
}

impl ToplevelHandle {
    /// Opaque token for this toplevel, stable for its lifetime.
    pub fn token(&self) -> u64 {
        self.handle.id().protocol_id() as u64
    }
}

#[derive(Debug, Default)]
pub struct ToplevelRegistry {
    /// Registry global, recorded at enumeration; bound on activation.
    global: Option<(u32, u32)>,
    manager: Option<ZwlrForeignToplevelManagerV1>,
    pub mapping: Option<HyprlandToplevelMappingManagerV1>,
    pub toplevels: Vec<ToplevelHandle>,
    /// Mapped window address per toplevel object, filled asynchronously.
    addresses: HashMap<ObjectId, u64>,
    activate_locks: u32,
}

impl ToplevelRegistry {
    pub fn set_global(&mut self, name: u32, version: u32) {
        self.global = Some((name, version.min(3)));
    }

    pub fn has_global(&self) -> bool {
        self.global.is_some()
    }

    /// Take an activation lock, binding the manager on the first one.
    pub fn activate(&mut self, registry: &WlRegistry, qh: &QueueHandle<State>) {
        self.activate_locks += 1;
        if self.activate_locks > 1 || self.manager.is_some() {
            return;
        }
        let Some((name, version)) = self.global else {
            return;
        };
        tracing::info!("toplevel registry activated");
        self.manager =
            Some(registry.bind::<ZwlrForeignToplevelManagerV1, _, _>(name, version, qh, ()));
    }

    /// Drop an activation lock; the last one stops the manager and clears
    /// the table.
    pub fn deactivate(&mut self) {
        self.activate_locks = self.activate_locks.saturating_sub(1);
        if self.activate_locks > 0 {
            return;
        }
        tracing::info!("toplevel registry deactivated");
        if let Some(manager) = self.manager.take() {
            manager.stop();
        }
        self.clear();
    }

    fn clear(&mut self) {
        for entry in self.toplevels.drain(..) {
            entry.handle.destroy();
        }
        self.addresses.clear();
    }

    pub fn address_for(&self, handle: &ZwlrForeignToplevelHandleV1) -> u64 {
        self.addresses.get(&handle.id()).copied().unwrap_or(0)
    }

    pub fn handle_from_class(&self, class: &str) -> Option<&ToplevelHandle> {
        self.toplevels.iter().find(|entry| entry.class == class)
    }

    /// Look up by the low 32 bits of the token, as reported by the picker.
    pub fn handle_from_token_lower(&self, lower: u32) -> Option<&ToplevelHandle> {
        self.toplevels
            .iter()
            .find(|entry| (entry.token() & 0xFFFF_FFFF) as u32 == lower)
    }

    pub fn handle_from_token(&self, token: u64) -> Option<&ToplevelHandle> {
        self.toplevels.iter().find(|entry| entry.token() == token)
    }

    fn entry_mut(&mut self, handle: &ZwlrForeignToplevelHandleV1) -> Option<&mut ToplevelHandle> {
        self.toplevels.iter_mut().find(|entry| entry.handle.id() == handle.id())
    }
}

impl Dispatch<ZwlrForeignToplevelManagerV1, ()> for State {
    fn event(
        state: &mut Self,
        _manager: &ZwlrForeignToplevelManagerV1,
        event: zwlr_foreign_toplevel_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_foreign_toplevel_manager_v1::Event::Toplevel { toplevel } => {
                if let Some(mapping) = &state.wayland.toplevels.mapping {
                    mapping.get_window_for_toplevel_wlr(&toplevel, qh, toplevel.id());
                }
                state.wayland.toplevels.toplevels.push(ToplevelHandle {
                    handle: toplevel,
                    title: String::new(),
                    class: String::new(),
                });
            }
            zwlr_foreign_toplevel_manager_v1::Event::Finished => {
                tracing::debug!("toplevel manager finished");
                state.wayland.toplevels.manager = None;
                state.wayland.toplevels.clear();
            }
            _ => {}
        }
    }

    event_created_child!(State, ZwlrForeignToplevelManagerV1, [
        EVT_TOPLEVEL_OPCODE => (ZwlrForeignToplevelHandleV1, ()),
    ]);
}

impl Dispatch<ZwlrForeignToplevelHandleV1, ()> for State {
    fn event(
        state: &mut Self,
        handle: &ZwlrForeignToplevelHandleV1,
        event: zwlr_foreign_toplevel_handle_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_foreign_toplevel_handle_v1::Event::Title { title } => {
                if let Some(entry) = state.wayland.toplevels.entry_mut(handle) {
                    entry.title = title;
                }
            }
            zwlr_foreign_toplevel_handle_v1::Event::AppId { app_id } => {
                if let Some(entry) = state.wayland.toplevels.entry_mut(handle) {
                    entry.class = app_id;
                }
            }
            zwlr_foreign_toplevel_handle_v1::Event::Closed => {
                let registry = &mut state.wayland.toplevels;
                registry.addresses.remove(&handle.id());
                registry.toplevels.retain(|entry| {
                    if entry.handle.id() == handle.id() {
                        entry.handle.destroy();
                        false
                    } else {
                        true
                    }
                });
            }
            _ => {}
        }
    }
}

impl Dispatch<HyprlandToplevelMappingManagerV1, ()> for State {
    fn event(
        _state: &mut Self,
        _manager: &HyprlandToplevelMappingManagerV1,
        _event: <HyprlandToplevelMappingManagerV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<HyprlandToplevelWindowMappingHandleV1, ObjectId> for State {
    fn event(
        state: &mut Self,
        handle: &HyprlandToplevelWindowMappingHandleV1,
        event: hyprland_toplevel_window_mapping_handle_v1::Event,
        toplevel: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            hyprland_toplevel_window_mapping_handle_v1::Event::WindowAddress {
                address_hi,
                address_lo,
            } => {
                let address = ((address_hi as u64) << 32) | address_lo as u64;
                state.wayland.toplevels.addresses.insert(toplevel.clone(), address);
            }
            hyprland_toplevel_window_mapping_handle_v1::Event::Failed => {}
        }
        handle.destroy();
    }
}
