//! Wayland connection: registry, globals, dmabuf feedback and the GBM device.
//!
//! The portal is a plain wayland client. Globals are bound from the initial
//! registry enumeration; outputs and the foreign-toplevel manager can also
//! come and go at runtime through a second registry handle.

pub mod outputs;
pub mod protocols;
pub mod toplevel;

use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use anyhow::Context as _;
use smithay::backend::allocator::gbm::GbmDevice;
use smithay::backend::allocator::{Format as DrmFormat, Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use smithay::utils::DeviceFd;
use tracing::{debug, info, trace, warn};
use wayland_client::globals::{registry_queue_init, GlobalList, GlobalListContents};
use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_shm::{self, WlShm};
use wayland_client::protocol::wl_shm_pool::{self, WlShmPool};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1::{
    self, ZwpLinuxBufferParamsV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_feedback_v1::{
    self, ZwpLinuxDmabufFeedbackV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::{
    self, ZwpLinuxDmabufV1,
};
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::{
    self, ZwlrScreencopyManagerV1,
};

use crate::state::State;
use crate::wayland::outputs::OutputRegistry;
use crate::wayland::protocols::hyprland_toplevel_export_v1::hyprland_toplevel_export_manager_v1::{
    self, HyprlandToplevelExportManagerV1,
};
use crate::wayland::protocols::hyprland_toplevel_mapping_v1::hyprland_toplevel_mapping_manager_v1::HyprlandToplevelMappingManagerV1;
use crate::wayland::toplevel::ToplevelRegistry;

/// State of the linux-dmabuf default feedback exchange. Mirrors the wire
/// protocol: a format table arrives as an mmap-able fd, then tranches index
/// into it. Everything after the first `done` is ignored.
#[derive(Debug, Default)]
struct DmabufFeedback {
    /// Parsed format table: (fourcc, modifier) pairs.
    table: Vec<(u32, u64)>,
    main_device: Option<u64>,
    device_used: bool,
    done: bool,
}

pub struct WaylandState {
    pub conn: Connection,
    pub qh: QueueHandle<State>,
    /// Second registry handle for dynamic global arrival/removal.
    pub registry: WlRegistry,

    pub screencopy: Option<ZwlrScreencopyManagerV1>,
    pub toplevel_export: Option<HyprlandToplevelExportManagerV1>,
    pub linux_dmabuf: Option<ZwpLinuxDmabufV1>,
    pub shm: Option<WlShm>,

    pub outputs: OutputRegistry,
    pub toplevels: ToplevelRegistry,

    /// Supported (fourcc, modifier) pairs from dmabuf feedback.
    pub dmabuf_formats: Vec<DrmFormat>,
    feedback: DmabufFeedback,

    /// Process-global GPU allocator handle, created at most once from the
    /// feedback main device.
    pub gbm: Option<GbmDevice<DrmDeviceFd>>,
}

/// Connect to the compositor and set up the initial registry queue.
pub fn connect() -> anyhow::Result<(Connection, GlobalList, EventQueue<State>)> {
    let conn = Connection::connect_to_env().context("couldn't connect to a wayland compositor")?;
    let (globals, queue) =
        registry_queue_init::<State>(&conn).context("wl_registry enumeration failed")?;
    Ok((conn, globals, queue))
}

impl WaylandState {
    pub fn new(conn: Connection, globals: &GlobalList, qh: QueueHandle<State>) -> Self {
        let registry = conn.display().get_registry(&qh, ());

        let screencopy: Option<ZwlrScreencopyManagerV1> = globals.bind(&qh, 2..=3, ()).ok();
        let toplevel_export: Option<HyprlandToplevelExportManagerV1> =
            globals.bind(&qh, 2..=2, ()).ok();
        let linux_dmabuf: Option<ZwpLinuxDmabufV1> = globals.bind(&qh, 4..=4, ()).ok();
        let shm: Option<WlShm> = globals.bind(&qh, 1..=1, ()).ok();
        let mapping: Option<HyprlandToplevelMappingManagerV1> = globals.bind(&qh, 1..=1, ()).ok();

        if linux_dmabuf.is_none() {
            warn!("cannot use linux_dmabuf with ver < 4");
        }

        if let Some(dmabuf) = &linux_dmabuf {
            dmabuf.get_default_feedback(&qh, ());
        }

        let mut toplevels = ToplevelRegistry::default();
        toplevels.mapping = mapping;

        for global in globals.contents().clone_list() {
            debug!(" | got interface: {} (ver {})", global.interface, global.version);
        }

        // Outputs (and the foreign-toplevel global) are picked up through
        // the second registry, which replays every current global on its
        // first roundtrip and then tracks arrival/removal.
        Self {
            conn,
            qh,
            registry,
            screencopy,
            toplevel_export,
            linux_dmabuf,
            shm,
            outputs: OutputRegistry::default(),
            toplevels,
            dmabuf_formats: Vec::new(),
            feedback: DmabufFeedback::default(),
            gbm: None,
        }
    }

    /// Modifiers advertised for a format, for feeding into allocation.
    pub fn modifiers_for(&self, fourcc: Fourcc) -> Vec<Modifier> {
        self.dmabuf_formats
            .iter()
            .filter(|format| format.code == fourcc)
            .map(|format| format.modifier)
            .collect()
    }

    fn create_gbm_device(&mut self, dev: u64) {
        if self.gbm.is_some() {
            return;
        }
        match open_render_node(dev) {
            Ok(fd) => match GbmDevice::new(DrmDeviceFd::new(DeviceFd::from(fd))) {
                Ok(gbm) => {
                    info!("GBM device created");
                    self.gbm = Some(gbm);
                }
                Err(err) => warn!("couldn't create GBM device: {err}"),
            },
            Err(err) => warn!("couldn't find a render node: {err}"),
        }
    }
}

/// Resolve a dev_t from dmabuf feedback to an opened render node.
///
/// Prefers the node matching the device id exactly when it already is a
/// render node; otherwise falls back to the first render node present, which
/// is the right answer on single-GPU machines where the feedback names the
/// primary node.
fn open_render_node(dev: u64) -> anyhow::Result<OwnedFd> {
    let mut fallback: Option<PathBuf> = None;

    for entry in std::fs::read_dir("/dev/dri").context("no /dev/dri")?.flatten() {
        let path = entry.path();
        let is_render = entry
            .file_name()
            .to_string_lossy()
            .starts_with("renderD");
        if !is_render {
            continue;
        }
        let Ok(stat) = rustix::fs::stat(&path) else {
            continue;
        };
        if stat.st_rdev == dev {
            fallback = Some(path);
            break;
        }
        fallback.get_or_insert(path);
    }

    let path = fallback.context("no render node in /dev/dri")?;
    trace!(path = %path.display(), "opening render node");
    let fd = rustix::fs::open(
        &path,
        rustix::fs::OFlags::RDWR | rustix::fs::OFlags::CLOEXEC,
        rustix::fs::Mode::empty(),
    )
    .with_context(|| format!("couldn't open render node {}", path.display()))?;
    Ok(fd)
}

impl Dispatch<WlRegistry, GlobalListContents> for State {
    fn event(
        _state: &mut Self,
        _registry: &WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlRegistry, ()> for State {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global { name, interface, version } => {
                if interface == WlOutput::interface().name {
                    let output: WlOutput = registry.bind(name, version.min(4), qh, name);
                    state.wayland.outputs.add(name, output);
                } else if interface == "zwlr_foreign_toplevel_manager_v1" {
                    state.wayland.toplevels.set_global(name, version);
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                state.wayland.outputs.remove_global(name);
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwlrScreencopyManagerV1, ()> for State {
    fn event(
        _state: &mut Self,
        _manager: &ZwlrScreencopyManagerV1,
        _event: zwlr_screencopy_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<HyprlandToplevelExportManagerV1, ()> for State {
    fn event(
        _state: &mut Self,
        _manager: &HyprlandToplevelExportManagerV1,
        _event: hyprland_toplevel_export_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlShm, ()> for State {
    fn event(
        _state: &mut Self,
        _shm: &WlShm,
        _event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlShmPool, ()> for State {
    fn event(
        _state: &mut Self,
        _pool: &WlShmPool,
        _event: wl_shm_pool::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlBuffer, ()> for State {
    fn event(
        _state: &mut Self,
        _buffer: &WlBuffer,
        _event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Release is irrelevant: the compositor only ever writes into our
        // buffers, and their lifetime is owned by the stream.
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for State {
    fn event(
        _state: &mut Self,
        _dmabuf: &ZwpLinuxDmabufV1,
        _event: zwp_linux_dmabuf_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // format/modifier events are superseded by the default feedback.
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, ()> for State {
    fn event(
        _state: &mut Self,
        _params: &ZwpLinuxBufferParamsV1,
        _event: zwp_linux_buffer_params_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Buffers are created with create_immed; created/failed never arrive.
    }
}

impl Dispatch<ZwpLinuxDmabufFeedbackV1, ()> for State {
    fn event(
        state: &mut Self,
        _feedback: &ZwpLinuxDmabufFeedbackV1,
        event: zwp_linux_dmabuf_feedback_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let wayland = &mut state.wayland;
        if wayland.feedback.done {
            return;
        }

        match event {
            zwp_linux_dmabuf_feedback_v1::Event::MainDevice { device } => {
                debug!("dmabuf feedback main device");
                let Some(dev) = parse_dev(&device) else {
                    return;
                };
                wayland.feedback.main_device = Some(dev);
                wayland.create_gbm_device(dev);
            }
            zwp_linux_dmabuf_feedback_v1::Event::FormatTable { fd, size } => {
                trace!("dmabuf feedback format table, {size} bytes");
                wayland.feedback.table = parse_format_table(fd.as_fd(), size as usize);
                wayland.dmabuf_formats.clear();
            }
            zwp_linux_dmabuf_feedback_v1::Event::TrancheTargetDevice { device } => {
                let Some(dev) = parse_dev(&device) else {
                    return;
                };
                if wayland.gbm.is_none() {
                    wayland.create_gbm_device(dev);
                }
                wayland.feedback.device_used = wayland.feedback.main_device == Some(dev);
            }
            zwp_linux_dmabuf_feedback_v1::Event::TrancheFormats { indices } => {
                if !wayland.feedback.device_used || wayland.feedback.table.is_empty() {
                    return;
                }
                for chunk in indices.chunks_exact(2) {
                    let index = u16::from_ne_bytes([chunk[0], chunk[1]]) as usize;
                    let Some(&(fourcc, modifier)) = wayland.feedback.table.get(index) else {
                        continue;
                    };
                    let Ok(code) = Fourcc::try_from(fourcc) else {
                        continue;
                    };
                    wayland.dmabuf_formats.push(DrmFormat {
                        code,
                        modifier: Modifier::from(modifier),
                    });
                }
            }
            zwp_linux_dmabuf_feedback_v1::Event::TrancheDone => {
                wayland.feedback.device_used = false;
            }
            zwp_linux_dmabuf_feedback_v1::Event::Done => {
                debug!(formats = wayland.dmabuf_formats.len(), "dmabuf feedback done");
                wayland.feedback.table = Vec::new();
                wayland.feedback.done = true;
            }
            _ => {}
        }
    }
}

fn parse_dev(bytes: &[u8]) -> Option<u64> {
    let array: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_ne_bytes(array))
}

/// The format table is an array of 16-byte entries: u32 fourcc, u32 padding,
/// u64 modifier.
fn parse_format_table(fd: std::os::fd::BorrowedFd<'_>, size: usize) -> Vec<(u32, u64)> {
    let mut entries = Vec::with_capacity(size / 16);

    unsafe {
        let ptr = match rustix::mm::mmap(
            std::ptr::null_mut(),
            size,
            rustix::mm::ProtFlags::READ,
            rustix::mm::MapFlags::PRIVATE,
            fd,
            0,
        ) {
            Ok(ptr) => ptr,
            Err(err) => {
                warn!("format table failed to mmap: {err}");
                return entries;
            }
        };

        let bytes = std::slice::from_raw_parts(ptr as *const u8, size);
        for entry in bytes.chunks_exact(16) {
            let fourcc = u32::from_ne_bytes(entry[0..4].try_into().unwrap());
            let modifier = u64::from_ne_bytes(entry[8..16].try_into().unwrap());
            entries.push((fourcc, modifier));
        }

        let _ = rustix::mm::munmap(ptr, size);
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dev() {
        assert_eq!(parse_dev(&0xe200u64.to_ne_bytes()), Some(0xe200));
        assert_eq!(parse_dev(&[0u8; 4]), None);
    }
}
