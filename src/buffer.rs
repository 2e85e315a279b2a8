//! Buffer allocation: GPU (DMA-BUF via GBM) and CPU (sealed memfd) backing,
//! plus import of either as a compositor-visible wl_buffer.

use std::os::fd::{AsFd, OwnedFd};

use smithay::backend::allocator::dmabuf::{AsDmabuf, Dmabuf};
use smithay::backend::allocator::gbm::{GbmBuffer, GbmBufferFlags, GbmDevice};
use smithay::backend::allocator::{Buffer as _, Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use tracing::{debug, trace};
use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::QueueHandle;
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1;
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;

use crate::state::State;
use crate::utils::shm_from_fourcc;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("no modifier allocates for format {0}")]
    AllocationFailed(Fourcc),
    #[error("anonymous shm backing could not be created: {0}")]
    ShmOpenFailed(rustix::io::Errno),
    #[error("buffer import failed: {0}")]
    ImportFailed(String),
}

/// Pick a working modifier for a format by test allocation.
///
/// Modifier-aware allocation over the whole candidate list is tried first;
/// when the device refuses, each candidate is retried individually, with
/// INVALID and LINEAR mapped onto the non-modifier allocation path. Returns
/// the chosen modifier and the plane count of the resulting buffer.
pub fn find_preferred_modifier(
    gbm: &GbmDevice<DrmDeviceFd>,
    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: &[Modifier],
) -> Result<(Modifier, usize), BufferError> {
    trace!(?fourcc, count = modifiers.len(), "find_preferred_modifier");

    if let Ok(buffer) = allocate_gbm(gbm, width, height, fourcc, modifiers) {
        let modifier = buffer.format().modifier;
        let planes = export_plane_count(buffer, fourcc)?;
        return Ok((modifier, planes));
    }

    debug!("modifier-aware allocation failed, retrying candidates individually");
    for &modifier in modifiers {
        let flags = match modifier {
            Modifier::Invalid => GbmBufferFlags::RENDERING,
            Modifier::Linear => GbmBufferFlags::RENDERING | GbmBufferFlags::LINEAR,
            _ => continue,
        };
        if let Ok(bo) = gbm.create_buffer_object::<()>(width, height, fourcc, flags) {
            let buffer = GbmBuffer::from_bo(bo, true);
            let planes = export_plane_count(buffer, fourcc)?;
            return Ok((modifier, planes));
        }
    }

    Err(BufferError::AllocationFailed(fourcc))
}

fn export_plane_count(buffer: GbmBuffer, fourcc: Fourcc) -> Result<usize, BufferError> {
    let dmabuf = buffer
        .export()
        .map_err(|_| BufferError::AllocationFailed(fourcc))?;
    Ok(dmabuf.num_planes())
}

/// Allocate a DMA-BUF with a fixed modifier.
pub fn allocate_dmabuf(
    gbm: &GbmDevice<DrmDeviceFd>,
    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifier: Modifier,
) -> Result<Dmabuf, BufferError> {
    let buffer = allocate_gbm(gbm, width, height, fourcc, &[modifier])?;
    buffer.export().map_err(|err| BufferError::ImportFailed(err.to_string()))
}

fn allocate_gbm(
    gbm: &GbmDevice<DrmDeviceFd>,
    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: &[Modifier],
) -> Result<GbmBuffer, BufferError> {
    let flags = GbmBufferFlags::RENDERING;

    if modifiers.is_empty() || (modifiers.len() == 1 && modifiers[0] == Modifier::Invalid) {
        let bo = gbm
            .create_buffer_object::<()>(width, height, fourcc, flags)
            .map_err(|_| BufferError::AllocationFailed(fourcc))?;
        return Ok(GbmBuffer::from_bo(bo, true));
    }

    let candidates = modifiers.iter().copied().filter(|&m| m != Modifier::Invalid);
    let bo = gbm
        .create_buffer_object_with_modifiers2::<()>(width, height, fourcc, candidates, flags)
        .map_err(|_| BufferError::AllocationFailed(fourcc))?;
    Ok(GbmBuffer::from_bo(bo, false))
}

/// Open an anonymous tmpfs-backed fd sized for an SHM frame.
pub fn allocate_shm(size: usize) -> Result<OwnedFd, BufferError> {
    let fd = rustix::fs::memfd_create(
        "hyprcast-shm",
        rustix::fs::MemfdFlags::CLOEXEC | rustix::fs::MemfdFlags::ALLOW_SEALING,
    )
    .map_err(BufferError::ShmOpenFailed)?;
    rustix::fs::ftruncate(&fd, size as u64).map_err(BufferError::ShmOpenFailed)?;
    let _ = rustix::fs::fcntl_add_seals(
        &fd,
        rustix::fs::SealFlags::SEAL | rustix::fs::SealFlags::SHRINK | rustix::fs::SealFlags::GROW,
    );
    Ok(fd)
}

/// Import a DMA-BUF as a wl_buffer through zwp_linux_buffer_params.
pub fn import_dmabuf_wl_buffer(
    qh: &QueueHandle<State>,
    linux_dmabuf: &ZwpLinuxDmabufV1,
    dmabuf: &Dmabuf,
) -> WlBuffer {
    let params = linux_dmabuf.create_params(qh, ());
    let modifier = u64::from(dmabuf.format().modifier);

    for (plane, ((fd, offset), stride)) in dmabuf
        .handles()
        .zip(dmabuf.offsets())
        .zip(dmabuf.strides())
        .enumerate()
    {
        params.add(
            fd,
            plane as u32,
            offset,
            stride,
            (modifier >> 32) as u32,
            (modifier & 0xffff_ffff) as u32,
        );
    }

    let buffer = params.create_immed(
        dmabuf.width() as i32,
        dmabuf.height() as i32,
        dmabuf.format().code as u32,
        zwp_linux_buffer_params_v1::Flags::empty(),
        qh,
        (),
    );
    params.destroy();
    buffer
}

/// Import an SHM fd as a wl_buffer through a throwaway wl_shm pool.
pub fn import_shm_wl_buffer(
    qh: &QueueHandle<State>,
    shm: &WlShm,
    fd: &OwnedFd,
    fourcc: Fourcc,
    width: u32,
    height: u32,
    stride: u32,
) -> WlBuffer {
    let size = (stride * height) as i32;
    let pool = shm.create_pool(fd.as_fd(), size, qh, ());
    let buffer = pool.create_buffer(
        0,
        width as i32,
        height as i32,
        stride as i32,
        shm_from_fourcc(fourcc),
        qh,
        (),
    );
    pool.destroy();
    buffer
}
