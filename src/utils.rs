//! Timing and format-conversion helpers.

use pipewire::spa::param::video::VideoFormat;
use rustix::time::{clock_gettime, ClockId};
use smithay::backend::allocator::Fourcc;
use wayland_client::protocol::wl_shm;

/// Unix time in seconds, for restore-token issuance stamps.
pub fn unix_time() -> u64 {
    let ts = clock_gettime(ClockId::Realtime);
    ts.tv_sec as u64
}

/// Map a wl_shm format to its DRM fourcc. wl_shm renumbers the two formats
/// every compositor supports; everything else is fourcc-valued already.
pub fn fourcc_from_shm(format: wl_shm::Format) -> Option<Fourcc> {
    let raw = match format {
        wl_shm::Format::Argb8888 => Fourcc::Argb8888 as u32,
        wl_shm::Format::Xrgb8888 => Fourcc::Xrgb8888 as u32,
        other => {
            let value: u32 = other.into();
            value
        }
    };
    Fourcc::try_from(raw).ok()
}

/// Inverse of [`fourcc_from_shm`].
pub fn shm_from_fourcc(fourcc: Fourcc) -> wl_shm::Format {
    match fourcc {
        Fourcc::Argb8888 => wl_shm::Format::Argb8888,
        Fourcc::Xrgb8888 => wl_shm::Format::Xrgb8888,
        other => wl_shm::Format::try_from(other as u32).unwrap_or(wl_shm::Format::Xrgb8888),
    }
}

/// Map a DRM fourcc to the SPA video format of the same memory layout.
pub fn pw_format_from_fourcc(fourcc: Fourcc) -> Option<VideoFormat> {
    match fourcc {
        Fourcc::Argb8888 => Some(VideoFormat::BGRA),
        Fourcc::Xrgb8888 => Some(VideoFormat::BGRx),
        Fourcc::Abgr8888 => Some(VideoFormat::RGBA),
        Fourcc::Xbgr8888 => Some(VideoFormat::RGBx),
        Fourcc::Bgra8888 => Some(VideoFormat::ARGB),
        Fourcc::Bgrx8888 => Some(VideoFormat::xRGB),
        _ => None,
    }
}

/// Drop the alpha channel of a SPA video format. Consumers are allowed to
/// negotiate the x-variant of the format the compositor reports.
pub fn pw_strip_alpha(format: VideoFormat) -> VideoFormat {
    match format {
        VideoFormat::BGRA => VideoFormat::BGRx,
        VideoFormat::RGBA => VideoFormat::RGBx,
        VideoFormat::ARGB => VideoFormat::xRGB,
        VideoFormat::ABGR => VideoFormat::xBGR,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_fourcc_round_trip() {
        for fourcc in [Fourcc::Argb8888, Fourcc::Xrgb8888] {
            assert_eq!(fourcc_from_shm(shm_from_fourcc(fourcc)), Some(fourcc));
        }
    }

    #[test]
    fn test_pw_format_mapping() {
        assert_eq!(pw_format_from_fourcc(Fourcc::Argb8888), Some(VideoFormat::BGRA));
        assert_eq!(pw_format_from_fourcc(Fourcc::Xrgb8888), Some(VideoFormat::BGRx));
        // Alpha-stripped format of ARGB8888 matches the XRGB8888 mapping.
        assert_eq!(
            pw_strip_alpha(pw_format_from_fourcc(Fourcc::Argb8888).unwrap()),
            pw_format_from_fourcc(Fourcc::Xrgb8888).unwrap()
        );
    }
}
