//! GPU transform renderer: a single-pass blit from one DMA-BUF into another,
//! applying an output transform and an optional crop window.
//!
//! Clients specify region selections in logical (post-transform) coordinates;
//! the blit samples the physical buffer, so the crop rectangle has to be
//! mapped through the inverse transform first. The 8-case table in
//! [`physical_crop`] is the authoritative mapping.

use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::Buffer as _;
use smithay::backend::allocator::gbm::GbmDevice;
use smithay::backend::drm::DrmDeviceFd;
use smithay::backend::egl::{EGLContext, EGLDisplay};
use smithay::backend::renderer::gles::GlesRenderer;
use smithay::backend::renderer::{Bind, Frame, ImportDma, Renderer as _};
use smithay::utils::{Buffer as BufferCoords, Physical, Point, Rectangle, Size, Transform};
use tracing::trace;
use wayland_client::protocol::wl_output;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer initialization failed: {0}")]
    Init(String),
    #[error("source import failed: {0}")]
    ImportFailed(String),
    #[error("render pass failed: {0}")]
    RenderFailed(String),
}

/// An axis-aligned box, used for crops and damage in both coordinate spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Box2 {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Box2 {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

/// GLES blitter over the process-global GBM device.
pub struct TransformRenderer {
    gles: GlesRenderer,
}

impl TransformRenderer {
    pub fn new(gbm: &GbmDevice<DrmDeviceFd>) -> Result<Self, RenderError> {
        let display = unsafe { EGLDisplay::new(gbm.clone()) }
            .map_err(|err| RenderError::Init(err.to_string()))?;
        let context =
            EGLContext::new(&display).map_err(|err| RenderError::Init(err.to_string()))?;
        let gles = unsafe { GlesRenderer::new(context) }
            .map_err(|err| RenderError::Init(err.to_string()))?;
        Ok(Self { gles })
    }

    /// Blit `source` into `target`, orienting by `transform` and sampling
    /// only `crop` (physical coordinates) when given.
    ///
    /// Waits for GPU completion before returning; all GPU-side handles
    /// created for the pass are released on every path.
    pub fn render(
        &mut self,
        target: &Dmabuf,
        source: &Dmabuf,
        transform: Transform,
        crop: Option<Box2>,
    ) -> Result<(), RenderError> {
        trace!(?transform, ?crop, "render pass");

        let texture = self
            .gles
            .import_dmabuf(source, None)
            .map_err(|err| RenderError::ImportFailed(err.to_string()))?;

        let size: Size<i32, Physical> =
            Size::from((target.width() as i32, target.height() as i32));
        let dst = Rectangle::from_size(size);

        let src: Rectangle<f64, BufferCoords> = match crop {
            Some(crop) => Rectangle::new(
                Point::from((crop.x as f64, crop.y as f64)),
                Size::from((crop.w as f64, crop.h as f64)),
            ),
            None => Rectangle::from_size(Size::from((
                source.width() as f64,
                source.height() as f64,
            ))),
        };

        let mut target = target.clone();
        let mut fb = self
            .gles
            .bind(&mut target)
            .map_err(|err| RenderError::RenderFailed(err.to_string()))?;

        let mut frame = self
            .gles
            .render(&mut fb, size, Transform::Normal)
            .map_err(|err| RenderError::RenderFailed(err.to_string()))?;

        frame
            .render_texture_from_to(&texture, src, dst, &[dst], &[], transform, 1.0)
            .map_err(|err| RenderError::RenderFailed(err.to_string()))?;

        let sync = frame
            .finish()
            .map_err(|err| RenderError::RenderFailed(err.to_string()))?;
        sync.wait()
            .map_err(|err| RenderError::RenderFailed(format!("{err:?}")))?;

        Ok(())
    }
}

pub fn transform_from_wl(transform: wl_output::Transform) -> Transform {
    match transform {
        wl_output::Transform::Normal => Transform::Normal,
        wl_output::Transform::_90 => Transform::_90,
        wl_output::Transform::_180 => Transform::_180,
        wl_output::Transform::_270 => Transform::_270,
        wl_output::Transform::Flipped => Transform::Flipped,
        wl_output::Transform::Flipped90 => Transform::Flipped90,
        wl_output::Transform::Flipped180 => Transform::Flipped180,
        wl_output::Transform::Flipped270 => Transform::Flipped270,
        _ => Transform::Normal,
    }
}

/// Logical size of a physical `(w, h)` surface under a transform: the
/// 90/270 families swap width and height.
pub fn logical_dimensions(transform: Transform, width: i32, height: i32) -> (i32, i32) {
    match transform {
        Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270 => {
            (height, width)
        }
        _ => (width, height),
    }
}

/// Map a crop rectangle in logical coordinates onto the physical buffer.
pub fn physical_crop(transform: Transform, rect: Box2, pw: i32, ph: i32) -> Box2 {
    let Box2 { x, y, w, h } = rect;
    match transform {
        Transform::Normal => Box2::new(x, y, w, h),
        Transform::_90 => Box2::new(y, ph - x - w, h, w),
        Transform::_180 => Box2::new(pw - x - w, ph - y - h, w, h),
        Transform::_270 => Box2::new(pw - y - h, x, h, w),
        Transform::Flipped => Box2::new(pw - x - w, y, w, h),
        Transform::Flipped90 => Box2::new(pw - y - h, ph - x - w, h, w),
        Transform::Flipped180 => Box2::new(x, ph - y - h, w, h),
        Transform::Flipped270 => Box2::new(y, x, h, w),
    }
}

/// Map a physical rectangle back to logical coordinates. Inverse of
/// [`physical_crop`].
pub fn logical_box(transform: Transform, rect: Box2, pw: i32, ph: i32) -> Box2 {
    let Box2 { x, y, w, h } = rect;
    match transform {
        Transform::Normal => Box2::new(x, y, w, h),
        Transform::_90 => Box2::new(ph - y - h, x, h, w),
        Transform::_180 => Box2::new(pw - x - w, ph - y - h, w, h),
        Transform::_270 => Box2::new(y, pw - x - w, h, w),
        Transform::Flipped => Box2::new(pw - x - w, y, w, h),
        Transform::Flipped90 => Box2::new(ph - y - h, pw - x - w, h, w),
        Transform::Flipped180 => Box2::new(x, ph - y - h, w, h),
        Transform::Flipped270 => Box2::new(y, x, h, w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Transform; 8] = [
        Transform::Normal,
        Transform::_90,
        Transform::_180,
        Transform::_270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    #[test]
    fn test_crop_round_trip_all_transforms() {
        let (pw, ph) = (1920, 1080);
        for transform in ALL {
            let (lw, lh) = logical_dimensions(transform, pw, ph);
            for rect in [
                Box2::new(0, 0, lw, lh),
                Box2::new(0, 0, 16, 16),
                Box2::new(lw - 20, lh - 10, 20, 10),
                Box2::new(lw / 4, lh / 3, lw / 2, lh / 3),
            ] {
                let physical = physical_crop(transform, rect, pw, ph);

                // Stays within the physical surface.
                assert!(physical.x >= 0 && physical.y >= 0, "{transform:?} {rect:?}");
                assert!(
                    physical.x + physical.w <= pw && physical.y + physical.h <= ph,
                    "{transform:?} {rect:?} -> {physical:?}"
                );

                // Round-trips through the forward transform.
                assert_eq!(
                    logical_box(transform, physical, pw, ph),
                    rect,
                    "{transform:?}"
                );
            }
        }
    }

    #[test]
    fn test_crop_90_example() {
        // A 640x480 logical region at (100, 200) on a 90-degree output
        // backed by a 1920x1080 physical buffer.
        let physical = physical_crop(Transform::_90, Box2::new(100, 200, 640, 480), 1920, 1080);
        assert_eq!(physical, Box2::new(200, 340, 480, 640));
    }

    #[test]
    fn test_logical_dimensions_swap() {
        assert_eq!(logical_dimensions(Transform::Normal, 1920, 1080), (1920, 1080));
        assert_eq!(logical_dimensions(Transform::_90, 1920, 1080), (1080, 1920));
        assert_eq!(logical_dimensions(Transform::Flipped270, 1920, 1080), (1080, 1920));
        assert_eq!(logical_dimensions(Transform::Flipped180, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn test_identity_crop_is_identity() {
        let rect = Box2::new(10, 20, 30, 40);
        assert_eq!(physical_crop(Transform::Normal, rect, 100, 100), rect);
    }
}
