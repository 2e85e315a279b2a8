//! PipeWire integration: one producer stream per capture session.
//!
//! The PipeWire loop runs on its own `MainLoop` whose fd is woven into the
//! calloop reactor; stream callbacks never touch portal state directly, they
//! go through per-stream shared cells and the [`PwEvent`] channel.

pub mod stream;

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use anyhow::Context as _;
use calloop::channel::Sender;
use pipewire::context::Context;
use pipewire::core::Core;
use pipewire::main_loop::MainLoop;
use pipewire::spa::sys as spa_sys;
use tracing::{debug, error, trace, warn};

use crate::session::{FrameStatus, SessionKey, SharingData};

pub use stream::{Buffer, PwStream, StreamParams};

/// Stream lifecycle notifications delivered to the reactor.
#[derive(Debug)]
pub enum PwEvent {
    Streaming { session: SessionKey },
    Paused { session: SessionKey },
    Unconnected { session: SessionKey },
    Error { session: SessionKey },
    /// The consumer negotiated a framerate differing from ours.
    FramerateChanged { session: SessionKey, framerate: u32 },
    /// A ring buffer appeared on a streaming stream; a session that gave up
    /// on out-of-buffers can resume.
    BuffersAvailable { session: SessionKey },
    /// The PipeWire connection itself died.
    FatalError,
}

pub struct Pipewire {
    pub main_loop: MainLoop,
    _context: Context,
    pub core: Core,
    pub streams: HashMap<SessionKey, PwStream>,
    pub events: Sender<PwEvent>,
}

/// Wrapper handing the PipeWire loop fd to calloop.
pub struct LoopFd(pub MainLoop);

impl AsFd for LoopFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.loop_().fd()
    }
}

impl Pipewire {
    pub fn new(events: Sender<PwEvent>) -> anyhow::Result<Self> {
        pipewire::init();

        let main_loop = MainLoop::new(None).context("pipewire refused to create a loop")?;
        let context = Context::new(&main_loop).context("error creating PipeWire context")?;
        let core = context.connect(None).context("error connecting to PipeWire")?;

        // Watch for connection loss (EPIPE on the core).
        let events_ = events.clone();
        let listener = core
            .add_listener_local()
            .error(move |id, seq, res, message| {
                warn!(id, seq, res, message, "pipewire error");
                if id == pipewire::core::PW_ID_CORE && res == -32 {
                    error!("pipewire connection lost");
                    let _ = events_.send(PwEvent::FatalError);
                }
            })
            .register();
        std::mem::forget(listener);

        debug!("pipewire connected");

        Ok(Self {
            main_loop,
            _context: context,
            core,
            streams: HashMap::new(),
            events,
        })
    }

    /// Run one bounded iteration of the PipeWire loop on the calling thread.
    pub fn iterate(&self, timeout: Duration) {
        self.main_loop.loop_().iterate(timeout);
    }

    pub fn stream(&self, session: SessionKey) -> Option<&PwStream> {
        self.streams.get(&session)
    }

    /// Pull the next writable buffer. Leaves `current` unset when the
    /// consumer has every buffer in flight; the session retries.
    pub fn dequeue(&mut self, session: SessionKey) {
        let Some(stream) = self.streams.get(&session) else {
            error!("attempted dequeue on a session without a stream");
            return;
        };

        let raw = unsafe { pipewire::sys::pw_stream_dequeue_buffer(stream.stream.as_raw_ptr()) };
        if raw.is_null() {
            trace!("dequeue returned no buffer");
            stream.shared.current.set(None);
        } else {
            stream.shared.current.set(Some(raw as usize));
        }
    }

    /// Queue the currently dequeued buffer back to the consumer with frame
    /// metadata filled in.
    pub fn enqueue(&mut self, session: SessionKey, sharing: &SharingData, needs_transform: bool) {
        let Some(stream) = self.streams.get(&session) else {
            error!("attempted enqueue on a session without a stream");
            return;
        };
        let shared = &stream.shared;

        let Some(raw) = shared.current.get() else {
            error!("no dequeued buffer in enqueue");
            return;
        };
        let pw_buffer = raw as *mut pipewire::sys::pw_buffer;

        let corrupt = sharing.status != FrameStatus::Ready;
        if corrupt {
            trace!("enqueuing corrupt frame");
        }

        unsafe {
            let spa_buffer = (*pw_buffer).buffer;

            if let Some(header) =
                find_meta::<spa_sys::spa_meta_header>(spa_buffer, spa_sys::SPA_META_Header)
            {
                (*header).pts = sharing.timestamp_ns as i64;
                (*header).flags = if corrupt {
                    spa_sys::SPA_META_HEADER_FLAG_CORRUPTED
                } else {
                    0
                };
                (*header).seq = shared.seq.get();
                (*header).dts_offset = 0;
                shared.seq.set(shared.seq.get() + 1);
            }

            if let Some(video_transform) = find_meta::<spa_sys::spa_meta_videotransform>(
                spa_buffer,
                spa_sys::SPA_META_VideoTransform,
            ) {
                // A frame the renderer already rotated is upright; otherwise
                // the consumer gets the compositor's transform to apply.
                (*video_transform).transform = if needs_transform {
                    0
                } else {
                    sharing.transform.into()
                };
            }

            write_damage_meta(spa_buffer, sharing);

            let datas = (*spa_buffer).datas;
            for plane in 0..(*spa_buffer).n_datas as usize {
                let chunk = (*datas.add(plane)).chunk;
                (*chunk).flags = if corrupt {
                    spa_sys::SPA_CHUNK_FLAG_CORRUPTED as i32
                } else {
                    spa_sys::SPA_CHUNK_FLAG_NONE as i32
                };
            }

            pipewire::sys::pw_stream_queue_buffer(stream.stream.as_raw_ptr(), pw_buffer);
        }

        shared.current.set(None);
    }

    /// Rebuild and push the format parameter set after session geometry or
    /// format changed.
    pub fn update_stream_params(&mut self, session: SessionKey) {
        let Some(stream) = self.streams.get(&session) else {
            return;
        };
        trace!("updating stream params");
        stream.push_params();
    }

    /// Tear the session's stream down, closing every buffer exactly once.
    pub fn destroy_stream(&mut self, session: SessionKey) {
        let Some(stream) = self.streams.remove(&session) else {
            return;
        };
        debug!(session, "destroying stream");

        if let Err(err) = stream.stream.disconnect() {
            warn!("error disconnecting stream: {err}");
        }

        // remove_buffer fires during disconnect; anything left closes here.
        stream.shared.buffers.borrow_mut().clear();
        stream.shared.current.set(None);
    }
}

/// Walk a spa_buffer's metadata array for an entry of the given type with
/// room for `T`.
unsafe fn find_meta<T>(buffer: *mut spa_sys::spa_buffer, kind: u32) -> Option<*mut T> {
    let metas = (*buffer).metas;
    for index in 0..(*buffer).n_metas as usize {
        let meta = metas.add(index);
        if (*meta).type_ == kind && (*meta).size as usize >= std::mem::size_of::<T>() {
            return Some((*meta).data.cast());
        }
    }
    None
}

/// Write the session's damage rectangles as in-band SPA regions: up to the
/// slots the consumer gave us, zero-terminated, whole-frame on overflow.
unsafe fn write_damage_meta(buffer: *mut spa_sys::spa_buffer, sharing: &SharingData) {
    let metas = (*buffer).metas;
    let mut damage_meta = None;
    for index in 0..(*buffer).n_metas as usize {
        let meta = metas.add(index);
        if (*meta).type_ == spa_sys::SPA_META_VideoDamage {
            damage_meta = Some(meta);
            break;
        }
    }
    let Some(meta) = damage_meta else {
        return;
    };

    let slots = (*meta).size as usize / std::mem::size_of::<spa_sys::spa_meta_region>();
    if slots == 0 {
        return;
    }
    let regions = (*meta).data.cast::<spa_sys::spa_meta_region>();

    let count = sharing.damage_count.min(sharing.damage.len() as u32) as usize;

    for slot in 0..slots {
        let region = regions.add(slot);
        if slot >= count {
            // Terminator.
            (*region).region = make_region(0, 0, 0, 0);
            break;
        }
        let rect = sharing.damage[slot];
        (*region).region = make_region(rect.x, rect.y, rect.w, rect.h);
    }

    if count > slots {
        // More rectangles than the consumer gave slots for: damage the
        // whole frame instead.
        (*regions).region = make_region(
            0,
            0,
            sharing.frame_info_dma.width as i32,
            sharing.frame_info_dma.height as i32,
        );
    }
}

fn make_region(x: i32, y: i32, width: i32, height: i32) -> spa_sys::spa_region {
    spa_sys::spa_region {
        position: spa_sys::spa_point { x, y },
        size: spa_sys::spa_rectangle {
            width: width as u32,
            height: height as u32,
        },
    }
}
