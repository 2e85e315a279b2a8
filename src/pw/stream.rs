//! Stream creation and format negotiation.
//!
//! A stream is created lazily, once the first compositor frame has reported
//! its buffer parameters, so the opening negotiation already offers the
//! right geometry and formats. Listener closures only see [`StreamShared`]
//! plus captured allocator handles; everything else arrives in the reactor
//! through [`PwEvent`](super::PwEvent).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Cursor;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use anyhow::Context as _;
use calloop::channel::Sender;
use pipewire::properties::properties;
use pipewire::spa::buffer::DataType;
use pipewire::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pipewire::spa::param::format_utils::parse_format;
use pipewire::spa::param::video::{VideoFormat, VideoInfoRaw};
use pipewire::spa::param::ParamType;
use pipewire::spa::pod::deserialize::PodDeserializer;
use pipewire::spa::pod::serialize::PodSerializer;
use pipewire::spa::pod::{self, ChoiceValue, Pod, PodPropFlags, Property, PropertyFlags};
use pipewire::spa::sys as spa_sys;
use pipewire::spa::utils::{Choice, ChoiceEnum, ChoiceFlags, Direction, Fraction, Id, Rectangle, SpaTypes};
use pipewire::stream::{Stream, StreamFlags, StreamListener, StreamState};
use rand::Rng as _;
use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::gbm::GbmDevice;
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use tracing::{debug, trace, warn};
use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::QueueHandle;
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;

use super::{Pipewire, PwEvent};
use crate::buffer::{
    allocate_dmabuf, allocate_shm, find_preferred_modifier, import_dmabuf_wl_buffer,
    import_shm_wl_buffer,
};
use crate::session::{FrameInfoDma, FrameInfoShm, SessionKey};
use crate::state::State;
use crate::utils::{pw_format_from_fourcc, pw_strip_alpha};

/// Sentinel written to a DMA plane whose chunk size would be zero; some
/// clients treat a zero chunk size as an invalid buffer instead of checking
/// the flags.
const DMA_CHUNK_SIZE_SENTINEL: u32 = 9;

/// Geometry and format information the listener closures need to build
/// parameter pods and allocate buffers. A snapshot of the session's frame
/// info, refreshed on renegotiation.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub dma: FrameInfoDma,
    pub shm: FrameInfoShm,
    pub framerate: u32,
    pub target_width: u32,
    pub target_height: u32,
    /// Modifiers the compositor advertises for `dma.fourcc`.
    pub modifiers: Vec<Modifier>,
}

/// A single ring-buffer entry. Owns every fd it carries until removal.
#[derive(Debug)]
pub struct Buffer {
    pub is_dmabuf: bool,
    pub width: u32,
    pub height: u32,
    pub fourcc: Fourcc,
    pub plane_count: usize,
    pub dmabuf: Option<Dmabuf>,
    pub shm_fd: Option<OwnedFd>,
    pub wl_buffer: WlBuffer,
    pub size: [u32; 4],
    pub stride: [u32; 4],
    pub offset: [u32; 4],
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Plane fds close with the Dmabuf / OwnedFd they live in.
        self.wl_buffer.destroy();
    }
}

/// State shared between the reactor and the stream listener closures.
pub struct StreamShared {
    pub session: SessionKey,
    pub node_id: Cell<u32>,
    pub streaming: Cell<bool>,
    pub is_dma: Cell<bool>,
    pub have_format: Cell<bool>,
    pub video_info: RefCell<VideoInfoRaw>,
    pub params: RefCell<StreamParams>,
    /// Live ring buffers, keyed by the pw_buffer pointer.
    pub buffers: RefCell<HashMap<usize, Buffer>>,
    /// Currently dequeued pw_buffer, if any. Always a key of `buffers`.
    pub current: Cell<Option<usize>>,
    pub seq: Cell<u64>,
}

pub struct PwStream {
    pub stream: Stream,
    _listener: StreamListener<()>,
    pub shared: Rc<StreamShared>,
}

impl PwStream {
    /// Serialize and push the current negotiation parameter set.
    pub fn push_params(&self) {
        let objects = build_format_params(&self.shared.params.borrow());
        let mut bytes = vec![Vec::new(); objects.len()];
        let mut pods: Vec<&Pod> = Vec::new();
        for (object, buffer) in objects.into_iter().zip(bytes.iter_mut()) {
            pods.push(make_pod(buffer, object));
        }
        if let Err(err) = self.stream.update_params(&mut pods) {
            warn!("error updating stream params: {err}");
        }
    }
}

impl Pipewire {
    /// Create the per-session producer stream and start negotiation.
    #[allow(clippy::too_many_arguments)]
    pub fn create_stream(
        &mut self,
        session: SessionKey,
        params: StreamParams,
        gbm: Option<GbmDevice<DrmDeviceFd>>,
        qh: QueueHandle<State>,
        linux_dmabuf: Option<ZwpLinuxDmabufV1>,
        shm: Option<WlShm>,
    ) -> anyhow::Result<u32> {
        let name = format!("hyprcast-streaming-{:08x}", rand::thread_rng().gen::<u32>());
        debug!(session, name, "creating stream");

        let stream = Stream::new(
            &self.core,
            &name,
            properties! { *pipewire::keys::MEDIA_CLASS => "Video/Source" },
        )
        .context("pipewire refused to create a stream")?;

        let shared = Rc::new(StreamShared {
            session,
            node_id: Cell::new(spa_sys::SPA_ID_INVALID),
            streaming: Cell::new(false),
            is_dma: Cell::new(false),
            have_format: Cell::new(false),
            video_info: RefCell::new(VideoInfoRaw::new()),
            params: RefCell::new(params),
            buffers: RefCell::new(HashMap::new()),
            current: Cell::new(None),
            seq: Cell::new(0),
        });

        let listener = stream
            .add_local_listener_with_user_data(())
            .state_changed({
                let shared = shared.clone();
                let events = self.events.clone();
                move |stream, (), old, new| {
                    trace!(session = shared.session, "stream state: {old:?} -> {new:?}");
                    shared.node_id.set(stream.node_id());

                    let event = match new {
                        StreamState::Streaming => {
                            shared.streaming.set(true);
                            Some(PwEvent::Streaming { session: shared.session })
                        }
                        StreamState::Paused => {
                            shared.streaming.set(false);
                            Some(PwEvent::Paused { session: shared.session })
                        }
                        StreamState::Error(_) => {
                            shared.streaming.set(false);
                            Some(PwEvent::Error { session: shared.session })
                        }
                        StreamState::Unconnected => {
                            shared.streaming.set(false);
                            Some(PwEvent::Unconnected { session: shared.session })
                        }
                        StreamState::Connecting => None,
                    };
                    if let Some(event) = event {
                        let _ = events.send(event);
                    }
                }
            })
            .param_changed({
                let shared = shared.clone();
                let events = self.events.clone();
                let gbm = gbm.clone();
                move |stream, (), id, pod| {
                    if ParamType::from_raw(id) != ParamType::Format {
                        return;
                    }
                    let Some(pod) = pod else { return };

                    let (media_type, media_subtype) = match parse_format(pod) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            warn!("error parsing format: {err:?}");
                            return;
                        }
                    };
                    if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
                        return;
                    }

                    let mut format = VideoInfoRaw::new();
                    if let Err(err) = format.parse(pod) {
                        warn!("error parsing video format: {err:?}");
                        return;
                    }
                    trace!(session = shared.session, "pw format: {format:?}");

                    *shared.video_info.borrow_mut() = format;
                    shared.have_format.set(true);

                    let framerate = {
                        let rate = format.max_framerate();
                        if rate.denom > 0 { rate.num / rate.denom } else { 0 }
                    };
                    if framerate > 0 && framerate != shared.params.borrow().framerate {
                        shared.params.borrow_mut().framerate = framerate;
                        let _ = events.send(PwEvent::FramerateChanged {
                            session: shared.session,
                            framerate,
                        });
                    }

                    let object = pod.as_object().unwrap();
                    let modifier_prop =
                        object.find_prop(Id(FormatProperties::VideoModifier.0));

                    let Some(prop) = modifier_prop else {
                        // SHM negotiation.
                        shared.is_dma.set(false);
                        push_buffer_params(stream, 1, DataType::MemFd);
                        return;
                    };

                    shared.is_dma.set(true);
                    let Some(gbm) = gbm.as_ref() else {
                        warn!("dmabuf negotiated without a GPU device");
                        return;
                    };

                    let (dma_w, dma_h, dma_fourcc) = {
                        let params = shared.params.borrow();
                        let Some(fourcc) = params.dma.fourcc else {
                            warn!("dmabuf negotiated without a dma format");
                            return;
                        };
                        (params.dma.width, params.dma.height, fourcc)
                    };

                    if prop.flags().contains(PodPropFlags::DONT_FIXATE) {
                        trace!("fixating modifier");

                        let pod_modifier = prop.value();
                        let Ok((_, modifiers)) = PodDeserializer::deserialize_from::<Choice<i64>>(
                            pod_modifier.as_bytes(),
                        ) else {
                            warn!("wrong modifier property type");
                            return;
                        };
                        let ChoiceEnum::Enum { alternatives, .. } = modifiers.1 else {
                            warn!("wrong modifier choice type");
                            return;
                        };

                        let candidates: Vec<Modifier> = alternatives
                            .iter()
                            .map(|&m| Modifier::from(m as u64))
                            .collect();

                        let modifier = match find_preferred_modifier(
                            gbm, dma_w, dma_h, dma_fourcc, &candidates,
                        ) {
                            Ok((modifier, _planes)) => modifier,
                            Err(err) => {
                                warn!("failed to alloc dma: {err}");
                                return;
                            }
                        };

                        // Feed back the fixated choice plus the full set so
                        // negotiation can restart if the consumer disagrees.
                        let params = shared.params.borrow();
                        let mut objects = vec![build_format(
                            pw_format_from_fourcc(dma_fourcc).unwrap_or(VideoFormat::BGRx),
                            params.target_width,
                            params.target_height,
                            params.framerate,
                            ModifierSpec::Fixated(modifier),
                        )];
                        objects.extend(build_format_params(&params));

                        let mut bytes = vec![Vec::new(); objects.len()];
                        let mut pods: Vec<&Pod> = Vec::new();
                        for (object, buffer) in objects.into_iter().zip(bytes.iter_mut()) {
                            pods.push(make_pod(buffer, object));
                        }
                        if let Err(err) = stream.update_params(&mut pods) {
                            warn!("error updating fixated params: {err}");
                        }
                        return;
                    }

                    // Modifier already fixated: announce buffer layout.
                    let plane_count = match find_preferred_modifier(
                        gbm,
                        dma_w,
                        dma_h,
                        dma_fourcc,
                        &[Modifier::from(format.modifier())],
                    ) {
                        Ok((_modifier, planes)) => planes,
                        Err(err) => {
                            warn!("test allocation failed: {err}");
                            return;
                        }
                    };
                    push_buffer_params(stream, plane_count as i32, DataType::DmaBuf);
                }
            })
            .add_buffer({
                let shared = shared.clone();
                let events = self.events.clone();
                let gbm = gbm.clone();
                let qh = qh.clone();
                let linux_dmabuf = linux_dmabuf.clone();
                let shm = shm.clone();
                move |_stream, (), pw_buffer| {
                    trace!(session = shared.session, "add_buffer");
                    match allocate_stream_buffer(&shared, &gbm, &qh, &linux_dmabuf, &shm, pw_buffer)
                    {
                        Ok(buffer) => {
                            shared.buffers.borrow_mut().insert(pw_buffer as usize, buffer);
                            if shared.streaming.get() {
                                let _ = events.send(PwEvent::BuffersAvailable {
                                    session: shared.session,
                                });
                            }
                        }
                        Err(err) => warn!("error adding stream buffer: {err}"),
                    }
                }
            })
            .remove_buffer({
                let shared = shared.clone();
                move |_stream, (), pw_buffer| {
                    trace!(session = shared.session, "remove_buffer");
                    if shared.current.get() == Some(pw_buffer as usize) {
                        shared.current.set(None);
                    }
                    shared.buffers.borrow_mut().remove(&(pw_buffer as usize));
                    unsafe {
                        let spa_buffer = (*pw_buffer).buffer;
                        let datas = (*spa_buffer).datas;
                        for plane in 0..(*spa_buffer).n_datas as usize {
                            (*datas.add(plane)).fd = -1;
                        }
                    }
                }
            })
            .register()
            .context("error registering stream listener")?;

        // Opening offer.
        let objects = build_format_params(&shared.params.borrow());
        let mut bytes = vec![Vec::new(); objects.len()];
        let mut pods: Vec<&Pod> = Vec::new();
        for (object, buffer) in objects.into_iter().zip(bytes.iter_mut()) {
            pods.push(make_pod(buffer, object));
        }

        stream
            .connect(
                Direction::Output,
                None,
                StreamFlags::DRIVER | StreamFlags::ALLOC_BUFFERS,
                &mut pods,
            )
            .context("error connecting stream")?;

        shared.node_id.set(stream.node_id());
        let node_id = shared.node_id.get();

        self.streams.insert(
            session,
            PwStream {
                stream,
                _listener: listener,
                shared,
            },
        );

        Ok(node_id)
    }
}

/// Allocate backing for a freshly added ring buffer and populate its
/// spa_data planes.
fn allocate_stream_buffer(
    shared: &StreamShared,
    gbm: &Option<GbmDevice<DrmDeviceFd>>,
    qh: &QueueHandle<State>,
    linux_dmabuf: &Option<ZwpLinuxDmabufV1>,
    shm: &Option<WlShm>,
    pw_buffer: *mut pipewire::sys::pw_buffer,
) -> anyhow::Result<Buffer> {
    let (spa_buffer, n_datas, first_type) = unsafe {
        let spa_buffer = (*pw_buffer).buffer;
        let datas = (*spa_buffer).datas;
        ((*pw_buffer).buffer, (*spa_buffer).n_datas as usize, (*datas).type_)
    };

    let data_type = if first_type & (1 << DataType::DmaBuf.as_raw()) > 0 {
        DataType::DmaBuf
    } else if first_type & (1 << DataType::MemFd.as_raw()) > 0 {
        warn!("consumer asked for a legacy wl_shm-style buffer");
        DataType::MemFd
    } else {
        anyhow::bail!("unsupported data type mask {first_type:#x} in add_buffer");
    };

    let params = shared.params.borrow();

    let record = if data_type == DataType::DmaBuf {
        let gbm = gbm.as_ref().context("no GPU device for dmabuf buffer")?;
        let linux_dmabuf = linux_dmabuf.as_ref().context("no linux-dmabuf global")?;
        let fourcc = params.dma.fourcc.context("no dma format")?;
        let modifier = Modifier::from(shared.video_info.borrow().modifier());

        let dmabuf = allocate_dmabuf(gbm, params.dma.width, params.dma.height, fourcc, modifier)?;
        let wl_buffer = import_dmabuf_wl_buffer(qh, linux_dmabuf, &dmabuf);

        let mut buffer = Buffer {
            is_dmabuf: true,
            width: params.dma.width,
            height: params.dma.height,
            fourcc,
            plane_count: dmabuf.num_planes(),
            dmabuf: Some(dmabuf),
            shm_fd: None,
            wl_buffer,
            size: [0; 4],
            stride: [0; 4],
            offset: [0; 4],
        };
        let dmabuf = buffer.dmabuf.as_ref().unwrap();
        for (plane, (stride, offset)) in
            dmabuf.strides().zip(dmabuf.offsets()).enumerate().take(4)
        {
            buffer.stride[plane] = stride;
            buffer.offset[plane] = offset;
        }
        buffer
    } else {
        let shm = shm.as_ref().context("no wl_shm global")?;
        let fourcc = params.shm.fourcc.context("no shm format")?;
        let size = params.shm.size;

        let fd = allocate_shm(size as usize)?;
        let wl_buffer = import_shm_wl_buffer(
            qh,
            shm,
            &fd,
            fourcc,
            params.shm.width,
            params.shm.height,
            params.shm.stride,
        );

        Buffer {
            is_dmabuf: false,
            width: params.shm.width,
            height: params.shm.height,
            fourcc,
            plane_count: 1,
            dmabuf: None,
            shm_fd: Some(fd),
            wl_buffer,
            size: [size, 0, 0, 0],
            stride: [params.shm.stride, 0, 0, 0],
            offset: [0; 4],
        }
    };

    let fds: Vec<i64> = match (&record.dmabuf, &record.shm_fd) {
        (Some(dmabuf), _) => dmabuf.handles().map(|fd| fd.as_raw_fd() as i64).collect(),
        (None, Some(fd)) => vec![fd.as_raw_fd() as i64],
        _ => unreachable!(),
    };

    unsafe {
        let datas = (*spa_buffer).datas;
        for plane in 0..n_datas.min(record.plane_count).min(4) {
            let data = datas.add(plane);
            (*data).type_ = data_type.as_raw();
            (*data).maxsize = record.size[plane];
            (*data).mapoffset = 0;
            (*data).flags = spa_sys::SPA_DATA_FLAG_READWRITE;
            (*data).fd = fds[plane];
            (*data).data = std::ptr::null_mut();

            let chunk = (*data).chunk;
            (*chunk).size = record.size[plane];
            (*chunk).stride = record.stride[plane] as i32;
            (*chunk).offset = record.offset[plane];
            // Clients check chunk->size to decide whether the buffer is
            // valid instead of the flags; keep it nonzero for dma planes.
            if record.is_dmabuf && (*chunk).size == 0 {
                (*chunk).size = DMA_CHUNK_SIZE_SENTINEL;
            }
        }
    }

    Ok(record)
}

/// Push the SPA buffer-layout parameter after format negotiation settled.
fn push_buffer_params(stream: &pipewire::stream::StreamRef, blocks: i32, data_type: DataType) {
    let object = pod::object!(
        SpaTypes::ObjectParamBuffers,
        ParamType::Buffers,
        Property::new(
            spa_sys::SPA_PARAM_BUFFERS_buffers,
            pod::Value::Choice(ChoiceValue::Int(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Range { default: 4, min: 2, max: 16 }
            ))),
        ),
        Property::new(spa_sys::SPA_PARAM_BUFFERS_blocks, pod::Value::Int(blocks)),
        Property::new(
            spa_sys::SPA_PARAM_BUFFERS_dataType,
            pod::Value::Choice(ChoiceValue::Int(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Flags {
                    default: 1 << data_type.as_raw(),
                    flags: vec![1 << data_type.as_raw()],
                },
            ))),
        ),
    );

    let meta_header = pod::object!(
        SpaTypes::ObjectParamMeta,
        ParamType::Meta,
        Property::new(
            spa_sys::SPA_PARAM_META_type,
            pod::Value::Id(Id(spa_sys::SPA_META_Header)),
        ),
        Property::new(
            spa_sys::SPA_PARAM_META_size,
            pod::Value::Int(std::mem::size_of::<spa_sys::spa_meta_header>() as i32),
        ),
    );

    let meta_transform = pod::object!(
        SpaTypes::ObjectParamMeta,
        ParamType::Meta,
        Property::new(
            spa_sys::SPA_PARAM_META_type,
            pod::Value::Id(Id(spa_sys::SPA_META_VideoTransform)),
        ),
        Property::new(
            spa_sys::SPA_PARAM_META_size,
            pod::Value::Int(std::mem::size_of::<spa_sys::spa_meta_videotransform>() as i32),
        ),
    );

    let region = std::mem::size_of::<spa_sys::spa_meta_region>() as i32;
    let meta_damage = pod::object!(
        SpaTypes::ObjectParamMeta,
        ParamType::Meta,
        Property::new(
            spa_sys::SPA_PARAM_META_type,
            pod::Value::Id(Id(spa_sys::SPA_META_VideoDamage)),
        ),
        Property::new(
            spa_sys::SPA_PARAM_META_size,
            pod::Value::Choice(ChoiceValue::Int(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Range { default: 4 * region, min: region, max: 4 * region }
            ))),
        ),
    );

    let objects = [object, meta_header, meta_transform, meta_damage];
    let mut bytes = vec![Vec::new(); objects.len()];
    let mut pods: Vec<&Pod> = Vec::new();
    for (object, buffer) in objects.into_iter().zip(bytes.iter_mut()) {
        pods.push(make_pod(buffer, object));
    }
    if let Err(err) = stream.update_params(&mut pods) {
        warn!("error updating buffer params: {err}");
    }
}

enum ModifierSpec<'a> {
    None,
    Candidates(&'a [Modifier]),
    Fixated(Modifier),
}

/// One EnumFormat pod: format + optional modifier spec + geometry + rates.
fn build_format(
    video_format: VideoFormat,
    width: u32,
    height: u32,
    framerate: u32,
    modifiers: ModifierSpec<'_>,
) -> pod::Object {
    let mut properties = vec![
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(FormatProperties::VideoFormat, Id, video_format),
    ];

    match modifiers {
        ModifierSpec::None => {}
        ModifierSpec::Candidates(candidates) if candidates.is_empty() => {}
        ModifierSpec::Candidates(candidates) => {
            let values: Vec<i64> = candidates.iter().map(|&m| u64::from(m) as i64).collect();
            properties.push(Property {
                key: FormatProperties::VideoModifier.as_raw(),
                flags: PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE,
                value: pod::Value::Choice(ChoiceValue::Long(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Enum { default: values[0], alternatives: values },
                ))),
            });
        }
        ModifierSpec::Fixated(modifier) => {
            properties.push(Property {
                key: FormatProperties::VideoModifier.as_raw(),
                flags: PropertyFlags::MANDATORY,
                value: pod::Value::Long(u64::from(modifier) as i64),
            });
        }
    }

    properties.extend([
        pod::property!(
            FormatProperties::VideoSize,
            Rectangle,
            Rectangle { width, height }
        ),
        pod::property!(
            FormatProperties::VideoFramerate,
            Fraction,
            Fraction { num: 0, denom: 1 }
        ),
        pod::property!(
            FormatProperties::VideoMaxFramerate,
            Choice,
            Range,
            Fraction,
            Fraction { num: framerate, denom: 1 },
            Fraction { num: 1, denom: 1 },
            Fraction { num: framerate, denom: 1 }
        ),
    ]);

    pod::Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    }
}

/// The negotiation offer: DMA format with the advertised modifiers when the
/// GPU path is available, always followed by the plain SHM format.
pub fn build_format_params(params: &StreamParams) -> Vec<pod::Object> {
    let mut objects = Vec::new();

    if let Some(dma_format) = params.dma.fourcc.and_then(pw_format_from_fourcc) {
        if !params.modifiers.is_empty() {
            objects.push(build_format(
                dma_format,
                params.target_width,
                params.target_height,
                params.framerate,
                ModifierSpec::Candidates(&params.modifiers),
            ));
        }
    }

    let shm_format = params
        .shm
        .fourcc
        .and_then(pw_format_from_fourcc)
        .unwrap_or(VideoFormat::BGRx);
    objects.push(build_format(
        shm_format,
        params.target_width,
        params.target_height,
        params.framerate,
        ModifierSpec::None,
    ));

    objects
}

/// Does the negotiated video format accept this fourcc, allowing the
/// alpha-stripped variant.
pub fn format_matches(negotiated: VideoFormat, fourcc: Fourcc) -> bool {
    let Some(wire) = pw_format_from_fourcc(fourcc) else {
        return false;
    };
    negotiated == wire || negotiated == pw_strip_alpha(wire)
}

fn make_pod(buffer: &mut Vec<u8>, object: pod::Object) -> &Pod {
    PodSerializer::serialize(Cursor::new(&mut *buffer), &pod::Value::Object(object)).unwrap();
    Pod::from_bytes(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(with_dma: bool, with_modifiers: bool) -> StreamParams {
        StreamParams {
            dma: FrameInfoDma {
                width: 1920,
                height: 1080,
                fourcc: with_dma.then_some(Fourcc::Xrgb8888),
            },
            shm: FrameInfoShm {
                width: 1920,
                height: 1080,
                size: 1920 * 4 * 1080,
                stride: 1920 * 4,
                fourcc: Some(Fourcc::Xrgb8888),
            },
            framerate: 60,
            target_width: 1920,
            target_height: 1080,
            modifiers: if with_modifiers {
                vec![Modifier::Linear, Modifier::Invalid]
            } else {
                Vec::new()
            },
        }
    }

    #[test]
    fn test_offer_includes_dma_and_shm() {
        let objects = build_format_params(&params(true, true));
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn test_offer_shm_only_without_modifiers() {
        let objects = build_format_params(&params(true, false));
        assert_eq!(objects.len(), 1);
        let objects = build_format_params(&params(false, true));
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_format_matches_strip_alpha() {
        assert!(format_matches(VideoFormat::BGRx, Fourcc::Xrgb8888));
        assert!(format_matches(VideoFormat::BGRx, Fourcc::Argb8888));
        assert!(format_matches(VideoFormat::BGRA, Fourcc::Argb8888));
        assert!(!format_matches(VideoFormat::RGBx, Fourcc::Xrgb8888));
    }

    #[test]
    fn test_pods_serialize() {
        let objects = build_format_params(&params(true, true));
        for object in objects {
            let mut buffer = Vec::new();
            let pod = make_pod(&mut buffer, object);
            assert!(pod.size() > 0);
        }
    }
}
