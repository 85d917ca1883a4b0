use std::ffi::{CStr, CString, c_void};
use std::ptr::{NonNull, null, null_mut};
use std::sync::Arc;

use ffmpeg_next::ffi::{
    AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX, AV_CODEC_HW_CONFIG_METHOD_HW_FRAMES_CTX, AVBufferRef,
    AVCodec, AVCodecContext, AVHWDeviceType, AVHWFramesContext, AVPixelFormat, av_buffer_ref,
    av_buffer_unref, av_frame_copy_props, av_hwdevice_ctx_create, av_hwdevice_find_type_by_name,
    av_hwdevice_get_type_name, av_hwdevice_iterate_types, av_hwframe_ctx_alloc,
    av_hwframe_ctx_init, av_hwframe_get_buffer, av_hwframe_transfer_data, avcodec_default_get_format,
    avcodec_get_hw_config,
};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;
use tracing::{debug, warn};

use super::error::{MediaError, Result, check};

/// Names of every hardware device type this ffmpeg build supports.
pub fn available_device_types() -> Vec<String> {
    let mut names = Vec::new();
    let mut device_type = AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        device_type = unsafe { av_hwdevice_iterate_types(device_type) };
        if device_type == AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            break;
        }
        names.push(device_type_name(device_type));
    }
    names
}

fn device_type_name(device_type: AVHWDeviceType) -> String {
    unsafe {
        let name = av_hwdevice_get_type_name(device_type);
        if name.is_null() {
            return "unknown".to_string();
        }
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

/// Looks a device type up by name, listing the available ones on failure.
pub fn find_device_type(name: &str) -> Result<AVHWDeviceType> {
    let not_supported = || MediaError::HwDeviceNotSupported {
        name: name.to_string(),
        available: available_device_types(),
    };
    let c_name = CString::new(name).map_err(|_| not_supported())?;
    let device_type = unsafe { av_hwdevice_find_type_by_name(c_name.as_ptr()) };
    if device_type == AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
        let error = not_supported();
        warn!(%error, "Unknown hardware device type");
        return Err(error);
    }
    Ok(device_type)
}

/// Which codec hardware configuration method a lookup requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwMethod {
    DeviceContext,
    FramesContext,
}

impl HwMethod {
    fn flag(self) -> u32 {
        match self {
            HwMethod::DeviceContext => AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32,
            HwMethod::FramesContext => AV_CODEC_HW_CONFIG_METHOD_HW_FRAMES_CTX as u32,
        }
    }
}

/// Finds the hardware pixel format `codec` uses with `device_type`.
///
/// # Safety
/// `codec` must point to a registered codec.
pub(crate) unsafe fn find_hw_pix_fmt(
    codec: *const AVCodec,
    device_type: AVHWDeviceType,
    method: HwMethod,
) -> Option<AVPixelFormat> {
    let mut index = 0;
    loop {
        let config = unsafe { avcodec_get_hw_config(codec, index) };
        if config.is_null() {
            return None;
        }
        unsafe {
            if (*config).methods as u32 & method.flag() != 0 && (*config).device_type == device_type
            {
                return Some((*config).pix_fmt);
            }
        }
        index += 1;
    }
}

/// Reference-counted hardware device context.
///
/// Codec contexts keep their own native reference; holding the `Arc` in the
/// owning engine keeps the device alive for as long as any of them.
pub struct HwDevice {
    buffer: NonNull<AVBufferRef>,
    device_type: AVHWDeviceType,
}

// SAFETY: device contexts are internally synchronised by ffmpeg and only
// handed out as new references.
unsafe impl Send for HwDevice {}
unsafe impl Sync for HwDevice {}

impl HwDevice {
    pub fn create(name: &str) -> Result<Arc<Self>> {
        let device_type = find_device_type(name)?;
        let mut buffer = null_mut();
        let ret = unsafe { av_hwdevice_ctx_create(&mut buffer, device_type, null(), null_mut(), 0) };
        check(ret).map_err(|e| MediaError::decode(format!("create {name} device"), e))?;
        let buffer = NonNull::new(buffer)
            .ok_or_else(|| MediaError::setup(format!("Hardware device {name} returned no context")))?;
        debug!(name, "Hardware device created");
        Ok(Arc::new(Self {
            buffer,
            device_type,
        }))
    }

    pub fn device_type(&self) -> AVHWDeviceType {
        self.device_type
    }

    pub fn name(&self) -> String {
        device_type_name(self.device_type)
    }

    /// New native reference for a codec context to own.
    pub(crate) fn new_ref(&self) -> Result<*mut AVBufferRef> {
        let reference = unsafe { av_buffer_ref(self.buffer.as_ptr()) };
        if reference.is_null() {
            return Err(MediaError::setup("Could not reference hardware device"));
        }
        Ok(reference)
    }

    pub(crate) fn as_ptr(&self) -> *mut AVBufferRef {
        self.buffer.as_ptr()
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        let mut buffer = self.buffer.as_ptr();
        unsafe { av_buffer_unref(&mut buffer) }
    }
}

/// Pool of hardware surfaces an encoder uploads into.
pub struct HwFrames {
    buffer: NonNull<AVBufferRef>,
    _device: Arc<HwDevice>,
    hw_format: Pixel,
    sw_format: Pixel,
}

// SAFETY: see `HwDevice`.
unsafe impl Send for HwFrames {}
unsafe impl Sync for HwFrames {}

impl HwFrames {
    pub fn create(
        device: Arc<HwDevice>,
        hw_format: AVPixelFormat,
        sw_format: Pixel,
        width: u32,
        height: u32,
    ) -> Result<Arc<Self>> {
        let buffer = unsafe { av_hwframe_ctx_alloc(device.as_ptr()) };
        let buffer = NonNull::new(buffer)
            .ok_or_else(|| MediaError::setup("Could not allocate hardware frames context"))?;
        unsafe {
            let frames = (*buffer.as_ptr()).data as *mut AVHWFramesContext;
            (*frames).format = hw_format;
            (*frames).sw_format = AVPixelFormat::from(sw_format);
            (*frames).width = width as i32;
            (*frames).height = height as i32;
            (*frames).initial_pool_size = 20;
            if let Err(error) = check(av_hwframe_ctx_init(buffer.as_ptr())) {
                let mut raw = buffer.as_ptr();
                av_buffer_unref(&mut raw);
                return Err(MediaError::encode("initialise hardware frames context", error));
            }
        }
        Ok(Arc::new(Self {
            buffer,
            _device: device,
            hw_format: Pixel::from(hw_format),
            sw_format,
        }))
    }

    pub fn hw_format(&self) -> Pixel {
        self.hw_format
    }

    pub fn sw_format(&self) -> Pixel {
        self.sw_format
    }

    pub(crate) fn new_ref(&self) -> Result<*mut AVBufferRef> {
        let reference = unsafe { av_buffer_ref(self.buffer.as_ptr()) };
        if reference.is_null() {
            return Err(MediaError::setup("Could not reference hardware frames"));
        }
        Ok(reference)
    }

    /// Copies a host frame into a fresh hardware surface.
    pub fn upload(&self, host: &frame::Video) -> Result<frame::Video> {
        let mut surface = frame::Video::empty();
        unsafe {
            check(av_hwframe_get_buffer(self.buffer.as_ptr(), surface.as_mut_ptr(), 0))
                .map_err(|e| MediaError::encode("get hardware surface", e))?;
            check(av_hwframe_transfer_data(surface.as_mut_ptr(), host.as_ptr(), 0))
                .map_err(|e| MediaError::encode("upload frame", e))?;
            check(av_frame_copy_props(surface.as_mut_ptr(), host.as_ptr()))
                .map_err(|e| MediaError::encode("copy frame properties", e))?;
        }
        Ok(surface)
    }
}

impl Drop for HwFrames {
    fn drop(&mut self) {
        let mut buffer = self.buffer.as_ptr();
        unsafe { av_buffer_unref(&mut buffer) }
    }
}

/// Reads a hardware frame back into host memory, keeping its properties.
pub fn download(hw_frame: &frame::Video) -> Result<frame::Video> {
    let mut host = frame::Video::empty();
    unsafe {
        check(av_hwframe_transfer_data(host.as_mut_ptr(), hw_frame.as_ptr(), 0))
            .map_err(|e| MediaError::decode("transfer hardware frame", e))?;
        check(av_frame_copy_props(host.as_mut_ptr(), hw_frame.as_ptr()))
            .map_err(|e| MediaError::decode("copy frame properties", e))?;
    }
    Ok(host)
}

/// Decoder-side hardware state: the shared device and the negotiated
/// pixel format, which the `get_format` callback reads through `opaque`.
pub(crate) struct HwDecode {
    pub(crate) device: Arc<HwDevice>,
    pub(crate) pix_fmt: Box<AVPixelFormat>,
}

impl HwDecode {
    /// Installs the device and format callback on an unopened decoder.
    ///
    /// # Safety
    /// `ctx` must be an unopened codec context for `codec`, and the returned
    /// value must outlive it.
    pub(crate) unsafe fn attach(
        ctx: *mut AVCodecContext,
        codec: *const AVCodec,
        device: Arc<HwDevice>,
    ) -> Result<Self> {
        let pix_fmt = unsafe { find_hw_pix_fmt(codec, device.device_type(), HwMethod::DeviceContext) }
            .ok_or_else(|| {
                let codec_name = unsafe { CStr::from_ptr((*codec).name).to_string_lossy() };
                MediaError::setup(format!(
                    "Decoder {codec_name} does not support device type {}",
                    device.name()
                ))
            })?;
        let mut pix_fmt = Box::new(pix_fmt);
        unsafe {
            (*ctx).opaque = pix_fmt.as_mut() as *mut AVPixelFormat as *mut c_void;
            (*ctx).get_format = Some(negotiate_hw_format);
            (*ctx).hw_device_ctx = device.new_ref()?;
        }
        debug!(device = %device.name(), pix_fmt = ?*pix_fmt, "Hardware decoding enabled");
        Ok(Self { device, pix_fmt })
    }

    pub(crate) fn pixel(&self) -> Pixel {
        Pixel::from(*self.pix_fmt)
    }
}

unsafe extern "C" fn negotiate_hw_format(
    ctx: *mut AVCodecContext,
    pix_fmts: *const AVPixelFormat,
) -> AVPixelFormat {
    unsafe {
        let wanted = *((*ctx).opaque as *const AVPixelFormat);
        let mut current = pix_fmts;
        while *current != AVPixelFormat::AV_PIX_FMT_NONE {
            if *current == wanted {
                return wanted;
            }
            current = current.add(1);
        }
        warn!(?wanted, "Failed to get hardware surface format, using default");
        avcodec_default_get_format(ctx, pix_fmts)
    }
}
