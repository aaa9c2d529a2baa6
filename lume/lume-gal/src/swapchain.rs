//! Presentable back buffers and their depth companion.

use std::sync::{Arc, Mutex};

use crate::backend::NativeHandle;
use crate::error::{GalError, GalResult};
use crate::factory::ResourceFactory;
use crate::format::TextureFormat;
use crate::pipeline::OutputDescription;
use crate::resource::{Resource, ResourceBase};
use crate::state::{ResourceState, SubmissionToken, Tracked};
use crate::texture::{Texture, TextureDescriptor, TextureUsage};

/// Native window a swapchain presents to.
#[cfg(feature = "window")]
#[derive(Debug, Clone, Copy)]
pub struct WindowSurface {
    pub(crate) window: raw_window_handle::RawWindowHandle,
    pub(crate) display: raw_window_handle::RawDisplayHandle,
}

#[cfg(feature = "window")]
impl WindowSurface {
    /// # Safety
    ///
    /// Both handles must stay valid until every swapchain created from this
    /// surface has been disposed.
    pub unsafe fn new(
        window: raw_window_handle::RawWindowHandle,
        display: raw_window_handle::RawDisplayHandle,
    ) -> Self {
        Self { window, display }
    }
}

// SAFETY: the handles are only dereferenced by the backend while creating a
// surface, and `WindowSurface::new` requires them to outlive the swapchain.
#[cfg(feature = "window")]
unsafe impl Send for WindowSurface {}
#[cfg(feature = "window")]
unsafe impl Sync for WindowSurface {}

#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    /// Offscreen images cycled by presentation, for tests and tools.
    Headless,
    #[cfg(feature = "window")]
    Window(WindowSurface),
}

#[derive(Debug, Clone)]
pub struct SwapchainDescriptor {
    pub label: Option<&'static str>,
    pub surface: SurfaceTarget,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Requested back buffer count; the backend may round it to what the surface supports.
    pub image_count: u32,
    pub depth_format: Option<TextureFormat>,
    pub vsync: bool,
}

impl Default for SwapchainDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            surface: SurfaceTarget::Headless,
            width: 1,
            height: 1,
            format: TextureFormat::Bgra8Unorm,
            image_count: 3,
            depth_format: Some(TextureFormat::D32Float),
            vsync: true,
        }
    }
}

/// What the backend needs to (re)create native swapchain images.
#[derive(Debug, Clone)]
pub struct SwapchainConfig {
    pub surface: SurfaceTarget,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub image_count: u32,
    pub vsync: bool,
}

/// Native swapchain as created by the backend. `images` are texture handles the
/// backend does not own separately from the swapchain.
#[derive(Debug, Clone)]
pub struct NativeSwapchain {
    pub handle: NativeHandle,
    pub images: Vec<NativeHandle>,
    pub format: TextureFormat,
    pub extent: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapchainState {
    Created,
    Presenting,
    Resizing,
    Destroyed,
}

struct Frames {
    config: SwapchainConfig,
    native: NativeSwapchain,
    back_buffers: Vec<Arc<Texture>>,
    depth: Option<Arc<Texture>>,
    state: SwapchainState,
    acquired: Option<u32>,
}

/// Back buffers plus a depth texture, recreated on resize.
///
/// Resizing does not track external references: bindings holding old back
/// buffers must be refreshed by their owner after a resize.
pub struct Swapchain {
    base: ResourceBase,
    factory: ResourceFactory,
    depth_format: Option<TextureFormat>,
    frames: Mutex<Frames>,
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frames = self.lock();
        f.debug_struct("Swapchain")
            .field("id", &self.base.id())
            .field("extent", &frames.native.extent)
            .field("images", &frames.back_buffers.len())
            .field("state", &frames.state)
            .finish_non_exhaustive()
    }
}

fn validate(desc: &SwapchainDescriptor) -> GalResult<()> {
    if desc.width == 0 || desc.height == 0 {
        return Err(GalError::descriptor(format!(
            "swapchain extent {}x{} has a zero dimension",
            desc.width, desc.height
        )));
    }
    if desc.format.is_depth() {
        return Err(GalError::descriptor(format!(
            "{:?} is not a presentable color format",
            desc.format
        )));
    }
    if !(1..=8).contains(&desc.image_count) {
        return Err(GalError::descriptor(format!(
            "{} back buffers requested, expected 1..=8",
            desc.image_count
        )));
    }
    if let Some(depth) = desc.depth_format {
        if !depth.is_depth() {
            return Err(GalError::descriptor(format!("{depth:?} is not a depth format")));
        }
    }
    Ok(())
}

impl Swapchain {
    pub(crate) fn new(factory: ResourceFactory, desc: SwapchainDescriptor) -> GalResult<Self> {
        validate(&desc)?;
        let config = SwapchainConfig {
            surface: desc.surface,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            image_count: desc.image_count,
            vsync: desc.vsync,
        };
        let native = factory.device().backend().create_swapchain(&config, None)?;
        let (back_buffers, depth) = match wrap_images(&factory, &native, desc.depth_format) {
            Ok(frames) => frames,
            Err(err) => {
                factory.device().backend().destroy_swapchain(native.handle);
                return Err(err);
            }
        };
        log::info!(
            "swapchain created: {}x{} {:?}, {} images",
            native.extent[0],
            native.extent[1],
            native.format,
            native.images.len()
        );
        Ok(Self {
            base: ResourceBase::new("swapchain", desc.label),
            factory,
            depth_format: desc.depth_format,
            frames: Mutex::new(Frames {
                config,
                native,
                back_buffers,
                depth,
                state: SwapchainState::Created,
                acquired: None,
            }),
        })
    }

    pub fn state(&self) -> SwapchainState {
        self.lock().state
    }

    pub fn extent(&self) -> [u32; 2] {
        self.lock().native.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.lock().native.format
    }

    pub fn back_buffers(&self) -> Vec<Arc<Texture>> {
        self.lock().back_buffers.clone()
    }

    pub fn back_buffer(&self, index: u32) -> Option<Arc<Texture>> {
        self.lock().back_buffers.get(index as usize).cloned()
    }

    pub fn depth_texture(&self) -> Option<Arc<Texture>> {
        self.lock().depth.clone()
    }

    /// The attachment formats pipelines rendering to this swapchain must declare.
    pub fn output_description(&self) -> OutputDescription {
        let frames = self.lock();
        OutputDescription::new(vec![frames.native.format], self.depth_format)
    }

    /// Acquires the next back buffer and returns its index.
    pub fn acquire_next_image(&self) -> GalResult<u32> {
        self.base.ensure_alive()?;
        let mut frames = self.lock();
        if let Some(index) = frames.acquired {
            return Err(GalError::invalid_state(format!(
                "back buffer {index} acquired twice without present()"
            )));
        }
        let index = self
            .factory
            .device()
            .backend()
            .acquire_next_image(frames.native.handle)?;
        frames.acquired = Some(index);
        Ok(index)
    }

    /// Presents the acquired back buffer once the work behind `token` completes.
    /// The back buffer must have been transitioned to `Present` by that work.
    pub fn present(&self, token: SubmissionToken) -> GalResult<()> {
        self.base.ensure_alive()?;
        let mut frames = self.lock();
        let index = frames
            .acquired
            .ok_or_else(|| GalError::invalid_state("present() without an acquired back buffer"))?;
        let texture = &frames.back_buffers[index as usize];
        let state = texture.state_cell().get().state;
        if state != ResourceState::Present {
            return Err(GalError::invalid_state(format!(
                "back buffer {index} is in {state:?}, transition it to Present before presenting"
            )));
        }
        self.factory
            .device()
            .backend()
            .present(frames.native.handle, index, token)?;
        self.base.usage.record(token);
        frames.acquired = None;
        frames.state = SwapchainState::Presenting;
        Ok(())
    }

    /// Recreates the back buffers and depth texture at a new size. Returns false,
    /// leaving every texture untouched, when the size is unchanged.
    pub fn resize(&self, width: u32, height: u32) -> GalResult<bool> {
        self.base.ensure_alive()?;
        if width == 0 || height == 0 {
            return Err(GalError::descriptor(format!(
                "cannot resize swapchain to {width}x{height}"
            )));
        }
        let mut frames = self.lock();
        if frames.config.width == width && frames.config.height == height {
            return Ok(false);
        }
        frames.state = SwapchainState::Resizing;
        let device = self.factory.device();
        device.wait_for_usage(&self.base);
        release_images(&mut frames);

        let mut config = frames.config.clone();
        config.width = width;
        config.height = height;
        let old = frames.native.handle;
        let backend = device.backend();
        let native = backend.create_swapchain(&config, Some(old))?;
        backend.destroy_swapchain(old);
        let (back_buffers, depth) = match wrap_images(&self.factory, &native, self.depth_format) {
            Ok(wrapped) => wrapped,
            Err(err) => {
                backend.destroy_swapchain(native.handle);
                frames.state = SwapchainState::Destroyed;
                self.base.begin_dispose();
                return Err(err);
            }
        };
        log::info!(
            "swapchain resized to {}x{}, {} images",
            native.extent[0],
            native.extent[1],
            native.images.len()
        );
        frames.config = config;
        frames.native = native;
        frames.back_buffers = back_buffers;
        frames.depth = depth;
        frames.acquired = None;
        frames.state = SwapchainState::Created;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Frames> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn wrap_images(
    factory: &ResourceFactory,
    native: &NativeSwapchain,
    depth_format: Option<TextureFormat>,
) -> GalResult<(Vec<Arc<Texture>>, Option<Arc<Texture>>)> {
    let [width, height] = native.extent;
    let color = TextureDescriptor {
        label: Some("back buffer"),
        ..TextureDescriptor::new_2d(
            width,
            height,
            native.format,
            TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
        )
    };
    let back_buffers = native
        .images
        .iter()
        .map(|&handle| {
            Arc::new(Texture::new(
                factory.device().clone(),
                handle,
                color.clone(),
                ResourceState::Undefined,
            ))
        })
        .collect();
    let depth = match depth_format {
        Some(format) => Some(factory.create_texture(&TextureDescriptor {
            label: Some("swapchain depth"),
            ..TextureDescriptor::new_2d(width, height, format, TextureUsage::DEPTH_STENCIL)
        })?),
        None => None,
    };
    Ok((back_buffers, depth))
}

fn release_images(frames: &mut Frames) {
    for texture in frames.back_buffers.drain(..) {
        texture.dispose();
    }
    if let Some(depth) = frames.depth.take() {
        depth.dispose();
    }
}

impl Resource for Swapchain {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn dispose(&self) {
        if self.base.begin_dispose() {
            let device = self.factory.device();
            device.wait_for_usage(&self.base);
            let mut frames = self.lock();
            release_images(&mut frames);
            device.backend().destroy_swapchain(frames.native.handle);
            frames.state = SwapchainState::Destroyed;
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.dispose();
    }
}
