//! Swapchains: offscreen image rings, and window surfaces with the `window` feature.

use crate::backend::NativeHandle;
use crate::error::{GalError, GalResult};
use crate::state::SubmissionToken;
use crate::swapchain::{NativeSwapchain, SurfaceTarget, SwapchainConfig};
use crate::texture::{TextureDescriptor, TextureUsage};

use super::VulkanBackend;

#[derive(Debug)]
pub(super) struct SwapchainEntry {
    images: Vec<NativeHandle>,
    target: Target,
}

#[derive(Debug)]
enum Target {
    /// Device-owned textures handed out in turn.
    Offscreen { next: u32 },
    #[cfg(feature = "window")]
    Surface(window::SurfaceSwapchain),
}

fn back_buffer_descriptor(config: &SwapchainConfig, extent: [u32; 2]) -> TextureDescriptor {
    TextureDescriptor {
        label: Some("swapchain image"),
        ..TextureDescriptor::new_2d(
            extent[0],
            extent[1],
            config.format,
            TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
        )
    }
}

impl VulkanBackend {
    pub(super) fn new_swapchain(
        &self,
        config: &SwapchainConfig,
        old: Option<NativeHandle>,
    ) -> GalResult<NativeSwapchain> {
        match config.surface {
            SurfaceTarget::Headless => {
                if let Some(old) = old {
                    self.swapchains.with(old, |_| ())?;
                }
                self.offscreen_swapchain(config)
            }
            #[cfg(feature = "window")]
            SurfaceTarget::Window(surface) => self.window_swapchain(config, surface, old),
        }
    }

    fn offscreen_swapchain(&self, config: &SwapchainConfig) -> GalResult<NativeSwapchain> {
        let extent = [config.width, config.height];
        let desc = back_buffer_descriptor(config, extent);
        let mut images = Vec::with_capacity(config.image_count as usize);
        for _ in 0..config.image_count {
            match self.new_texture(&desc) {
                Ok(entry) => images.push(self.textures.insert(entry)),
                Err(err) => {
                    self.release_images(&images);
                    return Err(err);
                }
            }
        }
        let handle = self.swapchains.insert(SwapchainEntry {
            images: images.clone(),
            target: Target::Offscreen { next: 0 },
        });
        log::debug!(
            "offscreen swapchain: {} images of {}x{}",
            images.len(),
            extent[0],
            extent[1]
        );
        Ok(NativeSwapchain {
            handle,
            images,
            format: config.format,
            extent,
        })
    }

    /// Frees back buffers the front end has not released itself.
    fn release_images(&self, images: &[NativeHandle]) {
        for &image in images {
            if let Some(entry) = self.textures.remove(image) {
                self.free_texture(&entry);
            }
        }
    }

    pub(super) fn next_image(&self, swapchain: NativeHandle) -> GalResult<u32> {
        let offscreen = self.swapchains.with_mut(swapchain, |entry| match &mut entry.target {
            Target::Offscreen { next } => {
                let index = *next;
                *next = (index + 1) % entry.images.len().max(1) as u32;
                Some(index)
            }
            #[cfg(feature = "window")]
            Target::Surface(_) => None,
        })?;
        match offscreen {
            Some(index) => Ok(index),
            #[cfg(feature = "window")]
            None => self.acquire_surface_image(swapchain),
            #[cfg(not(feature = "window"))]
            None => Err(GalError::invalid_state("swapchain has no images to acquire")),
        }
    }

    pub(super) fn present_image(
        &self,
        swapchain: NativeHandle,
        image: u32,
        wait: SubmissionToken,
    ) -> GalResult<()> {
        let count = self.swapchains.with(swapchain, |entry| entry.images.len())?;
        if image as usize >= count {
            return Err(GalError::invalid_state(format!("swapchain has no image {image}")));
        }
        self.queues.wait(&self.device, wait, None)?;
        #[cfg(feature = "window")]
        {
            let surface = self.swapchains.with(swapchain, |entry| match &entry.target {
                Target::Surface(s) => Some(s.raw),
                Target::Offscreen { .. } => None,
            })?;
            if let Some(raw) = surface {
                return self.present_surface_image(raw, image);
            }
        }
        log::trace!("offscreen present: image {image}");
        Ok(())
    }

    pub(super) fn free_swapchain(&self, swapchain: NativeHandle) {
        if let Some(entry) = self.swapchains.remove(swapchain) {
            self.release_swapchain(entry);
        }
    }

    /// Releases every swapchain still alive, on device teardown.
    pub(super) fn release_swapchains(&self) {
        for entry in self.swapchains.drain() {
            self.release_swapchain(entry);
        }
    }

    fn release_swapchain(&self, entry: SwapchainEntry) {
        self.release_images(&entry.images);
        match entry.target {
            Target::Offscreen { .. } => {}
            #[cfg(feature = "window")]
            Target::Surface(surface) => self.destroy_surface_swapchain(surface),
        }
    }
}

#[cfg(feature = "window")]
mod window {
    use ash::vk;
    use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

    use crate::backend::NativeHandle;
    use crate::error::{GalError, GalResult};
    use crate::format::TextureFormat;
    use crate::swapchain::{NativeSwapchain, SwapchainConfig, WindowSurface};

    use super::super::texture::{texture_format_from_vk, texture_format_to_vk};
    use super::super::{vk_error, VulkanBackend};
    use super::{back_buffer_descriptor, SwapchainEntry, Target};

    #[derive(Debug)]
    pub(super) struct SurfaceSwapchain {
        pub raw: vk::SwapchainKHR,
        /// Released with the last swapchain created on it.
        pub surface: Option<vk::SurfaceKHR>,
        /// Signalled by image acquisition.
        pub fence: vk::Fence,
    }

    /// Present mode for the vsync preference, from what the surface offers.
    pub(super) fn choose_present_mode(vsync: bool, modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        if vsync {
            return vk::PresentModeKHR::FIFO;
        }
        [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
            .into_iter()
            .find(|m| modes.contains(m))
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }

    /// The requested format when the surface supports it, else the first supported
    /// format the crate knows.
    pub(super) fn choose_format(
        requested: TextureFormat,
        formats: &[vk::SurfaceFormatKHR],
    ) -> Option<(TextureFormat, vk::SurfaceFormatKHR)> {
        let wanted = texture_format_to_vk(requested);
        formats
            .iter()
            .find(|f| f.format == wanted)
            .map(|f| (requested, *f))
            .or_else(|| {
                formats
                    .iter()
                    .find_map(|f| texture_format_from_vk(f.format).map(|ours| (ours, *f)))
            })
    }

    pub(super) fn choose_extent(
        requested: [u32; 2],
        caps: &vk::SurfaceCapabilitiesKHR,
    ) -> vk::Extent2D {
        if caps.current_extent.width != u32::MAX {
            return caps.current_extent;
        }
        vk::Extent2D {
            width: requested[0].clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested[1].clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }

    pub(super) fn choose_image_count(requested: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
        let count = requested.max(caps.min_image_count);
        if caps.max_image_count == 0 {
            count
        } else {
            count.min(caps.max_image_count)
        }
    }

    impl VulkanBackend {
        fn surface_loader(&self) -> GalResult<&ash::khr::surface::Instance> {
            self.surface_loader
                .as_ref()
                .ok_or_else(|| GalError::UnsupportedCapability("window surfaces are not enabled".into()))
        }

        fn swapchain_loader(&self) -> GalResult<&ash::khr::swapchain::Device> {
            self.swapchain_loader.as_ref().ok_or_else(|| {
                GalError::UnsupportedCapability(format!(
                    "'{}' cannot present to windows",
                    self.caps.device_name
                ))
            })
        }

        fn create_surface(&self, target: WindowSurface) -> GalResult<vk::SurfaceKHR> {
            let entry = self.instance.entry();
            let instance = self.instance.raw();
            let unsupported = || {
                GalError::UnsupportedCapability(format!(
                    "window system {:?} is not supported",
                    target.window
                ))
            };
            let surface = match (target.window, target.display) {
                (RawWindowHandle::Win32(window), _) => {
                    let info = vk::Win32SurfaceCreateInfoKHR::default()
                        .hinstance(window.hinstance.map_or(0, |h| h.get()))
                        .hwnd(window.hwnd.get());
                    let loader = ash::khr::win32_surface::Instance::new(entry, instance);
                    unsafe { loader.create_win32_surface(&info, None) }
                }
                (RawWindowHandle::Xlib(window), RawDisplayHandle::Xlib(display)) => {
                    let display = display.display.ok_or_else(unsupported)?;
                    let info = vk::XlibSurfaceCreateInfoKHR::default()
                        .dpy(display.as_ptr().cast())
                        .window(window.window);
                    let loader = ash::khr::xlib_surface::Instance::new(entry, instance);
                    unsafe { loader.create_xlib_surface(&info, None) }
                }
                (RawWindowHandle::Xcb(window), RawDisplayHandle::Xcb(display)) => {
                    let connection = display.connection.ok_or_else(unsupported)?;
                    let info = vk::XcbSurfaceCreateInfoKHR::default()
                        .connection(connection.as_ptr().cast())
                        .window(window.window.get());
                    let loader = ash::khr::xcb_surface::Instance::new(entry, instance);
                    unsafe { loader.create_xcb_surface(&info, None) }
                }
                (RawWindowHandle::Wayland(window), RawDisplayHandle::Wayland(display)) => {
                    let info = vk::WaylandSurfaceCreateInfoKHR::default()
                        .display(display.display.as_ptr().cast())
                        .surface(window.surface.as_ptr().cast());
                    let loader = ash::khr::wayland_surface::Instance::new(entry, instance);
                    unsafe { loader.create_wayland_surface(&info, None) }
                }
                _ => return Err(unsupported()),
            };
            surface.map_err(|e| vk_error("create_surface", e))
        }

        pub(super) fn window_swapchain(
            &self,
            config: &SwapchainConfig,
            target: WindowSurface,
            old: Option<NativeHandle>,
        ) -> GalResult<NativeSwapchain> {
            let surfaces = self.surface_loader()?;
            let loader = self.swapchain_loader()?;
            let previous = match old {
                Some(old) => self.swapchains.with(old, |entry| match &entry.target {
                    Target::Surface(s) => Some((s.raw, s.surface)),
                    Target::Offscreen { .. } => None,
                })?,
                None => None,
            };
            let (old_raw, reused) = match previous {
                Some((raw, surface)) => (raw, surface),
                None => (vk::SwapchainKHR::null(), None),
            };
            let surface = match reused {
                Some(surface) => surface,
                None => self.create_surface(target)?,
            };
            let created = self.surface_swapchain(surfaces, loader, config, surface, old_raw);
            match (created, reused) {
                (Ok(native), Some(_)) => {
                    // The surface moves to the new swapchain.
                    if let Some(old) = old {
                        self.swapchains.with_mut(old, |entry| {
                            if let Target::Surface(s) = &mut entry.target {
                                s.surface = None;
                            }
                        })?;
                    }
                    Ok(native)
                }
                (Ok(native), None) => Ok(native),
                (Err(err), reused) => {
                    if reused.is_none() {
                        unsafe { surfaces.destroy_surface(surface, None) };
                    }
                    Err(err)
                }
            }
        }

        fn surface_swapchain(
            &self,
            surfaces: &ash::khr::surface::Instance,
            loader: &ash::khr::swapchain::Device,
            config: &SwapchainConfig,
            surface: vk::SurfaceKHR,
            old: vk::SwapchainKHR,
        ) -> GalResult<NativeSwapchain> {
            let physical = self.adapter.physical;
            let presentable = unsafe {
                surfaces.get_physical_device_surface_support(
                    physical,
                    self.adapter.queue_family,
                    surface,
                )
            }
            .map_err(|e| vk_error("get_physical_device_surface_support", e))?;
            if !presentable {
                return Err(GalError::UnsupportedCapability(format!(
                    "'{}' cannot present to this surface",
                    self.caps.device_name
                )));
            }
            let caps = unsafe { surfaces.get_physical_device_surface_capabilities(physical, surface) }
                .map_err(|e| vk_error("get_physical_device_surface_capabilities", e))?;
            let formats = unsafe { surfaces.get_physical_device_surface_formats(physical, surface) }
                .map_err(|e| vk_error("get_physical_device_surface_formats", e))?;
            let modes =
                unsafe { surfaces.get_physical_device_surface_present_modes(physical, surface) }
                    .map_err(|e| vk_error("get_physical_device_surface_present_modes", e))?;

            let (format, surface_format) = choose_format(config.format, &formats).ok_or_else(|| {
                GalError::UnsupportedUsage(format!(
                    "surface offers no usable format for {:?}",
                    config.format
                ))
            })?;
            let extent = choose_extent([config.width, config.height], &caps);
            let present_mode = choose_present_mode(config.vsync, &modes);
            let transfer = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
            if !caps
                .supported_usage_flags
                .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | transfer)
            {
                return Err(GalError::UnsupportedUsage(
                    "surface images cannot be both render targets and copy endpoints".into(),
                ));
            }
            let create_info = vk::SwapchainCreateInfoKHR::default()
                .surface(surface)
                .min_image_count(choose_image_count(config.image_count, &caps))
                .image_format(surface_format.format)
                .image_color_space(surface_format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | transfer)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(caps.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .old_swapchain(old);
            let raw = unsafe { loader.create_swapchain(&create_info, None) }
                .map_err(|e| vk_error("create_swapchain", e))?;
            let fence = match unsafe {
                self.device
                    .create_fence(&vk::FenceCreateInfo::default(), None)
            } {
                Ok(fence) => fence,
                Err(e) => {
                    unsafe { loader.destroy_swapchain(raw, None) };
                    return Err(vk_error("create_fence", e));
                }
            };
            let swapchain = SurfaceSwapchain {
                raw,
                surface: Some(surface),
                fence,
            };

            let extent = [extent.width, extent.height];
            let desc = back_buffer_descriptor(
                &SwapchainConfig {
                    format,
                    ..config.clone()
                },
                extent,
            );
            let wrapped = unsafe { loader.get_swapchain_images(raw) }
                .map_err(|e| vk_error("get_swapchain_images", e))
                .and_then(|raw_images| {
                    let mut images = Vec::with_capacity(raw_images.len());
                    for image in raw_images {
                        match self.wrap_image(image, None, desc.clone()) {
                            Ok(entry) => images.push(self.textures.insert(entry)),
                            Err(err) => {
                                self.release_images(&images);
                                return Err(err);
                            }
                        }
                    }
                    Ok(images)
                });
            let images = match wrapped {
                Ok(images) => images,
                Err(err) => {
                    // The caller still owns the surface on failure.
                    unsafe {
                        self.device.destroy_fence(fence, None);
                        loader.destroy_swapchain(raw, None);
                    }
                    return Err(err);
                }
            };
            log::info!(
                "surface swapchain: {} images of {}x{} {:?}, {:?}",
                images.len(),
                extent[0],
                extent[1],
                format,
                present_mode
            );
            let handle = self.swapchains.insert(SwapchainEntry {
                images: images.clone(),
                target: Target::Surface(swapchain),
            });
            Ok(NativeSwapchain {
                handle,
                images,
                format,
                extent,
            })
        }

        /// Blocks until the presentation engine hands out an image.
        pub(super) fn acquire_surface_image(&self, swapchain: NativeHandle) -> GalResult<u32> {
            let loader = self.swapchain_loader()?;
            let (raw, fence) = self.swapchains.with(swapchain, |entry| match &entry.target {
                Target::Surface(s) => Some((s.raw, s.fence)),
                Target::Offscreen { .. } => None,
            })?
            .ok_or_else(|| GalError::invalid_state("swapchain has no surface"))?;
            let (index, suboptimal) = unsafe {
                loader.acquire_next_image(raw, u64::MAX, vk::Semaphore::null(), fence)
            }
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_DATE_KHR => {
                    GalError::invalid_state("swapchain is out of date; resize it before acquiring")
                }
                other => vk_error("acquire_next_image", other),
            })?;
            unsafe {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(|e| vk_error("wait_for_fences", e))?;
                self.device
                    .reset_fences(&[fence])
                    .map_err(|e| vk_error("reset_fences", e))?;
            }
            if suboptimal {
                log::debug!("swapchain image {index} acquired from a suboptimal swapchain");
            }
            Ok(index)
        }

        pub(super) fn present_surface_image(&self, raw: vk::SwapchainKHR, image: u32) -> GalResult<()> {
            let loader = self.swapchain_loader()?;
            let swapchains = [raw];
            let indices = [image];
            let info = vk::PresentInfoKHR::default()
                .swapchains(&swapchains)
                .image_indices(&indices);
            let presented = self
                .queues
                .with_queue(|queue| unsafe { loader.queue_present(queue, &info) });
            match presented {
                Ok(false) => Ok(()),
                Ok(true) => {
                    log::debug!("presented to a suboptimal swapchain");
                    Ok(())
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("presented to an out-of-date swapchain");
                    Ok(())
                }
                Err(e) => Err(vk_error("queue_present", e)),
            }
        }

        pub(super) fn destroy_surface_swapchain(&self, swapchain: SurfaceSwapchain) {
            unsafe {
                self.device.destroy_fence(swapchain.fence, None);
                if let Some(loader) = &self.swapchain_loader {
                    loader.destroy_swapchain(swapchain.raw, None);
                }
                if let (Some(surface), Some(surfaces)) = (swapchain.surface, &self.surface_loader) {
                    surfaces.destroy_surface(surface, None);
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn vsync_always_presents_in_order() {
            let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
            assert_eq!(choose_present_mode(true, &modes), vk::PresentModeKHR::FIFO);
            assert_eq!(choose_present_mode(false, &modes), vk::PresentModeKHR::MAILBOX);
            assert_eq!(
                choose_present_mode(false, &[vk::PresentModeKHR::FIFO]),
                vk::PresentModeKHR::FIFO
            );
        }

        #[test]
        fn fixed_surface_extents_win() {
            let caps = vk::SurfaceCapabilitiesKHR {
                current_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                min_image_count: 2,
                max_image_count: 3,
                ..Default::default()
            };
            let extent = choose_extent([1024, 768], &caps);
            assert_eq!((extent.width, extent.height), (800, 600));
            assert_eq!(choose_image_count(8, &caps), 3);
            assert_eq!(choose_image_count(1, &caps), 2);
        }

        #[test]
        fn unknown_formats_fall_back_to_a_supported_one() {
            let formats = [vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }];
            let (ours, _) = choose_format(TextureFormat::Rgba16Float, &formats).unwrap();
            assert_eq!(ours, TextureFormat::Bgra8UnormSrgb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TextureFormat;

    #[test]
    fn back_buffers_are_copyable_render_targets() {
        let config = SwapchainConfig {
            surface: SurfaceTarget::Headless,
            width: 64,
            height: 32,
            format: TextureFormat::Bgra8Unorm,
            image_count: 2,
            vsync: true,
        };
        let desc = back_buffer_descriptor(&config, [64, 32]);
        assert!(desc.usage.contains(TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC));
        assert_eq!((desc.width, desc.height), (64, 32));
    }
}
