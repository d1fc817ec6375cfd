// Per-window swapchain handling
//
// Window attachments borrow their images from one of these. The
// caller hands us a VkSurfaceKHR (window system integration is their
// job), we own it from there: format/present mode selection,
// swapchain (re)creation, image acquisition and presentation.

use ash::extensions::khr;
use ash::vk;

extern crate utils;
use crate::device::Device;
use crate::{Result as StratusResult, StratusError};
use utils::log;

use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// What changed when a swapchain was recreated.
    pub struct RecreateFlags: u32 {
        const RECREATE = 0x0001;
        const RESIZE   = 0x0002;
        const FORMAT   = 0x0004;
    }
}

/// A vkSwapchainKHR based output.
///
/// The swapchain is generated (and regenerated) from the surface the
/// caller attached.
pub(crate) struct Swapchain {
    s_dev: Arc<Device>,

    // the actual surface (KHR extension)
    pub(crate) s_surface: vk::SurfaceKHR,
    // function pointer loaders
    s_surface_loader: khr::Surface,
    /// loads swapchain extension
    s_swapchain_loader: khr::Swapchain,
    /// the actual swapchain
    s_swapchain: vk::SwapchainKHR,

    /// Cache the present mode here so we don't re-request it
    s_present_mode: vk::PresentModeKHR,
    pub(crate) s_surface_format: vk::SurfaceFormatKHR,
    /// Current resolution of this output
    pub(crate) s_extent: vk::Extent2D,

    /// a set of images belonging to the swapchain
    pub(crate) s_images: Vec<vk::Image>,
    /// views describing how to access the images
    pub(crate) s_views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// choose a vkSurfaceFormatKHR for the vkSurfaceKHR
    ///
    /// This selects the color space and layout for a surface. We
    /// force B8G8R8A8_UNORM for now, since everything downstream
    /// assumes UNORM.
    fn select_surface_format(&self) -> StratusResult<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.s_surface_loader
                .get_physical_device_surface_formats(self.s_dev.pdev, self.s_surface)
                .or(Err(StratusError::INVALID))?
        };

        formats
            .iter()
            .find(|fmt| fmt.format == vk::Format::B8G8R8A8_UNORM)
            .or_else(|| formats.first())
            .ok_or(StratusError::INVALID_FORMAT)
            .copied()
    }

    /// Verify that the graphics queue family can present this surface.
    fn check_present_support(&self) -> StratusResult<()> {
        let supported = unsafe {
            self.s_surface_loader
                .get_physical_device_surface_support(
                    self.s_dev.pdev,
                    self.s_dev.d_graphics_family,
                    self.s_surface,
                )
                .or(Err(StratusError::VK_SURF_NOT_SUPPORTED))?
        };

        if !supported {
            log::error!("The graphics queue family cannot present this surface");
            return Err(StratusError::VK_SURF_NOT_SUPPORTED);
        }
        Ok(())
    }

    /// Get the vkImage's for the swapchain, and create vkImageViews
    /// for them.
    fn select_images_and_views(&mut self) -> StratusResult<()> {
        let images = unsafe {
            self.s_swapchain_loader
                .get_swapchain_images(self.s_swapchain)
                .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))?
        };

        let mut image_views = Vec::new();
        for image in images.iter() {
            // we want to interact with this image as a 2D
            // array of RGBA pixels (i.e. the "normal" way)
            let create_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.s_surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                // this view pertains to the entire image
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image)
                .build();

            unsafe {
                image_views.push(
                    self.s_dev
                        .dev
                        .create_image_view(&create_info, None)
                        .or(Err(StratusError::COULD_NOT_CREATE_IMAGE))?,
                );
            }
        }

        self.destroy_views();
        self.s_images = images;
        self.s_views = image_views;

        Ok(())
    }

    fn destroy_views(&mut self) {
        unsafe {
            for view in self.s_views.drain(..) {
                self.s_dev.dev.destroy_image_view(view, None);
            }
        }
        self.s_images.clear();
    }

    fn destroy_swapchain(&mut self) {
        unsafe {
            self.s_swapchain_loader
                .destroy_swapchain(self.s_swapchain, None);
            self.s_swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Populates this output with a new vkSwapchain
    ///
    /// The old swapchain (if any) is handed to the driver for reuse
    /// and destroyed afterwards. The output resolution is set by this
    /// method.
    fn create_swapchain(&mut self) -> StratusResult<()> {
        let surface_caps = unsafe {
            self.s_surface_loader
                .get_physical_device_surface_capabilities(self.s_dev.pdev, self.s_surface)
                .or(Err(StratusError::INVALID))?
        };

        self.s_extent = surface_caps.current_extent;

        // how many images we want the swapchain to contain
        // Default to double buffering for minimal input lag.
        let mut desired_image_count = 2;
        if desired_image_count < surface_caps.min_image_count {
            desired_image_count = surface_caps.min_image_count;
        }

        let transform = if surface_caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            surface_caps.current_transform
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .flags(vk::SwapchainCreateFlagsKHR::empty())
            .surface(self.s_surface)
            .min_image_count(desired_image_count)
            .image_color_space(self.s_surface_format.color_space)
            .image_format(self.s_surface_format.format)
            .image_extent(self.s_extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.s_present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.s_swapchain)
            .build();

        let new_swapchain = unsafe {
            self.s_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(StratusError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        // Now that we recreated the swapchain destroy the old one
        self.destroy_swapchain();
        self.s_swapchain = new_swapchain;

        Ok(())
    }

    /// Create a new swapchain over a surface. Takes ownership of the
    /// surface, it is destroyed with the swapchain.
    pub(crate) fn new(dev: Arc<Device>, surface: vk::SurfaceKHR) -> StratusResult<Self> {
        let surface_loader = khr::Surface::new(&dev.inst.loader, &dev.inst.inst);
        let swapchain_loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);

        // the best mode for presentation is mailbox (with triple
        // buffering), fall back to FIFO if it is not available
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(dev.pdev, surface)
                .or(Err(StratusError::INVALID))?
        };
        let mode = present_modes
            .iter()
            .cloned()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let mut swapchain = Self {
            s_dev: dev,
            s_surface: surface,
            s_surface_loader: surface_loader,
            s_swapchain_loader: swapchain_loader,
            s_swapchain: vk::SwapchainKHR::null(),
            s_present_mode: mode,
            s_surface_format: vk::SurfaceFormatKHR::default(),
            s_extent: vk::Extent2D::default(),
            s_images: Vec::new(),
            s_views: Vec::new(),
        };

        swapchain.check_present_support()?;
        swapchain.s_surface_format = swapchain.select_surface_format()?;
        swapchain.create_swapchain()?;
        swapchain.select_images_and_views()?;

        Ok(swapchain)
    }

    /// Recreate our swapchain.
    ///
    /// This will be done on VK_ERROR_OUT_OF_DATE_KHR, signifying that
    /// the window is being resized and we have to regenerate
    /// accordingly. The caller is responsible for having synced every
    /// frame beforehand.
    pub(crate) fn recreate(&mut self) -> StratusResult<RecreateFlags> {
        let old_extent = self.s_extent;
        let old_format = self.s_surface_format;

        self.s_surface_format = self.select_surface_format()?;
        self.create_swapchain()?;
        self.select_images_and_views()?;

        let mut flags = RecreateFlags::RECREATE;
        if self.s_extent.width != old_extent.width || self.s_extent.height != old_extent.height {
            flags |= RecreateFlags::RESIZE;
        }
        if self.s_surface_format.format != old_format.format {
            flags |= RecreateFlags::FORMAT;
        }

        Ok(flags)
    }

    /// Get the next swapchain image to render to.
    ///
    /// If the next image is not ready (i.e. if vulkan returned
    /// NOT_READY or TIMEOUT), then this will loop on calling
    /// `vkAcquireNextImageKHR` until it gets a valid image.
    pub(crate) fn acquire(&mut self, available: vk::Semaphore) -> StratusResult<u32> {
        loop {
            match unsafe {
                self.s_swapchain_loader.acquire_next_image(
                    self.s_swapchain,
                    0, // use a zero timeout to immediately get the state
                    available,
                    vk::Fence::null(),
                )
            } {
                Ok((index, false)) => return Ok(index),
                // suboptimal still presents, but the caller has to
                // schedule a recreate
                Ok((_, true)) => return Err(StratusError::OUT_OF_DATE),
                Err(vk::Result::NOT_READY) => continue,
                Err(vk::Result::TIMEOUT) => continue,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(StratusError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => return Err(StratusError::OUT_OF_DATE),
                // the call did not succeed
                Err(_) => return Err(StratusError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
            }
        }
    }

    /// Present a swapchain image to the screen, waiting on the
    /// rendering-done semaphore.
    pub(crate) fn present(
        &mut self,
        queue: vk::Queue,
        image: u32,
        rendered: vk::Semaphore,
    ) -> StratusResult<()> {
        let wait_semas = [rendered];
        let swapchains = [self.s_swapchain];
        let indices = [image];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self.s_swapchain_loader.queue_present(queue, &info) {
                Ok(false) => Ok(()),
                Ok(true) => Err(StratusError::OUT_OF_DATE),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(StratusError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(StratusError::OUT_OF_DATE),
                Err(_) => Err(StratusError::PRESENT_FAILED),
            }
        }
    }

    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.s_extent
    }

    pub(crate) fn handle(&self) -> vk::SwapchainKHR {
        self.s_swapchain
    }

    pub(crate) fn loader(&self) -> &khr::Swapchain {
        &self.s_swapchain_loader
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_views();
        unsafe {
            self.s_swapchain_loader
                .destroy_swapchain(self.s_swapchain, None);
            self.s_surface_loader.destroy_surface(self.s_surface, None);
        }
    }
}
