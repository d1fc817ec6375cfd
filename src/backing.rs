// The render backing
//
// The backing is a renderer's attachment vector. An attachment is
// either empty, an engine-owned image, or a window (i.e. swapchain)
// slot. Image attachments keep a list of backing generations so a
// swapchain recreate can retire old images through the stale queue
// while in-flight frames still read valid memory.

use ash::vk;

extern crate utils;
use crate::device::{Allocation, Device};
use crate::format::{self, Format};
use crate::frame::StaleSet;
use crate::heap::{self, ImageUsage, MemoryFlags};
use crate::swapchain::{RecreateFlags, Swapchain};
use crate::{Result, StratusError};
use utils::log;

use std::sync::{Arc, RwLock};

/// The attachment vector, shared with references and dependencies.
pub(crate) type AttachList = Arc<RwLock<Vec<Attach>>>;

/// Sizing of an image attachment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttachSize {
    Absolute(u32, u32, u32),
    /// Match the extent of the renderer's first window attachment.
    SwapchainRelative,
}

/// Description of an image attachment.
#[derive(Copy, Clone)]
pub struct AttachmentDesc {
    pub flags: MemoryFlags,
    pub usage: ImageUsage,
    pub format: Format,
    pub size: AttachSize,
}

/// A single generation of an image attachment's storage.
pub(crate) struct AttachBacking {
    pub(crate) vk_image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) alloc: Allocation,
}

/// Image (i.e. engine-owned) attachment.
pub(crate) struct ImageAttach {
    pub(crate) base: AttachmentDesc,

    // Resolved size.
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,

    pub(crate) fmt: Format,
    pub(crate) vk_format: vk::Format,
    /// Most recent image (for locality).
    pub(crate) vk_image: vk::Image,

    /// Backing generations, the current one up front.
    pub(crate) backings: Vec<AttachBacking>,
}

/// Window attachment, its images belong to the swapchain.
pub(crate) struct WindowAttach {
    pub(crate) swapchain: Swapchain,
    /// Used by virtual frames, from the last submission.
    pub(crate) flags: RecreateFlags,
}

pub(crate) enum Attach {
    Empty,
    Image(ImageAttach),
    Window(WindowAttach),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum BackingState {
    Invalid,
    Validated,
    Built,
}

pub(crate) struct Backing {
    pub(crate) attachs: AttachList,
    pub(crate) state: BackingState,
}

// Create one backing generation for a resolved image attachment.
fn create_backing(dev: &Device, attach: &ImageAttach) -> Result<AttachBacking> {
    let fmt = &attach.fmt;
    let aspect = if fmt.has_depth() || fmt.has_stencil() {
        let mut aspect = vk::ImageAspectFlags::empty();
        if fmt.has_depth() {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if fmt.has_stencil() {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        aspect
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let mut usage = heap::vk_image_usage(attach.base.flags, attach.base.usage);
    usage |= if fmt.has_depth() || fmt.has_stencil() {
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
    } else {
        vk::ImageUsageFlags::COLOR_ATTACHMENT
    };

    let info = vk::ImageCreateInfo::builder()
        .image_type(if attach.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        })
        .format(attach.vk_format)
        .extent(vk::Extent3D {
            width: attach.width,
            height: attach.height,
            depth: attach.depth,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .build();

    unsafe {
        let image = dev
            .dev
            .create_image(&info, None)
            .map_err(|_| StratusError::COULD_NOT_CREATE_IMAGE)?;

        let reqs = dev.dev.get_image_memory_requirements(image);
        let alloc = match dev.alloc_memory(&reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(a) => a,
            Err(e) => {
                dev.dev.destroy_image(image, None);
                return Err(e);
            }
        };
        if dev.dev.bind_image_memory(image, alloc.memory, 0).is_err() {
            dev.dev.destroy_image(image, None);
            dev.free_memory(&alloc);
            return Err(StratusError::COULD_NOT_CREATE_IMAGE);
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(if attach.depth > 1 {
                vk::ImageViewType::TYPE_3D
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(attach.vk_format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image(image)
            .build();

        let view = match dev.dev.create_image_view(&view_info, None) {
            Ok(v) => v,
            Err(_) => {
                dev.dev.destroy_image(image, None);
                dev.free_memory(&alloc);
                return Err(StratusError::COULD_NOT_CREATE_IMAGE);
            }
        };

        Ok(AttachBacking {
            vk_image: image,
            view: view,
            alloc: alloc,
        })
    }
}

// Move all backing generations of an image attachment into a stale
// set for deferred destruction.
fn retire_backings(attach: &mut ImageAttach, stales: &mut StaleSet) {
    for backing in attach.backings.drain(..) {
        stales.image_views.push(backing.view);
        stales.images.push((backing.vk_image, backing.alloc.memory));
    }
    attach.vk_image = vk::Image::null();
}

impl Backing {
    pub(crate) fn new() -> Self {
        Self {
            attachs: Arc::new(RwLock::new(Vec::new())),
            state: BackingState::Built,
        }
    }

    fn grow_to(attachs: &mut Vec<Attach>, index: usize) {
        while attachs.len() <= index {
            attachs.push(Attach::Empty);
        }
    }

    // Replace whatever sits at index, retiring image backings.
    // Window attachments are torn down in place, the caller must
    // have synced all frames.
    fn clear_slot(attachs: &mut Vec<Attach>, index: usize, stales: &mut StaleSet) {
        if index >= attachs.len() {
            return;
        }
        if let Attach::Image(image) = &mut attachs[index] {
            retire_backings(image, stales);
        }
        attachs[index] = Attach::Empty;
    }

    /// Describe an image attachment at `index`.
    ///
    /// Retired resources land in `stales`, the caller pushes them to
    /// the frame deque.
    pub(crate) fn attach_image(
        &mut self,
        dev: &Arc<Device>,
        index: usize,
        desc: AttachmentDesc,
        stales: &mut StaleSet,
    ) -> Result<()> {
        // Resolve the format up front, attaching an unsupported
        // format should fail loudly and leave the slot alone.
        let mut fmt = desc.format;
        let depsten = fmt.has_depth() || fmt.has_stencil();
        let mut wanted = heap::vk_format_features(desc.flags, desc.usage);
        wanted |= if depsten {
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::FormatFeatureFlags::COLOR_ATTACHMENT
        };
        let min_props = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::empty(),
            optimal_tiling_features: wanted,
            buffer_features: vk::FormatFeatureFlags::empty(),
        };

        let vk_format = format::resolve_format(&dev.d_formats, &mut fmt, Some(&min_props));
        if vk_format == vk::Format::UNDEFINED {
            log::error!("No supported format for attachment {}", index);
            return Err(StratusError::INVALID_FORMAT);
        }

        let mut attachs = self.attachs.write().unwrap();
        Self::grow_to(&mut attachs, index);
        Self::clear_slot(&mut attachs, index, stales);

        attachs[index] = Attach::Image(ImageAttach {
            base: desc,
            width: 0,
            height: 0,
            depth: 0,
            fmt: fmt,
            vk_format: vk_format,
            vk_image: vk::Image::null(),
            backings: Vec::new(),
        });

        self.state = BackingState::Invalid;
        Ok(())
    }

    /// Attach a window (i.e. swapchain) at `index`, taking ownership
    /// of the surface.
    pub(crate) fn attach_window(
        &mut self,
        dev: &Arc<Device>,
        index: usize,
        surface: vk::SurfaceKHR,
        stales: &mut StaleSet,
    ) -> Result<()> {
        let swapchain = Swapchain::new(dev.clone(), surface)?;

        let mut attachs = self.attachs.write().unwrap();
        Self::grow_to(&mut attachs, index);
        Self::clear_slot(&mut attachs, index, stales);

        attachs[index] = Attach::Window(WindowAttach {
            swapchain: swapchain,
            flags: RecreateFlags::empty(),
        });

        self.state = BackingState::Invalid;
        Ok(())
    }

    /// Detach whatever sits at `index`.
    pub(crate) fn detach(&mut self, index: usize, stales: &mut StaleSet) {
        let mut attachs = self.attachs.write().unwrap();
        Self::clear_slot(&mut attachs, index, stales);
        self.state = BackingState::Invalid;
    }

    // Resolve the extent of relative-sized attachments: the first
    // window attachment dictates it.
    fn window_extent(attachs: &[Attach]) -> Option<vk::Extent2D> {
        attachs.iter().find_map(|a| match a {
            Attach::Window(w) => Some(w.swapchain.extent()),
            _ => None,
        })
    }

    /// Build not yet built backing resources. Resolves to a no-op if
    /// everything is already built.
    pub(crate) fn build(&mut self, dev: &Arc<Device>) -> Result<()> {
        if self.state == BackingState::Built {
            return Ok(());
        }

        let mut attachs = self.attachs.write().unwrap();

        // Validate: resolve the size of every image attachment.
        let window_extent = Self::window_extent(&attachs);
        for (i, attach) in attachs.iter_mut().enumerate() {
            if let Attach::Image(image) = attach {
                let (w, h, d) = match image.base.size {
                    AttachSize::Absolute(w, h, d) => (w, h, d),
                    AttachSize::SwapchainRelative => match window_extent {
                        Some(e) => (e.width, e.height, 1),
                        None => {
                            log::error!(
                                "Attachment {} is sized relative to a window, but none is attached",
                                i
                            );
                            return Err(StratusError::INVALID);
                        }
                    },
                };

                // A size change makes the current backing stale, but
                // retirement is rebuild's job; building only fills
                // empty slots.
                image.width = w;
                image.height = h;
                image.depth = d;
            }
        }
        self.state = BackingState::Validated;

        for attach in attachs.iter_mut() {
            if let Attach::Image(image) = attach {
                if image.backings.is_empty() {
                    let backing = create_backing(dev, image)?;
                    image.vk_image = backing.vk_image;
                    image.backings.insert(0, backing);
                }
            }
        }

        self.state = BackingState::Built;
        Ok(())
    }

    /// (Re)build backing resources dependent on the attachment at
    /// `index`, suitable for on-swapchain-recreate. All frames must
    /// be synced by the caller.
    ///
    /// Returns the recreate flags describing what changed, plus every
    /// attachment index whose images were replaced (a window resize
    /// drags all swapchain-relative images along).
    pub(crate) fn rebuild(
        &mut self,
        dev: &Arc<Device>,
        index: usize,
        stales: &mut StaleSet,
    ) -> Result<(RecreateFlags, Vec<usize>)> {
        let mut attachs = self.attachs.write().unwrap();

        let (flags, window_resized) = match attachs.get_mut(index) {
            Some(Attach::Window(window)) => {
                let flags = window.swapchain.recreate()?;
                window.flags = RecreateFlags::empty();
                (flags, flags.contains(RecreateFlags::RESIZE))
            }
            Some(Attach::Image(_)) => (RecreateFlags::RECREATE | RecreateFlags::RESIZE, false),
            _ => {
                log::error!("Rebuilding a non-existent attachment {}", index);
                return Err(StratusError::INVALID);
            }
        };

        // Push the old images of the rebuilt attachment (and of every
        // relative-sized image if the window resized) to the stale
        // queue, then recreate them at the new size.
        let mut affected = vec![index];
        let window_extent = Self::window_extent(&attachs);
        for (i, attach) in attachs.iter_mut().enumerate() {
            if let Attach::Image(image) = attach {
                let hit = i == index
                    || (window_resized && image.base.size == AttachSize::SwapchainRelative);
                if !hit {
                    continue;
                }

                retire_backings(image, stales);

                if let (AttachSize::SwapchainRelative, Some(e)) = (image.base.size, window_extent) {
                    image.width = e.width;
                    image.height = e.height;
                    image.depth = 1;
                }

                let backing = create_backing(dev, image)?;
                image.vk_image = backing.vk_image;
                image.backings.insert(0, backing);

                if i != index {
                    affected.push(i);
                }
            }
        }

        Ok((flags, affected))
    }

    /// Immediately retire the backings of the attachment at `index`.
    /// Must be called before detaching it.
    pub(crate) fn destruct(&mut self, index: usize, stales: &mut StaleSet) {
        let mut attachs = self.attachs.write().unwrap();
        if let Some(Attach::Image(image)) = attachs.get_mut(index) {
            retire_backings(image, stales);
        }

        if self.state > BackingState::Validated {
            self.state = BackingState::Validated;
        }
    }

    /// Destroy every attachment. Frames must be synced.
    pub(crate) fn clear(&mut self, stales: &mut StaleSet) {
        let mut attachs = self.attachs.write().unwrap();
        for attach in attachs.iter_mut() {
            if let Attach::Image(image) = attach {
                retire_backings(image, stales);
            }
        }
        attachs.clear();
        self.state = BackingState::Built;
    }
}
