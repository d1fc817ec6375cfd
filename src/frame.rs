// Virtual frames
//
// A renderer owns a deque of these. Each virtual frame has its own
// command pool, submission fence and semaphores, so while one frame
// is in flight on the GPU the next one can already be recorded.
// The stale queue also lives here: resources that must outlive their
// current frame get tagged with the frame index that retired them and
// are destroyed when that slot next comes around with its fence
// signaled.

use ash::vk;

extern crate utils;
use crate::backing::{Attach, AttachList};
use crate::device::Device;
use crate::{Result, StratusError};
use utils::log;

/// A batch of vulkan handles waiting for deferred destruction.
#[derive(Default)]
pub(crate) struct StaleSet {
    pub(crate) framebuffers: Vec<vk::Framebuffer>,
    pub(crate) image_views: Vec<vk::ImageView>,
    pub(crate) buffer_views: Vec<vk::BufferView>,
    pub(crate) command_pools: Vec<vk::CommandPool>,
    pub(crate) images: Vec<(vk::Image, vk::DeviceMemory)>,
}

impl StaleSet {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
            && self.image_views.is_empty()
            && self.buffer_views.is_empty()
            && self.command_pools.is_empty()
            && self.images.is_empty()
    }

    /// Destroy everything in the set, now.
    pub(crate) fn destroy(mut self, dev: &Device) {
        unsafe {
            for fb in self.framebuffers.drain(..) {
                dev.dev.destroy_framebuffer(fb, None);
            }
            for view in self.image_views.drain(..) {
                dev.dev.destroy_image_view(view, None);
            }
            for view in self.buffer_views.drain(..) {
                dev.dev.destroy_buffer_view(view, None);
            }
            for pool in self.command_pools.drain(..) {
                dev.dev.destroy_command_pool(pool, None);
            }
            for (image, memory) in self.images.drain(..) {
                dev.dev.destroy_image(image, None);
                if memory != vk::DeviceMemory::null() {
                    dev.dev.free_memory(memory, None);
                }
            }
        }
    }
}

/// A stale entry: handles plus the frame slot they wait for.
pub(crate) struct Stale {
    pub(crate) frame_index: u32,
    pub(crate) set: StaleSet,
}

/// Pop every stale entry waiting for the given frame slot. Called
/// when that slot is acquired again, its fence having signaled.
pub(crate) fn retire_stales(
    stales: &mut std::collections::VecDeque<Stale>,
    frame_index: u32,
) -> Vec<Stale> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < stales.len() {
        if stales[i].frame_index == frame_index {
            out.push(stales.remove(i).unwrap());
        } else {
            i += 1;
        }
    }
    out
}

/// Frame synchronization (i.e. swapchain acquisition) slot.
pub(crate) struct FrameSync {
    /// Attachment index of the window.
    pub(crate) backing: usize,
    /// Swapchain image index, None until acquired.
    pub(crate) image: Option<u32>,
    /// Signaled by the acquisition, waited on by the submission.
    pub(crate) available: vk::Semaphore,
}

/// A virtual frame.
pub(crate) struct Frame {
    pub(crate) index: u32,

    pub(crate) pool: vk::CommandPool,
    pub(crate) cmd: vk::CommandBuffer,
    /// Signals that rendering finished, consumed by presentation.
    pub(crate) rendered: vk::Semaphore,
    /// Signaled when the frame's submission completes.
    pub(crate) done: vk::Fence,
    pub(crate) submitted: bool,

    /// For each attachment index, the sync slot index (if a window).
    pub(crate) refs: Vec<Option<usize>>,
    pub(crate) syncs: Vec<FrameSync>,
}

impl Frame {
    pub(crate) fn new(dev: &Device, index: u32) -> Result<Self> {
        unsafe {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(dev.d_graphics_family)
                .build();
            let pool = dev
                .dev
                .create_command_pool(&pool_info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?;

            let cmd_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1)
                .build();
            let cmd = match dev.dev.allocate_command_buffers(&cmd_info) {
                Ok(cmds) => cmds[0],
                Err(_) => {
                    dev.dev.destroy_command_pool(pool, None);
                    return Err(StratusError::OUT_OF_MEMORY);
                }
            };

            let sema_info = vk::SemaphoreCreateInfo::builder().build();
            let rendered = dev
                .dev
                .create_semaphore(&sema_info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?;

            let fence_info = vk::FenceCreateInfo::builder().build();
            let done = dev
                .dev
                .create_fence(&fence_info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?;

            Ok(Self {
                index: index,
                pool: pool,
                cmd: cmd,
                rendered: rendered,
                done: done,
                submitted: false,
                refs: Vec::new(),
                syncs: Vec::new(),
            })
        }
    }

    /// Block until the frame's pending submission is done, then reset
    /// its fence and command pool so it can record again.
    pub(crate) fn sync(&mut self, dev: &Device) -> Result<()> {
        unsafe {
            if self.submitted {
                dev.dev
                    .wait_for_fences(&[self.done], true, u64::MAX)
                    .map_err(|_| StratusError::TIMEOUT)?;
                dev.dev
                    .reset_fences(&[self.done])
                    .map_err(|_| StratusError::INVALID)?;
                self.submitted = false;
            }

            dev.dev
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|_| StratusError::INVALID)?;
        }
        Ok(())
    }

    /// Rebuild the attachment-to-sync mapping against the current
    /// attachment vector, reusing semaphores where possible.
    pub(crate) fn resync(&mut self, dev: &Device, attachs: &AttachList) -> Result<()> {
        let list = attachs.read().unwrap();

        // Recycle the old slots' semaphores.
        let mut available: Vec<vk::Semaphore> =
            self.syncs.drain(..).map(|s| s.available).collect();

        self.refs.clear();
        self.refs.resize(list.len(), None);

        for (i, attach) in list.iter().enumerate() {
            if let Attach::Window(_) = attach {
                let sema = match available.pop() {
                    Some(s) => s,
                    None => unsafe {
                        let info = vk::SemaphoreCreateInfo::builder().build();
                        dev.dev
                            .create_semaphore(&info, None)
                            .map_err(|_| StratusError::OUT_OF_MEMORY)?
                    },
                };

                self.refs[i] = Some(self.syncs.len());
                self.syncs.push(FrameSync {
                    backing: i,
                    image: None,
                    available: sema,
                });
            }
        }

        // Extra semaphores are no longer needed.
        unsafe {
            for sema in available.drain(..) {
                dev.dev.destroy_semaphore(sema, None);
            }
        }

        Ok(())
    }

    /// Acquire a swapchain image for every window attachment.
    ///
    /// On OUT_OF_DATE the offending attachment index is reported so
    /// the renderer can rebuild and retry.
    pub(crate) fn acquire_images(&mut self, attachs: &AttachList) -> std::result::Result<(), usize> {
        let mut list = attachs.write().unwrap();

        for sync in self.syncs.iter_mut() {
            if let Some(Attach::Window(window)) = list.get_mut(sync.backing) {
                match window.swapchain.acquire(sync.available) {
                    Ok(index) => sync.image = Some(index),
                    Err(e) => {
                        log::debug!(
                            "Swapchain acquire of attachment {} failed: {:?}",
                            sync.backing,
                            e
                        );
                        sync.image = None;
                        return Err(sync.backing);
                    }
                }
            }
        }

        Ok(())
    }

    /// Replace every sync slot's semaphore with a fresh one.
    ///
    /// After a failed acquisition round some semaphores may be left
    /// signaled with nothing ever waiting on them, which makes them
    /// unusable for the retry.
    pub(crate) fn reset_semaphores(&mut self, dev: &Device) -> Result<()> {
        unsafe {
            for sync in self.syncs.iter_mut() {
                dev.dev.destroy_semaphore(sync.available, None);
                let info = vk::SemaphoreCreateInfo::builder().build();
                sync.available = dev
                    .dev
                    .create_semaphore(&info, None)
                    .map_err(|_| StratusError::OUT_OF_MEMORY)?;
                sync.image = None;
            }
        }
        Ok(())
    }

    /// The acquired swapchain image index of an attachment.
    pub(crate) fn image_index(&self, backing: usize) -> Option<u32> {
        self.refs
            .get(backing)
            .copied()
            .flatten()
            .and_then(|s| self.syncs[s].image)
    }

    /// Destroy the frame. It must be synced.
    pub(crate) fn clear(&mut self, dev: &Device) {
        unsafe {
            for sync in self.syncs.drain(..) {
                dev.dev.destroy_semaphore(sync.available, None);
            }
            dev.dev.destroy_semaphore(self.rendered, None);
            dev.dev.destroy_fence(self.done, None);
            dev.dev.destroy_command_pool(self.pool, None);
        }
        self.refs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn stale(frame_index: u32) -> Stale {
        let mut set = StaleSet::new();
        set.framebuffers.push(vk::Framebuffer::null());
        Stale {
            frame_index: frame_index,
            set: set,
        }
    }

    #[test]
    fn stales_wait_for_their_slot() {
        let mut stales = VecDeque::new();

        // Pushed while frame 1 was the youngest acquired.
        stales.push_back(stale(1));
        stales.push_back(stale(1));
        stales.push_back(stale(0));

        // Acquiring frame 0 only reclaims frame 0's entries.
        assert_eq!(retire_stales(&mut stales, 0).len(), 1);
        assert_eq!(stales.len(), 2);

        // Nothing for frame 2.
        assert!(retire_stales(&mut stales, 2).is_empty());

        // Cycling back to slot 1 reclaims the rest.
        assert_eq!(retire_stales(&mut stales, 1).len(), 2);
        assert!(stales.is_empty());
    }
}
