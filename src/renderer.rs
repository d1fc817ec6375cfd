// The renderer
//
// Ties the backing (attachments), the render graph (passes) and the
// virtual frame deque together, and owns the shared state passes
// reach back into: the device, the attachment vector, the render
// pass cache and the stale queue.

use ash::vk;

extern crate utils;
use crate::backing::{Attach, AttachList, AttachmentDesc, Backing};
use crate::dependency::{self, Inject, Injection};
use crate::device::Device;
use crate::frame::{retire_stales, Frame, Stale, StaleSet};
use crate::graph::Graph;
use crate::pass::Pass;
use crate::reference::Reference;
use crate::swapchain::RecreateFlags;
use crate::{Result, StratusError};
use utils::log;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

// Render passes are shared between passes with an identical
// description; the key captures everything that matters about one.
type RenderPassKey = Vec<(i32, i32, i32, i32)>;

/// State shared between the renderer and its passes.
pub(crate) struct RendererShared {
    pub(crate) dev: Arc<Device>,
    pub(crate) attachs: AttachList,

    pub(crate) pass_cache: Mutex<HashMap<RenderPassKey, vk::RenderPass>>,
    pub(crate) stales: Mutex<VecDeque<Stale>>,
    /// Index of the most recently acquired virtual frame; stale
    /// resources get tagged with it.
    pub(crate) current_frame: AtomicU32,
}

impl RendererShared {
    /// Queue handles for destruction once the current frame slot
    /// cycles around again.
    pub(crate) fn push_stale(&self, set: StaleSet) {
        if set.is_empty() {
            return;
        }

        self.stales.lock().unwrap().push_back(Stale {
            frame_index: self.current_frame.load(Ordering::Acquire),
            set: set,
        });
    }

    /// Fetch or create the render pass matching a description.
    pub(crate) fn get_render_pass(
        &self,
        descs: &[vk::AttachmentDescription],
        depsten: &[bool],
    ) -> Result<vk::RenderPass> {
        let key: RenderPassKey = descs
            .iter()
            .map(|d| {
                (
                    d.format.as_raw(),
                    d.load_op.as_raw(),
                    d.initial_layout.as_raw(),
                    d.final_layout.as_raw(),
                )
            })
            .collect();

        let mut cache = self.pass_cache.lock().unwrap();
        if let Some(render_pass) = cache.get(&key) {
            return Ok(*render_pass);
        }

        let mut color_refs = Vec::new();
        let mut depth_ref = None;
        for (i, is_depsten) in depsten.iter().enumerate() {
            if *is_depsten {
                depth_ref.get_or_insert(vk::AttachmentReference {
                    attachment: i as u32,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                });
            } else {
                color_refs.push(vk::AttachmentReference {
                    attachment: i as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
            }
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(descs)
            .subpasses(&subpasses)
            .build();

        let render_pass = unsafe {
            self.dev
                .dev
                .create_render_pass(&info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?
        };
        cache.insert(key, render_pass);

        Ok(render_pass)
    }
}

/// Everything a recorder needs to write draw commands for one pass.
pub struct RecordInfo<'a> {
    pub cmd: vk::CommandBuffer,
    pub pass: &'a Pass,
    /// Index of the virtual frame being recorded.
    pub frame: u32,
    pub width: u32,
    pub height: u32,
}

/// The recording seam: the renderer drives the frame, a recorder
/// writes the actual draw commands of each pass.
pub trait Recorder {
    fn record(&mut self, info: &RecordInfo);
}

/// A renderer: attachments, a render graph, and an N-buffered
/// virtual frame pipeline driving a window (or images) on a device.
pub struct Renderer {
    r_shared: Arc<RendererShared>,
    r_backing: Backing,
    r_graph: Graph,

    /// The frame deque; acquire pops the front, submit pushes back.
    r_frames: VecDeque<Frame>,
    /// The public frame, in between acquire and submit.
    r_pframe: Option<Frame>,

    /// A fatal backend error was hit, further submissions fail.
    r_degraded: bool,
}

impl Renderer {
    pub(crate) fn new(dev: Arc<Device>, num_frames: u32) -> Result<Self> {
        if num_frames == 0 {
            log::error!("A renderer needs at least one virtual frame");
            return Err(StratusError::INVALID);
        }

        let backing = Backing::new();
        let shared = Arc::new(RendererShared {
            dev: dev.clone(),
            attachs: backing.attachs.clone(),
            pass_cache: Mutex::new(HashMap::new()),
            stales: Mutex::new(VecDeque::new()),
            current_frame: AtomicU32::new(0),
        });

        let mut frames = VecDeque::with_capacity(num_frames as usize);
        for i in 0..num_frames {
            frames.push_back(Frame::new(&dev, i)?);
        }

        Ok(Self {
            r_shared: shared,
            r_backing: backing,
            r_graph: Graph::new(),
            r_frames: frames,
            r_pframe: None,
            r_degraded: false,
        })
    }

    fn dev(&self) -> &Arc<Device> {
        &self.r_shared.dev
    }

    /// Block until all frames in the virtual frame deque are done.
    pub fn wait(&mut self) -> Result<()> {
        let dev = self.r_shared.dev.clone();
        for frame in self.r_frames.iter_mut() {
            frame.sync(&dev)?;
        }
        Ok(())
    }

    /// Attach an image at the given attachment index.
    ///
    /// Must not be called between acquire and submit.
    pub fn attach_image(&mut self, index: usize, desc: AttachmentDesc) -> Result<()> {
        assert!(self.r_pframe.is_none(), "cannot attach mid-frame");

        // Destruct all passes using this attachment first.
        self.r_graph.destruct(index);

        let dev = self.r_shared.dev.clone();
        let mut stales = StaleSet::new();
        let res = self.r_backing.attach_image(&dev, index, desc, &mut stales);
        self.r_shared.push_stale(stales);

        res
    }

    /// Attach a window at the given attachment index, taking
    /// ownership of the surface.
    ///
    /// Must not be called between acquire and submit.
    pub fn attach_window(&mut self, index: usize, surface: vk::SurfaceKHR) -> Result<()> {
        assert!(self.r_pframe.is_none(), "cannot attach mid-frame");

        // The previous window at this slot dies immediately, frames
        // must not be using it anymore.
        self.wait()?;
        self.r_graph.destruct(index);

        let dev = self.r_shared.dev.clone();
        let mut stales = StaleSet::new();
        let res = self
            .r_backing
            .attach_window(&dev, index, surface, &mut stales);
        self.r_shared.push_stale(stales);

        res
    }

    /// Detach whatever is attached at `index`.
    pub fn detach(&mut self, index: usize) -> Result<()> {
        assert!(self.r_pframe.is_none(), "cannot detach mid-frame");

        self.wait()?;

        // Destruct everything depending on the attachment before the
        // attachment itself goes away.
        self.r_graph.destruct(index);

        let mut stales = StaleSet::new();
        self.r_backing.destruct(index, &mut stales);
        self.r_backing.detach(index, &mut stales);

        // Everything is synced, no reason to defer destruction.
        stales.destroy(self.dev());
        Ok(())
    }

    /// A reference to the image attachment at `index`.
    pub fn attachment_ref(&self, index: usize) -> Reference {
        Reference::attachment(self.r_shared.attachs.clone(), index)
    }

    /// Add a pass to the render graph, as a child of `parents`.
    pub fn add_pass(&mut self, parents: &[Arc<Pass>]) -> Result<Arc<Pass>> {
        assert!(self.r_pframe.is_none(), "cannot edit the graph mid-frame");
        self.r_graph.add_pass(Arc::downgrade(&self.r_shared), parents)
    }

    pub fn num_sinks(&self) -> usize {
        self.r_graph.num_sinks()
    }

    pub fn sink(&self, index: usize) -> Option<Arc<Pass>> {
        self.r_graph.sink(index)
    }

    /// Force a purge and re-analysis at the next warmup/build.
    pub fn invalidate(&mut self) {
        self.r_graph.invalidate();
    }

    /// Warm up the graph: backend render passes exist afterwards, so
    /// pipelines can be derived before the first frame.
    pub fn warmup(&mut self) -> Result<()> {
        let dev = self.r_shared.dev.clone();
        self.r_backing.build(&dev)?;
        self.r_graph.warmup()
    }

    /// Build the backing and the graph. Done implicitly by acquire.
    pub fn build(&mut self) -> Result<()> {
        let dev = self.r_shared.dev.clone();
        self.r_backing.build(&dev)?;
        self.r_graph.build()
    }

    // Rebuild attachment `index` and everything using it after a
    // swapchain event. Every frame must already be synced.
    fn recreate(&mut self, index: usize) -> Result<()> {
        let dev = self.r_shared.dev.clone();

        let mut stales = StaleSet::new();
        let (flags, affected) = self.r_backing.rebuild(&dev, index, &mut stales)?;
        self.r_shared.push_stale(stales);

        // Every attachment whose images were replaced invalidates the
        // passes using it.
        for index in affected.into_iter() {
            self.r_graph.rebuild(index, flags | RecreateFlags::RECREATE);
        }
        Ok(())
    }

    // Sync all frames (including the one being acquired) so a
    // recreate can safely retire swapchain resources.
    fn sync_all(&mut self, acquiring: &mut Frame) -> Result<()> {
        let dev = self.r_shared.dev.clone();
        acquiring.sync(&dev)?;
        for frame in self.r_frames.iter_mut() {
            frame.sync(&dev)?;
        }
        Ok(())
    }

    /// Acquire the next virtual frame: reclaim its stale resources,
    /// make sure backing and graph are built, and acquire a swapchain
    /// image for every window attachment.
    ///
    /// Strictly alternates with submit.
    pub fn acquire(&mut self) -> Result<()> {
        assert!(self.r_pframe.is_none(), "acquire and submit alternate");

        let dev = self.r_shared.dev.clone();
        let mut frame = self
            .r_frames
            .pop_front()
            .expect("the frame deque cannot be empty");

        let res = (|| -> Result<()> {
            frame.sync(&dev)?;

            // This slot's fence has signaled, its stale resources
            // cannot be referenced anymore.
            let retired = {
                let mut stales = self.r_shared.stales.lock().unwrap();
                retire_stales(&mut stales, frame.index)
            };
            for stale in retired.into_iter() {
                stale.set.destroy(&dev);
            }

            // Handle swapchain events flagged by earlier submissions.
            let flagged: Vec<usize> = {
                let attachs = self.r_shared.attachs.read().unwrap();
                attachs
                    .iter()
                    .enumerate()
                    .filter_map(|(i, a)| match a {
                        Attach::Window(w) if w.flags.contains(RecreateFlags::RECREATE) => Some(i),
                        _ => None,
                    })
                    .collect()
            };
            if !flagged.is_empty() {
                self.sync_all(&mut frame)?;
                for index in flagged.into_iter() {
                    self.recreate(index)?;
                }
            }

            self.r_backing.build(&dev)?;
            self.r_graph.build()?;
            frame.resync(&dev, &self.r_shared.attachs)?;

            // Acquire swapchain images, rebuilding on the fly when a
            // swapchain turns out to be out of date.
            loop {
                match frame.acquire_images(&self.r_shared.attachs) {
                    Ok(()) => break,
                    Err(index) => {
                        self.sync_all(&mut frame)?;
                        frame.reset_semaphores(&dev)?;
                        self.recreate(index)?;
                        self.r_backing.build(&dev)?;
                        self.r_graph.build()?;
                    }
                }
            }

            self.r_shared
                .current_frame
                .store(frame.index, Ordering::Release);
            Ok(())
        })();

        match res {
            Ok(()) => {
                self.r_pframe = Some(frame);
                Ok(())
            }
            Err(e) => {
                self.r_frames.push_front(frame);
                Err(e)
            }
        }
    }

    // The dependency injection of a frame submission: every image
    // attachment consumed by a built pass, with its declared access.
    fn frame_injection(&self) -> Injection {
        let mut injection = Injection::with_filter(
            self.dev().d_graphics_family,
            self.r_shared.attachs.clone(),
        );

        // Collect first, unpacking takes the attachment lock itself.
        let mut consumed = Vec::new();
        {
            let attachs = self.r_shared.attachs.read().unwrap();
            for pass in self.r_graph.passes().iter() {
                let state = pass.p_state.read().unwrap();
                for consume in state.consumes.iter() {
                    if let Some(Attach::Image(_)) = attachs.get(consume.index) {
                        consumed.push((consume.index, consume.mask, consume.stages));
                    }
                }
            }
        }

        for (index, mask, stages) in consumed.into_iter() {
            let unp = Reference::attachment(self.r_shared.attachs.clone(), index).unpack();
            injection.add_ref(unp, 0, mask, stages);
        }

        injection
    }

    /// Record and submit the acquired frame: resolve the dependency
    /// injections, record every pass in submission order through the
    /// recorder, submit, and present.
    pub fn submit(&mut self, recorder: &mut dyn Recorder, injs: &[Inject]) -> Result<()> {
        let mut frame = match self.r_pframe.take() {
            Some(frame) => frame,
            None => {
                log::error!("submit without a matching acquire");
                return Err(StratusError::INVALID);
            }
        };

        if self.r_degraded {
            self.r_frames.push_back(frame);
            return Err(StratusError::DEVICE_LOST);
        }

        let dev = self.r_shared.dev.clone();
        let mut injection = self.frame_injection();

        let res = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .build();
            unsafe {
                dev.dev
                    .begin_command_buffer(frame.cmd, &begin_info)
                    .map_err(|_| StratusError::SUBMIT_FAILED)?;
            }

            dependency::deps_catch(&dev, frame.cmd, injs, &mut injection)?;
            dependency::deps_prepare(&dev, frame.cmd, false, injs, &mut injection)?;

            // Record all passes in submission order.
            for pass in self.r_graph.passes().iter() {
                let render_pass = pass.render_pass();
                let framebuffer = pass.framebuffer(&frame);
                let build = pass.p_build.read().unwrap();
                let (width, height) = (build.fwidth, build.fheight);
                let clears = build.clear_values.clone();
                drop(build);

                let info = RecordInfo {
                    cmd: frame.cmd,
                    pass: pass,
                    frame: frame.index,
                    width: width,
                    height: height,
                };

                if render_pass != vk::RenderPass::null()
                    && framebuffer != vk::Framebuffer::null()
                {
                    let begin = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass)
                        .framebuffer(framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: vk::Extent2D {
                                width: width,
                                height: height,
                            },
                        })
                        .clear_values(&clears)
                        .build();

                    unsafe {
                        dev.dev.cmd_begin_render_pass(
                            frame.cmd,
                            &begin,
                            vk::SubpassContents::INLINE,
                        );
                    }
                    recorder.record(&info);
                    unsafe {
                        dev.dev.cmd_end_render_pass(frame.cmd);
                    }
                } else {
                    // No attachments; the pass may still record
                    // compute or transfer work.
                    recorder.record(&info);
                }
            }

            unsafe {
                dev.dev
                    .end_command_buffer(frame.cmd)
                    .map_err(|_| StratusError::SUBMIT_FAILED)?;
            }

            // Wait on every acquired swapchain image plus whatever
            // the injections gathered.
            let mut waits: Vec<vk::Semaphore> = Vec::new();
            let mut stages: Vec<vk::PipelineStageFlags> = Vec::new();
            for sync in frame.syncs.iter() {
                if sync.image.is_some() {
                    waits.push(sync.available);
                    stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
                }
            }
            waits.extend_from_slice(injection.out_waits());
            stages.extend_from_slice(injection.out_stages());

            let mut sigs: Vec<vk::Semaphore> = vec![frame.rendered];
            sigs.extend_from_slice(injection.out_sigs());

            let cmds = [frame.cmd];
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&cmds)
                .wait_semaphores(&waits)
                .wait_dst_stage_mask(&stages)
                .signal_semaphores(&sigs)
                .build();

            dev.queue_submit(dev.d_graphics_family, &[submit_info], frame.done)?;
            frame.submitted = true;

            Ok(())
        })();

        if let Err(e) = res {
            dependency::deps_abort(injs, &mut injection);
            if e == StratusError::DEVICE_LOST {
                self.r_degraded = true;
            }
            self.r_frames.push_back(frame);
            return Err(e);
        }

        dependency::deps_finish(injs, &mut injection);

        // Present every acquired window image, flagging swapchains
        // that went stale for the next acquire.
        let present_res = self.present_frame(&frame);

        self.r_frames.push_back(frame);
        present_res
    }

    // Present all window attachments of a submitted frame in one
    // shot, waiting on its `rendered` semaphore.
    fn present_frame(&mut self, frame: &Frame) -> Result<()> {
        let queue = self.dev().graphics_queue();
        let mut attachs = self.r_shared.attachs.write().unwrap();

        let mut targets: Vec<(usize, vk::SwapchainKHR, u32)> = Vec::new();
        for sync in frame.syncs.iter() {
            if let Some(image) = sync.image {
                if let Some(Attach::Window(window)) = attachs.get(sync.backing) {
                    targets.push((sync.backing, window.swapchain.handle(), image));
                }
            }
        }

        if targets.is_empty() {
            return Ok(());
        }

        let loader = match attachs.get(targets[0].0) {
            Some(Attach::Window(window)) => window.swapchain.loader().clone(),
            _ => return Err(StratusError::INVALID),
        };

        let wait_semas = [frame.rendered];
        let swapchains: Vec<vk::SwapchainKHR> = targets.iter().map(|t| t.1).collect();
        let indices: Vec<u32> = targets.iter().map(|t| t.2).collect();
        let mut results = vec![vk::Result::SUCCESS; targets.len()];

        let mut info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();
        info.p_results = results.as_mut_ptr();

        let overall = unsafe { loader.queue_present(queue, &info) };

        // Flag every out-of-date swapchain for the next acquire.
        let mut fatal = false;
        for ((index, _, _), result) in targets.iter().zip(results.iter()) {
            match *result {
                vk::Result::SUCCESS => {}
                vk::Result::SUBOPTIMAL_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR => {
                    if let Some(Attach::Window(window)) = attachs.get_mut(*index) {
                        window.flags |= RecreateFlags::RECREATE;
                    }
                }
                _ => fatal = true,
            }
        }

        match overall {
            Ok(_) | Err(vk::Result::SUBOPTIMAL_KHR) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
                if !fatal =>
            {
                Ok(())
            }
            _ => {
                log::error!("Presentation failed fatally");
                self.r_degraded = true;
                Err(StratusError::PRESENT_FAILED)
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let dev = self.r_shared.dev.clone();

        // Frames first: nothing may be in flight while we destroy.
        if let Some(mut frame) = self.r_pframe.take() {
            frame.sync(&dev).ok();
            frame.clear(&dev);
        }
        for frame in self.r_frames.iter_mut() {
            frame.sync(&dev).ok();
        }

        // Children before parents, and attachments after passes.
        self.r_graph.clear();
        let mut stales = StaleSet::new();
        self.r_backing.clear(&mut stales);
        stales.destroy(&dev);

        // Everything is synced, drain the stale queue for real.
        let mut queued = self.r_shared.stales.lock().unwrap();
        while let Some(stale) = queued.pop_front() {
            stale.set.destroy(&dev);
        }
        drop(queued);

        for frame in self.r_frames.iter_mut() {
            frame.clear(&dev);
        }

        let mut cache = self.r_shared.pass_cache.lock().unwrap();
        unsafe {
            for (_, render_pass) in cache.drain() {
                dev.dev.destroy_render_pass(render_pass, None);
            }
        }
    }
}
