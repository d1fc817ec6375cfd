// Passes, the nodes of the render graph
//
// A pass declares which attachments it consumes and with what
// access. Warming a pass up materializes a backend render pass
// (shared through the renderer's cache, passes with an identical
// description get the same handle), building it creates the
// per-swapchain-image framebuffers.

use ash::vk;

extern crate utils;
use crate::access::{AccessMask, ShaderStage};
use crate::backing::Attach;
use crate::frame::{Frame, StaleSet};
use crate::reference::Range;
use crate::renderer::RendererShared;
use crate::swapchain::RecreateFlags;
use crate::{Result, StratusError};
use utils::log;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// How an attachment is viewed by shaders.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewType {
    D1,
    D1Array,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

/// Depth test comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    Always,
}

/// The vulkan comparison op, for recorders deriving pipeline state.
pub fn vk_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

/// Depth state of a pass. Consumed by recorders when they derive
/// their pipeline state.
#[derive(Copy, Clone, Debug)]
pub struct DepthState {
    pub write: bool,
    pub cmp: CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            write: true,
            cmp: CompareOp::Less,
        }
    }
}

/// Stencil state of a pass.
#[derive(Copy, Clone, Debug, Default)]
pub struct StencilState {
    pub test: bool,
}

/// One consume declaration.
#[derive(Clone)]
pub(crate) struct Consume {
    pub(crate) index: usize,
    pub(crate) mask: AccessMask,
    pub(crate) stages: ShaderStage,
    pub(crate) range: Option<Range>,
    pub(crate) view: Option<ViewType>,
}

pub(crate) struct PassState {
    pub(crate) consumes: Vec<Consume>,
    pub(crate) depth: DepthState,
    pub(crate) stencil: StencilState,
}

/// Building output, invalidated by destruct.
pub(crate) struct PassBuild {
    /// Window attachment index written as back-buffer.
    pub(crate) backing: Option<usize>,
    /// Depth/stencil attachment index.
    pub(crate) dep_sten: Option<usize>,
    pub(crate) fwidth: u32,
    pub(crate) fheight: u32,

    /// Cached in the renderer, not owned by the pass.
    pub(crate) render_pass: vk::RenderPass,
    /// One per swapchain image of the backing window.
    pub(crate) framebuffers: Vec<vk::Framebuffer>,
    /// One clear value per framebuffer attachment.
    pub(crate) clear_values: Vec<vk::ClearValue>,
}

/// A node in the render graph, producing one render pass submission.
pub struct Pass {
    pub(crate) p_shared: Weak<RendererShared>,

    /// Longest parent chain, determines submission order.
    pub(crate) p_level: u32,
    pub(crate) p_parents: Vec<Weak<Pass>>,

    /// Actual submission order, dense, set at build.
    pub(crate) p_order: AtomicU32,
    /// Build generation, bumped on every successful (re)build so
    /// cached pipelines can be invalidated.
    pub(crate) p_gen: AtomicU64,

    pub(crate) p_state: RwLock<PassState>,
    pub(crate) p_build: RwLock<PassBuild>,
}

impl Pass {
    pub(crate) fn new(
        shared: Weak<RendererShared>,
        level: u32,
        parents: Vec<Weak<Pass>>,
    ) -> Self {
        Self {
            p_shared: shared,
            p_level: level,
            p_parents: parents,
            p_order: AtomicU32::new(0),
            p_gen: AtomicU64::new(0),
            p_state: RwLock::new(PassState {
                consumes: Vec::new(),
                depth: DepthState::default(),
                stencil: StencilState::default(),
            }),
            p_build: RwLock::new(PassBuild {
                backing: None,
                dep_sten: None,
                fwidth: 0,
                fheight: 0,
                render_pass: vk::RenderPass::null(),
                framebuffers: Vec::new(),
                clear_values: Vec::new(),
            }),
        }
    }

    pub fn level(&self) -> u32 {
        self.p_level
    }

    pub fn order(&self) -> u32 {
        self.p_order.load(Ordering::Acquire)
    }

    pub fn gen(&self) -> u64 {
        self.p_gen.load(Ordering::Acquire)
    }

    pub fn depth_state(&self) -> DepthState {
        self.p_state.read().unwrap().depth
    }

    pub fn stencil_state(&self) -> StencilState {
        self.p_state.read().unwrap().stencil
    }

    pub fn set_depth_state(&self, depth: DepthState) {
        self.p_state.write().unwrap().depth = depth;
    }

    pub fn set_stencil_state(&self, stencil: StencilState) {
        self.p_state.write().unwrap().stencil = stencil;
    }

    pub(crate) fn is_parent(&self, other: &Arc<Pass>) -> bool {
        self.p_parents
            .iter()
            .any(|p| p.upgrade().map_or(false, |p| Arc::ptr_eq(&p, other)))
    }

    /// Declare that this pass accesses the attachment at `index`.
    /// Replaces any previous declaration for the same attachment.
    ///
    /// Declarations made after a build take effect at the next
    /// (re)build of the graph.
    pub fn consume(&self, index: usize, mask: AccessMask, stages: ShaderStage) {
        self.consume_range(index, mask, stages, None)
    }

    /// Like consume, but restricted to a range of the attachment.
    pub fn consume_range(
        &self,
        index: usize,
        mask: AccessMask,
        stages: ShaderStage,
        range: Option<Range>,
    ) {
        let mut state = self.p_state.write().unwrap();
        state.consumes.retain(|c| c.index != index);
        state.consumes.push(Consume {
            index: index,
            mask: mask,
            stages: stages,
            range: range,
            view: None,
        });
    }

    /// Declare the view type an existing consume is accessed through.
    pub fn use_view(&self, index: usize, view: ViewType) {
        let mut state = self.p_state.write().unwrap();
        match state.consumes.iter_mut().find(|c| c.index == index) {
            Some(consume) => consume.view = Some(view),
            None => log::error!("Pass does not consume attachment {}", index),
        }
    }

    /// Undeclare a consume.
    pub fn release(&self, index: usize) {
        let mut state = self.p_state.write().unwrap();
        state.consumes.retain(|c| c.index != index);
    }

    pub(crate) fn consumes_attachment(&self, index: usize) -> bool {
        self.p_state
            .read()
            .unwrap()
            .consumes
            .iter()
            .any(|c| c.index == index)
    }

    // The attachment descriptions this pass renders over, derived
    // from its consumes: (format, load op, initial/final layout,
    // view handleset, is depth/stencil).
    fn describe_attachments(
        &self,
        shared: &RendererShared,
    ) -> Result<(Vec<vk::AttachmentDescription>, Vec<bool>)> {
        let state = self.p_state.read().unwrap();
        let attachs = shared.attachs.read().unwrap();

        let mut descs = Vec::new();
        let mut depsten = Vec::new();
        let mut have_window = false;

        for consume in state.consumes.iter() {
            if !consume.mask.intersects(
                AccessMask::ATTACHMENT_READ
                    | AccessMask::ATTACHMENT_WRITE
                    | AccessMask::ATTACHMENT_INPUT,
            ) {
                continue;
            }

            let (format, is_depsten, final_layout) = match attachs.get(consume.index) {
                // Only one window can back a pass, extras are dropped
                // here so the framebuffer stays in step.
                Some(Attach::Window(_)) if have_window => continue,
                Some(Attach::Window(window)) => {
                    have_window = true;
                    (
                        window.swapchain.s_surface_format.format,
                        false,
                        vk::ImageLayout::PRESENT_SRC_KHR,
                    )
                }
                Some(Attach::Image(image)) => {
                    let ds = image.fmt.has_depth() || image.fmt.has_stencil();
                    let layout = crate::access::vk_image_layout(consume.mask, &image.fmt);
                    (image.vk_format, ds, layout)
                }
                _ => {
                    log::error!(
                        "Pass consumes attachment {}, which does not exist",
                        consume.index
                    );
                    return Err(StratusError::INVALID);
                }
            };

            // Reads load the previous contents, writes clear unless
            // told the contents may be discarded.
            let load_op = if consume
                .mask
                .intersects(AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_INPUT)
            {
                vk::AttachmentLoadOp::LOAD
            } else if consume.mask.contains(AccessMask::DISCARD) {
                vk::AttachmentLoadOp::DONT_CARE
            } else {
                vk::AttachmentLoadOp::CLEAR
            };
            let initial_layout = if load_op == vk::AttachmentLoadOp::LOAD {
                final_layout
            } else {
                vk::ImageLayout::UNDEFINED
            };

            descs.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(final_layout)
                    .build(),
            );
            depsten.push(is_depsten);
        }

        Ok((descs, depsten))
    }

    /// Build the backend render pass if not present yet. Can be used
    /// for pipeline warmups before any framebuffer exists.
    pub(crate) fn warmup(&self) -> Result<()> {
        let shared = self.p_shared.upgrade().ok_or(StratusError::INVALID)?;

        if self.p_build.read().unwrap().render_pass != vk::RenderPass::null() {
            return Ok(());
        }

        let (descs, depsten) = self.describe_attachments(&shared)?;
        if descs.is_empty() {
            // Nothing to render over; the pass may still record
            // non-attachment work.
            return Ok(());
        }

        let render_pass = shared.get_render_pass(&descs, &depsten)?;
        self.p_build.write().unwrap().render_pass = render_pass;

        Ok(())
    }

    /// (Re)build all vulkan objects of this pass.
    ///
    /// `flags` names what changed on a swapchain recreate, zero
    /// builds whatever is missing.
    pub(crate) fn build(&self, flags: RecreateFlags) -> Result<()> {
        let shared = self.p_shared.upgrade().ok_or(StratusError::INVALID)?;

        if !flags.is_empty() {
            self.destruct();
            if flags.contains(RecreateFlags::FORMAT) {
                // The cached description no longer matches.
                self.p_build.write().unwrap().render_pass = vk::RenderPass::null();
            }
        } else if !self.p_build.read().unwrap().framebuffers.is_empty() {
            // Already built.
            return Ok(());
        }

        self.warmup()?;

        let state = self.p_state.read().unwrap();
        let attachs = shared.attachs.read().unwrap();

        // Select the window back-buffer, the depth/stencil attachment
        // and the framebuffer extent from the consumes.
        let mut backing = None;
        let mut dep_sten = None;
        let mut extent = (0u32, 0u32);
        let mut views: Vec<Option<vk::ImageView>> = Vec::new();
        let mut window_views: Option<&Vec<vk::ImageView>> = None;
        let mut clears: Vec<vk::ClearValue> = Vec::new();

        let color_clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        };
        let depth_clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };

        for consume in state.consumes.iter() {
            if !consume.mask.intersects(
                AccessMask::ATTACHMENT_READ
                    | AccessMask::ATTACHMENT_WRITE
                    | AccessMask::ATTACHMENT_INPUT,
            ) {
                continue;
            }

            match attachs.get(consume.index) {
                Some(Attach::Window(window)) => {
                    if backing.is_some() {
                        log::error!(
                            "Pass consumes multiple window attachments, using the first"
                        );
                        continue;
                    }
                    backing = Some(consume.index);
                    let e = window.swapchain.extent();
                    extent = (e.width, e.height);
                    window_views = Some(&window.swapchain.s_views);
                    views.push(None); // filled per swapchain image
                    clears.push(color_clear);
                }
                Some(Attach::Image(image)) => {
                    if image.fmt.has_depth() || image.fmt.has_stencil() {
                        dep_sten.get_or_insert(consume.index);
                        clears.push(depth_clear);
                    } else {
                        clears.push(color_clear);
                    }
                    if extent == (0, 0) {
                        extent = (image.width, image.height);
                    }
                    let backing_view = image
                        .backings
                        .first()
                        .map(|b| b.view)
                        .unwrap_or(vk::ImageView::null());
                    if backing_view == vk::ImageView::null() {
                        log::error!(
                            "Pass consumes attachment {}, which is not built",
                            consume.index
                        );
                        return Err(StratusError::INVALID);
                    }
                    views.push(Some(backing_view));
                }
                _ => {
                    log::error!(
                        "Pass consumes attachment {}, which does not exist",
                        consume.index
                    );
                    return Err(StratusError::INVALID);
                }
            }
        }

        let render_pass = self.p_build.read().unwrap().render_pass;
        let mut framebuffers = Vec::new();

        if render_pass != vk::RenderPass::null() && !views.is_empty() {
            // One framebuffer per swapchain image, or a single one
            // for a purely image-backed pass.
            let image_count = window_views.map(|v| v.len()).unwrap_or(1);

            for i in 0..image_count {
                let fb_views: Vec<vk::ImageView> = views
                    .iter()
                    .map(|v| v.unwrap_or_else(|| window_views.unwrap()[i]))
                    .collect();

                let info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&fb_views)
                    .width(extent.0)
                    .height(extent.1)
                    .layers(1)
                    .build();

                let fb = unsafe {
                    shared
                        .dev
                        .dev
                        .create_framebuffer(&info, None)
                        .map_err(|_| StratusError::OUT_OF_MEMORY)?
                };
                framebuffers.push(fb);
            }
        }

        let mut build = self.p_build.write().unwrap();
        build.backing = backing;
        build.dep_sten = dep_sten;
        build.fwidth = extent.0;
        build.fheight = extent.1;
        build.framebuffers = framebuffers;
        build.clear_values = clears;
        drop(build);

        // Bump the generation so stale pipelines are re-derived.
        self.p_gen.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    /// The framebuffer matching the frame's currently acquired
    /// swapchain image, or null if unknown (e.g. before acquire).
    pub(crate) fn framebuffer(&self, frame: &Frame) -> vk::Framebuffer {
        let build = self.p_build.read().unwrap();

        match build.backing {
            Some(backing) => match frame.image_index(backing) {
                Some(image) => build
                    .framebuffers
                    .get(image as usize)
                    .copied()
                    .unwrap_or(vk::Framebuffer::null()),
                None => vk::Framebuffer::null(),
            },
            None => build
                .framebuffers
                .first()
                .copied()
                .unwrap_or(vk::Framebuffer::null()),
        }
    }

    /// Destruct the pass's framebuffers (through the stale queue).
    /// The render pass cache entry stays alive.
    pub(crate) fn destruct(&self) {
        let mut build = self.p_build.write().unwrap();

        if !build.framebuffers.is_empty() {
            if let Some(shared) = self.p_shared.upgrade() {
                let mut stales = StaleSet::new();
                stales.framebuffers = std::mem::take(&mut build.framebuffers);
                shared.push_stale(stales);
            }
        }

        build.backing = None;
        build.dep_sten = None;
        build.fwidth = 0;
        build.fheight = 0;
        build.framebuffers = Vec::new();
        build.clear_values = Vec::new();
    }

    pub(crate) fn set_order(&self, order: u32) {
        self.p_order.store(order, Ordering::Release);
    }

    /// The backend render pass, for recorders deriving pipelines.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.p_build.read().unwrap().render_pass
    }
}
