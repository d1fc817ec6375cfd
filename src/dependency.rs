// Dependency injection
//
// A dependency object coordinates resource hand-offs between
// operations, potentially across queue families. Operations pass
// signal/wait commands referencing a dependency; while executing,
// the operation's injection scratch state walks through
// catch -> prepare -> (abort | finish):
//
//  - catch matches previously signaled hand-offs against the
//    resources the operation touches and emits the acquiring
//    pipeline barriers (plus semaphore waits across queues).
//  - prepare claims fresh sync slots for the operation's own signal
//    commands and emits releasing barriers where needed.
//  - finish commits: prepared slots become visible to future catches,
//    caught slots are retired and their semaphores recycled.
//  - abort rolls prepared slots back as if never signaled.
//
// The slot bookkeeping below never touches the device, all vulkan
// work happens in the deps_* entry points that wrap it.

use ash::vk;

extern crate utils;
use crate::access::{self, AccessMask, ShaderStage};
use crate::backing::Attach;
use crate::device::Device;
use crate::format::Format;
use crate::reference::{vk_image_aspect, ImageAspect, Range, Reference, UnpackRef};
use crate::{Result, StratusError};
use utils::log;

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A dependency object, shareable between threads.
#[derive(Clone)]
pub struct Dependency {
    pub(crate) d_data: Arc<DependencyData>,
}

pub(crate) struct DependencyData {
    pub(crate) dev: Arc<Device>,
    pub(crate) sync: Mutex<SyncState>,

    /// How many wait commands may consume one signal before its slot
    /// is recycled.
    pub(crate) wait_capacity: u32,

    // Vulkan family indices.
    pub(crate) graphics: u32,
    pub(crate) compute: u32,
    pub(crate) transfer: u32,
}

impl Dependency {
    pub(crate) fn new(dev: Arc<Device>, wait_capacity: u32) -> Self {
        let (graphics, compute, transfer) = (
            dev.d_graphics_family,
            dev.d_compute_family,
            dev.d_transfer_family,
        );
        Self {
            d_data: Arc::new(DependencyData {
                dev: dev,
                sync: Mutex::new(SyncState::new()),
                wait_capacity: wait_capacity,
                graphics: graphics,
                compute: compute,
                transfer: transfer,
            }),
        }
    }

    pub(crate) fn is_same(&self, other: &Dependency) -> bool {
        Arc::ptr_eq(&self.d_data, &other.d_data)
    }
}

impl Drop for DependencyData {
    fn drop(&mut self) {
        let state = self.sync.get_mut().unwrap();
        unsafe {
            for slot in state.slots.iter() {
                if slot.flags.contains(SyncFlags::SEMAPHORE) {
                    self.dev.dev.destroy_semaphore(slot.vk.signaled, None);
                }
            }
            for sem in state.free_sems.drain(..) {
                self.dev.dev.destroy_semaphore(sem, None);
            }
        }
    }
}

pub(crate) enum InjectKind {
    Signal,
    Wait,
}

/// An injection command: one signal or wait on a dependency, passed
/// alongside an operation (a heap transfer, a frame submission).
pub struct Inject {
    pub(crate) dep: Dependency,
    pub(crate) kind: InjectKind,
    pub(crate) mask: AccessMask,
    pub(crate) stage: ShaderStage,
    pub(crate) reference: Reference,
    pub(crate) range: Option<Range>,
}

impl Inject {
    /// Signal the dependency for every resource the operation
    /// touches. `mask` declares the access the consumer may assume
    /// the resources were left in; empty derives it from the
    /// operation itself.
    pub fn signal(dep: &Dependency, mask: AccessMask, stage: ShaderStage) -> Self {
        Self {
            dep: dep.clone(),
            kind: InjectKind::Signal,
            mask: mask,
            stage: stage,
            reference: Reference::null(),
            range: None,
        }
    }

    /// Signal the dependency for one specific resource (range).
    pub fn signal_ref(
        dep: &Dependency,
        reference: &Reference,
        range: Option<Range>,
        mask: AccessMask,
        stage: ShaderStage,
    ) -> Self {
        Self {
            dep: dep.clone(),
            kind: InjectKind::Signal,
            mask: mask,
            stage: stage,
            reference: reference.clone(),
            range: range,
        }
    }

    /// Wait on every pending signal of the dependency overlapping the
    /// operation's resources.
    pub fn wait(dep: &Dependency) -> Self {
        Self {
            dep: dep.clone(),
            kind: InjectKind::Wait,
            mask: AccessMask::empty(),
            stage: ShaderStage::empty(),
            reference: Reference::null(),
            range: None,
        }
    }

    /// Wait on pending signals overlapping one specific resource
    /// (range), accessed with the given mask.
    pub fn wait_ref(
        dep: &Dependency,
        reference: &Reference,
        range: Option<Range>,
        mask: AccessMask,
        stage: ShaderStage,
    ) -> Self {
        Self {
            dep: dep.clone(),
            kind: InjectKind::Wait,
            mask: mask,
            stage: stage,
            reference: reference.clone(),
            range: range,
        }
    }
}

/// One resource an operation touches, with its access and claimed
/// size.
pub(crate) struct InjRef {
    pub(crate) unp: UnpackRef,
    pub(crate) mask: AccessMask,
    pub(crate) stage: ShaderStage,
    pub(crate) size: u64,
}

static INJECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// The scratch state of one operation passing through the protocol.
///
/// The id acts as the claim on sync slots. It is never dereferenced,
/// so an aborted injection can never be reached through a slot.
pub struct Injection {
    pub(crate) id: u64,
    pub(crate) family: u32,
    pub(crate) refs: Vec<InjRef>,

    /// When set, only attachments of this renderer may be involved.
    pub(crate) filter: Option<crate::backing::AttachList>,

    out_waits: Vec<vk::Semaphore>,
    out_stages: Vec<vk::PipelineStageFlags>,
    out_sigs: Vec<vk::Semaphore>,

    done: bool,
}

impl Injection {
    pub(crate) fn new(family: u32) -> Self {
        Self {
            id: INJECTION_IDS.fetch_add(1, Ordering::Relaxed),
            family: family,
            refs: Vec::new(),
            filter: None,
            out_waits: Vec::new(),
            out_stages: Vec::new(),
            out_sigs: Vec::new(),
            done: false,
        }
    }

    pub(crate) fn with_filter(family: u32, filter: crate::backing::AttachList) -> Self {
        let mut injection = Self::new(family);
        injection.filter = Some(filter);
        injection
    }

    /// Add a resource the operation touches. May be called repeatedly
    /// between protocol calls, the set only ever grows.
    pub(crate) fn add_ref(
        &mut self,
        unp: UnpackRef,
        size: u64,
        mask: AccessMask,
        stage: ShaderStage,
    ) {
        self.refs.push(InjRef {
            unp: unp,
            mask: mask,
            stage: stage,
            size: size,
        });
    }

    pub(crate) fn out_waits(&self) -> &[vk::Semaphore] {
        &self.out_waits
    }

    pub(crate) fn out_stages(&self) -> &[vk::PipelineStageFlags] {
        &self.out_stages
    }

    pub(crate) fn out_sigs(&self) -> &[vk::Semaphore] {
        &self.out_sigs
    }

    fn clear_out(&mut self) {
        self.out_waits.clear();
        self.out_stages.clear();
        self.out_sigs.clear();
    }

    /// An attachment passes the renderer filter if it belongs to the
    /// filtering renderer. Non-attachments always pass.
    fn filter_ok(&self, unp: &UnpackRef) -> bool {
        match (&self.filter, &unp.obj) {
            (Some(filter), crate::reference::UnpackObj::Attachment { attachs, .. }) => {
                Arc::ptr_eq(filter, attachs)
            }
            _ => true,
        }
    }
}

/// Stage in a sync slot's lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SyncStage {
    /// Everything but the recycled semaphore is undefined.
    Unused,
    Prepare,
    /// Prepared and caught within the same injection.
    PrepareCatch,
    Pending,
    Catch,
    Used,
}

bitflags! {
    pub(crate) struct SyncFlags: u32 {
        /// `vk.signaled` holds a semaphore.
        const SEMAPHORE = 0x0001;
        /// The catch acquired ownership from another family.
        const ACQUIRE = 0x0002;
    }
}

/// A normalized sub-resource range: buffer offsets are absolute and
/// sizes/counts are non-zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NormRange {
    Buffer {
        offset: u64,
        size: u64,
    },
    Image {
        aspect: ImageAspect,
        mipmap: u32,
        num_mipmaps: u32,
        layer: u32,
        num_layers: u32,
    },
}

impl NormRange {
    pub(crate) fn overlaps(&self, other: &NormRange) -> bool {
        match (self, other) {
            (
                NormRange::Buffer { offset: o1, size: s1 },
                NormRange::Buffer { offset: o2, size: s2 },
            ) => o1 + s1 > *o2 && o2 + s2 > *o1,
            (
                NormRange::Image {
                    aspect: a1,
                    mipmap: m1,
                    num_mipmaps: nm1,
                    layer: l1,
                    num_layers: nl1,
                },
                NormRange::Image {
                    aspect: a2,
                    mipmap: m2,
                    num_mipmaps: nm2,
                    layer: l2,
                    num_layers: nl2,
                },
            ) => {
                a1.intersects(*a2)
                    && m1 + nm1 > *m2
                    && m2 + nm2 > *m1
                    && l1 + nl1 > *l2
                    && l2 + nl2 > *l1
            }
            _ => false,
        }
    }
}

/// Everything vulkan about a slot: the barrier metadata of the
/// hand-off and the semaphore crossing queues.
pub(crate) struct SyncVk {
    pub(crate) signaled: vk::Semaphore,

    pub(crate) src_access: vk::AccessFlags,
    pub(crate) dst_access: vk::AccessFlags,
    pub(crate) old_layout: vk::ImageLayout,
    pub(crate) new_layout: vk::ImageLayout,
    pub(crate) src_family: u32,
    pub(crate) dst_family: u32,
    pub(crate) src_stage: vk::PipelineStageFlags,
    pub(crate) dst_stage: vk::PipelineStageFlags,

    pub(crate) handle: SyncHandle,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum SyncHandle {
    None,
    Buffer(vk::Buffer),
    Image(vk::Image, vk::ImageAspectFlags),
}

/// One synchronization slot of a dependency.
pub(crate) struct SyncSlot {
    pub(crate) sref: UnpackRef,
    pub(crate) range: NormRange,
    /// Wait commands left until this slot recycles.
    pub(crate) waits: u32,
    /// Claiming injection, may be None.
    pub(crate) inj: Option<u64>,
    pub(crate) stage: SyncStage,
    pub(crate) flags: SyncFlags,
    pub(crate) vk: SyncVk,
}

pub(crate) struct SyncState {
    pub(crate) slots: Vec<SyncSlot>,
    pub(crate) free_sems: Vec<vk::Semaphore>,
}

/// A barrier the protocol wants recorded.
pub(crate) struct BarrierDesc {
    pub(crate) src_access: vk::AccessFlags,
    pub(crate) dst_access: vk::AccessFlags,
    pub(crate) old_layout: vk::ImageLayout,
    pub(crate) new_layout: vk::ImageLayout,
    pub(crate) src_family: u32,
    pub(crate) dst_family: u32,
    pub(crate) src_stage: vk::PipelineStageFlags,
    pub(crate) dst_stage: vk::PipelineStageFlags,
    pub(crate) handle: SyncHandle,
    pub(crate) range: NormRange,
}

// The format governing layout/access decisions for a resource.
fn ref_format(unp: &UnpackRef) -> Format {
    if let Some(image) = unp.image() {
        return image.i_data.fmt;
    }
    if let crate::reference::UnpackObj::Attachment { attachs, index } = &unp.obj {
        let list = attachs.read().unwrap();
        if let Some(Attach::Image(image)) = list.get(*index) {
            return image.fmt;
        }
    }
    Format::EMPTY
}

fn ref_handle(unp: &UnpackRef) -> SyncHandle {
    if let Some(buffer) = unp.buffer() {
        return SyncHandle::Buffer(buffer.b_data.vk_buffer);
    }
    if let Some(image) = unp.image() {
        let aspect = image_aspect_of(&image.i_data.fmt);
        return SyncHandle::Image(image.i_data.vk_image, vk_image_aspect(aspect));
    }
    if let crate::reference::UnpackObj::Attachment { attachs, index } = &unp.obj {
        let list = attachs.read().unwrap();
        if let Some(Attach::Image(image)) = list.get(*index) {
            let aspect = image_aspect_of(&image.fmt);
            return SyncHandle::Image(image.vk_image, vk_image_aspect(aspect));
        }
    }
    SyncHandle::None
}

fn image_aspect_of(fmt: &Format) -> ImageAspect {
    if fmt.has_depth() || fmt.has_stencil() {
        let mut aspect = ImageAspect::empty();
        if fmt.has_depth() {
            aspect |= ImageAspect::DEPTH;
        }
        if fmt.has_stencil() {
            aspect |= ImageAspect::STENCIL;
        }
        aspect
    } else {
        ImageAspect::COLOR
    }
}

// Mip/layer counts of the referenced image, for normalization.
fn ref_image_counts(unp: &UnpackRef) -> (u32, u32) {
    if let Some(image) = unp.image() {
        return (image.i_data.mipmaps, image.i_data.layers);
    }
    // Attachments are single-mip, single-layer.
    (1, 1)
}

/// Normalize a range against the referenced resource: buffer offsets
/// become absolute, all sizes and counts become non-zero.
pub(crate) fn normalize_range(iref: &InjRef, range: Option<Range>) -> NormRange {
    if iref.unp.buffer().is_some() {
        let whole = if iref.size > 0 {
            iref.size
        } else {
            iref.unp
                .buffer()
                .map(|b| b.size().saturating_sub(iref.unp.value))
                .unwrap_or(0)
        };

        let (offset, size) = match range {
            Some(Range::Buffer { offset, size }) => {
                let size = if size == 0 {
                    whole.saturating_sub(offset)
                } else {
                    size
                };
                (iref.unp.value + offset, size)
            }
            _ => (iref.unp.value, whole),
        };
        NormRange::Buffer {
            offset: offset,
            size: size.max(1),
        }
    } else {
        let (mips, layers) = ref_image_counts(&iref.unp);
        let fmt = ref_format(&iref.unp);

        match range {
            Some(Range::Image {
                aspect,
                mipmap,
                num_mipmaps,
                layer,
                num_layers,
            }) => NormRange::Image {
                aspect: aspect,
                mipmap: mipmap,
                num_mipmaps: if num_mipmaps == 0 {
                    mips.saturating_sub(mipmap).max(1)
                } else {
                    num_mipmaps
                },
                layer: layer,
                num_layers: if num_layers == 0 {
                    layers.saturating_sub(layer).max(1)
                } else {
                    num_layers
                },
            },
            _ => NormRange::Image {
                aspect: image_aspect_of(&fmt),
                mipmap: 0,
                num_mipmaps: mips.max(1),
                layer: 0,
                num_layers: layers.max(1),
            },
        }
    }
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_sems: Vec::new(),
        }
    }

    // Claim an unused slot index, growing the vector if none recycle.
    fn claim_slot(&mut self) -> usize {
        if let Some(i) = self.slots.iter().position(|s| s.stage == SyncStage::Unused) {
            return i;
        }

        self.slots.push(SyncSlot {
            sref: UnpackRef::empty(),
            range: NormRange::Buffer { offset: 0, size: 1 },
            waits: 0,
            inj: None,
            stage: SyncStage::Unused,
            flags: SyncFlags::empty(),
            vk: SyncVk {
                signaled: vk::Semaphore::null(),
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::empty(),
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::UNDEFINED,
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
                src_stage: vk::PipelineStageFlags::empty(),
                dst_stage: vk::PipelineStageFlags::empty(),
                handle: SyncHandle::None,
            },
        });
        self.slots.len() - 1
    }

    /// Prepare one signal hand-off: claim a slot, record the barrier
    /// metadata, optionally attach a semaphore. Returns the releasing
    /// barrier when the hand-off needs one on the source queue.
    pub(crate) fn prepare_slot(
        &mut self,
        inj_id: u64,
        src_family: u32,
        families: (u32, u32, u32),
        target: &InjRef,
        sig_mask: AccessMask,
        sig_stage: ShaderStage,
        range: Option<Range>,
        sem: Option<vk::Semaphore>,
    ) -> Option<BarrierDesc> {
        let fmt = ref_format(&target.unp);
        let handle = ref_handle(&target.unp);
        let norm = normalize_range(target, range);

        // The source half is what the operation itself did, the
        // destination half is what the signal declares the resource
        // is handed over as.
        let src_mask = target.mask;
        let dst_mask = if sig_mask.is_empty() { src_mask } else { sig_mask };

        let is_image = !matches!(handle, SyncHandle::Buffer(_));
        let (graphics, compute, transfer) = families;
        let dst_family = access_family_of(dst_mask, graphics, compute, transfer);

        let vk_data = SyncVk {
            signaled: sem.unwrap_or(vk::Semaphore::null()),
            src_access: access::vk_access_flags(src_mask, &fmt),
            dst_access: access::vk_access_flags(dst_mask, &fmt),
            old_layout: if is_image {
                access::vk_image_layout(src_mask, &fmt)
            } else {
                vk::ImageLayout::UNDEFINED
            },
            new_layout: if is_image {
                access::vk_image_layout(dst_mask, &fmt)
            } else {
                vk::ImageLayout::UNDEFINED
            },
            src_family: src_family,
            dst_family: dst_family,
            src_stage: access::vk_pipeline_stage(src_mask, target.stage, &fmt),
            dst_stage: access::vk_pipeline_stage(dst_mask, sig_stage, &fmt),
            handle: handle,
        };

        // A release barrier is only necessary when the hand-off
        // crosses families or transitions the layout or access scope
        // on the source queue.
        let release = if src_family != dst_family
            || (is_image && vk_data.old_layout != vk_data.new_layout)
            || vk_data.src_access != vk_data.dst_access
        {
            Some(BarrierDesc {
                src_access: vk_data.src_access,
                dst_access: vk_data.dst_access,
                old_layout: vk_data.old_layout,
                new_layout: vk_data.new_layout,
                src_family: vk_data.src_family,
                dst_family: vk_data.dst_family,
                src_stage: vk_data.src_stage,
                dst_stage: vk_data.dst_stage,
                handle: vk_data.handle,
                range: norm,
            })
        } else {
            None
        };

        let i = self.claim_slot();
        let slot = &mut self.slots[i];
        slot.sref = target.unp.clone();
        slot.range = norm;
        slot.waits = 0;
        slot.inj = Some(inj_id);
        slot.stage = SyncStage::Prepare;
        slot.flags = if sem.is_some() {
            SyncFlags::SEMAPHORE
        } else {
            SyncFlags::empty()
        };
        slot.vk = vk_data;

        release
    }

    /// Catch pending hand-offs against the given candidate resources.
    /// Returns the acquiring barriers plus the semaphores to wait on.
    pub(crate) fn catch_slots(
        &mut self,
        inj_id: u64,
        family: u32,
        wait_capacity: u32,
        candidates: &[InjRef],
        explicit: Option<(&InjRef, Option<Range>)>,
    ) -> (Vec<BarrierDesc>, Vec<(vk::Semaphore, vk::PipelineStageFlags)>) {
        let mut barriers = Vec::new();
        let mut waits = Vec::new();

        for slot in self.slots.iter_mut() {
            // What can be caught: commands pending from finished
            // injections, commands prepared by this same injection,
            // and used slots (which only count down).
            let same_inj = slot.inj == Some(inj_id);
            match slot.stage {
                SyncStage::Pending | SyncStage::Used => {}
                SyncStage::Prepare | SyncStage::PrepareCatch if same_inj => {}
                _ => continue,
            }

            // Find the overlapping candidate.
            let matched = match explicit {
                Some((iref, range)) => {
                    let norm = normalize_range(iref, range);
                    if slot.sref.is_equal(&iref.unp) && slot.range.overlaps(&norm) {
                        Some(iref)
                    } else {
                        None
                    }
                }
                None => candidates.iter().find(|c| {
                    slot.sref.is_equal(&c.unp)
                        && slot.range.overlaps(&normalize_range(c, None))
                }),
            };
            let matched = match matched {
                Some(m) => m,
                None => continue,
            };

            if slot.stage == SyncStage::Used {
                // Wait-only catch, count the slot towards recycling.
                slot.waits = slot.waits.saturating_sub(1);
                if slot.waits == 0 {
                    recycle_slot(slot, &mut self.free_sems);
                }
                continue;
            }

            let fmt = ref_format(&slot.sref);
            let dst_access = access::vk_access_flags(matched.mask, &fmt);
            let is_image = !matches!(slot.vk.handle, SyncHandle::Buffer(_));
            let new_layout = if is_image {
                access::vk_image_layout(matched.mask, &fmt)
            } else {
                vk::ImageLayout::UNDEFINED
            };
            let dst_stage = access::vk_pipeline_stage(matched.mask, matched.stage, &fmt);

            // The source of the acquiring barrier is the state the
            // signal left (i.e. declared) the resource in.
            barriers.push(BarrierDesc {
                src_access: slot.vk.dst_access,
                dst_access: dst_access,
                old_layout: slot.vk.new_layout,
                new_layout: new_layout,
                src_family: slot.vk.src_family,
                dst_family: slot.vk.dst_family,
                src_stage: slot.vk.dst_stage,
                dst_stage: dst_stage,
                handle: slot.vk.handle,
                range: slot.range,
            });

            if slot.vk.dst_family != family {
                log::error!("Dependency caught on a different family than signaled for");
            }

            match slot.stage {
                SyncStage::Pending => {
                    if slot.flags.contains(SyncFlags::SEMAPHORE) {
                        waits.push((slot.vk.signaled, dst_stage));
                    }
                    if slot.vk.src_family != slot.vk.dst_family {
                        slot.flags |= SyncFlags::ACQUIRE;
                    }
                    slot.stage = SyncStage::Catch;
                    slot.inj = Some(inj_id);
                    slot.waits = wait_capacity;
                }
                SyncStage::Prepare => {
                    // Same injection, no semaphore necessary.
                    slot.stage = SyncStage::PrepareCatch;
                }
                _ => {}
            }

            // Record the acquired state so a commit keeps the slot
            // consistent with what was actually emitted.
            slot.vk.src_access = slot.vk.dst_access;
            slot.vk.old_layout = slot.vk.new_layout;
            slot.vk.src_stage = slot.vk.dst_stage;
            slot.vk.dst_access = dst_access;
            slot.vk.new_layout = new_layout;
            slot.vk.dst_stage = dst_stage;
        }

        (barriers, waits)
    }

    /// Commit every slot claimed by the injection.
    pub(crate) fn finish_slots(&mut self, inj_id: u64, wait_capacity: u32) {
        for slot in self.slots.iter_mut() {
            if slot.inj != Some(inj_id) {
                continue;
            }
            slot.inj = None;

            match slot.stage {
                SyncStage::Prepare | SyncStage::PrepareCatch => {
                    // Now visible to future catches.
                    slot.stage = SyncStage::Pending;
                }
                SyncStage::Catch => {
                    slot.waits = wait_capacity;
                    if slot.waits == 0 {
                        recycle_slot(slot, &mut self.free_sems);
                    } else {
                        slot.stage = SyncStage::Used;
                    }
                }
                _ => {}
            }
        }
    }

    /// Roll back every slot claimed by the injection. Prepared
    /// signals are reverted as if they never happened; caught slots
    /// stay consumed (their barriers were harmless, but the signal is
    /// not resurrected).
    pub(crate) fn abort_slots(&mut self, inj_id: u64, wait_capacity: u32) {
        for slot in self.slots.iter_mut() {
            if slot.inj != Some(inj_id) {
                continue;
            }
            slot.inj = None;

            match slot.stage {
                SyncStage::Prepare | SyncStage::PrepareCatch => {
                    recycle_slot(slot, &mut self.free_sems);
                }
                SyncStage::Catch => {
                    slot.waits = wait_capacity;
                    if slot.waits == 0 {
                        recycle_slot(slot, &mut self.free_sems);
                    } else {
                        slot.stage = SyncStage::Used;
                    }
                }
                _ => {}
            }
        }
    }
}

fn recycle_slot(slot: &mut SyncSlot, free_sems: &mut Vec<vk::Semaphore>) {
    if slot.flags.contains(SyncFlags::SEMAPHORE) {
        free_sems.push(slot.vk.signaled);
    }
    slot.sref = UnpackRef::empty();
    slot.waits = 0;
    slot.inj = None;
    slot.stage = SyncStage::Unused;
    slot.flags = SyncFlags::empty();
    slot.vk.signaled = vk::Semaphore::null();
    slot.vk.handle = SyncHandle::None;
}

fn access_family_of(mask: AccessMask, graphics: u32, compute: u32, transfer: u32) -> u32 {
    access::access_family(mask, graphics, compute, transfer)
}

// Record a batch of barriers into a command buffer.
fn record_barriers(dev: &Device, cmd: vk::CommandBuffer, barriers: &[BarrierDesc]) {
    if cmd == vk::CommandBuffer::null() {
        return;
    }

    for b in barriers.iter() {
        // Family indices only belong in real ownership transfers.
        let (src_family, dst_family) = if b.src_family != b.dst_family {
            (b.src_family, b.dst_family)
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        };

        match (b.handle, b.range) {
            (SyncHandle::Buffer(buffer), NormRange::Buffer { offset, size }) => {
                let barrier = vk::BufferMemoryBarrier::builder()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .buffer(buffer)
                    .offset(offset)
                    .size(size)
                    .build();

                unsafe {
                    dev.dev.cmd_pipeline_barrier(
                        cmd,
                        b.src_stage,
                        b.dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    );
                }
            }
            (
                SyncHandle::Image(image, aspect),
                NormRange::Image {
                    mipmap,
                    num_mipmaps,
                    layer,
                    num_layers,
                    ..
                },
            ) => {
                let barrier = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .image(image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: mipmap,
                        level_count: num_mipmaps,
                        base_array_layer: layer,
                        layer_count: num_layers,
                    })
                    .build();

                unsafe {
                    dev.dev.cmd_pipeline_barrier(
                        cmd,
                        b.src_stage,
                        b.dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
            }
            _ => {
                log::error!("Dependency slot lost its resource, dropping a barrier");
            }
        }
    }
}

// Misuse guard shared by all four entry points.
fn check_done(injection: &Injection) -> bool {
    if injection.done {
        debug_assert!(false, "dependency injection used after abort/finish");
        log::error!("Dependency injection used after abort/finish");
        return true;
    }
    false
}

/// Complete dependency injections by catching pending signal
/// commands, recording the acquiring barriers into `cmd`.
///
/// Thread-safe with respect to all dependency objects. May be called
/// any number of times with the same injection (with growing inputs),
/// until abort or finish.
pub(crate) fn deps_catch(
    dev: &Device,
    cmd: vk::CommandBuffer,
    injs: &[Inject],
    injection: &mut Injection,
) -> Result<()> {
    if check_done(injection) {
        return Ok(());
    }

    for inj in injs.iter() {
        if !matches!(inj.kind, InjectKind::Wait) {
            continue;
        }

        // An explicit reference narrows the catch to one resource.
        let explicit = if !inj.reference.is_null() {
            let unp = inj.reference.unpack();
            if !injection.filter_ok(&unp) {
                log::error!("Dependency wait references an attachment of another renderer");
                return Err(StratusError::INVALID);
            }
            Some(InjRef {
                unp: unp,
                mask: inj.mask,
                stage: inj.stage,
                size: inj.reference.size(),
            })
        } else {
            None
        };

        let dep = &inj.dep.d_data;
        let mut state = dep.sync.lock().unwrap();

        let (barriers, waits) = state.catch_slots(
            injection.id,
            injection.family,
            dep.wait_capacity,
            &injection.refs,
            explicit.as_ref().map(|e| (e, inj.range)),
        );
        drop(state);

        record_barriers(dev, cmd, &barriers);
        for (sem, stage) in waits.into_iter() {
            injection.out_waits.push(sem);
            injection.out_stages.push(stage);
        }
    }

    Ok(())
}

/// Start dependency injections by preparing new signal commands.
///
/// Unless `blocking`, every prepared hand-off gets a binary semaphore
/// appended to the injection's signal outputs. Prepared commands are
/// immediately visible to subsequent catches of the same injection.
pub(crate) fn deps_prepare(
    dev: &Device,
    cmd: vk::CommandBuffer,
    blocking: bool,
    injs: &[Inject],
    injection: &mut Injection,
) -> Result<()> {
    if check_done(injection) {
        return Ok(());
    }

    for inj in injs.iter() {
        if !matches!(inj.kind, InjectKind::Signal) {
            continue;
        }

        let dep = &inj.dep.d_data;

        // Expand the signal into the resources it hands off.
        let mut targets: Vec<InjRef> = Vec::new();
        if !inj.reference.is_null() {
            let unp = inj.reference.unpack();
            if !injection.filter_ok(&unp) {
                log::error!("Dependency signal references an attachment of another renderer");
                return Err(StratusError::INVALID);
            }

            // The operation's own access for this resource governs
            // the source half of the hand-off.
            let known = injection.refs.iter().find(|c| c.unp.is_equal(&unp));
            targets.push(InjRef {
                mask: known.map(|k| k.mask).unwrap_or(AccessMask::empty()),
                stage: known.map(|k| k.stage).unwrap_or(ShaderStage::empty()),
                size: inj.reference.size(),
                unp: unp,
            });
        } else {
            for c in injection.refs.iter() {
                targets.push(InjRef {
                    unp: c.unp.clone(),
                    mask: c.mask,
                    stage: c.stage,
                    size: c.size,
                });
            }
        }

        if targets.is_empty() {
            log::error!("Dependency signal command without any resources to signal");
            continue;
        }

        let mut releases = Vec::new();
        {
            let mut state = dep.sync.lock().unwrap();
            for target in targets.iter() {
                let sem = if blocking {
                    None
                } else {
                    // Recycle from the pool before making fresh ones.
                    match state.free_sems.pop() {
                        Some(sem) => Some(sem),
                        None => {
                            let info = vk::SemaphoreCreateInfo::builder().build();
                            let sem = unsafe {
                                dev.dev
                                    .create_semaphore(&info, None)
                                    .map_err(|_| StratusError::OUT_OF_MEMORY)?
                            };
                            Some(sem)
                        }
                    }
                };

                let release = state.prepare_slot(
                    injection.id,
                    injection.family,
                    (dep.graphics, dep.compute, dep.transfer),
                    target,
                    inj.mask,
                    inj.stage,
                    inj.range,
                    sem,
                );

                if let Some(sem) = sem {
                    injection.out_sigs.push(sem);
                }
                if let Some(release) = release {
                    releases.push(release);
                }
            }
        }

        // The lock is released while we record.
        record_barriers(dev, cmd, &releases);
    }

    Ok(())
}

/// Finalize a dependency injection: all signal commands become
/// visible to future wait commands, caught slots retire.
///
/// The injection cannot be used again after this call.
pub(crate) fn deps_finish(injs: &[Inject], injection: &mut Injection) {
    if check_done(injection) {
        return;
    }

    for inj in injs.iter() {
        let dep = &inj.dep.d_data;
        let mut state = dep.sync.lock().unwrap();
        state.finish_slots(injection.id, dep.wait_capacity);
    }

    injection.clear_out();
    injection.done = true;
}

/// Abort a dependency injection: prepared signal commands are rolled
/// back, caught slots stay consumed.
///
/// The injection cannot be used again after this call.
pub(crate) fn deps_abort(injs: &[Inject], injection: &mut Injection) {
    if check_done(injection) {
        return;
    }

    for inj in injs.iter() {
        let dep = &inj.dep.d_data;
        let mut state = dep.sync.lock().unwrap();
        state.abort_slots(injection.id, dep.wait_capacity);
    }

    injection.clear_out();
    injection.done = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Allocation;
    use crate::heap::{Buffer, BufferData, BufferUsage, MemoryFlags};
    use ash::vk::Handle;
    use std::sync::Arc;

    fn mk_buffer(raw: u64, size: u64) -> Buffer {
        Buffer {
            b_data: Arc::new(BufferData {
                flags: MemoryFlags::WRITE,
                usage: BufferUsage::VERTEX,
                size: size,
                vk_buffer: vk::Buffer::from_raw(raw),
                alloc: Allocation {
                    memory: vk::DeviceMemory::null(),
                    size: size,
                    ptr: std::ptr::null_mut(),
                },
            }),
        }
    }

    fn iref(buffer: &Buffer, offset: u64, size: u64, mask: AccessMask) -> InjRef {
        InjRef {
            unp: Reference::buffer_at(buffer, offset).unpack(),
            mask: mask,
            stage: ShaderStage::empty(),
            size: size,
        }
    }

    const FAMS: (u32, u32, u32) = (0, 1, 2);

    // Signal X[offset..offset+size) from injection `id` and commit it.
    fn signal_and_finish(
        state: &mut SyncState,
        id: u64,
        buffer: &Buffer,
        offset: u64,
        size: u64,
        mask: AccessMask,
    ) {
        let target = iref(buffer, offset, size, mask);
        let release = state.prepare_slot(
            id,
            FAMS.0,
            FAMS,
            &target,
            AccessMask::empty(),
            ShaderStage::empty(),
            None,
            None,
        );
        // Same mask on both halves, nothing to release.
        assert!(release.is_none());
        state.finish_slots(id, 1);
    }

    #[test]
    fn buffer_ranges_intersect_as_intervals() {
        let a = NormRange::Buffer { offset: 0, size: 100 };
        let b = NormRange::Buffer { offset: 99, size: 1 };
        let c = NormRange::Buffer { offset: 100, size: 50 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!b.overlaps(&c));
    }

    #[test]
    fn image_ranges_intersect_per_dimension() {
        let base = NormRange::Image {
            aspect: ImageAspect::COLOR,
            mipmap: 0,
            num_mipmaps: 4,
            layer: 0,
            num_layers: 2,
        };
        let other_mips = NormRange::Image {
            aspect: ImageAspect::COLOR,
            mipmap: 4,
            num_mipmaps: 2,
            layer: 0,
            num_layers: 2,
        };
        let other_aspect = NormRange::Image {
            aspect: ImageAspect::DEPTH,
            mipmap: 0,
            num_mipmaps: 4,
            layer: 0,
            num_layers: 2,
        };
        assert!(!base.overlaps(&other_mips));
        assert!(!base.overlaps(&other_aspect));
        assert!(base.overlaps(&base));
    }

    #[test]
    fn visible_signal_is_caught_once() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        // Op 1 wrote X[0..1024) and finished.
        signal_and_finish(&mut state, 1, &buffer, 0, 1024, AccessMask::TRANSFER_WRITE);

        // Op 2 reads X[512..1536) as vertices.
        let candidates = [iref(&buffer, 512, 1024, AccessMask::VERTEX_READ)];
        let (barriers, waits) = state.catch_slots(2, FAMS.0, 1, &candidates, None);

        assert_eq!(barriers.len(), 1);
        assert!(waits.is_empty());
        let b = &barriers[0];
        assert_eq!(b.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(b.dst_access, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);
        assert_eq!(b.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(b.dst_stage, vk::PipelineStageFlags::VERTEX_INPUT);

        // Exactly one barrier: a second catch of the same injection
        // finds the slot already claimed as CATCH.
        let (again, _) = state.catch_slots(2, FAMS.0, 1, &candidates, None);
        assert!(again.is_empty());
    }

    #[test]
    fn no_overlap_emits_nothing() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        signal_and_finish(&mut state, 1, &buffer, 0, 100, AccessMask::TRANSFER_WRITE);

        let candidates = [iref(&buffer, 200, 100, AccessMask::VERTEX_READ)];
        let (barriers, waits) = state.catch_slots(2, FAMS.0, 1, &candidates, None);
        assert!(barriers.is_empty());
        assert!(waits.is_empty());
    }

    #[test]
    fn different_resources_never_match() {
        let mut state = SyncState::new();
        let x = mk_buffer(1, 4096);
        let y = mk_buffer(2, 4096);

        signal_and_finish(&mut state, 1, &x, 0, 1024, AccessMask::TRANSFER_WRITE);

        let candidates = [iref(&y, 0, 1024, AccessMask::VERTEX_READ)];
        let (barriers, _) = state.catch_slots(2, FAMS.0, 1, &candidates, None);
        assert!(barriers.is_empty());
    }

    #[test]
    fn unfinished_prepare_is_invisible_to_others() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        let target = iref(&buffer, 0, 1024, AccessMask::TRANSFER_WRITE);
        state.prepare_slot(
            1,
            FAMS.0,
            FAMS,
            &target,
            AccessMask::empty(),
            ShaderStage::empty(),
            None,
            None,
        );

        // A different injection must not see it before finish.
        let candidates = [iref(&buffer, 0, 1024, AccessMask::VERTEX_READ)];
        let (barriers, _) = state.catch_slots(2, FAMS.0, 1, &candidates, None);
        assert!(barriers.is_empty());
    }

    #[test]
    fn same_injection_shortcuts_without_semaphore() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        let target = iref(&buffer, 0, 1024, AccessMask::TRANSFER_WRITE);
        state.prepare_slot(
            1,
            FAMS.0,
            FAMS,
            &target,
            AccessMask::empty(),
            ShaderStage::empty(),
            None,
            None,
        );

        let candidates = [iref(&buffer, 0, 1024, AccessMask::VERTEX_READ)];
        let (barriers, waits) = state.catch_slots(1, FAMS.0, 1, &candidates, None);
        assert_eq!(barriers.len(), 1);
        assert!(waits.is_empty());
        assert_eq!(state.slots[0].stage, SyncStage::PrepareCatch);

        // And a commit makes it pending again for others.
        state.finish_slots(1, 1);
        assert_eq!(state.slots[0].stage, SyncStage::Pending);
    }

    #[test]
    fn abort_rolls_back_prepared_signals() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        let target = iref(&buffer, 0, 1024, AccessMask::TRANSFER_WRITE);
        state.prepare_slot(
            1,
            FAMS.0,
            FAMS,
            &target,
            AccessMask::empty(),
            ShaderStage::empty(),
            None,
            None,
        );
        state.abort_slots(1, 1);

        // A subsequent injection finds no visible pending signal.
        let candidates = [iref(&buffer, 0, 1024, AccessMask::VERTEX_READ)];
        let (barriers, _) = state.catch_slots(2, FAMS.0, 1, &candidates, None);
        assert!(barriers.is_empty());
        assert_eq!(state.slots[0].stage, SyncStage::Unused);
    }

    #[test]
    fn used_slots_count_down_and_recycle() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        signal_and_finish(&mut state, 1, &buffer, 0, 1024, AccessMask::TRANSFER_WRITE);

        // First catcher consumes the hand-off, capacity 2.
        let candidates = [iref(&buffer, 0, 1024, AccessMask::VERTEX_READ)];
        let (barriers, _) = state.catch_slots(2, FAMS.0, 2, &candidates, None);
        assert_eq!(barriers.len(), 1);
        state.finish_slots(2, 2);
        assert_eq!(state.slots[0].stage, SyncStage::Used);

        // Two wait-only catches drain the slot.
        let (b, _) = state.catch_slots(3, FAMS.0, 2, &candidates, None);
        assert!(b.is_empty());
        assert_eq!(state.slots[0].stage, SyncStage::Used);
        let (b, _) = state.catch_slots(4, FAMS.0, 2, &candidates, None);
        assert!(b.is_empty());
        assert_eq!(state.slots[0].stage, SyncStage::Unused);
    }

    #[test]
    fn cross_family_handoff_releases_and_acquires() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        // A transfer-queue write handed to graphics-side vertex reads.
        let target = InjRef {
            unp: Reference::buffer(&buffer).unpack(),
            mask: AccessMask::TRANSFER_WRITE | AccessMask::TRANSFER_ASYNC,
            stage: ShaderStage::empty(),
            size: 4096,
        };
        let release = state.prepare_slot(
            1,
            FAMS.2,
            FAMS,
            &target,
            AccessMask::VERTEX_READ,
            ShaderStage::empty(),
            None,
            None,
        );

        let release = release.expect("cross-family hand-off needs a release barrier");
        assert_eq!(release.src_family, FAMS.2);
        assert_eq!(release.dst_family, FAMS.0);
        state.finish_slots(1, 1);

        let candidates = [iref(&buffer, 0, 4096, AccessMask::VERTEX_READ)];
        let (barriers, _) = state.catch_slots(2, FAMS.0, 1, &candidates, None);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].src_family, FAMS.2);
        assert_eq!(barriers[0].dst_family, FAMS.0);
        assert!(state.slots[0].flags.contains(SyncFlags::ACQUIRE));
    }

    #[test]
    fn slots_recycle_after_drain() {
        let mut state = SyncState::new();
        let buffer = mk_buffer(1, 4096);

        signal_and_finish(&mut state, 1, &buffer, 0, 1024, AccessMask::TRANSFER_WRITE);
        assert_eq!(state.slots.len(), 1);

        let candidates = [iref(&buffer, 0, 1024, AccessMask::VERTEX_READ)];
        state.catch_slots(2, FAMS.0, 1, &candidates, None);
        state.finish_slots(2, 1);
        assert_eq!(state.slots[0].stage, SyncStage::Used);

        // One more wait drains it, and the next signal reuses it.
        state.catch_slots(3, FAMS.0, 1, &candidates, None);
        assert_eq!(state.slots[0].stage, SyncStage::Unused);

        signal_and_finish(&mut state, 4, &buffer, 0, 64, AccessMask::TRANSFER_WRITE);
        assert_eq!(state.slots.len(), 1);
    }
}
