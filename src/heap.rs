// Memory heaps and the resources allocated from them
//
// A heap hands out buffers, images, primitives (vertex/index
// geometry) and resource groups. Primitives and groups are composite:
// they can either reference memory the caller already allocated, or
// claim space in a packed buffer owned by the composite itself. The
// reference module resolves through that layering.
//
// The heap exclusively owns what it allocates. Freeing a resource
// destroys its vulkan objects immediately, any outstanding reference
// to it is no longer meaningful.

use ash::vk;

extern crate utils;
use crate::access::{AccessMask, ShaderStage};
use crate::dependency::{self, Inject, Injection};
use crate::device::{Allocation, Device};
use crate::format::{self, Format};
use crate::reference::{Reference, Region};
use crate::{Result, StratusError};
use utils::log;

use bitflags::bitflags;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

bitflags! {
    /// Memory behavior of a resource.
    pub struct MemoryFlags: u32 {
        /// Readable by transfer operations (i.e. transfer source).
        const READ = 0x0001;
        /// Writable by transfer operations (i.e. transfer destination).
        const WRITE = 0x0002;
        /// Mappable for direct host access.
        const HOST_VISIBLE = 0x0004;
        /// Placed in device local memory.
        const DEVICE_LOCAL = 0x0008;
    }
}

bitflags! {
    /// Buffer usages.
    pub struct BufferUsage: u32 {
        const VERTEX        = 0x0001;
        const INDEX         = 0x0002;
        const UNIFORM       = 0x0004;
        const STORAGE       = 0x0008;
        const INDIRECT      = 0x0010;
        const UNIFORM_TEXEL = 0x0020;
        const STORAGE_TEXEL = 0x0040;
    }
}

bitflags! {
    /// Image usages.
    pub struct ImageUsage: u32 {
        const SAMPLED        = 0x0001;
        const SAMPLED_LINEAR = 0x0002;
        const SAMPLED_MINMAX = 0x0004;
        const STORAGE        = 0x0008;
        const INPUT          = 0x0010;
        const TRANSIENT      = 0x0020;
    }
}

pub(crate) fn vk_buffer_usage(flags: MemoryFlags, usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut vk_usage = vk::BufferUsageFlags::empty();
    if flags.contains(MemoryFlags::READ) {
        vk_usage |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if flags.contains(MemoryFlags::WRITE) {
        vk_usage |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::VERTEX) {
        vk_usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        vk_usage |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        vk_usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        vk_usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        vk_usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM_TEXEL) {
        vk_usage |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE_TEXEL) {
        vk_usage |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
    }
    vk_usage
}

pub(crate) fn vk_image_usage(flags: MemoryFlags, usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut vk_usage = vk::ImageUsageFlags::empty();
    if flags.contains(MemoryFlags::READ) {
        vk_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if flags.contains(MemoryFlags::WRITE) {
        vk_usage |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.intersects(
        ImageUsage::SAMPLED | ImageUsage::SAMPLED_LINEAR | ImageUsage::SAMPLED_MINMAX,
    ) {
        vk_usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::STORAGE) {
        vk_usage |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(ImageUsage::INPUT) {
        vk_usage |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
    }
    if usage.contains(ImageUsage::TRANSIENT) {
        vk_usage |= vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
    }
    vk_usage
}

/// The minimal format properties an image usage demands, fed to the
/// format dictionary when resolving an abstract format.
pub(crate) fn vk_format_features(flags: MemoryFlags, usage: ImageUsage) -> vk::FormatFeatureFlags {
    let mut feat = vk::FormatFeatureFlags::empty();
    if flags.contains(MemoryFlags::READ) {
        feat |= vk::FormatFeatureFlags::TRANSFER_SRC;
    }
    if flags.contains(MemoryFlags::WRITE) {
        feat |= vk::FormatFeatureFlags::TRANSFER_DST;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        feat |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
    }
    if usage.contains(ImageUsage::SAMPLED_LINEAR) {
        feat |= vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
    }
    if usage.contains(ImageUsage::SAMPLED_MINMAX) {
        feat |= vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_MINMAX;
    }
    if usage.contains(ImageUsage::STORAGE) {
        feat |= vk::FormatFeatureFlags::STORAGE_IMAGE;
    }
    feat
}

/// A plain device buffer.
#[derive(Clone)]
pub struct Buffer {
    pub(crate) b_data: Arc<BufferData>,
}

pub(crate) struct BufferData {
    pub(crate) flags: MemoryFlags,
    pub(crate) usage: BufferUsage,
    pub(crate) size: u64,
    pub(crate) vk_buffer: vk::Buffer,
    pub(crate) alloc: Allocation,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.b_data.size
    }

    pub fn flags(&self) -> MemoryFlags {
        self.b_data.flags
    }

    pub(crate) fn is_same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.b_data, &other.b_data)
    }
}

/// A device image.
#[derive(Clone)]
pub struct Image {
    pub(crate) i_data: Arc<ImageData>,
}

pub(crate) struct ImageData {
    pub(crate) flags: MemoryFlags,
    pub(crate) usage: ImageUsage,
    pub(crate) fmt: Format,
    pub(crate) vk_format: vk::Format,
    pub(crate) mipmaps: u32,
    pub(crate) layers: u32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,
    pub(crate) vk_image: vk::Image,
    pub(crate) alloc: Allocation,
}

impl Image {
    pub fn format(&self) -> Format {
        self.i_data.fmt
    }

    pub fn extent(&self) -> (u32, u32, u32) {
        let d = &self.i_data;
        (d.width, d.height, d.depth)
    }

    pub(crate) fn is_same(&self, other: &Image) -> bool {
        Arc::ptr_eq(&self.i_data, &other.i_data)
    }
}

/// A vertex attribute of a primitive.
#[derive(Copy, Clone)]
pub struct Attribute {
    pub format: Format,
    pub offset: u32,
}

/// Vertex/index geometry, optionally packed into its own buffer.
#[derive(Clone)]
pub struct Primitive {
    pub(crate) p_data: Arc<PrimitiveData>,
}

pub(crate) struct PrimitiveData {
    pub(crate) flags_vertex: MemoryFlags,
    pub(crate) flags_index: MemoryFlags,
    pub(crate) num_vertices: u32,
    pub(crate) num_indices: u32,
    pub(crate) stride: u32,
    pub(crate) index_size: u32,

    /// Caller-provided backing, empty when packed into `buffer`.
    pub(crate) ref_vertex: Reference,
    pub(crate) ref_index: Reference,
    /// The packed buffer for the parts with no reference. Indices
    /// follow the vertices in here.
    pub(crate) buffer: Option<Buffer>,

    pub(crate) attribs: Vec<Attribute>,
}

impl Primitive {
    pub fn num_vertices(&self) -> u32 {
        self.p_data.num_vertices
    }

    pub fn num_indices(&self) -> u32 {
        self.p_data.num_indices
    }

    pub fn stride(&self) -> u32 {
        self.p_data.stride
    }

    pub fn num_attribs(&self) -> usize {
        self.p_data.attribs.len()
    }

    pub(crate) fn is_same(&self, other: &Primitive) -> bool {
        Arc::ptr_eq(&self.p_data, &other.p_data)
    }
}

/// One binding of a resource group, as requested by the caller.
///
/// Empty references claim space in the group's packed buffer
/// (buffers only, images must always be referenced).
pub enum BindingDesc {
    Buffer { elem_size: u64, refs: Vec<Reference> },
    Image { refs: Vec<Reference> },
}

pub(crate) enum BindingData {
    Buffer {
        elem_size: u64,
        refs: Vec<Reference>,
        /// Offset of each element in the packed buffer. Zero for
        /// elements with a caller-provided reference.
        offsets: Vec<u64>,
    },
    Image {
        refs: Vec<Reference>,
    },
}

/// A set of buffers and images addressed as one resource.
#[derive(Clone)]
pub struct Group {
    pub(crate) g_data: Arc<GroupData>,
}

pub(crate) struct GroupData {
    pub(crate) flags: MemoryFlags,
    pub(crate) bindings: Vec<BindingData>,
    /// The packed buffer all unreferenced elements live in.
    pub(crate) buffer: Option<Buffer>,
}

impl Group {
    pub fn num_bindings(&self) -> usize {
        self.g_data.bindings.len()
    }

    pub(crate) fn is_same(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.g_data, &other.g_data)
    }
}

/// An in-flight staged transfer.
struct Transfer {
    cmd: vk::CommandBuffer,
    done: vk::Fence,
    staging: Option<(vk::Buffer, Allocation)>,
}

struct TransferPool {
    pool: vk::CommandPool,
    transfers: VecDeque<Transfer>,
}

struct HeapInternal {
    buffers: Vec<Buffer>,
    images: Vec<Image>,
    primitives: Vec<Primitive>,
    groups: Vec<Group>,
}

/// A memory heap. All resource allocation goes through one of these.
#[derive(Clone)]
pub struct Heap {
    pub(crate) h_data: Arc<HeapData>,
}

pub(crate) struct HeapData {
    pub(crate) dev: Arc<Device>,
    internal: Mutex<HeapInternal>,
    transfer: Mutex<TransferPool>,
}

impl Heap {
    pub(crate) fn new(dev: Arc<Device>) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(dev.d_transfer_family)
            .build();
        let pool = unsafe {
            dev.dev
                .create_command_pool(&info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?
        };

        Ok(Self {
            h_data: Arc::new(HeapData {
                dev: dev,
                internal: Mutex::new(HeapInternal {
                    buffers: Vec::new(),
                    images: Vec::new(),
                    primitives: Vec::new(),
                    groups: Vec::new(),
                }),
                transfer: Mutex::new(TransferPool {
                    pool: pool,
                    transfers: VecDeque::new(),
                }),
            }),
        })
    }

    fn mem_props(flags: MemoryFlags) -> vk::MemoryPropertyFlags {
        let mut props = vk::MemoryPropertyFlags::empty();
        if flags.contains(MemoryFlags::HOST_VISIBLE) {
            props |= vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        } else {
            props |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
        }
        props
    }

    /// The backing vulkan buffer for plain and composite resources.
    fn alloc_backed(&self, flags: MemoryFlags, usage: BufferUsage, size: u64) -> Result<Buffer> {
        let dev = &self.h_data.dev;
        let (vk_buffer, alloc) =
            dev.create_buffer(vk_buffer_usage(flags, usage), Self::mem_props(flags), size)?;

        Ok(Buffer {
            b_data: Arc::new(BufferData {
                flags: flags,
                usage: usage,
                size: size,
                vk_buffer: vk_buffer,
                alloc: alloc,
            }),
        })
    }

    fn destroy_buffer_data(&self, data: &BufferData) {
        let dev = &self.h_data.dev;
        unsafe {
            dev.dev.destroy_buffer(data.vk_buffer, None);
        }
        dev.free_memory(&data.alloc);
    }

    fn destroy_image_data(&self, data: &ImageData) {
        let dev = &self.h_data.dev;
        unsafe {
            dev.dev.destroy_image(data.vk_image, None);
        }
        dev.free_memory(&data.alloc);
    }

    /// Allocate a plain buffer.
    pub fn alloc_buffer(
        &self,
        flags: MemoryFlags,
        usage: BufferUsage,
        size: u64,
    ) -> Result<Buffer> {
        if size == 0 {
            log::error!("Cannot allocate a zero-size buffer");
            return Err(StratusError::INVALID);
        }

        let buffer = self.alloc_backed(flags, usage, size)?;
        self.h_data
            .internal
            .lock()
            .unwrap()
            .buffers
            .push(buffer.clone());

        Ok(buffer)
    }

    /// Allocate an image.
    ///
    /// The format is resolved against the device's format dictionary
    /// with the features the usage demands.
    pub fn alloc_image(
        &self,
        flags: MemoryFlags,
        usage: ImageUsage,
        mut fmt: Format,
        mipmaps: u32,
        layers: u32,
        extent: (u32, u32, u32),
    ) -> Result<Image> {
        let dev = &self.h_data.dev;
        let (width, height, depth) = extent;
        if width == 0 || height == 0 || depth == 0 || mipmaps == 0 || layers == 0 {
            log::error!("Cannot allocate an image with an empty extent");
            return Err(StratusError::INVALID);
        }

        let min_props = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::empty(),
            optimal_tiling_features: vk_format_features(flags, usage),
            buffer_features: vk::FormatFeatureFlags::empty(),
        };
        let vk_format = format::resolve_format(&dev.d_formats, &mut fmt, Some(&min_props));
        if vk_format == vk::Format::UNDEFINED {
            log::error!("No supported image format for the requested usage");
            return Err(StratusError::INVALID_FORMAT);
        }

        let image_type = if depth > 1 {
            vk::ImageType::TYPE_3D
        } else if height > 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_1D
        };

        let info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(vk_format)
            .extent(vk::Extent3D {
                width: width,
                height: height,
                depth: depth,
            })
            .mip_levels(mipmaps)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk_image_usage(flags, usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();

        let (vk_image, alloc) = unsafe {
            let image = dev
                .dev
                .create_image(&info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?;
            let reqs = dev.dev.get_image_memory_requirements(image);
            let alloc = match dev.alloc_memory(&reqs, Self::mem_props(flags)) {
                Ok(a) => a,
                Err(e) => {
                    dev.dev.destroy_image(image, None);
                    return Err(e);
                }
            };
            if dev.dev.bind_image_memory(image, alloc.memory, 0).is_err() {
                dev.dev.destroy_image(image, None);
                dev.free_memory(&alloc);
                return Err(StratusError::OUT_OF_MEMORY);
            }
            (image, alloc)
        };

        let image = Image {
            i_data: Arc::new(ImageData {
                flags: flags,
                usage: usage,
                fmt: fmt,
                vk_format: vk_format,
                mipmaps: mipmaps,
                layers: layers,
                width: width,
                height: height,
                depth: depth,
                vk_image: vk_image,
                alloc: alloc,
            }),
        };
        self.h_data
            .internal
            .lock()
            .unwrap()
            .images
            .push(image.clone());

        Ok(image)
    }

    /// Allocate primitive geometry.
    ///
    /// Pass empty references to have the vertex and/or index data
    /// packed into a buffer owned by the primitive (indices follow
    /// the vertices).
    pub fn alloc_primitive(
        &self,
        flags: MemoryFlags,
        num_vertices: u32,
        stride: u32,
        num_indices: u32,
        index_size: u32,
        ref_vertex: Reference,
        ref_index: Reference,
        attribs: &[Attribute],
    ) -> Result<Primitive> {
        if num_vertices == 0 || stride == 0 {
            log::error!("Cannot allocate a primitive without vertices");
            return Err(StratusError::INVALID);
        }
        if num_indices > 0 && index_size != 2 && index_size != 4 {
            log::error!("Primitive index size must be 2 or 4 bytes");
            return Err(StratusError::INVALID);
        }
        if !ref_vertex.is_null() && !ref_vertex.is_buffer() {
            log::error!("Primitive vertex reference is not a buffer reference");
            return Err(StratusError::INVALID);
        }
        if !ref_index.is_null() && !ref_index.is_buffer() {
            log::error!("Primitive index reference is not a buffer reference");
            return Err(StratusError::INVALID);
        }

        // Every attribute format must be usable as vertex input.
        let min_props = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::empty(),
            optimal_tiling_features: vk::FormatFeatureFlags::empty(),
            buffer_features: vk::FormatFeatureFlags::VERTEX_BUFFER,
        };
        for attrib in attribs.iter() {
            let mut fmt = attrib.format;
            let vk_format =
                format::resolve_format(&self.h_data.dev.d_formats, &mut fmt, Some(&min_props));
            if vk_format == vk::Format::UNDEFINED {
                log::error!("Primitive attribute format has no vertex buffer support");
                return Err(StratusError::INVALID_FORMAT);
            }
        }

        // Claim packed space for everything not referenced.
        let mut size = 0u64;
        if ref_vertex.is_null() {
            size += num_vertices as u64 * stride as u64;
        }
        if ref_index.is_null() && num_indices > 0 {
            size += num_indices as u64 * index_size as u64;
        }

        let buffer = if size > 0 {
            Some(self.alloc_backed(flags, BufferUsage::VERTEX | BufferUsage::INDEX, size)?)
        } else {
            None
        };

        let prim = Primitive {
            p_data: Arc::new(PrimitiveData {
                flags_vertex: flags,
                flags_index: flags,
                num_vertices: num_vertices,
                num_indices: num_indices,
                stride: stride,
                index_size: index_size,
                ref_vertex: ref_vertex,
                ref_index: ref_index,
                buffer: buffer,
                attribs: attribs.to_vec(),
            }),
        };
        self.h_data
            .internal
            .lock()
            .unwrap()
            .primitives
            .push(prim.clone());

        Ok(prim)
    }

    /// Allocate a resource group.
    ///
    /// Buffer bindings with empty references get consecutive regions
    /// of a packed buffer owned by the group.
    pub fn alloc_group(
        &self,
        flags: MemoryFlags,
        usage: BufferUsage,
        descs: Vec<BindingDesc>,
    ) -> Result<Group> {
        let mut size = 0u64;
        let mut bindings = Vec::with_capacity(descs.len());

        for desc in descs.into_iter() {
            match desc {
                BindingDesc::Buffer { elem_size, refs } => {
                    if elem_size == 0 || refs.is_empty() {
                        log::error!("Group buffer bindings need a size and at least one element");
                        return Err(StratusError::INVALID);
                    }
                    let mut offsets = vec![0u64; refs.len()];
                    for (i, r) in refs.iter().enumerate() {
                        if r.is_null() {
                            offsets[i] = size;
                            size += elem_size;
                        } else if !r.is_buffer() {
                            log::error!("Group buffer binding element is not a buffer reference");
                            return Err(StratusError::INVALID);
                        }
                    }
                    bindings.push(BindingData::Buffer {
                        elem_size: elem_size,
                        refs: refs,
                        offsets: offsets,
                    });
                }
                BindingDesc::Image { refs } => {
                    if refs.iter().any(|r| r.is_null() || !r.is_image()) {
                        log::error!("Group image binding elements must be image references");
                        return Err(StratusError::INVALID);
                    }
                    bindings.push(BindingData::Image { refs: refs });
                }
            }
        }

        let buffer = if size > 0 {
            Some(self.alloc_backed(flags, usage, size)?)
        } else {
            None
        };

        let group = Group {
            g_data: Arc::new(GroupData {
                flags: flags,
                bindings: bindings,
                buffer: buffer,
            }),
        };
        self.h_data
            .internal
            .lock()
            .unwrap()
            .groups
            .push(group.clone());

        Ok(group)
    }

    /// Free a buffer, immediately destroying its vulkan objects.
    /// References to it are meaningless from here on.
    pub fn free_buffer(&self, buffer: &Buffer) {
        let mut internal = self.h_data.internal.lock().unwrap();
        let len = internal.buffers.len();
        internal.buffers.retain(|b| !b.is_same(buffer));

        if internal.buffers.len() < len {
            self.destroy_buffer_data(&buffer.b_data);
        } else {
            log::error!("Freeing a buffer that is not in this heap");
        }
    }

    pub fn free_image(&self, image: &Image) {
        let mut internal = self.h_data.internal.lock().unwrap();
        let len = internal.images.len();
        internal.images.retain(|i| !i.is_same(image));

        if internal.images.len() < len {
            self.destroy_image_data(&image.i_data);
        } else {
            log::error!("Freeing an image that is not in this heap");
        }
    }

    pub fn free_primitive(&self, prim: &Primitive) {
        let mut internal = self.h_data.internal.lock().unwrap();
        let len = internal.primitives.len();
        internal.primitives.retain(|p| !p.is_same(prim));

        if internal.primitives.len() < len {
            if let Some(buffer) = prim.p_data.buffer.as_ref() {
                self.destroy_buffer_data(&buffer.b_data);
            }
        } else {
            log::error!("Freeing a primitive that is not in this heap");
        }
    }

    pub fn free_group(&self, group: &Group) {
        let mut internal = self.h_data.internal.lock().unwrap();
        let len = internal.groups.len();
        internal.groups.retain(|g| !g.is_same(group));

        if internal.groups.len() < len {
            if let Some(buffer) = group.g_data.buffer.as_ref() {
                self.destroy_buffer_data(&buffer.b_data);
            }
        } else {
            log::error!("Freeing a group that is not in this heap");
        }
    }

    /// Reclaim finished staged transfers.
    fn purge_transfers(&self, pool: &mut TransferPool) {
        let dev = &self.h_data.dev;
        loop {
            let done = match pool.transfers.front() {
                Some(t) => unsafe { dev.dev.get_fence_status(t.done).unwrap_or(false) },
                None => break,
            };
            if !done {
                break;
            }

            let transfer = pool.transfers.pop_front().unwrap();
            unsafe {
                dev.dev.destroy_fence(transfer.done, None);
                dev.dev.free_command_buffers(pool.pool, &[transfer.cmd]);
            }
            if let Some((buf, alloc)) = transfer.staging {
                unsafe { dev.dev.destroy_buffer(buf, None) };
                dev.free_memory(&alloc);
            }
        }
    }

    /// Write host data into a buffer reference.
    ///
    /// Host visible destinations are written through the mapping.
    /// Everything else goes through a staging buffer and a copy on
    /// the transfer queue. The given injection commands are resolved
    /// against the copy, so a following operation can wait on it.
    pub fn write(
        &self,
        dst: &Reference,
        data: &[u8],
        region: Option<Region>,
        injs: &[Inject],
    ) -> Result<()> {
        let dev = &self.h_data.dev;
        let unp = dst.unpack();

        let buffer = match unp.buffer() {
            Some(b) => b.clone(),
            None => {
                log::error!("Heap writes take buffer references");
                return Err(StratusError::INVALID);
            }
        };

        if let Some(r) = region.as_ref() {
            r.validate()?;
        }

        // An explicit region shifts and bounds the write.
        let (offset, size) = match region {
            Some(Region::Buffer { offset, size, .. }) => {
                let size = if size == 0 { data.len() as u64 } else { size };
                (unp.value + offset, size.min(data.len() as u64))
            }
            Some(_) => {
                log::error!("Image regions cannot address a buffer reference");
                return Err(StratusError::INVALID);
            }
            None => (unp.value, data.len() as u64),
        };

        if offset + size > buffer.b_data.size {
            log::error!("Heap write out of bounds");
            return Err(StratusError::INVALID);
        }

        // Direct path for host visible memory.
        if !buffer.b_data.alloc.ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    buffer.b_data.alloc.ptr.add(offset as usize),
                    size as usize,
                );
            }

            // Host writes still commit their signal commands so later
            // operations can depend on them.
            let mut injection = Injection::new(dev.d_graphics_family);
            injection.add_ref(unp.clone(), dst.size(), AccessMask::HOST_WRITE, ShaderStage::empty());
            dependency::deps_prepare(dev, vk::CommandBuffer::null(), true, injs, &mut injection)?;
            dependency::deps_finish(injs, &mut injection);
            return Ok(());
        }

        let mut pool = self.h_data.transfer.lock().unwrap();
        self.purge_transfers(&mut pool);

        // Stage the data in host visible memory.
        let (staging, staging_alloc) = dev.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size,
        )?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), staging_alloc.ptr, size as usize);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1)
            .build();
        let cmd = unsafe {
            dev.dev
                .allocate_command_buffers(&alloc_info)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?[0]
        };

        let mask = if dev.d_transfer_family != dev.d_graphics_family {
            AccessMask::TRANSFER_WRITE | AccessMask::TRANSFER_ASYNC
        } else {
            AccessMask::TRANSFER_WRITE
        };
        let mut injection = Injection::new(dev.d_transfer_family);
        injection.add_ref(unp.clone(), dst.size(), mask, ShaderStage::empty());

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();

        let result = (|| -> Result<vk::Fence> {
            unsafe {
                dev.dev
                    .begin_command_buffer(cmd, &begin_info)
                    .map_err(|_| StratusError::SUBMIT_FAILED)?;
            }

            dependency::deps_catch(dev, cmd, injs, &mut injection)?;
            dependency::deps_prepare(dev, cmd, false, injs, &mut injection)?;

            let copy = vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: size,
            };
            unsafe {
                dev.dev
                    .cmd_copy_buffer(cmd, staging, buffer.b_data.vk_buffer, &[copy]);
                dev.dev
                    .end_command_buffer(cmd)
                    .map_err(|_| StratusError::SUBMIT_FAILED)?;
            }

            let fence_info = vk::FenceCreateInfo::builder().build();
            let done = unsafe {
                dev.dev
                    .create_fence(&fence_info, None)
                    .map_err(|_| StratusError::OUT_OF_MEMORY)?
            };

            let cmds = [cmd];
            let submit = vk::SubmitInfo::builder()
                .command_buffers(&cmds)
                .wait_semaphores(injection.out_waits())
                .wait_dst_stage_mask(injection.out_stages())
                .signal_semaphores(injection.out_sigs())
                .build();

            if let Err(e) = dev.queue_submit(dev.d_transfer_family, &[submit], done) {
                unsafe { dev.dev.destroy_fence(done, None) };
                return Err(e);
            }

            Ok(done)
        })();

        match result {
            Ok(done) => {
                dependency::deps_finish(injs, &mut injection);
                pool.transfers.push_back(Transfer {
                    cmd: cmd,
                    done: done,
                    staging: Some((staging, staging_alloc)),
                });
                Ok(())
            }
            Err(e) => {
                dependency::deps_abort(injs, &mut injection);
                unsafe {
                    dev.dev.free_command_buffers(pool.pool, &[cmd]);
                    dev.dev.destroy_buffer(staging, None);
                }
                dev.free_memory(&staging_alloc);
                Err(e)
            }
        }
    }

    /// Block until every staged transfer has completed.
    pub fn flush(&self) -> Result<()> {
        let dev = &self.h_data.dev;
        let mut pool = self.h_data.transfer.lock().unwrap();

        let fences: Vec<vk::Fence> = pool.transfers.iter().map(|t| t.done).collect();
        if !fences.is_empty() {
            unsafe {
                dev.dev
                    .wait_for_fences(&fences, true, u64::MAX)
                    .map_err(|_| StratusError::TIMEOUT)?;
            }
        }

        self.purge_transfers(&mut pool);
        Ok(())
    }
}

impl Drop for HeapData {
    fn drop(&mut self) {
        // Drain outstanding transfers first.
        {
            let pool = self.transfer.get_mut().unwrap();
            for transfer in pool.transfers.drain(..) {
                unsafe {
                    self.dev
                        .dev
                        .wait_for_fences(&[transfer.done], true, u64::MAX)
                        .ok();
                    self.dev.dev.destroy_fence(transfer.done, None);
                }
                if let Some((buf, alloc)) = transfer.staging {
                    unsafe { self.dev.dev.destroy_buffer(buf, None) };
                    self.dev.free_memory(&alloc);
                }
            }
            unsafe { self.dev.dev.destroy_command_pool(pool.pool, None) };
        }

        // Then everything that was never freed.
        let internal = self.internal.get_mut().unwrap();
        for prim in internal.primitives.drain(..) {
            if let Some(buffer) = prim.p_data.buffer.as_ref() {
                unsafe { self.dev.dev.destroy_buffer(buffer.b_data.vk_buffer, None) };
                self.dev.free_memory(&buffer.b_data.alloc);
            }
        }
        for group in internal.groups.drain(..) {
            if let Some(buffer) = group.g_data.buffer.as_ref() {
                unsafe { self.dev.dev.destroy_buffer(buffer.b_data.vk_buffer, None) };
                self.dev.free_memory(&buffer.b_data.alloc);
            }
        }
        for buffer in internal.buffers.drain(..) {
            unsafe { self.dev.dev.destroy_buffer(buffer.b_data.vk_buffer, None) };
            self.dev.free_memory(&buffer.b_data.alloc);
        }
        for image in internal.images.drain(..) {
            unsafe { self.dev.dev.destroy_image(image.i_data.vk_image, None) };
            self.dev.free_memory(&image.i_data.alloc);
        }
    }
}
