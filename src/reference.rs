// Unified memory resource references
//
// A reference addresses a buffer, an image, a sub-buffer of a
// primitive or group, or a renderer attachment through one value
// type. Composite references resolve recursively down to the object
// actually holding the memory. A reference is only meaningful while
// the referenced object is alive.

use ash::vk;

extern crate utils;
use crate::backing::{Attach, AttachList};
use crate::heap::{BindingData, Buffer, Group, Image, MemoryFlags, Primitive};
use crate::{Result, StratusError};
use utils::log;

use bitflags::bitflags;

bitflags! {
    /// Interpreted sub-image.
    pub struct ImageAspect: u32 {
        const COLOR   = 0x0001;
        const DEPTH   = 0x0002;
        const STENCIL = 0x0004;
    }
}

pub(crate) fn vk_image_aspect(aspect: ImageAspect) -> vk::ImageAspectFlags {
    let mut flags = vk::ImageAspectFlags::empty();
    if aspect.contains(ImageAspect::COLOR) {
        flags |= vk::ImageAspectFlags::COLOR;
    }
    if aspect.contains(ImageAspect::DEPTH) {
        flags |= vk::ImageAspectFlags::DEPTH;
    }
    if aspect.contains(ImageAspect::STENCIL) {
        flags |= vk::ImageAspectFlags::STENCIL;
    }
    flags
}

/// A sub-resource of a buffer or image.
///
/// Meaningless without an accompanying memory resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Range {
    Buffer {
        offset: u64,
        /// 0 for all bytes after `offset`.
        size: u64,
    },
    Image {
        aspect: ImageAspect,
        mipmap: u32,
        /// 0 for all mipmaps after `mipmap`.
        num_mipmaps: u32,
        layer: u32,
        /// 0 for all layers after `layer`.
        num_layers: u32,
    },
}

impl Range {
    /// The whole of a buffer.
    pub fn whole_buffer() -> Self {
        Range::Buffer { offset: 0, size: 0 }
    }

    /// The whole of an image.
    pub fn whole_image(aspect: ImageAspect) -> Self {
        Range::Image {
            aspect: aspect,
            mipmap: 0,
            num_mipmaps: 0,
            layer: 0,
            num_layers: 0,
        }
    }
}

/// Part of a sub-resource, with extent and packing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Region {
    Buffer {
        offset: u64,
        size: u64,
        /// Buffer packing for image operations, in texels.
        /// 0 means tightly packed.
        row_size: u32,
        num_rows: u32,
    },
    Image {
        /// Cannot contain both color and depth/stencil.
        aspect: ImageAspect,
        mipmap: u32,
        layer: u32,
        /// Cannot be 0, as opposed to Range.
        num_layers: u32,
        x: u32,
        y: u32,
        z: u32,
        width: u32,
        height: u32,
        depth: u32,
    },
}

impl Region {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Region::Image {
            aspect, num_layers, ..
        } = self
        {
            if aspect.contains(ImageAspect::COLOR)
                && aspect.intersects(ImageAspect::DEPTH | ImageAspect::STENCIL)
            {
                log::error!("Image region aspect cannot mix color with depth/stencil");
                return Err(StratusError::INVALID);
            }
            if *num_layers == 0 {
                log::error!("Image region must have a non-zero layer count");
                return Err(StratusError::INVALID);
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) enum RefKind {
    Empty,
    Buffer {
        buffer: Buffer,
        offset: u64,
    },
    Image {
        image: Image,
    },
    PrimVertices {
        prim: Primitive,
        attribute: usize,
        offset: u64,
    },
    PrimIndices {
        prim: Primitive,
        offset: u64,
    },
    GroupBuffer {
        group: Group,
        binding: usize,
        index: usize,
        offset: u64,
    },
    GroupImage {
        group: Group,
        binding: usize,
        index: usize,
    },
    Attachment {
        attachs: AttachList,
        index: usize,
    },
}

/// A unified memory resource reference.
///
/// Referenceable objects: Buffer, Image, Primitive (its vertex or
/// index buffer), Group (one of its buffers or images) and a
/// renderer's image attachments.
#[derive(Clone)]
pub struct Reference {
    pub(crate) r: RefKind,
}

impl Reference {
    /// The empty (i.e. null) reference.
    pub fn null() -> Self {
        Self { r: RefKind::Empty }
    }

    pub fn buffer(buffer: &Buffer) -> Self {
        Self::buffer_at(buffer, 0)
    }

    pub fn buffer_at(buffer: &Buffer, offset: u64) -> Self {
        Self {
            r: RefKind::Buffer {
                buffer: buffer.clone(),
                offset: offset,
            },
        }
    }

    pub fn image(image: &Image) -> Self {
        Self {
            r: RefKind::Image {
                image: image.clone(),
            },
        }
    }

    pub fn prim_vertices(prim: &Primitive, attribute: usize) -> Self {
        Self::prim_vertices_at(prim, attribute, 0)
    }

    pub fn prim_vertices_at(prim: &Primitive, attribute: usize, offset: u64) -> Self {
        Self {
            r: RefKind::PrimVertices {
                prim: prim.clone(),
                attribute: attribute,
                offset: offset,
            },
        }
    }

    pub fn prim_indices(prim: &Primitive) -> Self {
        Self::prim_indices_at(prim, 0)
    }

    pub fn prim_indices_at(prim: &Primitive, offset: u64) -> Self {
        Self {
            r: RefKind::PrimIndices {
                prim: prim.clone(),
                offset: offset,
            },
        }
    }

    pub fn group_buffer(group: &Group, binding: usize, index: usize) -> Self {
        Self::group_buffer_at(group, binding, index, 0)
    }

    pub fn group_buffer_at(group: &Group, binding: usize, index: usize, offset: u64) -> Self {
        Self {
            r: RefKind::GroupBuffer {
                group: group.clone(),
                binding: binding,
                index: index,
                offset: offset,
            },
        }
    }

    pub fn group_image(group: &Group, binding: usize, index: usize) -> Self {
        Self {
            r: RefKind::GroupImage {
                group: group.clone(),
                binding: binding,
                index: index,
            },
        }
    }

    pub(crate) fn attachment(attachs: AttachList, index: usize) -> Self {
        Self {
            r: RefKind::Attachment {
                attachs: attachs,
                index: index,
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.r, RefKind::Empty)
    }

    pub fn is_buffer(&self) -> bool {
        matches!(
            self.r,
            RefKind::Buffer { .. }
                | RefKind::PrimVertices { .. }
                | RefKind::PrimIndices { .. }
                | RefKind::GroupBuffer { .. }
        )
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self.r,
            RefKind::Image { .. } | RefKind::GroupImage { .. } | RefKind::Attachment { .. }
        )
    }

    /// The buffer offset this reference points at.
    pub fn offset(&self) -> u64 {
        match &self.r {
            RefKind::Buffer { offset, .. } => *offset,
            RefKind::PrimVertices { offset, .. } => *offset,
            RefKind::PrimIndices { offset, .. } => *offset,
            RefKind::GroupBuffer { offset, .. } => *offset,
            _ => 0,
        }
    }

    // Shift a buffer-like reference by an additional offset.
    fn add_offset(mut self, add: u64) -> Self {
        match &mut self.r {
            RefKind::Buffer { offset, .. } => *offset += add,
            RefKind::PrimVertices { offset, .. } => *offset += add,
            RefKind::PrimIndices { offset, .. } => *offset += add,
            RefKind::GroupBuffer { offset, .. } => *offset += add,
            _ => {}
        }
        self
    }

    /// The remaining byte size of a buffer reference from its offset.
    ///
    /// The size is dictated by the top-most object being referenced,
    /// not by the underlying resource (e.g. the size claimed for a
    /// group buffer element). Zero if not a buffer reference.
    pub fn size(&self) -> u64 {
        match &self.r {
            RefKind::Buffer { buffer, offset } => buffer.size().saturating_sub(*offset),
            RefKind::PrimVertices { prim, offset, .. } => {
                let d = &prim.p_data;
                (d.num_vertices as u64 * d.stride as u64).saturating_sub(*offset)
            }
            RefKind::PrimIndices { prim, offset } => {
                let d = &prim.p_data;
                (d.num_indices as u64 * d.index_size as u64).saturating_sub(*offset)
            }
            RefKind::GroupBuffer {
                group,
                binding,
                offset,
                ..
            } => match group.g_data.bindings.get(*binding) {
                Some(BindingData::Buffer { elem_size, .. }) => elem_size.saturating_sub(*offset),
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Resolve & validate a reference: if it references another
    /// reference, recursively return that reference, yielding the
    /// object actually holding the memory.
    ///
    /// Warns and returns the null reference when invalid.
    pub fn resolve(&self) -> Reference {
        // Retrieve the recursive reference, modifying its offset as
        // appropriate. We resolve to something that is valid in
        // user-land, so we may return it to the user.
        let rec = match &self.r {
            RefKind::PrimVertices { prim, offset, .. } => {
                if prim.p_data.num_vertices == 0 {
                    log::error!("Referencing a non-existent vertex buffer!");
                    return Reference::null();
                }

                // Must be a buffer.
                prim.p_data.ref_vertex.clone().add_offset(*offset)
            }
            RefKind::PrimIndices { prim, offset } => {
                if prim.p_data.num_indices == 0 {
                    log::error!("Referencing a non-existent index buffer!");
                    return Reference::null();
                }

                prim.p_data.ref_index.clone().add_offset(*offset)
            }
            RefKind::GroupBuffer {
                group,
                binding,
                index,
                offset,
            } => match group.g_data.bindings.get(*binding) {
                Some(BindingData::Buffer { refs, .. }) if *index < refs.len() => {
                    // An empty stored reference means the element
                    // lives in the group's own packed buffer, which
                    // makes this reference terminal.
                    refs[*index].clone().add_offset(*offset)
                }
                Some(BindingData::Image { .. }) => {
                    log::error!("Group buffer reference not a buffer!");
                    return Reference::null();
                }
                _ => {
                    log::error!("Referencing a non-existent group buffer!");
                    return Reference::null();
                }
            },
            RefKind::GroupImage {
                group,
                binding,
                index,
            } => match group.g_data.bindings.get(*binding) {
                Some(BindingData::Image { refs }) if *index < refs.len() => refs[*index].clone(),
                Some(BindingData::Buffer { .. }) => {
                    log::error!("Group image reference not an image!");
                    return Reference::null();
                }
                _ => {
                    log::error!("Referencing a non-existent group image!");
                    return Reference::null();
                }
            },
            RefKind::Attachment { attachs, index } => {
                // Note that this takes the attachment lock, references
                // are not thread-safe against the renderer detaching.
                let list = attachs.read().unwrap();
                match list.get(*index) {
                    Some(Attach::Image(_)) => Reference::null(),
                    Some(_) => {
                        log::error!("Renderer attachment reference not an image attachment!");
                        return Reference::null();
                    }
                    None => {
                        log::error!("Referencing a non-existent renderer attachment!");
                        return Reference::null();
                    }
                }
            }
            // Buffers and images cannot further resolve.
            _ => Reference::null(),
        };

        // Recursively resolve.
        if rec.is_null() {
            self.clone()
        } else {
            rec.resolve()
        }
    }

    /// Resolve & unpack a reference into its elementary non-composed
    /// object, bound-checking the resulting offset.
    pub(crate) fn unpack(&self) -> UnpackRef {
        let resolved = self.resolve();

        let unp = match &resolved.r {
            RefKind::Buffer { buffer, offset } => UnpackRef {
                obj: UnpackObj::Buffer(buffer.clone()),
                value: *offset,
                flags: buffer.b_data.flags,
            },
            RefKind::Image { image } => UnpackRef {
                obj: UnpackObj::Image(image.clone()),
                value: 0,
                flags: image.i_data.flags,
            },
            RefKind::PrimVertices { prim, offset, .. } => UnpackRef {
                obj: UnpackObj::Buffer(prim.p_data.buffer.clone().unwrap()),
                value: *offset,
                flags: prim.p_data.flags_vertex,
            },
            RefKind::PrimIndices { prim, offset } => {
                // The index data sits behind the vertex data in the
                // packed buffer, augment the offset accordingly.
                let d = &prim.p_data;
                let augment = if d.ref_vertex.is_null() {
                    d.num_vertices as u64 * d.stride as u64
                } else {
                    0
                };
                UnpackRef {
                    obj: UnpackObj::Buffer(d.buffer.clone().unwrap()),
                    value: *offset + augment,
                    flags: d.flags_index,
                }
            }
            RefKind::GroupBuffer {
                group,
                binding,
                index,
                offset,
            } => {
                let augment = match &group.g_data.bindings[*binding] {
                    BindingData::Buffer { offsets, .. } => offsets[*index],
                    _ => 0,
                };
                UnpackRef {
                    obj: UnpackObj::Buffer(group.g_data.buffer.clone().unwrap()),
                    value: *offset + augment,
                    flags: group.g_data.flags,
                }
            }
            RefKind::Attachment { attachs, index } => {
                let flags = {
                    let list = attachs.read().unwrap();
                    match list.get(*index) {
                        Some(Attach::Image(image)) => image.base.flags,
                        _ => MemoryFlags::empty(),
                    }
                };
                UnpackRef {
                    obj: UnpackObj::Attachment {
                        attachs: attachs.clone(),
                        index: *index,
                    },
                    value: *index as u64,
                    flags: flags,
                }
            }
            // A group image always resolves to a non-group ref;
            // empty stays empty.
            _ => UnpackRef::empty(),
        };

        #[cfg(debug_assertions)]
        {
            if let UnpackObj::Buffer(buffer) = &unp.obj {
                if unp.value >= buffer.size() {
                    log::error!("Buffer reference out of bounds!");
                }
            }
        }

        unp
    }
}

#[derive(Clone)]
pub(crate) enum UnpackObj {
    None,
    Buffer(Buffer),
    Image(Image),
    Attachment { attachs: AttachList, index: usize },
}

/// An unpacked memory resource reference: exactly one elementary
/// object plus a value (byte offset for buffers, attachment index
/// for renderer references).
///
/// Access is not thread-safe with respect to the referenced object.
#[derive(Clone)]
pub(crate) struct UnpackRef {
    pub(crate) obj: UnpackObj,
    pub(crate) value: u64,
    pub(crate) flags: MemoryFlags,
}

impl UnpackRef {
    pub(crate) fn empty() -> Self {
        Self {
            obj: UnpackObj::None,
            value: 0,
            flags: MemoryFlags::empty(),
        }
    }

    pub(crate) fn buffer(&self) -> Option<&Buffer> {
        match &self.obj {
            UnpackObj::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn image(&self) -> Option<&Image> {
        match &self.obj {
            UnpackObj::Image(i) => Some(i),
            _ => None,
        }
    }

    /// Equality of the referenced resource. Offsets are ignored, but
    /// attachment references also compare the attachment index.
    pub(crate) fn is_equal(&self, other: &UnpackRef) -> bool {
        match (&self.obj, &other.obj) {
            (UnpackObj::Buffer(a), UnpackObj::Buffer(b)) => a.is_same(b),
            (UnpackObj::Image(a), UnpackObj::Image(b)) => a.is_same(b),
            (
                UnpackObj::Attachment { attachs: a, index: ai },
                UnpackObj::Attachment { attachs: b, index: bi },
            ) => std::sync::Arc::ptr_eq(a, b) && ai == bi,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Allocation;
    use crate::heap::{BufferData, BufferUsage, PrimitiveData};
    use std::sync::Arc;

    pub(crate) fn mk_buffer(size: u64) -> Buffer {
        Buffer {
            b_data: Arc::new(BufferData {
                flags: MemoryFlags::WRITE,
                usage: BufferUsage::VERTEX,
                size: size,
                vk_buffer: vk::Buffer::null(),
                alloc: Allocation {
                    memory: vk::DeviceMemory::null(),
                    size: size,
                    ptr: std::ptr::null_mut(),
                },
            }),
        }
    }

    fn mk_prim(
        num_vertices: u32,
        stride: u32,
        num_indices: u32,
        ref_vertex: Reference,
        ref_index: Reference,
        buffer: Option<Buffer>,
    ) -> Primitive {
        Primitive {
            p_data: Arc::new(PrimitiveData {
                flags_vertex: MemoryFlags::WRITE,
                flags_index: MemoryFlags::WRITE,
                num_vertices: num_vertices,
                num_indices: num_indices,
                stride: stride,
                index_size: 2,
                ref_vertex: ref_vertex,
                ref_index: ref_index,
                buffer: buffer,
                attribs: Vec::new(),
            }),
        }
    }

    #[test]
    fn buffer_refs_are_terminal() {
        let buffer = mk_buffer(256);
        let r = Reference::buffer_at(&buffer, 64);

        let resolved = r.resolve();
        assert!(resolved.is_buffer());
        assert_eq!(resolved.offset(), 64);

        let unp = r.unpack();
        assert_eq!(unp.value, 64);
        assert!(unp.buffer().unwrap().is_same(&buffer));
    }

    #[test]
    fn resolve_is_idempotent() {
        let backing = mk_buffer(1024);
        let prim = mk_prim(10, 16, 6, Reference::buffer(&backing), Reference::null(), None);

        let r = Reference::prim_vertices_at(&prim, 0, 32);
        let once = r.resolve();
        let twice = once.resolve();

        assert!(once.is_buffer());
        assert_eq!(once.offset(), twice.offset());
        assert!(once.unpack().is_equal(&twice.unpack()));
    }

    #[test]
    fn prim_vertices_resolve_to_backing() {
        let backing = mk_buffer(1024);
        let prim = mk_prim(
            10,
            16,
            0,
            Reference::buffer_at(&backing, 128),
            Reference::null(),
            None,
        );

        let unp = Reference::prim_vertices_at(&prim, 0, 32).unpack();
        assert!(unp.buffer().unwrap().is_same(&backing));
        assert_eq!(unp.value, 160);
    }

    #[test]
    fn packed_indices_sit_behind_vertices() {
        // 10 vertices of 16 bytes, then 6 indices of 2 bytes.
        let packed = mk_buffer(10 * 16 + 6 * 2);
        let prim = mk_prim(
            10,
            16,
            6,
            Reference::null(),
            Reference::null(),
            Some(packed.clone()),
        );

        let unp = Reference::prim_indices_at(&prim, 4).unpack();
        assert!(unp.buffer().unwrap().is_same(&packed));
        assert_eq!(unp.value, 10 * 16 + 4);

        // With externally referenced vertices the packed buffer only
        // holds indices, no augmentation happens.
        let external = mk_buffer(1024);
        let index_packed = mk_buffer(6 * 2);
        let prim = mk_prim(
            10,
            16,
            6,
            Reference::buffer(&external),
            Reference::null(),
            Some(index_packed.clone()),
        );

        let unp = Reference::prim_indices_at(&prim, 4).unpack();
        assert!(unp.buffer().unwrap().is_same(&index_packed));
        assert_eq!(unp.value, 4);
    }

    #[test]
    fn missing_sub_buffers_resolve_to_null() {
        let backing = mk_buffer(64);
        let prim = mk_prim(4, 16, 0, Reference::buffer(&backing), Reference::null(), None);

        // No indices exist, so referencing them is invalid.
        assert!(Reference::prim_indices(&prim).resolve().is_null());
    }

    #[test]
    fn ref_size_is_dictated_by_the_top_object() {
        let backing = mk_buffer(4096);
        let prim = mk_prim(10, 16, 6, Reference::buffer(&backing), Reference::null(), None);

        // The primitive claims 160 bytes of vertices, not the whole
        // backing buffer.
        assert_eq!(Reference::prim_vertices(&prim, 0).size(), 160);
        assert_eq!(Reference::prim_vertices_at(&prim, 0, 40).size(), 120);
        assert_eq!(Reference::buffer_at(&backing, 96).size(), 4000);
        assert_eq!(Reference::prim_indices(&prim).size(), 12);
    }

    #[test]
    fn unpack_equality_ignores_offsets() {
        let buffer = mk_buffer(512);
        let a = Reference::buffer_at(&buffer, 0).unpack();
        let b = Reference::buffer_at(&buffer, 128).unpack();
        assert!(a.is_equal(&b));

        let other = mk_buffer(512);
        let c = Reference::buffer(&other).unpack();
        assert!(!a.is_equal(&c));
    }
}
