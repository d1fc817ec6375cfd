// Vulkan device representation
//
// This stores per-GPU state: the logical VkDevice, the queue families
// we hand work to, the memory type helpers, and the format dictionary
// populated at enumeration time.

use ash::vk;

extern crate utils;
use crate::format::{self, Format, FormatRecord};
use crate::instance::Instance;
use crate::{Result, StratusError};
use utils::log;

use std::ffi::CStr;
use std::sync::{Arc, Mutex};

/// Physical device type, from most preferred to least preferred.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceType {
    DiscreteGpu,
    VirtualGpu,
    IntegratedGpu,
    Cpu,
    Unknown,
}

/// A small snapshot of the device features we care about, taken
/// once at enumeration so callers can query without vulkan calls.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceFeatures {
    pub index_uint32: bool,
    pub cube_array: bool,
    pub geometry_shader: bool,
    pub tessellation_shader: bool,
    pub compression_bc: bool,
    pub compression_etc2: bool,
    pub compression_astc: bool,
    pub sampler_anisotropy: bool,
}

/// Device limits snapshot, same idea as DeviceFeatures.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceLimits {
    pub max_image_size_2d: u32,
    pub max_image_size_3d: u32,
    pub max_image_layers: u32,
    pub max_uniform_buffer_range: u32,
    pub max_storage_buffer_range: u32,
    pub max_push_constant_size: u32,
    pub max_attributes: u32,
    pub min_uniform_buffer_align: u64,
    pub min_storage_buffer_align: u64,
}

/// A single memory allocation, bound to a buffer or image.
///
/// The mapped pointer is set for host visible allocations only.
pub(crate) struct Allocation {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) size: u64,
    pub(crate) ptr: *mut u8,
}

unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// This is the set of per-device data that needs to be "externally
/// synchronized" according to Vulkan. Queue submission falls in this
/// bucket, so all submits funnel through this lock.
pub(crate) struct DeviceInternal {
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) compute_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
}

/// Stratus Device
///
/// This holds all of the Vulkan state for one GPU. Renderers, heaps
/// and dependency objects are all created against one of these.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device this was created from
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,

    d_name: String,
    d_type: DeviceType,
    d_features: DeviceFeatures,
    d_limits: DeviceLimits,

    /// The format dictionary. A vector since lookups are fuzzy.
    pub(crate) d_formats: Vec<FormatRecord>,

    /// The queue families work is handed to. Compute and transfer
    /// fall back to the graphics family when no dedicated family
    /// exists.
    pub(crate) d_graphics_family: u32,
    pub(crate) d_compute_family: u32,
    pub(crate) d_transfer_family: u32,

    /// Externally synchronized and mutable state
    pub(crate) d_internal: Mutex<DeviceInternal>,
}

impl Device {
    /// Find a queue family with the given flags.
    ///
    /// `exclude` masks off capability bits a dedicated family should
    /// not have, so we can prefer e.g. a transfer-only family.
    fn find_queue_family(
        props: &[vk::QueueFamilyProperties],
        flags: vk::QueueFlags,
        exclude: vk::QueueFlags,
    ) -> Option<u32> {
        props
            .iter()
            .enumerate()
            .find(|(_, info)| {
                info.queue_flags.contains(flags) && !info.queue_flags.intersects(exclude)
            })
            .map(|(i, _)| i as u32)
    }

    /// Create a logical device from a physical device.
    ///
    /// One queue is created in every distinct family passed in.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queues: &[u32],
    ) -> ash::Device {
        let dev_extension_names = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures::builder().build();

        // one queue per family, all at the same priority
        let priorities = [1.0];
        let mut queue_infos = Vec::new();
        for i in queues {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*i)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos.as_ref())
            .enabled_extension_names(&dev_extension_names)
            .enabled_features(&features)
            .build();

        unsafe { inst.create_device(pdev, &dev_create_info, None).unwrap() }
    }

    fn get_device_type(props: &vk::PhysicalDeviceProperties) -> DeviceType {
        match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceType::DiscreteGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceType::VirtualGpu,
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceType::IntegratedGpu,
            vk::PhysicalDeviceType::CPU => DeviceType::Cpu,
            _ => DeviceType::Unknown,
        }
    }

    /// Initialize a Device from one physical device.
    ///
    /// This selects the queue families, creates the logical device and
    /// its queues, and fills in the format dictionary.
    pub(crate) fn new(inst: Arc<Instance>, pdev: vk::PhysicalDevice) -> Result<Arc<Self>> {
        let (props, features, mem_props, queue_props) = unsafe {
            (
                inst.inst.get_physical_device_properties(pdev),
                inst.inst.get_physical_device_features(pdev),
                inst.inst.get_physical_device_memory_properties(pdev),
                inst.inst.get_physical_device_queue_family_properties(pdev),
            )
        };

        let name = unsafe {
            CStr::from_ptr(props.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        // Pick our queue families. Graphics doubles as the present
        // family; presentability is verified per-surface later.
        let graphics =
            Self::find_queue_family(&queue_props, vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())
                .ok_or(StratusError::NO_DEVICE)?;
        let compute = Self::find_queue_family(
            &queue_props,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
        )
        .unwrap_or(graphics);
        let transfer = Self::find_queue_family(
            &queue_props,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
        .unwrap_or(graphics);

        let mut families = vec![graphics];
        for fam in [compute, transfer].iter() {
            if !families.contains(fam) {
                families.push(*fam);
            }
        }

        let dev = Self::create_device(&inst.inst, pdev, &families);

        let internal = DeviceInternal {
            graphics_queue: unsafe { dev.get_device_queue(graphics, 0) },
            compute_queue: unsafe { dev.get_device_queue(compute, 0) },
            transfer_queue: unsafe { dev.get_device_queue(transfer, 0) },
        };

        let d_features = DeviceFeatures {
            index_uint32: features.full_draw_index_uint32 != 0,
            cube_array: features.image_cube_array != 0,
            geometry_shader: features.geometry_shader != 0,
            tessellation_shader: features.tessellation_shader != 0,
            compression_bc: features.texture_compression_bc != 0,
            compression_etc2: features.texture_compression_etc2 != 0,
            compression_astc: features.texture_compression_astc_ldr != 0,
            sampler_anisotropy: features.sampler_anisotropy != 0,
        };

        let d_limits = DeviceLimits {
            max_image_size_2d: props.limits.max_image_dimension2_d,
            max_image_size_3d: props.limits.max_image_dimension3_d,
            max_image_layers: props.limits.max_image_array_layers,
            max_uniform_buffer_range: props.limits.max_uniform_buffer_range,
            max_storage_buffer_range: props.limits.max_storage_buffer_range,
            max_push_constant_size: props.limits.max_push_constants_size,
            max_attributes: props.limits.max_vertex_input_attributes,
            min_uniform_buffer_align: props.limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_align: props.limits.min_storage_buffer_offset_alignment,
        };

        // The format dictionary needs instance access, build it here
        let d_formats = format::init_formats(&inst.inst, pdev);
        log::debug!(
            "[ {} ] format dictionary holds {} formats",
            name,
            d_formats.len()
        );

        Ok(Arc::new(Self {
            inst: inst,
            dev: dev,
            pdev: pdev,
            mem_props: mem_props,
            d_name: name,
            d_type: Self::get_device_type(&props),
            d_features: d_features,
            d_limits: d_limits,
            d_formats: d_formats,
            d_graphics_family: graphics,
            d_compute_family: compute,
            d_transfer_family: transfer,
            d_internal: Mutex::new(internal),
        }))
    }

    pub fn name(&self) -> &str {
        &self.d_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.d_type
    }

    pub fn features(&self) -> &DeviceFeatures {
        &self.d_features
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.d_limits
    }

    /// All supported features of every known format containing `fmt`.
    pub fn format_support(&self, fmt: Format) -> crate::format::FormatFeatures {
        format::format_support(&self.d_formats, &fmt)
    }

    /// Fuzzy-search the format dictionary; see the format module for
    /// the matching rules.
    pub fn format_fuzzy(
        &self,
        fmt: Format,
        flags: crate::format::FuzzyFlags,
        features: crate::format::FormatFeatures,
    ) -> Format {
        format::format_fuzzy(&self.d_formats, &fmt, flags, features)
    }

    /// Find the first memory type index satisfying `props`.
    ///
    /// Vulkan devices have multiple types of memory to allocate from,
    /// which vary in size and features. We have to find one matching
    /// the buffer's requirement bits and our property request.
    pub(crate) fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        props: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, t) in self.mem_props.memory_types.iter().enumerate() {
            if reqs.memory_type_bits & (1 << i) != 0 && t.property_flags.contains(props) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocate device memory for the given requirements, mapping it
    /// when HOST_VISIBLE is requested.
    pub(crate) fn alloc_memory(
        &self,
        reqs: &vk::MemoryRequirements,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let index = self
            .find_memory_type_index(reqs, props)
            .ok_or(StratusError::OUT_OF_MEMORY)?;

        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index)
            .build();

        let memory = unsafe {
            self.dev
                .allocate_memory(&info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?
        };

        let ptr = if props.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            unsafe {
                self.dev
                    .map_memory(memory, 0, reqs.size, vk::MemoryMapFlags::empty())
                    .map_err(|_| StratusError::OUT_OF_MEMORY)? as *mut u8
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Allocation {
            memory: memory,
            size: reqs.size,
            ptr: ptr,
        })
    }

    pub(crate) fn free_memory(&self, alloc: &Allocation) {
        unsafe {
            if !alloc.ptr.is_null() {
                self.dev.unmap_memory(alloc.memory);
            }
            self.dev.free_memory(alloc.memory, None);
        }
    }

    /// Create a buffer and bind fresh memory to it.
    pub(crate) fn create_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, Allocation)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        unsafe {
            let buffer = self
                .dev
                .create_buffer(&info, None)
                .map_err(|_| StratusError::OUT_OF_MEMORY)?;
            let reqs = self.dev.get_buffer_memory_requirements(buffer);
            let alloc = match self.alloc_memory(&reqs, props) {
                Ok(a) => a,
                Err(e) => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if self
                .dev
                .bind_buffer_memory(buffer, alloc.memory, 0)
                .is_err()
            {
                self.dev.destroy_buffer(buffer, None);
                self.free_memory(&alloc);
                return Err(StratusError::OUT_OF_MEMORY);
            }

            Ok((buffer, alloc))
        }
    }

    /// Submit to one of our queues under the external-sync lock.
    pub(crate) fn queue_submit(
        &self,
        family: u32,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<()> {
        let internal = self.d_internal.lock().unwrap();
        let queue = if family == self.d_transfer_family {
            internal.transfer_queue
        } else if family == self.d_compute_family {
            internal.compute_queue
        } else {
            internal.graphics_queue
        };

        unsafe {
            self.dev.queue_submit(queue, submits, fence).map_err(|e| {
                log::error!("vkQueueSubmit failed: {:?}", e);
                match e {
                    vk::Result::ERROR_DEVICE_LOST => StratusError::DEVICE_LOST,
                    _ => StratusError::SUBMIT_FAILED,
                }
            })
        }
    }

    pub(crate) fn graphics_queue(&self) -> vk::Queue {
        self.d_internal.lock().unwrap().graphics_queue
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.device_wait_idle().unwrap();
            self.dev.destroy_device(None);
        }
    }
}
