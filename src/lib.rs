// The stratus rendering engine
//
// A declarative render graph over Vulkan: attach windows and images
// to a renderer, describe passes and what they consume, and drive an
// N-buffered frame loop. Heaps hand out memory resources, unified
// references address them (and their sub-buffers) uniformly, and
// dependency objects synchronize accesses across queues.

mod access;
mod backing;
mod dependency;
mod device;
mod format;
mod frame;
mod graph;
mod heap;
mod instance;
mod pass;
mod reference;
mod renderer;
mod swapchain;

pub use access::{AccessMask, ShaderStage};
pub use backing::{AttachSize, AttachmentDesc};
pub use dependency::{Dependency, Inject};
pub use device::{Device, DeviceFeatures, DeviceLimits, DeviceType};
pub use format::{Format, FormatFeatures, FormatOrder, FormatType, FuzzyFlags};
pub use heap::{
    Attribute, BindingDesc, Buffer, BufferUsage, Group, Heap, Image, ImageUsage, MemoryFlags,
    Primitive,
};
pub use pass::{vk_compare_op, CompareOp, DepthState, Pass, StencilState, ViewType};
pub use reference::{ImageAspect, Range, Reference, Region};
pub use renderer::{RecordInfo, Recorder, Renderer};
pub use swapchain::RecreateFlags;

extern crate utils;
use crate::instance::Instance;
use utils::log;

use std::ffi::CString;
use std::sync::Arc;

/// Errors produced by stratus.
#[allow(non_camel_case_types)]
#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum StratusError {
    #[error("Invalid argument or operation")]
    INVALID,
    #[error("No usable format found")]
    INVALID_FORMAT,
    #[error("Allocation failed")]
    OUT_OF_MEMORY,
    #[error("No usable vulkan device")]
    NO_DEVICE,
    #[error("The surface cannot be presented by this device")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Could not create a swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not create an image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("Queue submission failed")]
    SUBMIT_FAILED,
    #[error("The device was lost")]
    DEVICE_LOST,
    #[error("Timed out waiting on the device")]
    TIMEOUT,
    #[error("Some passes failed to build")]
    INCOMPLETE,
}

pub type Result<T> = std::result::Result<T, StratusError>;

/// Engine creation parameters.
///
/// Window system integration is the caller's job: pass the instance
/// extensions your surfaces need, then hand `Renderer::attach_window`
/// the surfaces themselves.
pub struct CreateInfo {
    pub(crate) name: String,
    pub(crate) enable_validation: bool,
    pub(crate) extensions: Vec<CString>,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            name: "stratus".to_string(),
            enable_validation: cfg!(debug_assertions),
            extensions: Vec::new(),
        }
    }
}

pub struct CreateInfoBuilder {
    name: String,
    enable_validation: bool,
    extensions: Vec<CString>,
}

impl CreateInfoBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Add an instance extension (e.g. the surface extensions of
    /// your windowing library).
    pub fn extension(mut self, name: &str) -> Self {
        self.extensions.push(CString::new(name).unwrap());
        self
    }

    pub fn build(self) -> CreateInfo {
        CreateInfo {
            name: self.name,
            enable_validation: self.enable_validation,
            extensions: self.extensions,
        }
    }
}

/// The engine context.
///
/// Holds the vulkan instance and all enumerated devices, and creates
/// heaps, dependencies and renderers against them.
pub struct Stratus {
    st_devices: Vec<Arc<Device>>,
    #[allow(dead_code)]
    st_inst: Arc<Instance>,
}

impl Stratus {
    /// Initialize the engine: create the instance and enumerate all
    /// usable devices, the primary one first.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let inst = Arc::new(Instance::new(info));

        let pdevs = unsafe {
            inst.inst
                .enumerate_physical_devices()
                .map_err(|_| StratusError::NO_DEVICE)?
        };

        let mut devices = Vec::new();
        for pdev in pdevs.into_iter() {
            match Device::new(inst.clone(), pdev) {
                Ok(dev) => {
                    log::info!("Enumerated device [ {} ]", dev.name());
                    devices.push(dev);
                }
                Err(e) => log::error!("Skipping unusable device: {:?}", e),
            }
        }

        // The primary device sits at index 0 and stays constant.
        devices.sort_by_key(|d| d.device_type());

        if devices.is_empty() {
            log::error!("No usable vulkan device found");
            return Err(StratusError::NO_DEVICE);
        }

        Ok(Self {
            st_devices: devices,
            st_inst: inst,
        })
    }

    pub fn get_num_devices(&self) -> usize {
        self.st_devices.len()
    }

    pub fn get_device(&self, index: usize) -> Result<Arc<Device>> {
        self.st_devices
            .get(index)
            .cloned()
            .ok_or(StratusError::INVALID)
    }

    /// The primary device, equivalent to `get_device(0)`.
    pub fn get_primary_device(&self) -> Arc<Device> {
        self.st_devices[0].clone()
    }

    /// Create a memory heap on a device.
    pub fn create_heap(&self, dev: &Arc<Device>) -> Result<Heap> {
        Heap::new(dev.clone())
    }

    /// Create a dependency object on a device.
    ///
    /// `wait_capacity` bounds how many wait commands may consume one
    /// signal before its slot recycles.
    pub fn create_dependency(&self, dev: &Arc<Device>, wait_capacity: u32) -> Dependency {
        Dependency::new(dev.clone(), wait_capacity)
    }

    /// Create a renderer with `num_frames` virtual frames.
    pub fn create_renderer(&self, dev: &Arc<Device>, num_frames: u32) -> Result<Renderer> {
        Renderer::new(dev.clone(), num_frames)
    }
}
