//! Compute devices and the in-order execution queue used to issue work to
//! them.
//!
//! All device work for one generation call goes through a single
//! [`ExecutionQueue`]. Commands execute in submission order, so a kernel
//! that reads a buffer always observes the copies and kernels submitted
//! before it. The only point where the host waits for the queue is
//! [`ExecutionQueue::synchronize`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde::Deserialize;

use crate::buffer::{Allocator, AnyBuffer, Location, MemoryAllocator};
use crate::kernels::Kernel;

/// Device that a generation call runs on.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Dml,
}

impl Device {
    pub fn name(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Dml => "dml",
        }
    }

    /// Return true if work for this device is issued through a queue rather
    /// than executed inline by the host.
    pub fn is_accelerated(self) -> bool {
        !matches!(self, Device::Cpu)
    }

    /// Return true if the device can increment integer buffers in place.
    ///
    /// DirectML has no such kernel, so increments are done on a host shadow
    /// buffer and uploaded.
    pub fn supports_increment_kernel(self) -> bool {
        matches!(self, Device::Cuda)
    }

    /// Return true if the device can grow an attention mask in device memory.
    pub fn supports_mask_kernel(self) -> bool {
        matches!(self, Device::Cuda)
    }

    /// Return true if execution graphs can be captured and replayed.
    pub fn supports_graph_capture(self) -> bool {
        matches!(self, Device::Cuda | Device::Dml)
    }

    /// Return true if `kernel` can be launched on this device.
    pub fn supports_kernel(self, kernel: &Kernel) -> bool {
        match kernel {
            Kernel::Increment(_) => self.supports_increment_kernel(),
            Kernel::ExtendAttentionMask { .. } => self.supports_mask_kernel(),
            Kernel::ArgMax { .. }
            | Kernel::BeamTopK { .. }
            | Kernel::AcceptTokens { .. }
            | Kernel::AppendTokens { .. }
            | Kernel::BeamScore { .. }
            | Kernel::AppendReordered { .. }
            | Kernel::CheckEos { .. } => self.is_accelerated(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors reported by buffers, allocators and execution queues.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// The operation has no implementation on the device.
    #[error("{op} is not supported on {device}")]
    Unsupported { op: &'static str, device: Device },

    /// A static buffer is too small for the shape bound to it.
    #[error("static buffer for {name} holds {capacity} elements but {requested} were requested")]
    CapacityExceeded {
        name: &'static str,
        requested: usize,
        capacity: usize,
    },

    /// The host tried to access memory it cannot address directly.
    #[error("buffer in {location} memory is not host accessible")]
    NotHostAccessible { location: Location },

    /// Source and destination of a copy differ in length or type.
    #[error("cannot copy {src} into {dst}")]
    CopyMismatch { src: String, dst: String },

    /// A kernel was launched with buffers of the wrong type or size.
    #[error("invalid arguments for {kernel}: {reason}")]
    InvalidArgument { kernel: &'static str, reason: String },

    /// An allocator could not satisfy a request.
    #[error("out of memory allocating {bytes} bytes in {location} memory")]
    OutOfMemory { location: Location, bytes: usize },

    /// The queue failed while executing previously submitted work.
    #[error("{device} queue failed: {message}")]
    QueueFailed { device: Device, message: String },
}

/// A unit of work submitted to an [`ExecutionQueue`].
pub enum Command {
    /// Copy `src` into `dst`. Both must have the same type and length.
    Copy { src: AnyBuffer, dst: AnyBuffer },

    /// Launch a device kernel.
    Launch(Kernel),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Copy { src, dst } => match (src.location(), dst.location()) {
                (Location::Device(_), Location::Device(_)) => "copy_device_to_device",
                (_, Location::Device(_)) => "copy_host_to_device",
                (Location::Device(_), _) => "copy_device_to_host",
                _ => "copy_host_to_host",
            },
            Command::Launch(kernel) => kernel.name(),
        }
    }

    fn execute(&self) -> Result<(), DeviceError> {
        match self {
            Command::Copy { src, dst } => src.copy_to(dst),
            Command::Launch(kernel) => kernel.execute(),
        }
    }
}

/// In-order queue of device work.
///
/// This is the seam to the device runtime (a CUDA stream or a DirectML
/// command queue). Submitting never blocks. Errors from work that has
/// already been submitted may be reported by a later `submit` or by
/// `synchronize`.
pub trait ExecutionQueue {
    /// Device that executes work submitted to this queue.
    fn device(&self) -> Device;

    /// Enqueue a command behind all previously submitted ones.
    fn submit(&self, command: Command) -> Result<(), DeviceError>;

    /// Wait for all submitted work to complete.
    fn synchronize(&self) -> Result<(), DeviceError>;
}

/// Host emulation of an in-order device stream.
///
/// Each command runs when it is submitted, which is a valid schedule for an
/// in-order queue. Kernels the device cannot run are rejected up front.
/// Failures during execution are sticky: they are returned by the next
/// `synchronize` and every later `submit` is refused.
pub struct StreamQueue {
    device: Device,
    failure: RefCell<Option<DeviceError>>,
    submitted: RefCell<Vec<&'static str>>,
    pending: Cell<usize>,
    synchronizations: Cell<usize>,
}

impl StreamQueue {
    pub fn new(device: Device) -> StreamQueue {
        StreamQueue {
            device,
            failure: RefCell::new(None),
            submitted: RefCell::new(Vec::new()),
            pending: Cell::new(0),
            synchronizations: Cell::new(0),
        }
    }

    /// Put the queue into the failed state, as a device fault would.
    pub fn fail(&self, message: impl Into<String>) {
        let mut failure = self.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(DeviceError::QueueFailed {
                device: self.device,
                message: message.into(),
            });
        }
    }

    /// Names of all commands submitted so far, in order.
    pub fn submitted(&self) -> Vec<&'static str> {
        self.submitted.borrow().clone()
    }

    /// Number of commands submitted since the last synchronization.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Number of times the host has waited on this queue.
    pub fn synchronizations(&self) -> usize {
        self.synchronizations.get()
    }
}

impl ExecutionQueue for StreamQueue {
    fn device(&self) -> Device {
        self.device
    }

    fn submit(&self, command: Command) -> Result<(), DeviceError> {
        if let Some(err) = self.failure.borrow().as_ref() {
            return Err(err.clone());
        }
        if let Command::Launch(kernel) = &command {
            if !self.device.supports_kernel(kernel) {
                return Err(DeviceError::Unsupported {
                    op: kernel.name(),
                    device: self.device,
                });
            }
        }

        self.submitted.borrow_mut().push(command.name());
        self.pending.set(self.pending.get() + 1);

        if let Err(err) = command.execute() {
            self.fail(err.to_string());
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.synchronizations.set(self.synchronizations.get() + 1);
        self.pending.set(0);
        match self.failure.borrow().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Execution queue and allocators for one generation call.
///
/// This is passed explicitly to every component that allocates memory or
/// issues device work.
#[derive(Clone)]
pub struct DeviceContext {
    pub queue: Rc<dyn ExecutionQueue>,

    /// Allocator for ordinary host memory.
    pub host: Rc<dyn Allocator>,

    /// Allocator for page-locked host memory used to stage transfers.
    pub pinned: Rc<dyn Allocator>,

    /// Allocator for memory on the queue's device. For the CPU this is the
    /// host allocator.
    pub device: Rc<dyn Allocator>,
}

impl DeviceContext {
    /// Create a context from a queue and allocators supplied by the device
    /// runtime.
    pub fn new(
        queue: Rc<dyn ExecutionQueue>,
        host: Rc<dyn Allocator>,
        pinned: Rc<dyn Allocator>,
        device: Rc<dyn Allocator>,
    ) -> DeviceContext {
        DeviceContext {
            queue,
            host,
            pinned,
            device,
        }
    }

    /// Create a context backed by an emulated [`StreamQueue`] for `device`.
    ///
    /// The queue is returned alongside the context so callers can inspect
    /// submitted work.
    pub fn emulated(device: Device) -> (DeviceContext, Rc<StreamQueue>) {
        let queue = Rc::new(StreamQueue::new(device));
        let host: Rc<dyn Allocator> = Rc::new(MemoryAllocator::new(Location::Host));
        let pinned: Rc<dyn Allocator> = if device.is_accelerated() {
            Rc::new(MemoryAllocator::new(Location::PinnedHost))
        } else {
            host.clone()
        };
        let device_alloc: Rc<dyn Allocator> = if device.is_accelerated() {
            Rc::new(MemoryAllocator::new(Location::Device(device)))
        } else {
            host.clone()
        };
        let ctx = DeviceContext::new(queue.clone(), host, pinned, device_alloc);
        (ctx, queue)
    }

    /// Create a context for CPU-only generation.
    pub fn cpu() -> DeviceContext {
        Self::emulated(Device::Cpu).0
    }

    pub fn device(&self) -> Device {
        self.queue.device()
    }
}
