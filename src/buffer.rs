//! Owned memory on the host or a device, and the tensors built on it.
//!
//! A [`Buffer`] is a reference-counted allocation tagged with the memory it
//! lives in. Cloning a buffer clones the handle, not the contents, which is
//! how tensors bound into a model's input list and the components updating
//! them refer to the same memory.
//!
//! Host code can only read and write buffers in host or pinned host memory.
//! Device memory is accessed by submitting copies and kernels to an
//! [`ExecutionQueue`].

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::device::{Command, Device, DeviceError, ExecutionQueue};

/// Element type of a buffer or tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Int32,
    Int64,
    Float,
}

impl DataType {
    /// Return the size of elements of this type in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float => "float32",
        };
        write!(f, "{}", name)
    }
}

/// Memory that a buffer lives in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Location {
    Host,
    /// Page-locked host memory that devices can transfer from
    /// asynchronously.
    PinnedHost,
    Device(Device),
}

impl Location {
    pub fn is_host_accessible(self) -> bool {
        matches!(self, Location::Host | Location::PinnedHost)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::PinnedHost => write!(f, "pinned host"),
            Location::Device(device) => write!(f, "{} device", device),
        }
    }
}

/// Element types that can be stored in a [`Buffer`].
pub trait Element: Copy + Default + fmt::Debug + PartialEq + 'static {
    const DTYPE: DataType;

    fn into_any(buf: Buffer<Self>) -> AnyBuffer;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::Int32;

    fn into_any(buf: Buffer<i32>) -> AnyBuffer {
        AnyBuffer::Int32(buf)
    }
}

impl Element for i64 {
    const DTYPE: DataType = DataType::Int64;

    fn into_any(buf: Buffer<i64>) -> AnyBuffer {
        AnyBuffer::Int64(buf)
    }
}

impl Element for f32 {
    const DTYPE: DataType = DataType::Float;

    fn into_any(buf: Buffer<f32>) -> AnyBuffer {
        AnyBuffer::Float(buf)
    }
}

/// Integer element types used for position ids, masks and lengths.
pub trait IntElement: Element + std::ops::Add<Output = Self> {
    const ZERO: Self;
    const ONE: Self;

    fn from_usize(value: usize) -> Self;
}

impl IntElement for i32 {
    const ZERO: i32 = 0;
    const ONE: i32 = 1;

    fn from_usize(value: usize) -> i32 {
        value as i32
    }
}

impl IntElement for i64 {
    const ZERO: i64 = 0;
    const ONE: i64 = 1;

    fn from_usize(value: usize) -> i64 {
        value as i64
    }
}

/// Reference-counted allocation in host or device memory.
///
/// A buffer may cover a prefix of a larger allocation. This is how views
/// into a [`StaticBuffer`] share its fixed address.
pub struct Buffer<T> {
    location: Location,
    storage: Rc<RefCell<Vec<T>>>,
    len: usize,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Buffer {
            location: self.location,
            storage: self.storage.clone(),
            len: self.len,
        }
    }
}

impl<T: Element> Buffer<T> {
    /// Create a zero-filled buffer.
    ///
    /// Components should allocate through an [`Allocator`]. This is for
    /// allocator implementations and tests.
    pub fn zeros(location: Location, len: usize) -> Buffer<T> {
        Self::from_vec(location, vec![T::default(); len])
    }

    /// Wrap existing data as a buffer in `location`.
    pub fn from_vec(location: Location, data: Vec<T>) -> Buffer<T> {
        Buffer {
            location,
            len: data.len(),
            storage: Rc::new(RefCell::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Return an identifier for the buffer's storage address.
    ///
    /// Two buffers with the same address share memory.
    pub fn addr(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    /// Return a view of the first `len` elements, sharing storage.
    pub(crate) fn prefix(&self, len: usize) -> Buffer<T> {
        assert!(len <= self.storage.borrow().len());
        Buffer {
            location: self.location,
            storage: self.storage.clone(),
            len,
        }
    }

    /// Borrow the contents for reading on the host.
    pub fn host(&self) -> Result<Ref<'_, [T]>, DeviceError> {
        self.check_host_accessible()?;
        Ok(self.device_data())
    }

    /// Borrow the contents for writing on the host.
    pub fn host_mut(&self) -> Result<RefMut<'_, [T]>, DeviceError> {
        self.check_host_accessible()?;
        Ok(self.device_data_mut())
    }

    /// Copy the contents to a `Vec`, synchronizing `queue` first if the
    /// buffer is in device memory.
    pub fn download(&self, queue: &dyn ExecutionQueue) -> Result<Vec<T>, DeviceError> {
        if self.location.is_host_accessible() {
            return Ok(self.host()?.to_vec());
        }
        let staging = Buffer::zeros(Location::PinnedHost, self.len);
        queue.submit(Command::Copy {
            src: self.clone().into(),
            dst: staging.clone().into(),
        })?;
        queue.synchronize()?;
        let data = staging.host()?.to_vec();
        Ok(data)
    }

    /// Access the contents regardless of location. Only kernels and copies
    /// executing on a queue use this.
    pub(crate) fn device_data(&self) -> Ref<'_, [T]> {
        let len = self.len;
        Ref::map(self.storage.borrow(), |v| &v[..len])
    }

    pub(crate) fn device_data_mut(&self) -> RefMut<'_, [T]> {
        let len = self.len;
        RefMut::map(self.storage.borrow_mut(), |v| &mut v[..len])
    }

    fn check_host_accessible(&self) -> Result<(), DeviceError> {
        if self.location.is_host_accessible() {
            Ok(())
        } else {
            Err(DeviceError::NotHostAccessible {
                location: self.location,
            })
        }
    }
}

impl<T: Element> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Buffer<{}>({} in {})", T::DTYPE, self.len, self.location)
    }
}

/// A [`Buffer`] whose element type is only known at runtime.
#[derive(Clone, Debug)]
pub enum AnyBuffer {
    Int32(Buffer<i32>),
    Int64(Buffer<i64>),
    Float(Buffer<f32>),
}

impl<T: Element> From<Buffer<T>> for AnyBuffer {
    fn from(buf: Buffer<T>) -> AnyBuffer {
        T::into_any(buf)
    }
}

impl AnyBuffer {
    pub fn dtype(&self) -> DataType {
        match self {
            AnyBuffer::Int32(_) => DataType::Int32,
            AnyBuffer::Int64(_) => DataType::Int64,
            AnyBuffer::Float(_) => DataType::Float,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AnyBuffer::Int32(b) => b.len(),
            AnyBuffer::Int64(b) => b.len(),
            AnyBuffer::Float(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn location(&self) -> Location {
        match self {
            AnyBuffer::Int32(b) => b.location(),
            AnyBuffer::Int64(b) => b.location(),
            AnyBuffer::Float(b) => b.location(),
        }
    }

    /// Copy the contents into `dst`, which must have the same type and
    /// length. This is the body of a queue copy command.
    pub(crate) fn copy_to(&self, dst: &AnyBuffer) -> Result<(), DeviceError> {
        fn copy<T: Element>(src: &Buffer<T>, dst: &Buffer<T>) {
            if Rc::ptr_eq(&src.storage, &dst.storage) {
                return;
            }
            dst.device_data_mut().copy_from_slice(&src.device_data());
        }

        let mismatch = || DeviceError::CopyMismatch {
            src: format!("{:?}", self),
            dst: format!("{:?}", dst),
        };
        if self.len() != dst.len() {
            return Err(mismatch());
        }
        match (self, dst) {
            (AnyBuffer::Int32(s), AnyBuffer::Int32(d)) => copy(s, d),
            (AnyBuffer::Int64(s), AnyBuffer::Int64(d)) => copy(s, d),
            (AnyBuffer::Float(s), AnyBuffer::Float(d)) => copy(s, d),
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

/// Memory allocator for one kind of memory.
///
/// Allocators are supplied by the device runtime.
pub trait Allocator {
    /// Memory that buffers from this allocator live in.
    fn location(&self) -> Location;

    /// Reserve `bytes` for a new buffer, failing if they are unavailable.
    fn reserve(&self, bytes: usize) -> Result<(), DeviceError>;
}

/// Typed allocation on top of [`Allocator`].
pub trait AllocatorExt: Allocator {
    /// Allocate a zero-filled buffer of `len` elements.
    fn alloc<T: Element>(&self, len: usize) -> Result<Buffer<T>, DeviceError> {
        self.reserve(len * T::DTYPE.size())?;
        Ok(Buffer::zeros(self.location(), len))
    }

    /// Allocate a buffer holding a copy of `data`.
    ///
    /// The data is written by the host, so the allocator must return host
    /// accessible memory.
    fn alloc_from<T: Element>(&self, data: &[T]) -> Result<Buffer<T>, DeviceError> {
        let buf = self.alloc(data.len())?;
        buf.host_mut()?.copy_from_slice(data);
        Ok(buf)
    }

    /// Allocate a tensor of the given shape.
    fn alloc_tensor<T: Element>(&self, shape: &[usize]) -> Result<DeviceTensor<T>, DeviceError> {
        let buf = self.alloc(shape.iter().product())?;
        Ok(DeviceTensor::new(buf, shape))
    }
}

impl<A: Allocator + ?Sized> AllocatorExt for A {}

/// An [`Allocator`] backed by host memory, tagged with the location it
/// represents.
pub struct MemoryAllocator {
    location: Location,
    limit: Option<usize>,
    used: std::cell::Cell<usize>,
}

impl MemoryAllocator {
    pub fn new(location: Location) -> MemoryAllocator {
        MemoryAllocator {
            location,
            limit: None,
            used: std::cell::Cell::new(0),
        }
    }

    /// Fail allocations once `bytes` have been handed out in total.
    pub fn with_limit(mut self, bytes: usize) -> MemoryAllocator {
        self.limit = Some(bytes);
        self
    }

    /// Total bytes handed out so far.
    pub fn allocated_bytes(&self) -> usize {
        self.used.get()
    }
}

impl Allocator for MemoryAllocator {
    fn location(&self) -> Location {
        self.location
    }

    fn reserve(&self, bytes: usize) -> Result<(), DeviceError> {
        let total = self.used.get() + bytes;
        if self.limit.is_some_and(|limit| total > limit) {
            return Err(DeviceError::OutOfMemory {
                location: self.location,
                bytes,
            });
        }
        self.used.set(total);
        Ok(())
    }
}

/// A buffer with a shape.
pub struct DeviceTensor<T> {
    buf: Buffer<T>,
    shape: SmallVec<[usize; 4]>,
}

impl<T> Clone for DeviceTensor<T> {
    fn clone(&self) -> Self {
        DeviceTensor {
            buf: self.buf.clone(),
            shape: self.shape.clone(),
        }
    }
}

impl<T: Element> DeviceTensor<T> {
    /// Wrap a buffer as a tensor. The buffer length must match the shape.
    pub fn new(buf: Buffer<T>, shape: &[usize]) -> DeviceTensor<T> {
        assert_eq!(
            buf.len(),
            shape.iter().product::<usize>(),
            "buffer length does not match shape {:?}",
            shape
        );
        DeviceTensor {
            buf,
            shape: SmallVec::from_slice(shape),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn buffer(&self) -> &Buffer<T> {
        &self.buf
    }

    pub fn location(&self) -> Location {
        self.buf.location()
    }
}

impl<T: Element> fmt::Debug for DeviceTensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceTensor<{}>({:?} in {})", T::DTYPE, self.shape, self.location())
    }
}

/// A [`DeviceTensor`] whose element type is only known at runtime.
#[derive(Clone, Debug)]
pub enum AnyTensor {
    Int32(DeviceTensor<i32>),
    Int64(DeviceTensor<i64>),
    Float(DeviceTensor<f32>),
}

impl AnyTensor {
    pub fn dtype(&self) -> DataType {
        match self {
            AnyTensor::Int32(_) => DataType::Int32,
            AnyTensor::Int64(_) => DataType::Int64,
            AnyTensor::Float(_) => DataType::Float,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            AnyTensor::Int32(t) => t.shape(),
            AnyTensor::Int64(t) => t.shape(),
            AnyTensor::Float(t) => t.shape(),
        }
    }

    pub fn location(&self) -> Location {
        match self {
            AnyTensor::Int32(t) => t.location(),
            AnyTensor::Int64(t) => t.location(),
            AnyTensor::Float(t) => t.location(),
        }
    }

    /// Return the storage address of the tensor's buffer.
    pub fn addr(&self) -> usize {
        match self {
            AnyTensor::Int32(t) => t.buffer().addr(),
            AnyTensor::Int64(t) => t.buffer().addr(),
            AnyTensor::Float(t) => t.buffer().addr(),
        }
    }
}

impl From<DeviceTensor<i32>> for AnyTensor {
    fn from(t: DeviceTensor<i32>) -> AnyTensor {
        AnyTensor::Int32(t)
    }
}

impl From<DeviceTensor<i64>> for AnyTensor {
    fn from(t: DeviceTensor<i64>) -> AnyTensor {
        AnyTensor::Int64(t)
    }
}

impl From<DeviceTensor<f32>> for AnyTensor {
    fn from(t: DeviceTensor<f32>) -> AnyTensor {
        AnyTensor::Float(t)
    }
}

/// Fixed-capacity allocation whose address never changes.
///
/// Graph replay records buffer addresses when the graph is captured, so
/// tensors fed to a replayed graph must be bound into the same memory on
/// every step. A static buffer is allocated once with the largest shape the
/// generation can need and each step binds a view of it. Binding a shape
/// larger than the capacity is an error, never a reallocation.
pub struct StaticBuffer<T> {
    name: &'static str,
    storage: Buffer<T>,
}

impl<T: Element> StaticBuffer<T> {
    /// Allocate a static buffer of `capacity` elements for the input `name`.
    pub fn new(
        allocator: &dyn Allocator,
        name: &'static str,
        capacity: usize,
    ) -> Result<StaticBuffer<T>, DeviceError> {
        Ok(StaticBuffer {
            name,
            storage: allocator.alloc(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn addr(&self) -> usize {
        self.storage.addr()
    }

    /// Bind a tensor of `shape` at the start of the buffer.
    pub fn bind(&self, shape: &[usize]) -> Result<DeviceTensor<T>, DeviceError> {
        let requested: usize = shape.iter().product();
        if requested > self.capacity() {
            return Err(DeviceError::CapacityExceeded {
                name: self.name,
                requested,
                capacity: self.capacity(),
            });
        }
        Ok(DeviceTensor::new(self.storage.prefix(requested), shape))
    }
}
