//! Raw tensor memory views in `halide_buffer_t` layout.
//!
//! A [`BufferDescriptor`] either owns its host bytes and dimension array or
//! references caller memory. `own_host` / `own_dim` decide what teardown
//! frees. Teardown is idempotent and also runs from `Drop`.

use std::cell::Cell;
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::error::{BridgeError, Result};
use crate::ffi;

thread_local! {
    static LIVE: Cell<isize> = const { Cell::new(0) };
}

fn track(delta: isize) {
    LIVE.with(|live| live.set(live.get() + delta));
}

/// Host blocks and dimension arrays allocated minus freed on this thread.
pub fn live_allocations() -> isize {
    LIVE.with(Cell::get)
}

/// Element type family (`halide_type_code_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Int,
    UInt,
    Float,
    Handle,
    BFloat,
}

impl TypeCode {
    pub fn from_raw(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Int),
            1 => Ok(Self::UInt),
            2 => Ok(Self::Float),
            3 => Ok(Self::Handle),
            4 => Ok(Self::BFloat),
            other => Err(BridgeError::argument(format!("unknown type code {}", other))),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Self::Int => 0,
            Self::UInt => 1,
            Self::Float => 2,
            Self::Handle => 3,
            Self::BFloat => 4,
        }
    }
}

/// Element type tag. Equality is structural over code, bits and lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HalideType {
    pub code: TypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl HalideType {
    pub const fn new(code: TypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub const fn f32() -> Self {
        Self::new(TypeCode::Float, 32, 1)
    }

    pub const fn f64() -> Self {
        Self::new(TypeCode::Float, 64, 1)
    }

    pub const fn bfloat16() -> Self {
        Self::new(TypeCode::BFloat, 16, 1)
    }

    pub const fn i8() -> Self {
        Self::new(TypeCode::Int, 8, 1)
    }

    pub const fn i32() -> Self {
        Self::new(TypeCode::Int, 32, 1)
    }

    pub const fn i64() -> Self {
        Self::new(TypeCode::Int, 64, 1)
    }

    pub const fn u8() -> Self {
        Self::new(TypeCode::UInt, 8, 1)
    }

    pub const fn bool() -> Self {
        Self::new(TypeCode::UInt, 1, 1)
    }

    pub const fn handle() -> Self {
        Self::new(TypeCode::Handle, 64, 1)
    }

    /// Storage size of one element, rounded up to whole bytes.
    pub fn bytes(&self) -> usize {
        (self.bits as usize + 7) / 8
    }
}

impl From<HalideType> for ffi::RawHalideType {
    fn from(ty: HalideType) -> Self {
        ffi::RawHalideType {
            code: ty.code.as_raw(),
            bits: ty.bits,
            lanes: ty.lanes,
        }
    }
}

impl TryFrom<ffi::RawHalideType> for HalideType {
    type Error = BridgeError;

    fn try_from(raw: ffi::RawHalideType) -> Result<Self> {
        Ok(Self {
            code: TypeCode::from_raw(raw.code)?,
            bits: raw.bits,
            lanes: raw.lanes,
        })
    }
}

impl fmt::Display for HalideType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.code {
            TypeCode::Int => "i",
            TypeCode::UInt => "u",
            TypeCode::Float => "f",
            TypeCode::Handle => "handle",
            TypeCode::BFloat => "bf",
        };
        write!(f, "{}{}", prefix, self.bits)?;
        if self.lanes != 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

/// One dimension of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimension {
    pub min: i32,
    pub extent: i32,
    pub stride: i32,
    pub flags: u32,
}

impl Dimension {
    pub fn new(min: i32, extent: i32, stride: i32) -> Self {
        Self {
            min,
            extent,
            stride,
            flags: 0,
        }
    }

    /// Dense row-major dimensions for `shape`. Fails when an outer stride
    /// does not fit in `i32`.
    pub fn dense(shape: &[i32]) -> Result<Vec<Self>> {
        let mut stride: i32 = 1;
        let mut dims = vec![Self::default(); shape.len()];
        for (i, (dim, &extent)) in dims.iter_mut().zip(shape).enumerate().rev() {
            *dim = Self::new(0, extent, stride);
            if i > 0 {
                stride = stride.checked_mul(extent.max(1)).ok_or_else(|| {
                    BridgeError::argument(format!("strides of {:?} overflow i32", shape))
                })?;
            }
        }
        Ok(dims)
    }
}

impl From<Dimension> for ffi::RawHalideDimension {
    fn from(d: Dimension) -> Self {
        ffi::RawHalideDimension {
            min: d.min,
            extent: d.extent,
            stride: d.stride,
            flags: d.flags,
        }
    }
}

impl From<ffi::RawHalideDimension> for Dimension {
    fn from(d: ffi::RawHalideDimension) -> Self {
        Self {
            min: d.min,
            extent: d.extent,
            stride: d.stride,
            flags: d.flags,
        }
    }
}

/// Dirty bits of a buffer (`halide_buffer_flags`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u64);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const HOST_DIRTY: Self = Self(1);
    pub const DEVICE_DIRTY: Self = Self(2);
    pub const ALL: Self = Self(3);

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Keep only the defined bits.
    pub fn from_bits_truncate(bits: u64) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for BufferFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Read the dimension records of a native buffer.
///
/// # Safety
///
/// `raw` must be null or point to a live `halide_buffer_t` whose `dim`
/// holds `dimensions` entries.
pub unsafe fn read_dimensions(raw: *const ffi::RawHalideBuffer) -> Vec<Dimension> {
    let Some(buffer) = raw.as_ref() else {
        return Vec::new();
    };
    if buffer.dim.is_null() || buffer.dimensions <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(buffer.dim, buffer.dimensions as usize)
        .iter()
        .copied()
        .map(Dimension::from)
        .collect()
}

/// A multi-dimensional memory region in native `halide_buffer_t` layout.
pub struct BufferDescriptor {
    raw: Box<ffi::RawHalideBuffer>,
    host_len: usize,
    own_host: bool,
    own_dim: bool,
    destroyed: bool,
}

impl BufferDescriptor {
    /// Build a descriptor, allocating zeroed host memory when
    /// `auto_allocate` is set.
    pub fn new(
        dimensions: usize,
        specs: &[Dimension],
        ty: HalideType,
        auto_allocate: bool,
    ) -> Result<Self> {
        // SAFETY: no caller memory is referenced.
        unsafe { Self::with_host(dimensions, specs, ty, None, auto_allocate) }
    }

    /// Build a descriptor over caller-owned host memory, or allocate when
    /// `host` is `None` and `auto_allocate` is set.
    ///
    /// # Safety
    ///
    /// A supplied `host` must stay valid for `byte size` bytes for as long
    /// as the descriptor can be read or written through.
    pub unsafe fn with_host(
        dimensions: usize,
        specs: &[Dimension],
        ty: HalideType,
        host: Option<NonNull<u8>>,
        auto_allocate: bool,
    ) -> Result<Self> {
        if specs.len() != dimensions {
            return Err(BridgeError::argument(format!(
                "{} dimensions declared but {} dimension records given",
                dimensions,
                specs.len()
            )));
        }
        if let Some(bad) = specs.iter().find(|d| d.extent < 0) {
            return Err(BridgeError::argument(format!(
                "negative extent {}",
                bad.extent
            )));
        }
        if i32::try_from(dimensions).is_err() {
            return Err(BridgeError::argument("too many dimensions"));
        }
        let byte_size = specs
            .iter()
            .try_fold(ty.bytes(), |acc, d| acc.checked_mul(d.extent as usize))
            .ok_or_else(|| BridgeError::allocation("buffer size overflows usize"))?;

        let (host_ptr, host_len, own_host) = match host {
            Some(ptr) => (ptr.as_ptr(), byte_size, false),
            None if auto_allocate && byte_size > 0 => {
                let mut bytes = Vec::new();
                bytes.try_reserve_exact(byte_size).map_err(|_| {
                    BridgeError::allocation(format!("{} byte host buffer", byte_size))
                })?;
                bytes.resize(byte_size, 0u8);
                track(1);
                let block = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
                (block, byte_size, true)
            }
            None => (ptr::null_mut(), 0, false),
        };

        let (dim_ptr, own_dim) = if specs.is_empty() {
            (ptr::null_mut(), false)
        } else {
            let records: Box<[ffi::RawHalideDimension]> =
                specs.iter().copied().map(Into::into).collect();
            track(1);
            (Box::into_raw(records) as *mut ffi::RawHalideDimension, true)
        };

        debug!(dimensions, byte_size, own_host, "buffer descriptor created");
        Ok(Self {
            raw: Box::new(ffi::RawHalideBuffer {
                device: 0,
                device_interface: ptr::null(),
                host: host_ptr,
                flags: 0,
                type_: ty.into(),
                dimensions: dimensions as i32,
                dim: dim_ptr,
                padding: ptr::null_mut(),
            }),
            host_len,
            own_host,
            own_dim,
            destroyed: false,
        })
    }

    fn live(&self) -> Result<&ffi::RawHalideBuffer> {
        if self.destroyed {
            Err(BridgeError::InvalidHandle("buffer descriptor"))
        } else {
            Ok(&self.raw)
        }
    }

    /// Free whatever this descriptor owns and null its pointers.
    ///
    /// Safe to call any number of times.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if self.own_host && !self.raw.host.is_null() {
            // SAFETY: host came from Box<[u8]> of length host_len.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    self.raw.host,
                    self.host_len,
                )));
            }
            track(-1);
        }
        if self.own_dim && !self.raw.dim.is_null() {
            // SAFETY: dim came from Box<[RawHalideDimension]> of `dimensions` entries.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    self.raw.dim,
                    self.raw.dimensions as usize,
                )));
            }
            track(-1);
        }
        self.raw.host = ptr::null_mut();
        self.raw.dim = ptr::null_mut();
        self.host_len = 0;
        self.own_host = false;
        self.own_dim = false;
        self.destroyed = true;
        trace!("buffer descriptor destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn owns_host(&self) -> bool {
        self.own_host
    }

    pub fn owns_dims(&self) -> bool {
        self.own_dim
    }

    pub fn set_flags(&mut self, flags: BufferFlags) -> Result<()> {
        self.live()?;
        self.raw.flags = flags.bits();
        Ok(())
    }

    pub fn flags(&self) -> Result<BufferFlags> {
        Ok(BufferFlags::from_bits_truncate(self.live()?.flags))
    }

    pub fn type_(&self) -> Result<HalideType> {
        HalideType::try_from(self.live()?.type_)
    }

    pub fn dimensions(&self) -> Result<usize> {
        Ok(self.live()?.dimensions as usize)
    }

    pub fn dims(&self) -> Result<Vec<Dimension>> {
        let raw = self.live()?;
        // SAFETY: dim holds `dimensions` records while not destroyed.
        Ok(unsafe { read_dimensions(raw) })
    }

    /// Total bytes covered: product of extents times element size.
    pub fn byte_size(&self) -> Result<usize> {
        let ty = self.type_()?;
        Ok(self
            .dims()?
            .iter()
            .fold(ty.bytes(), |acc, d| acc * d.extent as usize))
    }

    pub fn host_ptr(&self) -> Result<*mut u8> {
        Ok(self.live()?.host)
    }

    pub fn host_bytes(&self) -> Result<&[u8]> {
        let size = self.byte_size()?;
        let host = self.live()?.host;
        if host.is_null() || size == 0 {
            return Ok(&[]);
        }
        // SAFETY: host covers byte_size bytes (owned, or promised by with_host).
        Ok(unsafe { std::slice::from_raw_parts(host, size) })
    }

    pub fn host_bytes_mut(&mut self) -> Result<&mut [u8]> {
        let size = self.byte_size()?;
        let host = self.live()?.host;
        if host.is_null() || size == 0 {
            return Ok(&mut []);
        }
        // SAFETY: as host_bytes, and &mut self guarantees exclusivity.
        Ok(unsafe { std::slice::from_raw_parts_mut(host, size) })
    }

    /// Pointer to the native-layout struct, for handing to C.
    pub fn as_raw(&self) -> Result<*const ffi::RawHalideBuffer> {
        Ok(self.live()? as *const ffi::RawHalideBuffer)
    }
}

impl fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("dimensions", &self.raw.dimensions)
            .field("host_len", &self.host_len)
            .field("own_host", &self.own_host)
            .field("own_dim", &self.own_dim)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Drop for BufferDescriptor {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_allocates_product_of_extents() {
        let dims = Dimension::dense(&[2, 3, 4]).unwrap();
        let buf = BufferDescriptor::new(3, &dims, HalideType::f32(), true).unwrap();
        assert!(buf.owns_host());
        assert_eq!(buf.byte_size().unwrap(), 2 * 3 * 4 * 4);
        assert_eq!(buf.host_bytes().unwrap().len(), 96);
        assert_eq!(buf.dims().unwrap(), dims);
        assert_eq!(buf.dims().unwrap()[0].stride, 12);
    }

    #[test]
    fn dense_strides_must_fit_i32() {
        let dims = Dimension::dense(&[i32::MAX, 1]).unwrap();
        assert_eq!(dims[0].stride, 1);
        assert!(matches!(
            Dimension::dense(&[2, 65536, 65536]),
            Err(BridgeError::ArgumentMismatch(_))
        ));
        assert!(Dimension::dense(&[]).unwrap().is_empty());
    }

    #[test]
    fn double_destroy_frees_once() {
        let before = live_allocations();
        let dims = Dimension::dense(&[1, 3, 8, 8]).unwrap();
        let mut buf = BufferDescriptor::new(4, &dims, HalideType::u8(), true).unwrap();
        assert_eq!(live_allocations(), before + 2);
        buf.destroy();
        assert_eq!(live_allocations(), before);
        buf.destroy();
        assert_eq!(live_allocations(), before);
        drop(buf);
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn zero_extent_allocates_no_host() {
        let before = live_allocations();
        let dims = Dimension::dense(&[4, 0, 7]).unwrap();
        let buf = BufferDescriptor::new(3, &dims, HalideType::f32(), true).unwrap();
        assert!(buf.host_ptr().unwrap().is_null());
        assert!(!buf.owns_host());
        assert_eq!(buf.byte_size().unwrap(), 0);
        // only the dimension array
        assert_eq!(live_allocations(), before + 1);
    }

    #[test]
    fn dimension_count_mismatch_rejected_first() {
        let before = live_allocations();
        let dims = Dimension::dense(&[2, 2]).unwrap();
        let err = BufferDescriptor::new(3, &dims, HalideType::f32(), true).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentMismatch(_)));

        let negative = [Dimension::new(0, -1, 1)];
        let err = BufferDescriptor::new(1, &negative, HalideType::f32(), true).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentMismatch(_)));
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn caller_owned_host_is_not_freed() {
        let mut storage = vec![7u8; 16];
        let dims = Dimension::dense(&[4]).unwrap();
        let before = live_allocations();
        let mut buf = unsafe {
            BufferDescriptor::with_host(
                1,
                &dims,
                HalideType::i32(),
                NonNull::new(storage.as_mut_ptr()),
                true,
            )
        }
        .unwrap();
        assert!(!buf.owns_host());
        assert_eq!(buf.host_bytes().unwrap(), &[7u8; 16][..]);
        buf.host_bytes_mut().unwrap()[0] = 1;
        buf.destroy();
        assert_eq!(live_allocations(), before);
        assert_eq!(storage[0], 1);
    }

    #[test]
    fn flags_round_trip_every_subset() {
        let dims = Dimension::dense(&[1]).unwrap();
        let mut buf = BufferDescriptor::new(1, &dims, HalideType::f32(), false).unwrap();
        for bits in 0..=BufferFlags::ALL.bits() {
            let flags = BufferFlags::from_bits_truncate(bits);
            buf.set_flags(flags).unwrap();
            assert_eq!(buf.flags().unwrap(), flags);
        }
        assert!((BufferFlags::HOST_DIRTY | BufferFlags::DEVICE_DIRTY).contains(BufferFlags::HOST_DIRTY));
    }

    #[test]
    fn accessors_fail_after_destroy() {
        let dims = Dimension::dense(&[2]).unwrap();
        let mut buf = BufferDescriptor::new(1, &dims, HalideType::f32(), true).unwrap();
        assert_eq!(buf.type_().unwrap(), HalideType::f32());
        buf.destroy();
        assert!(matches!(buf.type_(), Err(BridgeError::InvalidHandle(_))));
        assert!(matches!(
            buf.set_flags(BufferFlags::HOST_DIRTY),
            Err(BridgeError::InvalidHandle(_))
        ));
    }

    #[test]
    fn type_equality_is_structural() {
        assert_eq!(HalideType::f32(), HalideType::new(TypeCode::Float, 32, 1));
        assert_ne!(HalideType::f32(), HalideType::new(TypeCode::Float, 32, 4));
        assert_ne!(HalideType::i32(), HalideType::new(TypeCode::UInt, 32, 1));
        assert_eq!(HalideType::bool().bytes(), 1);
        assert_eq!(HalideType::bfloat16().bytes(), 2);
        assert_eq!(HalideType::f32().to_string(), "f32");
    }
}
