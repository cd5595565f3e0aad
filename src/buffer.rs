//! Defines element types, tensor descriptors and the byte buffers behind them.

/// Maximum tensor rank supported anywhere in the machine.
pub const MAX_DIMS: usize = 8;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    I32 = 1,
    U8 = 2,
}

impl DType {
    /// Size of a single element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Option<DType> {
        Some(match raw {
            0 => DType::F32,
            1 => DType::I32,
            2 => DType::U8,
            _ => return None,
        })
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::F32
    }
}

/// Shape, strides and element type of one register or resource.
///
/// Strides are in element units, row-major when constructed through
/// [`TensorInfo::contiguous`]. A negative extent marks a dimension whose
/// concrete size is only learned when the register is bound to a resource
/// (aliased tensors).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    pub dtype: DType,
    pub ndim: u8,
    pub shape: [i32; MAX_DIMS],
    pub strides: [i32; MAX_DIMS],
}

impl Default for TensorInfo {
    fn default() -> Self {
        TensorInfo {
            dtype: DType::F32,
            ndim: 0,
            shape: [0; MAX_DIMS],
            strides: [0; MAX_DIMS],
        }
    }
}

impl TensorInfo {
    /// A scalar descriptor of the given element type.
    pub fn scalar(dtype: DType) -> Self {
        TensorInfo {
            dtype,
            ..TensorInfo::default()
        }
    }

    /// A row-major contiguous descriptor.
    pub fn contiguous(dtype: DType, shape: &[i32]) -> Self {
        assert!(shape.len() <= MAX_DIMS);
        let mut info = TensorInfo::scalar(dtype);
        info.ndim = shape.len() as u8;
        info.shape[..shape.len()].copy_from_slice(shape);
        info.fill_contiguous_strides();
        info
    }

    /// Recompute row-major strides from the current shape.
    pub fn fill_contiguous_strides(&mut self) {
        let nd = self.ndim as usize;
        let mut acc = 1i32;
        for d in (0..nd).rev() {
            self.strides[d] = acc;
            acc = acc.saturating_mul(self.shape[d].max(1));
        }
        for d in nd..MAX_DIMS {
            self.strides[d] = 0;
        }
    }

    /// Number of elements described. Unknown (negative) extents count as one,
    /// so an aliased descriptor never reports a bogus huge size.
    pub fn element_count(&self) -> usize {
        let mut count = 1usize;
        for d in 0..self.ndim as usize {
            count *= if self.shape[d] > 0 {
                self.shape[d] as usize
            } else {
                1
            };
        }
        count
    }

    /// Total byte size of a contiguous tensor of this shape.
    pub fn size_bytes(&self) -> usize {
        self.element_count() * self.dtype.size()
    }

    /// True when every extent is known, i.e. the tensor can be allocated
    /// before any resource binding happens.
    pub fn is_static(&self) -> bool {
        self.shape[..self.ndim as usize].iter().all(|&d| d >= 0)
    }

    /// True when the strides describe the row-major contiguous layout.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1i32;
        for d in (0..self.ndim as usize).rev() {
            if self.strides[d] != expected {
                return false;
            }
            expected *= self.shape[d].max(1);
        }
        true
    }
}

/// Broadcast inference for a register iterated over a task domain.
///
/// `sub` is the register's element count, `total` the domain's. A register
/// matching the domain walks one element per step, a scalar is pinned in
/// place, and a register that fans out N elements per domain element (vector
/// outputs, matrix batches) advances by that group size. Anything smaller
/// than the domain broadcasts its first element.
pub fn linear_stride(sub: usize, total: usize) -> i32 {
    if sub == total {
        1
    } else if sub <= 1 {
        0
    } else if total > 0 && sub > total && sub % total == 0 {
        (sub / total) as i32
    } else {
        0
    }
}

/// A contiguous, owned byte allocation.
///
/// Storage is backed by `u32` words so that `f32`/`i32` element views are
/// always well aligned; `len` is the exact byte size requested. Views handed
/// to clients borrow from here and can never outlive the buffer.
pub struct Buffer {
    words: Vec<u32>,
    len: usize,
}

impl Buffer {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Buffer {
        Buffer {
            words: vec![0u32; (len + 3) / 4],
            len,
        }
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Buffer {
        let mut buffer = Buffer::zeroed(bytes.len());
        buffer.as_bytes_mut().copy_from_slice(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    /// Base pointer for the interpreter's strided walks.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Buffer({} bytes)", self.len)
    }
}
