//! The per-job execution context handed to every kernel.

use std::sync::atomic::{AtomicI32, Ordering};

use bumpalo::Bump;

use crate::buffer::{TensorInfo, MAX_DIMS};
use crate::program::MAX_REGISTERS;

/// Runtime error kinds shared through the atomic kill switch.
///
/// The discriminants are the wire values stored into the engine's global
/// error word, so they must stay stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecError {
    None = 0,
    Oom = 1,
    ShapeMismatch = 2,
    InvalidOp = 3,
    OutOfBounds = 4,
    Runtime = 5,
}

impl ExecError {
    pub fn from_code(code: i32) -> ExecError {
        match code {
            0 => ExecError::None,
            1 => ExecError::Oom,
            2 => ExecError::ShapeMismatch,
            3 => ExecError::InvalidOp,
            4 => ExecError::OutOfBounds,
            _ => ExecError::Runtime,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExecError::None => "NONE",
            ExecError::Oom => "OUT_OF_MEMORY",
            ExecError::ShapeMismatch => "SHAPE_MISMATCH",
            ExecError::InvalidOp => "INVALID_OP",
            ExecError::OutOfBounds => "OUT_OF_BOUNDS",
            ExecError::Runtime => "RUNTIME",
        }
    }
}

/// Everything a kernel needs to process one job slice of a task.
///
/// Register pointers are base addresses for *this* slice: the job's linear
/// offset has already been folded in. Strides are per-element byte steps,
/// zero for broadcast registers.
pub struct ExecCtx<'job> {
    pub reg_ptrs: [*mut u8; MAX_REGISTERS],
    pub reg_strides: [i32; MAX_REGISTERS],
    pub reg_info: [TensorInfo; MAX_REGISTERS],

    /// Element count this job handles.
    pub batch_size: u32,
    /// Starting element index within the task domain.
    pub linear_offset: u32,
    /// Rank of the task domain.
    pub ndim: u8,
    pub domain_shape: [u32; MAX_DIMS],
    /// Starting coordinate along each domain axis.
    pub tile_offset: [u32; MAX_DIMS],

    /// 0 or 1 for two-pass scan tasks, -1 otherwise.
    pub sync_pass: i32,
    /// Shared chunk-total slots for the two-pass scan; one per job.
    pub sync_data: *mut f32,
    /// True while registers are redirected into per-thread reduction scratch.
    pub reduction_pass: bool,

    pub job_idx: u32,
    pub error: ExecError,
    /// Batch element at which `error` was raised.
    pub error_idx: u32,

    /// Engine-wide kill switch, checked between instructions.
    pub global_error: Option<&'job AtomicI32>,
    /// Per-worker bump allocator, reset before the job started.
    pub scratch: &'job Bump,
}

impl<'job> ExecCtx<'job> {
    pub fn new(scratch: &'job Bump) -> Self {
        ExecCtx {
            reg_ptrs: [core::ptr::null_mut(); MAX_REGISTERS],
            reg_strides: [0; MAX_REGISTERS],
            reg_info: [TensorInfo::default(); MAX_REGISTERS],
            batch_size: 0,
            linear_offset: 0,
            ndim: 0,
            domain_shape: [0; MAX_DIMS],
            tile_offset: [0; MAX_DIMS],
            sync_pass: -1,
            sync_data: core::ptr::null_mut(),
            reduction_pass: false,
            job_idx: 0,
            error: ExecError::None,
            error_idx: 0,
            global_error: None,
            scratch,
        }
    }

    #[inline]
    pub fn ptr(&self, register: u16) -> *mut u8 {
        self.reg_ptrs[register as usize]
    }

    #[inline]
    pub fn stride(&self, register: u16) -> isize {
        self.reg_strides[register as usize] as isize
    }

    #[inline]
    pub fn info(&self, register: u16) -> &TensorInfo {
        &self.reg_info[register as usize]
    }

    /// True when the engine-wide kill switch has been pulled.
    #[inline]
    pub fn global_error_set(&self) -> bool {
        match self.global_error {
            Some(flag) => flag.load(Ordering::Acquire) != 0,
            None => false,
        }
    }

    /// Whether a newly detected error should be recorded and logged.
    ///
    /// Errors are deduplicated: once this job or any other worker has failed,
    /// further failures in the same job stay silent.
    #[inline]
    pub fn should_report(&self) -> bool {
        self.error == ExecError::None && !self.global_error_set()
    }

    /// Record an error for the element at `batch_idx`, if first.
    pub fn fail(&mut self, error: ExecError, batch_idx: u32) {
        if self.error == ExecError::None {
            self.error = error;
            self.error_idx = batch_idx;
        }
    }

    /// Domain coordinates of the element where the current error was raised.
    pub fn error_coords(&self) -> [u32; MAX_DIMS] {
        let mut coords = [0u32; MAX_DIMS];
        let mut linear = (self.linear_offset + self.error_idx) as usize;
        for d in (0..self.ndim as usize).rev() {
            let extent = self.domain_shape[d].max(1) as usize;
            coords[d] = (linear % extent) as u32;
            linear /= extent;
        }
        coords
    }
}
