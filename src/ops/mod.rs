//! The opcode kernel table driving the CPU interpreter.
//!
//! Each kernel consumes a full job slice: it loops over `ctx.batch_size`
//! elements, advancing register base pointers by the pre-computed byte
//! strides. Stride zero is how broadcasting happens; the loops never branch
//! on rank. Kernels must not allocate on the dispatch path — per-job
//! temporaries come from `ctx.scratch`.

mod array;
mod math;
mod matrix;
mod memory;
mod system;

use crate::exec::ExecCtx;
use crate::program::{Instruction, OpCode};

/// Signature of every interpreter kernel.
pub type OpFn = fn(&mut ExecCtx, &Instruction);

/// Resolve the kernel for an opcode. Dense dispatch, no allocation.
pub fn kernel(opcode: OpCode) -> OpFn {
    use OpCode::*;
    match opcode {
        Nop => nop,

        Copy | Slice | Reshape => memory::copy,
        Join => memory::join,

        Neg => math::neg,
        Abs => math::abs,
        Sign => math::sign,
        Floor => math::floor,
        Fract => math::fract,
        Saturate => math::saturate,
        Sin => math::sin,
        Cos => math::cos,
        Tan => math::tan,
        Exp => math::exp,
        Log => math::log,
        Sqrt => math::sqrt,
        Rsqrt => math::rsqrt,
        Not => math::not,

        Add => math::add,
        Sub => math::sub,
        Mul => math::mul,
        Div => math::div,
        Mod => math::modulo,
        Min => math::min,
        Max => math::max,
        Pow => math::pow,
        Step => math::step,
        Eq => math::eq,
        Ne => math::ne,
        Lt => math::lt,
        Le => math::le,
        Gt => math::gt,
        Ge => math::ge,
        And => math::and,
        Or => math::or,
        BitAnd => math::bit_and,
        BitOr => math::bit_or,
        BitXor => math::bit_xor,
        Shl => math::shl,
        Shr => math::shr,

        Mix => math::mix,
        Clamp => math::clamp,
        Fma => math::fma,
        SmoothStep => math::smooth_step,

        Dot => math::dot,
        Length => math::length,
        Normalize => math::normalize,

        MatMul => matrix::matmul,
        Transpose => matrix::transpose,
        Inverse => matrix::inverse,

        Gather => array::gather,
        CumSum => array::cumsum,

        Sum => math::sum,
        Size => math::size,

        IndexX => system::index_x,
        IndexY => system::index_y,
        IndexZ => system::index_z,
    }
}

fn nop(_: &mut ExecCtx, _: &Instruction) {}

/// Non-finite results are flushed to zero rather than poisoning a frame.
#[inline(always)]
pub(crate) fn finite(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[inline(always)]
pub(crate) unsafe fn read_f32(ptr: *const u8) -> f32 {
    (ptr as *const f32).read_unaligned()
}

#[inline(always)]
pub(crate) unsafe fn write_f32(ptr: *mut u8, value: f32) {
    (ptr as *mut f32).write_unaligned(value)
}

#[inline(always)]
pub(crate) unsafe fn read_i32(ptr: *const u8) -> i32 {
    (ptr as *const i32).read_unaligned()
}

#[cfg(test)]
pub(crate) mod testing {
    //! A tiny harness that wires registers over plain vectors so kernels can
    //! be exercised without an engine.

    use bumpalo::Bump;

    use crate::buffer::TensorInfo;
    use crate::exec::ExecCtx;

    pub struct Fixture {
        pub scratch: Bump,
    }

    impl Fixture {
        pub fn new() -> Self {
            Fixture {
                scratch: Bump::new(),
            }
        }

        pub fn ctx(&self) -> ExecCtx<'_> {
            ExecCtx::new(&self.scratch)
        }
    }

    /// Point a register at `data` with the given element stride.
    pub fn bind_f32(ctx: &mut ExecCtx, register: u16, data: &mut [f32], info: TensorInfo, stride: i32) {
        let idx = register as usize;
        ctx.reg_ptrs[idx] = data.as_mut_ptr() as *mut u8;
        ctx.reg_strides[idx] = stride * 4;
        ctx.reg_info[idx] = info;
    }
}
