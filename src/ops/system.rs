//! System kernels: domain coordinate generation.

use crate::buffer::{DType, MAX_DIMS};
use crate::exec::ExecCtx;
use crate::program::Instruction;

/// Fill the destination with the coordinate along `axis` for every element
/// of the job slice. Coordinates are recovered from the job's linear offset
/// and then walked by incrementing the innermost axis with carry.
fn generate_axis(ctx: &mut ExecCtx, inst: &Instruction, axis: usize) {
    let register = inst.dest;
    let dtype = ctx.info(register).dtype;
    let out = ctx.ptr(register);
    let count = ctx.batch_size as usize;
    let ndim = ctx.ndim as usize;

    let mut coords = [0u32; MAX_DIMS];
    let mut rest = ctx.linear_offset as usize;
    for d in (0..ndim).rev() {
        let extent = ctx.domain_shape[d].max(1) as usize;
        coords[d] = (rest % extent) as u32;
        rest /= extent;
    }

    for element in 0..count {
        let value = if axis < ndim { coords[axis] } else { 0 };
        unsafe {
            match dtype {
                DType::I32 => {
                    (out as *mut i32).add(element).write_unaligned(value as i32)
                }
                _ => (out as *mut f32).add(element).write_unaligned(value as f32),
            }
        }

        for d in (0..ndim).rev() {
            coords[d] += 1;
            if coords[d] < ctx.domain_shape[d] || d == 0 {
                break;
            }
            coords[d] = 0;
        }
    }
}

pub(crate) fn index_x(ctx: &mut ExecCtx, inst: &Instruction) {
    generate_axis(ctx, inst, 0);
}

pub(crate) fn index_y(ctx: &mut ExecCtx, inst: &Instruction) {
    generate_axis(ctx, inst, 1);
}

pub(crate) fn index_z(ctx: &mut ExecCtx, inst: &Instruction) {
    generate_axis(ctx, inst, 2);
}
