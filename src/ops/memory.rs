//! Memory motion kernels: strided element copies and component interleave.

use super::read_f32;
use crate::exec::ExecCtx;
use crate::program::Instruction;

/// COPY, SLICE and RESHAPE all reduce to the same strided per-element copy;
/// the descriptors already encode where the bytes come from and go to.
pub(crate) fn copy(ctx: &mut ExecCtx, inst: &Instruction) {
    let count = ctx.batch_size as usize;
    let elem = ctx.info(inst.src[0]).dtype.size();
    let step_d = ctx.stride(inst.dest);
    let step_s = ctx.stride(inst.src[0]);
    let mut d = ctx.ptr(inst.dest);
    let mut s = ctx.ptr(inst.src[0]);

    for _ in 0..count {
        unsafe {
            core::ptr::copy_nonoverlapping(s, d, elem);
            s = s.offset(step_s);
            d = d.offset(step_d);
        }
    }
}

/// Interleave two to four scalar streams into an N-vector destination. The
/// component count comes from the destination's last axis.
pub(crate) fn join(ctx: &mut ExecCtx, inst: &Instruction) {
    let dst_info = ctx.info(inst.dest);
    let components = if dst_info.ndim == 0 {
        1
    } else {
        dst_info.shape[dst_info.ndim as usize - 1].max(1) as usize
    };
    let count = ctx.batch_size as usize;

    let step_d = ctx.stride(inst.dest);
    let step_x = ctx.stride(inst.src[0]);
    let step_y = ctx.stride(inst.src[1]);
    let step_z = ctx.stride(inst.src[2]);
    let step_w = ctx.stride(inst.src[3]);

    let mut d = ctx.ptr(inst.dest);
    let mut x = ctx.ptr(inst.src[0]);
    let mut y = ctx.ptr(inst.src[1]);
    let mut z = if components >= 3 {
        ctx.ptr(inst.src[2])
    } else {
        core::ptr::null_mut()
    };
    let mut w = if components >= 4 {
        ctx.ptr(inst.src[3])
    } else {
        core::ptr::null_mut()
    };

    for _ in 0..count {
        unsafe {
            let out = d as *mut f32;
            out.write_unaligned(read_f32(x));
            out.offset(1).write_unaligned(read_f32(y));
            if !z.is_null() {
                out.offset(2).write_unaligned(read_f32(z));
            }
            if !w.is_null() {
                out.offset(3).write_unaligned(read_f32(w));
            }

            x = x.offset(step_x);
            y = y.offset(step_y);
            if !z.is_null() {
                z = z.offset(step_z);
            }
            if !w.is_null() {
                w = w.offset(step_w);
            }
            d = d.offset(step_d);
        }
    }
}
