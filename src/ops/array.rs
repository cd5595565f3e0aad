//! Array kernels: prefix scan and random-access gather.

use super::{read_f32, read_i32, write_f32};
use crate::buffer::DType;
use crate::exec::{ExecCtx, ExecError};
use crate::program::Instruction;

/// Prefix sum over the task domain.
///
/// Under a two-pass strategy, pass 0 scans each job slice locally and posts
/// the chunk total to the shared sync slot; pass 1 folds the exclusive
/// prefix of earlier chunks into the slice. Without a sync buffer the whole
/// slice is scanned serially.
pub(crate) fn cumsum(ctx: &mut ExecCtx, inst: &Instruction) {
    let count = ctx.batch_size as usize;
    let step_d = ctx.stride(inst.dest);
    let step_s = ctx.stride(inst.src[0]);
    let mut d = ctx.ptr(inst.dest);
    let mut s = ctx.ptr(inst.src[0]);

    if !ctx.sync_data.is_null() && ctx.sync_pass == 0 {
        let mut total = 0.0f32;
        for _ in 0..count {
            unsafe {
                total += read_f32(s);
                write_f32(d, total);
                s = s.offset(step_s);
                d = d.offset(step_d);
            }
        }
        unsafe {
            *ctx.sync_data.add(ctx.job_idx as usize) = total;
        }
    } else if !ctx.sync_data.is_null() && ctx.sync_pass == 1 {
        let offset = unsafe { *ctx.sync_data.add(ctx.job_idx as usize) };
        if offset == 0.0 {
            return;
        }
        for _ in 0..count {
            unsafe {
                write_f32(d, read_f32(d) + offset);
                d = d.offset(step_d);
            }
        }
    } else {
        let mut total = 0.0f32;
        for _ in 0..count {
            unsafe {
                total += read_f32(s);
                write_f32(d, total);
                s = s.offset(step_s);
                d = d.offset(step_d);
            }
        }
    }
}

/// For each batch element, read an index from src2 and fetch that element of
/// src1. Contiguous sources are flat lookups; otherwise the index is
/// decomposed over the source strides. Out-of-bounds indices zero-fill the
/// destination and raise `OutOfBounds` for the first offender.
pub(crate) fn gather(ctx: &mut ExecCtx, inst: &Instruction) {
    let data_info = *ctx.info(inst.src[0]);
    let index_dtype = ctx.info(inst.src[1]).dtype;
    let data_count = data_info.element_count();
    let elem = data_info.dtype.size();
    let contiguous = data_info.is_contiguous();

    let count = ctx.batch_size as usize;
    let step_d = ctx.stride(inst.dest);
    let step_i = ctx.stride(inst.src[1]);
    let data = ctx.ptr(inst.src[0]);
    let mut index_ptr = ctx.ptr(inst.src[1]);
    let mut d = ctx.ptr(inst.dest);

    let mut failed_at: Option<(u32, i64)> = None;

    for batch_idx in 0..count {
        let index = unsafe {
            match index_dtype {
                DType::F32 => read_f32(index_ptr) as i64,
                _ => read_i32(index_ptr) as i64,
            }
        };

        if index >= 0 && (index as usize) < data_count {
            let offset = if contiguous {
                index as usize * elem
            } else {
                let mut rest = index as usize;
                let mut elems = 0usize;
                for dim in (0..data_info.ndim as usize).rev() {
                    let extent = data_info.shape[dim].max(1) as usize;
                    elems += (rest % extent) * data_info.strides[dim] as usize;
                    rest /= extent;
                }
                elems * elem
            };
            unsafe {
                core::ptr::copy_nonoverlapping(data.add(offset), d, elem);
            }
        } else {
            unsafe {
                core::ptr::write_bytes(d, 0, elem);
            }
            if failed_at.is_none() {
                failed_at = Some((batch_idx as u32, index));
            }
        }

        unsafe {
            d = d.offset(step_d);
            index_ptr = index_ptr.offset(step_i);
        }
    }

    if let Some((batch_idx, index)) = failed_at {
        if ctx.should_report() {
            log::error!(
                "gather index {} out of bounds at batch element {} (data size {}), using 0",
                index,
                batch_idx,
                data_count,
            );
        }
        ctx.fail(ExecError::OutOfBounds, batch_idx);
    }
}
