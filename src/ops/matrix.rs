//! Matrix kernels: batched multiply, analytic small inverses, transpose.

use super::{read_f32, write_f32};
use crate::exec::ExecCtx;
use crate::program::Instruction;

/// Batched row-major matrix multiply: `[.., M, K] · [.., K, N] -> [.., M, N]`.
/// The batch axis is the task domain; inner strides come from the operand
/// descriptors so permuted (transposed) views multiply without a copy.
pub(crate) fn matmul(ctx: &mut ExecCtx, inst: &Instruction) {
    let a_info = *ctx.info(inst.src[0]);
    let b_info = *ctx.info(inst.src[1]);
    let d_info = *ctx.info(inst.dest);
    if a_info.ndim < 2 || b_info.ndim < 2 || d_info.ndim < 2 {
        return;
    }

    let rows = a_info.shape[a_info.ndim as usize - 2];
    let inner = a_info.shape[a_info.ndim as usize - 1];
    let cols = b_info.shape[b_info.ndim as usize - 1];

    let stride_ra = a_info.strides[a_info.ndim as usize - 2] as isize;
    let stride_ka = a_info.strides[a_info.ndim as usize - 1] as isize;
    let stride_kb = b_info.strides[b_info.ndim as usize - 2] as isize;
    let stride_cb = b_info.strides[b_info.ndim as usize - 1] as isize;
    let stride_rd = d_info.strides[d_info.ndim as usize - 2] as isize;
    let stride_cd = d_info.strides[d_info.ndim as usize - 1] as isize;

    let batch = ctx.batch_size as usize;
    let step_a = ctx.stride(inst.src[0]);
    let step_b = ctx.stride(inst.src[1]);
    let step_d = ctx.stride(inst.dest);
    let base_a = ctx.ptr(inst.src[0]);
    let base_b = ctx.ptr(inst.src[1]);
    let base_d = ctx.ptr(inst.dest);

    for b_idx in 0..batch {
        unsafe {
            let mat_a = base_a.offset(b_idx as isize * step_a);
            let mat_b = base_b.offset(b_idx as isize * step_b);
            let mat_d = base_d.offset(b_idx as isize * step_d);

            for r in 0..rows as isize {
                for c in 0..cols as isize {
                    let mut acc = 0.0f32;
                    let mut pa = mat_a.offset(r * stride_ra * 4);
                    let mut pb = mat_b.offset(c * stride_cb * 4);
                    for _ in 0..inner {
                        acc += read_f32(pa) * read_f32(pb);
                        pa = pa.offset(stride_ka * 4);
                        pb = pb.offset(stride_kb * 4);
                    }
                    write_f32(mat_d.offset((r * stride_rd + c * stride_cd) * 4), acc);
                }
            }
        }
    }
}

/// Transpose is metadata-only: the compiler emits the destination descriptor
/// with permuted strides, so there is nothing to move at execution time.
pub(crate) fn transpose(_: &mut ExecCtx, _: &Instruction) {}

/// Analytic inverse for 3x3 and 4x4 matrices. Any other operand shape falls
/// back to a strided element copy, which keeps mixed-radix sources readable
/// in dumps without pretending to invert them.
pub(crate) fn inverse(ctx: &mut ExecCtx, inst: &Instruction) {
    let info = *ctx.info(inst.src[0]);
    let total = info.element_count();
    let src = ctx.ptr(inst.src[0]);
    let dst = ctx.ptr(inst.dest);

    let dim = (total as f32).sqrt() as usize;
    if (dim == 3 && total == 9) || (dim == 4 && total == 16) {
        let s0 = info.strides[0] as usize;
        let s1 = info.strides[1] as usize;

        unsafe {
            if dim == 3 {
                let mut m = [0.0f32; 9];
                for r in 0..3 {
                    for c in 0..3 {
                        m[r * 3 + c] = read_f32(src.add((r * s0 + c * s1) * 4));
                    }
                }
                let inv = mat3_inverse(&m);
                for (idx, value) in inv.iter().enumerate() {
                    write_f32(dst.add(idx * 4), *value);
                }
            } else {
                let mut m = [0.0f32; 16];
                for r in 0..4 {
                    for c in 0..4 {
                        m[r * 4 + c] = read_f32(src.add((r * s0 + c * s1) * 4));
                    }
                }
                let inv = mat4_inverse(&m);
                for (idx, value) in inv.iter().enumerate() {
                    write_f32(dst.add(idx * 4), *value);
                }
            }
        }
    } else {
        // Strided gather into a contiguous destination.
        for linear in 0..total {
            let mut offset = 0usize;
            let mut rest = linear;
            for d in (0..info.ndim as usize).rev() {
                let extent = info.shape[d].max(1) as usize;
                offset += (rest % extent) * info.strides[d] as usize;
                rest /= extent;
            }
            unsafe {
                write_f32(dst.add(linear * 4), read_f32(src.add(offset * 4)));
            }
        }
    }
}

fn mat3_inverse(m: &[f32; 9]) -> [f32; 9] {
    let c00 = m[4] * m[8] - m[5] * m[7];
    let c01 = m[5] * m[6] - m[3] * m[8];
    let c02 = m[3] * m[7] - m[4] * m[6];

    let det = m[0] * c00 + m[1] * c01 + m[2] * c02;
    if det.abs() < 1e-12 {
        return [0.0; 9];
    }
    let inv_det = 1.0 / det;

    [
        c00 * inv_det,
        (m[2] * m[7] - m[1] * m[8]) * inv_det,
        (m[1] * m[5] - m[2] * m[4]) * inv_det,
        c01 * inv_det,
        (m[0] * m[8] - m[2] * m[6]) * inv_det,
        (m[2] * m[3] - m[0] * m[5]) * inv_det,
        c02 * inv_det,
        (m[1] * m[6] - m[0] * m[7]) * inv_det,
        (m[0] * m[4] - m[1] * m[3]) * inv_det,
    ]
}

fn mat4_inverse(m: &[f32; 16]) -> [f32; 16] {
    // Cofactor expansion over 2x2 sub-determinants of the lower half.
    let s0 = m[0] * m[5] - m[1] * m[4];
    let s1 = m[0] * m[6] - m[2] * m[4];
    let s2 = m[0] * m[7] - m[3] * m[4];
    let s3 = m[1] * m[6] - m[2] * m[5];
    let s4 = m[1] * m[7] - m[3] * m[5];
    let s5 = m[2] * m[7] - m[3] * m[6];

    let c5 = m[10] * m[15] - m[11] * m[14];
    let c4 = m[9] * m[15] - m[11] * m[13];
    let c3 = m[9] * m[14] - m[10] * m[13];
    let c2 = m[8] * m[15] - m[11] * m[12];
    let c1 = m[8] * m[14] - m[10] * m[12];
    let c0 = m[8] * m[13] - m[9] * m[12];

    let det = s0 * c5 - s1 * c4 + s2 * c3 + s3 * c2 - s4 * c1 + s5 * c0;
    if det.abs() < 1e-12 {
        return [0.0; 16];
    }
    let inv_det = 1.0 / det;

    [
        (m[5] * c5 - m[6] * c4 + m[7] * c3) * inv_det,
        (-m[1] * c5 + m[2] * c4 - m[3] * c3) * inv_det,
        (m[13] * s5 - m[14] * s4 + m[15] * s3) * inv_det,
        (-m[9] * s5 + m[10] * s4 - m[11] * s3) * inv_det,
        (-m[4] * c5 + m[6] * c2 - m[7] * c1) * inv_det,
        (m[0] * c5 - m[2] * c2 + m[3] * c1) * inv_det,
        (-m[12] * s5 + m[14] * s2 - m[15] * s1) * inv_det,
        (m[8] * s5 - m[10] * s2 + m[11] * s1) * inv_det,
        (m[4] * c4 - m[5] * c2 + m[7] * c0) * inv_det,
        (-m[0] * c4 + m[1] * c2 - m[3] * c0) * inv_det,
        (m[12] * s4 - m[13] * s2 + m[15] * s0) * inv_det,
        (-m[8] * s4 + m[9] * s2 - m[11] * s0) * inv_det,
        (-m[4] * c3 + m[5] * c1 - m[6] * c0) * inv_det,
        (m[0] * c3 - m[1] * c1 + m[2] * c0) * inv_det,
        (-m[12] * s3 + m[13] * s1 - m[14] * s0) * inv_det,
        (m[8] * s3 - m[9] * s1 + m[10] * s0) * inv_det,
    ]
}

#[cfg(test)]
mod tests {
    use super::super::testing::{bind_f32, Fixture};
    use super::*;
    use crate::buffer::{DType, TensorInfo};
    use crate::program::{Instruction, OpCode};

    #[test]
    fn batched_matmul_row_major() {
        let fix = Fixture::new();
        let mut ctx = fix.ctx();
        // Batch of two 2x3 by 3x2 products.
        let mut a = vec![
            1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, // batch 0
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, // batch 1
        ];
        let mut b = vec![
            7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0, // batch 0
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, // batch 1
        ];
        let mut d = vec![0.0f32; 8];
        bind_f32(&mut ctx, 0, &mut a, TensorInfo::contiguous(DType::F32, &[2, 2, 3]), 6);
        bind_f32(&mut ctx, 1, &mut b, TensorInfo::contiguous(DType::F32, &[2, 3, 2]), 6);
        bind_f32(&mut ctx, 2, &mut d, TensorInfo::contiguous(DType::F32, &[2, 2, 2]), 4);
        ctx.batch_size = 2;

        let inst = Instruction::binary(OpCode::MatMul, 2, 0, 1);
        matmul(&mut ctx, &inst);
        assert_eq!(&d[..4], &[58.0, 64.0, 139.0, 154.0]);
        assert_eq!(&d[4..], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn mat3_inverse_recovers_identity() {
        let m = [2.0f32, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 8.0];
        let inv = mat3_inverse(&m);
        assert_eq!(inv[0], 0.5);
        assert_eq!(inv[4], 0.25);
        assert_eq!(inv[8], 0.125);
    }

    #[test]
    fn mat4_inverse_of_translation() {
        #[rustfmt::skip]
        let m = [
            1.0f32, 0.0, 0.0, 5.0,
            0.0, 1.0, 0.0, -3.0,
            0.0, 0.0, 1.0, 2.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let inv = mat4_inverse(&m);
        assert!((inv[3] + 5.0).abs() < 1e-6);
        assert!((inv[7] - 3.0).abs() < 1e-6);
        assert!((inv[11] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn singular_matrix_inverts_to_zero() {
        let inv = mat3_inverse(&[1.0; 9]);
        assert_eq!(inv, [0.0; 9]);
    }
}
