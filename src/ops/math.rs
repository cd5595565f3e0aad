//! Pointwise and fan-in math kernels.
//!
//! The pointwise family is generated: every kernel is the same strided sweep
//! around a scalar expression, with non-finite results flushed to zero.

use super::{finite, read_f32, write_f32};
use crate::exec::ExecCtx;
use crate::program::Instruction;

macro_rules! pointwise {
    ($fname:ident, |$a:ident| $expr:expr) => {
        pub(crate) fn $fname(ctx: &mut ExecCtx, inst: &Instruction) {
            let count = ctx.batch_size as usize;
            let step_d = ctx.stride(inst.dest);
            let step_a = ctx.stride(inst.src[0]);
            let mut d = ctx.ptr(inst.dest);
            let mut a = ctx.ptr(inst.src[0]);
            for _ in 0..count {
                unsafe {
                    let $a = read_f32(a);
                    write_f32(d, finite($expr));
                    a = a.offset(step_a);
                    d = d.offset(step_d);
                }
            }
        }
    };
    ($fname:ident, |$a:ident, $b:ident| $expr:expr) => {
        pub(crate) fn $fname(ctx: &mut ExecCtx, inst: &Instruction) {
            let count = ctx.batch_size as usize;
            let step_d = ctx.stride(inst.dest);
            let step_a = ctx.stride(inst.src[0]);
            let step_b = ctx.stride(inst.src[1]);
            let mut d = ctx.ptr(inst.dest);
            let mut a = ctx.ptr(inst.src[0]);
            let mut b = ctx.ptr(inst.src[1]);
            for _ in 0..count {
                unsafe {
                    let $a = read_f32(a);
                    let $b = read_f32(b);
                    write_f32(d, finite($expr));
                    a = a.offset(step_a);
                    b = b.offset(step_b);
                    d = d.offset(step_d);
                }
            }
        }
    };
    ($fname:ident, |$a:ident, $b:ident, $c:ident| $expr:expr) => {
        pub(crate) fn $fname(ctx: &mut ExecCtx, inst: &Instruction) {
            let count = ctx.batch_size as usize;
            let step_d = ctx.stride(inst.dest);
            let step_a = ctx.stride(inst.src[0]);
            let step_b = ctx.stride(inst.src[1]);
            let step_c = ctx.stride(inst.src[2]);
            let mut d = ctx.ptr(inst.dest);
            let mut a = ctx.ptr(inst.src[0]);
            let mut b = ctx.ptr(inst.src[1]);
            let mut c = ctx.ptr(inst.src[2]);
            for _ in 0..count {
                unsafe {
                    let $a = read_f32(a);
                    let $b = read_f32(b);
                    let $c = read_f32(c);
                    write_f32(d, finite($expr));
                    a = a.offset(step_a);
                    b = b.offset(step_b);
                    c = c.offset(step_c);
                    d = d.offset(step_d);
                }
            }
        }
    };
}

pointwise!(neg, |a| -a);
pointwise!(abs, |a| a.abs());
pointwise!(sign, |a| if a > 0.0 {
    1.0
} else if a < 0.0 {
    -1.0
} else {
    0.0
});
pointwise!(floor, |a| a.floor());
pointwise!(fract, |a| a - a.floor());
pointwise!(saturate, |a| a.max(0.0).min(1.0));
pointwise!(sin, |a| a.sin());
pointwise!(cos, |a| a.cos());
pointwise!(tan, |a| a.tan());
pointwise!(exp, |a| a.exp());
pointwise!(log, |a| a.ln());
pointwise!(sqrt, |a| a.sqrt());
pointwise!(rsqrt, |a| 1.0 / a.sqrt());
pointwise!(not, |a| if a == 0.0 { 1.0 } else { 0.0 });

pointwise!(add, |a, b| a + b);
pointwise!(sub, |a, b| a - b);
pointwise!(mul, |a, b| a * b);
pointwise!(div, |a, b| a / b);
pointwise!(modulo, |a, b| a - b * (a / b).floor());
pointwise!(min, |a, b| a.min(b));
pointwise!(max, |a, b| a.max(b));
pointwise!(pow, |a, b| a.powf(b));
pointwise!(step, |a, b| if b < a { 0.0 } else { 1.0 });
pointwise!(eq, |a, b| if a == b { 1.0 } else { 0.0 });
pointwise!(ne, |a, b| if a != b { 1.0 } else { 0.0 });
pointwise!(lt, |a, b| if a < b { 1.0 } else { 0.0 });
pointwise!(le, |a, b| if a <= b { 1.0 } else { 0.0 });
pointwise!(gt, |a, b| if a > b { 1.0 } else { 0.0 });
pointwise!(ge, |a, b| if a >= b { 1.0 } else { 0.0 });
pointwise!(and, |a, b| if a != 0.0 && b != 0.0 { 1.0 } else { 0.0 });
pointwise!(or, |a, b| if a != 0.0 || b != 0.0 { 1.0 } else { 0.0 });
pointwise!(bit_and, |a, b| ((a as i32) & (b as i32)) as f32);
pointwise!(bit_or, |a, b| ((a as i32) | (b as i32)) as f32);
pointwise!(bit_xor, |a, b| ((a as i32) ^ (b as i32)) as f32);
pointwise!(shl, |a, b| ((a as i32) << ((b as i32) & 31)) as f32);
pointwise!(shr, |a, b| ((a as i32) >> ((b as i32) & 31)) as f32);

pointwise!(mix, |a, b, t| a + (b - a) * t);
pointwise!(clamp, |x, lo, hi| x.max(lo).min(hi));
pointwise!(fma, |a, b, c| a.mul_add(b, c));

/// Hermite interpolation between an edge pair. The edges live in a single
/// two-element register (src1); division by a degenerate span is clamped.
pub(crate) fn smooth_step(ctx: &mut ExecCtx, inst: &Instruction) {
    let count = ctx.batch_size as usize;
    let step_d = ctx.stride(inst.dest);
    let step_e = ctx.stride(inst.src[0]);
    let step_x = ctx.stride(inst.src[1]);
    let mut d = ctx.ptr(inst.dest);
    let mut e = ctx.ptr(inst.src[0]);
    let mut x = ctx.ptr(inst.src[1]);

    for _ in 0..count {
        unsafe {
            let e0 = read_f32(e);
            let e1 = read_f32(e.offset(4));
            let value = read_f32(x);

            let mut span = e1 - e0;
            if span.abs() < 1e-6 {
                span = if span < 0.0 { -1e-6 } else { 1e-6 };
            }

            let t = ((value - e0) / span).max(0.0).min(1.0);
            write_f32(d, finite(t * t * (3.0 - 2.0 * t)));

            e = e.offset(step_e);
            x = x.offset(step_x);
            d = d.offset(step_d);
        }
    }
}

#[inline]
unsafe fn dot_impl(a: *const u8, b: *const u8, len: usize) -> f32 {
    let mut sum = 0.0f32;
    for lane in 0..len {
        sum += read_f32(a.add(lane * 4)) * read_f32(b.add(lane * 4));
    }
    sum
}

#[inline]
unsafe fn length_sq_impl(a: *const u8, len: usize) -> f32 {
    let mut sum = 0.0f32;
    for lane in 0..len {
        let value = read_f32(a.add(lane * 4));
        sum += value * value;
    }
    sum
}

fn last_axis(ctx: &ExecCtx, register: u16) -> usize {
    let info = ctx.info(register);
    if info.ndim == 0 {
        1
    } else {
        info.shape[info.ndim as usize - 1].max(1) as usize
    }
}

pub(crate) fn dot(ctx: &mut ExecCtx, inst: &Instruction) {
    let lanes = last_axis(ctx, inst.src[0]);
    let count = ctx.batch_size as usize;
    let step_d = ctx.stride(inst.dest);
    let step_a = ctx.stride(inst.src[0]);
    let step_b = ctx.stride(inst.src[1]);
    let mut d = ctx.ptr(inst.dest);
    let mut a = ctx.ptr(inst.src[0]);
    let mut b = ctx.ptr(inst.src[1]);

    for _ in 0..count {
        unsafe {
            write_f32(d, finite(dot_impl(a, b, lanes)));
            a = a.offset(step_a);
            b = b.offset(step_b);
            d = d.offset(step_d);
        }
    }
}

pub(crate) fn length(ctx: &mut ExecCtx, inst: &Instruction) {
    let lanes = last_axis(ctx, inst.src[0]);
    let count = ctx.batch_size as usize;
    let step_d = ctx.stride(inst.dest);
    let step_a = ctx.stride(inst.src[0]);
    let mut d = ctx.ptr(inst.dest);
    let mut a = ctx.ptr(inst.src[0]);

    for _ in 0..count {
        unsafe {
            write_f32(d, finite(length_sq_impl(a, lanes).sqrt()));
            a = a.offset(step_a);
            d = d.offset(step_d);
        }
    }
}

pub(crate) fn normalize(ctx: &mut ExecCtx, inst: &Instruction) {
    let lanes = last_axis(ctx, inst.src[0]);
    let count = ctx.batch_size as usize;
    let step_d = ctx.stride(inst.dest);
    let step_a = ctx.stride(inst.src[0]);
    let mut d = ctx.ptr(inst.dest);
    let mut a = ctx.ptr(inst.src[0]);

    for _ in 0..count {
        unsafe {
            let len = length_sq_impl(a, lanes).sqrt();
            let inv = if len > 1e-6 { 1.0 / len } else { 0.0 };
            for lane in 0..lanes {
                let value = read_f32(a.add(lane * 4));
                write_f32(d.add(lane * 4), value * inv);
            }
            a = a.offset(step_a);
            d = d.offset(step_d);
        }
    }
}

/// Fan-in sum of the source slice.
///
/// Under a reduction strategy the destination points into the per-thread
/// scratch slot, which is zeroed before dispatch; accumulating (instead of
/// overwriting) keeps multiple jobs on one thread correct. Outside a
/// reduction pass the destination is written directly.
pub(crate) fn sum(ctx: &mut ExecCtx, inst: &Instruction) {
    let count = ctx.batch_size as usize;
    let step_a = ctx.stride(inst.src[0]);
    let mut a = ctx.ptr(inst.src[0]);

    let mut total = 0.0f32;
    for _ in 0..count {
        unsafe {
            total += read_f32(a);
            a = a.offset(step_a);
        }
    }

    let d = ctx.ptr(inst.dest);
    unsafe {
        if ctx.reduction_pass {
            write_f32(d, read_f32(d) + total);
        } else {
            write_f32(d, total);
        }
    }
}

/// Element count of the source register, as an F32 scalar.
pub(crate) fn size(ctx: &mut ExecCtx, inst: &Instruction) {
    let count = ctx.info(inst.src[0]).element_count();
    let d = ctx.ptr(inst.dest);
    unsafe {
        write_f32(d, count as f32);
    }
}
