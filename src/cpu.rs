//! The CPU backend: per-program bake, strategy dispatch and crash dumps.
//!
//! A task is decomposed into jobs of `JOB_SIZE` domain elements. Small
//! domains run inline on the dispatching thread with a private scratch
//! arena; everything else goes through the worker pool. The only
//! synchronization is the pool barrier at the end of each pass.

use std::sync::atomic::{AtomicI32, Ordering};

use bumpalo::Bump;

use crate::buffer::{linear_stride, Buffer, TensorInfo, MAX_DIMS};
use crate::exec::{ExecCtx, ExecError};
use crate::ops;
use crate::program::{Program, Strategy, Task, TensorFlags};
use crate::workers::{WorkerPool, WorkerScratch};

/// Domain elements per job.
pub const JOB_SIZE: usize = 4096;
/// Domains at or below this run on the calling thread, skipping the pool.
pub const INLINE_THRESHOLD: usize = 1024;
/// Scratch capacity of the inline (caller-thread) arena.
pub const INLINE_SCRATCH_BYTES: usize = 4 * 1024 * 1024;

/// Where a register's bytes currently live.
///
/// Views are refreshed by the engine on every frame (blackboard bindings)
/// or once at state creation (constants and static temporaries). A null
/// view means the register has no backing yet; touching it at execution
/// time is a runtime error, not a crash.
#[derive(Clone, Copy)]
pub struct RegisterView {
    pub data: *mut u8,
    pub len: usize,
    pub byte_offset: usize,
    pub info: TensorInfo,
}

impl RegisterView {
    pub fn unbound(info: TensorInfo) -> Self {
        RegisterView {
            data: core::ptr::null_mut(),
            len: 0,
            byte_offset: 0,
            info,
        }
    }
}

/// Scratch buffers baked once per program after binding.
pub struct BakedKernel {
    /// `num_threads × per_thread` F32 slots, indexed `tid * per_thread + reg`.
    reduction_scratch: Vec<f32>,
    reduction_per_thread: usize,
    /// One F32 chunk-total slot per expected scan job.
    sync_scratch: Vec<f32>,
}

/// Runtime register table of one kernel instance.
pub struct KernelState {
    pub registers: Vec<RegisterView>,
    /// Owns constant and static temporary storage; the views above point
    /// into it, so it is append-only after construction.
    storage: Vec<Option<Buffer>>,
    /// Byte strides for the task currently being dispatched.
    pub task_strides: Vec<i32>,
    pub(crate) baked: Option<BakedKernel>,
}

impl KernelState {
    /// Build the register table for a program: constants get copies of
    /// their initializer, static temporaries get zeroed allocations, and
    /// aliased or generated registers stay unbound until the engine binds
    /// resources over them.
    pub fn from_program(program: &Program) -> KernelState {
        let count = program.tensor_count();
        let mut storage: Vec<Option<Buffer>> = Vec::with_capacity(count);

        for reg in 0..count {
            let flags = program.tensor_flags[reg];
            let info = &program.tensors[reg];

            let buffer = if let Some(data) = &program.tensor_data[reg] {
                Some(Buffer::from_bytes(data))
            } else if !flags.intersects(TensorFlags::ALIAS | TensorFlags::GENERATOR)
                && info.is_static()
            {
                Some(Buffer::zeroed(info.size_bytes()))
            } else {
                None
            };
            storage.push(buffer);
        }

        let mut registers = Vec::with_capacity(count);
        for reg in 0..count {
            let info = program.tensors[reg];
            let view = match &mut storage[reg] {
                Some(buffer) => RegisterView {
                    data: buffer.as_mut_ptr(),
                    len: buffer.len(),
                    byte_offset: 0,
                    info,
                },
                None => RegisterView::unbound(info),
            };
            registers.push(view);
        }

        KernelState {
            registers,
            storage,
            task_strides: vec![0; count],
            baked: None,
        }
    }

    /// Bytes of a register's own storage, when it has any. Test hook and
    /// constant inspection; bound registers live in engine buffers instead.
    pub fn storage_bytes(&self, register: u16) -> Option<&[u8]> {
        self.storage
            .get(register as usize)?
            .as_ref()
            .map(Buffer::as_bytes)
    }
}

/// The shared descriptor every job of one pass works from.
struct ParallelBatch<'frame> {
    program: &'frame Program,
    registers: &'frame [RegisterView],
    task: &'frame Task,
    total_elements: usize,
    ndim: u8,
    domain_shape: [u32; MAX_DIMS],
    sync_pass: i32,
    sync_data: *mut f32,
    reduction_scratch: *mut f32,
    reduction_per_thread: usize,
    global_error: &'frame AtomicI32,
}

// Safety: jobs write disjoint slices of the destination registers, each
// worker owns its reduction-scratch rows, and sync slots are written at
// distinct job indices. The dispatcher blocks until the pool drains.
unsafe impl Send for ParallelBatch<'_> {}
unsafe impl Sync for ParallelBatch<'_> {}

/// The backend proper: a worker pool plus the inline execution scratch.
pub struct CpuBackend {
    pool: WorkerPool,
    inline: WorkerScratch,
}

impl CpuBackend {
    pub fn new(num_threads: usize, worker_scratch_bytes: usize) -> CpuBackend {
        CpuBackend {
            pool: WorkerPool::new(num_threads, worker_scratch_bytes),
            inline: WorkerScratch {
                thread_idx: 0,
                arena: Bump::with_capacity(INLINE_SCRATCH_BYTES),
            },
        }
    }

    pub fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    /// One-shot preparation after binding: allocate the per-program scratch.
    ///
    /// Reduction scratch is per-register slots, so the per-thread span is
    /// clamped up to the register file size even if the compiler reported a
    /// smaller figure.
    pub fn bake(&self, program: &Program) -> BakedKernel {
        let wants_reduction = program.meta.reduction_scratch_size > 0
            || program
                .tasks
                .iter()
                .any(|task| task.strategy == Strategy::Reduction);

        let reduction_per_thread = if wants_reduction {
            (program.meta.reduction_scratch_size as usize).max(program.tensor_count())
        } else {
            0
        };

        BakedKernel {
            reduction_scratch: vec![0.0; reduction_per_thread * self.num_threads()],
            reduction_per_thread,
            sync_scratch: vec![0.0; program.meta.sync_scratch_size as usize],
        }
    }

    /// Execute one task of one kernel over its domain.
    pub fn dispatch(
        &mut self,
        program: &Program,
        state: &mut KernelState,
        domain: &TensorInfo,
        task: &Task,
        global_error: &AtomicI32,
    ) {
        if task.inst_count == 0 {
            return;
        }
        let total_elements = domain.element_count();
        if total_elements == 0 {
            return;
        }

        if task.strategy == Strategy::Reduction {
            if let Some(baked) = state.baked.as_mut() {
                for slot in &mut baked.reduction_scratch {
                    *slot = 0.0;
                }
            }
        }

        let (reduction_scratch, reduction_per_thread, sync_capacity) = match state.baked.as_mut() {
            Some(baked) => (
                baked.reduction_scratch.as_mut_ptr(),
                baked.reduction_per_thread,
                baked.sync_scratch.len(),
            ),
            None => (core::ptr::null_mut(), 0, 0),
        };

        let mut batch = ParallelBatch {
            program,
            registers: &state.registers,
            task,
            total_elements,
            ndim: domain.ndim,
            domain_shape: [0; MAX_DIMS],
            sync_pass: -1,
            sync_data: core::ptr::null_mut(),
            reduction_scratch: if task.strategy == Strategy::Reduction {
                reduction_scratch
            } else {
                core::ptr::null_mut()
            },
            reduction_per_thread,
            global_error,
        };
        for d in 0..domain.ndim as usize {
            batch.domain_shape[d] = domain.shape[d].max(0) as u32;
        }

        let total_jobs = (total_elements + JOB_SIZE - 1) / JOB_SIZE;

        if task.strategy == Strategy::TwoPassSync && total_jobs > 1 {
            // A scan too large for the baked slots gets a transient buffer.
            let mut spill: Vec<f32>;
            let sync_ptr = if total_jobs <= sync_capacity {
                match state.baked.as_mut() {
                    Some(baked) => baked.sync_scratch.as_mut_ptr(),
                    None => core::ptr::null_mut(),
                }
            } else {
                spill = vec![0.0; total_jobs];
                spill.as_mut_ptr()
            };

            batch.sync_data = sync_ptr;
            batch.sync_pass = 0;
            self.run_pass(&batch, total_jobs);

            // Exclusive prefix over the chunk totals, single-threaded.
            unsafe {
                let mut acc = 0.0f32;
                for job in 0..total_jobs {
                    let chunk_total = *sync_ptr.add(job);
                    *sync_ptr.add(job) = acc;
                    acc += chunk_total;
                }
            }

            batch.sync_pass = 1;
            self.run_pass(&batch, total_jobs);
        } else {
            // A single-job scan degenerates to the serial in-kernel path.
            self.run_pass(&batch, total_jobs);
        }

        if task.strategy == Strategy::Reduction && !reduction_scratch.is_null() {
            let threads = self.num_threads();
            for reg in 0..program.tensor_count() {
                if !program.tensor_flags[reg].contains(TensorFlags::REDUCTION) {
                    continue;
                }
                let mut total = 0.0f32;
                for tid in 0..threads {
                    total += unsafe { *reduction_scratch.add(tid * reduction_per_thread + reg) };
                }
                let view = &state.registers[reg];
                if !view.data.is_null() {
                    unsafe {
                        let slot = view.data.add(view.byte_offset) as *mut f32;
                        slot.write_unaligned(total);
                    }
                }
            }
        }
    }

    fn run_pass(&mut self, batch: &ParallelBatch, total_jobs: usize) {
        if batch.total_elements <= INLINE_THRESHOLD || total_jobs == 1 {
            run_job(batch, 0, &mut self.inline);
        } else {
            self.pool
                .run(total_jobs as u32, &|job_idx, scratch| {
                    run_job(batch, job_idx, scratch)
                });
        }
    }
}

fn run_job(batch: &ParallelBatch, job_idx: u32, scratch: &mut WorkerScratch) {
    let start = job_idx as usize * JOB_SIZE;
    let count = JOB_SIZE.min(batch.total_elements.saturating_sub(start));
    if count == 0 {
        return;
    }
    if batch.global_error.load(Ordering::Acquire) != 0 {
        return;
    }

    let thread_idx = scratch.thread_idx;
    scratch.arena.reset();
    let mut ctx = ExecCtx::new(&scratch.arena);

    ctx.batch_size = count as u32;
    ctx.linear_offset = start as u32;
    ctx.ndim = batch.ndim;
    ctx.domain_shape = batch.domain_shape;
    ctx.job_idx = job_idx;
    ctx.sync_pass = batch.sync_pass;
    ctx.sync_data = batch.sync_data;
    ctx.reduction_pass = !batch.reduction_scratch.is_null();
    ctx.global_error = Some(batch.global_error);

    // Starting coordinate of this slice along each domain axis.
    let mut rest = start;
    for d in (0..batch.ndim as usize).rev() {
        let extent = batch.domain_shape[d].max(1) as usize;
        ctx.tile_offset[d] = (rest % extent) as u32;
        rest /= extent;
    }

    prepare_registers(&mut ctx, batch, thread_idx, start);
    execute(&mut ctx, batch);

    if ctx.error != ExecError::None {
        batch.global_error.store(ctx.error as i32, Ordering::Release);
    }
}

/// Point every bound register at its slice and recompute its stride.
///
/// Strides are re-derived per job from the *current* descriptors, because
/// aliased registers may have been rebound to a resized resource since the
/// program was baked.
fn prepare_registers(ctx: &mut ExecCtx, batch: &ParallelBatch, thread_idx: usize, start: usize) {
    let task = batch.task;
    let bindings = &batch.program.bindings
        [task.binding_offset as usize..(task.binding_offset + task.binding_count) as usize];

    for binding in bindings {
        let reg = binding.register as usize;
        let view = &batch.registers[reg];

        ctx.reg_info[reg] = view.info;

        let reg_elements = view.info.element_count();
        let stride =
            linear_stride(reg_elements, batch.total_elements) * view.info.dtype.size() as i32;
        ctx.reg_strides[reg] = stride;

        if !batch.reduction_scratch.is_null()
            && binding
                .flags
                .contains(crate::program::BindingFlags::REDUCTION)
        {
            ctx.reg_ptrs[reg] = unsafe {
                batch
                    .reduction_scratch
                    .add(thread_idx * batch.reduction_per_thread + reg) as *mut u8
            };
            ctx.reg_strides[reg] = 0;
            continue;
        }

        if view.data.is_null() {
            ctx.reg_ptrs[reg] = core::ptr::null_mut();
            if ctx.should_report() {
                let name = batch
                    .program
                    .symbol_for_register(binding.register)
                    .map(|sym| sym.name.as_str())
                    .unwrap_or("temp");
                log::error!(
                    "register {} ({}) has no backing buffer, aborting job",
                    reg,
                    name,
                );
            }
            ctx.fail(ExecError::Runtime, 0);
        } else {
            ctx.reg_ptrs[reg] = unsafe {
                view.data
                    .add(view.byte_offset)
                    .offset(start as isize * stride as isize)
            };
        }
    }
}

fn execute(ctx: &mut ExecCtx, batch: &ParallelBatch) {
    let start = batch.task.start_inst as usize;
    for offset in 0..batch.task.inst_count as usize {
        if ctx.error != ExecError::None || ctx.global_error_set() {
            break;
        }

        let inst = &batch.program.code[start + offset];
        ops::kernel(inst.opcode)(ctx, inst);

        if ctx.error != ExecError::None {
            report_crash(ctx, batch, start + offset);
            break;
        }
    }
}

/// Emit the fatal diagnostic for a kernel failure: opcode, every operand
/// with its symbol name and value, and the failing domain coordinate.
fn report_crash(ctx: &ExecCtx, batch: &ParallelBatch, inst_idx: usize) {
    let inst = &batch.program.code[inst_idx];
    let ports = inst.opcode.ports();

    let coords = ctx.error_coords();
    let coords = coords[..ctx.ndim.max(1) as usize]
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    log::error!(
        "kernel crash at instruction #{} opcode {}\n  out : {}\n  {:4}: {}\n  {:4}: {}\n  {:4}: {}\n  {:4}: {}\n  coord [{}] error {}",
        inst_idx,
        inst.opcode.name(),
        format_operand(ctx, batch.program, inst.dest),
        ports[0],
        format_operand(ctx, batch.program, inst.src[0]),
        ports[1],
        format_operand(ctx, batch.program, inst.src[1]),
        ports[2],
        format_operand(ctx, batch.program, inst.src[2]),
        ports[3],
        format_operand(ctx, batch.program, inst.src[3]),
        coords,
        ctx.error.name(),
    );
}

fn format_operand(ctx: &ExecCtx, program: &Program, register: u16) -> String {
    let name = program
        .symbol_for_register(register)
        .map(|sym| sym.name.as_str())
        .unwrap_or("temp");
    let info = ctx.info(register);
    let data = ctx.ptr(register);

    let shape = if info.ndim == 0 {
        "scalar".to_owned()
    } else {
        info.shape[..info.ndim as usize]
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    if data.is_null() {
        return format!("r{} ({}) <null> {:?} [{}]", register, name, info.dtype, shape);
    }

    if info.ndim == 0 || (info.ndim == 1 && info.shape[0] == 1) {
        let value = unsafe {
            match info.dtype {
                crate::buffer::DType::F32 => (data as *const f32).read_unaligned(),
                crate::buffer::DType::I32 => (data as *const i32).read_unaligned() as f32,
                crate::buffer::DType::U8 => data.read() as f32,
            }
        };
        format!("r{} ({}) = {:.3} ({:?})", register, name, value, info.dtype)
    } else {
        format!(
            "r{} ({}) tensor[{}] ({:?}) at {:p}",
            register, name, shape, info.dtype, data,
        )
    }
}
