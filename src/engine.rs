//! The blackboard engine: named, double-buffered resources, program
//! binding, and the per-frame dispatch loop.
//!
//! Resources and kernel instances live by value in vectors; every
//! cross-reference is a small index. Buffers sit in their own slot table so
//! that a transient resource's two sides can alias one allocation.

use core::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::buffer::{linear_stride, Buffer, TensorInfo};
use crate::cpu::{CpuBackend, KernelState, RegisterView};
use crate::exec::ExecError;
use crate::pipeline::PipelineDesc;
use crate::program::{fnv1a, Program, ProgramError, SymbolFlags};
use crate::workers::WORKER_SCRATCH_BYTES;

bitflags::bitflags! {
    /// Properties of a blackboard resource. INPUT and OUTPUT share values
    /// with [`SymbolFlags`] so symbol bits can be ORed in directly.
    pub struct ResourceFlags: u8 {
        const INPUT = 1 << 0;
        const OUTPUT = 1 << 1;
        /// Always double buffered, never rotated away.
        const PERSISTENT = 1 << 2;
        /// Never written by any program.
        const READONLY = 1 << 3;
        /// Resized by the host when the viewport changes.
        const SCREEN_SIZE = 1 << 4;
        /// Produced and consumed within a frame; single allocation.
        const TRANSIENT = 1 << 5;
    }
}

/// Coarse engine status exposed to hosts; details go to the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    OutOfMemory,
    ShapeMismatch,
    InvalidOp,
    Runtime,
}

/// Failures while building or binding an engine. None of these leave a
/// partially bound pipeline behind: binding resets the engine on entry, and
/// an allocation failure mid-bind tears the registries back down, keeping
/// only the error word.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("resource heap limit exceeded: {requested} bytes requested, {limit} byte budget")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("program rejected: {0}")]
    Program(#[from] ProgramError),
    #[error("pipeline describes {expected} kernels but {actual} programs were supplied")]
    KernelCountMismatch { expected: usize, actual: usize },
}

/// Engine construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct EngineDesc {
    /// Worker threads; 0 selects the hardware thread count.
    pub num_threads: usize,
    /// Byte budget for resource buffers.
    pub heap_limit: usize,
    /// Scratch arena capacity per worker thread.
    pub worker_scratch_bytes: usize,
}

impl Default for EngineDesc {
    fn default() -> Self {
        EngineDesc {
            num_threads: 0,
            heap_limit: 256 * 1024 * 1024,
            worker_scratch_bytes: WORKER_SCRATCH_BYTES,
        }
    }
}

/// A named, double-buffered blackboard entry.
struct Resource {
    name: String,
    name_hash: u32,
    provider: Option<String>,
    flags: ResourceFlags,
    /// Canonical contiguous descriptor; also the view handed to clients.
    desc: TensorInfo,
    size_bytes: usize,
    /// Buffer slots `[front-at-frame-0, back-at-frame-0]`. Equal for
    /// transient resources.
    buffers: [u16; 2],
}

/// The link from a kernel's local register to a blackboard resource.
struct KernelBinding {
    local_reg: u16,
    resource: u16,
    flags: SymbolFlags,
}

/// One program instance scheduled every frame.
struct KernelInst {
    id: String,
    program: Arc<Program>,
    /// Dispatches per frame.
    frequency: u32,
    bindings: Vec<KernelBinding>,
    state: KernelState,
}

/// A mutable view of a resource's current front side.
pub struct ResourceView<'pool> {
    info: TensorInfo,
    bytes: &'pool mut [u8],
}

impl ResourceView<'_> {
    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// The elements as F32, when the bytes permit that reading.
    pub fn f32_slice(&self) -> Option<&[f32]> {
        bytemuck::try_cast_slice(&*self.bytes).ok()
    }

    pub fn f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        bytemuck::try_cast_slice_mut(&mut *self.bytes).ok()
    }

    pub fn i32_slice_mut(&mut self) -> Option<&mut [i32]> {
        bytemuck::try_cast_slice_mut(&mut *self.bytes).ok()
    }
}

/// The engine itself. See the module documentation.
pub struct Engine {
    resources: Vec<Resource>,
    kernels: Vec<KernelInst>,
    buffers: Vec<Buffer>,
    backend: CpuBackend,

    /// Read side of this frame.
    front: usize,
    /// Write side of this frame.
    back: usize,
    frame_index: u64,

    /// Global kill switch, shared with every worker during dispatch.
    error: AtomicI32,

    heap_limit: usize,
    heap_used: usize,
}

impl Engine {
    pub fn new(desc: EngineDesc) -> Engine {
        log::info!(
            "creating engine: {} worker threads requested, {} MiB heap budget",
            desc.num_threads,
            desc.heap_limit / (1024 * 1024),
        );
        Engine {
            resources: Vec::new(),
            kernels: Vec::new(),
            buffers: Vec::new(),
            backend: CpuBackend::new(desc.num_threads, desc.worker_scratch_bytes),
            front: 0,
            back: 1,
            frame_index: 0,
            error: AtomicI32::new(0),
            heap_limit: desc.heap_limit,
            heap_used: 0,
        }
    }

    /// Drop every bound kernel and resource and clear the error state. The
    /// backend and its worker pool survive.
    pub fn reset(&mut self) {
        self.kernels.clear();
        self.resources.clear();
        self.buffers.clear();
        self.heap_used = 0;
        self.front = 0;
        self.back = 1;
        self.error.store(0, Ordering::Release);
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Map the internal error word to the public taxonomy.
    pub fn status(&self) -> EngineStatus {
        match ExecError::from_code(self.error.load(Ordering::Acquire)) {
            ExecError::None => EngineStatus::Ok,
            ExecError::Oom => EngineStatus::OutOfMemory,
            ExecError::ShapeMismatch => EngineStatus::ShapeMismatch,
            ExecError::InvalidOp => EngineStatus::InvalidOp,
            ExecError::OutOfBounds | ExecError::Runtime => EngineStatus::Runtime,
        }
    }

    // --- Binding ---

    /// Bind a set of programs, discovering resources from their symbol
    /// tables: every INPUT/OUTPUT symbol names a blackboard entry, created
    /// on first sight and merged by name hash afterwards.
    pub fn bind_cartridge(
        &mut self,
        programs: Vec<Program>,
        names: &[&str],
    ) -> Result<(), EngineError> {
        self.reset();

        for program in &programs {
            program.validate()?;
        }

        for program in &programs {
            for sym in &program.symbols {
                if !sym
                    .flags
                    .intersects(SymbolFlags::INPUT | SymbolFlags::OUTPUT)
                {
                    continue;
                }
                if let Some(idx) = self.find_resource(sym.name_hash) {
                    self.resources[idx].flags |=
                        ResourceFlags::from_bits_truncate(sym.flags.bits());
                    continue;
                }

                let info = &program.tensors[sym.register as usize];
                let desc = TensorInfo::contiguous(info.dtype, &info.shape[..info.ndim as usize]);
                self.resources.push(Resource {
                    name: sym.name.clone(),
                    name_hash: sym.name_hash,
                    provider: sym.provider.clone(),
                    flags: ResourceFlags::from_bits_truncate(sym.flags.bits()),
                    desc,
                    size_bytes: desc.size_bytes(),
                    buffers: [0, 0],
                });
            }
        }

        for (k_idx, program) in programs.into_iter().enumerate() {
            let program = Arc::new(program);
            let mut bindings = Vec::new();
            for sym in &program.symbols {
                if !sym
                    .flags
                    .intersects(SymbolFlags::INPUT | SymbolFlags::OUTPUT)
                {
                    continue;
                }
                if let Some(idx) = self.find_resource(sym.name_hash) {
                    bindings.push(KernelBinding {
                        local_reg: sym.register,
                        resource: idx as u16,
                        flags: sym.flags,
                    });
                }
            }

            let state = KernelState::from_program(&program);
            self.kernels.push(KernelInst {
                id: names.get(k_idx).copied().unwrap_or("kernel").to_owned(),
                program,
                frequency: 1,
                bindings,
                state,
            });
        }

        self.finalize()
    }

    /// Bind an explicitly described pipeline: resources are declared up
    /// front, kernels may override the symbol auto-match per port.
    pub fn bind_pipeline(
        &mut self,
        pipe: &PipelineDesc,
        programs: Vec<Program>,
    ) -> Result<(), EngineError> {
        if programs.len() != pipe.kernels.len() {
            return Err(EngineError::KernelCountMismatch {
                expected: pipe.kernels.len(),
                actual: programs.len(),
            });
        }

        self.reset();

        for program in &programs {
            program.validate()?;
        }

        for res in &pipe.resources {
            let desc = TensorInfo::contiguous(res.dtype, &res.shape);
            self.resources.push(Resource {
                name: res.name.clone(),
                name_hash: fnv1a(&res.name),
                provider: res.provider.clone(),
                flags: res.flags,
                desc,
                size_bytes: desc.size_bytes(),
                buffers: [0, 0],
            });
        }

        for (desc, program) in pipe.kernels.iter().zip(programs) {
            let program = Arc::new(program);
            let mut bindings: Vec<KernelBinding> = Vec::new();

            // Explicit port bindings override the name auto-match.
            for port in &desc.bindings {
                let sym = program
                    .symbols
                    .iter()
                    .find(|sym| sym.name_hash == fnv1a(&port.port));
                let res_idx = self.find_resource(fnv1a(&port.resource));
                if let (Some(sym), Some(res_idx)) = (sym, res_idx) {
                    bindings.push(KernelBinding {
                        local_reg: sym.register,
                        resource: res_idx as u16,
                        flags: sym.flags,
                    });
                } else {
                    log::warn!(
                        "kernel `{}`: binding {} -> {} matches no symbol or resource",
                        desc.id,
                        port.port,
                        port.resource,
                    );
                }
            }

            // Any remaining public symbol binds to the resource of its name.
            for sym in &program.symbols {
                if !sym
                    .flags
                    .intersects(SymbolFlags::INPUT | SymbolFlags::OUTPUT)
                {
                    continue;
                }
                if bindings.iter().any(|b| b.local_reg == sym.register) {
                    continue;
                }
                if let Some(idx) = self.find_resource(sym.name_hash) {
                    bindings.push(KernelBinding {
                        local_reg: sym.register,
                        resource: idx as u16,
                        flags: sym.flags,
                    });
                }
            }

            let state = KernelState::from_program(&program);
            self.kernels.push(KernelInst {
                id: desc.id.clone(),
                program,
                frequency: desc.frequency.max(1),
                bindings,
                state,
            });
        }

        self.finalize()
    }

    /// Transience analysis, buffer allocation, constant upload and backend
    /// bake, in that order. An allocation failure tears the half-built
    /// pipeline back down; only the error word survives.
    fn finalize(&mut self) -> Result<(), EngineError> {
        self.analyze_transience();

        if let Err(err) = self.allocate_resources() {
            self.kernels.clear();
            self.resources.clear();
            self.buffers.clear();
            self.heap_used = 0;
            return Err(err);
        }

        // Constant initializers reach both sides of the bound resource.
        for k_idx in 0..self.kernels.len() {
            for b_idx in 0..self.kernels[k_idx].bindings.len() {
                let (local_reg, res_idx) = {
                    let binding = &self.kernels[k_idx].bindings[b_idx];
                    (binding.local_reg as usize, binding.resource as usize)
                };
                let data = match &self.kernels[k_idx].program.tensor_data[local_reg] {
                    Some(data) => data.clone(),
                    None => continue,
                };
                let [first, second] = self.resources[res_idx].buffers;
                for &slot in [first, second].iter() {
                    let bytes = self.buffers[slot as usize].as_bytes_mut();
                    let len = bytes.len().min(data.len());
                    bytes[..len].copy_from_slice(&data[..len]);
                }
            }
        }

        for kernel in &mut self.kernels {
            kernel.state.baked = Some(self.backend.bake(&kernel.program));
            log::debug!("kernel `{}` baked", kernel.id);
        }

        log::info!(
            "pipeline bound: {} kernels over {} resources, {} KiB resource heap",
            self.kernels.len(),
            self.resources.len(),
            self.heap_used / 1024,
        );
        Ok(())
    }

    fn allocate_resources(&mut self) -> Result<(), EngineError> {
        for res_idx in 0..self.resources.len() {
            let size = self.resources[res_idx].size_bytes;
            let transient = self.resources[res_idx]
                .flags
                .contains(ResourceFlags::TRANSIENT);

            let first = self.alloc_buffer(size)?;
            let second = if transient { first } else { self.alloc_buffer(size)? };
            self.resources[res_idx].buffers = [first, second];
        }
        Ok(())
    }

    /// A resource is transient when no kernel reads it before the first
    /// in-frame write. Walks kernels in pipeline order.
    fn analyze_transience(&mut self) {
        for res_idx in 0..self.resources.len() {
            let res = &self.resources[res_idx];
            if res
                .flags
                .intersects(ResourceFlags::PERSISTENT | ResourceFlags::TRANSIENT)
            {
                continue;
            }

            let mut read_before_write = false;
            let mut write_happened = false;
            for kernel in &self.kernels {
                let mut reads = false;
                let mut writes = false;
                for binding in &kernel.bindings {
                    if binding.resource as usize != res_idx {
                        continue;
                    }
                    reads |= binding.flags.contains(SymbolFlags::INPUT);
                    writes |= binding.flags.contains(SymbolFlags::OUTPUT);
                }
                if reads && !write_happened {
                    read_before_write = true;
                    break;
                }
                if writes {
                    write_happened = true;
                }
            }

            if !read_before_write && write_happened {
                self.resources[res_idx].flags |= ResourceFlags::TRANSIENT;
            }
        }
    }

    fn alloc_buffer(&mut self, size: usize) -> Result<u16, EngineError> {
        if self.heap_used + size > self.heap_limit {
            self.error.store(ExecError::Oom as i32, Ordering::Release);
            return Err(EngineError::OutOfMemory {
                requested: size,
                limit: self.heap_limit,
            });
        }
        self.heap_used += size;
        self.buffers.push(Buffer::zeroed(size));
        Ok((self.buffers.len() - 1) as u16)
    }

    fn find_resource(&self, name_hash: u32) -> Option<usize> {
        self.resources
            .iter()
            .position(|res| res.name_hash == name_hash)
    }

    // --- Execution ---

    /// Execute one frame: bind registers to the current buffer sides, run
    /// every kernel's tasks in pipeline order, then rotate front and back.
    /// A no-op once the error word is set.
    pub fn dispatch(&mut self) {
        if self.error.load(Ordering::Acquire) != 0 {
            return;
        }

        let (front, back) = (self.front, self.back);
        let mut kernels = mem::take(&mut self.kernels);

        'frame: for kernel in kernels.iter_mut() {
            if self.error.load(Ordering::Acquire) != 0 {
                break;
            }

            // Point each bound register at the right buffer side: inputs
            // read the front, outputs write the back.
            for binding in &kernel.bindings {
                let res = &self.resources[binding.resource as usize];
                let side = if binding.flags.contains(SymbolFlags::OUTPUT) {
                    back
                } else {
                    front
                };
                let desc = res.desc;
                let slot = res.buffers[side] as usize;
                let buffer = &mut self.buffers[slot];
                kernel.state.registers[binding.local_reg as usize] = RegisterView {
                    data: buffer.as_mut_ptr(),
                    len: buffer.len(),
                    byte_offset: 0,
                    info: desc,
                };
            }

            for _ in 0..kernel.frequency {
                for task in &kernel.program.tasks {
                    let domain = kernel.state.registers[task.domain_reg as usize].info;
                    let total = domain.element_count();

                    let bindings = &kernel.program.bindings[task.binding_offset as usize
                        ..(task.binding_offset + task.binding_count) as usize];
                    for binding in bindings {
                        let reg = binding.register as usize;
                        let view = &kernel.state.registers[reg];
                        let stride = linear_stride(view.info.element_count(), total)
                            * view.info.dtype.size() as i32;
                        kernel.state.task_strides[reg] = stride;
                    }

                    self.backend.dispatch(
                        &kernel.program,
                        &mut kernel.state,
                        &domain,
                        task,
                        &self.error,
                    );

                    if self.error.load(Ordering::Acquire) != 0 {
                        break 'frame;
                    }
                }
            }
        }

        self.kernels = kernels;
        self.frame_index += 1;
        mem::swap(&mut self.front, &mut self.back);
    }

    // --- Resource access ---

    /// The current front-side view of a resource, or None if unknown.
    /// Mutations through the view are visible to the next frame's readers.
    pub fn map_resource(&mut self, name: &str) -> Option<ResourceView<'_>> {
        let idx = self.find_resource(fnv1a(name))?;
        let info = self.resources[idx].desc;
        let slot = self.resources[idx].buffers[self.front] as usize;
        Some(ResourceView {
            info,
            bytes: self.buffers[slot].as_bytes_mut(),
        })
    }

    /// Reallocate a resource for a new shape, preserving its flags and
    /// element type. Contents are not carried over. Returns false when the
    /// resource is unknown or the new size does not fit the heap budget.
    pub fn resize_resource(&mut self, name: &str, shape: &[i32]) -> bool {
        let idx = match self.find_resource(fnv1a(name)) {
            Some(idx) => idx,
            None => {
                log::error!("cannot resize resource `{}`: not found", name);
                return false;
            }
        };

        let dtype = self.resources[idx].desc.dtype;
        let new_desc = TensorInfo::contiguous(dtype, shape);
        let new_bytes = new_desc.size_bytes();
        let old_bytes = self.resources[idx].size_bytes;

        if new_bytes != old_bytes {
            let [first, second] = self.resources[idx].buffers;
            let transient = first == second;

            let freed = if transient { old_bytes } else { 2 * old_bytes };
            let needed = if transient { new_bytes } else { 2 * new_bytes };
            if self.heap_used - freed + needed > self.heap_limit {
                log::error!(
                    "cannot resize resource `{}`: {} bytes over the heap budget",
                    name,
                    needed,
                );
                return false;
            }
            self.heap_used = self.heap_used - freed + needed;

            self.buffers[first as usize] = Buffer::zeroed(new_bytes);
            if !transient {
                self.buffers[second as usize] = Buffer::zeroed(new_bytes);
            }
            self.resources[idx].size_bytes = new_bytes;
        }

        self.resources[idx].desc = new_desc;
        true
    }

    /// Copy a resource's front side over its back side, so both frames see
    /// the same bytes. Used after host-side bulk writes.
    pub fn sync_resource(&mut self, name: &str) {
        let idx = match self.find_resource(fnv1a(name)) {
            Some(idx) => idx,
            None => return,
        };
        let [first, second] = self.resources[idx].buffers;
        if first == second {
            return;
        }
        let (src, dst) = if self.front == 0 {
            (first as usize, second as usize)
        } else {
            (second as usize, first as usize)
        };
        self.copy_between(src, dst);
    }

    fn copy_between(&mut self, src: usize, dst: usize) {
        debug_assert_ne!(src, dst);
        let (lo, hi) = (src.min(dst), src.max(dst));
        let (head, tail) = self.buffers.split_at_mut(hi);
        let (a, b) = (&mut head[lo], &mut tail[0]);
        let (from, to) = if src < dst { (a, b) } else { (b, a) };
        let len = from.len().min(to.len());
        to.as_bytes_mut()[..len].copy_from_slice(&from.as_bytes()[..len]);
    }

    /// Visit every resource with its front-side view.
    pub fn iterate_resources(&mut self, mut visit: impl FnMut(&str, ResourceView<'_>)) {
        let front = self.front;
        for idx in 0..self.resources.len() {
            let info = self.resources[idx].desc;
            let slot = self.resources[idx].buffers[front] as usize;
            let name = &self.resources[idx].name;
            let view = ResourceView {
                info,
                bytes: self.buffers[slot].as_bytes_mut(),
            };
            visit(name.as_str(), view);
        }
    }

    /// Names, flags and descriptors of every resource, without buffers.
    pub fn resource_descs(&self) -> impl Iterator<Item = (&str, ResourceFlags, &TensorInfo)> {
        self.resources
            .iter()
            .map(|res| (res.name.as_str(), res.flags, &res.desc))
    }

    /// The provider annotation of a resource, when one was declared.
    pub fn resource_provider(&self, name: &str) -> Option<&str> {
        let idx = self.find_resource(fnv1a(name))?;
        self.resources[idx].provider.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn buffer_slots(&self, name: &str) -> Option<[u16; 2]> {
        let idx = self.find_resource(fnv1a(name))?;
        Some(self.resources[idx].buffers)
    }

    #[cfg(test)]
    pub(crate) fn back_bytes(&self, name: &str) -> Option<&[u8]> {
        let idx = self.find_resource(fnv1a(name))?;
        let slot = self.resources[idx].buffers[self.back] as usize;
        Some(self.buffers[slot].as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DType;
    use crate::program::{
        BindingFlags, Instruction, OpCode, Strategy, Symbol, Task, TaskBinding, TensorFlags,
    };

    /// One-instruction program copying the symbol `src` into `dst`.
    fn copy_program(elements: i32, src: &str, dst: &str) -> Program {
        let mut prog = Program::default();
        prog.tensors = vec![
            TensorInfo::contiguous(DType::F32, &[elements]),
            TensorInfo::contiguous(DType::F32, &[elements]),
        ];
        prog.tensor_flags = vec![TensorFlags::INPUT, TensorFlags::OUTPUT];
        prog.tensor_data = vec![None, None];
        prog.code = vec![Instruction::unary(OpCode::Copy, 1, 0)];
        prog.symbols = vec![
            Symbol::new(src, 0, SymbolFlags::INPUT),
            Symbol::new(dst, 1, SymbolFlags::OUTPUT),
        ];
        prog.bindings = vec![
            TaskBinding {
                register: 0,
                flags: BindingFlags::empty(),
            },
            TaskBinding {
                register: 1,
                flags: BindingFlags::empty(),
            },
        ];
        prog.tasks = vec![Task {
            start_inst: 0,
            inst_count: 1,
            domain_reg: 1,
            strategy: Strategy::Linear,
            binding_offset: 0,
            binding_count: 2,
        }];
        prog
    }

    fn small_engine() -> Engine {
        Engine::new(EngineDesc {
            num_threads: 2,
            heap_limit: 1 << 20,
            worker_scratch_bytes: 1 << 16,
        })
    }

    #[test]
    fn transient_resources_share_one_allocation() {
        let mut engine = small_engine();
        // `mid` is written by kernel 0 and read by kernel 1 afterwards, so
        // it is produced and consumed in-frame: transient. `src` is only
        // ever read and `dst` only written last, so `dst` is transient too
        // while `src` (read before any write) stays double buffered.
        engine
            .bind_cartridge(
                vec![copy_program(8, "src", "mid"), copy_program(8, "mid", "dst")],
                &["producer", "consumer"],
            )
            .unwrap();

        let mid = engine.buffer_slots("mid").unwrap();
        assert_eq!(mid[0], mid[1]);
        let src = engine.buffer_slots("src").unwrap();
        assert_ne!(src[0], src[1]);
    }

    #[test]
    fn double_buffer_rotation() {
        let mut engine = small_engine();
        engine
            .bind_cartridge(vec![copy_program(4, "src", "dst")], &["copy"])
            .unwrap();

        assert_eq!(engine.frame_index(), 0);
        let (front, back) = (engine.front, engine.back);
        engine.dispatch();
        assert_eq!(engine.frame_index(), 1);
        assert_eq!(engine.front, back);
        assert_eq!(engine.back, front);
    }

    #[test]
    fn sync_copies_front_to_back() {
        let mut engine = small_engine();
        engine
            .bind_cartridge(vec![copy_program(4, "src", "dst")], &["copy"])
            .unwrap();

        {
            let mut view = engine.map_resource("src").unwrap();
            view.f32_slice_mut().unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        }
        engine.sync_resource("src");

        let back = engine.back_bytes("src").unwrap();
        let back: &[f32] = bytemuck::cast_slice(back);
        assert_eq!(back, &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn resize_preserves_flags_and_dtype() {
        let mut engine = small_engine();
        engine
            .bind_cartridge(vec![copy_program(4, "src", "dst")], &["copy"])
            .unwrap();

        let before = engine
            .resource_descs()
            .find(|(name, _, _)| *name == "src")
            .map(|(_, flags, _)| flags)
            .unwrap();

        assert!(engine.resize_resource("src", &[16, 2]));
        let (_, after, desc) = engine
            .resource_descs()
            .find(|(name, _, _)| *name == "src")
            .unwrap();
        assert_eq!(after, before);
        assert_eq!(desc.ndim, 2);
        assert_eq!(&desc.shape[..2], &[16, 2]);
        assert_eq!(desc.dtype, DType::F32);
        assert_eq!(engine.map_resource("src").unwrap().bytes().len(), 128);

        assert!(!engine.resize_resource("missing", &[4]));
    }

    #[test]
    fn heap_budget_is_enforced() {
        let mut engine = Engine::new(EngineDesc {
            num_threads: 1,
            heap_limit: 64,
            worker_scratch_bytes: 1 << 12,
        });
        let result = engine.bind_cartridge(vec![copy_program(1024, "src", "dst")], &["copy"]);
        assert!(matches!(result, Err(EngineError::OutOfMemory { .. })));
        assert_eq!(engine.status(), EngineStatus::OutOfMemory);
        // The half-built pipeline was torn down: no resources survive, so
        // nothing can map a never-allocated buffer slot.
        assert!(engine.map_resource("src").is_none());
        assert!(engine.map_resource("dst").is_none());
        assert_eq!(engine.resource_descs().count(), 0);
        // Dispatch after an error is a no-op.
        engine.dispatch();
        assert_eq!(engine.frame_index(), 0);
    }
}
