//! Shared helpers for the integration tests: tiny hand-assembled programs
//! in place of a compiler.
#![allow(dead_code)]

use dataloom::buffer::{DType, TensorInfo};
use dataloom::{
    BindingFlags, Engine, EngineDesc, Instruction, Program, Strategy, Symbol, SymbolFlags, Task,
    TaskBinding, TensorFlags,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_engine(num_threads: usize) -> Engine {
    Engine::new(EngineDesc {
        num_threads,
        heap_limit: 16 * 1024 * 1024,
        worker_scratch_bytes: 1 << 16,
    })
}

/// Incrementally assembles a program the way the external compiler would.
#[derive(Default)]
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder::default()
    }

    pub fn register(&mut self, info: TensorInfo, flags: TensorFlags) -> u16 {
        self.program.tensors.push(info);
        self.program.tensor_flags.push(flags);
        self.program.tensor_data.push(None);
        (self.program.tensors.len() - 1) as u16
    }

    pub fn constant_scalar(&mut self, value: f32) -> u16 {
        let register = self.register(TensorInfo::scalar(DType::F32), TensorFlags::CONSTANT);
        self.program.tensor_data[register as usize] =
            Some(value.to_le_bytes().to_vec().into_boxed_slice());
        register
    }

    pub fn constant_tensor(&mut self, shape: &[i32], values: &[f32]) -> u16 {
        let register = self.register(
            TensorInfo::contiguous(DType::F32, shape),
            TensorFlags::CONSTANT,
        );
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect();
        self.program.tensor_data[register as usize] = Some(bytes.into_boxed_slice());
        register
    }

    pub fn symbol(&mut self, name: &str, register: u16, flags: SymbolFlags) -> &mut Self {
        self.program.symbols.push(Symbol::new(name, register, flags));
        self
    }

    pub fn input(&mut self, name: &str, shape: &[i32]) -> u16 {
        let register = self.register(
            TensorInfo::contiguous(DType::F32, shape),
            TensorFlags::INPUT,
        );
        self.symbol(name, register, SymbolFlags::INPUT);
        register
    }

    pub fn output(&mut self, name: &str, shape: &[i32]) -> u16 {
        let register = self.register(
            TensorInfo::contiguous(DType::F32, shape),
            TensorFlags::OUTPUT,
        );
        self.symbol(name, register, SymbolFlags::OUTPUT);
        register
    }

    /// Append a task covering `code`, bound to exactly the registers in
    /// `bindings`. Reduction registers get their binding flag from the
    /// tensor flags.
    pub fn task(
        &mut self,
        strategy: Strategy,
        domain_reg: u16,
        code: Vec<Instruction>,
        bindings: &[u16],
    ) -> &mut Self {
        let start_inst = self.program.code.len() as u32;
        let inst_count = code.len() as u32;
        self.program.code.extend(code);

        let binding_offset = self.program.bindings.len() as u32;
        for &register in bindings {
            let flags = if self.program.tensor_flags[register as usize]
                .contains(TensorFlags::REDUCTION)
            {
                BindingFlags::REDUCTION
            } else {
                BindingFlags::empty()
            };
            self.program.bindings.push(TaskBinding { register, flags });
        }

        self.program.tasks.push(Task {
            start_inst,
            inst_count,
            domain_reg,
            strategy,
            binding_offset,
            binding_count: bindings.len() as u32,
        });
        self
    }

    pub fn finish(&mut self) -> Program {
        let mut program = std::mem::take(&mut self.program);
        program.meta.reduction_scratch_size = program.tensors.len() as u32;
        program.meta.sync_scratch_size = 8;
        program.validate().expect("hand-assembled program is valid");
        program
    }
}

/// Fill a named resource with values on both buffer sides.
pub fn write_resource(engine: &mut Engine, name: &str, values: &[f32]) {
    {
        let mut view = engine
            .map_resource(name)
            .unwrap_or_else(|| panic!("resource `{}` exists", name));
        let slice = view.f32_slice_mut().expect("resource is F32");
        slice[..values.len()].copy_from_slice(values);
    }
    engine.sync_resource(name);
}

/// Read a named resource's front side as F32.
pub fn read_resource(engine: &mut Engine, name: &str) -> Vec<f32> {
    let view = engine
        .map_resource(name)
        .unwrap_or_else(|| panic!("resource `{}` exists", name));
    view.f32_slice().expect("resource is F32").to_vec()
}
