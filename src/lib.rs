//! A tensor-dataflow virtual machine.
//!
//! The crate loads compiled *cartridges* — binary bundles of straight-line
//! tensor bytecode plus resource metadata — and executes them repeatedly in a
//! frame loop against a shared, double-buffered resource pool (the
//! *blackboard*). Each program is a vectorized kernel over a multi-dimensional
//! domain, interpreted on the CPU by a strided, broadcast-aware worker pool.
//!
//! The pieces, bottom up:
//!
//! * [`buffer`] — element types, tensor descriptors, byte buffers.
//! * [`program`] — the instruction set, symbols, tasks and task bindings.
//! * [`cartridge`] — the binary container codec (reader and writer).
//! * [`ops`] — the per-opcode kernel table driving the interpreter.
//! * [`workers`] — a fixed pool of threads with per-thread scratch arenas.
//! * [`cpu`] — the CPU backend: task strategies, scratch baking, crash dumps.
//! * [`engine`] — the blackboard: resource registry, double-buffer rotation,
//!   program binding and per-frame dispatch.
//! * [`env`] — the well-known host input resources (`u_Time`, `u_Mouse`, ...).

pub mod buffer;
pub mod cartridge;
pub mod cpu;
pub mod engine;
pub mod env;
pub mod exec;
pub mod ops;
pub mod pipeline;
pub mod program;
pub mod workers;

pub use buffer::{DType, TensorInfo, MAX_DIMS};
pub use cartridge::{Cartridge, CartridgeBuilder, CartridgeError, SectionKind};
pub use engine::{Engine, EngineDesc, EngineError, EngineStatus, ResourceFlags, ResourceView};
pub use env::{HostEnv, Inputs};
pub use exec::ExecError;
pub use pipeline::{PipelineDesc, PipelineKernel, PipelineResource, PortBinding};
pub use program::{
    BindingFlags, Instruction, OpCode, Program, Strategy, Symbol, SymbolFlags, Task, TaskBinding,
    TensorFlags,
};
