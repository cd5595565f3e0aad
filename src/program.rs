//! The program representation: instruction stream, tensor descriptors,
//! symbols, tasks and task bindings.
//!
//! A program is straight-line bytecode over a register file of tensors. It is
//! produced by an external compiler, shipped inside a cartridge and never
//! mutated at runtime. All cross-references between the tables below are
//! plain indices; validation re-establishes every invariant after decoding
//! untrusted input.

use crate::buffer::TensorInfo;

/// Size of the register file an execution context can address.
pub const MAX_REGISTERS: usize = 256;

/// Number of source operand slots per instruction.
pub const MAX_SRC: usize = 4;

/// 32-bit FNV-1a, the name hash used for symbols and resources.
pub fn fnv1a(name: &str) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for &byte in name.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

macro_rules! opcodes {
    ($(($variant:ident, $value:literal, $name:literal, $srcs:literal)),* $(,)?) => {
        /// Operation selector of one instruction.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum OpCode {
            $($variant = $value,)*
        }

        impl OpCode {
            pub fn from_u16(raw: u16) -> Option<OpCode> {
                Some(match raw {
                    $($value => OpCode::$variant,)*
                    _ => return None,
                })
            }

            /// Mnemonic used in diagnostics.
            pub fn name(self) -> &'static str {
                match self {
                    $(OpCode::$variant => $name,)*
                }
            }

            /// How many source operand slots the kernel reads.
            pub fn src_count(self) -> usize {
                match self {
                    $(OpCode::$variant => $srcs,)*
                }
            }
        }
    };
}

opcodes! {
    (Nop, 0, "NOP", 0),

    // Memory motion. All three are the same strided element copy; they only
    // differ in what the compiler promises about the descriptors.
    (Copy, 1, "COPY", 1),
    (Slice, 2, "SLICE", 1),
    (Reshape, 3, "RESHAPE", 1),

    // Pointwise unary.
    (Neg, 4, "NEG", 1),
    (Abs, 5, "ABS", 1),
    (Sign, 6, "SIGN", 1),
    (Floor, 7, "FLOOR", 1),
    (Fract, 8, "FRACT", 1),
    (Saturate, 9, "SATURATE", 1),
    (Sin, 10, "SIN", 1),
    (Cos, 11, "COS", 1),
    (Tan, 12, "TAN", 1),
    (Exp, 13, "EXP", 1),
    (Log, 14, "LOG", 1),
    (Sqrt, 15, "SQRT", 1),
    (Rsqrt, 16, "RSQRT", 1),
    (Not, 17, "NOT", 1),

    // Pointwise binary.
    (Add, 18, "ADD", 2),
    (Sub, 19, "SUB", 2),
    (Mul, 20, "MUL", 2),
    (Div, 21, "DIV", 2),
    (Mod, 22, "MOD", 2),
    (Min, 23, "MIN", 2),
    (Max, 24, "MAX", 2),
    (Pow, 25, "POW", 2),
    (Step, 26, "STEP", 2),
    (Eq, 27, "EQ", 2),
    (Ne, 28, "NE", 2),
    (Lt, 29, "LT", 2),
    (Le, 30, "LE", 2),
    (Gt, 31, "GT", 2),
    (Ge, 32, "GE", 2),
    (And, 33, "AND", 2),
    (Or, 34, "OR", 2),
    (BitAnd, 35, "BIT_AND", 2),
    (BitOr, 36, "BIT_OR", 2),
    (BitXor, 37, "BIT_XOR", 2),
    (Shl, 38, "SHL", 2),
    (Shr, 39, "SHR", 2),

    // Pointwise ternary.
    (Mix, 40, "MIX", 3),
    (Clamp, 41, "CLAMP", 3),
    (Fma, 42, "FMA", 3),
    (SmoothStep, 43, "SMOOTHSTEP", 2),

    // Vector, inner loop over the last axis of the operand.
    (Dot, 44, "DOT", 2),
    (Length, 45, "LENGTH", 1),
    (Normalize, 46, "NORMALIZE", 1),
    (Join, 47, "JOIN", 2),

    // Matrix.
    (MatMul, 48, "MATMUL", 2),
    (Transpose, 49, "TRANSPOSE", 1),
    (Inverse, 50, "INVERSE", 1),

    // Array.
    (Gather, 51, "GATHER", 2),
    (CumSum, 52, "CUMSUM", 1),

    // Reductions.
    (Sum, 53, "SUM", 1),
    (Size, 54, "SIZE", 1),

    // System index generation.
    (IndexX, 55, "INDEX_X", 0),
    (IndexY, 56, "INDEX_Y", 0),
    (IndexZ, 57, "INDEX_Z", 0),
}

impl OpCode {
    /// Whether the destination slot names a written register.
    pub fn writes_dest(self) -> bool {
        !matches!(self, OpCode::Nop)
    }

    /// Port labels for crash diagnostics.
    pub fn ports(self) -> [&'static str; MAX_SRC] {
        match self {
            OpCode::Gather => ["data", "index", "src3", "src4"],
            OpCode::SmoothStep => ["edges", "x", "src3", "src4"],
            OpCode::Mix => ["a", "b", "t", "src4"],
            OpCode::Clamp => ["x", "lo", "hi", "src4"],
            OpCode::Fma => ["a", "b", "c", "src4"],
            OpCode::MatMul | OpCode::Dot => ["a", "b", "src3", "src4"],
            OpCode::Join => ["x", "y", "z", "w"],
            _ => ["src1", "src2", "src3", "src4"],
        }
    }
}

/// One decoded instruction. Operand fields are register indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub dest: u16,
    pub src: [u16; MAX_SRC],
}

impl Instruction {
    pub fn nullary(opcode: OpCode, dest: u16) -> Self {
        Instruction {
            opcode,
            dest,
            src: [0; MAX_SRC],
        }
    }

    pub fn unary(opcode: OpCode, dest: u16, a: u16) -> Self {
        Instruction {
            opcode,
            dest,
            src: [a, 0, 0, 0],
        }
    }

    pub fn binary(opcode: OpCode, dest: u16, a: u16, b: u16) -> Self {
        Instruction {
            opcode,
            dest,
            src: [a, b, 0, 0],
        }
    }

    pub fn ternary(opcode: OpCode, dest: u16, a: u16, b: u16, c: u16) -> Self {
        Instruction {
            opcode,
            dest,
            src: [a, b, c, 0],
        }
    }
}

bitflags::bitflags! {
    /// Static per-register properties.
    pub struct TensorFlags: u8 {
        const INPUT = 1 << 0;
        const OUTPUT = 1 << 1;
        /// Descriptor is unknown until the engine binds a resource.
        const ALIAS = 1 << 2;
        /// Filled by the system at execution time; never pre-allocated.
        const GENERATOR = 1 << 3;
        /// Scalar in the program, backed by per-thread scratch while running.
        const REDUCTION = 1 << 4;
        /// Initialized from the cartridge's constant data.
        const CONSTANT = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Blackboard-facing properties of a symbol. The INPUT/OUTPUT bits share
    /// values with [`TensorFlags`] so they can be ORed into resource flags.
    pub struct SymbolFlags: u8 {
        const INPUT = 1 << 0;
        const OUTPUT = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Per-task role of a bound register.
    pub struct BindingFlags: u8 {
        const REDUCTION = 1 << 0;
    }
}

/// A named public register.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    /// Optional name of an external source feeding this register.
    pub provider: Option<String>,
    pub name_hash: u32,
    pub register: u16,
    pub flags: SymbolFlags,
}

impl Symbol {
    pub fn new(name: &str, register: u16, flags: SymbolFlags) -> Self {
        Symbol {
            name_hash: fnv1a(name),
            name: name.to_owned(),
            provider: None,
            register,
            flags,
        }
    }
}

/// Parallel-execution algorithm of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Strategy {
    /// One pass, jobs independent.
    Linear = 0,
    /// Jobs accumulate into per-thread scratch, summed after the join.
    Reduction = 1,
    /// Prefix scan: local pass, serial exclusive prefix, offset pass.
    TwoPassSync = 2,
}

impl Strategy {
    pub fn from_u8(raw: u8) -> Option<Strategy> {
        Some(match raw {
            0 => Strategy::Linear,
            1 => Strategy::Reduction,
            2 => Strategy::TwoPassSync,
            _ => return None,
        })
    }
}

/// A contiguous instruction range sharing one strategy and one domain.
#[derive(Clone, Copy, Debug)]
pub struct Task {
    pub start_inst: u32,
    pub inst_count: u32,
    /// Register whose shape spans the parallel index space.
    pub domain_reg: u16,
    pub strategy: Strategy,
    pub binding_offset: u32,
    pub binding_count: u32,
}

/// Declares that a register participates in a task.
#[derive(Clone, Copy, Debug)]
pub struct TaskBinding {
    pub register: u16,
    pub flags: BindingFlags,
}

/// Auxiliary sizes carried next to the tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgramMeta {
    /// Per-thread F32 reduction slots; indexed by register index, so it must
    /// cover the register file (>= tensor count).
    pub reduction_scratch_size: u32,
    /// F32 slots for the two-pass scan chunk totals.
    pub sync_scratch_size: u32,
    /// Byte size of the packed rank-0 constant block.
    pub push_constants_size: u32,
}

/// Everything a cartridge says about one kernel: code and resource metadata.
///
/// All tables are owned; nothing borrows from the file the program was read
/// from.
#[derive(Default)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub tensors: Vec<TensorInfo>,
    pub tensor_flags: Vec<TensorFlags>,
    /// Constant initializer bytes per register, if any.
    pub tensor_data: Vec<Option<Box<[u8]>>>,
    pub symbols: Vec<Symbol>,
    pub tasks: Vec<Task>,
    pub bindings: Vec<TaskBinding>,
    pub meta: ProgramMeta,
}

impl Default for TensorFlags {
    fn default() -> Self {
        TensorFlags::empty()
    }
}

/// A structural defect found while validating a decoded program.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("program tables disagree on the tensor count")]
    TableMismatch,
    #[error("register file exceeds {MAX_REGISTERS} registers")]
    TooManyRegisters,
    #[error("instruction {inst} references register {register} out of range")]
    RegisterOutOfRange { inst: usize, register: u16 },
    #[error("symbol `{name}` references register {register} out of range")]
    SymbolOutOfRange { name: String, register: u16 },
    #[error("task {task} instruction range is out of bounds")]
    TaskRangeOutOfBounds { task: usize },
    #[error("task {task} binding range is out of bounds")]
    BindingRangeOutOfBounds { task: usize },
    #[error("task {task} domain register {register} is not among its bindings")]
    DomainNotBound { task: usize, register: u16 },
    #[error("task {task} instruction {inst} uses register {register} outside the binding set")]
    OperandNotBound {
        task: usize,
        inst: usize,
        register: u16,
    },
}

impl Program {
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Find the symbol naming a register, for diagnostics.
    pub fn symbol_for_register(&self, register: u16) -> Option<&Symbol> {
        self.symbols.iter().find(|sym| sym.register == register)
    }

    /// Re-establish every structural invariant of the tables.
    ///
    /// Run by the cartridge loader on untrusted input; programs built in
    /// memory should pass it before being handed to an engine.
    pub fn validate(&self) -> Result<(), ProgramError> {
        let count = self.tensors.len();
        if self.tensor_flags.len() != count || self.tensor_data.len() != count {
            return Err(ProgramError::TableMismatch);
        }
        if count > MAX_REGISTERS {
            return Err(ProgramError::TooManyRegisters);
        }

        let in_range = |register: u16| (register as usize) < count;

        for (idx, inst) in self.code.iter().enumerate() {
            let mut operands = vec![inst.dest];
            operands.extend_from_slice(&inst.src[..inst.opcode.src_count()]);
            for register in operands {
                if !in_range(register) {
                    return Err(ProgramError::RegisterOutOfRange {
                        inst: idx,
                        register,
                    });
                }
            }
        }

        for sym in &self.symbols {
            if !in_range(sym.register) {
                return Err(ProgramError::SymbolOutOfRange {
                    name: sym.name.clone(),
                    register: sym.register,
                });
            }
        }

        for (t_idx, task) in self.tasks.iter().enumerate() {
            let start = task.start_inst as usize;
            let end = start + task.inst_count as usize;
            if end > self.code.len() {
                return Err(ProgramError::TaskRangeOutOfBounds { task: t_idx });
            }

            let b_start = task.binding_offset as usize;
            let b_end = b_start + task.binding_count as usize;
            if b_end > self.bindings.len() {
                return Err(ProgramError::BindingRangeOutOfBounds { task: t_idx });
            }

            let mut bound = [false; MAX_REGISTERS];
            for binding in &self.bindings[b_start..b_end] {
                if !in_range(binding.register) {
                    return Err(ProgramError::BindingRangeOutOfBounds { task: t_idx });
                }
                bound[binding.register as usize] = true;
            }

            if !in_range(task.domain_reg) || !bound[task.domain_reg as usize] {
                return Err(ProgramError::DomainNotBound {
                    task: t_idx,
                    register: task.domain_reg,
                });
            }

            for (i_idx, inst) in self.code[start..end].iter().enumerate() {
                let mut operands = Vec::with_capacity(1 + MAX_SRC);
                if inst.opcode.writes_dest() {
                    operands.push(inst.dest);
                }
                operands.extend_from_slice(&inst.src[..inst.opcode.src_count()]);
                for register in operands {
                    if !bound[register as usize] {
                        return Err(ProgramError::OperandNotBound {
                            task: t_idx,
                            inst: start + i_idx,
                            register,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DType, TensorInfo};

    fn two_register_program() -> Program {
        let mut prog = Program::default();
        prog.tensors = vec![
            TensorInfo::scalar(DType::F32),
            TensorInfo::contiguous(DType::F32, &[4]),
        ];
        prog.tensor_flags = vec![TensorFlags::CONSTANT, TensorFlags::OUTPUT];
        prog.tensor_data = vec![None, None];
        prog.code = vec![Instruction::unary(OpCode::Copy, 1, 0)];
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

    #[test]
    fn fnv1a_reference_values() {
        // Well-known FNV-1a test vectors.
        assert_eq!(fnv1a(""), 0x811c9dc5);
        assert_eq!(fnv1a("a"), 0xe40c292c);
        assert_ne!(fnv1a("u_Time"), fnv1a("u_Mouse"));
    }

    #[test]
    fn valid_program_passes() {
        two_register_program().validate().unwrap();
    }

    #[test]
    fn operand_outside_binding_set_is_rejected() {
        let mut prog = two_register_program();
        prog.tasks[0].binding_count = 1;
        prog.tasks[0].domain_reg = 0;
        assert!(matches!(
            prog.validate(),
            Err(ProgramError::OperandNotBound { register: 1, .. })
        ));
    }

    #[test]
    fn unbound_domain_is_rejected() {
        let mut prog = two_register_program();
        prog.bindings.remove(1);
        prog.tasks[0].binding_count = 1;
        assert!(matches!(
            prog.validate(),
            Err(ProgramError::DomainNotBound { .. })
        ));
    }

    #[test]
    fn register_out_of_range_is_rejected() {
        let mut prog = two_register_program();
        prog.code[0].src[0] = 9;
        assert!(matches!(
            prog.validate(),
            Err(ProgramError::RegisterOutOfRange { register: 9, .. })
        ));
    }

    #[test]
    fn opcode_round_trip() {
        for raw in 0..128u16 {
            if let Some(op) = OpCode::from_u16(raw) {
                assert_eq!(op as u16, raw);
                assert!(!op.name().is_empty());
            }
        }
        assert!(OpCode::from_u16(9999).is_none());
    }
}
