//! End-to-end frame execution against the engine.

use dataloom::buffer::{DType, TensorInfo};
use dataloom::{
    EngineStatus, Instruction, OpCode, PipelineDesc, PipelineKernel, PipelineResource,
    ResourceFlags, Strategy, SymbolFlags, TensorFlags,
};

#[path = "util.rs"]
mod util;

use util::{init_logging, read_resource, test_engine, write_resource, ProgramBuilder};

/// A constant scalar copied over a small linear domain.
#[test]
fn constant_fills_output() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let value = builder.constant_scalar(3.0);
    let out = builder.output("out", &[4]);
    builder.task(
        Strategy::Linear,
        out,
        vec![Instruction::unary(OpCode::Copy, out, value)],
        &[value, out],
    );
    let program = builder.finish();

    let mut engine = test_engine(2);
    engine.bind_cartridge(vec![program], &["fill"]).unwrap();
    engine.dispatch();

    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(read_resource(&mut engine, "out"), vec![3.0; 4]);
}

/// Pointwise add over a two-dimensional domain with a scalar broadcast.
#[test]
fn pointwise_add_with_broadcast() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let table = builder.constant_tensor(&[2, 3], &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    let ten = builder.constant_scalar(10.0);
    let out = builder.output("out", &[2, 3]);
    builder.task(
        Strategy::Linear,
        out,
        vec![Instruction::binary(OpCode::Add, out, table, ten)],
        &[table, ten, out],
    );
    let program = builder.finish();

    let mut engine = test_engine(2);
    engine.bind_cartridge(vec![program], &["add"]).unwrap();
    engine.dispatch();

    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(
        read_resource(&mut engine, "out"),
        vec![11.0, 12.0, 13.0, 11.0, 12.0, 13.0],
    );
}

/// Batched matmul: [2,3,4] x [2,4,5] -> [2,3,5] over a 2-element domain.
#[test]
fn batched_matmul() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let a = builder.input("a", &[2, 3, 4]);
    let b = builder.input("b", &[2, 4, 5]);
    let out = builder.output("out", &[2, 3, 5]);
    let domain = builder.register(
        TensorInfo::contiguous(DType::F32, &[2]),
        TensorFlags::empty(),
    );
    builder.task(
        Strategy::Linear,
        domain,
        vec![Instruction::binary(OpCode::MatMul, out, a, b)],
        &[a, b, out, domain],
    );
    let program = builder.finish();

    let mut engine = test_engine(2);
    engine.bind_cartridge(vec![program], &["matmul"]).unwrap();

    let lhs: Vec<f32> = (0..24).map(|v| v as f32).collect();
    let rhs: Vec<f32> = (0..40).map(|v| (v % 7) as f32).collect();
    write_resource(&mut engine, "a", &lhs);
    write_resource(&mut engine, "b", &rhs);

    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);

    // Reference row-major matmul per batch.
    let mut expected = vec![0.0f32; 30];
    for batch in 0..2 {
        for r in 0..3 {
            for c in 0..5 {
                let mut acc = 0.0;
                for k in 0..4 {
                    acc += lhs[batch * 12 + r * 4 + k] * rhs[batch * 20 + k * 5 + c];
                }
                expected[batch * 15 + r * 5 + c] = acc;
            }
        }
    }
    assert_eq!(read_resource(&mut engine, "out"), expected);
}

/// Reduction sum of 1..=1024, which is exact in F32, across pool sizes.
#[test]
fn reduction_sum_across_thread_counts() {
    init_logging();
    for &threads in &[1usize, 2, 4, 8] {
        let mut builder = ProgramBuilder::new();
        let values = builder.input("values", &[1024]);
        let total = builder.register(TensorInfo::scalar(DType::F32), TensorFlags::REDUCTION);
        builder.symbol("total", total, SymbolFlags::OUTPUT);
        builder.task(
            Strategy::Reduction,
            values,
            vec![Instruction::unary(OpCode::Sum, total, values)],
            &[values, total],
        );
        let program = builder.finish();

        let mut engine = test_engine(threads);
        engine.bind_cartridge(vec![program], &["sum"]).unwrap();

        let input: Vec<f32> = (1..=1024).map(|v| v as f32).collect();
        write_resource(&mut engine, "values", &input);

        engine.dispatch();
        assert_eq!(engine.status(), EngineStatus::Ok);
        assert_eq!(
            read_resource(&mut engine, "total"),
            vec![524800.0],
            "threads = {}",
            threads,
        );
    }
}

/// Prefix scan over 4097 ones, forcing the two-pass multi-job protocol.
#[test]
fn prefix_scan_spans_jobs() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let ones = builder.input("ones", &[4097]);
    let scan = builder.output("scan", &[4097]);
    builder.task(
        Strategy::TwoPassSync,
        scan,
        vec![Instruction::unary(OpCode::CumSum, scan, ones)],
        &[ones, scan],
    );
    let mut program = builder.finish();
    // No baked sync slots: the dispatcher must fall back to a transient
    // chunk-total buffer.
    program.meta.sync_scratch_size = 0;

    let mut engine = test_engine(4);
    engine.bind_cartridge(vec![program], &["scan"]).unwrap();
    write_resource(&mut engine, "ones", &vec![1.0; 4097]);

    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);

    let out = read_resource(&mut engine, "scan");
    assert_eq!(out[0], 1.0);
    assert_eq!(out[4095], 4096.0);
    assert_eq!(out[4096], 4097.0);
    for (idx, value) in out.iter().enumerate().step_by(997) {
        assert_eq!(*value, (idx + 1) as f32);
    }
}

/// A scan that fits one job takes the serial fallback and still agrees.
#[test]
fn prefix_scan_single_job() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let ones = builder.input("ones", &[4096]);
    let scan = builder.output("scan", &[4096]);
    builder.task(
        Strategy::TwoPassSync,
        scan,
        vec![Instruction::unary(OpCode::CumSum, scan, ones)],
        &[ones, scan],
    );
    let program = builder.finish();

    let mut engine = test_engine(4);
    engine.bind_cartridge(vec![program], &["scan"]).unwrap();
    write_resource(&mut engine, "ones", &vec![1.0; 4096]);

    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);
    let out = read_resource(&mut engine, "scan");
    assert_eq!(out[0], 1.0);
    assert_eq!(out[4095], 4096.0);
}

/// Double-buffer ping-pong: values written in frame N are read in frame N+1
/// without stale-read artifacts after the source changes.
#[test]
fn double_buffer_ping_pong() {
    init_logging();
    let mut producer = ProgramBuilder::new();
    let src = producer.input("src", &[4]);
    let stage = producer.output("stage", &[4]);
    producer.task(
        Strategy::Linear,
        stage,
        vec![Instruction::unary(OpCode::Copy, stage, src)],
        &[src, stage],
    );
    let producer = producer.finish();

    let mut consumer = ProgramBuilder::new();
    let stage_in = consumer.input("stage", &[4]);
    let accum = consumer.register(
        TensorInfo::contiguous(DType::F32, &[4]),
        TensorFlags::INPUT | TensorFlags::OUTPUT,
    );
    consumer.symbol("accum", accum, SymbolFlags::INPUT | SymbolFlags::OUTPUT);
    consumer.task(
        Strategy::Linear,
        accum,
        vec![Instruction::unary(OpCode::Copy, accum, stage_in)],
        &[stage_in, accum],
    );
    let consumer = consumer.finish();

    let mut engine = test_engine(2);
    engine
        .bind_cartridge(vec![producer, consumer], &["producer", "consumer"])
        .unwrap();

    write_resource(&mut engine, "src", &[5.0, 6.0, 7.0, 8.0]);
    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(read_resource(&mut engine, "accum"), vec![5.0, 6.0, 7.0, 8.0]);

    // Change the source and run another frame: the consumer must observe
    // the new values, not a stale back buffer.
    write_resource(&mut engine, "src", &[1.0, 1.0, 2.0, 2.0]);
    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(read_resource(&mut engine, "accum"), vec![1.0, 1.0, 2.0, 2.0]);
}

/// One-element domains run inline; multi-job domains cross the pool. Both
/// must agree with the serial result.
#[test]
fn domain_size_boundaries() {
    init_logging();
    for &elements in &[1i32, 1024, 1025, 8192] {
        let mut builder = ProgramBuilder::new();
        let input = builder.input("input", &[elements]);
        let out = builder.output("out", &[elements]);
        let one = builder.constant_scalar(1.0);
        builder.task(
            Strategy::Linear,
            out,
            vec![Instruction::binary(OpCode::Add, out, input, one)],
            &[input, out, one],
        );
        let program = builder.finish();

        let mut engine = test_engine(4);
        engine.bind_cartridge(vec![program], &["incr"]).unwrap();

        let values: Vec<f32> = (0..elements).map(|v| v as f32).collect();
        write_resource(&mut engine, "input", &values);
        engine.dispatch();

        assert_eq!(engine.status(), EngineStatus::Ok, "elements = {}", elements);
        let out = read_resource(&mut engine, "out");
        assert_eq!(out.len(), elements as usize);
        assert!(out.iter().enumerate().all(|(idx, v)| *v == idx as f32 + 1.0));
    }
}

/// Gather with out-of-range indices zero-fills, reports, and trips the
/// engine kill switch; later dispatches are no-ops.
#[test]
fn gather_out_of_bounds_halts_the_engine() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let data = builder.input("data", &[4]);
    let indices = builder.input("indices", &[3]);
    let out = builder.output("out", &[3]);
    builder.task(
        Strategy::Linear,
        out,
        vec![Instruction::binary(OpCode::Gather, out, data, indices)],
        &[data, indices, out],
    );
    let program = builder.finish();

    let mut engine = test_engine(1);
    engine.bind_cartridge(vec![program], &["gather"]).unwrap();
    write_resource(&mut engine, "data", &[10.0, 20.0, 30.0, 40.0]);
    write_resource(&mut engine, "indices", &[-1.0, 4.0, 3.0]);

    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Runtime);
    assert_eq!(read_resource(&mut engine, "out"), vec![0.0, 0.0, 40.0]);

    let frame = engine.frame_index();
    engine.dispatch();
    assert_eq!(engine.frame_index(), frame, "errored engine must not run");

    // A reset clears the error and the pipeline.
    engine.reset();
    assert_eq!(engine.status(), EngineStatus::Ok);
}

/// Index generation across a 2-d domain, through the engine.
#[test]
fn system_indices() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let xs = builder.output("xs", &[2, 3]);
    let ys = builder.output("ys", &[2, 3]);
    builder.task(
        Strategy::Linear,
        xs,
        vec![
            Instruction::nullary(OpCode::IndexX, xs),
            Instruction::nullary(OpCode::IndexY, ys),
        ],
        &[xs, ys],
    );
    let program = builder.finish();

    let mut engine = test_engine(2);
    engine.bind_cartridge(vec![program], &["indices"]).unwrap();
    engine.dispatch();

    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(
        read_resource(&mut engine, "xs"),
        vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
    );
    assert_eq!(
        read_resource(&mut engine, "ys"),
        vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0],
    );
}

/// Explicit pipeline bindings override the match-by-name rule.
#[test]
fn pipeline_port_bindings() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let input = builder.input("in_Value", &[8]);
    let output = builder.output("out_Value", &[8]);
    builder.task(
        Strategy::Linear,
        output,
        vec![Instruction::unary(OpCode::Copy, output, input)],
        &[input, output],
    );
    let program = builder.finish();

    let pipe = PipelineDesc {
        resources: vec![
            PipelineResource::new("alpha", DType::F32, &[8], ResourceFlags::INPUT),
            PipelineResource::new("beta", DType::F32, &[8], ResourceFlags::OUTPUT),
        ],
        kernels: vec![PipelineKernel::new("copy")
            .bind("in_Value", "alpha")
            .bind("out_Value", "beta")],
    };

    let mut engine = test_engine(2);
    engine.bind_pipeline(&pipe, vec![program]).unwrap();

    write_resource(&mut engine, "alpha", &[9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0]);
    engine.dispatch();

    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(
        read_resource(&mut engine, "beta"),
        vec![9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0],
    );
}

/// An aliased register has no static shape; it follows whatever descriptor
/// the bound resource carries at dispatch time, including after a resize.
#[test]
fn aliased_register_follows_resized_resource() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let blob = builder.register(
        TensorInfo::contiguous(DType::F32, &[-1]),
        TensorFlags::INPUT | TensorFlags::ALIAS,
    );
    builder.symbol("blob", blob, SymbolFlags::INPUT);
    let out = builder.output("out", &[8]);
    builder.task(
        Strategy::Linear,
        out,
        vec![Instruction::unary(OpCode::Copy, out, blob)],
        &[blob, out],
    );
    let program = builder.finish();

    let mut engine = test_engine(2);
    engine.bind_cartridge(vec![program], &["alias"]).unwrap();

    // The placeholder descriptor allocated a single element; the host
    // supplies the real extent before the first frame.
    assert!(engine.resize_resource("blob", &[8]));
    write_resource(&mut engine, "blob", &[4.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0]);

    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(
        read_resource(&mut engine, "out"),
        vec![4.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0],
    );
}

/// Vector fan-out: per-row dot products over a [4,3] operand pair.
#[test]
fn dot_product_rows() {
    init_logging();
    let mut builder = ProgramBuilder::new();
    let a = builder.input("a", &[4, 3]);
    let b = builder.input("b", &[4, 3]);
    let out = builder.output("out", &[4]);
    builder.task(
        Strategy::Linear,
        out,
        vec![Instruction::binary(OpCode::Dot, out, a, b)],
        &[a, b, out],
    );
    let program = builder.finish();

    let mut engine = test_engine(2);
    engine.bind_cartridge(vec![program], &["dot"]).unwrap();

    let lhs: Vec<f32> = (1..=12).map(|v| v as f32).collect();
    let rhs = vec![1.0f32; 12];
    write_resource(&mut engine, "a", &lhs);
    write_resource(&mut engine, "b", &rhs);

    engine.dispatch();
    assert_eq!(engine.status(), EngineStatus::Ok);
    assert_eq!(read_resource(&mut engine, "out"), vec![6.0, 15.0, 24.0, 33.0]);
}
