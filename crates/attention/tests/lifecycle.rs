use anyhow::Result;
use arena_attention::reference::ExactAttention;
use arena_attention::{
    add_attention_node, register, AttentionError, AttentionInputs, MultiHeadAttention,
    OperatorConfig, OperatorState, OP_NAME,
};
use arena_runtime::{
    AllocationKind, Interpreter, Model, ModelBuilder, NodeStage, OpResolver, RuntimeError,
};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use static_assertions::assert_impl_all;

assert_impl_all!(MultiHeadAttention: Send, Sync, Copy);
assert_impl_all!(OperatorState: Send, Sync);
assert_impl_all!(AttentionError: std::error::Error, Send, Sync);

const ARENA_BYTES: usize = 300_000;

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> Result<Tensor> {
    let len = dims.iter().product::<usize>();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
    Ok(Tensor::from_vec(data, dims, &Device::Cpu)?)
}

fn random_inputs(
    seed: u64,
    config: &OperatorConfig,
    query_dims: &[usize],
    value_dims: &[usize],
) -> Result<AttentionInputs<Tensor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let qf = *query_dims.last().unwrap_or(&0);
    let vf = *value_dims.last().unwrap_or(&0);
    let (h, k) = (config.num_heads, config.key_dim);
    Ok(AttentionInputs {
        query: random_tensor(&mut rng, query_dims)?,
        value: random_tensor(&mut rng, value_dims)?,
        query_kernel: random_tensor(&mut rng, &[qf, h, k])?,
        query_bias: random_tensor(&mut rng, &[h, k])?,
        key_kernel: random_tensor(&mut rng, &[vf, h, k])?,
        key_bias: random_tensor(&mut rng, &[h, k])?,
        value_kernel: random_tensor(&mut rng, &[vf, h, k])?,
        value_bias: random_tensor(&mut rng, &[h, k])?,
        output_kernel: random_tensor(&mut rng, &[h, k, qf])?,
        output_bias: random_tensor(&mut rng, &[qf])?,
    })
}

/// Graph inputs are `query` then `value` (unless `self_attention`), output is
/// the attention result.
fn build_model(
    config: &OperatorConfig,
    tensors: &AttentionInputs<Tensor>,
    self_attention: bool,
) -> Result<Model> {
    let mut builder = ModelBuilder::new();
    let query = builder.add_tensor("query", tensors.query.dims());
    let value = if self_attention {
        query
    } else {
        builder.add_tensor("value", tensors.value.dims())
    };
    let ids = AttentionInputs {
        query,
        value,
        query_kernel: builder.add_constant_tensor("query_kernel", &tensors.query_kernel)?,
        query_bias: builder.add_constant_tensor("query_bias", &tensors.query_bias)?,
        key_kernel: builder.add_constant_tensor("key_kernel", &tensors.key_kernel)?,
        key_bias: builder.add_constant_tensor("key_bias", &tensors.key_bias)?,
        value_kernel: builder.add_constant_tensor("value_kernel", &tensors.value_kernel)?,
        value_bias: builder.add_constant_tensor("value_bias", &tensors.value_bias)?,
        output_kernel: builder.add_constant_tensor("output_kernel", &tensors.output_kernel)?,
        output_bias: builder.add_constant_tensor("output_bias", &tensors.output_bias)?,
    };
    let output = builder.add_tensor("attention_output", tensors.query.dims());
    add_attention_node(&mut builder, config, &ids, output)?;
    builder.mark_input(query);
    if !self_attention {
        builder.mark_input(value);
    }
    builder.mark_output(output);
    Ok(builder.build()?)
}

fn resolver() -> Result<OpResolver> {
    let mut resolver = OpResolver::with_capacity(1);
    register(&mut resolver)?;
    Ok(resolver)
}

fn run_model(model: Model, inputs: &[&Tensor]) -> Result<Tensor> {
    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    interpreter.allocate_tensors()?;
    for (index, tensor) in inputs.iter().enumerate() {
        interpreter.set_input_tensor(index, tensor)?;
    }
    interpreter.invoke()?;
    Ok(interpreter.output_tensor(0)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = (a - b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0.0f32, f32::max))
}

fn kernel_error(err: &RuntimeError) -> Option<&AttentionError> {
    match err {
        RuntimeError::Kernel { op, source, .. } if op == OP_NAME => {
            source.downcast_ref::<AttentionError>()
        }
        _ => None,
    }
}

#[test]
fn identity_weights_return_the_value() -> Result<()> {
    let device = Device::Cpu;
    let eye = Tensor::from_vec(vec![1f32, 0.0, 0.0, 1.0], (2, 1, 2), &device)?;
    let zeros = Tensor::zeros((1, 2), candle_core::DType::F32, &device)?;
    let tensors = AttentionInputs {
        query: Tensor::new(&[[1f32, 2.0]], &device)?,
        value: Tensor::new(&[[3f32, 4.0]], &device)?,
        query_kernel: eye.clone(),
        query_bias: zeros.clone(),
        key_kernel: eye.clone(),
        key_bias: zeros.clone(),
        value_kernel: eye,
        value_bias: zeros,
        output_kernel: Tensor::from_vec(vec![1f32, 0.0, 0.0, 1.0], (1, 2, 2), &device)?,
        output_bias: Tensor::zeros(2, candle_core::DType::F32, &device)?,
    };
    let config = OperatorConfig::new(1, 2);
    let model = build_model(&config, &tensors, false)?;
    let output = run_model(model, &[&tensors.query, &tensors.value])?;

    assert_eq!(output.dims(), &[1, 2]);
    assert!(max_abs_diff(&output, &tensors.value)? <= 1e-5);
    Ok(())
}

#[test]
fn matches_candle_reference_for_rank_three_inputs() -> Result<()> {
    let config = OperatorConfig::new(2, 3);
    let tensors = random_inputs(42, &config, &[2, 3, 4], &[2, 5, 6])?;
    let model = build_model(&config, &tensors, false)?;
    let output = run_model(model, &[&tensors.query, &tensors.value])?;

    let expected = ExactAttention::new(config).attend(&tensors)?;
    assert_eq!(output.dims(), &[2, 3, 4]);
    let diff = max_abs_diff(&output, &expected)?;
    assert!(diff <= 1e-4, "max diff {diff} exceeded tolerance");
    Ok(())
}

#[test]
fn self_attention_shares_one_graph_input() -> Result<()> {
    let config = OperatorConfig::new(3, 2);
    let mut tensors = random_inputs(7, &config, &[4, 6], &[4, 6])?;
    tensors.value = tensors.query.clone();
    let model = build_model(&config, &tensors, true)?;
    assert_eq!(model.inputs.len(), 1);
    let output = run_model(model, &[&tensors.query])?;

    let expected = ExactAttention::new(config).attend(&tensors)?;
    let diff = max_abs_diff(&output, &expected)?;
    assert!(diff <= 1e-4, "max diff {diff} exceeded tolerance");
    Ok(())
}

#[test]
fn single_value_position_ignores_query_content() -> Result<()> {
    let config = OperatorConfig::new(1, 4);
    let tensors = random_inputs(5, &config, &[3, 5], &[1, 6])?;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    interpreter.allocate_tensors()?;
    interpreter.set_input_tensor(1, &tensors.value)?;

    interpreter.set_input_tensor(0, &tensors.query)?;
    interpreter.invoke()?;
    let first = interpreter.output_tensor(0)?;

    let shifted = (tensors.query.affine(-2.0, 1.5))?;
    interpreter.set_input_tensor(0, &shifted)?;
    interpreter.invoke()?;
    let second = interpreter.output_tensor(0)?;

    assert!(max_abs_diff(&first, &second)? <= 1e-5);
    Ok(())
}

#[test]
fn repeated_invocations_are_bit_identical() -> Result<()> {
    let config = OperatorConfig::new(2, 4);
    let tensors = random_inputs(99, &config, &[5, 8], &[7, 3])?;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    interpreter.allocate_tensors()?;
    assert_eq!(interpreter.node_stage(0), Some(NodeStage::Ready));
    interpreter.set_input_tensor(0, &tensors.query)?;
    interpreter.set_input_tensor(1, &tensors.value)?;

    interpreter.invoke()?;
    let first: Vec<u32> = interpreter.output(0)?.iter().map(|x| x.to_bits()).collect();
    interpreter.invoke()?;
    let second: Vec<u32> = interpreter.output(0)?.iter().map(|x| x.to_bits()).collect();
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn scratch_reservation_is_recorded() -> Result<()> {
    let config = OperatorConfig::new(4, 3);
    let tensors = random_inputs(1, &config, &[2, 5], &[6, 5])?;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    interpreter.allocate_tensors()?;
    let report = interpreter.allocation_report();
    assert_eq!(report.count(AllocationKind::Scratch), 1);
    assert_eq!(
        report.total_bytes(AllocationKind::Scratch),
        (2 * 6 * 3 + 2 * 3) * 4
    );
    assert_eq!(report.count(AllocationKind::Persistent), 1);
    Ok(())
}

#[test]
fn mismatched_kernel_shape_fails_prepare() -> Result<()> {
    let config = OperatorConfig::new(2, 3);
    let mut tensors = random_inputs(3, &config, &[2, 4], &[3, 4])?;
    tensors.output_kernel = random_inputs(3, &config, &[2, 5], &[3, 4])?.output_kernel;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    let err = interpreter.allocate_tensors().unwrap_err();
    assert!(matches!(
        kernel_error(&err),
        Some(AttentionError::InvalidShape {
            tensor: "output_kernel",
            ..
        })
    ));
    assert_eq!(interpreter.node_stage(0), Some(NodeStage::Configured));
    assert!(interpreter.invoke().is_err());
    Ok(())
}

#[test]
fn early_shape_failure_releases_every_handle() -> Result<()> {
    let config = OperatorConfig::new(1, 2);
    let tensors = random_inputs(6, &config, &[4], &[3, 4])?;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    let err = interpreter.allocate_tensors().unwrap_err();
    assert!(!matches!(err, RuntimeError::TempTensorLeak { .. }));
    assert!(matches!(
        kernel_error(&err),
        Some(AttentionError::InvalidShape { tensor: "query", .. })
    ));
    Ok(())
}

#[test]
fn missing_input_releases_acquired_handles() -> Result<()> {
    let config = OperatorConfig::new(1, 2);
    let tensors = random_inputs(6, &config, &[2, 4], &[3, 4])?;
    let mut model = build_model(&config, &tensors, false)?;
    model.nodes[0].inputs.pop();

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    let err = interpreter.allocate_tensors().unwrap_err();
    assert!(!matches!(err, RuntimeError::TempTensorLeak { .. }));
    assert!(matches!(
        kernel_error(&err),
        Some(AttentionError::Runtime(RuntimeError::TensorIndex { index: 9, .. }))
    ));
    Ok(())
}

#[test]
fn zero_heads_fail_prepare() -> Result<()> {
    let tensors = random_inputs(8, &OperatorConfig::new(1, 2), &[2, 3], &[2, 3])?;
    let model = build_model(&OperatorConfig::new(0, 2), &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, ARENA_BYTES)?;
    let err = interpreter.allocate_tensors().unwrap_err();
    assert!(matches!(
        kernel_error(&err),
        Some(AttentionError::InvalidArgument {
            arg: "num_heads",
            ..
        })
    ));
    Ok(())
}

#[test]
fn undersized_arena_fails_scratch_reservation() -> Result<()> {
    let config = OperatorConfig::new(1, 2);
    let tensors = random_inputs(4, &config, &[1, 2], &[64, 2])?;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    // Room for the state record and activations, not the 1040-byte scratch.
    let mut interpreter = Interpreter::new(model, &resolver, 1024)?;
    let err = interpreter.allocate_tensors().unwrap_err();
    assert!(matches!(
        kernel_error(&err),
        Some(AttentionError::Runtime(RuntimeError::ArenaExhausted { .. }))
    ));
    Ok(())
}

#[test]
fn tiny_arena_fails_tensor_placement() -> Result<()> {
    let config = OperatorConfig::new(1, 2);
    let tensors = random_inputs(4, &config, &[8, 16], &[8, 16])?;
    let model = build_model(&config, &tensors, false)?;

    let resolver = resolver()?;
    let mut interpreter = Interpreter::new(model, &resolver, 256)?;
    assert!(matches!(
        interpreter.allocate_tensors(),
        Err(RuntimeError::ArenaExhausted { .. })
    ));
    Ok(())
}
