use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use arena_attention::reference::ExactAttention;
use arena_attention::{
    add_attention_node, register, AttentionInput, AttentionInputs, OperatorConfig, OP_NAME,
};
use arena_runtime::{Interpreter, Model, ModelBuilder, OpResolver};
use candle_core::{Device, Tensor};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DEFAULT_ARENA_BYTES: usize = 300_000;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs a multi-head attention graph inside a fixed-size arena",
    long_about = None
)]
struct Args {
    #[arg(long, default_value_t = 2, help = "Number of attention heads")]
    heads: usize,

    #[arg(long, default_value_t = 4, help = "Per-head projection width")]
    key_dim: usize,

    #[arg(long, default_value_t = 8, help = "Feature width of the input sequence")]
    features: usize,

    #[arg(long, default_value_t = 4, help = "Number of positions in the input sequence")]
    seq_len: usize,

    #[arg(
        long,
        env = "ATTENTION_ARENA_BYTES",
        default_value_t = DEFAULT_ARENA_BYTES,
        help = "Arena capacity in bytes"
    )]
    arena_bytes: usize,

    #[arg(long, default_value_t = 0, help = "Seed for the generated weights")]
    seed: u64,

    #[arg(
        long,
        default_value_t = 0.05,
        help = "Generated weights are drawn uniformly from [-scale, scale)"
    )]
    weight_scale: f32,

    #[arg(
        long,
        value_name = "PATH",
        help = "Load a JSON model instead of generating one"
    )]
    model: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Write the model as JSON")]
    dump_model: Option<PathBuf>,

    #[arg(long, help = "Compare the output against the Candle reference")]
    verify: bool,

    #[arg(long, help = "Print the arena allocation report")]
    print_allocations: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("attention demo failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let model = match &args.model {
        Some(path) => Model::from_path(path)
            .with_context(|| format!("failed to load model from {}", path.display()))?,
        None => generate_model(&args)?,
    };
    if let Some(path) = &args.dump_model {
        model
            .save(path)
            .with_context(|| format!("failed to write model to {}", path.display()))?;
    }

    let mut resolver = OpResolver::with_capacity(1);
    register(&mut resolver)?;

    let mut interpreter = Interpreter::new(model.clone(), &resolver, args.arena_bytes)?;
    interpreter
        .allocate_tensors()
        .context("failed to allocate tensors")?;
    if args.print_allocations {
        print!("{}", interpreter.allocation_report());
    }

    let mut graph_inputs = Vec::with_capacity(interpreter.input_count());
    for index in 0..interpreter.input_count() {
        let dims = interpreter.input_dims(index)?.to_vec();
        let ramp: Vec<f32> = (0..dims.iter().product::<usize>())
            .map(|i| i as f32)
            .collect();
        interpreter.input_mut(index)?.copy_from_slice(&ramp);
        graph_inputs.push(Tensor::from_vec(ramp, dims, &Device::Cpu)?);
    }

    interpreter.invoke().context("invoke failed")?;
    for value in interpreter.output(0)? {
        println!("{value}");
    }

    if args.verify {
        let output = interpreter.output_tensor(0)?;
        let (config, tensors) = reference_inputs(&model, &graph_inputs)?;
        let expected = ExactAttention::new(config).attend(&tensors)?;
        let diff = (&output - &expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        println!("max abs diff vs candle reference: {diff:e}");
        if diff.is_nan() || diff > 1e-3 {
            bail!("output deviates from the reference by {diff}");
        }
    }
    Ok(())
}

/// Self-attention graph: the single input feeds both query and value.
fn generate_model(args: &Args) -> Result<Model> {
    if !(args.weight_scale > 0.0) {
        bail!("--weight-scale must be positive, got {}", args.weight_scale);
    }
    let config = OperatorConfig::new(args.heads, args.key_dim);
    let (h, k, f) = (args.heads, args.key_dim, args.features);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let scale = args.weight_scale;
    let mut weights = |dims: &[usize]| -> Vec<f32> {
        let len = dims.iter().product::<usize>();
        (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
    };

    let mut builder = ModelBuilder::new();
    let input = builder.add_tensor("input", &[args.seq_len, f]);
    let mut constant = |builder: &mut ModelBuilder, name: &str, dims: &[usize]| {
        let data = weights(dims);
        builder.add_constant(name, dims, data)
    };
    let ids = AttentionInputs {
        query: input,
        value: input,
        query_kernel: constant(&mut builder, "query_kernel", &[f, h, k])?,
        query_bias: constant(&mut builder, "query_bias", &[h, k])?,
        key_kernel: constant(&mut builder, "key_kernel", &[f, h, k])?,
        key_bias: constant(&mut builder, "key_bias", &[h, k])?,
        value_kernel: constant(&mut builder, "value_kernel", &[f, h, k])?,
        value_bias: constant(&mut builder, "value_bias", &[h, k])?,
        output_kernel: constant(&mut builder, "output_kernel", &[h, k, f])?,
        output_bias: constant(&mut builder, "output_bias", &[f])?,
    };
    let output = builder.add_tensor("attention_output", &[args.seq_len, f]);
    add_attention_node(&mut builder, &config, &ids, output)?;
    builder.mark_input(input).mark_output(output);
    Ok(builder.build()?)
}

/// Rebuilds the first attention node's inputs as Candle tensors.
fn reference_inputs(
    model: &Model,
    graph_inputs: &[Tensor],
) -> Result<(OperatorConfig, AttentionInputs<Tensor>)> {
    let node = model
        .nodes
        .iter()
        .find(|node| node.op == OP_NAME)
        .ok_or_else(|| anyhow!("model has no {OP_NAME} node"))?;
    let config = OperatorConfig::decode(&node.options)?;
    let tensors = AttentionInputs::try_from_fn(|input: AttentionInput| -> Result<Tensor> {
        let id = *node
            .inputs
            .get(input.index())
            .ok_or_else(|| anyhow!("node is missing input {input}"))?;
        let spec = &model.tensors[id];
        match &spec.data {
            Some(data) => Ok(Tensor::from_vec(data.clone(), spec.shape.as_slice(), &Device::Cpu)?),
            None => {
                let position = model
                    .inputs
                    .iter()
                    .position(|&graph_input| graph_input == id)
                    .ok_or_else(|| anyhow!("{input} is neither constant nor a graph input"))?;
                Ok(graph_inputs[position].clone())
            }
        }
    })?;
    Ok((config, tensors))
}
