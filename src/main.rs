//! Command-line front end: builds the models from flags or JSON
//! descriptors, runs them on random data and samples layer configs.

use clap::{Args, Parser, Subcommand};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use smashnet::config::{load_json, LayerConfig, WideResNetConfig};
use smashnet::models::WideResNetMos;
use smashnet::nn::Module;
use smashnet::runtime::session::{Feeds, Session};
use smashnet::smash::{sample_layer_config, GatedLayer, SearchSpace};
use smashnet::tensor::{GraphContext, Tensor};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Wide ResNets with a mixture-of-softmaxes head and SMASH layers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a network and report its size.
    Summary(NetworkArgs),
    /// Run one forward pass of a network on random images.
    Forward {
        #[command(flatten)]
        network: NetworkArgs,
        #[arg(long, default_value_t = 2)]
        batch: usize,
        /// Image height and width.
        #[arg(long, default_value_t = 32)]
        size: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Normalize with running statistics instead of batch statistics.
        #[arg(long)]
        eval: bool,
        /// Write the forward graph as JSON.
        #[arg(long)]
        dump_graph: Option<PathBuf>,
    },
    /// Build a gated layer from a JSON descriptor and run it on random data.
    Layer {
        config: PathBuf,
        #[arg(long, default_value_t = 8)]
        size: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Sample a valid layer descriptor and print it as JSON.
    Sample {
        #[arg(long, default_value_t = 16)]
        n_in: usize,
        #[arg(long, default_value_t = 32)]
        n_out: usize,
        /// JSON search space; overrides the widths above.
        #[arg(long)]
        space: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Args, Debug)]
struct NetworkArgs {
    /// JSON network descriptor; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    depth: Option<usize>,
    #[arg(long)]
    widen_factor: Option<usize>,
    #[arg(long)]
    num_classes: Option<usize>,
    #[arg(long)]
    n_components: Option<usize>,
    #[arg(long)]
    drop_rate: Option<f32>,
}

impl NetworkArgs {
    fn resolve(&self) -> smashnet::Result<WideResNetConfig> {
        let mut config = match &self.config {
            Some(path) => load_json(path)?,
            None => WideResNetConfig::default(),
        };
        if let Some(depth) = self.depth {
            config.depth = depth;
        }
        if let Some(widen_factor) = self.widen_factor {
            config.widen_factor = widen_factor;
        }
        if let Some(num_classes) = self.num_classes {
            config.num_classes = num_classes;
        }
        if let Some(n_components) = self.n_components {
            config.n_components = n_components;
        }
        if let Some(drop_rate) = self.drop_rate {
            config.drop_rate = drop_rate;
        }
        Ok(config)
    }
}

fn random_images(rng: &mut StdRng, shape: &[usize]) -> ArrayD<f32> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0f32, 1.0), rng)
}

fn summary(args: &NetworkArgs) -> smashnet::Result<()> {
    let config = args.resolve()?;
    let ctx = GraphContext::shared(Default::default());
    let net = WideResNetMos::new(&ctx, config)?;
    let session = Session::new(&ctx, 0);
    info!(
        depth = net.config().depth,
        widen_factor = net.config().widen_factor,
        blocks = net.block_count(),
        parameters = session.params().num_trainable_elements(),
        tensors = net.parameters().len(),
        "network summary"
    );
    Ok(())
}

fn forward(
    args: &NetworkArgs,
    batch: usize,
    size: usize,
    seed: u64,
    eval: bool,
    dump_graph: Option<&PathBuf>,
) -> smashnet::Result<()> {
    let config = args.resolve()?;
    let ctx = GraphContext::shared(Default::default());
    let mut net = WideResNetMos::new(&ctx, config)?;
    net.set_training(!eval);

    let images = Tensor::new_input(&ctx, "images");
    let out = net.forward_mixture(&images);

    if let Some(path) = dump_graph {
        std::fs::write(path, serde_json::to_string_pretty(ctx.borrow().main_graph())?)?;
        info!(path = %path.display(), nodes = ctx.borrow().main_graph().nodes.len(), "wrote graph");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let feeds = Feeds::from([("images".to_string(), random_images(&mut rng, &[batch, 3, size, size]))]);
    let mut session = Session::new(&ctx, seed);
    let values = session.run(&feeds, &[&out.log_probs, &out.priors])?;
    let (log_probs, priors) = (&values[0], &values[1]);

    for (row, (lp, pr)) in log_probs.outer_iter().zip(priors.outer_iter()).enumerate() {
        let mass: f32 = lp.iter().map(|v| v.exp()).sum();
        info!(row, probability_mass = mass, prior_mass = pr.sum(), "forward");
    }
    Ok(())
}

fn layer(path: &PathBuf, size: usize, seed: u64) -> smashnet::Result<()> {
    let config: LayerConfig = load_json(path)?;
    let n_in = config.n_in;
    let ctx = GraphContext::shared(Default::default());
    let layer = GatedLayer::new(&ctx, "layer", config)?;

    let x = Tensor::new_input(&ctx, "x");
    let y = layer.forward(&x);
    let mut session = Session::new(&ctx, seed);
    let shapes = session.infer_shapes(&HashMap::from([("x".to_string(), vec![1, n_in, size, size])]), &[&y])?;

    let mut rng = StdRng::seed_from_u64(seed);
    let feeds = Feeds::from([("x".to_string(), random_images(&mut rng, &[1, n_in, size, size]))]);
    let values = session.run(&feeds, &[&y])?;
    info!(
        plan = ?layer.plan(),
        out_channels = layer.out_channels(),
        inferred = ?shapes[0],
        computed = ?values[0].shape(),
        "layer"
    );
    Ok(())
}

fn sample(n_in: usize, n_out: usize, space: Option<&PathBuf>, seed: u64) -> smashnet::Result<()> {
    let space = match space {
        Some(path) => load_json(path)?,
        None => SearchSpace::new(n_in, n_out),
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let config = sample_layer_config(&mut rng, &space)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Summary(args) => summary(args)?,
        Command::Forward {
            network,
            batch,
            size,
            seed,
            eval,
            dump_graph,
        } => forward(network, *batch, *size, *seed, *eval, dump_graph.as_ref())?,
        Command::Layer { config, size, seed } => layer(config, *size, *seed)?,
        Command::Sample {
            n_in,
            n_out,
            space,
            seed,
        } => sample(*n_in, *n_out, space.as_ref(), *seed)?,
    }
    Ok(())
}
