//! Command-line front end: learns an NCA distance from a delimited text file
//! and writes the transformation matrix.

use clap::{Parser, ValueHint};
use nca::io::{read_labels, read_matrix, write_matrix};
use nca::labels::{labels_from_last_row, normalize_labels};
use nca::{learn_distance, Configuration, OptimizerKind};
use std::error::Error;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

type Result<T> = std::result::Result<T, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Learn a Mahalanobis distance with Neighborhood Components Analysis"
)]
struct Cli {
    /// Input dataset, one point per line; labels in the last column unless --labels is given
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Labels for the input dataset, one integer per point
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    labels: Option<PathBuf>,

    /// Where to write the learned transformation matrix
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Optimizer to use: 'sgd' or 'lbfgs'
    #[arg(short = 'O', long, default_value = "sgd")]
    optimizer: String,

    /// Maximum number of iterations, 0 for no limit
    #[arg(short = 'n', long)]
    max_iterations: Option<usize>,

    /// Termination tolerance
    #[arg(short, long)]
    tolerance: Option<f64>,

    /// Step size for SGD
    #[arg(short = 'a', long)]
    step_size: Option<f64>,

    /// Batch size for SGD
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Visit SGD batches in order instead of shuffling
    #[arg(short = 'L', long)]
    linear_scan: bool,

    /// Number of memory points for L-BFGS
    #[arg(short = 'B', long)]
    num_basis: Option<usize>,

    /// Armijo constant for the L-BFGS line search
    #[arg(short = 'A', long)]
    armijo_constant: Option<f64>,

    /// Wolfe condition parameter for the L-BFGS line search
    #[arg(short, long)]
    wolfe: Option<f64>,

    /// Maximum number of line search trials for L-BFGS
    #[arg(short = 'T', long)]
    max_line_search_trials: Option<usize>,

    /// Minimum line search step for L-BFGS
    #[arg(short, long)]
    min_step: Option<f64>,

    /// Maximum line search step for L-BFGS
    #[arg(short = 'M', long)]
    max_step: Option<f64>,

    /// Start from a diagonal of inverse feature ranges instead of the identity
    #[arg(short = 'N', long)]
    normalize: bool,

    /// Random seed for batch shuffling; 0 or absent uses the current time
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Log progress at debug level
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Options given on the command line that the selected optimizer does not
    /// read.
    fn ignored_parameters(&self, optimizer: OptimizerKind) -> Vec<&'static str> {
        let candidates: Vec<(&'static str, bool)> = match optimizer {
            OptimizerKind::Sgd => vec![
                ("num_basis", self.num_basis.is_some()),
                ("armijo_constant", self.armijo_constant.is_some()),
                ("wolfe", self.wolfe.is_some()),
                ("max_line_search_trials", self.max_line_search_trials.is_some()),
                ("min_step", self.min_step.is_some()),
                ("max_step", self.max_step.is_some()),
            ],
            OptimizerKind::Lbfgs => vec![
                ("step_size", self.step_size.is_some()),
                ("linear_scan", self.linear_scan),
                ("batch_size", self.batch_size.is_some()),
            ],
            _ => Vec::new(),
        };

        candidates
            .into_iter()
            .filter_map(|(name, given)| given.then_some(name))
            .collect()
    }

    fn configuration(&self, optimizer: OptimizerKind) -> Configuration {
        let defaults = Configuration::default();
        Configuration {
            optimizer,
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            tolerance: self.tolerance.unwrap_or(defaults.tolerance),
            step_size: self.step_size.unwrap_or(defaults.step_size),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            linear_scan: self.linear_scan,
            num_basis: self.num_basis.unwrap_or(defaults.num_basis),
            armijo_constant: self.armijo_constant.unwrap_or(defaults.armijo_constant),
            wolfe: self.wolfe.unwrap_or(defaults.wolfe),
            max_line_search_trials: self
                .max_line_search_trials
                .unwrap_or(defaults.max_line_search_trials),
            min_step: self.min_step.unwrap_or(defaults.min_step),
            max_step: self.max_step.unwrap_or(defaults.max_step),
            normalize: self.normalize,
            seed: (self.seed != 0).then_some(self.seed),
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let optimizer: OptimizerKind = cli.optimizer.parse()?;
    for name in cli.ignored_parameters(optimizer) {
        warn!("'{name}' ignored because optimizer type is not '{optimizer}'");
    }
    if cli.output.is_none() {
        warn!("No output file given; the learned distance will not be saved");
    }

    let input = read_matrix(&cli.input)?;
    let (data, raw_labels) = match &cli.labels {
        Some(path) => (input, read_labels(path)?),
        None => labels_from_last_row(input.view())?,
    };
    let labels = normalize_labels(&raw_labels);
    info!(
        "Loaded {} points with {} features in {} classes",
        data.ncols(),
        data.nrows(),
        labels.num_classes()
    );

    let config = cli.configuration(optimizer);
    let transformation = learn_distance(data.view(), labels.labels.view(), &config)?;

    if let Some(path) = &cli.output {
        write_matrix(path, transformation.view())?;
        info!("Wrote transformation to {}", path.display());
    }
    Ok(())
}
