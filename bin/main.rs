use clap::{Parser, Subcommand};

use fjss_ccgp::ccgp::{normalized_makespan, Ccgp, Config};
use fjss_ccgp::heuristics::{RoutingRule, SequencingRule};
use fjss_ccgp::problem::{BoundsSource, ProblemSet};
use fjss_ccgp::simulation::Simulation;

#[derive(Debug, clap::Parser)]
#[command(long_about = None)]
struct Args {
    /// Directory holding the instance files and their instances.json catalogue
    #[arg(long, default_value_t = String::from("./data"))]
    instances: String,
    /// Path prefix selecting the instances to use
    #[arg(long, default_value_t = String::from(""))]
    prefix: String,
    /// Lower-bound source: catalogue (instances.json) or env
    /// (the FJSS_LOWER_BOUNDS JSON map)
    #[arg(long, default_value_t = String::from("catalogue"))]
    bounds: String,
    /// Number of parallel workers
    #[arg(long, default_value_t = std::thread::available_parallelism().unwrap().get())]
    concurrency: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evolve routing and sequencing rules by cooperative coevolution
    Evolve {
        /// Number of generations to run
        #[arg(long, default_value_t = 51)]
        generations: usize,
        /// Target size of each population
        #[arg(long, default_value_t = 512)]
        pop_size: usize,
        /// Maximum expression-tree height
        #[arg(long, default_value_t = 8)]
        max_depth: usize,
        /// Seed to initialize the pseudo-random number generators
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Evaluate a fixed pair of dispatching heuristics
    Heuristics {
        /// Routing rule: lwq, lqs, ert or sbt
        #[arg(long, default_value_t = String::from("lwq"))]
        routing: String,
        /// Sequencing rule: fifo or spt
        #[arg(long, default_value_t = String::from("spt"))]
        sequencing: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    rayon::ThreadPoolBuilder::new()
        .num_threads(args.concurrency)
        .build_global()?;

    let bounds = BoundsSource::from(&args.bounds)?;
    log::info!(
        "loading instances from {} (prefix {:?}, bounds {})",
        args.instances,
        args.prefix,
        bounds
    );
    let problem_set = ProblemSet::load(&args.instances, &args.prefix, bounds)?;
    log::info!("loaded {} instances", problem_set.problems.len());

    match &args.command {
        Command::Evolve {
            generations,
            pop_size,
            max_depth,
            seed,
        } => {
            let mut ccgp = Ccgp::new(Config {
                pop_size: *pop_size,
                max_depth: *max_depth,
                seed: *seed,
                ..Config::default()
            })?;
            let problems = &problem_set.problems;
            for (generation, (routing, sequencing)) in
                ccgp.run(problems).take(*generations).enumerate()
            {
                println!(
                    "{} {}",
                    generation + 1,
                    normalized_makespan(&routing, &sequencing, problems)
                );
                println!("{}", routing);
                println!("{}", sequencing);
            }
        }
        Command::Heuristics { routing, sequencing } => {
            let routing = RoutingRule::from(routing)?;
            let sequencing = SequencingRule::from(sequencing)?;
            log::info!("evaluating routing {} with sequencing {}", routing, sequencing);
            let mut total = 0.0;
            for problem in &problem_set.problems {
                let total_time =
                    Simulation::new(problem, routing.clone(), sequencing.clone()).simulate();
                let lower_bound = problem.lower_bound.unwrap_or(f64::NAN);
                let normalized = total_time / lower_bound;
                println!(
                    "{} {} {} {}",
                    problem.name, lower_bound, total_time, normalized
                );
                total += normalized;
            }
            println!("{}", total / problem_set.problems.len() as f64);
        }
    }

    Ok(())
}
