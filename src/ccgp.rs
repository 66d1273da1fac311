use rand::{distributions::Distribution, rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;

use crate::heuristics::{RoutingRule, SequencingRule};
use crate::problem::{Fjss, StaticFjss, Time};
use crate::program::{random_internal, random_terminal, Node, Program};
use crate::simulation::Simulation;

// breeding operator weights: crossover, mutation, reproduction
const BREEDING_WEIGHTS: [u32; 3] = [80, 15, 5];

/// Parameters of a coevolution run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target size of each population.
    pub pop_size: usize,
    /// Maximum expression-tree height.
    pub max_depth: usize,
    /// Programs carried over unchanged each generation.
    pub elitism: usize,
    /// Draws (with replacement) per parent selection.
    pub tournament_size: usize,
    /// Seed for all randomness of the run.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pop_size: 512,
            max_depth: 8,
            elitism: 2,
            tournament_size: 7,
            seed: 0,
        }
    }
}

/// Cooperative coevolution of a routing and a sequencing population.
///
/// Each population is evaluated against the best known partner from the
/// other one (its context); contexts only ever improve.
pub struct Ccgp {
    config: Config,
    rng: StdRng,
    breeding: rand_distr::weighted_alias::WeightedAliasIndex<u32>,
}

impl Ccgp {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        anyhow::ensure!(config.pop_size >= 2, "vanishing population size");
        anyhow::ensure!(config.max_depth >= 3, "max depth too small for ramped init");
        anyhow::ensure!(config.elitism <= config.pop_size, "elitism exceeds population");
        anyhow::ensure!(config.tournament_size >= 1, "vanishing tournament size");
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            breeding: rand_distr::weighted_alias::WeightedAliasIndex::new(
                BREEDING_WEIGHTS.to_vec(),
            )
            .unwrap(),
            config,
        })
    }

    /// Tree of height exactly `depth`.
    fn gen_full(&mut self, depth: usize) -> Node {
        if depth == 0 {
            random_terminal(&mut self.rng)
        } else {
            let left = self.gen_full(depth - 1);
            let right = self.gen_full(depth - 1);
            random_internal(&mut self.rng, left, right)
        }
    }

    /// Tree of height at most `depth`; leaves win 9 of 15 draws, their
    /// share of the full alphabet.
    fn gen_grow(&mut self, depth: usize) -> Node {
        if depth == 0 || self.rng.gen_bool(9.0 / 15.0) {
            random_terminal(&mut self.rng)
        } else {
            let left = self.gen_grow(depth - 1);
            let right = self.gen_grow(depth - 1);
            random_internal(&mut self.rng, left, right)
        }
    }

    /// One full-grown and one grow-generated tree per slot, ramped over
    /// the depth range. Integer division may leave the result slightly
    /// smaller than `pop_size`.
    fn ramp_half_and_half(&mut self) -> Vec<Node> {
        let pairs_per_depth = (self.config.pop_size / 2) / self.config.max_depth;
        let mut nodes = vec![];
        for depth in 1..=self.config.max_depth - 2 {
            for _ in 0..pairs_per_depth {
                nodes.push(self.gen_full(depth));
                nodes.push(self.gen_grow(depth));
            }
        }
        nodes
    }

    pub fn init_population(&mut self) -> Vec<Program> {
        self.ramp_half_and_half()
            .into_iter()
            .map(Program::new)
            .collect()
    }

    /// The best of `tournament_size` uniform draws with replacement.
    fn tournament<'p>(&mut self, pop: &'p [Program]) -> &'p Program {
        (0..self.config.tournament_size)
            .map(|_| pop.choose(&mut self.rng).expect("empty population"))
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))
            .expect("tournament of zero rounds")
    }

    /// Subtree crossover. The child copies one parent with a random
    /// subtree replaced by a donor subtree of the other; the donor is
    /// drawn among the positions keeping the child within the depth
    /// bound, which always admits at least the donor root.
    fn crossover(&mut self, p1: &Program, p2: &Program) -> Program {
        let (p1, p2) = if self.rng.gen_bool(0.5) {
            (p2, p1)
        } else {
            (p1, p2)
        };
        let max_depth = self.config.max_depth;
        let mut root = p1.root.clone();
        let h1 = root.height();
        let h2 = p2.root.height();
        let target = self.rng.gen_range(0..root.size());
        let height_n1 = root.descendants()[target].height();
        let depth_n1 = h1 - height_n1;

        let donors: Vec<&Node> = p2
            .root
            .descendants()
            .into_iter()
            .filter(|n2| {
                let height_n2 = n2.height();
                let depth_n2 = h2 - height_n2;
                height_n1 + depth_n2 <= max_depth && height_n2 + depth_n1 <= max_depth
            })
            .collect();
        let donor = (*donors
            .choose(&mut self.rng)
            .expect("crossover without admissible donors"))
        .clone();
        *root.descendant_mut(target).expect("preorder index in range") = donor;
        Program::new(root)
    }

    /// Replaces a random subtree with a freshly grown one whose depth
    /// budget keeps the tree within the bound.
    fn mutate(&mut self, p: &Program) -> Program {
        let mut root = p.root.clone();
        let target = self.rng.gen_range(0..root.size());
        let height = root.descendants()[target].height();
        let budget = self.config.max_depth - root.height() + height;
        let replacement = self.gen_grow(budget);
        *root.descendant_mut(target).expect("preorder index in range") = replacement;
        Program::new(root)
    }

    fn generate_offspring(&mut self, pop: &[Program]) -> Program {
        match self.breeding.sample(&mut self.rng) {
            0 => {
                let p1 = self.tournament(pop);
                let p2 = self.tournament(pop);
                self.crossover(p1, p2)
            }
            1 => {
                let p = self.tournament(pop);
                self.mutate(p)
            }
            _ => Program::new(self.tournament(pop).root.clone()),
        }
    }

    /// The `elitism` lowest-fitness programs, ties kept in insertion order.
    fn elitism(&self, pop: &[Program]) -> Vec<Program> {
        let mut indices: Vec<usize> = (0..pop.len()).collect();
        indices.sort_by(|&a, &b| pop[a].fitness.total_cmp(&pop[b].fitness));
        indices
            .into_iter()
            .take(self.config.elitism)
            .map(|i| pop[i].clone())
            .collect()
    }

    /// Starts a run over `problems`, yielding the context pair of each
    /// generation. Stop iterating to cancel the run.
    pub fn run<'a>(&'a mut self, problems: &'a [StaticFjss]) -> Generations<'a> {
        let routing_pop = self.init_population();
        let sequencing_pop = self.init_population();
        let ctx_routing = routing_pop
            .choose(&mut self.rng)
            .expect("empty initial population")
            .clone();
        let ctx_sequencing = sequencing_pop
            .choose(&mut self.rng)
            .expect("empty initial population")
            .clone();
        Generations {
            ccgp: self,
            problems,
            routing_pop,
            sequencing_pop,
            ctx_routing,
            ctx_sequencing,
            generation: 0,
        }
    }
}

/// Infinite generation-by-generation iterator over a coevolution run.
pub struct Generations<'a> {
    ccgp: &'a mut Ccgp,
    problems: &'a [StaticFjss],
    routing_pop: Vec<Program>,
    sequencing_pop: Vec<Program>,
    ctx_routing: Program,
    ctx_sequencing: Program,
    generation: u64,
}

impl Generations<'_> {
    fn fitness_summary(pop: &[Program]) -> (f64, f64) {
        let mut stats = incr_stats::incr::Stats::new();
        for program in pop {
            let _ = stats.update(program.fitness);
        }
        (
            stats.min().unwrap_or(f64::NAN),
            stats.mean().unwrap_or(f64::NAN),
        )
    }
}

impl Iterator for Generations<'_> {
    type Item = (Program, Program);

    fn next(&mut self) -> Option<Self::Item> {
        self.generation += 1;

        let mut new_routing = self.ccgp.elitism(&self.routing_pop);
        while new_routing.len() < self.routing_pop.len() {
            new_routing.push(self.ccgp.generate_offspring(&self.routing_pop));
        }
        let mut new_sequencing = self.ccgp.elitism(&self.sequencing_pop);
        while new_sequencing.len() < self.sequencing_pop.len() {
            new_sequencing.push(self.ccgp.generate_offspring(&self.sequencing_pop));
        }

        // every candidate faces the current context of the other population
        let (ctx_routing, ctx_sequencing) = (&self.ctx_routing, &self.ctx_sequencing);
        let problems = self.problems;
        new_routing.par_iter_mut().for_each(|candidate| {
            let fitness = normalized_makespan(candidate, ctx_sequencing, problems);
            candidate.fitness = fitness;
        });
        new_sequencing.par_iter_mut().for_each(|candidate| {
            let fitness = normalized_makespan(ctx_routing, candidate, problems);
            candidate.fitness = fitness;
        });

        let (routing_min, routing_mean) = Self::fitness_summary(&new_routing);
        let (sequencing_min, sequencing_mean) = Self::fitness_summary(&new_sequencing);
        log::info!(
            "gen {} routing {:.4}/{:.4} sequencing {:.4}/{:.4}",
            self.generation,
            routing_min,
            routing_mean,
            sequencing_min,
            sequencing_mean
        );

        // a new program matching the context's fitness replaces it
        if let Some(best) = new_routing
            .iter()
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))
        {
            if best.fitness <= self.ctx_routing.fitness {
                self.ctx_routing = best.clone();
            }
        }
        if let Some(best) = new_sequencing
            .iter()
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))
        {
            if best.fitness <= self.ctx_sequencing.fitness {
                self.ctx_sequencing = best.clone();
            }
        }

        self.routing_pop = new_routing;
        self.sequencing_pop = new_sequencing;
        Some((self.ctx_routing.clone(), self.ctx_sequencing.clone()))
    }
}

/// Makespan of `problem` under an evolved routing/sequencing pair: the
/// routing rule picks the eligible machine minimizing its key, and each
/// machine queue is a dynamic priority queue keyed by the sequencing rule.
pub fn makespan(routing: &Program, sequencing: &Program, problem: &impl Fjss) -> Time {
    Simulation::new(
        problem,
        RoutingRule::Program(routing.root.clone()),
        SequencingRule::Program(sequencing.root.clone()),
    )
    .simulate()
}

/// Mean over `problems` of makespan divided by the known lower bound.
///
/// Every instance must have a lower bound; a missing one poisons the mean
/// with NaN. Instances are evaluated in parallel and averaged in instance
/// order, so the result is deterministic.
pub fn normalized_makespan(routing: &Program, sequencing: &Program, problems: &[StaticFjss]) -> f64 {
    let ratios: Vec<f64> = problems
        .par_iter()
        .map(|problem| {
            makespan(routing, sequencing, problem) / problem.lower_bound.unwrap_or(f64::NAN)
        })
        .collect();
    ratios.iter().sum::<f64>() / ratios.len() as f64
}
