use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use rand::{distributions::Distribution, Rng, SeedableRng};
use serde::Deserialize;

pub type Time = f64;

/// One step of a job together with its eligible machines.
///
/// Machines keep the order in which they were declared, so that rules
/// breaking ties by scan order stay deterministic across runs.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    processing_times: Vec<(usize, Time)>,
}

impl Operation {
    /// A later entry for an already-listed machine overwrites its time.
    pub fn new(name: impl Into<String>, entries: impl IntoIterator<Item = (usize, Time)>) -> Self {
        let mut processing_times: Vec<(usize, Time)> = vec![];
        for (machine, time) in entries {
            match processing_times.iter_mut().find(|(m, _)| *m == machine) {
                Some(slot) => slot.1 = time,
                None => processing_times.push((machine, time)),
            }
        }
        assert!(
            !processing_times.is_empty(),
            "operation without eligible machines"
        );
        Self {
            name: name.into(),
            processing_times,
        }
    }

    /// Eligible machines in declaration order.
    pub fn machines(&self) -> impl Iterator<Item = usize> + '_ {
        self.processing_times.iter().map(|(machine, _)| *machine)
    }

    pub fn processing_time(&self, machine: usize) -> Time {
        self.processing_times
            .iter()
            .find(|(m, _)| *m == machine)
            .map(|(_, time)| *time)
            .expect("machine not eligible for operation")
    }

    pub fn num_eligible(&self) -> usize {
        self.processing_times.len()
    }

    fn times(&self) -> impl Iterator<Item = Time> + '_ {
        self.processing_times.iter().map(|(_, time)| *time)
    }
}

/// A job: an ordered sequence of operations plus caches derived from it.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub arrival_time: Time,
    pub operations: Vec<Operation>,
    median_work_time: Vec<Time>,
    median_work_remaining: Vec<Time>,
    /// Finish time of this job's most recently completed operation.
    /// Written only by the simulator.
    pub last_operation_ready_time: Time,
}

impl Job {
    pub fn new(name: impl Into<String>, arrival_time: Time, operations: Vec<Operation>) -> Self {
        assert!(!operations.is_empty(), "job without operations");
        assert!(arrival_time >= 0.0, "negative arrival time");
        let median_work_time: Vec<Time> = operations.iter().map(|op| median(op.times())).collect();
        let mut median_work_remaining = vec![0.0; operations.len()];
        let mut acc = 0.0;
        for i in (0..operations.len()).rev() {
            acc += median_work_time[i];
            median_work_remaining[i] = acc;
        }
        Self {
            name: name.into(),
            arrival_time,
            operations,
            median_work_time,
            median_work_remaining,
            last_operation_ready_time: 0.0,
        }
    }

    /// Median processing time of operation `op_index` over its machines.
    pub fn median_work_time(&self, op_index: usize) -> Time {
        self.median_work_time[op_index]
    }

    /// Sum of the median work times of operation `op_index` and all after it.
    pub fn median_work_remaining(&self, op_index: usize) -> Time {
        self.median_work_remaining[op_index]
    }
}

fn median(values: impl Iterator<Item = Time>) -> Time {
    let mut values: Vec<Time> = values.collect();
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// A flexible job-shop instance: a machine count and a way to materialize
/// the jobs to be scheduled.
pub trait Fjss {
    fn num_machines(&self) -> usize;

    /// The jobs of this instance. Repeated calls return the same jobs.
    fn generate_jobs(&self) -> Vec<Job>;
}

/// An instance with a fixed job list, typically read from a benchmark file.
#[derive(Debug, Clone)]
pub struct StaticFjss {
    pub name: String,
    pub num_machines: usize,
    pub jobs: Vec<Job>,
    pub lower_bound: Option<Time>,
}

impl StaticFjss {
    pub fn new(
        name: impl Into<String>,
        num_machines: usize,
        jobs: Vec<Job>,
        lower_bound: Option<Time>,
    ) -> Self {
        Self {
            name: name.into(),
            num_machines,
            jobs,
            lower_bound,
        }
    }

    /// Reads a Brandimarte-style instance file.
    pub fn load(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        lower_bound: Option<Time>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let infile = std::fs::File::open(path)
            .with_context(|| format!("could not open {}", path.display()))?;
        Self::parse(name, std::io::BufReader::new(infile), lower_bound)
            .with_context(|| format!("could not parse {}", path.display()))
    }

    /// Parses the Brandimarte format: a `num_jobs num_machines` header
    /// (extra tokens ignored), then one line per job listing each
    /// operation as `num_eligible (machine time)...` with 1-based machine
    /// indices. All jobs arrive at time 0.
    pub fn parse(
        name: impl Into<String>,
        reader: impl BufRead,
        lower_bound: Option<Time>,
    ) -> anyhow::Result<Self> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| anyhow::anyhow!("line 1: missing header"))?;
        let mut tokens = header.split_whitespace();
        let num_jobs: usize = tokens
            .next()
            .ok_or_else(|| anyhow::anyhow!("line 1: missing job count"))?
            .parse()
            .context("line 1: invalid job count")?;
        let num_machines: usize = tokens
            .next()
            .ok_or_else(|| anyhow::anyhow!("line 1: missing machine count"))?
            .parse()
            .context("line 1: invalid machine count")?;
        anyhow::ensure!(num_machines >= 1, "line 1: vanishing machine count");

        let mut jobs = Vec::with_capacity(num_jobs);
        for i in 0..num_jobs {
            let lineno = i + 2;
            let line = lines
                .next()
                .transpose()?
                .ok_or_else(|| anyhow::anyhow!("line {}: missing job description", lineno))?;
            let nums: Vec<u64> = line
                .split_whitespace()
                .map(|token| {
                    token
                        .parse::<u64>()
                        .with_context(|| format!("line {}: invalid token {:?}", lineno, token))
                })
                .collect::<anyhow::Result<_>>()?;
            let mut nums = nums.into_iter();
            let mut next_num = |what: &str| {
                nums.next()
                    .ok_or_else(|| anyhow::anyhow!("line {}: missing {}", lineno, what))
            };

            let num_ops = next_num("operation count")? as usize;
            anyhow::ensure!(num_ops >= 1, "line {}: job without operations", lineno);
            let mut operations = Vec::with_capacity(num_ops);
            for j in 0..num_ops {
                let num_eligible = next_num("eligible machine count")? as usize;
                anyhow::ensure!(
                    num_eligible >= 1,
                    "line {}: operation {} has no eligible machines",
                    lineno,
                    j + 1
                );
                let mut entries = Vec::with_capacity(num_eligible);
                for _ in 0..num_eligible {
                    let machine = next_num("machine index")? as usize;
                    let time = next_num("processing time")?;
                    anyhow::ensure!(
                        (1..=num_machines).contains(&machine),
                        "line {}: machine index {} out of range",
                        lineno,
                        machine
                    );
                    anyhow::ensure!(
                        time >= 1,
                        "line {}: vanishing processing time",
                        lineno
                    );
                    entries.push((machine - 1, time as Time));
                }
                operations.push(Operation::new(format!("{}:{}", i + 1, j + 1), entries));
            }
            jobs.push(Job::new(format!("{}", i + 1), 0.0, operations));
        }

        Ok(Self::new(name, num_machines, jobs, lower_bound))
    }
}

impl Fjss for StaticFjss {
    fn num_machines(&self) -> usize {
        self.num_machines
    }

    fn generate_jobs(&self) -> Vec<Job> {
        self.jobs.clone()
    }
}

/// An instance whose jobs are drawn on demand: exponential inter-arrival
/// times of rate `utilization_rate` and uniformly random operations,
/// reproducible from `seed`.
#[derive(Debug, Clone)]
pub struct DynamicFjss {
    pub num_machines: usize,
    pub num_jobs: usize,
    pub utilization_rate: f64,
    pub seed: u64,
}

impl DynamicFjss {
    pub fn new(
        num_machines: usize,
        num_jobs: usize,
        utilization_rate: f64,
        seed: u64,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(num_machines >= 1, "vanishing machine count");
        anyhow::ensure!(num_jobs >= 1, "vanishing job count");
        anyhow::ensure!(utilization_rate > 0.0, "vanishing utilization rate");
        Ok(Self {
            num_machines,
            num_jobs,
            utilization_rate,
            seed,
        })
    }

    fn random_job(&self, rng: &mut impl Rng, name: String, arrival_time: Time) -> Job {
        let num_ops = rng.gen_range(1..=10);
        let mut operations = Vec::with_capacity(num_ops);
        for i in 0..num_ops {
            // machine candidates are drawn with replacement, so the
            // eligible set may end up smaller than the draw count
            let num_draws = rng.gen_range(1..=self.num_machines);
            let entries: Vec<(usize, Time)> = (0..num_draws)
                .map(|_| {
                    (
                        rng.gen_range(0..self.num_machines),
                        rng.gen_range(1..=99) as Time,
                    )
                })
                .collect();
            operations.push(Operation::new(format!("{}:{}", name, i + 1), entries));
        }
        Job::new(name, arrival_time, operations)
    }
}

impl Fjss for DynamicFjss {
    fn num_machines(&self) -> usize {
        self.num_machines
    }

    fn generate_jobs(&self) -> Vec<Job> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let interarrival = rand_distr::Exp::new(self.utilization_rate).unwrap();
        let mut time: Time = 0.0;
        (0..self.num_jobs)
            .map(|i| {
                time += interarrival.sample(&mut rng);
                let name = format!("{}", i + 1);
                self.random_job(&mut rng, name, time)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogueRecord {
    path: String,
    optimum: Option<Time>,
    #[serde(default)]
    bounds: Option<CatalogueBounds>,
}

#[derive(Debug, Deserialize)]
struct CatalogueBounds {
    lower: Option<Time>,
}

/// Known optima or proven lower bounds, keyed by instance path.
#[derive(Debug, Clone, Default)]
pub struct LowerBounds {
    bounds: HashMap<String, Time>,
}

impl LowerBounds {
    pub fn new(bounds: impl IntoIterator<Item = (String, Time)>) -> Self {
        Self {
            bounds: bounds.into_iter().collect(),
        }
    }

    /// Reads a sidecar catalogue: a JSON array of records with `path`,
    /// `optimum` and optional `bounds.lower`. The bound of an instance is
    /// its optimum if known, else its proven lower bound.
    pub fn from_catalogue(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let records: Vec<CatalogueRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("could not parse {}", path.display()))?;
        let mut bounds = HashMap::new();
        for record in records {
            let bound = record
                .optimum
                .or(record.bounds.and_then(|bounds| bounds.lower));
            let bound =
                bound.ok_or_else(|| anyhow::anyhow!("no lower bound for {}", record.path))?;
            bounds.insert(record.path, bound);
        }
        Ok(Self { bounds })
    }

    /// Reads the `FJSS_LOWER_BOUNDS` environment variable as a JSON object
    /// mapping instance paths to bounds. Missing variable means no bounds.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("FJSS_LOWER_BOUNDS") {
            Ok(raw) => {
                let bounds: HashMap<String, Time> =
                    serde_json::from_str(&raw).context("could not parse FJSS_LOWER_BOUNDS")?;
                Ok(Self { bounds })
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn get(&self, path: &str) -> Option<Time> {
        self.bounds.get(path).copied()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.bounds.keys()
    }
}

/// Where the lower bounds (and instance paths) of a problem set come from.
#[derive(Debug, Clone)]
pub enum BoundsSource {
    /// The `instances.json` sidecar next to the instance files.
    Catalogue,
    /// The `FJSS_LOWER_BOUNDS` environment variable.
    Env,
    /// A caller-supplied map.
    Explicit(LowerBounds),
}

impl BoundsSource {
    pub fn from(source: &str) -> anyhow::Result<Self> {
        match source {
            "catalogue" => Ok(BoundsSource::Catalogue),
            "env" => Ok(BoundsSource::Env),
            _ => Err(anyhow::anyhow!("unknown bounds source: {}", source)),
        }
    }
}

impl std::fmt::Display for BoundsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundsSource::Catalogue => write!(f, "catalogue"),
            BoundsSource::Env => write!(f, "env"),
            BoundsSource::Explicit(_) => write!(f, "explicit"),
        }
    }
}

/// The instances under a directory whose known paths start with a prefix,
/// in lexicographic path order, each carrying the lower bound resolved
/// from the chosen source.
#[derive(Debug, Clone)]
pub struct ProblemSet {
    pub problems: Vec<StaticFjss>,
}

impl ProblemSet {
    pub fn load(
        root: impl AsRef<Path>,
        prefix: &str,
        source: BoundsSource,
    ) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let bounds = match source {
            BoundsSource::Catalogue => LowerBounds::from_catalogue(root.join("instances.json"))?,
            BoundsSource::Env => LowerBounds::from_env()?,
            BoundsSource::Explicit(bounds) => bounds,
        };
        let mut paths: Vec<String> = bounds
            .paths()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        anyhow::ensure!(!paths.is_empty(), "no instances match prefix {:?}", prefix);
        let problems = paths
            .iter()
            .map(|path| StaticFjss::load(path.clone(), root.join(path), bounds.get(path)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { problems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_ctor() {
        let op = Operation::new("1:1", vec![(2, 5.0), (0, 3.0), (2, 7.0)]);
        assert_eq!(op.machines().collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(op.processing_time(2), 7.0);
        assert_eq!(op.processing_time(0), 3.0);
        assert_eq!(op.num_eligible(), 2);
    }

    #[test]
    fn test_job_medians() {
        let job = Job::new(
            "1",
            0.0,
            vec![
                Operation::new("1:1", vec![(0, 1.0), (1, 9.0), (2, 5.0)]),
                Operation::new("1:2", vec![(0, 2.0), (1, 4.0)]),
                Operation::new("1:3", vec![(2, 7.0)]),
            ],
        );
        assert_eq!(job.median_work_time(0), 5.0);
        assert_eq!(job.median_work_time(1), 3.0);
        assert_eq!(job.median_work_time(2), 7.0);
        assert_eq!(job.median_work_remaining(0), 15.0);
        assert_eq!(job.median_work_remaining(1), 10.0);
        assert_eq!(job.median_work_remaining(2), 7.0);
    }

    #[test]
    fn test_parse_static_instance() -> anyhow::Result<()> {
        let text = "2 2 3.5\n2 1 1 3 1 2 2\n1 1 2 4\n";
        let problem = StaticFjss::parse("toy", text.as_bytes(), Some(6.0))?;
        assert_eq!(problem.num_machines, 2);
        assert_eq!(problem.jobs.len(), 2);
        assert_eq!(problem.lower_bound, Some(6.0));
        let first = &problem.jobs[0];
        assert_eq!(first.operations.len(), 2);
        assert_eq!(first.arrival_time, 0.0);
        // machine indices are 1-based on disk
        assert_eq!(first.operations[0].machines().collect::<Vec<_>>(), vec![0]);
        assert_eq!(first.operations[0].processing_time(0), 3.0);
        assert_eq!(first.operations[1].processing_time(1), 2.0);
        assert_eq!(problem.jobs[1].operations[0].processing_time(1), 4.0);
        Ok(())
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let truncated = StaticFjss::parse("bad", "2 2\n2 1 1 3\n".as_bytes(), None);
        assert!(format!("{:#}", truncated.unwrap_err()).contains("line 2"));

        let bad_token = StaticFjss::parse("bad", "1 2\n1 1 1 x\n".as_bytes(), None);
        assert!(format!("{:#}", bad_token.unwrap_err()).contains("line 2"));

        let out_of_range = StaticFjss::parse("bad", "1 2\n1 1 3 4\n".as_bytes(), None);
        assert!(format!("{:#}", out_of_range.unwrap_err()).contains("out of range"));

        let no_machines = StaticFjss::parse("bad", "1 2\n1 0\n".as_bytes(), None);
        assert!(format!("{:#}", no_machines.unwrap_err()).contains("no eligible machines"));

        let zero_time = StaticFjss::parse("bad", "1 2\n1 1 1 0\n".as_bytes(), None);
        assert!(format!("{:#}", zero_time.unwrap_err()).contains("processing time"));
    }

    #[test]
    fn test_dynamic_generation_is_deterministic() -> anyhow::Result<()> {
        let problem = DynamicFjss::new(4, 20, 0.8, 42)?;
        let first = problem.generate_jobs();
        let second = problem.generate_jobs();
        assert_eq!(first.len(), 20);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.arrival_time, b.arrival_time);
            assert_eq!(a.operations.len(), b.operations.len());
        }
        let mut last_arrival = 0.0;
        for job in &first {
            assert!(job.arrival_time > last_arrival);
            last_arrival = job.arrival_time;
            assert!((1..=10).contains(&job.operations.len()));
            for op in &job.operations {
                assert!(op.num_eligible() >= 1);
                for machine in op.machines() {
                    assert!(machine < 4);
                    let time = op.processing_time(machine);
                    assert!((1.0..=99.0).contains(&time));
                }
            }
        }
        let other_seed = DynamicFjss::new(4, 20, 0.8, 43)?.generate_jobs();
        assert!(first
            .iter()
            .zip(&other_seed)
            .any(|(a, b)| a.arrival_time != b.arrival_time));
        Ok(())
    }

    #[test]
    fn test_lower_bounds_catalogue() -> anyhow::Result<()> {
        let bounds = LowerBounds::from_catalogue("data/instances.json")?;
        assert_eq!(bounds.get("demo/flexible.txt"), Some(4.0));
        // optimum is null, so the proven lower bound applies
        assert_eq!(bounds.get("demo/mixed.txt"), Some(11.0));
        assert_eq!(bounds.get("demo/nonexistent.txt"), None);
        Ok(())
    }

    #[test]
    fn test_lower_bounds_from_env() -> anyhow::Result<()> {
        // single test for everything touching the variable, since tests
        // sharing the process environment run concurrently
        std::env::set_var(
            "FJSS_LOWER_BOUNDS",
            r#"{"demo/toy.txt": 12.5, "demo/two_stage.txt": 6}"#,
        );
        let bounds = LowerBounds::from_env()?;
        assert_eq!(bounds.get("demo/toy.txt"), Some(12.5));

        let set = ProblemSet::load("data", "demo/two_stage", BoundsSource::Env)?;
        assert_eq!(set.problems.len(), 1);
        assert_eq!(set.problems[0].lower_bound, Some(6.0));

        std::env::remove_var("FJSS_LOWER_BOUNDS");
        assert_eq!(LowerBounds::from_env()?.get("demo/toy.txt"), None);
        Ok(())
    }

    #[test]
    fn test_problem_set_load() -> anyhow::Result<()> {
        let set = ProblemSet::load("data", "demo", BoundsSource::Catalogue)?;
        let names: Vec<&str> = set.problems.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["demo/flexible.txt", "demo/mixed.txt", "demo/two_stage.txt"]
        );
        assert!(set.problems.iter().all(|p| p.lower_bound.is_some()));

        let narrowed = ProblemSet::load("data", "demo/two_stage", BoundsSource::Catalogue)?;
        assert_eq!(narrowed.problems.len(), 1);

        assert!(ProblemSet::load("data", "nope", BoundsSource::Catalogue).is_err());
        Ok(())
    }

    #[test]
    fn test_problem_set_load_with_explicit_bounds() -> anyhow::Result<()> {
        // a caller-supplied map overrides the catalogue entirely, both for
        // selection and for the bound values
        let bounds = LowerBounds::new([("demo/flexible.txt".to_string(), 5.0)]);
        let set = ProblemSet::load("data", "demo", BoundsSource::Explicit(bounds))?;
        assert_eq!(set.problems.len(), 1);
        assert_eq!(set.problems[0].name, "demo/flexible.txt");
        assert_eq!(set.problems[0].lower_bound, Some(5.0));
        Ok(())
    }

    #[test]
    fn test_bounds_source_from_str() {
        assert!(matches!(
            BoundsSource::from("catalogue"),
            Ok(BoundsSource::Catalogue)
        ));
        assert!(matches!(BoundsSource::from("env"), Ok(BoundsSource::Env)));
        assert!(BoundsSource::from("nope").is_err());
        assert_eq!(BoundsSource::Catalogue.to_string(), "catalogue");
    }
}
