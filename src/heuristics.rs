use crate::problem::{Job, Time};
use crate::program::Node;
use crate::simulation::Simulation;

/// Machine-selection policy for the next operation of a job.
#[derive(Debug, Clone)]
pub enum RoutingRule {
    /// Machine with the least total queued work.
    LeastWorkInQueue,
    /// Machine with the fewest queued operations.
    LeastQueueSize,
    /// Machine that frees up first.
    EarliestReadyTime,
    /// Machine with the smallest cumulative busy time.
    SmallestBusyTime,
    /// Evolved routing rule.
    Program(Node),
}

impl RoutingRule {
    pub fn from(rule: &str) -> anyhow::Result<Self> {
        match rule {
            "lwq" => Ok(RoutingRule::LeastWorkInQueue),
            "lqs" => Ok(RoutingRule::LeastQueueSize),
            "ert" => Ok(RoutingRule::EarliestReadyTime),
            "sbt" => Ok(RoutingRule::SmallestBusyTime),
            _ => Err(anyhow::anyhow!("unknown routing rule: {}", rule)),
        }
    }

    /// The eligible machine with the minimum key; ties go to the first
    /// machine attaining it, in declaration order.
    pub fn select(&self, sim: &Simulation, job: &Job, op_index: usize) -> usize {
        let op = &job.operations[op_index];
        let key = |machine: usize| -> Time {
            match self {
                RoutingRule::LeastWorkInQueue => sim.machine_queue(machine).total_work(),
                RoutingRule::LeastQueueSize => sim.machine_queue(machine).len() as Time,
                RoutingRule::EarliestReadyTime => sim.busy_until(machine),
                RoutingRule::SmallestBusyTime => sim.machine_queue(machine).busy_time(),
                RoutingRule::Program(node) => node.calc(sim, job, op_index, machine),
            }
        };
        op.machines()
            .map(|machine| (machine, key(machine)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(machine, _)| machine)
            .expect("operation with no eligible machines")
    }
}

impl std::fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingRule::LeastWorkInQueue => write!(f, "lwq"),
            RoutingRule::LeastQueueSize => write!(f, "lqs"),
            RoutingRule::EarliestReadyTime => write!(f, "ert"),
            RoutingRule::SmallestBusyTime => write!(f, "sbt"),
            RoutingRule::Program(node) => write!(f, "{}", node),
        }
    }
}

/// Order in which a machine works through its queue. The rule also decides
/// the queue backend: FIFO keeps arrival order, SPT fixes priorities at
/// push time, and an evolved rule recomputes them from live state at
/// every pop.
#[derive(Debug, Clone)]
pub enum SequencingRule {
    /// First come, first served.
    Fifo,
    /// Shortest processing time first.
    ShortestProcessingTime,
    /// Evolved sequencing rule.
    Program(Node),
}

impl SequencingRule {
    pub fn from(rule: &str) -> anyhow::Result<Self> {
        match rule {
            "fifo" => Ok(SequencingRule::Fifo),
            "spt" => Ok(SequencingRule::ShortestProcessingTime),
            _ => Err(anyhow::anyhow!("unknown sequencing rule: {}", rule)),
        }
    }
}

impl std::fmt::Display for SequencingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencingRule::Fifo => write!(f, "fifo"),
            SequencingRule::ShortestProcessingTime => write!(f, "spt"),
            SequencingRule::Program(node) => write!(f, "{}", node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_from_str() {
        assert!(matches!(
            RoutingRule::from("lwq"),
            Ok(RoutingRule::LeastWorkInQueue)
        ));
        assert!(matches!(
            RoutingRule::from("ert"),
            Ok(RoutingRule::EarliestReadyTime)
        ));
        assert!(RoutingRule::from("nope").is_err());
        assert!(matches!(SequencingRule::from("fifo"), Ok(SequencingRule::Fifo)));
        assert!(matches!(
            SequencingRule::from("spt"),
            Ok(SequencingRule::ShortestProcessingTime)
        ));
        assert!(SequencingRule::from("nope").is_err());
    }

    #[test]
    fn test_rule_display() {
        assert_eq!(RoutingRule::LeastWorkInQueue.to_string(), "lwq");
        assert_eq!(SequencingRule::ShortestProcessingTime.to_string(), "spt");
        assert_eq!(RoutingRule::Program(Node::Pt).to_string(), "PT");
    }
}
