use rand::{seq::SliceRandom, Rng};

use crate::problem::Job;
use crate::simulation::Simulation;

/// Expression-tree node of a dispatching rule.
///
/// Terminals read the state of the simulation at the evaluation point
/// `(simulation, job, operation index, machine)`; internal nodes combine
/// two subtrees. Evaluation is total: division by a near-zero denominator
/// yields 1 instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Median work time of the job's next operation, 0 for the last one.
    Npt,
    /// Median work remaining of the job, including the current operation.
    Wkr,
    /// Number of operations after the current one.
    Nor,
    /// Constant weight placeholder.
    W,
    /// Current simulation time.
    Tis,
    /// Number of items queued at the machine.
    Niq,
    /// How long the machine has been idle.
    Mwt,
    /// Processing time of the operation on the machine.
    Pt,
    /// How long the operation has been waiting since it became ready.
    Owt,
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
    Min(Box<Node>, Box<Node>),
    Max(Box<Node>, Box<Node>),
}

impl Node {
    pub fn calc(&self, sim: &Simulation, job: &Job, op_index: usize, machine: usize) -> f64 {
        match self {
            Node::Npt => {
                if op_index + 1 < job.operations.len() {
                    job.median_work_time(op_index + 1)
                } else {
                    0.0
                }
            }
            Node::Wkr => job.median_work_remaining(op_index),
            Node::Nor => (job.operations.len() - 1 - op_index) as f64,
            Node::W => 1.0,
            Node::Tis => sim.now(),
            Node::Niq => sim.machine_queue(machine).len() as f64,
            Node::Mwt => (sim.now() - sim.busy_until(machine)).max(0.0),
            Node::Pt => job.operations[op_index].processing_time(machine),
            Node::Owt => sim.now() - job.last_operation_ready_time,
            Node::Add(a, b) => {
                a.calc(sim, job, op_index, machine) + b.calc(sim, job, op_index, machine)
            }
            Node::Sub(a, b) => {
                a.calc(sim, job, op_index, machine) - b.calc(sim, job, op_index, machine)
            }
            Node::Mul(a, b) => {
                a.calc(sim, job, op_index, machine) * b.calc(sim, job, op_index, machine)
            }
            Node::Div(a, b) => {
                let denominator = b.calc(sim, job, op_index, machine);
                if denominator.abs() >= 1e-8 {
                    a.calc(sim, job, op_index, machine) / denominator
                } else {
                    1.0
                }
            }
            Node::Min(a, b) => a
                .calc(sim, job, op_index, machine)
                .min(b.calc(sim, job, op_index, machine)),
            Node::Max(a, b) => a
                .calc(sim, job, op_index, machine)
                .max(b.calc(sim, job, op_index, machine)),
        }
    }

    fn children(&self) -> Option<(&Node, &Node)> {
        match self {
            Node::Add(a, b)
            | Node::Sub(a, b)
            | Node::Mul(a, b)
            | Node::Div(a, b)
            | Node::Min(a, b)
            | Node::Max(a, b) => Some((a, b)),
            _ => None,
        }
    }

    fn children_mut(&mut self) -> Option<(&mut Node, &mut Node)> {
        match self {
            Node::Add(a, b)
            | Node::Sub(a, b)
            | Node::Mul(a, b)
            | Node::Div(a, b)
            | Node::Min(a, b)
            | Node::Max(a, b) => Some((a, b)),
            _ => None,
        }
    }

    /// 0 for a leaf, one more than the taller child otherwise.
    pub fn height(&self) -> usize {
        match self.children() {
            Some((a, b)) => 1 + a.height().max(b.height()),
            None => 0,
        }
    }

    /// Number of nodes in this tree, the root included.
    pub fn size(&self) -> usize {
        match self.children() {
            Some((a, b)) => 1 + a.size() + b.size(),
            None => 1,
        }
    }

    /// All nodes of this tree in preorder, the root first.
    pub fn descendants(&self) -> Vec<&Node> {
        let mut nodes = Vec::with_capacity(self.size());
        self.collect(&mut nodes);
        nodes
    }

    fn collect<'a>(&'a self, nodes: &mut Vec<&'a Node>) {
        nodes.push(self);
        if let Some((a, b)) = self.children() {
            a.collect(nodes);
            b.collect(nodes);
        }
    }

    /// Mutable handle to the preorder `index`-th node of this tree, for
    /// in-place subtree replacement.
    pub fn descendant_mut(&mut self, index: usize) -> Option<&mut Node> {
        let mut remaining = index;
        self.find_mut(&mut remaining)
    }

    fn find_mut(&mut self, remaining: &mut usize) -> Option<&mut Node> {
        if *remaining == 0 {
            return Some(self);
        }
        *remaining -= 1;
        let (a, b) = self.children_mut()?;
        if let Some(found) = a.find_mut(remaining) {
            return Some(found);
        }
        b.find_mut(remaining)
    }

    fn name(&self) -> &'static str {
        match self {
            Node::Npt => "NPT",
            Node::Wkr => "WKR",
            Node::Nor => "NOR",
            Node::W => "W",
            Node::Tis => "TIS",
            Node::Niq => "NIQ",
            Node::Mwt => "MWT",
            Node::Pt => "PT",
            Node::Owt => "OWT",
            Node::Add(..) => "ADD",
            Node::Sub(..) => "SUB",
            Node::Mul(..) => "MUL",
            Node::Div(..) => "DIV",
            Node::Min(..) => "MIN",
            Node::Max(..) => "MAX",
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.children() {
            None => write!(f, "{}", self.name()),
            Some((a, b)) => write!(f, "{}({},{})", self.name(), a, b),
        }
    }
}

const TERMINALS: [Node; 9] = [
    Node::Npt,
    Node::Wkr,
    Node::Nor,
    Node::W,
    Node::Tis,
    Node::Niq,
    Node::Mwt,
    Node::Pt,
    Node::Owt,
];

/// Uniformly random leaf.
pub fn random_terminal(rng: &mut impl Rng) -> Node {
    TERMINALS
        .choose(rng)
        .cloned()
        .expect("terminal alphabet is non-empty")
}

/// Uniformly random binary operator over the two given subtrees.
pub fn random_internal(rng: &mut impl Rng, left: Node, right: Node) -> Node {
    let (left, right) = (Box::new(left), Box::new(right));
    match rng.gen_range(0..6) {
        0 => Node::Add(left, right),
        1 => Node::Sub(left, right),
        2 => Node::Mul(left, right),
        3 => Node::Div(left, right),
        4 => Node::Min(left, right),
        _ => Node::Max(left, right),
    }
}

/// A dispatching rule: an expression tree plus the fitness assigned to it
/// by the evolutionary driver. Cloning yields an independent deep copy.
#[derive(Debug, Clone)]
pub struct Program {
    pub root: Node,
    pub fitness: f64,
}

impl Program {
    pub fn new(root: Node) -> Self {
        Self {
            root,
            fitness: f64::INFINITY,
        }
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (fitness {})", self.root, self.fitness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::{RoutingRule, SequencingRule};
    use crate::problem::{Operation, StaticFjss};

    fn sample_tree() -> Node {
        // ADD(DIV(PT,W),MUL(NIQ,SUB(TIS,OWT)))
        Node::Add(
            Box::new(Node::Div(Box::new(Node::Pt), Box::new(Node::W))),
            Box::new(Node::Mul(
                Box::new(Node::Niq),
                Box::new(Node::Sub(Box::new(Node::Tis), Box::new(Node::Owt))),
            )),
        )
    }

    fn idle_simulation() -> Simulation {
        let job = Job::new(
            "1",
            0.0,
            vec![
                Operation::new("1:1", vec![(0, 4.0), (1, 6.0)]),
                Operation::new("1:2", vec![(1, 2.0)]),
            ],
        );
        let problem = StaticFjss::new("toy", 2, vec![job], None);
        Simulation::new(
            &problem,
            RoutingRule::LeastWorkInQueue,
            SequencingRule::Fifo,
        )
    }

    #[test]
    fn test_height_size_descendants() {
        let tree = sample_tree();
        assert_eq!(tree.height(), 3);
        assert_eq!(tree.size(), 9);
        let names: Vec<&str> = tree.descendants().iter().map(|node| node.name()).collect();
        assert_eq!(
            names,
            vec!["ADD", "DIV", "PT", "W", "MUL", "NIQ", "SUB", "TIS", "OWT"]
        );
        assert_eq!(Node::W.height(), 0);
        assert_eq!(Node::W.size(), 1);
    }

    #[test]
    fn test_display_prefix_form() {
        assert_eq!(
            sample_tree().to_string(),
            "ADD(DIV(PT,W),MUL(NIQ,SUB(TIS,OWT)))"
        );
        assert_eq!(Node::Wkr.to_string(), "WKR");
    }

    #[test]
    fn test_descendant_mut_replaces_in_place() {
        let mut tree = sample_tree();
        *tree.descendant_mut(6).expect("index in range") = Node::Wkr;
        assert_eq!(tree.to_string(), "ADD(DIV(PT,W),MUL(NIQ,WKR))");
        assert!(tree.descendant_mut(8).is_none());
        *tree.descendant_mut(0).expect("root") = Node::Pt;
        assert_eq!(tree, Node::Pt);
    }

    #[test]
    fn test_terminal_values_on_idle_simulation() {
        let sim = idle_simulation();
        let job = sim.job(0);
        assert_eq!(Node::Npt.calc(&sim, job, 0, 0), 2.0);
        assert_eq!(Node::Npt.calc(&sim, job, 1, 1), 0.0);
        assert_eq!(Node::Wkr.calc(&sim, job, 0, 0), 7.0);
        assert_eq!(Node::Nor.calc(&sim, job, 0, 0), 1.0);
        assert_eq!(Node::W.calc(&sim, job, 0, 0), 1.0);
        assert_eq!(Node::Tis.calc(&sim, job, 0, 0), 0.0);
        assert_eq!(Node::Niq.calc(&sim, job, 0, 0), 0.0);
        assert_eq!(Node::Mwt.calc(&sim, job, 0, 0), 0.0);
        assert_eq!(Node::Pt.calc(&sim, job, 0, 1), 6.0);
        assert_eq!(Node::Owt.calc(&sim, job, 0, 0), 0.0);
    }

    #[test]
    fn test_arithmetic_nodes() {
        let sim = idle_simulation();
        let job = sim.job(0);
        let pt = Box::new(Node::Pt);
        let w = Box::new(Node::W);
        assert_eq!(Node::Add(pt.clone(), w.clone()).calc(&sim, job, 0, 0), 5.0);
        assert_eq!(Node::Sub(pt.clone(), w.clone()).calc(&sim, job, 0, 0), 3.0);
        assert_eq!(Node::Mul(pt.clone(), w.clone()).calc(&sim, job, 0, 0), 4.0);
        assert_eq!(Node::Div(pt.clone(), w.clone()).calc(&sim, job, 0, 0), 4.0);
        assert_eq!(Node::Min(pt.clone(), w.clone()).calc(&sim, job, 0, 0), 1.0);
        assert_eq!(Node::Max(pt, w).calc(&sim, job, 0, 0), 4.0);
    }

    #[test]
    fn test_protected_division() {
        let sim = idle_simulation();
        let job = sim.job(0);
        let tree = Node::Div(
            Box::new(Node::Pt),
            Box::new(Node::Sub(Box::new(Node::W), Box::new(Node::W))),
        );
        assert_eq!(tree.calc(&sim, job, 0, 0), 1.0);
    }

    #[test]
    fn test_program_clone_is_independent() {
        let original = Program::new(sample_tree());
        let mut copy = original.clone();
        copy.fitness = 1.5;
        *copy.root.descendant_mut(2).expect("index in range") = Node::Nor;
        assert_eq!(original.root, sample_tree());
        assert_eq!(original.fitness, f64::INFINITY);
        assert_ne!(copy.root, original.root);
    }

    #[test]
    fn test_random_generator_shapes() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 0x1111_1111_1111_1111);
        for _ in 0..100 {
            let leaf = random_terminal(&mut rng);
            assert_eq!(leaf.height(), 0);
            let internal = random_internal(&mut rng, Node::W, Node::Pt);
            assert_eq!(internal.height(), 1);
            assert_eq!(internal.size(), 3);
        }
    }
}
