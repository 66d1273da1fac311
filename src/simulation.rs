use crate::heuristics::{RoutingRule, SequencingRule};
use crate::problem::{Fjss, Job, Time};
use crate::queues::{DynamicPriorityQueue, FifoQueue, PriorityQueue};

/// Index of a job within its simulation.
pub type JobId = usize;

#[derive(Debug, Clone)]
enum Event {
    /// A job arrives and its first operation becomes available.
    NewJob(JobId),
    /// A machine finishes the operation it was processing.
    MachineFinish {
        time: Time,
        machine: usize,
        job: JobId,
        op_index: usize,
    },
}

/// An operation waiting in a machine queue.
#[derive(Debug, Clone)]
pub struct MachineQueueItem {
    pub job: JobId,
    pub op_index: usize,
    /// Processing time on the queue's machine, fixed at routing time.
    pub processing_time: Time,
}

#[derive(Debug)]
enum QueueImpl {
    Fifo(FifoQueue<MachineQueueItem>),
    Priority(PriorityQueue<MachineQueueItem>),
    Dynamic(DynamicPriorityQueue<MachineQueueItem>),
}

/// Per-machine queue tracking queued and already-dispatched work.
#[derive(Debug)]
pub struct MachineQueue {
    base: QueueImpl,
    total_work: Time,
    busy_time: Time,
}

impl MachineQueue {
    fn new(rule: &SequencingRule) -> Self {
        let base = match rule {
            SequencingRule::Fifo => QueueImpl::Fifo(FifoQueue::new()),
            SequencingRule::ShortestProcessingTime => QueueImpl::Priority(PriorityQueue::new()),
            SequencingRule::Program(_) => QueueImpl::Dynamic(DynamicPriorityQueue::new()),
        };
        Self {
            base,
            total_work: 0.0,
            busy_time: 0.0,
        }
    }

    fn push(&mut self, item: MachineQueueItem) {
        self.total_work += item.processing_time;
        match &mut self.base {
            QueueImpl::Fifo(queue) => queue.push(item),
            QueueImpl::Priority(queue) => {
                // shortest processing time is the push-time priority
                let key = item.processing_time;
                queue.push(item, key);
            }
            QueueImpl::Dynamic(queue) => queue.push(item),
        }
    }

    /// Removes the next item: the front for FIFO, the heap minimum for
    /// push-keyed priorities, or the position selected beforehand for
    /// dynamic priorities.
    fn take(&mut self, selected: Option<usize>) -> Option<MachineQueueItem> {
        let item = match &mut self.base {
            QueueImpl::Fifo(queue) => queue.pop(),
            QueueImpl::Priority(queue) => queue.pop(),
            QueueImpl::Dynamic(queue) => Some(queue.remove(selected?)),
        }?;
        self.total_work -= item.processing_time;
        self.busy_time += item.processing_time;
        Some(item)
    }

    fn dynamic(&self) -> &DynamicPriorityQueue<MachineQueueItem> {
        match &self.base {
            QueueImpl::Dynamic(queue) => queue,
            _ => panic!("sequencing rule does not use a dynamic queue"),
        }
    }

    pub fn len(&self) -> usize {
        match &self.base {
            QueueImpl::Fifo(queue) => queue.len(),
            QueueImpl::Priority(queue) => queue.len(),
            QueueImpl::Dynamic(queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total processing time of the currently queued items.
    pub fn total_work(&self) -> Time {
        self.total_work
    }

    /// Cumulative processing time of the items dispatched so far.
    pub fn busy_time(&self) -> Time {
        self.busy_time
    }
}

/// Discrete-event simulation of one flexible job-shop instance under a
/// routing rule and a sequencing rule.
///
/// The simulation owns its jobs, events and machine queues; events with
/// equal times fire in insertion order. Given the same instance and rules
/// the computed makespan is deterministic.
pub struct Simulation {
    jobs: Vec<Job>,
    now: Time,
    events: PriorityQueue<Event>,
    machine_queues: Vec<MachineQueue>,
    machines_busy_until: Vec<Time>,
    routing: RoutingRule,
    sequencing: SequencingRule,
}

impl Simulation {
    pub fn new(problem: &impl Fjss, routing: RoutingRule, sequencing: SequencingRule) -> Self {
        let jobs = problem.generate_jobs();
        let mut events = PriorityQueue::new();
        for (id, job) in jobs.iter().enumerate() {
            events.push(Event::NewJob(id), job.arrival_time);
        }
        Self {
            machine_queues: (0..problem.num_machines())
                .map(|_| MachineQueue::new(&sequencing))
                .collect(),
            machines_busy_until: vec![0.0; problem.num_machines()],
            jobs,
            now: 0.0,
            events,
            routing,
            sequencing,
        }
    }

    /// Runs the simulation to completion and returns the makespan.
    pub fn simulate(&mut self) -> Time {
        while let Some(event) = self.events.pop() {
            self.now = self.event_time(&event);
            match event {
                Event::NewJob(job) => self.handle_new_job(job),
                Event::MachineFinish {
                    machine,
                    job,
                    op_index,
                    ..
                } => self.handle_machine_finish(machine, job, op_index),
            }
        }
        self.now
    }

    fn event_time(&self, event: &Event) -> Time {
        match event {
            Event::NewJob(job) => self.jobs[*job].arrival_time,
            Event::MachineFinish { time, .. } => *time,
        }
    }

    fn handle_new_job(&mut self, job: JobId) {
        log::debug!("A {} job {}", self.now, self.jobs[job].name);
        self.jobs[job].last_operation_ready_time = self.now;
        self.handle_new_operation(job, 0);
    }

    fn handle_new_operation(&mut self, job: JobId, op_index: usize) {
        if op_index >= self.jobs[job].operations.len() {
            return;
        }
        let machine = self.routing.select(self, &self.jobs[job], op_index);
        let processing_time = self.jobs[job].operations[op_index].processing_time(machine);
        log::debug!(
            "R {} operation {} to machine {}",
            self.now,
            self.jobs[job].operations[op_index].name,
            machine + 1
        );
        self.machine_queues[machine].push(MachineQueueItem {
            job,
            op_index,
            processing_time,
        });
        self.update_queue(machine);
    }

    fn update_queue(&mut self, machine: usize) {
        if self.now < self.machines_busy_until[machine] {
            return;
        }
        let Some(item) = self.pop_item(machine) else {
            return;
        };
        let finish_time = self.now + item.processing_time;
        self.machines_busy_until[machine] = finish_time;
        log::debug!(
            "S {} machine {} starts {}",
            self.now,
            machine + 1,
            self.jobs[item.job].operations[item.op_index].name
        );
        self.events.push(
            Event::MachineFinish {
                time: finish_time,
                machine,
                job: item.job,
                op_index: item.op_index,
            },
            finish_time,
        );
    }

    fn handle_machine_finish(&mut self, machine: usize, job: JobId, op_index: usize) {
        log::debug!(
            "F {} machine {} finishes {}",
            self.now,
            machine + 1,
            self.jobs[job].operations[op_index].name
        );
        let next_op = op_index + 1;
        if next_op < self.jobs[job].operations.len() {
            self.jobs[job].last_operation_ready_time = self.now;
            // route the follow-on operation first, so the re-dispatch
            // below observes the updated queue state
            self.handle_new_operation(job, next_op);
        }
        self.update_queue(machine);
    }

    fn pop_item(&mut self, machine: usize) -> Option<MachineQueueItem> {
        // dynamic rules pick their item while the queue is still intact
        let selected = match &self.sequencing {
            SequencingRule::Program(node) => {
                let queue = self.machine_queues[machine].dynamic();
                Some(queue.position_min(|item| {
                    node.calc(self, &self.jobs[item.job], item.op_index, machine)
                })?)
            }
            _ => None,
        };
        self.machine_queues[machine].take(selected)
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn num_machines(&self) -> usize {
        self.machine_queues.len()
    }

    pub fn machine_queue(&self, machine: usize) -> &MachineQueue {
        &self.machine_queues[machine]
    }

    pub fn busy_until(&self, machine: usize) -> Time {
        self.machines_busy_until[machine]
    }

    pub fn job(&self, job: JobId) -> &Job {
        &self.jobs[job]
    }
}
