//! Scenario tests driving a complete scheduler on a manual clock.

use crate::constraint::{ConstraintKind, ConstraintParams, ConstraintType};
use crate::hotplug::{HotplugIrq, IrqRights};
use crate::invoke::{Item, Message, Reply};
use crate::priority::Priority;
use crate::ready_queue::{Position, ReadyQueue};
use crate::scheduler::RunParams;
use crate::{
    global, ConstraintId, CpuId, CpuSet, SchedConfig, SchedError, ScId, Scheduler, ThreadId, Time,
};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use tempo_hal::perf::{Counter, PerfCounters, PerfEvent};
use tempo_hal::ManualClock;

// =============================================================================
// Harness
// =============================================================================

#[derive(Default)]
struct RecordingPerf {
    setups: AtomicUsize,
    acks: AtomicUsize,
    writes: Mutex<Vec<(CpuId, Counter, u64)>>,
}

impl PerfCounters for RecordingPerf {
    fn setup(&self, _cpu: CpuId, _counter: Counter, _event: PerfEvent) {
        self.setups.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self, cpu: CpuId, counter: Counter, remaining: u64) {
        self.writes.lock().push((cpu, counter, remaining));
    }

    fn ack_overflow(&self, _cpu: CpuId, _counter: Counter) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct IrqCounter(AtomicUsize);

impl HotplugIrq for IrqCounter {
    fn hit(&self, _irq: u32) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

struct Sim {
    clock: Arc<ManualClock>,
    perf: Arc<RecordingPerf>,
    sched: Scheduler,
    cpus: Vec<CpuId>,
}

impl Sim {
    fn new(config: SchedConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let perf = Arc::new(RecordingPerf::default());
        let cpus: Vec<_> = (0..config.max_cpus as u32).map(CpuId::new).collect();
        let mut sched = Scheduler::new(config, clock.clone(), perf.clone()).unwrap();
        for &cpu in &cpus {
            sched.cpu_up(cpu).unwrap();
        }
        Self {
            clock,
            perf,
            sched,
            cpus,
        }
    }

    fn uniprocessor() -> Self {
        Self::new(SchedConfig::uniprocessor())
    }

    fn thread(&mut self, prio: u8) -> ThreadId {
        let thread = ThreadId::new();
        self.sched.create_context(thread, Priority::new(prio)).unwrap();
        thread
    }

    fn constraint(&mut self, params: ConstraintParams) -> ConstraintId {
        self.sched.create_constraint(params).unwrap()
    }

    fn sc(&self, thread: ThreadId) -> ScId {
        self.sched.context_of(thread).unwrap()
    }

    fn run_on(&mut self, thread: ThreadId, prio: u8, cpus: CpuSet) -> CpuId {
        let params = RunParams::new(Priority::new(prio)).on(cpus);
        let cpu = self.sched.run_thread(thread, params, CpuId::BOOT).unwrap();
        self.sched.schedule_pending();
        self.sched.assert_invariants();
        cpu
    }

    fn run(&mut self, thread: ThreadId, prio: u8) -> CpuId {
        self.run_on(thread, prio, CpuSet::all())
    }

    fn is_running(&self, thread: ThreadId) -> bool {
        self.cpus
            .iter()
            .any(|&cpu| self.sched.current(cpu) == Some(thread))
    }

    fn blocked_by(&self, thread: ThreadId) -> Option<ConstraintId> {
        self.sched.context(self.sc(thread)).unwrap().blocked_by()
    }

    /// Jump from timer interrupt to timer interrupt up to `until`
    ///
    /// Returns the interrupt times and how long `watch` was running.
    fn advance(&mut self, until: Time, watch: Option<ThreadId>) -> (Vec<Time>, Time) {
        let mut fired = Vec::new();
        let mut ran = 0;
        let mut last = self.sched.now();

        for _ in 0..100_000 {
            let next = self
                .cpus
                .iter()
                .filter_map(|&cpu| self.clock.programmed(cpu))
                .filter(|&deadline| deadline <= until)
                .min();
            let step = next.unwrap_or(until);
            if watch.is_some_and(|thread| self.is_running(thread)) {
                ran += step.saturating_sub(last);
            }
            self.clock.set(step);
            last = step;

            let Some(now) = next else {
                return (fired, ran);
            };
            fired.push(now);
            for cpu in self.cpus.clone() {
                if self.clock.programmed(cpu).is_some_and(|deadline| deadline <= now) {
                    self.sched.timer_interrupt(cpu);
                }
            }
            self.sched.schedule_pending();
            self.sched.assert_invariants();
        }
        panic!("timer storm before {}", until);
    }

    fn run_until(&mut self, until: Time) -> Vec<Time> {
        self.advance(until, None).0
    }
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn budget_left(sched: &Scheduler, id: ConstraintId) -> Time {
    match sched.constraint(id).map(|c| c.kind()) {
        Some(ConstraintKind::Budget(budget)) => budget.left(),
        other => panic!("{} is not a budget: {:?}", id, other),
    }
}

// =============================================================================
// Concrete scenarios
// =============================================================================

#[test]
fn test_highest_priority_runs_first() {
    let mut rq = ReadyQueue::new();
    let (low, high) = (ScId::from_raw(1), ScId::from_raw(2));

    rq.enqueue(low, Priority::new(10), Position::Back);
    rq.enqueue(high, Priority::new(200), Position::Back);
    assert_eq!(rq.next_to_run(), Some(high));

    rq.dequeue(high);
    assert_eq!(rq.next_to_run(), Some(low));
    assert_eq!(rq.highest(), Priority::new(10));
}

#[test]
fn test_budget_exhaustion_and_replenishment() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let budget = sim.constraint(ConstraintParams::Budget { budget: 1_000, period: 2_000 });
    sim.sched.attach(thread, budget).unwrap();
    sim.run(thread, 5);
    assert!(sim.is_running(thread));

    // Exhausted at the end of the budget
    assert_eq!(sim.run_until(1_500), [1_000]);
    assert!(!sim.sched.constraint(budget).unwrap().can_run());
    assert_eq!(sim.blocked_by(thread), Some(budget));
    assert_eq!(sim.sched.current(CpuId::BOOT), None);

    // Replenished at the period boundary
    assert_eq!(sim.run_until(2_500), [2_000]);
    assert!(sim.sched.constraint(budget).unwrap().can_run());
    assert!(sim.is_running(thread));
    assert_eq!(sim.sched.metrics().exhaustions(), 1);
    assert_eq!(sim.sched.metrics().replenishments(), 1);
    assert_eq!(sim.sched.metrics().budget_overruns(), 0);
}

#[test]
fn test_full_budget_replenished_at_exhaustion() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let budget = sim.constraint(ConstraintParams::Budget { budget: 1_000, period: 1_000 });
    sim.sched.attach(thread, budget).unwrap();
    sim.run(thread, 5);

    // Timeslice and replenishment fire together; timeslice goes first
    assert_eq!(sim.run_until(1_000), [1_000]);
    assert!(sim.sched.constraint(budget).unwrap().can_run());
    assert_eq!(budget_left(&sim.sched, budget), 1_000);
    assert!(sim.is_running(thread));
    assert_eq!(sim.sched.metrics().exhaustions(), 1);
    assert_eq!(sim.sched.metrics().replenishments(), 1);

    let info = sim.sched.constraint_info(budget).unwrap();
    assert_eq!(info.remaining, Some(1_000));
}

#[test]
fn test_first_denying_constraint_blocks() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let open = sim.constraint(ConstraintParams::Gate { run: true });
    let closed = sim.constraint(ConstraintParams::Gate { run: false });
    sim.sched.attach(thread, open).unwrap();
    sim.sched.attach(thread, closed).unwrap();
    sim.run(thread, 5);

    assert_eq!(sim.sched.can_run(thread), Ok(false));
    assert_eq!(sim.blocked_by(thread), Some(closed));
    assert_eq!(sim.sched.constraint(closed).unwrap().blocked_len(), 1);
    assert_eq!(sim.sched.constraint(open).unwrap().blocked_len(), 0);
    assert_eq!(sim.sched.current(CpuId::BOOT), None);
    assert_eq!(sim.sched.stats().blocked, 1);
}

#[test]
fn test_detaching_blocker_requeues() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let open = sim.constraint(ConstraintParams::Gate { run: true });
    let closed = sim.constraint(ConstraintParams::Gate { run: false });
    sim.sched.attach(thread, open).unwrap();
    sim.sched.attach(thread, closed).unwrap();
    sim.run(thread, 5);
    assert_eq!(sim.blocked_by(thread), Some(closed));

    sim.sched.detach(thread, closed).unwrap();
    sim.sched.assert_invariants();
    let sc = sim.sc(thread);
    assert_eq!(sim.blocked_by(thread), None);
    assert_eq!(
        sim.sched.ready_queue(CpuId::BOOT).unwrap().queued_prio(sc),
        Some(Priority::new(5))
    );
    assert_eq!(sim.sched.constraint(closed).unwrap().blocked_len(), 0);
    assert_eq!(sim.sched.constraint_info(closed).unwrap().refs, 1);

    sim.sched.schedule_pending();
    assert!(sim.is_running(thread));
    assert_eq!(sim.sched.detach(thread, closed), Err(SchedError::NotFound));
}

#[test]
fn test_single_time_window() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let window = sim.constraint(ConstraintParams::TimeWindow {
        start: 5_000,
        duration: 2_000,
        period: None,
    });
    sim.sched.attach(thread, window).unwrap();
    sim.run(thread, 5);

    let mut fired = sim.run_until(4_000);
    assert_eq!(sim.sched.can_run(thread), Ok(false));

    fired.extend(sim.run_until(6_000));
    assert_eq!(sim.sched.can_run(thread), Ok(true));
    assert!(sim.is_running(thread));

    fired.extend(sim.run_until(7_001));
    assert_eq!(sim.sched.can_run(thread), Ok(false));
    assert!(!sim.is_running(thread));
    assert_eq!(fired, [5_000, 7_000]);
    assert_eq!(sim.sched.metrics().timer_expirations(), 2);
}

#[test]
fn test_gate_releases_in_block_order() {
    let mut sim = Sim::uniprocessor();
    let gate = sim.constraint(ConstraintParams::Gate { run: false });
    let first = sim.thread(255);
    let second = sim.thread(255);
    sim.sched.attach(first, gate).unwrap();
    sim.sched.attach(second, gate).unwrap();
    sim.run(first, 255);
    sim.run(second, 255);

    assert_eq!(sim.blocked_by(first), Some(gate));
    assert_eq!(sim.blocked_by(second), Some(gate));
    let order: Vec<_> = sim.sched.constraint(gate).unwrap().blocked().collect();
    assert_eq!(order, [sim.sc(first), sim.sc(second)]);

    sim.sched.set_gate(gate, Some(true)).unwrap();
    sim.sched.assert_invariants();
    let rq = sim.sched.ready_queue(CpuId::BOOT).unwrap();
    assert_eq!(rq.bucket(Priority::MAX), [sim.sc(first), sim.sc(second)]);
    assert_eq!(sim.sched.metrics().releases(), 2);

    sim.sched.schedule_pending();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(first));
}

// =============================================================================
// Scheduling behaviour
// =============================================================================

#[test]
fn test_quantum_round_robin() {
    let mut sim = Sim::uniprocessor();
    let a = sim.thread(5);
    let b = sim.thread(5);
    for thread in [a, b] {
        let quantum = sim.constraint(ConstraintParams::Quantum { quantum: 1_000 });
        sim.sched.attach(thread, quantum).unwrap();
        sim.sched.release_constraint(quantum).unwrap();
        sim.run(thread, 5);
    }
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(a));

    sim.run_until(1_500);
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(b));
    sim.run_until(2_500);
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(a));
    assert!(sim.sched.metrics().preemptions() >= 2);
}

#[test]
fn test_preemption_keeps_remaining_quantum() {
    let mut sim = Sim::uniprocessor();
    let low = sim.thread(1);
    let high = sim.thread(9);
    let quantum = sim.constraint(ConstraintParams::Quantum { quantum: 1_000 });
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(low, quantum).unwrap();
    sim.sched.attach(high, gate).unwrap();

    sim.sched.run_thread(low, RunParams::new(Priority::new(1)), CpuId::BOOT).unwrap();
    sim.sched.run_thread(high, RunParams::new(Priority::new(9)), CpuId::BOOT).unwrap();
    sim.sched.thread_block(high).unwrap();
    sim.sched.schedule_pending();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(low));

    sim.clock.set(400);
    assert_eq!(sim.sched.thread_ready(high), Ok(true));
    sim.sched.schedule_pending();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(high));
    match sim.sched.constraint(quantum).unwrap().kind() {
        ConstraintKind::Quantum(q) => assert_eq!(q.left(), 600),
        other => panic!("unexpected {:?}", other),
    }

    sim.sched.thread_block(high).unwrap();
    sim.sched.schedule_pending();
    sim.sched.assert_invariants();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(low));
    assert_eq!(sim.clock.programmed(CpuId::BOOT), Some(1_000));
}

#[test]
fn test_caller_priority_suppresses_preemption() {
    let mut sim = Sim::uniprocessor();
    let running = sim.thread(5);
    let waking = sim.thread(5);
    for thread in [running, waking] {
        let gate = sim.constraint(ConstraintParams::Gate { run: true });
        sim.sched.attach(thread, gate).unwrap();
    }
    sim.run(running, 5);
    sim.run(waking, 5);
    sim.sched.thread_block(waking).unwrap();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(running));

    // A strictly higher caller priority suppresses the switch
    assert_eq!(sim.sched.deblock(waking, Some(Priority::new(6)), false), Ok(false));
    sim.sched.thread_block(waking).unwrap();
    assert_eq!(sim.sched.deblock(waking, Some(Priority::new(5)), false), Ok(true));
}

#[test]
fn test_lazy_deblock_and_direct_switch() {
    let mut sim = Sim::uniprocessor();
    let low = sim.thread(1);
    let high = sim.thread(9);
    for thread in [low, high] {
        let gate = sim.constraint(ConstraintParams::Gate { run: true });
        sim.sched.attach(thread, gate).unwrap();
    }
    sim.sched.run_thread(low, RunParams::new(Priority::new(1)), CpuId::BOOT).unwrap();
    sim.sched.run_thread(high, RunParams::new(Priority::new(9)), CpuId::BOOT).unwrap();
    sim.sched.thread_block(high).unwrap();
    sim.sched.schedule_pending();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(low));

    assert_eq!(sim.sched.deblock(high, None, true), Ok(true));
    let rq = sim.sched.ready_queue(CpuId::BOOT).unwrap();
    assert!(!rq.is_queued(sim.sc(high)));

    assert_eq!(sim.sched.switch_to(CpuId::BOOT, high), Ok(Some(high)));
    sim.sched.assert_invariants();
    let rq = sim.sched.ready_queue(CpuId::BOOT).unwrap();
    assert_eq!(rq.next_to_run(), Some(sim.sc(high)));
    assert!(rq.is_queued(sim.sc(low)));
}

#[test]
fn test_switch_to_denied_falls_back() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(thread, gate).unwrap();
    sim.run(thread, 5);
    sim.sched.thread_block(thread).unwrap();
    sim.sched.schedule_pending();

    sim.sched.set_gate(gate, Some(false)).unwrap();
    assert_eq!(sim.sched.deblock(thread, None, true), Ok(true));
    assert_eq!(sim.sched.switch_to(CpuId::BOOT, thread), Ok(None));
    assert_eq!(sim.blocked_by(thread), Some(gate));
    assert_eq!(
        sim.sched.switch_to(CpuId::new(3), thread),
        Err(SchedError::InvalidState)
    );
}

#[test]
fn test_yield_rotates_peers() {
    let mut sim = Sim::uniprocessor();
    let a = sim.thread(3);
    let b = sim.thread(3);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    for thread in [a, b] {
        sim.sched.attach(thread, gate).unwrap();
        sim.run(thread, 3);
    }
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(a));
    assert_eq!(sim.sched.yield_current(CpuId::BOOT), Some(b));
    assert_eq!(sim.sched.yield_current(CpuId::BOOT), Some(a));
    sim.sched.assert_invariants();
}

#[test]
fn test_set_priority_requeues() {
    let mut sim = Sim::uniprocessor();
    let a = sim.thread(3);
    let b = sim.thread(3);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    for thread in [a, b] {
        sim.sched.attach(thread, gate).unwrap();
        sim.run(thread, 3);
    }
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(a));

    sim.sched.set_priority(b, Priority::new(4)).unwrap();
    assert!(sim.sched.needs_reschedule(CpuId::BOOT));
    sim.sched.schedule_pending();
    assert_eq!(sim.sched.current(CpuId::BOOT), Some(b));
    let rq = sim.sched.ready_queue(CpuId::BOOT).unwrap();
    assert_eq!(rq.highest(), Priority::new(4));
}

#[test]
fn test_migration_moves_timers() {
    let mut sim = Sim::new(SchedConfig::new().with_cpus(2));
    let thread = sim.thread(5);
    let budget = sim.constraint(ConstraintParams::Budget { budget: 500, period: 1_000 });
    sim.sched.attach(thread, budget).unwrap();
    assert_eq!(sim.run_on(thread, 5, CpuSet::single(CpuId::BOOT)), CpuId::BOOT);

    let other = CpuId::new(1);
    assert_eq!(sim.run_on(thread, 5, CpuSet::single(other)), other);
    assert_eq!(sim.sched.current(other), Some(thread));
    assert_eq!(sim.sched.current(CpuId::BOOT), None);
    assert!(sim.sched.ready_queue(CpuId::BOOT).unwrap().is_empty());
    match sim.sched.constraint(budget).unwrap().kind() {
        ConstraintKind::Budget(b) => assert_eq!(b.replenishment_timer().cpu(), Some(other)),
        kind => panic!("unexpected {:?}", kind),
    }
    assert_eq!(sim.sched.metrics().migrations(), 1);

    // Run-thread with the home CPU still allowed keeps it
    assert_eq!(sim.run(thread, 5), other);
    assert_eq!(sim.sched.metrics().migrations(), 1);
}

#[test]
fn test_bandwidth_throttle() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let bw = sim.constraint(ConstraintParams::Bandwidth {
        read_mbs: 64,
        write_mbs: 128,
        period: None,
    });
    sim.sched.attach(thread, bw).unwrap();
    sim.run(thread, 5);
    assert!(sim.is_running(thread));
    assert_eq!(
        sim.perf.writes.lock().as_slice(),
        [(CpuId::BOOT, Counter::Read, 1_000), (CpuId::BOOT, Counter::Write, 2_000)]
    );

    assert!(sim.sched.handle_bandwidth_overflow(CpuId::BOOT));
    sim.sched.schedule(CpuId::BOOT);
    assert_eq!(sim.blocked_by(thread), Some(bw));
    assert_eq!(sim.perf.acks.load(Ordering::Relaxed), 2);
    assert_eq!(sim.sched.metrics().throttles(), 1);

    // The measurement period ends and the thread runs again
    assert_eq!(sim.run_until(1_500), [1_000]);
    assert!(sim.is_running(thread));
    assert_eq!(sim.perf.writes.lock().len(), 4);
}

#[test]
fn test_baseline_constraint_allocation() {
    let mut sim = Sim::new(SchedConfig::lenient());
    let thread = sim.thread(5);
    let params = RunParams {
        prio: Priority::new(5),
        quantum: 2_500,
        cpus: CpuSet::all(),
    };
    sim.sched.run_thread(thread, params, CpuId::BOOT).unwrap();
    sim.sched.schedule_pending();

    let ids = sim.sched.context(sim.sc(thread)).unwrap().constraints();
    assert_eq!(ids.len(), 1);
    let info = sim.sched.constraint_info(ids[0]).unwrap();
    assert_eq!(info.ty, ConstraintType::Quantum);
    assert_eq!(info.refs, 1);
    assert!(sim.is_running(thread));
    assert_eq!(sim.clock.programmed(CpuId::BOOT), Some(2_500));
}

#[test]
#[should_panic(expected = "has no scheduling constraints")]
fn test_unconstrained_run_thread_halts() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let _ = sim.sched.run_thread(thread, RunParams::new(Priority::new(5)), CpuId::BOOT);
}

#[test]
fn test_global_constraint_attached_on_run() {
    let mut sim = Sim::uniprocessor();
    let global = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.set_global_constraint(Some(global)).unwrap();
    assert_eq!(sim.sched.global_constraint(), Some(global));

    let thread = sim.thread(5);
    let quantum = sim.constraint(ConstraintParams::Quantum { quantum: 1_000 });
    sim.sched.attach(thread, quantum).unwrap();
    sim.run(thread, 5);
    assert!(sim.sched.context(sim.sc(thread)).unwrap().contains(global));
    assert_eq!(sim.sched.constraint_info(global).unwrap().refs, 3);

    // Already attached: a second run-thread adds nothing
    sim.run(thread, 5);
    assert_eq!(sim.sched.constraint_info(global).unwrap().refs, 3);

    sim.sched.set_global_constraint(None).unwrap();
    assert_eq!(sim.sched.constraint_info(global).unwrap().refs, 2);
}

// =============================================================================
// Object lifetime
// =============================================================================

#[test]
fn test_dying_constraint_lifecycle() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let other = sim.thread(5);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(thread, gate).unwrap();

    sim.sched.release_constraint(gate).unwrap();
    assert!(sim.sched.constraint_info(gate).unwrap().dying);
    assert_eq!(sim.sched.attach(other, gate), Err(SchedError::InvalidState));
    assert_eq!(sim.sched.release_constraint(gate), Err(SchedError::InvalidState));

    sim.sched.detach(thread, gate).unwrap();
    assert!(sim.sched.constraint(gate).is_none());
    assert_eq!(sim.sched.release_constraint(gate), Err(SchedError::NotFound));
}

#[test]
fn test_destroy_thread_cleans_up() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let runner = sim.thread(5);
    let gate = sim.constraint(ConstraintParams::Gate { run: false });
    let open = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(thread, gate).unwrap();
    sim.sched.attach(runner, open).unwrap();
    sim.run(thread, 5);
    sim.run(runner, 5);
    assert_eq!(sim.sched.constraint(gate).unwrap().blocked_len(), 1);

    sim.sched.destroy_thread(thread).unwrap();
    assert_eq!(sim.sched.constraint(gate).unwrap().blocked_len(), 0);
    assert_eq!(sim.sched.constraint_info(gate).unwrap().refs, 1);
    assert_eq!(sim.sched.context_of(thread), None);

    sim.sched.destroy_thread(runner).unwrap();
    sim.sched.schedule_pending();
    assert_eq!(sim.sched.current(CpuId::BOOT), None);
    assert_eq!(sim.sched.stats().contexts, 0);
    assert_eq!(sim.sched.destroy_thread(runner), Err(SchedError::NotFound));
    sim.sched.assert_invariants();
}

#[test]
fn test_quotas() {
    let mut sim = Sim::new(SchedConfig::uniprocessor().with_quota(1, 1));
    sim.thread(1);
    assert_eq!(
        sim.sched.create_context(ThreadId::new(), Priority::new(1)),
        Err(SchedError::OutOfMemory)
    );
    sim.constraint(ConstraintParams::Gate { run: true });
    assert_eq!(
        sim.sched.create_constraint(ConstraintParams::Gate { run: true }),
        Err(SchedError::OutOfMemory)
    );
}

// =============================================================================
// CPUs and hotplug
// =============================================================================

#[test]
fn test_hotplug_events() {
    let mut sim = Sim::new(SchedConfig::new());
    let sink = Arc::new(IrqCounter::default());
    sim.sched
        .icu_mut()
        .bind(0, 9, sink.clone(), IrqRights::all())
        .unwrap();

    let last = CpuId::new(3);
    sim.sched.cpu_down(last).unwrap();
    assert!(!sim.sched.is_online(last));
    assert_eq!(sim.sched.cpu_down(last), Err(SchedError::InvalidState));
    sim.sched.cpu_up(last).unwrap();
    assert_eq!(sim.sched.cpu_up(last), Err(SchedError::InvalidState));
    assert_eq!(sink.0.load(Ordering::Relaxed), 2);
    assert_eq!(sim.perf.setups.load(Ordering::Relaxed), 2 * 5);

    let thread = sim.thread(5);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(thread, gate).unwrap();
    let cpu = sim.run_on(thread, 5, CpuSet::single(last));
    assert_eq!(sim.sched.cpu_down(cpu), Err(SchedError::InvalidState));
    assert_eq!(sim.sched.cpu_up(CpuId::new(9)), Err(SchedError::OutOfRange));
}

#[test]
fn test_idle_time_accounting() {
    let mut sim = Sim::uniprocessor();
    sim.clock.set(300);
    assert_eq!(sim.sched.idle_time(CpuId::BOOT), Ok(300));

    let thread = sim.thread(5);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(thread, gate).unwrap();
    sim.run(thread, 5);
    sim.clock.set(1_000);
    assert_eq!(sim.sched.idle_time(CpuId::BOOT), Ok(300));

    sim.sched.thread_block(thread).unwrap();
    sim.sched.schedule_pending();
    sim.clock.set(1_200);
    assert_eq!(sim.sched.idle_time_in(&CpuSet::all()), Ok(500));
    assert_eq!(
        sim.sched.idle_time_in(&CpuSet::new(8, 0, 1)),
        Err(SchedError::InvalidArgument)
    );
}

// =============================================================================
// Invocation interface
// =============================================================================

#[test]
fn test_invoke_info() {
    let mut sim = Sim::new(SchedConfig::new());
    let msg = Message::new(&[0, CpuSet::new(0, 0, 0).descriptor()]).unwrap();
    assert_eq!(
        sim.sched.invoke(&msg, CpuId::BOOT),
        Ok(Reply::Info {
            cpu_map: 0b1111,
            max_cpus: 4,
            sched_classes: 1 << 1,
        })
    );

    let coarse = Message::new(&[0, CpuSet::new(0, 1, 0).descriptor()]).unwrap();
    assert!(matches!(
        sim.sched.invoke(&coarse, CpuId::BOOT),
        Ok(Reply::Info { cpu_map: 0b11, .. })
    ));

    let beyond = Message::new(&[0, CpuSet::new(4, 0, 0).descriptor()]).unwrap();
    assert_eq!(sim.sched.invoke(&beyond, CpuId::BOOT), Err(SchedError::OutOfRange));

    // Offline CPUs drop out of the map; a coarse bit stays set while any CPU behind it is up
    sim.sched.cpu_down(CpuId::new(3)).unwrap();
    assert!(matches!(
        sim.sched.invoke(&msg, CpuId::BOOT),
        Ok(Reply::Info { cpu_map: 0b0111, max_cpus: 4, .. })
    ));
    assert!(matches!(
        sim.sched.invoke(&coarse, CpuId::BOOT),
        Ok(Reply::Info { cpu_map: 0b11, .. })
    ));
    let tail = Message::new(&[0, CpuSet::new(2, 0, 0).descriptor()]).unwrap();
    assert!(matches!(
        sim.sched.invoke(&tail, CpuId::BOOT),
        Ok(Reply::Info { cpu_map: 0b01, .. })
    ));
}

#[test]
fn test_invoke_info_full_width() {
    let mut sim = Sim::new(SchedConfig::new().with_cpus(64));
    let msg = Message::new(&[0, CpuSet::new(0, 0, 0).descriptor()]).unwrap();
    assert!(matches!(
        sim.sched.invoke(&msg, CpuId::BOOT),
        Ok(Reply::Info { cpu_map: u64::MAX, max_cpus: 64, .. })
    ));

    let coarse = Message::new(&[0, CpuSet::new(0, 4, 0).descriptor()]).unwrap();
    assert!(matches!(
        sim.sched.invoke(&coarse, CpuId::BOOT),
        Ok(Reply::Info { cpu_map: 0b1111, .. })
    ));

    let wide = Message::new(&[0, 32 << 24]).unwrap();
    assert_eq!(sim.sched.invoke(&wide, CpuId::BOOT), Err(SchedError::InvalidArgument));
}

#[test]
fn test_invoke_rejects_unusable_cpu_sets() {
    let mut sim = Sim::new(SchedConfig::new());
    let thread = sim.thread(5);
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    sim.sched.attach(thread, gate).unwrap();

    // Granularities of 32 and up cannot describe 32-bit CPU numbers
    for granularity in [32u64, 40, 63, 255] {
        let run = Message::new(&[1, 5, 0, granularity << 24, 1])
            .unwrap()
            .with(Item::Thread(thread))
            .unwrap();
        assert_eq!(sim.sched.invoke(&run, CpuId::BOOT), Err(SchedError::InvalidArgument));

        let idle = Message::new(&[2, granularity << 24, 1]).unwrap();
        assert_eq!(sim.sched.invoke(&idle, CpuId::BOOT), Err(SchedError::InvalidArgument));
    }
    assert!(!sim.is_running(thread));

    // Offsets past the last CPU select nothing
    for offset in [4, 8, 0xff_ffff] {
        let set = CpuSet::new(offset, 0, u64::MAX);
        let run = Message::new(&[1, 5, 0, set.descriptor(), set.map()])
            .unwrap()
            .with(Item::Thread(thread))
            .unwrap();
        assert_eq!(sim.sched.invoke(&run, CpuId::BOOT), Err(SchedError::InvalidArgument));

        let idle = Message::new(&[2, set.descriptor(), set.map()]).unwrap();
        assert_eq!(sim.sched.invoke(&idle, CpuId::BOOT), Err(SchedError::InvalidArgument));
    }
    assert!(!sim.is_running(thread));

    // The widest accepted granularity still places the thread
    let run = Message::new(&[1, 5, 0, 31 << 24, 1])
        .unwrap()
        .with(Item::Thread(thread))
        .unwrap();
    assert_eq!(sim.sched.invoke(&run, CpuId::BOOT), Ok(Reply::Placed(CpuId::BOOT)));
}

#[test]
fn test_invoke_end_of_time_budget() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let create = Message::new(&[0, 0, 2, u64::MAX, u64::MAX]).unwrap();
    let Ok(Reply::Created(budget)) = sim.sched.invoke_factory(&create) else {
        panic!("budget not created");
    };
    let attach = Message::new(&[4])
        .unwrap()
        .with(Item::Thread(thread))
        .unwrap()
        .with(Item::Constraint(budget))
        .unwrap();
    assert_eq!(sim.sched.invoke(&attach, CpuId::BOOT), Ok(Reply::Done));

    sim.clock.set(10);
    let run = Message::new(&[1, 5, 0])
        .unwrap()
        .with(Item::Thread(thread))
        .unwrap();
    assert_eq!(sim.sched.invoke(&run, CpuId::BOOT), Ok(Reply::Placed(CpuId::BOOT)));
    sim.sched.schedule_pending();
    assert!(sim.is_running(thread));
    assert_eq!(sim.clock.programmed(CpuId::BOOT), Some(Time::MAX));

    assert!(sim.run_until(1_000_000).is_empty());
    assert!(sim.is_running(thread));
}

#[test]
fn test_end_of_time_periods() {
    let mut sim = Sim::uniprocessor();
    let thread = sim.thread(5);
    let bw = sim.constraint(ConstraintParams::Bandwidth {
        read_mbs: 64,
        write_mbs: 64,
        period: Some(Time::MAX),
    });
    sim.sched.attach(thread, bw).unwrap();
    sim.clock.set(10);
    sim.run(thread, 5);
    assert!(sim.is_running(thread));
    assert_eq!(sim.clock.programmed(CpuId::BOOT), Some(Time::MAX));

    // A window whose next repetition lies past the end of time stays closed
    let other = sim.thread(6);
    let window = sim.constraint(ConstraintParams::TimeWindow {
        start: 1_000,
        duration: 500,
        period: Some(Time::MAX - 1),
    });
    sim.sched.attach(other, window).unwrap();
    sim.run(other, 6);
    assert_eq!(sim.blocked_by(other), Some(window));

    sim.run_until(1_200);
    assert!(sim.is_running(other));
    sim.run_until(2_000);
    assert!(!sim.is_running(other));
    assert!(sim.is_running(thread));
    assert_eq!(sim.blocked_by(other), Some(window));
    assert_eq!(sim.clock.programmed(CpuId::BOOT), Some(Time::MAX));
}

#[test]
fn test_invoke_run_thread_and_attach() {
    let mut sim = Sim::new(SchedConfig::new());
    let thread = sim.thread(1);
    let msg = Message::new(&[4])
        .unwrap()
        .with(Item::Thread(thread))
        .unwrap();
    // Attach needs both a thread and a constraint
    assert_eq!(sim.sched.invoke(&msg, CpuId::BOOT), Err(SchedError::InvalidArgument));

    let created = Message::new(&[0, 0, 0, 1]).unwrap();
    let Ok(Reply::Created(gate)) = sim.sched.invoke_factory(&created) else {
        panic!("gate not created");
    };
    let attach = msg.with(Item::Constraint(gate)).unwrap();
    assert_eq!(sim.sched.invoke(&attach, CpuId::BOOT), Ok(Reply::Done));

    // Legacy layout without a CPU set; priority clamped
    let run = Message::new(&[1, 300, 0])
        .unwrap()
        .with(Item::Thread(thread))
        .unwrap();
    let cpu = CpuId::new(2);
    assert_eq!(sim.sched.invoke(&run, cpu), Ok(Reply::Placed(cpu)));
    assert_eq!(sim.sched.context(sim.sc(thread)).unwrap().prio(), Priority::MAX);

    let short = Message::new(&[1, 5]).unwrap().with(Item::Thread(thread)).unwrap();
    assert_eq!(sim.sched.invoke(&short, cpu), Err(SchedError::InvalidArgument));
    let unknown = Message::new(&[42]).unwrap();
    assert_eq!(sim.sched.invoke(&unknown, cpu), Err(SchedError::NotImplemented));

    let set = CpuSet::single(CpuId::new(1));
    let pinned = Message::new(&[1, 7, 0, set.descriptor(), set.map()])
        .unwrap()
        .with(Item::Thread(thread))
        .unwrap();
    assert_eq!(sim.sched.invoke(&pinned, cpu), Ok(Reply::Placed(CpuId::new(1))));
}

#[test]
fn test_invoke_constraint() {
    let mut sim = Sim::uniprocessor();
    let gate = sim.constraint(ConstraintParams::Gate { run: false });
    let budget = sim.constraint(ConstraintParams::Budget { budget: 10, period: 20 });

    let flip = Message::new(&[0]).unwrap();
    assert_eq!(sim.sched.invoke_constraint(gate, &flip), Ok(Reply::Done));
    let query = Message::new(&[2]).unwrap();
    let Ok(Reply::Constraint(info)) = sim.sched.invoke_constraint(gate, &query) else {
        panic!("no info reply");
    };
    assert!(info.run);
    assert_eq!(info.ty, ConstraintType::Gate);

    let close = Message::new(&[1, 0]).unwrap();
    assert_eq!(sim.sched.invoke_constraint(gate, &close), Ok(Reply::Done));
    assert!(!sim.sched.constraint(gate).unwrap().can_run());

    assert_eq!(
        sim.sched.invoke_constraint(budget, &flip),
        Err(SchedError::NotImplemented)
    );
    for op in [3, 4] {
        let msg = Message::new(&[op]).unwrap();
        assert_eq!(sim.sched.invoke_constraint(budget, &msg), Ok(Reply::Done));
    }
    let unknown = Message::new(&[9]).unwrap();
    assert_eq!(
        sim.sched.invoke_constraint(budget, &unknown),
        Err(SchedError::NotImplemented)
    );
}

#[test]
fn test_invoke_set_global_and_idle_time() {
    let mut sim = Sim::uniprocessor();
    let gate = sim.constraint(ConstraintParams::Gate { run: true });
    let set = Message::new(&[6]).unwrap().with(Item::Constraint(gate)).unwrap();
    assert_eq!(sim.sched.invoke(&set, CpuId::BOOT), Ok(Reply::Done));
    assert_eq!(sim.sched.global_constraint(), Some(gate));
    let clear = Message::new(&[6]).unwrap();
    assert_eq!(sim.sched.invoke(&clear, CpuId::BOOT), Ok(Reply::Done));
    assert_eq!(sim.sched.global_constraint(), None);

    sim.clock.set(250);
    let all = CpuSet::all();
    let idle = Message::new(&[2, all.descriptor(), all.map()]).unwrap();
    assert_eq!(sim.sched.invoke(&idle, CpuId::BOOT), Ok(Reply::IdleTime(250)));
}

#[test]
fn test_global_instance() {
    let sched = Scheduler::new(
        SchedConfig::uniprocessor(),
        Arc::new(ManualClock::new(0)),
        Arc::new(RecordingPerf::default()),
    )
    .unwrap();
    assert!(global::init(sched).is_ok());
    assert!(global::is_initialized());
    assert_eq!(global::with_scheduler(|s| s.config().max_cpus), Some(1));

    let again = Scheduler::new(
        SchedConfig::uniprocessor(),
        Arc::new(ManualClock::new(0)),
        Arc::new(RecordingPerf::default()),
    )
    .unwrap();
    assert_eq!(global::init(again), Err(SchedError::InvalidState));
}

// =============================================================================
// Properties
// =============================================================================

#[test]
fn test_ready_queue_properties() {
    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
    let mut rq = ReadyQueue::new();
    let mut model: BTreeMap<ScId, Priority> = BTreeMap::new();

    for _ in 0..5_000 {
        let sc = ScId::from_raw(rng.below(48) + 1);
        if rng.below(3) == 0 {
            assert_eq!(rq.dequeue(sc), model.remove(&sc).is_some());
        } else {
            let prio = Priority::new(rng.below(256) as u8);
            let pos = if rng.below(2) == 0 { Position::Front } else { Position::Back };
            let fresh = !model.contains_key(&sc);
            assert_eq!(rq.enqueue(sc, prio, pos), fresh);
            model.entry(sc).or_insert(prio);
        }

        rq.assert_consistent();
        assert_eq!(rq.len(), model.len());
        let max = model.values().max().copied();
        assert_eq!(rq.highest(), max.unwrap_or(Priority::MIN));
        match rq.next_to_run() {
            Some(head) => assert_eq!(model.get(&head).copied(), max),
            None => assert!(model.is_empty()),
        }
        for (&sc, &prio) in &model {
            assert_eq!(rq.queued_prio(sc), Some(prio));
        }
    }
}

#[test]
fn test_domination_is_strict() {
    for a in 0..=255u8 {
        for b in 0..=255u8 {
            let (pa, pb) = (Priority::new(a), Priority::new(b));
            assert_eq!(pa.dominates(pb), a > b);
            assert!(!(pa.dominates(pb) && pb.dominates(pa)));
        }
    }
}

#[test]
fn test_budget_conservation() {
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    for _ in 0..24 {
        let period = 100 + rng.below(5_000);
        let budget = 1 + rng.below(period);
        let periods = 1 + rng.below(8);

        let mut sim = Sim::uniprocessor();
        let thread = sim.thread(5);
        let id = sim.constraint(ConstraintParams::Budget { budget, period });
        sim.sched.attach(thread, id).unwrap();
        sim.run(thread, 5);

        let (_, ran) = sim.advance(periods * period, Some(thread));
        assert_eq!(ran, periods * budget, "budget {} period {}", budget, period);
        assert_eq!(sim.sched.metrics().budget_overruns(), 0);
    }
}

#[test]
fn test_periodic_window_admission() {
    let mut rng = XorShift(0xdead_beef_cafe_f00d);
    for _ in 0..24 {
        let period = 50 + rng.below(2_000);
        let duration = 1 + rng.below(period - 1);
        let start = rng.below(period - duration + 1);
        let periods = 1 + rng.below(6);

        let mut sim = Sim::uniprocessor();
        let thread = sim.thread(5);
        let id = sim.constraint(ConstraintParams::TimeWindow {
            start,
            duration,
            period: Some(period),
        });
        sim.sched.attach(thread, id).unwrap();
        sim.run(thread, 5);

        let (_, ran) = sim.advance(periods * period, Some(thread));
        assert_eq!(
            ran,
            periods * duration,
            "start {} duration {} period {}",
            start,
            duration,
            period
        );
    }
}
