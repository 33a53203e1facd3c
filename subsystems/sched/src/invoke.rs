//! # Invocation Interface
//!
//! User space manages scheduling through capability invocations. A message
//! carries a short array of machine words (word 0 is the opcode) plus the
//! kernel objects named by the capabilities it transfers.
//!
//! Three objects are invocable:
//! - the scheduler itself ([`SchedOp`])
//! - a scheduling constraint ([`ConstraintOp`])
//! - the constraint factory ([`Scheduler::invoke_factory`])
//!
//! Malformed messages are rejected with `InvalidArgument`, unknown opcodes
//! with `NotImplemented`.

use crate::factory;
use crate::priority::Priority;
use crate::scheduler::{ConstraintInfo, RunParams};
use crate::{ConstraintId, CpuId, CpuSet, SchedError, SchedResult, Scheduler, ThreadId, Time};
use arrayvec::ArrayVec;

/// Machine word
pub type Mword = u64;

/// Maximum number of words in a message
pub const MSG_WORDS: usize = 64;

/// Maximum number of objects transferred with a message
pub const MSG_ITEMS: usize = 4;

/// Scheduling classes reported by `Info` (fixed priority only)
pub const SCHED_CLASSES: Mword = 1 << 1;

/// Kernel object named by a transferred capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    /// An execution context
    Thread(ThreadId),
    /// A scheduling constraint
    Constraint(ConstraintId),
}

/// Invocation message
#[derive(Debug, Clone, Default)]
pub struct Message {
    words: ArrayVec<Mword, MSG_WORDS>,
    items: ArrayVec<Item, MSG_ITEMS>,
}

impl Message {
    /// Build a message from its words
    pub fn new(words: &[Mword]) -> SchedResult<Self> {
        let mut msg = Self::default();
        msg.words
            .try_extend_from_slice(words)
            .map_err(|_| SchedError::InvalidArgument)?;
        Ok(msg)
    }

    /// Append a transferred object
    pub fn with(mut self, item: Item) -> SchedResult<Self> {
        self.items
            .try_push(item)
            .map_err(|_| SchedError::InvalidArgument)?;
        Ok(self)
    }

    /// Message words
    pub fn words(&self) -> &[Mword] {
        &self.words
    }

    /// Transferred objects
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    fn word(&self, index: usize) -> SchedResult<Mword> {
        self.words.get(index).copied().ok_or(SchedError::InvalidArgument)
    }

    fn thread(&self, index: usize) -> SchedResult<ThreadId> {
        match self.items.get(index) {
            Some(Item::Thread(thread)) => Ok(*thread),
            _ => Err(SchedError::InvalidArgument),
        }
    }

    fn constraint(&self, index: usize) -> SchedResult<ConstraintId> {
        match self.items.get(index) {
            Some(Item::Constraint(id)) => Ok(*id),
            _ => Err(SchedError::InvalidArgument),
        }
    }
}

/// Scheduler opcodes
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedOp {
    /// `[op, cpuset-descr]`: CPU map, CPU count, scheduling classes
    Info = 0,
    /// `[op, prio, quantum, (cpuset-descr, cpuset-map)]` + thread
    RunThread = 1,
    /// `[op, cpuset-descr, cpuset-map]`: idle time of a CPU
    IdleTime = 2,
    /// `[op, prio]` + thread
    SetPrio = 3,
    /// `[op]` + thread + constraint
    AttachSc = 4,
    /// `[op]` + thread + constraint
    DetachSc = 5,
    /// `[op]` + optional constraint
    SetGlobalSc = 6,
}

impl SchedOp {
    /// Convert from an opcode word
    pub fn from_num(num: Mword) -> Option<Self> {
        match num {
            0 => Some(SchedOp::Info),
            1 => Some(SchedOp::RunThread),
            2 => Some(SchedOp::IdleTime),
            3 => Some(SchedOp::SetPrio),
            4 => Some(SchedOp::AttachSc),
            5 => Some(SchedOp::DetachSc),
            6 => Some(SchedOp::SetGlobalSc),
            _ => None,
        }
    }
}

/// Constraint opcodes
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    /// Invert a gate
    Flip = 0,
    /// `[op, run]`: set a gate
    SetRun = 1,
    /// Report the constraint state
    Info = 2,
    /// Log the constraint state
    Test = 3,
    /// Log the constraint state
    Print = 4,
}

impl ConstraintOp {
    /// Convert from an opcode word
    pub fn from_num(num: Mword) -> Option<Self> {
        match num {
            0 => Some(ConstraintOp::Flip),
            1 => Some(ConstraintOp::SetRun),
            2 => Some(ConstraintOp::Info),
            3 => Some(ConstraintOp::Test),
            4 => Some(ConstraintOp::Print),
            _ => None,
        }
    }
}

/// Invocation reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Success without payload
    Done,
    /// Answer to [`SchedOp::Info`]
    Info {
        /// Present CPUs, compressed like the request's CPU set
        cpu_map: Mword,
        /// Number of CPU slots
        max_cpus: Mword,
        /// Supported scheduling classes
        sched_classes: Mword,
    },
    /// Idle time in microseconds
    IdleTime(Time),
    /// CPU a thread was placed on
    Placed(CpuId),
    /// Handle of a new constraint
    Created(ConstraintId),
    /// Answer to [`ConstraintOp::Info`]
    Constraint(ConstraintInfo),
}

impl Scheduler {
    /// Invoke the scheduler object on behalf of CPU `caller`
    pub fn invoke(&mut self, msg: &Message, caller: CpuId) -> SchedResult<Reply> {
        let op = SchedOp::from_num(msg.word(0)?).ok_or(SchedError::NotImplemented)?;
        self.dispatch_op(op, msg, caller).map_err(|err| reject(op, err))
    }

    fn dispatch_op(&mut self, op: SchedOp, msg: &Message, caller: CpuId) -> SchedResult<Reply> {
        match op {
            SchedOp::Info => self.sys_info(msg),
            SchedOp::RunThread => self.sys_run_thread(msg, caller),
            SchedOp::IdleTime => {
                let cpus = CpuSet::decode(msg.word(1)?, msg.word(2)?)?;
                self.idle_time_in(&cpus).map(Reply::IdleTime)
            }
            SchedOp::SetPrio => {
                let prio = Priority::clamped(msg.word(1)?);
                self.set_priority(msg.thread(0)?, prio).map(|()| Reply::Done)
            }
            SchedOp::AttachSc | SchedOp::DetachSc => {
                if msg.items().len() != 2 {
                    return Err(SchedError::InvalidArgument);
                }
                let (thread, id) = (msg.thread(0)?, msg.constraint(1)?);
                let result = if op == SchedOp::AttachSc {
                    self.attach(thread, id)
                } else {
                    self.detach(thread, id)
                };
                result.map(|()| Reply::Done)
            }
            SchedOp::SetGlobalSc => {
                let id = match msg.items().len() {
                    0 => None,
                    1 => Some(msg.constraint(0)?),
                    _ => return Err(SchedError::InvalidArgument),
                };
                self.set_global_constraint(id).map(|()| Reply::Done)
            }
        }
    }

    /// Invoke constraint `id`
    pub fn invoke_constraint(&mut self, id: ConstraintId, msg: &Message) -> SchedResult<Reply> {
        let op = ConstraintOp::from_num(msg.word(0)?).ok_or(SchedError::NotImplemented)?;
        match op {
            ConstraintOp::Flip => self.set_gate(id, None).map(|()| Reply::Done),
            ConstraintOp::SetRun => {
                let run = msg.word(1)? != 0;
                self.set_gate(id, Some(run)).map(|()| Reply::Done)
            }
            ConstraintOp::Info => self.constraint_info(id).map(Reply::Constraint),
            ConstraintOp::Test => {
                let info = self.constraint_info(id)?;
                log::debug!("[sched] test {}: {:?}", id, info);
                Ok(Reply::Done)
            }
            ConstraintOp::Print => {
                let info = self.constraint_info(id)?;
                log::info!(
                    "[sched] {} {}: run={} refs={} blocked={} remaining={:?}",
                    id,
                    info.ty,
                    info.run,
                    info.refs,
                    info.blocked,
                    info.remaining
                );
                Ok(Reply::Done)
            }
        }
    }

    /// Invoke the constraint factory: `[label, _, tag, params...]`
    pub fn invoke_factory(&mut self, msg: &Message) -> SchedResult<Reply> {
        let params = factory::parse(msg.words(), self.config())?;
        self.create_constraint(params).map(Reply::Created)
    }

    fn sys_info(&self, msg: &Message) -> SchedResult<Reply> {
        let cpus = CpuSet::decode(msg.word(1)?, 0)?;
        let max_cpus = self.config().max_cpus;
        let offset = cpus.offset() as usize;
        if offset >= max_cpus {
            return Err(SchedError::OutOfRange);
        }

        // Only the first 64 << granularity CPUs past the offset fit the map
        let online = self.online_mask();
        let mut cpu_map: Mword = 0;
        for i in 0..max_cpus - offset {
            let bit = i >> cpus.granularity();
            if bit >= Mword::BITS as usize {
                break;
            }
            if online.contains(CpuId::new((offset + i) as u32)) {
                cpu_map |= 1 << bit;
            }
        }
        Ok(Reply::Info {
            cpu_map,
            max_cpus: max_cpus as Mword,
            sched_classes: SCHED_CLASSES,
        })
    }

    fn sys_run_thread(&mut self, msg: &Message, caller: CpuId) -> SchedResult<Reply> {
        let thread = msg.thread(0)?;
        let prio = Priority::clamped(msg.word(1)?);
        let quantum = msg.word(2)?;
        let cpus = if msg.words().len() >= 5 {
            CpuSet::decode(msg.word(3)?, msg.word(4)?)?
        } else {
            CpuSet::all()
        };

        let params = RunParams {
            prio,
            quantum,
            cpus,
        };
        self.run_thread(thread, params, caller).map(Reply::Placed)
    }
}

fn reject(op: SchedOp, err: SchedError) -> SchedError {
    if err == SchedError::InvalidArgument {
        log::warn!("[sched] malformed {:?} invocation rejected", op);
    }
    err
}
