//! Shared fixtures: a synthetic PE32 image and a simulated host CPU.
//!
//! The simulated host plays the trap sequence a real x86 thread would produce
//! once the resolver raises its exception:
//!
//! - the raise is delivered first; the handler rewrites EIP and sets TF
//! - while TF is set, every step along the entry's path raises a single-step
//! - with TF clear, execution runs until it lands on an `int3`

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use noceg::memory::SimulatedMemory;
use noceg::resolver::{Disposition, Host, ThreadContext, Trap, TrapSink, TRAP_FLAG};

pub const IMAGE_BASE: u32 = 0x0040_0000;
pub const TEXT_RVA: u32 = 0x1000;
pub const TEXT_RAW: usize = 0x400;
pub const CODE_BASE: u32 = IMAGE_BASE + TEXT_RVA;

pub const PAGE_EXECUTE_READ: u32 = 0x20;

/// Where the simulated resolver thread raises its exception.
pub const RAISE_SITE: u32 = 0x7700_1234;
/// Address of the simulated restart routine.
pub const RESTART_ROUTINE: u32 = 0x7700_8000;
pub const THREAD_ID: u32 = 0x1F4;

/// Little-endian writes into a growing byte buffer.
pub struct ImageBuilder {
    code: Vec<u8>,
    dll_characteristics: u16,
}

impl ImageBuilder {
    /// `size` bytes of `int3` filler.
    pub fn new(size: usize) -> Self {
        Self {
            code: vec![0xCC; size],
            dll_characteristics: 0,
        }
    }

    pub fn with_aslr(mut self) -> Self {
        self.dll_characteristics |= 0x0040;
        self
    }

    pub fn bytes(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.code[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// `E8 rel32` at `at` calling code offset `target`.
    pub fn call(self, at: usize, target: usize) -> Self {
        let rel = target as i32 - (at as i32 + 5);
        let mut insn = vec![0xE8];
        insn.extend_from_slice(&rel.to_le_bytes());
        self.bytes(at, &insn)
    }

    /// PE32 file with the code as the only section, raw data at 0x400.
    pub fn build(self) -> Vec<u8> {
        let size = self.code.len() as u32;
        let mut data = vec![0u8; TEXT_RAW + self.code.len()];
        put(&mut data, 0, &0x5A4Du16.to_le_bytes());
        put(&mut data, 0x3C, &0x80u32.to_le_bytes());
        put(&mut data, 0x80, &0x0000_4550u32.to_le_bytes());
        put(&mut data, 0x84, &0x014Cu16.to_le_bytes());
        put(&mut data, 0x86, &1u16.to_le_bytes());
        put(&mut data, 0x94, &0xE0u16.to_le_bytes());

        let opt = 0x98;
        put(&mut data, opt, &0x010Bu16.to_le_bytes());
        put(&mut data, opt + 28, &IMAGE_BASE.to_le_bytes());
        put(&mut data, opt + 0x46, &self.dll_characteristics.to_le_bytes());

        let section = opt + 0xE0;
        put(&mut data, section, b".text\0\0\0");
        put(&mut data, section + 8, &size.to_le_bytes());
        put(&mut data, section + 12, &TEXT_RVA.to_le_bytes());
        put(&mut data, section + 16, &size.to_le_bytes());
        put(&mut data, section + 20, &(TEXT_RAW as u32).to_le_bytes());

        put(&mut data, TEXT_RAW, &self.code);
        data
    }
}

fn put(data: &mut [u8], offset: usize, bytes: &[u8]) {
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
}

impl ThreadContext for Registers {
    fn eip(&self) -> u32 {
        self.eip
    }

    fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    fn eflags(&self) -> u32 {
        self.eflags
    }

    fn set_eflags(&mut self, eflags: u32) {
        self.eflags = eflags;
    }

    fn eax(&self) -> u32 {
        self.eax
    }
}

/// One protected routine as the simulated CPU executes it.
#[derive(Clone, Debug)]
pub struct Routine {
    /// Instruction addresses from the redirect EIP to the breakpoint.
    pub path: Vec<u32>,
    /// EAX once the routine's computation is done.
    pub result: u32,
}

impl Routine {
    /// eip -> (glue) -> function -> (body) -> bp
    pub fn new(eip: u32, function: u32, bp: u32, result: u32) -> Self {
        Self {
            path: vec![eip, eip + 2, function, function + 3, bp],
            result,
        }
    }
}

/// What the resolver did to the simulated process.
#[derive(Debug, Default)]
pub struct HostLog {
    pub init_calls: usize,
    pub register_thread_calls: usize,
    pub raises: usize,
    pub single_steps: usize,
    pub restarts: usize,
    pub finished: Option<usize>,
    pub terminated: Option<u32>,
}

/// A host thread that executes routines keyed by their redirect EIP.
pub struct SimulatedHost<'m> {
    pub memory: &'m SimulatedMemory,
    pub routines: HashMap<u32, Routine>,
    pub init_ok: bool,
    pub log: RefCell<HostLog>,
    resumed_at: Cell<u32>,
}

impl<'m> SimulatedHost<'m> {
    pub fn new(memory: &'m SimulatedMemory) -> Self {
        Self {
            memory,
            routines: HashMap::new(),
            init_ok: true,
            log: RefCell::new(HostLog::default()),
            resumed_at: Cell::new(0),
        }
    }

    pub fn routine(mut self, routine: Routine) -> Self {
        // Breakpoint sites must be mapped for the resolver to arm them.
        for &address in &routine.path {
            if self.memory.byte(address).is_none() {
                self.memory.load(address, &[0x90]);
            }
        }
        self.routines.insert(routine.path[0], routine);
        self
    }

    /// EIP the thread continued at after the last handled breakpoint.
    pub fn resumed_at(&self) -> u32 {
        self.resumed_at.get()
    }

    fn run_routine(&self, regs: &mut Registers, sink: &dyn TrapSink<Registers>) {
        let Some(routine) = self.routines.get(&regs.eip).cloned() else {
            return;
        };
        for (step, &address) in routine.path.iter().enumerate() {
            regs.eip = address;
            if step + 1 == routine.path.len() {
                regs.eax = routine.result;
            }
            if self.memory.byte(address) == Some(0xCC) {
                sink.on_trap(Trap::Breakpoint, regs, THREAD_ID);
                self.resumed_at.set(regs.eip);
                if regs.eip == RESTART_ROUTINE {
                    self.log.borrow_mut().restarts += 1;
                }
                return;
            }
            if step > 0 && regs.eflags & TRAP_FLAG != 0 {
                self.log.borrow_mut().single_steps += 1;
                sink.on_trap(Trap::SingleStep, regs, THREAD_ID);
            }
        }
    }
}

impl Host for SimulatedHost<'_> {
    type Context = Registers;

    fn call_init(&self, _address: u32) -> bool {
        self.log.borrow_mut().init_calls += 1;
        self.init_ok
    }

    fn call_register_thread(&self, _address: u32) {
        self.log.borrow_mut().register_thread_calls += 1;
    }

    fn raise(&self, code: u32, sink: &dyn TrapSink<Registers>) {
        self.log.borrow_mut().raises += 1;
        let mut regs = Registers {
            eip: RAISE_SITE,
            eflags: 0x202,
            eax: 0,
        };
        let delivered = code & !0x1000_0000;
        if sink.on_trap(Trap::Raised(delivered), &mut regs, THREAD_ID)
            == Disposition::ContinueSearch
        {
            return;
        }
        self.run_routine(&mut regs, sink);
    }

    fn restart_routine(&self) -> u32 {
        RESTART_ROUTINE
    }

    fn current_thread_id(&self) -> u32 {
        THREAD_ID
    }

    fn finish(&self, resolved: usize) {
        self.log.borrow_mut().finished = Some(resolved);
    }

    fn terminate(&self, exit_code: u32) {
        self.log.borrow_mut().terminated = Some(exit_code);
    }
}
