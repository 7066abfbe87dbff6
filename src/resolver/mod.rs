//! Runtime resolution of protected values inside the host process.
//!
//! For every unresolved catalog entry the resolver arms a breakpoint where the
//! protected computation finishes, then raises a private exception. The trap
//! sequence that follows is a small state machine:
//!
//! ```text
//!  run()                         on_trap()
//!  -----                         ---------
//!  SelectingEntry
//!  Dispatching  (arm bp)
//!  AwaitingRedirect --raise-->   save context, EIP = entry EIP, TF = 1
//!                                AwaitingTargetReached
//!                  single-step:  EIP == target -> TF = 0
//!                                AwaitingBreakpoint
//!                  breakpoint:   disarm, capture EAX, persist
//!                                Captured -> RestartPending (EIP = restart routine)
//!                                         -> SelectingEntry (restore context)
//!  <--------------------------- raise returns
//!  next entry ... Done
//! ```
//!
//! Only the thread that runs the entry loop advances the machine; traps on
//! any other thread are passed on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::breakpoint::BreakpointManager;
use crate::catalog::{Catalog, CatalogEntry, Category};
use crate::error::{Error, Result};
use crate::memory::CodeMemory;

#[cfg(all(target_os = "windows", target_arch = "x86"))]
pub mod windows;

/// Code passed to `RaiseException`.
pub const RAISED_EXCEPTION_CODE: u32 = 0xDEAD_DEAD;

/// Windows clears bit 28 (reserved) of raised codes before dispatch.
pub const HANDLED_EXCEPTION_CODE: u32 = RAISED_EXCEPTION_CODE & !0x1000_0000;

/// EFLAGS trap flag.
pub const TRAP_FLAG: u32 = 0x100;

pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
pub const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;

/// Catalog file name, next to the host executable.
pub const CATALOG_FILE: &str = "noceg.json";

/// Log file name, next to the host executable.
pub const LOG_FILE: &str = "noceg.log";

/// Where the resolver keeps its files and which exception it raises.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub catalog_path: PathBuf,
    pub log_path: PathBuf,
    pub exception_code: u32,
}

impl ResolverConfig {
    /// Catalog and log next to the host executable.
    pub fn beside(executable_dir: &Path) -> Self {
        Self {
            catalog_path: executable_dir.join(CATALOG_FILE),
            log_path: executable_dir.join(LOG_FILE),
            exception_code: RAISED_EXCEPTION_CODE,
        }
    }

    /// Code the handler sees for [`ResolverConfig::exception_code`].
    pub fn handled_code(&self) -> u32 {
        self.exception_code & !0x1000_0000
    }
}

/// Resolver state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResolverState {
    Idle = 0,
    Initializing,
    SelectingEntry,
    Dispatching,
    AwaitingRedirect,
    AwaitingTargetReached,
    AwaitingBreakpoint,
    Captured,
    RestartPending,
    Done,
}

impl ResolverState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::SelectingEntry,
            3 => Self::Dispatching,
            4 => Self::AwaitingRedirect,
            5 => Self::AwaitingTargetReached,
            6 => Self::AwaitingBreakpoint,
            7 => Self::Captured,
            8 => Self::RestartPending,
            9 => Self::Done,
            _ => Self::Idle,
        }
    }
}

/// CPU registers the resolver reads or rewrites.
pub trait ThreadContext: Clone + Send {
    fn eip(&self) -> u32;
    fn set_eip(&mut self, eip: u32);
    fn eflags(&self) -> u32;
    fn set_eflags(&mut self, eflags: u32);
    fn eax(&self) -> u32;
}

/// An exception delivered to the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    SingleStep,
    Breakpoint,
    IllegalInstruction,
    /// Any other code, including the resolver's own.
    Raised(u32),
}

impl Trap {
    pub fn from_code(code: u32) -> Self {
        match code {
            EXCEPTION_SINGLE_STEP => Trap::SingleStep,
            EXCEPTION_BREAKPOINT => Trap::Breakpoint,
            EXCEPTION_ILLEGAL_INSTRUCTION => Trap::IllegalInstruction,
            other => Trap::Raised(other),
        }
    }
}

/// What the exception dispatcher should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Resume with the (possibly rewritten) context.
    ContinueExecution,
    /// Not ours; let the next handler look at it.
    ContinueSearch,
}

/// Receiver of traps raised while an entry is dispatched.
pub trait TrapSink<C: ThreadContext> {
    fn on_trap(&self, trap: Trap, context: &mut C, thread_id: u32) -> Disposition;
}

/// Everything the resolver needs from the process it runs in.
pub trait Host {
    type Context: ThreadContext;

    /// Call the CEG init function; `true` on success.
    fn call_init(&self, address: u32) -> bool;

    /// Call the CEG register-thread function, ignoring its result.
    fn call_register_thread(&self, address: u32);

    /// Raise `code` on the current thread. Traps are delivered to `sink`;
    /// returns once execution comes back to the raise site.
    fn raise(&self, code: u32, sink: &dyn TrapSink<Self::Context>);

    /// Address execution is sent to when a restart is requested.
    fn restart_routine(&self) -> u32;

    fn current_thread_id(&self) -> u32;

    /// Tell the user every entry has been resolved.
    fn finish(&self, resolved: usize);

    /// End the host process.
    fn terminate(&self, exit_code: u32);
}

/// How [`Resolver::run`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// No unresolved entries remain.
    Completed { resolved: usize },
    /// A capture requested a relaunch; the restart routine has taken over.
    Restarting,
}

/// Resolver fields touched from exception-handler context.
#[derive(Debug, Default)]
pub struct RuntimeState {
    state: AtomicU8,
    index: AtomicUsize,
    target: AtomicU32,
    eip: AtomicU32,
    owner_thread: AtomicU32,
    captured: AtomicBool,
    restart_pending: AtomicBool,
}

impl RuntimeState {
    pub fn state(&self) -> ResolverState {
        ResolverState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ResolverState) {
        debug!(?state, "resolver state");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::SeqCst)
    }
}

/// Reason an entry cannot be dispatched.
fn validate(entry: &CatalogEntry) -> std::result::Result<(), &'static str> {
    if entry.function == 0 {
        return Err("function address is zero");
    }
    if entry.record.eip == 0 {
        return Err("EIP address is zero");
    }
    if entry.record.bp == 0 {
        return Err("BP address is zero");
    }
    Ok(())
}

/// The entry loop and trap handler, owning the catalog and the breakpoint.
pub struct Resolver<H: Host, M: CodeMemory> {
    config: ResolverConfig,
    host: H,
    breakpoints: BreakpointManager<M>,
    catalog: Mutex<Catalog>,
    runtime: RuntimeState,
    saved_context: Mutex<Option<H::Context>>,
}

impl<H: Host, M: CodeMemory> Resolver<H, M> {
    pub fn new(config: ResolverConfig, catalog: Catalog, host: H, memory: M) -> Self {
        Self {
            config,
            host,
            breakpoints: BreakpointManager::new(memory),
            catalog: Mutex::new(catalog),
            runtime: RuntimeState::default(),
            saved_context: Mutex::new(None),
        }
    }

    /// Load the catalog named by `config`.
    pub fn load(config: ResolverConfig, host: H, memory: M) -> Result<Self> {
        let catalog = Catalog::load(&config.catalog_path)?;
        Ok(Self::new(config, catalog, host, memory))
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn breakpoints(&self) -> &BreakpointManager<M> {
        &self.breakpoints
    }

    pub fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn saved_context(&self) -> MutexGuard<'_, Option<H::Context>> {
        self.saved_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn skip(&self, index: usize) {
        self.runtime.index.store(index + 1, Ordering::SeqCst);
    }

    /// Run init, then resolve every pending entry.
    pub fn run(&self) -> Result<RunOutcome> {
        self.runtime.set_state(ResolverState::Initializing);
        let (init, register_thread) = {
            let catalog = self.catalog();
            (catalog.init, catalog.register_thread)
        };
        if init == 0 {
            return Err(Error::MissingAnchor { name: "Init" });
        }
        if !self.host.call_init(init) {
            return Err(Error::InitRejected(init));
        }
        info!(address = format_args!("0x{:08X}", init), "CEG initialised");

        self.runtime
            .owner_thread
            .store(self.host.current_thread_id(), Ordering::SeqCst);

        loop {
            self.runtime.set_state(ResolverState::SelectingEntry);

            let (index, slot) = {
                let catalog = self.catalog();
                let Some(index) = catalog.first_unresolved(self.runtime.index()) else {
                    break;
                };
                (index, catalog.entry(index).copied())
            };
            self.runtime.index.store(index, Ordering::SeqCst);

            let Some(entry) = slot else {
                warn!(index, "skipping malformed entry");
                self.skip(index);
                continue;
            };
            if let Err(reason) = validate(&entry) {
                warn!(index, reason, "skipping entry");
                self.skip(index);
                continue;
            }

            self.runtime.set_state(ResolverState::Dispatching);
            self.runtime.target.store(entry.function, Ordering::SeqCst);
            self.runtime.eip.store(entry.record.eip, Ordering::SeqCst);
            self.runtime.captured.store(false, Ordering::SeqCst);

            if let Err(e) = self.breakpoints.arm(entry.record.bp) {
                warn!(index, error = %e, "cannot arm breakpoint, skipping entry");
                self.skip(index);
                continue;
            }

            if entry.record.category != Category::StolenV1 && register_thread != 0 {
                self.host.call_register_thread(register_thread);
            }

            info!(
                index,
                function = format_args!("0x{:08X}", entry.function),
                category = entry.record.category.name(),
                "dispatching entry"
            );
            self.runtime.set_state(ResolverState::AwaitingRedirect);
            self.host.raise(self.config.exception_code, self);

            if self.runtime.restart_pending() {
                return Ok(RunOutcome::Restarting);
            }
            if !self.runtime.captured.load(Ordering::SeqCst) {
                if let Err(e) = self.breakpoints.disarm() {
                    warn!(error = %e, "failed to disarm breakpoint");
                }
                warn!(index, "entry was not captured, skipping");
                self.skip(index);
            }
        }

        self.runtime.set_state(ResolverState::Done);
        let catalog = self.catalog();
        let resolved = catalog.typed_entries().filter(|(_, e)| e.is_resolved()).count();
        info!(resolved, pending = catalog.unresolved_count(), "all entries processed");
        Ok(RunOutcome::Completed { resolved })
    }

    /// Run to completion and end the process the way the outcome demands.
    pub fn execute(&self) {
        match self.run() {
            Ok(RunOutcome::Completed { resolved }) => {
                self.host.finish(resolved);
                self.host.terminate(0);
            }
            Ok(RunOutcome::Restarting) => {}
            Err(e) => {
                error!(error = %e, "resolver failed");
                if let Err(e) = self.breakpoints.disarm() {
                    warn!(error = %e, "failed to disarm breakpoint");
                }
                self.host.terminate(1);
            }
        }
    }

    fn on_redirect(&self, context: &mut H::Context) -> Disposition {
        if self.runtime.state() != ResolverState::AwaitingRedirect {
            return Disposition::ContinueSearch;
        }
        *self.saved_context() = Some(context.clone());

        let eip = self.runtime.eip.load(Ordering::SeqCst);
        context.set_eip(eip);
        context.set_eflags(context.eflags() | TRAP_FLAG);
        debug!(eip = format_args!("0x{:08X}", eip), "redirected");
        self.runtime.set_state(ResolverState::AwaitingTargetReached);
        Disposition::ContinueExecution
    }

    fn on_single_step(&self, context: &mut H::Context) -> Disposition {
        if self.runtime.state() != ResolverState::AwaitingTargetReached {
            return Disposition::ContinueSearch;
        }
        if context.eip() == self.runtime.target.load(Ordering::SeqCst) {
            debug!(eip = format_args!("0x{:08X}", context.eip()), "target reached");
            context.set_eflags(context.eflags() & !TRAP_FLAG);
            self.runtime.set_state(ResolverState::AwaitingBreakpoint);
        } else {
            context.set_eflags(context.eflags() | TRAP_FLAG);
        }
        Disposition::ContinueExecution
    }

    fn on_breakpoint(&self, context: &mut H::Context) -> Disposition {
        if !self.breakpoints.is_armed_at(context.eip()) {
            return Disposition::ContinueSearch;
        }
        if let Err(e) = self.breakpoints.disarm() {
            warn!(error = %e, "failed to disarm breakpoint");
        }
        self.runtime.set_state(ResolverState::Captured);

        let value = context.eax();
        let index = self.runtime.index();
        info!(index, value = format_args!("0x{:08X}", value), "captured");

        let should_restart = {
            let mut catalog = self.catalog();
            if !catalog.update_value(index, value) {
                warn!(index, "captured value has no entry to go to");
            }
            if let Err(e) = catalog.save(&self.config.catalog_path) {
                warn!(error = %e, "failed to save catalog");
            }
            catalog.should_restart
        };
        self.runtime.captured.store(true, Ordering::SeqCst);

        if should_restart {
            self.runtime.restart_pending.store(true, Ordering::SeqCst);
            self.runtime.set_state(ResolverState::RestartPending);
            context.set_eip(self.host.restart_routine());
            return Disposition::ContinueExecution;
        }

        match self.saved_context().take() {
            Some(saved) => *context = saved,
            None => warn!("no saved context to restore"),
        }
        self.skip(index);
        self.runtime.set_state(ResolverState::SelectingEntry);
        Disposition::ContinueExecution
    }

    fn on_illegal_instruction(&self) -> Disposition {
        if !self.runtime.restart_pending() {
            return Disposition::ContinueSearch;
        }
        warn!("illegal instruction while a restart is pending, forcing exit");
        if let Err(e) = self.breakpoints.disarm() {
            warn!(error = %e, "failed to disarm breakpoint");
        }
        self.host.terminate(1);
        Disposition::ContinueSearch
    }
}

impl<H: Host, M: CodeMemory> TrapSink<H::Context> for Resolver<H, M> {
    fn on_trap(&self, trap: Trap, context: &mut H::Context, thread_id: u32) -> Disposition {
        if thread_id != self.runtime.owner_thread.load(Ordering::SeqCst) {
            return Disposition::ContinueSearch;
        }
        match trap {
            Trap::Raised(code) if code == self.config.handled_code() => self.on_redirect(context),
            Trap::Raised(_) => Disposition::ContinueSearch,
            Trap::SingleStep => self.on_single_step(context),
            Trap::Breakpoint => self.on_breakpoint(context),
            Trap::IllegalInstruction => self.on_illegal_instruction(),
        }
    }
}
