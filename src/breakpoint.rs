//! Software breakpoints on live code.
//!
//! At most one breakpoint is armed at a time. Arming swaps an `int3` into the
//! code and remembers the byte it replaced; disarming puts that byte back.
//! A manager that is dropped while armed disarms itself.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{swap_code_byte, CodeMemory};

/// `int3`.
pub const INT3: u8 = 0xCC;

/// An armed breakpoint and the byte it displaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u32,
    pub original: u8,
}

pub struct BreakpointManager<M: CodeMemory> {
    memory: M,
    armed: Mutex<Option<Breakpoint>>,
}

impl<M: CodeMemory> BreakpointManager<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            armed: Mutex::new(None),
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Breakpoint>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a breakpoint at `address`.
    pub fn arm(&self, address: u32) -> Result<()> {
        let mut slot = self.slot();
        if let Some(bp) = *slot {
            return Err(Error::BreakpointAlreadyArmed(bp.address));
        }
        let original = swap_code_byte(&self.memory, address, INT3)?;
        debug!(address = format_args!("0x{:08x}", address), "breakpoint armed");
        *slot = Some(Breakpoint { address, original });
        Ok(())
    }

    /// Restore the displaced byte. Returns the breakpoint that was armed, if any.
    pub fn disarm(&self) -> Result<Option<Breakpoint>> {
        let mut slot = self.slot();
        let Some(bp) = *slot else {
            return Ok(None);
        };
        swap_code_byte(&self.memory, bp.address, bp.original)?;
        debug!(address = format_args!("0x{:08x}", bp.address), "breakpoint disarmed");
        *slot = None;
        Ok(Some(bp))
    }

    /// Address of the armed breakpoint.
    pub fn armed(&self) -> Option<u32> {
        self.slot().map(|bp| bp.address)
    }

    pub fn is_armed_at(&self, address: u32) -> bool {
        self.armed() == Some(address)
    }
}

impl<M: CodeMemory> Drop for BreakpointManager<M> {
    fn drop(&mut self) {
        if let Err(e) = self.disarm() {
            warn!(error = %e, "failed to disarm breakpoint on drop");
        }
    }
}
