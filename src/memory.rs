//! Code-memory access for the runtime resolver.
//!
//! The resolver patches single bytes of live code. All access goes through the
//! [`CodeMemory`] trait so the breakpoint logic can run against
//! [`SimulatedMemory`] in tests and against the host process on 32-bit Windows.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::error::{Error, Result};

#[cfg(all(target_os = "windows", target_arch = "x86"))]
use windows::Win32::{
    System::Diagnostics::Debug::FlushInstructionCache,
    System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS},
    System::Threading::GetCurrentProcess,
};

/// `PAGE_EXECUTE_READWRITE`.
pub const PROTECTION_RWX: u32 = 0x40;

/// Byte-level access to executable memory.
pub trait CodeMemory {
    /// Make `[address, address + len)` writable; returns the previous protection.
    fn make_writable(&self, address: u32, len: usize) -> Result<u32>;

    /// Put back a protection returned by [`CodeMemory::make_writable`].
    fn restore_protection(&self, address: u32, len: usize, protection: u32) -> Result<()>;

    fn read_byte(&self, address: u32) -> Result<u8>;

    fn write_byte(&self, address: u32, value: u8) -> Result<()>;

    /// Flush the instruction cache for a modified range.
    fn flush(&self, address: u32, len: usize);
}

impl<M: CodeMemory + ?Sized> CodeMemory for &M {
    fn make_writable(&self, address: u32, len: usize) -> Result<u32> {
        (**self).make_writable(address, len)
    }

    fn restore_protection(&self, address: u32, len: usize, protection: u32) -> Result<()> {
        (**self).restore_protection(address, len, protection)
    }

    fn read_byte(&self, address: u32) -> Result<u8> {
        (**self).read_byte(address)
    }

    fn write_byte(&self, address: u32, value: u8) -> Result<()> {
        (**self).write_byte(address, value)
    }

    fn flush(&self, address: u32, len: usize) {
        (**self).flush(address, len)
    }
}

/// Scoped protection change: writable while alive, restored on drop.
pub struct ProtectionGuard<'a, M: CodeMemory + ?Sized> {
    memory: &'a M,
    address: u32,
    len: usize,
    previous: u32,
}

impl<'a, M: CodeMemory + ?Sized> ProtectionGuard<'a, M> {
    pub fn new(memory: &'a M, address: u32, len: usize) -> Result<Self> {
        let previous = memory.make_writable(address, len)?;
        Ok(Self {
            memory,
            address,
            len,
            previous,
        })
    }
}

impl<M: CodeMemory + ?Sized> Drop for ProtectionGuard<'_, M> {
    fn drop(&mut self) {
        if let Err(e) = self
            .memory
            .restore_protection(self.address, self.len, self.previous)
        {
            warn!(
                address = format_args!("0x{:08x}", self.address),
                error = %e,
                "failed to restore page protection"
            );
        }
    }
}

/// Replace one code byte, returning the byte it replaced.
pub fn swap_code_byte<M: CodeMemory + ?Sized>(memory: &M, address: u32, value: u8) -> Result<u8> {
    let _guard = ProtectionGuard::new(memory, address, 1)?;
    let original = memory.read_byte(address)?;
    memory.write_byte(address, value)?;
    memory.flush(address, 1);
    Ok(original)
}

/// Code memory of the current process.
#[cfg(all(target_os = "windows", target_arch = "x86"))]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessMemory;

#[cfg(all(target_os = "windows", target_arch = "x86"))]
impl CodeMemory for ProcessMemory {
    fn make_writable(&self, address: u32, len: usize) -> Result<u32> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(
                address as usize as *const _,
                len,
                PAGE_EXECUTE_READWRITE,
                &mut old,
            )
        }
        .map_err(|_| Error::ProtectionChangeFailed(address))?;
        Ok(old.0)
    }

    fn restore_protection(&self, address: u32, len: usize, protection: u32) -> Result<()> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(
                address as usize as *const _,
                len,
                PAGE_PROTECTION_FLAGS(protection),
                &mut old,
            )
        }
        .map_err(|_| Error::ProtectionChangeFailed(address))
    }

    fn read_byte(&self, address: u32) -> Result<u8> {
        // SAFETY: the caller made the page accessible through a ProtectionGuard.
        Ok(unsafe { std::ptr::read_volatile(address as usize as *const u8) })
    }

    fn write_byte(&self, address: u32, value: u8) -> Result<()> {
        // SAFETY: as above; the page is RWX for the guard's lifetime.
        unsafe { std::ptr::write_volatile(address as usize as *mut u8, value) };
        Ok(())
    }

    fn flush(&self, address: u32, len: usize) {
        unsafe {
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(address as usize as *const _),
                len,
            );
        }
    }
}

const PAGE_MASK: u32 = !0xFFF;

#[derive(Default)]
struct SimulatedState {
    bytes: HashMap<u32, u8>,
    protection: HashMap<u32, u32>,
    flushes: usize,
}

/// In-memory stand-in for process code, with per-page protection.
///
/// Pages start with `default_protection`; reads and writes fail on unknown
/// bytes and writes fail on pages that are not `PAGE_EXECUTE_READWRITE`.
pub struct SimulatedMemory {
    state: Mutex<SimulatedState>,
    default_protection: u32,
}

impl SimulatedMemory {
    pub fn new(default_protection: u32) -> Self {
        Self {
            state: Mutex::new(SimulatedState::default()),
            default_protection,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map `bytes` starting at `address`.
    pub fn load(&self, address: u32, bytes: &[u8]) {
        let mut state = self.state();
        for (i, b) in bytes.iter().enumerate() {
            state.bytes.insert(address.wrapping_add(i as u32), *b);
        }
    }

    pub fn byte(&self, address: u32) -> Option<u8> {
        self.state().bytes.get(&address).copied()
    }

    pub fn protection(&self, address: u32) -> u32 {
        self.state()
            .protection
            .get(&(address & PAGE_MASK))
            .copied()
            .unwrap_or(self.default_protection)
    }

    pub fn flush_count(&self) -> usize {
        self.state().flushes
    }

    fn pages(address: u32, len: usize) -> impl Iterator<Item = u32> {
        let first = address & PAGE_MASK;
        let last = address.wrapping_add(len.saturating_sub(1) as u32) & PAGE_MASK;
        (first..=last).step_by(0x1000)
    }
}

impl CodeMemory for SimulatedMemory {
    fn make_writable(&self, address: u32, len: usize) -> Result<u32> {
        let previous = self.protection(address);
        let mut state = self.state();
        for page in Self::pages(address, len) {
            state.protection.insert(page, PROTECTION_RWX);
        }
        Ok(previous)
    }

    fn restore_protection(&self, address: u32, len: usize, protection: u32) -> Result<()> {
        let mut state = self.state();
        for page in Self::pages(address, len) {
            state.protection.insert(page, protection);
        }
        Ok(())
    }

    fn read_byte(&self, address: u32) -> Result<u8> {
        self.byte(address)
            .ok_or_else(|| Error::InvalidAddress(format!("0x{:08x}", address)))
    }

    fn write_byte(&self, address: u32, value: u8) -> Result<()> {
        if self.protection(address) != PROTECTION_RWX {
            return Err(Error::ProtectionChangeFailed(address));
        }
        let mut state = self.state();
        match state.bytes.get_mut(&address) {
            Some(b) => {
                *b = value;
                Ok(())
            }
            None => Err(Error::InvalidAddress(format!("0x{:08x}", address))),
        }
    }

    fn flush(&self, _address: u32, _len: usize) {
        self.state().flushes += 1;
    }
}
