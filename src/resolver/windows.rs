//! The resolver inside a 32-bit Windows host process.
//!
//! The vectored exception handler cannot carry context, so the resolver is
//! leaked once at attach time and registered in [`RESOLVER`]; the handler is
//! the only code that reaches it through that pointer.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::{error, info};
use windows::core::{s, PCSTR};
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RaiseException, CONTEXT, EXCEPTION_POINTERS,
};
use windows::Win32::System::Threading::{ExitProcess, GetCurrentThreadId};
use windows::Win32::UI::WindowsAndMessaging::{MessageBoxA, MB_ICONINFORMATION, MB_OK};

use super::{Disposition, Host, Resolver, ResolverConfig, ThreadContext, Trap, TrapSink};
use crate::logging;
use crate::memory::ProcessMemory;
use crate::process;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

type ProcessResolver = Resolver<WindowsHost, ProcessMemory>;

static RESOLVER: OnceLock<&'static ProcessResolver> = OnceLock::new();

impl ThreadContext for CONTEXT {
    fn eip(&self) -> u32 {
        self.Eip
    }

    fn set_eip(&mut self, eip: u32) {
        self.Eip = eip;
    }

    fn eflags(&self) -> u32 {
        self.EFlags
    }

    fn set_eflags(&mut self, eflags: u32) {
        self.EFlags = eflags;
    }

    fn eax(&self) -> u32 {
        self.Eax
    }
}

/// The host process itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsHost;

impl Host for WindowsHost {
    type Context = CONTEXT;

    fn call_init(&self, address: u32) -> bool {
        // SAFETY: the catalog names the CEG init routine, a cdecl `bool ()`.
        let init: extern "C" fn() -> u8 = unsafe { std::mem::transmute(address as usize) };
        init() != 0
    }

    fn call_register_thread(&self, address: u32) {
        // SAFETY: as above, for the register-thread routine.
        let register: extern "C" fn() -> u8 = unsafe { std::mem::transmute(address as usize) };
        let _ = register();
    }

    fn raise(&self, code: u32, _sink: &dyn TrapSink<CONTEXT>) {
        // Traps come back through the registered resolver, which is `_sink`.
        unsafe { RaiseException(code, 0, None) };
    }

    fn restart_routine(&self) -> u32 {
        restart_and_exit as usize as u32
    }

    fn current_thread_id(&self) -> u32 {
        unsafe { GetCurrentThreadId() }
    }

    fn finish(&self, resolved: usize) {
        let text = format!("Resolved {} protected values.\0", resolved);
        unsafe {
            MessageBoxA(
                None,
                PCSTR(text.as_ptr()),
                s!("NoCEG"),
                MB_OK | MB_ICONINFORMATION,
            );
        }
    }

    fn terminate(&self, exit_code: u32) {
        info!(exit_code, "terminating host");
        unsafe { ExitProcess(exit_code) }
    }
}

/// Execution lands here when a capture requests a relaunch.
extern "C" fn restart_and_exit() {
    let exit_code = match process::self_restart() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "restart failed");
            1
        }
    };
    if let Some(resolver) = RESOLVER.get() {
        if let Err(e) = resolver.breakpoints().disarm() {
            error!(error = %e, "failed to disarm breakpoint");
        }
    }
    unsafe { ExitProcess(exit_code) }
}

unsafe extern "system" fn vectored_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    let Some(resolver) = RESOLVER.get() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let Some(info) = info.as_ref() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let (Some(record), Some(context)) = (info.ExceptionRecord.as_ref(), info.ContextRecord.as_mut())
    else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    let trap = Trap::from_code(record.ExceptionCode.0 as u32);
    match resolver.on_trap(trap, context, GetCurrentThreadId()) {
        Disposition::ContinueExecution => EXCEPTION_CONTINUE_EXECUTION,
        Disposition::ContinueSearch => EXCEPTION_CONTINUE_SEARCH,
    }
}

fn executable_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(|p| p.to_path_buf())
}

/// Process-attach entry: set up logging, load the catalog and resolve.
pub fn attach() {
    let Some(dir) = executable_dir() else {
        return;
    };
    let config = ResolverConfig::beside(&dir);
    if logging::init_file(&config.log_path).is_err() {
        logging::init_cli();
    }

    process::wait_for_restart_mutex();

    let resolver = match ProcessResolver::load(config, WindowsHost, ProcessMemory) {
        Ok(resolver) => resolver,
        Err(e) => {
            error!(error = %e, "cannot load catalog");
            WindowsHost.terminate(1);
            return;
        }
    };

    let resolver: &'static ProcessResolver = Box::leak(Box::new(resolver));
    if RESOLVER.set(resolver).is_err() {
        error!("resolver already registered");
        return;
    }

    let handle = unsafe { AddVectoredExceptionHandler(1, Some(vectored_handler)) };
    if handle.is_null() {
        error!("failed to install exception handler");
        WindowsHost.terminate(1);
        return;
    }

    resolver.execute();
}
