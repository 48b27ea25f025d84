//! Synchronous-fault handling.
//!
//! Guest accesses to the unmapped MMIO page arrive as SIGSEGV, the
//! test-end marker as SIGILL. The handler runs on its own stack with all
//! signals masked and must stay signal-safe: no allocation, no locks, and
//! no libc calls that reach for thread-local state (tp still holds the
//! guest's value in here). Output and termination go through raw
//! syscalls; diagnostics are formatted into a fixed stack buffer.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::AtomicBool;

use core::fmt::Write as _;

use crate::decode::{decode, DecodeError};
use crate::framebuffer::FRAMEBUFFER;
use crate::mmio::{MmioDevice, MmioFault, Serial, PROGRAM_ENTRY_ADDR, SYS_STATUS_ADDR};
use crate::trampoline;
use crate::{Error, ExitCode, ExitType, Regs, NUM_REGS, TEST_END_MARKER};


// __gregs indices.
const REG_PC: usize = 0;
const REG_SP: usize = 2;
const REG_GP: usize = 3;
const REG_TP: usize = 4;
const REG_A0: usize = 10;

const SIG_STACK_SIZE: usize = 64 * 1024;


/// One run at a time; the handler state below is process-wide.
pub static HARNESS_ACTIVE: AtomicBool = AtomicBool::new(false);


struct RegCell(UnsafeCell<[u64; NUM_REGS]>);

unsafe impl Sync for RegCell {}

/// Register snapshot the guest starts from (slot 0 unused).
static INIT_REGS: RegCell = RegCell(UnsafeCell::new([0; NUM_REGS]));

/// Register file captured at guest termination, pc in slot 0.
static RESULT_REGS: RegCell = RegCell(UnsafeCell::new([0; NUM_REGS]));


static SERIAL: Serial = Serial;

/// Polled in registration order; first claim wins. The framebuffer goes
/// first, the serial port second; the exit/entry addresses are matched in
/// the handler itself.
static DEVICES: [&dyn MmioDevice; 2] = [&FRAMEBUFFER, &SERIAL];


pub fn set_init_regs(regs: &Regs) {
    unsafe { *INIT_REGS.0.get() = regs.regs }
}

pub fn result_regs() -> Regs {
    Regs { regs: unsafe { *RESULT_REGS.0.get() } }
}

pub fn clear_result_regs() {
    unsafe { *RESULT_REGS.0.get() = [0; NUM_REGS] }
}


pub fn sys_write(fd: i32, buf: *const u8, len: usize) -> isize {
    let ret: isize;
    unsafe {
        core::arch::asm!(
            "ecall",
            in("a7") 64usize, // write
            inlateout("a0") fd as isize => ret,
            in("a1") buf,
            in("a2") len,
            options(nostack),
        );
    }
    ret
}


fn sys_exit_group(code: i32) -> ! {
    unsafe {
        core::arch::asm!(
            "ecall",
            in("a7") 94usize, // exit_group
            in("a0") code as isize,
            options(noreturn, nostack),
        );
    }
}


struct MsgBuf {
    buf: [u8; 256],
    len: usize,
}

impl core::fmt::Write for MsgBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}


/// There is no unwinding out of a signal handler; report and terminate.
fn crash(args: core::fmt::Arguments) -> ! {
    let mut msg = MsgBuf { buf: [0; 256], len: 0 };
    let _ = msg.write_fmt(args);
    let _ = msg.write_str("\n");

    sys_write(2, msg.buf.as_ptr(), msg.len);
    sys_exit_group(ExitCode::SigHandlerFailure as i32);
}


fn crash_mmio(fault: MmioFault, pc: u64) -> ! {
    match fault {
        MmioFault::BadWidth { addr, width } => {
            crash(format_args!("unexpected access width {width} at {addr:#x} (pc {pc:#x})"))
        }
        MmioFault::Misaligned { addr, width } => {
            crash(format_args!("misaligned {width}-byte access at {addr:#x} (pc {pc:#x})"))
        }
        MmioFault::ReadUnsupported { addr } => {
            crash(format_args!("unexpected read of {addr:#x} (pc {pc:#x})"))
        }
        MmioFault::WriteFailed { .. } => crash(format_args!("failed to write serial output")),
    }
}


fn snapshot(gregs: &[u64; NUM_REGS]) {
    unsafe { *RESULT_REGS.0.get() = *gregs }
}


extern "C" fn fault_handler(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let uc = ctx as *mut libc::ucontext_t;
    let gregs = unsafe { &mut (*uc).uc_mcontext.__gregs };
    let pc = gregs[REG_PC];

    if sig == libc::SIGILL {
        let word = unsafe { (pc as *const u32).read_unaligned() };
        if word == TEST_END_MARKER {
            snapshot(gregs);
            gregs[REG_PC] = trampoline::safe_exit_addr();
            gregs[REG_A0] = ExitType::ExitByMarker as u64;
            return;
        }

        crash(format_args!("illegal instruction {word:#010x} at pc {pc:#x}"));
    }

    let addr = unsafe { (*info).si_addr() } as u64;
    let word = unsafe { (pc as *const u32).read_unaligned() };

    let access = match decode(word) {
        Ok(access) => access,
        Err(DecodeError::Unsupported32(w)) => {
            crash(format_args!("unsupported opcode {w:#010x} at pc {pc:#x}"))
        }
        Err(DecodeError::Unsupported16(h)) => {
            crash(format_args!("unsupported compressed opcode {h:#06x} at pc {pc:#x}"))
        }
    };

    if access.is_write {
        // A store sourced from x0 carries the value 0, never __gregs[0].
        let value = if access.reg == 0 { 0 } else { gregs[access.reg as usize] };

        for dev in DEVICES {
            match dev.try_write(addr, access.width, value) {
                Ok(true) => {
                    gregs[REG_PC] = pc + access.len as u64;
                    return;
                }
                Ok(false) => {}
                Err(fault) => crash_mmio(fault, pc),
            }
        }

        match addr {
            SYS_STATUS_ADDR => {
                // Controlled exit.
                if access.width != 1 && access.width != 4 {
                    crash(format_args!(
                        "unexpected write of {} to {addr:#x} at pc {pc:#x}",
                        access.width
                    ));
                }

                snapshot(gregs);
                gregs[REG_PC] = trampoline::safe_exit_addr();
                gregs[REG_A0] = ExitType::ExitByStatus as u64;
            }

            PROGRAM_ENTRY_ADDR => {
                if access.width != 8 {
                    crash(format_args!(
                        "unexpected write of {} to {addr:#x} at pc {pc:#x}",
                        access.width
                    ));
                }

                // The host is about to lose gp/tp/sp to the guest; save
                // them for restore_regs, then swap the guest context in.
                // The written value is the first guest pc, so there is no
                // advance here.
                trampoline::store_host_context(gregs[REG_GP], gregs[REG_TP], gregs[REG_SP]);

                let init = unsafe { &*INIT_REGS.0.get() };
                gregs[1..NUM_REGS].copy_from_slice(&init[1..NUM_REGS]);
                gregs[REG_PC] = value;
            }

            _ => crash(format_args!(
                "unexpected write of {} to {addr:#x} at pc {pc:#x}",
                access.width
            )),
        }
    } else {
        for dev in DEVICES {
            match dev.try_read(addr, access.width) {
                Ok(Some(value)) => {
                    // x0 as the destination discards the value.
                    if access.reg != 0 {
                        gregs[access.reg as usize] = value;
                    }
                    gregs[REG_PC] = pc + access.len as u64;
                    return;
                }
                Ok(None) => {}
                Err(fault) => crash_mmio(fault, pc),
            }
        }

        crash(format_args!(
            "unexpected read of {} to {addr:#x} at pc {pc:#x}",
            access.width
        ));
    }
}


/// Alternate stack plus SIGSEGV/SIGILL dispositions, put back on drop so a
/// second run (or an ordinary crash later) behaves.
pub struct SignalGuard {
    _stack: Box<[u8]>,
    old_stack: libc::stack_t,
    old_segv: libc::sigaction,
    old_ill: libc::sigaction,
}


impl SignalGuard {
    pub fn install() -> Result<Self, Error> {
        let err = |what| Error::SignalSetup { what, source: io::Error::last_os_error() };

        // The guest may not even have a stack; the handler brings its own.
        let stack = vec![0u8; SIG_STACK_SIZE].into_boxed_slice();
        let ss = libc::stack_t {
            ss_sp: stack.as_ptr() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: stack.len(),
        };

        let mut old_stack: libc::stack_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaltstack(&ss, &mut old_stack) } != 0 {
            return Err(err("sigaltstack"));
        }

        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        sa.sa_sigaction = fault_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        // All signals blocked while handling; makes the handler easy to
        // reason about.
        unsafe { libc::sigfillset(&mut sa.sa_mask) };

        let mut old_segv: libc::sigaction = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaction(libc::SIGSEGV, &sa, &mut old_segv) } != 0 {
            let e = err("sigaction(SIGSEGV)");
            unsafe { libc::sigaltstack(&old_stack, std::ptr::null_mut()) };
            return Err(e);
        }

        let mut old_ill: libc::sigaction = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaction(libc::SIGILL, &sa, &mut old_ill) } != 0 {
            let e = err("sigaction(SIGILL)");
            unsafe {
                libc::sigaction(libc::SIGSEGV, &old_segv, std::ptr::null_mut());
                libc::sigaltstack(&old_stack, std::ptr::null_mut());
            }
            return Err(e);
        }

        Ok(Self { _stack: stack, old_stack, old_segv, old_ill })
    }
}


impl Drop for SignalGuard {
    fn drop(&mut self) {
        unsafe {
            libc::sigaction(libc::SIGSEGV, &self.old_segv, std::ptr::null_mut());
            libc::sigaction(libc::SIGILL, &self.old_ill, std::ptr::null_mut());
            libc::sigaltstack(&self.old_stack, std::ptr::null_mut());
        }
    }
}
