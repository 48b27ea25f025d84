#![forbid(unused_must_use)]

pub mod decode;
pub mod framebuffer;
pub mod mmio;
pub mod testconf;
pub mod utils;

#[cfg(target_os = "linux")]
pub mod loader;

#[cfg(all(target_os = "linux", target_arch = "riscv64"))]
pub mod trampoline;

#[cfg(all(target_os = "linux", target_arch = "riscv64"))]
pub mod trap;

#[cfg(all(target_os = "linux", target_arch = "riscv64"))]
pub mod runner;

use std::str::FromStr;

use thiserror::Error;


pub const NUM_REGS: usize = 32;

/// Executing this 32-bit word ends the run with `ExitByMarker`.
pub const TEST_END_MARKER: u32 = 0xddffccff;


/// Process exit codes, kept compatible with rv64-emu test infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success             = 0,
    AbnormalTermination = 1,
    HelpDisplayed       = 2,
    InitializationError = 3,
    UnitTestFailed      = 5,
    NotSupported        = 6,
    SigHandlerFailure   = 7,
    FramebufferError    = 8,
}


/// How the guest came back to the harness. The value doubles as the
/// `siglongjmp` payload carried by `safe_exit`, so `InitialCall` is pinned
/// to 0 (the first return of `__sigsetjmp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitType {
    InitialCall  = 0,
    ExitByStatus = 1,
    ExitByMarker = 2,
}


impl ExitType {
    pub fn from_raw(val: i32) -> Option<Self> {
        match val {
            0 => Some(ExitType::InitialCall),
            1 => Some(ExitType::ExitByStatus),
            2 => Some(ExitType::ExitByMarker),
            _ => None,
        }
    }
}


#[derive(Debug, Error)]
pub enum Error {
    #[error("could not open '{path}': {source}")]
    Open { path: String, source: std::io::Error },

    #[error("invalid ELF: {0}")]
    InvalidElf(String),

    #[error("mapping {what} at {addr:#x} failed: {source}")]
    Mapping {
        what: &'static str,
        addr: u64,
        source: std::io::Error,
    },

    #[error("unexpected page size {0}")]
    PageSize(i64),

    #[error("{what} failed: {source}")]
    SignalSetup {
        what: &'static str,
        source: std::io::Error,
    },

    #[error("invalid register initialiser '{0}'")]
    BadRegInit(String),

    #[error("test config: {0}")]
    BadTestConfig(String),

    #[error("another guest run is active in this process")]
    AlreadyRunning,

    #[error("guest execution requires a 64-bit RISC-V Linux host")]
    UnsupportedHost,
}


impl Error {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Open { .. }
            | Error::InvalidElf(_)
            | Error::BadRegInit(_)
            | Error::BadTestConfig(_) => ExitCode::InitializationError,

            Error::UnsupportedHost => ExitCode::NotSupported,

            Error::Mapping { .. }
            | Error::PageSize(_)
            | Error::SignalSetup { .. }
            | Error::AlreadyRunning => ExitCode::AbnormalTermination,
        }
    }
}


/// What a finished guest run left behind.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub exit: ExitType,
    pub regs: Regs,
    pub elapsed: std::time::Duration,
}


/// Register names in host `__gregs` order: slot 0 is the pc, slot N is xN.
pub const REG_NAMES: [&str; NUM_REGS] = [
    " pc", " ra", " sp", " gp", " tp", " t0", " t1", " t2",
    " fp", " s1", " a0", " a1", " a2", " a3", " a4", " a5",
    " a6", " a7", " s2", " s3", " s4", " s5", " s6", " s7",
    " s8", " s9", "s10", "s11", " t3", " t4", " t5", " t6",
];


/// A register snapshot in `__gregs` layout. `write` keeps x0 hardwired;
/// slot 0 is only ever filled wholesale from a trapped context, where it
/// holds the pc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regs {
    pub regs: [u64; NUM_REGS],
}


impl Regs {
    pub fn new() -> Self {
        Self { regs: [0; NUM_REGS] }
    }

    pub fn with_inits(inits: &[RegInit]) -> Self {
        let mut regs = Self::new();
        for init in inits {
            regs.write(init.reg as usize, init.val);
        }
        regs
    }

    #[inline]
    pub fn read(&self, idx: usize) -> u64 {
        self.regs[idx]
    }

    #[inline]
    pub fn write(&mut self, idx: usize, data: u64) {
        if idx == 0 { return }
        self.regs[idx] = data;
    }
}


impl Default for Regs {
    fn default() -> Self {
        Self::new()
    }
}


/// One `name=value` register initialiser, from the command line or a
/// `.conf` section. Register 0 parses fine but is ignored when the
/// snapshot is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegInit {
    pub reg: u8,
    pub val: u64,
}


impl FromStr for RegInit {
    type Err = Error;

    fn from_str(init: &str) -> Result<Self, Error> {
        let bad = || Error::BadRegInit(init.to_string());

        let (name, value) = init.split_once('=').ok_or_else(bad)?;
        let reg = reg_number(name.trim()).ok_or_else(bad)?;
        let val = parse_u64_auto(value.trim()).ok_or_else(bad)?;

        Ok(RegInit { reg, val })
    }
}


/// Resolve a register name: `rN`/`RN` and `xN` with decimal N in 0..=31,
/// or an ABI name.
pub fn reg_number(name: &str) -> Option<u8> {
    match name {
        "zero" => return Some(0),
        "ra" => return Some(1),
        "sp" => return Some(2),
        "gp" => return Some(3),
        "tp" => return Some(4),
        "s0" | "fp" => return Some(8),
        "s1" => return Some(9),
        _ => {}
    }

    let (prefix, rest) = name.split_at(name.len().min(1));
    let n: u8 = rest.parse().ok()?;

    match prefix {
        "r" | "R" | "x" if n < NUM_REGS as u8 => Some(n),
        "a" if n < 8 => Some(n + 10),
        "s" if (2..12).contains(&n) => Some(n + 16),
        "t" if n < 3 => Some(n + 5),
        "t" if (3..7).contains(&n) => Some(n + 25),
        _ => None,
    }
}


/// Integer with base auto-detection: `0x` hex, leading `0` octal, else
/// decimal.
pub fn parse_u64_auto(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }

    if s.len() > 1 && s.starts_with('0') {
        return u64::from_str_radix(&s[1..], 8).ok();
    }

    s.parse().ok()
}
