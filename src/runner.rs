//! One guest execution window, from mapped image to register snapshot.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::framebuffer::{self, PixelRegion, FRAMEBUFFER};
use crate::loader::Image;
use crate::trampoline;
use crate::trap::{self, SignalGuard, HARNESS_ACTIVE};
use crate::{Error, ExitType, Outcome, RegInit, Regs};


/// Run the guest until it stores to the exit address or executes the
/// test-end marker. The snapshot in the returned outcome is the guest's
/// register file at that instant.
pub fn run_guest(image: &Image, inits: &[RegInit]) -> Result<Outcome, Error> {
    if HARNESS_ACTIVE.swap(true, Ordering::AcqRel) {
        return Err(Error::AlreadyRunning);
    }

    let outcome = execute(image, inits);
    HARNESS_ACTIVE.store(false, Ordering::Release);
    outcome
}


fn execute(image: &Image, inits: &[RegInit]) -> Result<Outcome, Error> {
    FRAMEBUFFER.reset();
    let _pixels = PixelRegion::map()?;
    let renderer = framebuffer::spawn(&FRAMEBUFFER);

    trap::set_init_regs(&Regs::with_inits(inits));
    trap::clear_result_regs();

    let outcome = (|| {
        let guard = SignalGuard::install()?;

        log::debug!(
            "entering guest at {:#x} ({} segments)",
            image.entry(),
            image.segment_count()
        );

        let start = Instant::now();
        let val = enter_guest(image.entry());
        let elapsed = start.elapsed();

        // Any way back out of the guest goes through the entry trap first.
        debug_assert!(trampoline::host_context_valid());

        drop(guard);

        let exit = ExitType::from_raw(val).unwrap_or(ExitType::InitialCall);
        log::debug!("guest returned: {exit:?} after {elapsed:?}");

        Ok(Outcome { exit, regs: trap::result_regs(), elapsed })
    })();

    trampoline::clear_host_context();
    renderer.stop_and_join();

    outcome
}


/// The long jump out of `safe_exit` lands in this frame, so it must stay
/// alive for the whole guest run; `program_runner` never returns on its
/// own.
#[inline(never)]
fn enter_guest(entry: u64) -> i32 {
    unsafe {
        let val = trampoline::sigsetjmp(trampoline::jmp_buf_ptr(), 1);
        if val == 0 {
            trampoline::program_runner(entry);
        }
        val
    }
}
