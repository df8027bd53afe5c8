//! Running routines on a halted ARMv7-M core.
//!
//! The helper routines this crate plants on a target are plain AAPCS
//! functions that return through the link register. Pointing LR at a known
//! address and arming a hardware breakpoint there catches the return
//! without any interrupt hooks or code patching on the target side.

use log::warn;

use super::GdbClient;
use crate::{Error, Result};

/// Register numbers in the gdb server's register file.
pub mod reg {
    pub const R0: u32 = 0;
    pub const R1: u32 = 1;
    pub const R2: u32 = 2;
    pub const R3: u32 = 3;
    pub const SP: u32 = 13;
    pub const LR: u32 = 14;
    pub const PC: u32 = 15;
    pub const XPSR: u32 = 25;
}

/// Thumb execution state bit in xPSR.
const THUMB_BIT: u32 = 1 << 24;

/// A call into target-resident code: up to four scalar arguments in r0-r3,
/// result in r0, per the AAPCS.
#[derive(Clone, Copy, Debug)]
pub struct RoutineCall {
    /// Entry point of the routine (bit 0 need not be set; it is forced).
    pub entry: u32,
    /// Initial stack pointer for the routine.
    pub stack_top: u32,
    /// Where the routine returns to; a hardware breakpoint is armed here.
    pub halt_addr: u32,
    pub args: [u32; 4],
}

impl GdbClient {
    /// Execute a routine on the target and wait for it to return. The
    /// target must already be halted. Returns the routine's r0.
    pub fn run_target_routine(&mut self, call: &RoutineCall) -> Result<u32> {
        // these cores execute thumb code only; one that faulted its way out
        // of thumb state must be coaxed back before anything can run
        let xpsr = self.read_reg(reg::XPSR)?;
        if xpsr & THUMB_BIT == 0 {
            warn!("thumb execution bit is clear, trying to re-enable it");
            self.write_reg(reg::XPSR, xpsr | THUMB_BIT)?;
            if self.read_reg(reg::XPSR)? & THUMB_BIT == 0 {
                return Err(Error::TargetFault);
            }
        }

        self.insert_hw_breakpoint(call.halt_addr, 2)?;
        self.write_reg(reg::PC, call.entry | 1)?;
        self.write_reg(reg::SP, call.stack_top)?;
        self.write_reg(reg::LR, call.halt_addr | 1)?;
        for (nr, &value) in call.args.iter().enumerate() {
            self.write_reg(nr as u32, value)?;
        }

        self.cont()?;
        self.wait_halted()?;
        self.remove_hw_breakpoint(call.halt_addr, 2)?;
        self.read_reg(reg::R0)
    }
}
