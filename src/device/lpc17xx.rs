//! NXP LPC17xx flash driver.
//!
//! Nothing here touches a flash controller register. All erasing and
//! programming goes through the In-Application Programming routines in the
//! NXP boot ROM, entered at a fixed address with a five-word command block
//! staged in RAM. The timing-sensitive IAP commands take the CPU clock in
//! kHz as an argument, so `open` first forces the PLL to a known 96 MHz
//! before anything else runs.

use log::{info, warn};

use super::{Device, DeviceInfo, MemoryArea, OptionSpec, TargetDriver, TargetOptions};
use super::{read_u32, write_u32};
use crate::gdb::{GdbClient, RoutineCall};
use crate::{Error, Result};

/// Thumb entry point of the IAP handler in the boot ROM.
const IAP_LOCATION: u32 = 0x1fff_1ff1;

// iap command numbers
const PREPARE_SECTORS_FOR_WRITING: u32 = 50;
const COPY_RAM_TO_FLASH: u32 = 51;
const ERASE_SECTORS: u32 = 52;
const READ_PART_ID: u32 = 54;

/// IAP status for a command that worked.
const CMD_SUCCESS: u32 = 0;

// pll0 and clock source registers
const PLL0CON: u32 = 0x400f_c080;
const PLL0CFG: u32 = 0x400f_c084;
const PLL0STAT: u32 = 0x400f_c088;
const PLL0FEED: u32 = 0x400f_c08c;
const CCLKCFG: u32 = 0x400f_c104;
const CLKSRCSEL: u32 = 0x400f_c10c;
/// Bit 0 selects what sits at address 0: boot ROM (0) or user flash (1).
const MEMMAP: u32 = 0x400f_c040;

// PLL0STAT bits
const PLLE0_STAT: u32 = 1 << 24; // enabled
const PLLC0_STAT: u32 = 1 << 25; // connected
const PLOCK0: u32 = 1 << 26; // locked

/// IAP command and result blocks live at fixed RAM offsets, the write
/// staging buffer right behind them.
const RAM_BASE: u32 = 0x1000_0000;
const CMD_ADDR: u32 = RAM_BASE;
const RESULT_ADDR: u32 = RAM_BASE + 0x20;
const WRITE_BUF_ADDR: u32 = RAM_BASE + 0x40;
/// One IAP copy transfer; must be 256, 512, 1024 or 4096.
const WRITE_BUF_SIZE: u32 = 4 * 1024;

static LPC1754: DeviceInfo = DeviceInfo {
    name: "lpc1754",
    options: &[OptionSpec {
        name: "xtal-freq-hz",
        help: "frequency of the crystal on the target board, in hertz",
        numeric: true,
        required: true,
    }],
    ram: &[MemoryArea { start: RAM_BASE, len: 16 * 1024, sectors: &[] }],
    flash: &[MemoryArea {
        start: 0,
        len: 128 * 1024,
        sectors: &[
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            4 * 1024,
            32 * 1024,
            32 * 1024,
        ],
    }],
    loader: None,
};

/// Patch the vector-table checksum the boot ROM insists on: the 8th word
/// must be the two's complement of the sum of the first seven.
pub(crate) fn patch_vector_checksum(words: &mut [u32]) {
    if words.len() < 8 {
        return;
    }
    let sum = words[..7].iter().fold(0u32, |a, &w| a.wrapping_add(w));
    words[7] = sum.wrapping_neg();
}

pub(crate) struct Lpc17xx {
    cmd: [u32; 5],
    result: [u32; 5],
    /// CPU clock in hertz once `open` has configured the PLL.
    cclk: u32,
}

impl Lpc17xx {
    fn new() -> Self {
        Lpc17xx {
            cmd: [0; 5],
            result: [0; 5],
            cclk: 0,
        }
    }

    /// Stage the command block, call into the ROM and fetch the result
    /// block back.
    fn run_iap(&mut self, info: &DeviceInfo, gdb: &mut GdbClient) -> Result<()> {
        gdb.write_words(CMD_ADDR, &self.cmd)?;
        let ram = &info.ram[0];
        gdb.run_target_routine(&RoutineCall {
            entry: IAP_LOCATION,
            stack_top: ram.start + ram.len,
            halt_addr: 0,
            args: [CMD_ADDR, RESULT_ADDR, 0, 0],
        })?;
        let mut result = [0u32; 5];
        gdb.read_words(RESULT_ADDR, &mut result)?;
        self.result = result;
        Ok(())
    }

    fn iap_status(&self) -> Result<()> {
        match self.result[0] {
            CMD_SUCCESS => Ok(()),
            code => Err(Error::HelperFault(code)),
        }
    }

    fn prepare_sectors(&mut self, info: &DeviceInfo, gdb: &mut GdbClient, first: u32, last: u32) -> Result<()> {
        self.cmd = [PREPARE_SECTORS_FOR_WRITING, first, last, 0, 0];
        self.run_iap(info, gdb)?;
        self.iap_status()
    }
}

pub fn devices() -> Vec<Device> {
    vec![Device::new(&LPC1754, Box::new(Lpc17xx::new()))]
}

/// Write the magic feed sequence that latches a PLL0 register update.
fn pll_feed(gdb: &mut GdbClient) -> Result<()> {
    write_u32(gdb, PLL0FEED, 0xaa)?;
    write_u32(gdb, PLL0FEED, 0x55)
}

/// Poll PLL0STAT until `mask` reads as `set`, with the handful of retries
/// the hardware should ever need.
fn wait_pll_stat(gdb: &mut GdbClient, mask: u32, set: bool, what: &'static str) -> Result<u32> {
    for _ in 0..10 {
        let stat = read_u32(gdb, PLL0STAT)?;
        if (stat & mask != 0) == set {
            return Ok(stat);
        }
    }
    Err(Error::DeviceInit(what))
}

impl TargetDriver for Lpc17xx {
    fn open(&mut self, info: &DeviceInfo, gdb: &mut GdbClient, opts: &TargetOptions) -> Result<()> {
        if let Some(xtal) = opts.numeric("xtal-freq-hz") {
            // clocking runs from the internal oscillator below, the board
            // crystal only matters if someone re-enables the main osc path
            info!("board crystal declared at {} Hz", xtal);
        }

        let clksrcsel = read_u32(gdb, CLKSRCSEL)?;
        let pll0con = read_u32(gdb, PLL0CON)?;
        let pll0cfg = read_u32(gdb, PLL0CFG)?;
        let cclkcfg = read_u32(gdb, CCLKCFG)?;
        let pll0stat = read_u32(gdb, PLL0STAT)?;
        info!(
            "target clock state: cclkcfg {:#010x}, clksrcsel {:#010x}, pll0con {:#010x}, pll0cfg {:#010x}, pll0stat {:#010x}",
            cclkcfg, clksrcsel, pll0con, pll0cfg, pll0stat
        );

        // a connected pll must be disconnected and disabled before it can
        // be reprogrammed
        if pll0stat & (PLLE0_STAT | PLLC0_STAT) == (PLLE0_STAT | PLLC0_STAT) {
            write_u32(gdb, PLL0CON, 1)?;
            pll_feed(gdb)?;
            wait_pll_stat(gdb, PLLC0_STAT, false, "pll0 would not disconnect")?;

            write_u32(gdb, PLL0CON, 0)?;
            pll_feed(gdb)?;
            wait_pll_stat(gdb, PLLE0_STAT, false, "pll0 would not disable")?;
        }
        info!("pll0 disconnected and disabled");

        // internal rc oscillator, nominal 4 MHz
        write_u32(gdb, CLKSRCSEL, 0)?;

        // M = 36, N = 1: fcco = 2 * 36 * 4 MHz = 288 MHz
        write_u32(gdb, PLL0CFG, 0x23)?;
        pll_feed(gdb)?;

        // cpu clock divider 3, for a 96 MHz core clock
        write_u32(gdb, CCLKCFG, 2)?;

        write_u32(gdb, PLL0CON, 1)?;
        pll_feed(gdb)?;
        wait_pll_stat(gdb, PLLE0_STAT, true, "pll0 would not enable")?;
        wait_pll_stat(gdb, PLOCK0, true, "pll0 would not lock")?;

        info!("pll0 locked, connecting");
        write_u32(gdb, PLL0CON, 3)?;
        pll_feed(gdb)?;
        wait_pll_stat(gdb, PLLC0_STAT, true, "pll0 would not connect")?;
        info!("pll0 connected, target core clock is 96 MHz");
        self.cclk = 96_000_000;

        // user flash at address 0, not the boot rom
        write_u32(gdb, MEMMAP, 1)?;

        // self test: ask the rom who we are talking to
        self.cmd = [READ_PART_ID, 0, 0, 0, 0];
        self.run_iap(info, gdb)?;
        self.iap_status()?;
        info!("target part id {:#010x}", self.result[1]);
        Ok(())
    }

    fn erase_sector(&mut self, info: &DeviceInfo, gdb: &mut GdbClient, sector_nr: u32) -> Result<()> {
        self.prepare_sectors(info, gdb, sector_nr, sector_nr)?;
        info!("erasing flash sector {}", sector_nr);
        self.cmd = [ERASE_SECTORS, sector_nr, sector_nr, self.cclk / 1000, 0];
        self.run_iap(info, gdb)?;
        self.iap_status()
    }

    fn program_words(&mut self, info: &DeviceInfo, gdb: &mut GdbClient, mut dest: u32, words: &[u32]) -> Result<()> {
        let chunk_words = (WRITE_BUF_SIZE / 4) as usize;
        let annotate = gdb.set_annotation(false);
        let result = self.program_chunks(info, gdb, &mut dest, words, chunk_words, annotate);
        gdb.set_annotation(annotate);
        result
    }
}

impl Lpc17xx {
    fn program_chunks(
        &mut self,
        info: &DeviceInfo,
        gdb: &mut GdbClient,
        dest: &mut u32,
        words: &[u32],
        chunk_words: usize,
        annotate: bool,
    ) -> Result<()> {
        let total = words.len() * 4;
        let mut done = 0;
        for chunk in words.chunks(chunk_words) {
            // stage one full iap transfer unit, tail padded with erased
            // flash bytes
            let mut staged = vec![0xffff_ffffu32; chunk_words];
            staged[..chunk.len()].copy_from_slice(chunk);
            if *dest == 0 {
                warn!("programming the vector table, fixing up the boot checksum word");
                patch_vector_checksum(&mut staged);
            }
            gdb.write_words(WRITE_BUF_ADDR, &staged)?;

            // the rom copies a full buffer, so the prepared range must
            // cover every sector the transfer touches
            let (area, first) = info.flash_sector_containing(*dest)?;
            let copy_end = (*dest as u64 + WRITE_BUF_SIZE as u64)
                .min(area.start as u64 + area.len as u64);
            let (_, last) = info.flash_sector_containing((copy_end - 1) as u32)?;
            self.prepare_sectors(info, gdb, first as u32, last as u32)?;

            self.cmd = [COPY_RAM_TO_FLASH, *dest, WRITE_BUF_ADDR, WRITE_BUF_SIZE, self.cclk / 1000];
            self.run_iap(info, gdb)?;
            self.iap_status()?;

            *dest += (chunk.len() * 4) as u32;
            done += chunk.len() * 4;
            info!("{} bytes written", done);
            if annotate {
                println!("[VX-FLASH-WRITE-PROGRESS]\t{}\t{}", done, total);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_checksum_negates_first_seven_words() {
        let mut words = [1u32, 2, 3, 4, 5, 6, 7, 0xdead_beef];
        patch_vector_checksum(&mut words);
        assert_eq!(words[7], 28u32.wrapping_neg());
        let sum = words.iter().fold(0u32, |a, &w| a.wrapping_add(w));
        assert_eq!(sum, 0);
    }

    #[test]
    fn vector_checksum_handles_wrapping_sums() {
        let mut words = [0xffff_fff0u32, 0x20, 0, 0, 0, 0, 0, 0];
        patch_vector_checksum(&mut words);
        assert_eq!(words[7], 0x10u32.wrapping_neg());
    }

    #[test]
    fn short_images_are_left_alone() {
        let mut words = [1u32, 2, 3];
        patch_vector_checksum(&mut words);
        assert_eq!(words, [1, 2, 3]);
    }

    #[test]
    fn iap_failure_surfaces_the_status_code() {
        let mut drv = Lpc17xx::new();
        drv.result[0] = 9; // COUNT_ERROR
        assert!(matches!(drv.iap_status(), Err(Error::HelperFault(9))));
    }
}
