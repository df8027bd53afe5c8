//! STM32F05x flash driver.
//!
//! Same split as the other STM32 families: erase and unlock by direct pokes
//! of the flash interface registers, programming through a resident helper
//! that writes half-words (the programming unit of this flash). `open`
//! additionally drags the clock tree into a known state, because the part
//! may arrive here running from any combination of HSE/PLL leftovers.

use log::{info, warn};

use super::{
    program_with_helper, read_u32, write_u32, Device, DeviceInfo, LoaderParams, MemoryArea,
    TargetDriver, TargetOptions,
};
use crate::gdb::GdbClient;
use crate::{Error, Result};

// flash interface controller registers
const FBASE: u32 = 0x4002_2000;
const FACR: u32 = FBASE; // access control
const FKEYR: u32 = FBASE + 0x4; // unlock key
const FSR: u32 = FBASE + 0xc; // status
const FCTRL: u32 = FBASE + 0x10; // control
const FAR: u32 = FBASE + 0x14; // address, takes the sector to erase

// FSR bits
const BSY: u32 = 1 << 0;
const PGERR: u32 = 1 << 2;
const WRPERR: u32 = 1 << 4;
const EOP: u32 = 1 << 5;
const ERR_FLAGS: u32 = PGERR | WRPERR;

// FCTRL bits
const LOCK: u32 = 1 << 7;
const STRT: u32 = 1 << 6;
const MER: u32 = 1 << 2;
const PER: u32 = 1 << 1;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xcdef_89ab;

// reset and clock control registers
const RCC_BASE: u32 = 0x4002_1000;
const RCC_CR: u32 = RCC_BASE;
const RCC_CFGR: u32 = RCC_BASE + 0x4;
const RCC_CIR: u32 = RCC_BASE + 0x8;
const RCC_AHBENR: u32 = RCC_BASE + 0x14;
const RCC_CFGR2: u32 = RCC_BASE + 0x24;
const RCC_CFGR3: u32 = RCC_BASE + 0x30;
const RCC_CR2: u32 = RCC_BASE + 0x34;

// port a, used to pin the clock out on MCO for scope debugging
const PORTA_MODER: u32 = 0x4800_0000;

const SECTOR_SIZE: u32 = 1024;

static STM32F051X6: DeviceInfo = DeviceInfo {
    name: "stm32f051x6",
    options: &[],
    ram: &[MemoryArea { start: 0x2000_0000, len: 8 * 1024, sectors: &[] }],
    flash: &[MemoryArea {
        start: 0x0800_0000,
        len: 64 * 1024,
        sectors: &[SECTOR_SIZE; 64],
    }],
    loader: Some(LoaderParams {
        code_addr: 0x2000_0000,
        write_buf_addr: 0x2000_0100,
        write_buf_size: 4000,
        stack_size: 0x200,
    }),
};

/// Machine code of the on-target half-word programming loop. Thumb-1 only,
/// this core is a Cortex-M0. Compiled from:
///
/// ```c
/// int flash_write(volatile uint32_t *dest, uint32_t *src, uint32_t wordcnt)
/// {
///     while (FSR & BSY)
///         ;
///     ...programs wordcnt * 2 half-words, FCTRL = PG before each,
///     read-back verify (-2 on mismatch), FSR error check (-1)...
/// }
/// ```
///
/// ```text
/// 00: b5f0      push  {r4-r7, lr}
/// 02: 4b10      ldr   r3, =0x40022000
/// 04: 68dc      ldr   r4, [r3, #12]      ; FSR
/// 06: 2501      movs  r5, #1             ; BSY
/// 08: 422c      tst   r4, r5
/// 0a: d1fb      bne   0x04
/// 0c: 0052      lsls  r2, r2, #1         ; words -> half-words
/// 0e: 2501      movs  r5, #1             ; PG
/// 10: 611d      str   r5, [r3, #16]      ; FCTRL
/// 12: 880e      ldrh  r6, [r1]
/// 14: 8006      strh  r6, [r0]
/// 16: 68dc      ldr   r4, [r3, #12]
/// 18: 2501      movs  r5, #1
/// 1a: 422c      tst   r4, r5
/// 1c: d1fb      bne   0x16
/// 1e: 8807      ldrh  r7, [r0]
/// 20: 42b7      cmp   r7, r6
/// 22: d10b      bne   0x3c               ; read-back mismatch
/// 24: 2514      movs  r5, #0x14          ; PGERR | WRPERR
/// 26: 422c      tst   r4, r5
/// 28: d105      bne   0x36               ; controller error
/// 2a: 3002      adds  r0, #2
/// 2c: 3102      adds  r1, #2
/// 2e: 3a01      subs  r2, #1
/// 30: d1ed      bne   0x0e
/// 32: 2000      movs  r0, #0
/// 34: bdf0      pop   {r4-r7, pc}
/// 36: 2000      movs  r0, #0
/// 38: 43c0      mvns  r0, r0             ; -1
/// 3a: bdf0      pop   {r4-r7, pc}
/// 3c: 2001      movs  r0, #1
/// 3e: 43c0      mvns  r0, r0             ; -2
/// 40: bdf0      pop   {r4-r7, pc}
/// 42: bf00      nop
/// 44: .word 0x40022000
/// ```
const FLASH_WRITE_CODE: &[u8] = &[
    0xf0, 0xb5, 0x10, 0x4b, 0xdc, 0x68, 0x01, 0x25, 0x2c, 0x42, 0xfb, 0xd1, 0x52, 0x00,
    0x01, 0x25, 0x1d, 0x61, 0x0e, 0x88, 0x06, 0x80, 0xdc, 0x68, 0x01, 0x25, 0x2c, 0x42, 0xfb, 0xd1,
    0x07, 0x88, 0xb7, 0x42, 0x0b, 0xd1, 0x14, 0x25, 0x2c, 0x42, 0x05, 0xd1, 0x02, 0x30, 0x02, 0x31,
    0x01, 0x3a, 0xed, 0xd1, 0x00, 0x20, 0xf0, 0xbd, 0x00, 0x20, 0xc0, 0x43, 0xf0, 0xbd, 0x01, 0x20,
    0xc0, 0x43, 0xf0, 0xbd, 0x00, 0xbf, 0x00, 0x20, 0x02, 0x40,
];

pub(crate) struct Stm32f0;

pub fn devices() -> Vec<Device> {
    vec![Device::new(&STM32F051X6, Box::new(Stm32f0))]
}

fn flash_locked(gdb: &mut GdbClient) -> Result<bool> {
    Ok(read_u32(gdb, FCTRL)? & LOCK != 0)
}

fn wait_idle(gdb: &mut GdbClient) -> Result<u32> {
    loop {
        let fsr = read_u32(gdb, FSR)?;
        if fsr & BSY == 0 {
            return Ok(fsr);
        }
    }
}

fn check_error_flags(fsr: u32) -> Result<()> {
    if fsr & WRPERR != 0 {
        warn!("flash controller: write protection error");
    }
    if fsr & PGERR != 0 {
        warn!("flash controller: programming error");
    }
    if fsr & ERR_FLAGS != 0 {
        return Err(Error::DeviceInit("flash controller error flags set"));
    }
    Ok(())
}

fn clear_flash_errors(gdb: &mut GdbClient) -> Result<()> {
    let fsr = read_u32(gdb, FSR)?;
    if fsr & BSY != 0 {
        return Err(Error::DeviceInit("flash controller stuck busy"));
    }
    if fsr & ERR_FLAGS == 0 {
        return Ok(());
    }
    write_u32(gdb, FSR, fsr & ERR_FLAGS)?;
    if read_u32(gdb, FSR)? & ERR_FLAGS == 0 {
        Ok(())
    } else {
        Err(Error::DeviceInit("flash controller errors would not clear"))
    }
}

/// Read-modify-write of one memory mapped register.
fn update_bits(gdb: &mut GdbClient, addr: u32, clear: u32, set: u32) -> Result<()> {
    let value = read_u32(gdb, addr)?;
    write_u32(gdb, addr, value & !clear | set)
}

impl TargetDriver for Stm32f0 {
    fn open(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient, _opts: &TargetOptions) -> Result<()> {
        // clear any latched flash errors first
        let fsr = read_u32(gdb, FSR)?;
        if fsr & (PGERR | WRPERR | EOP) != 0 {
            write_u32(gdb, FSR, fsr & (PGERR | WRPERR | EOP))?;
            if read_u32(gdb, FSR)? & (PGERR | WRPERR | EOP) != 0 {
                return Err(Error::DeviceInit("flash controller errors would not clear"));
            }
        }

        // reset the clock tree to its post-reset HSI state
        update_bits(gdb, RCC_CR, 0, 1)?; // HSION
        update_bits(gdb, RCC_CFGR, !0xf8ff_b80c, 0)?; // SW, HPRE, PPRE, ADCPRE, MCOSEL
        update_bits(gdb, RCC_CR, !0xfef6_ffff, 0)?; // HSEON, CSSON, PLLON
        update_bits(gdb, RCC_CR, !0xfffb_ffff, 0)?; // HSEBYP
        update_bits(gdb, RCC_CFGR, !0xffc0_ffff, 0)?; // PLLSRC, PLLXTPRE, PLLMUL
        update_bits(gdb, RCC_CFGR2, !0xffff_fff0, 0)?; // PREDIV
        update_bits(gdb, RCC_CFGR3, !0xffff_feac, 0)?; // USARTSW, I2CSW, CECSW, ADCSW
        update_bits(gdb, RCC_CR2, !0xffff_fffe, 0)?; // HSI14
        write_u32(gdb, RCC_CIR, 0)?; // all clock interrupts off

        // prefetch on, one wait state, good up to 48 MHz
        write_u32(gdb, FACR, 0x10 | 1)?;

        // (HSI / 2) * 12 = ~48 MHz SYSCLK
        update_bits(gdb, RCC_CFGR, 0x10000 | 0x20000 | 0x3c0000, 0)?;
        update_bits(gdb, RCC_CFGR, 0, 0x28_0000)?; // PLLMUL12
        update_bits(gdb, RCC_CR, 0, 0x0100_0000)?; // PLLON
        loop {
            if read_u32(gdb, RCC_CR)? & 0x0200_0000 != 0 {
                break; // PLLRDY
            }
        }

        // switch SYSCLK over to the PLL and wait for the switch to report
        update_bits(gdb, RCC_CFGR, 3, 0)?;
        update_bits(gdb, RCC_CFGR, 0, 2)?;
        loop {
            if read_u32(gdb, RCC_CFGR)? & 0xc == 8 {
                break;
            }
        }

        // pin SYSCLK out on PA8 (MCO), visible on a scope when things go bad
        update_bits(gdb, RCC_AHBENR, 0, 1 << 17)?; // port a clock
        update_bits(gdb, RCC_CFGR, 7 << 24, 7 << 24)?; // MCO = sysclk
        update_bits(gdb, PORTA_MODER, 3 << 16, 2 << 16)?; // PA8 alternate function

        info!("target clocks configured, sysclk 48 MHz from pll");
        Ok(())
    }

    fn unlock(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient) -> Result<()> {
        if !flash_locked(gdb)? {
            return Ok(());
        }
        write_u32(gdb, FKEYR, KEY1)?;
        write_u32(gdb, FKEYR, KEY2)?;
        if flash_locked(gdb)? {
            return Err(Error::DeviceInit("flash stayed locked after key sequence"));
        }
        Ok(())
    }

    fn mass_erase(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient) -> Result<()> {
        if flash_locked(gdb)? {
            return Err(Error::DeviceInit("flash is locked, unlock it first"));
        }
        let fsr = wait_idle(gdb)?;
        if check_error_flags(fsr).is_err() {
            info!("flash errors latched, attempting recovery before mass erase");
            clear_flash_errors(gdb)?;
        }
        write_u32(gdb, FCTRL, MER)?;
        write_u32(gdb, FCTRL, MER | STRT)?;
        loop {
            let fsr = read_u32(gdb, FSR)?;
            check_error_flags(fsr)?;
            if fsr & BSY == 0 {
                return Ok(());
            }
        }
    }

    fn erase_sector(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient, sector_nr: u32) -> Result<()> {
        if flash_locked(gdb)? {
            return Err(Error::DeviceInit("flash is locked, unlock it first"));
        }
        let fsr = wait_idle(gdb)?;
        check_error_flags(fsr)?;
        info!("erasing flash sector {}", sector_nr);
        write_u32(gdb, FCTRL, PER)?;
        write_u32(gdb, FAR, sector_nr * SECTOR_SIZE)?;
        write_u32(gdb, FCTRL, PER | STRT)?;
        loop {
            let fsr = read_u32(gdb, FSR)?;
            check_error_flags(fsr)?;
            if fsr & BSY == 0 {
                return Ok(());
            }
        }
    }

    fn program_words(&mut self, info: &DeviceInfo, gdb: &mut GdbClient, dest: u32, words: &[u32]) -> Result<()> {
        if flash_locked(gdb)? {
            return Err(Error::DeviceInit("flash is locked, unlock it first"));
        }
        program_with_helper(info, gdb, FLASH_WRITE_CODE, dest, words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_blob_is_intact() {
        assert_eq!(FLASH_WRITE_CODE.len() % 4, 0);
        assert_eq!(&FLASH_WRITE_CODE[..2], &[0xf0, 0xb5]);
        let sum: u8 = FLASH_WRITE_CODE.iter().fold(0, |a, &b| a.wrapping_add(b));
        assert_eq!(sum, 40);
        // the literal pool holds the flash controller base
        let lit = &FLASH_WRITE_CODE[FLASH_WRITE_CODE.len() - 4..];
        assert_eq!(u32::from_le_bytes([lit[0], lit[1], lit[2], lit[3]]), FBASE);
    }
}
