//! STM32F4xx flash driver.
//!
//! Unlocking and erasing go straight to the flash interface registers over
//! memory access packets. Programming runs a resident helper routine
//! instead: poking flash one word per request round-trip is far too slow,
//! so the payload is staged in RAM and a small Thumb routine does the
//! actual word programming on the target.

use log::{info, warn};

use super::{
    program_with_helper, read_u32, write_u32, Device, DeviceInfo, LoaderParams, MemoryArea,
    TargetDriver, TargetOptions,
};
use crate::gdb::GdbClient;
use crate::{Error, Result};

// flash interface controller registers
const FBASE: u32 = 0x4002_3c00;
const FACR: u32 = FBASE; // access control
const FKEYR: u32 = FBASE + 0x4; // unlock key
const FSR: u32 = FBASE + 0xc; // status
const FCTRL: u32 = FBASE + 0x10; // control

// FSR bits
const BSY: u32 = 1 << 16;
const PGSERR: u32 = 1 << 7; // programming sequence error
const PGPERR: u32 = 1 << 6; // programming parallelism error
const PGAERR: u32 = 1 << 5; // programming alignment error
const WRPERR: u32 = 1 << 4; // write protection error
const ERR_FLAGS: u32 = PGSERR | PGPERR | PGAERR | WRPERR;

// FCTRL bits
const LOCK: u32 = 1 << 31;
const STRT: u32 = 1 << 16;
const MER: u32 = 1 << 2;
const SER: u32 = 1 << 1;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xcdef_89ab;

static STM32F407G: DeviceInfo = DeviceInfo {
    name: "stm32f407g",
    options: &[],
    ram: &[
        MemoryArea { start: 0x1000_0000, len: 64 * 1024, sectors: &[] },
        MemoryArea { start: 0x2000_0000, len: 112 * 1024, sectors: &[] },
        MemoryArea { start: 0x2001_c000, len: 16 * 1024, sectors: &[] },
    ],
    flash: &[MemoryArea {
        start: 0x0800_0000,
        len: 1024 * 1024,
        sectors: &[
            16 * 1024,
            16 * 1024,
            16 * 1024,
            16 * 1024,
            64 * 1024,
            128 * 1024,
            128 * 1024,
            128 * 1024,
            128 * 1024,
            128 * 1024,
            128 * 1024,
        ],
    }],
    loader: Some(LoaderParams {
        code_addr: 0x2000_0000,
        write_buf_addr: 0x2000_0100,
        write_buf_size: 4000,
        stack_size: 0x200,
    }),
};

/// Machine code of the on-target word programming loop, compiled from:
///
/// ```c
/// int flash_write(volatile uint32_t *dest, uint32_t *src, uint32_t wordcnt)
/// {
///     while (FSR & BSY)
///         ;
///     while (wordcnt--) {
///         FCTRL = (2 << 8) | 1;      /* x32 parallelism, PG */
///         *dest = *src;
///         while (FSR & BSY)
///             ;
///         if (*dest != *src)
///             return -2;
///         dest++; src++;
///         if (FSR)
///             return -1;
///     }
///     return 0;
/// }
/// ```
const FLASH_WRITE_CODE: &[u8] = &[
    0xf0, 0xb5, 0x0f, 0x4c, 0x23, 0x68, 0x13, 0xf4, 0x80, 0x33, 0xfb, 0xd1, 0x0c, 0x4c, 0x0d, 0x4d,
    0x26, 0x46, 0x0d, 0xe0, 0x2f, 0x68, 0x47, 0xf0, 0x01, 0x07, 0x2f, 0x60, 0x50, 0xf8, 0x04, 0x7b,
    0x41, 0xf8, 0x04, 0x7b, 0x27, 0x68, 0xff, 0x03, 0xfc, 0xd4, 0x37, 0x68, 0x01, 0x33, 0x1f, 0xb9,
    0x93, 0x42, 0xef, 0xd1, 0x00, 0x20, 0xf0, 0xbd, 0x4f, 0xf0, 0xff, 0x30, 0xf0, 0xbd, 0x00, 0xbf,
    0x0c, 0x5c, 0x00, 0x40, 0x10, 0x5c, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00,
];

pub(crate) struct Stm32f4;

pub fn devices() -> Vec<Device> {
    vec![Device::new(&STM32F407G, Box::new(Stm32f4))]
}

fn flash_locked(gdb: &mut GdbClient) -> Result<bool> {
    Ok(read_u32(gdb, FCTRL)? & LOCK != 0)
}

/// Poll the status register until the controller goes idle; returns the
/// final status word.
fn wait_idle(gdb: &mut GdbClient) -> Result<u32> {
    loop {
        let fsr = read_u32(gdb, FSR)?;
        if fsr & BSY == 0 {
            return Ok(fsr);
        }
    }
}

fn check_error_flags(fsr: u32) -> Result<()> {
    if fsr & PGSERR != 0 {
        warn!("flash controller: programming sequence error");
    }
    if fsr & PGPERR != 0 {
        warn!("flash controller: programming parallelism error");
    }
    if fsr & PGAERR != 0 {
        warn!("flash controller: programming alignment error");
    }
    if fsr & WRPERR != 0 {
        warn!("flash controller: write protection error");
    }
    if fsr & ERR_FLAGS != 0 {
        return Err(Error::DeviceInit("flash controller error flags set"));
    }
    Ok(())
}

/// Error flags are write-one-to-clear; writing them back and re-reading
/// tells whether the condition is latched for good.
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

impl TargetDriver for Stm32f4 {
    fn open(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient, _opts: &TargetOptions) -> Result<()> {
        // clear any error flags latched from a previous session
        let fsr = read_u32(gdb, FSR)?;
        if fsr & 0xf0 != 0 {
            write_u32(gdb, FSR, fsr & 0xf0)?;
            if read_u32(gdb, FSR)? & 0xf0 != 0 {
                return Err(Error::DeviceInit("flash controller errors would not clear"));
            }
        }
        Ok(())
    }

    fn unlock(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient) -> Result<()> {
        if !flash_locked(gdb)? {
            return Ok(());
        }
        write_u32(gdb, FKEYR, KEY1)?;
        write_u32(gdb, FKEYR, KEY2)?;
        // slowest flash access (7 wait states) until somebody computes the
        // proper value from the actual clock tree
        write_u32(gdb, FACR, 0x7)?;
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
        write_u32(gdb, FCTRL, SER | sector_nr << 3)?;
        write_u32(gdb, FCTRL, SER | STRT | sector_nr << 3)?;
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
        // word-aligned for the upload, starts with `push {..., lr}`, and
        // the recorded checksum matches
        assert_eq!(FLASH_WRITE_CODE.len() % 4, 0);
        assert_eq!(&FLASH_WRITE_CODE[..2], &[0xf0, 0xb5]);
        let sum: u8 = FLASH_WRITE_CODE.iter().fold(0, |a, &b| a.wrapping_add(b));
        assert_eq!(sum, 156);
    }
}
