//! STM32F10x flash driver.
//!
//! The flash interface is register compatible with the F0 family (same
//! base, same bit layout, half-word programming unit), so the resident
//! helper is the same Thumb-1 routine. What differs is the unlock sequence,
//! which also programs the access-control register for this family's
//! wait-state requirements.

use log::{info, warn};

use super::{
    program_with_helper, read_u32, write_u32, Device, DeviceInfo, LoaderParams, MemoryArea,
    TargetDriver,
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
const ERR_FLAGS: u32 = PGERR | WRPERR;

// FCTRL bits
const LOCK: u32 = 1 << 7;
const STRT: u32 = 1 << 6;
const MER: u32 = 1 << 2;
const PER: u32 = 1 << 1;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xcdef_89ab;

const SECTOR_SIZE: u32 = 1024;

static STM32F100XB: DeviceInfo = DeviceInfo {
    name: "stm32f100xb",
    options: &[],
    ram: &[MemoryArea { start: 0x2000_0000, len: 8 * 1024, sectors: &[] }],
    flash: &[MemoryArea {
        start: 0x0800_0000,
        len: 128 * 1024,
        sectors: &[SECTOR_SIZE; 128],
    }],
    loader: Some(LoaderParams {
        code_addr: 0x2000_0000,
        write_buf_addr: 0x2000_0100,
        write_buf_size: 0x1800,
        stack_size: 0x200,
    }),
};

/// Same half-word programming routine as the F0 driver carries; the two
/// families share the flash interface layout. See `stm32f0::FLASH_WRITE_CODE`
/// for the assembly listing.
const FLASH_WRITE_CODE: &[u8] = &[
    0xf0, 0xb5, 0x10, 0x4b, 0xdc, 0x68, 0x01, 0x25, 0x2c, 0x42, 0xfb, 0xd1, 0x52, 0x00,
    0x01, 0x25, 0x1d, 0x61, 0x0e, 0x88, 0x06, 0x80, 0xdc, 0x68, 0x01, 0x25, 0x2c, 0x42, 0xfb, 0xd1,
    0x07, 0x88, 0xb7, 0x42, 0x0b, 0xd1, 0x14, 0x25, 0x2c, 0x42, 0x05, 0xd1, 0x02, 0x30, 0x02, 0x31,
    0x01, 0x3a, 0xed, 0xd1, 0x00, 0x20, 0xf0, 0xbd, 0x00, 0x20, 0xc0, 0x43, 0xf0, 0xbd, 0x01, 0x20,
    0xc0, 0x43, 0xf0, 0xbd, 0x00, 0xbf, 0x00, 0x20, 0x02, 0x40,
];

pub(crate) struct Stm32f1;

pub fn devices() -> Vec<Device> {
    vec![Device::new(&STM32F100XB, Box::new(Stm32f1))]
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

impl TargetDriver for Stm32f1 {
    fn unlock(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient) -> Result<()> {
        if !flash_locked(gdb)? {
            return Ok(());
        }
        write_u32(gdb, FKEYR, KEY1)?;
        write_u32(gdb, FKEYR, KEY2)?;
        // prefetch on, two wait states
        write_u32(gdb, FACR, 0x32)?;
        Ok(())
    }

    fn mass_erase(&mut self, _info: &DeviceInfo, gdb: &mut GdbClient) -> Result<()> {
        wait_idle(gdb)?;
        write_u32(gdb, FCTRL, MER)?;
        write_u32(gdb, FCTRL, MER | STRT)?;
        wait_idle(gdb)?;
        Ok(())
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
    }
}
