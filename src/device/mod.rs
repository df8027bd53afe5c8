//! Target device descriptions and the per-family flash drivers.
//!
//! Every supported part publishes a [`DeviceInfo`] (name, memory map,
//! command line option schema, RAM staging layout) and a [`TargetDriver`]
//! implementing the flash capabilities it actually has. Capabilities a
//! family lacks keep their default `Unsupported` bodies; the dispatch layer
//! in [`crate::ops`] falls back to generic routines where that makes sense.

pub mod lpc17xx;
pub mod stm32f0;
pub mod stm32f1;
pub mod stm32f4;

use std::collections::HashMap;

use log::info;

use crate::gdb::{GdbClient, RoutineCall};
use crate::{Error, Result};

/// What a target address range resolves to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemType {
    Invalid,
    Ram,
    Flash,
}

/// One contiguous region of target memory.
#[derive(Debug)]
pub struct MemoryArea {
    pub start: u32,
    pub len: u32,
    /// Sector sizes in order from `start`; empty for RAM. The sizes sum to
    /// `len`.
    pub sectors: &'static [u32],
}

impl MemoryArea {
    fn contains(&self, addr: u32) -> bool {
        self.start <= addr && (addr as u64) < self.start as u64 + self.len as u64
    }

    fn encloses(&self, addr: u32, len: u32) -> bool {
        self.contains(addr) && addr as u64 + len as u64 <= self.start as u64 + self.len as u64
    }
}

/// RAM staging layout for drivers that upload a flash-write helper: the
/// helper code goes at `code_addr`, payload chunks are staged at
/// `write_buf_addr`, and the helper's stack grows down from the end of the
/// buffer plus `stack_size`.
#[derive(Debug)]
pub struct LoaderParams {
    pub code_addr: u32,
    pub write_buf_addr: u32,
    pub write_buf_size: u32,
    pub stack_size: u32,
}

/// Schema entry for a device specific `key=value` command line option.
#[derive(Debug)]
pub struct OptionSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub numeric: bool,
    pub required: bool,
}

/// Static description of one supported part.
#[derive(Debug)]
pub struct DeviceInfo {
    pub name: &'static str,
    pub options: &'static [OptionSpec],
    pub ram: &'static [MemoryArea],
    pub flash: &'static [MemoryArea],
    pub loader: Option<LoaderParams>,
}

/// A run of flash sectors covering an address range, numbered within their
/// area.
#[derive(Debug)]
pub struct FlashSpan<'a> {
    pub area: &'a MemoryArea,
    pub first_sector: usize,
    pub count: usize,
}

impl DeviceInfo {
    /// Classify an address range: RAM areas are consulted first, then
    /// flash. A range that straddles an area boundary or hits no declared
    /// area at all is invalid.
    pub fn mem_type(&self, addr: u32, len: u32) -> MemType {
        for (areas, mem_type) in [(self.ram, MemType::Ram), (self.flash, MemType::Flash)] {
            if let Some(area) = areas.iter().find(|a| a.contains(addr)) {
                return if area.encloses(addr, len) {
                    mem_type
                } else {
                    MemType::Invalid
                };
            }
        }
        MemType::Invalid
    }

    /// Locate the run of flash sectors whose starts fall inside
    /// `[addr, addr+len)`. Errors if no sector start lands in the range or
    /// if the range runs past the end of its area.
    pub fn flash_span(&self, addr: u32, len: u32) -> Result<FlashSpan<'_>> {
        let end = addr as u64 + len as u64;
        for area in self.flash {
            let mut sector_start = area.start as u64;
            let mut first = None;
            for (i, &size) in area.sectors.iter().enumerate() {
                if addr as u64 <= sector_start && sector_start < end {
                    first = Some(i);
                    break;
                }
                sector_start += size as u64;
            }
            let Some(first) = first else { continue };

            let mut last = first;
            let mut next_start = sector_start + area.sectors[first] as u64;
            while next_start < end {
                last += 1;
                match area.sectors.get(last) {
                    Some(&size) => next_start += size as u64,
                    None => return Err(Error::AddressOutOfMap { addr, len }),
                }
            }
            return Ok(FlashSpan {
                area,
                first_sector: first,
                count: last - first + 1,
            });
        }
        Err(Error::AddressOutOfMap { addr, len })
    }

    /// The flash sector enclosing a single address.
    pub fn flash_sector_containing(&self, addr: u32) -> Result<(&MemoryArea, usize)> {
        for area in self.flash {
            if !area.contains(addr) {
                continue;
            }
            let mut sector_end = area.start as u64;
            for (i, &size) in area.sectors.iter().enumerate() {
                sector_end += size as u64;
                if (addr as u64) < sector_end {
                    return Ok((area, i));
                }
            }
        }
        Err(Error::AddressOutOfMap { addr, len: 1 })
    }
}

/// Parsed values for a device's `key=value` command line options.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions(HashMap<String, OptionValue>);

#[derive(Debug, Clone)]
pub enum OptionValue {
    Num(u32),
    Text(String),
}

impl TargetOptions {
    pub fn insert(&mut self, name: &str, value: OptionValue) {
        self.0.insert(name.to_owned(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn numeric(&self, name: &str) -> Option<u32> {
        match self.0.get(name) {
            Some(OptionValue::Num(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(OptionValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// The flash capability surface a family driver fills in. Unimplemented
/// methods report [`Error::Unsupported`], which the dispatch layer treats
/// as "fall back to a generic routine, or give up".
pub trait TargetDriver {
    /// One-time target bring-up: clocks, controller state, self tests.
    fn open(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient, _opts: &TargetOptions) -> Result<()> {
        Ok(())
    }

    /// Device shutdown, if the family needs any.
    fn close(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient) -> Result<()> {
        Ok(())
    }

    /// Family specific validation of the parsed command line options, run
    /// before `open`.
    fn validate_options(&mut self, _info: &DeviceInfo, _opts: &TargetOptions) -> Result<()> {
        Ok(())
    }

    /// Unlock flash for erasing and programming. The default assumes the
    /// flash needs no unlocking.
    fn unlock(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient) -> Result<()> {
        Ok(())
    }

    /// Erase one sector, numbered from zero within the device's flash.
    fn erase_sector(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient, _sector_nr: u32) -> Result<()> {
        Err(Error::Unsupported("flash sector erase"))
    }

    /// Erase every sector overlapping `[addr, addr+len)` in one operation.
    fn erase_area(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient, _addr: u32, _len: u32) -> Result<()> {
        Err(Error::Unsupported("flash area erase"))
    }

    /// Erase the whole device in one operation.
    fn mass_erase(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient) -> Result<()> {
        Err(Error::Unsupported("flash mass erase"))
    }

    /// Program `words` into flash at `dest`.
    fn program_words(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient, _dest: u32, _words: &[u32]) -> Result<()> {
        Err(Error::Unsupported("flash programming"))
    }
}

/// One selectable device: its static description plus a driver instance.
pub struct Device {
    pub info: &'static DeviceInfo,
    driver: Box<dyn TargetDriver>,
}

impl Device {
    pub fn new(info: &'static DeviceInfo, driver: Box<dyn TargetDriver>) -> Self {
        Device { info, driver }
    }

    pub fn open(&mut self, gdb: &mut GdbClient, opts: &TargetOptions) -> Result<()> {
        let info = self.info;
        self.driver.open(info, gdb, opts)
    }

    pub fn close(&mut self, gdb: &mut GdbClient) -> Result<()> {
        let info = self.info;
        self.driver.close(info, gdb)
    }

    pub fn validate_options(&mut self, opts: &TargetOptions) -> Result<()> {
        let info = self.info;
        self.driver.validate_options(info, opts)
    }

    pub fn unlock(&mut self, gdb: &mut GdbClient) -> Result<()> {
        let info = self.info;
        self.driver.unlock(info, gdb)
    }

    pub fn erase_sector(&mut self, gdb: &mut GdbClient, sector_nr: u32) -> Result<()> {
        let info = self.info;
        self.driver.erase_sector(info, gdb, sector_nr)
    }

    pub fn erase_area(&mut self, gdb: &mut GdbClient, addr: u32, len: u32) -> Result<()> {
        let info = self.info;
        self.driver.erase_area(info, gdb, addr, len)
    }

    pub fn mass_erase(&mut self, gdb: &mut GdbClient) -> Result<()> {
        let info = self.info;
        self.driver.mass_erase(info, gdb)
    }

    pub fn program_words(&mut self, gdb: &mut GdbClient, dest: u32, words: &[u32]) -> Result<()> {
        let info = self.info;
        self.driver.program_words(info, gdb, dest, words)
    }
}

/// Every supported device, built by concatenating the family lists. Names
/// are unique across the set.
pub fn devices() -> Vec<Device> {
    let mut devs = Vec::new();
    devs.extend(stm32f1::devices());
    devs.extend(stm32f4::devices());
    devs.extend(stm32f0::devices());
    devs.extend(lpc17xx::devices());
    devs
}

/// Look a device up by name.
pub fn find(name: &str) -> Option<Device> {
    devices().into_iter().find(|d| d.info.name == name)
}

// - MARK: shared driver plumbing

/// One-word target memory read, the unit the MMIO drivers poke registers
/// with.
pub(crate) fn read_u32(gdb: &mut GdbClient, addr: u32) -> Result<u32> {
    let mut word = [0u32; 1];
    gdb.read_words(addr, &mut word)?;
    Ok(word[0])
}

pub(crate) fn write_u32(gdb: &mut GdbClient, addr: u32, value: u32) -> Result<()> {
    gdb.write_words(addr, &[value])
}

/// Pack a little-endian machine code blob into the words `write_words`
/// moves, padding the tail with zeros.
pub(crate) fn code_to_words(code: &[u8]) -> Vec<u32> {
    code.chunks(4)
        .map(|chunk| {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(bytes)
        })
        .collect()
}

/// Program `words` at `dest` by uploading `code` (an AAPCS
/// `flash_write(dest, src, wordcnt)` routine) and running it over one
/// staging-buffer-sized chunk at a time.
///
/// Annotation is suspended for the duration so the nested memory writes
/// stay quiet; a flash-level progress record is emitted per chunk instead.
pub(crate) fn program_with_helper(
    info: &DeviceInfo,
    gdb: &mut GdbClient,
    code: &[u8],
    dest: u32,
    words: &[u32],
) -> Result<()> {
    let Some(loader) = &info.loader else {
        return Err(Error::Unsupported("flash programming"));
    };
    let annotate = gdb.set_annotation(false);
    let result = helper_chunks(loader, gdb, code, dest, words, annotate);
    gdb.set_annotation(annotate);
    result
}

fn helper_chunks(
    loader: &LoaderParams,
    gdb: &mut GdbClient,
    code: &[u8],
    mut dest: u32,
    words: &[u32],
    annotate: bool,
) -> Result<()> {
    gdb.write_words(loader.code_addr, &code_to_words(code))?;

    let chunk_words = (loader.write_buf_size / 4) as usize;
    let stack_top = loader.write_buf_addr + loader.write_buf_size + loader.stack_size;
    let total = words.len() * 4;
    let mut done = 0;
    for chunk in words.chunks(chunk_words) {
        gdb.write_words(loader.write_buf_addr, chunk)?;
        let status = gdb.run_target_routine(&RoutineCall {
            entry: loader.code_addr,
            stack_top,
            halt_addr: 0,
            args: [dest, loader.write_buf_addr, chunk.len() as u32, 0],
        })?;
        if status != 0 {
            return Err(Error::HelperFault(status));
        }
        dest += (chunk.len() * 4) as u32;
        done += chunk.len() * 4;
        info!("{} bytes written", done);
        if annotate {
            println!("[VX-FLASH-WRITE-PROGRESS]\t{}\t{}", done, total);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f4_info() -> &'static DeviceInfo {
        stm32f4::devices()[0].info
    }

    #[test]
    fn sector_sizes_sum_to_area_length() {
        for dev in devices() {
            for area in dev.info.flash {
                let total: u64 = area.sectors.iter().map(|&s| s as u64).sum();
                assert_eq!(total, area.len as u64, "device {}", dev.info.name);
            }
            for area in dev.info.ram {
                assert!(area.sectors.is_empty(), "device {}", dev.info.name);
            }
        }
    }

    #[test]
    fn device_names_are_unique() {
        let devs = devices();
        for (i, a) in devs.iter().enumerate() {
            for b in &devs[i + 1..] {
                assert_ne!(a.info.name, b.info.name);
            }
        }
    }

    #[test]
    fn classifies_ram_flash_and_junk() {
        let info = f4_info();
        assert_eq!(info.mem_type(0x2000_0000, 4), MemType::Ram);
        assert_eq!(info.mem_type(0x0800_0000, 1024), MemType::Flash);
        assert_eq!(info.mem_type(0x4000_0000, 4), MemType::Invalid);
        // straddling the end of an area is invalid, not truncated
        assert_eq!(info.mem_type(0x2001_bffc, 8), MemType::Invalid);
    }

    #[test]
    fn locates_single_sector() {
        let info = f4_info();
        let span = info.flash_span(0x0800_c000, 1).unwrap();
        assert_eq!((span.first_sector, span.count), (3, 1));
    }

    #[test]
    fn locates_sector_run() {
        let info = f4_info();
        let span = info.flash_span(0x0800_0000, 0x2_0000).unwrap();
        assert_eq!((span.first_sector, span.count), (0, 5));
    }

    #[test]
    fn span_past_area_end_is_rejected() {
        let info = f4_info();
        assert!(matches!(
            info.flash_span(0x0800_0000, 0x20_0000),
            Err(Error::AddressOutOfMap { .. })
        ));
    }

    #[test]
    fn sector_lookup_by_address() {
        let info = f4_info();
        assert_eq!(info.flash_sector_containing(0x0800_0000).unwrap().1, 0);
        assert_eq!(info.flash_sector_containing(0x0800_ffff).unwrap().1, 3);
        assert_eq!(info.flash_sector_containing(0x0801_0000).unwrap().1, 4);
        assert!(info.flash_sector_containing(0x0810_0000).is_err());
    }

    #[test]
    fn span_outside_flash_is_rejected() {
        let info = f4_info();
        assert!(matches!(
            info.flash_span(0x2000_0000, 16),
            Err(Error::AddressOutOfMap { .. })
        ));
    }

    #[test]
    fn code_words_pad_the_tail() {
        assert_eq!(code_to_words(&[1, 2, 3, 4, 5]), vec![0x0403_0201, 0x0000_0005]);
    }
}
