//! Generic flash operations layered over the per-device drivers.
//!
//! Each operation first offers the work to the device's own driver hook;
//! a driver that reports [`Error::Unsupported`] gets the generic
//! sector-iteration fallback instead. Uniform safety checks (write
//! alignment, memory map containment) live here so every family is held to
//! the same rules.

use log::info;

use crate::device::{Device, MemType};
use crate::gdb::GdbClient;
use crate::{Error, Result};

/// Erase every sector overlapping `[addr, addr+len)`. Falls back to
/// one-sector-at-a-time erasing when the driver has no area erase routine.
pub fn erase_area(dev: &mut Device, gdb: &mut GdbClient, addr: u32, len: u32) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    match dev.erase_area(gdb, addr, len) {
        Err(Error::Unsupported(_)) => {}
        other => return other,
    }
    info!("no area erase routine for this device, erasing sector by sector");
    let span = dev.info.flash_span(addr, len)?;
    let (first, count) = (span.first_sector as u32, span.count as u32);
    for sector_nr in first..first + count {
        dev.erase_sector(gdb, sector_nr)?;
    }
    Ok(())
}

/// Erase the whole device. Falls back to erasing every sector of every
/// flash area in order when the driver has no mass erase routine.
pub fn mass_erase(dev: &mut Device, gdb: &mut GdbClient) -> Result<()> {
    match dev.mass_erase(gdb) {
        Err(Error::Unsupported(_)) => {}
        other => return other,
    }
    info!("no mass erase routine for this device, erasing sector by sector");
    let mut sector_nr = 0;
    for area in dev.info.flash {
        for _ in area.sectors {
            dev.erase_sector(gdb, sector_nr)?;
            sector_nr += 1;
        }
    }
    Ok(())
}

/// Program `words` into flash at `dest` through the device driver, after
/// the uniform checks: the destination must sit on a 256-byte boundary
/// (the strictest requirement among the supported families) and the whole
/// range must fall inside one declared flash area.
pub fn program_words(dev: &mut Device, gdb: &mut GdbClient, dest: u32, words: &[u32]) -> Result<()> {
    if dest & 0xff != 0 {
        return Err(Error::BadAlignment(dest));
    }
    let len = (words.len() * 4) as u32;
    if dev.info.mem_type(dest, len) != MemType::Flash {
        return Err(Error::AddressOutOfMap { addr: dest, len });
    }
    dev.program_words(gdb, dest, words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceInfo, MemoryArea, TargetDriver};
    use std::cell::RefCell;
    use std::io::{self, Read, Write};
    use std::rc::Rc;

    struct DeadLink;

    impl Read for DeadLink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    impl Write for DeadLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn idle_client() -> GdbClient {
        GdbClient::over(Box::new(DeadLink))
    }

    static TWO_AREA_INFO: DeviceInfo = DeviceInfo {
        name: "testdev",
        options: &[],
        ram: &[MemoryArea { start: 0x2000_0000, len: 0x1000, sectors: &[] }],
        flash: &[
            MemoryArea { start: 0x0800_0000, len: 0x1000, sectors: &[0x400, 0x400, 0x800] },
            MemoryArea { start: 0x0810_0000, len: 0x800, sectors: &[0x400, 0x400] },
        ],
        loader: None,
    };

    /// Driver with only a sector erase routine, recording what it is asked
    /// to do.
    struct SectorOnly {
        erased: Rc<RefCell<Vec<u32>>>,
        programmed: Rc<RefCell<Vec<(u32, usize)>>>,
    }

    impl TargetDriver for SectorOnly {
        fn erase_sector(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient, sector_nr: u32) -> Result<()> {
            self.erased.borrow_mut().push(sector_nr);
            Ok(())
        }

        fn program_words(&mut self, _info: &DeviceInfo, _gdb: &mut GdbClient, dest: u32, words: &[u32]) -> Result<()> {
            self.programmed.borrow_mut().push((dest, words.len()));
            Ok(())
        }
    }

    fn sector_only_device() -> (Device, Rc<RefCell<Vec<u32>>>, Rc<RefCell<Vec<(u32, usize)>>>) {
        let erased = Rc::new(RefCell::new(Vec::new()));
        let programmed = Rc::new(RefCell::new(Vec::new()));
        let driver = SectorOnly {
            erased: erased.clone(),
            programmed: programmed.clone(),
        };
        (Device::new(&TWO_AREA_INFO, Box::new(driver)), erased, programmed)
    }

    /// Driver with no flash capabilities at all.
    struct Inert;
    impl TargetDriver for Inert {}

    #[test]
    fn generic_mass_erase_covers_every_sector_in_order() {
        let (mut dev, erased, _) = sector_only_device();
        let mut gdb = idle_client();
        mass_erase(&mut dev, &mut gdb).unwrap();
        assert_eq!(erased.borrow().as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn generic_erase_area_iterates_the_span() {
        let (mut dev, erased, _) = sector_only_device();
        let mut gdb = idle_client();
        erase_area(&mut dev, &mut gdb, 0x0800_0400, 0xc00).unwrap();
        assert_eq!(erased.borrow().as_slice(), &[1, 2]);
    }

    #[test]
    fn erase_area_of_nothing_is_a_no_op() {
        let (mut dev, erased, _) = sector_only_device();
        let mut gdb = idle_client();
        erase_area(&mut dev, &mut gdb, 0x0800_0000, 0).unwrap();
        assert!(erased.borrow().is_empty());
    }

    #[test]
    fn fallbacks_require_the_sector_primitive() {
        let mut dev = Device::new(&TWO_AREA_INFO, Box::new(Inert));
        let mut gdb = idle_client();
        assert!(matches!(mass_erase(&mut dev, &mut gdb), Err(Error::Unsupported(_))));
        assert!(matches!(
            erase_area(&mut dev, &mut gdb, 0x0800_0000, 0x400),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn aligned_writes_pass_the_guard() {
        let (mut dev, _, programmed) = sector_only_device();
        let mut gdb = idle_client();
        program_words(&mut dev, &mut gdb, 0x0800_0100, &[0; 8]).unwrap();
        assert_eq!(programmed.borrow().as_slice(), &[(0x0800_0100, 8)]);
    }

    #[test]
    fn misaligned_writes_are_rejected() {
        let (mut dev, _, programmed) = sector_only_device();
        let mut gdb = idle_client();
        assert!(matches!(
            program_words(&mut dev, &mut gdb, 0x0800_0040, &[0; 8]),
            Err(Error::BadAlignment(0x0800_0040))
        ));
        assert!(programmed.borrow().is_empty());
    }

    #[test]
    fn writes_outside_flash_are_rejected() {
        let (mut dev, _, programmed) = sector_only_device();
        let mut gdb = idle_client();
        assert!(matches!(
            program_words(&mut dev, &mut gdb, 0x2000_0000, &[0; 8]),
            Err(Error::AddressOutOfMap { .. })
        ));
        assert!(programmed.borrow().is_empty());
    }
}
