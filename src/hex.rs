//! Intel hex image loading.
//!
//! Parses ihex records into an ordered list of contiguous memory regions.
//! ELF inputs are accepted too: they are converted with `objcopy -O ihex`
//! into a scratch file first, the way the original flashing scripts always
//! did it.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};

use crate::gdb::hex_val;

/// One contiguous run of image bytes destined for `addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub addr: u32,
    pub data: Vec<u8>,
}

// ihex record types
const RT_DATA: u8 = 0x00;
const RT_EOF: u8 = 0x01;
const RT_EXT_SEGMENT: u8 = 0x02;
const RT_START_SEGMENT: u8 = 0x03;
const RT_EXT_LINEAR: u8 = 0x04;
const RT_START_LINEAR: u8 = 0x05;

/// Load an image file: ihex directly, ELF via objcopy.
pub fn load_image(path: &Path) -> Result<Vec<Region>> {
    let head = fs::read(path)
        .with_context(|| format!("failed to read image file {}", path.display()))?;
    if head.starts_with(b"\x7fELF") {
        let regions = load_elf(path)?;
        return Ok(regions);
    }
    if head.first() == Some(&b':') {
        let text = String::from_utf8(head).context("hex file is not valid text")?;
        return parse(&text).with_context(|| format!("malformed hex file {}", path.display()));
    }
    bail!("{}: file format not recognized (expected intel hex or elf)", path.display());
}

/// Convert an ELF to ihex next to the input, parse it, clean up.
fn load_elf(path: &Path) -> Result<Vec<Region>> {
    let mut hex_path = path.as_os_str().to_owned();
    hex_path.push(".ihex");
    let hex_path = Path::new(&hex_path);

    info!("converting {} to intel hex with objcopy", path.display());
    let status = Command::new("objcopy")
        .arg("-O")
        .arg("ihex")
        .arg(path)
        .arg(hex_path)
        .status()
        .context("failed to run objcopy; make sure it is installed and in PATH")?;
    ensure!(status.success(), "objcopy failed with {status}");

    let text = fs::read_to_string(hex_path).context("failed to read objcopy output")?;
    let result = parse(&text);
    let _ = fs::remove_file(hex_path);
    result
}

/// Parse ihex text into regions. Adjacent data records merge into one
/// region; non-adjacent records open a new one. Regions come out in file
/// order and are not merged across gaps.
pub fn parse(text: &str) -> Result<Vec<Region>> {
    let mut regions: Vec<Region> = Vec::new();
    let mut base: u32 = 0;

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let digits = line
            .strip_prefix(':')
            .with_context(|| format!("line {lineno}: record does not start with ':'"))?;
        let raw = decode_hex(digits).with_context(|| format!("line {lineno}: bad hex digits"))?;
        ensure!(raw.len() >= 5, "line {lineno}: record too short");

        let sum = raw.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        ensure!(sum == 0, "line {lineno}: record checksum mismatch");

        let len = raw[0] as usize;
        let offset = u16::from_be_bytes([raw[1], raw[2]]) as u32;
        let rectype = raw[3];
        let data = &raw[4..raw.len() - 1];
        ensure!(data.len() == len, "line {lineno}: record length field disagrees with data");

        match rectype {
            RT_DATA => {
                let addr = base + offset;
                match regions.last_mut() {
                    Some(last) if last.addr as u64 + last.data.len() as u64 == addr as u64 => {
                        last.data.extend_from_slice(data);
                    }
                    _ => {
                        debug!("image region at {:#010x}", addr);
                        regions.push(Region { addr, data: data.to_vec() });
                    }
                }
            }
            RT_EOF => break,
            RT_EXT_SEGMENT => {
                ensure!(len == 2, "line {lineno}: bad extended segment record");
                base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
            }
            RT_EXT_LINEAR => {
                ensure!(len == 2, "line {lineno}: bad extended linear record");
                base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
            }
            // entry point records carry nothing to load
            RT_START_SEGMENT | RT_START_LINEAR => {}
            other => bail!("line {lineno}: unknown record type {other:#04x}"),
        }
    }
    Ok(regions)
}

fn decode_hex(digits: &str) -> Result<Vec<u8>> {
    let digits = digits.as_bytes();
    ensure!(digits.len() % 2 == 0, "odd number of hex digits");
    digits
        .chunks_exact(2)
        .map(|pair| {
            let (h, l) = (hex_val(pair[0]), hex_val(pair[1]));
            ensure!(h != 0xff && l != 0xff, "invalid hex digit");
            Ok(h << 4 | l)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_records_and_merges_adjacent_ones() {
        let text = ":0400000001020304F2\n:04000400AABBCCDDEA\n:00000001FF\n";
        let regions = parse(text).unwrap();
        assert_eq!(
            regions,
            vec![Region { addr: 0, data: vec![1, 2, 3, 4, 0xaa, 0xbb, 0xcc, 0xdd] }]
        );
    }

    #[test]
    fn gap_opens_a_new_region() {
        let text = ":0400000001020304F2\n:04010000AABBCCDDED\n:00000001FF\n";
        let regions = parse(text).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].addr, 0x100);
    }

    #[test]
    fn extended_linear_address_relocates() {
        let text = ":020000040800F2\n:040000001122334452\n:00000001FF\n";
        let regions = parse(text).unwrap();
        assert_eq!(regions[0].addr, 0x0800_0000);
        assert_eq!(regions[0].data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn extended_segment_address_relocates() {
        let text = ":020000021000EC\n:040000001122334452\n:00000001FF\n";
        let regions = parse(text).unwrap();
        assert_eq!(regions[0].addr, 0x1000 << 4);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        assert!(parse(":0400000001020304F3\n").is_err());
    }

    #[test]
    fn length_field_must_match_data() {
        assert!(parse(":0500000001020304F1\n").is_err());
    }

    #[test]
    fn records_after_eof_are_ignored() {
        let text = ":00000001FF\n:040000001122334452\n";
        assert!(parse(text).unwrap().is_empty());
    }
}
