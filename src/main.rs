//! Command line front end for the flash programmer.
//!
//! Mirrors the classic flasher grammar: pick a device with `-d`, then any
//! of the memory/flash operations. The gdb server is only contacted once
//! an operation actually needs the target.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::info;

use gdbflash::device::{self, Device, MemType, OptionValue, TargetOptions};
use gdbflash::gdb::{GdbClient, DEFAULT_HOST, DEFAULT_PORT};
use gdbflash::{hex, ops};

#[derive(Parser)]
#[command(name = "gdbflash", version, about = "Flash ARM Cortex-M targets through a gdb server")]
struct Cli {
    /// Target device name (see --list)
    #[arg(short = 'd', long = "device", value_name = "NAME")]
    device: Option<String>,

    /// gdb server host (dotted quad)
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// gdb server TCP port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// List supported devices and their memory maps
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Emit machine readable progress and inventory records
    #[arg(long = "enable-vx-annotation")]
    annotate: bool,

    /// Device specific option as KEY=VALUE, may be repeated
    #[arg(long = "target-option", value_name = "KEY=VALUE")]
    target_options: Vec<String>,

    /// Dump the target register file and exit
    #[arg(long)]
    regs: bool,

    /// Read memory into a file: ADDR WORDS FILE
    #[arg(short = 'r', long = "read", num_args = 3, value_names = ["ADDR", "WORDS", "FILE"])]
    read: Option<Vec<String>>,

    /// Erase and program a raw binary file into flash: ADDR FILE
    #[arg(short = 'w', long = "write", num_args = 2, value_names = ["ADDR", "FILE"])]
    write: Option<Vec<String>>,

    /// Erase, program and verify an intel hex or elf image
    #[arg(short = 'x', long = "hex-file", value_name = "FILE")]
    hex_file: Option<PathBuf>,

    /// Erase the flash sectors overlapping a range: ADDR LEN
    #[arg(long = "erase-area", num_args = 2, value_names = ["ADDR", "LEN"])]
    erase_area: Option<Vec<String>>,

    /// Erase one flash sector by number
    #[arg(long = "erase-sector", value_name = "N")]
    erase_sector: Option<u32>,

    /// Mass erase the device
    #[arg(short = 'e', long = "mass-erase")]
    mass_erase: bool,

    /// Resume the target and exit
    #[arg(long = "cont")]
    cont: bool,

    /// Halt the target and exit
    #[arg(long = "stop", visible_alias = "halt")]
    stop: bool,

    /// Attach and stream target console output
    #[arg(long = "console")]
    console: bool,

    /// Run memory read/write speed tests over the first RAM area
    #[arg(short = 't', long = "benchmark")]
    benchmark: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if cli.annotate {
                println!("[VX-ERROR]{err:#}");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Lazily-connected target state shared by the operations.
struct Session<'a> {
    cli: &'a Cli,
    gdb: Option<GdbClient>,
    opened: bool,
}

impl Session<'_> {
    /// Connect on first use: acknowledge, flush a stray continue, break in
    /// and wait for the halt, then cap transfers at the empirically fastest
    /// request size.
    fn gdb(&mut self) -> Result<&mut GdbClient> {
        if self.gdb.is_none() {
            let mut gdb = GdbClient::connect(&self.cli.host, self.cli.port)
                .context("failed to connect to the gdb server")?;
            gdb.set_annotation(self.cli.annotate);
            gdb.send_ack()?;
            gdb.send_packet_raw("c")?;
            gdb.send_break()?;
            gdb.wait_halted()?;
            gdb.set_max_transfer_words(67 * 11)?;
            self.gdb = Some(gdb);
        }
        Ok(self.gdb.as_mut().expect("connection established above"))
    }

    /// Run the device's one-time bring-up exactly once per invocation.
    fn open_device(&mut self, dev: &mut Device, opts: &TargetOptions) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        for spec in dev.info.options {
            if spec.required && !opts.contains(spec.name) {
                bail!(
                    "mandatory option '{}' for target '{}' not specified (use --target-option {}=VALUE)",
                    spec.name,
                    dev.info.name,
                    spec.name
                );
            }
        }
        dev.validate_options(opts)?;
        let gdb = self.gdb()?;
        dev.open(gdb, opts).context("error opening target")?;
        self.opened = true;
        Ok(())
    }
}

fn run(cli: &Cli) -> Result<()> {
    let devices = device::devices();

    if cli.list {
        list_devices(&devices, cli.annotate);
    }

    let mut target = match &cli.device {
        Some(name) => {
            let dev = devices
                .into_iter()
                .find(|d| d.info.name == *name)
                .ok_or_else(|| anyhow!("unknown device '{name}'; use --list for the supported set"))?;
            Some(dev)
        }
        None => None,
    };

    let options = parse_target_options(target.as_ref(), &cli.target_options)?;
    let mut session = Session { cli, gdb: None, opened: false };

    if cli.stop {
        // plain attach: break in and report the halt, nothing else
        let mut gdb = GdbClient::connect(&cli.host, cli.port)
            .context("failed to connect to the gdb server")?;
        gdb.send_break()?;
        gdb.wait_halted()?;
        println!("target halted");
        return Ok(());
    }

    if cli.regs {
        let gdb = session.gdb()?;
        dump_register_file(gdb)?;
        return Ok(());
    }

    if cli.console {
        return stream_console(cli);
    }

    if cli.mass_erase {
        let dev = target.as_mut().ok_or_else(|| anyhow!("no device selected, use -d"))?;
        session.open_device(dev, &options)?;
        let gdb = session.gdb()?;
        dev.unlock(gdb).context("error unlocking target flash, target may need reset")?;
        ops::mass_erase(dev, gdb).context("error mass erasing target flash")?;
        println!("ok, chip successfully mass erased");
    }

    if let Some(sector_nr) = cli.erase_sector {
        let dev = target.as_mut().ok_or_else(|| anyhow!("no device selected, use -d"))?;
        session.open_device(dev, &options)?;
        let gdb = session.gdb()?;
        dev.unlock(gdb).context("error unlocking target flash, target may need reset")?;
        let started = Instant::now();
        dev.erase_sector(gdb, sector_nr)
            .with_context(|| format!("error erasing flash sector {sector_nr}"))?;
        println!("sector erased in {:.2} seconds", started.elapsed().as_secs_f64());
    }

    if let Some(args) = &cli.erase_area {
        let addr = parse_u32(&args[0]).context("bad erase address")?;
        let len = parse_u32(&args[1]).context("bad erase length")?;
        let dev = target.as_mut().ok_or_else(|| anyhow!("no device selected, use -d"))?;
        session.open_device(dev, &options)?;
        let gdb = session.gdb()?;
        dev.unlock(gdb).context("error unlocking target flash, target may need reset")?;
        let started = Instant::now();
        ops::erase_area(dev, gdb, addr, len).context("error erasing flash")?;
        report_speed("flash erase", len as usize, started);
    }

    if let Some(args) = &cli.write {
        let addr = parse_u32(&args[0]).context("bad write address")?;
        let path = PathBuf::from(&args[1]);
        let bytes = fs::read(&path)
            .with_context(|| format!("error reading input file {}", path.display()))?;
        let words = bytes_to_words(&bytes);

        let dev = target.as_mut().ok_or_else(|| anyhow!("no device selected, use -d"))?;
        session.open_device(dev, &options)?;
        let gdb = session.gdb()?;
        dev.unlock(gdb).context("error unlocking target flash, target may need reset")?;
        ops::erase_area(dev, gdb, addr, (words.len() * 4) as u32).context("error erasing flash")?;

        let started = Instant::now();
        ops::program_words(dev, gdb, addr, &words).context("error writing flash")?;
        println!("flash successfully programmed");
        report_speed("flash write", words.len() * 4, started);
    }

    if let Some(path) = &cli.hex_file {
        let regions = hex::load_image(path)?;
        let dev = target.as_mut().ok_or_else(|| anyhow!("no device selected, use -d"))?;
        session.open_device(dev, &options)?;
        program_image(&mut session, dev, &regions)?;
    }

    if let Some(args) = &cli.read {
        let addr = parse_u32(&args[0]).context("bad read address")?;
        let wordcnt = parse_u32(&args[1]).context("bad read word count")? as usize;
        let path = PathBuf::from(&args[2]);

        if let Some(dev) = target.as_mut() {
            session.open_device(dev, &options)?;
        }
        let gdb = session.gdb()?;
        let mut words = vec![0u32; wordcnt];
        let started = Instant::now();
        gdb.read_words(addr, &mut words).context("error reading target memory")?;
        report_speed("memory read", wordcnt * 4, started);

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        fs::write(&path, bytes)
            .with_context(|| format!("error writing output file {}", path.display()))?;
        println!("ok");
    }

    if cli.benchmark {
        let dev = target.as_ref().ok_or_else(|| anyhow!("no device selected, use -d"))?;
        run_benchmark(&mut session, dev.info.ram.first().ok_or_else(|| anyhow!("device has no RAM areas"))?)?;
    }

    if session.opened {
        if let Some(dev) = target.as_mut() {
            let gdb = session.gdb()?;
            dev.close(gdb).context("error shutting the target device down")?;
        }
    }

    if cli.cont {
        let gdb = session.gdb()?;
        gdb.cont()?;
    }

    Ok(())
}

/// Program, then read back and verify, each image region according to what
/// kind of memory it lands in.
fn program_image(session: &mut Session, dev: &mut Device, regions: &[hex::Region]) -> Result<()> {
    for region in regions {
        println!("region: start {:#010x}\tlen {:#010x}", region.addr, region.data.len());
        let words = bytes_to_words(&region.data);
        let byte_len = (words.len() * 4) as u32;
        let gdb = session.gdb()?;

        match dev.info.mem_type(region.addr, byte_len) {
            MemType::Flash => {
                dev.unlock(gdb).context("error unlocking target flash, target may need reset")?;
                ops::erase_area(dev, gdb, region.addr, byte_len).context("error erasing flash")?;
                ops::program_words(dev, gdb, region.addr, &words).with_context(|| {
                    format!("error writing flash region at {:#010x}", region.addr)
                })?;
                println!("flash region successfully programmed");
            }
            MemType::Ram => {
                gdb.write_words(region.addr, &words).with_context(|| {
                    format!("error writing RAM region at {:#010x}", region.addr)
                })?;
            }
            MemType::Invalid => bail!(
                "image region {:#010x}+{:#x} is outside the device memory map",
                region.addr,
                region.data.len()
            ),
        }

        verify_region(dev, session.gdb()?, region, &words)?;
    }
    Ok(())
}

/// Read a just-written region back and compare it word for word.
fn verify_region(dev: &Device, gdb: &mut GdbClient, region: &hex::Region, written: &[u32]) -> Result<()> {
    let mut readback = vec![0u32; written.len()];
    gdb.read_words(region.addr, &mut readback).context("error reading back for verification")?;
    for (i, (got, want)) in readback.iter().zip(written).enumerate() {
        if got == want {
            continue;
        }
        // programming the LPC17xx vector table rewrites word 7 with the
        // boot checksum, so that word legitimately differs from the image
        if region.addr == 0 && i == 7 && dev.info.flash.iter().any(|a| a.start == 0) {
            continue;
        }
        bail!(
            "verification failed at {:#010x}: wrote {:#010x}, read {:#010x}",
            region.addr + (i * 4) as u32,
            want,
            got
        );
    }
    println!("region verified");
    Ok(())
}

/// Pack raw bytes into little-endian words, padding the tail with erased
/// flash bytes.
fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0xffu8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}

fn parse_u32(text: &str) -> Result<u32> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("'{text}' is not a valid number"))
}

fn parse_target_options(target: Option<&Device>, raw: &[String]) -> Result<TargetOptions> {
    let mut options = TargetOptions::default();
    for item in raw {
        let dev = target.ok_or_else(|| {
            anyhow!("--target-option given but no device selected; specify the target with -d first")
        })?;
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("bad option '{item}', expected KEY=VALUE"))?;
        let spec = dev
            .info
            .options
            .iter()
            .find(|s| s.name == key)
            .ok_or_else(|| anyhow!("option '{key}' is not recognized by target '{}'", dev.info.name))?;
        if spec.numeric {
            let num = parse_u32(value)
                .with_context(|| format!("bad numeric value for option '{key}'"))?;
            options.insert(key, OptionValue::Num(num));
        } else {
            options.insert(key, OptionValue::Text(value.to_owned()));
        }
    }
    Ok(options)
}

fn list_devices(devices: &[Device], annotate: bool) {
    println!("list of supported devices:");
    for dev in devices {
        if annotate {
            println!("[VX-DEVLIST-ENTRY]{}", dev.info.name);
        } else {
            println!("{}", dev.info.name);
        }
        for area in dev.info.ram {
            if annotate {
                println!("[VX-RAM-AREA]\t\t{}\t\t{}", area.start, area.len);
            } else {
                println!("ram region\tstart\t{:#010x}\tlength\t{:#010x}", area.start, area.len);
            }
        }
        for area in dev.info.flash {
            if annotate {
                println!("[VX-FLASH-AREA]\t\t{}\t\t{}", area.start, area.len);
            } else {
                println!("flash region\tstart\t{:#010x}\tlength\t{:#010x}", area.start, area.len);
            }
        }
        for spec in dev.info.options {
            println!(
                "option\t{}{}\t{}",
                spec.name,
                if spec.required { " (required)" } else { "" },
                spec.help
            );
        }
    }
}

fn dump_register_file(gdb: &mut GdbClient) -> Result<()> {
    println!("target register file:");
    for nr in 0..16 {
        let value = gdb.read_reg(nr).with_context(|| format!("error reading register {nr}"))?;
        print!("r{nr}: {value:#010x}, ");
        if nr % 4 == 3 {
            println!();
        }
    }
    let xpsr = gdb.read_reg(16).context("error reading xpsr")?;
    let msp = gdb.read_reg(17).context("error reading msp")?;
    let psp = gdb.read_reg(18).context("error reading psp")?;
    println!("xpsr: {xpsr:#010x}, msp: {msp:#010x}, psp: {psp:#010x}");

    // control, faultmask, basepri and primask share one register slot
    let special = gdb.read_reg(19).context("error reading special registers")?;
    let control = special >> 24;
    println!(
        "control: {control:#04x} (thread mode {}, {} stack, fp extensions {})",
        if control & 1 != 0 { "unprivileged" } else { "privileged" },
        if control & 2 != 0 { "process" } else { "main" },
        if control & 4 != 0 { "active" } else { "inactive" },
    );
    println!(
        "faultmask: {:#04x}, basepri: {:#04x}, primask: {:#04x}",
        special >> 16 & 0xff,
        special >> 8 & 0xff,
        special & 0xff
    );
    Ok(())
}

/// Attach without disturbing the target and relay its console packets.
fn stream_console(cli: &Cli) -> Result<()> {
    use std::io::Write as _;

    let mut gdb = GdbClient::connect(&cli.host, cli.port)
        .context("failed to connect to the gdb server")?;
    info!("streaming target console output, interrupt to stop");
    loop {
        let packet = match gdb.poll_async_packet() {
            Ok(packet) => packet,
            Err(gdbflash::Error::ReadTimeout) => continue,
            Err(err) => return Err(err.into()),
        };
        let Some(packet) = packet else { continue };
        gdb.send_ack()?;
        match packet.first() {
            Some(&b'O') => {
                // console payload is hex encoded text
                let mut text = Vec::with_capacity(packet.len() / 2);
                for pair in packet[1..].chunks_exact(2) {
                    let (h, l) = (gdbflash::gdb::hex_val(pair[0]), gdbflash::gdb::hex_val(pair[1]));
                    if h != 0xff && l != 0xff {
                        text.push(h << 4 | l);
                    }
                }
                std::io::stdout().write_all(&text)?;
                std::io::stdout().flush()?;
            }
            Some(&b'S') | Some(&b'T') => {
                println!("target halted: {}", String::from_utf8_lossy(&packet));
            }
            _ => {}
        }
    }
}

fn run_benchmark(session: &mut Session, ram: &device::MemoryArea) -> Result<()> {
    let wordcnt = (ram.len / 4) as usize;
    anyhow::ensure!(wordcnt > 0, "device RAM area is empty, nothing to benchmark");

    let pattern: Vec<u32> = (0..wordcnt as u32).collect();
    let gdb = session.gdb()?;

    println!("performing memory write test...");
    let started = Instant::now();
    gdb.write_words(ram.start, &pattern).context("error writing target memory")?;
    report_speed("memory write", wordcnt * 4, started);

    println!("performing memory read test...");
    let mut readback = vec![0u32; wordcnt];
    let started = Instant::now();
    gdb.read_words(ram.start, &mut readback).context("error reading target memory")?;
    report_speed("memory read", wordcnt * 4, started);

    anyhow::ensure!(readback == pattern, "data written and data read do not match");
    println!("ok, read back data matches");
    Ok(())
}

fn report_speed(what: &str, bytes: usize, started: Instant) {
    let secs = started.elapsed().as_secs_f64();
    if secs > 0.0 {
        println!("{what}: {bytes} bytes in {secs:.2} seconds, {:.1} bytes/second", bytes as f64 / secs);
    }
}
