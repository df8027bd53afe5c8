//! Host-side flash programming of ARM Cortex-M targets over the GDB remote
//! serial protocol.
//!
//! The [`gdb`] module speaks the wire protocol to a gdb server that has a
//! debug probe attached to the target; [`device`] describes the supported
//! parts and implements their flash drivers; [`ops`] layers the generic
//! erase/program operations on top of the drivers.

use std::io;

pub mod device;
pub mod gdb;
pub mod hex;
pub mod ops;

/// Everything that can go wrong between the wire and the target flash.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The gdb server closed the connection.
    #[error("connection closed by the gdb server")]
    ConnectionShutdown,

    /// Socket I/O failed or came up short.
    #[error("communication error with the gdb server")]
    Comm(#[source] io::Error),

    /// No data arrived within the configured idle window.
    #[error("timed out waiting for data from the gdb server")]
    ReadTimeout,

    /// An inbound payload exceeded the packet buffer and was dropped.
    #[error("packet from the gdb server too long, discarded")]
    PacketOverflow,

    /// The server answered `Exx`.
    #[error("gdb server returned error code {0}")]
    Remote(u32),

    /// The server sent data where `OK` (or a well-formed value) was required.
    #[error("unexpected reply from the gdb server: {0:?}")]
    UnexpectedReply(String),

    /// A transfer cap larger than the packet buffer allows was requested.
    #[error("transfer cap of {0} words exceeds the packet buffer")]
    TransferCapTooLarge(usize),

    /// The core refuses to re-enter Thumb state; nothing can be run on it.
    #[error("target is stuck outside thumb state")]
    TargetFault,

    /// Device-specific bring-up (clock or controller setup) failed.
    #[error("target device initialization failed: {0}")]
    DeviceInit(&'static str),

    /// Flash write destinations must sit on a 256-byte boundary.
    #[error("flash write destination {0:#010x} is not 256-byte aligned")]
    BadAlignment(u32),

    /// The address range straddles or misses the declared memory areas.
    #[error("address range {addr:#010x}+{len:#x} is outside the device memory map")]
    AddressOutOfMap { addr: u32, len: u32 },

    /// The driver has no routine for the requested operation and no generic
    /// fallback applies.
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),

    /// Target-resident code (flash helper or IAP routine) reported failure.
    #[error("target flash routine returned error code {0}")]
    HelperFault(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
