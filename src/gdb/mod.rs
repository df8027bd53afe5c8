//! GDB remote serial protocol client.
//!
//! Packets travel as `$<payload>#<cc>` where `cc` is the modulo-256 sum of
//! the payload bytes in two lowercase hex digits, acknowledged with `+` and
//! rejected with `-`. This module implements the framed transport and the
//! synchronous request surface used to drive a halted target: memory and
//! register access, hardware breakpoints and run control. Asynchronous
//! traffic (console output, stop replies) is handled by
//! [`AsyncPacketReceiver`].

mod armv7m;
mod receiver;

pub use armv7m::{reg, RoutineCall};
pub use receiver::AsyncPacketReceiver;

use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::{debug, info, warn};

use crate::{Error, Result};

/// The gdb server most probes expose listens here.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1122;

/// ASCII ETX; sent unframed, it interrupts the running target.
const BREAK_CHAR: u8 = 0x03;
/// Staging buffer for bytes pulled off the socket.
const RX_BUF_LEN: usize = 128;
/// Staging buffer for outbound bytes, flushed when full or on sync.
const TX_BUF_LEN: usize = 128;
/// Capacity of the request and reply packet buffers, payload only.
pub const MAX_PACKET_LEN: usize = 1024 * 8 - 16;
/// How long a read may sit idle before the connection is declared dead.
const READ_TIMEOUT: Duration = Duration::from_millis(300_000 + 100);

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Binary value of an ASCII hex digit, 0xff for anything else.
pub fn hex_val(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => 0xff,
    }
}

/// Byte stream carrying the protocol. A [`TcpStream`] in production; tests
/// substitute scripted in-memory streams.
pub trait Connection: Read + Write {}

impl<T: Read + Write> Connection for T {}

/// How the server answered a request.
enum Reply {
    /// `OK`.
    Ok,
    /// Anything that is neither `OK` nor an error code.
    Data,
    /// `E<hex>` with a nonzero code.
    Err(u32),
}

/// Synchronous client for one gdb server connection.
///
/// Exactly one request is in flight at a time; every operation either
/// completes or surfaces one typed [`Error`].
pub struct GdbClient {
    link: Box<dyn Connection>,
    /// Emit machine-readable progress records on stdout.
    annotate: bool,
    /// Per-request word cap for memory transfers, 0 = packet-buffer limit.
    max_transfer_words: usize,
    rx_buf: [u8; RX_BUF_LEN],
    rx_idx: usize,
    rx_cnt: usize,
    tx_buf: [u8; TX_BUF_LEN],
    tx_idx: usize,
    /// Reusable outbound payload buffer.
    request: String,
    /// Reusable inbound payload buffer.
    reply: Vec<u8>,
    async_rx: AsyncPacketReceiver,
}

impl GdbClient {
    /// Connect to a gdb server and acknowledge any packet it may have had
    /// in flight.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        info!("connecting to gdb server at {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).map_err(Error::Comm)?;
        stream.set_read_timeout(Some(READ_TIMEOUT)).map_err(Error::Comm)?;
        stream.set_nodelay(true).map_err(Error::Comm)?;
        let mut client = Self::over(Box::new(stream));
        client.send_ack()?;
        Ok(client)
    }

    /// Build a client over an arbitrary byte stream.
    pub fn over(link: Box<dyn Connection>) -> Self {
        GdbClient {
            link,
            annotate: false,
            max_transfer_words: 0,
            rx_buf: [0; RX_BUF_LEN],
            rx_idx: 0,
            rx_cnt: 0,
            tx_buf: [0; TX_BUF_LEN],
            tx_idx: 0,
            request: String::with_capacity(MAX_PACKET_LEN),
            reply: Vec::with_capacity(MAX_PACKET_LEN),
            async_rx: AsyncPacketReceiver::new(),
        }
    }

    /// Enable or disable annotation records, returning the previous state.
    /// Flash programmers suspend annotation around helper orchestration so
    /// the nested memory writes stay quiet, and restore it on exit.
    pub fn set_annotation(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.annotate, enable)
    }

    pub fn annotation(&self) -> bool {
        self.annotate
    }

    // - MARK: byte transport

    fn get_char(&mut self) -> Result<u8> {
        if self.rx_idx == self.rx_cnt {
            // staging buffer drained, pull more off the socket
            let n = self.link.read(&mut self.rx_buf).map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::ReadTimeout,
                _ => Error::Comm(e),
            })?;
            if n == 0 {
                return Err(Error::ConnectionShutdown);
            }
            self.rx_cnt = n;
            self.rx_idx = 0;
        }
        let c = self.rx_buf[self.rx_idx];
        self.rx_idx += 1;
        Ok(c)
    }

    fn send_char(&mut self, c: u8) -> Result<()> {
        self.tx_buf[self.tx_idx] = c;
        self.tx_idx += 1;
        if self.tx_idx == TX_BUF_LEN {
            self.tx_flush()?;
        }
        Ok(())
    }

    fn tx_flush(&mut self) -> Result<()> {
        if self.tx_idx == 0 {
            return Ok(());
        }
        self.link
            .write_all(&self.tx_buf[..self.tx_idx])
            .map_err(Error::Comm)?;
        self.link.flush().map_err(Error::Comm)?;
        self.tx_idx = 0;
        Ok(())
    }

    // - MARK: packet framing

    /// Frame and transmit one payload. With `wait_confirmation`, anything
    /// other than a `+` in response triggers a resynchronization (ack the
    /// server, drop pending input) and a retransmit.
    fn send_frame(&mut self, payload: &[u8], wait_confirmation: bool) -> Result<()> {
        loop {
            // drop stale buffered input so the confirmation read sees fresh bytes
            self.rx_idx = 0;
            self.rx_cnt = 0;

            self.send_char(b'$')?;
            let mut cksum: u8 = 0;
            for &c in payload {
                self.send_char(c)?;
                cksum = cksum.wrapping_add(c);
            }
            self.send_char(b'#')?;
            self.send_char(HEX_CHARS[(cksum >> 4) as usize])?;
            self.send_char(HEX_CHARS[(cksum & 0xf) as usize])?;
            self.tx_flush()?;

            if !wait_confirmation || self.get_char()? == b'+' {
                return Ok(());
            }

            warn!("gdb server rejected packet, retrying transfer");
            self.send_char(b'+')?;
            self.tx_flush()?;
            // swallow whatever the server was saying before resending
            let _ = self.link.read(&mut self.rx_buf);
        }
    }

    /// Transmit the staged request buffer.
    fn send_request(&mut self, wait_confirmation: bool) -> Result<()> {
        let request = std::mem::take(&mut self.request);
        let result = self.send_frame(request.as_bytes(), wait_confirmation);
        self.request = request;
        result
    }

    /// Receive one packet into the reply buffer, acknowledging good frames
    /// and requesting retransmission of bad ones. With
    /// `ignore_stop_packets`, asynchronous `S`/`T` stop replies arriving on
    /// the request path are consumed and skipped.
    fn read_reply(&mut self, ignore_stop_packets: bool) -> Result<()> {
        loop {
            // hunt for the start-of-packet character
            while self.get_char()? != b'$' {}

            let mut cksum: u8 = 0;
            let mut overflow = false;
            self.reply.clear();
            loop {
                let c = self.get_char()?;
                match c {
                    b'$' => {
                        // restarted frame, begin again
                        cksum = 0;
                        overflow = false;
                        self.reply.clear();
                    }
                    b'#' => break,
                    _ => {
                        cksum = cksum.wrapping_add(c);
                        if self.reply.len() < MAX_PACKET_LEN - 1 {
                            self.reply.push(c);
                        } else {
                            overflow = true;
                        }
                    }
                }
            }

            let mut rx_cksum = hex_val(self.get_char()?) << 4;
            rx_cksum |= hex_val(self.get_char()?);

            if cksum != rx_cksum {
                debug!("checksum mismatch, requesting retransmission");
                self.send_char(b'-')?;
                self.tx_flush()?;
                continue;
            }
            self.send_char(b'+')?;
            self.tx_flush()?;

            // a two-character sequence id is echoed back and stripped
            if self.reply.len() > 2 && self.reply[2] == b':' {
                let (a, b) = (self.reply[0], self.reply[1]);
                self.send_char(a)?;
                self.send_char(b)?;
                self.tx_flush()?;
                self.reply.drain(..3);
            }

            if overflow {
                warn!("packet received too long, packet will be discarded");
                return Err(Error::PacketOverflow);
            }
            if ignore_stop_packets && matches!(self.reply.first(), Some(&b'S') | Some(&b'T')) {
                continue;
            }
            return Ok(());
        }
    }

    fn classify_reply(&self) -> Reply {
        if self.reply.starts_with(b"OK") {
            return Reply::Ok;
        }
        if let Some((&b'E', rest)) = self.reply.split_first() {
            let digits: Vec<u8> = rest.iter().copied().take_while(|&c| hex_val(c) != 0xff).collect();
            if !digits.is_empty() {
                let mut code: u32 = 0;
                for &d in digits.iter().take(8) {
                    code = code << 4 | hex_val(d) as u32;
                }
                if code != 0 {
                    return Reply::Err(code);
                }
            }
        }
        Reply::Data
    }

    fn reply_as_string(&self) -> String {
        String::from_utf8_lossy(&self.reply).into_owned()
    }

    /// The reply must be exactly `OK`.
    fn expect_ok(&self) -> Result<()> {
        match self.classify_reply() {
            Reply::Ok => Ok(()),
            Reply::Err(code) => Err(Error::Remote(code)),
            Reply::Data => Err(Error::UnexpectedReply(self.reply_as_string())),
        }
    }

    /// The reply must be data (a hex payload).
    fn expect_data(&self) -> Result<()> {
        match self.classify_reply() {
            Reply::Data => Ok(()),
            Reply::Err(code) => Err(Error::Remote(code)),
            Reply::Ok => Err(Error::UnexpectedReply(self.reply_as_string())),
        }
    }

    /// Decode the hex reply payload into `out`; fails if the payload is
    /// short or malformed.
    fn decode_reply_bytes(&self, out: &mut [u8]) -> Result<()> {
        if self.reply.len() < out.len() * 2 {
            return Err(Error::UnexpectedReply(self.reply_as_string()));
        }
        for (i, byte) in out.iter_mut().enumerate() {
            let h = hex_val(self.reply[i * 2]);
            let l = hex_val(self.reply[i * 2 + 1]);
            if h == 0xff || l == 0xff {
                return Err(Error::UnexpectedReply(self.reply_as_string()));
            }
            *byte = h << 4 | l;
        }
        Ok(())
    }

    // - MARK: transfer sizing

    /// Most words a single memory access packet can carry: the buffer minus
    /// the worst-case `M%x,%x:` prefix, a terminator and the overflow
    /// guard, at 8 hex characters per word.
    fn packet_limit_words() -> usize {
        (MAX_PACKET_LEN - 21) / 8
    }

    fn transfer_words_per_request(&self) -> usize {
        match self.max_transfer_words {
            0 => Self::packet_limit_words(),
            n => n,
        }
    }

    /// Cap the number of words moved per memory access request. Some
    /// servers fall over on requests sized to our packet buffer; this caps
    /// them lower. Zero restores the packet-buffer limit. Returns the
    /// previous cap.
    pub fn set_max_transfer_words(&mut self, words: usize) -> Result<usize> {
        if words > Self::packet_limit_words() {
            return Err(Error::TransferCapTooLarge(words));
        }
        Ok(std::mem::replace(&mut self.max_transfer_words, words))
    }

    // - MARK: request surface

    /// Read `out.len()` words of target memory starting at `addr`,
    /// splitting into capped chunks as needed.
    pub fn read_words(&mut self, mut addr: u32, out: &mut [u32]) -> Result<()> {
        let max_words = self.transfer_words_per_request();
        let total = out.len() * 4;
        let mut done = 0;
        for chunk in out.chunks_mut(max_words) {
            self.request.clear();
            let _ = write!(self.request, "m{:x},{:x}", addr, chunk.len() * 4);
            self.send_request(true)?;
            self.read_reply(true)?;
            self.expect_data()?;
            let mut bytes = vec![0u8; chunk.len() * 4];
            self.decode_reply_bytes(&mut bytes)?;
            for (word, raw) in chunk.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            addr += (chunk.len() * 4) as u32;
            done += chunk.len() * 4;
            if self.annotate {
                annotation_record("[VX-MEM-READ-PROGRESS]", done, total);
            }
        }
        Ok(())
    }

    /// Write `words` into target memory starting at `addr`.
    pub fn write_words(&mut self, mut addr: u32, words: &[u32]) -> Result<()> {
        let max_words = self.transfer_words_per_request();
        let total = words.len() * 4;
        let mut done = 0;
        for chunk in words.chunks(max_words) {
            self.request.clear();
            let _ = write!(self.request, "M{:x},{:x}:", addr, chunk.len() * 4);
            for word in chunk {
                for byte in word.to_le_bytes() {
                    self.request.push(HEX_CHARS[(byte >> 4) as usize] as char);
                    self.request.push(HEX_CHARS[(byte & 0xf) as usize] as char);
                }
            }
            self.send_request(true)?;
            self.read_reply(true)?;
            self.expect_ok()?;
            addr += (chunk.len() * 4) as u32;
            done += chunk.len() * 4;
            if self.annotate {
                annotation_record("[VX-MEM-WRITE-PROGRESS]", done, total);
            }
        }
        Ok(())
    }

    /// Read one target register.
    pub fn read_reg(&mut self, reg_nr: u32) -> Result<u32> {
        self.request.clear();
        let _ = write!(self.request, "p{:x}", reg_nr);
        self.send_request(true)?;
        self.read_reply(true)?;
        self.expect_data()?;
        let mut bytes = [0u8; 4];
        self.decode_reply_bytes(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write one target register. The value goes out in target byte order,
    /// which is little-endian on every supported core.
    pub fn write_reg(&mut self, reg_nr: u32, value: u32) -> Result<()> {
        self.request.clear();
        let _ = write!(self.request, "P{:x}={:08x}", reg_nr, value.swap_bytes());
        self.send_request(true)?;
        self.read_reply(true)?;
        self.expect_ok()
    }

    /// Plant a hardware breakpoint of `len` bytes at `addr`.
    pub fn insert_hw_breakpoint(&mut self, addr: u32, len: u32) -> Result<()> {
        self.request.clear();
        let _ = write!(self.request, "Z1,{:x},{:x}", addr, len);
        self.send_request(true)?;
        self.read_reply(true)?;
        self.expect_ok()
    }

    /// Remove a hardware breakpoint previously planted at `addr`.
    pub fn remove_hw_breakpoint(&mut self, addr: u32, len: u32) -> Result<()> {
        self.request.clear();
        let _ = write!(self.request, "z1,{:x},{:x}", addr, len);
        self.send_request(true)?;
        self.read_reply(true)?;
        self.expect_ok()
    }

    /// Resume the target. Fire and forget; no stop reply is awaited.
    pub fn cont(&mut self) -> Result<()> {
        self.send_packet("c")
    }

    /// Send a packet and wait for the transport acknowledge only.
    pub fn send_packet(&mut self, payload: &str) -> Result<()> {
        self.request.clear();
        self.request.push_str(payload);
        self.send_request(true)
    }

    /// Send a packet without waiting for any confirmation.
    pub fn send_packet_raw(&mut self, payload: &str) -> Result<()> {
        self.request.clear();
        self.request.push_str(payload);
        self.send_request(false)
    }

    /// Interrupt the running target (raw ETX, no framing).
    pub fn send_break(&mut self) -> Result<()> {
        self.send_char(BREAK_CHAR)?;
        self.tx_flush()
    }

    /// Acknowledge the last packet from the server.
    pub fn send_ack(&mut self) -> Result<()> {
        self.send_char(b'+')?;
        self.tx_flush()
    }

    /// Receive packets until a stop reply (`S`/`T`) arrives.
    pub fn wait_halted(&mut self) -> Result<()> {
        loop {
            self.read_reply(false)?;
            if matches!(self.reply.first(), Some(&b'S') | Some(&b'T')) {
                debug!("target halted: {}", self.reply_as_string());
                return Ok(());
            }
        }
    }

    /// Pull one raw byte off the connection and run it through the
    /// asynchronous packet parser; returns the completed packet, if any.
    /// Used between user commands to drain console output and stop replies
    /// without issuing a request.
    pub fn poll_async_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let c = self.get_char()?;
        Ok(self.async_rx.feed(c).map(|p| p.to_vec()))
    }
}

/// One machine-readable progress record, flushed so a consumer tailing the
/// output sees it immediately.
fn annotation_record(tag: &str, done: usize, total: usize) {
    println!("{}\t{}\t{}", tag, done, total);
    let _ = io::stdout().flush();
}

// - MARK: tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Scripted server side: `input` is replayed to the client, everything
    /// the client sends lands in `sent`.
    struct TestLink {
        input: io::Cursor<Vec<u8>>,
        sent: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for TestLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // one byte at a time, so replies never sit buffered ahead of the
            // request that solicits them
            let n = self.input.read(&mut buf[..1])?;
            if n == 0 {
                // an exhausted script looks like an idle socket
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            Ok(n)
        }
    }

    impl Write for TestLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client_with(script: Vec<u8>) -> (GdbClient, Rc<RefCell<Vec<u8>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let link = TestLink {
            input: io::Cursor::new(script),
            sent: sent.clone(),
        };
        (GdbClient::over(Box::new(link)), sent)
    }

    /// `$payload#cc` as the server would put it on the wire.
    fn frame(payload: &str) -> Vec<u8> {
        let cksum = payload.bytes().fold(0u8, |a, c| a.wrapping_add(c));
        format!("${}#{:02x}", payload, cksum).into_bytes()
    }

    /// Server script answering each of `replies` in turn, with the
    /// transport ack in front of each.
    fn script(replies: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for payload in replies {
            bytes.push(b'+');
            bytes.extend_from_slice(&frame(payload));
        }
        bytes
    }

    #[test]
    fn frame_encoding_round_trips() {
        let (mut client, sent) = client_with(vec![]);
        client.send_packet_raw("m20000000,4").unwrap();
        let wire = sent.borrow().clone();
        let cksum: u8 = b"m20000000,4".iter().fold(0, |a, &c| a.wrapping_add(c));
        assert_eq!(wire, format!("$m20000000,4#{:02x}", cksum).into_bytes());

        let mut rx = AsyncPacketReceiver::new();
        let mut got = None;
        for &c in &wire {
            if let Some(p) = rx.feed(c) {
                got = Some(p.to_vec());
            }
        }
        assert_eq!(got.as_deref(), Some(&b"m20000000,4"[..]));
    }

    #[test]
    fn checksum_mismatch_resynchronizes() {
        let mut input = frame("OK");
        // corrupt the first copy's checksum
        let last = input.len() - 1;
        input[last] ^= 0x01;
        input.extend_from_slice(&frame("OK"));
        let (mut client, sent) = client_with(input);

        client.read_reply(true).unwrap();
        assert_eq!(client.reply, b"OK");
        assert_eq!(sent.borrow().as_slice(), b"-+");
    }

    #[test]
    fn sequence_id_is_echoed_and_stripped() {
        let (mut client, sent) = client_with(frame("ab:XYZ"));
        client.read_reply(true).unwrap();
        assert_eq!(client.reply, b"XYZ");
        assert_eq!(sent.borrow().as_slice(), b"+ab");
    }

    #[test]
    fn oversized_packet_is_discarded() {
        let big = "x".repeat(MAX_PACKET_LEN);
        let (mut client, _) = client_with(frame(&big));
        assert!(matches!(client.read_reply(true), Err(Error::PacketOverflow)));
    }

    #[test]
    fn stop_replies_are_skipped_on_request_path() {
        let mut input = frame("T05thread:01;");
        input.extend_from_slice(&frame("OK"));
        let (mut client, _) = client_with(input);
        client.read_reply(true).unwrap();
        assert_eq!(client.reply, b"OK");
    }

    #[test]
    fn read_one_word_little_endian() {
        let (mut client, sent) = client_with(script(&["00112233"]));
        let mut out = [0u32; 1];
        client.read_words(0x2000_0000, &mut out).unwrap();
        assert_eq!(out[0], 0x3322_1100);
        assert!(sent.borrow().starts_with(&frame("m20000000,4")));
    }

    #[test]
    fn write_one_word_wire_format() {
        let (mut client, sent) = client_with(script(&["OK"]));
        client.write_words(0x2000_0000, &[0xcafe_babe]).unwrap();
        assert!(sent.borrow().starts_with(&frame("M20000000,4:bebafeca")));
    }

    #[test]
    fn write_reg_emits_target_byte_order() {
        let (mut client, sent) = client_with(script(&["OK"]));
        client.write_reg(0, 0x1122_3344).unwrap();
        assert!(sent.borrow().starts_with(&frame("P0=44332211")));
    }

    #[test]
    fn remote_error_code_is_surfaced() {
        let (mut client, _) = client_with(script(&["E03"]));
        let err = client.write_reg(0, 0).unwrap_err();
        assert!(matches!(err, Error::Remote(3)));
    }

    #[test]
    fn data_where_ok_required_is_rejected() {
        let (mut client, _) = client_with(script(&["00000000"]));
        assert!(matches!(
            client.insert_hw_breakpoint(0x2000_0000, 2),
            Err(Error::UnexpectedReply(_))
        ));
    }

    #[test]
    fn chunked_read_advances_addresses() {
        let (mut client, sent) = client_with(script(&[
            "01000000",
            "02000000",
            "03000000",
            "04000000",
        ]));
        client.set_max_transfer_words(1).unwrap();
        let mut out = [0u32; 4];
        client.read_words(0x2000_0000, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        let wire = sent.borrow().clone();
        let text = String::from_utf8_lossy(&wire);
        for request in [
            "$m20000000,4#",
            "$m20000004,4#",
            "$m20000008,4#",
            "$m2000000c,4#",
        ] {
            assert!(text.contains(request), "missing {request} in {text}");
        }
    }

    #[test]
    fn chunked_write_splits_payload() {
        let (mut client, sent) = client_with(script(&["OK", "OK"]));
        client.set_max_transfer_words(2).unwrap();
        client.write_words(0x2000_0000, &[1, 2, 3]).unwrap();
        let wire = sent.borrow().clone();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("$M20000000,8:0100000002000000#"));
        assert!(text.contains("$M20000008,4:03000000#"));
    }

    #[test]
    fn transfer_cap_is_bounded_by_packet_buffer() {
        let (mut client, _) = client_with(vec![]);
        assert!(client.set_max_transfer_words(GdbClient::packet_limit_words()).is_ok());
        assert!(matches!(
            client.set_max_transfer_words(GdbClient::packet_limit_words() + 1),
            Err(Error::TransferCapTooLarge(_))
        ));
    }

    #[test]
    fn wait_halted_returns_on_stop_reply() {
        let mut input = frame("O48656c6c6f");
        input.extend_from_slice(&frame("T05thread:01;"));
        let (mut client, _) = client_with(input);
        client.wait_halted().unwrap();
        assert!(client.reply.starts_with(b"T05"));
    }

    #[test]
    fn exhausted_stream_reads_time_out() {
        let (mut client, _) = client_with(vec![]);
        assert!(matches!(client.read_reply(true), Err(Error::ReadTimeout)));
    }

    #[test]
    fn closed_stream_is_reported() {
        struct ClosedLink;
        impl Read for ClosedLink {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        impl Write for ClosedLink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut client = GdbClient::over(Box::new(ClosedLink));
        assert!(matches!(client.read_reply(true), Err(Error::ConnectionShutdown)));
    }
}
