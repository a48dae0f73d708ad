//! Bounds-checked header parsing over a borrowed frame.
//!
//! Nothing here copies the frame. Every read goes through [`Cursor::take`],
//! which checks the remaining length first, so arbitrary input can at worst
//! produce a [`ParseError`].

use siper_common::{ETH_HDR_LEN, IPV4_MIN_HDR_LEN};

use crate::error::ParseError;

/// Read position within a frame. `offset <= buf.len()` always holds.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total frame length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Bytes from the current offset to the end of the frame.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }

    /// Borrow the next `n` bytes and advance past them.
    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(ParseError::Truncated {
                needed: n,
                remaining,
            });
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.buf[start..self.offset])
    }
}

/// View over a 14-byte Ethernet II header.
#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader<'a> {
    bytes: &'a [u8; ETH_HDR_LEN],
}

impl<'a> EthernetHeader<'a> {
    pub fn dst_mac(&self) -> [u8; 6] {
        [
            self.bytes[0],
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
            self.bytes[4],
            self.bytes[5],
        ]
    }

    pub fn src_mac(&self) -> [u8; 6] {
        [
            self.bytes[6],
            self.bytes[7],
            self.bytes[8],
            self.bytes[9],
            self.bytes[10],
            self.bytes[11],
        ]
    }

    /// Ethertype in host byte order.
    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.bytes[12], self.bytes[13]])
    }
}

/// View over an IPv4 header, options included.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    pub fn version(&self) -> u8 {
        self.bytes[0] >> 4
    }

    /// Header length in 32-bit words.
    pub fn ihl(&self) -> u8 {
        self.bytes[0] & 0x0f
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn protocol(&self) -> u8 {
        self.bytes[9]
    }

    /// Source address, host byte order.
    pub fn src_addr(&self) -> u32 {
        u32::from_be_bytes([self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15]])
    }

    /// Destination address, host byte order.
    pub fn dst_addr(&self) -> u32 {
        u32::from_be_bytes([self.bytes[16], self.bytes[17], self.bytes[18], self.bytes[19]])
    }

    pub fn options(&self) -> &'a [u8] {
        &self.bytes[IPV4_MIN_HDR_LEN..]
    }
}

/// Read an Ethernet header at the cursor.
///
/// Fails with `Truncated` when fewer than 14 bytes remain; the input cursor
/// is left where it was.
pub fn ethernet<'a>(cursor: Cursor<'a>) -> Result<(EthernetHeader<'a>, Cursor<'a>), ParseError> {
    let mut next = cursor;
    let raw = next.take(ETH_HDR_LEN)?;
    let bytes: &'a [u8; ETH_HDR_LEN] = raw.try_into().map_err(|_| ParseError::Truncated {
        needed: ETH_HDR_LEN,
        remaining: raw.len(),
    })?;
    Ok((EthernetHeader { bytes }, next))
}

/// Read an IPv4 header at the cursor, skipping past any options.
///
/// Fails with `Truncated` when fewer than 20 bytes remain and with
/// `InvalidHeaderLength` when IHL * 4 is below 20 or runs past the frame.
/// The version nibble is not checked; the ethertype already selected IPv4.
pub fn ipv4<'a>(cursor: Cursor<'a>) -> Result<(Ipv4Header<'a>, Cursor<'a>), ParseError> {
    let remaining = cursor.remaining();
    let fixed = cursor.rest().get(..IPV4_MIN_HDR_LEN).ok_or(ParseError::Truncated {
        needed: IPV4_MIN_HDR_LEN,
        remaining,
    })?;

    let header_len = usize::from(fixed[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HDR_LEN || header_len > remaining {
        return Err(ParseError::InvalidHeaderLength {
            header_len,
            remaining,
        });
    }

    let mut next = cursor;
    let bytes = next.take(header_len)?;
    Ok((Ipv4Header { bytes }, next))
}

/// `parse_ethernet`: ethertype (host order) and the cursor past the header.
pub fn parse_ethernet(cursor: Cursor<'_>) -> Result<(u16, Cursor<'_>), ParseError> {
    let (eth, next) = ethernet(cursor)?;
    Ok((eth.ethertype(), next))
}

/// `parse_ipv4`: source address (host order) and the cursor past the header.
pub fn parse_ipv4(cursor: Cursor<'_>) -> Result<(u32, Cursor<'_>), ParseError> {
    let (ip, next) = ipv4(cursor)?;
    Ok((ip.src_addr(), next))
}
