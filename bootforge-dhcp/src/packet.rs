// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCPv4 packet layout per RFC 2131.
//!
//! A [`Packet`] is a thin owned wrapper over the raw bytes with typed
//! accessors for the fixed header fields and an options parser.  Nothing
//! here allocates per option on the hot path beyond the parsed map.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub const BOOT_REQUEST: u8 = 1;
pub const BOOT_REPLY: u8 = 2;

/// Shortest packet we will look at: the fixed BOOTP header plus the magic
/// cookie.
pub const MIN_PACKET: usize = 240;

/// Replies are padded out to the classic BOOTP minimum.
const REPLY_PACKET_LEN: usize = 300;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Parsed options: code to raw value bytes.
pub type Options = BTreeMap<u8, Vec<u8>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    /// Classifies option 53.  Values outside Discover..Inform are not a
    /// message type at all and the packet carrying them is dropped.
    pub fn from_u8(v: u8) -> Option<MessageType> {
        match v {
            1 => Some(MessageType::Discover),
            2 => Some(MessageType::Offer),
            3 => Some(MessageType::Request),
            4 => Some(MessageType::Decline),
            5 => Some(MessageType::Ack),
            6 => Some(MessageType::Nak),
            7 => Some(MessageType::Release),
            8 => Some(MessageType::Inform),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Discover => "Discover",
            MessageType::Offer => "Offer",
            MessageType::Request => "Request",
            MessageType::Decline => "Decline",
            MessageType::Ack => "Ack",
            MessageType::Nak => "Nak",
            MessageType::Release => "Release",
            MessageType::Inform => "Inform",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Wraps received bytes.  Returns `None` for anything shorter than the
    /// fixed header; such traffic is noise, not DHCP.
    pub fn parse(data: &[u8]) -> Option<Packet> {
        if data.len() < MIN_PACKET {
            return None;
        }
        Some(Packet { buf: data.to_vec() })
    }

    fn blank() -> Packet {
        let mut buf = vec![0u8; REPLY_PACKET_LEN];
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);
        Packet { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn op(&self) -> u8 {
        self.buf[0]
    }

    pub fn htype(&self) -> u8 {
        self.buf[1]
    }

    pub fn hlen(&self) -> u8 {
        self.buf[2]
    }

    pub fn xid(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn secs(&self) -> u16 {
        u16::from_be_bytes([self.buf[8], self.buf[9]])
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.buf[10], self.buf[11]])
    }

    /// The broadcast bit: the client cannot receive unicast replies yet.
    pub fn broadcast(&self) -> bool {
        self.flags() & 0x8000 != 0
    }

    fn ip_at(&self, off: usize) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        )
    }

    pub fn ciaddr(&self) -> Ipv4Addr {
        self.ip_at(12)
    }

    pub fn yiaddr(&self) -> Ipv4Addr {
        self.ip_at(16)
    }

    pub fn siaddr(&self) -> Ipv4Addr {
        self.ip_at(20)
    }

    pub fn giaddr(&self) -> Ipv4Addr {
        self.ip_at(24)
    }

    /// The client hardware address: `hlen` bytes of the chaddr field,
    /// clamped to the field's 16-byte width.
    pub fn chaddr(&self) -> &[u8] {
        let len = usize::from(self.hlen().min(16));
        &self.buf[28..28 + len]
    }

    pub fn set_op(&mut self, op: u8) {
        self.buf[0] = op;
    }

    pub fn set_htype(&mut self, t: u8) {
        self.buf[1] = t;
    }

    pub fn set_hlen(&mut self, l: u8) {
        self.buf[2] = l;
    }

    pub fn set_xid(&mut self, xid: u32) {
        self.buf[4..8].copy_from_slice(&xid.to_be_bytes());
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.buf[10..12].copy_from_slice(&flags.to_be_bytes());
    }

    pub fn set_broadcast(&mut self, on: bool) {
        let flags =
            if on { self.flags() | 0x8000 } else { self.flags() & !0x8000 };
        self.set_flags(flags);
    }

    fn set_ip_at(&mut self, off: usize, addr: Ipv4Addr) {
        self.buf[off..off + 4].copy_from_slice(&addr.octets());
    }

    pub fn set_ciaddr(&mut self, addr: Ipv4Addr) {
        self.set_ip_at(12, addr);
    }

    pub fn set_yiaddr(&mut self, addr: Ipv4Addr) {
        self.set_ip_at(16, addr);
    }

    pub fn set_siaddr(&mut self, addr: Ipv4Addr) {
        self.set_ip_at(20, addr);
    }

    pub fn set_giaddr(&mut self, addr: Ipv4Addr) {
        self.set_ip_at(24, addr);
    }

    pub fn set_chaddr(&mut self, hw: &[u8]) {
        let len = hw.len().min(16);
        self.buf[28..28 + len].copy_from_slice(&hw[..len]);
        self.set_hlen(len as u8);
    }

    /// Parses the options region.  An absent or wrong magic cookie yields
    /// an empty map.
    pub fn parse_options(&self) -> Options {
        let mut res = Options::new();
        if self.buf[236..240] != MAGIC_COOKIE {
            return res;
        }
        let mut i = 240;
        while i < self.buf.len() {
            match self.buf[i] {
                0 => i += 1,
                255 => break,
                code => {
                    if i + 1 >= self.buf.len() {
                        break;
                    }
                    let len = usize::from(self.buf[i + 1]);
                    if i + 2 + len > self.buf.len() {
                        break;
                    }
                    res.insert(code, self.buf[i + 2..i + 2 + len].to_vec());
                    i += 2 + len;
                }
            }
        }
        res
    }

    fn append_option(&mut self, code: u8, val: &[u8]) {
        self.buf.push(code);
        self.buf.push(val.len() as u8);
        self.buf.extend_from_slice(val);
    }
}

/// Builds a reply to `req`: the fixed fields the client needs copied over,
/// the message type, server id, and (when handing out an address) the
/// lease time, followed by `extra` options in order.
pub fn reply_packet(
    req: &Packet,
    mt: MessageType,
    server_id: Ipv4Addr,
    yiaddr: Ipv4Addr,
    lease_secs: Option<u32>,
    extra: &[(u8, Vec<u8>)],
) -> Packet {
    let mut p = Packet::blank();
    p.buf.truncate(240);
    p.set_op(BOOT_REPLY);
    p.set_htype(req.htype());
    p.set_chaddr(req.chaddr());
    p.set_xid(req.xid());
    p.set_flags(req.flags());
    p.set_giaddr(req.giaddr());
    p.set_yiaddr(yiaddr);
    p.append_option(53, &[mt as u8]);
    p.append_option(54, &server_id.octets());
    if let Some(secs) = lease_secs {
        p.append_option(51, &secs.to_be_bytes());
    }
    for (code, val) in extra {
        p.append_option(*code, val);
    }
    p.buf.push(255);
    if p.buf.len() < REPLY_PACKET_LEN {
        p.buf.resize(REPLY_PACKET_LEN, 0);
    }
    p
}

/// Restricts and orders `opts` by the client's parameter-request list
/// (option 55) when present; otherwise returns everything in code order.
pub fn select_order_or_all(
    opts: &Options,
    requested: Option<&Vec<u8>>,
) -> Vec<(u8, Vec<u8>)> {
    match requested {
        Some(order) => order
            .iter()
            .filter_map(|code| opts.get(code).map(|v| (*code, v.clone())))
            .collect(),
        None => opts.iter().map(|(c, v)| (*c, v.clone())).collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(chaddr: [u8; 6]) -> Packet {
        let mut p = Packet::blank();
        p.set_op(BOOT_REQUEST);
        p.set_htype(1);
        p.set_chaddr(&chaddr);
        p.set_xid(0xdeadbeef);
        p
    }

    #[test]
    fn test_too_short_is_rejected() {
        assert!(Packet::parse(&[0u8; 239]).is_none());
        assert!(Packet::parse(&[0u8; 240]).is_some());
    }

    #[test]
    fn test_header_round_trip() {
        let mut p = request([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        p.set_ciaddr(Ipv4Addr::new(10, 0, 0, 7));
        p.set_giaddr(Ipv4Addr::new(10, 0, 1, 1));
        p.set_broadcast(true);

        let parsed = Packet::parse(p.as_bytes()).unwrap();
        assert_eq!(parsed.op(), BOOT_REQUEST);
        assert_eq!(parsed.xid(), 0xdeadbeef);
        assert_eq!(parsed.hlen(), 6);
        assert_eq!(parsed.chaddr(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(parsed.ciaddr(), Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(parsed.giaddr(), Ipv4Addr::new(10, 0, 1, 1));
        assert!(parsed.broadcast());
    }

    #[test]
    fn test_option_parsing_stops_at_end_marker() {
        let mut p = request([1, 2, 3, 4, 5, 6]);
        p.append_option(53, &[1]);
        p.append_option(55, &[1, 3, 6]);
        p.buf.push(255);
        p.append_option(67, b"never-seen");

        let opts = p.parse_options();
        assert_eq!(opts.get(&53), Some(&vec![1]));
        assert_eq!(opts.get(&55), Some(&vec![1, 3, 6]));
        assert_eq!(opts.get(&67), None);
    }

    #[test]
    fn test_reply_packet_copies_client_fields() {
        let mut req = request([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        req.set_giaddr(Ipv4Addr::new(10, 0, 1, 1));
        let reply = reply_packet(
            &req,
            MessageType::Offer,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 10),
            Some(7200),
            &[(3, vec![10, 0, 0, 1])],
        );
        assert_eq!(reply.op(), BOOT_REPLY);
        assert_eq!(reply.xid(), req.xid());
        assert_eq!(reply.chaddr(), req.chaddr());
        assert_eq!(reply.giaddr(), req.giaddr());
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 10));
        assert!(reply.as_bytes().len() >= 300);

        let opts = reply.parse_options();
        assert_eq!(opts.get(&53), Some(&vec![MessageType::Offer as u8]));
        assert_eq!(opts.get(&54), Some(&vec![10, 0, 0, 1]));
        assert_eq!(opts.get(&51), Some(&7200u32.to_be_bytes().to_vec()));
        assert_eq!(opts.get(&3), Some(&vec![10, 0, 0, 1]));
    }

    #[test]
    fn test_select_order_or_all() {
        let mut opts = Options::new();
        opts.insert(1, vec![255, 255, 255, 0]);
        opts.insert(3, vec![10, 0, 0, 1]);
        opts.insert(6, vec![8, 8, 8, 8]);

        let all = select_order_or_all(&opts, None);
        assert_eq!(all.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![1, 3, 6]);

        // The client's requested order wins, unknown codes are skipped.
        let wanted = vec![6, 1, 150];
        let chosen = select_order_or_all(&opts, Some(&wanted));
        assert_eq!(chosen.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![6, 1]);
    }
}
