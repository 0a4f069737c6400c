// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DHCP engine: socket loop, packet classification, and replies.
//!
//! One dedicated thread performs blocking reads with a one-second deadline
//! so shutdown is noticed within a second.  `IP_PKTINFO` is enabled on the
//! socket, so every packet carries the index of the interface it arrived
//! on; that interface's addresses drive subnet selection for relayed-free
//! Discovers and pick the source address replies are sent from.  Each
//! packet is handled synchronously under a `{leases, reservations,
//! subnets}` lock scope, which serializes all lease decisions for a given
//! client.

use std::collections::BTreeMap;
use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bootforge_backend::model::{as_lease, Entity, Lease, Reservation, Subnet};
use bootforge_backend::model::{LEASES, RESERVATIONS, SUBNETS};
use bootforge_backend::tracker::DataTracker;
use bootforge_common::{hexaddr, is_global_unicast, Error};
use ipnet::Ipv4Net;
use nix::errno::Errno;
use nix::sys::socket::{
    bind, recvmsg, sendmsg, setsockopt, socket, sockopt, AddressFamily,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    SockaddrIn,
};
use nix::sys::time::TimeVal;
use slog::{crit, info, o, warn, Logger};

use crate::options::{
    decode_value, encode_value, OPTION_MESSAGE_TYPE, OPTION_PARAM_REQUEST_LIST,
    OPTION_REBINDING_TIME, OPTION_RENEWAL_TIME, OPTION_REQUESTED_IP,
    OPTION_SERVER_ID,
};
use crate::packet::{
    reply_packet, select_order_or_all, MessageType, Options, Packet,
    MIN_PACKET,
};
use crate::strategy::Strategy;

#[derive(Clone, Debug)]
pub struct DhcpConfig {
    pub port: u16,
    /// Interface allow-list; empty means every interface.
    pub interfaces: Vec<String>,
}

impl Default for DhcpConfig {
    fn default() -> DhcpConfig {
        DhcpConfig { port: 67, interfaces: Vec::new() }
    }
}

/// Which phase of the DHCP state machine a Request belongs to, derived
/// from which of server-id / requested-ip / ciaddr are present.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqState {
    Init,
    Selecting,
    InitReboot,
    Renewing,
}

/// Derives the address a Request is about and the client's state:
/// server-id present means selecting, requested-ip alone means
/// init-reboot, neither means renewing.
pub fn req_addr(
    p: &Packet,
    msg_type: MessageType,
    options: &Options,
) -> (Ipv4Addr, ReqState) {
    let requested = options.get(&OPTION_REQUESTED_IP).and_then(|v| {
        (v.len() == 4).then(|| Ipv4Addr::new(v[0], v[1], v[2], v[3]))
    });
    let addr = requested.unwrap_or_else(|| p.ciaddr());
    let have_si = options.contains_key(&OPTION_SERVER_ID);
    let state = match msg_type {
        MessageType::Request => {
            if have_si {
                ReqState::Selecting
            } else if requested.is_some() {
                ReqState::InitReboot
            } else {
                ReqState::Renewing
            }
        }
        _ => ReqState::Init,
    };
    (addr, state)
}

fn mac_string(hw: &[u8]) -> String {
    hw.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

fn interface_name(index: u32) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifa in addrs {
        if let Ok(idx) = nix::net::if_::if_nametoindex(ifa.interface_name.as_str())
        {
            if idx == index {
                return Some(ifa.interface_name);
            }
        }
    }
    None
}

/// The IPv4 networks configured on the interface a packet arrived on.
fn interface_nets(index: Option<u32>) -> Vec<Ipv4Net> {
    let Some(index) = index else {
        return Vec::new();
    };
    let Some(name) = interface_name(index) else {
        return Vec::new();
    };
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };
    let mut res = Vec::new();
    for ifa in addrs {
        if ifa.interface_name != name {
            continue;
        }
        let Some(addr) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in())
        else {
            continue;
        };
        let ip: Ipv4Addr = addr.ip().into();
        let prefix = ifa
            .netmask
            .as_ref()
            .and_then(|m| m.as_sockaddr_in())
            .map(|m| {
                let mask: Ipv4Addr = m.ip().into();
                u32::from(mask).count_ones() as u8
            })
            .unwrap_or(32);
        if let Ok(net) = Ipv4Net::new(ip, prefix) {
            res.push(net);
        }
    }
    res
}

struct Handler {
    dt: Arc<DataTracker>,
    strategies: Vec<Box<dyn Strategy>>,
    ifs: Vec<String>,
    log: Logger,
}

impl Handler {
    fn strategy_named(&self, name: &str) -> Option<&dyn Strategy> {
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    fn listen_ips(&self, ifindex: Option<u32>) -> Vec<Ipv4Addr> {
        interface_nets(ifindex).iter().map(|n| n.addr()).collect()
    }

    /// The local address replies about `target` should come from: the
    /// address of the inbound interface's network covering it, else the
    /// interface's first address, else the advertised address.
    fn respond_from(&self, target: Ipv4Addr, ifindex: Option<u32>) -> Ipv4Addr {
        let nets = interface_nets(ifindex);
        for net in &nets {
            if net.contains(&target) {
                return net.addr();
            }
        }
        nets.first().map(|n| n.addr()).unwrap_or(self.dt.our_address)
    }

    fn listen_on(&self, target: Ipv4Addr, ifindex: Option<u32>) -> bool {
        interface_nets(ifindex).iter().any(|n| n.addr() == target)
    }

    fn nak(&self, p: &Packet, addr: Ipv4Addr) -> Packet {
        reply_packet(p, MessageType::Nak, addr, Ipv4Addr::UNSPECIFIED, None, &[])
    }

    /// Assembles the option set for a reply: the subnet's options overlaid
    /// with the reservation's, plus derived renewal (T1 = t/2) and rebind
    /// (T2 = 3t/4) times.  Returns the options, the lease duration in
    /// seconds, and the next-server address.
    fn build_options(
        &self,
        incoming: &Options,
        lease: &Lease,
        subnet: &Option<Subnet>,
        reservation: &Option<Reservation>,
        ifindex: Option<u32>,
    ) -> (Options, u32, Ipv4Addr) {
        let lease_time: u32 = match subnet {
            Some(s) => s.lease_time_for(lease.addr).as_secs() as u32,
            None => 7200,
        };
        let src_opts: BTreeMap<u8, String> = incoming
            .iter()
            .map(|(c, v)| (*c, decode_value(*c, v)))
            .collect();

        let mut opts = Options::new();
        opts.insert(OPTION_RENEWAL_TIME, (lease_time / 2).to_be_bytes().to_vec());
        opts.insert(
            OPTION_REBINDING_TIME,
            (lease_time * 3 / 4).to_be_bytes().to_vec(),
        );
        let mut next_server = self.respond_from(lease.addr, ifindex);

        let layers = [
            subnet.as_ref().map(|s| (&s.options, s.next_server)),
            reservation.as_ref().map(|r| (&r.options, r.next_server)),
        ];
        for layer in layers.into_iter().flatten() {
            let (directives, layer_next) = layer;
            for opt in directives {
                if opt.value.is_empty() {
                    info!(self.log, "ignoring DHCP option with zero-length value";
                        "code" => opt.code);
                    continue;
                }
                let rendered = match opt.render(&src_opts) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(self.log, "failed to render option";
                            "code" => opt.code,
                            "value" => &opt.value,
                            "error" => %e);
                        continue;
                    }
                };
                if rendered.is_empty() {
                    info!(self.log, "option rendered empty, skipping";
                        "code" => opt.code, "value" => &opt.value);
                    continue;
                }
                match encode_value(opt.code, &rendered) {
                    Some(bytes) => {
                        opts.insert(opt.code, bytes);
                    }
                    None => warn!(self.log, "option value does not encode";
                        "code" => opt.code, "value" => &rendered),
                }
            }
            if let Some(ns) = layer_next {
                if is_global_unicast(ns) {
                    next_server = ns;
                }
            }
        }
        (opts, lease_time, next_server)
    }

    fn serve_dhcp(
        &self,
        p: &Packet,
        msg_type: MessageType,
        options: &Options,
        ifindex: Option<u32>,
    ) -> Option<Packet> {
        info!(self.log, "received DHCP packet";
            "type" => %msg_type,
            "xid" => format!("0x{:x}", p.xid()),
            "ciaddr" => %p.ciaddr(),
            "giaddr" => %p.giaddr(),
            "chaddr" => mac_string(p.chaddr()));
        let (req, req_state) = req_addr(p, msg_type, options);
        match msg_type {
            MessageType::Decline => {
                let mut d =
                    self.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
                let Some(lease) = d.get(LEASES).find(&hexaddr(req)) else {
                    info!(self.log,
                        "asked to decline a lease we didn't issue, ignoring";
                        "addr" => %req);
                    return None;
                };
                let lease = as_lease(&*lease).clone();
                let spoofed = match self.strategy_named(&lease.strategy) {
                    Some(s) => s.token(p, options) != lease.token,
                    None => true,
                };
                if spoofed {
                    info!(self.log, "received spoofed decline, ignoring";
                        "addr" => %lease.addr);
                } else {
                    info!(self.log, "lease declined, invalidating";
                        "addr" => %lease.addr);
                    if let Err(e) = self.dt.update_lease_in_place(
                        &mut d,
                        &lease.key(),
                        Lease::invalidate,
                    ) {
                        warn!(self.log, "lease invalidation failed";
                            "lease" => lease.key(), "error" => %e);
                    }
                }
                None
            }
            MessageType::Release => {
                let mut d =
                    self.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
                let Some(lease) = d.get(LEASES).find(&hexaddr(req)) else {
                    info!(self.log,
                        "asked to release a lease we didn't issue, ignoring";
                        "addr" => %req);
                    return None;
                };
                let lease = as_lease(&*lease).clone();
                let spoofed = match self.strategy_named(&lease.strategy) {
                    Some(s) => s.token(p, options) != lease.token,
                    None => true,
                };
                if spoofed {
                    info!(self.log, "received spoofed release, ignoring";
                        "addr" => %lease.addr);
                } else {
                    info!(self.log, "lease released, expiring";
                        "addr" => %lease.addr);
                    if let Err(e) = self.dt.update_lease_in_place(
                        &mut d,
                        &lease.key(),
                        Lease::expire,
                    ) {
                        warn!(self.log, "lease expiry failed";
                            "lease" => lease.key(), "error" => %e);
                    }
                }
                None
            }
            MessageType::Request => {
                if let Some(server) = options.get(&OPTION_SERVER_ID) {
                    if server.len() == 4 {
                        let server =
                            Ipv4Addr::new(server[0], server[1], server[2], server[3]);
                        if !self.listen_on(server, ifindex) {
                            info!(self.log,
                                "ignoring request meant for another DHCP server";
                                "server" => %server);
                            return None;
                        }
                    }
                }
                if !is_global_unicast(req) {
                    info!(self.log, "NAK'ing invalid requested IP";
                        "addr" => %req);
                    return Some(self.nak(p, self.respond_from(req, ifindex)));
                }
                let mut d =
                    self.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
                let mut found = None;
                for s in &self.strategies {
                    match self.dt.find_lease(
                        &mut d,
                        s.name(),
                        &s.token(p, options),
                        req,
                    ) {
                        Ok(Some(t)) => {
                            found = Some(t);
                            break;
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            info!(self.log, "address is not leasable here";
                                "addr" => %req, "error" => %e);
                            return Some(
                                self.nak(p, self.respond_from(req, ifindex)),
                            );
                        }
                    }
                }
                let Some((lease, subnet, reservation)) = found else {
                    if req_state == ReqState::InitReboot {
                        info!(self.log,
                            "no lease in database, client in INIT-REBOOT, ignoring";
                            "addr" => %req);
                        return None;
                    }
                    info!(self.log, "no lease in database, NAK'ing";
                        "addr" => %req);
                    return Some(self.nak(p, self.respond_from(req, ifindex)));
                };
                let (opts, duration, next_server) = self.build_options(
                    options,
                    &lease,
                    &subnet,
                    &reservation,
                    ifindex,
                );
                let chosen = select_order_or_all(
                    &opts,
                    options.get(&OPTION_PARAM_REQUEST_LIST),
                );
                let mut reply = reply_packet(
                    p,
                    MessageType::Ack,
                    self.respond_from(lease.addr, ifindex),
                    lease.addr,
                    Some(duration),
                    &chosen,
                );
                if is_global_unicast(next_server) {
                    reply.set_siaddr(next_server);
                }
                info!(self.log, "request handing out";
                    "addr" => %lease.addr,
                    "chaddr" => mac_string(p.chaddr()));
                Some(reply)
            }
            MessageType::Discover => {
                let mut d =
                    self.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
                for s in &self.strategies {
                    let token = s.token(p, options);
                    let via = if p.giaddr().is_unspecified() {
                        self.listen_ips(ifindex)
                    } else {
                        vec![p.giaddr()]
                    };
                    let Some((lease, subnet, reservation)) = self
                        .dt
                        .find_or_create_lease(
                            &mut d,
                            s.name(),
                            &token,
                            req,
                            &via,
                        )
                    else {
                        continue;
                    };
                    let (opts, duration, next_server) = self.build_options(
                        options,
                        &lease,
                        &subnet,
                        &reservation,
                        ifindex,
                    );
                    let chosen = select_order_or_all(
                        &opts,
                        options.get(&OPTION_PARAM_REQUEST_LIST),
                    );
                    let mut reply = reply_packet(
                        p,
                        MessageType::Offer,
                        self.respond_from(lease.addr, ifindex),
                        lease.addr,
                        Some(duration),
                        &chosen,
                    );
                    if is_global_unicast(next_server) {
                        reply.set_siaddr(next_server);
                    }
                    info!(self.log, "discovery handing out";
                        "addr" => %lease.addr,
                        "chaddr" => mac_string(p.chaddr()));
                    return Some(reply);
                }
                None
            }
            MessageType::Inform => {
                info!(self.log, "inform not supported, ignoring");
                None
            }
            // Server-originated message types arriving here are noise.
            _ => None,
        }
    }

    fn serve(&self, fd: OwnedFd, closing: Arc<AtomicBool>) {
        // Oversized relative to any sane DHCP packet to account for
        // non-Ethernet media.
        let mut buf = vec![0u8; 16384];
        let mut cmsgspace = nix::cmsg_space!(nix::libc::in_pktinfo);
        loop {
            if closing.load(Ordering::SeqCst) {
                break;
            }
            let (len, src, ifindex) = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                match recvmsg::<SockaddrIn>(
                    fd.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    MsgFlags::empty(),
                ) {
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                    Err(e) => {
                        if closing.load(Ordering::SeqCst) {
                            break;
                        }
                        crit!(self.log, "DHCP socket read failed";
                            "error" => %e);
                        std::process::exit(1);
                    }
                    Ok(msg) => {
                        let mut ifindex = None;
                        if let Ok(cmsgs) = msg.cmsgs() {
                            for c in cmsgs {
                                if let ControlMessageOwned::Ipv4PacketInfo(pi) = c
                                {
                                    ifindex = Some(pi.ipi_ifindex as u32);
                                }
                            }
                        }
                        (msg.bytes, msg.address, ifindex)
                    }
                }
            };
            if len < MIN_PACKET {
                continue;
            }
            let Some(pkt) = Packet::parse(&buf[..len]) else {
                continue;
            };
            if pkt.hlen() > 16 {
                continue;
            }
            let opts = pkt.parse_options();
            let Some(raw_type) = opts.get(&OPTION_MESSAGE_TYPE) else {
                continue;
            };
            if raw_type.len() != 1 {
                continue;
            }
            let Some(msg_type) = MessageType::from_u8(raw_type[0]) else {
                continue;
            };
            if !self.ifs.is_empty() {
                let name = ifindex.and_then(interface_name);
                let allowed = name
                    .as_deref()
                    .map(|n| self.ifs.iter().any(|i| i.trim() == n))
                    .unwrap_or(false);
                if !allowed {
                    info!(self.log, "ignoring packet from filtered interface";
                        "interface" => name.unwrap_or_default());
                    continue;
                }
            }

            let Some(res) = self.serve_dhcp(&pkt, msg_type, &opts, ifindex)
            else {
                continue;
            };

            let src_port = src.as_ref().map(|s: &SockaddrIn| s.port()).unwrap_or(68);
            let dest = if !pkt.giaddr().is_unspecified() {
                SocketAddrV4::new(pkt.giaddr(), src_port)
            } else {
                let src_ip: Ipv4Addr = src
                    .as_ref()
                    .map(|s| s.ip().into())
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                if src_ip.is_unspecified() || pkt.broadcast() {
                    SocketAddrV4::new(Ipv4Addr::BROADCAST, src_port)
                } else {
                    SocketAddrV4::new(src_ip, src_port)
                }
            };
            // The kernel picks the source address; we only pin the egress
            // interface to the one the request came in on.
            let pi = nix::libc::in_pktinfo {
                ipi_ifindex: ifindex.unwrap_or(0) as i32,
                ipi_spec_dst: nix::libc::in_addr { s_addr: 0 },
                ipi_addr: nix::libc::in_addr { s_addr: 0 },
            };
            let cmsg = [ControlMessage::Ipv4PacketInfo(&pi)];
            let iov = [IoSlice::new(res.as_bytes())];
            let dest_sa = SockaddrIn::from(dest);
            if let Err(e) = sendmsg(
                fd.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                Some(&dest_sa),
            ) {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                crit!(self.log, "DHCP socket write failed";
                    "dest" => %dest, "error" => %e);
                std::process::exit(1);
            }
        }
        info!(self.log, "DHCP handler shut down");
    }
}

/// A handle to the running DHCP engine.  Shutting down (or dropping) sets
/// the closing flag and joins the serve thread; read-deadline polling
/// bounds the latency to about a second.
pub struct DhcpService {
    closing: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DhcpService {
    pub fn shutdown(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    /// Blocks until the serve thread exits.
    pub fn wait(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for DhcpService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Binds the DHCP socket and starts the serve thread.
pub fn start_dhcp_handler(
    dt: Arc<DataTracker>,
    config: DhcpConfig,
    strategies: Vec<Box<dyn Strategy>>,
    log: Logger,
) -> Result<DhcpService, Error> {
    let log = log.new(o!("component" => "dhcp"));
    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| Error::transport(format!("socket: {}", e)))?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)
        .map_err(|e| Error::transport(format!("SO_REUSEADDR: {}", e)))?;
    setsockopt(&fd, sockopt::Broadcast, &true)
        .map_err(|e| Error::transport(format!("SO_BROADCAST: {}", e)))?;
    setsockopt(&fd, sockopt::Ipv4PacketInfo, &true)
        .map_err(|e| Error::transport(format!("IP_PKTINFO: {}", e)))?;
    // The read deadline that bounds shutdown latency.
    setsockopt(&fd, sockopt::ReceiveTimeout, &TimeVal::new(1, 0))
        .map_err(|e| Error::transport(format!("SO_RCVTIMEO: {}", e)))?;
    bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, config.port))
        .map_err(|e| {
            Error::transport(format!("bind udp4 port {}: {}", config.port, e))
        })?;
    info!(log, "DHCP engine listening"; "port" => config.port);

    let closing = Arc::new(AtomicBool::new(false));
    let handler = Handler {
        dt,
        strategies,
        ifs: config.interfaces,
        log: log.clone(),
    };
    let thread_closing = Arc::clone(&closing);
    let handle = thread::Builder::new()
        .name("dhcp-serve".to_string())
        .spawn(move || handler.serve(fd, thread_closing))
        .map_err(|e| Error::transport(format!("spawn serve thread: {}", e)))?;
    Ok(DhcpService { closing, handle: Some(handle) })
}
