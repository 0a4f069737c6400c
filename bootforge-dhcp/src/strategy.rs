// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client identification strategies.
//!
//! A strategy maps an incoming packet to a stable token; leases and
//! reservations are keyed by (strategy name, token).  The engine walks its
//! configured strategies in order until one yields a lease.

use crate::packet::{Options, Packet};

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Derives the client token from the packet and its parsed options.
    fn token(&self, p: &Packet, options: &Options) -> String;
}

/// Identifies clients by hardware address, formatted the way everyone
/// writes MACs.
pub struct MacStrategy;

impl Strategy for MacStrategy {
    fn name(&self) -> &'static str {
        "MAC"
    }

    fn token(&self, p: &Packet, _options: &Options) -> String {
        p.chaddr()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::{reply_packet, MessageType, Packet};
    use std::net::Ipv4Addr;

    #[test]
    fn test_mac_strategy_token() {
        // Round-trip through a reply to get a packet with a known chaddr.
        let req = Packet::parse(&[0u8; 240]).unwrap();
        let mut p = reply_packet(
            &req,
            MessageType::Offer,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            None,
            &[],
        );
        p.set_chaddr(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
        let opts = p.parse_options();
        assert_eq!(MacStrategy.token(&p, &opts), "aa:bb:cc:00:11:22");
    }
}
