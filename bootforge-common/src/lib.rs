// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by every layer of the bootforge provisioner: the structured
//! error object that entity validation accumulates into, and the handful of
//! IPv4 helpers (hex addresses, unicast checks) that both the backend and
//! the DHCP engine need.

use std::net::Ipv4Addr;

mod error;

pub use error::{Error, ErrorKind};

/// Encodes an IPv4 address as 8 uppercase hex characters.
///
/// This encoding is used both as the key for leases and reservations and as
/// the file-name prefix pxelinux and elilo expect for machine-specific boot
/// configuration.
pub fn hexaddr(addr: Ipv4Addr) -> String {
    let o = addr.octets();
    format!("{:02X}{:02X}{:02X}{:02X}", o[0], o[1], o[2], o[3])
}

/// Whether `addr` is a plain, routable unicast address: not unspecified,
/// loopback, multicast, link-local, or the limited broadcast address.
pub fn is_global_unicast(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        || addr.is_link_local()
        || addr.is_broadcast())
}

/// Records a validation error on `err` unless `addr` is a usable unicast
/// address.
pub fn validate_ip4(err: &mut Error, addr: Ipv4Addr) {
    if !is_global_unicast(addr) {
        err.add(format!("IP address {} is not a valid unicast address", addr));
    }
}

/// Like [`validate_ip4`], but 0.0.0.0 is allowed (the field is optional).
pub fn validate_maybe_zero_ip4(err: &mut Error, addr: Ipv4Addr) {
    if !addr.is_unspecified() {
        validate_ip4(err, addr);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hexaddr() {
        assert_eq!(hexaddr(Ipv4Addr::new(10, 0, 0, 5)), "0A000005");
        assert_eq!(hexaddr(Ipv4Addr::new(192, 168, 124, 10)), "C0A87C0A");
        assert_eq!(hexaddr(Ipv4Addr::new(255, 255, 255, 255)), "FFFFFFFF");
    }

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(is_global_unicast(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_global_unicast(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(!is_global_unicast(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(255, 255, 255, 255)));
    }
}
