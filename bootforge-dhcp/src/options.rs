// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCP option codes and the typed string <-> wire-value conversions used
//! when rendering subnet and reservation option templates.

use std::net::Ipv4Addr;

pub const OPTION_SUBNET_MASK: u8 = 1;
pub const OPTION_ROUTER: u8 = 3;
pub const OPTION_DOMAIN_SERVER: u8 = 6;
pub const OPTION_HOSTNAME: u8 = 12;
pub const OPTION_DOMAIN_NAME: u8 = 15;
pub const OPTION_REQUESTED_IP: u8 = 50;
pub const OPTION_LEASE_TIME: u8 = 51;
pub const OPTION_MESSAGE_TYPE: u8 = 53;
pub const OPTION_SERVER_ID: u8 = 54;
pub const OPTION_PARAM_REQUEST_LIST: u8 = 55;
pub const OPTION_RENEWAL_TIME: u8 = 58;
pub const OPTION_REBINDING_TIME: u8 = 59;
pub const OPTION_BOOTFILE_NAME: u8 = 67;
pub const OPTION_TFTP_SERVER: u8 = 150;

enum Kind {
    IpList,
    U32,
    U16,
    U8,
    Text,
}

fn kind(code: u8) -> Kind {
    match code {
        // Addresses and address lists.
        1 | 3 | 6 | 16 | 28 | 32 | 42 | 44 | 50 | 54 | 150 => Kind::IpList,
        // 32-bit times and sizes.
        2 | 24 | 35 | 38 | 51 | 58 | 59 => Kind::U32,
        13 | 22 | 26 | 57 => Kind::U16,
        19 | 20 | 23 | 29 | 30 | 31 | 36 | 46 => Kind::U8,
        _ => Kind::Text,
    }
}

/// Converts a rendered option value into its wire form.  Returns `None`
/// when the string does not parse as the option's type.
pub fn encode_value(code: u8, val: &str) -> Option<Vec<u8>> {
    match kind(code) {
        Kind::IpList => {
            let mut out = Vec::new();
            for part in val.split(',') {
                let ip: Ipv4Addr = part.trim().parse().ok()?;
                out.extend_from_slice(&ip.octets());
            }
            if out.is_empty() { None } else { Some(out) }
        }
        Kind::U32 => val.trim().parse::<u32>().ok().map(|v| v.to_be_bytes().to_vec()),
        Kind::U16 => val.trim().parse::<u16>().ok().map(|v| v.to_be_bytes().to_vec()),
        Kind::U8 => val.trim().parse::<u8>().ok().map(|v| vec![v]),
        Kind::Text => Some(val.as_bytes().to_vec()),
    }
}

/// Converts an incoming option's wire bytes into the string form option
/// templates can reference.
pub fn decode_value(code: u8, bytes: &[u8]) -> String {
    match kind(code) {
        Kind::IpList => bytes
            .chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]).to_string())
            .collect::<Vec<_>>()
            .join(","),
        Kind::U32 if bytes.len() == 4 => {
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                .to_string()
        }
        Kind::U16 if bytes.len() == 2 => {
            u16::from_be_bytes([bytes[0], bytes[1]]).to_string()
        }
        Kind::U8 if bytes.len() == 1 => bytes[0].to_string(),
        _ => String::from_utf8_lossy(bytes).to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_round_trips() {
        assert_eq!(
            encode_value(OPTION_ROUTER, "10.0.0.1").unwrap(),
            vec![10, 0, 0, 1]
        );
        assert_eq!(
            encode_value(OPTION_DOMAIN_SERVER, "8.8.8.8, 8.8.4.4").unwrap(),
            vec![8, 8, 8, 8, 8, 8, 4, 4]
        );
        assert_eq!(
            encode_value(OPTION_LEASE_TIME, "7200").unwrap(),
            7200u32.to_be_bytes().to_vec()
        );
        assert_eq!(
            encode_value(OPTION_BOOTFILE_NAME, "ipxe.efi").unwrap(),
            b"ipxe.efi".to_vec()
        );
        assert_eq!(encode_value(OPTION_ROUTER, "not-an-ip"), None);
        assert_eq!(encode_value(OPTION_LEASE_TIME, "soon"), None);
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode_value(OPTION_DOMAIN_SERVER, &[8, 8, 8, 8, 8, 8, 4, 4]),
            "8.8.8.8,8.8.4.4"
        );
        assert_eq!(
            decode_value(OPTION_LEASE_TIME, &7200u32.to_be_bytes()),
            "7200"
        );
        assert_eq!(decode_value(OPTION_BOOTFILE_NAME, b"undionly.kpxe"), "undionly.kpxe");
    }
}
