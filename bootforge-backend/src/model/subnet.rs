// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCP subnets: an address range the engine may lease from, plus the
//! options handed to clients booting there.

use std::any::Any;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use bootforge_common::Error;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::index::{check_unique, Maker};
use crate::model::{Entity, SUBNETS};
use crate::tracker::{DataTracker, Stores};

/// One DHCP option directive.  `value` is a template; it may reference the
/// options the client sent (as `options.o<code>`) and renders to the
/// wire value for `code`.  A directive whose value renders empty is skipped.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DhcpOption {
    pub code: u8,
    pub value: String,
}

impl DhcpOption {
    pub fn new(code: u8, value: &str) -> DhcpOption {
        DhcpOption { code, value: value.to_string() }
    }

    /// Renders the value template against the options the client sent.
    pub fn render(&self, src_opts: &BTreeMap<u8, String>) -> Result<String, Error> {
        if !self.value.contains("{{") && !self.value.contains("{%") {
            return Ok(self.value.clone());
        }
        let mut ctx = tera::Context::new();
        let by_name: BTreeMap<String, &String> =
            src_opts.iter().map(|(c, v)| (format!("o{}", c), v)).collect();
        ctx.insert("options", &by_name);
        tera::Tera::one_off(&self.value, &ctx, false).map_err(|terr| {
            let mut e = Error::new(bootforge_common::ErrorKind::Render);
            e.add(crate::render::tera_error(
                &format!("option {} value", self.code),
                &terr,
            ));
            e
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Subnet {
    pub name: String,
    /// The network in CIDR form, e.g. `10.0.0.0/24`.
    pub subnet: String,
    /// The client-identification strategy leases from this subnet use.
    pub strategy: String,
    pub active_start: Ipv4Addr,
    pub active_end: Ipv4Addr,
    /// Lease duration, in seconds, for addresses in the active range.
    pub active_lease_time: u32,
    /// Lease duration, in seconds, for reservation-backed addresses.
    pub reserved_lease_time: u32,
    /// When set, no dynamic allocation happens here; only reservations.
    pub only_reservations: bool,
    pub next_server: Option<Ipv4Addr>,
    pub options: Vec<DhcpOption>,
}

impl Default for Subnet {
    fn default() -> Subnet {
        Subnet {
            name: String::new(),
            subnet: String::new(),
            strategy: String::new(),
            active_start: Ipv4Addr::UNSPECIFIED,
            active_end: Ipv4Addr::UNSPECIFIED,
            active_lease_time: 0,
            reserved_lease_time: 0,
            only_reservations: false,
            next_server: None,
            options: Vec::new(),
        }
    }
}

impl Subnet {
    pub fn new(name: &str, cidr: &str) -> Subnet {
        Subnet {
            name: name.to_string(),
            subnet: cidr.to_string(),
            ..Default::default()
        }
    }

    pub fn net(&self) -> Option<Ipv4Net> {
        self.subnet.parse().ok()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net().map(|n| n.contains(&ip)).unwrap_or(false)
    }

    /// Whether `ip` is a host address in this subnet: inside the network
    /// but neither the network nor the broadcast address.
    pub fn in_subnet_range(&self, ip: Ipv4Addr) -> bool {
        match self.net() {
            Some(n) => n.contains(&ip) && ip != n.network() && ip != n.broadcast(),
            None => false,
        }
    }

    pub fn in_active_range(&self, ip: Ipv4Addr) -> bool {
        self.in_subnet_range(ip) && self.active_start <= ip && ip <= self.active_end
    }

    pub fn lease_time_for(&self, ip: Ipv4Addr) -> Duration {
        if self.in_active_range(ip) {
            Duration::from_secs(u64::from(self.active_lease_time))
        } else {
            Duration::from_secs(u64::from(self.reserved_lease_time))
        }
    }
}

pub fn as_subnet(e: &dyn Entity) -> &Subnet {
    e.as_any().downcast_ref::<Subnet>().expect("subnets entry was not a Subnet")
}

impl Entity for Subnet {
    fn prefix(&self) -> &'static str {
        SUBNETS
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn indexes(&self) -> Vec<(&'static str, Maker)> {
        vec![
            ("Key", Maker::key()),
            (
                "Name",
                Maker::new(
                    true,
                    "string",
                    |i, j| as_subnet(i).name < as_subnet(j).name,
                    |r| {
                        let gte = as_subnet(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_subnet(s).name >= gte),
                            Box::new(move |s| as_subnet(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(Subnet::new(s, "")) as Box<dyn Entity>),
                ),
            ),
            (
                "Strategy",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_subnet(i).strategy < as_subnet(j).strategy,
                    |r| {
                        let gte = as_subnet(r).strategy.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_subnet(s).strategy >= gte),
                            Box::new(move |s| as_subnet(s).strategy > gt),
                        )
                    },
                    |s| {
                        let mut sn = Subnet::new("", "");
                        sn.strategy = s.to_string();
                        Ok(Box::new(sn) as Box<dyn Entity>)
                    },
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode subnet {}: {}", self.name, e)))
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(
        &mut self,
        _dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::validation(SUBNETS, &self.name);
        if self.name.is_empty() {
            e.add("Subnet must have a name");
        }
        if self.strategy.is_empty() {
            e.add("Subnet Strategy cannot be empty!");
        }
        match self.net() {
            None => e.add(format!("Invalid subnet CIDR {:?}", self.subnet)),
            Some(_) => {
                if !self.in_subnet_range(self.active_start) {
                    e.add(format!(
                        "ActiveStart {} not in subnet range {}",
                        self.active_start, self.subnet
                    ));
                }
                if !self.in_subnet_range(self.active_end) {
                    e.add(format!(
                        "ActiveEnd {} not in subnet range {}",
                        self.active_end, self.subnet
                    ));
                }
                if self.active_start > self.active_end {
                    e.add(format!(
                        "ActiveStart {} must be less than or equal to ActiveEnd {}",
                        self.active_start, self.active_end
                    ));
                }
            }
        }
        if self.active_lease_time < 60 {
            e.add(format!(
                "ActiveLeaseTime {} must be at least 60 seconds",
                self.active_lease_time
            ));
        }
        if self.reserved_lease_time < 60 {
            e.add(format!(
                "ReservedLeaseTime {} must be at least 60 seconds",
                self.reserved_lease_time
            ));
        }
        if let Err(dup) = check_unique(self, &d.get(SUBNETS).items()) {
            e.merge(dup);
        }
        e.or_ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subnet() -> Subnet {
        let mut s = Subnet::new("local", "10.0.0.0/24");
        s.active_start = Ipv4Addr::new(10, 0, 0, 10);
        s.active_end = Ipv4Addr::new(10, 0, 0, 100);
        s.active_lease_time = 60;
        s.reserved_lease_time = 7200;
        s
    }

    #[test]
    fn test_ranges_exclude_network_and_broadcast() {
        let s = subnet();
        assert!(!s.in_subnet_range(Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!s.in_subnet_range(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(s.in_subnet_range(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!s.in_subnet_range(Ipv4Addr::new(10, 0, 1, 1)));

        assert!(s.in_active_range(Ipv4Addr::new(10, 0, 0, 10)));
        assert!(s.in_active_range(Ipv4Addr::new(10, 0, 0, 100)));
        assert!(!s.in_active_range(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(!s.in_active_range(Ipv4Addr::new(10, 0, 0, 101)));
    }

    #[test]
    fn test_lease_time_for() {
        let s = subnet();
        assert_eq!(
            s.lease_time_for(Ipv4Addr::new(10, 0, 0, 50)),
            Duration::from_secs(60)
        );
        assert_eq!(
            s.lease_time_for(Ipv4Addr::new(10, 0, 0, 5)),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_option_render() {
        let mut src = BTreeMap::new();
        src.insert(67u8, "ipxe.efi".to_string());

        let literal = DhcpOption::new(3, "10.0.0.1");
        assert_eq!(literal.render(&src).unwrap(), "10.0.0.1");

        let templated = DhcpOption::new(67, "{{ options.o67 }}");
        assert_eq!(templated.render(&src).unwrap(), "ipxe.efi");

        let missing = DhcpOption::new(67, "{{ options.o150 }}");
        assert!(missing.render(&src).is_err());
    }
}
