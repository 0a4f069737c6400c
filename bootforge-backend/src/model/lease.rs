// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A time-bounded allocation of an IP address to a client token.

use std::any::Any;
use std::net::Ipv4Addr;

use bootforge_common::{hexaddr, validate_ip4, Error};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::index::Maker;
use crate::model::{as_reservation, as_subnet, Entity};
use crate::model::{LEASES, RESERVATIONS, SUBNETS};
use crate::tracker::{DataTracker, Stores};

/// A lease binds `addr` to the client identified by (`strategy`, `token`)
/// until `expire_time`.  The DHCP renewal time handed to clients is half
/// the lease duration and the rebind time three quarters of it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Lease {
    pub addr: Ipv4Addr,
    pub token: String,
    pub strategy: String,
    pub expire_time: DateTime<Utc>,
}

impl Default for Lease {
    fn default() -> Lease {
        Lease {
            addr: Ipv4Addr::UNSPECIFIED,
            token: String::new(),
            strategy: String::new(),
            expire_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Lease {
    pub fn new(
        addr: Ipv4Addr,
        strategy: &str,
        token: &str,
        expire_time: DateTime<Utc>,
    ) -> Lease {
        Lease {
            addr,
            strategy: strategy.to_string(),
            token: token.to_string(),
            expire_time,
        }
    }

    pub fn expired(&self) -> bool {
        self.expire_time < Utc::now()
    }

    pub fn matches(&self, strategy: &str, token: &str) -> bool {
        self.strategy == strategy && self.token == token
    }

    /// Ends the lease immediately.
    pub fn expire(&mut self) {
        self.expire_time = Utc::now();
    }

    /// Quarantines the address for a couple of seconds and forgets who held
    /// it.  Used when a client declines an address we handed out.
    pub fn invalidate(&mut self) {
        self.expire_time = Utc::now() + Duration::seconds(2);
        self.token = String::new();
        self.strategy = String::new();
    }
}

pub fn as_lease(e: &dyn Entity) -> &Lease {
    e.as_any().downcast_ref::<Lease>().expect("leases entry was not a Lease")
}

impl Entity for Lease {
    fn prefix(&self) -> &'static str {
        LEASES
    }

    fn key(&self) -> String {
        hexaddr(self.addr)
    }

    fn indexes(&self) -> Vec<(&'static str, Maker)> {
        vec![
            ("Key", Maker::key()),
            (
                "Addr",
                Maker::new(
                    true,
                    "IP Address",
                    |i, j| as_lease(i).addr < as_lease(j).addr,
                    |r| {
                        let at = as_lease(r).addr;
                        (
                            Box::new(move |s: &dyn Entity| as_lease(s).addr >= at),
                            Box::new(move |s: &dyn Entity| as_lease(s).addr > at),
                        )
                    },
                    |s| {
                        let addr: Ipv4Addr = s.parse().map_err(|_| {
                            let mut e = Error::validation(LEASES, s);
                            e.add(format!("Invalid address: {}", s));
                            e
                        })?;
                        Ok(Box::new(Lease { addr, ..Default::default() })
                            as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Token",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_lease(i).token < as_lease(j).token,
                    |r| {
                        let gte = as_lease(r).token.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_lease(s).token >= gte),
                            Box::new(move |s| as_lease(s).token > gt),
                        )
                    },
                    |s| {
                        Ok(Box::new(Lease {
                            token: s.to_string(),
                            ..Default::default()
                        }) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Strategy",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_lease(i).strategy < as_lease(j).strategy,
                    |r| {
                        let gte = as_lease(r).strategy.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_lease(s).strategy >= gte),
                            Box::new(move |s| as_lease(s).strategy > gt),
                        )
                    },
                    |s| {
                        Ok(Box::new(Lease {
                            strategy: s.to_string(),
                            ..Default::default()
                        }) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "ExpireTime",
                Maker::new(
                    false,
                    "date-time",
                    |i, j| as_lease(i).expire_time < as_lease(j).expire_time,
                    |r| {
                        let at = as_lease(r).expire_time;
                        (
                            Box::new(move |s: &dyn Entity| {
                                as_lease(s).expire_time >= at
                            }),
                            Box::new(move |s: &dyn Entity| {
                                as_lease(s).expire_time > at
                            }),
                        )
                    },
                    |s| {
                        let t = s.parse::<DateTime<Utc>>().map_err(|_| {
                            let mut e = Error::validation(LEASES, s);
                            e.add(format!("Invalid date-time: {}", s));
                            e
                        })?;
                        Ok(Box::new(Lease {
                            expire_time: t,
                            ..Default::default()
                        }) as Box<dyn Entity>)
                    },
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode lease {}: {}", self.key(), e)))
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn on_create(
        &mut self,
        _dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::validation(LEASES, &self.key());
        validate_ip4(&mut e, self.addr);
        if self.token.is_empty() {
            e.add("Lease Token cannot be empty!");
        }
        if self.strategy.is_empty() {
            e.add("Lease Strategy cannot be empty!");
        }
        // A lease needs either a reservation or a subnet behind it.
        let reserved = d
            .get(RESERVATIONS)
            .find(&self.key())
            .is_some();
        if reserved {
            return e.or_ok(());
        }
        for l in d.get(LEASES).items() {
            let l = as_lease(&*l);
            if l.addr == self.addr {
                continue;
            }
            if l.matches(&self.strategy, &self.token) && !l.expired() {
                e.add(format!(
                    "Lease {} already has Strategy {}: Token {}",
                    l.key(),
                    self.strategy,
                    self.token
                ));
                break;
            }
        }
        let covering = d
            .get(SUBNETS)
            .items()
            .into_iter()
            .find(|s| as_subnet(&**s).contains(self.addr));
        match covering {
            None => {
                e.add("Cannot create Lease without a reservation or a subnet")
            }
            Some(s) => {
                let s = as_subnet(&*s);
                if !s.in_subnet_range(self.addr) {
                    e.add(format!(
                        "Address {} is a network or broadcast address for subnet {}",
                        self.addr, s.name
                    ));
                } else if !s.in_active_range(self.addr) {
                    e.add(format!(
                        "Address {} not in the active range of subnet {}",
                        self.addr, s.name
                    ));
                }
            }
        }
        e.or_ok(())
    }

    fn on_change(
        &mut self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
        old: &dyn Entity,
    ) -> Result<(), Error> {
        let old = as_lease(old);
        let mut e = Error::validation(LEASES, &self.key());
        if self.token != old.token {
            e.add("Token cannot change");
        }
        if self.strategy != old.strategy {
            e.add("Strategy cannot change");
        }
        e.or_ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_expire_and_invalidate() {
        let mut l = Lease::new(
            Ipv4Addr::new(10, 0, 0, 5),
            "MAC",
            "aa:bb:cc:dd:ee:ff",
            Utc::now() + Duration::seconds(3600),
        );
        assert!(!l.expired());
        assert_eq!(l.key(), "0A000005");

        l.invalidate();
        assert!(l.token.is_empty());
        assert!(l.strategy.is_empty());
        // Quarantined: not yet expired, but nearly so.
        assert!(!l.expired());
        assert!(l.expire_time <= Utc::now() + Duration::seconds(2));

        l.expire();
        assert!(l.expire_time <= Utc::now());
    }
}
