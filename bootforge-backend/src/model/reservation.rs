// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed binding of a client token to a specific IP address.

use std::any::Any;
use std::net::Ipv4Addr;

use bootforge_common::{hexaddr, validate_ip4, Error};
use serde::{Deserialize, Serialize};

use crate::index::Maker;
use crate::model::{DhcpOption, Entity, RESERVATIONS};
use crate::tracker::{DataTracker, Stores};

/// A reservation pins `addr` to the client identified by
/// (`strategy`, `token`), with optional per-machine DHCP options and
/// next-server override.  Its key is the hex encoding of the address, so at
/// most one reservation can exist per address.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Reservation {
    pub addr: Ipv4Addr,
    pub token: String,
    pub strategy: String,
    pub next_server: Option<Ipv4Addr>,
    pub options: Vec<DhcpOption>,
    pub description: String,
}

impl Default for Reservation {
    fn default() -> Reservation {
        Reservation {
            addr: Ipv4Addr::UNSPECIFIED,
            token: String::new(),
            strategy: String::new(),
            next_server: None,
            options: Vec::new(),
            description: String::new(),
        }
    }
}

impl Reservation {
    pub fn new(addr: Ipv4Addr, strategy: &str, token: &str) -> Reservation {
        Reservation {
            addr,
            strategy: strategy.to_string(),
            token: token.to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, strategy: &str, token: &str) -> bool {
        self.strategy == strategy && self.token == token
    }
}

pub fn as_reservation(e: &dyn Entity) -> &Reservation {
    e.as_any()
        .downcast_ref::<Reservation>()
        .expect("reservations entry was not a Reservation")
}

impl Entity for Reservation {
    fn prefix(&self) -> &'static str {
        RESERVATIONS
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
                    |i, j| as_reservation(i).addr < as_reservation(j).addr,
                    |r| {
                        let at = as_reservation(r).addr;
                        (
                            Box::new(move |s: &dyn Entity| as_reservation(s).addr >= at),
                            Box::new(move |s: &dyn Entity| as_reservation(s).addr > at),
                        )
                    },
                    |s| {
                        let addr: Ipv4Addr = s.parse().map_err(|_| {
                            let mut e = Error::validation(RESERVATIONS, s);
                            e.add(format!("Invalid address: {}", s));
                            e
                        })?;
                        Ok(Box::new(Reservation::new(addr, "", "")) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Token",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_reservation(i).token < as_reservation(j).token,
                    |r| {
                        let gte = as_reservation(r).token.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_reservation(s).token >= gte),
                            Box::new(move |s| as_reservation(s).token > gt),
                        )
                    },
                    |s| {
                        Ok(Box::new(Reservation::new(Ipv4Addr::UNSPECIFIED, "", s))
                            as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Strategy",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_reservation(i).strategy < as_reservation(j).strategy,
                    |r| {
                        let gte = as_reservation(r).strategy.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_reservation(s).strategy >= gte),
                            Box::new(move |s| as_reservation(s).strategy > gt),
                        )
                    },
                    |s| {
                        Ok(Box::new(Reservation::new(Ipv4Addr::UNSPECIFIED, s, ""))
                            as Box<dyn Entity>)
                    },
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| {
            Error::backend(format!("encode reservation {}: {}", self.key(), e))
        })
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
        let mut e = Error::validation(RESERVATIONS, &self.key());
        validate_ip4(&mut e, self.addr);
        if self.token.is_empty() {
            e.add("Reservation Token cannot be empty!");
        }
        if self.strategy.is_empty() {
            e.add("Reservation Strategy cannot be empty!");
        }
        for r in d.get(RESERVATIONS).items() {
            let r = as_reservation(&*r);
            if r.addr != self.addr && r.matches(&self.strategy, &self.token) {
                e.add(format!(
                    "Reservation {} already has Strategy {}: Token {}",
                    r.key(),
                    self.strategy,
                    self.token
                ));
                break;
            }
        }
        e.or_ok(())
    }
}
