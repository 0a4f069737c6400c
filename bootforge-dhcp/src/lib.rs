// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DHCPv4 side of the bootforge provisioner.
//!
//! Three pieces:
//!
//! 1. [`packet`] and [`options`]: the RFC 2131/2132 wire codec.
//! 2. [`strategy`]: pluggable client identification.  A strategy turns an
//!    incoming packet into a stable token; leases and reservations are
//!    keyed by (strategy, token).
//! 3. [`server`]: the engine itself.  One thread does blocking reads on a
//!    raw UDP socket with `IP_PKTINFO` enabled so it knows which interface
//!    every packet arrived on, classifies packets, and drives the
//!    tracker's lease algorithm under a `{leases, reservations, subnets}`
//!    lock scope.

pub mod options;
pub mod packet;
pub mod server;
pub mod strategy;

pub use packet::{MessageType, Options, Packet};
pub use server::{start_dhcp_handler, DhcpConfig, DhcpService};
pub use strategy::{MacStrategy, Strategy};
