// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioner backend: an in-memory, indexed, transactionally-locked
//! object store for the entities that describe how bare-metal machines boot,
//! plus the lease bookkeeping the DHCP engine relies on.
//!
//! There are four noteworthy pieces:
//!
//! 1. The [`tracker::DataTracker`], which owns one [`store::Store`] per
//!    entity prefix and hands out lock-scoped views via
//!    [`tracker::DataTracker::lock_ents`].  All reads, mutations,
//!    validations, and renders for a request happen inside one such scope.
//! 2. The entity types under [`model`], each implementing [`model::Entity`]
//!    with the lifecycle hooks the tracker drives (validate, before/after
//!    save, before/after delete).
//! 3. The template [`render`] layer, which compiles each boot environment's
//!    template tree and registers rendered artifacts in the virtual
//!    [`fs::FileSystem`] served to netbooting machines.
//! 4. The [`publish::Publishers`] fan-out, which notifies subscribers of
//!    entity changes without ever blocking or failing the mutator.
//!
//! Persistent state lives behind the [`persist::PersistentStore`] trait; the
//! tracker flushes each successful mutation before it becomes visible in the
//! in-memory indexes.

pub mod fs;
pub mod index;
pub mod model;
pub mod persist;
pub mod publish;
pub mod render;
pub mod store;
pub mod tracker;

pub use bootforge_common::{hexaddr, Error, ErrorKind};
