// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The domain entities the tracker manages, and the [`Entity`] trait that
//! lets the tracker drive them generically.
//!
//! Every entity lives in exactly one prefix (its collection name) under a
//! key unique within that prefix.  The tracker calls the lifecycle hooks in
//! a fixed order; a hook returning an error aborts the whole mutation with
//! nothing made visible.  Hooks receive the tracker plus the lock-scoped
//! store view instead of holding a back-pointer, so there is no ownership
//! cycle between entities and the tracker.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt::Debug;

use bootforge_common::Error;

use crate::index::Maker;
use crate::tracker::{DataTracker, Stores};

mod bootenv;
mod lease;
mod machine;
mod param;
mod plugin;
mod pref;
mod profile;
mod reservation;
mod subnet;
mod task;
mod template;

pub use bootenv::{as_bootenv, BootEnv, OsInfo, TemplateInfo};
pub use lease::{as_lease, Lease};
pub use machine::{as_machine, parameter_maker, Machine};
pub use param::{as_param, Param};
pub use plugin::{as_plugin, Plugin};
pub use pref::{as_pref, Pref};
pub use profile::{as_profile, Profile};
pub use reservation::{as_reservation, Reservation};
pub use subnet::{as_subnet, DhcpOption, Subnet};
pub use task::{as_task, Task};
pub use template::{as_template, Template};

pub const BOOTENVS: &str = "bootenvs";
pub const LEASES: &str = "leases";
pub const MACHINES: &str = "machines";
pub const PARAMS: &str = "params";
pub const PLUGINS: &str = "plugins";
pub const PREFERENCES: &str = "preferences";
pub const PROFILES: &str = "profiles";
pub const RESERVATIONS: &str = "reservations";
pub const SUBNETS: &str = "subnets";
pub const TASKS: &str = "tasks";
pub const TEMPLATES: &str = "templates";

/// Every prefix the tracker manages, in canonical lock order.
pub const ALL_PREFIXES: &[&str] = &[
    BOOTENVS,
    LEASES,
    MACHINES,
    PARAMS,
    PLUGINS,
    PREFERENCES,
    PROFILES,
    RESERVATIONS,
    SUBNETS,
    TASKS,
    TEMPLATES,
];

/// A tracker-managed object.
pub trait Entity: Any + Debug + Send + Sync {
    /// The collection this entity belongs to.
    fn prefix(&self) -> &'static str;

    /// The key, unique within the prefix.
    fn key(&self) -> String;

    /// The opaque token external authorization layers scope requests with.
    fn auth_key(&self) -> String {
        self.key()
    }

    /// The queryable index definitions for this entity kind.
    fn indexes(&self) -> Vec<(&'static str, Maker)> {
        vec![("Key", Maker::key())]
    }

    /// Serializes the persistent attributes as a JSON document.
    fn marshal(&self) -> Result<Vec<u8>, Error>;

    fn clone_entity(&self) -> Box<dyn Entity>;
    fn as_any(&self) -> &dyn Any;

    fn on_create(
        &mut self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn on_change(
        &mut self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
        _old: &dyn Entity,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn validate(
        &mut self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn before_save(
        &mut self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn after_save(&mut self, _dt: &DataTracker, _d: &mut Stores<'_>) {}

    fn before_delete(
        &self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn after_delete(&self, _dt: &DataTracker, _d: &mut Stores<'_>) {}
}

/// Reconstitutes an entity of the kind stored under `prefix` from its
/// persisted JSON form.
pub fn unmarshal(prefix: &str, bytes: &[u8]) -> Result<Box<dyn Entity>, Error> {
    fn de<T: Entity + serde::de::DeserializeOwned>(
        prefix: &str,
        bytes: &[u8],
    ) -> Result<Box<dyn Entity>, Error> {
        let ent: T = serde_json::from_slice(bytes).map_err(|e| {
            Error::backend(format!("decode {} entry: {}", prefix, e))
        })?;
        Ok(Box::new(ent))
    }
    match prefix {
        BOOTENVS => de::<BootEnv>(prefix, bytes),
        LEASES => de::<Lease>(prefix, bytes),
        MACHINES => de::<Machine>(prefix, bytes),
        PARAMS => de::<Param>(prefix, bytes),
        PLUGINS => de::<Plugin>(prefix, bytes),
        PREFERENCES => de::<Pref>(prefix, bytes),
        PROFILES => de::<Profile>(prefix, bytes),
        RESERVATIONS => de::<Reservation>(prefix, bytes),
        SUBNETS => de::<Subnet>(prefix, bytes),
        TASKS => de::<Task>(prefix, bytes),
        TEMPLATES => de::<Template>(prefix, bytes),
        _ => Err(Error::backend(format!("unknown prefix {:?}", prefix))),
    }
}

/// A parameter value as seen by the parameter indexes.
///
/// Indexed parameter values are ordered nil-last-becomes-first: `Null`
/// sorts before everything, then booleans, integers, and strings, each in
/// natural order.  All parameter comparisons go through this variant rather
/// than inspecting raw JSON.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

impl ParamValue {
    fn rank(&self) -> u8 {
        match self {
            ParamValue::Null => 0,
            ParamValue::Bool(_) => 1,
            ParamValue::Int(_) => 2,
            ParamValue::String(_) => 3,
        }
    }
}

impl From<&serde_json::Value> for ParamValue {
    fn from(v: &serde_json::Value) -> ParamValue {
        match v {
            serde_json::Value::Bool(b) => ParamValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => ParamValue::Null,
            },
            serde_json::Value::String(s) => ParamValue::String(s.clone()),
            _ => ParamValue::Null,
        }
    }
}

impl Ord for ParamValue {
    fn cmp(&self, other: &ParamValue) -> Ordering {
        match (self, other) {
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a.cmp(b),
            (ParamValue::Int(a), ParamValue::Int(b)) => a.cmp(b),
            (ParamValue::String(a), ParamValue::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for ParamValue {
    fn partial_cmp(&self, other: &ParamValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_value_ordering() {
        let null = ParamValue::from(&json!(null));
        let f = ParamValue::from(&json!(false));
        let t = ParamValue::from(&json!(true));
        let three = ParamValue::from(&json!(3));
        let ten = ParamValue::from(&json!(10));
        let abc = ParamValue::from(&json!("abc"));
        let xyz = ParamValue::from(&json!("xyz"));
        let mut vals =
            vec![xyz.clone(), three.clone(), null.clone(), t.clone(), abc.clone(), f.clone(), ten.clone()];
        vals.sort();
        assert_eq!(vals, vec![null, f, t, three, ten, abc, xyz]);
    }

    #[test]
    fn test_param_value_collapses_compound_values() {
        assert_eq!(ParamValue::from(&json!([1, 2])), ParamValue::Null);
        assert_eq!(ParamValue::from(&json!({"a": 1})), ParamValue::Null);
        assert_eq!(ParamValue::from(&json!(1.5)), ParamValue::Null);
    }
}
