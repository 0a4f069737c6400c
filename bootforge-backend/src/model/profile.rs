// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named parameter bundles applied to machines in order.

use std::any::Any;
use std::collections::BTreeMap;

use bootforge_common::Error;
use serde::{Deserialize, Serialize};

use crate::index::{check_unique, Maker};
use crate::model::{as_machine, Entity, Machine, MACHINES, PROFILES, TASKS};
use crate::tracker::{DataTracker, Stores};

/// A named collection of parameters (and tasks) that machines reference in
/// priority order when resolving a parameter during rendering.  One
/// distinguished "global" profile, named in the tracker configuration, is
/// consulted last for every machine.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub description: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub tasks: Vec<String>,
}

impl Profile {
    pub fn new(name: &str) -> Profile {
        Profile { name: name.to_string(), ..Default::default() }
    }

    pub fn get_param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }
}

pub fn as_profile(e: &dyn Entity) -> &Profile {
    e.as_any().downcast_ref::<Profile>().expect("profiles entry was not a Profile")
}

impl Entity for Profile {
    fn prefix(&self) -> &'static str {
        PROFILES
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
                    |i, j| as_profile(i).name < as_profile(j).name,
                    |r| {
                        let gte = as_profile(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_profile(s).name >= gte),
                            Box::new(move |s| as_profile(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(Profile::new(s)) as Box<dyn Entity>),
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode profile {}: {}", self.name, e)))
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
        let mut e = Error::validation(PROFILES, &self.name);
        if self.name.is_empty() {
            e.add("Profile must have a name");
        }
        if let Err(dup) = check_unique(self, &d.get(PROFILES).items()) {
            e.merge(dup);
        }
        let tasks = d.get(TASKS);
        for (i, task) in self.tasks.iter().enumerate() {
            if !tasks.contains(task) {
                e.add(format!("Task {} (at {}) does not exist", task, i));
            }
        }
        e.or_ok(())
    }

    fn before_delete(
        &self,
        dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::still_in_use(PROFILES, &self.name);
        if self.name == dt.global_profile_name {
            e.add(format!("Profile {} is the global profile, cannot remove it", self.name));
        }
        for m in d.get(MACHINES).items() {
            let m: &Machine = as_machine(&*m);
            if m.profiles.iter().any(|p| p == &self.name) {
                e.add(format!("Profile {} in use by Machine {}", self.name, m.name));
            }
        }
        e.or_ok(())
    }
}
