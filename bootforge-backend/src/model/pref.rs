// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Global preferences: a tiny read-mostly prefix with fixed keys
//! (`defaultBootEnv`, `unknownBootEnv`, `globalProfileName`).

use std::any::Any;

use bootforge_common::Error;
use serde::{Deserialize, Serialize};

use crate::model::{as_bootenv, Entity, BOOTENVS, PREFERENCES};
use crate::tracker::{DataTracker, Stores};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Pref {
    pub name: String,
    pub val: String,
}

impl Pref {
    pub fn new(name: &str, val: &str) -> Pref {
        Pref { name: name.to_string(), val: val.to_string() }
    }
}

pub fn as_pref(e: &dyn Entity) -> &Pref {
    e.as_any().downcast_ref::<Pref>().expect("preferences entry was not a Pref")
}

impl Entity for Pref {
    fn prefix(&self) -> &'static str {
        PREFERENCES
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode pref {}: {}", self.name, e)))
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
        let mut e = Error::validation(PREFERENCES, &self.name);
        match self.name.as_str() {
            "defaultBootEnv" | "unknownBootEnv" => {
                // These must point at a usable boot environment of the right
                // flavor before they take effect.
                match d.get(BOOTENVS).find(&self.val) {
                    None => {
                        e.add(format!("Bootenv {} does not exist", self.val))
                    }
                    Some(env) => {
                        let env = as_bootenv(&*env);
                        let want_unknown = self.name == "unknownBootEnv";
                        if env.only_unknown != want_unknown {
                            e.add(format!(
                                "Bootenv {} cannot be used for {}",
                                self.val, self.name
                            ));
                        }
                    }
                }
            }
            "globalProfileName" => {}
            _ => e.add(format!("Unknown preference {}", self.name)),
        }
        e.or_ok(())
    }
}
