// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A configured instance of an external plugin provider.  The subprocess
//! host that actually runs providers is an external collaborator; the
//! tracker just keeps the configuration consistent.

use std::any::Any;
use std::collections::BTreeMap;

use bootforge_common::Error;
use serde::{Deserialize, Serialize};

use crate::index::{check_unique, Maker};
use crate::model::{Entity, PLUGINS};
use crate::tracker::{DataTracker, Stores};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Plugin {
    pub name: String,
    pub description: String,
    /// The plugin provider this instance runs under.
    pub provider: String,
    pub params: BTreeMap<String, serde_json::Value>,
    /// Start-up problems recorded by the plugin host.
    pub errors: Vec<String>,
}

impl Plugin {
    pub fn new(name: &str, provider: &str) -> Plugin {
        Plugin {
            name: name.to_string(),
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    pub fn get_param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }
}

pub fn as_plugin(e: &dyn Entity) -> &Plugin {
    e.as_any().downcast_ref::<Plugin>().expect("plugins entry was not a Plugin")
}

impl Entity for Plugin {
    fn prefix(&self) -> &'static str {
        PLUGINS
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
                    |i, j| as_plugin(i).name < as_plugin(j).name,
                    |r| {
                        let gte = as_plugin(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_plugin(s).name >= gte),
                            Box::new(move |s| as_plugin(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(Plugin::new(s, "")) as Box<dyn Entity>),
                ),
            ),
            (
                "Provider",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_plugin(i).provider < as_plugin(j).provider,
                    |r| {
                        let gte = as_plugin(r).provider.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_plugin(s).provider >= gte),
                            Box::new(move |s| as_plugin(s).provider > gt),
                        )
                    },
                    |s| Ok(Box::new(Plugin::new("", s)) as Box<dyn Entity>),
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode plugin {}: {}", self.name, e)))
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn before_save(
        &mut self,
        _dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::validation(PLUGINS, &self.name);
        if self.name.is_empty() {
            e.add("Plugin must have a name");
        }
        if self.provider.is_empty() {
            e.add(format!("Plugin {} must have a provider", self.name));
        }
        if let Err(dup) = check_unique(self, &d.get(PLUGINS).items()) {
            e.merge(dup);
        }
        e.or_ok(())
    }
}
