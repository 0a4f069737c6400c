// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared template bodies referenced from boot environments by id.

use std::any::Any;

use bootforge_common::Error;
use serde::{Deserialize, Serialize};

use crate::index::{check_unique, Maker};
use crate::model::{as_bootenv, Entity, BOOTENVS, TEMPLATES};
use crate::tracker::{DataTracker, Stores};

/// A reusable template body.  Boot environments that reference this
/// template by id get it from the tracker-wide common root, so one edit
/// here re-renders every environment that uses it.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Template {
    pub id: String,
    pub description: String,
    pub contents: String,
}

impl Template {
    pub fn new(id: &str, contents: &str) -> Template {
        Template {
            id: id.to_string(),
            contents: contents.to_string(),
            ..Default::default()
        }
    }
}

pub fn as_template(e: &dyn Entity) -> &Template {
    e.as_any()
        .downcast_ref::<Template>()
        .expect("templates entry was not a Template")
}

impl Entity for Template {
    fn prefix(&self) -> &'static str {
        TEMPLATES
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    fn indexes(&self) -> Vec<(&'static str, Maker)> {
        vec![
            ("Key", Maker::key()),
            (
                "ID",
                Maker::new(
                    true,
                    "string",
                    |i, j| as_template(i).id < as_template(j).id,
                    |r| {
                        let gte = as_template(r).id.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_template(s).id >= gte),
                            Box::new(move |s| as_template(s).id > gt),
                        )
                    },
                    |s| Ok(Box::new(Template::new(s, "")) as Box<dyn Entity>),
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode template {}: {}", self.id, e)))
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
        let mut e = Error::validation(TEMPLATES, &self.id);
        if self.id.is_empty() {
            e.add("Template must have an ID");
        }
        if let Err(dup) = check_unique(self, &d.get(TEMPLATES).items()) {
            e.merge(dup);
        }
        // Refuse bodies that will never compile; everything referencing this
        // template would break at render time otherwise.
        let mut probe = tera::Tera::default();
        if let Err(terr) = probe.add_raw_template(&self.id, &self.contents) {
            e.add(crate::render::tera_error("template does not compile", &terr));
        }
        e.or_ok(())
    }

    fn after_save(&mut self, dt: &DataTracker, d: &mut Stores<'_>) {
        // The common root changed; recompile every boot environment against
        // it so their availability reflects the new reality.
        dt.rebuild_common_root(d);
    }

    fn before_delete(
        &self,
        _dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::still_in_use(TEMPLATES, &self.id);
        for env in d.get(BOOTENVS).items() {
            let env = as_bootenv(&*env);
            if env.templates.iter().any(|ti| ti.id.as_deref() == Some(&self.id)) {
                e.add(format!("Template {} in use by BootEnv {}", self.id, env.name));
            }
        }
        e.or_ok(())
    }

    fn after_delete(&self, dt: &DataTracker, d: &mut Stores<'_>) {
        dt.rebuild_common_root(d);
    }
}
