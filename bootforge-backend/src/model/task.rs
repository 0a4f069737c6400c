// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named units of post-boot work.  Machines accumulate a task list from
//! their boot environment, profiles, and the global profile; the job runner
//! that executes them is an external collaborator, so here a task is pure
//! configuration validated for referential integrity.

use std::any::Any;

use bootforge_common::Error;
use serde::{Deserialize, Serialize};

use crate::index::{check_unique, Maker};
use crate::model::{as_bootenv, as_machine, as_profile, Entity};
use crate::model::{BOOTENVS, MACHINES, PROFILES, TASKS};
use crate::tracker::{DataTracker, Stores};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Task {
    pub name: String,
    pub description: String,
}

impl Task {
    pub fn new(name: &str) -> Task {
        Task { name: name.to_string(), ..Default::default() }
    }
}

pub fn as_task(e: &dyn Entity) -> &Task {
    e.as_any().downcast_ref::<Task>().expect("tasks entry was not a Task")
}

impl Entity for Task {
    fn prefix(&self) -> &'static str {
        TASKS
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
                    |i, j| as_task(i).name < as_task(j).name,
                    |r| {
                        let gte = as_task(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_task(s).name >= gte),
                            Box::new(move |s| as_task(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(Task::new(s)) as Box<dyn Entity>),
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode task {}: {}", self.name, e)))
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
        let mut e = Error::validation(TASKS, &self.name);
        if self.name.is_empty() {
            e.add("Task must have a name");
        }
        if let Err(dup) = check_unique(self, &d.get(TASKS).items()) {
            e.merge(dup);
        }
        e.or_ok(())
    }

    fn before_delete(
        &self,
        _dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::still_in_use(TASKS, &self.name);
        for m in d.get(MACHINES).items() {
            if as_machine(&*m).tasks.iter().any(|t| t == &self.name) {
                e.add(format!("Task {} in use by Machine {}", self.name, as_machine(&*m).name));
            }
        }
        for p in d.get(PROFILES).items() {
            if as_profile(&*p).tasks.iter().any(|t| t == &self.name) {
                e.add(format!("Task {} in use by Profile {}", self.name, as_profile(&*p).name));
            }
        }
        for b in d.get(BOOTENVS).items() {
            if as_bootenv(&*b).tasks.iter().any(|t| t == &self.name) {
                e.add(format!("Task {} in use by BootEnv {}", self.name, as_bootenv(&*b).name));
            }
        }
        e.or_ok(())
    }
}
