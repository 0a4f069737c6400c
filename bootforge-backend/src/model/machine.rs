// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single bare-metal system whose boot environment the provisioner
//! manages.

use std::any::Any;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bootforge_common::{hexaddr, validate_maybe_zero_ip4, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::warn;
use uuid::Uuid;

use crate::index::{check_unique, Maker};
use crate::model::{as_bootenv, as_param, as_profile, Entity, ParamValue};
use crate::model::{BOOTENVS, MACHINES, PARAMS, PROFILES, TASKS, TEMPLATES};
use crate::tracker::{DataTracker, Stores};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Machine {
    /// Unique name; by convention the machine's FQDN.
    pub name: String,
    pub description: String,
    /// Assigned at create time and immutable afterwards.
    pub uuid: Uuid,
    /// The job currently running on the machine, if any.
    pub current_job: Option<Uuid>,
    /// The IPv4 address used when rendering PXE artifacts for this machine.
    /// Deliberately independent of any DHCP lease or reservation.
    pub address: Option<Ipv4Addr>,
    /// The boot environment to boot into.  Empty means the tracker's
    /// configured default.
    pub boot_env: String,
    /// Rendering problems recorded at save time.
    pub errors: Vec<String>,
    /// Profiles consulted, in order, when resolving a parameter.
    pub profiles: Vec<String>,
    /// Machine-local parameters; they win over any profile.
    pub params: BTreeMap<String, Value>,
    /// The tasks this machine has to run, recomputed when the boot
    /// environment changes.
    pub tasks: Vec<String>,
    /// Index into `tasks`: -1 when tasks are computed but none started,
    /// 0 when the list is empty.
    pub current_task: i32,
    /// Cleared when a job fails; the machine runs nothing until an operator
    /// intervenes.
    pub runnable: bool,

    // Tracks the boot environment the stored copy had, so the post-save
    // hook can tell whether it changed without looping forever.
    #[serde(skip)]
    pub(crate) old_boot_env: String,
}

impl Default for Machine {
    fn default() -> Machine {
        Machine {
            name: String::new(),
            description: String::new(),
            uuid: Uuid::nil(),
            current_job: None,
            address: None,
            boot_env: String::new(),
            errors: Vec::new(),
            profiles: Vec::new(),
            params: BTreeMap::new(),
            tasks: Vec::new(),
            current_task: 0,
            runnable: false,
            old_boot_env: String::new(),
        }
    }
}

impl Machine {
    pub fn new(name: &str) -> Machine {
        Machine {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            ..Default::default()
        }
    }

    /// The address in raw hexadecimal, as pxelinux and elilo expect.
    pub fn hex_address(&self) -> String {
        hexaddr(self.address.unwrap_or(Ipv4Addr::UNSPECIFIED))
    }

    pub fn short_name(&self) -> &str {
        match self.name.find('.') {
            Some(idx) => &self.name[..idx],
            None => &self.name,
        }
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.iter().any(|p| p == name)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t == name)
    }

    /// Looks `key` up in the machine's own params, then (when
    /// `search_profiles` is set) each profile in order, then the global
    /// profile.
    pub fn get_param(
        &self,
        dt: &DataTracker,
        d: &Stores<'_>,
        key: &str,
        search_profiles: bool,
    ) -> Option<Value> {
        if let Some(v) = self.params.get(key) {
            return Some(v.clone());
        }
        if !search_profiles {
            return None;
        }
        let profiles = d.get(PROFILES);
        for pname in &self.profiles {
            if let Some(p) = profiles.find(pname) {
                if let Some(v) = as_profile(&*p).get_param(key) {
                    return Some(v.clone());
                }
            }
        }
        profiles
            .find(&dt.global_profile_name)
            .and_then(|g| as_profile(&*g).get_param(key).cloned())
    }

    /// The full parameter map this machine renders with, lowest precedence
    /// first.
    pub fn resolved_params(
        &self,
        dt: &DataTracker,
        d: &Stores<'_>,
    ) -> BTreeMap<String, Value> {
        let mut res = BTreeMap::new();
        let profiles = d.get(PROFILES);
        if let Some(g) = profiles.find(&dt.global_profile_name) {
            res.extend(as_profile(&*g).params.clone());
        }
        for pname in self.profiles.iter().rev() {
            if let Some(p) = profiles.find(pname) {
                res.extend(as_profile(&*p).params.clone());
            }
        }
        res.extend(self.params.clone());
        res
    }

    /// The lock set an external caller must hold for `action` on machines.
    pub fn locks(action: &str) -> &'static [&'static str] {
        match action {
            "get" | "actions" => &[MACHINES, PROFILES, PARAMS],
            "create" | "update" | "patch" => {
                &[BOOTENVS, MACHINES, TASKS, PROFILES, TEMPLATES, PARAMS]
            }
            "delete" => &[BOOTENVS, MACHINES],
            _ => &[MACHINES],
        }
    }
}

/// Builds an index maker ordering machines by the value of `parameter`,
/// resolved through profiles the same way rendering resolves it.
pub fn parameter_maker(
    dt: &DataTracker,
    d: &Stores<'_>,
    parameter: &str,
) -> Result<Maker, Error> {
    let pobj = d.get(PARAMS).find(parameter).ok_or_else(|| {
        let mut e = Error::validation(PARAMS, parameter);
        e.add(format!("Parameter {} must be defined", parameter));
        e
    })?;
    let param = as_param(&*pobj).clone();
    let pname = parameter.to_string();

    // Resolution needs the profile stores, which won't be locked when the
    // index is used, so snapshot every machine's resolved value now.
    let snapshot: BTreeMap<String, ParamValue> = d
        .get(MACHINES)
        .items()
        .into_iter()
        .map(|m| {
            let mm = as_machine(&*m);
            let v = mm
                .get_param(dt, d, &pname, true)
                .map(|v| ParamValue::from(&v))
                .unwrap_or(ParamValue::Null);
            (mm.key(), v)
        })
        .collect();
    let resolve = {
        let pname = pname.clone();
        Arc::new(move |e: &dyn Entity| -> ParamValue {
            let m = as_machine(e);
            match snapshot.get(&m.key()) {
                Some(v) => v.clone(),
                // Not a stored machine: a query reference built by fill().
                None => m
                    .params
                    .get(&pname)
                    .map(ParamValue::from)
                    .unwrap_or(ParamValue::Null),
            }
        })
    };

    let less = {
        let resolve = Arc::clone(&resolve);
        move |i: &dyn Entity, j: &dyn Entity| resolve(i) < resolve(j)
    };
    let tests = {
        let resolve = Arc::clone(&resolve);
        move |r: &dyn Entity| -> (crate::index::Test, crate::index::Test) {
            let at = resolve(r);
            let gte_at = at.clone();
            let gte_resolve = Arc::clone(&resolve);
            let gt_resolve = Arc::clone(&resolve);
            (
                Box::new(move |s: &dyn Entity| gte_resolve(s) >= gte_at),
                Box::new(move |s: &dyn Entity| gt_resolve(s) > at),
            )
        }
    };
    let fill = move |s: &str| -> Result<Box<dyn Entity>, Error> {
        let obj: Value = serde_json::from_str(s).map_err(|err| {
            let mut e = Error::validation(MACHINES, s);
            e.add(format!("Invalid parameter value {:?}: {}", s, err));
            e
        })?;
        param.validate_value(&obj)?;
        let mut m = Machine::default();
        m.params.insert(pname.clone(), obj);
        Ok(Box::new(m))
    };
    Ok(Maker::new(false, "parameter", less, tests, fill))
}

pub fn as_machine(e: &dyn Entity) -> &Machine {
    e.as_any().downcast_ref::<Machine>().expect("machines entry was not a Machine")
}

impl Entity for Machine {
    fn prefix(&self) -> &'static str {
        MACHINES
    }

    fn key(&self) -> String {
        self.uuid.to_string()
    }

    fn indexes(&self) -> Vec<(&'static str, Maker)> {
        vec![
            ("Key", Maker::key()),
            (
                "Uuid",
                Maker::new(
                    true,
                    "UUID string",
                    |i, j| as_machine(i).uuid < as_machine(j).uuid,
                    |r| {
                        let at = as_machine(r).uuid;
                        (
                            Box::new(move |s: &dyn Entity| as_machine(s).uuid >= at),
                            Box::new(move |s: &dyn Entity| as_machine(s).uuid > at),
                        )
                    },
                    |s| {
                        let id = Uuid::parse_str(s).map_err(|_| {
                            let mut e = Error::validation(MACHINES, s);
                            e.add(format!("Invalid UUID: {}", s));
                            e
                        })?;
                        let mut m = Machine::default();
                        m.uuid = id;
                        Ok(Box::new(m) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Name",
                Maker::new(
                    true,
                    "string",
                    |i, j| as_machine(i).name < as_machine(j).name,
                    |r| {
                        let gte = as_machine(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_machine(s).name >= gte),
                            Box::new(move |s| as_machine(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(Machine::new(s)) as Box<dyn Entity>),
                ),
            ),
            (
                "BootEnv",
                Maker::new(
                    false,
                    "string",
                    |i, j| as_machine(i).boot_env < as_machine(j).boot_env,
                    |r| {
                        let gte = as_machine(r).boot_env.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_machine(s).boot_env >= gte),
                            Box::new(move |s| as_machine(s).boot_env > gt),
                        )
                    },
                    |s| {
                        let mut m = Machine::default();
                        m.boot_env = s.to_string();
                        Ok(Box::new(m) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Address",
                Maker::new(
                    false,
                    "IP Address",
                    |i, j| as_machine(i).address < as_machine(j).address,
                    |r| {
                        let at = as_machine(r).address;
                        (
                            Box::new(move |s: &dyn Entity| as_machine(s).address >= at),
                            Box::new(move |s: &dyn Entity| as_machine(s).address > at),
                        )
                    },
                    |s| {
                        let addr: Ipv4Addr = s.parse().map_err(|_| {
                            let mut e = Error::validation(MACHINES, s);
                            e.add(format!("Invalid address: {}", s));
                            e
                        })?;
                        let mut m = Machine::default();
                        m.address = Some(addr);
                        Ok(Box::new(m) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "Runnable",
                Maker::new(
                    false,
                    "boolean",
                    |i, j| !as_machine(i).runnable && as_machine(j).runnable,
                    |r| {
                        let at = as_machine(r).runnable;
                        (
                            Box::new(move |s: &dyn Entity| as_machine(s).runnable >= at),
                            Box::new(move |s: &dyn Entity| {
                                as_machine(s).runnable && !at
                            }),
                        )
                    },
                    |s| {
                        let mut m = Machine::default();
                        m.runnable = match s {
                            "true" => true,
                            "false" => false,
                            _ => {
                                let mut e = Error::validation(MACHINES, s);
                                e.add("Runnable must be true or false");
                                return Err(e);
                            }
                        };
                        Ok(Box::new(m) as Box<dyn Entity>)
                    },
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode machine {}: {}", self.uuid, e)))
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
        _d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        // All machines start runnable.
        self.runnable = true;
        if self.uuid.is_nil() {
            self.uuid = Uuid::new_v4();
        }
        Ok(())
    }

    fn on_change(
        &mut self,
        _dt: &DataTracker,
        _d: &mut Stores<'_>,
        old: &dyn Entity,
    ) -> Result<(), Error> {
        let old = as_machine(old);
        let mut e = Error::validation(MACHINES, &self.key());
        if self.uuid != old.uuid {
            e.add("Uuid cannot change");
        }
        self.old_boot_env = old.boot_env.clone();
        e.or_ok(())
    }

    fn validate(
        &mut self,
        dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::validation(MACHINES, &self.key());
        if self.uuid.is_nil() {
            e.add(format!("Machine {} was not assigned a uuid!", self.name));
        }
        if self.name.is_empty() {
            e.add(format!("Machine {} must have a name", self.uuid));
        }
        if self.boot_env.is_empty() {
            self.boot_env = dt.default_boot_env();
        }
        if let Some(addr) = self.address {
            validate_maybe_zero_ip4(&mut e, addr);
        }
        if let Err(dup) = check_unique(self, &d.get(MACHINES).items()) {
            e.merge(dup);
        }
        let profiles = d.get(PROFILES);
        let mut wanted: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, pname) in self.profiles.iter().enumerate() {
            if !profiles.contains(pname) {
                e.add(format!("Profile {} (at {}) does not exist", pname, i));
            } else if let Some(already) = wanted.get(pname.as_str()) {
                e.add(format!(
                    "Duplicate profile {}: at {} and {}",
                    pname, already, i
                ));
            } else {
                wanted.insert(pname, i);
            }
        }
        let tasks = d.get(TASKS);
        for (i, tname) in self.tasks.iter().enumerate() {
            if !tasks.contains(tname) {
                e.add(format!("Task {} (at {}) does not exist", tname, i));
            }
        }
        if !d.get(BOOTENVS).contains(&self.boot_env) {
            e.add(format!("Bootenv {} does not exist", self.boot_env));
        }
        e.or_ok(())
    }

    fn before_save(
        &mut self,
        dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::validation(MACHINES, &self.key());
        let env_arc = match d.get(BOOTENVS).find(&self.boot_env) {
            Some(env) => env,
            None => {
                e.add(format!("Bootenv {} does not exist", self.boot_env));
                return Err(e);
            }
        };
        let env = as_bootenv(&*env_arc);
        let old_env_arc = if self.old_boot_env.is_empty() {
            None
        } else {
            d.get(BOOTENVS).find(&self.old_boot_env)
        };
        if env.only_unknown {
            e.add(format!(
                "BootEnv {} does not allow Machine assignments, it has the OnlyUnknown flag.",
                env.name
            ));
        }
        if !env.available {
            e.add(format!(
                "Machine {} wants BootEnv {}, which is not available",
                self.uuid, self.boot_env
            ));
        }
        if !e.has_errors() {
            match old_env_arc {
                Some(old_arc) if as_bootenv(&*old_arc).name != env.name => {
                    // Swap the served artifacts atomically with this save.
                    as_bootenv(&*old_arc)
                        .render(dt, d, Some(&*self), &mut e)
                        .deregister(&dt.fs);
                    env.render(dt, d, Some(&*self), &mut e).register(&dt.fs);
                }
                Some(_) => {}
                None => {
                    env.render(dt, d, Some(&*self), &mut e).register(&dt.fs);
                }
            }
        }
        e.or_ok(())
    }

    fn after_save(&mut self, dt: &DataTracker, d: &mut Stores<'_>) {
        if self.old_boot_env == self.boot_env {
            return;
        }
        // The boot environment changed; the task list is aggregated from
        // the new environment, each profile in order, and the global
        // profile.
        let mut task_list = Vec::new();
        if let Some(env) = d.get(BOOTENVS).find(&self.boot_env) {
            task_list.extend(as_bootenv(&*env).tasks.iter().cloned());
        }
        let profiles = d.get(PROFILES);
        for pname in &self.profiles {
            if let Some(p) = profiles.find(pname) {
                task_list.extend(as_profile(&*p).tasks.iter().cloned());
            }
        }
        if let Some(g) = profiles.find(&dt.global_profile_name) {
            task_list.extend(as_profile(&*g).tasks.iter().cloned());
        }
        self.tasks = task_list;
        self.current_task = if self.tasks.is_empty() { 0 } else { -1 };
        // Reset this before the follow-up save to keep from looping
        // forever.
        self.old_boot_env = self.boot_env.clone();
        if let Err(err) = dt.save(d, self.clone_entity()) {
            warn!(dt.log(), "machine follow-up save failed";
                "machine" => %self.uuid,
                "error" => %err);
        }
    }

    fn after_delete(&self, dt: &DataTracker, d: &mut Stores<'_>) {
        if let Some(env) = d.get(BOOTENVS).find(&self.boot_env) {
            let mut e = Error::validation(MACHINES, &self.key());
            as_bootenv(&*env)
                .render(dt, d, Some(self), &mut e)
                .deregister(&dt.fs);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_short_name_and_hex_address() {
        let mut m = Machine::new("node1.example.com");
        assert_eq!(m.short_name(), "node1");
        m.address = Some(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(m.hex_address(), "0A000005");
        let bare = Machine::new("node2");
        assert_eq!(bare.short_name(), "node2");
        assert_eq!(bare.hex_address(), "00000000");
    }
}
