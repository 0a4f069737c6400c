// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot environments: the machine-agnostic description of how to netboot
//! something, plus the template tree that turns it into served files.

use std::any::Any;
use std::io;
use std::process::Command;
use std::sync::Arc;

use bootforge_common::Error;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slog::warn;
use tera::Tera;

use crate::index::{check_unique, Maker};
use crate::model::{as_machine, Entity, Machine};
use crate::model::{BOOTENVS, MACHINES, TASKS};
use crate::render::{clean_path, tera_error, RenderData, Renderer, Renderers};
use crate::tracker::{DataTracker, Stores};

/// One template entry in a boot environment: where the rendered file goes
/// (`path`, itself a template) and what renders there (inline `contents` or
/// a shared `Template` entity referenced by `id`).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TemplateInfo {
    pub name: String,
    pub path: String,
    pub id: Option<String>,
    pub contents: Option<String>,
}

impl TemplateInfo {
    /// The name the body template is registered under in the environment's
    /// tree.
    pub fn template_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    fn path_id(&self) -> String {
        format!("{}#path", self.name)
    }
}

/// What operating system a boot environment installs or runs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OsInfo {
    pub name: String,
    pub family: String,
    pub codename: String,
    pub version: String,
    /// The ISO the OS installs from, under `<file-root>/isos`.
    pub iso_file: String,
    /// SHA256 of the ISO; adopted from the file when left empty.
    pub iso_sha256: String,
    /// Where the ISO can be fetched when it is missing.
    pub iso_url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BootEnv {
    /// Unique name.  Environments that install an operating system end in
    /// `-install` by convention, which also routes their files under an
    /// `install/` subtree.
    pub name: String,
    pub description: String,
    pub os: OsInfo,
    pub templates: Vec<TemplateInfo>,
    /// Path of the kernel inside the exploded OS tree.
    pub kernel: String,
    /// Paths of the initrds inside the exploded OS tree, in load order.
    pub initrds: Vec<String>,
    /// Template expanded into the kernel command line.
    pub boot_params: String,
    /// Params a machine must define before this environment renders.
    pub required_params: Vec<String>,
    /// Params the renderer will pick up when present.
    pub optional_params: Vec<String>,
    /// False whenever `errors` is non-empty; unavailable environments stay
    /// queryable but are never served or assigned.
    pub available: bool,
    pub errors: Vec<String>,
    /// Usable only as the sentinel environment for unknown machines, never
    /// assignable to a Machine.
    pub only_unknown: bool,
    /// Tasks prepended to a machine's task list when it enters this
    /// environment.
    pub tasks: Vec<String>,

    #[serde(skip)]
    pub(crate) engine: Option<Arc<Tera>>,
}

impl BootEnv {
    pub fn new(name: &str) -> BootEnv {
        BootEnv { name: name.to_string(), ..Default::default() }
    }

    pub fn is_install(&self) -> bool {
        self.name.ends_with("-install")
    }

    /// `<os-name>` or `<os-name>/install` for install environments.
    pub fn path_prefix(&self) -> String {
        if self.is_install() {
            format!("{}/install", self.os.name)
        } else {
            self.os.name.clone()
        }
    }

    pub fn path_for(&self, f: &str) -> String {
        clean_path(&format!("/{}/{}", self.path_prefix(), f))
    }

    pub fn local_path_for(&self, dt: &DataTracker, f: &str) -> Utf8PathBuf {
        let rel = self.path_for(f);
        dt.file_root.join(rel.trim_start_matches('/'))
    }

    /// Compiles this environment's template tree: the tracker-wide common
    /// root extended with the inline entries, per-entry path templates, and
    /// the boot-params template.  Returns `None` (with everything wrong
    /// recorded on `e`) when any part fails to compile.
    pub(crate) fn gen_root(
        &self,
        common: &Tera,
        e: &mut Error,
    ) -> Option<Arc<Tera>> {
        let mut root = Tera::default();
        if let Err(terr) = root.extend(common) {
            e.add(tera_error("Error cloning common root", &terr));
            return None;
        }
        for (i, ti) in self.templates.iter().enumerate() {
            if ti.name.is_empty() {
                e.add(format!("Templates[{}] has no Name", i));
                continue;
            }
            if ti.path.is_empty() {
                e.add(format!("Templates[{}] has no Path", i));
            } else if let Err(terr) =
                root.add_raw_template(&ti.path_id(), &ti.path)
            {
                e.add(tera_error(
                    &format!(
                        "Error compiling path template {} ({})",
                        ti.name, ti.path
                    ),
                    &terr,
                ));
            }
            match (&ti.id, &ti.contents) {
                (Some(id), _) => {
                    if !root.get_template_names().any(|n| n == id) {
                        e.add(format!(
                            "Templates[{}]: No common template for {}",
                            i, id
                        ));
                    }
                }
                (None, Some(contents)) => {
                    if let Err(terr) = root.add_raw_template(&ti.name, contents)
                    {
                        e.add(tera_error(
                            &format!("Error compiling template {}", ti.name),
                            &terr,
                        ));
                    }
                }
                (None, None) => {
                    e.add(format!(
                        "Templates[{}] has both an empty ID and contents",
                        i
                    ));
                }
            }
        }
        if !self.boot_params.is_empty() {
            if let Err(terr) =
                root.add_raw_template("bootparams", &self.boot_params)
            {
                e.add(tera_error(
                    "Error compiling boot parameter template",
                    &terr,
                ));
            }
        }
        if e.has_errors() {
            None
        } else {
            Some(Arc::new(root))
        }
    }

    /// Renders every template entry for `machine` (or for the unknown-boot
    /// case when `machine` is `None`), producing the lazily-evaluated
    /// artifact set.  Problems are recorded on `e`.
    pub fn render(
        &self,
        dt: &DataTracker,
        d: &Stores<'_>,
        machine: Option<&Machine>,
        e: &mut Error,
    ) -> Renderers {
        if !self.required_params.is_empty() && machine.is_none() {
            e.add("Machine is nil or does not have params");
            return Renderers::default();
        }
        let engine = match &self.engine {
            Some(t) => Arc::clone(t),
            // Not compiled yet (freshly deserialized); build one now.
            None => match self.gen_root(&dt.common_root(), e) {
                Some(t) => t,
                None => return Renderers::default(),
            },
        };
        let rd = RenderData { dt, machine, env: self };
        let missing: Vec<&String> = self
            .required_params
            .iter()
            .filter(|p| !rd.param_exists(d, p))
            .collect();
        if !missing.is_empty() {
            let name = machine.map(|m| m.name.as_str()).unwrap_or("unknown");
            e.add(format!(
                "missing required machine params for {}: {:?}",
                name, missing
            ));
        }
        let mut ctx = rd.context(d);
        if !self.boot_params.is_empty() {
            match engine.render("bootparams", &ctx) {
                Ok(s) => ctx.insert("boot_params", &s),
                Err(terr) => {
                    e.add(tera_error("Error rendering boot params", &terr));
                    ctx.insert("boot_params", "");
                }
            }
        } else {
            ctx.insert("boot_params", "");
        }
        let mut rts = Vec::with_capacity(self.templates.len());
        for ti in &self.templates {
            let raw = match engine.render(&ti.path_id(), &ctx) {
                Ok(raw) => raw,
                Err(terr) => {
                    e.add(tera_error(
                        &format!(
                            "Error rendering template {} path {}",
                            ti.name, ti.path
                        ),
                        &terr,
                    ));
                    continue;
                }
            };
            let path = clean_path(&format!("/{}", raw));
            rts.push(Arc::new(Renderer::new(
                path,
                ti.template_id().to_string(),
                Arc::clone(&engine),
                ctx.clone(),
            )));
        }
        Renderers(rts)
    }

    /// Makes sure the ISO this environment serves from has been exploded
    /// under the file root, hashing it and invoking the external
    /// `explode_iso.sh` helper when the canary says it has not been.
    fn explode_iso(&mut self, dt: &DataTracker, e: &mut Error) {
        let canary_name = format!(".{}.rebar_canary", self.os.name);
        let canary_path = self.local_path_for(dt, &canary_name);
        if let Ok(buf) = std::fs::read_to_string(&canary_path) {
            if !buf.trim().is_empty() && buf.trim() == self.os.iso_sha256 {
                return;
            }
        }

        let iso_path = dt.file_root.join("isos").join(&self.os.iso_file);
        match std::fs::File::open(&iso_path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                e.add(format!("Explode ISO: iso doesn't exist: {}", iso_path));
                if !self.os.iso_url.is_empty() {
                    e.add(format!(
                        "You can download the required ISO from {}",
                        self.os.iso_url
                    ));
                }
                return;
            }
            Err(err) => {
                e.add(format!(
                    "Explode ISO: failed to open iso file {}: {}",
                    iso_path, err
                ));
                return;
            }
            Ok(mut f) => {
                let mut hasher = Sha256::new();
                if let Err(err) = io::copy(&mut f, &mut hasher) {
                    e.add(format!(
                        "Explode ISO: failed to read iso file {}: {}",
                        iso_path, err
                    ));
                    return;
                }
                let hash = hex::encode(hasher.finalize());
                if self.os.iso_sha256.is_empty() {
                    // Adopted; it will be persisted along with the rest of
                    // this save.
                    self.os.iso_sha256 = hash.clone();
                }
                if hash != self.os.iso_sha256 {
                    e.add(format!(
                        "Explode ISO: SHA256 bad. actual: {} expected: {}",
                        hash, self.os.iso_sha256
                    ));
                    return;
                }
            }
        }

        let dest = self.local_path_for(dt, "");
        let cmd = dt.file_root.join("explode_iso.sh");
        let out = Command::new(cmd.as_std_path())
            .arg(&self.os.name)
            .arg(dt.file_root.as_str())
            .arg(iso_path.as_str())
            .arg(dest.as_str())
            .arg(&self.os.iso_sha256)
            .output();
        match out {
            Ok(out) if out.status.success() => {
                if let Err(err) = std::fs::create_dir_all(&dest)
                    .and_then(|_| std::fs::write(&canary_path, &self.os.iso_sha256))
                {
                    e.add(format!(
                        "Explode ISO: failed to write canary {}: {}",
                        canary_path, err
                    ));
                }
            }
            Ok(out) => {
                e.add(format!(
                    "Explode ISO: explode_iso.sh failed for {}: {}",
                    self.name, out.status
                ));
                e.add(format!(
                    "Command output:\n{}",
                    String::from_utf8_lossy(&out.stdout)
                ));
            }
            Err(err) => {
                e.add(format!(
                    "Explode ISO: explode_iso.sh failed for {}: {}",
                    self.name, err
                ));
            }
        }
    }
}

pub fn as_bootenv(e: &dyn Entity) -> &BootEnv {
    e.as_any().downcast_ref::<BootEnv>().expect("bootenvs entry was not a BootEnv")
}

impl Entity for BootEnv {
    fn prefix(&self) -> &'static str {
        BOOTENVS
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
                    |i, j| as_bootenv(i).name < as_bootenv(j).name,
                    |r| {
                        let gte = as_bootenv(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_bootenv(s).name >= gte),
                            Box::new(move |s| as_bootenv(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(BootEnv::new(s)) as Box<dyn Entity>),
                ),
            ),
            (
                "Available",
                Maker::new(
                    false,
                    "boolean",
                    |i, j| !as_bootenv(i).available && as_bootenv(j).available,
                    |r| {
                        let at = as_bootenv(r).available;
                        (
                            Box::new(move |s: &dyn Entity| {
                                as_bootenv(s).available >= at
                            }),
                            Box::new(move |s: &dyn Entity| {
                                as_bootenv(s).available && !at
                            }),
                        )
                    },
                    |s| {
                        let mut env = BootEnv::new("");
                        env.available = s == "true";
                        Ok(Box::new(env) as Box<dyn Entity>)
                    },
                ),
            ),
            (
                "OnlyUnknown",
                Maker::new(
                    false,
                    "boolean",
                    |i, j| {
                        !as_bootenv(i).only_unknown && as_bootenv(j).only_unknown
                    },
                    |r| {
                        let at = as_bootenv(r).only_unknown;
                        (
                            Box::new(move |s: &dyn Entity| {
                                as_bootenv(s).only_unknown >= at
                            }),
                            Box::new(move |s: &dyn Entity| {
                                as_bootenv(s).only_unknown && !at
                            }),
                        )
                    },
                    |s| {
                        let mut env = BootEnv::new("");
                        env.only_unknown = s == "true";
                        Ok(Box::new(env) as Box<dyn Entity>)
                    },
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode bootenv {}: {}", self.name, e)))
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
        let mut e = Error::validation(BOOTENVS, &self.name);
        if self.name.is_empty() {
            e.add("BootEnv must have a name");
        }
        if let Err(dup) = check_unique(self, &d.get(BOOTENVS).items()) {
            e.merge(dup);
        }
        let tasks = d.get(TASKS);
        for (i, tname) in self.tasks.iter().enumerate() {
            if !tasks.contains(tname) {
                e.add(format!("Task {} (at {}) does not exist", tname, i));
            }
        }
        e.or_ok(())
    }

    fn before_save(
        &mut self,
        dt: &DataTracker,
        _d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        // If the basic templates do not parse, it is game over for this
        // save.
        let mut e = Error::validation(BOOTENVS, &self.name);
        let root = self.gen_root(&dt.common_root(), &mut e);
        let Some(root) = root else {
            return Err(e);
        };
        self.engine = Some(root);

        // Everything below records problems without blocking the save; the
        // environment just becomes unavailable.
        let seen = |want: &str| self.templates.iter().any(|ti| ti.name == want);
        if !seen("ipxe") && !(seen("pxelinux") && seen("elilo")) {
            e.add("Missing elilo or pxelinux template");
        }
        if !self.os.iso_file.is_empty() {
            self.explode_iso(dt, &mut e);
        }
        if !self.kernel.is_empty() {
            let k_path = self.local_path_for(dt, &self.kernel);
            match std::fs::metadata(&k_path) {
                Err(_) => e.add(format!(
                    "bootenv: {}: missing kernel {} ({})",
                    self.name, self.kernel, k_path
                )),
                Ok(md) if !md.is_file() => e.add(format!(
                    "bootenv: {}: invalid kernel {} ({})",
                    self.name, self.kernel, k_path
                )),
                Ok(_) => {}
            }
        }
        for initrd in &self.initrds {
            let i_path = self.local_path_for(dt, initrd);
            match std::fs::metadata(&i_path) {
                Err(_) => e.add(format!(
                    "bootenv: {}: missing initrd {} ({})",
                    self.name, initrd, i_path
                )),
                Ok(md) if !md.is_file() => e.add(format!(
                    "bootenv: {}: invalid initrd {} ({})",
                    self.name, initrd, i_path
                )),
                Ok(_) => {}
            }
        }
        self.errors = e.messages.clone();
        self.available = self.errors.is_empty();
        Ok(())
    }

    fn after_save(&mut self, dt: &DataTracker, d: &mut Stores<'_>) {
        if self.only_unknown {
            let mut e = Error::validation(BOOTENVS, &self.name);
            let rts = self.render(dt, d, None, &mut e);
            if e.has_errors() {
                self.errors = e.messages.clone();
                d.get_mut(BOOTENVS).insert(Arc::from(self.clone_entity()));
            } else {
                rts.register(&dt.fs);
            }
            return;
        }
        // Re-render everything currently booting this environment.
        let machines = d.get(MACHINES).items();
        for m in machines {
            let machine = as_machine(&*m);
            if machine.boot_env != self.name {
                continue;
            }
            let mut e = Error::validation(BOOTENVS, &self.name);
            let rts = self.render(dt, d, Some(machine), &mut e);
            if e.has_errors() {
                warn!(dt.log(), "machine render failed after bootenv save";
                    "bootenv" => &self.name,
                    "machine" => &machine.name,
                    "error" => %e);
                let mut updated = machine.clone();
                updated.errors = e.messages.clone();
                d.get_mut(MACHINES).insert(Arc::new(updated));
            } else {
                rts.register(&dt.fs);
            }
        }
    }

    fn before_delete(
        &self,
        dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::still_in_use(BOOTENVS, &self.name);
        if self.only_unknown {
            if dt.unknown_boot_env() == self.name {
                e.add(format!(
                    "BootEnv {} is the active unknownBootEnv, cannot remove it",
                    self.name
                ));
            }
        } else {
            if dt.default_boot_env() == self.name {
                e.add(format!(
                    "BootEnv {} is the active defaultBootEnv, cannot remove it",
                    self.name
                ));
            }
            for m in d.get(MACHINES).items() {
                let machine = as_machine(&*m);
                if machine.boot_env == self.name {
                    e.add(format!(
                        "Bootenv {} in use by Machine {}",
                        self.name, machine.name
                    ));
                }
            }
        }
        e.or_ok(())
    }

    fn after_delete(&self, dt: &DataTracker, d: &mut Stores<'_>) {
        if self.only_unknown {
            let mut e = Error::validation(BOOTENVS, &self.name);
            let rts = self.render(dt, d, None, &mut e);
            if !e.has_errors() {
                rts.deregister(&dt.fs);
            }
        }
    }
}
