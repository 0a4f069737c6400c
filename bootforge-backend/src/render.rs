// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Template rendering for boot environments.
//!
//! Each boot environment compiles its template entries into a `tera` engine
//! seeded from the tracker-wide common root (every `Template` entity,
//! registered by id).  Rendering a machine against an environment produces a
//! set of [`Renderer`]s: one lazy (path, body) artifact per template entry.
//! Template execution is strict; an unresolved variable is a reported error,
//! never empty output.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bootforge_common::{hexaddr, Error};
use serde_json::json;
use tera::Tera;

use crate::fs::FileSystem;
use crate::model::{BootEnv, Machine};
use crate::tracker::{DataTracker, Stores};

/// Lexically normalizes a rendered path: collapses repeated separators and
/// resolves `.` and `..` segments without touching the filesystem.
pub(crate) fn clean_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Flattens a tera error chain into one message.
pub(crate) fn tera_error(context: &str, err: &tera::Error) -> String {
    let mut msg = format!("{}: {}", context, err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    msg
}

/// A lazily-rendered artifact registered in the virtual filesystem.
pub struct Renderer {
    /// Absolute path this artifact is served at.
    pub path: String,
    template: String,
    engine: Arc<Tera>,
    context: tera::Context,
}

impl Renderer {
    pub(crate) fn new(
        path: String,
        template: String,
        engine: Arc<Tera>,
        context: tera::Context,
    ) -> Renderer {
        Renderer { path, template, engine, context }
    }

    pub fn render(&self) -> Result<String, Error> {
        self.engine.render(&self.template, &self.context).map_err(|e| {
            let mut err = Error::new(bootforge_common::ErrorKind::Render);
            err.add(tera_error(
                &format!("rendering {} for {}", self.template, self.path),
                &e,
            ));
            err
        })
    }
}

/// The rendered-artifact set produced by one (environment, machine) pair.
#[derive(Default)]
pub struct Renderers(pub Vec<Arc<Renderer>>);

impl Renderers {
    pub fn register(&self, fs: &FileSystem) {
        for r in &self.0 {
            fs.register(Arc::clone(r));
        }
    }

    pub fn deregister(&self, fs: &FileSystem) {
        for r in &self.0 {
            fs.deregister(&r.path);
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.0.iter().map(|r| r.path.clone()).collect()
    }
}

/// The data a template sees while rendering.
pub(crate) struct RenderData<'a> {
    pub dt: &'a DataTracker,
    pub machine: Option<&'a Machine>,
    pub env: &'a BootEnv,
}

impl RenderData<'_> {
    pub fn param_exists(&self, d: &Stores<'_>, key: &str) -> bool {
        match self.machine {
            Some(m) => m.get_param(self.dt, d, key, true).is_some(),
            None => false,
        }
    }

    /// Builds the base template context.  The environment's rendered boot
    /// parameters are added by the caller once this context exists, since
    /// they are themselves a template over it.
    pub fn context(&self, d: &Stores<'_>) -> tera::Context {
        let mut ctx = tera::Context::new();
        if let Some(m) = self.machine {
            let address = m
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string());
            let hex_address =
                m.address.map(hexaddr).unwrap_or_else(|| "00000000".to_string());
            ctx.insert(
                "machine",
                &json!({
                    "name": m.name,
                    "short_name": m.short_name(),
                    "uuid": m.uuid.to_string(),
                    "address": address,
                    "hex_address": hex_address,
                    "boot_env": m.boot_env,
                    "params": m.resolved_params(self.dt, d),
                }),
            );
        }
        ctx.insert(
            "env",
            &json!({
                "name": self.env.name,
                "os": self.env.os,
                "path_prefix": self.env.path_prefix(),
                "install": self.env.is_install(),
                "kernel": self.env.kernel,
                "initrds": self.env.initrds,
            }),
        );
        ctx.insert("provisioner_url", &self.dt.file_url());
        ctx.insert("api_url", &self.dt.api_url());
        ctx
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a//b/./c"), "/a/b/c");
        assert_eq!(clean_path("a/b"), "/a/b");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/../../x"), "/x");
        assert_eq!(clean_path(""), "/");
    }
}

