// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual filesystem of rendered boot artifacts.
//!
//! TFTP and HTTP file servers consult this registry before falling back to
//! the on-disk file root.  Each entry maps an absolute path to a lazy
//! renderer owned by some (boot environment, machine) pair; bodies are
//! rendered at read time so a config file always reflects the state of its
//! owner at the owner's last save.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bootforge_common::Error;

use crate::render::Renderer;

#[derive(Default)]
pub struct FileSystem {
    files: Mutex<HashMap<String, Arc<Renderer>>>,
}

impl FileSystem {
    pub fn new() -> FileSystem {
        FileSystem::default()
    }

    pub fn register(&self, r: Arc<Renderer>) {
        let mut files = self.files.lock().unwrap();
        files.insert(r.path.clone(), r);
    }

    pub fn deregister(&self, path: &str) {
        let mut files = self.files.lock().unwrap();
        files.remove(path);
    }

    /// Renders the artifact registered at `path`, if any.
    pub fn read(&self, path: &str) -> Option<Result<String, Error>> {
        let r = {
            let files = self.files.lock().unwrap();
            files.get(path).cloned()
        };
        // Render outside the registry lock; template execution can be slow.
        r.map(|r| r.render())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut res: Vec<String> =
            self.files.lock().unwrap().keys().cloned().collect();
        res.sort();
        res
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().unwrap().is_empty()
    }
}
