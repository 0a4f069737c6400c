// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The data tracker: lock ordering, the entity lifecycle, and the lease
//! algorithm the DHCP engine drives.
//!
//! Locking discipline: [`DataTracker::lock_ents`] takes every requested
//! prefix mutex in one canonical (lexical) order and hands back a
//! [`Stores`] scope.  Nothing else in the system takes a second prefix lock
//! once a scope exists, so two concurrent callers always acquire prefixes
//! along the same global order and cannot deadlock.  Dropping the scope
//! releases every guard, unwinding included.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use bootforge_common::{hexaddr, Error};
use camino::Utf8PathBuf;
use chrono::{Duration, Utc};
use serde_json::Value;
use slog::{info, o, warn, Logger};
use tera::Tera;

use crate::fs::FileSystem;
use crate::model::{
    as_bootenv, as_lease, as_reservation, as_subnet, as_template, unmarshal,
    Entity, Lease, Pref, Reservation, Subnet,
};
use crate::model::{
    ALL_PREFIXES, BOOTENVS, LEASES, MACHINES, PREFERENCES, RESERVATIONS,
    SUBNETS, TEMPLATES,
};
use crate::persist::PersistentStore;
use crate::publish::{Event, Publishers};
use crate::store::Store;

/// Lease duration handed out when no subnet covers the address.
const DEFAULT_LEASE_SECS: i64 = 7200;

/// A lock scope over some set of prefixes.  All reads and mutations inside
/// one request happen through one of these; dropping it releases the locks.
pub struct Stores<'a> {
    guards: Vec<(&'static str, MutexGuard<'a, Store>)>,
}

impl Stores<'_> {
    /// The store for `prefix`.  Panics if `prefix` was not part of this
    /// lock scope; that is a caller bug, not a runtime condition.
    pub fn get(&self, prefix: &str) -> &Store {
        for (p, g) in &self.guards {
            if *p == prefix {
                return g;
            }
        }
        panic!("prefix {:?} is not locked in this scope", prefix);
    }

    pub(crate) fn get_mut(&mut self, prefix: &str) -> &mut Store {
        for (p, g) in &mut self.guards {
            if *p == prefix {
                return g;
            }
        }
        panic!("prefix {:?} is not locked in this scope", prefix);
    }

    pub fn has(&self, prefix: &str) -> bool {
        self.guards.iter().any(|(p, _)| *p == prefix)
    }
}

pub struct DataTracker {
    backend: Box<dyn PersistentStore>,
    stores: BTreeMap<&'static str, Mutex<Store>>,
    /// Root of the static file tree (exploded ISOs, helper scripts).
    pub file_root: Utf8PathBuf,
    /// The address we advertise to booting machines.
    pub our_address: Ipv4Addr,
    /// Port of the static file server.
    pub static_port: u16,
    /// Port of the API server.
    pub api_port: u16,
    /// Name of the profile consulted last for every machine.
    pub global_profile_name: String,
    /// The virtual filesystem rendered artifacts are registered in.
    pub fs: FileSystem,
    pub publishers: Publishers,
    prefs: Mutex<BTreeMap<String, String>>,
    common: Mutex<Arc<Tera>>,
    log: Logger,
}

impl DataTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Box<dyn PersistentStore>,
        file_root: Utf8PathBuf,
        our_address: Ipv4Addr,
        static_port: u16,
        api_port: u16,
        log: Logger,
        defaults: BTreeMap<String, String>,
        publishers: Publishers,
    ) -> Result<DataTracker, Error> {
        let stores = ALL_PREFIXES
            .iter()
            .map(|p| (*p, Mutex::new(Store::new(p))))
            .collect();
        let global_profile_name = defaults
            .get("globalProfileName")
            .cloned()
            .unwrap_or_else(|| "global".to_string());
        let dt = DataTracker {
            backend,
            stores,
            file_root,
            our_address,
            static_port,
            api_port,
            global_profile_name,
            fs: FileSystem::new(),
            publishers,
            prefs: Mutex::new(BTreeMap::new()),
            common: Mutex::new(Arc::new(Tera::default())),
            log: log.new(o!("component" => "tracker")),
        };
        let mut d = dt.lock_ents(ALL_PREFIXES);
        dt.load_all(&mut d)?;
        dt.seed_prefs(&mut d, defaults)?;
        dt.rebuild_common_root(&mut d);
        dt.register_initial_renders(&mut d);
        drop(d);
        Ok(dt)
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// URL of the static file server machines fetch kernels and rendered
    /// files from.
    pub fn file_url(&self) -> String {
        format!("http://{}:{}", self.our_address, self.static_port)
    }

    pub fn api_url(&self) -> String {
        format!("https://{}:{}", self.our_address, self.api_port)
    }

    /// The current common template root.
    pub fn common_root(&self) -> Arc<Tera> {
        Arc::clone(&self.common.lock().unwrap())
    }

    /// Acquires write locks on `prefixes` in canonical order and returns
    /// the scoped view.  Never call this while already holding a scope.
    pub fn lock_ents(&self, prefixes: &[&'static str]) -> Stores<'_> {
        let mut wanted: Vec<&'static str> = prefixes.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        let guards = wanted
            .into_iter()
            .map(|p| {
                let m = self
                    .stores
                    .get(p)
                    .unwrap_or_else(|| panic!("unknown prefix {:?}", p));
                (p, m.lock().unwrap())
            })
            .collect();
        Stores { guards }
    }

    fn load_all(&self, d: &mut Stores<'_>) -> Result<(), Error> {
        for prefix in ALL_PREFIXES {
            for key in self.backend.keys(prefix)? {
                let Some(bytes) = self.backend.load(prefix, &key)? else {
                    continue;
                };
                let obj = unmarshal(prefix, &bytes)?;
                d.get_mut(prefix).insert(Arc::from(obj));
            }
            info!(self.log, "loaded prefix";
                "prefix" => *prefix,
                "count" => d.get(prefix).len());
        }
        Ok(())
    }

    fn seed_prefs(
        &self,
        d: &mut Stores<'_>,
        defaults: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        // Bootstrap defaults skip validation: they may name boot
        // environments that will only be created later.
        for (name, val) in defaults {
            if d.get(PREFERENCES).contains(&name) {
                continue;
            }
            let p = Pref::new(&name, &val);
            self.backend.save(PREFERENCES, &name, &p.marshal()?)?;
            d.get_mut(PREFERENCES).insert(Arc::new(p));
        }
        let mut cache = self.prefs.lock().unwrap();
        for p in d.get(PREFERENCES).items() {
            let p = crate::model::as_pref(&*p);
            cache.insert(p.name.clone(), p.val.clone());
        }
        Ok(())
    }

    /// Reads a global preference from the read-mostly cache.
    pub fn pref(&self, name: &str) -> Option<String> {
        self.prefs.lock().unwrap().get(name).cloned()
    }

    pub fn default_boot_env(&self) -> String {
        self.pref("defaultBootEnv").unwrap_or_default()
    }

    pub fn unknown_boot_env(&self) -> String {
        self.pref("unknownBootEnv").unwrap_or_default()
    }

    /// Validates and persists a preference change.  Needs `preferences`
    /// and `bootenvs` locked.
    pub fn set_pref(
        &self,
        d: &mut Stores<'_>,
        name: &str,
        val: &str,
    ) -> Result<(), Error> {
        self.save(d, Box::new(Pref::new(name, val)))?;
        self.prefs
            .lock()
            .unwrap()
            .insert(name.to_string(), val.to_string());
        Ok(())
    }

    /// Recompiles the common template root from the Template entities and
    /// re-derives every boot environment's tree and availability from it.
    /// Needs `templates` and `bootenvs` locked.
    pub fn rebuild_common_root(&self, d: &mut Stores<'_>) {
        let mut root = Tera::default();
        for t in d.get(TEMPLATES).items() {
            let t = as_template(&*t);
            if let Err(terr) = root.add_raw_template(&t.id, &t.contents) {
                // Template validation rejects uncompilable bodies, so this
                // only fires for damaged persisted data.
                warn!(self.log, "stored template does not compile";
                    "template" => &t.id,
                    "error" => %terr);
            }
        }
        let root = Arc::new(root);
        *self.common.lock().unwrap() = Arc::clone(&root);

        let envs = d.get(BOOTENVS).items();
        for env_arc in envs {
            let mut env = as_bootenv(&*env_arc).clone();
            let mut e = Error::validation(BOOTENVS, &env.name);
            env.engine = env.gen_root(&root, &mut e);
            env.errors = e.messages.clone();
            env.available = env.errors.is_empty();
            d.get_mut(BOOTENVS).insert(Arc::new(env));
        }
    }

    fn register_initial_renders(&self, d: &mut Stores<'_>) {
        let envs = d.get(BOOTENVS).items();
        for env_arc in envs {
            let env = as_bootenv(&*env_arc);
            if env.only_unknown && env.available {
                let mut e = Error::validation(BOOTENVS, &env.name);
                let rts = env.render(self, d, None, &mut e);
                if e.has_errors() {
                    warn!(self.log, "unknown-machine render failed at startup";
                        "bootenv" => &env.name, "error" => %e);
                } else {
                    rts.register(&self.fs);
                }
            }
        }
        let machines = d.get(MACHINES).items();
        for m in machines {
            let machine = crate::model::as_machine(&*m);
            let Some(env_arc) = d.get(BOOTENVS).find(&machine.boot_env) else {
                continue;
            };
            let env = as_bootenv(&*env_arc);
            if !env.available {
                continue;
            }
            let mut e = Error::validation(MACHINES, &machine.key());
            let rts = env.render(self, d, Some(machine), &mut e);
            if e.has_errors() {
                warn!(self.log, "machine render failed at startup";
                    "machine" => &machine.name, "error" => %e);
            } else {
                rts.register(&self.fs);
            }
        }
    }

    fn publish_event(&self, action: &str, obj: &dyn Entity) {
        let object = obj
            .marshal()
            .ok()
            .and_then(|b| serde_json::from_slice::<Value>(&b).ok())
            .unwrap_or(Value::Null);
        self.publishers.publish(Event {
            action: action.to_string(),
            prefix: obj.prefix().to_string(),
            key: obj.key(),
            object,
        });
    }

    /// Creates a new entity: `on_create` → `validate` → `before_save` →
    /// persist → `after_save`.  A failure anywhere leaves nothing visible.
    pub fn create(
        &self,
        d: &mut Stores<'_>,
        mut obj: Box<dyn Entity>,
    ) -> Result<Arc<dyn Entity>, Error> {
        let prefix = obj.prefix();
        if d.get(prefix).contains(&obj.key()) {
            let mut e = Error::validation(prefix, &obj.key());
            e.add(format!("{}/{} already exists", prefix, obj.key()));
            return Err(e);
        }
        obj.on_create(self, d)?;
        obj.validate(self, d)?;
        obj.before_save(self, d)?;
        self.commit(d, obj, "create")
    }

    /// Saves an entity, driving the update lifecycle when a previous
    /// version exists: `on_change(old)` → `validate` → `before_save` →
    /// persist → `after_save`.
    pub fn save(
        &self,
        d: &mut Stores<'_>,
        mut obj: Box<dyn Entity>,
    ) -> Result<Arc<dyn Entity>, Error> {
        let prefix = obj.prefix();
        let old = d.get(prefix).find(&obj.key());
        if let Some(old) = old {
            obj.on_change(self, d, &*old)?;
        }
        obj.validate(self, d)?;
        obj.before_save(self, d)?;
        self.commit(d, obj, "save")
    }

    fn commit(
        &self,
        d: &mut Stores<'_>,
        obj: Box<dyn Entity>,
        action: &str,
    ) -> Result<Arc<dyn Entity>, Error> {
        let prefix = obj.prefix();
        let key = obj.key();
        self.backend.save(prefix, &key, &obj.marshal()?)?;
        let arc: Arc<dyn Entity> = Arc::from(obj);
        d.get_mut(prefix).insert(Arc::clone(&arc));
        self.publish_event(action, &*arc);
        let mut follow_up = arc.clone_entity();
        follow_up.after_save(self, d);
        Ok(arc)
    }

    /// Deletes an entity: `before_delete` → remove from the store →
    /// persist the removal → `after_delete`.
    pub fn remove(
        &self,
        d: &mut Stores<'_>,
        prefix: &str,
        key: &str,
    ) -> Result<Arc<dyn Entity>, Error> {
        let Some(obj) = d.get(prefix).find(key) else {
            let mut e = Error::validation(prefix, key);
            e.code = 404;
            e.add(format!("{}/{} not found", prefix, key));
            return Err(e);
        };
        obj.before_delete(self, d)?;
        d.get_mut(prefix).remove(key);
        if let Err(err) = self.backend.remove(prefix, key) {
            // The removal never happened; put the entry back.
            d.get_mut(prefix).insert(Arc::clone(&obj));
            return Err(err);
        }
        obj.after_delete(self, d);
        self.publish_event("delete", &*obj);
        Ok(obj)
    }

    /// Applies a core lease state transition (expire, invalidate) directly.
    ///
    /// These transitions clear fields the update lifecycle treats as
    /// immutable, so they persist without driving the hooks.  Needs
    /// `leases` locked.
    pub fn update_lease_in_place(
        &self,
        d: &mut Stores<'_>,
        key: &str,
        f: impl FnOnce(&mut Lease),
    ) -> Result<Lease, Error> {
        let Some(arc) = d.get(LEASES).find(key) else {
            let mut e = Error::validation(LEASES, key);
            e.code = 404;
            e.add(format!("{}/{} not found", LEASES, key));
            return Err(e);
        };
        let mut lease = as_lease(&*arc).clone();
        f(&mut lease);
        self.backend.save(LEASES, key, &lease.marshal()?)?;
        d.get_mut(LEASES).insert(Arc::new(lease.clone()));
        self.publish_event("save", &lease);
        Ok(lease)
    }

    fn subnet_for(&self, d: &Stores<'_>, addr: Ipv4Addr) -> Option<Subnet> {
        d.get(SUBNETS)
            .items()
            .into_iter()
            .map(|s| as_subnet(&*s).clone())
            .find(|s| s.contains(addr))
    }

    fn reservation_for(
        &self,
        d: &Stores<'_>,
        addr: Ipv4Addr,
    ) -> Option<Reservation> {
        d.get(RESERVATIONS)
            .find(&hexaddr(addr))
            .map(|r| as_reservation(&*r).clone())
    }

    fn lease_span(&self, subnet: Option<&Subnet>, addr: Ipv4Addr) -> Duration {
        match subnet {
            Some(s) => {
                Duration::from_std(s.lease_time_for(addr))
                    .unwrap_or_else(|_| Duration::seconds(DEFAULT_LEASE_SECS))
            }
            None => Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    /// Finds the lease for `req` on behalf of (`strategy`, `token`),
    /// refreshing its expiry.  Returns `Ok(None)` when no usable lease
    /// exists, and a conflict error when someone else holds the address.
    /// Needs `leases`, `reservations`, and `subnets` locked.
    pub fn find_lease(
        &self,
        d: &mut Stores<'_>,
        strategy: &str,
        token: &str,
        req: Ipv4Addr,
    ) -> Result<Option<(Lease, Option<Subnet>, Option<Reservation>)>, Error>
    {
        let Some(found) = d.get(LEASES).find(&hexaddr(req)) else {
            return Ok(None);
        };
        let found = as_lease(&*found).clone();
        if !found.matches(strategy, token) && !found.expired() {
            return Err(Error::conflict(format!(
                "Lease {} already held by {}:{}",
                found.addr, found.strategy, found.token
            )));
        }
        let subnet = self.subnet_for(d, req);
        let reservation = self.reservation_for(d, req);
        if subnet.is_none() && reservation.is_none() {
            let mut e = Error::validation(LEASES, &found.key());
            e.add(format!(
                "Lease {} has no reservation or subnet backing it",
                found.addr
            ));
            return Err(e);
        }
        let span = self.lease_span(subnet.as_ref(), req);
        if found.matches(strategy, token) {
            let mut lease = found;
            lease.expire_time = Utc::now() + span;
            self.save(d, Box::new(lease.clone()))?;
            return Ok(Some((lease, subnet, reservation)));
        }
        // The previous holder is gone; take the lease over for this
        // client.  Token and strategy are immutable on a live lease, so
        // this is a replace, not an update.
        self.remove(d, LEASES, &found.key())?;
        let lease = Lease::new(req, strategy, token, Utc::now() + span);
        self.create(d, Box::new(lease.clone()))?;
        Ok(Some((lease, subnet, reservation)))
    }

    /// The Discover path: finds or allocates a lease for
    /// (`strategy`, `token`), preferring (in order) an existing lease, a
    /// reservation, the requested address, and finally the next free
    /// address in a subnet reachable via one of `via`.  Returns `None`
    /// when no address can be offered.  Needs `leases`, `reservations`,
    /// and `subnets` locked.
    pub fn find_or_create_lease(
        &self,
        d: &mut Stores<'_>,
        strategy: &str,
        token: &str,
        req: Ipv4Addr,
        via: &[Ipv4Addr],
    ) -> Option<(Lease, Option<Subnet>, Option<Reservation>)> {
        // 1. This client already holds a lease; refresh it.
        let held = d
            .get(LEASES)
            .items()
            .into_iter()
            .map(|l| as_lease(&*l).clone())
            .find(|l| l.matches(strategy, token));
        if let Some(mut lease) = held {
            let subnet = self.subnet_for(d, lease.addr);
            let reservation = self.reservation_for(d, lease.addr);
            lease.expire_time =
                Utc::now() + self.lease_span(subnet.as_ref(), lease.addr);
            match self.save(d, Box::new(lease.clone())) {
                Ok(_) => return Some((lease, subnet, reservation)),
                Err(e) => {
                    warn!(self.log, "lease refresh failed";
                        "lease" => lease.key(), "error" => %e);
                    return None;
                }
            }
        }

        // 2. A reservation pins this client to an address.
        let reserved = d
            .get(RESERVATIONS)
            .items()
            .into_iter()
            .map(|r| as_reservation(&*r).clone())
            .find(|r| r.matches(strategy, token));
        if let Some(reservation) = reserved {
            let addr = reservation.addr;
            let stale = d.get(LEASES).find(&hexaddr(addr));
            if let Some(stale) = stale {
                let stale = as_lease(&*stale).clone();
                if !stale.expired() {
                    warn!(self.log, "reserved address held by another lease";
                        "addr" => %addr,
                        "holder" => format!("{}:{}", stale.strategy, stale.token));
                    return None;
                }
                if let Err(e) = self.remove(d, LEASES, &stale.key()) {
                    warn!(self.log, "stale lease removal failed";
                        "lease" => stale.key(), "error" => %e);
                    return None;
                }
            }
            let subnet = self.subnet_for(d, addr);
            let span = self.lease_span(subnet.as_ref(), addr);
            let lease = Lease::new(addr, strategy, token, Utc::now() + span);
            match self.create(d, Box::new(lease.clone())) {
                Ok(_) => return Some((lease, subnet, Some(reservation))),
                Err(e) => {
                    warn!(self.log, "reserved lease creation failed";
                        "lease" => lease.key(), "error" => %e);
                    return None;
                }
            }
        }

        // 3. Dynamic allocation from a subnet reachable via one of the
        // addresses the packet arrived through, in via order and then by
        // subnet name.
        for via_addr in via {
            if via_addr.is_unspecified() {
                continue;
            }
            let candidates: Vec<Subnet> = d
                .get(SUBNETS)
                .items()
                .into_iter()
                .map(|s| as_subnet(&*s).clone())
                .filter(|s| {
                    s.strategy == strategy
                        && !s.only_reservations
                        && s.contains(*via_addr)
                })
                .collect();
            for subnet in candidates {
                let Some(addr) = self.pick_free_addr(d, &subnet, req) else {
                    continue;
                };
                let stale = d.get(LEASES).find(&hexaddr(addr));
                if let Some(stale) = stale {
                    let stale_key = stale.key();
                    if let Err(e) = self.remove(d, LEASES, &stale_key) {
                        warn!(self.log, "stale lease removal failed";
                            "lease" => stale_key, "error" => %e);
                        continue;
                    }
                }
                let span = self.lease_span(Some(&subnet), addr);
                let lease = Lease::new(addr, strategy, token, Utc::now() + span);
                match self.create(d, Box::new(lease.clone())) {
                    Ok(_) => return Some((lease, Some(subnet), None)),
                    Err(e) => {
                        warn!(self.log, "lease creation failed";
                            "lease" => lease.key(), "error" => %e);
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Picks an address to offer from `subnet`'s active range: the
    /// requested address when it is free, else the longest-expired leased
    /// address, else the first never-leased address.
    fn pick_free_addr(
        &self,
        d: &Stores<'_>,
        subnet: &Subnet,
        req: Ipv4Addr,
    ) -> Option<Ipv4Addr> {
        let leases: Vec<Lease> = d
            .get(LEASES)
            .items()
            .into_iter()
            .map(|l| as_lease(&*l).clone())
            .filter(|l| subnet.in_active_range(l.addr))
            .collect();
        let lease_at =
            |addr: Ipv4Addr| leases.iter().find(|l| l.addr == addr);

        if !req.is_unspecified() && subnet.in_active_range(req) {
            match lease_at(req) {
                None => return Some(req),
                Some(l) if l.expired() => return Some(req),
                Some(_) => {}
            }
        }

        // Expired leases first, longest-expired first so reuse rotates
        // through the range deterministically.
        let mut expired: Vec<&Lease> =
            leases.iter().filter(|l| l.expired()).collect();
        expired.sort_by(|a, b| {
            a.expire_time.cmp(&b.expire_time).then(a.addr.cmp(&b.addr))
        });
        if let Some(l) = expired.first() {
            return Some(l.addr);
        }

        let start = u32::from(subnet.active_start);
        let end = u32::from(subnet.active_end);
        for raw in start..=end {
            let addr = Ipv4Addr::from(raw);
            if !subnet.in_subnet_range(addr) {
                continue;
            }
            if lease_at(addr).is_none() {
                return Some(addr);
            }
        }
        None
    }
}
