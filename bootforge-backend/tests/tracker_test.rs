// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the tracker: entity lifecycle, rendering into the
//! virtual filesystem, and the lease algorithm.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bootforge_backend::model::{
    as_bootenv, as_lease, as_machine, BootEnv, Entity, Machine, Profile,
    Subnet, Task, TemplateInfo, ALL_PREFIXES, BOOTENVS, LEASES, MACHINES,
    PROFILES, RESERVATIONS, SUBNETS, TASKS,
};
use bootforge_backend::persist::{MemoryStore, PersistentStore, SledStore};
use bootforge_backend::publish::Publishers;
use bootforge_backend::tracker::DataTracker;
use bootforge_backend::{Error, ErrorKind};
use camino_tempfile::Utf8TempDir;

struct TestContext {
    // Held for the lifetime of the tracker; the file root lives here.
    _tmpdir: Utf8TempDir,
    dt: DataTracker,
}

fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

impl TestContext {
    fn new() -> TestContext {
        TestContext::with_backend(Box::new(MemoryStore::new()))
    }

    fn with_backend(backend: Box<dyn PersistentStore>) -> TestContext {
        let tmpdir =
            Utf8TempDir::with_prefix("bootforge-tracker-test").unwrap();
        let mut defaults = BTreeMap::new();
        defaults.insert("defaultBootEnv".to_string(), "default".to_string());
        defaults.insert("unknownBootEnv".to_string(), "ignore".to_string());
        defaults.insert("globalProfileName".to_string(), "global".to_string());
        let dt = DataTracker::new(
            backend,
            tmpdir.path().to_path_buf(),
            Ipv4Addr::new(127, 0, 0, 1),
            8091,
            8092,
            test_log(),
            defaults,
            Publishers::new(test_log()),
        )
        .expect("failed to build test tracker");
        TestContext { _tmpdir: tmpdir, dt }
    }

    /// An available environment machines can default into.
    fn seed_default_env(&self) {
        let mut env = BootEnv::new("default");
        env.templates = vec![TemplateInfo {
            name: "ipxe".to_string(),
            path: "{{ env.name }}/{{ machine.uuid }}/ipxe".to_string(),
            id: None,
            contents: Some("#!ipxe\nchain {{ provisioner_url }}\n".to_string()),
        }];
        let mut d = self.dt.lock_ents(ALL_PREFIXES);
        let created = self.dt.create(&mut d, Box::new(env)).unwrap();
        assert!(as_bootenv(&*created).available);
    }
}

fn install_env(name: &str, os: &str, tasks: &[&str]) -> BootEnv {
    let mut env = BootEnv::new(name);
    env.os.name = os.to_string();
    env.boot_params = "console=ttyS0 url={{ provisioner_url }}".to_string();
    env.tasks = tasks.iter().map(|t| t.to_string()).collect();
    env.templates = vec![
        TemplateInfo {
            name: "ipxe".to_string(),
            path: "{{ env.path_prefix }}/{{ machine.name }}.ipxe".to_string(),
            id: None,
            contents: Some(
                "#!ipxe\nkernel {{ provisioner_url }} {{ boot_params }}\n"
                    .to_string(),
            ),
        },
        TemplateInfo {
            name: "pxelinux".to_string(),
            path: "pxelinux.cfg/{{ machine.hex_address }}".to_string(),
            id: None,
            contents: Some(
                "DEFAULT discovery\nAPPEND {{ boot_params }}\n".to_string(),
            ),
        },
        TemplateInfo {
            name: "elilo".to_string(),
            path: "{{ machine.hex_address }}.conf".to_string(),
            id: None,
            contents: Some("append=\"{{ boot_params }}\"\n".to_string()),
        },
    ];
    env
}

fn subnet_10(name: &str) -> Subnet {
    let mut s = Subnet::new(name, "10.0.0.0/24");
    s.strategy = "MAC".to_string();
    s.active_start = Ipv4Addr::new(10, 0, 0, 10);
    s.active_end = Ipv4Addr::new(10, 0, 0, 100);
    s.active_lease_time = 60;
    s.reserved_lease_time = 7200;
    s.next_server = Some(Ipv4Addr::new(10, 0, 0, 1));
    s
}

#[test]
fn test_crud_basics() {
    let tc = TestContext::new();
    tc.seed_default_env();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);

    // Duplicate names are rejected.
    tc.dt.create(&mut d, Box::new(Task::new("t1"))).unwrap();
    let dup = tc.dt.create(&mut d, Box::new(Task::new("t1")));
    assert!(dup.is_err());

    // Machines referencing missing profiles are rejected whole.
    let mut m = Machine::new("bad.example.com");
    m.profiles = vec!["nope".to_string()];
    let err = tc.dt.create(&mut d, Box::new(m)).unwrap_err();
    assert_eq!(err.code, 422);
    assert!(err.messages.iter().any(|s| s.contains("Profile nope")));

    // A machine with no boot env gets the default.
    let created =
        tc.dt.create(&mut d, Box::new(Machine::new("ok.example.com"))).unwrap();
    assert_eq!(as_machine(&*created).boot_env, "default");
    assert!(as_machine(&*created).runnable);

    // Deleting the default boot env is refused while it is the default.
    let err = tc.dt.remove(&mut d, BOOTENVS, "default").unwrap_err();
    assert_eq!(err.kind, ErrorKind::StillInUse);
}

#[test]
fn test_bootenv_pxe_invariant() {
    let tc = TestContext::new();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);

    // pxelinux + elilo with no ipxe is a valid combination.
    let mut env = install_env("ubuntu-install", "ubuntu", &[]);
    env.templates.retain(|t| t.name != "ipxe");
    let created = tc.dt.create(&mut d, Box::new(env)).unwrap();
    let created = as_bootenv(&*created);
    assert!(created.available, "errors: {:?}", created.errors);

    // Removing elilo leaves the save successful but the env unavailable.
    let mut updated = created.clone();
    updated.templates.retain(|t| t.name != "elilo");
    let saved = tc.dt.save(&mut d, Box::new(updated)).unwrap();
    let saved = as_bootenv(&*saved);
    assert!(!saved.available);
    assert!(
        saved
            .errors
            .iter()
            .any(|e| e.contains("Missing elilo or pxelinux template")),
        "errors: {:?}",
        saved.errors
    );
}

#[test]
fn test_machine_render_registers_artifacts() {
    let tc = TestContext::new();
    tc.seed_default_env();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt
        .create(&mut d, Box::new(install_env("ubuntu-install", "ubuntu", &[])))
        .unwrap();

    let mut m = Machine::new("m1.example.com");
    m.address = Some(Ipv4Addr::new(10, 0, 0, 5));
    m.boot_env = "ubuntu-install".to_string();
    tc.dt.create(&mut d, Box::new(m)).unwrap();
    drop(d);

    let paths = tc.dt.fs.paths();
    assert!(
        paths.contains(&"/ubuntu/install/m1.example.com.ipxe".to_string()),
        "paths: {:?}",
        paths
    );
    assert!(
        paths.contains(&"/pxelinux.cfg/0A000005".to_string()),
        "paths: {:?}",
        paths
    );
    assert!(paths.contains(&"/0A000005.conf".to_string()), "paths: {:?}", paths);

    // Bodies are rendered lazily, with the boot-params template expanded.
    let body = tc.dt.fs.read("/pxelinux.cfg/0A000005").unwrap().unwrap();
    assert!(body.contains("console=ttyS0 url=http://127.0.0.1:8091"), "{body}");
}

#[test]
fn test_machine_bootenv_change_recomputes_tasks() {
    let tc = TestContext::new();
    tc.seed_default_env();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    for t in ["t1", "t2", "tg"] {
        tc.dt.create(&mut d, Box::new(Task::new(t))).unwrap();
    }
    let mut global = Profile::new("global");
    global.tasks = vec!["tg".to_string()];
    tc.dt.create(&mut d, Box::new(global)).unwrap();
    tc.dt
        .create(&mut d, Box::new(install_env("ubuntu-install", "ubuntu", &["t1"])))
        .unwrap();
    tc.dt
        .create(&mut d, Box::new(install_env("centos-install", "centos", &["t2"])))
        .unwrap();

    let mut m = Machine::new("m1.example.com");
    m.address = Some(Ipv4Addr::new(10, 0, 0, 5));
    m.boot_env = "ubuntu-install".to_string();
    let created = tc.dt.create(&mut d, Box::new(m)).unwrap();
    let uuid = created.key();

    let m1 = as_machine(&*d.get(MACHINES).find(&uuid).unwrap()).clone();
    assert_eq!(m1.tasks, vec!["t1", "tg"]);
    assert_eq!(m1.current_task, -1);
    drop(d);
    let paths_before = tc.dt.fs.paths();
    assert!(paths_before
        .contains(&"/ubuntu/install/m1.example.com.ipxe".to_string()));

    // Swap environments: old renders go away, new ones appear, tasks are
    // recomputed.
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    let mut moved = m1.clone();
    moved.boot_env = "centos-install".to_string();
    tc.dt.save(&mut d, Box::new(moved)).unwrap();
    let m2 = as_machine(&*d.get(MACHINES).find(&uuid).unwrap()).clone();
    assert_eq!(m2.tasks, vec!["t2", "tg"]);
    assert_eq!(m2.current_task, -1);
    drop(d);
    let paths_after = tc.dt.fs.paths();
    assert!(!paths_after
        .contains(&"/ubuntu/install/m1.example.com.ipxe".to_string()));
    assert!(paths_after
        .contains(&"/centos/install/m1.example.com.ipxe".to_string()));

    // An idempotent re-save: current task survives, the filesystem does
    // not change.
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    let mut again = m2.clone();
    again.current_task = 0;
    tc.dt.save(&mut d, Box::new(again)).unwrap();
    let m3 = as_machine(&*d.get(MACHINES).find(&uuid).unwrap()).clone();
    assert_eq!(m3.current_task, 0);
    assert_eq!(m3.tasks, vec!["t2", "tg"]);
    drop(d);
    assert_eq!(tc.dt.fs.paths(), paths_after);
}

#[test]
fn test_machine_cannot_use_unavailable_or_unknown_env() {
    let tc = TestContext::new();
    tc.seed_default_env();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);

    let mut broken = install_env("broken-install", "broken", &[]);
    broken.templates.retain(|t| t.name == "pxelinux");
    let broken = tc.dt.create(&mut d, Box::new(broken)).unwrap();
    assert!(!as_bootenv(&*broken).available);

    let mut m = Machine::new("m1.example.com");
    m.boot_env = "broken-install".to_string();
    let err = tc.dt.create(&mut d, Box::new(m)).unwrap_err();
    assert!(
        err.messages.iter().any(|s| s.contains("not available")),
        "messages: {:?}",
        err.messages
    );

    let mut sentinel = BootEnv::new("discovery");
    sentinel.only_unknown = true;
    sentinel.templates = vec![TemplateInfo {
        name: "ipxe".to_string(),
        path: "discovery/ipxe".to_string(),
        id: None,
        contents: Some("#!ipxe\n".to_string()),
    }];
    tc.dt.create(&mut d, Box::new(sentinel)).unwrap();
    let mut m = Machine::new("m2.example.com");
    m.boot_env = "discovery".to_string();
    let err = tc.dt.create(&mut d, Box::new(m)).unwrap_err();
    assert!(
        err.messages.iter().any(|s| s.contains("OnlyUnknown")),
        "messages: {:?}",
        err.messages
    );
}

#[test]
fn test_lease_discover_and_conflict() {
    let tc = TestContext::new();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt.create(&mut d, Box::new(subnet_10("local"))).unwrap();
    drop(d);

    let via = [Ipv4Addr::new(10, 0, 0, 1)];
    let mut d = tc.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);

    // First discover gets the first free active address.
    let (lease, subnet, reservation) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, &via)
        .expect("no lease allocated");
    assert_eq!(lease.addr, Ipv4Addr::new(10, 0, 0, 10));
    assert_eq!(subnet.as_ref().map(|s| s.name.as_str()), Some("local"));
    assert!(reservation.is_none());
    assert!(!lease.expired());

    // The same client discovering again keeps its address.
    let (again, _, _) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, &via)
        .unwrap();
    assert_eq!(again.addr, lease.addr);

    // A different client gets a different address.
    let (other, _, _) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "11:22:33:44:55:66", Ipv4Addr::UNSPECIFIED, &via)
        .unwrap();
    assert_eq!(other.addr, Ipv4Addr::new(10, 0, 0, 11));

    // Requesting an address leased to someone else is a conflict.
    let err = tc
        .dt
        .find_lease(&mut d, "MAC", "11:22:33:44:55:66", lease.addr)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    // The holder itself renews fine and the expiry moves forward.
    let (renewed, _, _) = tc
        .dt
        .find_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", lease.addr)
        .unwrap()
        .unwrap();
    assert!(renewed.expire_time >= lease.expire_time);
}

#[test]
fn test_lease_decline_quarantines_address() {
    let tc = TestContext::new();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt.create(&mut d, Box::new(subnet_10("local"))).unwrap();
    drop(d);

    let via = [Ipv4Addr::new(10, 0, 0, 1)];
    let mut d = tc.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
    let (lease, _, _) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, &via)
        .unwrap();
    assert_eq!(lease.addr, Ipv4Addr::new(10, 0, 0, 10));

    // Decline: the address goes into a short quarantine with no holder.
    let quarantined = tc
        .dt
        .update_lease_in_place(&mut d, &lease.key(), |l| l.invalidate())
        .unwrap();
    assert!(quarantined.token.is_empty());
    assert!(!quarantined.expired());

    // The same client discovers again and gets a different address while
    // the quarantine holds.
    let (fresh, _, _) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, &via)
        .unwrap();
    assert_ne!(fresh.addr, lease.addr);
    assert_eq!(fresh.addr, Ipv4Addr::new(10, 0, 0, 11));
}

#[test]
fn test_expired_lease_is_taken_over() {
    let tc = TestContext::new();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt.create(&mut d, Box::new(subnet_10("local"))).unwrap();
    drop(d);

    let via = [Ipv4Addr::new(10, 0, 0, 1)];
    let mut d = tc.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
    let (lease, _, _) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, &via)
        .unwrap();
    tc.dt.update_lease_in_place(&mut d, &lease.key(), |l| l.expire()).unwrap();

    let (taken, _, _) = tc
        .dt
        .find_lease(&mut d, "MAC", "11:22:33:44:55:66", lease.addr)
        .unwrap()
        .unwrap();
    assert_eq!(taken.addr, lease.addr);
    assert_eq!(taken.token, "11:22:33:44:55:66");
    assert!(!taken.expired());
}

#[test]
fn test_reservation_wins_before_dynamic_allocation() {
    let tc = TestContext::new();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt.create(&mut d, Box::new(subnet_10("local"))).unwrap();
    let r = bootforge_backend::model::Reservation::new(
        Ipv4Addr::new(10, 0, 0, 200),
        "MAC",
        "aa:bb:cc:dd:ee:ff",
    );
    tc.dt.create(&mut d, Box::new(r)).unwrap();
    drop(d);

    let via = [Ipv4Addr::new(10, 0, 0, 1)];
    let mut d = tc.dt.lock_ents(&[LEASES, RESERVATIONS, SUBNETS]);
    let (lease, subnet, reservation) = tc
        .dt
        .find_or_create_lease(&mut d, "MAC", "aa:bb:cc:dd:ee:ff", Ipv4Addr::UNSPECIFIED, &via)
        .unwrap();
    assert_eq!(lease.addr, Ipv4Addr::new(10, 0, 0, 200));
    assert!(reservation.is_some());
    // Outside the active range, so the reserved lease time applies.
    assert!(subnet.is_some());
}

#[test]
fn test_lease_token_and_strategy_immutable() {
    let tc = TestContext::new();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt.create(&mut d, Box::new(subnet_10("local"))).unwrap();
    let (lease, _, _) = tc
        .dt
        .find_or_create_lease(
            &mut d,
            "MAC",
            "aa:bb:cc:dd:ee:ff",
            Ipv4Addr::UNSPECIFIED,
            &[Ipv4Addr::new(10, 0, 0, 1)],
        )
        .unwrap();

    let mut tampered = lease.clone();
    tampered.token = "evil".to_string();
    let err = tc.dt.save(&mut d, Box::new(tampered)).unwrap_err();
    assert!(err.messages.iter().any(|m| m.contains("Token cannot change")));

    let mut tampered = lease;
    tampered.strategy = "OTHER".to_string();
    let err = tc.dt.save(&mut d, Box::new(tampered)).unwrap_err();
    assert!(err.messages.iter().any(|m| m.contains("Strategy cannot change")));
}

#[test]
fn test_save_then_load_round_trip() {
    let tmp = Utf8TempDir::with_prefix("bootforge-roundtrip").unwrap();
    let db_path = tmp.path().join("db");
    let (uuid, lease_key) = {
        let tc = TestContext::with_backend(Box::new(
            SledStore::open(&db_path).unwrap(),
        ));
        tc.seed_default_env();
        let mut d = tc.dt.lock_ents(ALL_PREFIXES);
        tc.dt.create(&mut d, Box::new(subnet_10("local"))).unwrap();
        let mut m = Machine::new("m1.example.com");
        m.address = Some(Ipv4Addr::new(10, 0, 0, 5));
        m.params
            .insert("ntp".to_string(), serde_json::json!(["10.0.0.1"]));
        let created = tc.dt.create(&mut d, Box::new(m)).unwrap();
        let (lease, _, _) = tc
            .dt
            .find_or_create_lease(
                &mut d,
                "MAC",
                "aa:bb:cc:dd:ee:ff",
                Ipv4Addr::UNSPECIFIED,
                &[Ipv4Addr::new(10, 0, 0, 1)],
            )
            .unwrap();
        (created.key(), lease.key())
    };

    // A fresh tracker over the same database sees the same entities.
    let tc = TestContext::with_backend(Box::new(SledStore::open(&db_path).unwrap()));
    let d = tc.dt.lock_ents(&[MACHINES, LEASES, SUBNETS, BOOTENVS]);
    let m = as_machine(&*d.get(MACHINES).find(&uuid).unwrap()).clone();
    assert_eq!(m.name, "m1.example.com");
    assert_eq!(m.address, Some(Ipv4Addr::new(10, 0, 0, 5)));
    assert_eq!(m.boot_env, "default");
    assert_eq!(m.params["ntp"], serde_json::json!(["10.0.0.1"]));
    let l = as_lease(&*d.get(LEASES).find(&lease_key).unwrap()).clone();
    assert_eq!(l.token, "aa:bb:cc:dd:ee:ff");
    assert_eq!(l.strategy, "MAC");
    assert!(d.get(SUBNETS).contains("local"));
    assert!(d.get(BOOTENVS).contains("default"));
}

#[test]
fn test_deregister_register_is_identity() {
    let tc = TestContext::new();
    tc.seed_default_env();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt
        .create(&mut d, Box::new(install_env("ubuntu-install", "ubuntu", &[])))
        .unwrap();
    let mut m = Machine::new("m1.example.com");
    m.address = Some(Ipv4Addr::new(10, 0, 0, 5));
    m.boot_env = "ubuntu-install".to_string();
    tc.dt.create(&mut d, Box::new(m.clone())).unwrap();

    let env = as_bootenv(&*d.get(BOOTENVS).find("ubuntu-install").unwrap()).clone();
    let machine =
        as_machine(&*d.get(MACHINES).find(&m.uuid.to_string()).unwrap()).clone();
    drop(d);

    let before = tc.dt.fs.paths();
    let d = tc.dt.lock_ents(&[BOOTENVS, MACHINES, PROFILES, TASKS]);
    let mut e = Error::validation(BOOTENVS, "ubuntu-install");
    let rts = env.render(&tc.dt, &d, Some(&machine), &mut e);
    assert!(!e.has_errors(), "{e}");
    rts.deregister(&tc.dt.fs);
    assert_ne!(tc.dt.fs.paths(), before);
    rts.register(&tc.dt.fs);
    assert_eq!(tc.dt.fs.paths(), before);
}

#[test]
fn test_lock_ents_is_deadlock_free() {
    let tc = Arc::new(TestContext::new());
    let mut handles = Vec::new();
    for (a, b) in [(MACHINES, BOOTENVS), (BOOTENVS, SUBNETS), (SUBNETS, MACHINES)]
    {
        let tc = Arc::clone(&tc);
        handles.push(std::thread::spawn(move || {
            for _ in 0..200 {
                // Deliberately unsorted; lock_ents canonicalizes.
                let d = tc.dt.lock_ents(&[a, b]);
                assert!(d.has(a) && d.has(b));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_parameter_index_orders_machines() {
    use bootforge_backend::model::{parameter_maker, Param};

    let tc = TestContext::new();
    tc.seed_default_env();
    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt
        .create(
            &mut d,
            Box::new(Param::new("rack", serde_json::json!({"type": "integer"}))),
        )
        .unwrap();

    // One machine gets its value from a profile, one sets it directly, one
    // has no value at all.
    let mut p = Profile::new("rack9");
    p.params.insert("rack".to_string(), serde_json::json!(9));
    tc.dt.create(&mut d, Box::new(p)).unwrap();

    let mut a = Machine::new("a.example.com");
    a.profiles = vec!["rack9".to_string()];
    let mut b = Machine::new("b.example.com");
    b.params.insert("rack".to_string(), serde_json::json!(3));
    let c = Machine::new("c.example.com");
    for m in [a, b, c] {
        tc.dt.create(&mut d, Box::new(m)).unwrap();
    }

    let maker = parameter_maker(&tc.dt, &d, "rack").unwrap();
    let idx = d.get(MACHINES).index(&maker);
    let names: Vec<String> = idx
        .items()
        .iter()
        .map(|m| as_machine(&**m).name.clone())
        .collect();
    // Nil sorts first, then natural integer order.
    assert_eq!(names, vec!["c.example.com", "b.example.com", "a.example.com"]);

    // Range queries parse and validate values through the Param schema.
    let at = maker.fill("9").unwrap();
    let nine = idx.eq(&maker, &*at);
    assert_eq!(nine.len(), 1);
    assert!(maker.fill("\"not-an-int\"").is_err());

    // Unknown parameters are refused outright.
    assert!(parameter_maker(&tc.dt, &d, "nope").is_err());
}

#[test]
fn test_events_reach_publishers() {
    use bootforge_backend::publish::{Event, Publisher};
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<String>>>);
    impl Publisher for Recorder {
        fn deliver(
            &mut self,
            event: &Event,
        ) -> Result<(), Error> {
            self.0
                .lock()
                .unwrap()
                .push(format!("{} {}/{}", event.action, event.prefix, event.key));
            Ok(())
        }
    }

    let tc = TestContext::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    tc.dt.publishers.add("test", Box::new(Recorder(Arc::clone(&seen))));

    let mut d = tc.dt.lock_ents(ALL_PREFIXES);
    tc.dt.create(&mut d, Box::new(Task::new("t1"))).unwrap();
    tc.dt.remove(&mut d, TASKS, "t1").unwrap();
    drop(d);
    tc.dt.publishers.remove("test");

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec!["create tasks/t1", "delete tasks/t1"]);
}
