// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioner daemon: wires a persistence backend, the data tracker,
//! and the DHCP engine together and serves until the engine exits.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use bootforge_backend::persist::{MemoryStore, PersistentStore, SledStore};
use bootforge_backend::publish::Publishers;
use bootforge_backend::tracker::DataTracker;
use bootforge_dhcp::{start_dhcp_handler, DhcpConfig, MacStrategy};
use camino::Utf8PathBuf;
use clap::Parser;
use slog::{info, o, Drain, Logger};

#[derive(Debug, Parser)]
#[command(name = "bootforged", about = "bare-metal provisioning service")]
struct Args {
    /// Directory the persistent entity database lives in, or "memory" for
    /// an ephemeral server.
    #[arg(long, default_value = "bootforge-data")]
    data_root: String,

    /// Root of the static file tree (exploded ISOs, rendered artifacts).
    #[arg(long, default_value = "bootforge-files")]
    file_root: Utf8PathBuf,

    /// The address to advertise to booting machines.
    #[arg(long)]
    our_address: Ipv4Addr,

    /// Port of the static file server.
    #[arg(long, default_value_t = 8091)]
    static_port: u16,

    /// Port of the API server.
    #[arg(long, default_value_t = 8092)]
    api_port: u16,

    /// Port the DHCP engine listens on.
    #[arg(long, default_value_t = 67)]
    dhcp_port: u16,

    /// Comma-separated interface allow-list for DHCP; empty means all.
    #[arg(long, default_value = "")]
    dhcp_interfaces: String,

    /// Boot environment assigned to machines that don't name one.
    #[arg(long, default_value = "default")]
    default_boot_env: String,

    /// Boot environment served to machines we know nothing about.
    #[arg(long, default_value = "ignore")]
    unknown_boot_env: String,

    /// Profile consulted last for every machine's parameters.
    #[arg(long, default_value = "global")]
    global_profile: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let log = Logger::root(drain, o!("name" => "bootforged"));

    let backend: Box<dyn PersistentStore> = if args.data_root == "memory" {
        Box::new(MemoryStore::new())
    } else {
        let path = Utf8PathBuf::from(&args.data_root);
        Box::new(
            SledStore::open(&path)
                .with_context(|| format!("opening data root {}", path))?,
        )
    };

    std::fs::create_dir_all(args.file_root.as_std_path())
        .with_context(|| format!("creating file root {}", args.file_root))?;

    let mut defaults = BTreeMap::new();
    defaults.insert("defaultBootEnv".to_string(), args.default_boot_env);
    defaults.insert("unknownBootEnv".to_string(), args.unknown_boot_env);
    defaults.insert("globalProfileName".to_string(), args.global_profile);

    let publishers = Publishers::new(log.new(o!("component" => "publishers")));
    let dt = Arc::new(
        DataTracker::new(
            backend,
            args.file_root,
            args.our_address,
            args.static_port,
            args.api_port,
            log.clone(),
            defaults,
            publishers,
        )
        .context("starting data tracker")?,
    );

    let dhcp_config = DhcpConfig {
        port: args.dhcp_port,
        interfaces: args
            .dhcp_interfaces
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    };
    let mut dhcp = start_dhcp_handler(
        Arc::clone(&dt),
        dhcp_config,
        vec![Box::new(MacStrategy)],
        log.clone(),
    )
    .context("starting DHCP engine")?;

    info!(log, "bootforged up";
        "advertised" => %dt.our_address,
        "file_url" => dt.file_url());
    dhcp.wait();
    Ok(())
}
