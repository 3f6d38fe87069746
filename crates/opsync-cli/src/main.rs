//! # opsync CLI
//!
//! One-shot commands against the local device: write and inspect entities,
//! pair devices, run a sync cycle, and back up or recover the event log.

use anyhow::{bail, Context, Result};
use opsync_agent::keys::{read_key_file, write_key_file};
use opsync_agent::{recover_from_bundle, recover_from_relay, AgentConfig, SyncEngine, SyncOutcome};
use opsync_core::{from_base64_array, DeviceId, Op, PublicKey};
use opsync_proto::{BundleFormat, EventBundle};
use opsync_relay::{HttpRelay, RelayClientConfig};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let config = AgentConfig::from_env()?;

    match args[1].as_str() {
        "identity" => {
            let engine = open(&config)?;
            let keys = engine.keys();
            println!("device_id:  {}", keys.device_id());
            println!("public_key: {}", keys.public_key().to_base64());
            println!("created_at: {}", keys.created_at().to_rfc3339());
            if args.get(2).map(String::as_str) == Some("--group-key") {
                println!("group_key:  {}", keys.group_key_export());
            }
        }
        "status" => {
            let engine = open(&config)?;
            print_json(&engine.get_sync_status()?)?;
        }
        "set" => {
            let [entity_type, entity_id, payload] = required::<3>(
                &args,
                "set <entity-type> <entity-id> <json> [create|update|delete]",
            )?;
            let op: Op = args.get(5).map_or("update", String::as_str).parse()?;
            let payload: serde_json::Value =
                serde_json::from_str(payload).context("Payload is not valid JSON")?;

            let engine = open(&config)?;
            let event = engine.create_sync_event(entity_type, entity_id, op, &payload)?;
            println!("{} {}", event.op_id, event.hlc);
        }
        "show" => {
            let engine = open(&config)?;
            match args.get(2..4) {
                Some([entity_type, entity_id]) => {
                    let state = engine
                        .state(entity_type, entity_id)
                        .with_context(|| format!("No state for {entity_type}/{entity_id}"))?;
                    print_json(&state.value())?;
                }
                _ => {
                    for (key, state) in engine.states() {
                        println!("{key}\t{}", state.value());
                    }
                }
            }
        }
        "quarantine" => {
            let limit = match args.get(2) {
                Some(n) => n.parse().context("Limit must be a number")?,
                None => 50,
            };
            let engine = open(&config)?;
            for entry in engine.quarantined(limit)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.op_id, entry.device_id, entry.entity_type, entry.reason
                );
            }
        }
        "export" => {
            let [path] = required::<1>(&args, "export <file.json|file.cbor>")?;
            let path = Path::new(path);
            let engine = open(&config)?;
            let bundle = engine.export_bundle()?;
            let format = BundleFormat::from_extension(path.extension().and_then(|e| e.to_str()));
            std::fs::write(path, bundle.encode(format)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("exported {} events to {}", bundle.events.len(), path.display());
        }
        "import" => {
            let [path] = required::<1>(&args, "import <bundle>")?;
            let bundle = read_bundle(Path::new(path))?;
            let engine = open(&config)?;
            let report = engine.import_bundle(bundle)?;
            println!(
                "accepted {}, duplicates {}, quarantined {}, bridged {}",
                report.accepted,
                report.duplicates,
                report.quarantined.len(),
                report.bridged
            );
        }
        "sync" => {
            let url = args
                .get(2)
                .or(config.relay.url.as_ref())
                .context("No relay URL given and OPSYNC_RELAY_URL is unset")?;
            let engine = open(&config)?;
            match engine.sync_with_relay(url).await? {
                SyncOutcome::Completed(report) => print_json(&report)?,
                SyncOutcome::Skipped => println!("skipped: a cycle is already running"),
            }
        }
        "recover" => {
            let [source] = required::<1>(&args, "recover <relay-url|bundle>")?;
            let engine = open(&config)?;
            let report = if source.starts_with("http://") || source.starts_with("https://") {
                let relay = HttpRelay::new(RelayClientConfig {
                    base_url: source.clone(),
                    timeout: config.relay.timeout,
                    bearer_token: config.relay.bearer_token.clone(),
                    ca_cert_path: config.relay.ca_cert_path.clone(),
                })?;
                recover_from_relay(&engine, &relay).await?
            } else {
                recover_from_bundle(&engine, read_bundle(Path::new(source))?)?
            };
            print_json(&report)?;
        }
        "pair" => {
            let [device_id, public_key] = required::<2>(&args, "pair <device-id> <public-key>")?;
            let device_id: DeviceId = device_id.parse()?;
            let public_key = PublicKey::from_base64(public_key)?;
            let engine = open(&config)?;
            if engine.pair(device_id, public_key)? {
                println!("paired {device_id}");
            } else {
                println!("updated key for {device_id}");
            }
        }
        "join" => {
            let [group_key] = required::<1>(&args, "join <group-key>")?;
            let group_key = from_base64_array(group_key).context("Malformed group key")?;
            {
                let engine = open(&config)?;
                if engine.get_sync_status()?.events_in_log > 0 {
                    bail!("Cannot join a group once events have been written");
                }
            }
            let mut keys = read_key_file(&config.key_path)?;
            keys.join_group(group_key);
            write_key_file(&config.key_path, &keys, true)?;
            println!("joined group as {}", keys.device_id());
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn open(config: &AgentConfig) -> Result<SyncEngine> {
    SyncEngine::open(config)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))
}

/// The `N` positional arguments after the command, or a usage error.
fn required<'a, const N: usize>(args: &'a [String], usage: &str) -> Result<[&'a String; N]> {
    let Some(values) = args.get(2..2 + N) else {
        bail!("Usage: opsync {usage}");
    };
    let mut out = Vec::with_capacity(N);
    out.extend(values);
    out.try_into()
        .map_err(|_| anyhow::anyhow!("Usage: opsync {usage}"))
}

fn read_bundle(path: &Path) -> Result<EventBundle> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    EventBundle::decode(&bytes).with_context(|| format!("{} is not an event bundle", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!(
        r#"opsync CLI

USAGE:
    opsync <COMMAND> [ARGS]

COMMANDS:
    identity [--group-key]            Show this device's identity
    status                            Show sync status as JSON
    set <type> <id> <json> [op]       Record a mutation (op: create, update, delete)
    show [<type> <id>]                Show folded entity state
    quarantine [limit]                List rejected events
    export <file>                     Write a backup bundle (.cbor or .json)
    import <file>                     Verify and merge a bundle
    sync [url]                        Run one sync cycle against a relay
    recover <url|file>                Rebuild from a relay or a bundle
    pair <device-id> <public-key>     Trust another device's events
    join <group-key>                  Adopt an existing group's key (empty log only)
    help                              Show this help message

ENVIRONMENT:
    OPSYNC_DATA_DIR, OPSYNC_RELAY_URL, OPSYNC_BEARER_TOKEN, RUST_LOG

EXAMPLES:
    opsync set memory mem-1 '{{"x": 1}}' create
    opsync export backup.cbor
    opsync sync https://relay.example.com
"#
    );
}
