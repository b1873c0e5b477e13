use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tierring_core::{
    DeviceId, DevicePattern, DeviceSpec, Ring, RingBuilder, RingConfig, INFINITE_BALANCE,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tierring")]
#[command(about = "Build, inspect and query partition rings", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an empty builder file.
    Create {
        builder: PathBuf,
        part_power: u32,
        replicas: f64,
        min_part_hours: u32,
    },
    /// Add a device given as `[r<region>]z<zone>-<ip>:<port>/<device>[_<meta>]`.
    Add {
        builder: PathBuf,
        device: String,
        weight: f64,
        #[arg(long)]
        id: Option<DeviceId>,
    },
    /// List devices matching a search pattern.
    Search { builder: PathBuf, pattern: String },
    /// Set the weight of every device matching a pattern.
    SetWeight {
        builder: PathBuf,
        pattern: String,
        weight: f64,
    },
    /// Drain and remove every device matching a pattern.
    Remove { builder: PathBuf, pattern: String },
    /// Change the replica count; takes effect on the next rebalance.
    SetReplicas { builder: PathBuf, replicas: f64 },
    /// Change how many hours a moved partition stays put.
    SetMinPartHours { builder: PathBuf, hours: u32 },
    /// Rebalance, then save the builder and write `<builder>.ring.gz`.
    Rebalance {
        builder: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Check the builder and print per-device usage.
    Validate { builder: PathBuf },
    /// Clear every partition's move cooldown.
    PretendMinPartHoursPassed { builder: PathBuf },
    /// Write the ring file without rebalancing.
    WriteRing {
        builder: PathBuf,
        output: Option<PathBuf>,
    },
    /// Print the builder summary and device table.
    Show {
        builder: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Look up the partition, primaries and handoffs for a path.
    GetNodes {
        #[arg(long)]
        ring: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "TIERRING_HASH_PATH_PREFIX")]
        hash_path_prefix: Option<String>,
        #[arg(long, env = "TIERRING_HASH_PATH_SUFFIX")]
        hash_path_suffix: Option<String>,
        #[arg(long, default_value = "3")]
        handoffs: usize,
        account: String,
        container: Option<String>,
        object: Option<String>,
    },
}

/// `object.builder` -> `object.ring.gz`.
pub fn default_ring_path(builder: &Path) -> PathBuf {
    builder.with_extension("ring.gz")
}

fn parse_pattern(pattern: &str) -> Result<DevicePattern> {
    pattern
        .parse()
        .with_context(|| format!("bad search pattern {:?}", pattern))
}

fn matching_ids(builder: &RingBuilder, pattern: &str) -> Result<Vec<DeviceId>> {
    let pattern = parse_pattern(pattern)?;
    let ids: Vec<DeviceId> = builder.search_devs(&pattern).iter().map(|d| d.id).collect();
    if ids.is_empty() {
        bail!("No matching devices found");
    }
    Ok(ids)
}

fn device_spec(device: &str, weight: f64, id: Option<DeviceId>) -> Result<DeviceSpec> {
    let pattern = parse_pattern(device)?;
    let (Some(zone), Some(ip), Some(port), Some(name)) =
        (pattern.zone, pattern.ip, pattern.port, pattern.device)
    else {
        bail!("device {:?} needs a zone, ip, port and device name", device);
    };
    let mut spec = DeviceSpec::new(pattern.region.unwrap_or(1), zone, ip, port, name, weight)
        .with_meta(pattern.meta.unwrap_or_default());
    if let Some(id) = id.or(pattern.id) {
        spec = spec.with_id(id);
    }
    Ok(spec)
}

fn load(path: &Path) -> Result<RingBuilder> {
    RingBuilder::load(path).with_context(|| format!("cannot load builder {}", path.display()))
}

impl Cli {
    pub fn run(self, out: &mut dyn Write) -> Result<()> {
        match self.command {
            Command::Create {
                builder,
                part_power,
                replicas,
                min_part_hours,
            } => {
                RingBuilder::new(part_power, replicas, min_part_hours)?.save(&builder)?;
                writeln!(out, "Created {}", builder.display())?;
                Ok(())
            }
            Command::Add {
                builder: path,
                device,
                weight,
                id,
            } => {
                let mut builder = load(&path)?;
                let spec = device_spec(&device, weight, id)?;
                let id = builder.add_dev(spec)?;
                builder.save(&path)?;
                if let Some(dev) = builder.devices().get(id) {
                    writeln!(out, "Device {} with {} weight got id {}", dev.info, weight, id)?;
                }
                Ok(())
            }
            Command::Search {
                builder: path,
                pattern,
            } => {
                let builder = load(&path)?;
                let pattern = parse_pattern(&pattern)?;
                let devs = builder.search_devs(&pattern);
                if devs.is_empty() {
                    bail!("No matching devices found");
                }
                for dev in devs {
                    writeln!(out, "{} weight {}", dev, dev.weight)?;
                }
                Ok(())
            }
            Command::SetWeight {
                builder: path,
                pattern,
                weight,
            } => {
                let mut builder = load(&path)?;
                for id in matching_ids(&builder, &pattern)? {
                    builder.set_dev_weight(id, weight)?;
                    writeln!(out, "Set weight of device {} to {}", id, weight)?;
                }
                builder.save(&path)?;
                Ok(())
            }
            Command::Remove {
                builder: path,
                pattern,
            } => {
                let mut builder = load(&path)?;
                for id in matching_ids(&builder, &pattern)? {
                    builder.remove_dev(id)?;
                    writeln!(out, "Device {} marked for removal", id)?;
                }
                builder.save(&path)?;
                Ok(())
            }
            Command::SetReplicas {
                builder: path,
                replicas,
            } => {
                let mut builder = load(&path)?;
                builder.set_replicas(replicas)?;
                builder.save(&path)?;
                writeln!(out, "The replica count is now {:.6}.", replicas)?;
                Ok(())
            }
            Command::SetMinPartHours {
                builder: path,
                hours,
            } => {
                let mut builder = load(&path)?;
                builder.change_min_part_hours(hours);
                builder.save(&path)?;
                writeln!(
                    out,
                    "The minimum number of hours before a partition can be reassigned is now set to {}",
                    hours
                )?;
                Ok(())
            }
            Command::Rebalance {
                builder: path,
                seed,
            } => rebalance(&path, seed, out),
            Command::Validate { builder: path } => {
                let builder = load(&path)?;
                let stats = builder.validate(true)?;
                writeln!(out, "Ring is valid.")?;
                if let Some(stats) = stats {
                    writeln!(out, "Worst device skew is {:.2}%.", stats.worst)?;
                    for dev in builder.devices().iter() {
                        writeln!(
                            out,
                            "  device {:>5}: {} partition-replicas",
                            dev.info.id, stats.dev_usage[dev.info.id as usize]
                        )?;
                    }
                }
                Ok(())
            }
            Command::PretendMinPartHoursPassed { builder: path } => {
                let mut builder = load(&path)?;
                builder.pretend_min_part_hours_passed();
                builder.save(&path)?;
                Ok(())
            }
            Command::WriteRing {
                builder: path,
                output,
            } => {
                let mut builder = load(&path)?;
                let output = output.unwrap_or_else(|| default_ring_path(&path));
                builder.get_ring().save(&output)?;
                writeln!(out, "Wrote {}", output.display())?;
                Ok(())
            }
            Command::Show { builder: path, json } => show(&path, json, out),
            Command::GetNodes {
                ring,
                config,
                hash_path_prefix,
                hash_path_suffix,
                handoffs,
                account,
                container,
                object,
            } => {
                let mut ring_config = match config {
                    Some(path) => RingConfig::from_file(&path)?,
                    None => RingConfig::default(),
                };
                if let Some(prefix) = hash_path_prefix {
                    ring_config.hash_path_prefix = prefix;
                }
                if let Some(suffix) = hash_path_suffix {
                    ring_config.hash_path_suffix = suffix;
                }
                let ring = Ring::open(&ring, &ring_config)?;
                let (part, nodes) =
                    ring.get_nodes(&account, container.as_deref(), object.as_deref());
                writeln!(out, "Partition {}", part)?;
                for node in &nodes {
                    writeln!(out, "  primary  {}", node)?;
                }
                for node in ring.get_more_nodes(part).take(handoffs) {
                    writeln!(out, "  handoff  {}", node)?;
                }
                Ok(())
            }
        }
    }
}

fn rebalance(path: &Path, seed: Option<u64>, out: &mut dyn Write) -> Result<()> {
    let mut builder = load(path)?;
    let summary = builder.rebalance(seed)?;
    builder
        .validate(false)
        .context("rebalance produced an invalid ring")?;
    builder.save(path)?;
    let ring_path = default_ring_path(path);
    builder.get_ring().save(&ring_path)?;
    info!(ring = %ring_path.display(), "published ring");

    let total: usize = builder.assignments().iter().map(|p| p.len()).sum();
    writeln!(
        out,
        "Reassigned {} ({:.2}%) partitions. Balance is now {:.2}.",
        summary.parts_moved,
        100.0 * summary.parts_moved as f64 / builder.parts() as f64,
        summary.balance
    )?;
    writeln!(out, "{} partition-replicas across {} devices.", total, builder.devices().len())?;
    Ok(())
}

fn show(path: &Path, json: bool, out: &mut dyn Write) -> Result<()> {
    let builder = load(path)?;
    let balance = builder.get_balance().unwrap_or(0.0);
    let weight_of_one_part = builder.weight_of_one_part().ok();
    let dev_balance = |parts: u32, weight: f64| match weight_of_one_part {
        Some(_) if weight <= 0.0 && parts > 0 => INFINITE_BALANCE,
        Some(_) if weight <= 0.0 => 0.0,
        Some(wop) => 100.0 * parts as f64 / (weight * wop) - 100.0,
        None => 0.0,
    };

    if json {
        let devices: Vec<serde_json::Value> = builder
            .devices()
            .iter()
            .map(|d| {
                serde_json::json!({
                    "device": d.info,
                    "parts": d.parts,
                    "parts_wanted": d.parts_wanted,
                    "balance": dev_balance(d.parts, d.info.weight),
                })
            })
            .collect();
        let summary = serde_json::json!({
            "part_power": builder.part_power(),
            "partitions": builder.parts(),
            "replicas": builder.replicas(),
            "min_part_hours": builder.min_part_hours(),
            "version": builder.version(),
            "balance": balance,
            "pending_removals": builder.pending_removals(),
            "devices": devices,
        });
        serde_json::to_writer_pretty(&mut *out, &summary)?;
        writeln!(out)?;
        return Ok(());
    }

    let regions: HashSet<u32> = builder.devices().iter().map(|d| d.info.region).collect();
    let zones: HashSet<(u32, u32)> = builder
        .devices()
        .iter()
        .map(|d| (d.info.region, d.info.zone))
        .collect();
    writeln!(out, "{}, build version {}", path.display(), builder.version())?;
    writeln!(
        out,
        "{} partitions, {:.6} replicas, {} regions, {} zones, {} devices, {:.2} balance",
        builder.parts(),
        builder.replicas(),
        regions.len(),
        zones.len(),
        builder.devices().len(),
        balance
    )?;
    writeln!(
        out,
        "The minimum number of hours before a partition can be reassigned is {}",
        builder.min_part_hours()
    )?;
    writeln!(
        out,
        "{:>5} {:>6} {:>4} {:>15} {:>5} {:>8} {:>8} {:>10} {:>8} meta",
        "id", "region", "zone", "ip address", "port", "name", "weight", "partitions", "balance"
    )?;
    for dev in builder.devices().iter() {
        let d = &dev.info;
        writeln!(
            out,
            "{:>5} {:>6} {:>4} {:>15} {:>5} {:>8} {:>8.2} {:>10} {:>8.2} {}",
            d.id,
            d.region,
            d.zone,
            d.ip,
            d.port,
            d.device,
            d.weight,
            dev.parts,
            dev_balance(dev.parts, d.weight),
            d.meta
        )?;
    }
    Ok(())
}
