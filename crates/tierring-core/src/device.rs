//! Device records, the sparse device registry, and device search patterns.
//!
//! Device ids are stable: removing a device leaves a hole in the registry and
//! the id is only reused when a caller explicitly adds a device with that id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RingError, RingResult};

/// Stable device identifier. Ring files store ids as 16-bit integers.
pub type DeviceId = u16;

fn default_region() -> u32 {
    1
}

/// A storage device as seen by ring readers.
///
/// Fields are declared in lexicographic order so the JSON header of a ring
/// file carries sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device name on disk (e.g. `sdb1`).
    pub device: String,
    /// Unique device id.
    pub id: DeviceId,
    /// IP address of the server holding the device.
    pub ip: String,
    /// Free-form operator metadata.
    #[serde(default)]
    pub meta: String,
    /// TCP port of the storage server.
    pub port: u16,
    /// Region; rings written before regions existed default to 1.
    #[serde(default = "default_region")]
    pub region: u32,
    /// Relative capacity; 0 means the device is being drained.
    pub weight: f64,
    /// Zone within the region.
    pub zone: u32,
}

impl Device {
    /// Returns the `ip:port` label identifying the device's server.
    pub fn server_label(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}r{}z{}-", self.id, self.region, self.zone)?;
        if self.ip.contains(':') {
            write!(f, "[{}]", self.ip)?;
        } else {
            write!(f, "{}", self.ip)?;
        }
        write!(f, ":{}/{}_\"{}\"", self.port, self.device, self.meta)
    }
}

/// Description of a device to add to a builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Explicit id, or `None` to take the next id after the highest live id.
    pub id: Option<DeviceId>,
    /// Region.
    pub region: u32,
    /// Zone within the region.
    pub zone: u32,
    /// Server IP address.
    pub ip: String,
    /// Server port.
    pub port: u16,
    /// Device name on disk.
    pub device: String,
    /// Relative weight.
    pub weight: f64,
    /// Free-form metadata.
    pub meta: String,
}

impl DeviceSpec {
    /// Creates a spec with an automatically assigned id and empty metadata.
    pub fn new(
        region: u32,
        zone: u32,
        ip: impl Into<String>,
        port: u16,
        device: impl Into<String>,
        weight: f64,
    ) -> Self {
        Self {
            id: None,
            region,
            zone,
            ip: ip.into(),
            port,
            device: device.into(),
            weight,
            meta: String::new(),
        }
    }

    /// Requests a specific device id.
    pub fn with_id(mut self, id: DeviceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Attaches metadata.
    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = meta.into();
        self
    }
}

/// A device together with the builder's running partition accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderDevice {
    /// The device record published to rings.
    pub info: Device,
    /// Partition-replicas currently assigned to the device.
    pub parts: u32,
    /// Signed distance to the weight-proportional target; negative means overloaded.
    pub parts_wanted: i64,
}

/// Sparse table of devices indexed by id, with holes for removed devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistry {
    slots: Vec<Option<BuilderDevice>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, holes included. Equals the highest id ever used plus one.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of live devices.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns true if no live device exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the live device with the given id.
    pub fn get(&self, id: DeviceId) -> Option<&BuilderDevice> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    /// Returns the live device with the given id, mutably.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut BuilderDevice> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    /// Like [`get`](Self::get) but fails with `DeviceNotFound`.
    pub fn require(&self, id: DeviceId) -> RingResult<&BuilderDevice> {
        self.get(id).ok_or(RingError::DeviceNotFound { id })
    }

    /// Like [`get_mut`](Self::get_mut) but fails with `DeviceNotFound`.
    pub fn require_mut(&mut self, id: DeviceId) -> RingResult<&mut BuilderDevice> {
        self.get_mut(id).ok_or(RingError::DeviceNotFound { id })
    }

    /// Returns true if `id` refers to a live device.
    pub fn contains(&self, id: DeviceId) -> bool {
        self.get(id).is_some()
    }

    /// Iterates over live devices in id order.
    pub fn iter(&self) -> impl Iterator<Item = &BuilderDevice> {
        self.slots.iter().flatten()
    }

    /// Iterates mutably over live devices in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BuilderDevice> {
        self.slots.iter_mut().flatten()
    }

    /// Sum of the weights of all live devices.
    pub fn total_weight(&self) -> f64 {
        self.iter().map(|d| d.info.weight).sum()
    }

    /// Picks the id a spec will receive, without mutating the registry.
    pub fn resolve_id(&self, spec: &DeviceSpec) -> RingResult<DeviceId> {
        match spec.id {
            Some(id) if self.contains(id) => Err(RingError::DuplicateDevice { id }),
            Some(id) => Ok(id),
            None => match self.iter().map(|d| d.info.id).max() {
                None => Ok(0),
                Some(max) => max.checked_add(1).ok_or(RingError::DeviceIdExhausted),
            },
        }
    }

    /// Inserts a device built from `spec`, growing the slot table with holes as needed.
    pub fn insert(&mut self, spec: DeviceSpec) -> RingResult<DeviceId> {
        let id = self.resolve_id(&spec)?;
        if self.slots.len() <= id as usize {
            self.slots.resize(id as usize + 1, None);
        }
        self.slots[id as usize] = Some(BuilderDevice {
            info: Device {
                device: spec.device,
                id,
                ip: spec.ip,
                meta: spec.meta,
                port: spec.port,
                region: spec.region,
                weight: spec.weight,
                zone: spec.zone,
            },
            parts: 0,
            parts_wanted: 0,
        });
        Ok(id)
    }

    /// Turns the slot for `id` into a hole, returning the removed device.
    pub fn tombstone(&mut self, id: DeviceId) -> Option<BuilderDevice> {
        self.slots.get_mut(id as usize).and_then(|s| s.take())
    }

    /// Device records without builder accounting, holes preserved.
    pub fn ring_devices(&self) -> Vec<Option<Device>> {
        self.slots
            .iter()
            .map(|s| s.as_ref().map(|d| d.info.clone()))
            .collect()
    }

    /// Returns the live devices matching `pattern`.
    pub fn search(&self, pattern: &DevicePattern) -> Vec<&BuilderDevice> {
        self.iter().filter(|d| pattern.matches(&d.info)).collect()
    }
}

/// Structured device predicate parsed from a search string.
///
/// The grammar is `d<id>r<region>z<zone>-<ip>:<port>/<device>_<meta>`. Every
/// part is optional but at least one must be present. The `-` before the ip
/// may be omitted when neither id nor zone precede it, and IPv6 addresses are
/// written in brackets. `meta` matches as a substring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePattern {
    /// Exact device id.
    pub id: Option<DeviceId>,
    /// Exact region.
    pub region: Option<u32>,
    /// Exact zone.
    pub zone: Option<u32>,
    /// Exact ip address.
    pub ip: Option<String>,
    /// Exact port.
    pub port: Option<u16>,
    /// Exact device name.
    pub device: Option<String>,
    /// Metadata substring.
    pub meta: Option<String>,
}

impl DevicePattern {
    /// Returns true if every present term matches `dev`.
    pub fn matches(&self, dev: &Device) -> bool {
        self.id.map_or(true, |v| dev.id == v)
            && self.region.map_or(true, |v| dev.region == v)
            && self.zone.map_or(true, |v| dev.zone == v)
            && self.ip.as_ref().map_or(true, |v| &dev.ip == v)
            && self.port.map_or(true, |v| dev.port == v)
            && self.device.as_ref().map_or(true, |v| &dev.device == v)
            && self.meta.as_ref().map_or(true, |v| dev.meta.contains(v.as_str()))
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Splits a leading run of characters accepted by `accept` off `s`.
fn take_while(s: &str, accept: impl Fn(char) -> bool) -> (&str, &str) {
    let end = s.find(|c: char| !accept(c)).unwrap_or(s.len());
    s.split_at(end)
}

fn prefixed_number<T: FromStr>(s: &str, prefix: char) -> Result<Option<(T, &str)>, ()> {
    let Some(rest) = s.strip_prefix(prefix) else {
        return Ok(None);
    };
    let (digits, rest) = take_while(rest, |c| c.is_ascii_digit());
    let value = digits.parse().map_err(|_| ())?;
    Ok(Some((value, rest)))
}

impl FromStr for DevicePattern {
    type Err = RingError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || RingError::InvalidSearchPattern {
            pattern: input.to_string(),
        };
        let mut pattern = DevicePattern::default();
        let mut s = input;

        if let Some((id, rest)) = prefixed_number(s, 'd').map_err(|_| invalid())? {
            pattern.id = Some(id);
            s = rest;
        }
        if let Some((region, rest)) = prefixed_number(s, 'r').map_err(|_| invalid())? {
            pattern.region = Some(region);
            s = rest;
        }
        if let Some((zone, rest)) = prefixed_number(s, 'z').map_err(|_| invalid())? {
            pattern.zone = Some(zone);
            s = rest;
        }
        if let Some(rest) = s.strip_prefix('-') {
            s = rest;
        }
        if s.starts_with(|c: char| c.is_ascii_digit()) {
            let (ip, rest) = take_while(s, |c| c.is_ascii_digit() || c == '.');
            pattern.ip = Some(ip.to_string());
            s = rest;
        } else if let Some(rest) = s.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(invalid)?;
            pattern.ip = Some(rest[..close].to_string());
            s = &rest[close + 1..];
        }
        if let Some((port, rest)) = prefixed_number(s, ':').map_err(|_| invalid())? {
            pattern.port = Some(port);
            s = rest;
        }
        if let Some(rest) = s.strip_prefix('/') {
            let (name, rest) = take_while(rest, |c| c != '_');
            pattern.device = Some(name.to_string());
            s = rest;
        }
        if let Some(rest) = s.strip_prefix('_') {
            let meta = rest
                .strip_prefix('"')
                .and_then(|m| m.strip_suffix('"'))
                .unwrap_or(rest);
            pattern.meta = Some(meta.to_string());
            s = "";
        }

        if !s.is_empty() || pattern.is_empty() {
            return Err(invalid());
        }
        Ok(pattern)
    }
}
