//! Serializable ring snapshot and the ring file format.
//!
//! A ring file is a gzip stream. Inside it:
//!
//! - 4 bytes magic `R1NG`
//! - 2 bytes big-endian format version (1)
//! - 4 bytes big-endian length of the JSON header
//! - the JSON header `{"devs": [...], "part_shift": N, "replica_count": N}`
//! - `replica_count` arrays of little-endian u16 device ids, each holding
//!   `2^(32 - part_shift)` entries except the last, which may be shorter
//!
//! Streams without the magic are read as a legacy JSON document
//! `{"devs": [...], "part_shift": N, "replica2part2dev_id": [[...], ...]}`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use tracing::{debug, info};

use crate::device::{Device, DeviceId};
use crate::error::{RingError, RingResult};

/// Ring file magic.
pub const RING_MAGIC: &[u8; 4] = b"R1NG";
/// Current ring format version.
pub const RING_FORMAT_VERSION: u16 = 1;
/// Modification time stamped into every gzip header, so identical rings
/// produce identical files.
pub const RING_GZIP_MTIME: u32 = 1300507380;

/// Immutable partition-to-device assignment plus the device list.
#[derive(Debug, Clone, PartialEq)]
pub struct RingData {
    devs: Vec<Option<Device>>,
    replica2part2dev_id: Vec<Vec<DeviceId>>,
    part_shift: u32,
}

#[derive(Serialize)]
struct HeaderOut<'a> {
    devs: &'a [Option<Device>],
    part_shift: u32,
    replica_count: usize,
}

#[derive(Deserialize)]
struct HeaderIn {
    devs: Vec<Option<Device>>,
    part_shift: u32,
    replica_count: usize,
}

#[derive(Deserialize)]
struct LegacyRing {
    devs: Vec<Option<Device>>,
    part_shift: u32,
    replica2part2dev_id: Vec<Vec<DeviceId>>,
}

fn corrupt(reason: impl Into<String>) -> RingError {
    RingError::CorruptRing {
        reason: reason.into(),
    }
}

impl RingData {
    /// Wraps an assignment table and device list.
    pub fn new(
        replica2part2dev_id: Vec<Vec<DeviceId>>,
        devs: Vec<Option<Device>>,
        part_shift: u32,
    ) -> Self {
        Self {
            devs,
            replica2part2dev_id,
            part_shift,
        }
    }

    /// Devices indexed by id; removed devices are `None`.
    pub fn devs(&self) -> &[Option<Device>] {
        &self.devs
    }

    /// Replica index -> partition -> device id.
    pub fn replica2part2dev_id(&self) -> &[Vec<DeviceId>] {
        &self.replica2part2dev_id
    }

    /// `32 - part_power`.
    pub fn part_shift(&self) -> u32 {
        self.part_shift
    }

    /// Number of replica arrays, the partial one included.
    pub fn replica_count(&self) -> usize {
        self.replica2part2dev_id.len()
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.replica2part2dev_id.first().map_or(0, Vec::len)
    }

    /// Distinct devices holding `part`, in replica order.
    pub fn part_devices(&self, part: usize) -> Vec<&Device> {
        let mut nodes: Vec<&Device> = Vec::new();
        for part2dev in &self.replica2part2dev_id {
            let Some(&dev_id) = part2dev.get(part) else {
                continue;
            };
            let Some(Some(dev)) = self.devs.get(dev_id as usize) else {
                continue;
            };
            if !nodes.iter().any(|n| n.id == dev_id) {
                nodes.push(dev);
            }
        }
        nodes
    }

    /// Writes the uncompressed version 1 stream.
    pub fn serialize_v1<W: Write>(&self, out: &mut W) -> RingResult<()> {
        let header = HeaderOut {
            devs: &self.devs,
            part_shift: self.part_shift,
            replica_count: self.replica2part2dev_id.len(),
        };
        let mut json = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut json, SpacedAsciiFormatter);
        header
            .serialize(&mut ser)
            .map_err(|e| RingError::Serialization {
                reason: e.to_string(),
            })?;
        let json_len = u32::try_from(json.len()).map_err(|_| RingError::Serialization {
            reason: format!("ring header too large: {} bytes", json.len()),
        })?;

        out.write_all(RING_MAGIC)?;
        out.write_all(&RING_FORMAT_VERSION.to_be_bytes())?;
        out.write_all(&json_len.to_be_bytes())?;
        out.write_all(&json)?;
        for part2dev in &self.replica2part2dev_id {
            let mut raw = Vec::with_capacity(part2dev.len() * 2);
            for id in part2dev {
                raw.extend_from_slice(&id.to_le_bytes());
            }
            out.write_all(&raw)?;
        }
        Ok(())
    }

    /// Uncompressed stream as bytes.
    pub fn to_bytes(&self) -> RingResult<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize_v1(&mut out)?;
        Ok(out)
    }

    /// Parses an uncompressed stream, current or legacy.
    pub fn from_bytes(data: &[u8]) -> RingResult<Self> {
        let ring = match data.strip_prefix(RING_MAGIC.as_slice()) {
            Some(rest) => {
                let (version, rest) = split(rest, 2, "format version")?;
                let version = u16::from_be_bytes([version[0], version[1]]);
                if version != RING_FORMAT_VERSION {
                    return Err(RingError::UnknownFormatVersion {
                        version: version as u32,
                    });
                }
                Self::deserialize_v1(rest)?
            }
            None => {
                debug!("ring stream has no magic, reading legacy format");
                let legacy: LegacyRing = serde_json::from_slice(data)
                    .map_err(|e| corrupt(format!("unrecognised ring stream: {}", e)))?;
                Self::new(legacy.replica2part2dev_id, legacy.devs, legacy.part_shift)
            }
        };
        ring.check()?;
        Ok(ring)
    }

    /// Parses the body of a version 1 stream (after magic and version).
    fn deserialize_v1(data: &[u8]) -> RingResult<Self> {
        let (len, rest) = split(data, 4, "header length")?;
        let json_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        let (json, mut rest) = split(rest, json_len, "header")?;
        let header: HeaderIn = serde_json::from_slice(json)
            .map_err(|e| corrupt(format!("ring header unreadable: {}", e)))?;
        if header.part_shift > 32 {
            return Err(corrupt(format!("part_shift {} out of range", header.part_shift)));
        }
        let full_len = 2usize << (32 - header.part_shift);

        let mut table = Vec::new();
        for replica in 0..header.replica_count {
            let take = full_len.min(rest.len());
            if take < full_len && replica + 1 != header.replica_count {
                return Err(corrupt(format!("replica {} array is truncated", replica)));
            }
            if take == 0 || take % 2 != 0 {
                return Err(corrupt(format!(
                    "replica {} array has {} bytes",
                    replica, take
                )));
            }
            let (raw, tail) = rest.split_at(take);
            table.push(
                raw.chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            );
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(corrupt(format!("{} trailing bytes after replica arrays", rest.len())));
        }
        Ok(Self::new(table, header.devs, header.part_shift))
    }

    /// Rejects tables that point at missing devices or disagree on size.
    fn check(&self) -> RingResult<()> {
        if self.part_shift > 32 {
            return Err(corrupt(format!("part_shift {} out of range", self.part_shift)));
        }
        let parts = 1u64 << (32 - self.part_shift);
        for (replica, part2dev) in self.replica2part2dev_id.iter().enumerate() {
            let len = part2dev.len() as u64;
            let last = replica + 1 == self.replica2part2dev_id.len();
            if len == 0 || len > parts || (len < parts && !last) {
                return Err(corrupt(format!(
                    "replica {} has {} partitions, expected {}",
                    replica, len, parts
                )));
            }
            for (part, &dev_id) in part2dev.iter().enumerate() {
                if !matches!(self.devs.get(dev_id as usize), Some(Some(_))) {
                    return Err(corrupt(format!(
                        "partition {} replica {} refers to missing device {}",
                        part, replica, dev_id
                    )));
                }
            }
        }
        for (slot, dev) in self.devs.iter().enumerate() {
            if let Some(dev) = dev {
                if dev.id as usize != slot {
                    return Err(corrupt(format!(
                        "device {} stored in slot {}",
                        dev.id, slot
                    )));
                }
            }
        }
        Ok(())
    }

    /// Gzip-compressed ring file contents.
    pub fn to_gzip_bytes(&self) -> RingResult<Vec<u8>> {
        let mut gz = GzBuilder::new()
            .mtime(RING_GZIP_MTIME)
            .write(Vec::new(), Compression::best());
        self.serialize_v1(&mut gz)?;
        Ok(gz.finish()?)
    }

    /// Parses gzip-compressed ring file contents.
    pub fn from_gzip_bytes(data: &[u8]) -> RingResult<Self> {
        let mut raw = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut raw)
            .map_err(|e| corrupt(format!("gzip stream unreadable: {}", e)))?;
        Self::from_bytes(&raw)
    }

    /// Writes the ring file through a temporary file and a rename.
    pub fn save(&self, path: impl AsRef<Path>) -> RingResult<()> {
        let path = path.as_ref();
        let encoded = self.to_gzip_bytes()?;
        let mut tmp_path = path.to_path_buf();
        tmp_path.set_extension("tmp");

        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        info!(
            path = %path.display(),
            replicas = self.replica_count(),
            partitions = self.partition_count(),
            "wrote ring file"
        );
        Ok(())
    }

    /// Reads a ring file.
    pub fn load(path: impl AsRef<Path>) -> RingResult<Self> {
        let data = fs::read(path.as_ref())?;
        Self::from_gzip_bytes(&data)
    }
}

fn split<'a>(data: &'a [u8], n: usize, what: &str) -> RingResult<(&'a [u8], &'a [u8])> {
    if data.len() < n {
        return Err(corrupt(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            data.len()
        )));
    }
    Ok(data.split_at(n))
}

/// JSON formatting with `", "` and `": "` separators and non-ASCII
/// characters escaped as `\uXXXX`.
struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}
