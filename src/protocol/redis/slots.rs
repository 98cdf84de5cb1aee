use std::collections::BTreeSet;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::utils::{crc16, trim_hash_tag};

use super::{RespValue, SLOT_COUNT};

/// Owner of every hash slot. Unassigned slots hold an empty string.
#[derive(Debug, Clone)]
pub struct SlotMap {
    owners: Vec<String>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            owners: vec![String::new(); SLOT_COUNT as usize],
        }
    }

    /// Builds a map from `(start, end, node)` ranges, both ends inclusive.
    pub fn from_ranges<'a, I>(ranges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u16, u16, &'a str)>,
    {
        let mut layout = Self::new();
        for (start, end, node) in ranges {
            layout.assign(start, end, node)?;
        }
        Ok(layout)
    }

    pub fn assign(&mut self, start: u16, end: u16, node: &str) -> Result<()> {
        if start > end || end >= SLOT_COUNT {
            bail!("slot range {}-{} out of bounds", start, end);
        }
        for slot in start..=end {
            self.owners[slot as usize] = node.to_string();
        }
        Ok(())
    }

    pub fn owner_of(&self, slot: u16) -> Option<&str> {
        self.owners
            .get(slot as usize)
            .and_then(|s| if s.is_empty() { None } else { Some(s.as_str()) })
    }

    pub fn all_nodes(&self) -> Vec<String> {
        self.owners
            .iter()
            .filter(|owner| !owner.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Contiguous runs of slots sharing one owner, in slot order.
    pub fn ranges(&self) -> Vec<(u16, u16, &str)> {
        let mut ranges: Vec<(u16, u16, &str)> = Vec::new();
        for (slot, owner) in self.owners.iter().enumerate() {
            if owner.is_empty() {
                continue;
            }
            let slot = slot as u16;
            match ranges.last_mut() {
                Some((_, end, node)) if *node == owner.as_str() && *end + 1 == slot => {
                    *end = slot;
                }
                _ => ranges.push((slot, slot, owner.as_str())),
            }
        }
        ranges
    }

    pub fn assigned_count(&self) -> usize {
        self.owners.iter().filter(|owner| !owner.is_empty()).count()
    }

    /// `CLUSTER SLOTS` rendering of this map.
    pub fn to_slots_reply(&self) -> RespValue {
        let entries = self
            .ranges()
            .into_iter()
            .map(|(start, end, node)| {
                let (host, port) = node.rsplit_once(':').unwrap_or((node, "0"));
                let port = port.parse::<i64>().unwrap_or(0);
                RespValue::Array(vec![
                    RespValue::Integer(start as i64),
                    RespValue::Integer(end as i64),
                    RespValue::Array(vec![
                        RespValue::BulkString(Bytes::copy_from_slice(host.as_bytes())),
                        RespValue::Integer(port),
                    ]),
                ])
            })
            .collect();
        RespValue::Array(entries)
    }
}

pub fn hash_slot(key: &[u8], hash_tag: Option<&[u8]>) -> u16 {
    crc16(trim_hash_tag(key, hash_tag)) % SLOT_COUNT
}
