// Copyright 2024 Balena Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MBR partition table editing for the boot-partition repartitioner, and
//! read-only discovery of the logical partitions inside the extended
//! partition (`resin-conf`, `resin-data`).
//!
//! The repartitioner only ever resizes the three primary partitions
//! (`resin-boot`, and whichever of `resin-rootA`/`resin-rootB` is inactive).
//! It never touches the extended partition or the logical volumes inside
//! it, so those are discovered by walking the EBR chain rather than
//! modeled as editable entries.

use anyhow::{bail, Context, Result};
use mbrman::{MBRPartitionEntry, CHS, MBR};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};

use crate::topology::get_sector_size;

pub const PARTITION_TYPE_FAT32_LBA: u8 = 0x0c;
pub const PARTITION_TYPE_LINUX: u8 = 0x83;
pub const PARTITION_TYPE_EXTENDED_LBA: u8 = 0x0f;

/// One primary slot (1-4) in the MBR partition table.
#[derive(Debug, Clone, Copy)]
pub struct PrimarySlot {
    pub number: u32,
    pub starting_lba: u32,
    pub sectors: u32,
    pub sys: u8,
}

pub struct PartitionTable {
    file: File,
    sector_size: u32,
    mbr: MBR,
}

impl PartitionTable {
    pub fn open(disk_path: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(disk_path)
            .with_context(|| format!("opening {}", disk_path))?;
        let sector_size = get_sector_size(&file)?.get();
        let mbr = MBR::read_from(&mut file, sector_size)
            .with_context(|| format!("reading MBR of {}", disk_path))?;
        Ok(PartitionTable {
            file,
            sector_size,
            mbr,
        })
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn slot(&self, number: u32) -> Result<PrimarySlot> {
        if !(1..=4).contains(&number) {
            bail!("partition number {} is not a primary slot", number);
        }
        let entry = &self.mbr[number as usize];
        Ok(PrimarySlot {
            number,
            starting_lba: entry.starting_lba,
            sectors: entry.sectors,
            sys: entry.sys,
        })
    }

    /// Resize the partition at `number` in place, keeping its starting LBA
    /// and partition type, changing only its sector count. Used to shrink
    /// the about-to-be-reformatted twin root partition (state A) and later
    /// to grow resin-boot into the reclaimed space (state D).
    pub fn resize(&mut self, number: u32, new_sectors: u32) -> Result<()> {
        let existing = self.slot(number)?;
        let entry = MBRPartitionEntry {
            boot: self.mbr[number as usize].boot,
            first_chs: CHS::empty(),
            sys: existing.sys,
            last_chs: CHS::empty(),
            starting_lba: existing.starting_lba,
            sectors: new_sectors,
        };
        self.mbr[number as usize] = entry;
        Ok(())
    }

    /// Move the partition at `number` to start at `new_lba` and have
    /// `new_sectors` sectors, keeping its type. Used to relocate
    /// resin-boot so it can grow downward into the space freed by
    /// shrinking its twin.
    pub fn relocate(&mut self, number: u32, new_lba: u32, new_sectors: u32) -> Result<()> {
        let existing = self.slot(number)?;
        let entry = MBRPartitionEntry {
            boot: self.mbr[number as usize].boot,
            first_chs: CHS::empty(),
            sys: existing.sys,
            last_chs: CHS::empty(),
            starting_lba: new_lba,
            sectors: new_sectors,
        };
        self.mbr[number as usize] = entry;
        Ok(())
    }

    pub fn write(&mut self) -> Result<()> {
        self.mbr
            .write_into(&mut self.file)
            .context("writing MBR partition table")?;
        self.file.sync_all().context("syncing disk after MBR write")?;
        Ok(())
    }
}

/// One logical partition discovered inside the extended partition.
#[derive(Debug, Clone)]
pub struct LogicalPartition {
    pub starting_lba: u64,
    pub sectors: u64,
    pub sys: u8,
}

/// Walk the Extended Boot Record chain of the extended partition (sys type
/// `0x05`/`0x0f`) and return its logical partitions in on-disk order. The
/// kernel numbers these 5, 6, 7... in the same order, so the Nth entry
/// returned here corresponds to partition index `4 + N`.
pub fn read_logical_partitions(disk_path: &str, extended_starting_lba: u64) -> Result<Vec<LogicalPartition>> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(disk_path)
        .with_context(|| format!("opening {}", disk_path))?;
    let sector_size = get_sector_size(&file)?.get() as u64;

    let mut result = Vec::new();
    let mut ebr_lba = extended_starting_lba;
    loop {
        file.seek(SeekFrom::Start(ebr_lba * sector_size))
            .context("seeking to EBR")?;
        let mut sector = vec![0u8; sector_size as usize];
        file.read_exact(&mut sector).context("reading EBR sector")?;

        if sector[510] != 0x55 || sector[511] != 0xAA {
            bail!("invalid EBR signature at LBA {}", ebr_lba);
        }

        // First entry of an EBR describes the logical partition itself,
        // relative to the EBR's own LBA.
        let first = parse_mbr_entry(&sector[446..462]);
        if first.sectors != 0 {
            result.push(LogicalPartition {
                starting_lba: ebr_lba + first.starting_lba as u64,
                sectors: first.sectors as u64,
                sys: first.sys,
            });
        }

        // Second entry, if present, points to the next EBR, relative to
        // the start of the extended partition.
        let next = parse_mbr_entry(&sector[462..478]);
        if next.sectors == 0 {
            break;
        }
        ebr_lba = extended_starting_lba + next.starting_lba as u64;
    }
    Ok(result)
}

struct RawEntry {
    sys: u8,
    starting_lba: u32,
    sectors: u32,
}

fn parse_mbr_entry(bytes: &[u8]) -> RawEntry {
    RawEntry {
        sys: bytes[4],
        starting_lba: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        sectors: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mbr_entry_reads_little_endian_fields() {
        let mut bytes = [0u8; 16];
        bytes[4] = 0x83;
        bytes[8..12].copy_from_slice(&2048u32.to_le_bytes());
        bytes[12..16].copy_from_slice(&4096u32.to_le_bytes());
        let entry = parse_mbr_entry(&bytes);
        assert_eq!(entry.sys, 0x83);
        assert_eq!(entry.starting_lba, 2048);
        assert_eq!(entry.sectors, 4096);
    }
}
