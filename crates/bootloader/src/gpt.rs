// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only GUID partition table parsing.

use std::io::{Read, Seek, SeekFrom};

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::Error;

pub const SECTOR_SIZE: u64 = 512;

const SIGNATURE: [u8; 8] = *b"EFI PART";

/// Upper bound on the entry array we are willing to read.
const MAX_ENTRIES_BYTES: u64 = 1024 * 1024;

/// The primary GPT header, found at LBA 1.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Header {
    pub signature: [u8; 8],
    pub revision: U32,
    pub header_size: U32,
    pub header_crc32: U32,
    pub reserved: U32,
    pub current_lba: U64,
    pub backup_lba: U64,
    pub first_usable_lba: U64,
    pub last_usable_lba: U64,
    pub disk_guid: [u8; 16],
    pub entries_lba: U64,
    pub num_entries: U32,
    pub entry_size: U32,
    pub entries_crc32: U32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Entry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: U64,
    pub last_lba: U64,
    pub attributes: U64,
    pub name: [u8; 72],
}

impl Entry {
    pub fn is_used(&self) -> bool {
        self.type_guid != [0; 16]
    }

    /// Byte offset and length of the partition.
    pub fn extent(&self) -> (u64, u64) {
        let first = self.first_lba.get();
        let last = self.last_lba.get();
        (first * SECTOR_SIZE, (last + 1).saturating_sub(first) * SECTOR_SIZE)
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// A parsed partition table. Entries keep their table slot so that slot 0
/// is partition number 1.
#[derive(Debug)]
pub struct Table {
    pub header: Header,
    pub entries: Vec<Entry>,
}

impl Table {
    pub fn read<R: Read + Seek>(disk: &mut R) -> Result<Self, Error> {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        disk.seek(SeekFrom::Start(SECTOR_SIZE)).map_err(Error::Io)?;
        disk.read_exact(&mut sector).map_err(Error::Io)?;

        let (header, _) = Header::read_from_prefix(&sector)
            .map_err(|_| Error::Gpt("short header".to_string()))?;
        if header.signature != SIGNATURE {
            return Err(Error::Gpt("missing EFI PART signature".to_string()));
        }
        let header_size = header.header_size.get() as usize;
        if header_size < std::mem::size_of::<Header>()
            || header_size > sector.len()
        {
            return Err(Error::Gpt(format!("bad header size {header_size}")));
        }
        let mut check = sector;
        check[16..20].fill(0);
        if crc32(&check[..header_size]) != header.header_crc32.get() {
            return Err(Error::Gpt("header checksum mismatch".to_string()));
        }

        let entry_size = header.entry_size.get() as u64;
        let num_entries = header.num_entries.get() as u64;
        if entry_size < std::mem::size_of::<Entry>() as u64 {
            return Err(Error::Gpt(format!("bad entry size {entry_size}")));
        }
        let total = entry_size * num_entries;
        if total > MAX_ENTRIES_BYTES {
            return Err(Error::Gpt(format!("entry array too large: {total}")));
        }

        let mut raw = vec![0u8; total as usize];
        disk.seek(SeekFrom::Start(header.entries_lba.get() * SECTOR_SIZE))
            .map_err(Error::Io)?;
        disk.read_exact(&mut raw).map_err(Error::Io)?;
        if crc32(&raw) != header.entries_crc32.get() {
            return Err(Error::Gpt("entry array checksum mismatch".to_string()));
        }

        let entries = raw
            .chunks_exact(entry_size as usize)
            .filter_map(|chunk| Entry::read_from_prefix(chunk).ok())
            .map(|(e, _)| e)
            .collect();
        Ok(Self { header, entries })
    }

    /// The partition with the given 1-based number, if that slot is used.
    pub fn partition(&self, number: usize) -> Option<&Entry> {
        self.entries.get(number.checked_sub(1)?).filter(|e| e.is_used())
    }

    pub fn used_partitions(&self) -> usize {
        self.entries.iter().filter(|e| e.is_used()).count()
    }
}

/// Whether `disk` carries a GPT with at least one partition.
pub fn has_partitions<R: Read + Seek>(disk: &mut R) -> bool {
    Table::read(disk).map(|t| t.used_partitions() > 0).unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::io::Cursor;

    /// Lay out a GPT disk of `total_sectors` with one partition per
    /// `(first_lba, last_lba)` extent.
    pub(crate) fn build_disk(
        total_sectors: u64,
        parts: &[(u64, u64)],
    ) -> Vec<u8> {
        let mut disk = vec![0u8; (total_sectors * SECTOR_SIZE) as usize];
        let entry_size = std::mem::size_of::<Entry>();
        let num_entries = 128usize;
        let mut entries = vec![0u8; entry_size * num_entries];
        for (i, (first, last)) in parts.iter().enumerate() {
            let entry = Entry {
                type_guid: [0xaa; 16],
                unique_guid: [i as u8 + 1; 16],
                first_lba: U64::new(*first),
                last_lba: U64::new(*last),
                attributes: U64::new(0),
                name: [0; 72],
            };
            entries[i * entry_size..(i + 1) * entry_size]
                .copy_from_slice(entry.as_bytes());
        }

        let mut header = Header {
            signature: SIGNATURE,
            revision: U32::new(0x0001_0000),
            header_size: U32::new(std::mem::size_of::<Header>() as u32),
            header_crc32: U32::new(0),
            reserved: U32::new(0),
            current_lba: U64::new(1),
            backup_lba: U64::new(total_sectors - 1),
            first_usable_lba: U64::new(34),
            last_usable_lba: U64::new(total_sectors - 34),
            disk_guid: [0x11; 16],
            entries_lba: U64::new(2),
            num_entries: U32::new(num_entries as u32),
            entry_size: U32::new(entry_size as u32),
            entries_crc32: U32::new(crc32(&entries)),
        };
        header.header_crc32 = U32::new(crc32(header.as_bytes()));

        let hdr_off = SECTOR_SIZE as usize;
        disk[hdr_off..hdr_off + std::mem::size_of::<Header>()]
            .copy_from_slice(header.as_bytes());
        let ent_off = 2 * SECTOR_SIZE as usize;
        disk[ent_off..ent_off + entries.len()].copy_from_slice(&entries);
        disk
    }

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<Header>(), 92);
        assert_eq!(std::mem::size_of::<Entry>(), 128);
    }

    #[test]
    fn reads_partitions() {
        let disk = build_disk(200, &[(34, 99), (100, 149)]);
        let table = Table::read(&mut Cursor::new(disk)).unwrap();
        assert_eq!(table.used_partitions(), 2);
        let p1 = table.partition(1).unwrap();
        assert_eq!(p1.extent(), (34 * 512, 66 * 512));
        assert!(table.partition(3).is_none());
        assert!(table.partition(0).is_none());
    }

    #[test]
    fn blank_disk_has_no_partitions() {
        let mut blank = Cursor::new(vec![0u8; 64 * 1024]);
        assert!(!has_partitions(&mut blank));
        let mut empty_table = Cursor::new(build_disk(100, &[]));
        assert!(!has_partitions(&mut empty_table));
    }

    #[test]
    fn corrupt_header_rejected() {
        let mut disk = build_disk(200, &[(34, 99)]);
        disk[SECTOR_SIZE as usize + 40] ^= 0xff;
        assert!(matches!(
            Table::read(&mut Cursor::new(disk)),
            Err(Error::Gpt(_))
        ));
    }
}
