// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and writing of `newc` cpio archives.

use std::io::{self, Read, Write};

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

pub const MODE_FILE: u32 = 0o100000;
pub const MODE_DIR: u32 = 0o040000;

fn pad4(len: u64) -> usize {
    ((4 - (len % 4)) % 4) as usize
}

/// Writes a reproducible archive: zero timestamps and owners, sequential
/// inode numbers.
pub struct Writer<W: Write> {
    inner: W,
    written: u64,
    next_ino: u32,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0, next_ino: 1 }
    }

    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let n = pad4(self.written);
        self.put(&[0u8; 4][..n])
    }

    fn header(
        &mut self,
        name: &str,
        mode: u32,
        nlink: u32,
        size: u64,
    ) -> io::Result<()> {
        let size = u32::try_from(size).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "entry too large for cpio")
        })?;
        let ino = if name == TRAILER { 0 } else { self.next_ino };
        self.next_ino += 1;
        let fields = [
            ino,
            mode,
            0, // uid
            0, // gid
            nlink,
            0, // mtime
            size,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        ];
        let mut hdr = Vec::with_capacity(HEADER_LEN + name.len() + 1);
        hdr.extend_from_slice(MAGIC);
        for f in fields {
            hdr.extend_from_slice(format!("{f:08X}").as_bytes());
        }
        hdr.extend_from_slice(name.as_bytes());
        hdr.push(0);
        self.put(&hdr)?;
        self.pad()
    }

    pub fn append_dir(&mut self, name: &str, perm: u32) -> io::Result<()> {
        self.header(name, MODE_DIR | perm, 2, 0)
    }

    pub fn append_file<R: Read>(
        &mut self,
        name: &str,
        perm: u32,
        size: u64,
        mut data: R,
    ) -> io::Result<()> {
        self.header(name, MODE_FILE | perm, 1, size)?;
        let copied = io::copy(&mut (&mut data).take(size), &mut self.inner)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: expected {size} bytes, got {copied}"),
            ));
        }
        self.written += copied;
        self.pad()
    }

    /// Write the trailer and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.header(TRAILER, 0, 1, 0)?;
        Ok(self.inner)
    }
}

struct Counting<R> {
    inner: R,
    read: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

fn skip<R: Read>(r: &mut R, n: u64) -> io::Result<()> {
    io::copy(&mut r.take(n), &mut io::sink()).map(|_| ())
}

fn field(hdr: &[u8], index: usize) -> io::Result<u64> {
    let start = 6 + index * 8;
    std::str::from_utf8(&hdr[start..start + 8])
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "bad cpio header field")
        })
}

/// Scan the (possibly concatenated) archives in `r` for the regular file
/// `name` and copy its contents to `out`. Returns whether it was found.
pub fn extract_file<R: Read, W: Write>(
    r: R,
    name: &str,
    out: &mut W,
) -> io::Result<bool> {
    let mut r = Counting { inner: r, read: 0 };
    loop {
        // Zero padding separates concatenated archives.
        let mut first = [0u8; 1];
        loop {
            if r.read(&mut first)? == 0 {
                return Ok(false);
            }
            if first[0] != 0 {
                break;
            }
        }
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0] = first[0];
        r.read_exact(&mut hdr[1..])?;
        if &hdr[..6] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a newc cpio archive",
            ));
        }
        let mode = field(&hdr, 1)? as u32;
        let size = field(&hdr, 6)?;
        let namesize = field(&hdr, 11)?;

        let mut entry_name = vec![0u8; namesize as usize];
        r.read_exact(&mut entry_name)?;
        let n = pad4(r.read);
        skip(&mut r, n as u64)?;
        let entry_name =
            entry_name.strip_suffix(&[0]).unwrap_or(&entry_name[..]);
        let entry_name = String::from_utf8_lossy(entry_name);
        let entry_name = entry_name.trim_start_matches("./");

        if entry_name == name && mode & 0o170000 == MODE_FILE {
            let copied = io::copy(&mut (&mut r).take(size), out)?;
            if copied != size {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            return Ok(true);
        }
        skip(&mut r, size)?;
        let n = pad4(r.read);
        skip(&mut r, n as u64)?;
    }
}
