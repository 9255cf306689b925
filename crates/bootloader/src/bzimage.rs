// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload extraction from a compressed kernel image.

use std::io::{Cursor, Read};

use crate::Error;

/// How far into the image the payload magic is searched for.
pub const SCAN_WINDOW: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Gzip,
    Bzip2,
}

impl Compression {
    const ALL: [Compression; 3] =
        [Compression::Xz, Compression::Gzip, Compression::Bzip2];

    pub fn magic(&self) -> &'static [u8] {
        match self {
            Compression::Xz => &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
            Compression::Gzip => &[0x1f, 0x8b, 0x08],
            Compression::Bzip2 => b"BZh",
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The earliest payload magic within `head`.
pub fn detect(head: &[u8]) -> Option<(Compression, usize)> {
    Compression::ALL
        .iter()
        .filter_map(|c| find(head, c.magic()).map(|off| (*c, off)))
        .min_by_key(|(_, off)| *off)
}

/// A reader producing the decompressed payload of the image in `image`.
pub fn decompressor<'a, R: Read + 'a>(
    mut image: R,
) -> Result<Box<dyn Read + 'a>, Error> {
    let mut head = Vec::with_capacity(SCAN_WINDOW);
    (&mut image)
        .take(SCAN_WINDOW as u64)
        .read_to_end(&mut head)
        .map_err(Error::Io)?;

    let (kind, offset) = detect(&head).ok_or(Error::NoKernelPayload)?;
    let payload = head.split_off(offset);
    let stream = Cursor::new(payload).chain(image);

    Ok(match kind {
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(stream)),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(stream)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(stream)),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn compress(kind: Compression, data: &[u8]) -> Vec<u8> {
        match kind {
            Compression::Xz => {
                let mut e = xz2::write::XzEncoder::new(Vec::new(), 6);
                e.write_all(data).unwrap();
                e.finish().unwrap()
            }
            Compression::Gzip => {
                let mut e = flate2::write::GzEncoder::new(
                    Vec::new(),
                    flate2::Compression::default(),
                );
                e.write_all(data).unwrap();
                e.finish().unwrap()
            }
            Compression::Bzip2 => {
                let mut e = bzip2::write::BzEncoder::new(
                    Vec::new(),
                    bzip2::Compression::default(),
                );
                e.write_all(data).unwrap();
                e.finish().unwrap()
            }
        }
    }

    fn image(kind: Compression, stub_len: usize, payload: &[u8]) -> Vec<u8> {
        // The stub is filled with a byte that cannot start any magic.
        let mut img = vec![0x90u8; stub_len];
        img.extend(compress(kind, payload));
        img
    }

    #[test]
    fn detects_earliest_magic() {
        let mut head = vec![0u8; 32];
        head[20..23].copy_from_slice(b"BZh");
        head[4..7].copy_from_slice(&[0x1f, 0x8b, 0x08]);
        assert_eq!(detect(&head), Some((Compression::Gzip, 4)));
        assert_eq!(detect(&[0u8; 16]), None);
    }

    #[test]
    fn magic_past_window_not_found() {
        let img = image(Compression::Gzip, SCAN_WINDOW + 10, b"kernel");
        assert!(matches!(
            decompressor(Cursor::new(img)),
            Err(Error::NoKernelPayload)
        ));
    }

    proptest! {
        #[test]
        fn payload_round_trips(
            kind in prop::sample::select(Compression::ALL.to_vec()),
            stub_len in 0usize..4096,
            payload in prop::collection::vec(any::<u8>(), 0..8192),
        ) {
            let img = image(kind, stub_len, &payload);
            let mut out = Vec::new();
            decompressor(Cursor::new(img)).unwrap().read_to_end(&mut out).unwrap();
            prop_assert_eq!(out, payload);
        }
    }
}
