// SPDX-License-Identifier: BSD-3-Clause

//! Decoding of checkpoint image files.
//!
//! An image is an 8 byte header (magic and sub-magic) followed by records. Every record is a
//! little-endian `u32` length and exactly that many bytes of a serialized protobuf message. All
//! records in one image share a schema.

pub mod proto;

use crate::error::{Error, Result};
use log::debug;
use prost::Message;
use std::fs;
use std::path::{Path, PathBuf};

/// Size of the header that precedes the first record.
pub const HEADER_SIZE: usize = 8;

const LEN_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub sub_magic: u32,
}

impl ImageHeader {
    /// Reads the header from the start of `buf`. The values are not checked.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "image is {} bytes, shorter than its {HEADER_SIZE} byte header",
                buf.len()
            )));
        }
        Ok(ImageHeader {
            magic: read_u32(&buf[0..4]),
            sub_magic: read_u32(&buf[4..8]),
        })
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.sub_magic.to_le_bytes());
        out
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0; LEN_SIZE];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

/// Splits the record area of an image into raw payloads, in on-disk order.
fn split_records(mut buf: &[u8]) -> Result<Vec<&[u8]>> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        if buf.len() < LEN_SIZE {
            return Err(Error::malformed(format!(
                "{} trailing bytes cannot hold a record length",
                buf.len()
            )));
        }
        let len = read_u32(&buf[..LEN_SIZE]) as usize;
        let rest = &buf[LEN_SIZE..];
        if len > rest.len() {
            return Err(Error::malformed(format!(
                "record {} declares {len} bytes but only {} remain",
                records.len(),
                rest.len()
            )));
        }
        records.push(&rest[..len]);
        buf = &rest[len..];
    }
    Ok(records)
}

/// Decodes every record of an in-memory image. Either all records decode or none are returned.
pub fn decode_entries<M: Message + Default>(buf: &[u8]) -> Result<Vec<M>> {
    ImageHeader::parse(buf)?;
    split_records(&buf[HEADER_SIZE..])?
        .into_iter()
        .map(|payload| M::decode(payload).map_err(Error::from))
        .collect()
}

/// Serializes `entries` into the image layout understood by [`decode_entries`].
pub fn encode_entries<M: Message>(header: ImageHeader, entries: &[M]) -> Vec<u8> {
    let mut out = header.to_bytes().to_vec();
    for entry in entries {
        let payload = entry.encode_to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
    }
    out
}

/// An image file on disk.
#[derive(Debug, Clone)]
pub struct ImageFile {
    path: PathBuf,
}

impl ImageFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        ImageFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_entries<M: Message + Default>(&self) -> Result<Vec<M>> {
        let buf = fs::read(&self.path)?;
        let header = ImageHeader::parse(&buf)?;
        let entries = decode_entries(&buf)?;
        debug!(
            "{}: magic {:#x}/{:#x}, {} records",
            self.path.display(),
            header.magic,
            header.sub_magic,
            entries.len()
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::proto::{FdTypes, FdinfoEntry};
    use super::*;

    const HEADER: ImageHeader = ImageHeader {
        magic: 0x5474_4319,
        sub_magic: 0x5650_4719,
    };

    fn fdinfo(id: u32, fd: u32) -> FdinfoEntry {
        FdinfoEntry {
            id,
            flags: 0,
            r#type: FdTypes::Reg as i32,
            fd,
            xattr_security_selinux: None,
        }
    }

    #[test]
    fn decode_preserves_order() {
        for n in [0, 1, 17] {
            let entries: Vec<_> = (0..n).map(|i| fdinfo(i, i + 3)).collect();
            let image = encode_entries(HEADER, &entries);
            let decoded: Vec<FdinfoEntry> = decode_entries(&image).unwrap();
            assert_eq!(decoded, entries);
        }
    }

    #[test]
    fn header_is_skipped_not_checked() {
        let image = encode_entries(ImageHeader::default(), &[fdinfo(1, 1)]);
        assert_eq!(ImageHeader::parse(&image).unwrap(), ImageHeader::default());
        assert_eq!(decode_entries::<FdinfoEntry>(&image).unwrap().len(), 1);
    }

    #[test]
    fn overlong_record_is_rejected() {
        let mut image = encode_entries(HEADER, &[fdinfo(1, 1), fdinfo(2, 2)]);
        image.truncate(image.len() - 1);
        let err = decode_entries::<FdinfoEntry>(&image).unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }), "{err}");
    }

    #[test]
    fn short_inputs_are_rejected() {
        assert!(matches!(
            decode_entries::<FdinfoEntry>(&[0; 5]),
            Err(Error::MalformedImage { .. })
        ));

        let mut image = encode_entries(HEADER, &[fdinfo(1, 1)]);
        image.extend_from_slice(&[1, 0]);
        assert!(matches!(
            decode_entries::<FdinfoEntry>(&image),
            Err(Error::MalformedImage { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let mut image = HEADER.to_bytes().to_vec();
        image.extend_from_slice(&3u32.to_le_bytes());
        image.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_entries::<FdinfoEntry>(&image),
            Err(Error::MalformedImage { .. })
        ));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fdinfo-2.img");
        std::fs::write(&path, encode_entries(HEADER, &[fdinfo(4, 0)])).unwrap();

        let entries: Vec<FdinfoEntry> = ImageFile::new(&path).read_entries().unwrap();
        assert_eq!(entries, vec![fdinfo(4, 0)]);
        assert!(ImageFile::new(dir.path().join("missing.img"))
            .read_entries::<FdinfoEntry>()
            .is_err());
    }
}
