// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parser for the vendor firmware container.
//!
//! The container is a fixed header followed by length-prefixed sections:
//! allowed source families, the target family and version, the decrypt-key
//! fingerprints the chip must hold, the ordered payload blocks, and the
//! signed trailer the chip verifies itself. The parser never talks to the
//! chip; compatibility against the live chip is judged by the state probe's
//! output.

use crate::codec::Reader;
use crate::fieldupgrade::KEY_DIGEST_SIZE;
use thiserror::Error;

/// "IFXU"
pub const CONTAINER_MAGIC: u32 = 0x4946_5855;
/// The one container layout this tool understands.
pub const CONTAINER_VERSION: u16 = 0x0001;

const SECTION_HEADER_SIZE: usize = 6;
const HEADER_SIZE: usize = 8;

// Section tags.
const SECTION_SOURCE_FAMILIES: u16 = 0x0001;
const SECTION_TARGET: u16 = 0x0002;
const SECTION_KEY_DIGESTS: u16 = 0x0003;
const SECTION_PAYLOAD_BLOCK: u16 = 0x0004;
const SECTION_TRAILER: u16 = 0x0005;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FwImageError {
    #[error("corrupt firmware image: {0}")]
    Corrupt(&'static str),
    #[error("firmware image container version {0:#06x} requires a newer tool")]
    NewerToolRequired(u16),
}

/// A parsed firmware image. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub source_family_tags: Vec<u16>,
    pub target_family_tag: u16,
    pub target_version: String,
    pub key_digests: Vec<[u8; KEY_DIGEST_SIZE]>,
    pub payload_blocks: Vec<Vec<u8>>,
    pub trailer: Vec<u8>,
}

impl FirmwareImage {
    pub fn parse(data: &[u8]) -> Result<Self, FwImageError> {
        let mut reader = Reader::new(data);
        let magic = reader
            .read_u32()
            .map_err(|_| FwImageError::Corrupt("file too short for the header"))?;
        if magic != CONTAINER_MAGIC {
            return Err(FwImageError::Corrupt("magic mismatch"));
        }
        let version = reader
            .read_u16()
            .map_err(|_| FwImageError::Corrupt("file too short for the header"))?;
        // An unknown layout is not corruption; a newer tool knows it.
        if version != CONTAINER_VERSION {
            return Err(FwImageError::NewerToolRequired(version));
        }
        let section_count = reader
            .read_u16()
            .map_err(|_| FwImageError::Corrupt("file too short for the header"))?
            as usize;

        let mut source_family_tags = Vec::new();
        let mut target = None;
        let mut key_digests = Vec::new();
        let mut payload_blocks = Vec::new();
        let mut trailer = Vec::new();
        let mut section_bytes = 0usize;

        for _ in 0..section_count {
            let tag = reader
                .read_u16()
                .map_err(|_| FwImageError::Corrupt("truncated section header"))?;
            let length = reader
                .read_u32()
                .map_err(|_| FwImageError::Corrupt("truncated section header"))?
                as usize;
            let body = reader
                .read_bytes(length)
                .map_err(|_| FwImageError::Corrupt("section length exceeds the file"))?;
            section_bytes += SECTION_HEADER_SIZE + length;

            let mut section = Reader::new(body);
            match tag {
                SECTION_SOURCE_FAMILIES => {
                    let count = section
                        .read_u16()
                        .map_err(|_| FwImageError::Corrupt("source family list truncated"))?;
                    for _ in 0..count {
                        source_family_tags.push(section.read_u16().map_err(|_| {
                            FwImageError::Corrupt("source family list truncated")
                        })?);
                    }
                }
                SECTION_TARGET => {
                    let family = section
                        .read_u16()
                        .map_err(|_| FwImageError::Corrupt("target section truncated"))?;
                    let version = section
                        .read_sized_blob()
                        .map_err(|_| FwImageError::Corrupt("target version truncated"))?;
                    let version = std::str::from_utf8(version)
                        .map_err(|_| FwImageError::Corrupt("target version is not ASCII"))?;
                    target = Some((family, version.to_string()));
                }
                SECTION_KEY_DIGESTS => {
                    let count = section
                        .read_u16()
                        .map_err(|_| FwImageError::Corrupt("key digest list truncated"))?;
                    for _ in 0..count {
                        key_digests.push(section.read_array::<KEY_DIGEST_SIZE>().map_err(
                            |_| FwImageError::Corrupt("key digest list truncated"),
                        )?);
                    }
                }
                SECTION_PAYLOAD_BLOCK => payload_blocks.push(body.to_vec()),
                SECTION_TRAILER => trailer = body.to_vec(),
                _ => return Err(FwImageError::Corrupt("unknown section tag")),
            }
        }

        // Every byte of the file must be claimed by the header or a section.
        if HEADER_SIZE + section_bytes != data.len() {
            return Err(FwImageError::Corrupt(
                "section lengths do not add up to the file length",
            ));
        }

        let (target_family_tag, target_version) =
            target.ok_or(FwImageError::Corrupt("target section missing"))?;
        if payload_blocks.is_empty() {
            return Err(FwImageError::Corrupt("no payload blocks"));
        }

        Ok(Self {
            source_family_tags,
            target_family_tag,
            target_version,
            key_digests,
            payload_blocks,
            trailer,
        })
    }

    pub fn accepts_source_family(&self, family: u16) -> bool {
        self.source_family_tags.contains(&family)
    }

    /// Whether the chip holds a decrypt key this image was encrypted for. An
    /// image without fingerprints places no constraint.
    pub fn matches_key_digests(&self, chip_digests: &[[u8; KEY_DIGEST_SIZE]]) -> bool {
        self.key_digests.is_empty()
            || self
                .key_digests
                .iter()
                .any(|digest| chip_digests.contains(digest))
    }

    pub fn total_payload_bytes(&self) -> usize {
        self.payload_blocks.iter().map(Vec::len).sum()
    }

    /// Largest single payload block; must stay within the chip's reported
    /// max data size.
    pub fn max_block_size(&self) -> usize {
        self.payload_blocks.iter().map(Vec::len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldupgrade::FAMILY_TPM12;
    use crate::fieldupgrade::FAMILY_TPM20;

    pub fn section(tag: u16, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&tag.to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    pub fn container(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CONTAINER_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&CONTAINER_VERSION.to_be_bytes());
        bytes.extend_from_slice(&(sections.len() as u16).to_be_bytes());
        for section in sections {
            bytes.extend_from_slice(section);
        }
        bytes
    }

    fn target_section(family: u16, version: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&family.to_be_bytes());
        body.extend_from_slice(&(version.len() as u16).to_be_bytes());
        body.extend_from_slice(version.as_bytes());
        section(SECTION_TARGET, &body)
    }

    fn families_section(families: &[u16]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(families.len() as u16).to_be_bytes());
        for family in families {
            body.extend_from_slice(&family.to_be_bytes());
        }
        section(SECTION_SOURCE_FAMILIES, &body)
    }

    fn sample_container() -> Vec<u8> {
        container(&[
            families_section(&[FAMILY_TPM12, FAMILY_TPM20]),
            target_section(FAMILY_TPM20, "7.85.4555.0"),
            section(SECTION_PAYLOAD_BLOCK, &[0xaa; 1024]),
            section(SECTION_PAYLOAD_BLOCK, &[0xbb; 512]),
            section(SECTION_TRAILER, &[0xcc; 64]),
        ])
    }

    #[test]
    fn parse_valid_container() {
        let image = FirmwareImage::parse(&sample_container()).unwrap();
        assert_eq!(image.target_family_tag, FAMILY_TPM20);
        assert_eq!(image.target_version, "7.85.4555.0");
        assert_eq!(image.payload_blocks.len(), 2);
        assert_eq!(image.total_payload_bytes(), 1536);
        assert_eq!(image.max_block_size(), 1024);
        assert!(image.accepts_source_family(FAMILY_TPM12));
        assert!(!image.accepts_source_family(0x7777));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut data = sample_container();
        data[0] ^= 0xff;
        assert_eq!(
            FirmwareImage::parse(&data),
            Err(FwImageError::Corrupt("magic mismatch"))
        );
    }

    #[test]
    fn future_version_needs_newer_tool() {
        let mut data = sample_container();
        data[4..6].copy_from_slice(&2u16.to_be_bytes());
        assert_eq!(
            FirmwareImage::parse(&data),
            Err(FwImageError::NewerToolRequired(2))
        );
    }

    #[test]
    fn trailing_garbage_is_corrupt() {
        let mut data = sample_container();
        data.push(0);
        assert!(matches!(
            FirmwareImage::parse(&data),
            Err(FwImageError::Corrupt(_))
        ));
    }

    #[test]
    fn truncated_section_is_corrupt() {
        let data = sample_container();
        for cut in HEADER_SIZE..data.len() {
            assert!(matches!(
                FirmwareImage::parse(&data[..cut]),
                Err(FwImageError::Corrupt(_))
            ));
        }
    }

    #[test]
    fn key_digest_matching() {
        let digest_a = [0x01; KEY_DIGEST_SIZE];
        let digest_b = [0x02; KEY_DIGEST_SIZE];
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&digest_a);
        let data = container(&[
            target_section(FAMILY_TPM20, "7.85.4555.0"),
            section(SECTION_KEY_DIGESTS, &body),
            section(SECTION_PAYLOAD_BLOCK, &[0xaa; 8]),
        ]);
        let image = FirmwareImage::parse(&data).unwrap();
        assert!(image.matches_key_digests(&[digest_a, digest_b]));
        assert!(!image.matches_key_digests(&[digest_b]));
    }
}
