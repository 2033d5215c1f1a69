//! Chunked content digest shared by APK Signature Scheme v2 and v3.

use sha2::{Digest, Sha256};

use super::layout::{set_central_dir_offset, ZipSections};
use crate::error::Result;

pub const CHUNK_SIZE: usize = 1024 * 1024;
const CHUNK_MAGIC: u8 = 0xa5;
const TOP_LEVEL_MAGIC: u8 = 0x5a;

/// SHA-256 over the 1 MiB chunk digests of `sections`, in order.
pub fn chunked_sha256(sections: &[&[u8]]) -> [u8; 32] {
    let chunk_count: usize = sections
        .iter()
        .map(|section| section.len().div_ceil(CHUNK_SIZE))
        .sum();

    let mut top = Sha256::new();
    top.update([TOP_LEVEL_MAGIC]);
    top.update((chunk_count as u32).to_le_bytes());

    for section in sections {
        for chunk in section.chunks(CHUNK_SIZE) {
            let mut sha = Sha256::new();
            sha.update([CHUNK_MAGIC]);
            sha.update((chunk.len() as u32).to_le_bytes());
            sha.update(chunk);
            top.update(sha.finalize());
        }
    }

    top.finalize().into()
}

/// Content digest of an APK as protected by the signing block.
///
/// The EOCD is digested with its central directory offset pointing at the
/// start of the signing block, i.e. where the central directory would sit
/// if the block were absent.
pub fn apk_content_digest(apk: &[u8], sections: &ZipSections) -> Result<[u8; 32]> {
    let mut eocd = sections.eocd(apk).to_vec();
    set_central_dir_offset(&mut eocd, sections.entries_end())?;

    Ok(chunked_sha256(&[
        sections.entries(apk),
        sections.central_dir(apk),
        &eocd,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_digest(sections: &[&[u8]]) -> [u8; 32] {
        let mut digests = Vec::new();
        let mut count = 0u32;
        for section in sections {
            for chunk in section.chunks(CHUNK_SIZE) {
                let mut input = vec![CHUNK_MAGIC];
                input.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
                input.extend_from_slice(chunk);
                digests.extend_from_slice(&Sha256::digest(&input));
                count += 1;
            }
        }
        let mut top = vec![TOP_LEVEL_MAGIC];
        top.extend_from_slice(&count.to_le_bytes());
        top.extend_from_slice(&digests);
        Sha256::digest(&top).into()
    }

    #[test]
    fn test_matches_buffered_computation() {
        let big = vec![0x42u8; CHUNK_SIZE + 17];
        let small = b"central directory".to_vec();
        let sections: [&[u8]; 3] = [&big, &small, &[]];

        assert_eq!(chunked_sha256(&sections), reference_digest(&sections));
    }

    #[test]
    fn test_empty_section_contributes_no_chunks() {
        let data = b"abc".to_vec();
        assert_eq!(chunked_sha256(&[&data, &[]]), chunked_sha256(&[&data]));
    }

    #[test]
    fn test_section_boundaries_matter() {
        let joined = b"abcdef".to_vec();
        assert_ne!(
            chunked_sha256(&[&joined]),
            chunked_sha256(&[&joined[..3], &joined[3..]])
        );
    }
}
