//! ZIP container layout as seen by the APK signature schemes.
//!
//! A signed APK is `[entries][APK Signing Block][central directory][EOCD]`.

use byteorder::{ByteOrder, LE};

use crate::error::{Result, SigningError};

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD_MIN_SIZE: usize = 22;
const EOCD_CD_SIZE_OFFSET: usize = 12;
const EOCD_CD_OFFSET_OFFSET: usize = 16;
const EOCD_COMMENT_LEN_OFFSET: usize = 20;
const ZIP64_MARKER: u32 = 0xFFFF_FFFF;

pub const APK_SIG_BLOCK_MAGIC: [u8; 16] = *b"APK Sig Block 42";
/// size(8) + size(8) + magic(16)
pub const APK_SIG_BLOCK_MIN_SIZE: usize = 32;

/// Offsets of the sections of a ZIP file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipSections {
    pub central_dir_offset: usize,
    pub central_dir_size: usize,
    pub eocd_offset: usize,
    /// Start of the APK Signing Block, when one precedes the central directory.
    pub signing_block_offset: Option<usize>,
}

impl ZipSections {
    pub fn locate(apk: &[u8]) -> Result<Self> {
        let eocd_offset = find_eocd(apk)?;
        let eocd = &apk[eocd_offset..];

        let cd_size = LE::read_u32(&eocd[EOCD_CD_SIZE_OFFSET..]);
        let cd_offset = LE::read_u32(&eocd[EOCD_CD_OFFSET_OFFSET..]);
        if cd_size == ZIP64_MARKER || cd_offset == ZIP64_MARKER {
            return Err(SigningError::MalformedApk("ZIP64 archives are not supported".to_string()));
        }

        let central_dir_offset = cd_offset as usize;
        let central_dir_size = cd_size as usize;
        if central_dir_offset + central_dir_size != eocd_offset {
            return Err(SigningError::MalformedApk(
                "central directory is not immediately followed by the EOCD record".to_string(),
            ));
        }

        let signing_block_offset = find_signing_block(apk, central_dir_offset)?;

        Ok(Self {
            central_dir_offset,
            central_dir_size,
            eocd_offset,
            signing_block_offset,
        })
    }

    /// End of the local file entries section.
    pub fn entries_end(&self) -> usize {
        self.signing_block_offset.unwrap_or(self.central_dir_offset)
    }

    pub fn entries<'a>(&self, apk: &'a [u8]) -> &'a [u8] {
        &apk[..self.entries_end()]
    }

    pub fn central_dir<'a>(&self, apk: &'a [u8]) -> &'a [u8] {
        &apk[self.central_dir_offset..self.eocd_offset]
    }

    pub fn eocd<'a>(&self, apk: &'a [u8]) -> &'a [u8] {
        &apk[self.eocd_offset..]
    }

    pub fn signing_block<'a>(&self, apk: &'a [u8]) -> Option<&'a [u8]> {
        self.signing_block_offset
            .map(|start| &apk[start..self.central_dir_offset])
    }
}

/// Overwrites the central directory offset field of an EOCD record.
pub fn set_central_dir_offset(eocd: &mut [u8], offset: usize) -> Result<()> {
    if eocd.len() < EOCD_MIN_SIZE {
        return Err(SigningError::MalformedApk("EOCD record truncated".to_string()));
    }
    let offset = u32::try_from(offset)
        .map_err(|_| SigningError::MalformedApk("central directory offset exceeds 4 GiB".to_string()))?;
    LE::write_u32(&mut eocd[EOCD_CD_OFFSET_OFFSET..EOCD_CD_OFFSET_OFFSET + 4], offset);
    Ok(())
}

fn find_eocd(apk: &[u8]) -> Result<usize> {
    if apk.len() < EOCD_MIN_SIZE {
        return Err(SigningError::MalformedApk("file too small to be a ZIP archive".to_string()));
    }

    let max_comment = (apk.len() - EOCD_MIN_SIZE).min(u16::MAX as usize);
    for comment_len in 0..=max_comment {
        let pos = apk.len() - EOCD_MIN_SIZE - comment_len;
        if LE::read_u32(&apk[pos..]) == EOCD_SIGNATURE
            && LE::read_u16(&apk[pos + EOCD_COMMENT_LEN_OFFSET..]) as usize == comment_len
        {
            return Ok(pos);
        }
    }

    Err(SigningError::MalformedApk(
        "End of Central Directory record not found".to_string(),
    ))
}

fn find_signing_block(apk: &[u8], central_dir_offset: usize) -> Result<Option<usize>> {
    if central_dir_offset < APK_SIG_BLOCK_MIN_SIZE {
        return Ok(None);
    }

    let footer = &apk[central_dir_offset - 24..central_dir_offset];
    if footer[8..] != APK_SIG_BLOCK_MAGIC {
        return Ok(None);
    }

    // The size fields do not count the leading size field itself.
    let size = LE::read_u64(&footer[..8]);
    let total = usize::try_from(size)
        .ok()
        .and_then(|size| size.checked_add(8))
        .filter(|total| *total >= APK_SIG_BLOCK_MIN_SIZE && *total <= central_dir_offset)
        .ok_or_else(|| SigningError::MalformedApk(format!("APK Signing Block size out of range: {}", size)))?;

    let start = central_dir_offset - total;
    if LE::read_u64(&apk[start..]) != size {
        return Err(SigningError::MalformedApk(
            "APK Signing Block size fields disagree".to_string(),
        ));
    }
    Ok(Some(start))
}
