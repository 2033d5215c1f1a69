//! APK Signing Block codec and the v2/v3 scheme blocks stored in it.
//!
//! All integers are little-endian. Nested values are u32 length-prefixed;
//! the outer ID-value pairs are u64 length-prefixed.

use byteorder::{ByteOrder, WriteBytesExt, LE};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};

use super::layout::{APK_SIG_BLOCK_MAGIC, APK_SIG_BLOCK_MIN_SIZE};
use crate::error::{Result, SigningError};
use crate::keystore::SigningIdentity;

pub const V2_BLOCK_ID: u32 = 0x7109_871a;
pub const V3_BLOCK_ID: u32 = 0xf053_68c0;
pub const RSA_PKCS1_V1_5_WITH_SHA2_256: u32 = 0x0103;
/// v2 signed-data attribute naming the newer scheme that must also be present.
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xbeef_f00d;
/// Android 9 (P), first release that understands v3.
pub const V3_MIN_SDK: u32 = 28;
/// Parsed as signed by the platform.
pub const V3_MAX_SDK: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeVersion {
    V2,
    V3,
}

impl SchemeVersion {
    pub fn block_id(self) -> u32 {
        match self {
            SchemeVersion::V2 => V2_BLOCK_ID,
            SchemeVersion::V3 => V3_BLOCK_ID,
        }
    }

    /// Number used by `X-Android-APK-Signed` and the stripping protection attribute.
    pub fn number(self) -> u32 {
        match self {
            SchemeVersion::V2 => 2,
            SchemeVersion::V3 => 3,
        }
    }
}

/// Produces v2/v3 scheme blocks for one signer.
pub struct SchemeSigner {
    key_pair: RsaKeyPair,
    certificate: Vec<u8>,
    public_key: Vec<u8>,
    rng: SystemRandom,
}

impl SchemeSigner {
    pub fn new(identity: &SigningIdentity) -> Result<Self> {
        let key_pair = RsaKeyPair::from_pkcs8(&identity.private_key_pkcs8()?)?;
        Ok(Self {
            key_pair,
            certificate: identity.certificate_der()?,
            public_key: identity.public_key_der()?,
            rng: SystemRandom::new(),
        })
    }

    /// Encodes the scheme block value (the sequence of signers).
    ///
    /// `also_signed_with` lists newer schemes present in the same APK; for
    /// v2 they are recorded as stripping protection attributes.
    pub fn scheme_block(
        &self,
        version: SchemeVersion,
        content_digest: &[u8; 32],
        also_signed_with: &[SchemeVersion],
    ) -> Result<Vec<u8>> {
        let signed_data = self.signed_data(version, content_digest, also_signed_with)?;
        let signature = self.sign(&signed_data)?;

        let mut signer = Vec::new();
        put_prefixed(&mut signer, &signed_data)?;
        if version == SchemeVersion::V3 {
            signer.write_u32::<LE>(V3_MIN_SDK)?;
            signer.write_u32::<LE>(V3_MAX_SDK)?;
        }

        let mut signature_record = Vec::new();
        signature_record.write_u32::<LE>(RSA_PKCS1_V1_5_WITH_SHA2_256)?;
        put_prefixed(&mut signature_record, &signature)?;
        put_sequence(&mut signer, &[signature_record])?;

        put_prefixed(&mut signer, &self.public_key)?;

        let mut block = Vec::new();
        put_sequence(&mut block, &[signer])?;
        Ok(block)
    }

    fn signed_data(
        &self,
        version: SchemeVersion,
        content_digest: &[u8; 32],
        also_signed_with: &[SchemeVersion],
    ) -> Result<Vec<u8>> {
        let mut digest_record = Vec::new();
        digest_record.write_u32::<LE>(RSA_PKCS1_V1_5_WITH_SHA2_256)?;
        put_prefixed(&mut digest_record, content_digest)?;

        let mut signed_data = Vec::new();
        put_sequence(&mut signed_data, &[digest_record])?;
        put_sequence(&mut signed_data, &[self.certificate.clone()])?;

        let mut attributes = Vec::new();
        match version {
            SchemeVersion::V2 => {
                for newer in also_signed_with.iter().filter(|v| **v != SchemeVersion::V2) {
                    let mut attribute = Vec::new();
                    attribute.write_u32::<LE>(STRIPPING_PROTECTION_ATTR_ID)?;
                    attribute.write_u32::<LE>(newer.number())?;
                    attributes.push(attribute);
                }
            }
            SchemeVersion::V3 => {
                signed_data.write_u32::<LE>(V3_MIN_SDK)?;
                signed_data.write_u32::<LE>(V3_MAX_SDK)?;
            }
        }
        put_sequence(&mut signed_data, &attributes)?;

        Ok(signed_data)
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, message, &mut signature)?;
        Ok(signature)
    }
}

/// Serializes a complete APK Signing Block from `(id, value)` pairs.
pub fn encode_signing_block(pairs: &[(u32, Vec<u8>)]) -> Result<Vec<u8>> {
    let pairs_len: usize = pairs.iter().map(|(_, value)| 8 + 4 + value.len()).sum();
    // Counts everything except the leading size field.
    let size = (pairs_len + 8 + APK_SIG_BLOCK_MAGIC.len()) as u64;

    let mut block = Vec::with_capacity(pairs_len + APK_SIG_BLOCK_MIN_SIZE);
    block.write_u64::<LE>(size)?;
    for (id, value) in pairs {
        block.write_u64::<LE>((4 + value.len()) as u64)?;
        block.write_u32::<LE>(*id)?;
        block.extend_from_slice(value);
    }
    block.write_u64::<LE>(size)?;
    block.extend_from_slice(&APK_SIG_BLOCK_MAGIC);
    Ok(block)
}

/// Splits an APK Signing Block into its `(id, value)` pairs.
pub fn decode_signing_block(block: &[u8]) -> Result<Vec<(u32, &[u8])>> {
    if block.len() < APK_SIG_BLOCK_MIN_SIZE || block[block.len() - 16..] != APK_SIG_BLOCK_MAGIC {
        return Err(SigningError::MalformedApk("not an APK Signing Block".to_string()));
    }

    let mut reader = ByteReader::new(&block[8..block.len() - 24]);
    let mut pairs = Vec::new();
    while !reader.is_empty() {
        let len = usize::try_from(reader.read_u64()?)
            .map_err(|_| SigningError::MalformedApk("signing block pair too large".to_string()))?;
        if len < 4 {
            return Err(SigningError::MalformedApk("signing block pair too short".to_string()));
        }
        let mut pair = ByteReader::new(reader.take(len)?);
        let id = pair.read_u32()?;
        pairs.push((id, pair.rest()));
    }
    Ok(pairs)
}

fn put_prefixed(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| SigningError::MalformedApk("signing block field exceeds 4 GiB".to_string()))?;
    out.write_u32::<LE>(len)?;
    out.extend_from_slice(value);
    Ok(())
}

fn put_sequence(out: &mut Vec<u8>, items: &[Vec<u8>]) -> Result<()> {
    let mut sequence = Vec::new();
    for item in items {
        put_prefixed(&mut sequence, item)?;
    }
    put_prefixed(out, &sequence)
}

/// Bounds-checked little-endian reader over signing block fields.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn rest(self) -> &'a [u8] {
        self.data
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() < len {
            return Err(SigningError::MalformedApk(format!(
                "truncated field: need {} bytes, have {}",
                len,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        Ok(LE::read_u32(self.take(4)?))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        Ok(LE::read_u64(self.take(8)?))
    }

    /// Reads a u32 length-prefixed value.
    pub(crate) fn read_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed sequence of length-prefixed items.
    pub(crate) fn read_sequence(&mut self) -> Result<Vec<&'a [u8]>> {
        let mut sequence = ByteReader::new(self.read_prefixed()?);
        let mut items = Vec::new();
        while !sequence.is_empty() {
            items.push(sequence.read_prefixed()?);
        }
        Ok(items)
    }
}
