//! Re-signs an APK with the local identity.

use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use log::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use super::digest::apk_content_digest;
use super::layout::{set_central_dir_offset, ZipSections};
use super::signing_block::{encode_signing_block, SchemeSigner, SchemeVersion};
use super::v1::{self, EntryDigest};
use crate::error::{Result, SigningError};
use crate::fsutil::write_atomically;
use crate::keystore::SigningIdentity;

/// Alignment of uncompressed entries.
const STORED_ALIGNMENT: u16 = 4;
/// Uncompressed native libraries are page-aligned so they can be mapped in place.
const NATIVE_LIB_ALIGNMENT: u16 = 4096;

/// Signs packages with v1 (JAR), v2 and v3 schemes.
///
/// All three schemes are enabled by default.
pub struct ApkSigner<'a> {
    identity: &'a SigningIdentity,
    v1_enabled: bool,
    v2_enabled: bool,
    v3_enabled: bool,
}

impl<'a> ApkSigner<'a> {
    pub fn new(identity: &'a SigningIdentity) -> Self {
        Self {
            identity,
            v1_enabled: true,
            v2_enabled: true,
            v3_enabled: true,
        }
    }

    pub fn v1_signing_enabled(mut self, enabled: bool) -> Self {
        self.v1_enabled = enabled;
        self
    }

    pub fn v2_signing_enabled(mut self, enabled: bool) -> Self {
        self.v2_enabled = enabled;
        self
    }

    pub fn v3_signing_enabled(mut self, enabled: bool) -> Self {
        self.v3_enabled = enabled;
        self
    }

    /// Reads `input`, signs it and atomically writes the result to `output`.
    pub fn sign_file(&self, input: &Path, output: &Path) -> Result<()> {
        info!("SignApk started: {} -> {}", input.display(), output.display());

        let apk = fs::read(input)?;
        let signed = self.sign_bytes(&apk)?;
        write_atomically(output, &signed)?;

        info!("SignApk finished: {} ({} bytes)", output.display(), signed.len());
        Ok(())
    }

    /// Returns a signed copy of `apk`.
    pub fn sign_bytes(&self, apk: &[u8]) -> Result<Vec<u8>> {
        let schemes = self.block_schemes();
        if !self.v1_enabled && schemes.is_empty() {
            return Err(SigningError::Config(
                "at least one signature scheme must be enabled".to_string(),
            ));
        }

        let rewritten = self.rewrite_entries(apk, &schemes)?;
        if schemes.is_empty() {
            return Ok(rewritten);
        }
        self.insert_signing_block(&rewritten, &schemes)
    }

    fn block_schemes(&self) -> Vec<SchemeVersion> {
        let mut schemes = Vec::new();
        if self.v2_enabled {
            schemes.push(SchemeVersion::V2);
        }
        if self.v3_enabled {
            schemes.push(SchemeVersion::V3);
        }
        schemes
    }

    /// Copies every entry except old signature files, aligning stored
    /// entries, and appends the JAR signature when v1 is enabled.
    fn rewrite_entries(&self, apk: &[u8], schemes: &[SchemeVersion]) -> Result<Vec<u8>> {
        let mut archive = ZipArchive::new(Cursor::new(apk))?;
        let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(apk.len() + 16 * 1024)));
        let mut seen = HashSet::new();
        let mut digests = Vec::new();

        for index in 0..archive.len() {
            let (name, is_dir, method, modified) = {
                let entry = archive.by_index_raw(index)?;
                (entry.name().to_string(), entry.is_dir(), entry.compression(), entry.last_modified())
            };

            if !seen.insert(name.clone()) {
                return Err(SigningError::MalformedApk(format!("duplicate entry: {}", name)));
            }
            if v1::is_signature_entry(&name) {
                debug!("Dropping previous signature entry {}", name);
                continue;
            }
            if is_dir {
                writer.raw_copy_file(archive.by_index_raw(index)?)?;
                continue;
            }

            let mut content = Vec::new();
            archive.by_index(index)?.read_to_end(&mut content)?;
            if self.v1_enabled {
                digests.push(EntryDigest::of(name.as_str(), &content));
            }

            if method == CompressionMethod::Stored {
                let options = FileOptions::default()
                    .compression_method(CompressionMethod::Stored)
                    .last_modified_time(modified)
                    .large_file(content.len() as u64 >= u32::MAX as u64);
                writer.start_file_aligned(name.as_str(), options, alignment_for(&name))?;
                writer.write_all(&content)?;
            } else {
                writer.raw_copy_file(archive.by_index_raw(index)?)?;
            }
        }

        if self.v1_enabled {
            let numbers: Vec<u32> = schemes.iter().map(|s| s.number()).collect();
            let signature = v1::sign(&digests, self.identity, &numbers)?;
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(DateTime::default());
            for (name, content) in signature.files() {
                writer.start_file(name, options)?;
                writer.write_all(content)?;
            }
        }

        Ok(writer.finish()?.into_inner())
    }

    fn insert_signing_block(&self, zip: &[u8], schemes: &[SchemeVersion]) -> Result<Vec<u8>> {
        let sections = ZipSections::locate(zip)?;
        let digest = apk_content_digest(zip, &sections)?;

        let signer = SchemeSigner::new(self.identity)?;
        let mut pairs = Vec::with_capacity(schemes.len());
        for version in schemes {
            pairs.push((version.block_id(), signer.scheme_block(*version, &digest, schemes)?));
        }
        let block = encode_signing_block(&pairs)?;

        let entries_end = sections.entries_end();
        let mut eocd = sections.eocd(zip).to_vec();
        set_central_dir_offset(&mut eocd, entries_end + block.len())?;

        let mut signed = Vec::with_capacity(zip.len() + block.len());
        signed.extend_from_slice(sections.entries(zip));
        signed.extend_from_slice(&block);
        signed.extend_from_slice(sections.central_dir(zip));
        signed.extend_from_slice(&eocd);
        Ok(signed)
    }
}

fn alignment_for(name: &str) -> u16 {
    if name.starts_with("lib/") && name.ends_with(".so") {
        NATIVE_LIB_ALIGNMENT
    } else {
        STORED_ALIGNMENT
    }
}
