//! Verification of v1, v2 and v3 APK signatures.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use base64::{prelude::BASE64_STANDARD, Engine};
use byteorder::{ByteOrder, LE};
use openssl::hash::MessageDigest;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::PKey;
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use super::digest::apk_content_digest;
use super::layout::ZipSections;
use super::signing_block::{
    decode_signing_block, ByteReader, SchemeVersion, RSA_PKCS1_V1_5_WITH_SHA2_256,
    STRIPPING_PROTECTION_ATTR_ID,
};
use super::v1::{self, b64_sha256, parse_sections, APK_SIGNED_ATTR, MANIFEST_NAME};
use crate::error::{Result, SigningError};

/// Outcome for one signature scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeStatus {
    Absent,
    Verified,
    Failed(String),
}

impl SchemeStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, SchemeStatus::Verified)
    }
}

#[derive(Debug, Clone)]
pub struct Verification {
    pub v1: SchemeStatus,
    pub v2: SchemeStatus,
    pub v3: SchemeStatus,
    /// Distinct signer certificates (DER) seen across verified schemes.
    pub certificates: Vec<Vec<u8>>,
}

impl Verification {
    /// At least one scheme verified and none failed.
    pub fn is_verified(&self) -> bool {
        let statuses = [&self.v1, &self.v2, &self.v3];
        statuses.iter().any(|s| s.is_verified())
            && !statuses.iter().any(|s| matches!(s, SchemeStatus::Failed(_)))
    }
}

/// Verifies every signature scheme present in `apk`.
///
/// Errors only when the input is not a readable ZIP archive; scheme
/// failures are reported per scheme.
pub fn verify(apk: &[u8]) -> Result<Verification> {
    let sections = ZipSections::locate(apk)?;
    let mut certificates: Vec<Vec<u8>> = Vec::new();

    let pairs: HashMap<u32, &[u8]> = match sections.signing_block(apk) {
        Some(block) => decode_signing_block(block)?.into_iter().collect(),
        None => HashMap::new(),
    };

    let v3_present = pairs.contains_key(&SchemeVersion::V3.block_id());
    let v2 = scheme_status(
        verify_scheme(apk, &sections, &pairs, SchemeVersion::V2, v3_present),
        &mut certificates,
    );
    let v3 = scheme_status(
        verify_scheme(apk, &sections, &pairs, SchemeVersion::V3, v3_present),
        &mut certificates,
    );

    let v1 = match verify_jar(apk) {
        Ok(Some(jar)) => {
            let missing: Vec<u32> = jar
                .claimed_schemes
                .iter()
                .copied()
                .filter(|n| match *n {
                    2 => v2 == SchemeStatus::Absent,
                    3 => v3 == SchemeStatus::Absent,
                    _ => false,
                })
                .collect();
            if missing.is_empty() {
                add_certificate(&mut certificates, jar.certificate);
                SchemeStatus::Verified
            } else {
                SchemeStatus::Failed(format!(
                    "signature file claims schemes {:?} which are missing",
                    missing
                ))
            }
        }
        Ok(None) => SchemeStatus::Absent,
        Err(e) => SchemeStatus::Failed(e.to_string()),
    };

    Ok(Verification {
        v1,
        v2,
        v3,
        certificates,
    })
}

fn scheme_status(result: Result<Option<Vec<u8>>>, certificates: &mut Vec<Vec<u8>>) -> SchemeStatus {
    match result {
        Ok(Some(certificate)) => {
            add_certificate(certificates, certificate);
            SchemeStatus::Verified
        }
        Ok(None) => SchemeStatus::Absent,
        Err(e) => SchemeStatus::Failed(e.to_string()),
    }
}

fn add_certificate(certificates: &mut Vec<Vec<u8>>, certificate: Vec<u8>) {
    if !certificates.contains(&certificate) {
        certificates.push(certificate);
    }
}

/// Verifies one v2/v3 scheme block, returning the signer certificate.
fn verify_scheme(
    apk: &[u8],
    sections: &ZipSections,
    pairs: &HashMap<u32, &[u8]>,
    version: SchemeVersion,
    v3_present: bool,
) -> Result<Option<Vec<u8>>> {
    let Some(value) = pairs.get(&version.block_id()) else {
        return Ok(None);
    };

    let signers = ByteReader::new(value).read_sequence()?;
    if signers.is_empty() {
        return Err(SigningError::Verification("no signers".to_string()));
    }

    let content_digest = apk_content_digest(apk, sections)?;
    let mut first_certificate = None;

    for signer in signers {
        let mut reader = ByteReader::new(signer);
        let signed_data = reader.read_prefixed()?;
        let signer_sdk = match version {
            SchemeVersion::V3 => Some((reader.read_u32()?, reader.read_u32()?)),
            SchemeVersion::V2 => None,
        };
        let signatures = reader.read_sequence()?;
        let public_key = reader.read_prefixed()?;

        let signature = find_rsa_sha256(&signatures)?
            .ok_or_else(|| SigningError::Verification("no supported signature algorithm".to_string()))?;

        verify_rsa_sha256(public_key, signed_data, signature)?;

        let mut data = ByteReader::new(signed_data);
        let digests = data.read_sequence()?;
        let certificates = data.read_sequence()?;
        if let Some(signer_sdk) = signer_sdk {
            let signed_sdk = (data.read_u32()?, data.read_u32()?);
            if signed_sdk != signer_sdk {
                return Err(SigningError::Verification(
                    "SDK range differs between signer and signed data".to_string(),
                ));
            }
        }
        let attributes = data.read_sequence()?;

        let expected = find_rsa_sha256(&digests)?
            .ok_or_else(|| SigningError::Verification("no content digest".to_string()))?;
        if expected != content_digest.as_slice() {
            return Err(SigningError::Verification(format!(
                "v{} content digest mismatch",
                version.number()
            )));
        }

        let certificate = certificates
            .first()
            .ok_or_else(|| SigningError::Verification("no certificates".to_string()))?;
        let cert_key = X509::from_der(certificate)?.public_key()?.public_key_to_der()?;
        if cert_key != public_key {
            return Err(SigningError::Verification(
                "public key does not match certificate".to_string(),
            ));
        }

        if version == SchemeVersion::V2 {
            for attribute in attributes {
                if attribute.len() >= 8
                    && LE::read_u32(attribute) == STRIPPING_PROTECTION_ATTR_ID
                    && LE::read_u32(&attribute[4..]) == SchemeVersion::V3.number()
                    && !v3_present
                {
                    return Err(SigningError::Verification(
                        "v3 signature stripped".to_string(),
                    ));
                }
            }
        }

        first_certificate.get_or_insert_with(|| certificate.to_vec());
    }

    Ok(first_certificate)
}

/// Picks the RSA/SHA-256 value out of `(algorithm id, value)` records.
fn find_rsa_sha256<'a>(records: &[&'a [u8]]) -> Result<Option<&'a [u8]>> {
    for record in records {
        let mut reader = ByteReader::new(*record);
        if reader.read_u32()? == RSA_PKCS1_V1_5_WITH_SHA2_256 {
            return Ok(Some(reader.read_prefixed()?));
        }
    }
    Ok(None)
}

fn verify_rsa_sha256(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = PKey::public_key_from_der(public_key)?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &key)?;
    verifier.update(message)?;
    if verifier.verify(signature)? {
        Ok(())
    } else {
        Err(SigningError::Verification("signature does not verify".to_string()))
    }
}

struct JarVerification {
    certificate: Vec<u8>,
    claimed_schemes: Vec<u32>,
}

/// Verifies the JAR signature, if any.
fn verify_jar(apk: &[u8]) -> Result<Option<JarVerification>> {
    let mut archive = ZipArchive::new(Cursor::new(apk))?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();

    let Some(sf_name) = names.iter().find(|name| {
        let upper = name.to_ascii_uppercase();
        v1::is_signature_entry(name) && upper.ends_with(".SF")
    }) else {
        return Ok(None);
    };
    let stem = &sf_name[..sf_name.len() - 3];
    let block_name = names
        .iter()
        .find(|name| name.eq_ignore_ascii_case(&format!("{}.RSA", stem)))
        .ok_or_else(|| SigningError::Verification(format!("no signature block for {}", sf_name)))?;

    let manifest = read_entry(&mut archive, MANIFEST_NAME)?;
    let signature_file = read_entry(&mut archive, sf_name)?;
    let signature_block = read_entry(&mut archive, block_name)?;

    let certificate = verify_pkcs7(&signature_block, &signature_file)?;

    let sf_sections = parse_sections(&signature_file);
    let sf_main = sf_sections
        .first()
        .ok_or_else(|| SigningError::Verification("empty signature file".to_string()))?;
    if sf_main.get("SHA-256-Digest-Manifest") != Some(b64_sha256(&manifest).as_str()) {
        return Err(SigningError::Verification("manifest digest mismatch".to_string()));
    }
    let claimed_schemes: Vec<u32> = sf_main
        .get(APK_SIGNED_ATTR)
        .map(|value| {
            value
                .split(',')
                .filter_map(|n| n.trim().parse::<u32>().ok())
                .collect()
        })
        .unwrap_or_default();

    let manifest_sections = parse_sections(&manifest);
    let mut listed = HashMap::new();
    for section in manifest_sections.iter().skip(1) {
        let name = section
            .get("Name")
            .ok_or_else(|| SigningError::Verification("manifest section without name".to_string()))?;
        listed.insert(name.to_string(), section);
    }

    for section in sf_sections.iter().skip(1) {
        let name = section.get("Name").unwrap_or_default();
        let manifest_section = listed
            .get(name)
            .ok_or_else(|| SigningError::Verification(format!("{} not in manifest", name)))?;
        if section.get("SHA-256-Digest") != Some(b64_sha256(manifest_section.raw).as_str()) {
            return Err(SigningError::Verification(format!(
                "signature file digest mismatch for {}",
                name
            )));
        }
    }

    for name in &names {
        if name.ends_with('/') || v1::is_signature_entry(name) {
            continue;
        }
        let section = listed
            .get(name.as_str())
            .ok_or_else(|| SigningError::Verification(format!("{} not signed", name)))?;
        let content = read_entry(&mut archive, name)?;
        let actual = BASE64_STANDARD.encode(Sha256::digest(&content));
        if section.get("SHA-256-Digest") != Some(actual.as_str()) {
            return Err(SigningError::Verification(format!("digest mismatch for {}", name)));
        }
    }

    Ok(Some(JarVerification {
        certificate,
        claimed_schemes,
    }))
}

fn verify_pkcs7(signature_block: &[u8], signed_content: &[u8]) -> Result<Vec<u8>> {
    let pkcs7 = Pkcs7::from_der(signature_block)?;
    let extra_certs: Stack<X509> = Stack::new()?;
    // Self-signed: only the signature is checked, not the chain.
    let store = X509StoreBuilder::new()?.build();
    pkcs7
        .verify(
            &extra_certs,
            &store,
            Some(signed_content),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .map_err(|e| SigningError::Verification(format!("PKCS#7 signature invalid: {}", e)))?;

    let signers = pkcs7.signers(&extra_certs, Pkcs7Flags::empty())?;
    let signer = signers
        .iter()
        .next()
        .ok_or_else(|| SigningError::Verification("PKCS#7 without signer".to_string()))?;
    Ok(signer.to_der()?)
}

fn read_entry<R: std::io::Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    archive.by_name(name)?.read_to_end(&mut content)?;
    Ok(content)
}
