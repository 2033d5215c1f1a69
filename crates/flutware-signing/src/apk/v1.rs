//! JAR signing (APK Signature Scheme v1).
//!
//! Produces `META-INF/MANIFEST.MF`, `META-INF/<SIGNER>.SF` and the
//! detached PKCS#7 `META-INF/<SIGNER>.RSA` over the signature file.

use base64::{prelude::BASE64_STANDARD, Engine};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::X509;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::keystore::SigningIdentity;

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
const META_INF: &str = "META-INF/";
const CREATED_BY: &str = "1.0 (Android)";
const DIGEST_ATTR: &str = "SHA-256-Digest";
const DIGEST_MANIFEST_ATTR: &str = "SHA-256-Digest-Manifest";
pub const APK_SIGNED_ATTR: &str = "X-Android-APK-Signed";
/// Wrapped line length, excluding CRLF.
const MAX_LINE_LEN: usize = 70;
const MAX_SIGNER_NAME_LEN: usize = 8;

/// Digest of one entry's uncompressed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDigest {
    pub name: String,
    pub sha256: [u8; 32],
}

impl EntryDigest {
    pub fn of(name: impl Into<String>, content: &[u8]) -> Self {
        Self {
            name: name.into(),
            sha256: Sha256::digest(content).into(),
        }
    }
}

/// The three files of a JAR signature.
#[derive(Debug, Clone)]
pub struct JarSignature {
    pub signer_name: String,
    pub manifest: Vec<u8>,
    pub signature_file: Vec<u8>,
    pub signature_block: Vec<u8>,
}

impl JarSignature {
    /// `(entry name, content)` in the order they are written to the archive.
    pub fn files(&self) -> [(String, &[u8]); 3] {
        [
            (MANIFEST_NAME.to_string(), self.manifest.as_slice()),
            (format!("{}{}.SF", META_INF, self.signer_name), self.signature_file.as_slice()),
            (format!("{}{}.RSA", META_INF, self.signer_name), self.signature_block.as_slice()),
        ]
    }
}

/// True for entries that belong to a JAR signature and must not be
/// carried over when re-signing.
pub fn is_signature_entry(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    let Some(file) = upper.strip_prefix(META_INF) else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    file == "MANIFEST.MF"
        || file.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"].iter().any(|ext| file.ends_with(ext))
}

/// Signer file stem derived from a key alias: `flutware` -> `FLUTWARE`.
pub fn signer_name(alias: &str) -> String {
    let name: String = alias
        .chars()
        .take(MAX_SIGNER_NAME_LEN)
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "CERT".to_string()
    } else {
        name
    }
}

/// Builds the JAR signature over `entries`.
///
/// `apk_signed_with` lists the v2+ scheme numbers also applied to the APK;
/// they are advertised in the `.SF` so that stripping them is detectable.
pub fn sign(entries: &[EntryDigest], identity: &SigningIdentity, apk_signed_with: &[u32]) -> Result<JarSignature> {
    let mut sorted: Vec<&EntryDigest> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut manifest = Vec::new();
    write_attribute(&mut manifest, "Manifest-Version", "1.0");
    write_attribute(&mut manifest, "Created-By", CREATED_BY);
    manifest.extend_from_slice(b"\r\n");

    let mut sections = Vec::with_capacity(sorted.len());
    for entry in &sorted {
        let mut section = Vec::new();
        write_attribute(&mut section, "Name", &entry.name);
        write_attribute(&mut section, DIGEST_ATTR, &BASE64_STANDARD.encode(entry.sha256));
        section.extend_from_slice(b"\r\n");
        manifest.extend_from_slice(&section);
        sections.push((entry.name.as_str(), section));
    }

    let mut signature_file = Vec::new();
    write_attribute(&mut signature_file, "Signature-Version", "1.0");
    write_attribute(&mut signature_file, "Created-By", CREATED_BY);
    write_attribute(&mut signature_file, DIGEST_MANIFEST_ATTR, &b64_sha256(&manifest));
    if !apk_signed_with.is_empty() {
        let schemes: Vec<String> = apk_signed_with.iter().map(u32::to_string).collect();
        write_attribute(&mut signature_file, APK_SIGNED_ATTR, &schemes.join(", "));
    }
    signature_file.extend_from_slice(b"\r\n");

    for (name, section) in &sections {
        write_attribute(&mut signature_file, "Name", name);
        write_attribute(&mut signature_file, DIGEST_ATTR, &b64_sha256(section));
        signature_file.extend_from_slice(b"\r\n");
    }

    let signature_block = pkcs7_detached(&signature_file, identity)?;

    Ok(JarSignature {
        signer_name: signer_name(identity.alias()),
        manifest,
        signature_file,
        signature_block,
    })
}

fn pkcs7_detached(content: &[u8], identity: &SigningIdentity) -> Result<Vec<u8>> {
    let extra_certs: Stack<X509> = Stack::new()?;
    let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOATTR | Pkcs7Flags::NOSMIMECAP;
    let pkcs7 = Pkcs7::sign(
        identity.certificate(),
        identity.private_key(),
        &extra_certs,
        content,
        flags,
    )?;
    Ok(pkcs7.to_der()?)
}

/// Writes `name: value` wrapped at 70 bytes with `CRLF SPACE` continuations.
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value);
    let mut rest = line.as_bytes();
    let mut first = true;
    while first || !rest.is_empty() {
        let limit = if first { MAX_LINE_LEN } else { MAX_LINE_LEN - 1 };
        let (head, tail) = rest.split_at(rest.len().min(limit));
        if !first {
            out.push(b' ');
        }
        out.extend_from_slice(head);
        out.extend_from_slice(b"\r\n");
        rest = tail;
        first = false;
    }
}

pub(crate) fn b64_sha256(data: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha256::digest(data))
}

/// One section of a manifest or signature file.
#[derive(Debug)]
pub(crate) struct Section<'a> {
    /// Exact bytes of the section, including its terminating blank line.
    pub raw: &'a [u8],
    attributes: Vec<(String, String)>,
}

impl Section<'_> {
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Splits a manifest-format file into sections, joining continuation lines.
/// The first section is the main section.
pub(crate) fn parse_sections(data: &[u8]) -> Vec<Section<'_>> {
    let mut sections = Vec::new();
    let mut lines: Vec<Vec<u8>> = Vec::new();
    let mut start = 0;
    let mut pos = 0;

    while pos < data.len() {
        let (line, next) = match data[pos..].iter().position(|b| *b == b'\n') {
            Some(i) => {
                let end = pos + i;
                let line_end = if end > pos && data[end - 1] == b'\r' { end - 1 } else { end };
                (&data[pos..line_end], end + 1)
            }
            None => (&data[pos..], data.len()),
        };
        pos = next;

        if line.is_empty() {
            if !lines.is_empty() {
                sections.push(section_from_lines(&data[start..pos], &lines));
                lines.clear();
            }
            start = pos;
        } else if line[0] == b' ' {
            if let Some(last) = lines.last_mut() {
                last.extend_from_slice(&line[1..]);
            }
        } else {
            lines.push(line.to_vec());
        }
    }
    if !lines.is_empty() {
        sections.push(section_from_lines(&data[start..], &lines));
    }
    sections
}

fn section_from_lines<'a>(raw: &'a [u8], lines: &[Vec<u8>]) -> Section<'a> {
    let attributes = lines
        .iter()
        .filter_map(|line| {
            let line = String::from_utf8_lossy(line);
            line.split_once(": ")
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();
    Section { raw, attributes }
}
