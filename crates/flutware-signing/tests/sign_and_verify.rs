use std::fs;
use std::io::{Cursor, Write};

use flutware_signing::apk::layout::{set_central_dir_offset, ZipSections};
use flutware_signing::apk::signing_block::{decode_signing_block, encode_signing_block, V2_BLOCK_ID};
use flutware_signing::keystore::generate_identity;
use flutware_signing::{verify, ApkSigner, KeystoreConfig, LocalKeystore, SchemeStatus};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn build_unsigned_apk() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file("AndroidManifest.xml", deflated).unwrap();
    writer.write_all(&[0x03, 0x00, 0x08, 0x00].repeat(64)).unwrap();
    writer.start_file("classes.dex", deflated).unwrap();
    writer.write_all(b"dex\n035\0").unwrap();
    writer.write_all(&vec![0x11u8; 70_000]).unwrap();
    writer.start_file("resources.arsc", stored).unwrap();
    writer.write_all(&[0x02, 0x00, 0x0c, 0x00, 0xaa, 0xbb]).unwrap();
    writer.add_directory("res/", deflated).unwrap();
    writer
        .start_file(
            format!("res/drawable-xxxhdpi-v4/{}.png", "very_long_resource_name".repeat(4)),
            stored,
        )
        .unwrap();
    writer.write_all(&[0x89, b'P', b'N', b'G']).unwrap();
    writer.start_file("lib/arm64-v8a/libflutter.so", stored).unwrap();
    writer.write_all(&[0x7f, b'E', b'L', b'F', 2, 1, 1]).unwrap();
    writer.start_file("META-INF/CERT.SF", deflated).unwrap();
    writer.write_all(b"Signature-Version: 1.0\r\n\r\n").unwrap();
    writer.start_file("META-INF/CERT.RSA", deflated).unwrap();
    writer.write_all(&[0x30, 0x80]).unwrap();
    writer.set_comment("built by flutware");
    writer.finish().unwrap().into_inner()
}

#[test]
fn test_keystore_bootstrap_then_sign_verifies_all_schemes() {
    let dir = tempfile::tempdir().unwrap();
    let keystore = LocalKeystore::new(KeystoreConfig::in_dir(dir.path().join("files")));
    let identity = keystore.load_or_create().unwrap();
    assert!(keystore.exists());

    let input = dir.path().join("app-release-unsigned.apk");
    let output = dir.path().join("out/app-release.apk");
    fs::write(&input, build_unsigned_apk()).unwrap();

    ApkSigner::new(&identity).sign_file(&input, &output).unwrap();

    let signed = fs::read(&output).unwrap();
    let verification = verify(&signed).unwrap();
    assert_eq!(verification.v1, SchemeStatus::Verified);
    assert_eq!(verification.v2, SchemeStatus::Verified);
    assert_eq!(verification.v3, SchemeStatus::Verified);
    assert!(verification.is_verified());
    assert_eq!(verification.certificates, vec![identity.certificate_der().unwrap()]);

    // the signed output is still an ordinary readable archive
    let mut archive = ZipArchive::new(Cursor::new(signed.as_slice())).unwrap();
    assert!(archive.by_name("classes.dex").is_ok());
    assert!(archive.by_name("META-INF/CERT.SF").is_err());
}

#[test]
fn test_unsigned_apk_has_no_schemes() {
    let verification = verify(&build_unsigned_apk()).unwrap();
    // the stale CERT.SF has no matching manifest
    assert!(matches!(verification.v1, SchemeStatus::Failed(_)));
    assert_eq!(verification.v2, SchemeStatus::Absent);
    assert_eq!(verification.v3, SchemeStatus::Absent);
    assert!(!verification.is_verified());
}

#[test]
fn test_tampered_entry_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let identity = generate_identity(&KeystoreConfig::in_dir(dir.path())).unwrap();
    let mut signed = ApkSigner::new(&identity).sign_bytes(&build_unsigned_apk()).unwrap();

    let data_start = {
        let mut archive = ZipArchive::new(Cursor::new(signed.as_slice())).unwrap();
        let entry = archive.by_name("resources.arsc").unwrap();
        entry.data_start() as usize
    };
    signed[data_start + 4] ^= 0xff;

    let verification = verify(&signed).unwrap();
    assert!(matches!(verification.v2, SchemeStatus::Failed(_)));
    assert!(matches!(verification.v3, SchemeStatus::Failed(_)));
    assert!(matches!(verification.v1, SchemeStatus::Failed(_)));
    assert!(!verification.is_verified());
}

#[test]
fn test_stripped_v3_block_detected() {
    let dir = tempfile::tempdir().unwrap();
    let identity = generate_identity(&KeystoreConfig::in_dir(dir.path())).unwrap();
    let signed = ApkSigner::new(&identity).sign_bytes(&build_unsigned_apk()).unwrap();

    // rebuild the signing block with the v2 pair only
    let sections = ZipSections::locate(&signed).unwrap();
    let pairs = decode_signing_block(sections.signing_block(&signed).unwrap()).unwrap();
    let v2_only: Vec<(u32, Vec<u8>)> = pairs
        .into_iter()
        .filter(|(id, _)| *id == V2_BLOCK_ID)
        .map(|(id, value)| (id, value.to_vec()))
        .collect();
    let block = encode_signing_block(&v2_only).unwrap();

    let mut eocd = sections.eocd(&signed).to_vec();
    set_central_dir_offset(&mut eocd, sections.entries_end() + block.len()).unwrap();
    let mut stripped = sections.entries(&signed).to_vec();
    stripped.extend_from_slice(&block);
    stripped.extend_from_slice(sections.central_dir(&signed));
    stripped.extend_from_slice(&eocd);

    let verification = verify(&stripped).unwrap();
    assert_eq!(verification.v3, SchemeStatus::Absent);
    assert!(matches!(verification.v2, SchemeStatus::Failed(_)));
    assert!(matches!(verification.v1, SchemeStatus::Failed(_)));
}

#[test]
fn test_v1_only_signature() {
    let dir = tempfile::tempdir().unwrap();
    let identity = generate_identity(&KeystoreConfig::in_dir(dir.path())).unwrap();
    let signed = ApkSigner::new(&identity)
        .v2_signing_enabled(false)
        .v3_signing_enabled(false)
        .sign_bytes(&build_unsigned_apk())
        .unwrap();

    let verification = verify(&signed).unwrap();
    assert_eq!(verification.v1, SchemeStatus::Verified);
    assert_eq!(verification.v2, SchemeStatus::Absent);
    assert_eq!(verification.v3, SchemeStatus::Absent);
    assert!(verification.is_verified());
}

#[test]
fn test_resign_with_other_identity() {
    let dir = tempfile::tempdir().unwrap();
    let config = KeystoreConfig::in_dir(dir.path());
    let first = generate_identity(&config).unwrap();
    let second = generate_identity(&config).unwrap();

    let once = ApkSigner::new(&first).sign_bytes(&build_unsigned_apk()).unwrap();
    let twice = ApkSigner::new(&second).sign_bytes(&once).unwrap();

    let verification = verify(&twice).unwrap();
    assert!(verification.is_verified());
    assert_eq!(verification.certificates, vec![second.certificate_der().unwrap()]);
}
