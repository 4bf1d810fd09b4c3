mod common;

use common::{build_pe, default_pe, ec_store, init, read_u32, rsa_pem, rsa_store, PeSpec};
use pe_signer::wincert::apply_envelopes;
use pe_signer::{
    read_signatures, remove_signatures, CertificateType, DigestAlgorithm, ErrorKind, KeyStore,
    OpensslKeyStore, PeFile, PeSigner, SignOptions, SignatureBuilder, SignaturePolicy,
    SigningIdentity, WinCertificate,
};

fn options(digest_algorithm: DigestAlgorithm, policy: SignaturePolicy) -> SignOptions {
    SignOptions {
        digest_algorithm,
        policy,
        ..Default::default()
    }
}

fn sign_with(store: &OpensslKeyStore, pe: &mut PeFile, options: SignOptions) {
    let identity = SigningIdentity::from_store(store, "test").unwrap();
    let signer = PeSigner::new(identity, options).unwrap();
    signer.sign(pe).unwrap();
}

#[test]
fn test_sign() {
    init();
    let store = rsa_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    let before = pe.compute_digest(DigestAlgorithm::Sha256).unwrap();

    sign_with(&store, &mut pe, SignOptions::default());

    let new_pe = PeFile::parse(pe.as_bytes().to_vec()).unwrap();
    let signatures = new_pe.signatures().unwrap();
    assert_eq!(signatures.len(), 1);
    assert_eq!(
        signatures[0].digest_algorithm().unwrap(),
        DigestAlgorithm::Sha256
    );
    assert_eq!(signatures[0].digest(), before.as_bytes());
    assert_eq!(
        new_pe.compute_digest(DigestAlgorithm::Sha256).unwrap(),
        before
    );
    assert_eq!(
        new_pe.checksum_from_header().unwrap(),
        new_pe.compute_checksum()
    );
    assert_eq!(signatures[0].certificates().len(), 1);
    assert!(signatures[0].signer_certificate().is_some());
    assert!(signatures[0].timestamp_tokens().unwrap().is_empty());
    new_pe.verify().unwrap();
}

#[test]
fn test_sign_50k_image() {
    init();
    let spec = PeSpec {
        sections: 3,
        section_size: 0x4000,
        overlay: 0x400,
        ..Default::default()
    };
    let original = build_pe(&spec);
    assert_eq!(original.len(), 50 * 1024);
    let mut pe = PeFile::parse(original.clone()).unwrap();

    let store = rsa_store("test");
    let identity = SigningIdentity::from_store(&store, "test").unwrap();
    let signer = PeSigner::new(identity, SignOptions::default()).unwrap();
    let envelope = signer.sign(&mut pe).unwrap();

    let der_len = envelope.to_der().unwrap().len();
    let entry_len = (8 + der_len + 7) / 8 * 8;
    let signed = pe.as_bytes();
    assert_eq!(signed.len(), original.len() + entry_len);
    assert_eq!(pe.signatures().unwrap().len(), 1);

    let region = pe.certificate_table_region().unwrap();
    assert_eq!(region.offset, original.len());
    assert_eq!(region.size, entry_len);

    let checksum = common::CHECKSUM_OFFSET..common::CHECKSUM_OFFSET + 4;
    let dir = spec.cert_directory_offset()..spec.cert_directory_offset() + 8;
    for (i, (a, b)) in original.iter().zip(signed.iter()).enumerate() {
        if checksum.contains(&i) || dir.contains(&i) {
            continue;
        }
        assert_eq!(a, b, "byte {:#x} changed", i);
    }
    assert_eq!(read_u32(signed, dir.start) as usize, original.len());
    assert_eq!(read_u32(signed, dir.start + 4) as usize, entry_len);
    assert_eq!(read_u32(signed, region.offset) as usize, entry_len);
}

#[test]
fn test_sign_replace_is_idempotent() {
    init();
    let store = rsa_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    for _ in 0..3 {
        sign_with(
            &store,
            &mut pe,
            options(DigestAlgorithm::Sha256, SignaturePolicy::Replace),
        );
        assert_eq!(pe.signatures().unwrap().len(), 1);
    }
    pe.verify().unwrap();
}

#[test]
fn test_sign_add_twice() {
    init();
    let rsa = rsa_store("test");
    let ec = ec_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();

    sign_with(
        &rsa,
        &mut pe,
        options(DigestAlgorithm::Sha1, SignaturePolicy::Add),
    );
    sign_with(
        &ec,
        &mut pe,
        options(DigestAlgorithm::Sha256, SignaturePolicy::Add),
    );

    let signatures = read_signatures(&pe).unwrap();
    assert_eq!(signatures.len(), 2);
    assert_eq!(
        signatures[0].digest_algorithm().unwrap(),
        DigestAlgorithm::Sha1
    );
    assert_eq!(
        signatures[1].digest_algorithm().unwrap(),
        DigestAlgorithm::Sha256
    );
    for sig in signatures.iter() {
        let alg = sig.digest_algorithm().unwrap();
        assert_eq!(sig.digest(), pe.compute_digest(alg).unwrap().as_bytes());
        sig.verify_signature().unwrap();
    }
    assert_eq!(pe.certificate_entries().unwrap().len(), 2);
    assert_eq!(pe.checksum_from_header().unwrap(), pe.compute_checksum());
    pe.verify().unwrap();
}

#[test]
fn test_resign_replace_with_sha512() {
    init();
    let store = rsa_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    sign_with(&store, &mut pe, SignOptions::default());
    let old = pe.signatures().unwrap().remove(0).to_der().unwrap();

    sign_with(
        &store,
        &mut pe,
        options(DigestAlgorithm::Sha512, SignaturePolicy::Replace),
    );

    let signatures = pe.signatures().unwrap();
    assert_eq!(signatures.len(), 1);
    assert_eq!(
        signatures[0].digest_algorithm().unwrap(),
        DigestAlgorithm::Sha512
    );
    assert_eq!(signatures[0].digest().len(), 64);
    assert!(!pe.as_bytes().windows(old.len()).any(|w| w == old.as_slice()));
    pe.verify().unwrap();
}

#[test]
fn test_sign_ecdsa() {
    init();
    let store = ec_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    sign_with(
        &store,
        &mut pe,
        options(DigestAlgorithm::Sha384, SignaturePolicy::Add),
    );
    let signatures = pe.signatures().unwrap();
    assert_eq!(
        signatures[0].signer_info().signature_algorithm.oid,
        pe_signer::asn1::ECDSA_WITH_SHA384
    );
    pe.verify().unwrap();
}

#[test]
fn test_sign_ecdsa_md5_unsupported() {
    init();
    let store = ec_store("test");
    let original = default_pe();
    let mut pe = PeFile::parse(original.clone()).unwrap();
    let identity = SigningIdentity::from_store(&store, "test").unwrap();
    let signer = PeSigner::new(
        identity,
        options(DigestAlgorithm::Md5, SignaturePolicy::Add),
    )
    .unwrap();
    let err = signer.sign(&mut pe).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedSignatureAlgorithm);
    assert_eq!(pe.as_bytes(), original.as_slice());
}

#[test]
fn test_sign_program_info() {
    init();
    let store = rsa_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    let opts = SignOptions {
        program_name: Some("Demo Äpp".to_string()),
        program_url: Some("https://example.com/demo".to_string()),
        ..Default::default()
    };
    sign_with(&store, &mut pe, opts);
    let signatures = pe.signatures().unwrap();
    assert_eq!(
        signatures[0].program_name().unwrap().as_deref(),
        Some("Demo Äpp")
    );
    pe.verify().unwrap();
}

#[test]
fn test_sign_unaligned_image() {
    init();
    let spec = PeSpec {
        overlay: 13,
        ..Default::default()
    };
    let original = build_pe(&spec);
    let mut pe = PeFile::parse(original.clone()).unwrap();
    let before = pe.compute_digest(DigestAlgorithm::Sha256).unwrap();
    sign_with(&store_for_test(), &mut pe, SignOptions::default());

    let region = pe.certificate_table_region().unwrap();
    assert_eq!(region.offset % 8, 0);
    assert_eq!(region.offset, original.len() + 3);
    assert_eq!(pe.compute_digest(DigestAlgorithm::Sha256).unwrap(), before);
    pe.verify().unwrap();
}

#[test]
fn test_resign_unaligned_certificate_table() {
    init();
    let spec = PeSpec {
        overlay: 3,
        ..Default::default()
    };
    let mut unaligned = build_pe(&spec);
    let table_offset = unaligned.len();
    assert_ne!(table_offset % 8, 0);
    let foreign = WinCertificate::from_certificate(vec![0x55; 8], CertificateType::X509)
        .encode()
        .unwrap();
    unaligned.extend_from_slice(&foreign);
    let dir = spec.cert_directory_offset();
    unaligned[dir..dir + 4].copy_from_slice(&(table_offset as u32).to_le_bytes());
    unaligned[dir + 4..dir + 8].copy_from_slice(&(foreign.len() as u32).to_le_bytes());

    for (policy, entries) in [(SignaturePolicy::Replace, 1), (SignaturePolicy::Add, 2)] {
        let mut pe = PeFile::parse(unaligned.clone()).unwrap();
        assert_eq!(pe.certificate_table_region().unwrap().offset, table_offset);
        let before = pe.compute_digest(DigestAlgorithm::Sha256).unwrap();
        sign_with(
            &store_for_test(),
            &mut pe,
            options(DigestAlgorithm::Sha256, policy),
        );

        let pe = PeFile::parse(pe.into_bytes()).unwrap();
        let region = pe.certificate_table_region().unwrap();
        assert_eq!(region.offset % 8, 0);
        assert_eq!(region.offset, table_offset + 5);
        assert_eq!(&pe.as_bytes()[table_offset..region.offset], &[0u8; 5]);
        assert_eq!(pe.certificate_entries().unwrap().len(), entries);
        assert_eq!(pe.compute_digest(DigestAlgorithm::Sha256).unwrap(), before);
        assert_eq!(pe.checksum_from_header().unwrap(), pe.compute_checksum());
        pe.verify().unwrap();
    }
}

#[test]
fn test_nested_signatures_read_back() {
    init();
    let store = store_for_test();
    let identity = SigningIdentity::from_store(&store, "test").unwrap();
    let mut pe = PeFile::parse(default_pe()).unwrap();
    let build = |alg: DigestAlgorithm, name: &str| {
        SignatureBuilder::new(&identity)
            .program_name(Some(name))
            .build(pe.compute_digest(alg).unwrap())
            .unwrap()
    };
    let deepest = build(DigestAlgorithm::Sha512, "deepest");
    let inner = build(DigestAlgorithm::Sha1, "inner")
        .with_nested_signature(&deepest)
        .unwrap();
    let outer = build(DigestAlgorithm::Sha256, "outer")
        .with_nested_signature(&inner)
        .unwrap();
    apply_envelopes(&mut pe, &[outer.clone()]).unwrap();

    let pe = PeFile::parse(pe.into_bytes()).unwrap();
    assert_eq!(pe.certificate_entries().unwrap().len(), 1);
    let signatures = pe.signatures().unwrap();
    assert_eq!(signatures.len(), 3);
    assert_eq!(signatures[0].to_der().unwrap(), outer.to_der().unwrap());
    assert_eq!(signatures[1].to_der().unwrap(), inner.to_der().unwrap());
    assert_eq!(signatures[2].to_der().unwrap(), deepest.to_der().unwrap());
    let names: Vec<String> = signatures
        .iter()
        .map(|sig| sig.program_name().unwrap().unwrap())
        .collect();
    assert_eq!(names, vec!["outer", "inner", "deepest"]);
    assert_eq!(
        signatures[1].digest_algorithm().unwrap(),
        DigestAlgorithm::Sha1
    );
    assert_eq!(signatures[0].nested_signatures().unwrap().len(), 2);
    for sig in signatures.iter() {
        sig.verify_signature().unwrap();
    }
    pe.verify().unwrap();
}

fn store_for_test() -> OpensslKeyStore {
    rsa_store("test")
}

#[test]
fn test_resign_keeps_trailing_data() {
    init();
    let store = rsa_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    sign_with(&store, &mut pe, SignOptions::default());

    let mut bytes = pe.into_bytes();
    let trailer = b"TRAILER!".to_vec();
    bytes.extend_from_slice(&trailer);
    let mut pe = PeFile::parse(bytes).unwrap();

    sign_with(
        &store,
        &mut pe,
        options(DigestAlgorithm::Sha256, SignaturePolicy::Replace),
    );
    assert!(pe.as_bytes().ends_with(&trailer));
    assert_eq!(pe.signatures().unwrap().len(), 1);
    pe.verify().unwrap();
}

#[test]
fn test_verify_detects_tampering() {
    init();
    let store = rsa_store("test");
    let mut pe = PeFile::parse(default_pe()).unwrap();
    sign_with(&store, &mut pe, SignOptions::default());

    let mut bytes = pe.into_bytes();
    bytes[common::HEADERS_SIZE + 0x20] ^= 0x5a;
    let tampered = PeFile::parse(bytes).unwrap();
    let err = tampered.verify().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Verification);
}

#[test]
fn test_verify_unsigned() {
    init();
    let pe = PeFile::parse(default_pe()).unwrap();
    let err = pe.verify().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Verification);
}

#[test]
fn test_remove_signatures() {
    init();
    let store = rsa_store("test");
    let original = default_pe();
    let mut pe = PeFile::parse(original.clone()).unwrap();
    let before = pe.compute_digest(DigestAlgorithm::Sha256).unwrap();
    sign_with(&store, &mut pe, SignOptions::default());

    remove_signatures(&mut pe).unwrap();
    assert!(pe.certificate_table_region().is_none());
    assert!(pe.signatures().unwrap().is_empty());
    assert_eq!(pe.len(), original.len());
    assert_eq!(pe.checksum_from_header().unwrap(), pe.compute_checksum());
    assert_eq!(pe.compute_digest(DigestAlgorithm::Sha256).unwrap(), before);
    let dir = PeSpec::default().cert_directory_offset();
    assert_eq!(read_u32(pe.as_bytes(), dir), 0);
    assert_eq!(read_u32(pe.as_bytes(), dir + 4), 0);
}

#[test]
fn test_sign_file() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("app.exe");
    let output = dir.path().join("app.signed.exe");
    std::fs::write(&input, default_pe()).unwrap();

    let store = rsa_store("test");
    let identity = SigningIdentity::from_store(&store, "test").unwrap();
    let signer = PeSigner::new(identity, SignOptions::default()).unwrap();

    signer.sign_file(&input, Some(output.as_path())).unwrap();
    assert!(PeFile::open(&input).unwrap().signatures().unwrap().is_empty());
    let signed = PeFile::open(&output).unwrap();
    assert_eq!(signed.signatures().unwrap().len(), 1);
    signed.verify().unwrap();

    signer.sign_file(&input, None).unwrap();
    assert_eq!(PeFile::open(&input).unwrap().signatures().unwrap().len(), 1);
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 2);
}

#[test]
fn test_key_store() {
    init();
    let (key, cert) = rsa_pem();
    let store = OpensslKeyStore::from_pem("pem", &key, &cert).unwrap();
    assert_eq!(store.aliases().unwrap(), vec!["pem".to_string()]);
    assert_eq!(store.certificate_chain("pem").unwrap().len(), 1);

    let err = SigningIdentity::from_store(&store, "missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SigningIdentity);

    let mut empty = OpensslKeyStore::new();
    let err = empty
        .insert("empty", common::rsa_key(), Vec::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SigningIdentity);
}
