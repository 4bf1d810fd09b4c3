#![allow(dead_code)]
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo, SignerInfos,
};
use der::asn1::{Any, GeneralizedTime, Null, ObjectIdentifier, OctetString, SetOfVec};
use der::{Decode, Encode};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use pe_signer::asn1::{
    AuthenticodeTimestampRequest, PkiStatusInfo, TimeStampReq, TimeStampResp, TstInfo,
    ID_CONTENT_TYPE, ID_CT_TST_INFO, ID_DATA, ID_MESSAGE_DIGEST, ID_SHA1, ID_SHA256,
    ID_SIGNED_DATA, RSA_ENCRYPTION,
};
use pe_signer::{
    HttpResponse, OpensslKeyStore, TimestampConfig, TimestampProtocol, TimestampTransport,
    TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::attr::Attribute;
use x509_cert::Certificate;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const PE_POINTER: usize = 0x80;
pub const OPTIONAL_HEADER: usize = PE_POINTER + 4 + 20;
pub const CHECKSUM_OFFSET: usize = OPTIONAL_HEADER + 64;
pub const HEADERS_SIZE: usize = 0x400;

/// Shape of a synthesized PE image.
#[derive(Clone, Debug)]
pub struct PeSpec {
    pub is_64: bool,
    pub sections: usize,
    pub section_size: usize,
    pub overlay: usize,
    pub data_directories: u32,
}

impl Default for PeSpec {
    fn default() -> Self {
        PeSpec {
            is_64: true,
            sections: 2,
            section_size: 0x1000,
            overlay: 0,
            data_directories: 16,
        }
    }
}

impl PeSpec {
    pub fn cert_directory_offset(&self) -> usize {
        let fixed = if self.is_64 { 112 } else { 96 };
        OPTIONAL_HEADER + fixed + 4 * 8
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Deterministic filler so that different images hash differently.
fn fill(buf: &mut [u8], seed: u32) {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    for b in buf.iter_mut() {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        *b = (state >> 16) as u8;
    }
}

/// Build a minimal but well-formed PE image.
pub fn build_pe(spec: &PeSpec) -> Vec<u8> {
    let opt_size: usize = if spec.is_64 { 0xF0 } else { 0xE0 };
    let fixed = if spec.is_64 { 112 } else { 96 };
    // keep the optional header size fixed, fewer directories leave a gap
    let mut buf = vec![0u8; HEADERS_SIZE + spec.sections * spec.section_size];

    // DOS header
    buf[0] = b'M';
    buf[1] = b'Z';
    put_u32(&mut buf, 0x3c, PE_POINTER as u32);

    // PE signature and COFF header
    buf[PE_POINTER..PE_POINTER + 4].copy_from_slice(b"PE\0\0");
    let coff = PE_POINTER + 4;
    put_u16(&mut buf, coff, if spec.is_64 { 0x8664 } else { 0x14c });
    put_u16(&mut buf, coff + 2, spec.sections as u16);
    put_u32(&mut buf, coff + 4, 0x6500_0000);
    put_u16(&mut buf, coff + 16, opt_size as u16);
    put_u16(&mut buf, coff + 18, 0x0022);

    // optional header
    let oh = OPTIONAL_HEADER;
    put_u16(&mut buf, oh, if spec.is_64 { 0x20b } else { 0x10b });
    buf[oh + 2] = 14;
    put_u32(&mut buf, oh + 4, (spec.sections * spec.section_size) as u32);
    put_u32(&mut buf, oh + 16, 0x1000);
    put_u32(&mut buf, oh + 20, 0x1000);
    let win = if spec.is_64 {
        put_u64(&mut buf, oh + 24, 0x1_4000_0000);
        oh + 32
    } else {
        put_u32(&mut buf, oh + 24, 0x2000);
        put_u32(&mut buf, oh + 28, 0x40_0000);
        oh + 32
    };
    put_u32(&mut buf, win, 0x1000); // section alignment
    put_u32(&mut buf, win + 4, 0x200); // file alignment
    put_u16(&mut buf, win + 8, 6);
    put_u16(&mut buf, win + 16, 6);
    let size_of_image = 0x1000 * (spec.sections + 1) as u32;
    put_u32(&mut buf, win + 24, size_of_image);
    put_u32(&mut buf, win + 28, HEADERS_SIZE as u32);
    // checksum at win + 32 stays zero
    put_u16(&mut buf, win + 36, 3);
    put_u16(&mut buf, win + 38, 0x8160);
    let rest = if spec.is_64 {
        put_u64(&mut buf, win + 40, 0x10_0000);
        put_u64(&mut buf, win + 48, 0x1000);
        put_u64(&mut buf, win + 56, 0x10_0000);
        put_u64(&mut buf, win + 64, 0x1000);
        win + 72
    } else {
        put_u32(&mut buf, win + 40, 0x10_0000);
        put_u32(&mut buf, win + 44, 0x1000);
        put_u32(&mut buf, win + 48, 0x10_0000);
        put_u32(&mut buf, win + 52, 0x1000);
        win + 56
    };
    put_u32(&mut buf, rest + 4, spec.data_directories);
    assert_eq!(rest + 8, oh + fixed);

    // section table
    let table = oh + opt_size;
    for i in 0..spec.sections {
        let entry = table + i * 40;
        let name = format!(".sec{}", i);
        buf[entry..entry + name.len()].copy_from_slice(name.as_bytes());
        put_u32(&mut buf, entry + 8, spec.section_size as u32);
        put_u32(&mut buf, entry + 12, 0x1000 * (i as u32 + 1));
        put_u32(&mut buf, entry + 16, spec.section_size as u32);
        put_u32(&mut buf, entry + 20, (HEADERS_SIZE + i * spec.section_size) as u32);
        put_u32(&mut buf, entry + 36, 0x4000_0040);
    }

    fill(&mut buf[HEADERS_SIZE..], spec.sections as u32 ^ spec.section_size as u32);
    let mut overlay = vec![0u8; spec.overlay];
    fill(&mut overlay, 0xdead_beef);
    buf.extend(overlay);
    buf
}

pub fn default_pe() -> Vec<u8> {
    build_pe(&PeSpec::default())
}

pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn self_signed(key: &PKey<Private>, cn: &str, serial: u32) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

pub fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

pub fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

pub fn rsa_store(alias: &str) -> OpensslKeyStore {
    let key = rsa_key();
    let cert = self_signed(&key, "pe_signer test RSA", 1001);
    let mut store = OpensslKeyStore::new();
    store.insert(alias, key, vec![cert]).unwrap();
    store
}

pub fn ec_store(alias: &str) -> OpensslKeyStore {
    let key = ec_key();
    let cert = self_signed(&key, "pe_signer test ECDSA", 1002);
    let mut store = OpensslKeyStore::new();
    store.insert(alias, key, vec![cert]).unwrap();
    store
}

/// PEM encoded RSA key and certificate.
pub fn rsa_pem() -> (Vec<u8>, Vec<u8>) {
    let key = rsa_key();
    let cert = self_signed(&key, "pe_signer test PEM", 1003);
    (
        key.private_key_to_pem_pkcs8().unwrap(),
        cert.to_pem().unwrap(),
    )
}

pub fn timestamp_config(protocol: TimestampProtocol, retries: u32) -> TimestampConfig {
    TimestampConfig {
        protocol,
        urls: vec![
            "http://tsa-1.invalid/".to_string(),
            "http://tsa-2.invalid/".to_string(),
        ],
        retries,
        retry_wait_secs: 0,
        timeout_secs: 5,
        ..Default::default()
    }
}

/// Wrap `answer` into a transport counting its calls.
pub fn mock_transport<F>(answer: F) -> (Box<dyn TimestampTransport>, Arc<AtomicUsize>)
where
    F: Fn(&str, &[u8]) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let transport = move |url: &str,
                          _content_type: &str,
                          body: &[u8],
                          _timeout: Duration|
          -> Result<HttpResponse, TransportError> {
        counter.fetch_add(1, Ordering::SeqCst);
        answer(url, body)
    };
    (Box::new(transport), calls)
}

pub fn status(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        content_type: None,
        body: Vec::new(),
    }
}

fn digest_alg(oid: ObjectIdentifier) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid,
        parameters: Some(Any::encode_from(&Null).unwrap()),
    }
}

/// How a mock RFC 3161 authority misbehaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rfc3161Answer {
    Granted,
    WrongNonce,
    WrongImprint,
    Rejected,
}

/// DER `TimeStampResp` answering `request`.
pub fn rfc3161_response(request: &[u8], answer: Rfc3161Answer) -> Vec<u8> {
    let req = TimeStampReq::from_der(request).unwrap();
    if answer == Rfc3161Answer::Rejected {
        return TimeStampResp {
            status: PkiStatusInfo {
                status: 2,
                status_string: Some(vec!["policy not supported".to_string()]),
                fail_info: None,
            },
            time_stamp_token: None,
        }
        .to_der()
        .unwrap();
    }

    let mut imprint = req.message_imprint.clone();
    if answer == Rfc3161Answer::WrongImprint {
        let mut bytes = imprint.hashed_message.as_bytes().to_vec();
        bytes[0] ^= 0xff;
        imprint.hashed_message = OctetString::new(bytes).unwrap();
    }
    let nonce = match answer {
        Rfc3161Answer::WrongNonce => req.nonce.map(|n| n.wrapping_add(1)),
        _ => req.nonce,
    };
    let tst_info = TstInfo {
        version: 1,
        policy: ObjectIdentifier::new_unwrap("1.2.3.4.1"),
        message_imprint: imprint,
        serial_number: SerialNumber::new(&[0x2a]).unwrap(),
        gen_time: GeneralizedTime::from_unix_duration(Duration::from_secs(1_700_000_000)).unwrap(),
        accuracy: None,
        ordering: None,
        nonce,
        tsa: None,
        extensions: None,
    };
    let econtent = OctetString::new(tst_info.to_der().unwrap()).unwrap();
    let signed_data = SignedData {
        version: CmsVersion::V3,
        digest_algorithms: SetOfVec::try_from(vec![digest_alg(ID_SHA256)]).unwrap(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_CT_TST_INFO,
            econtent: Some(Any::encode_from(&econtent).unwrap()),
        },
        certificates: None,
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };
    TimeStampResp {
        status: PkiStatusInfo {
            status: 0,
            status_string: None,
            fail_info: None,
        },
        time_stamp_token: Some(ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).unwrap(),
        }),
    }
    .to_der()
    .unwrap()
}

/// A legacy Authenticode authority signing with SHA-1.
pub struct LegacyTsa {
    key: PKey<Private>,
    cert: X509,
    signed_attributes: bool,
}

impl LegacyTsa {
    pub fn new() -> Self {
        let key = rsa_key();
        let cert = self_signed(&key, "pe_signer test TSA", 2001);
        LegacyTsa {
            key,
            cert,
            signed_attributes: false,
        }
    }

    /// Counter-sign through `contentType` and `messageDigest` attributes.
    pub fn with_signed_attributes(mut self) -> Self {
        self.signed_attributes = true;
        self
    }

    pub fn certificate(&self) -> Certificate {
        Certificate::from_der(&self.cert.to_der().unwrap()).unwrap()
    }

    /// Base64 response to a base64 `request`; `listed` is the digest algorithm
    /// announced in the response, the counter-signature always uses SHA-1.
    pub fn respond(&self, request: &[u8], listed: ObjectIdentifier) -> Vec<u8> {
        let der = STANDARD.decode(request).unwrap();
        let req = AuthenticodeTimestampRequest::from_der(&der).unwrap();
        let content = req
            .content
            .econtent
            .unwrap()
            .decode_as::<OctetString>()
            .unwrap();
        self.counter_sign(content.as_bytes(), listed)
    }

    /// Base64 response counter-signing `signature`, whatever was asked.
    pub fn counter_sign(&self, signature: &[u8], listed: ObjectIdentifier) -> Vec<u8> {
        let signed_attrs = if self.signed_attributes {
            let message_digest = openssl::hash::hash(MessageDigest::sha1(), signature).unwrap();
            Some(
                SetOfVec::try_from(vec![
                    attribute(ID_CONTENT_TYPE, Any::encode_from(&ID_DATA).unwrap()),
                    attribute(
                        ID_MESSAGE_DIGEST,
                        Any::encode_from(&OctetString::new(message_digest.to_vec()).unwrap())
                            .unwrap(),
                    ),
                ])
                .unwrap(),
            )
        } else {
            None
        };
        let to_be_signed = match &signed_attrs {
            Some(attrs) => attrs.to_der().unwrap(),
            None => signature.to_vec(),
        };

        let mut signer = Signer::new(MessageDigest::sha1(), &self.key).unwrap();
        signer.update(&to_be_signed).unwrap();
        let counter_signature = signer.sign_to_vec().unwrap();

        let cert = self.certificate();
        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: cert.tbs_certificate.issuer.clone(),
                serial_number: cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_alg(ID_SHA1),
            signed_attrs,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: RSA_ENCRYPTION,
                parameters: Some(Any::encode_from(&Null).unwrap()),
            },
            signature: OctetString::new(counter_signature).unwrap(),
            unsigned_attrs: None,
        };
        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms: SetOfVec::try_from(vec![digest_alg(listed)]).unwrap(),
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: ID_DATA,
                econtent: None,
            },
            certificates: Some(CertificateSet(
                SetOfVec::try_from(vec![CertificateChoices::Certificate(cert)]).unwrap(),
            )),
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).unwrap()),
        };
        let response = ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).unwrap(),
        };
        STANDARD.encode(response.to_der().unwrap()).into_bytes()
    }
}

fn attribute(oid: ObjectIdentifier, value: Any) -> Attribute {
    Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).unwrap(),
    }
}
