/*
 *
 *  * // Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
 *  * //
 *  * // signatrust is licensed under Mulan PSL v2.
 *  * // You can use this software according to the terms and conditions of the Mulan
 *  * // PSL v2.
 *  * // You may obtain a copy of Mulan PSL v2 at:
 *  * //         http://license.coscl.org.cn/MulanPSL2
 *  * // THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
 *  * // KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
 *  * // NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 *  * // See the Mulan PSL v2 for more details.
 *
 */
//! Authenticode `SignedData` envelopes.
use crate::asn1::{
    DigestInfo, SpcAttributeTypeAndOptionalValue, SpcIndirectDataContent, SpcLink,
    SpcSpOpusInfo, SpcString, ID_CONTENT_TYPE, ID_COUNTER_SIGNATURE, ID_MESSAGE_DIGEST,
    ID_SIGNED_DATA, SPC_INDIRECT_DATA_OBJID, SPC_INDIVIDUAL_SP_KEY_PURPOSE_OBJID,
    SPC_NESTED_SIGNATURE_OBJID, SPC_PE_IMAGE_DATA, SPC_PE_IMAGE_DATA_OBJID, SPC_RFC3161_OBJID,
    SPC_SP_OPUS_INFO_OBJID, SPC_STATEMENT_TYPE_OBJID,
};
use crate::digest::{AuthenticodeDigest, DigestAlgorithm};
use crate::error::{
    DecodeSignatureSnafu, EncodeSnafu, InvalidSignatureSnafu, Result, VerifyCryptoSnafu,
    VerifySnafu,
};
use crate::identity::SigningIdentity;
use crate::timestamp::TimestampToken;
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use der::asn1::{Any, Ia5String, ObjectIdentifier, OctetString, SetOfVec};
use der::{Decode, Encode, EncodeValue, SliceReader, Tagged};
use log::{debug, warn};
use openssl::sign::Verifier;
use openssl::x509::X509;
use snafu::{OptionExt, ResultExt};
use x509_cert::attr::Attribute;
use x509_cert::Certificate;

fn attribute<T>(oid: ObjectIdentifier, value: &T, what: &str) -> Result<Attribute>
where
    T: Tagged + EncodeValue,
{
    let value = Any::encode_from(value).context(EncodeSnafu { what })?;
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).context(EncodeSnafu { what })?,
    })
}

pub(crate) fn find_attribute(
    attrs: Option<&SetOfVec<Attribute>>,
    oid: ObjectIdentifier,
) -> Option<&Attribute> {
    attrs.and_then(|attrs| attrs.iter().find(|attr| attr.oid == oid))
}

/// Check `signature` over `data` with the public key of `cert`.
pub(crate) fn verify_with_certificate(
    cert: &Certificate,
    algorithm: DigestAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool> {
    let cert_der = cert.to_der().context(EncodeSnafu {
        what: "signer certificate",
    })?;
    let public_key = X509::from_der(&cert_der)
        .context(VerifyCryptoSnafu {})?
        .public_key()
        .context(VerifyCryptoSnafu {})?;
    let mut verifier =
        Verifier::new(algorithm.message_digest(), &public_key).context(VerifyCryptoSnafu {})?;
    verifier.update(data).context(VerifyCryptoSnafu {})?;
    verifier
        .verify(signature)
        .context(VerifyCryptoSnafu {})
        .map_err(Into::into)
}

/// Build a certificate set, dropping duplicates.
pub(crate) fn certificate_set<'c, I>(certs: I) -> Result<CertificateSet>
where
    I: IntoIterator<Item = &'c Certificate>,
{
    let mut seen: Vec<Vec<u8>> = Vec::new();
    let mut choices = Vec::new();
    for cert in certs {
        let der = cert.to_der().context(EncodeSnafu { what: "certificate" })?;
        if seen.contains(&der) {
            continue;
        }
        seen.push(der);
        choices.push(CertificateChoices::Certificate(cert.clone()));
    }
    Ok(CertificateSet(
        SetOfVec::try_from(choices).context(EncodeSnafu {
            what: "certificate set",
        })?,
    ))
}

/// Builds the Authenticode signature of one image digest.
pub struct SignatureBuilder<'a> {
    identity: &'a SigningIdentity<'a>,
    program_name: Option<String>,
    program_url: Option<String>,
}

impl<'a> SignatureBuilder<'a> {
    pub fn new(identity: &'a SigningIdentity<'a>) -> Self {
        SignatureBuilder {
            identity,
            program_name: None,
            program_url: None,
        }
    }

    pub fn program_name<S: Into<String>>(mut self, name: Option<S>) -> Self {
        self.program_name = name.map(Into::into);
        self
    }

    pub fn program_url<S: Into<String>>(mut self, url: Option<S>) -> Self {
        self.program_url = url.map(Into::into);
        self
    }

    fn opus_info(&self) -> Result<SpcSpOpusInfo> {
        let program_name = match &self.program_name {
            Some(name) => Some(SpcString::from_str_unicode(name).context(EncodeSnafu {
                what: "program name",
            })?),
            None => None,
        };
        let more_info = match &self.program_url {
            Some(url) => Some(SpcLink::Url(Ia5String::new(url).context(EncodeSnafu {
                what: "program url",
            })?)),
            None => None,
        };
        Ok(SpcSpOpusInfo {
            program_name,
            more_info,
        })
    }

    /// Sign `digest` with the identity, producing a complete envelope.
    pub fn build(self, digest: AuthenticodeDigest) -> Result<SignatureEnvelope> {
        let algorithm = digest.algorithm();
        let digest_alg = algorithm.algorithm_identifier()?;
        let signature_alg = self
            .identity
            .key_algorithm()
            .signature_algorithm(algorithm)?;

        let indirect = SpcIndirectDataContent {
            data: SpcAttributeTypeAndOptionalValue {
                value_type: SPC_PE_IMAGE_DATA_OBJID,
                value: Any::from_der(&SPC_PE_IMAGE_DATA).context(EncodeSnafu {
                    what: "pe image data",
                })?,
            },
            message_digest: DigestInfo {
                digest_algorithm: digest_alg.clone(),
                digest: OctetString::new(digest.into_bytes()).context(EncodeSnafu {
                    what: "image digest",
                })?,
            },
        };
        let econtent = Any::encode_from(&indirect).context(EncodeSnafu {
            what: "indirect data content",
        })?;
        // messageDigest covers the content octets only, not the SEQUENCE header
        let content_digest = algorithm.digest(econtent.value());

        let signed_attrs = SetOfVec::try_from(vec![
            attribute(ID_CONTENT_TYPE, &SPC_INDIRECT_DATA_OBJID, "content type attribute")?,
            attribute(SPC_SP_OPUS_INFO_OBJID, &self.opus_info()?, "opus info attribute")?,
            attribute(
                SPC_STATEMENT_TYPE_OBJID,
                &vec![SPC_INDIVIDUAL_SP_KEY_PURPOSE_OBJID],
                "statement type attribute",
            )?,
            attribute(
                ID_MESSAGE_DIGEST,
                &OctetString::new(content_digest).context(EncodeSnafu {
                    what: "message digest",
                })?,
                "message digest attribute",
            )?,
        ])
        .context(EncodeSnafu {
            what: "signed attributes",
        })?;

        let to_be_signed = signed_attrs.to_der().context(EncodeSnafu {
            what: "signed attributes",
        })?;
        let signature = self.identity.sign(algorithm, &to_be_signed)?;
        debug!(
            "{} signature of {} bytes made by {}",
            self.identity.key_algorithm(),
            signature.len(),
            self.identity.alias()
        );

        let leaf = self.identity.leaf();
        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: leaf.tbs_certificate.issuer.clone(),
                serial_number: leaf.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_alg.clone(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: signature_alg,
            signature: OctetString::new(signature).context(EncodeSnafu {
                what: "signature value",
            })?,
            unsigned_attrs: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms: SetOfVec::try_from(vec![digest_alg]).context(EncodeSnafu {
                what: "digest algorithms",
            })?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: SPC_INDIRECT_DATA_OBJID,
                econtent: Some(econtent),
            },
            certificates: Some(certificate_set(self.identity.certificate_chain())?),
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).context(
                EncodeSnafu {
                    what: "signer infos",
                },
            )?),
        };
        SignatureEnvelope::from_signed_data(signed_data)
    }
}

/// A parsed Authenticode signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureEnvelope {
    signed_data: SignedData,
    indirect: SpcIndirectDataContent,
}

impl SignatureEnvelope {
    /// Decode a DER `ContentInfo`. Bytes after it, such as table padding, are ignored.
    pub fn from_der(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data).context(DecodeSignatureSnafu {})?;
        let content_info = ContentInfo::decode(&mut reader).context(DecodeSignatureSnafu {})?;
        if content_info.content_type != ID_SIGNED_DATA {
            InvalidSignatureSnafu {
                reason: format!("content type {} is not signed data", content_info.content_type),
            }
            .fail()?
        }
        let signed_data = content_info
            .content
            .decode_as::<SignedData>()
            .context(DecodeSignatureSnafu {})?;
        SignatureEnvelope::from_signed_data(signed_data)
    }

    fn from_signed_data(signed_data: SignedData) -> Result<Self> {
        let eci = &signed_data.encap_content_info;
        if eci.econtent_type != SPC_INDIRECT_DATA_OBJID {
            InvalidSignatureSnafu {
                reason: format!("content type {} is not SPC indirect data", eci.econtent_type),
            }
            .fail()?
        }
        let indirect = eci
            .econtent
            .as_ref()
            .context(InvalidSignatureSnafu {
                reason: "missing indirect data content",
            })?
            .decode_as::<SpcIndirectDataContent>()
            .context(DecodeSignatureSnafu {})?;

        // authenticode only carries one signer and one digest algorithm
        if signed_data.digest_algorithms.len() != 1 {
            InvalidSignatureSnafu {
                reason: format!(
                    "invalid digest algorithms numbers: {}",
                    signed_data.digest_algorithms.len()
                ),
            }
            .fail()?
        }
        if signed_data.signer_infos.0.len() != 1 {
            InvalidSignatureSnafu {
                reason: format!(
                    "invalid signer_info numbers: {}",
                    signed_data.signer_infos.0.len()
                ),
            }
            .fail()?
        }
        let envelope = SignatureEnvelope {
            signed_data,
            indirect,
        };
        let digest_alg = &envelope.signer_info().digest_alg;
        if !envelope
            .signed_data
            .digest_algorithms
            .iter()
            .any(|alg| alg.oid == digest_alg.oid)
        {
            InvalidSignatureSnafu {
                reason: format!(
                    "digest algorithm not consistent: {} in signer info but not in signed data",
                    digest_alg.oid
                ),
            }
            .fail()?
        }
        Ok(envelope)
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        let content_info = ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&self.signed_data).context(EncodeSnafu {
                what: "signed data",
            })?,
        };
        content_info
            .to_der()
            .context(EncodeSnafu {
                what: "content info",
            })
            .map_err(Into::into)
    }

    pub fn signed_data(&self) -> &SignedData {
        &self.signed_data
    }

    /// The embedded Authenticode digest of the image.
    pub fn digest(&self) -> &[u8] {
        self.indirect.message_digest.digest.as_bytes()
    }

    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm> {
        DigestAlgorithm::from_oid(&self.indirect.message_digest.digest_algorithm.oid)
    }

    pub fn signer_info(&self) -> &SignerInfo {
        // from_signed_data checked there is exactly one
        &self.signed_data.signer_infos.0.as_slice()[0]
    }

    pub fn signature_value(&self) -> &[u8] {
        self.signer_info().signature.as_bytes()
    }

    pub fn certificates(&self) -> Vec<&Certificate> {
        match &self.signed_data.certificates {
            Some(set) => set
                .0
                .iter()
                .filter_map(|choice| match choice {
                    CertificateChoices::Certificate(cert) => Some(cert),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// The certificate named by `sid` of `signer`, looked up in this envelope.
    pub(crate) fn find_certificate(&self, signer: &SignerInfo) -> Option<&Certificate> {
        let SignerIdentifier::IssuerAndSerialNumber(ias) = &signer.sid else {
            return None;
        };
        self.certificates().into_iter().find(|cert| {
            cert.tbs_certificate.issuer == ias.issuer
                && cert.tbs_certificate.serial_number == ias.serial_number
        })
    }

    pub fn signer_certificate(&self) -> Option<&Certificate> {
        self.find_certificate(self.signer_info())
    }

    pub fn program_name(&self) -> Result<Option<String>> {
        let attrs = self.signer_info().signed_attrs.as_ref();
        let Some(attr) = find_attribute(attrs, SPC_SP_OPUS_INFO_OBJID) else {
            return Ok(None);
        };
        let Some(value) = attr.values.iter().next() else {
            return Ok(None);
        };
        let opus = value
            .decode_as::<SpcSpOpusInfo>()
            .context(DecodeSignatureSnafu {})?;
        Ok(opus.program_name.map(|name| name.to_string_lossy()))
    }

    /// Timestamps in the unsigned attributes, legacy counter-signatures first.
    pub fn timestamp_tokens(&self) -> Result<Vec<TimestampToken>> {
        let mut tokens = Vec::new();
        let attrs = self.signer_info().unsigned_attrs.as_ref();
        if let Some(attr) = find_attribute(attrs, ID_COUNTER_SIGNATURE) {
            for value in attr.values.iter() {
                let signer_info = value
                    .decode_as::<SignerInfo>()
                    .context(DecodeSignatureSnafu {})?;
                let certificates = self
                    .find_certificate(&signer_info)
                    .into_iter()
                    .cloned()
                    .collect();
                tokens.push(TimestampToken::Authenticode {
                    signer_info,
                    certificates,
                });
            }
        }
        if let Some(attr) = find_attribute(attrs, SPC_RFC3161_OBJID) {
            for value in attr.values.iter() {
                let token = value
                    .decode_as::<ContentInfo>()
                    .context(DecodeSignatureSnafu {})?;
                tokens.push(TimestampToken::Rfc3161(token));
            }
        }
        Ok(tokens)
    }

    /// Signatures nested in this one, depth-first.
    pub fn nested_signatures(&self) -> Result<Vec<SignatureEnvelope>> {
        let mut res = Vec::new();
        let attrs = self.signer_info().unsigned_attrs.as_ref();
        if let Some(attr) = find_attribute(attrs, SPC_NESTED_SIGNATURE_OBJID) {
            for value in attr.values.iter() {
                let der = value.to_der().context(EncodeSnafu {
                    what: "nested signature",
                })?;
                let nested = SignatureEnvelope::from_der(&der)?;
                let deeper = nested.nested_signatures()?;
                res.push(nested);
                res.extend(deeper);
            }
        }
        Ok(res)
    }

    /// A copy of this envelope carrying `token` as an unsigned attribute.
    ///
    /// The signature value is not touched; certificates of a legacy
    /// counter-signature are merged into the certificate set.
    pub fn with_timestamp(&self, token: TimestampToken) -> Result<SignatureEnvelope> {
        let extra: &[Certificate] = match &token {
            TimestampToken::Authenticode { certificates, .. } => certificates.as_slice(),
            TimestampToken::Rfc3161(_) => &[],
        };
        let envelope = self.with_unsigned_attribute(token.to_attribute()?, extra)?;
        debug!("timestamp {:?} attached", token.protocol());
        Ok(envelope)
    }

    /// A copy of this envelope carrying `nested` in its nested signature attribute.
    pub fn with_nested_signature(&self, nested: &SignatureEnvelope) -> Result<SignatureEnvelope> {
        let value = Any::from_der(&nested.to_der()?).context(EncodeSnafu {
            what: "nested signature",
        })?;
        let attr = Attribute {
            oid: SPC_NESTED_SIGNATURE_OBJID,
            values: SetOfVec::try_from(vec![value]).context(EncodeSnafu {
                what: "nested signature attribute",
            })?,
        };
        let envelope = self.with_unsigned_attribute(attr, &[])?;
        debug!(
            "{} signature nested",
            nested
                .digest_algorithm()
                .map(|alg| alg.to_string())
                .unwrap_or_default()
        );
        Ok(envelope)
    }

    /// Add the values of `new_attr` to the unsigned attributes, next to any of the same type.
    fn with_unsigned_attribute(
        &self,
        new_attr: Attribute,
        certificates: &[Certificate],
    ) -> Result<SignatureEnvelope> {
        let mut signed_data = self.signed_data.clone();
        let mut signer_info = self.signer_info().clone();

        let mut unsigned: Vec<Attribute> = signer_info
            .unsigned_attrs
            .take()
            .map(|attrs| attrs.iter().cloned().collect())
            .unwrap_or_default();
        match unsigned.iter_mut().find(|attr| attr.oid == new_attr.oid) {
            Some(existing) => {
                let values: Vec<Any> = existing
                    .values
                    .iter()
                    .chain(new_attr.values.iter())
                    .cloned()
                    .collect();
                existing.values = SetOfVec::try_from(values).context(EncodeSnafu {
                    what: "unsigned attribute",
                })?;
            }
            None => unsigned.push(new_attr),
        }
        signer_info.unsigned_attrs = Some(SetOfVec::try_from(unsigned).context(EncodeSnafu {
            what: "unsigned attributes",
        })?);
        signed_data.signer_infos = SignerInfos(SetOfVec::try_from(vec![signer_info]).context(
            EncodeSnafu {
                what: "signer infos",
            },
        )?);

        if !certificates.is_empty() {
            let merged: Vec<&Certificate> = self
                .certificates()
                .into_iter()
                .chain(certificates.iter())
                .collect();
            signed_data.certificates = Some(certificate_set(merged)?);
        }
        SignatureEnvelope::from_signed_data(signed_data)
    }

    /// Check the authenticated attributes and the signature value.
    ///
    /// Only the signer certificate's key is used, the chain is not validated.
    pub fn verify_signature(&self) -> Result<()> {
        let signer_info = self.signer_info();
        let algorithm = DigestAlgorithm::from_oid(&signer_info.digest_alg.oid)?;
        let signed_attrs = signer_info.signed_attrs.as_ref().context(VerifySnafu {
            reason: "missing authenticated attributes",
        })?;

        let content_type = find_attribute(Some(signed_attrs), ID_CONTENT_TYPE)
            .and_then(|attr| attr.values.iter().next())
            .map(|value| value.decode_as::<ObjectIdentifier>())
            .transpose()
            .context(DecodeSignatureSnafu {})?;
        if content_type != Some(SPC_INDIRECT_DATA_OBJID) {
            VerifySnafu {
                reason: format!("content type attribute {:?} is not SPC indirect data", content_type),
            }
            .fail()?
        }

        let message_digest = find_attribute(Some(signed_attrs), ID_MESSAGE_DIGEST)
            .and_then(|attr| attr.values.iter().next())
            .context(VerifySnafu {
                reason: "missing message digest attribute",
            })?
            .decode_as::<OctetString>()
            .context(DecodeSignatureSnafu {})?;
        let econtent = self
            .signed_data
            .encap_content_info
            .econtent
            .as_ref()
            .context(VerifySnafu {
                reason: "missing indirect data content",
            })?;
        if algorithm.digest(econtent.value()) != message_digest.as_bytes() {
            VerifySnafu {
                reason: "message digest attribute does not match the indirect data content",
            }
            .fail()?
        }

        let cert = self.signer_certificate().context(VerifySnafu {
            reason: "signer certificate not found in the envelope",
        })?;
        let to_be_signed = signed_attrs.to_der().context(EncodeSnafu {
            what: "signed attributes",
        })?;
        if !verify_with_certificate(cert, algorithm, &to_be_signed, self.signature_value())? {
            warn!("signature value does not verify with the signer certificate");
            VerifySnafu {
                reason: "signature value does not match the authenticated attributes",
            }
            .fail()?
        }
        Ok(())
    }
}
