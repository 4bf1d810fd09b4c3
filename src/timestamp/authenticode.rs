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
//! Legacy Authenticode timestamping.
//!
//! The request carries the signature value as `data` content; the authority
//! answers with a PKCS#7 `SignedData` whose signer info becomes a
//! counter-signature of ours.
use super::TimestampToken;
use crate::asn1::{
    AuthenticodeTimestampRequest, ID_DATA, ID_MESSAGE_DIGEST, ID_SIGNED_DATA,
    SPC_TIME_STAMP_REQUEST_OBJID,
};
use crate::digest::DigestAlgorithm;
use crate::envelope::{find_attribute, verify_with_certificate};
use crate::error::{
    EncodeSnafu, Result, TimestampBase64Snafu, TimestampDecodeSnafu, TimestampDigestMismatchSnafu,
    TimestampMalformedSnafu,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo};
use der::asn1::{Any, OctetString};
use der::{Decode, Encode, SliceReader};
use log::debug;
use snafu::{OptionExt, ResultExt};
use x509_cert::Certificate;

pub(crate) const CONTENT_TYPE: &str = "application/octet-stream";

/// Base64 text of the DER request for `signature`.
pub(crate) fn build_request(signature: &[u8]) -> Result<Vec<u8>> {
    let content = OctetString::new(signature).context(EncodeSnafu {
        what: "timestamp request content",
    })?;
    let request = AuthenticodeTimestampRequest {
        countersignature_type: SPC_TIME_STAMP_REQUEST_OBJID,
        content: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: Some(Any::encode_from(&content).context(EncodeSnafu {
                what: "timestamp request content",
            })?),
        },
    };
    let der = request.to_der().context(EncodeSnafu {
        what: "timestamp request",
    })?;
    Ok(STANDARD.encode(der).into_bytes())
}

/// Decode a response body, base64 or raw DER, into a counter-signature of `signature`.
pub(crate) fn parse_response(body: &[u8], signature: &[u8]) -> Result<TimestampToken> {
    let der = match body.first() {
        Some(0x30) => body.to_vec(),
        Some(_) => {
            let text: Vec<u8> = body
                .iter()
                .filter(|b| !b.is_ascii_whitespace() && **b != 0)
                .copied()
                .collect();
            STANDARD.decode(text).context(TimestampBase64Snafu {})?
        }
        None => TimestampMalformedSnafu {
            reason: "empty response body",
        }
        .fail()?,
    };

    let mut reader = SliceReader::new(&der).context(TimestampDecodeSnafu {})?;
    let content_info = ContentInfo::decode(&mut reader).context(TimestampDecodeSnafu {})?;
    if content_info.content_type != ID_SIGNED_DATA {
        TimestampMalformedSnafu {
            reason: format!("response content type {} is not signed data", content_info.content_type),
        }
        .fail()?
    }
    let signed_data = content_info
        .content
        .decode_as::<SignedData>()
        .context(TimestampDecodeSnafu {})?;

    let signer_info = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .cloned()
        .context(TimestampMalformedSnafu {
            reason: "response carries no signer info",
        })?;
    if !signed_data
        .digest_algorithms
        .iter()
        .any(|alg| alg.oid == signer_info.digest_alg.oid)
    {
        TimestampDigestMismatchSnafu {
            reason: format!(
                "signer info digest algorithm {} is not listed in the response",
                signer_info.digest_alg.oid
            ),
        }
        .fail()?
    }

    let certificates = signed_data
        .certificates
        .map(|set| {
            set.0
                .iter()
                .filter_map(|choice| match choice {
                    CertificateChoices::Certificate(cert) => Some(cert.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    check_binding(&signer_info, &certificates, signature)?;
    debug!("counter-signature digested with {}", signer_info.digest_alg.oid);
    Ok(TimestampToken::Authenticode {
        signer_info,
        certificates,
    })
}

/// The counter-signature must cover `signature`: through its `messageDigest`
/// attribute when it has authenticated attributes, directly otherwise.
fn check_binding(
    signer_info: &SignerInfo,
    certificates: &[Certificate],
    signature: &[u8],
) -> Result<()> {
    let algorithm = DigestAlgorithm::from_oid(&signer_info.digest_alg.oid)?;
    let bound = match signer_info.signed_attrs.as_ref() {
        Some(attrs) => {
            let message_digest = find_attribute(Some(attrs), ID_MESSAGE_DIGEST)
                .and_then(|attr| attr.values.iter().next())
                .context(TimestampMalformedSnafu {
                    reason: "counter-signature without message digest attribute",
                })?
                .decode_as::<OctetString>()
                .context(TimestampDecodeSnafu {})?;
            message_digest.as_bytes() == algorithm.digest(signature).as_slice()
        }
        None => {
            let SignerIdentifier::IssuerAndSerialNumber(ias) = &signer_info.sid else {
                return TimestampMalformedSnafu {
                    reason: "counter-signer is not identified by issuer and serial number",
                }
                .fail()
                .map_err(Into::into);
            };
            let cert = certificates
                .iter()
                .find(|cert| {
                    cert.tbs_certificate.issuer == ias.issuer
                        && cert.tbs_certificate.serial_number == ias.serial_number
                })
                .context(TimestampMalformedSnafu {
                    reason: "counter-signer certificate missing from the response",
                })?;
            verify_with_certificate(cert, algorithm, signature, signer_info.signature.as_bytes())?
        }
    };
    if !bound {
        TimestampDigestMismatchSnafu {
            reason: "counter-signature does not cover the signature value",
        }
        .fail()?
    }
    Ok(())
}
