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
//! RFC 3161 timestamping.
use super::TimestampToken;
use crate::asn1::{
    MessageImprint, TimeStampReq, TimeStampResp, TstInfo, ID_CT_TST_INFO, ID_SIGNED_DATA,
};
use crate::digest::DigestAlgorithm;
use crate::error::{
    EncodeSnafu, Result, TimestampDecodeSnafu, TimestampImprintMismatchSnafu,
    TimestampMalformedSnafu, TimestampNonceMismatchSnafu, TimestampRejectedSnafu,
};
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::asn1::OctetString;
use der::{Decode, Encode};
use log::debug;
use snafu::{OptionExt, ResultExt};

pub(crate) const CONTENT_TYPE: &str = "application/timestamp-query";
pub(crate) const REPLY_CONTENT_TYPE: &str = "application/timestamp-reply";

/// An outstanding request, kept to check the answer against it.
pub(crate) struct Rfc3161Request {
    nonce: u64,
    imprint: MessageImprint,
    der: Vec<u8>,
}

impl Rfc3161Request {
    pub(crate) fn new(signature: &[u8], alg: DigestAlgorithm) -> Result<Self> {
        let imprint = MessageImprint {
            hash_algorithm: alg.algorithm_identifier()?,
            hashed_message: OctetString::new(alg.digest(signature)).context(EncodeSnafu {
                what: "message imprint",
            })?,
        };
        let nonce: u64 = rand::random();
        let request = TimeStampReq {
            version: 1,
            message_imprint: imprint.clone(),
            req_policy: None,
            nonce: Some(nonce),
            cert_req: Some(true),
            extensions: None,
        };
        let der = request.to_der().context(EncodeSnafu {
            what: "timestamp request",
        })?;
        debug!("rfc3161 request with nonce {:#x}", nonce);
        Ok(Rfc3161Request {
            nonce,
            imprint,
            der,
        })
    }

    pub(crate) fn nonce(&self) -> u64 {
        self.nonce
    }

    pub(crate) fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Accept the response only when granted and bound to this request.
    pub(crate) fn parse_response(&self, body: &[u8]) -> Result<TimestampToken> {
        let response = TimeStampResp::from_der(body).context(TimestampDecodeSnafu {})?;
        if !response.status.is_granted() {
            TimestampRejectedSnafu {
                status: response.status.status,
                reason: response.status.describe(),
            }
            .fail()?
        }
        let token = response.time_stamp_token.context(TimestampMalformedSnafu {
            reason: "granted response without a token",
        })?;
        let tst_info = tst_info(&token)?;

        if tst_info.nonce != Some(self.nonce) {
            TimestampNonceMismatchSnafu {
                expected: self.nonce,
                actual: match tst_info.nonce {
                    Some(nonce) => nonce.to_string(),
                    None => "none".to_string(),
                },
            }
            .fail()?
        }
        if tst_info.message_imprint.hash_algorithm.oid != self.imprint.hash_algorithm.oid
            || tst_info.message_imprint.hashed_message != self.imprint.hashed_message
        {
            TimestampImprintMismatchSnafu {}.fail()?
        }
        debug!(
            "rfc3161 token granted, serial {:?}, time {}",
            tst_info.serial_number,
            tst_info.gen_time.to_unix_duration().as_secs()
        );
        Ok(TimestampToken::Rfc3161(token))
    }
}

/// Extract the `TSTInfo` of a time-stamp token.
pub(crate) fn tst_info(token: &ContentInfo) -> Result<TstInfo> {
    if token.content_type != ID_SIGNED_DATA {
        TimestampMalformedSnafu {
            reason: format!("token content type {} is not signed data", token.content_type),
        }
        .fail()?
    }
    let signed_data = token
        .content
        .decode_as::<SignedData>()
        .context(TimestampDecodeSnafu {})?;
    let eci = signed_data.encap_content_info;
    if eci.econtent_type != ID_CT_TST_INFO {
        TimestampMalformedSnafu {
            reason: format!("token content {} is not TSTInfo", eci.econtent_type),
        }
        .fail()?
    }
    let content = eci.econtent.context(TimestampMalformedSnafu {
        reason: "token without TSTInfo content",
    })?;
    let octets = content
        .decode_as::<OctetString>()
        .context(TimestampDecodeSnafu {})?;
    TstInfo::from_der(octets.as_bytes())
        .context(TimestampDecodeSnafu {})
        .map_err(Into::into)
}
