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
//! Timestamping of signatures.
//!
//! A [`Timestamper`] sends the signature value of an envelope to a timestamp
//! authority and embeds the answer as an unsigned attribute. Transient
//! transport failures are retried, rotating over the configured authorities;
//! anything the authority says is final.
pub mod authenticode;
pub mod rfc3161;
pub mod transport;

use crate::asn1::{TstInfo, ID_COUNTER_SIGNATURE, SPC_RFC3161_OBJID};
use crate::config::TimestampConfig;
use crate::envelope::SignatureEnvelope;
use crate::error::{
    EncodeSnafu, Error, Result, TimestampHttpStatusSnafu, TimestampRetriesExhaustedSnafu,
    TimestampTransportSnafu,
};
use cms::content_info::ContentInfo;
use cms::signed_data::SignerInfo;
use der::asn1::{Any, SetOfVec};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::thread;
use transport::{HttpTransport, TimestampTransport};
use x509_cert::attr::Attribute;
use x509_cert::Certificate;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampProtocol {
    /// Legacy Authenticode counter-signature.
    Authenticode,
    #[default]
    Rfc3161,
}

impl TimestampProtocol {
    pub fn default_url(&self) -> &'static str {
        "http://timestamp.sectigo.com"
    }
}

/// A time attestation bound to one signature value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimestampToken {
    Authenticode {
        signer_info: SignerInfo,
        certificates: Vec<Certificate>,
    },
    Rfc3161(ContentInfo),
}

impl TimestampToken {
    pub fn protocol(&self) -> TimestampProtocol {
        match self {
            TimestampToken::Authenticode { .. } => TimestampProtocol::Authenticode,
            TimestampToken::Rfc3161(_) => TimestampProtocol::Rfc3161,
        }
    }

    /// `TSTInfo` of an RFC 3161 token; legacy counter-signatures have none.
    pub fn tst_info(&self) -> Result<Option<TstInfo>> {
        match self {
            TimestampToken::Authenticode { .. } => Ok(None),
            TimestampToken::Rfc3161(token) => Ok(Some(rfc3161::tst_info(token)?)),
        }
    }

    pub(crate) fn to_attribute(&self) -> Result<Attribute> {
        let (oid, value) = match self {
            TimestampToken::Authenticode { signer_info, .. } => (
                ID_COUNTER_SIGNATURE,
                Any::encode_from(signer_info).context(EncodeSnafu {
                    what: "counter-signature",
                })?,
            ),
            TimestampToken::Rfc3161(token) => (
                SPC_RFC3161_OBJID,
                Any::encode_from(token).context(EncodeSnafu {
                    what: "time-stamp token",
                })?,
            ),
        };
        Ok(Attribute {
            oid,
            values: SetOfVec::try_from(vec![value]).context(EncodeSnafu {
                what: "timestamp attribute",
            })?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimestampState {
    Idle,
    RequestSent,
    ResponseReceived,
    TokenExtracted,
    TokenValidated,
    Failed,
}

struct Transitions<'u> {
    url: &'u str,
    state: TimestampState,
}

impl<'u> Transitions<'u> {
    fn new(url: &'u str) -> Self {
        Transitions {
            url,
            state: TimestampState::Idle,
        }
    }

    fn to(&mut self, next: TimestampState) {
        debug!("timestamp {}: {:?} -> {:?}", self.url, self.state, next);
        self.state = next;
    }
}

pub struct Timestamper {
    config: TimestampConfig,
    transport: Box<dyn TimestampTransport>,
}

impl Timestamper {
    /// A timestamper talking HTTP to the configured authorities.
    pub fn new(config: TimestampConfig) -> Result<Self> {
        Ok(Timestamper::with_transport(
            config,
            Box::new(HttpTransport::new()?),
        ))
    }

    pub fn with_transport(config: TimestampConfig, transport: Box<dyn TimestampTransport>) -> Self {
        Timestamper { config, transport }
    }

    pub fn config(&self) -> &TimestampConfig {
        &self.config
    }

    /// A copy of `envelope` carrying a fresh timestamp.
    pub fn timestamp(&self, envelope: &SignatureEnvelope) -> Result<SignatureEnvelope> {
        let token = self.request_token(envelope.signature_value())?;
        envelope.with_timestamp(token)
    }

    /// Obtain a token for `signature`, retrying transient failures.
    pub fn request_token(&self, signature: &[u8]) -> Result<TimestampToken> {
        let urls = self.config.authority_urls();
        let attempts = self.config.retries.max(1);
        let mut last: Option<Error> = None;

        for attempt in 1..=attempts {
            let url = &urls[(attempt as usize - 1) % urls.len()];
            match self.attempt(url, attempt, signature) {
                Ok(token) => {
                    info!("timestamp obtained from {} on attempt {}", url, attempt);
                    return Ok(token);
                }
                Err(e) if e.is_transient() => {
                    warn!("timestamp attempt {}/{} failed: {}", attempt, attempts, e);
                    last = Some(e);
                    if attempt < attempts {
                        debug!("wait {:?} before the next attempt", self.config.retry_wait());
                        thread::sleep(self.config.retry_wait());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(TimestampRetriesExhaustedSnafu {
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        }
        .build()
        .into())
    }

    fn attempt(&self, url: &str, attempt: u32, signature: &[u8]) -> Result<TimestampToken> {
        let mut transitions = Transitions::new(url);
        let res = self.exchange(url, attempt, signature, &mut transitions);
        if res.is_err() {
            transitions.to(TimestampState::Failed);
        }
        res
    }

    fn exchange(
        &self,
        url: &str,
        attempt: u32,
        signature: &[u8],
        transitions: &mut Transitions,
    ) -> Result<TimestampToken> {
        let timeout = self.config.timeout();
        match self.config.protocol {
            TimestampProtocol::Authenticode => {
                let body = authenticode::build_request(signature)?;
                transitions.to(TimestampState::RequestSent);
                let response = self
                    .transport
                    .post(url, authenticode::CONTENT_TYPE, &body, timeout)
                    .context(TimestampTransportSnafu { url, attempt })?;
                if response.status != 200 {
                    TimestampHttpStatusSnafu {
                        url,
                        status: response.status,
                    }
                    .fail()?
                }
                transitions.to(TimestampState::ResponseReceived);
                let token = authenticode::parse_response(&response.body, signature)?;
                transitions.to(TimestampState::TokenExtracted);
                Ok(token)
            }
            TimestampProtocol::Rfc3161 => {
                let request =
                    rfc3161::Rfc3161Request::new(signature, self.config.digest_algorithm)?;
                transitions.to(TimestampState::RequestSent);
                let response = self
                    .transport
                    .post(url, rfc3161::CONTENT_TYPE, request.as_der(), timeout)
                    .context(TimestampTransportSnafu { url, attempt })?;
                if response.status != 200 {
                    TimestampHttpStatusSnafu {
                        url,
                        status: response.status,
                    }
                    .fail()?
                }
                transitions.to(TimestampState::ResponseReceived);
                if response.content_type.as_deref() != Some(rfc3161::REPLY_CONTENT_TYPE) {
                    warn!(
                        "{} answered with content type {:?}",
                        url, response.content_type
                    );
                }
                let token = request.parse_response(&response.body)?;
                debug!("nonce {:#x} matched", request.nonce());
                transitions.to(TimestampState::TokenValidated);
                Ok(token)
            }
        }
    }
}
