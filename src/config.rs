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
//! Signing options.
//!
//! Every field has a default, so a partial JSON or TOML document deserializes
//! into a complete configuration.
use crate::digest::DigestAlgorithm;
use crate::timestamp::TimestampProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to signatures already in the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Keep existing signatures and append the new one as another
    /// `WIN_CERTIFICATE` entry of the certificate table.
    ///
    /// Windows verifiers only read the first entry. Use
    /// [`SignatureEnvelope::with_nested_signature`](crate::SignatureEnvelope::with_nested_signature)
    /// to carry several signatures in one entry.
    #[default]
    Add,
    /// Drop existing signatures.
    Replace,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignOptions {
    pub digest_algorithm: DigestAlgorithm,
    pub policy: SignaturePolicy,
    pub program_name: Option<String>,
    pub program_url: Option<String>,
    pub timestamp: Option<TimestampConfig>,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            digest_algorithm: DigestAlgorithm::Sha256,
            policy: SignaturePolicy::Add,
            program_name: None,
            program_url: None,
            timestamp: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    pub protocol: TimestampProtocol,
    /// Authorities, tried in turn; empty means the protocol's default authority.
    pub urls: Vec<String>,
    /// Number of attempts, at least one is always made.
    pub retries: u32,
    pub retry_wait_secs: u64,
    pub timeout_secs: u64,
    /// Hash of the RFC 3161 message imprint.
    pub digest_algorithm: DigestAlgorithm,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        TimestampConfig {
            protocol: TimestampProtocol::Rfc3161,
            urls: Vec::new(),
            retries: 3,
            retry_wait_secs: 10,
            timeout_secs: 30,
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }
}

impl TimestampConfig {
    pub fn authority_urls(&self) -> Vec<String> {
        if self.urls.is_empty() {
            vec![self.protocol.default_url().to_string()]
        } else {
            self.urls.clone()
        }
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
