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
//! Transport contract for timestamp authorities.
use crate::error::{HttpClientSnafu, Result};
use log::debug;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use snafu::prelude::*;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("Cannot connect to {url}: {reason}"))]
    Connect { url: String, reason: String },
    #[snafu(display("Request to {url} timed out"))]
    Timeout { url: String },
    #[snafu(display("Request to {url} failed: {reason}"))]
    Other { url: String, reason: String },
}

impl TransportError {
    /// Connection failures and timeouts may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        )
    }
}

/// Sends one timestamp request and returns the authority's answer.
pub trait TimestampTransport: Send + Sync {
    fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
        timeout: Duration,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

impl<F> TimestampTransport for F
where
    F: Fn(&str, &str, &[u8], Duration) -> std::result::Result<HttpResponse, TransportError>
        + Send
        + Sync,
{
    fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
        timeout: Duration,
    ) -> std::result::Result<HttpResponse, TransportError> {
        self(url, content_type, body, timeout)
    }
}

/// Blocking HTTP transport.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(HttpClientSnafu {})?;
        Ok(HttpTransport { client })
    }

    fn classify(url: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TimeoutSnafu { url }.build()
        } else if err.is_connect() {
            ConnectSnafu {
                url,
                reason: err.to_string(),
            }
            .build()
        } else {
            OtherSnafu {
                url,
                reason: err.to_string(),
            }
            .build()
        }
    }
}

impl TimestampTransport for HttpTransport {
    fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
        timeout: Duration,
    ) -> std::result::Result<HttpResponse, TransportError> {
        debug!("POST {} bytes of {} to {}", body.len(), content_type, url);
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .timeout(timeout)
            .body(body.to_vec())
            .send()
            .map_err(|e| HttpTransport::classify(url, e))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|e| HttpTransport::classify(url, e))?
            .to_vec();
        debug!("{} answered {} with {} bytes", url, status, body.len());
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}
