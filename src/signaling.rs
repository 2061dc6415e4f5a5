//! WHIP signaling transport
//!
//! Turns session transitions into HTTP exchanges with the ingestion endpoint:
//! POST for the offer, PATCH for trickled candidates and DELETE for teardown.

use std::time::Duration;

use reqwest::{
    header::{CONTENT_TYPE, ETAG, IF_MATCH, LOCATION},
    Method, RequestBuilder, Response, StatusCode, Url,
};
use tracing::{debug, info};

use crate::error::{SignalingError, WhipError};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// What the server handed back for an accepted offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub sdp: String,
    /// Absolute URL of the session resource.
    pub resource_url: Url,
    pub etag: Option<String>,
}

/// HTTP client for one WHIP endpoint. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Signaling {
    http: reqwest::Client,
}

impl Signaling {
    /// Every request made through the transport gives up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Signaling, WhipError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WhipError::Configuration(format!("building HTTP client: {e}")))?;

        Ok(Signaling { http })
    }

    fn request(&self, method: Method, url: &Url, token: Option<&str>) -> RequestBuilder {
        let request = self.http.request(method, url.clone());
        match token.filter(|t| !t.is_empty()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// POSTs the offer and returns the answer and the resource URL.
    pub async fn send_offer(
        &self,
        url: &Url,
        offer: &str,
        token: Option<&str>,
    ) -> Result<Answer, SignalingError> {
        debug!("POST {} ({} bytes of SDP)", url, offer.len());

        let response = self
            .request(Method::POST, url, token)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.to_string())
            .send()
            .await
            .map_err(|source| SignalingError::Http {
                method: Method::POST,
                url: url.to_string(),
                source,
            })?;

        let response = expect_success(Method::POST, url, response).await?;

        let header = response
            .headers()
            .get(LOCATION)
            .ok_or(SignalingError::MissingLocation)?;
        let location = header
            .to_str()
            .map_err(|e| SignalingError::InvalidLocation {
                location: String::from_utf8_lossy(header.as_bytes()).into_owned(),
                reason: e.to_string(),
            })?
            .to_string();

        // Relative locations are resolved against the URL that answered,
        // which differs from `url` after a redirect.
        let resource_url =
            response
                .url()
                .join(&location)
                .map_err(|e| SignalingError::InvalidLocation {
                    location: location.clone(),
                    reason: e.to_string(),
                })?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let sdp = response
            .text()
            .await
            .map_err(|source| SignalingError::Http {
                method: Method::POST,
                url: url.to_string(),
                source,
            })?;

        if sdp.trim().is_empty() {
            return Err(SignalingError::MissingAnswer);
        }
        if !sdp.trim_start().starts_with("v=") {
            return Err(SignalingError::MalformedAnswer);
        }

        info!("WHIP session created at {}", resource_url);

        Ok(Answer {
            sdp,
            resource_url,
            etag,
        })
    }

    /// PATCHes one trickle ICE fragment to the session resource.
    pub async fn send_candidate(
        &self,
        resource_url: &Url,
        fragment: &str,
        token: Option<&str>,
        etag: Option<&str>,
    ) -> Result<(), SignalingError> {
        debug!("PATCH {}:\n{}", resource_url, fragment);

        let mut request = self
            .request(Method::PATCH, resource_url, token)
            .header(CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
            .body(fragment.to_string());

        if let Some(etag) = etag {
            request = request.header(IF_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|source| SignalingError::Http {
                method: Method::PATCH,
                url: resource_url.to_string(),
                source,
            })?;

        expect_success(Method::PATCH, resource_url, response).await?;

        Ok(())
    }

    /// DELETEs the session resource. A resource the server no longer knows
    /// about counts as terminated.
    pub async fn terminate(
        &self,
        resource_url: &Url,
        token: Option<&str>,
    ) -> Result<(), SignalingError> {
        debug!("DELETE {}", resource_url);

        let response = self
            .request(Method::DELETE, resource_url, token)
            .send()
            .await
            .map_err(|source| SignalingError::Http {
                method: Method::DELETE,
                url: resource_url.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!("{} was already gone", resource_url);
                Ok(())
            }
            _ => expect_success(Method::DELETE, resource_url, response)
                .await
                .map(|_| ()),
        }
    }
}

async fn expect_success(
    method: Method,
    url: &Url,
    response: Response,
) -> Result<Response, SignalingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SignalingError::Status {
        method,
        url: url.to_string(),
        status,
        body,
    })
}
