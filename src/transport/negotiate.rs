//! Negotiate exchange.
//!
//! Before connecting, the client POSTs to `{hub}/negotiate?negotiateVersion=1`.
//! The server answers with a connection token and the transports it offers,
//! redirects the client to another URL (optionally with a new access token),
//! or reports an error.

use anyhow::Context;
use reqwest::Url;
use serde::Deserialize;

use super::{append_query, parse_url, with_headers, TransportKind};
use crate::constants::NEGOTIATE_VERSION;
use crate::error::HubError;
use crate::protocol::TransferFormat;

/// One transport offered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    /// Transport name, e.g. `WebSockets`.
    pub transport: String,
    /// Transfer formats the server accepts on it.
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

impl AvailableTransport {
    /// The transport kind, if this client knows it.
    pub fn kind(&self) -> Option<TransportKind> {
        self.transport.parse().ok()
    }

    /// Whether `format` is accepted on this transport.
    pub fn supports(&self, format: TransferFormat) -> bool {
        self.transfer_formats.iter().any(|f| f == format.as_str())
    }
}

/// Body of a negotiate response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    /// Public connection id.
    pub connection_id: Option<String>,
    /// Token identifying the connection on the transport URL (version 1+).
    pub connection_token: Option<String>,
    /// Negotiate version the server speaks.
    #[serde(default)]
    pub negotiate_version: u32,
    /// Transports the server offers, in its order of preference.
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect target.
    pub url: Option<String>,
    /// Access token to use with the redirect target.
    pub access_token: Option<String>,
    /// Negotiation failure reported by the server.
    pub error: Option<String>,
    /// Whether the server accepts stateful reconnect.
    #[serde(default)]
    pub use_stateful_reconnect: bool,
}

impl NegotiateResponse {
    /// Token to put on the transport URL. Version 0 servers only send the id.
    pub fn token(&self) -> Option<&str> {
        if self.negotiate_version > 0 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }
}

/// Build the negotiate URL for a hub URL, keeping its query string.
pub fn negotiate_url(url: &str, use_stateful_reconnect: bool) -> Result<Url, HubError> {
    let mut negotiate = parse_url(url)?;
    negotiate.set_fragment(None);
    negotiate
        .path_segments_mut()
        .map_err(|()| HubError::InvalidOperation(format!("Hub URL '{url}' has no path")))?
        .pop_if_empty()
        .push("negotiate");

    let has_param = |url: &Url, name: &str| url.query_pairs().any(|(key, _)| key == name);
    if !has_param(&negotiate, "negotiateVersion") {
        negotiate
            .query_pairs_mut()
            .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
    }
    if use_stateful_reconnect && !has_param(&negotiate, "useStatefulReconnect") {
        negotiate
            .query_pairs_mut()
            .append_pair("useStatefulReconnect", "true");
    }
    Ok(negotiate)
}

/// Add the connection token to the transport URL.
pub fn connect_url(url: &str, response: &NegotiateResponse) -> Result<String, HubError> {
    match response.token() {
        Some(token) => append_query(url, "id", token),
        None => Ok(url.to_string()),
    }
}

/// POST the negotiate request and decode the response.
pub async fn send_negotiate(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    access_token: Option<&str>,
    use_stateful_reconnect: bool,
    timeout: std::time::Duration,
) -> anyhow::Result<NegotiateResponse> {
    let negotiate = negotiate_url(url, use_stateful_reconnect)?;
    log::debug!("[Negotiate] Sending negotiation request: {}", negotiate);

    let response = with_headers(client.post(negotiate), headers, access_token)
        .timeout(timeout)
        .send()
        .await
        .context("Failed to complete negotiation with the server")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Unexpected status code returned from negotiate '{status}'");
    }

    response
        .json::<NegotiateResponse>()
        .await
        .context("Failed to parse negotiate response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_url_plain() {
        assert_eq!(
            negotiate_url("http://localhost/hub", false).unwrap().as_str(),
            "http://localhost/hub/negotiate?negotiateVersion=1"
        );
    }

    #[test]
    fn test_negotiate_url_keeps_query() {
        assert_eq!(
            negotiate_url("http://localhost/hub/?tenant=a", true)
                .unwrap()
                .as_str(),
            "http://localhost/hub/negotiate?tenant=a&negotiateVersion=1&useStatefulReconnect=true"
        );
    }

    #[test]
    fn test_negotiate_url_drops_fragment() {
        assert_eq!(
            negotiate_url("http://localhost/hub?tenant=a#section", false)
                .unwrap()
                .as_str(),
            "http://localhost/hub/negotiate?tenant=a&negotiateVersion=1"
        );
    }

    #[test]
    fn test_negotiate_url_keeps_requested_version() {
        assert_eq!(
            negotiate_url("http://localhost/hub?negotiateVersion=0", false)
                .unwrap()
                .as_str(),
            "http://localhost/hub/negotiate?negotiateVersion=0"
        );
    }

    #[test]
    fn test_token_depends_on_version() {
        let mut response = NegotiateResponse {
            connection_id: Some("id".to_string()),
            connection_token: Some("token".to_string()),
            negotiate_version: 1,
            ..NegotiateResponse::default()
        };
        assert_eq!(connect_url("http://h/hub", &response).unwrap(), "http://h/hub?id=token");

        response.negotiate_version = 0;
        assert_eq!(
            connect_url("http://h/hub?x=1#top", &response).unwrap(),
            "http://h/hub?x=1&id=id#top"
        );
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "connectionId": "abc",
            "connectionToken": "def",
            "negotiateVersion": 1,
            "availableTransports": [
                {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
                {"transport": "ServerSentEvents", "transferFormats": ["Text"]}
            ]
        }"#;
        let response: NegotiateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.token(), Some("def"));
        assert_eq!(response.available_transports.len(), 2);
        assert_eq!(
            response.available_transports[1].kind(),
            Some(TransportKind::ServerSentEvents)
        );
        assert!(!response.available_transports[1].supports(TransferFormat::Binary));
    }
}
