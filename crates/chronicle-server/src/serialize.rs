//! Log-safe summaries of requests, responses and errors.
//!
//! Summaries never include bodies. Header values that are not valid UTF-8 are
//! left out rather than failing the summary.

use std::collections::BTreeMap;
use std::error::Error;
use std::net::SocketAddr;

use http::{HeaderMap, Request, Response, Version};
use serde::Serialize;
use uuid::Uuid;

/// Peer address of the connection a request arrived on.
///
/// Inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo(pub SocketAddr);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub http_version: &'static str,
    pub headers: BTreeMap<String, String>,
    pub connection: ConnectionSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub remote_address: Option<String>,
    pub remote_family: Option<&'static str>,
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSummary {
    pub status_message: &'static str,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub message: String,
    /// The error followed by each of its sources, outermost first.
    pub stack: Vec<String>,
}

impl RequestSummary {
    pub fn new<B>(id: Uuid, request: &Request<B>) -> Self {
        let connection = request
            .extensions()
            .get::<ConnectInfo>()
            .map(|ConnectInfo(peer)| ConnectionSummary::from(*peer))
            .unwrap_or_default();
        Self {
            id,
            method: request.method().to_string(),
            url: request.uri().to_string(),
            http_version: version(request.version()),
            headers: headers(request.headers()),
            connection,
        }
    }
}

impl From<SocketAddr> for ConnectionSummary {
    fn from(peer: SocketAddr) -> Self {
        Self {
            remote_address: Some(peer.ip().to_string()),
            remote_family: Some(if peer.is_ipv4() { "IPv4" } else { "IPv6" }),
            remote_port: Some(peer.port()),
        }
    }
}

impl ResponseSummary {
    pub fn new<B>(response: &Response<B>) -> Self {
        let status = response.status();
        Self {
            status_message: status.canonical_reason().unwrap_or(""),
            status_code: status.as_u16(),
            headers: headers(response.headers()),
        }
    }
}

impl ErrorSummary {
    pub fn new(error: &(dyn Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut current = Some(error);
        while let Some(e) = current {
            stack.push(e.to_string());
            current = e.source();
        }
        Self {
            message: error.to_string(),
            stack,
        }
    }
}

fn version(v: Version) -> &'static str {
    match v {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "unknown",
    }
}

fn headers(map: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_owned())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    out
}
