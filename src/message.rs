//! Module that contains the messages exchanged between peers.
//!
//! Every call is one request line answered by one response line:
//!
//! ```text
//! {"method": "request_token", "args": [3, 1]}
//! {"result": null}
//! {"error": {"name": "UnknownPeer", "args": ["no peer with id 4"]}}
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, net::SocketAddr, str::FromStr};

/// Identifier handed out by the name server on registration.
pub type PeerId = u64;

/// Network address of a peer, encoded on the wire as `[host, port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String, pub u16);

/// Struct that represents a method invocation with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub args: Vec<Value>,
}

/// Error payload of a failed call, named after the error raised on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub args: Vec<Value>,
}

/// Enum that represents the possible answers to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Result(Value),
    Error(RemoteError),
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(host.into(), port)
    }

    pub fn host(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected HOST:PORT, got {s:?}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {s:?}: {e}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        Ok(Self(host.to_string(), port))
    }
}

impl Request {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Function that returns the request as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Function that parses a request, rejecting anything without both `method` and `args`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        let object = parse_object(line)?;
        if !object.contains_key("method") || !object.contains_key("args") {
            return Err(Error::Protocol(format!(
                "request must carry both \"method\" and \"args\": {line}"
            )));
        }
        serde_json::from_value(Value::Object(object))
            .map_err(|e| Error::Protocol(format!("malformed request: {e}")))
    }
}

impl Response {
    /// Function that returns the response as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Function that parses a response whose only key is either `result` or `error`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        let object = parse_object(line)?;
        let only_key = match object.len() {
            1 => object.keys().next().map(String::as_str),
            _ => None,
        };
        if !matches!(only_key, Some("result") | Some("error")) {
            return Err(Error::Protocol(format!(
                "response must carry exactly one of \"result\" or \"error\": {line}"
            )));
        }
        serde_json::from_value(Value::Object(object))
            .map_err(|e| Error::Protocol(format!("malformed response: {e}")))
    }

    /// Turns an `error` response into [`Error::External`].
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(remote) => Err(remote.into()),
        }
    }
}

impl From<Result<Value>> for Response {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Result(value),
            Err(e) => Self::Error(RemoteError::from(&e)),
        }
    }
}

fn parse_object(line: &str) -> Result<Map<String, Value>> {
    if line.trim().is_empty() {
        return Err(Error::Protocol("received empty message".into()));
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(Error::Protocol(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(Error::Protocol(format!(
            "could not decode {line:?}: {e} (line {}, column {})",
            e.line(),
            e.column()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let request = Request::new("request_token", vec![json!(5), json!(2)]);
        assert_eq!(
            request.to_json_string().unwrap(),
            r#"{"method":"request_token","args":[5,2]}"#
        );
        assert_eq!(
            Request::from_json_string(r#"{"args": [5, 2], "method": "request_token"}"#).unwrap(),
            request
        );
    }

    #[test]
    fn empty_request_is_a_protocol_error() {
        assert!(matches!(Request::from_json_string(""), Err(Error::Protocol(_))));
        assert!(matches!(Request::from_json_string("  \n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn request_missing_fields_is_a_protocol_error() {
        for line in [r#"{"method": "check"}"#, r#"{"args": []}"#, "[1, 2]", "{not json"] {
            assert!(
                matches!(Request::from_json_string(line), Err(Error::Protocol(_))),
                "{line} should be rejected"
            );
        }
    }

    #[test]
    fn response_wire_shape() {
        assert_eq!(
            Response::Result(Value::Null).to_json_string().unwrap(),
            r#"{"result":null}"#
        );
        let error = Response::Error(RemoteError {
            name: "UnknownPeer".into(),
            args: vec![json!("no peer with id 4")],
        });
        assert_eq!(
            error.to_json_string().unwrap(),
            r#"{"error":{"name":"UnknownPeer","args":["no peer with id 4"]}}"#
        );
    }

    #[test]
    fn response_with_both_or_neither_key_is_rejected() {
        for line in [
            r#"{"result": 1, "error": {"name": "X", "args": []}}"#,
            r#"{}"#,
            r#"{"value": 1}"#,
            r#"{"result": 1, "extra": true}"#,
        ] {
            assert!(
                matches!(Response::from_json_string(line), Err(Error::Protocol(_))),
                "{line} should be rejected"
            );
        }
    }

    #[test]
    fn error_response_never_yields_a_result() {
        let response =
            Response::from_json_string(r#"{"error": {"name": "NotHeld", "args": ["nope"]}}"#)
                .unwrap();
        match response.into_result() {
            Err(Error::External { name, args }) => {
                assert_eq!(name, "NotHeld");
                assert_eq!(args, vec![json!("nope")]);
            }
            other => panic!("expected an external error, got {other:?}"),
        }
    }

    #[test]
    fn address_is_a_host_port_pair() {
        let address: Address = "127.0.0.1:40123".parse().unwrap();
        assert_eq!(address, Address::new("127.0.0.1", 40123));
        assert_eq!(serde_json::to_value(&address).unwrap(), json!(["127.0.0.1", 40123]));
        assert!("localhost".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }
}
