//! Actor identity.
//!
//! An actor ID is a free-form string identifier plus an optional
//! `(host, port)` endpoint.  Without an endpoint the ID designates a local
//! actor; with one it designates a remote actor at that endpoint.
//!
//! Textual form: `<id>` (local) or `<id>@<host>:<port>` (remote).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorIdParseError {
    #[error("actor id is empty")]
    Empty,
    #[error("endpoint `{0}` is missing a `:` port separator")]
    MissingPort(String),
    #[error("malformed port in `{0}`")]
    MalformedPort(String),
    #[error("endpoint host is empty in `{0}`")]
    EmptyHost(String),
}

/// Identity of an actor, local or remote.
///
/// Equality and hashing are field-wise; ordering is lexical over the
/// textual form, so sorted log output groups local IDs before their
/// remote-qualified counterparts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ActorId {
    /// An ID designating a local actor.
    pub fn local(id: impl Into<String>) -> Self {
        ActorId {
            id: id.into(),
            host: None,
            port: None,
        }
    }

    /// An ID designating an actor at a remote endpoint.
    pub fn remote(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        ActorId {
            id: id.into(),
            host: Some(host.into()),
            port: Some(port),
        }
    }

    /// True when no endpoint is attached.
    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    /// The endpoint, when one is attached.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            _ => None,
        }
    }

    /// The same identity with the endpoint stripped.
    ///
    /// Registries key actors by their local form so that an invocation
    /// addressed to `echo@10.0.0.1:4040` finds the actor registered as
    /// `echo`.
    pub fn local_form(&self) -> ActorId {
        ActorId::local(self.id.clone())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some((host, port)) => write!(f, "{}@{}:{}", self.id, host, port),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for ActorId {
    type Err = ActorIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ActorIdParseError::Empty);
        }
        // The id itself may not contain `@`; everything after the first `@`
        // is the endpoint.
        match s.split_once('@') {
            None => Ok(ActorId::local(s)),
            Some((id, endpoint)) => {
                if id.is_empty() {
                    return Err(ActorIdParseError::Empty);
                }
                let (host, port) = endpoint
                    .rsplit_once(':')
                    .ok_or_else(|| ActorIdParseError::MissingPort(endpoint.to_owned()))?;
                if host.is_empty() {
                    return Err(ActorIdParseError::EmptyHost(endpoint.to_owned()));
                }
                let port: u16 = port
                    .parse()
                    .map_err(|_| ActorIdParseError::MalformedPort(endpoint.to_owned()))?;
                Ok(ActorId::remote(id, host, port))
            }
        }
    }
}

impl Ord for ActorId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for ActorId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
