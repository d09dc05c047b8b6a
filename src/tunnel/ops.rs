//! Operations carried over the tunnel and their bodies.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use crate::sync::FetchRequest;
use crate::unit::{BuildParams, UnitId};

/// Stable operation identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Version = 1,
    ReportError = 2,
    ListUnits = 3,
    Fetch = 4,
    Watch = 5,
}

impl OpCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Version),
            2 => Some(Self::ReportError),
            3 => Some(Self::ListUnits),
            4 => Some(Self::Fetch),
            5 => Some(Self::Watch),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::ReportError => "error-report",
            Self::ListUnits => "list",
            Self::Fetch => "fetch",
            Self::Watch => "watch",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub unit: UnitId,
    pub params: BuildParams,
}

/// Every request the agent understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Version,
    ReportError(ErrorReport),
    ListUnits,
    Fetch(FetchRequest),
    Watch(WatchRequest),
}

impl Operation {
    pub fn op(&self) -> OpCode {
        match self {
            Operation::Version => OpCode::Version,
            Operation::ReportError(_) => OpCode::ReportError,
            Operation::ListUnits => OpCode::ListUnits,
            Operation::Fetch(_) => OpCode::Fetch,
            Operation::Watch(_) => OpCode::Watch,
        }
    }

    pub fn encode_body(&self) -> Result<Bytes> {
        match self {
            Operation::Version | Operation::ListUnits => Ok(Bytes::new()),
            Operation::ReportError(report) => encode_body(report),
            Operation::Fetch(req) => encode_body(req),
            Operation::Watch(req) => encode_body(req),
        }
    }

    pub fn decode(op: OpCode, body: &[u8]) -> Result<Self> {
        Ok(match op {
            OpCode::Version => Operation::Version,
            OpCode::ListUnits => Operation::ListUnits,
            OpCode::ReportError => Operation::ReportError(decode_body(body)?),
            OpCode::Fetch => Operation::Fetch(decode_body(body)?),
            OpCode::Watch => Operation::Watch(decode_body(body)?),
        })
    }
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Bytes> {
    let encoded = bincode::serialize(value).context("Failed to encode body")?;
    Ok(Bytes::from(encoded))
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::deserialize(body).context("Failed to decode body")
}
