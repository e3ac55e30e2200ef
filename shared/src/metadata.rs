// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The on-chain metadata payload and its OP_RETURN framing.
//!
//! The first OP_RETURN output carrying the `"run"` marker holds a version
//! byte, an app string, and the six-field JSON metadata. Everything beyond
//! this field layout (fees, signatures, consensus) belongs to collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::PROTOCOL_VERSION;

/// The payload marker.
pub const RUN_MARKER: &[u8] = b"run";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("not a run payload")]
    NotRun,
    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),
    #[error("malformed metadata json: {0}")]
    BadJson(String),
    #[error("malformed script")]
    BadScript,
}

/// One action in the execution log.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Action {
    pub op: Opcode,
    pub data: serde_json::Value,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Opcode {
    #[serde(rename = "DEPLOY")]
    Deploy,
    #[serde(rename = "UPGRADE")]
    Upgrade,
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "NEW")]
    New,
}

/// The six-field metadata JSON. Field order is the canonical wire order.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Metadata {
    /// Number of spent creation inputs.
    #[serde(rename = "in")]
    pub inputs: usize,
    /// Read-only references, by location.
    #[serde(rename = "ref")]
    pub refs: Vec<String>,
    /// Per-output state hash, lower-case hex.
    pub out: Vec<String>,
    /// Per-delete state hash, lower-case hex.
    pub del: Vec<String>,
    /// Initial owners for newly created outputs.
    pub cre: Vec<serde_json::Value>,
    /// The action list.
    pub exec: Vec<Action>,
}

impl Metadata {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("metadata is always serializable")
    }

    pub fn from_json(s: &str) -> Result<Self, MetadataError> {
        serde_json::from_str(s).map_err(|e| MetadataError::BadJson(e.to_string()))
    }
}

/// A parsed run payload: version byte, app string, metadata.
#[derive(Clone, PartialEq, Debug)]
pub struct Payload {
    pub version: u8,
    pub app: String,
    pub metadata: Metadata,
}

impl Payload {
    pub fn new(app: impl Into<String>, metadata: Metadata) -> Self {
        Payload {
            version: PROTOCOL_VERSION,
            app: app.into(),
            metadata,
        }
    }

    /// Assembles `OP_FALSE OP_RETURN "run" <version> <app> <metadata>`.
    pub fn to_script(&self) -> Vec<u8> {
        let mut script = vec![0x00, 0x6a];
        push_data(&mut script, RUN_MARKER);
        push_data(&mut script, &[self.version]);
        push_data(&mut script, self.app.as_bytes());
        push_data(&mut script, self.metadata.to_json().as_bytes());
        script
    }

    /// Parses a script; `Err(NotRun)` when the script is not a run payload
    /// at all, other errors when it is but is malformed.
    pub fn from_script(script: &[u8]) -> Result<Self, MetadataError> {
        let mut rest = script
            .strip_prefix(&[0x00, 0x6a][..])
            .ok_or(MetadataError::NotRun)?;
        let marker = read_push(&mut rest).ok_or(MetadataError::NotRun)?;
        if marker != RUN_MARKER {
            return Err(MetadataError::NotRun);
        }
        let version = read_push(&mut rest).ok_or(MetadataError::BadScript)?;
        let [version] = version[..] else {
            return Err(MetadataError::BadScript);
        };
        if version != PROTOCOL_VERSION {
            return Err(MetadataError::BadVersion(version));
        }
        let app = read_push(&mut rest).ok_or(MetadataError::BadScript)?;
        let app = String::from_utf8(app.to_vec()).map_err(|_| MetadataError::BadScript)?;
        let json = read_push(&mut rest).ok_or(MetadataError::BadScript)?;
        let json = std::str::from_utf8(json).map_err(|_| MetadataError::BadScript)?;
        if !rest.is_empty() {
            return Err(MetadataError::BadScript);
        }
        Ok(Payload {
            version,
            app,
            metadata: Metadata::from_json(json)?,
        })
    }
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        n if n < 0x4c => script.push(n as u8),
        n if n <= 0xff => {
            script.push(0x4c);
            script.push(n as u8);
        }
        n if n <= 0xffff => {
            script.push(0x4d);
            script.extend_from_slice(&(n as u16).to_le_bytes());
        }
        n => {
            script.push(0x4e);
            script.extend_from_slice(&(n as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

fn read_push<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (&opcode, mut r) = rest.split_first()?;
    let len = match opcode {
        n if n < 0x4c => n as usize,
        0x4c => {
            let (&n, r2) = r.split_first()?;
            r = r2;
            n as usize
        }
        0x4d => {
            if r.len() < 2 {
                return None;
            }
            let (n, r2) = r.split_at(2);
            r = r2;
            u16::from_le_bytes([n[0], n[1]]) as usize
        }
        0x4e => {
            if r.len() < 4 {
                return None;
            }
            let (n, r2) = r.split_at(4);
            r = r2;
            u32::from_le_bytes([n[0], n[1], n[2], n[3]]) as usize
        }
        _ => return None,
    };
    if r.len() < len {
        return None;
    }
    let (data, r2) = r.split_at(len);
    *rest = r2;
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Metadata {
        Metadata {
            inputs: 0,
            refs: vec![],
            out: vec!["ab".repeat(32)],
            del: vec![],
            cre: vec![serde_json::json!("1111111111111111111114oLvT2")],
            exec: vec![Action {
                op: Opcode::Deploy,
                data: serde_json::json!(["class A {}", {"deps": {}}]),
            }],
        }
    }

    #[test]
    fn json_field_order_is_wire_order() {
        let json = sample().to_json();
        assert!(json.starts_with("{\"in\":0,\"ref\":[],\"out\":["));
        assert!(json.contains("\"cre\":"));
        assert!(json.contains("\"exec\":[{\"op\":\"DEPLOY\""));
        assert_eq!(Metadata::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn script_roundtrip() {
        let payload = Payload::new("myapp", sample());
        let script = payload.to_script();
        assert_eq!(&script[..2], &[0x00, 0x6a]);
        assert_eq!(Payload::from_script(&script).unwrap(), payload);
    }

    #[test]
    fn non_run_scripts_are_not_run() {
        assert_eq!(
            Payload::from_script(&[0x76, 0xa9]),
            Err(MetadataError::NotRun)
        );
        // OP_FALSE OP_RETURN with another marker.
        let mut script = vec![0x00, 0x6a];
        push_data(&mut script, b"cat");
        assert_eq!(Payload::from_script(&script), Err(MetadataError::NotRun));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut script = vec![0x00, 0x6a];
        push_data(&mut script, RUN_MARKER);
        push_data(&mut script, &[0x04]);
        push_data(&mut script, b"");
        push_data(&mut script, b"{}");
        assert_eq!(
            Payload::from_script(&script),
            Err(MetadataError::BadVersion(4))
        );
    }

    #[test]
    fn long_pushes_roundtrip() {
        let mut script = Vec::new();
        let big = vec![0x61; 300];
        push_data(&mut script, &big);
        let mut rest = &script[..];
        assert_eq!(read_push(&mut rest).unwrap(), &big[..]);
        assert!(rest.is_empty());
    }
}
