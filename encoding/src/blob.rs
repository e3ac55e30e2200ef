// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use serde_json::{Map, Value};

use crate::CodecError;

/// What kind of creation a state blob describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlobKind {
    Code,
    Jig,
    Berry,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Code => "code",
            BlobKind::Jig => "jig",
            BlobKind::Berry => "berry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(BlobKind::Code),
            "jig" => Some(BlobKind::Jig),
            "berry" => Some(BlobKind::Berry),
            _ => None,
        }
    }
}

/// The value placed in the cache under `jig://` / `berry://` keys, and the
/// value whose canonical-JSON hash is anchored in transaction metadata.
#[derive(Clone, PartialEq, Debug)]
pub struct StateBlob {
    pub kind: BlobKind,
    /// Encoded class reference; jig and berry only.
    pub cls: Option<Value>,
    /// Encoded own-properties.
    pub props: Value,
    /// Source string; code only.
    pub src: Option<String>,
    pub version: String,
}

impl StateBlob {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("kind".into(), Value::String(self.kind.as_str().into()));
        if let Some(cls) = &self.cls {
            map.insert("cls".into(), cls.clone());
        }
        map.insert("props".into(), self.props.clone());
        if let Some(src) = &self.src {
            map.insert("src".into(), Value::String(src.clone()));
        }
        map.insert("version".into(), Value::String(self.version.clone()));
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let bad = |m: &str| CodecError::BadBlob(m.to_owned());
        let map = value.as_object().ok_or_else(|| bad("not an object"))?;
        let kind = map
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(BlobKind::parse)
            .ok_or_else(|| bad("bad kind"))?;
        let props = map.get("props").cloned().ok_or_else(|| bad("no props"))?;
        let version = map
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad("no version"))?
            .to_owned();
        let cls = map.get("cls").cloned();
        let src = map
            .get("src")
            .map(|v| v.as_str().map(str::to_owned).ok_or_else(|| bad("bad src")))
            .transpose()?;

        match kind {
            BlobKind::Code => {
                if src.is_none() || cls.is_some() {
                    return Err(bad("code blob must carry src and no cls"));
                }
            }
            BlobKind::Jig | BlobKind::Berry => {
                if cls.is_none() || src.is_some() {
                    return Err(bad("instance blob must carry cls and no src"));
                }
            }
        }

        Ok(StateBlob {
            kind,
            cls,
            props,
            src,
            version,
        })
    }
}
