//! Driver-facing operation and payload types (spec §6).

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobType, UnknownJobType};

/// A driver-level work unit: a service name plus a payload. The backend
/// translates this into a queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub service_name: String,
}

impl Operation {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Translate `service_name` to a `JobType` per the recognized mapping
    /// in spec §6. Unknown service names are an invalid-argument error.
    pub fn job_type(&self) -> Result<JobType, UnknownJobType> {
        match self.service_name.as_str() {
            "notebook-processor" => Ok(JobType::Notebook),
            "plantuml-converter" => Ok(JobType::PlantUml),
            "drawio-converter" => Ok(JobType::DrawIo),
            other => Err(UnknownJobType(other.to_string())),
        }
    }
}

/// Opaque-to-core parameter bundle. `input_file`, `output_file`,
/// `content_hash`, and `correlation_id` are the fields the core consumes;
/// everything else passes through as an opaque JSON object. Byte-valued
/// extra fields are base64-encoded by the caller before being placed in
/// `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub input_file: String,
    pub output_file: String,
    pub content_hash: String,
    pub correlation_id: Option<String>,
    /// Discriminates distinct output variants of the same input (e.g. a
    /// kind/prog_lang/language/format tuple flattened to a string). Opaque
    /// to the core beyond its use as a cache-key component.
    pub output_metadata: String,
    /// All other job-type-specific fields, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Payload {
    /// Serialize this payload to the JSON blob stored as `Job::payload`.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Base64-encode a byte field into `extra` under `key`, per spec §6's
    /// "byte-valued fields are encoded as base64 strings".
    pub fn set_bytes_field(&mut self, key: impl Into<String>, bytes: &[u8]) {
        self.extra.insert(key.into(), Value::String(BASE64.encode(bytes)));
    }

    /// Decode a base64-encoded byte field previously set with
    /// `set_bytes_field`.
    pub fn bytes_field(&self, key: &str) -> Option<Vec<u8>> {
        let value = self.extra.get(key)?.as_str()?;
        BASE64.decode(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_maps_known_service_names() {
        assert_eq!(
            Operation::new("notebook-processor").job_type().unwrap(),
            JobType::Notebook
        );
        assert_eq!(
            Operation::new("plantuml-converter").job_type().unwrap(),
            JobType::PlantUml
        );
        assert_eq!(
            Operation::new("drawio-converter").job_type().unwrap(),
            JobType::DrawIo
        );
    }

    #[test]
    fn operation_rejects_unknown_service_names() {
        assert!(Operation::new("mystery-service").job_type().is_err());
    }

    #[test]
    fn payload_roundtrips_bytes_field_as_base64() {
        let mut payload = Payload {
            input_file: "in".to_string(),
            output_file: "out".to_string(),
            content_hash: "abc".to_string(),
            correlation_id: None,
            output_metadata: "speaker/python/en".to_string(),
            extra: BTreeMap::new(),
        };
        payload.set_bytes_field("thumbnail", b"\x00\x01\x02");
        assert_eq!(
            payload.bytes_field("thumbnail").unwrap(),
            vec![0u8, 1, 2]
        );
    }
}
