//! Git LFS batch and transfer wire types.
//!
//! The HTTP handlers are an external collaborator; these are the JSON
//! bodies they exchange under `<repo>/info/lfs/`, per the Git LFS batch
//! API. Errors use the protocol's `{code, message}` object.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Content type of every LFS protocol body.
pub const CONTENT_TYPE: &str = "application/vnd.git-lfs+json";
/// The only transfer adapter served.
pub const TRANSFER_BASIC: &str = "basic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Download,
    Upload,
}

/// `POST <repo>/info/lfs/objects/batch` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfers: Vec<String>,
    pub objects: Vec<ObjectSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

/// An `{oid, size}` pair. The OID is validated by the handler against
/// [`crate::oid::Oid`]; it stays a string here so a malformed OID can be
/// answered with a per-object error instead of failing the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: u64,
}

/// Batch response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub transfer: String,
    pub objects: Vec<ObjectStatus>,
}

impl BatchResponse {
    pub fn basic(objects: Vec<ObjectStatus>) -> Self {
        Self {
            transfer: TRANSFER_BASIC.to_owned(),
            objects,
        }
    }
}

/// Per-object outcome: either actions to perform or an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub oid: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl ObjectStatus {
    pub fn with_actions(
        spec: &ObjectSpec,
        actions: impl IntoIterator<Item = (&'static str, Action)>,
    ) -> Self {
        Self {
            oid: spec.oid.clone(),
            size: spec.size,
            authenticated: Some(true),
            actions: actions
                .into_iter()
                .map(|(name, action)| (name.to_owned(), action))
                .collect(),
            error: None,
        }
    }

    pub fn with_error(spec: &ObjectSpec, code: u16, message: impl Into<String>) -> Self {
        Self {
            oid: spec.oid.clone(),
            size: spec.size,
            authenticated: None,
            actions: BTreeMap::new(),
            error: Some(ObjectError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// One `upload` / `download` / `verify` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub href: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// The LFS `{code, message}` error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

/// `POST .../verify` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub oid: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_batch_request_parses_client_body() {
        let body = r#"{
            "operation": "upload",
            "transfers": ["basic"],
            "objects": [
                { "oid": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855", "size": 123 }
            ]
        }"#;
        let request: BatchRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.operation, Operation::Upload);
        assert_eq!(request.transfers, vec!["basic"]);
        assert_eq!(request.objects.len(), 1);
        assert_eq!(request.objects[0].size, 123);
        assert_eq!(request.hash_algo, None);
    }

    #[test]
    fn test_batch_response_shape() {
        let spec = ObjectSpec {
            oid: "a".repeat(64),
            size: 10,
        };
        let response = BatchResponse::basic(vec![ObjectStatus::with_actions(
            &spec,
            [(
                "download",
                Action {
                    href: "https://plue.example/alice/project/info/lfs/objects/aa".to_owned(),
                    header: BTreeMap::from([("Authorization".to_owned(), "Bearer t".to_owned())]),
                    expires_in: Some(600),
                },
            )],
        )]);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["transfer"], "basic");
        assert_eq!(json["objects"][0]["actions"]["download"]["expires_in"], 600);
        assert!(json["objects"][0].get("error").is_none());
    }

    #[test]
    fn test_error_object() {
        let spec = ObjectSpec {
            oid: "not-a-real-oid".to_owned(),
            size: 1,
        };
        let status = ObjectStatus::with_error(&spec, 422, "invalid object id");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["error"]["code"], 422);
        assert_eq!(json["error"]["message"], "invalid object id");
        assert!(json.get("actions").is_none());
    }
}
