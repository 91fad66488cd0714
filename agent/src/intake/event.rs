//! Deployment events decoded from webhook payloads

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::IntakeError;

/// Event kind header
pub const EVENT_KIND_HEADER: &str = "x-github-event";

/// Delivery id header, used only for log correlation
pub const DELIVERY_ID_HEADER: &str = "x-github-delivery";

/// The only event kind that can trigger a deployment
pub const CREATE_EVENT: &str = "create";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Kind of ref a create event refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RefKind {
    Tag,
    Branch,
    Other(String),
}

impl RefKind {
    pub fn as_str(&self) -> &str {
        match self {
            RefKind::Tag => "tag",
            RefKind::Branch => "branch",
            RefKind::Other(kind) => kind,
        }
    }
}

impl From<String> for RefKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "tag" => RefKind::Tag,
            "branch" => RefKind::Branch,
            _ => RefKind::Other(kind),
        }
    }
}

impl From<RefKind> for String {
    fn from(kind: RefKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified, decoded notification.
///
/// Fields are private so an event cannot change once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentEvent {
    ref_kind: RefKind,
    reference: String,
    repository_url: String,
    delivery_id: Option<String>,
}

impl DeploymentEvent {
    pub fn new(
        ref_kind: RefKind,
        reference: impl Into<String>,
        repository_url: impl Into<String>,
        delivery_id: Option<String>,
    ) -> Self {
        let reference = reference.into();
        let reference = match reference.strip_prefix("refs/tags/") {
            Some(tag) if ref_kind == RefKind::Tag => tag.to_string(),
            _ => reference,
        };
        Self {
            ref_kind,
            reference,
            repository_url: repository_url.into(),
            delivery_id,
        }
    }

    pub fn ref_kind(&self) -> &RefKind {
        &self.ref_kind
    }

    /// Ref name; for tags without the `refs/tags/` prefix
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn repository_url(&self) -> &str {
        &self.repository_url
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.delivery_id.as_deref()
    }

    /// Same event cloned from another URL
    pub fn with_repository_url(self, repository_url: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            ..self
        }
    }
}

/// Raw inbound request, as received
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub body: bytes::Bytes,
    pub signature: Option<String>,
    pub event_kind: Option<String>,
    pub content_type: Option<String>,
    pub delivery_id: Option<String>,
}

/// Payload of a `create` event (only the fields we use)
#[derive(Debug, Deserialize)]
struct CreatePayload {
    #[serde(rename = "ref")]
    reference: String,

    #[serde(alias = "refKind")]
    ref_type: RefKind,

    repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    #[serde(alias = "cloneURL")]
    clone_url: String,
}

/// Decode the body of a delivery whose signature was already checked
pub fn decode(delivery: &Delivery) -> Result<DeploymentEvent, IntakeError> {
    let kind = delivery.event_kind.as_deref().unwrap_or_default().trim();
    if kind != CREATE_EVENT {
        return Err(IntakeError::UnsupportedEventKind(kind.to_string()));
    }

    let json = payload_json(delivery)?;
    let payload: CreatePayload =
        serde_json::from_slice(&json).map_err(|e| IntakeError::MalformedPayload(e.to_string()))?;

    if payload.reference.trim().is_empty() {
        return Err(IntakeError::MalformedPayload("empty ref".to_string()));
    }
    if payload.repository.clone_url.trim().is_empty() {
        return Err(IntakeError::MalformedPayload("empty clone url".to_string()));
    }

    Ok(DeploymentEvent::new(
        payload.ref_type,
        payload.reference,
        payload.repository.clone_url,
        delivery.delivery_id.clone(),
    ))
}

/// Form-encoded deliveries carry the JSON in the `payload` field
fn payload_json(delivery: &Delivery) -> Result<Vec<u8>, IntakeError> {
    let is_form = delivery
        .content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE));

    if !is_form {
        return Ok(delivery.body.to_vec());
    }

    url::form_urlencoded::parse(&delivery.body)
        .find(|(key, _)| key == "payload")
        .map(|(_, value)| value.into_owned().into_bytes())
        .ok_or_else(|| IntakeError::MalformedPayload("form body has no payload field".to_string()))
}
