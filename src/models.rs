use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Core enums
// ---------------------------------------------------------------------------

/// Upstream backend API flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenAi,
    Ollama,
    Vllm,
    Xllm,
    LlamaCpp,
    Other,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Ollama => "ollama",
            Dialect::Vllm => "vllm",
            Dialect::Xllm => "xllm",
            Dialect::LlamaCpp => "llama_cpp",
            Dialect::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "openai" => Dialect::OpenAi,
            "ollama" => Dialect::Ollama,
            "vllm" => Dialect::Vllm,
            "xllm" => Dialect::Xllm,
            "llama_cpp" => Dialect::LlamaCpp,
            _ => Dialect::Other,
        }
    }

    /// Whether this dialect speaks the OpenAI wire format natively.
    pub fn is_openai_compatible(&self) -> bool {
        !matches!(self, Dialect::Ollama)
    }
}

/// One OpenAI API family — the capability a request requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApiFamily {
    ChatCompletions,
    Completions,
    Embeddings,
    Responses,
    AudioTranscription,
    AudioSpeech,
    ImageGeneration,
    ImageEdits,
    ImageVariations,
}

impl ApiFamily {
    pub const ALL: [ApiFamily; 9] = [
        ApiFamily::ChatCompletions,
        ApiFamily::Completions,
        ApiFamily::Embeddings,
        ApiFamily::Responses,
        ApiFamily::AudioTranscription,
        ApiFamily::AudioSpeech,
        ApiFamily::ImageGeneration,
        ApiFamily::ImageEdits,
        ApiFamily::ImageVariations,
    ];

    /// The inbound /v1 path served by this family (OpenAI layout).
    pub fn v1_path(&self) -> &'static str {
        match self {
            ApiFamily::ChatCompletions => "/v1/chat/completions",
            ApiFamily::Completions => "/v1/completions",
            ApiFamily::Embeddings => "/v1/embeddings",
            ApiFamily::Responses => "/v1/responses",
            ApiFamily::AudioTranscription => "/v1/audio/transcriptions",
            ApiFamily::AudioSpeech => "/v1/audio/speech",
            ApiFamily::ImageGeneration => "/v1/images/generations",
            ApiFamily::ImageEdits => "/v1/images/edits",
            ApiFamily::ImageVariations => "/v1/images/variations",
        }
    }
}

/// Endpoint routing eligibility. Only Online receives traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Pending,
    Online,
    Offline,
    Error,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Pending => "pending",
            EndpointStatus::Online => "online",
            EndpointStatus::Offline => "offline",
            EndpointStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => EndpointStatus::Pending,
            "online" => EndpointStatus::Online,
            "offline" => EndpointStatus::Offline,
            _ => EndpointStatus::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint & EndpointModel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub dialect: Dialect,
    pub supported_apis: Vec<ApiFamily>,
    pub status: EndpointStatus,
    pub latency_ms: Option<u32>,
    pub model_count: usize,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub probe_interval_secs: u32,
    pub max_in_flight: u32,
    pub request_timeout_secs: u32,
    /// Sealed upstream key — present internally, never serialized.
    #[serde(skip)]
    pub api_key_sealed: Option<String>,
}

impl Endpoint {
    pub fn has_api_key(&self) -> bool {
        self.api_key_sealed.is_some()
    }
}

/// One model exposed by one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointModel {
    pub model_id: String,
    pub supported_apis: Vec<ApiFamily>,
    pub excluded: bool,
    pub last_error: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
}

impl EndpointModel {
    pub fn new(model_id: impl Into<String>, supported_apis: Vec<ApiFamily>) -> Self {
        Self {
            model_id: model_id.into(),
            supported_apis,
            excluded: false,
            last_error: None,
            last_used: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "admin" {
            Role::Admin
        } else {
            Role::Viewer
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub must_change_password: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Closed permission set for API keys. Serialized with the dotted wire names
/// used in key payloads and route declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Permission {
    #[serde(rename = "openai.inference")]
    OpenaiInference,
    #[serde(rename = "openai.models.read")]
    OpenaiModelsRead,
    #[serde(rename = "endpoints.read")]
    EndpointsRead,
    #[serde(rename = "endpoints.manage")]
    EndpointsManage,
    #[serde(rename = "users.manage")]
    UsersManage,
    #[serde(rename = "api_keys.manage")]
    ApiKeysManage,
    #[serde(rename = "invitations.manage")]
    InvitationsManage,
    #[serde(rename = "models.manage")]
    ModelsManage,
    #[serde(rename = "registry.read")]
    RegistryRead,
    #[serde(rename = "logs.read")]
    LogsRead,
    #[serde(rename = "metrics.read")]
    MetricsRead,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub permissions: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
}

impl ApiKeyRow {
    pub fn permission_set(&self) -> Vec<Permission> {
        serde_json::from_str(&self.permissions).unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .is_some_and(|exp| exp < now)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvitationRow {
    pub code: String,
    pub role: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub consumed: bool,
    pub consumed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Request history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum RecordStatus {
    Success,
    Error(String),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub model: String,
    pub endpoint_id: Option<String>,
    pub status: RecordStatus,
    pub duration_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

// ---------------------------------------------------------------------------
// Admin API request/response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateEndpointRequest {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub dialect: Option<Dialect>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub probe_interval_secs: Option<u32>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub request_timeout_secs: Option<u32>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateEndpointRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub dialect: Option<Dialect>,
    /// `Some(None)` clears the key; field absent leaves it untouched.
    #[serde(default, with = "double_option")]
    pub api_key: Option<Option<String>>,
    #[serde(default)]
    pub probe_interval_secs: Option<u32>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub request_timeout_secs: Option<u32>,
}

/// Distinguishes an absent field from an explicit null in PATCH-style bodies.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(de).map(Some)
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub invitation_code: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub must_change_password: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateApiKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Option<Vec<Permission>>,
    #[serde(default, with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateInvitationRequest {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterModelRequest {
    pub repo: String,
    #[serde(default)]
    pub filename: Option<String>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub endpoints_online: usize,
    pub endpoints_total: usize,
}

// ---------------------------------------------------------------------------
// Upstream usage accounting
// ---------------------------------------------------------------------------

/// `usage` object of an OpenAI response; fields default to zero because some
/// backends omit them entirely.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_round_trips_through_str() {
        for d in [
            Dialect::OpenAi,
            Dialect::Ollama,
            Dialect::Vllm,
            Dialect::Xllm,
            Dialect::LlamaCpp,
            Dialect::Other,
        ] {
            assert_eq!(Dialect::parse(d.as_str()), d);
        }
    }

    #[test]
    fn permission_wire_names_are_dotted() {
        let json = serde_json::to_string(&Permission::OpenaiInference).unwrap();
        assert_eq!(json, "\"openai.inference\"");
        let parsed: Permission = serde_json::from_str("\"api_keys.manage\"").unwrap();
        assert_eq!(parsed, Permission::ApiKeysManage);
    }

    #[test]
    fn api_key_row_expiry() {
        let mut row = ApiKeyRow {
            id: "k1".into(),
            name: "test".into(),
            key_hash: String::new(),
            key_prefix: "sk_abcd".into(),
            permissions: "[\"openai.inference\"]".into(),
            created_by: None,
            created_at: Utc::now().to_rfc3339(),
            expires_at: None,
        };
        assert!(!row.is_expired(Utc::now()));
        row.expires_at = Some("2000-01-01T00:00:00+00:00".into());
        assert!(row.is_expired(Utc::now()));
        assert_eq!(row.permission_set(), vec![Permission::OpenaiInference]);
    }

    #[test]
    fn update_endpoint_distinguishes_null_from_absent() {
        let patch: UpdateEndpointRequest = serde_json::from_str("{\"api_key\": null}").unwrap();
        assert_eq!(patch.api_key, Some(None));
        let patch: UpdateEndpointRequest = serde_json::from_str("{}").unwrap();
        assert!(patch.api_key.is_none());
    }
}
