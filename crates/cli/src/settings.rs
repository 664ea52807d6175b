use std::path::{Path, PathBuf};
use std::time::Duration;

use coachstream_conversation::{Conversation, ConversationId, ConversationMode, Participants};
use coachstream_http::{ApiConfig, DEFAULT_EXPLAIN_PATH, DEFAULT_MESSAGE_PATH, DEFAULT_STREAM_PATH};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, Snafu, ensure};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
pub const SETTINGS_DIRECTORY_NAME: &str = "coachstream";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "COACHSTREAM_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_message_path")]
    pub message_path: String,
    #[serde(default = "default_explain_path")]
    pub explain_path: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            stream_path: default_stream_path(),
            message_path: default_message_path(),
            explain_path: default_explain_path(),
        }
    }
}

/// Transport timeouts, stored as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(
        default = "default_connect_timeout",
        serialize_with = "serialize_seconds",
        deserialize_with = "deserialize_seconds"
    )]
    pub connect: Duration,
    #[serde(
        default = "default_read_timeout",
        serialize_with = "serialize_seconds",
        deserialize_with = "deserialize_seconds"
    )]
    pub read: Duration,
    #[serde(
        default = "default_request_timeout",
        serialize_with = "serialize_seconds",
        deserialize_with = "deserialize_seconds"
    )]
    pub request: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_read_timeout(),
            request: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub coach_id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub mode: ConversationMode,
    #[serde(default)]
    pub endpoints: EndpointSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            user_id: String::new(),
            coach_id: String::new(),
            conversation_id: String::new(),
            mode: ConversationMode::default(),
            endpoints: EndpointSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl Settings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".coachstream"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the JSON file at `path` if present, then `COACHSTREAM_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "settings file not found, using defaults and environment"
            );
        }

        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, SettingsError> {
        let settings = figment
            .extract::<Settings>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
            })?;
        Ok(settings.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.api_base_url = if self.api_base_url.trim().is_empty() {
            default_api_base_url()
        } else {
            self.api_base_url.trim().to_string()
        };
        self.user_id = self.user_id.trim().to_string();
        self.coach_id = self.coach_id.trim().to_string();
        self.conversation_id = self.conversation_id.trim().to_string();

        let endpoints = &mut self.endpoints;
        normalize_path(&mut endpoints.stream_path, DEFAULT_STREAM_PATH);
        normalize_path(&mut endpoints.message_path, DEFAULT_MESSAGE_PATH);
        normalize_path(&mut endpoints.explain_path, DEFAULT_EXPLAIN_PATH);

        self
    }

    /// Checks the identifiers every request carries.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (field, value) in [
            ("user_id", &self.user_id),
            ("coach_id", &self.coach_id),
            ("conversation_id", &self.conversation_id),
        ] {
            ensure!(
                !value.is_empty(),
                MissingFieldSnafu {
                    stage: "validate-settings",
                    field,
                }
            );
        }
        Ok(())
    }

    pub fn to_api_config(&self) -> ApiConfig {
        let mut config = ApiConfig::new(&self.api_base_url);
        config.stream_path = self.endpoints.stream_path.clone();
        config.message_path = self.endpoints.message_path.clone();
        config.explain_path = self.endpoints.explain_path.clone();
        config.connect_timeout = self.timeouts.connect;
        config.read_timeout = self.timeouts.read;
        config.request_timeout = self.timeouts.request;
        config
    }

    pub fn participants(&self) -> Participants {
        Participants::new(&self.user_id, &self.coach_id)
    }

    pub fn conversation(&self) -> Conversation {
        Conversation::new(
            ConversationId::new(&self.conversation_id),
            self.mode.clone(),
        )
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read settings on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        source: Box<figment::Error>,
    },
    #[snafu(display("setting `{field}` is required on `{stage}`"))]
    MissingField {
        stage: &'static str,
        field: &'static str,
    },
}

fn normalize_path(path: &mut String, default: &str) {
    let trimmed = path.trim();
    *path = if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    };
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

fn default_message_path() -> String {
    DEFAULT_MESSAGE_PATH.to_string()
}

fn default_explain_path() -> String {
    DEFAULT_EXPLAIN_PATH.to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(90)
}

fn serialize_seconds<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(value.as_secs())
}

fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
