use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::error::{Error, ErrorKind};

/// Opaque, collision-resistant deployment identity: 128 bits of randomness,
/// hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// `<adjective>-<noun>-<4-hex>`. Word generation is external to this core
/// (see spec §1); callers construct a `Slug` from an already-formed string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slug(pub String);

impl std::fmt::Display for Slug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Slug {
    pub fn container_name(&self) -> String {
        format!("deploy-{}", self.0)
    }

    pub fn build_container_name(&self) -> String {
        format!("build-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Deploying,
    Live,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Deploying => "deploying",
            Status::Live => "live",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Source-kind discriminator. Per REDESIGN FLAGS, the git-specific fields
/// live inside the `Git` variant instead of being nullable columns on a
/// flat struct, so `source_type=git` with a missing URL is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceSpec {
    Zip,
    Git { repo_url: String, branch: String },
}

impl SourceSpec {
    pub fn kind_str(&self) -> &'static str {
        match self {
            SourceSpec::Zip => "zip",
            SourceSpec::Git { .. } => "git",
        }
    }
}

/// Environment variable map, persisted as a single serialized JSON string
/// per spec §3 (REDESIGN FLAGS notes a side table would be preferable in a
/// rewrite; kept as-is here since spec.md pins the on-disk shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVars(pub Vec<(String, String)>);

impl EnvVars {
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn as_key_equals_value(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub slug: Slug,
    pub display_name: String,
    pub source: SourceSpec,
    pub build_command: String,
    pub output_subdir: String,
    pub env_vars: EnvVars,
    pub status: Status,
    pub url: String,
    pub webhook_secret: String,
    pub auto_deploy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Builds a brand-new row ready for `StateStore::insert`. Timestamps
    /// and `url` are computed here, not left to the caller, per spec §3's
    /// "URL is derived from slug and immutable for the lifetime of the
    /// row" and "webhook secret, once generated, is never mutated".
    pub fn new(
        slug: Slug,
        display_name: String,
        source: SourceSpec,
        build_command: String,
        output_subdir: String,
        env_vars: EnvVars,
        auto_deploy: bool,
        base_domain: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        let url = format!("http://{}.{}", slug.0, base_domain);
        Self {
            id: DeploymentId::new(),
            slug,
            display_name,
            source,
            build_command,
            output_subdir,
            env_vars,
            status: Status::Deploying,
            url,
            webhook_secret: generate_webhook_secret(),
            auto_deploy,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }
}

fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl FromRow<'_, SqliteRow> for Deployment {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let source_kind: String = row.try_get("source_kind")?;
        let source = match source_kind.as_str() {
            "zip" => SourceSpec::Zip,
            "git" => SourceSpec::Git {
                repo_url: row.try_get("repo_url")?,
                branch: row.try_get("branch")?,
            },
            other => {
                return Err(sqlx::Error::Decode(
                    format!("unknown source_kind `{other}`").into(),
                ))
            }
        };

        Ok(Self {
            id: DeploymentId(row.try_get("id")?),
            slug: Slug(row.try_get("slug")?),
            display_name: row.try_get("display_name")?,
            source,
            build_command: row.try_get("build_command")?,
            output_subdir: row.try_get("output_subdir")?,
            env_vars: EnvVars::from_json(&row.try_get::<String, _>("env_vars")?),
            status: row.try_get("status")?,
            url: row.try_get("url")?,
            webhook_secret: row.try_get("webhook_secret")?,
            auto_deploy: row.try_get("auto_deploy")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

pub fn conflict(slug: &Slug) -> Error {
    Error::custom(ErrorKind::Conflict, format!("slug `{slug}` already in use"))
}
