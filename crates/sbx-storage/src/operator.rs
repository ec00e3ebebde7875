//! OpenDAL Operator factory for shoebox storage backends

use opendal::Operator;
use sbx_core::config::StorageConfig;
use sbx_core::{SbxError, SbxResult};

/// Credentials for the remote store. Opaque to everything but the builder.
#[derive(Clone, Default)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub username: String,
    pub password: String,
}

impl StorageCredentials {
    /// Read credentials from `SBX_ACCESS_KEY_ID`, `SBX_SECRET_ACCESS_KEY`,
    /// `SBX_WEBDAV_USER` and `SBX_WEBDAV_PASSWORD`. Missing values are empty.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        Self {
            access_key_id: var("SBX_ACCESS_KEY_ID"),
            secret_access_key: var("SBX_SECRET_ACCESS_KEY"),
            username: var("SBX_WEBDAV_USER"),
            password: var("SBX_WEBDAV_PASSWORD"),
        }
    }
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn check_tls(storage: &StorageConfig) -> SbxResult<()> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            return Err(SbxError::Config(format!(
                "endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "storage endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }
    Ok(())
}

fn finish<B: opendal::Builder>(builder: B) -> SbxResult<Operator> {
    let op = Operator::new(builder)
        .map_err(|e| SbxError::Config(format!("creating OpenDAL operator: {e}")))?
        .finish()
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(3)
                .with_jitter(),
        );
    Ok(op)
}

/// Build an operator for the configured backend.
///
/// S3 uses path-style addressing (the OpenDAL default), which MinIO and
/// SeaweedFS require.
pub fn build_operator(storage: &StorageConfig, creds: &StorageCredentials) -> SbxResult<Operator> {
    match storage.backend.as_str() {
        "s3" => {
            check_tls(storage)?;
            let builder = opendal::services::S3::default()
                .endpoint(&storage.endpoint)
                .region(&storage.region)
                .bucket(&storage.bucket)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(&creds.secret_access_key);
            finish(builder)
        }
        "webdav" => {
            check_tls(storage)?;
            let builder = opendal::services::Webdav::default()
                .endpoint(&storage.endpoint)
                .username(&creds.username)
                .password(&creds.password);
            finish(builder)
        }
        "memory" => finish(opendal::services::Memory::default()),
        other => Err(SbxError::Config(format!(
            "unknown storage backend '{other}' (expected s3, webdav, or memory)"
        ))),
    }
}
