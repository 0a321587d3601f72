//! Backblaze B2 backend.
//!
//! Signing, bucket creation and listing go through B2's S3-compatible API.
//! Deletion uses the native API: the S3 `DeleteObject` call on B2 only hides
//! the newest version, while `b2_delete_file_version` removes the bytes.

use crate::backends::s3::S3Storage;
use crate::error::{StorageError, StorageResult};
use crate::template::encode_key;
use crate::traits::{ObjectStream, Storage};
use async_trait::async_trait;
use ferry_core::StorageProvider;
use ferry_core::config::StorageSettings;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Native API authorization endpoint.
pub const B2_AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authorization {
    authorization_token: String,
    api_url: String,
    download_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFileVersion<'a> {
    file_name: &'a str,
    file_id: &'a str,
}

/// Storage on Backblaze B2.
#[derive(Debug, Clone)]
pub struct B2Storage {
    inner: S3Storage,
    http: reqwest::Client,
    key_id: String,
    application_key: String,
    authorize_url: String,
}

impl B2Storage {
    pub fn new(provider: &StorageProvider, settings: &StorageSettings) -> StorageResult<Self> {
        Ok(Self {
            inner: S3Storage::new(provider, settings)?,
            http: reqwest::Client::new(),
            key_id: provider.credentials.access_key_id.clone(),
            application_key: provider.credentials.secret_access_key.clone(),
            authorize_url: B2_AUTHORIZE_URL.to_string(),
        })
    }

    /// Point native API calls at a different authorization endpoint.
    pub fn with_authorize_url(mut self, url: impl Into<String>) -> Self {
        self.authorize_url = url.into();
        self
    }

    async fn authorize(&self) -> StorageResult<Authorization> {
        let response = self
            .http
            .get(&self.authorize_url)
            .basic_auth(&self.key_id, Some(&self.application_key))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Resolve the current version id of `key`. `None` when the object is gone.
    async fn file_id(
        &self,
        auth: &Authorization,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Option<String>> {
        let url = format!(
            "{}/file/{}/{}",
            auth.download_url.trim_end_matches('/'),
            bucket,
            encode_key(key)
        );
        let response = self
            .http
            .head(url)
            .header(reqwest::header::AUTHORIZATION, &auth.authorization_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let file_id = response
            .headers()
            .get("x-bz-file-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::B2 {
                status: response.status().as_u16(),
                message: format!("no x-bz-file-id header for {bucket}/{key}"),
            })?;
        Ok(Some(file_id))
    }
}

async fn check_status(response: reqwest::Response) -> StorageResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => format!("{}: {}", err.code, err.message),
        Err(_) => body,
    };
    Err(StorageError::B2 {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Storage for B2Storage {
    async fn require_bucket_name(&self, scope: &str) -> StorageResult<String> {
        self.inner.require_bucket_name(scope).await
    }

    async fn get_upload_url(&self, bucket: &str, key: &str) -> StorageResult<String> {
        self.inner.get_upload_url(bucket, key).await
    }

    async fn get_download_url(&self, bucket: &str, key: &str) -> StorageResult<String> {
        self.inner.get_download_url(bucket, key).await
    }

    #[instrument(skip(self), fields(backend = "b2"))]
    async fn delete_file(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let auth = self.authorize().await?;

        let Some(file_id) = self.file_id(&auth, bucket, key).await? else {
            tracing::debug!(bucket, key, "object already absent");
            return Ok(());
        };

        let response = self
            .http
            .post(format!(
                "{}/b2api/v2/b2_delete_file_version",
                auth.api_url.trim_end_matches('/')
            ))
            .header(reqwest::header::AUTHORIZATION, &auth.authorization_token)
            .json(&DeleteFileVersion {
                file_name: key,
                file_id: &file_id,
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    fn list_objects(&self) -> ObjectStream {
        self.inner.list_objects()
    }

    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn backend_name(&self) -> &'static str {
        "b2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{ProviderCredentials, StorageBackendKind};
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;

    fn provider() -> StorageProvider {
        StorageProvider {
            id: "b2".to_string(),
            endpoint: "https://s3.us-west-004.backblazeb2.com".to_string(),
            region: "us-west-004".to_string(),
            credentials: ProviderCredentials {
                access_key_id: "keyid".to_string(),
                secret_access_key: "appkey".to_string(),
            },
            bucket_location_constraint: None,
            download_url_template: None,
            kind: StorageBackendKind::B2,
        }
    }

    fn storage(server: &MockServer) -> B2Storage {
        B2Storage::new(&provider(), &StorageSettings::default())
            .unwrap()
            .with_authorize_url(server.url("/b2api/v2/b2_authorize_account"))
    }

    fn mock_authorize(server: &MockServer) -> httpmock::Mock<'_> {
        let base = server.base_url();
        server.mock(|when, then| {
            when.method(GET)
                .path("/b2api/v2/b2_authorize_account")
                .header_exists("authorization");
            then.status(200).json_body(serde_json::json!({
                "accountId": "acct",
                "authorizationToken": "tok",
                "apiUrl": base,
                "downloadUrl": base,
            }));
        })
    }

    #[tokio::test]
    async fn test_delete_resolves_file_id_then_deletes_version() {
        let server = MockServer::start();
        let auth = mock_authorize(&server);
        let head = server.mock(|when, then| {
            when.method(HEAD)
                .path("/file/ferry-abc/dir/a.0-9")
                .header("authorization", "tok");
            then.status(200).header("x-bz-file-id", "4_zfile");
        });
        let delete = server.mock(|when, then| {
            when.method(POST)
                .path("/b2api/v2/b2_delete_file_version")
                .header("authorization", "tok")
                .json_body(serde_json::json!({"fileName": "dir/a.0-9", "fileId": "4_zfile"}));
            then.status(200).json_body(serde_json::json!({}));
        });

        storage(&server)
            .delete_file("ferry-abc", "dir/a.0-9")
            .await
            .unwrap();

        auth.assert();
        head.assert();
        delete.assert();
    }

    #[tokio::test]
    async fn test_delete_missing_object_is_noop() {
        let server = MockServer::start();
        mock_authorize(&server);
        server.mock(|when, then| {
            when.method(HEAD).path("/file/ferry-abc/gone.0-9");
            then.status(404);
        });
        let delete = server.mock(|when, then| {
            when.method(POST).path("/b2api/v2/b2_delete_file_version");
            then.status(200);
        });

        storage(&server)
            .delete_file("ferry-abc", "gone.0-9")
            .await
            .unwrap();
        assert_eq!(delete.hits(), 0);
    }

    #[tokio::test]
    async fn test_authorization_failure_surfaces_api_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/b2api/v2/b2_authorize_account");
            then.status(401).json_body(serde_json::json!({
                "status": 401,
                "code": "unauthorized",
                "message": "bad key",
            }));
        });

        match storage(&server).delete_file("ferry-abc", "a.0-9").await {
            Err(StorageError::B2 { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "unauthorized: bad key");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_backend_name() {
        let storage = B2Storage::new(&provider(), &StorageSettings::default()).unwrap();
        assert_eq!(storage.backend_name(), "b2");
        assert_eq!(
            storage.identity(),
            "https://s3.us-west-004.backblazeb2.com|keyid"
        );
    }
}
