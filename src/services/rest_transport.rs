//! src/services/rest_transport.rs
//!
//! Fallback transport over the provider's contents API, one request pair
//! per file, plus repository provisioning.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    config::RemoteConfig,
    models::project::RepositoryBinding,
    services::{
        path_guard,
        transport::{
            PushOutcome, RemoteTransport, RepositoryProvisioner, SyncFile, TransportError,
            TransportKind, redact_credentials,
        },
    },
};

#[derive(Clone)]
pub struct RestTransport {
    client: Client,
    api_url: Url,
    token: Option<String>,
    org: Option<String>,
    platform_name: String,
}

#[derive(Deserialize)]
struct ContentsEntry {
    sha: String,
}

#[derive(Deserialize)]
struct ContentsWrite {
    commit: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

impl RestTransport {
    pub fn new(remote: &RemoteConfig) -> Result<Self, TransportError> {
        let api_url = Url::parse(&remote.api_url).map_err(|err| {
            TransportError::Configuration(format!("REMOTE_API_URL `{}`: {}", remote.api_url, err))
        })?;
        let client = Client::builder()
            .timeout(remote.command_timeout)
            .user_agent(format!("{}-sync", remote.platform_name))
            .build()
            .map_err(|err| TransportError::Configuration(format!("http client: {}", err)))?;

        Ok(Self {
            client,
            api_url,
            token: remote.token.clone(),
            org: remote.org.clone(),
            platform_name: remote.platform_name.clone(),
        })
    }

    /// `<api>/<segments...>`, each segment percent-encoded.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, TransportError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Configuration("REMOTE_API_URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn contents_url(&self, binding: &RepositoryBinding, path: &str) -> Result<Url, TransportError> {
        let (owner, repo) = owner_and_repo(binding)?;
        self.endpoint(
            ["repos", owner, repo, "contents", "workspace"]
                .into_iter()
                .chain(path.split('/')),
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn transport_error(&self, context: &str, err: reqwest::Error) -> TransportError {
        let message = redact_credentials(&format!("{}: {}", context, err), self.token.as_deref());
        if err.is_timeout() {
            TransportError::Timeout(message)
        } else {
            TransportError::Unavailable(message)
        }
    }

    async fn status_error(&self, context: &str, response: reqwest::Response) -> TransportError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = redact_credentials(
            &format!("{}: HTTP {} {}", context, status.as_u16(), body.trim()),
            self.token.as_deref(),
        );
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Denied(message),
            StatusCode::TOO_MANY_REQUESTS => TransportError::Unavailable(message),
            s if s.is_server_error() => TransportError::Unavailable(message),
            _ => TransportError::Failed(message),
        }
    }

    /// Sha of the existing remote file, or `None` when it must be created.
    async fn existing_sha(
        &self,
        url: &Url,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>, TransportError> {
        let response = self
            .request(self.client.get(url.clone()).query(&[("ref", branch)]))
            .send()
            .await
            .map_err(|err| self.transport_error(&format!("GET {}", path), err))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let entry: ContentsEntry = response.json().await.map_err(|err| {
                    TransportError::Failed(format!("GET {}: unexpected body: {}", path, err))
                })?;
                Ok(Some(entry.sha))
            }
            _ => Err(self.status_error(&format!("GET {}", path), response).await),
        }
    }

    async fn put_file(
        &self,
        binding: &RepositoryBinding,
        file: &SyncFile,
    ) -> Result<String, TransportError> {
        let url = self.contents_url(binding, &file.relative_path)?;
        let sha = self
            .existing_sha(&url, &binding.default_branch, &file.relative_path)
            .await?;
        let content = file.bytes().await?;

        let verb = if sha.is_some() { "Update" } else { "Create" };
        let mut body = json!({
            "message": format!("{} workspace/{} via {}", verb, file.relative_path, self.platform_name),
            "content": general_purpose::STANDARD.encode(&content),
            "branch": binding.default_branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }

        let response = self
            .request(self.client.put(url))
            .json(&body)
            .send()
            .await
            .map_err(|err| self.transport_error(&format!("PUT {}", file.relative_path), err))?;
        if !response.status().is_success() {
            return Err(self
                .status_error(&format!("PUT {}", file.relative_path), response)
                .await);
        }
        let written: ContentsWrite = response.json().await.map_err(|err| {
            TransportError::Failed(format!("PUT {}: unexpected body: {}", file.relative_path, err))
        })?;
        Ok(written.commit.sha)
    }
}

fn owner_and_repo(binding: &RepositoryBinding) -> Result<(&str, &str), TransportError> {
    binding.owner_and_repo().ok_or_else(|| {
        TransportError::Configuration(format!(
            "repository name `{}` is not `<owner>/<repo>`",
            binding.repo_name
        ))
    })
}

#[async_trait]
impl RemoteTransport for RestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rest
    }

    async fn is_available(&self, binding: &RepositoryBinding) -> bool {
        binding.is_writable() && self.token.is_some()
    }

    async fn push(
        &self,
        binding: &RepositoryBinding,
        files: &[SyncFile],
        _message: &str,
    ) -> Result<PushOutcome, TransportError> {
        let mut errors: Vec<TransportError> = Vec::new();
        let mut pushed = 0;
        let mut last_sha = None;

        for file in files {
            if !path_guard::should_sync_to_remote(&file.relative_path).is_allowed() {
                continue;
            }
            match self.put_file(binding, file).await {
                Ok(sha) => {
                    pushed += 1;
                    last_sha = Some(sha);
                }
                // Credentials will not get better on the next file.
                Err(err @ TransportError::Denied(_)) => return Err(err),
                Err(err) => {
                    warn!(repo = %binding.repo_name, path = %file.relative_path, error = %err, "file upload failed");
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            let summary = format!(
                "{} of {} files failed: {}",
                errors.len(),
                errors.len() + pushed,
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            let transient = errors
                .iter()
                .all(|e| matches!(e, TransportError::Unavailable(_) | TransportError::Timeout(_)));
            return Err(if transient {
                TransportError::Unavailable(summary)
            } else {
                TransportError::Failed(summary)
            });
        }

        info!(repo = %binding.repo_name, files = pushed, "pushed workspace via REST");
        Ok(PushOutcome {
            commit_sha: last_sha,
            files_pushed: pushed,
            message: format!("pushed {} files", pushed),
        })
    }
}

#[async_trait]
impl RepositoryProvisioner for RestTransport {
    async fn ensure_repository(
        &self,
        binding: &RepositoryBinding,
        private: bool,
    ) -> Result<(), TransportError> {
        let (owner, repo) = owner_and_repo(binding)?;
        let url = self.endpoint(["repos", owner, repo])?;
        let response = self
            .request(self.client.get(url))
            .send()
            .await
            .map_err(|err| self.transport_error("GET repository", err))?;
        match response.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            _ => return Err(self.status_error("GET repository", response).await),
        }

        let org = self.org.as_deref().ok_or_else(|| {
            TransportError::Configuration("REMOTE_ORG is required to create repositories".into())
        })?;
        let url = self.endpoint(["orgs", org, "repos"])?;
        let response = self
            .request(self.client.post(url))
            .json(&json!({
                "name": repo,
                "private": private,
                "auto_init": true,
                "description": format!("Workspace synced from {}", self.platform_name),
            }))
            .send()
            .await
            .map_err(|err| self.transport_error("create repository", err))?;

        match response.status() {
            // 422: created concurrently by another sync.
            s if s.is_success() || s == StatusCode::UNPROCESSABLE_ENTITY => {
                info!(repo = %binding.repo_name, private, "provisioned remote repository");
                Ok(())
            }
            _ => Err(self.status_error("create repository", response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project::RepoStatus;
    use crate::services::transport::FileContent;
    use bytes::Bytes;
    use chrono::Utc;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    fn binding() -> RepositoryBinding {
        RepositoryBinding {
            project_id: 1,
            provider: "github".into(),
            repo_name: "acme/site".into(),
            default_branch: "main".into(),
            status: RepoStatus::Ready,
            last_sync_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    fn transport(server: &MockServer) -> RestTransport {
        RestTransport::new(&RemoteConfig {
            api_url: server.uri(),
            token: Some("ghp_rest".into()),
            org: Some("acme".into()),
            ..RemoteConfig::default()
        })
        .unwrap()
    }

    fn file(path: &str, body: &'static [u8]) -> SyncFile {
        SyncFile {
            relative_path: path.into(),
            size: body.len() as u64,
            content: FileContent::InMemory(Bytes::from_static(body)),
        }
    }

    fn written(sha: &str) -> ResponseTemplate {
        ResponseTemplate::new(201).set_body_json(json!({ "commit": { "sha": sha } }))
    }

    #[tokio::test]
    async fn creates_new_files_and_updates_existing_ones() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/site/contents/workspace/README.md"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/site/contents/workspace/src/app.py"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sha": "abc" })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/acme/site/contents/workspace/README.md"))
            .and(header("authorization", "Bearer ghp_rest"))
            .and(body_partial_json(json!({ "content": "IyBzaXRl", "branch": "main" })))
            .respond_with(written("c1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/acme/site/contents/workspace/src/app.py"))
            .and(body_partial_json(json!({ "sha": "abc" })))
            .respond_with(written("c2"))
            .expect(1)
            .mount(&server)
            .await;

        let files = vec![
            file("README.md", b"# site"),
            file("src/app.py", b"print(1)"),
            file("dist/bundle.js", b"skipped"),
        ];
        let outcome = transport(&server)
            .push(&binding(), &files, "Upload workspace")
            .await
            .unwrap();
        assert_eq!(outcome.files_pushed, 2);
        assert_eq!(outcome.commit_sha.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn unauthorized_aborts_without_leaking_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials ghp_rest"))
            .mount(&server)
            .await;

        let err = transport(&server)
            .push(&binding(), &[file("a.txt", b"a"), file("b.txt", b"b")], "m")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Denied(_)));
        assert!(!err.to_string().contains("ghp_rest"));
    }

    #[tokio::test]
    async fn partial_server_errors_fail_the_push() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/acme/site/contents/workspace/ok.txt"))
            .respond_with(written("c1"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/acme/site/contents/workspace/bad.txt"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = transport(&server)
            .push(&binding(), &[file("ok.txt", b"1"), file("bad.txt", b"2")], "m")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert!(err.to_string().contains("1 of 2 files failed"));
    }

    #[tokio::test]
    async fn provisioning_creates_missing_repository_under_org() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/site"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orgs/acme/repos"))
            .and(body_partial_json(json!({ "name": "site", "private": true, "auto_init": true })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "full_name": "acme/site" })))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server)
            .ensure_repository(&binding(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transport_needs_a_token() {
        let rest = RestTransport::new(&RemoteConfig::default()).unwrap();
        assert!(!rest.is_available(&binding()).await);
    }
}
