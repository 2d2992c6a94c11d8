use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::types::{AddOutcome, AddTorrentRequest, Torrent, TorrentFile, TorrentQuery, tag_list};
use super::TorrentClient;
use crate::error::{Result, RouterError};

/// HTTP settings for [`QbittorrentClient`].
#[derive(Clone, Debug)]
pub struct QbittorrentOptions {
    pub request_timeout: Duration,
}

impl Default for QbittorrentOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// qBittorrent WebAPI v2 session.
///
/// The session cookie lives in the client's cookie store. A `403` on any call is taken as an
/// expired session: the client logs in again and retries that call once.
pub struct QbittorrentClient {
    label: String,
    base: Url,
    http: Client,
    username: String,
    password: String,
}

impl fmt::Debug for QbittorrentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QbittorrentClient")
            .field("label", &self.label)
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct MainData {
    server_state: Option<ServerState>,
}

#[derive(Deserialize)]
struct ServerState {
    free_space_on_disk: Option<u64>,
}

impl QbittorrentClient {
    /// Log in to the WebAPI at `url`. Bad credentials and unreachable hosts both fail with
    /// [`RouterError::Auth`].
    pub async fn authenticate(
        label: impl Into<String>,
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::authenticate_with(label, url, username, password, QbittorrentOptions::default())
            .await
    }

    pub async fn authenticate_with(
        label: impl Into<String>,
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        options: QbittorrentOptions,
    ) -> Result<Self> {
        let mut base = Url::parse(url)
            .map_err(|err| RouterError::Config(format!("invalid WebAPI URL {url:?}: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .cookie_store(true)
            .timeout(options.request_timeout)
            .build()?;

        let client = Self {
            label: label.into(),
            base,
            http,
            username: username.into(),
            password: password.into(),
        };
        client.login().await?;
        info!(client = %client.label, url = %client.base, "authenticated");
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(&format!("api/v2/{path}"))
            .map_err(|err| RouterError::Config(format!("invalid endpoint {path}: {err}")))
    }

    async fn login(&self) -> Result<()> {
        let auth_error = |reason: String| RouterError::Auth {
            url: self.base.to_string(),
            reason,
        };

        let response = self
            .http
            .post(self.endpoint("auth/login")?)
            .header(reqwest::header::REFERER, self.base.as_str())
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|err| auth_error(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| auth_error(err.to_string()))?;

        match (status, body.trim()) {
            (StatusCode::OK, "Ok.") => Ok(()),
            (StatusCode::FORBIDDEN, _) => Err(auth_error(
                "too many failed attempts, client IP is banned".into(),
            )),
            (status, body) => Err(auth_error(format!("{status}: {body}"))),
        }
    }

    /// Send a request built by `build`, logging in again once if the session was rejected.
    async fn send<F>(&self, path: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let url = self.endpoint(path)?;
        let response = build(&self.http, url.clone()).send().await?;

        if response.status() == StatusCode::FORBIDDEN {
            info!(client = %self.label, "session rejected, logging in again");
            self.login().await?;
            let retried = build(&self.http, url).send().await?;
            return check(path, retried).await;
        }

        check(path, response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self.send(path, |http, url| http.get(url).query(query)).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| RouterError::Decode {
            what: path.to_string(),
            reason: err.to_string(),
        })
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<String> {
        let response = self.send(path, |http, url| http.post(url).form(form)).await?;
        Ok(response.text().await?)
    }

    /// POST to `path`, falling back to `legacy` on servers that predate it (404).
    async fn post_form_or_legacy(&self, path: &str, legacy: &str, form: &[(&str, String)]) -> Result<()> {
        match self.post_form(path, form).await {
            Ok(_) => Ok(()),
            Err(RouterError::Remote { status: 404, .. }) => {
                debug!(client = %self.label, path, legacy, "endpoint missing, using legacy name");
                self.post_form(legacy, form).await.map(drop)
            }
            Err(err) => Err(err),
        }
    }
}

async fn check(path: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RouterError::remote(format!("/api/v2/{path}"), status.as_u16(), body))
}

#[async_trait]
impl TorrentClient for QbittorrentClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list_torrents(&self, query: &TorrentQuery) -> Result<Vec<Torrent>> {
        let mut params = Vec::new();
        if let Some(filter) = query.filter {
            params.push(("filter", filter.as_str().to_string()));
        }
        if let Some(tag) = &query.tag {
            params.push(("tag", tag.clone()));
        }
        if let Some(sort) = query.sort {
            params.push(("sort", sort.as_str().to_string()));
            params.push(("reverse", query.reverse.to_string()));
        }
        if !query.hashes.is_empty() {
            params.push(("hashes", query.hashes.join("|")));
        }
        self.get_json("torrents/info", &params).await
    }

    async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentFile>> {
        self.get_json("torrents/files", &[("hash", hash.to_string())])
            .await
    }

    async fn default_save_path(&self) -> Result<PathBuf> {
        let response = self
            .send("app/defaultSavePath", |http, url| http.get(url))
            .await?;
        Ok(PathBuf::from(response.text().await?.trim()))
    }

    async fn free_space(&self) -> Result<u64> {
        let data: MainData = self.get_json("sync/maindata", &[]).await?;
        data.server_state
            .and_then(|state| state.free_space_on_disk)
            .ok_or_else(|| RouterError::Decode {
                what: "sync/maindata".into(),
                reason: "server_state.free_space_on_disk missing".into(),
            })
    }

    async fn add_tag(&self, hash: &str, tag: &str) -> Result<()> {
        self.post_form(
            "torrents/addTags",
            &[("hashes", hash.to_string()), ("tags", tag.to_string())],
        )
        .await
        .map(drop)
    }

    async fn stop(&self, hash: &str) -> Result<()> {
        self.post_form_or_legacy("torrents/stop", "torrents/pause", &[("hashes", hash.to_string())])
            .await
    }

    async fn start(&self, hash: &str) -> Result<()> {
        self.post_form_or_legacy(
            "torrents/start",
            "torrents/resume",
            &[("hashes", hash.to_string())],
        )
        .await
    }

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<()> {
        self.post_form(
            "torrents/delete",
            &[
                ("hashes", hash.to_string()),
                ("deleteFiles", delete_files.to_string()),
            ],
        )
        .await
        .map(drop)
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        let hash = hash.to_string();
        let response = self
            .send("torrents/export", |http, url| {
                http.get(url).query(&[("hash", hash.as_str())])
            })
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn add(&self, request: AddTorrentRequest) -> Result<AddOutcome> {
        let paused = request.paused.to_string();
        let tags = tag_list::join(&request.tags);
        let save_path = request.save_path.to_string_lossy().into_owned();

        // Multipart bodies cannot be cloned, so the form is rebuilt for a retry.
        let response = self
            .send("torrents/add", |http, url| {
                let metadata = Part::bytes(request.metadata.clone()).file_name("upload.torrent");
                let form = Form::new()
                    .part("torrents", metadata)
                    .text("savepath", save_path.clone())
                    .text("category", request.category.clone())
                    .text("tags", tags.clone())
                    .text("autoTMM", request.auto_tmm.to_string())
                    .text("paused", paused.clone())
                    .text("stopped", paused.clone());
                http.post(url).multipart(form)
            })
            .await?;

        Ok(AddOutcome::from_body(&response.text().await?))
    }
}
