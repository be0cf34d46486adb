//! Forge API clients for repository enumeration.
//!
//! A provider job names a [`Forge`] and a credential; the forge API turns
//! that into the set of clone URLs the sync pipeline mirrors. The forge is a
//! closed sum type resolved when settings load, so an unsupported name is a
//! configuration error rather than a runtime string miss.
//!
//! [`HttpForge`] is the blocking HTTP implementation. It paginates until a
//! page comes back empty and never echoes response bodies into errors.

use std::fmt;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Repositories fetched per page.
const PAGE_SIZE: usize = 100;

/// Upper bound on pages per enumeration; a safety valve against a
/// misbehaving endpoint that never returns an empty page.
const MAX_PAGES: usize = 200;

/// Supported forges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Forge {
    Github,
    Gitlab,
    Forgejo,
}

impl Forge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Forge::Github => "github",
            Forge::Gitlab => "gitlab",
            Forge::Forgejo => "forgejo",
        }
    }

    /// Hosted default API base; `None` means a `baseUrl` is mandatory.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Forge::Github => Some("https://api.github.com"),
            Forge::Gitlab => Some("https://gitlab.com"),
            Forge::Forgejo => None,
        }
    }
}

impl fmt::Display for Forge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One repository as reported by a forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub clone_url: String,
    pub web_url: Option<String>,
}

/// Enumerates the repositories owned by the authenticated account.
pub trait ForgeClient: Send + Sync {
    fn list_owned_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>>;
}

/// Builds a [`ForgeClient`] per provider job; the indirection keeps the
/// pipeline testable without a network.
pub trait ForgeClientFactory: Send + Sync {
    fn client(&self, forge: Forge, base_url: Option<&str>) -> Result<Box<dyn ForgeClient>>;
}

/// Factory producing [`HttpForge`] clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpForgeFactory;

impl ForgeClientFactory for HttpForgeFactory {
    fn client(&self, forge: Forge, base_url: Option<&str>) -> Result<Box<dyn ForgeClient>> {
        Ok(Box::new(HttpForge::new(forge, base_url)?))
    }
}

#[derive(Deserialize)]
struct GithubRepo {
    clone_url: String,
    html_url: Option<String>,
}

#[derive(Deserialize)]
struct GitlabProject {
    http_url_to_repo: String,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct ForgejoRepo {
    clone_url: String,
    html_url: Option<String>,
}

/// Blocking HTTP client for one forge account.
#[derive(Debug, Clone)]
pub struct HttpForge {
    forge: Forge,
    base_url: String,
    http: Client,
}

impl HttpForge {
    pub fn new(forge: Forge, base_url: Option<&str>) -> Result<Self> {
        let base_url = base_url
            .map(str::to_owned)
            .or_else(|| forge.default_base_url().map(str::to_owned))
            .with_context(|| format!("{forge} requires an explicit baseUrl"))?;

        let http = Client::builder()
            .user_agent(format!("gitvault/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            forge,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn page_url(&self, page: usize) -> String {
        match self.forge {
            Forge::Github => format!(
                "{}/user/repos?affiliation=owner&per_page={PAGE_SIZE}&page={page}",
                self.base_url
            ),
            Forge::Gitlab => format!(
                "{}/api/v4/projects?owned=true&per_page={PAGE_SIZE}&page={page}",
                self.base_url
            ),
            Forge::Forgejo => format!(
                "{}/api/v1/user/repos?limit={PAGE_SIZE}&page={page}",
                self.base_url
            ),
        }
    }

    fn fetch_page(&self, token: &str, page: usize) -> Result<Vec<RemoteRepository>> {
        let url = self.page_url(page);
        let request = match self.forge {
            Forge::Github => self
                .http
                .get(&url)
                .header("Authorization", format!("token {token}"))
                .header("Accept", "application/vnd.github+json"),
            Forge::Gitlab => self.http.get(&url).header("PRIVATE-TOKEN", token),
            Forge::Forgejo => self
                .http
                .get(&url)
                .header("Authorization", format!("token {token}")),
        };

        let response = request
            .send()
            .with_context(|| format!("{} request failed", self.forge))?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("{} rejected the credential ({})", self.forge, response.status())
            }
            status => bail!("unexpected status {status} from {} while listing repositories", self.forge),
        }

        let repositories = match self.forge {
            Forge::Github => response
                .json::<Vec<GithubRepo>>()
                .context("failed to parse github repository list")?
                .into_iter()
                .map(|r| RemoteRepository {
                    clone_url: r.clone_url,
                    web_url: r.html_url,
                })
                .collect(),
            Forge::Gitlab => response
                .json::<Vec<GitlabProject>>()
                .context("failed to parse gitlab project list")?
                .into_iter()
                .map(|p| RemoteRepository {
                    clone_url: p.http_url_to_repo,
                    web_url: p.web_url,
                })
                .collect(),
            Forge::Forgejo => response
                .json::<Vec<ForgejoRepo>>()
                .context("failed to parse forgejo repository list")?
                .into_iter()
                .map(|r| RemoteRepository {
                    clone_url: r.clone_url,
                    web_url: r.html_url,
                })
                .collect(),
        };
        Ok(repositories)
    }
}

impl ForgeClient for HttpForge {
    fn list_owned_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>> {
        let mut repositories = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch = self.fetch_page(token, page)?;
            if batch.is_empty() {
                return Ok(repositories);
            }
            let full_page = batch.len() >= PAGE_SIZE;
            repositories.extend(batch);
            if !full_page {
                return Ok(repositories);
            }
        }
        warn!(
            "{} returned {MAX_PAGES} full pages; truncating enumeration at {} repositories",
            self.forge,
            repositories.len()
        );
        Ok(repositories)
    }
}
