use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use regex::RegexBuilder;
use serde::Deserialize;

use super::version::DotnetVersion;
use crate::error::{Error, Result};

pub const DEFAULT_REPO: &str = "IBM/dotnet-s390x";
pub const DEFAULT_NUGET_PACKAGE: &str = "microsoft.netcore.app.runtime.linux-x64";
const GITHUB_API: &str = "https://api.github.com";
const NUGET_INDEX: &str = "https://api.nuget.org/v3-flatcontainer";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

/// Where SDK releases and the NuGet version index come from.
pub trait ReleaseSource {
    fn releases(&self) -> Result<Vec<Release>>;
    /// `tag` may be `latest`.
    fn release(&self, tag: &str) -> Result<Release>;
    fn nuget_versions(&self, package: &str) -> Result<Vec<String>>;
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct GithubReleases {
    client: reqwest::blocking::Client,
    repo: String,
}

impl GithubReleases {
    pub fn new(repo: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("imageprep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            repo: repo.trim().to_string(),
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        tracing::debug!(url, "GET");
        let res = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .map_err(|e| Error::msg(format!("request to {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "request to {url} failed with status {}",
                res.status()
            )));
        }
        res.json::<T>()
            .map_err(|e| Error::msg(format!("invalid JSON from {url}: {e}")))
    }
}

#[derive(Deserialize)]
struct NugetIndex {
    #[serde(default)]
    versions: Vec<String>,
}

impl ReleaseSource for GithubReleases {
    fn releases(&self) -> Result<Vec<Release>> {
        let mut out = Vec::new();
        for page in 1.. {
            let url = format!(
                "{GITHUB_API}/repos/{}/releases?per_page={PAGE_SIZE}&page={page}",
                self.repo
            );
            let batch: Vec<Release> = self.get_json(&url)?;
            if batch.is_empty() {
                break;
            }
            out.extend(batch);
        }
        Ok(out)
    }

    fn release(&self, tag: &str) -> Result<Release> {
        let url = if tag == "latest" {
            format!("{GITHUB_API}/repos/{}/releases/latest", self.repo)
        } else {
            format!("{GITHUB_API}/repos/{}/releases/tags/{tag}", self.repo)
        };
        self.get_json(&url)
    }

    fn nuget_versions(&self, package: &str) -> Result<Vec<String>> {
        let url = format!("{NUGET_INDEX}/{package}/index.json");
        // An unreachable index means "nothing verified", not a hard error.
        match self.get_json::<NugetIndex>(&url) {
            Ok(idx) => Ok(idx.versions),
            Err(e) => {
                tracing::warn!(error = %e, "NuGet index unavailable");
                Ok(Vec::new())
            }
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::msg(format!("download of {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "download of {url} failed with status {}",
                res.status()
            )));
        }
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type.contains("html") {
            return Err(Error::msg(format!(
                "download of {url} returned HTML, not a tarball"
            )));
        }
        let mut file = fs::File::create(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        res.copy_to(&mut file)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", dest.display())))?;
        file.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub tag: String,
    pub exact: bool,
}

/// Picks the release for `requested` that also has runtime metadata on NuGet.
///
/// Only releases with the requested major version are considered. The exact
/// version wins when NuGet lists it; otherwise candidates are tried outward
/// from the requested position, the newer neighbour before the older one.
pub fn resolve_release(
    requested: &str,
    releases: &[Release],
    nuget_versions: &[String],
) -> Result<Resolution> {
    let want: DotnetVersion = requested.parse()?;
    let nuget: BTreeSet<&str> = nuget_versions.iter().map(String::as_str).collect();
    let on_nuget = |v: &DotnetVersion| {
        v.nuget_normalized()
            .is_some_and(|n| nuget.contains(n.as_str()))
    };

    let mut by_version = BTreeMap::<DotnetVersion, &str>::new();
    for r in releases {
        let Ok(v) = r.tag_name.parse::<DotnetVersion>() else {
            continue;
        };
        if v.major == want.major {
            by_version.insert(v, r.tag_name.as_str());
        }
    }
    if by_version.is_empty() {
        return Err(Error::msg(format!(
            "no releases match major version {} of '{requested}'",
            want.major
        )));
    }

    let sorted: Vec<(&DotnetVersion, &str)> = by_version.iter().map(|(v, t)| (v, *t)).collect();
    let idx = sorted.partition_point(|(v, _)| **v < want);

    if let Some((v, tag)) = sorted.get(idx)
        && **v == want
        && on_nuget(*v)
    {
        return Ok(Resolution {
            tag: tag.to_string(),
            exact: true,
        });
    }

    for offset in 0..sorted.len() {
        for i in [idx.checked_add(offset), idx.checked_sub(offset)]
            .into_iter()
            .flatten()
        {
            let Some((v, tag)) = sorted.get(i) else {
                continue;
            };
            if on_nuget(*v) {
                return Ok(Resolution {
                    tag: tag.to_string(),
                    exact: false,
                });
            }
        }
    }

    Err(Error::msg(format!(
        "no release compatible with NuGet found for '{requested}'"
    )))
}

/// Release tags matching `filter` (`*` wildcards, optional leading `v`),
/// newest first.
pub fn filter_tags(releases: &[Release], filter: Option<&str>) -> Result<Vec<String>> {
    let re = match filter.map(str::trim).filter(|f| !f.is_empty()) {
        Some(f) => {
            let f = f.strip_prefix('v').unwrap_or(f);
            let pattern = format!("v?{}", regex::escape(f).replace(r"\*", ".*"));
            Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::msg(format!("invalid filter '{f}': {e}")))?,
            )
        }
        None => None,
    };

    let mut tags: Vec<(Option<DotnetVersion>, &str)> = releases
        .iter()
        .map(|r| r.tag_name.as_str())
        .filter(|t| !t.is_empty())
        .filter(|t| re.as_ref().is_none_or(|re| re.is_match(t)))
        .map(|t| (t.parse().ok(), t))
        .collect();
    tags.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(tags.into_iter().map(|(_, t)| t.to_string()).collect())
}

/// First SDK tarball built for `arch`.
pub fn select_sdk_asset<'a>(release: &'a Release, arch: &str) -> Option<&'a Asset> {
    release
        .assets
        .iter()
        .find(|a| a.name.starts_with("dotnet-sdk-") && a.name.contains(arch) && a.name.ends_with(".tar.gz"))
}
