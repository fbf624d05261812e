//! .NET release version ordering as used by the IBM SDK builds.
//!
//! Tags look like `v9.0.100`, `v10.0.100-preview.7.25351.106` or the short
//! `v9.0.100-rtm.24503`. Ordering is (major, minor, patch, stage, stage
//! number, build), with stable sorting above every pre-release stage.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Unknown,
    Alpha,
    Preview,
    Rc,
    Rtm,
    Stable,
}

impl Stage {
    fn from_label(s: &str) -> Self {
        match s {
            "alpha" => Stage::Alpha,
            "preview" => Stage::Preview,
            "rc" => Stage::Rc,
            "rtm" => Stage::Rtm,
            _ => Stage::Unknown,
        }
    }

    fn label(self) -> Option<&'static str> {
        match self {
            Stage::Alpha => Some("alpha"),
            Stage::Preview => Some("preview"),
            Stage::Rc => Some("rc"),
            Stage::Rtm => Some("rtm"),
            Stage::Stable | Stage::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DotnetVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub stage: Stage,
    pub stage_number: u64,
    pub build: Vec<u64>,
}

impl DotnetVersion {
    /// Form used by the NuGet runtime package index: patch is always 0.
    /// `None` for suffixes that have no NuGet spelling.
    pub fn nuget_normalized(&self) -> Option<String> {
        let base = format!("{}.{}.0", self.major, self.minor);
        match self.stage {
            Stage::Stable => Some(base),
            Stage::Unknown => None,
            stage => Some(format!(
                "{base}-{}.{}.{}",
                stage.label()?,
                self.stage_number,
                join_build(&self.build)
            )),
        }
    }
}

fn join_build(build: &[u64]) -> String {
    build
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_build(raw: &str, tag: &str) -> Result<Vec<u64>> {
    raw.split('.')
        .map(|p| {
            p.parse::<u64>()
                .map_err(|_| Error::msg(format!("invalid build number in version '{tag}'")))
        })
        .collect()
}

fn suffix_patterns() -> Result<(Regex, Regex)> {
    let full = Regex::new(r"^(alpha|preview|rc|rtm)\.(\d+)\.([\d.]+)")
        .map_err(|e| Error::msg(format!("version regex: {e}")))?;
    let short = Regex::new(r"^(alpha|preview|rc|rtm)\.([\d.]+)")
        .map_err(|e| Error::msg(format!("version regex: {e}")))?;
    Ok((full, short))
}

impl FromStr for DotnetVersion {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        let trimmed = tag.trim().trim_start_matches('v');
        let (base, suffix) = match trimmed.split_once('-') {
            Some((b, s)) => (b, s),
            None => (trimmed, ""),
        };

        let mut nums = base.split('.').map(|p| {
            p.parse::<u64>()
                .map_err(|_| Error::msg(format!("invalid version '{tag}'")))
        });
        let mut next = || {
            nums.next()
                .unwrap_or_else(|| Err(Error::msg(format!("invalid version '{tag}'"))))
        };
        let (major, minor, patch) = (next()?, next()?, next()?);

        let mut v = DotnetVersion {
            major,
            minor,
            patch,
            stage: Stage::Stable,
            stage_number: 0,
            build: Vec::new(),
        };
        if suffix.is_empty() {
            return Ok(v);
        }

        let (full, short) = suffix_patterns()?;
        if let Some(c) = full.captures(suffix) {
            v.stage = Stage::from_label(&c[1]);
            v.stage_number = c[2]
                .parse()
                .map_err(|_| Error::msg(format!("invalid stage number in version '{tag}'")))?;
            v.build = parse_build(&c[3], tag)?;
        } else if let Some(c) = short.captures(suffix) {
            v.stage = Stage::from_label(&c[1]);
            v.build = parse_build(&c[2], tag)?;
        } else {
            v.stage = Stage::Unknown;
        }
        Ok(v)
    }
}

impl fmt::Display for DotnetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(label) = self.stage.label() {
            write!(f, "-{label}.{}.{}", self.stage_number, join_build(&self.build))?;
        }
        Ok(())
    }
}
