use std::fmt;
use std::str::FromStr;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

pub fn default_wp_cli() -> String {
    "wp".into()
}

/// A WordPress install reachable over ssh.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    name: String,
    host: String,
    user: String,
    path: String,
    url: String,
    #[serde(default = "self::default_wp_cli")]
    wp_cli: String,
}

impl Site {
    pub fn new<S: Into<String>>(name: S, host: S, user: S, path: S, url: S) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: user.into(),
            path: path.into(),
            url: url.into(),
            wp_cli: default_wp_cli(),
        }
    }

    pub fn with_wp_cli<S: Into<String>>(mut self, wp_cli: S) -> Self {
        self.wp_cli = wp_cli.into();
        self
    }

    /// The `user@host` destination handed to ssh and scp.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Where a plugin archive comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Fetched by the remote host itself.
    Url,
    /// A local archive staged to the remote host with scp first.
    File,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Url => "url",
            SourceType::File => "file",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" => Ok(SourceType::Url),
            "file" => Ok(SourceType::File),
            other => Err(format!("unknown source type `{other}` (expected `url` or `file`)")),
        }
    }
}

/// One plugin update to roll out.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    slug: String,
    zip_source: String,
    source_type: SourceType,
    activate: bool,
}

impl Plugin {
    pub fn new<S: Into<String>>(slug: S, zip_source: S, source_type: SourceType) -> Self {
        Self {
            slug: slug.into(),
            zip_source: zip_source.into(),
            source_type,
            activate: false,
        }
    }

    pub fn with_activate(mut self, activate: bool) -> Self {
        self.activate = activate;
        self
    }

    /// The archive source with any URL query string hidden, for logs and
    /// dry-run output.
    pub fn redacted_source(&self) -> String {
        redact_url(&self.zip_source)
    }
}

/// Text flags are true only when they read `true`, ignoring case.
pub fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

/// Replace a URL's query string (and anything after it) with `?[REDACTED]`.
/// Signed download links carry their credentials there.
pub fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, rest)) => {
            let query = rest.split('#').next().unwrap_or_default();
            if query.is_empty() {
                url.to_string()
            } else {
                format!("{base}?[REDACTED]")
            }
        }
        None => url.to_string(),
    }
}
