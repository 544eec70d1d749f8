//! Loading sites (YAML inventory) and plugin updates (CSV job file) into
//! typed records. Every problem found in a file is collected and reported in
//! one [`LoadError::InvalidRecords`] rather than stopping at the first.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use super::site::{parse_flag, Plugin, Site, SourceType};
use crate::log::*;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{kind} file not found: {}", .path.display())]
    NotFound { kind: &'static str, path: PathBuf },
    #[error("failed reading {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sites file {} is not a YAML list of site definitions", .path.display())]
    MalformedYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("plugins file {} is not valid CSV", .path.display())]
    MalformedCsv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{} has {} invalid record(s):\n{}", .path.display(), .errors.len(), RecordErrors(.errors))]
    InvalidRecords {
        path: PathBuf,
        errors: Vec<RecordError>,
    },
}

/// One problem with one record. `index` is zero-based for YAML entries and
/// the 1-based data row for CSV files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub index: usize,
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: `{}` {}", self.index, self.field, self.reason)
    }
}

struct RecordErrors<'a>(&'a [RecordError]);

impl fmt::Display for RecordErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for error in self.0 {
            writeln!(f, "  - {error}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSite {
    name: Option<String>,
    host: Option<String>,
    user: Option<String>,
    path: Option<String>,
    url: Option<String>,
    wp_cli: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPlugin {
    plugin_slug: Option<String>,
    zip_source: Option<String>,
    #[serde(rename = "type")]
    source_type: Option<String>,
    activate: Option<String>,
}

fn required(
    value: Option<String>,
    index: usize,
    field: &'static str,
    errors: &mut Vec<RecordError>,
) -> String {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v,
        _ => {
            errors.push(RecordError {
                index,
                field,
                reason: "is missing".into(),
            });
            String::new()
        }
    }
}

fn read(kind: &'static str, path: &Path) -> Result<String, LoadError> {
    if !path.is_file() {
        return Err(LoadError::NotFound {
            kind,
            path: path.to_path_buf(),
        });
    }
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the site inventory from a YAML list.
#[tracing::instrument]
pub fn load_sites(path: &Path) -> Result<Vec<Site>, LoadError> {
    let content = read("sites", path)?;
    parse_sites(&content).map_err(|e| match e {
        ParseFailure::Malformed(source) => LoadError::MalformedYaml {
            path: path.to_path_buf(),
            source,
        },
        ParseFailure::Invalid(errors) => LoadError::InvalidRecords {
            path: path.to_path_buf(),
            errors,
        },
    })
}

/// Load the plugin job from a CSV file with a header row.
#[tracing::instrument]
pub fn load_plugins(path: &Path) -> Result<Vec<Plugin>, LoadError> {
    let content = read("plugins", path)?;
    parse_plugins(&content).map_err(|e| match e {
        ParseFailure::Malformed(source) => LoadError::MalformedCsv {
            path: path.to_path_buf(),
            source,
        },
        ParseFailure::Invalid(errors) => LoadError::InvalidRecords {
            path: path.to_path_buf(),
            errors,
        },
    })
}

enum ParseFailure<E> {
    Malformed(E),
    Invalid(Vec<RecordError>),
}

fn parse_sites(content: &str) -> Result<Vec<Site>, ParseFailure<serde_yaml::Error>> {
    // An empty document is an empty inventory. Entries are decoded one by
    // one so a bad field is reported against its record.
    let raw: Option<Vec<serde_yaml::Value>> =
        serde_yaml::from_str(content).map_err(ParseFailure::Malformed)?;
    let raw = raw.unwrap_or_default();

    let mut errors = vec![];
    let mut sites = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        let entry: RawSite = match serde_yaml::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(RecordError {
                    index,
                    field: "entry",
                    reason: format!("is invalid: {e}"),
                });
                continue;
            }
        };
        let name = required(entry.name, index, "name", &mut errors);
        let host = required(entry.host, index, "host", &mut errors);
        let user = required(entry.user, index, "user", &mut errors);
        let path = required(entry.path, index, "path", &mut errors);
        let url = required(entry.url, index, "url", &mut errors);
        let mut site = Site::new(name, host, user, path, url);
        if let Some(wp_cli) = entry.wp_cli.filter(|w| !w.trim().is_empty()) {
            site = site.with_wp_cli(wp_cli.trim());
        }
        sites.push(site);
    }

    if errors.is_empty() {
        debug!("loaded {} site(s)", sites.len());
        Ok(sites)
    } else {
        Err(ParseFailure::Invalid(errors))
    }
}

fn parse_plugins(content: &str) -> Result<Vec<Plugin>, ParseFailure<csv::Error>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut errors = vec![];
    let mut plugins = vec![];
    for (offset, row) in reader.deserialize::<RawPlugin>().enumerate() {
        let index = offset + 1;
        let entry = row.map_err(ParseFailure::Malformed)?;
        let slug = required(entry.plugin_slug, index, "plugin_slug", &mut errors);
        let zip_source = required(entry.zip_source, index, "zip_source", &mut errors);
        let raw_type = required(entry.source_type, index, "type", &mut errors);
        let activate = entry.activate.as_deref().map(parse_flag).unwrap_or(false);

        if raw_type.is_empty() {
            continue;
        }
        match raw_type.parse::<SourceType>() {
            Ok(source_type) => {
                plugins.push(Plugin::new(slug, zip_source, source_type).with_activate(activate))
            }
            Err(reason) => errors.push(RecordError {
                index,
                field: "type",
                reason,
            }),
        }
    }

    if errors.is_empty() {
        debug!("loaded {} plugin(s)", plugins.len());
        Ok(plugins)
    } else {
        Err(ParseFailure::Invalid(errors))
    }
}

/// Site names that occur more than once. Uniqueness is the inventory
/// editor's job; this only lets `validate` point it out.
pub fn duplicate_site_names(sites: &[Site]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for site in sites {
        *seen.entry(site.name().as_str()).or_default() += 1;
    }
    let mut duplicates: Vec<String> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect();
    duplicates.sort();
    duplicates
}
