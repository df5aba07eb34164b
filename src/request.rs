//! Request descriptors, archive URL templates and the resource keys they
//! expand into.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::version::Version;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Dimension '{0}' has no values")]
    EmptyDimension(String),

    #[error("Dimension '{0}' is declared twice")]
    DuplicateDimension(String),

    #[error("Dimension '{name}' has an unsupported value: {value}")]
    UnsupportedValue { name: String, value: String },

    #[error("URL template placeholder '{{{0}}}' has no value")]
    UnboundPlaceholder(String),

    #[error("URL template is malformed: {0}")]
    MalformedTemplate(String),
}

/// One axis of a request (stream, type, step, param, levelist, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<String>,
}

/// Immutable set of named dimensions, each with an ordered, non-empty list
/// of discrete values.
///
/// Values are kept as strings so that `3`, `"3"` and the `"3"` found in a
/// sidecar index compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "serde_json::Map<String, Value>")]
pub struct RequestDescriptor {
    dimensions: Vec<Dimension>,
}

impl RequestDescriptor {
    pub fn new<I, N, V, S>(dimensions: I) -> Result<Self, RequestError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (name, values) in dimensions {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(RequestError::DuplicateDimension(name));
            }
            let mut deduped: Vec<String> = Vec::new();
            for v in values {
                let v = v.into();
                if !deduped.contains(&v) {
                    deduped.push(v);
                }
            }
            if deduped.is_empty() {
                return Err(RequestError::EmptyDimension(name));
            }
            out.push(Dimension {
                name,
                values: deduped,
            });
        }
        Ok(Self { dimensions: out })
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    #[cfg(test)]
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.values.as_slice())
    }

    /// Every point of the cartesian product, in declaration order.
    pub fn combinations(&self) -> Vec<BTreeMap<String, String>> {
        let mut acc: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
        for dim in &self.dimensions {
            let mut next = Vec::with_capacity(acc.len() * dim.values.len());
            for partial in &acc {
                for value in &dim.values {
                    let mut point = partial.clone();
                    point.insert(dim.name.clone(), value.clone());
                    next.push(point);
                }
            }
            acc = next;
        }
        acc
    }

    /// Split into the dimensions that address files (referenced by the URL
    /// template) and the remainder, which select records inside a file's
    /// sidecar index.
    pub fn split(&self, template: &UrlTemplate) -> (RequestDescriptor, RequestDescriptor) {
        let (for_urls, for_index): (Vec<_>, Vec<_>) = self
            .dimensions
            .iter()
            .cloned()
            .partition(|d| template.references(&d.name));
        (
            RequestDescriptor {
                dimensions: for_urls,
            },
            RequestDescriptor {
                dimensions: for_index,
            },
        )
    }
}

impl TryFrom<serde_json::Map<String, Value>> for RequestDescriptor {
    type Error = RequestError;

    fn try_from(map: serde_json::Map<String, Value>) -> Result<Self, Self::Error> {
        let mut dims = Vec::with_capacity(map.len());
        for (name, value) in map {
            let values = match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(|v| scalar_to_string(&name, v))
                    .collect::<Result<Vec<_>, _>>()?,
                other => vec![scalar_to_string(&name, other)?],
            };
            dims.push((name, values));
        }
        RequestDescriptor::new(dims)
    }
}

fn scalar_to_string(name: &str, value: Value) -> Result<String, RequestError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(RequestError::UnsupportedValue {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Archive URL pattern with `{name}` placeholders.
///
/// Placeholders resolve against the resource's dimension values and the
/// derived fields `_url`, `_extension`, `_stream` and the version's date
/// parts (`_yyyymmdd`, `_H`, `_yyyymmddHHMMSS`, `_yyyy`, `_mm`, `_dd`, `_HHMM`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    pattern: String,
    placeholders: Vec<String>,
}

impl UrlTemplate {
    pub fn parse(pattern: &str) -> Result<Self, RequestError> {
        let mut placeholders = Vec::new();
        let mut rest = pattern;
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or_else(|| RequestError::MalformedTemplate(pattern.to_string()))?;
            let name = &after[..end];
            if name.is_empty() || name.contains('{') {
                return Err(RequestError::MalformedTemplate(pattern.to_string()));
            }
            if !placeholders.iter().any(|p| p == name) {
                placeholders.push(name.to_string());
            }
            rest = &after[end + 1..];
        }
        if rest.contains('}') {
            return Err(RequestError::MalformedTemplate(pattern.to_string()));
        }
        Ok(Self {
            pattern: pattern.to_string(),
            placeholders,
        })
    }

    pub fn references(&self, name: &str) -> bool {
        self.placeholders.iter().any(|p| p == name)
            || (name == "stream" && self.placeholders.iter().any(|p| p == "_stream"))
            || (name == "type" && self.placeholders.iter().any(|p| p == "_extension"))
    }

    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<String, RequestError> {
        let mut out = self.pattern.clone();
        for name in &self.placeholders {
            let value = vars
                .get(name)
                .ok_or_else(|| RequestError::UnboundPlaceholder(name.clone()))?;
            out = out.replace(&format!("{{{}}}", name), value);
        }
        Ok(out)
    }
}

/// One concrete file: a full assignment of the URL dimensions plus a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub version: Version,
    pub dimensions: BTreeMap<String, String>,
    pub url: String,
}

/// Where a dataset's files live and how their URLs are spelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub base_url: String,
    pub template: UrlTemplate,
}

impl ArchiveLayout {
    pub fn new(base_url: impl Into<String>, template: UrlTemplate) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            template,
        }
    }

    /// Expand the URL dimensions for `version` into resource keys, dropping
    /// combinations that render to an already-seen URL.
    pub fn resource_keys(
        &self,
        url_dimensions: &RequestDescriptor,
        version: Version,
    ) -> Result<Vec<ResourceKey>, RequestError> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for point in url_dimensions.combinations() {
            let vars = self.template_vars(&point, version);
            let url = self.template.render(&vars)?;
            if seen.insert(url.clone()) {
                keys.push(ResourceKey {
                    version,
                    dimensions: point,
                    url,
                });
            }
        }
        Ok(keys)
    }

    fn template_vars(
        &self,
        point: &BTreeMap<String, String>,
        version: Version,
    ) -> BTreeMap<String, String> {
        let mut vars = point.clone();
        for (k, v) in version.template_parts() {
            vars.insert(k.to_string(), v);
        }
        vars.insert("_url".to_string(), self.base_url.clone());
        let extension = match point.get("type").map(String::as_str) {
            Some("tf") => "bufr",
            _ => "grib2",
        };
        vars.insert("_extension".to_string(), extension.to_string());
        if let Some(stream) = point.get("stream") {
            vars.insert("_stream".to_string(), off_cycle_stream(stream, version));
        }
        vars
    }
}

/// The 06/18 UTC runs of the deterministic and wave streams are published
/// under their short-cutoff names.
fn off_cycle_stream(stream: &str, version: Version) -> String {
    let hour = version.as_datetime().format("%H").to_string();
    match (stream, hour.as_str()) {
        ("oper", "06" | "18") => "scda".to_string(),
        ("wave", "06" | "18") => "scwv".to_string(),
        _ => stream.to_string(),
    }
}
