//! Index-driven partial retrieval.
//!
//! Grid archives publish one large file per (run, step, stream, type) and a
//! sidecar index listing where each parameter/level message sits inside it.
//! The fetcher reads the indexes, keeps only the records the selector asks
//! for and pulls just those byte ranges. Requested values that no index
//! mentions are reported as diagnostics rather than failures, since some
//! parameter/level combinations are legitimately absent from some runs.

pub mod error;
pub mod file;
pub mod index;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use futures_util::stream::{self, StreamExt};

pub use error::FetchError;
pub use index::{IndexRecord, NoCoverage};

use crate::remote::{self, Archive, ByteRange};
use crate::request::RequestDescriptor;
use crate::retry::RetryConfig;
use index::Coverage;

/// Knobs for one fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Read sidecar indexes and retrieve byte ranges; `false` always pulls
    /// whole files.
    pub use_index: bool,
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Directory retrieved files are written into.
    pub work_dir: PathBuf,
}

/// How a file was retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// Consolidated byte ranges selected through the index.
    Ranges(usize),
    /// The whole resource.
    Full,
}

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub mode: RetrievalMode,
    /// Index tuples satisfied by this file (empty in full-file mode).
    pub matched: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub files: Vec<FetchedFile>,
    pub no_coverage: Vec<NoCoverage>,
}

impl FetchResult {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

/// What to pull from one URL.
#[derive(Debug)]
struct RetrievalPlan {
    url: String,
    dest: PathBuf,
    ranges: Option<Vec<ByteRange>>,
    matched: Vec<BTreeMap<String, String>>,
}

pub struct IndexedPartialFetcher<'a> {
    archive: &'a dyn Archive,
    options: &'a FetchOptions,
}

impl<'a> IndexedPartialFetcher<'a> {
    pub fn new(archive: &'a dyn Archive, options: &'a FetchOptions) -> Self {
        Self { archive, options }
    }

    /// Retrieve the parts of `urls` selected by `selector`.
    ///
    /// Duplicate URLs are fetched once. An empty selector, or
    /// `use_index == false`, retrieves whole files.
    pub async fn fetch(
        &self,
        urls: &[String],
        selector: &RequestDescriptor,
    ) -> Result<FetchResult, FetchError> {
        let mut seen = HashSet::new();
        let urls: Vec<&String> = urls.iter().filter(|u| seen.insert(u.as_str())).collect();
        if urls.is_empty() {
            return Err(FetchError::EmptyRequest);
        }

        tokio::fs::create_dir_all(&self.options.work_dir)
            .await
            .map_err(FetchError::WorkDir)?;
        let dests = local_names(&urls)
            .into_iter()
            .map(|name| self.options.work_dir.join(name))
            .collect::<Vec<_>>();

        let (plans, no_coverage) = if self.options.use_index && !selector.is_empty() {
            self.plan_indexed(&urls, dests, selector).await?
        } else {
            let plans = urls
                .iter()
                .zip(dests)
                .map(|(url, dest)| RetrievalPlan {
                    url: url.to_string(),
                    dest,
                    ranges: None,
                    matched: Vec::new(),
                })
                .collect();
            (plans, Vec::new())
        };

        let files = self.retrieve(plans).await?;
        let result = FetchResult { files, no_coverage };
        tracing::info!(
            files = result.files.len(),
            bytes = result.total_bytes(),
            "Fetch complete"
        );
        Ok(result)
    }

    async fn plan_indexed(
        &self,
        urls: &[&String],
        dests: Vec<PathBuf>,
        selector: &RequestDescriptor,
    ) -> Result<(Vec<RetrievalPlan>, Vec<NoCoverage>), FetchError> {
        let indexes: Vec<(usize, Result<Option<Vec<IndexRecord>>, FetchError>)> =
            stream::iter(urls.iter().map(|u| u.to_string()).enumerate().collect::<Vec<_>>())
                .map(|(i, url): (usize, String)| async move { (i, self.read_index(&url).await) })
                .buffer_unordered(self.options.concurrency.max(1))
                .collect()
                .await;

        let mut by_position: Vec<Option<Option<Vec<IndexRecord>>>> = vec![None; urls.len()];
        for (i, result) in indexes {
            by_position[i] = Some(result?);
        }

        let mut coverage = Coverage::default();
        let mut plans = Vec::with_capacity(urls.len());
        for ((url, dest), index) in urls.iter().zip(dests).zip(by_position) {
            let Some(records) = index.flatten() else {
                tracing::info!(url = %url, "No sidecar index, retrieving whole file");
                plans.push(RetrievalPlan {
                    url: url.to_string(),
                    dest,
                    ranges: None,
                    matched: Vec::new(),
                });
                continue;
            };

            let mut ranges = Vec::new();
            let mut matched = Vec::new();
            for record in &records {
                coverage.observe(record, selector);
                if index::matches(record, selector) {
                    ranges.push(record.range);
                    matched.push(record.fields.clone());
                }
            }
            if ranges.is_empty() {
                return Err(FetchError::ResourceUnmatched {
                    url: url.to_string(),
                });
            }
            let ranges = index::consolidate(ranges);
            tracing::debug!(
                url = %url,
                records = matched.len(),
                ranges = ranges.len(),
                "Index matched"
            );
            plans.push(RetrievalPlan {
                url: url.to_string(),
                dest,
                ranges: Some(ranges),
                matched,
            });
        }

        let no_coverage = coverage.missing(selector);
        for gap in &no_coverage {
            tracing::warn!(
                dimension = %gap.dimension,
                value = %gap.value,
                available = ?coverage.observed(&gap.dimension),
                "No index entries for requested value"
            );
        }
        Ok((plans, no_coverage))
    }

    /// `Ok(None)` when the resource has no sidecar index.
    async fn read_index(&self, url: &str) -> Result<Option<Vec<IndexRecord>>, FetchError> {
        let index_url = remote::index_url_for(url);
        match remote::get_text_with_retry(self.archive, &index_url, &self.options.retry).await {
            Ok(text) => index::parse_index(&text)
                .map(Some)
                .map_err(|source| FetchError::Index {
                    url: index_url,
                    source,
                }),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(FetchError::Transport {
                url: index_url,
                source,
            }),
        }
    }

    async fn retrieve(&self, plans: Vec<RetrievalPlan>) -> Result<Vec<FetchedFile>, FetchError> {
        let archive = self.archive;
        let retry = &self.options.retry;
        let results: Vec<Result<FetchedFile, FetchError>> = stream::iter(plans)
            .map(|plan| async move {
                tracing::debug!(url = %plan.url, dest = %plan.dest.display(), "retrieving");
                let bytes = file::retrieve_to_file(
                    archive,
                    &plan.url,
                    plan.ranges.as_deref(),
                    &plan.dest,
                    retry,
                )
                .await
                .map_err(|source| FetchError::Transport {
                    url: plan.url.clone(),
                    source,
                })?;
                Ok(FetchedFile {
                    mode: match &plan.ranges {
                        Some(r) => RetrievalMode::Ranges(r.len()),
                        None => RetrievalMode::Full,
                    },
                    url: plan.url,
                    path: plan.dest,
                    bytes,
                    matched: plan.matched,
                })
            })
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }
}

/// Local file names for the URLs: the last path segment, disambiguated with
/// a numeric prefix when two URLs share one.
fn local_names(urls: &[&String]) -> Vec<String> {
    let mut used = HashSet::new();
    urls.iter()
        .enumerate()
        .map(|(i, url)| {
            let path = url.split(['?', '#']).next().unwrap_or(url);
            let base = path
                .rsplit('/')
                .find(|s| !s.is_empty())
                .unwrap_or("resource")
                .to_string();
            if used.insert(base.clone()) {
                base
            } else {
                let alt = format!("{}-{}", i, base);
                used.insert(alt.clone());
                alt
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{Call, MemoryArchive};

    const DATA: &str = "https://h/run/file.grib2";
    const INDEX: &str = "https://h/run/file.index";

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gridsync_tests").join("fetch").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn options(name: &str) -> FetchOptions {
        FetchOptions {
            use_index: true,
            concurrency: 4,
            retry: RetryConfig::immediate(1),
            work_dir: test_dir(name),
        }
    }

    /// Index with (A,1) at 0..10, (A,2) at 10..20 and (B,1) at 20..30.
    fn archive() -> MemoryArchive {
        let archive = MemoryArchive::new();
        archive.put(DATA, b"AAAAAAAAAAaaaaaaaaaaBBBBBBBBBB".to_vec());
        archive.put(
            INDEX,
            concat!(
                r#"{"param": "A", "level": "1", "_offset": 0, "_length": 10}"#,
                "\n",
                r#"{"param": "A", "level": "2", "_offset": 10, "_length": 10}"#,
                "\n",
                r#"{"param": "B", "level": "1", "_offset": 20, "_length": 10}"#,
                "\n",
            ),
        );
        archive
    }

    #[tokio::test]
    async fn test_only_selected_ranges_are_retrieved() {
        let archive = archive();
        let opts = options("selected");
        let selector =
            RequestDescriptor::new([("param", vec!["A", "B"]), ("level", vec!["1"])]).unwrap();

        let result = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&[DATA.to_string()], &selector)
            .await
            .unwrap();

        assert_eq!(
            archive.copy_calls(),
            vec![
                (DATA.to_string(), Some(ByteRange::new(0, 10))),
                (DATA.to_string(), Some(ByteRange::new(20, 10))),
            ]
        );
        let file = &result.files[0];
        assert_eq!(file.mode, RetrievalMode::Ranges(2));
        assert_eq!(file.matched.len(), 2);
        assert_eq!(
            std::fs::read(&file.path).unwrap(),
            b"AAAAAAAAAABBBBBBBBBB".to_vec()
        );
        assert!(result.no_coverage.is_empty());
    }

    #[tokio::test]
    async fn test_uncovered_value_is_a_diagnostic() {
        let archive = archive();
        let opts = options("diagnostic");
        let selector =
            RequestDescriptor::new([("param", vec!["A", "C"]), ("level", vec!["1"])]).unwrap();

        let result = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&[DATA.to_string()], &selector)
            .await
            .unwrap();

        assert_eq!(
            result.no_coverage,
            vec![NoCoverage {
                dimension: "param".into(),
                value: "C".into()
            }]
        );
        assert_eq!(
            archive.copy_calls(),
            vec![(DATA.to_string(), Some(ByteRange::new(0, 10)))]
        );
    }

    #[tokio::test]
    async fn test_no_match_for_url_is_an_error() {
        let archive = archive();
        let opts = options("unmatched");
        let selector = RequestDescriptor::new([("param", ["C"])]).unwrap();

        let err = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&[DATA.to_string()], &selector)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::ResourceUnmatched { ref url } if url == DATA));
        assert!(archive.copy_calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_url_set_is_a_request_error() {
        let archive = archive();
        let opts = options("empty");
        let err = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&[], &RequestDescriptor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyRequest));
    }

    #[tokio::test]
    async fn test_missing_index_falls_back_to_full_file() {
        let archive = MemoryArchive::new();
        archive.put("https://h/monthly/rfe2023_11.nc", b"whole-file".to_vec());
        let opts = options("full_fallback");
        let selector = RequestDescriptor::new([("param", ["rfe"])]).unwrap();

        let result = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&["https://h/monthly/rfe2023_11.nc".to_string()], &selector)
            .await
            .unwrap();

        assert_eq!(result.files[0].mode, RetrievalMode::Full);
        assert_eq!(result.files[0].bytes, 10);
        assert!(result.files[0].path.ends_with("rfe2023_11.nc"));
    }

    #[tokio::test]
    async fn test_index_disabled_skips_index_reads() {
        let archive = archive();
        let mut opts = options("no_index");
        opts.use_index = false;
        let selector = RequestDescriptor::new([("param", ["A"])]).unwrap();

        let result = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&[DATA.to_string(), DATA.to_string()], &selector)
            .await
            .unwrap();

        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].bytes, 30);
        assert!(!archive
            .calls()
            .iter()
            .any(|c| matches!(c, Call::GetText(_))));
    }

    #[tokio::test]
    async fn test_missing_data_file_is_not_found() {
        let archive = MemoryArchive::new();
        let opts = options("missing_data");
        let err = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(
                &["https://h/later.grib2".to_string()],
                &RequestDescriptor::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_malformed_index_is_reported() {
        let archive = MemoryArchive::new();
        archive.put(DATA, b"x".to_vec());
        archive.put(INDEX, "not json");
        let opts = options("malformed");
        let selector = RequestDescriptor::new([("param", ["A"])]).unwrap();

        let err = IndexedPartialFetcher::new(&archive, &opts)
            .fetch(&[DATA.to_string()], &selector)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Index { ref url, .. } if url == INDEX));
    }

    #[test]
    fn test_local_names_disambiguate() {
        let a = "https://h/a/file.grib2".to_string();
        let b = "https://h/b/file.grib2".to_string();
        let c = "https://h/c/other.grib2?token=1".to_string();
        assert_eq!(
            local_names(&[&a, &b, &c]),
            vec!["file.grib2", "1-file.grib2", "other.grib2"]
        );
    }
}
