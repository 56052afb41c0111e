/// Storage module for persisting analysis artifacts
///
/// Every artifact category is written to its own configurable location:
/// - Local directories (`file://` URIs or bare paths)
/// - S3-compatible object storage (`s3://bucket/prefix`)
///
/// Objects are named `<ecosystem>/<name>/<version>.<ext>` inside the location.

pub mod local;
pub mod s3_client;

pub use local::LocalResultStore;
pub use s3_client::{S3Config, S3ResultStore};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::error::StorageError;
use crate::models::{AnalysisResult, Package};

/// Kinds of artifact a run produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactCategory {
    DynamicAnalysis,
    ExecutionLog,
    FileWrites,
    AnalyzedPackage,
}

impl ArtifactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactCategory::DynamicAnalysis => "dynamic_analysis",
            ArtifactCategory::ExecutionLog => "execution_log",
            ArtifactCategory::FileWrites => "file_writes",
            ArtifactCategory::AnalyzedPackage => "analyzed_package",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactCategory::DynamicAnalysis | ArtifactCategory::FileWrites => "application/json",
            ArtifactCategory::ExecutionLog => "text/plain; charset=utf-8",
            ArtifactCategory::AnalyzedPackage => "application/octet-stream",
        }
    }
}

impl fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object name of an artifact, relative to the store location.
///
/// Analyzed packages keep their archive file name under a version directory.
pub fn object_name(category: ArtifactCategory, package: &Package) -> String {
    let base = format!(
        "{}/{}/{}",
        package.ecosystem.as_str(),
        package.storage_name(),
        package.storage_version()
    );
    match category {
        ArtifactCategory::DynamicAnalysis | ArtifactCategory::FileWrites => format!("{}.json", base),
        ArtifactCategory::ExecutionLog => format!("{}.log", base),
        ArtifactCategory::AnalyzedPackage => {
            let file_name = package
                .local_path
                .as_ref()
                .and_then(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "package".to_string());
            format!("{}/{}", base, file_name)
        }
    }
}

/// Destination for analysis artifacts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Save `data` for `package`, returning the location it was written to
    async fn save(&self, category: ArtifactCategory, package: &Package, data: Bytes) -> Result<String, StorageError>;
}

/// Open the store for a location URI
pub async fn open_store(uri: &str) -> Result<Arc<dyn ResultStore>, StorageError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(StorageError::InvalidLocation(uri.to_string()));
    }

    let url = match Url::parse(uri) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Ok(Arc::new(LocalResultStore::new(PathBuf::from(uri))));
        }
        Err(_) => return Err(StorageError::InvalidLocation(uri.to_string())),
    };

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| StorageError::InvalidLocation(uri.to_string()))?;
            Ok(Arc::new(LocalResultStore::new(path)))
        }
        "s3" => {
            let bucket = url
                .host_str()
                .filter(|bucket| !bucket.is_empty())
                .ok_or_else(|| StorageError::InvalidLocation(uri.to_string()))?;
            let config = S3Config::from_env(bucket, url.path().trim_matches('/'));
            Ok(Arc::new(S3ResultStore::new(config).await))
        }
        other => Err(StorageError::UnsupportedScheme(other.to_string())),
    }
}

/// Configured destination per artifact category; `None` skips the category
#[derive(Clone, Default)]
pub struct ResultStores {
    pub dynamic_analysis: Option<Arc<dyn ResultStore>>,
    pub execution_log: Option<Arc<dyn ResultStore>>,
    pub file_writes: Option<Arc<dyn ResultStore>>,
    pub analyzed_package: Option<Arc<dyn ResultStore>>,
}

impl ResultStores {
    pub fn is_empty(&self) -> bool {
        self.dynamic_analysis.is_none()
            && self.execution_log.is_none()
            && self.file_writes.is_none()
            && self.analyzed_package.is_none()
    }
}

/// Save every configured artifact of a run, uploading categories concurrently.
///
/// A failing category does not stop the others; all failures are logged and
/// the first one is returned.
pub async fn save_dynamic_analysis(
    stores: &ResultStores,
    result: &AnalysisResult,
    package: &Package,
) -> Result<(), StorageError> {
    let mut first_error: Option<StorageError> = None;

    let mut uploads: Vec<(ArtifactCategory, &Arc<dyn ResultStore>, Result<Bytes, StorageError>)> = Vec::new();

    if let Some(store) = &stores.dynamic_analysis {
        let data = result.to_json().map(Bytes::from).map_err(StorageError::from);
        uploads.push((ArtifactCategory::DynamicAnalysis, store, data));
    }
    if let Some(store) = &stores.execution_log {
        uploads.push((ArtifactCategory::ExecutionLog, store, Ok(Bytes::from(result.execution_log()))));
    }
    if let Some(store) = &stores.file_writes {
        let data = serde_json::to_vec_pretty(&result.file_writes)
            .map(Bytes::from)
            .map_err(StorageError::from);
        uploads.push((ArtifactCategory::FileWrites, store, data));
    }
    if let (Some(store), Some(path)) = (&stores.analyzed_package, &package.local_path) {
        let data = tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|source| StorageError::Io {
                path: path.display().to_string(),
                source,
            });
        uploads.push((ArtifactCategory::AnalyzedPackage, store, data));
    }

    let saves = uploads.into_iter().map(|(category, store, data)| async move {
        let outcome = match data {
            Ok(data) => store.save(category, package, data).await,
            Err(e) => Err(e),
        };
        (category, outcome)
    });

    // Results come back in category order, so the first error is stable
    for (category, outcome) in join_all(saves).await {
        match outcome {
            Ok(location) => info!(category = %category, package = %package, "Saved artifact to {}", location),
            Err(e) => {
                error!(category = %category, package = %package, "Failed to save artifact: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Ecosystem, Phase, PhaseOutcome, RunStatus};
    use chrono::Utc;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn result_for(package: &Package) -> AnalysisResult {
        AnalysisResult {
            run_id: Uuid::new_v4(),
            package: package.clone(),
            sandbox_backend: "docker".to_string(),
            phases: Phase::ALL.iter().map(|p| PhaseOutcome::skipped(*p)).collect(),
            last_run_phase: None,
            last_status: RunStatus::Failed,
            syscalls: BTreeMap::new(),
            commands: Vec::new(),
            file_writes: Vec::new(),
            network: None,
            dns: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_object_names() {
        let pkg = Package::new(Ecosystem::Npm, "@babel/core", "7.0.0");
        assert_eq!(object_name(ArtifactCategory::DynamicAnalysis, &pkg), "npm/@babel_core/7.0.0.json");
        assert_eq!(object_name(ArtifactCategory::ExecutionLog, &pkg), "npm/@babel_core/7.0.0.log");

        let local = Package::new(Ecosystem::PyPI, "requests", "2.31.0").with_local_path("/tmp/requests-2.31.0.tar.gz");
        assert_eq!(
            object_name(ArtifactCategory::AnalyzedPackage, &local),
            "pypi/requests/2.31.0/requests-2.31.0.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_open_store_selects_backend_by_scheme() {
        assert!(open_store("/var/lib/results").await.is_ok());
        assert!(open_store("file:///var/lib/results").await.is_ok());
        assert!(matches!(
            open_store("gs://bucket/results").await,
            Err(StorageError::UnsupportedScheme(scheme)) if scheme == "gs"
        ));
        assert!(matches!(open_store("  ").await, Err(StorageError::InvalidLocation(_))));
    }

    #[tokio::test]
    async fn test_save_continues_past_failures() {
        let pkg = Package::new(Ecosystem::Npm, "lodash", "4.17.21");
        let result = result_for(&pkg);

        let mut failing = MockResultStore::new();
        failing
            .expect_save()
            .with(eq(ArtifactCategory::DynamicAnalysis), eq(pkg.clone()), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _| Err(StorageError::UploadError("bucket unavailable".to_string())));

        let mut working = MockResultStore::new();
        working
            .expect_save()
            .times(2)
            .returning(|category, package, _| Ok(object_name(category, package)));

        let working: Arc<dyn ResultStore> = Arc::new(working);
        let stores = ResultStores {
            dynamic_analysis: Some(Arc::new(failing)),
            execution_log: Some(Arc::clone(&working)),
            file_writes: Some(working),
            analyzed_package: None,
        };

        let err = save_dynamic_analysis(&stores, &result, &pkg).await.unwrap_err();
        assert!(matches!(err, StorageError::UploadError(_)));
    }

    #[tokio::test]
    async fn test_nothing_configured_is_ok() {
        let pkg = Package::new(Ecosystem::Npm, "lodash", "4.17.21");
        let stores = ResultStores::default();
        assert!(stores.is_empty());
        assert!(save_dynamic_analysis(&stores, &result_for(&pkg), &pkg).await.is_ok());
    }
}
