//! Request flow shared by the HTTP layer and the CLI: validate, consult the
//! cache, orchestrate, store.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{ResponseCache, cache_key};
use crate::error::FetchError;
use crate::orchestrator::{ExtractionMode, ExtractionRequest, ExtractionResult, Orchestrator};
use crate::platform::validate_url;

pub struct VideoService {
    orchestrator: Arc<Orchestrator>,
    cache: Arc<ResponseCache>,
}

fn endpoint_name(mode: ExtractionMode) -> &'static str {
    match mode {
        ExtractionMode::Info => "get_info",
        ExtractionMode::Download => "download",
        ExtractionMode::Fast => "fast_download",
    }
}

impl VideoService {
    pub fn new(orchestrator: Arc<Orchestrator>, cache: Arc<ResponseCache>) -> Self {
        Self {
            orchestrator,
            cache,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub async fn get_info(&self, url: &str) -> Result<ExtractionResult, FetchError> {
        self.execute(url, ExtractionMode::Info).await
    }

    pub async fn download(&self, url: &str) -> Result<ExtractionResult, FetchError> {
        self.execute(url, ExtractionMode::Download).await
    }

    pub async fn fast_download(&self, url: &str) -> Result<ExtractionResult, FetchError> {
        self.execute(url, ExtractionMode::Fast).await
    }

    pub fn clear_cache(&self) -> Result<usize, FetchError> {
        let removed = self.cache.clear()?;
        info!(removed, "cleared response cache");
        Ok(removed)
    }

    async fn execute(&self, url: &str, mode: ExtractionMode) -> Result<ExtractionResult, FetchError> {
        let url = url.trim();
        let platform = validate_url(url)?;
        let key = cache_key(endpoint_name(mode), &[url]);

        if let Some(value) = self.cache.get(&key) {
            match serde_json::from_value::<ExtractionResult>(value) {
                Ok(cached) if cached_file_present(&cached) => {
                    info!(url, %platform, ?mode, "serving cached result");
                    return Ok(cached);
                }
                Ok(_) => debug!(url, "cached download no longer on disk"),
                Err(err) => debug!(url, error = %err, "ignoring unreadable cached result"),
            }
        }

        let request = ExtractionRequest::new(url, platform, mode);
        let outcome = self.orchestrator.run(&request).await;
        debug!(url, attempts = outcome.attempts.len(), "orchestration finished");
        let result = outcome.result?;
        match serde_json::to_value(&result) {
            Ok(value) => {
                self.cache.set(&key, &value);
            }
            Err(err) => debug!(url, error = %err, "result not cacheable"),
        }
        Ok(result)
    }
}

fn cached_file_present(result: &ExtractionResult) -> bool {
    result
        .local_file_path
        .as_ref()
        .is_none_or(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorTuning;
    use crate::orchestrator::VideoDetails;
    use crate::orchestrator::tests::{FakeExtractor, Scripted, memory_credentials};
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tempfile::tempdir;

    const INFO_JSON: &str = r#"{"title":"Clip","uploader":"creator","duration":3,"description":"d"}"#;

    fn service(extractor: Arc<FakeExtractor>, root: &std::path::Path, cache_enabled: bool) -> VideoService {
        let orchestrator = Orchestrator::new(
            extractor,
            None,
            memory_credentials(),
            root,
            OrchestratorTuning::default(),
        );
        let cache = ResponseCache::new(
            Arc::new(MemoryStorage::new()),
            Duration::from_secs(3600),
            cache_enabled,
        );
        VideoService::new(Arc::new(orchestrator), Arc::new(cache))
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let service = service(extractor.clone(), dir.path(), true);
        let first = service.get_info("https://youtu.be/abc").await.unwrap();
        let second = service.get_info(" https://youtu.be/abc ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(extractor.call_count(), 1);

        // Different endpoint, different key.
        service.download("https://youtu.be/abc").await.unwrap();
        assert_eq!(extractor.call_count(), 2);
    }

    #[tokio::test]
    async fn disabled_cache_gives_same_outcome() {
        let dir = tempdir().unwrap();
        let cached = service(FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]), dir.path(), true);
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let uncached = service(extractor.clone(), dir.path(), false);
        let url = "https://youtu.be/abc";
        let expected = cached.get_info(url).await.unwrap();
        assert_eq!(uncached.get_info(url).await.unwrap(), expected);
        assert_eq!(uncached.get_info(url).await.unwrap(), expected);
        assert_eq!(extractor.call_count(), 2);
    }

    #[tokio::test]
    async fn invalid_urls_never_reach_the_extractor() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let service = service(extractor.clone(), dir.path(), true);
        assert_eq!(service.get_info("").await.unwrap_err().kind(), "INVALID_URL");
        assert_eq!(
            service.get_info("https://vimeo.com/1").await.unwrap_err().kind(),
            "UNSUPPORTED_PLATFORM"
        );
        assert_eq!(extractor.call_count(), 0);
    }

    #[tokio::test]
    async fn cached_download_with_missing_file_is_a_miss() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let service = service(extractor.clone(), dir.path(), true);
        let url = "https://www.tiktok.com/@a/video/1";
        let first = service.download(url).await.unwrap();
        let VideoDetails::Downloaded(video) = &first.video_info else { panic!("expected download") };
        std::fs::remove_file(&video.local_path).unwrap();

        let second = service.download(url).await.unwrap();
        assert_eq!(extractor.call_count(), 2);
        assert!(second.local_file_path.unwrap().is_file());
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: boom"), Scripted::Ok(INFO_JSON)]);
        let service = service(extractor.clone(), dir.path(), true);
        let url = "https://youtu.be/abc";
        assert_eq!(service.get_info(url).await.unwrap_err().kind(), "EXTRACTION_FAILED");
        assert!(service.get_info(url).await.is_ok());
        assert_eq!(extractor.call_count(), 2);
        assert_eq!(service.clear_cache().unwrap(), 1);
    }
}
