use async_trait::async_trait;
use inference_coordination::fusion::top_hits;
use inference_coordination::{RankedHit, RankedRetriever, SearchQuery, SourceError};
use std::path::{Path, PathBuf};

/// Ranked list stored as a JSON array of `{doc_id, score}`.
///
/// Stands in for an index that has already answered the query.
#[derive(Debug, Clone)]
pub struct JsonFileRetriever {
    path: PathBuf,
}

impl JsonFileRetriever {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole list, in file order. The file need not be sorted.
    pub async fn load(&self) -> Result<Vec<RankedHit>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl RankedRetriever for JsonFileRetriever {
    async fn retrieve(
        &self,
        _query: &SearchQuery,
        depth: usize,
    ) -> Result<Vec<RankedHit>, SourceError> {
        Ok(top_hits(self.load().await?, depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_retrieve_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.json");
        std::fs::write(
            &path,
            r#"[{"doc_id":"d1","score":0.9},{"doc_id":"d2","score":0.8},{"doc_id":"d3","score":0.1}]"#,
        )
        .unwrap();
        let retriever = JsonFileRetriever::new(&path);

        assert_eq!(retriever.load().await.unwrap().len(), 3);
        let query = SearchQuery::new("acme", vec![0.1], "", 1);
        let hits = retriever.retrieve(&query, 2).await.unwrap();
        assert_eq!(hits, vec![RankedHit::new("d1", 0.9), RankedHit::new("d2", 0.8)]);
    }

    #[tokio::test]
    async fn test_unsorted_file_keeps_best_hits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyword.json");
        std::fs::write(
            &path,
            r#"[{"doc_id":"low","score":0.2},{"doc_id":"top","score":9.0},{"doc_id":"mid","score":4.5}]"#,
        )
        .unwrap();

        let query = SearchQuery::new("acme", Vec::new(), "renewal", 2);
        let hits = JsonFileRetriever::new(&path).retrieve(&query, 2).await.unwrap();
        assert_eq!(hits, vec![RankedHit::new("top", 9.0), RankedHit::new("mid", 4.5)]);
    }

    #[tokio::test]
    async fn test_bad_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileRetriever::new(&path).load().await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        let err = JsonFileRetriever::new(dir.path().join("missing.json"))
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }
}
