use async_trait::async_trait;
use inference_coordination::{DocumentContent, DocumentSource, SourceError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 2] = ["txt", "md"];

/// Document source reading `{root}/{org}/{doc}.txt` or `.md`.
#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Ids become path segments, so they must not escape the root.
fn safe_segment(raw: &str) -> bool {
    !raw.is_empty()
        && !raw.starts_with('.')
        && !raw.contains(['/', '\\', '\0'])
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn get_document(
        &self,
        org_id: &str,
        doc_id: &str,
    ) -> Result<DocumentContent, SourceError> {
        let not_found = || SourceError::NotFound {
            org_id: org_id.to_string(),
            doc_id: doc_id.to_string(),
        };
        if !safe_segment(org_id) || !safe_segment(doc_id) {
            return Err(not_found());
        }

        let dir = self.root.join(org_id);
        for ext in EXTENSIONS {
            let path = dir.join(format!("{}.{}", doc_id, ext));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => return Ok(DocumentContent::new(content)),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SourceError::Unavailable(format!(
                        "{}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Err(not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_coordination::content_hash;

    fn root_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, body) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_reads_txt_then_md() {
        let dir = root_with(&[("acme/memo.txt", "plain"), ("acme/notes.md", "# Notes")]);
        let source = FsDocumentSource::new(dir.path());

        let memo = source.get_document("acme", "memo").await.unwrap();
        assert_eq!(&*memo.content, "plain");
        assert_eq!(memo.content_hash, content_hash(b"plain"));

        let notes = source.get_document("acme", "notes").await.unwrap();
        assert_eq!(&*notes.content, "# Notes");
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let dir = root_with(&[("acme/memo.txt", "plain")]);
        let source = FsDocumentSource::new(dir.path());
        let err = source.get_document("globex", "memo").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = root_with(&[("secret.txt", "nope")]);
        let source = FsDocumentSource::new(dir.path().join("orgs"));
        for (org, doc) in [("..", "secret"), ("acme", "../secret"), ("", "memo")] {
            assert!(source.get_document(org, doc).await.is_err(), "{}/{}", org, doc);
        }
    }
}
