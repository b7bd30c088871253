//! Hit source abstractions for export operations
//!
//! A hit source turns a target (a fact, or a raw query against named
//! indices) into a stream of hit batches. The pipeline drains one stream
//! fully before opening the next.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::debug;

use crate::error::{Result, SourceError};

use super::job::{ExtraParams, FactRef};
use super::transform::{Hit, lookup_path};

/// One unit of iteration for a hit source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceTarget {
    /// A named fact
    Fact(FactRef),
    /// A raw request against one or more indices
    Custom {
        indices: Vec<String>,
        request: Value,
        connection: String,
    },
}

impl SourceTarget {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            SourceTarget::Fact(fact) => format!("fact {} ({})", fact.name, fact.id),
            SourceTarget::Custom {
                indices,
                connection,
                ..
            } => format!("custom query on [{}]@{}", indices.join(","), connection),
        }
    }
}

/// Trait for data backends that can be exported
#[async_trait]
pub trait HitSource: Send + Sync {
    /// Open a stream over one target
    ///
    /// # Arguments
    /// * `target` - Fact or custom query to iterate
    /// * `extra` - Additional equality filters applied to every hit
    async fn open(&self, target: &SourceTarget, extra: &ExtraParams) -> Result<Box<dyn HitStream>>;
}

/// Trait for streaming hits in batches
#[async_trait]
pub trait HitStream: Send {
    /// Fetch the next batch of at most `max` hits
    ///
    /// # Returns
    /// * `Result<Option<Vec<Hit>>>` - Next batch, or None if exhausted
    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<Hit>>>;

    /// Close the stream and release resources
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Equality filter built from a custom request and extra params
#[derive(Debug, Clone, Default)]
struct HitFilter {
    terms: Vec<(String, Value)>,
}

impl HitFilter {
    fn new(request: Option<&Value>, extra: &ExtraParams) -> Self {
        let mut terms: Vec<(String, Value)> = request
            .and_then(Value::as_object)
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        terms.extend(extra.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))));
        Self { terms }
    }

    fn matches(&self, hit: &Hit) -> bool {
        self.terms.iter().all(|(path, expected)| {
            lookup_path(hit, path).is_some_and(|actual| value_matches(actual, expected))
        })
    }
}

/// Strings from the command line compare against numbers and booleans by
/// their rendered form
fn value_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(n), Value::String(s)) => n.to_string() == *s,
        (Value::Bool(b), Value::String(s)) => b.to_string() == *s,
        (Value::Array(items), _) => items.iter().any(|item| value_matches(item, expected)),
        _ => false,
    }
}

/// In-memory hit source keyed by fact name or index name
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    sets: HashMap<String, Vec<Hit>>,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Register hits under a fact or index name
    pub fn with_set(mut self, name: impl Into<String>, hits: Vec<Hit>) -> Self {
        self.sets.insert(name.into(), hits);
        self
    }

    fn set(&self, name: &str) -> Result<&Vec<Hit>> {
        self.sets
            .get(name)
            .ok_or_else(|| SourceError::NotFound(name.to_string()).into())
    }
}

#[async_trait]
impl HitSource for MemorySource {
    async fn open(&self, target: &SourceTarget, extra: &ExtraParams) -> Result<Box<dyn HitStream>> {
        let (names, filter) = match target {
            SourceTarget::Fact(fact) => (vec![fact.name.as_str()], HitFilter::new(None, extra)),
            SourceTarget::Custom {
                indices, request, ..
            } => (
                indices.iter().map(String::as_str).collect(),
                HitFilter::new(Some(request), extra),
            ),
        };

        let mut hits = VecDeque::new();
        for name in names {
            hits.extend(self.set(name)?.iter().filter(|h| filter.matches(h)).cloned());
        }
        Ok(Box::new(MemoryStream { hits }))
    }
}

struct MemoryStream {
    hits: VecDeque<Hit>,
}

#[async_trait]
impl HitStream for MemoryStream {
    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<Hit>>> {
        if self.hits.is_empty() {
            return Ok(None);
        }
        let take = max.max(1).min(self.hits.len());
        Ok(Some(self.hits.drain(..take).collect()))
    }
}

/// Hit source reading `<data_dir>/<name>.jsonl` files, one JSON object per line
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    data_dir: PathBuf,
}

impl JsonLinesSource {
    /// Create a source rooted at `data_dir`
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(SourceError::NotFound(name.to_string()).into());
        }
        let path = self.data_dir.join(format!("{name}.jsonl"));
        if !path.is_file() {
            return Err(SourceError::NotFound(path.display().to_string()).into());
        }
        Ok(path)
    }
}

#[async_trait]
impl HitSource for JsonLinesSource {
    async fn open(&self, target: &SourceTarget, extra: &ExtraParams) -> Result<Box<dyn HitStream>> {
        let (files, filter) = match target {
            SourceTarget::Fact(fact) => (
                vec![self.path_for(&fact.name)?],
                HitFilter::new(None, extra),
            ),
            SourceTarget::Custom {
                indices, request, ..
            } => (
                indices
                    .iter()
                    .map(|index| self.path_for(index))
                    .collect::<Result<Vec<_>>>()?,
                HitFilter::new(Some(request), extra),
            ),
        };

        debug!("Opening {} ({} file(s))", target.describe(), files.len());

        Ok(Box::new(JsonLinesStream {
            files: files.into(),
            current: None,
            filter,
            line_no: 0,
        }))
    }
}

struct JsonLinesStream {
    files: VecDeque<PathBuf>,
    current: Option<(PathBuf, Lines<BufReader<File>>)>,
    filter: HitFilter,
    line_no: usize,
}

impl JsonLinesStream {
    async fn open_next(&mut self) -> Result<bool> {
        let Some(path) = self.files.pop_front() else {
            return Ok(false);
        };
        let file = File::open(&path)
            .await
            .map_err(|e| SourceError::Read(format!("{}: {}", path.display(), e)))?;
        self.current = Some((path, BufReader::new(file).lines()));
        self.line_no = 0;
        Ok(true)
    }

    fn decode(path: &Path, line_no: usize, line: &str) -> Result<Hit> {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(hit)) => Ok(hit),
            Ok(_) => Err(SourceError::Decode(format!(
                "{}:{}: expected a JSON object",
                path.display(),
                line_no
            ))
            .into()),
            Err(e) => {
                Err(SourceError::Decode(format!("{}:{}: {}", path.display(), line_no, e)).into())
            }
        }
    }
}

#[async_trait]
impl HitStream for JsonLinesStream {
    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<Hit>>> {
        let max = max.max(1);
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            if self.current.is_none() && !self.open_next().await? {
                break;
            }
            let Some((path, lines)) = self.current.as_mut() else {
                break;
            };
            let line = lines
                .next_line()
                .await
                .map_err(|e| SourceError::Read(format!("{}: {}", path.display(), e)))?;
            match line {
                Some(line) => {
                    self.line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let hit = Self::decode(path, self.line_no, &line)?;
                    if self.filter.matches(&hit) {
                        batch.push(hit);
                    }
                }
                None => self.current = None,
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        self.files.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use serde_json::json;

    fn hit(value: Value) -> Hit {
        value.as_object().cloned().unwrap()
    }

    fn fact(name: &str) -> SourceTarget {
        SourceTarget::Fact(FactRef::new(1, name))
    }

    async fn drain(stream: &mut Box<dyn HitStream>, max: usize) -> Vec<Vec<Hit>> {
        let mut batches = Vec::new();
        while let Some(batch) = stream.next_batch(max).await.unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn test_memory_source_batches() {
        let source = MemorySource::new().with_set(
            "orders",
            (0..5).map(|i| hit(json!({"id": i}))).collect(),
        );
        let mut stream = source.open(&fact("orders"), &ExtraParams::new()).await.unwrap();
        let sizes: Vec<usize> = drain(&mut stream, 2).await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_memory_source_missing_set() {
        let source = MemorySource::new();
        let result = source.open(&fact("nope"), &ExtraParams::new()).await;
        assert!(matches!(
            result,
            Err(ExportError::Source(SourceError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_custom_query_filters_across_indices() {
        let source = MemorySource::new()
            .with_set("a", vec![hit(json!({"kind": "x", "n": 1})), hit(json!({"kind": "y", "n": 2}))])
            .with_set("b", vec![hit(json!({"kind": "x", "n": 3}))]);
        let target = SourceTarget::Custom {
            indices: vec!["a".into(), "b".into()],
            request: json!({"kind": "x"}),
            connection: "default".into(),
        };
        let mut stream = source.open(&target, &ExtraParams::new()).await.unwrap();
        let hits: Vec<Hit> = drain(&mut stream, 10).await.into_iter().flatten().collect();
        let ns: Vec<i64> = hits.iter().map(|h| h["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_extra_params_compare_rendered_values() {
        let source = MemorySource::new().with_set(
            "orders",
            vec![hit(json!({"year": 2023})), hit(json!({"year": 2024}))],
        );
        let extra = ExtraParams::from([("year".to_string(), "2024".to_string())]);
        let mut stream = source.open(&fact("orders"), &extra).await.unwrap();
        let hits: Vec<Hit> = drain(&mut stream, 10).await.into_iter().flatten().collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["year"], json!(2024));
    }

    #[tokio::test]
    async fn test_json_lines_source_reads_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("events.jsonl"),
            "{\"id\": 1}\n\n{\"id\": 2}\n{\"id\": 3}\n",
        )
        .unwrap();

        let source = JsonLinesSource::new(dir.path());
        let mut stream = source.open(&fact("events"), &ExtraParams::new()).await.unwrap();
        let batches = drain(&mut stream, 2).await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0]["id"], json!(3));
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_json_lines_source_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "{\"id\": 1}\n[1, 2]\n").unwrap();

        let source = JsonLinesSource::new(dir.path());
        let mut stream = source.open(&fact("bad"), &ExtraParams::new()).await.unwrap();
        let result = stream.next_batch(10).await;
        match result {
            Err(ExportError::Source(SourceError::Decode(msg))) => assert!(msg.contains(":2:")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_json_lines_source_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonLinesSource::new(dir.path());
        let result = source.open(&fact("../etc/passwd"), &ExtraParams::new()).await;
        assert!(matches!(
            result,
            Err(ExportError::Source(SourceError::NotFound(_)))
        ));
    }
}
