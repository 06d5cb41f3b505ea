//! In-memory source store for dry runs and tests.

use std::{collections::BTreeMap, io::Cursor, ops::Bound};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ByteRange, ObjectDescriptor, ObjectPage, ObjectReader, SourceStore};
use crate::error::SourceError;

/// Buckets of objects held in memory, listed in key order.
#[derive(Debug, Clone)]
pub struct MemorySource {
    buckets: BTreeMap<String, BTreeMap<String, Bytes>>,
    page_size: usize,
}

impl MemorySource {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            page_size: page_size.max(1),
        }
    }

    #[must_use]
    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.buckets.entry(bucket.to_string()).or_default();
        self
    }

    #[must_use]
    pub fn with_object(mut self, bucket: &str, key: &str, data: impl Into<Bytes>) -> Self {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
        self
    }

    fn bucket(&self, bucket: &str) -> Result<&BTreeMap<String, Bytes>, SourceError> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| SourceError::NoSuchBucket {
                bucket: bucket.to_string(),
            })
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list_buckets(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.buckets.keys().cloned().collect())
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        token: Option<String>,
    ) -> Result<ObjectPage, SourceError> {
        let entries = self.bucket(bucket)?;
        let lower = token.as_ref().map_or(Bound::Unbounded, Bound::Excluded);
        let mut objects: Vec<_> = entries
            .range::<String, _>((lower, Bound::Unbounded))
            .take(self.page_size + 1)
            .map(|(key, data)| ObjectDescriptor {
                bucket: bucket.to_string(),
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect();

        let next_token = if objects.len() > self.page_size {
            objects.truncate(self.page_size);
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader, SourceError> {
        let data = self
            .bucket(bucket)?
            .get(key)
            .ok_or_else(|| SourceError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let body = match range {
            None => data.clone(),
            Some(range) => {
                let len = data.len() as u64;
                if range.is_empty() || range.start >= len {
                    return Err(SourceError::GetObject {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        source: format!("range {} not satisfiable", range.header()).into(),
                    });
                }
                let end = range.end.min(len - 1);
                let (Ok(start), Ok(end)) = (usize::try_from(range.start), usize::try_from(end))
                else {
                    return Err(SourceError::GetObject {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        source: "range exceeds addressable memory".into(),
                    });
                };
                data.slice(start..=end)
            }
        };
        Ok(Box::pin(Cursor::new(body)))
    }
}
