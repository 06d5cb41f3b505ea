use std::path::Path;

use async_trait::async_trait;
use aws_config::Region;
use aws_runtime::env_config::file::{EnvConfigFileKind, EnvConfigFiles};
use aws_sdk_s3::{config::Builder, operation::get_object::GetObjectError, Client};

use super::{ByteRange, ObjectDescriptor, ObjectPage, ObjectReader, SourceStore};
use crate::error::SourceError;

/// Connection settings for the source S3 endpoint.
#[derive(Debug, Clone, Default)]
pub struct S3Settings<'a> {
    pub region: &'a str,
    pub endpoint_url: Option<&'a str>,
    pub credentials_file: Option<&'a Path>,
}

/// S3 (or S3-compatible) source store.
#[derive(Debug, Clone)]
pub struct S3Source {
    client: Client,
}

impl S3Source {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(settings: &S3Settings<'_>) -> Self {
        let mut config_loader =
            aws_config::from_env().region(Region::new(settings.region.to_string()));
        if let Some(path) = settings.credentials_file {
            config_loader = config_loader.profile_files(
                EnvConfigFiles::builder()
                    .with_file(EnvConfigFileKind::Credentials, path)
                    .build(),
            );
        }
        config_loader = match settings.endpoint_url {
            Some(url) => config_loader.endpoint_url(url),
            None => config_loader,
        };
        let config = Builder::from(&config_loader.load().await)
            .force_path_style(true)
            .build();
        Self::new(Client::from_conf(config))
    }

    /// Asks for the length of an object the listing returned without one.
    async fn head_size(&self, bucket: &str, key: &str) -> Option<u64> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => listed_size(output.content_length()),
            Err(e) => {
                tracing::warn!(bucket, key, error = %e, "head object failed.");
                None
            }
        }
    }
}

/// A usable object length, if S3 reported one.
fn listed_size(size: Option<i64>) -> Option<u64> {
    size.and_then(|size| u64::try_from(size).ok())
}

#[async_trait]
impl SourceStore for S3Source {
    async fn list_buckets(&self) -> Result<Vec<String>, SourceError> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| SourceError::ListBuckets {
                source: Box::new(e),
            })?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(ToString::to_string))
            .collect())
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        token: Option<String>,
    ) -> Result<ObjectPage, SourceError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| SourceError::ListObjects {
                bucket: bucket.to_string(),
                source: Box::new(e),
            })?;

        let mut objects = Vec::with_capacity(output.contents().len());
        for object in output.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            let size = match listed_size(object.size()) {
                Some(size) => size,
                None => match self.head_size(bucket, key).await {
                    Some(size) => size,
                    None => {
                        tracing::warn!(bucket, key, "object size unknown, skipping.");
                        continue;
                    }
                },
            };
            objects.push(ObjectDescriptor {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size,
            });
        }

        let next_token = if output.is_truncated().unwrap_or_default() {
            output.next_continuation_token().map(ToString::to_string)
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
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range.map(|r| r.header()))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(GetObjectError::is_no_such_key) {
                    SourceError::NoSuchKey {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    SourceError::GetObject {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        source: Box::new(e),
                    }
                }
            })?;

        Ok(Box::pin(output.body.into_async_read()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listed_size() {
        assert_eq!(listed_size(Some(42)), Some(42));
        assert_eq!(listed_size(Some(0)), Some(0));
        assert_eq!(listed_size(None), None);
        assert_eq!(listed_size(Some(-1)), None);
    }
}
