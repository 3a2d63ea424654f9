//! S3 (or S3-compatible) backend for the object store gateway.
//!
//! Uploads are cut into `PART_SIZE` parts and sent one at a time: the body
//! is a single ordered stream coming out of the transform pipeline, so
//! there is nothing to gain from parallel parts and a lot of memory to
//! lose. Downloads are ranged requests issued in order and delivered
//! through the sequential sink.

use crate::{
    config::S3Settings,
    models::object::ListPage,
    services::storage_service::{
        ObjectStore, PART_SIZE, SequentialWriter, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use std::{error::Error as StdError, io};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    part_size: usize,
}

fn backend_error<E: StdError>(op: &'static str, key: &str, err: E) -> StorageError {
    StorageError::Backend {
        op,
        key: key.to_string(),
        message: DisplayErrorContext(&err).to_string(),
    }
}

/// Read up to `part_size` bytes; a short result means end of stream.
async fn read_part(
    body: &mut (dyn AsyncRead + Unpin + Send),
    part_size: usize,
) -> io::Result<Vec<u8>> {
    let mut part = Vec::with_capacity(part_size);
    (&mut *body)
        .take(part_size as u64)
        .read_to_end(&mut part)
        .await?;
    Ok(part)
}

impl S3Store {
    /// Build a client from static credentials.
    pub async fn connect(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "walvault-config",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            part_size: PART_SIZE,
        }
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StorageResult<u64> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| backend_error("create multipart upload", key, err))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StorageError::Backend {
                op: "create multipart upload",
                key: key.to_string(),
                message: "no upload id returned".into(),
            })?
            .to_string();

        let result = match self.upload_parts(key, &upload_id, first, body).await {
            Ok((parts, size)) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| size)
                .map_err(|err| backend_error("complete multipart upload", key, err)),
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(
                    key,
                    upload_id = %upload_id,
                    "failed to abort multipart upload: {}",
                    DisplayErrorContext(&abort_err)
                );
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StorageResult<(Vec<CompletedPart>, u64)> {
        let mut parts = Vec::new();
        let mut size = 0u64;
        let mut part = first;
        let mut number = 1i32;
        loop {
            let len = part.len();
            size += len as u64;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|err| backend_error("upload part", key, err))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(number)
                    .set_e_tag(uploaded.e_tag().map(str::to_owned))
                    .build(),
            );
            debug!(key, part = number, len, "part uploaded");

            part = read_part(body, self.part_size).await?;
            if part.is_empty() {
                break;
            }
            number += 1;
        }
        Ok((parts, size))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StorageResult<u64> {
        let first = read_part(body, self.part_size).await?;
        let size = if first.len() < self.part_size {
            let size = first.len() as u64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|err| backend_error("put", key, err))?;
            size
        } else {
            self.put_multipart(key, first, body).await?
        };
        info!(bucket = %self.bucket, key, size, "object uploaded");
        Ok(size)
    }

    async fn get(&self, key: &str, sink: &mut SequentialWriter) -> StorageResult<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    StorageError::ObjectNotFound {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                    }
                } else {
                    backend_error("head", key, err)
                }
            })?;
        let total = head.content_length().unwrap_or(0).max(0) as u64;

        let mut offset = 0u64;
        while offset < total {
            let end = (offset + self.part_size as u64).min(total) - 1;
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(format!("bytes={offset}-{end}"))
                .send()
                .await
                .map_err(|err| backend_error("get", key, err))?;

            let mut body = response.body;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| backend_error("get", key, err))?;
                sink.write_at(offset, &chunk).await?;
                offset += chunk.len() as u64;
            }
            if offset != end + 1 {
                return Err(StorageError::Backend {
                    op: "get",
                    key: key.to_string(),
                    message: format!("range ended at {offset}, expected {}", end + 1),
                });
            }
        }

        info!(bucket = %self.bucket, key, size = total, "object downloaded");
        Ok(total)
    }

    async fn list(&self, prefix: &str, start_after: Option<&str>) -> StorageResult<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_start_after(start_after.map(str::to_owned))
            .send()
            .await
            .map_err(|err| backend_error("list", prefix, err))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_owned))
            .collect();
        Ok(ListPage {
            keys,
            is_truncated: response.is_truncated().unwrap_or(false),
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| backend_error("delete", key, err))?;
        Ok(())
    }
}
