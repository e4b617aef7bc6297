// pgdumps3/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{ObjectReader, ObjectStore, UploadReceipt};
use crate::config::S3Settings;
use crate::errors::StorageError;

pub const PART_SIZE: usize = 10 * 1024 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 5;

/// S3-compatible bucket accessed with static credentials and path-style addressing.
#[derive(Clone)]
pub struct S3Store {
    client: s3::Client,
    bucket: String,
    base_url: String,
}

impl S3Store {
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &settings.access_key_id,
                &settings.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        let endpoint = settings.endpoint_url();
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        let base_url = endpoint
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", settings.region));

        S3Store {
            client: s3::Client::from_conf(s3_config),
            bucket: settings.bucket.clone(),
            base_url,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, key)
    }

    async fn put_single(&self, key: &str, data: Vec<u8>) -> Result<UploadReceipt, StorageError> {
        let bytes = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| request_error("PutObject", key, e))?;

        Ok(UploadReceipt {
            location: self.object_url(key),
            bytes,
        })
    }

    async fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        body: &mut ObjectReader,
    ) -> Result<UploadReceipt, StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_error("CreateMultipartUpload", key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Request {
                operation: "CreateMultipartUpload",
                key: key.to_string(),
                message: "response carried no upload id".to_string(),
            })?
            .to_string();

        let result = match self.upload_parts(key, &upload_id, first, body).await {
            Ok((parts, bytes)) => self.complete(key, &upload_id, parts, bytes).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.abort(key, &upload_id).await;
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut ObjectReader,
    ) -> Result<(Vec<CompletedPart>, u64), StorageError> {
        let mut in_flight = JoinSet::new();
        let mut completed = Vec::new();
        let mut total = 0u64;
        let mut part_number = 1;
        let mut chunk = first;

        loop {
            total += chunk.len() as u64;
            in_flight.spawn(upload_part(
                self.client.clone(),
                self.bucket.clone(),
                key.to_string(),
                upload_id.to_string(),
                part_number,
                chunk,
            ));
            if in_flight.len() >= MAX_PARTS_IN_FLIGHT {
                if let Some(joined) = in_flight.join_next().await {
                    completed.push(joined_part(joined, key)?);
                }
            }

            chunk = read_part(body).await.map_err(StorageError::Read)?;
            if chunk.is_empty() {
                break;
            }
            part_number += 1;
        }

        while let Some(joined) = in_flight.join_next().await {
            completed.push(joined_part(joined, key)?);
        }
        completed.sort_by_key(|part| part.part_number());
        Ok((completed, total))
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        bytes: u64,
    ) -> Result<UploadReceipt, StorageError> {
        debug!(key, parts = parts.len(), bytes, "completing multipart upload");
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| request_error("CompleteMultipartUpload", key, e))?;

        let location = output
            .location()
            .map(str::to_string)
            .unwrap_or_else(|| self.object_url(key));
        Ok(UploadReceipt { location, bytes })
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key, error = %DisplayErrorContext(&e), "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_stream(&self, key: &str, mut body: ObjectReader) -> Result<UploadReceipt, StorageError> {
        let first = read_part(&mut body).await.map_err(StorageError::Read)?;
        if first.len() < PART_SIZE {
            return self.put_single(key, first).await;
        }
        self.put_multipart(key, first, &mut body).await
    }

    async fn get_stream(&self, key: &str) -> Result<ObjectReader, StorageError> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Box::new(Box::pin(output.body.into_async_read()))),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    return Err(StorageError::NotFound {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                    });
                }
                Err(request_error("GetObject", key, err))
            }
        }
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

async fn upload_part(
    client: s3::Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    data: Vec<u8>,
) -> Result<CompletedPart, StorageError> {
    let output = client
        .upload_part()
        .bucket(&bucket)
        .key(&key)
        .upload_id(&upload_id)
        .part_number(part_number)
        .body(ByteStream::from(data))
        .send()
        .await
        .map_err(|e| request_error("UploadPart", &key, e))?;

    Ok(CompletedPart::builder()
        .set_e_tag(output.e_tag().map(str::to_string))
        .part_number(part_number)
        .build())
}

fn joined_part(
    joined: Result<Result<CompletedPart, StorageError>, tokio::task::JoinError>,
    key: &str,
) -> Result<CompletedPart, StorageError> {
    joined.map_err(|e| StorageError::Request {
        operation: "UploadPart",
        key: key.to_string(),
        message: e.to_string(),
    })?
}

/// Fills one part buffer, returning fewer than `PART_SIZE` bytes only at end of stream.
pub(crate) async fn read_part<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(PART_SIZE);
    while buf.len() < PART_SIZE {
        let remaining = PART_SIZE - buf.len();
        let read = (&mut *reader).take(remaining as u64).read_buf(&mut buf).await?;
        if read == 0 {
            break;
        }
    }
    Ok(buf)
}

fn request_error<E>(operation: &'static str, key: &str, err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::Request {
        operation,
        key: key.to_string(),
        message: DisplayErrorContext(&err).to_string(),
    }
}
