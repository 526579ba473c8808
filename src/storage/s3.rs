use std::sync::Arc;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_smithy_types::error::display::DisplayErrorContext;
use log::{debug, info};

use super::{CompletedPart, PartReceipt, RemotePart, RemoteUpload, StorageBackend};
use crate::config::{Config, Provider};
use crate::{CloudArcError, Result};

type S3Client = aws_sdk_s3::Client;

/// S3 requires every part except the last to be at least 5 MiB.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// AWS S3 and S3-compatible (MinIO) backend with native multipart
/// sessions. All SDK calls run on a shared tokio runtime; the backend is
/// called concurrently from every upload worker thread.
pub struct S3Backend {
    client: S3Client,
    bucket: String,
    open_timeout: Duration,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl S3Backend {
    pub fn new(config: &Config) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| CloudArcError::InvalidConfig {
                description: "S3 backend requires a bucket".to_string(),
            })?;

        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => Some(
                aws_sdk_s3::config::Credentials::builder()
                    .access_key_id(access_key.clone())
                    .secret_access_key(secret_key.clone())
                    .provider_name("cloudarc")
                    .build(),
            ),
            _ => None,
        };

        let runtime = create_runtime()?;
        let client = build_s3_client(
            &runtime,
            config.profile.as_deref(),
            config.endpoint.as_deref(),
            config.region.as_deref(),
            credentials,
            config.provider == Provider::Minio,
        );
        info!("S3 backend ready for bucket {}", bucket);

        Ok(S3Backend {
            client,
            bucket,
            open_timeout: Duration::from_secs(config.open_timeout_secs),
            runtime,
        })
    }

    #[cfg(test)]
    fn from_client(client: S3Client, bucket: &str) -> Self {
        S3Backend {
            client,
            bucket: bucket.to_string(),
            open_timeout: Duration::from_secs(5),
            runtime: create_runtime().expect("test runtime"),
        }
    }
}

impl StorageBackend for S3Backend {
    fn provider_name(&self) -> &'static str {
        "s3"
    }

    fn min_part_size(&self) -> u64 {
        S3_MIN_PART_SIZE
    }

    fn open_session(&self, object: &str) -> Result<String> {
        let call = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .send();

        let output = self
            .runtime
            .block_on(async { tokio::time::timeout(self.open_timeout, call).await })
            .map_err(|_| CloudArcError::BackendTransient {
                description: format!(
                    "Timed out opening multipart upload after {:?}",
                    self.open_timeout
                ),
            })?
            .map_err(|e| classify_sdk_error("Failed to create multipart upload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| CloudArcError::BackendPermanent {
                description: "Backend returned no upload id".to_string(),
            })?;
        info!("Created multipart upload {}", upload_id);
        Ok(upload_id.to_string())
    }

    fn upload_part(
        &self,
        object: &str,
        upload_id: &str,
        seq: u32,
        data: &[u8],
    ) -> Result<PartReceipt> {
        let call = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .part_number(seq as i32)
            .body(ByteStream::from(data.to_vec()))
            .send();

        let output = self
            .runtime
            .block_on(call)
            .map_err(|e| classify_sdk_error(&format!("Failed to upload part {}", seq), e))?;

        let etag = output
            .e_tag()
            .ok_or_else(|| CloudArcError::BackendPermanent {
                description: format!("Backend returned no ETag for part {}", seq),
            })?;
        debug!("Uploaded part {}, ETag {}", seq, etag);
        Ok(PartReceipt {
            etag: etag.to_string(),
        })
    }

    fn complete_session(
        &self,
        object: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let manifest = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.seq as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        let call = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(manifest))
                    .build(),
            )
            .send();

        self.runtime
            .block_on(call)
            .map_err(|e| classify_sdk_error("Failed to complete multipart upload", e))?;
        info!("Completed multipart upload {}", upload_id);
        Ok(())
    }

    fn abort_session(&self, object: &str, upload_id: &str) -> Result<()> {
        let call = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .send();

        self.runtime
            .block_on(call)
            .map_err(|e| classify_sdk_error("Failed to abort multipart upload", e))?;
        info!("Aborted multipart upload {}", upload_id);
        Ok(())
    }

    fn list_in_progress(&self, object: &str) -> Result<Vec<RemoteUpload>> {
        let call = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(object)
            .send();

        let output = self
            .runtime
            .block_on(call)
            .map_err(|e| classify_sdk_error("Failed to list multipart uploads", e))?;

        let mut uploads = Vec::new();
        for upload in output.uploads() {
            if upload.key() != Some(object) {
                continue;
            }
            let Some(upload_id) = upload.upload_id() else {
                continue;
            };
            let parts = self.list_parts(object, upload_id)?;
            uploads.push(RemoteUpload {
                upload_id: upload_id.to_string(),
                parts,
            });
        }
        Ok(uploads)
    }

    fn put_object(&self, object: &str, data: &[u8]) -> Result<()> {
        let call = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object)
            .body(ByteStream::from(data.to_vec()))
            .send();

        self.runtime
            .block_on(call)
            .map_err(|e| classify_sdk_error("Failed to upload object", e))?;
        Ok(())
    }
}

impl S3Backend {
    fn list_parts(&self, object: &str, upload_id: &str) -> Result<Vec<RemotePart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let call = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(object)
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .send();

            let output = self
                .runtime
                .block_on(call)
                .map_err(|e| classify_sdk_error("Failed to list parts", e))?;

            for part in output.parts() {
                let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) else {
                    continue;
                };
                parts.push(RemotePart {
                    seq: number as u32,
                    etag: etag.to_string(),
                    size: part.size().unwrap_or(0) as u64,
                });
            }

            if output.is_truncated() == Some(true) {
                marker = output.next_part_number_marker().map(str::to_string);
            } else {
                break;
            }
        }

        parts.sort_by_key(|p| p.seq);
        Ok(parts)
    }
}

fn create_runtime() -> Result<Arc<tokio::runtime::Runtime>> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|e| CloudArcError::BackendPermanent {
            description: format!("Failed to create Tokio runtime for S3 operations: {}", e),
        })
}

fn build_s3_client(
    runtime: &Arc<tokio::runtime::Runtime>,
    profile: Option<&str>,
    endpoint: Option<&str>,
    region: Option<&str>,
    credentials: Option<aws_sdk_s3::config::Credentials>,
    force_path_style: bool,
) -> S3Client {
    let config = runtime.block_on(async {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        if let Some(credentials) = credentials {
            loader = loader.credentials_provider(credentials);
        }

        loader.load().await
    });

    let mut builder = aws_sdk_s3::config::Builder::from(&config);
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    if force_path_style {
        // MinIO serves buckets under the path, not a virtual host.
        builder = builder.force_path_style(true);
    }

    S3Client::from_conf(builder.build())
}

/// Maps SDK failures onto the retry taxonomy: connection-level failures
/// and 5xx/throttling responses may be retried, everything else is final.
/// The backend's own message is preserved verbatim.
fn classify_sdk_error<E>(what: &str, err: SdkError<E>) -> CloudArcError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            status >= 500 || status == 429
        }
        _ => false,
    };

    let description = format!("{}: {}", what, DisplayErrorContext(&err));
    if transient {
        CloudArcError::BackendTransient { description }
    } else {
        CloudArcError::BackendPermanent { description }
    }
}
