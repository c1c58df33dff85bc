/// S3-compatible backend for the backup repository.
///
/// Builds an authenticated client bound to a concrete endpoint. AWS-style
/// endpoints are rewritten to the region-specific host; anything else
/// (RadosGW, MinIO, ...) is used verbatim. A configured CA chain is
/// materialized to a scoped temporary file that only lives for the duration
/// of client construction.
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_smithy_http_client::{Builder as HttpClientBuilder, tls};
use aws_smithy_types::body::SdkBody;
use aws_smithy_types::error::display::DisplayErrorContext;
use futures::TryStreamExt;
use http_body_util::StreamBody;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use url::Url;

use super::{ObjectStore, StoreFactory};
use crate::config::RepositoryConfig;
use crate::error::{EngineError, Result};
use crate::progress::TransferProgress;

const AWS_DNS_SUFFIX: &str = "amazonaws.com";

/// Region used for request signing when the relation supplies none.
const FALLBACK_SIGNING_REGION: &str = "us-east-1";

fn storage_err<E>(context: &str, err: E) -> EngineError
where
    E: std::error::Error + Send + Sync + 'static,
{
    EngineError::Storage(format!("{context}: {}", DisplayErrorContext(&err)))
}

/// Construct the service endpoint for a configuration.
///
/// When the configured endpoint is an AWS host and a region is set, the
/// region-specific host is substituted (a generic `https://s3.amazonaws.com`
/// becomes `https://s3.<region>.amazonaws.com`). Everything else passes
/// through untouched.
pub fn resolve_endpoint(config: &RepositoryConfig) -> String {
    if config.region.is_empty() {
        return config.endpoint.clone();
    }
    let Ok(parsed) = Url::parse(&config.endpoint) else {
        return config.endpoint.clone();
    };
    let is_aws = parsed
        .host_str()
        .is_some_and(|host| host == AWS_DNS_SUFFIX || host.ends_with(".amazonaws.com"));
    if is_aws {
        format!(
            "{}://s3.{}.{}",
            parsed.scheme(),
            config.region,
            AWS_DNS_SUFFIX
        )
    } else {
        config.endpoint.clone()
    }
}

fn signing_region(config: &RepositoryConfig) -> String {
    if config.region.is_empty() {
        FALLBACK_SIGNING_REGION.to_string()
    } else {
        config.region.clone()
    }
}

/// Build an authenticated client for the configured repository.
pub fn build_client(config: &RepositoryConfig) -> Result<S3Client> {
    let credentials = Credentials::new(
        &config.access_key,
        &config.secret_key,
        None,
        None,
        "storage-integration",
    );

    let mut builder = S3ConfigBuilder::new()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(resolve_endpoint(config))
        .region(Region::new(signing_region(config)))
        .credentials_provider(credentials)
        .force_path_style(config.path_style());

    if let Some(ca_chain) = &config.tls_ca_chain {
        // The chain only exists on disk while the client is being built;
        // the temporary file is removed when this scope ends.
        let ca_file = tempfile::NamedTempFile::new()?;
        std::fs::write(ca_file.path(), ca_chain.as_bytes())?;
        let pem = std::fs::read(ca_file.path())?;

        let tls_context = tls::TlsContext::builder()
            .with_trust_store(tls::TrustStore::empty().with_pem_certificate(pem.as_slice()))
            .build()
            .map_err(|e| EngineError::Storage(format!("invalid CA chain: {e}")))?;
        let http_client = HttpClientBuilder::new()
            .tls_provider(tls::Provider::Rustls(
                tls::rustls_provider::CryptoMode::AwsLc,
            ))
            .tls_context(tls_context)
            .build_https();
        builder = builder.http_client(http_client);
    }

    Ok(S3Client::from_conf(builder.build()))
}

/// Backup repository backed by one S3-compatible bucket.
pub struct S3Store {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3Store {
    pub fn open(config: &RepositoryConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        })
    }

    async fn create_bucket(&self) -> Result<()> {
        if self.region.is_empty() {
            self.client
                .create_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| storage_err("could not create bucket", e))?;
            info!(bucket = %self.bucket, "created bucket");
            return Ok(());
        }

        let constraint = BucketLocationConstraint::from(self.region.as_str());
        let bucket_config = CreateBucketConfiguration::builder()
            .location_constraint(constraint)
            .build();
        match self
            .client
            .create_bucket()
            .bucket(&self.bucket)
            .create_bucket_configuration(bucket_config)
            .send()
            .await
        {
            Ok(_) => {
                info!(bucket = %self.bucket, region = %self.region, "created bucket");
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .and_then(|e| e.meta().code())
                    .is_some_and(|code| code == "InvalidLocationConstraint") =>
            {
                info!("specified location-constraint is not valid, trying create without it");
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| storage_err("could not create bucket", e))?;
                info!(bucket = %self.bucket, region = %self.region, "created bucket, ignored region");
                Ok(())
            }
            Err(err) => Err(storage_err("could not create bucket", err)),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> Result<()> {
        match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => {
                info!(bucket = %self.bucket, "bucket exists");
                return Ok(());
            }
            Err(err) => {
                if err.as_service_error().is_none() {
                    // Timeouts and TLS failures surface to the operator
                    // instead of being mistaken for a missing bucket.
                    return Err(storage_err("could not reach the object store", err));
                }
                warn!(
                    bucket = %self.bucket,
                    "bucket doesn't exist or this key has no access to it"
                );
            }
        }
        self.create_bucket().await
    }

    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .content_length(data.len() as i64)
            .send()
            .await
            .map_err(|e| storage_err("could not write object", e))?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key() || e.meta().code() == Some("NoSuchKey"))
                {
                    return Ok(None);
                }
                return Err(storage_err("could not read object", err));
            }
        };

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| storage_err("could not read object body", e))?
            .into_bytes();
        Ok(Some(bytes.to_vec()))
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(resp.content_length.map(|len| len.max(0) as u64)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(storage_err("could not stat object", service_err))
                }
            }
        }
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/");
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| storage_err("could not list objects", e))?;

            if let Some(commons) = resp.common_prefixes {
                for common in commons {
                    if let Some(p) = common.prefix {
                        prefixes.push(p);
                    }
                }
            }

            match resp.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(prefixes)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/");
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| storage_err("could not list objects", e))?;

            if let Some(contents) = resp.contents {
                for obj in contents {
                    if let Some(key) = obj.key {
                        objects.push((key, obj.size.map(|s| s.max(0) as u64).unwrap_or(0)));
                    }
                }
            }

            match resp.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn upload_file(&self, path: &Path, key: &str, label: &str) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let progress = TransferProgress::upload(label, size);

        let frames = ReaderStream::new(file)
            .inspect_ok(move |chunk| progress.observe(chunk.len() as u64))
            .map_ok(http_body::Frame::data);
        let body = SdkBody::from_body_1_x(StreamBody::new(frames));

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::new(body))
            .content_length(size as i64)
            .send()
            .await
            .map_err(|e| storage_err("could not upload file", e))?;
        Ok(())
    }

    async fn download_file(&self, key: &str, dest: &Path, label: &str) -> Result<u64> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key() || e.meta().code() == Some("NoSuchKey"))
                {
                    return Err(EngineError::ObjectMissing {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                    });
                }
                return Err(storage_err("could not read object", err));
            }
        };

        let total = resp.content_length.map(|len| len.max(0) as u64).unwrap_or(0);
        let progress = TransferProgress::download(label, total);

        let mut body = resp.body;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| storage_err("could not read object body", e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.observe(chunk.len() as u64);
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Default factory: one fresh client per operation.
pub struct S3StoreFactory;

impl StoreFactory for S3StoreFactory {
    fn build(&self, config: &RepositoryConfig) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Store::open(config)?))
    }
}
