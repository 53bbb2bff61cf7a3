//! Notebook artifact storage for scheduled jobs.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::info;

use atmo_core::config::{AwsConfig, EmrConfig};
use atmo_core::{Identifier, NotebookRef};

use crate::aws::load_sdk_config;
use crate::error::NotebookStoreError;

const NOTEBOOK_EXTENSION: &str = ".ipynb";

/// Object key a job's notebook is stored under.
pub fn notebook_key(job: &Identifier, file_name: &str) -> String {
    format!("jobs/{}/{}", job, file_name)
}

/// Reject anything that isn't a plain `.ipynb` file name.
pub fn validate_notebook_name(file_name: &str) -> Result<(), NotebookStoreError> {
    let plain = !file_name.is_empty() && !file_name.contains('/') && !file_name.contains('\\');
    if !plain || !file_name.ends_with(NOTEBOOK_EXTENSION) || file_name == NOTEBOOK_EXTENSION {
        return Err(NotebookStoreError::InvalidName(file_name.to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait NotebookStore: Send + Sync {
    /// Upload a notebook under `jobs/<identifier>/<file name>`.
    async fn put(
        &self,
        job: &Identifier,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<NotebookRef, NotebookStoreError>;

    async fn delete(&self, notebook: &NotebookRef) -> Result<(), NotebookStoreError>;

    /// Location handed to the job-run step. Stable for a given reference.
    fn uri(&self, notebook: &NotebookRef) -> String;
}

/// S3-backed notebook store writing to the code bucket.
pub struct S3NotebookStore {
    client: Client,
    bucket: String,
}

impl S3NotebookStore {
    pub async fn new(aws: &AwsConfig, emr: &EmrConfig) -> Self {
        let sdk_config = load_sdk_config(aws).await;
        let client = Client::new(&sdk_config);
        info!(bucket = %emr.code_bucket, "S3 notebook store initialised");
        Self::from_client(client, emr.code_bucket.clone())
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl NotebookStore for S3NotebookStore {
    async fn put(
        &self,
        job: &Identifier,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<NotebookRef, NotebookStoreError> {
        validate_notebook_name(file_name)?;
        let key = notebook_key(job, file_name);
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| NotebookStoreError::Backend(format!("put {key}: {e}")))?;

        info!(bucket = %self.bucket, key = %key, bytes = size, "Uploaded notebook");
        Ok(NotebookRef::new(key))
    }

    async fn delete(&self, notebook: &NotebookRef) -> Result<(), NotebookStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&notebook.key)
            .send()
            .await
            .map_err(|e| NotebookStoreError::Backend(format!("delete {}: {e}", notebook.key)))?;

        info!(bucket = %self.bucket, key = %notebook.key, "Deleted notebook");
        Ok(())
    }

    fn uri(&self, notebook: &NotebookRef) -> String {
        format!("s3://{}/{}", self.bucket, notebook.key)
    }
}
