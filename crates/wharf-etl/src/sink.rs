//! Warehouse sink
//!
//! Three narrow traits cover what the pipeline needs from the warehouse:
//! DDL, appends and scalar queries. [`BigQueryClient`] implements all three
//! over the BigQuery REST API v2.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::auth::AccessTokenProvider;
use crate::chunk::Chunk;
use crate::descriptor::SinkNamespace;
use crate::error::{EtlError, QueryKind, Result, System};
use crate::staging::{encode_csv, NULL_MARKER, STAGING_CONTENT_TYPE};

// ============================================================================
// BigQuery Client Constants
// ============================================================================

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
/// Media upload endpoint used to create load jobs
pub const DEFAULT_UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
pub const DEFAULT_JOB_PROJECT: &str = "default_gcp_project";
pub const DEFAULT_LOCATION: &str = "US";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Upper bound on status polls for a single job
pub const DEFAULT_MAX_POLLS: u32 = 3600;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Executes DDL in the warehouse
#[async_trait]
pub trait SinkAdmin: Send + Sync {
    async fn execute_ddl(&self, sql: &str) -> Result<()>;
}

/// Appends rows to an existing warehouse table
#[async_trait]
pub trait SinkLoader: Send + Sync {
    /// Append every row of `chunk`, returning the number of rows written
    async fn append(&self, namespace: &SinkNamespace, table: &str, chunk: &Chunk) -> Result<u64>;
}

/// Runs queries that return one integer
#[async_trait]
pub trait SinkQuery: Send + Sync {
    async fn query_scalar(&self, sql: &str) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub api_base: String,
    pub upload_base: String,
    /// Project the query and load jobs run in
    pub job_project: String,
    pub location: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub http_timeout: Duration,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            job_project: DEFAULT_JOB_PROJECT.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_polls: DEFAULT_MAX_POLLS,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// `jobs.insert` / `jobs.get` resource, reduced to what a load needs
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadJob {
    job_reference: Option<JobReference>,
    #[serde(default)]
    status: JobStatus,
    #[serde(default)]
    statistics: JobStatistics,
}

impl LoadJob {
    fn is_done(&self) -> bool {
        self.status.state.as_deref() == Some("DONE")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: Option<String>,
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    /// int64 values arrive as JSON strings
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl std::fmt::Display for ErrorProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.reason.as_deref().unwrap_or("error"),
            self.message.as_deref().unwrap_or("")
        )
    }
}

/// Build a `multipart/related` body: job metadata first, then the media
fn multipart_related(metadata: &Value, media_type: &str, media: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("wharf_{}", Uuid::new_v4().simple());
    let head = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n--{b}\r\nContent-Type: {}\r\n\r\n",
        metadata,
        media_type,
        b = boundary
    );
    let tail = format!("\r\n--{}--\r\n", boundary);

    let mut body = Vec::with_capacity(head.len() + media.len() + tail.len());
    body.extend_from_slice(head.as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(tail.as_bytes());

    (format!("multipart/related; boundary={}", boundary), body)
}

/// BigQuery REST client
#[derive(Clone)]
pub struct BigQueryClient {
    client: Client,
    config: BigQueryConfig,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig, tokens: Arc<dyn AccessTokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent("wharf-etl/0.1")
            .build()
            .map_err(|e| EtlError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    fn queries_url(&self) -> String {
        format!(
            "{}/projects/{}/queries",
            self.config.api_base.trim_end_matches('/'),
            self.config.job_project
        )
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/projects/{}/jobs",
            self.config.api_base.trim_end_matches('/'),
            self.config.job_project
        )
    }

    fn upload_jobs_url(&self) -> String {
        format!(
            "{}/projects/{}/jobs",
            self.config.upload_base.trim_end_matches('/'),
            self.config.job_project
        )
    }

    /// Send a request and decode a JSON body, mapping transport failures to
    /// `Connection` and API failures through `on_status`
    async fn send_json<T, F>(&self, request: RequestBuilder, on_status: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce(String) -> EtlError,
    {
        let token = self.tokens.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| EtlError::Connection {
                system: System::Sink,
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| EtlError::Connection {
            system: System::Sink,
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(on_status(format!("HTTP {}: {}", status, message)));
        }

        serde_json::from_str(&body).map_err(|e| on_status(format!("unexpected response: {}", e)))
    }

    /// GET `url` until `done` holds, at most `max_polls` times
    async fn poll<T, F>(
        &self,
        first: T,
        job_id: &str,
        url: &str,
        location: &str,
        done: fn(&T) -> bool,
        on_status: F,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(String) -> EtlError + Copy,
    {
        let mut response = first;
        let mut polls = 0;
        while !done(&response) {
            polls += 1;
            if polls > self.config.max_polls {
                return Err(on_status(format!(
                    "job {} did not complete after {} polls",
                    job_id, self.config.max_polls
                )));
            }

            debug!(job_id, polls, "Waiting for job");
            tokio::time::sleep(self.config.poll_interval).await;

            let request = self.client.get(url).query(&[("location", location)]);
            response = self.send_json(request, on_status).await?;
        }

        Ok(response)
    }

    /// Run a query job to completion
    async fn run_query(&self, sql: &str, kind: QueryKind) -> Result<QueryResponse> {
        let on_status = |message: String| EtlError::query(System::Sink, kind, message);

        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "location": self.config.location,
        });
        let response: QueryResponse = self
            .send_json(self.client.post(self.queries_url()).json(&body), on_status)
            .await?;
        if response.job_complete {
            return Ok(response);
        }

        let job = response
            .job_reference
            .as_ref()
            .ok_or_else(|| on_status("incomplete job without a job reference".to_string()))?;
        let job_id = job.job_id.clone();
        let location = job
            .location
            .clone()
            .unwrap_or_else(|| self.config.location.clone());
        let url = format!("{}/{}", self.queries_url(), job_id);

        let done = |r: &QueryResponse| r.job_complete;
        self.poll(response, &job_id, &url, &location, done, on_status)
            .await
    }
}

#[async_trait]
impl SinkAdmin for BigQueryClient {
    #[instrument(skip(self, sql))]
    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        debug!("Executing DDL:\n{}", sql);
        self.run_query(sql, QueryKind::Ddl).await?;
        Ok(())
    }
}

#[async_trait]
impl SinkQuery for BigQueryClient {
    #[instrument(skip(self, sql))]
    async fn query_scalar(&self, sql: &str) -> Result<u64> {
        let response = self.run_query(sql, QueryKind::Count).await?;
        let value = response
            .rows
            .first()
            .and_then(|row| row.f.first())
            .map(|cell| &cell.v)
            .ok_or_else(|| EtlError::query(System::Sink, QueryKind::Count, "query returned no rows"))?;

        let parsed = match value {
            Value::String(s) => s.parse::<u64>().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            EtlError::query(
                System::Sink,
                QueryKind::Count,
                format!("expected a non-negative integer, got {}", value),
            )
        })
    }
}

#[async_trait]
impl SinkLoader for BigQueryClient {
    /// Load the chunk as CSV through one `WRITE_APPEND` load job
    #[instrument(skip(self, chunk), fields(chunk = chunk.index, rows = chunk.len()))]
    async fn append(&self, namespace: &SinkNamespace, table: &str, chunk: &Chunk) -> Result<u64> {
        let load_err = |message: String| EtlError::Load {
            chunk: chunk.index,
            table: format!("{}.{}", namespace, table),
            staged: None,
            message,
        };

        let media = encode_csv(chunk).map_err(|e| load_err(format!("CSV encoding failed: {}", e)))?;
        let job_id = format!("wharf_{}_{}", table, Uuid::new_v4().simple());
        let metadata = json!({
            "jobReference": {
                "projectId": self.config.job_project,
                "jobId": job_id,
                "location": self.config.location,
            },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": namespace.project,
                        "datasetId": namespace.dataset,
                        "tableId": table,
                    },
                    "sourceFormat": "CSV",
                    "skipLeadingRows": 1,
                    "nullMarker": NULL_MARKER,
                    "allowQuotedNewlines": true,
                    "writeDisposition": "WRITE_APPEND",
                    "createDisposition": "CREATE_NEVER",
                }
            }
        });
        let (content_type, body) = multipart_related(&metadata, STAGING_CONTENT_TYPE, &media);

        let request = self
            .client
            .post(self.upload_jobs_url())
            .query(&[("uploadType", "multipart")])
            .header(CONTENT_TYPE, content_type)
            .body(body);
        let job: LoadJob = self.send_json(request, load_err).await?;
        debug!(job_id = %job_id, bytes = media.len(), "Submitted load job");

        let location = job
            .job_reference
            .as_ref()
            .and_then(|r| r.location.clone())
            .unwrap_or_else(|| self.config.location.clone());
        let url = format!("{}/{}", self.jobs_url(), job_id);
        let job = self
            .poll(job, &job_id, &url, &location, LoadJob::is_done, load_err)
            .await?;

        if let Some(error) = &job.status.error_result {
            let detail = job
                .status
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            let message = if detail.is_empty() {
                format!("load job {} failed: {}", job_id, error)
            } else {
                format!("load job {} failed: {} ({})", job_id, error, detail)
            };
            return Err(load_err(message));
        }

        let appended = match job.statistics.load.and_then(|l| l.output_rows) {
            Some(rows) => rows
                .parse::<u64>()
                .map_err(|_| load_err(format!("unexpected outputRows '{}'", rows)))?,
            None => chunk.len() as u64,
        };

        info!("Appended {} rows to {}.{}", appended, namespace, table);
        Ok(appended)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn client(config: BigQueryConfig) -> BigQueryClient {
        BigQueryClient::new(config, Arc::new(crate::auth::StaticToken::new("token"))).unwrap()
    }

    #[test]
    fn test_urls() {
        let config = BigQueryConfig {
            api_base: "http://localhost:9050/bigquery/v2/".to_string(),
            upload_base: "http://localhost:9050/upload/bigquery/v2".to_string(),
            ..BigQueryConfig::default()
        };
        let client = client(config);

        assert_eq!(client.queries_url(), "http://localhost:9050/bigquery/v2/projects/default_gcp_project/queries");
        assert_eq!(client.jobs_url(), "http://localhost:9050/bigquery/v2/projects/default_gcp_project/jobs");
        assert_eq!(
            client.upload_jobs_url(),
            "http://localhost:9050/upload/bigquery/v2/projects/default_gcp_project/jobs"
        );
    }

    #[test]
    fn test_query_response_parsing() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"jobComplete":true,"jobReference":{"projectId":"p","jobId":"j1","location":"US"},
                "rows":[{"f":[{"v":"42"}]}],"totalRows":"1"}"#,
        )
        .unwrap();
        assert!(response.job_complete);
        assert_eq!(response.rows[0].f[0].v, Value::String("42".into()));

        let pending: QueryResponse =
            serde_json::from_str(r#"{"jobReference":{"jobId":"j2"}}"#).unwrap();
        assert!(!pending.job_complete);
        assert!(pending.rows.is_empty());
    }

    #[test]
    fn test_load_job_parsing() {
        let running: LoadJob =
            serde_json::from_str(r#"{"jobReference":{"jobId":"j1"},"status":{"state":"RUNNING"}}"#)
                .unwrap();
        assert!(!running.is_done());

        let done: LoadJob = serde_json::from_str(
            r#"{"status":{"state":"DONE","errorResult":{"reason":"invalid","message":"bad row"}},
                "statistics":{"load":{"outputRows":"12"}}}"#,
        )
        .unwrap();
        assert!(done.is_done());
        assert_eq!(done.status.error_result.unwrap().to_string(), "invalid: bad row");
        assert_eq!(done.statistics.load.unwrap().output_rows.as_deref(), Some("12"));
    }

    #[test]
    fn test_multipart_body_layout() {
        let (content_type, body) =
            multipart_related(&json!({ "a": 1 }), "text/csv", b"id\nx\n");
        let boundary = content_type
            .strip_prefix("multipart/related; boundary=")
            .unwrap()
            .to_string();
        let body = String::from_utf8(body).unwrap();

        assert!(body.starts_with(&format!("--{}\r\nContent-Type: application/json", boundary)));
        assert!(body.contains("{\"a\":1}"));
        assert!(body.contains("Content-Type: text/csv\r\n\r\nid\nx\n"));
        assert!(body.ends_with(&format!("\r\n--{}--\r\n", boundary)));
    }
}
