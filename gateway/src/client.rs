use crate::directory::PartitionInfo;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// Raw answer from a partition, relayed as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartitionClient: Send + Sync {
    /// GET returning the body. A non-success status is
    /// [`Error::PartitionUnavailable`].
    async fn get(&self, partition: &PartitionInfo, path_and_query: &str) -> Result<String>;

    /// POST a JSON body, whatever the answer's status.
    async fn post(&self, partition: &PartitionInfo, path: &str, body: Vec<u8>) -> Result<PartitionResponse>;
}

pub struct HttpPartitionClient {
    http: reqwest::Client,
}

impl HttpPartitionClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

fn url(partition: &PartitionInfo, path: &str) -> String {
    format!("{}{}", partition.endpoint.trim_end_matches('/'), path)
}

#[async_trait]
impl PartitionClient for HttpPartitionClient {
    async fn get(&self, partition: &PartitionInfo, path_and_query: &str) -> Result<String> {
        let url = url(partition, path_and_query);
        debug!("GET {}", url);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::PartitionUnavailable {
                endpoint: partition.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    async fn post(&self, partition: &PartitionInfo, path: &str, body: Vec<u8>) -> Result<PartitionResponse> {
        let url = url(partition, path);
        debug!("POST {} ({} bytes)", url, body.len());

        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        Ok(PartitionResponse {
            status: response.status().as_u16(),
            body: response.bytes().await?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_endpoint_and_path() {
        let partition = PartitionInfo {
            low_key: i64::MIN,
            high_key: i64::MAX,
            endpoint: "http://node:8081/".to_string(),
        };
        assert_eq!(url(&partition, "/api/devices"), "http://node:8081/api/devices");
    }
}
