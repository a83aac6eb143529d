// etcd v2 keys API backend
//
// Plain HTTP against `{connect_url}/v2/keys{path}`. Watches use a client
// without a request timeout since a long poll may legitimately wait for a
// long time; every other call uses the configured timeout.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiring_common::{log_debug, Logger};

use super::store::{join_path, DirectoryStore, StoreAction, StoreError, StoreNode, StoreResponse};

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_NODE_EXIST: u32 = 105;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdBody {
    action: StoreAction,
    node: StoreNode,
    #[serde(default)]
    prev_node: Option<StoreNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

pub struct EtcdStore {
    keys_url: String,
    client: Client,
    watch_client: Client,
    logger: Arc<Logger>,
}

impl EtcdStore {
    pub fn new(
        connect_url: &Url,
        request_timeout: Duration,
        logger: Arc<Logger>,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Protocol(format!("cannot build HTTP client: {e}")))?;
        let watch_client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Protocol(format!("cannot build HTTP client: {e}")))?;
        let keys_url = format!("{}/v2/keys", connect_url.as_str().trim_end_matches('/'));
        log_debug!(logger, "etcd keys endpoint is {keys_url}");
        Ok(Self {
            keys_url,
            client,
            watch_client,
            logger,
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.keys_url, join_path(path, &[]))
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        watch_from: Option<u64>,
    ) -> Result<StoreResponse, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if status.is_success() {
            let parsed: EtcdBody = serde_json::from_str(&body)
                .map_err(|e| StoreError::Protocol(format!("unexpected etcd response: {e}")))?;
            return Ok(StoreResponse {
                action: parsed.action,
                node: parsed.node,
                prev_node: parsed.prev_node,
                index,
            });
        }

        match serde_json::from_str::<EtcdErrorBody>(&body) {
            Ok(error) => Err(map_error(error, watch_from)),
            Err(_) if status.is_server_error() => {
                Err(StoreError::Unavailable(format!("etcd returned HTTP {status}")))
            }
            Err(_) => Err(StoreError::Protocol(format!("etcd returned HTTP {status}"))),
        }
    }
}

fn map_error(error: EtcdErrorBody, watch_from: Option<u64>) -> StoreError {
    let cause = error.cause.unwrap_or_default();
    match error.error_code {
        ERROR_KEY_NOT_FOUND => StoreError::NotFound(cause),
        ERROR_NODE_EXIST => StoreError::AlreadyExists(cause),
        ERROR_EVENT_INDEX_CLEARED => StoreError::IndexCleared {
            requested: watch_from.unwrap_or_default(),
            oldest: error.index,
        },
        code => StoreError::Protocol(format!("etcd error {code}: {} ({cause})", error.message)),
    }
}

fn ttl_param(ttl: Option<Duration>) -> Option<String> {
    ttl.map(|ttl| ttl.as_secs().max(1).to_string())
}

#[async_trait]
impl DirectoryStore for EtcdStore {
    async fn put_dir(
        &self,
        path: &str,
        ttl: Option<Duration>,
        prev_exist: Option<bool>,
    ) -> Result<StoreResponse, StoreError> {
        let mut form = vec![("dir", "true".to_string())];
        if let Some(ttl) = ttl_param(ttl) {
            form.push(("ttl", ttl));
        }
        if let Some(prev_exist) = prev_exist {
            form.push(("prevExist", prev_exist.to_string()));
        }
        self.execute(self.client.put(self.url_for(path)).form(&form), None)
            .await
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<StoreResponse, StoreError> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl_param(ttl) {
            form.push(("ttl", ttl));
        }
        self.execute(self.client.put(self.url_for(key)).form(&form), None)
            .await
    }

    async fn get(&self, path: &str, recursive: bool) -> Result<StoreResponse, StoreError> {
        let request = self
            .client
            .get(self.url_for(path))
            .query(&[("recursive", recursive.to_string())]);
        self.execute(request, None).await
    }

    async fn delete(&self, key: &str) -> Result<StoreResponse, StoreError> {
        self.execute(self.client.delete(self.url_for(key)), None)
            .await
    }

    async fn delete_dir(&self, path: &str, recursive: bool) -> Result<StoreResponse, StoreError> {
        let request = self
            .client
            .delete(self.url_for(path))
            .query(&[("dir", "true".to_string()), ("recursive", recursive.to_string())]);
        self.execute(request, None).await
    }

    async fn watch(
        &self,
        path: &str,
        from_index: u64,
        recursive: bool,
    ) -> Result<StoreResponse, StoreError> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", recursive.to_string()),
        ];
        if from_index > 0 {
            query.push(("waitIndex", from_index.to_string()));
        }
        log_debug!(self.logger, "watching {path} from index {from_index}");
        let request = self.watch_client.get(self.url_for(path)).query(&query);
        self.execute(request, Some(from_index)).await
    }
}
