use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serror::AddStatusCodeError;

/// Fixed delay before the single retry on a connect failure.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin JSON client shared by all backend adapters. Upstream error
/// statuses pass through unchanged so the managers can discriminate
/// retryable / conflict / not-found responses.
pub struct HttpClient {
  client: reqwest::Client,
}

impl Default for HttpClient {
  fn default() -> Self {
    HttpClient {
      client: reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build http client"),
    }
  }
}

impl HttpClient {
  pub async fn get<Res: DeserializeOwned>(
    &self,
    url: String,
  ) -> serror::Result<Res> {
    let res = self
      .send(Method::GET, &url, Option::<&()>::None)
      .await?;
    res
      .json()
      .await
      .with_context(|| format!("Failed to parse body of {url}"))
      .map_err(|e| e.status_code(StatusCode::UNPROCESSABLE_ENTITY))
  }

  pub async fn post<Req: Serialize>(
    &self,
    url: String,
    body: &Req,
  ) -> serror::Result<String> {
    let res = self.send(Method::POST, &url, Some(body)).await?;
    Ok(res.text().await.unwrap_or_default())
  }

  pub async fn put<Req: Serialize>(
    &self,
    url: String,
    body: &Req,
  ) -> serror::Result<String> {
    let res = self.send(Method::PUT, &url, Some(body)).await?;
    Ok(res.text().await.unwrap_or_default())
  }

  pub async fn delete(&self, url: String) -> serror::Result<String> {
    let res = self
      .send(Method::DELETE, &url, Option::<&()>::None)
      .await?;
    Ok(res.text().await.unwrap_or_default())
  }

  async fn send<Req: Serialize>(
    &self,
    method: Method,
    url: &str,
    body: Option<&Req>,
  ) -> serror::Result<reqwest::Response> {
    let build = |method: Method| {
      let mut req = self.client.request(method, url);
      if let Some(body) = body {
        req = req.json(body);
      }
      req
    };
    let res = match build(method.clone()).send().await {
      Ok(res) => res,
      Err(e) if e.is_connect() => {
        // connection refused / reset: retry once after a fixed delay
        warn!(
          "Connection to {url} failed, retry in {}s | {e}",
          CONNECT_RETRY_DELAY.as_secs()
        );
        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        build(method.clone()).send().await.map_err(|e| {
          anyhow::Error::from(e)
            .context(format!("Failed to reach {url}"))
            .status_code(StatusCode::SERVICE_UNAVAILABLE)
        })?
      }
      Err(e) => {
        return Err(
          anyhow::Error::from(e)
            .context(format!("Failed to reach {url}"))
            .status_code(StatusCode::SERVICE_UNAVAILABLE),
        );
      }
    };
    let status = res.status();
    if status.is_success() {
      return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(
      anyhow!("{method} {url} | {body}")
        .status_code(status),
    )
  }
}
