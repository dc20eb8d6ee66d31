//! REST client for a PostgREST-style remote store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{RemoteStore, KEY_COLUMN};
use crate::error::RemoteError;

/// Remote store wrapper
#[derive(Clone)]
pub struct RestRemoteStore {
  client: Client,
  base: Url,
  api_key: String,
}

impl RestRemoteStore {
  pub fn new(base: Url, api_key: String, timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
    })
  }

  fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| RemoteError::Schema(format!("invalid table url for {}: {}", table, e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    request
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }

  async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response
      .text()
      .await
      .unwrap_or_else(|_| "Unknown error".to_string());
    Err(RemoteError::from_status(status.as_u16(), body))
  }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
  async fn upsert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().append_pair("on_conflict", KEY_COLUMN);

    let request = self
      .client
      .post(url)
      .header("Prefer", "resolution=merge-duplicates,return=minimal")
      .json(rows);

    let response = self.authorize(request).send().await?;
    Self::check(response).await?;
    Ok(())
  }

  async fn delete(&self, table: &str, key: &str) -> Result<(), RemoteError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair(KEY_COLUMN, &format!("eq.{}", key));

    let response = self.authorize(self.client.delete(url)).send().await?;
    Self::check(response).await?;
    Ok(())
  }

  async fn select(&self, table: &str, filters: &[(&str, &str)]) -> Result<Vec<Value>, RemoteError> {
    let mut url = self.table_url(table)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("select", "*");
      for (column, value) in filters {
        query.append_pair(column, &format!("eq.{}", value));
      }
    }

    let response = self.authorize(self.client.get(url)).send().await?;
    let rows: Vec<Value> = Self::check(response)
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Schema(format!("Failed to parse rows: {}", e)))?;

    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_table_url_is_relative_to_base() {
    let store = RestRemoteStore::new(
      Url::parse("https://example.supabase.co/").unwrap(),
      "key".to_string(),
      Duration::from_secs(5),
    )
    .unwrap();

    assert_eq!(
      store.table_url("orders").unwrap().as_str(),
      "https://example.supabase.co/rest/v1/orders"
    );
  }
}
