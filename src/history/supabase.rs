use async_trait::async_trait;
use log::{ debug, info };
use reqwest::{ header, Client, Response };
use std::error::Error;

use super::ThreadMirror;
use crate::error::MirrorError;
use crate::models::chat::MirrorRow;

/// PostgREST access to the mirror table.
pub struct SupabaseMirror {
    client: Client,
    url: String,
    table: String,
}

impl SupabaseMirror {
    pub fn new(url: &str, api_key: &str, table: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", header::HeaderValue::from_str(api_key).map_err(|e| format!("Invalid API key: {}", e))?);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| format!("Invalid API key: {}", e))?
        );
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

        let client = Client::builder().default_headers(headers).build()?;
        info!("Supabase mirror at {} (table {})", url, table);

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            table: table.to_string(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.url, self.table)
    }

    async fn check(response: Response) -> Result<Response, MirrorError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MirrorError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl ThreadMirror for SupabaseMirror {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        let response = self.client
            .post(self.table_url())
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send().await?;
        Self::check(response).await?;
        debug!("Upserted mirror row {}", row.id);
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), MirrorError> {
        let filter = format!("eq.{}", thread_id);
        let response = self.client
            .delete(self.table_url())
            .query(&[("id", filter.as_str())])
            .send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<MirrorRow>, MirrorError> {
        let filter = format!("eq.{}", thread_id);
        let response = self.client
            .get(self.table_url())
            .query(&[("select", "*"), ("id", filter.as_str()), ("limit", "1")])
            .send().await?;
        let rows: Vec<MirrorRow> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<MirrorRow>, MirrorError> {
        let mut query = vec![("select", "*".to_string()), ("order", "updated_at.desc".to_string())];
        if let Some(user_id) = user_id {
            query.push(("user_id", format!("eq.{}", user_id)));
        }
        let response = self.client.get(self.table_url()).query(&query).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
