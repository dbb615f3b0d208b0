use reqwest::{Client, StatusCode};
use jsonwebtoken::{encode, Header, EncodingKey};
use serde::{Serialize, Deserialize};
use chrono::{Utc, Duration};
use tracing::debug;
use uuid::Uuid;

use crate::services::access_service::DocumentAccess;

#[derive(Debug)]
pub struct AppServiceClient {
    client: Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "type")]
    type_: String,
    exp: usize,
}

/// Body of the app service's document access answer
#[derive(Debug, Deserialize)]
struct AccessBody {
    permission: String,
}

impl AppServiceClient {
    pub fn new(base_url: String, jwt_secret: String, service_name: String) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| format!("Failed to build reqwest client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jwt_secret,
            service_name,
        })
    }

    fn generate_token(&self) -> Result<String, String> {
        let expiration = Utc::now()
            .checked_add_signed(Duration::seconds(60)) // 1 minute expiration
            .ok_or_else(|| "Token expiration out of range".to_string())?
            .timestamp();

        let claims = Claims {
            sub: self.service_name.clone(),
            type_: "service".to_string(),
            exp: expiration as usize,
        };

        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.jwt_secret.as_bytes()))
            .map_err(|e| format!("Failed to generate JWT: {}", e))
    }

    /// Ask the app service what `uid` may do with a document.
    pub async fn get_document_access(&self, uid: &str, document_id: Uuid) -> Result<DocumentAccess, String> {
        let token = self.generate_token()?;
        let url = format!("{}/auth/documents/{}/access/{}", self.base_url, document_id, uid);
        let response = self.client.get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send().await
            .map_err(|e| format!("Access request failed: {}", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(DocumentAccess::NotFound),
            StatusCode::FORBIDDEN => return Ok(DocumentAccess::Denied),
            status if !status.is_success() => {
                return Err(format!("App service answered {} for document {}", status, document_id));
            }
            _ => {}
        }

        let body: AccessBody = response.json().await
            .map_err(|e| format!("Invalid access response: {}", e))?;
        debug!("App service granted '{}' on document {} to {}", body.permission, document_id, uid);
        Ok(DocumentAccess::from_permission(&body.permission))
    }
}
