use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid server URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("cannot read {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, Value),
}

/// Thin JSON client for the daemon's HTTP surface.
#[derive(Debug, Clone)]
pub struct FaceClient {
    base: Url,
    client: Client,
}

impl FaceClient {
    pub fn new(server: &str) -> Result<Self, ClientError> {
        // A trailing slash keeps `join` from dropping a path prefix.
        let base = if server.ends_with('/') {
            Url::parse(server)?
        } else {
            Url::parse(&format!("{server}/"))?
        };
        Ok(Self {
            base,
            client: Client::builder().build()?,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub async fn recognize(&self, image: &Path) -> Result<Value, ClientError> {
        let form = image_form(image).await?;
        self.send(self.client.post(self.endpoint("recognize")?).multipart(form))
            .await
    }

    pub async fn compare(&self, image: &Path) -> Result<Value, ClientError> {
        let form = image_form(image).await?;
        self.send(self.client.post(self.endpoint("compare_models")?).multipart(form))
            .await
    }

    pub async fn register(&self, name: &str, image: &Path) -> Result<Value, ClientError> {
        let bytes = read_image(image).await?;
        let body = json!({
            "name": name,
            "image": base64::engine::general_purpose::STANDARD.encode(bytes),
        });
        self.send(self.client.post(self.endpoint("register")?).json(&body))
            .await
    }

    pub async fn sync(&self) -> Result<Value, ClientError> {
        self.send(self.client.post(self.endpoint("sync")?)).await
    }

    pub async fn plan(&self) -> Result<Value, ClientError> {
        self.send(self.client.get(self.endpoint("sync/plan")?)).await
    }

    pub async fn health(&self) -> Result<Value, ClientError> {
        self.send(self.client.get(self.endpoint("health")?)).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        tracing::debug!(%status, "response received");
        if status.is_success() {
            Ok(body)
        } else {
            Err(ClientError::HttpStatus(status, body))
        }
    }
}

async fn read_image(path: &Path) -> Result<Vec<u8>, ClientError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ClientError::ReadImage {
            path: path.display().to_string(),
            source,
        })
}

async fn image_form(path: &Path) -> Result<Form, ClientError> {
    let bytes = read_image(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "probe".to_string());
    Ok(Form::new().part("image", Part::bytes(bytes).file_name(file_name)))
}
