use std::collections::BTreeMap;
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use url::Url;
use crate::config::{Config, HttpConfig};
use crate::core::{
    Payload,
    ProgressReporter,
    ProgressStream,
    QueueError,
    Result,
    TransferReceipt,
    TransferRequest,
    Transport,
};

/// Posts each payload as a multipart form to a single endpoint.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    config: HttpConfig,
}

impl HttpTransport {
    pub fn new(endpoint: &str, config: HttpConfig) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| QueueError::config(format!("Invalid endpoint {}: {}", endpoint, err)))?;

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            endpoint,
            token: None,
            config,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = Self::new(&config.endpoint, config.http.clone())?;
        Ok(match &config.token {
            Some(token) => transport.with_token(token.clone()),
            None => transport,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Where a request with this destination goes.
    pub fn target_url(&self, destination: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint.clone();
        if let (true, Some(destination)) = (self.config.destination_in_path, destination) {
            url.path_segments_mut()
                .map_err(|_| QueueError::config(format!("Endpoint {} cannot take a path", self.endpoint)))?
                .pop_if_empty()
                .push(destination);
        }
        Ok(url)
    }

    async fn file_part(&self, payload: Payload, total_bytes: u64, progress: ProgressReporter) -> Result<Part> {
        let name = payload.name();
        let body = match payload {
            Payload::File(path) => {
                let file = File::open(&path).await?;
                Body::wrap_stream(ProgressStream::new(ReaderStream::new(file), progress))
            }
            Payload::Bytes { data, .. } => {
                let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(data)]);
                Body::wrap_stream(ProgressStream::new(chunks, progress))
            }
        };

        Ok(Part::stream_with_length(body, total_bytes).file_name(name))
    }

    fn form_fields(&self, mut form: Form, request: &TransferRequest) -> Form {
        if !self.config.destination_in_path {
            if let Some(destination) = &request.options.destination {
                form = form.text("destination", destination.clone());
            }
        }
        if !request.options.tags.is_empty() {
            form = form.text("tags", request.options.tags.join(","));
        }
        for (key, value) in &request.options.fields {
            form = form.text(key.clone(), value.clone());
        }
        form
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn transfer(&self, request: TransferRequest, progress: ProgressReporter) -> Result<TransferReceipt> {
        let url = self.target_url(request.options.destination.as_deref())?;

        let form = self.form_fields(Form::new(), &request);
        let part = self.file_part(request.payload.clone(), request.total_bytes, progress).await?;
        let form = form.part(self.config.file_field.clone(), part);

        let mut builder = self.client.post(url).multipart(form);
        for (name, value) in &self.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(QueueError::server_error(
                status.as_u16(),
                error_message(&body).unwrap_or_else(|| format!("Upload failed with status {}", status)),
            ));
        }

        Ok(TransferReceipt {
            status_code: status.as_u16(),
            location,
            resource: serde_json::from_str(&body).ok(),
        })
    }
}

/// Pull `error` or `message` out of a JSON error body, else the raw text.
fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(trimmed) {
        Ok(map) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| Some(trimmed.to_string())),
        Err(_) => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use super::*;
    use crate::core::{TaskId, UploadOptions};

    fn request(payload: Payload, options: UploadOptions) -> TransferRequest {
        TransferRequest {
            task_id: TaskId::new(),
            total_bytes: 11,
            payload,
            options,
        }
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(r#"{"error":"Folder not found"}"#).as_deref(), Some("Folder not found"));
        assert_eq!(error_message(r#"{"message":"nope"}"#).as_deref(), Some("nope"));
        assert_eq!(error_message("Bad Gateway").as_deref(), Some("Bad Gateway"));
        assert_eq!(error_message("  "), None);
    }

    #[test]
    fn test_target_url() {
        let config = HttpConfig {
            destination_in_path: true,
            ..HttpConfig::default()
        };
        let transport = HttpTransport::new("https://assets.example.com/api/upload/", config).unwrap();
        assert_eq!(
            transport.target_url(Some("folder-42")).unwrap().as_str(),
            "https://assets.example.com/api/upload/folder-42"
        );
        assert_eq!(
            transport.target_url(None).unwrap().as_str(),
            "https://assets.example.com/api/upload/"
        );

        let plain = HttpTransport::new("https://assets.example.com/api/upload", HttpConfig::default()).unwrap();
        assert_eq!(
            plain.target_url(Some("folder-42")).unwrap().as_str(),
            "https://assets.example.com/api/upload"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            HttpTransport::new("::nope", HttpConfig::default()),
            Err(QueueError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_success_returns_receipt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload")
            .match_header("authorization", "Bearer secret")
            .match_body(mockito::Matcher::Regex("hello world".to_string()))
            .with_status(201)
            .with_header("location", "/media/abc")
            .with_body(r#"{"id":"abc","folder_id":"f1"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(&format!("{}/upload", server.url()), HttpConfig::default())
            .unwrap()
            .with_token("secret");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(TaskId::new(), 1, 11, tx);

        let receipt = transport
            .transfer(
                request(Payload::bytes("hello.txt", "hello world"), UploadOptions::default().with_tag("hero")),
                reporter,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(receipt.status_code, 201);
        assert_eq!(receipt.location.as_deref(), Some("/media/abc"));
        assert_eq!(receipt.resource.unwrap()["id"], "abc");

        let mut last = 0;
        while let Ok(crate::core::progress::TransferMessage::Progress { bytes, .. }) = rx.try_recv() {
            last = bytes;
        }
        assert_eq!(last, 11);
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/upload")
            .with_status(500)
            .with_body(r#"{"error":"S3 unavailable"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(&format!("{}/upload", server.url()), HttpConfig::default()).unwrap();
        let err = transport
            .transfer(
                request(Payload::bytes("hello.txt", "hello world"), UploadOptions::default()),
                ProgressReporter::detached(11),
            )
            .await
            .unwrap_err();

        match err {
            QueueError::Server { status_code, message } => {
                assert_eq!(status_code, 500);
                assert_eq!(message, "S3 unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_file_payload_streams_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poster.png");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload/folder-7")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("poster.png".to_string()),
                mockito::Matcher::Regex("hello world".to_string()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let config = HttpConfig {
            destination_in_path: true,
            ..HttpConfig::default()
        };
        let transport = HttpTransport::new(&format!("{}/upload", server.url()), config).unwrap();
        let receipt = transport
            .transfer(
                request(Payload::file(&path), UploadOptions::default().with_destination("folder-7")),
                ProgressReporter::detached(11),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(receipt.status_code, 200);
        assert!(receipt.resource.is_none());
    }
}
