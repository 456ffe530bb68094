// THEORY:
// The remote delegate moves both attribution engines to another host. The
// request carries the raw upload as a multipart `file` field; the answer is the
// same `ExplanationArtifacts` JSON a local run produces. Anything other than a
// 200 with a decodable body counts as "no artifacts produced": the job carries
// on and leaves both fields unset.

use crate::core_modules::explainer::{ExplanationArtifacts, Explainer};
use crate::error::DelegateError;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteDelegate {
    client: reqwest::Client,
    url: String,
}

impl RemoteDelegate {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DelegateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// One round-trip to the delegate, without the "empty on failure" policy applied.
    pub async fn request(&self, image: Vec<u8>) -> Result<ExplanationArtifacts, DelegateError> {
        let (mime, extension) = match image::guess_format(&image) {
            Ok(format) => (format.to_mime_type(), format.extensions_str().first().copied().unwrap_or("bin")),
            Err(_) => ("application/octet-stream", "bin"),
        };
        let part = Part::bytes(image)
            .file_name(format!("scan.{extension}"))
            .mime_str(mime)?;
        let form = Form::new().part("file", part);

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(DelegateError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| DelegateError::Decode(err.to_string()))
    }
}

impl Explainer for RemoteDelegate {
    fn explain<'a>(&'a self, image_path: &'a Path, _workspace: &'a Path) -> BoxFuture<'a, ExplanationArtifacts> {
        Box::pin(async move {
            let image = match tokio::fs::read(image_path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    let err = DelegateError::from(err);
                    warn!(path = %image_path.display(), error = %err, "job image could not be read");
                    return ExplanationArtifacts::failed(err.to_string());
                }
            };
            match self.request(image).await {
                Ok(artifacts) => {
                    debug!(
                        url = %self.url,
                        shap = artifacts.shap_base64.is_some(),
                        occlusion = artifacts.occlusion_base64.is_some(),
                        "delegate answered"
                    );
                    artifacts
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "explanation delegate failed, no artifacts produced");
                    ExplanationArtifacts::failed(format!("delegate: {err}"))
                }
            }
        })
    }
}
