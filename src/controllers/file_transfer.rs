use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use super::ControllerContext;
use crate::error::{ConsoleError, ConsoleResult};
use crate::mqtt_service::SubscriptionGuard;
use crate::router::ResponseEnvelope;
use crate::topics::{FILE_DOWNLOAD, FILE_UPLOAD};

#[derive(Debug, Clone, Serialize)]
pub struct DownloadedFile {
    pub filepath: String,
    pub filename: String,
    pub size: usize,
    #[serde(skip)]
    pub content: Vec<u8>,
}

pub struct FileTransferController {
    ctx: ControllerContext,
    _subscriptions: Vec<SubscriptionGuard>,
}

fn file_name(filepath: &str) -> String {
    Path::new(filepath)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| filepath.to_string())
}

fn decode_content(envelope: &ResponseEnvelope) -> ConsoleResult<Vec<u8>> {
    let encoded = envelope
        .field(&["content", "data"])
        .and_then(Value::as_str)
        .ok_or_else(|| ConsoleError::malformed(FILE_DOWNLOAD.response_topics[0], "reply carries no content"))?;
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ConsoleError::malformed(FILE_DOWNLOAD.response_topics[0], e))
}

fn check_path(filepath: &str) -> ConsoleResult<&str> {
    let filepath = filepath.trim();
    if filepath.is_empty() {
        return Err(ConsoleError::Validation("file path must not be empty".to_string()));
    }
    Ok(filepath)
}

impl FileTransferController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let topics: Vec<&str> = [FILE_DOWNLOAD, FILE_UPLOAD]
            .iter()
            .flat_map(|spec| spec.response_topics.iter().copied())
            .collect();
        let subscriptions = ctx.subscribe(&topics);
        Arc::new(Self {
            ctx,
            _subscriptions: subscriptions,
        })
    }

    /// Fetches `filepath` from the gateway. The bytes stay in memory; the
    /// console never writes to its own filesystem.
    pub async fn download(&self, filepath: &str) -> ConsoleResult<DownloadedFile> {
        let key = format!("files:download:{}", filepath);
        let file = self
            .ctx
            .run("Download file", &key, async {
                let filepath = check_path(filepath)?;
                let envelope = self
                    .ctx
                    .client
                    .request(&FILE_DOWNLOAD, "download", json!({ "filepath": filepath }))
                    .await?;
                let content = decode_content(&envelope)?;
                Ok(DownloadedFile {
                    filepath: filepath.to_string(),
                    filename: file_name(filepath),
                    size: content.len(),
                    content,
                })
            })
            .await?;
        self.ctx.success(format!("Downloaded {}", file.filename));
        Ok(file)
    }

    /// Sends `content` to the gateway as `filepath`.
    pub async fn upload(&self, filepath: &str, content: &[u8]) -> ConsoleResult<Value> {
        let key = format!("files:upload:{}", filepath);
        let reply = self
            .ctx
            .run("Upload file", &key, async {
                let filepath = check_path(filepath)?;
                let envelope = self
                    .ctx
                    .client
                    .request(
                        &FILE_UPLOAD,
                        "upload",
                        json!({ "filepath": filepath, "content": STANDARD.encode(content) }),
                    )
                    .await?;
                Ok(Value::Object(envelope.body))
            })
            .await?;
        self.ctx.success(format!("Uploaded {}", file_name(filepath)));
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_client::testing::Harness;
    use crate::controllers::testing::context;

    #[tokio::test]
    async fn download_decodes_base64_content() {
        let mut harness = Harness::connected();
        let controller = FileTransferController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.download("/etc/gateway/devices.json").await })
        };
        let command = harness
            .reply(
                "download_file_response",
                json!({ "status": "success", "content": STANDARD.encode(b"{\"devices\":[]}") }),
            )
            .await;
        assert_eq!(command["filepath"], "/etc/gateway/devices.json");

        let file = task.await.unwrap().unwrap();
        assert_eq!(file.filename, "devices.json");
        assert_eq!(file.content, b"{\"devices\":[]}");
        assert_eq!(json!(file), json!({ "filepath": "/etc/gateway/devices.json", "filename": "devices.json", "size": 14 }));
    }

    #[tokio::test]
    async fn corrupt_content_is_malformed() {
        let mut harness = Harness::connected();
        let controller = FileTransferController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.download("a.txt").await })
        };
        harness
            .reply("download_file_response", json!({ "content": "***not base64***" }))
            .await;
        assert!(matches!(task.await.unwrap(), Err(ConsoleError::Malformed { .. })));
        assert_eq!(harness.notifier.recent(10).len(), 1);
    }

    #[tokio::test]
    async fn upload_encodes_content() {
        let mut harness = Harness::connected();
        let controller = FileTransferController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.upload("/tmp/x.bin", &[0, 1, 2, 255]).await })
        };
        let command = harness
            .reply("response_file_transfer", json!({ "status": "success", "bytes": 4 }))
            .await;
        assert_eq!(command["content"], STANDARD.encode([0u8, 1, 2, 255]));
        assert_eq!(task.await.unwrap().unwrap()["bytes"], 4);
    }

    #[tokio::test]
    async fn empty_path_is_rejected() {
        let mut harness = Harness::connected();
        let controller = FileTransferController::attach(context(&harness));
        assert!(matches!(
            controller.upload("  ", b"x").await,
            Err(ConsoleError::Validation(_))
        ));
        assert!(harness.published_nothing());
    }
}
