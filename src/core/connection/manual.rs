//! Copy/paste signaling: descriptors travel as base64 codes the users
//! exchange by any side channel (chat, email, voice).

use super::signaling::Signaling;
use crate::core::error::EngineError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

type Input = Box<dyn AsyncBufRead + Unpin + Send>;
type Output = Box<dyn AsyncWrite + Unpin + Send>;

pub struct ManualSignaling {
    input: Mutex<Input>,
    output: Mutex<Output>,
}

impl ManualSignaling {
    pub fn new(input: Input, output: Output) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    /// Prompt on stdout, read codes from stdin.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    async fn say(&self, text: &str) -> Result<(), EngineError> {
        let mut out = self.output.lock().await;
        out.write_all(text.as_bytes())
            .await
            .and(out.flush().await)
            .map_err(|e| EngineError::SignalingUnavailable(e.to_string()))
    }
}

#[async_trait]
impl Signaling for ManualSignaling {
    async fn publish_local_descriptor(
        &self,
        self_id: &str,
        descriptor: Bytes,
    ) -> Result<String, EngineError> {
        let code = B64.encode(&descriptor);
        self.say(&format!(
            "\nShare this code with your peer ({self_id}):\n\n{code}\n\n"
        ))
        .await?;
        Ok(code)
    }

    async fn fetch_remote_descriptor(&self, remote_id: &str) -> Result<Bytes, EngineError> {
        let mut input = self.input.lock().await;
        loop {
            self.say(&format!("Paste the code for {remote_id}: ")).await?;
            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .await
                .map_err(|e| EngineError::SignalingUnavailable(e.to_string()))?;
            if read == 0 {
                return Err(EngineError::SignalingUnavailable(
                    "input closed before a code was pasted".into(),
                ));
            }
            let code: String = line.split_whitespace().collect();
            if code.is_empty() {
                continue;
            }
            match B64.decode(code.as_bytes()) {
                Ok(raw) => return Ok(Bytes::from(raw)),
                Err(e) => self.say(&format!("Invalid code ({e}), try again.\n")).await?,
            }
        }
    }
}
