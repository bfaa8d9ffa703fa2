use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use switchboard_types::models::Message;

use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::stream::MessageStream;

/// Input box plus the optimistic send pipeline for one stream.
pub struct Composer {
    stream: MessageStream,
    backend: Arc<dyn Backend>,
    input: Mutex<String>,
}

impl Composer {
    pub fn new(stream: MessageStream, backend: Arc<dyn Backend>) -> Self {
        Self {
            stream,
            backend,
            input: Mutex::new(String::new()),
        }
    }

    pub fn input(&self) -> String {
        self.input.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set_input(&self, text: impl Into<String>) {
        if let Ok(mut input) = self.input.lock() {
            *input = text.into();
        }
    }

    /// Send whatever is in the input.
    ///
    /// Blank input is rejected untouched. Otherwise the input is cleared, an
    /// optimistic entry shows up right away and the create is issued once.
    /// On failure the entry is withdrawn and the text goes back into the
    /// input (unless something new was typed meanwhile); nothing is retried.
    /// A closed stream fails with `Closed` before anything is sent.
    pub async fn send(&self) -> Result<Message> {
        let original = {
            let mut input = self
                .input
                .lock()
                .map_err(|_| ClientError::Backend("composer lock poisoned".into()))?;
            if input.trim().is_empty() {
                return Err(ClientError::EmptyMessage);
            }
            std::mem::take(&mut *input)
        };
        let body = original.trim().to_string();

        let Some(local) = self.stream.push_optimistic(&body) else {
            self.restore(original);
            return Err(ClientError::Closed);
        };
        let conversation_id = self.stream.conversation_id();

        match self.backend.send_message(conversation_id, &body).await {
            Ok(message) => {
                debug!("Sent {} in {}", message.id, conversation_id);
                self.stream.reconcile(local, &message);
                Ok(message)
            }
            Err(e) => {
                warn!("Send in {} failed: {}", conversation_id, e);
                self.stream.discard(local);
                self.restore(original);
                Err(e)
            }
        }
    }

    /// Put unsent text back, unless something new was typed meanwhile.
    fn restore(&self, original: String) {
        if let Ok(mut input) = self.input.lock() {
            if input.is_empty() {
                *input = original;
            }
        }
    }
}
