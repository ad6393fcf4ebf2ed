//! Scripted model client for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::client::{CompletionRequest, ModelClient, ModelError, StructuredSchema};

pub(crate) enum Reply {
    Text(String),
    Json(Value),
    Fail,
}

/// Returns queued replies in order, then repeats the last one
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    calls: AtomicUsize,
    pub(crate) prompts: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self, request: CompletionRequest) -> Result<Reply, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request);
        let mut replies = self.replies.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        let reply = match replies.pop_front() {
            Some(reply) => reply,
            None => match last.as_ref() {
                Some(Reply::Text(t)) => Reply::Text(t.clone()),
                Some(Reply::Json(v)) => Reply::Json(v.clone()),
                Some(Reply::Fail) | None => Reply::Fail,
            },
        };
        *last = Some(match &reply {
            Reply::Text(t) => Reply::Text(t.clone()),
            Reply::Json(v) => Reply::Json(v.clone()),
            Reply::Fail => Reply::Fail,
        });
        Ok(reply)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        match self.next(request)? {
            Reply::Text(t) => Ok(t),
            Reply::Json(v) => Ok(v.to_string()),
            Reply::Fail => Err(ModelError::Api {
                status: 503,
                body: "unavailable".to_string(),
            }),
        }
    }

    async fn complete_structured(
        &self,
        request: CompletionRequest,
        _schema: &StructuredSchema,
    ) -> Result<Value, ModelError> {
        match self.next(request)? {
            Reply::Json(v) => Ok(v),
            Reply::Text(t) => super::client::parse_json_payload(&t),
            Reply::Fail => Err(ModelError::Api {
                status: 503,
                body: "unavailable".to_string(),
            }),
        }
    }
}
