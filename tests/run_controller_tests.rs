use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use storychain::client_wrapper::{
    ClientWrapper, GenerationParameters, Message, MessageChunk, MessageChunkStream, SendError,
};
use storychain::config::PipelineConfig;
use storychain::display::{AgentColor, TASK_SEPARATOR};
use storychain::event::{AgentEvent, EventHandler};
use storychain::run::{CancelHandle, RunController, RunError, RunMessage, RunStatus};

struct ScriptedClient {
    replies: Mutex<VecDeque<Result<Vec<&'static str>, &'static str>>>,
    calls: Mutex<usize>,
    cancel_on_first_call: Mutex<Option<CancelHandle>>,
}

impl ScriptedClient {
    fn new(replies: Vec<Result<Vec<&'static str>, &'static str>>) -> Arc<Self> {
        Arc::new(ScriptedClient {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
            cancel_on_first_call: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn send_message_stream(
        &self,
        _messages: &[Message],
        _parameters: &GenerationParameters,
    ) -> Result<MessageChunkStream, SendError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(handle) = self.cancel_on_first_call.lock().unwrap().take() {
            handle.cancel();
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(vec!["unscripted"]));
        let fragments = reply.map_err(|reason| -> SendError { reason.into() })?;
        let chunks: Vec<Result<MessageChunk, SendError>> = fragments
            .into_iter()
            .map(|fragment| {
                Ok(MessageChunk {
                    content: fragment.to_string(),
                    finish_reason: None,
                })
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

fn config(iterations: usize, color: &str) -> PipelineConfig {
    PipelineConfig::from_value(json!({
        "agent_order": ["Writer"],
        "max_tokens_per_call": 500,
        "openai_model": "gpt-4",
        "iterations": iterations,
        "agents": [{
            "name": "Writer",
            "temperature": 0.5,
            "color": color,
            "max_history": 4,
            "system": "You write user stories.",
            "user": "Keep them short.",
            "tasks": {"1": "Draft:", "2": "Tighten:", "3": "Finalize:"}
        }]
    }))
    .unwrap()
}

fn status(line: &str) -> RunMessage {
    RunMessage::Status(line.to_string())
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let client = ScriptedClient::new(vec![Ok(vec!["As a ", "shopper"])]);
    let controller = RunController::new(client.clone());

    let handle = controller.start(config(1, "GREEN"), "seed").unwrap();
    let (messages, report) = handle.collect().await;
    let report = report.unwrap();

    let color = Some(AgentColor::Green);
    assert_eq!(
        messages,
        vec![
            status("--- Phase 1 ---"),
            status(TASK_SEPARATOR),
            status("Assigning task to Writer: Draft:"),
            RunMessage::AgentHeader {
                agent_name: "Writer".into(),
                color,
            },
            RunMessage::Fragment {
                agent_name: "Writer".into(),
                color,
                text: "As a ".into(),
            },
            RunMessage::Fragment {
                agent_name: "Writer".into(),
                color,
                text: "shopper".into(),
            },
            RunMessage::AgentFooter {
                agent_name: "Writer".into(),
                color,
            },
            status("Processing complete."),
            RunMessage::Finished(RunStatus::Completed),
        ]
    );

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.artifact, "As a shopper");
    let joined: String = messages.iter().map(RunMessage::plain_text).collect();
    assert_eq!(report.transcript, joined);
    assert!(report.transcript.contains("### Writer ###\nAs a shopper\n\n"));
    assert!(report.finished_at >= report.started_at);
}

#[tokio::test]
async fn test_only_one_run_at_a_time() {
    let client = ScriptedClient::new(vec![Ok(vec!["first"]), Ok(vec!["second"])]);
    let controller = RunController::new(client.clone());

    let first = controller.start(config(1, "BLUE"), "seed").unwrap();
    assert!(controller.is_running());
    assert!(matches!(
        controller.start(config(1, "BLUE"), "seed"),
        Err(RunError::AlreadyRunning)
    ));

    let report = first.wait().await.unwrap();
    assert_eq!(report.artifact, "first");
    assert!(!controller.is_running());

    let second = controller.start(config(1, "BLUE"), "seed").unwrap();
    assert_eq!(second.wait().await.unwrap().artifact, "second");
}

#[tokio::test]
async fn test_failure_is_reported_and_controller_recovers() {
    let client = ScriptedClient::new(vec![Err("quota exceeded"), Ok(vec!["recovered"])]);
    let controller = RunController::new(client.clone());

    let handle = controller.start(config(1, "RED"), "seed").unwrap();
    let (messages, report) = handle.collect().await;
    let report = report.unwrap();

    match &report.status {
        RunStatus::Failed(reason) => assert!(reason.contains("quota exceeded")),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(report.artifact, "seed");
    let error_line = messages
        .iter()
        .find_map(|message| match message {
            RunMessage::Status(line) if line.starts_with("Error in pipeline run: ") => Some(line),
            _ => None,
        })
        .expect("error line");
    assert!(error_line.contains("quota exceeded"));
    assert!(matches!(
        messages.last(),
        Some(RunMessage::Finished(RunStatus::Failed(_)))
    ));

    assert!(!controller.is_running());
    let retry = controller.start(config(1, "RED"), "seed").unwrap();
    assert_eq!(retry.wait().await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_cancel_before_first_phase() {
    let client = ScriptedClient::new(vec![]);
    let controller = RunController::new(client.clone());

    let handle = controller.start(config(3, "CYAN"), "untouched seed").unwrap();
    handle.cancel();
    let (messages, report) = handle.collect().await;
    let report = report.unwrap();

    assert_eq!(report.status, RunStatus::StoppedByUser);
    assert_eq!(report.artifact, "untouched seed");
    assert_eq!(client.calls(), 0);
    assert!(messages.contains(&status("Processing stopped by user request.")));
    assert_eq!(
        messages.last(),
        Some(&RunMessage::Finished(RunStatus::StoppedByUser))
    );
}

#[tokio::test]
async fn test_cancel_between_first_and_second_phase() {
    let client = ScriptedClient::new(vec![Ok(vec!["phase one"]), Ok(vec!["phase two"])]);
    let controller = RunController::new(client.clone());

    let handle = controller.start(config(3, "YELLOW"), "seed").unwrap();
    *client.cancel_on_first_call.lock().unwrap() = Some(handle.cancel_handle());
    let (messages, report) = handle.collect().await;
    let report = report.unwrap();

    assert_eq!(report.status, RunStatus::StoppedByUser);
    assert_eq!(report.artifact, "phase one");
    assert_eq!(client.calls(), 1);
    assert!(!messages.contains(&status("--- Phase 2 ---")));
    assert!(report
        .transcript
        .ends_with("phase one\n\nProcessing stopped by user request.\n"));
}

#[tokio::test]
async fn test_controller_stop() {
    let client = ScriptedClient::new(vec![]);
    let controller = RunController::new(client.clone());
    assert!(!controller.stop());

    let handle = controller.start(config(2, "WHITE"), "seed").unwrap();
    assert!(controller.stop());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.status, RunStatus::StoppedByUser);
    assert!(!controller.stop());
}

#[tokio::test]
async fn test_invalid_color_is_rejected_at_start() {
    let client = ScriptedClient::new(vec![]);
    let controller = RunController::new(client.clone());

    let err = match controller.start(config(1, "MAGENTA"), "seed") {
        Ok(_) => panic!("MAGENTA is not in the palette"),
        Err(err) => err,
    };
    assert!(matches!(err, RunError::Pipeline(_)));
    assert!(err.to_string().contains("MAGENTA"));
    assert!(!controller.is_running());
}

/// Panics on the first streamed fragment it sees, then behaves.
struct PanicOnceHandler {
    panicked: AtomicBool,
}

#[async_trait]
impl EventHandler for PanicOnceHandler {
    async fn on_agent_event(&self, event: &AgentEvent) {
        if let AgentEvent::FragmentReceived { .. } = event {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("observer bug");
            }
        }
    }
}

#[tokio::test]
async fn test_panicking_worker_frees_the_controller() {
    let client = ScriptedClient::new(vec![Ok(vec!["lost"]), Ok(vec!["second try"])]);
    let controller = RunController::new(client.clone()).with_event_handler(Arc::new(
        PanicOnceHandler {
            panicked: AtomicBool::new(false),
        },
    ));

    let handle = controller.start(config(1, "BLUE"), "seed").unwrap();
    match handle.wait().await {
        Err(RunError::Worker(reason)) => assert!(reason.contains("observer bug")),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(!controller.is_running());
    assert!(!controller.stop());

    let retry = controller.start(config(1, "BLUE"), "seed").unwrap();
    let report = retry.wait().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.artifact, "second try");
}
