use futures_util::StreamExt;
use std::sync::Arc;
use storychain::client_wrapper::{ClientWrapper, GenerationParameters, Message, Role};
use storychain::clients::openai::OpenAIClient;
use storychain::Agent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

fn sse_frame(content: Option<&str>, finish_reason: Option<&str>) -> String {
    let delta = match content {
        Some(text) => serde_json::json!({ "content": text }),
        None => serde_json::json!({}),
    };
    let chunk = serde_json::json!({
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }]
    });
    format!("data: {}\n\n", chunk)
}

fn hello_body() -> String {
    let mut body = String::new();
    body.push_str(&sse_frame(Some(""), None));
    body.push_str(&sse_frame(Some("Hel"), None));
    body.push_str(&sse_frame(Some("lo"), None));
    body.push_str(&sse_frame(None, Some("stop")));
    body.push_str("data: [DONE]\n\n");
    body
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = socket.read(&mut buffer).await.unwrap();
        if read == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..read]);
        if let Some(end) = request.windows(4).position(|window| window == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map(|value| value.trim().parse::<usize>().unwrap())
                .unwrap_or(0);
            if request.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8(request).unwrap()
}

/// Serves exactly one HTTP response and returns the raw request it received.
async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{}",
            status, body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        request
    });
    (base_url, server)
}

fn request_body(request: &str) -> serde_json::Value {
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_streams_server_sent_events() {
    storychain::init_logger();
    let (base_url, server) = serve_once("200 OK", hello_body()).await;
    let client = OpenAIClient::new_with_base_url("test-key", &base_url).unwrap();

    let messages = vec![
        Message::with_role(Role::System, "You write user stories."),
        Message::with_role(Role::User, "Draft one."),
    ];
    let parameters = GenerationParameters::new("gpt-4", 256)
        .with_temperature(0.2)
        .with_top_p(0.5);
    let chunks: Vec<_> = client
        .send_message_stream(&messages, &parameters)
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    let text: String = chunks.iter().map(|chunk| chunk.content.as_str()).collect();
    assert_eq!(text, "Hello");
    assert_eq!(
        chunks.last().unwrap().finish_reason.as_deref(),
        Some("stop")
    );

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/chat/completions "));
    assert!(request
        .to_lowercase()
        .contains("authorization: bearer test-key"));
    let body = request_body(&request);
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 256);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Draft one.");
}

#[tokio::test]
async fn test_error_status_is_returned() {
    let (base_url, server) =
        serve_once("401 Unauthorized", "{\"error\":\"bad key\"}".to_string()).await;
    let client = OpenAIClient::new_with_base_url("wrong", &base_url).unwrap();

    let result = client
        .send_message_stream(
            &[Message::with_role(Role::User, "hi")],
            &GenerationParameters::new("gpt-4", 16),
        )
        .await;

    let err = match result {
        Ok(_) => panic!("a 401 must not open a stream"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("bad key"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_rotated_api_key_is_used() {
    let (base_url, server) = serve_once("200 OK", hello_body()).await;
    let client = OpenAIClient::new_with_base_url("old-key", &base_url).unwrap();
    client.set_api_key("new-key");

    let stream = client
        .send_message_stream(
            &[Message::with_role(Role::User, "hi")],
            &GenerationParameters::new("gpt-4", 16),
        )
        .await
        .unwrap();
    let _: Vec<_> = stream.collect().await;

    let request = server.await.unwrap().to_lowercase();
    assert!(request.contains("authorization: bearer new-key"));
}

#[tokio::test]
async fn test_agent_over_http() {
    let (base_url, server) = serve_once("200 OK", hello_body()).await;
    let client = Arc::new(OpenAIClient::new_with_base_url("test-key", &base_url).unwrap());
    let mut agent = Agent::new("Writer", client, GenerationParameters::new("gpt-4", 64), 4);
    agent.append_message(Role::System, "You write user stories.", false);

    let reply = agent.get_full_response("Draft one.").await.unwrap();
    assert_eq!(reply, "Hello");
    assert_eq!(
        agent.conversation().history().back().unwrap(),
        &Message::with_role(Role::Assistant, "Hello")
    );

    let body = request_body(&server.await.unwrap());
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
}
