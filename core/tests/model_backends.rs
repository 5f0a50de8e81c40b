//! HTTP-level behavior of the Ollama and LM Studio backends against a
//! mock server.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use vigil_core::client::ChatMessage;
use vigil_core::client::ChatRequest;
use vigil_core::client::ModelClient;
use vigil_core::client::ModelResponse;
use vigil_core::config::LlmBackend;
use vigil_core::config::LlmConfig;
use vigil_core::error::LlmError;
use vigil_core::lmstudio::LmStudioClient;
use vigil_core::ollama::OllamaClient;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn llm_config(uri: &str, backend: LlmBackend, model: Option<&str>) -> LlmConfig {
    let rest = uri.strip_prefix("http://").expect("mock server uri");
    let (host, port) = rest.split_once(':').expect("host:port");
    LlmConfig {
        backend,
        host: host.to_string(),
        port: port.parse().expect("port"),
        model: model.map(str::to_string),
        timeout: Duration::from_secs(5),
        context_limit: None,
    }
}

fn messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("system"),
        ChatMessage::user("analyze this"),
    ]
}

fn request(messages: &[ChatMessage]) -> ChatRequest<'_> {
    ChatRequest {
        messages,
        tools: None,
        max_retries: 3,
    }
}

async fn mount_ollama_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [ { "name": "qwen3:4b" }, { "name": "mistral" } ]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/show"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "modelinfo": { "qwen3.context_length": 8192 }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn ollama_connect_discovers_the_context_window() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;

    let client = OllamaClient::new(llm_config(
        &server.uri(),
        LlmBackend::Ollama,
        Some("qwen3"),
    ));
    client.connect().await.expect("connect");
    assert_eq!(client.context_limit().expect("limit"), 8192);
}

#[tokio::test]
async fn ollama_rejects_a_missing_model() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;

    let client = OllamaClient::new(llm_config(
        &server.uri(),
        LlmBackend::Ollama,
        Some("nonexistent"),
    ));
    let err = client.connect().await.expect_err("missing model");
    assert!(matches!(err, LlmError::Backend { .. }));
    assert!(err.to_string().contains("nonexistent"));
}

#[tokio::test]
async fn ollama_parses_a_final_answer() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "role": "assistant",
                "content": "{\"issues\": [{\"file\": \"a.py\", \"line_number\": 3, \"description\": \"X\", \"code_snippet\": \"y=1\"}]}"
            }
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::new(llm_config(&server.uri(), LlmBackend::Ollama, Some("qwen3")));
    client.connect().await.expect("connect");

    let msgs = messages();
    match client.query(request(&msgs)).await.expect("query") {
        ModelResponse::Final(reports) => {
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].file, "a.py");
            assert_eq!(reports[0].line_number, 3);
        }
        other => panic!("expected final answer, got {other:?}"),
    }
}

#[tokio::test]
async fn ollama_maps_structured_tool_calls() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    { "function": { "name": "read_file", "arguments": { "file_path": "src/lib.rs" } } }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::new(llm_config(&server.uri(), LlmBackend::Ollama, Some("qwen3")));
    client.connect().await.expect("connect");

    let msgs = messages();
    match client.query(request(&msgs)).await.expect("query") {
        ModelResponse::ToolCalls(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "read_file");
            assert_eq!(calls[0].arguments["file_path"], "src/lib.rs");
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
}

#[tokio::test]
async fn ollama_classifies_context_overflow() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string("the prompt exceeds the available context length"),
        )
        .mount(&server)
        .await;

    let client = OllamaClient::new(llm_config(&server.uri(), LlmBackend::Ollama, Some("qwen3")));
    client.connect().await.expect("connect");

    let msgs = messages();
    let err = client.query(request(&msgs)).await.expect_err("overflow");
    assert!(matches!(err, LlmError::ContextOverflow { .. }));
}

#[tokio::test]
async fn ollama_reports_connection_loss() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;
    let client = OllamaClient::new(llm_config(&server.uri(), LlmBackend::Ollama, Some("qwen3")));
    client.connect().await.expect("connect");

    // The backend goes away.
    drop(server);

    let msgs = messages();
    let err = client.query(request(&msgs)).await.expect_err("lost backend");
    assert!(matches!(err, LlmError::Connection { .. }));
}

#[tokio::test]
async fn ollama_recovers_malformed_output_via_self_fix() {
    let server = MockServer::start().await;
    mount_ollama_discovery(&server).await;
    // First chat response is prose; the follow-up fix request returns
    // clean JSON.
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "assistant", "content": "Sure! I found one issue in a.py." }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "role": "assistant",
                "content": "{\"issues\": [{\"file\": \"a.py\", \"line_number\": 1, \"description\": \"recovered\"}]}"
            }
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::new(llm_config(&server.uri(), LlmBackend::Ollama, Some("qwen3")));
    client.connect().await.expect("connect");

    let msgs = messages();
    match client.query(request(&msgs)).await.expect("query") {
        ModelResponse::Final(reports) => {
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].description, "recovered");
        }
        other => panic!("expected recovered answer, got {other:?}"),
    }
}

async fn mount_lmstudio_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ { "id": "local-model", "context_length": 4096 } ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn lmstudio_connects_and_parses_a_fenced_answer() {
    let server = MockServer::start().await;
    mount_lmstudio_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [ { "message": {
                "role": "assistant",
                "content": "```json\n{\"issues\": []}\n```"
            } } ]
        })))
        .mount(&server)
        .await;

    let client = LmStudioClient::new(llm_config(&server.uri(), LlmBackend::LmStudio, None));
    client.connect().await.expect("connect");
    assert_eq!(client.context_limit().expect("limit"), 4096);

    let msgs = messages();
    match client.query(request(&msgs)).await.expect("query") {
        ModelResponse::Final(reports) => assert!(reports.is_empty()),
        other => panic!("expected empty final answer, got {other:?}"),
    }
}

#[tokio::test]
async fn lmstudio_decodes_string_encoded_tool_arguments() {
    let server = MockServer::start().await;
    mount_lmstudio_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [ { "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [ {
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "search_text", "arguments": "{\"patterns\": \"needle\"}" }
                } ]
            } } ]
        })))
        .mount(&server)
        .await;

    let client = LmStudioClient::new(llm_config(&server.uri(), LlmBackend::LmStudio, None));
    client.connect().await.expect("connect");

    let msgs = messages();
    match client.query(request(&msgs)).await.expect("query") {
        ModelResponse::ToolCalls(calls) => {
            assert_eq!(calls[0].name, "search_text");
            assert_eq!(calls[0].arguments["patterns"], "needle");
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
}

#[tokio::test]
async fn lmstudio_configured_limit_overrides_discovery() {
    let server = MockServer::start().await;
    mount_lmstudio_discovery(&server).await;

    let mut config = llm_config(&server.uri(), LlmBackend::LmStudio, Some("local-model"));
    config.context_limit = Some(2048);
    let client = LmStudioClient::new(config);
    client.connect().await.expect("connect");
    assert_eq!(client.context_limit().expect("limit"), 2048);
}
