use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use role_agent::app::{Unavailable, bootstrap};
use role_agent::config::Config;
use role_agent::prompt::VarType;
use role_agent::service::{
    CompletionProgress, CompletionRequest, CompletionService, PlatformClient, Rating,
    ServiceError,
};

struct Reply {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Reply {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn sse(events: &[serde_json::Value]) -> Self {
        let body = events
            .iter()
            .map(|e| format!("data: {e}\n\n"))
            .collect::<String>();
        Self {
            status: 200,
            content_type: "text/event-stream",
            body,
        }
    }
}

#[derive(Debug)]
struct Seen {
    request_line: String,
    authorization: String,
    body: String,
}

// Serves one canned reply per connection, in order, and returns what it saw.
fn serve(replies: Vec<Reply>) -> (String, JoinHandle<Vec<Seen>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let mut seen = Vec::new();
        for reply in replies {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut content_length = 0usize;
            let mut authorization = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((k, v)) = line.split_once(':') {
                    match k.trim().to_ascii_lowercase().as_str() {
                        "content-length" => content_length = v.trim().parse().unwrap(),
                        "authorization" => authorization = v.trim().to_string(),
                        _ => {}
                    }
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = reader.into_inner();
            let head = format!(
                "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.status,
                reply.content_type,
                reply.body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(reply.body.as_bytes()).unwrap();
            stream.flush().unwrap();

            seen.push(Seen {
                request_line: request_line.trim_end().to_string(),
                authorization,
                body: String::from_utf8(body).unwrap(),
            });
        }
        seen
    });
    (format!("http://{addr}/v1"), handle)
}

fn config(base: &str, workflow: bool) -> Config {
    let mut cfg = Config::default();
    cfg.api.api_url = base.to_string();
    cfg.api.app_id = "app".into();
    cfg.api.api_key = "secret".into();
    cfg.api.user = "tester".into();
    cfg.api.timeout_secs = 10;
    cfg.generation.is_workflow = workflow;
    cfg
}

fn query(q: &str) -> CompletionRequest {
    let mut req = CompletionRequest::default();
    req.inputs.insert("query".into(), q.into());
    req
}

#[test]
fn bootstrap_reads_parameters() {
    let (base, server) = serve(vec![Reply::json(
        200,
        serde_json::json!({
            "user_input_form": [
                {"text-input": {"label": "Query", "variable": "query", "required": true, "max_length": 200}},
                {"select": {"label": "Role", "variable": "role", "required": false, "options": ["CL", "PO"]}}
            ],
            "file_upload": {"image": {"enabled": true, "number_limits": 3, "transfer_methods": ["remote_url"]}},
            "system_parameters": {"image_file_size_limit": "10"}
        }),
    )]);
    let cfg = config(&base, false);
    let client = PlatformClient::new(&cfg).unwrap();
    let state = bootstrap(&cfg, &client).unwrap();

    let vars = &state.prompt_config.prompt_variables;
    assert_eq!(vars.len(), 2);
    assert_eq!(vars[0].key, "query");
    assert_eq!(vars[0].max_length, Some(200));
    assert_eq!(vars[1].var_type, VarType::Select);
    assert_eq!(vars[1].options, vec!["CL", "PO"]);
    assert!(state.vision.enabled);
    assert_eq!(state.vision.number_limits, 3);
    assert!(state.vision.accepts_remote_url());
    assert_eq!(state.vision.image_file_size_limit, 10);

    let seen = server.join().unwrap();
    assert_eq!(seen[0].request_line, "GET /v1/parameters?user=tester HTTP/1.1");
    assert_eq!(seen[0].authorization, "Bearer secret");
}

#[test]
fn missing_app_is_a_known_unavailable_reason() {
    let (base, server) = serve(vec![Reply::json(
        404,
        serde_json::json!({"code": "not_found", "message": "App not found", "status": 404}),
    )]);
    let cfg = config(&base, false);
    let client = PlatformClient::new(&cfg).unwrap();
    assert_eq!(bootstrap(&cfg, &client).unwrap_err(), Unavailable::NotFound);
    server.join().unwrap();
}

#[test]
fn completion_streams_chunks() {
    let (base, server) = serve(vec![Reply::sse(&[
        serde_json::json!({"event": "message", "task_id": "t-1", "message_id": "m-1", "answer": "Chapter "}),
        serde_json::json!({"event": "ping"}),
        serde_json::json!({"event": "message", "task_id": "t-1", "message_id": "m-1", "answer": "Lead"}),
        serde_json::json!({"event": "message_end", "task_id": "t-1", "message_id": "m-1"}),
    ])]);
    let client = PlatformClient::new(&config(&base, false)).unwrap();

    let mut progress = Vec::new();
    let out = client
        .complete(&query("Who am I?"), &AtomicBool::new(false), &mut |p| {
            progress.push(p)
        })
        .unwrap();

    assert_eq!(out.text, "Chapter Lead");
    assert_eq!(out.message_id.as_deref(), Some("m-1"));
    assert_eq!(out.task_id.as_deref(), Some("t-1"));
    assert_eq!(
        progress,
        vec![
            CompletionProgress::Started {
                task_id: "t-1".into()
            },
            CompletionProgress::Chunk("Chapter ".into()),
            CompletionProgress::Chunk("Lead".into()),
        ]
    );

    let seen = server.join().unwrap();
    assert_eq!(seen[0].request_line, "POST /v1/completion-messages HTTP/1.1");
    let body: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
    assert_eq!(body["inputs"]["query"], "Who am I?");
    assert_eq!(body["response_mode"], "streaming");
    assert_eq!(body["user"], "tester");
    assert!(body.get("files").is_none());
}

#[test]
fn workflow_run_uses_final_outputs() {
    let (base, server) = serve(vec![Reply::sse(&[
        serde_json::json!({"event": "workflow_started", "task_id": "wt-1", "data": {"id": "run-1"}}),
        serde_json::json!({"event": "workflow_finished", "task_id": "wt-1", "data": {"status": "succeeded", "outputs": {"text": "done"}}}),
    ])]);
    let client = PlatformClient::new(&config(&base, true)).unwrap();
    let out = client
        .complete(&query("q"), &AtomicBool::new(false), &mut |_| {})
        .unwrap();
    assert_eq!(out.text, "done");
    assert_eq!(out.task_id.as_deref(), Some("wt-1"));

    let seen = server.join().unwrap();
    assert_eq!(seen[0].request_line, "POST /v1/workflows/run HTTP/1.1");
}

#[test]
fn stream_error_event_fails_the_request() {
    let (base, server) = serve(vec![Reply::sse(&[serde_json::json!({
        "event": "error", "status": 400, "code": "invalid_param", "message": "query is required"
    })])]);
    let client = PlatformClient::new(&config(&base, false)).unwrap();
    let err = client
        .complete(&query(""), &AtomicBool::new(false), &mut |_| {})
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Status {
            status: 400,
            message: "query is required".into()
        }
    );
    server.join().unwrap();
}

#[test]
fn feedback_and_stop_post_to_the_right_paths() {
    let (base, server) = serve(vec![
        Reply::json(200, serde_json::json!({"result": "success"})),
        Reply::json(200, serde_json::json!({"result": "success"})),
        Reply::json(200, serde_json::json!({"result": "success"})),
    ]);
    let client = PlatformClient::new(&config(&base, false)).unwrap();
    client.feedback("m-1", Some(Rating::Like)).unwrap();
    client.feedback("m-1", None).unwrap();
    client.stop("t-1").unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].request_line, "POST /v1/messages/m-1/feedbacks HTTP/1.1");
    let like: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
    assert_eq!(like["rating"], "like");
    let cleared: serde_json::Value = serde_json::from_str(&seen[1].body).unwrap();
    assert!(cleared["rating"].is_null());
    assert_eq!(seen[2].request_line, "POST /v1/completion-messages/t-1/stop HTTP/1.1");
}
