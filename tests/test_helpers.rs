use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::{DynamicImage, ImageFormat};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// What the mock server pushes over the socket after a prompt is queued.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(dead_code)]
pub enum Script {
    /// Progress, node execution, then `executing` with `node: null`.
    Complete,
    /// A completion for an unrelated prompt first, then the real one.
    StaleThenComplete,
    /// Progress, then the server closes the socket.
    CloseEarly,
    /// Progress only; the socket stays open.
    Silent,
    /// `execution_success` while the history entry is still missing, which
    /// appears 150 ms later, followed by `executing` with `node: null`.
    SuccessBeforeHistory,
    /// The job fails on the server with `execution_error`.
    ExecutionError,
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub script: Script,
    /// Output images as `(filename, bytes)`, reported in this order.
    pub images: Vec<(String, Vec<u8>)>,
    /// `temp` preview images, reported after the outputs.
    pub previews: Vec<(String, Vec<u8>)>,
    /// Reject `/prompt` with this status and body.
    pub reject: Option<(u16, String)>,
    /// Accept `/prompt` with 200 but report these `node_errors`.
    pub node_errors: Option<Value>,
    /// `/history/<id>` answers `{}`.
    pub omit_history: bool,
}

impl Behavior {
    pub fn with_images(images: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            script: Script::Complete,
            images,
            previews: Vec::new(),
            reject: None,
            node_errors: None,
            omit_history: false,
        }
    }

    #[allow(dead_code)]
    pub fn script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }
}

enum Frame {
    Text(String),
    Close,
}

enum Step {
    Send(Frame),
    Pause(Duration),
    PublishHistory,
}

/// A multipart `/upload/image` request as the mock received it.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub fields: HashMap<String, String>,
}

pub struct MockState {
    behavior: Behavior,
    sockets: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
    pub ws_client_ids: Mutex<Vec<String>>,
    pub prompt_client_ids: Mutex<Vec<String>>,
    pub last_prompt: Mutex<Option<Value>>,
    pub uploads: Mutex<Vec<Upload>>,
    pub free_requests: Mutex<Vec<Value>>,
    pub interrupt_requests: AtomicUsize,
    pub history_requests: AtomicUsize,
    pub view_requests: AtomicUsize,
    hidden_history: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl MockState {
    pub fn history_count(&self) -> usize {
        self.history_requests.load(Ordering::SeqCst)
    }

    pub fn view_count(&self) -> usize {
        self.view_requests.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupt_requests.load(Ordering::SeqCst)
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Start a mock ComfyUI server on an ephemeral port. Returns its `host:port`.
pub async fn start_mock(behavior: Behavior) -> (String, Arc<MockState>) {
    let state = Arc::new(MockState {
        behavior,
        sockets: Mutex::new(HashMap::new()),
        ws_client_ids: Mutex::new(Vec::new()),
        prompt_client_ids: Mutex::new(Vec::new()),
        last_prompt: Mutex::new(None),
        uploads: Mutex::new(Vec::new()),
        free_requests: Mutex::new(Vec::new()),
        interrupt_requests: AtomicUsize::new(0),
        history_requests: AtomicUsize::new(0),
        view_requests: AtomicUsize::new(0),
        hidden_history: Mutex::new(HashSet::new()),
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/prompt", post(prompt_handler))
        .route("/history/:prompt_id", get(history_handler))
        .route("/view", get(view_handler))
        .route("/upload/image", post(upload_handler))
        .route("/free", post(free_handler))
        .route("/interrupt", post(interrupt_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr.to_string(), state)
}

/// An address nothing listens on.
pub async fn unused_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<MockState>>,
) -> Response {
    let client_id = query.get("clientId").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_socket(socket, state, client_id))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<MockState>, client_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.sockets.lock().unwrap().insert(client_id.clone(), tx);
    state.ws_client_ids.lock().unwrap().push(client_id);

    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}});
    if socket.send(Message::Text(status.to_string())).await.is_err() {
        return;
    }

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Text(text) => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Frame::Close => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

fn script_steps(script: Script, prompt_id: &str) -> Vec<Step> {
    let send = |value: Value| Step::Send(Frame::Text(value.to_string()));
    let progress = |value: u32| {
        send(json!({"type": "progress", "data": {"value": value, "max": 2, "prompt_id": prompt_id}}))
    };
    let executing =
        |node: Value, pid: &str| send(json!({"type": "executing", "data": {"node": node, "prompt_id": pid}}));

    match script {
        Script::Complete => vec![
            executing(json!("5"), prompt_id),
            progress(1),
            progress(2),
            executing(Value::Null, prompt_id),
        ],
        Script::StaleThenComplete => vec![
            executing(Value::Null, "stale-prompt"),
            progress(1),
            executing(Value::Null, prompt_id),
        ],
        Script::CloseEarly => vec![progress(1), Step::Send(Frame::Close)],
        Script::Silent => vec![progress(1)],
        Script::SuccessBeforeHistory => vec![
            executing(json!("5"), prompt_id),
            progress(1),
            progress(2),
            send(json!({"type": "execution_success", "data": {"prompt_id": prompt_id}})),
            Step::Pause(Duration::from_millis(150)),
            Step::PublishHistory,
            executing(Value::Null, prompt_id),
        ],
        Script::ExecutionError => vec![
            executing(json!("5"), prompt_id),
            send(json!({
                "type": "execution_error",
                "data": {
                    "prompt_id": prompt_id,
                    "node_id": "5",
                    "exception_message": "CUDA out of memory"
                }
            })),
        ],
    }
}

async fn prompt_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if let Some((status, message)) = &state.behavior.reject {
        let code = StatusCode::from_u16(*status).unwrap();
        return (code, message.clone()).into_response();
    }

    let client_id = body["client_id"].as_str().unwrap_or_default().to_string();
    state.prompt_client_ids.lock().unwrap().push(client_id.clone());
    *state.last_prompt.lock().unwrap() = Some(body["prompt"].clone());

    let prompt_id = uuid::Uuid::new_v4().to_string();
    if let Some(errors) = &state.behavior.node_errors {
        return Json(json!({"prompt_id": prompt_id, "number": 1, "node_errors": errors}))
            .into_response();
    }
    if state.behavior.script == Script::SuccessBeforeHistory {
        state.hidden_history.lock().unwrap().insert(prompt_id.clone());
    }
    let script = state.behavior.script;
    let pid = prompt_id.clone();
    let st = state.clone();
    tokio::spawn(async move {
        // The upgrade callback can run after the client already posted.
        let mut tx = None;
        for _ in 0..200 {
            let registered = st.sockets.lock().unwrap().get(&client_id).cloned();
            if registered.is_some() {
                tx = registered;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let Some(tx) = tx else { return };
        for step in script_steps(script, &pid) {
            match step {
                Step::Send(frame) => {
                    let _ = tx.send(frame);
                }
                Step::Pause(delay) => tokio::time::sleep(delay).await,
                Step::PublishHistory => {
                    st.hidden_history.lock().unwrap().remove(&pid);
                }
            }
        }
    });

    Json(json!({"prompt_id": prompt_id, "number": 1, "node_errors": {}})).into_response()
}

async fn history_handler(
    State(state): State<Arc<MockState>>,
    Path(prompt_id): Path<String>,
) -> Json<Value> {
    state.history_requests.fetch_add(1, Ordering::SeqCst);
    let hidden = state.hidden_history.lock().unwrap().contains(&prompt_id);
    if hidden || state.behavior.omit_history {
        return Json(json!({}));
    }

    let refs = |list: &[(String, Vec<u8>)], folder: &str| -> Vec<Value> {
        list.iter()
            .map(|(name, _)| json!({"filename": name, "subfolder": "", "type": folder}))
            .collect()
    };
    let mut outputs = serde_json::Map::new();
    if !state.behavior.images.is_empty() {
        outputs.insert("9".into(), json!({"images": refs(&state.behavior.images, "output")}));
    }
    if !state.behavior.previews.is_empty() {
        outputs.insert("12".into(), json!({"images": refs(&state.behavior.previews, "temp")}));
    }
    let outputs = Value::Object(outputs);
    let mut body = serde_json::Map::new();
    body.insert(
        prompt_id,
        json!({
            "status": {"status_str": "success", "completed": true},
            "outputs": outputs
        }),
    );
    Json(Value::Object(body))
}

async fn view_handler(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.view_requests.fetch_add(1, Ordering::SeqCst);
    let filename = query.get("filename").cloned().unwrap_or_default();
    let folder = match query.get("type").map(String::as_str) {
        Some("temp") => &state.behavior.previews,
        _ => &state.behavior.images,
    };
    match folder.iter().find(|(name, _)| *name == filename) {
        Some((_, bytes)) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn upload_handler(State(state): State<Arc<MockState>>, mut multipart: Multipart) -> Response {
    let mut upload = Upload::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            upload.filename = field.file_name().unwrap_or_default().to_string();
            upload.bytes = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        } else {
            let value = field.text().await.unwrap_or_default();
            upload.fields.insert(name, value);
        }
    }
    let name = upload.filename.clone();
    state.uploads.lock().unwrap().push(upload);
    Json(json!({"name": name, "subfolder": "", "type": "input"})).into_response()
}

async fn free_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    state.free_requests.lock().unwrap().push(body);
    StatusCode::OK
}

async fn interrupt_handler(State(state): State<Arc<MockState>>) -> StatusCode {
    state.interrupt_requests.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}
