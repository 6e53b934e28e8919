//! Local control socket.
//!
//! One newline-terminated JSON request per connection, one JSON response back.
//! The socket is how the OS integration reports idle time and power events and
//! how the worker lists and answers prompts.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use timeclock_daemon_protocol::{
    parse_answer, parse_configure, parse_params, ErrorInfo, Method, PowerEventKind,
    PowerEventParams, ReportActivityParams, Request, Response, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};

use crate::agent::{Agent, TickOutcome};
use crate::backoff::RelaunchBackoff;
use crate::clock::Clock;
use crate::probe::ActivityTracker;
use crate::prompt::PromptRegistry;
use crate::restart::AgentSlot;

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 4096;

/// Everything a request handler may touch.
pub struct IpcContext {
    pub slot: Arc<AgentSlot>,
    pub prompts: Arc<PromptRegistry>,
    pub activity: Arc<ActivityTracker>,
    pub clock: Arc<dyn Clock>,
    pub backoff: Arc<RelaunchBackoff>,
}

pub async fn serve(listener: UnixListener, context: Arc<IpcContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let context = Arc::clone(&context);
                    tokio::spawn(async move { handle_connection(stream, context).await });
                }
                Err(err) => warn!(error = %err, "Failed to accept control connection"),
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, context: Arc<IpcContext>) {
    let response = match read_request(&mut stream).await {
        Ok(request) => {
            debug!(method = ?request.method, id = ?request.id, "Control request received");
            handle_request(request, &context).await
        }
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            Response::error_with_info(None, err)
        }
    };
    if let Err(err) = write_response(&mut stream, &response).await {
        debug!(error = %err, "Failed to write response");
    }
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    stream.flush().await
}

async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Request, ErrorInfo> {
    let frame = tokio::time::timeout(READ_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| ErrorInfo::new("read_timeout", "request timed out"))??;
    decode_request(&frame)
}

/// Reads up to the first newline (or EOF), enforcing the size cap.
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, ErrorInfo> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = stream.read(&mut chunk).await.map_err(|err| {
            ErrorInfo::new("read_error", format!("failed to read request: {}", err))
        })?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(ErrorInfo::new(
                "request_too_large",
                "request exceeded maximum size",
            ));
        }
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }
    Ok(buffer)
}

fn decode_request(buffer: &[u8]) -> Result<Request, ErrorInfo> {
    let line = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer,
    };
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub async fn handle_request(request: Request, context: &IpcContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }
    let id = request.id;

    match request.method {
        Method::GetHealth => {
            let agent = context.slot.current();
            let mut data = json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "generation": agent.as_ref().map(|agent| agent.generation()),
                "relaunch_pending": agent.as_ref().is_some_and(|agent| agent.restart.is_requested()),
                "relaunches": context.slot.relaunches(),
            });
            if let Ok(value) = serde_json::to_value(context.backoff.snapshot()) {
                data["backoff"] = value;
            }
            Response::ok(id, data)
        }
        Method::GetStatus => match current_agent(context) {
            Ok(agent) => serialize(id, "status", &agent.status()),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ListPrompts => serialize(id, "prompts", &context.prompts.list()),
        Method::AnswerPrompt => {
            let parsed = match parse_answer(request.params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            match context.prompts.answer(parsed.id, parsed.answer) {
                Ok(()) => Response::ok(id, json!({ "answered": parsed.id })),
                Err(err) => Response::error_with_info(id, err),
            }
        }
        Method::ReportActivity => {
            let parsed: ReportActivityParams = match parse_params(request.params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            let now = context.clock.now();
            context.activity.report(parsed.idle_secs, now);
            debug!(idle_secs = parsed.idle_secs, "Activity reported");
            Response::ok(
                id,
                json!({ "worker_active": context.activity.is_active(now) }),
            )
        }
        Method::PowerEvent => {
            let parsed: PowerEventParams = match parse_params(request.params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            let agent = match current_agent(context) {
                Ok(agent) => agent,
                Err(err) => return Response::error_with_info(id, err),
            };
            match parsed.event {
                PowerEventKind::Suspend => {
                    let recorded = agent.on_suspend();
                    Response::ok(id, json!({ "event": "suspend", "break_marker": recorded }))
                }
                PowerEventKind::Resume => {
                    let resumed = Arc::clone(&agent);
                    agent.spawn(async move {
                        resumed.on_resume().await;
                    });
                    Response::ok(id, json!({ "event": "resume", "accepted": true }))
                }
            }
        }
        Method::Configure => {
            let parsed = match parse_configure(request.params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(id, err),
            };
            let agent = match current_agent(context) {
                Ok(agent) => agent,
                Err(err) => return Response::error_with_info(id, err),
            };
            match agent
                .configure(parsed.email.trim(), parsed.team_name.trim())
                .await
            {
                Ok(identity) => serialize(id, "identity", &identity),
                Err(err) => Response::error_with_info(id, err),
            }
        }
        Method::SyncNow => match current_agent(context) {
            Ok(agent) => Response::ok(id, outcome_value(agent.tick().await)),
            Err(err) => Response::error_with_info(id, err),
        },
    }
}

fn current_agent(context: &IpcContext) -> Result<Arc<Agent>, ErrorInfo> {
    context
        .slot
        .current()
        .ok_or_else(|| ErrorInfo::new("agent_unavailable", "agent is starting"))
}

fn serialize<T: Serialize>(id: Option<String>, what: &str, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn outcome_value(outcome: TickOutcome) -> Value {
    let (label, action) = match outcome {
        TickOutcome::Busy => ("busy", None),
        TickOutcome::Suspended => ("suspended", None),
        TickOutcome::Unconfigured => ("unconfigured", None),
        TickOutcome::Anomaly => ("anomaly", None),
        TickOutcome::Relaunching => ("relaunching", None),
        TickOutcome::Acted(action) => ("acted", Some(format!("{:?}", action))),
    };
    json!({ "outcome": label, "action": action })
}
