//! The worker loop: epoch maintenance, request execution, and the
//! response path for read-only or failed transactions.

use std::{
    sync::Arc,
    thread,
    time::Duration,
};

use common::Status;
use database::TxExecutor;

use crate::{
    balancer::TransactionBalancer,
    metrics,
    protocol::{
        Procedure,
        RequestMessage,
        ResponseMessage,
    },
    session::SessionHandler,
};

/// Outcome of executing one request frame.
struct ExecutionResult {
    error_code: i32,
    content: String,
    session_id: Option<String>,
    read_only: bool,
}

impl ExecutionResult {
    fn error(error_code: i32, content: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            error_code,
            content: content.into(),
            session_id,
            read_only: false,
        }
    }
}

pub fn worker_task(
    mut executor: TxExecutor,
    balancer: Arc<TransactionBalancer>,
    sessions: Arc<SessionHandler>,
) {
    let worker_id = executor.worker_id();
    tracing::info!("Worker {worker_id} started");
    loop {
        // Epoch advancement, buffer publication, reclamation, pacing.
        executor.durable_epoch_work();
        if executor.quit_requested() {
            break;
        }
        let Some(json) = balancer.get_transaction(worker_id) else {
            thread::sleep(Duration::from_micros(10));
            continue;
        };
        metrics::log_request_dequeued();

        let result = execute_transaction(&mut executor, &sessions, &json);
        if let Some(session_id) = &result.session_id {
            if result.error_code != 0 {
                let response =
                    ResponseMessage::new(result.error_code, result.content.clone());
                sessions.send_response(session_id, &response);
            } else if result.read_only {
                // Read-only commits are not gated on durability. Write
                // commits are acked by the notifier once durable.
                let response = ResponseMessage::new(0, result.content.clone())
                    .with_read_values(&executor.nid.read_values);
                sessions.send_response(session_id, &response);
            }
        }
    }
    executor.terminate();
    tracing::info!("Worker {worker_id} stopped");
}

/// Parse, guard, and run one transaction, retrying internally on
/// validation aborts.
fn execute_transaction(
    executor: &mut TxExecutor,
    sessions: &SessionHandler,
    json: &str,
) -> ExecutionResult {
    let request: RequestMessage = match serde_json::from_str(json) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!("Malformed request: {err}");
            return ExecutionResult::error(
                -1,
                "Error: Unknown operation or malformed request.",
                None,
            );
        },
    };
    let session_id = request.client_session_id.clone();

    if !sessions.check_and_update_timestamp(&session_id, request.timestamp()) {
        tracing::warn!("Replay attack detected or old timestamp received");
        metrics::log_replay_rejected();
        return ExecutionResult::error(
            -1,
            "Error: Replay attack detected or old timestamp received.",
            Some(session_id),
        );
    }

    let procedures = match request.procedures() {
        Ok(procedures) => procedures,
        Err(content) => return ExecutionResult::error(-1, content, Some(session_id)),
    };

    loop {
        executor.durable_epoch_work();
        if executor.quit_requested() {
            return ExecutionResult::error(
                -1,
                "Error: Server is shutting down.",
                Some(session_id),
            );
        }
        executor.begin(&session_id);
        let mut error_content = String::new();

        for procedure in &procedures {
            let status = apply_procedure(executor, procedure, &mut error_content);
            if status != Status::Ok {
                executor.abort();
                error_content.push_str("Transaction has been aborted.\n");
                return ExecutionResult::error(-1, error_content, Some(session_id));
            }
        }

        let read_only = executor.is_read_only();
        if executor.commit() {
            return ExecutionResult {
                error_code: 0,
                content: "OK".to_owned(),
                session_id: Some(session_id),
                read_only,
            };
        }
        // Validation failure: transient, invisible to the client.
        tracing::trace!("Validation failed; retrying transaction");
    }
}

fn apply_procedure(
    executor: &mut TxExecutor,
    procedure: &Procedure,
    error_content: &mut String,
) -> Status {
    match procedure {
        Procedure::Insert { key, value } => {
            let status = executor.insert(key.as_bytes(), value.as_bytes());
            if status == Status::WarnAlreadyExists {
                error_content.push_str(&format!("Key: {key} is already exists\n"));
            }
            status
        },
        Procedure::Read { key } => match executor.read(key.as_bytes()) {
            Ok(value) => {
                executor
                    .nid
                    .read_values
                    .push((key.clone(), String::from_utf8_lossy(&value).into_owned()));
                Status::Ok
            },
            Err(status) => {
                if status == Status::WarnNotFound {
                    error_content.push_str(&format!("Key: {key} is not found\n"));
                }
                status
            },
        },
        Procedure::Write { key, value } => {
            let status = executor.write(key.as_bytes(), value.as_bytes());
            if status == Status::WarnNotFound {
                error_content.push_str(&format!("Key: {key} is not found\n"));
            }
            status
        },
        Procedure::Delete { key } => {
            let status = executor.delete(key.as_bytes());
            if status == Status::WarnNotFound {
                error_content.push_str(&format!("Key: {key} is not found\n"));
            }
            status
        },
        Procedure::Scan {
            left_key,
            l_exclusive,
            right_key,
            r_exclusive,
        } => match executor.scan(
            left_key.as_bytes(),
            *l_exclusive,
            right_key.as_bytes(),
            *r_exclusive,
        ) {
            Ok(entries) => {
                for (key, value) in entries {
                    executor.nid.read_values.push((
                        String::from_utf8_lossy(&key).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    ));
                }
                Status::Ok
            },
            Err(status) => status,
        },
    }
}
