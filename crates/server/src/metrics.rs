use metrics::{
    log_counter,
    log_gauge,
    register_sealkv_counter,
    register_sealkv_gauge,
};

register_sealkv_gauge!(ACTIVE_SESSIONS, "Currently connected client sessions");
pub fn log_active_sessions(count: usize) {
    log_gauge(&ACTIVE_SESSIONS, count as f64);
}

register_sealkv_counter!(SESSIONS_ACCEPTED_TOTAL, "TLS sessions accepted");
pub fn log_session_accepted() {
    log_counter(&SESSIONS_ACCEPTED_TOTAL, 1);
}

register_sealkv_counter!(REQUEST_FRAMES_TOTAL, "Request frames received");
pub fn log_request_received() {
    log_counter(&REQUEST_FRAMES_TOTAL, 1);
}

register_sealkv_counter!(REQUESTS_DEQUEUED_TOTAL, "Requests picked up by workers");
pub fn log_request_dequeued() {
    log_counter(&REQUESTS_DEQUEUED_TOTAL, 1);
}

register_sealkv_counter!(REPLAYS_REJECTED_TOTAL, "Requests dropped by the timestamp guard");
pub fn log_replay_rejected() {
    log_counter(&REPLAYS_REJECTED_TOTAL, 1);
}
