/// worker support structs shared by the memory tier and the reload scheduler
///
use serde::{Deserialize, Serialize};

pub type JsonString = String;

pub const OK: &str = "ok";
pub const DOWN: &str = "down";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Busy,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub status: String,
    pub state: WorkerState,
    pub uptime: String,
    pub error_count: u16,
}

impl WorkerStatus {
    pub fn new(
        worker_id: String,
        status: String,
        state: WorkerState,
        uptime: String,
        error_count: u16,
    ) -> WorkerStatus {
        WorkerStatus {
            worker_id,
            status,
            state,
            uptime,
            error_count,
        }
    }

    /// the status as a json string; never fails
    pub fn to_json(&self) -> JsonString {
        match serde_json::to_string(self) {
            Ok(js) => js,
            Err(e) => format!(r#"{}"status":"json parse error: {:?}"{}"#, "{", e, "}"),
        }
    }
}
