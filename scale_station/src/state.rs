use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::scale::WeightReading;

pub type SharedSnapshot = Arc<Mutex<Snapshot>>;
pub type CommandQueue = Arc<Mutex<VecDeque<Command>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Locked,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Locked => "locked",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Standby,
    NoFrame,
    WaitingForObject,
    Locked,
}

impl StatusKind {
    pub fn message(&self) -> &'static str {
        match self {
            StatusKind::Standby => "system standby",
            StatusKind::NoFrame => "no frame from camera",
            StatusKind::WaitingForObject => "waiting for object",
            StatusKind::Locked => "result locked, reset to scan again",
        }
    }
}

/// What the dashboard shows right now. Rebuilt by the pipeline every tick;
/// the frame travels separately through the video feed.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub phase: Phase,
    pub status: StatusKind,
    pub message: String,
    #[serde(skip)]
    pub frame: Option<Bytes>,
    pub label: Option<String>,
    pub display_name: Option<String>,
    pub weight: WeightReading,
    pub detail_url: Option<String>,
    pub episode: Option<u64>,
    pub redirect_issued: bool,
    pub scale_connected: bool,
    pub last_error: Option<String>,
}

impl Snapshot {
    pub fn startup() -> Self {
        Self {
            phase: Phase::Idle,
            status: StatusKind::Standby,
            message: StatusKind::Standby.message().to_string(),
            frame: None,
            label: None,
            display_name: None,
            weight: WeightReading::default(),
            detail_url: None,
            episode: None,
            redirect_issued: false,
            scale_connected: false,
            last_error: None,
        }
    }
}

/// Control-surface input, queued by the HTTP layer and drained by the
/// pipeline worker at the top of each tick.
#[derive(Clone, Debug)]
pub enum Command {
    Start {
        camera_index: Option<i32>,
        confidence_threshold: Option<f32>,
    },
    Stop,
    Reset,
    ConnectScale {
        port: String,
        baud: u32,
    },
    DisconnectScale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_excludes_the_frame() {
        let mut snapshot = Snapshot::startup();
        snapshot.frame = Some(Bytes::from_static(b"\xff\xd8jpeg"));

        let value = serde_json::to_value(&snapshot).unwrap();

        assert!(value.get("frame").is_none());
        assert_eq!(value["phase"], "idle");
        assert_eq!(value["status"], "standby");
        assert_eq!(value["weight"]["grams"], 0.0);
    }
}
