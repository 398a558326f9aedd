use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 1;

pub mod wire;

pub use wire::{
    WireError, decode_channel_role, decode_request, decode_response, decode_update,
    encode_channel_role, encode_request, encode_response, encode_update,
};

/// Identifies which of the two kernel sockets a freshly-opened connection is.
///
/// The tag is the very first frame a kernel sends on each connection; nothing
/// else may precede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelRole {
    Main = 0,
    NotebookUpdates = 1,
}

impl ChannelRole {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChannelRole::Main),
            1 => Some(ChannelRole::NotebookUpdates),
            _ => None,
        }
    }
}

/// Server → kernel, on the main channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteRequest {
    StartKernel {
        req_id: u64,
    },
    QueueCell {
        req_id: u64,
        cell_id: u64,
        code: String,
    },
    CancelAll {
        req_id: u64,
    },
    Shutdown {
        req_id: u64,
    },
}

impl RemoteRequest {
    pub fn req_id(&self) -> u64 {
        match self {
            RemoteRequest::StartKernel { req_id }
            | RemoteRequest::QueueCell { req_id, .. }
            | RemoteRequest::CancelAll { req_id }
            | RemoteRequest::Shutdown { req_id } => *req_id,
        }
    }

    /// Shutdown is the distinguished request that ends the kernel's request
    /// stream once delivered.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RemoteRequest::Shutdown { .. })
    }
}

/// Kernel → server, on the main channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteResponse {
    KernelStarted {
        req_id: u64,
    },
    /// Generic completion for requests without a richer answer.
    UnitComplete {
        req_id: u64,
    },
    CellQueued {
        req_id: u64,
        cell_id: u64,
    },
    ResultValue {
        req_id: u64,
        cell_id: u64,
        mime: String,
        data: Vec<u8>,
    },
    /// Unsolicited; not tied to a request.
    KernelStatus {
        busy: bool,
    },
    Error {
        req_id: u64,
        message: String,
    },
    ShutdownAck {
        req_id: u64,
    },
}

impl RemoteResponse {
    pub fn req_id(&self) -> Option<u64> {
        match self {
            RemoteResponse::KernelStarted { req_id }
            | RemoteResponse::UnitComplete { req_id }
            | RemoteResponse::CellQueued { req_id, .. }
            | RemoteResponse::ResultValue { req_id, .. }
            | RemoteResponse::Error { req_id, .. }
            | RemoteResponse::ShutdownAck { req_id } => Some(*req_id),
            RemoteResponse::KernelStatus { .. } => None,
        }
    }
}

/// Server → kernel, on the notebook-updates channel.
///
/// Versions mirror the notebook's edit history: `global_version` is the
/// server's count, `local_version` the client edit the update was rebased
/// against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotebookUpdate {
    InsertCell {
        global_version: u32,
        local_version: u32,
        cell_id: u64,
        after: Option<u64>,
        language: String,
        content: String,
    },
    UpdateCell {
        global_version: u32,
        local_version: u32,
        cell_id: u64,
        content: String,
    },
    DeleteCell {
        global_version: u32,
        local_version: u32,
        cell_id: u64,
    },
    SetCellLanguage {
        global_version: u32,
        local_version: u32,
        cell_id: u64,
        language: String,
    },
}
