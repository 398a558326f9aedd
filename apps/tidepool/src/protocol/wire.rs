use super::{ChannelRole, NotebookUpdate, PROTOCOL_VERSION, RemoteRequest, RemoteResponse};

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

const REQUEST_KIND_START_KERNEL: u8 = 0;
const REQUEST_KIND_QUEUE_CELL: u8 = 1;
const REQUEST_KIND_CANCEL_ALL: u8 = 2;
const REQUEST_KIND_SHUTDOWN: u8 = 3;

const RESPONSE_KIND_KERNEL_STARTED: u8 = 0;
const RESPONSE_KIND_UNIT_COMPLETE: u8 = 1;
const RESPONSE_KIND_CELL_QUEUED: u8 = 2;
const RESPONSE_KIND_RESULT_VALUE: u8 = 3;
const RESPONSE_KIND_KERNEL_STATUS: u8 = 4;
const RESPONSE_KIND_ERROR: u8 = 5;
const RESPONSE_KIND_SHUTDOWN_ACK: u8 = 6;

const UPDATE_KIND_INSERT_CELL: u8 = 0;
const UPDATE_KIND_UPDATE_CELL: u8 = 1;
const UPDATE_KIND_DELETE_CELL: u8 = 2;
const UPDATE_KIND_SET_CELL_LANGUAGE: u8 = 3;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

/// The channel tag is a bare byte rather than a framed message: both peers
/// know the encoding before any codec negotiation could happen.
pub fn encode_channel_role(role: ChannelRole) -> Vec<u8> {
    vec![role.as_u8()]
}

pub fn decode_channel_role(bytes: &[u8]) -> Result<ChannelRole, WireError> {
    let mut cursor = Cursor::new(bytes);
    let value = cursor.read_u8()?;
    if cursor.remaining() != 0 {
        return Err(WireError::InvalidData("trailing bytes after channel role"));
    }
    ChannelRole::from_u8(value).ok_or(WireError::InvalidData("invalid channel role"))
}

pub fn encode_request(request: &RemoteRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    match request {
        RemoteRequest::StartKernel { req_id } => {
            write_header(&mut buf, REQUEST_KIND_START_KERNEL);
            write_var_u64(&mut buf, *req_id);
        }
        RemoteRequest::QueueCell {
            req_id,
            cell_id,
            code,
        } => {
            write_header(&mut buf, REQUEST_KIND_QUEUE_CELL);
            write_var_u64(&mut buf, *req_id);
            write_var_u64(&mut buf, *cell_id);
            write_string(&mut buf, code);
        }
        RemoteRequest::CancelAll { req_id } => {
            write_header(&mut buf, REQUEST_KIND_CANCEL_ALL);
            write_var_u64(&mut buf, *req_id);
        }
        RemoteRequest::Shutdown { req_id } => {
            write_header(&mut buf, REQUEST_KIND_SHUTDOWN);
            write_var_u64(&mut buf, *req_id);
        }
    }
    buf
}

pub fn decode_request(bytes: &[u8]) -> Result<RemoteRequest, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    match kind {
        REQUEST_KIND_START_KERNEL => {
            let req_id = cursor.read_var_u64()?;
            Ok(RemoteRequest::StartKernel { req_id })
        }
        REQUEST_KIND_QUEUE_CELL => {
            let req_id = cursor.read_var_u64()?;
            let cell_id = cursor.read_var_u64()?;
            let code = read_string(&mut cursor)?;
            Ok(RemoteRequest::QueueCell {
                req_id,
                cell_id,
                code,
            })
        }
        REQUEST_KIND_CANCEL_ALL => {
            let req_id = cursor.read_var_u64()?;
            Ok(RemoteRequest::CancelAll { req_id })
        }
        REQUEST_KIND_SHUTDOWN => {
            let req_id = cursor.read_var_u64()?;
            Ok(RemoteRequest::Shutdown { req_id })
        }
        other => Err(WireError::UnknownFrameType(other)),
    }
}

pub fn encode_response(response: &RemoteResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    match response {
        RemoteResponse::KernelStarted { req_id } => {
            write_header(&mut buf, RESPONSE_KIND_KERNEL_STARTED);
            write_var_u64(&mut buf, *req_id);
        }
        RemoteResponse::UnitComplete { req_id } => {
            write_header(&mut buf, RESPONSE_KIND_UNIT_COMPLETE);
            write_var_u64(&mut buf, *req_id);
        }
        RemoteResponse::CellQueued { req_id, cell_id } => {
            write_header(&mut buf, RESPONSE_KIND_CELL_QUEUED);
            write_var_u64(&mut buf, *req_id);
            write_var_u64(&mut buf, *cell_id);
        }
        RemoteResponse::ResultValue {
            req_id,
            cell_id,
            mime,
            data,
        } => {
            write_header(&mut buf, RESPONSE_KIND_RESULT_VALUE);
            write_var_u64(&mut buf, *req_id);
            write_var_u64(&mut buf, *cell_id);
            write_string(&mut buf, mime);
            write_bytes(&mut buf, data);
        }
        RemoteResponse::KernelStatus { busy } => {
            write_header(&mut buf, RESPONSE_KIND_KERNEL_STATUS);
            buf.push(*busy as u8);
        }
        RemoteResponse::Error { req_id, message } => {
            write_header(&mut buf, RESPONSE_KIND_ERROR);
            write_var_u64(&mut buf, *req_id);
            write_string(&mut buf, message);
        }
        RemoteResponse::ShutdownAck { req_id } => {
            write_header(&mut buf, RESPONSE_KIND_SHUTDOWN_ACK);
            write_var_u64(&mut buf, *req_id);
        }
    }
    buf
}

pub fn decode_response(bytes: &[u8]) -> Result<RemoteResponse, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    match kind {
        RESPONSE_KIND_KERNEL_STARTED => {
            let req_id = cursor.read_var_u64()?;
            Ok(RemoteResponse::KernelStarted { req_id })
        }
        RESPONSE_KIND_UNIT_COMPLETE => {
            let req_id = cursor.read_var_u64()?;
            Ok(RemoteResponse::UnitComplete { req_id })
        }
        RESPONSE_KIND_CELL_QUEUED => {
            let req_id = cursor.read_var_u64()?;
            let cell_id = cursor.read_var_u64()?;
            Ok(RemoteResponse::CellQueued { req_id, cell_id })
        }
        RESPONSE_KIND_RESULT_VALUE => {
            let req_id = cursor.read_var_u64()?;
            let cell_id = cursor.read_var_u64()?;
            let mime = read_string(&mut cursor)?;
            let data = read_bytes(&mut cursor)?;
            Ok(RemoteResponse::ResultValue {
                req_id,
                cell_id,
                mime,
                data,
            })
        }
        RESPONSE_KIND_KERNEL_STATUS => {
            let busy = cursor.read_bool()?;
            Ok(RemoteResponse::KernelStatus { busy })
        }
        RESPONSE_KIND_ERROR => {
            let req_id = cursor.read_var_u64()?;
            let message = read_string(&mut cursor)?;
            Ok(RemoteResponse::Error { req_id, message })
        }
        RESPONSE_KIND_SHUTDOWN_ACK => {
            let req_id = cursor.read_var_u64()?;
            Ok(RemoteResponse::ShutdownAck { req_id })
        }
        other => Err(WireError::UnknownFrameType(other)),
    }
}

pub fn encode_update(update: &NotebookUpdate) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    match update {
        NotebookUpdate::InsertCell {
            global_version,
            local_version,
            cell_id,
            after,
            language,
            content,
        } => {
            write_header(&mut buf, UPDATE_KIND_INSERT_CELL);
            write_var_u32(&mut buf, *global_version);
            write_var_u32(&mut buf, *local_version);
            write_var_u64(&mut buf, *cell_id);
            buf.push(after.is_some() as u8);
            if let Some(after) = after {
                write_var_u64(&mut buf, *after);
            }
            write_string(&mut buf, language);
            write_string(&mut buf, content);
        }
        NotebookUpdate::UpdateCell {
            global_version,
            local_version,
            cell_id,
            content,
        } => {
            write_header(&mut buf, UPDATE_KIND_UPDATE_CELL);
            write_var_u32(&mut buf, *global_version);
            write_var_u32(&mut buf, *local_version);
            write_var_u64(&mut buf, *cell_id);
            write_string(&mut buf, content);
        }
        NotebookUpdate::DeleteCell {
            global_version,
            local_version,
            cell_id,
        } => {
            write_header(&mut buf, UPDATE_KIND_DELETE_CELL);
            write_var_u32(&mut buf, *global_version);
            write_var_u32(&mut buf, *local_version);
            write_var_u64(&mut buf, *cell_id);
        }
        NotebookUpdate::SetCellLanguage {
            global_version,
            local_version,
            cell_id,
            language,
        } => {
            write_header(&mut buf, UPDATE_KIND_SET_CELL_LANGUAGE);
            write_var_u32(&mut buf, *global_version);
            write_var_u32(&mut buf, *local_version);
            write_var_u64(&mut buf, *cell_id);
            write_string(&mut buf, language);
        }
    }
    buf
}

pub fn decode_update(bytes: &[u8]) -> Result<NotebookUpdate, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    match kind {
        UPDATE_KIND_INSERT_CELL => {
            let global_version = cursor.read_var_u32()?;
            let local_version = cursor.read_var_u32()?;
            let cell_id = cursor.read_var_u64()?;
            let after = if cursor.read_bool()? {
                Some(cursor.read_var_u64()?)
            } else {
                None
            };
            let language = read_string(&mut cursor)?;
            let content = read_string(&mut cursor)?;
            Ok(NotebookUpdate::InsertCell {
                global_version,
                local_version,
                cell_id,
                after,
                language,
                content,
            })
        }
        UPDATE_KIND_UPDATE_CELL => {
            let global_version = cursor.read_var_u32()?;
            let local_version = cursor.read_var_u32()?;
            let cell_id = cursor.read_var_u64()?;
            let content = read_string(&mut cursor)?;
            Ok(NotebookUpdate::UpdateCell {
                global_version,
                local_version,
                cell_id,
                content,
            })
        }
        UPDATE_KIND_DELETE_CELL => {
            let global_version = cursor.read_var_u32()?;
            let local_version = cursor.read_var_u32()?;
            let cell_id = cursor.read_var_u64()?;
            Ok(NotebookUpdate::DeleteCell {
                global_version,
                local_version,
                cell_id,
            })
        }
        UPDATE_KIND_SET_CELL_LANGUAGE => {
            let global_version = cursor.read_var_u32()?;
            let local_version = cursor.read_var_u32()?;
            let cell_id = cursor.read_var_u64()?;
            let language = read_string(&mut cursor)?;
            Ok(NotebookUpdate::SetCellLanguage {
                global_version,
                local_version,
                cell_id,
                language,
            })
        }
        other => Err(WireError::UnknownFrameType(other)),
    }
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<u8, WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok(byte & TYPE_MASK)
}

fn write_var_u32(buf: &mut Vec<u8>, value: u32) {
    write_var_u64(buf, value as u64);
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

fn read_string(cursor: &mut Cursor<'_>) -> Result<String, WireError> {
    let bytes = read_bytes(cursor)?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidData("string utf8"))
}

fn read_bytes(cursor: &mut Cursor<'_>) -> Result<Vec<u8>, WireError> {
    let len = cursor.read_var_u64()?;
    if len > cursor.remaining() as u64 {
        return Err(WireError::UnexpectedEof);
    }
    Ok(cursor.read_slice(len as usize)?.to_vec())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        if value > u32::MAX as u64 {
            return Err(WireError::InvalidData("u32 overflow"));
        }
        Ok(value as u32)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_channel_roles() {
        for role in [ChannelRole::Main, ChannelRole::NotebookUpdates] {
            let encoded = encode_channel_role(role);
            assert_eq!(encoded.len(), 1);
            let decoded = decode_channel_role(&encoded).expect("decode role");
            assert_eq!(role, decoded);
        }
    }

    #[test]
    fn channel_role_rejects_garbage() {
        assert_eq!(
            decode_channel_role(&[7]),
            Err(WireError::InvalidData("invalid channel role"))
        );
        assert_eq!(decode_channel_role(&[]), Err(WireError::UnexpectedEof));
        assert_eq!(
            decode_channel_role(&[0, 0]),
            Err(WireError::InvalidData("trailing bytes after channel role"))
        );
    }

    #[test]
    fn encode_decode_requests() {
        let requests = vec![
            RemoteRequest::StartKernel { req_id: 1 },
            RemoteRequest::QueueCell {
                req_id: 7,
                cell_id: 3,
                code: "val x = 1 + 1".to_string(),
            },
            RemoteRequest::CancelAll { req_id: 9000 },
            RemoteRequest::Shutdown { req_id: u64::MAX },
        ];
        for request in requests {
            let encoded = encode_request(&request);
            let decoded = decode_request(&encoded).expect("decode request");
            assert_eq!(request, decoded);
        }
    }

    #[test]
    fn encode_decode_responses() {
        let responses = vec![
            RemoteResponse::KernelStarted { req_id: 1 },
            RemoteResponse::UnitComplete { req_id: 6 },
            RemoteResponse::CellQueued {
                req_id: 2,
                cell_id: 4,
            },
            RemoteResponse::ResultValue {
                req_id: 7,
                cell_id: 4,
                mime: "text/plain".to_string(),
                data: vec![0, 1, 2, 255],
            },
            RemoteResponse::KernelStatus { busy: true },
            RemoteResponse::Error {
                req_id: 3,
                message: "cell 4 not found".to_string(),
            },
            RemoteResponse::ShutdownAck { req_id: 8 },
        ];
        for response in responses {
            let encoded = encode_response(&response);
            let decoded = decode_response(&encoded).expect("decode response");
            assert_eq!(response, decoded);
        }
    }

    #[test]
    fn encode_decode_updates() {
        let updates = vec![
            NotebookUpdate::InsertCell {
                global_version: 10,
                local_version: 4,
                cell_id: 2,
                after: Some(1),
                language: "scala".to_string(),
                content: "println(\"hi\")".to_string(),
            },
            NotebookUpdate::InsertCell {
                global_version: 11,
                local_version: 4,
                cell_id: 3,
                after: None,
                language: "python".to_string(),
                content: String::new(),
            },
            NotebookUpdate::UpdateCell {
                global_version: 12,
                local_version: 5,
                cell_id: 3,
                content: "x = 2".to_string(),
            },
            NotebookUpdate::DeleteCell {
                global_version: 13,
                local_version: 5,
                cell_id: 2,
            },
            NotebookUpdate::SetCellLanguage {
                global_version: 14,
                local_version: 6,
                cell_id: 3,
                language: "sql".to_string(),
            },
        ];
        for update in updates {
            let encoded = encode_update(&update);
            let decoded = decode_update(&encoded).expect("decode update");
            assert_eq!(update, decoded);
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = Vec::new();
        write_header(&mut buf, 0x1F);
        assert_eq!(decode_request(&buf), Err(WireError::UnknownFrameType(0x1F)));
        assert_eq!(
            decode_response(&buf),
            Err(WireError::UnknownFrameType(0x1F))
        );
        assert_eq!(decode_update(&buf), Err(WireError::UnknownFrameType(0x1F)));
    }

    #[test]
    fn version_mismatch_rejected() {
        let encoded = encode_request(&RemoteRequest::StartKernel { req_id: 1 });
        let mut tampered = encoded.clone();
        tampered[0] = (tampered[0] & TYPE_MASK) | (7 << 5);
        assert_eq!(decode_request(&tampered), Err(WireError::InvalidVersion(7)));
    }

    #[test]
    fn truncated_frame_rejected() {
        let encoded = encode_request(&RemoteRequest::QueueCell {
            req_id: 1,
            cell_id: 2,
            code: "code".to_string(),
        });
        let truncated = &encoded[..encoded.len() - 2];
        assert_eq!(decode_request(truncated), Err(WireError::UnexpectedEof));
    }
}
