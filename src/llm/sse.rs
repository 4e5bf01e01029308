//! Server-Sent Events 流解析
//!
//! 把 reqwest 响应按 SSE 事件切分，逐事件回调；支持取消令牌，取消时立即停读。

use futures_util::StreamExt;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// 一个解析出的 SSE 事件
#[derive(Debug, Clone)]
pub struct SseEvent {
    /// event 字段（如 content_block_delta）
    pub event: Option<String>,
    /// data 字段（JSON 字符串）
    pub data: String,
}

/// SSE 读取的终止方式
#[derive(Debug)]
pub enum SseError {
    Io(String),
    Cancelled,
}

/// 逐事件解析 SSE 流；cancel 触发时返回 Cancelled，已回调的事件不受影响
pub async fn parse_sse_stream(
    response: reqwest::Response,
    cancel: &CancellationToken,
    mut on_event: impl FnMut(SseEvent),
) -> Result<(), SseError> {
    let byte_stream = response
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));
    let mut lines = reader.lines();

    let mut current_event: Option<String> = None;
    let mut current_data = String::new();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Err(SseError::Cancelled),
            line = lines.next_line() => line.map_err(|e| SseError::Io(e.to_string()))?,
        };
        let Some(line) = line else { break };

        if line.is_empty() {
            // 空行 = 一个事件结束
            if !current_data.is_empty() {
                on_event(SseEvent {
                    event: current_event.take(),
                    data: std::mem::take(&mut current_data),
                });
            }
            current_event = None;
            continue;
        }

        if let Some(event_type) = line.strip_prefix("event: ") {
            current_event = Some(event_type.to_string());
        } else if let Some(data) = line.strip_prefix("data: ") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data);
        }
        // 其余字段（id:、retry:、注释）忽略
    }

    if !current_data.is_empty() {
        on_event(SseEvent {
            event: current_event,
            data: current_data,
        });
    }

    Ok(())
}
