//! The isolate log shim.
//!
//! Every line an isolate writes is tagged `[timestamp][podId:out|err]` and
//! forwarded into the agent's tracing output.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use stark_core::PodId;

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Standard output.
    Out,
    /// Standard error.
    Err,
}

impl LogStream {
    const fn tag(self) -> &'static str {
        match self {
            Self::Out => "out",
            Self::Err => "err",
        }
    }
}

/// Format one log line the way packs see it.
#[must_use]
pub fn format_line(pod_id: &PodId, stream: LogStream, line: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    format!("[{timestamp}][{pod_id}:{}] {line}", stream.tag())
}

/// Pump one stream of an isolate into tracing until EOF.
pub async fn pipe_logs<R>(pod_id: PodId, reader: R, stream: LogStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "stark_agent::pod", "{}", format_line(&pod_id, stream, &line));
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pod_id = %pod_id, error = %e, "Log stream read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format() {
        let pod_id = PodId::generate_deterministic(1);
        let line = format_line(&pod_id, LogStream::Out, "hello");
        assert!(line.contains(&format!("[{pod_id}:out] hello")));
        assert!(line.starts_with('['));

        let line = format_line(&pod_id, LogStream::Err, "boom");
        assert!(line.contains(&format!("[{pod_id}:err] boom")));
    }

    #[tokio::test]
    async fn pipes_until_eof() {
        let pod_id = PodId::generate_deterministic(1);
        let data: &[u8] = b"one\ntwo\n";
        // Just exercises the loop to completion; output goes to tracing.
        pipe_logs(pod_id, data, LogStream::Out).await;
    }
}
