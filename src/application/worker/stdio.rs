use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::conversion::ConversionWorker;
use crate::domain::protocol::{ProtocolError, WorkerMessage};

/// Serve one worker over a line protocol: each non-blank input line is a
/// message and produces exactly one response line. Lines that are not valid
/// UTF-8 are answered as malformed requests. Returns the number of messages
/// answered once the input ends.
pub async fn serve_lines<R, W>(
    worker: &mut ConversionWorker,
    mut reader: R,
    mut writer: W,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();
    let mut answered = 0u64;

    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer).await? == 0 {
            break;
        }

        let response = match std::str::from_utf8(&buffer) {
            Ok(line) => {
                let line = line.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                worker.handle_message(WorkerMessage::Text(line.to_string()))
            }
            Err(err) => worker.reject(&ProtocolError::Decode(format!(
                "request is not valid UTF-8: {err}"
            ))),
        };

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        answered += 1;
        debug!(
            target = "application::worker::stdio",
            answered, "Response written"
        );
    }

    info!(
        target = "application::worker::stdio",
        answered, "Input closed; worker stopping"
    );
    Ok(answered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::RenderPipelineConfig;
    use crate::domain::protocol::ConversionResponse;

    async fn serve(input: &[u8]) -> (u64, Vec<ConversionResponse>) {
        let mut worker = ConversionWorker::from_config(&RenderPipelineConfig::default());
        let mut output = Vec::new();

        let answered = serve_lines(&mut worker, input, &mut output)
            .await
            .expect("serve");

        let text = String::from_utf8(output).expect("utf8");
        let responses = text
            .lines()
            .map(|line| ConversionResponse::decode(line).expect("response"))
            .collect();
        (answered, responses)
    }

    #[tokio::test]
    async fn answers_every_line_in_order() {
        let input = concat!(
            "{\"sequence\":1,\"markdown\":\"# One\"}\n",
            "\n",
            "not json\n",
            "{\"sequence\":2,\"markdown\":\"two\"}\n",
        );

        let (answered, responses) = serve(input.as_bytes()).await;
        assert_eq!(answered, 3);
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].sequence, Some(1));
        assert!(responses[0].ok);
        assert_eq!(responses[1].sequence, None);
        assert!(!responses[1].ok);
        assert_eq!(responses[2].sequence, Some(2));
    }

    #[tokio::test]
    async fn invalid_utf8_lines_are_answered_and_serving_continues() {
        let mut input = b"{\"sequence\":1,\"markdown\":\"one\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe bad\n");
        input.extend_from_slice(b"{\"sequence\":2,\"markdown\":\"two\"}\r\n");

        let (answered, responses) = serve(&input).await;
        assert_eq!(answered, 3);
        assert_eq!(responses[0].sequence, Some(1));
        assert_eq!(responses[1].sequence, None);
        assert!(!responses[1].ok);
        assert!(
            responses[1]
                .error
                .as_deref()
                .expect("error")
                .contains("UTF-8")
        );
        assert_eq!(responses[2].sequence, Some(2));
        assert!(responses[2].ok);
    }

    #[tokio::test]
    async fn final_line_without_terminator_is_answered() {
        let (answered, responses) = serve(b"{\"sequence\":9,\"markdown\":\"x\"}").await;
        assert_eq!(answered, 1);
        assert_eq!(responses[0].sequence, Some(9));
    }
}
