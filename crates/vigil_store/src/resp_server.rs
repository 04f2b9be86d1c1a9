//! RESP2 client-facing server.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::command::CommandOutput;
use crate::node::NodeState;

pub async fn run(addr: SocketAddr, state: Arc<NodeState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving clients");
    loop {
        let (socket, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                tracing::debug!(error = ?err, "client connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<NodeState>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_request(frame) {
            Ok(None) => continue,
            Ok(Some(args)) => match state.dispatch(args) {
                Ok(output) => output_frame(output),
                Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
            },
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

fn output_frame(output: CommandOutput) -> BytesFrame {
    match output {
        CommandOutput::Ok => BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")),
        CommandOutput::Int(n) => BytesFrame::Integer(n),
        CommandOutput::Value(None) => BytesFrame::Null,
        CommandOutput::Value(Some(v)) => BytesFrame::BulkString(bytes::Bytes::from(v)),
    }
}

/// Extract the argument vector from a client frame. An empty array is
/// ignored; anything but an array of string values is an error.
fn parse_request(frame: BytesFrame) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }
    let mut args = Vec::with_capacity(parts.len());
    for part in &parts {
        let arg = frame_bytes(part).ok_or_else(|| anyhow::anyhow!("invalid argument frame"))?;
        args.push(arg);
    }
    Ok(Some(args))
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> BytesFrame {
        BytesFrame::BulkString(bytes::Bytes::from(s.as_bytes().to_vec()))
    }

    #[test]
    fn array_of_bulk_strings_parses_to_args() {
        let frame = BytesFrame::Array(vec![bulk("SET"), bulk("k"), bulk("v"), bulk("7"), bulk("1")]);
        let args = parse_request(frame).unwrap().unwrap();
        assert_eq!(args.len(), 5);
        assert_eq!(args[0], b"SET".to_vec());
        assert_eq!(args[4], b"1".to_vec());
    }

    #[test]
    fn empty_array_is_ignored() {
        assert!(parse_request(BytesFrame::Array(Vec::new()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn non_array_frames_are_rejected() {
        assert!(parse_request(bulk("SET")).is_err());
        assert!(parse_request(BytesFrame::Array(vec![BytesFrame::Integer(3)])).is_err());
    }

    #[test]
    fn outputs_map_to_resp_frames() {
        assert_eq!(
            output_frame(CommandOutput::Ok),
            BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK"))
        );
        assert_eq!(output_frame(CommandOutput::Int(2)), BytesFrame::Integer(2));
        assert_eq!(output_frame(CommandOutput::Value(None)), BytesFrame::Null);
        assert_eq!(
            output_frame(CommandOutput::Value(Some(b"v".to_vec()))),
            BytesFrame::BulkString(bytes::Bytes::from_static(b"v"))
        );
    }
}
