//! # TCP Server
//!
//! Accept framed connections, decode requests, dispatch to the worker,
//! and write the response frame. Handlers with short critical sections
//! run inline on the connection task; kernel runs and flushes block on
//! peer RPCs, so they are moved to the blocking pool.

use std::sync::Arc;

use bytes::BytesMut;
use gkv_common::frame::{check_frame_len, decode_payload, encode_frame};
use gkv_common::{GkvError, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::worker::Worker;

/// Serves connections until the worker signals shutdown.
pub async fn serve(listener: TcpListener, worker: Arc<Worker>) {
    loop {
        tokio::select! {
            _ = worker.shutdown_signal().notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let worker = Arc::clone(&worker);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, worker).await {
                                debug!(%peer, %err, "connection closed with error");
                            }
                        });
                    }
                    Err(err) => {
                        error!(%err, "accept failed");
                        worker.mark_failed();
                        break;
                    }
                }
            }
        }
        if !worker.is_running() {
            break;
        }
    }
    debug!("server loop stopped");
}

async fn handle_connection(mut stream: TcpStream, worker: Arc<Worker>) -> Result<(), GkvError> {
    stream.set_nodelay(true)?;
    let mut payload = BytesMut::with_capacity(8 * 1024);

    loop {
        let mut prefix = [0u8; 4];
        match stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            // Peer hung up between frames; a clean end of the connection.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let len = check_frame_len(u32::from_be_bytes(prefix) as usize)?;
        payload.resize(len, 0);
        stream.read_exact(&mut payload).await?;
        let request: Request = decode_payload(&payload)?;

        let closing = matches!(request, Request::Shutdown);
        let response = dispatch(&worker, request).await;
        let frame = encode_frame(&response)?;
        stream.write_all(&frame).await?;

        if closing {
            return Ok(());
        }
    }
}

async fn dispatch(worker: &Arc<Worker>, request: Request) -> Response {
    worker.metrics().record_request();

    // Kernels and flushes block on peer RPCs; everything else only takes
    // short locks and can run on the connection task.
    let blocking = matches!(request, Request::RunKernel { .. } | Request::Flush);
    let result = if blocking {
        let worker = Arc::clone(worker);
        match tokio::task::spawn_blocking(move || worker.handle(request)).await {
            Ok(result) => result,
            Err(join_err) => Err(GkvError::Kernel(format!("task panicked: {join_err}"))),
        }
    } else {
        worker.handle(request)
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            worker.metrics().record_error();
            Response::Error {
                message: err.to_string(),
            }
        }
    }
}
