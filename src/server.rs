//! The accept loop and connection lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::message::{read_message, Direction, Message};
use crate::pipeline::Pipeline;

/// The accept loop.
///
/// One task per connection, one request per connection: parse, dispatch
/// through the pipeline under the request deadline, write, close.
/// Returns cleanly on ctrl-c.
pub async fn run(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    config: Arc<Config>,
) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    let deadline = Duration::from_secs(config.request_deadline);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    if let Err(err) =
                        serve_connection(stream, addr, pipeline, deadline).await
                    {
                        debug!(%err, "connection dropped");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    deadline: Duration,
) -> Result<()> {
    let peer = addr.ip().to_string();
    let mut reader = BufReader::new(stream);
    let request = match read_message(&mut reader).await {
        Ok(message) if message.direction == Direction::Request => message,
        Ok(_) | Err(_) => {
            warn!(%peer, "unparsable request");
            let mut stream = reader.into_inner();
            let mut response = Message::response(400);
            stream.write_all(&response.write_response(None)).await?;
            stream.shutdown().await?;
            return Ok(());
        }
    };

    let mut response =
        match tokio::time::timeout(deadline, pipeline.handle(request, &peer))
            .await
        {
            Ok(response) => response,
            Err(_) => {
                let mut response = Message::response(408);
                response.body = b"Request timed out.".to_vec();
                response
            }
        };

    let mut stream = reader.into_inner();
    stream.write_all(&response.write_response(None)).await?;
    stream.shutdown().await?;
    Ok(())
}
