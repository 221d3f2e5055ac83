//! The origin HTTP client.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Config;
use crate::error::FetchFailure;
use crate::message::{read_message, Message};

/// One-shot HTTP/1.0 client for the origin web server.
///
/// Every fetch opens a fresh connection, writes the request, reads a
/// single response, and closes. The whole exchange runs under the
/// configured timeout; on expiry the socket is dropped and the caller
/// gets [`FetchFailure::Timeout`].
#[derive(Debug, Clone)]
pub struct OriginClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl OriginClient {
    /// Builds the client for the configured origin.
    pub fn from_config(config: &Config) -> Self {
        let (host, port) = config.origin_addr();
        Self { host, port, timeout: Duration::from_secs(config.origin_timeout) }
    }

    /// The configured timeout in whole seconds.
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Sends `request` and reads the response.
    pub async fn fetch(
        &self,
        mut request: Message,
    ) -> Result<Message, FetchFailure> {
        debug!(uri = %request.uri, "fetching from origin");
        let exchange = async {
            let mut stream =
                TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.write_all(&request.write_request()).await?;
            let mut reader = BufReader::new(stream);
            read_message(&mut reader).await.map_err(std::io::Error::other)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(FetchFailure::Origin(err.to_string())),
            Err(_) => Err(FetchFailure::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn one_shot_origin(body: &'static str) -> (OriginClient, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = vec![0u8; 4096];
            let n = socket.read(&mut seen).await.unwrap();
            seen.truncate(n);
            let reply = format!(
                "HTTP/1.0 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            seen
        });
        let config = Config {
            origin: format!("{}:{}", addr.ip(), addr.port()),
            ..Config::default()
        };
        (OriginClient::from_config(&config), handle)
    }

    #[tokio::test]
    async fn fetches_a_response() {
        let (client, origin) = one_shot_origin("payload").await;
        let response =
            client.fetch(Message::request("GET", "/a")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"payload");
        let seen = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(seen.starts_with("GET /a HTTP/1.0\r\n"));
    }

    #[tokio::test]
    async fn slow_origins_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let config = Config {
            origin: format!("{}:{}", addr.ip(), addr.port()),
            origin_timeout: 1,
            ..Config::default()
        };
        let client = OriginClient::from_config(&config);
        let err = client.fetch(Message::request("GET", "/slow")).await;
        assert_eq!(err, Err(FetchFailure::Timeout));
    }

    #[tokio::test]
    async fn refused_connections_fail_as_origin_errors() {
        let config =
            Config { origin: "127.0.0.1:1".to_string(), ..Config::default() };
        let client = OriginClient::from_config(&config);
        match client.fetch(Message::request("GET", "/")).await {
            Err(FetchFailure::Origin(_)) => {}
            other => panic!("expected origin failure, got {other:?}"),
        }
    }
}
