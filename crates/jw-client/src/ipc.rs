//! IPC session with jw-core

use anyhow::{Context, Result};
use jw_ipc::{FramedMessage, Request, Response, LEN_PREFIX, MAX_FRAME_SIZE};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::Duration;
use tracing::{debug, info};

/// How often to look for the socket while the server starts up
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Request/response session over one Unix stream
pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    /// Connect to the compositor, waiting up to `retries` intervals for its
    /// socket to appear
    pub async fn connect(socket_path: &Path, mut retries: u32) -> Result<Self> {
        info!("Connecting to compositor at {:?}", socket_path);

        // Wait for socket to be available
        while !socket_path.exists() && retries > 0 {
            tokio::time::sleep(CONNECT_RETRY).await;
            retries -= 1;
        }

        if !socket_path.exists() {
            return Err(anyhow::anyhow!("IPC socket not found: {:?}", socket_path));
        }

        let stream = UnixStream::connect(socket_path)
            .await
            .context("Failed to connect to IPC socket")?;

        info!("Connected to compositor");
        Ok(Self { stream })
    }

    /// Send one request and wait for its response
    pub async fn request(&mut self, req: &Request) -> Result<Response> {
        debug!("Sending request: {:?}", req);
        self.stream
            .write_all(&FramedMessage::request(req).encode())
            .await
            .context("Failed to send request")?;

        let mut len_buf = [0u8; LEN_PREFIX];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("Connection closed while waiting for a response")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            anyhow::bail!("Response too large: {} bytes", len);
        }

        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("Connection closed mid-response")?;

        let resp = Response::decode(&payload).context("Malformed response")?;
        debug!("Received response: {:?}", resp);
        Ok(resp)
    }

    pub async fn create_display(&mut self, name: &str, width: u32, height: u32) -> Result<u32> {
        let req = Request::CreateDisplay {
            name: name.into(),
            width,
            height,
        };
        match self.request(&req).await? {
            Response::DisplayCreated { id } => Ok(id),
            other => Err(unexpected("CreateDisplay", other)),
        }
    }

    /// Ask for a canvas and return its shared-memory name
    pub async fn create_canvas(&mut self, display_id: u32, width: u32, height: u32) -> Result<String> {
        let req = Request::CreateCanvas {
            display_id,
            width,
            height,
        };
        match self.request(&req).await? {
            Response::CanvasCreated { name } => Ok(name),
            other => Err(unexpected("CreateCanvas", other)),
        }
    }

    pub async fn commit(&mut self, display_id: u32) -> Result<()> {
        match self.request(&Request::Commit { display_id }).await? {
            Response::Committed => Ok(()),
            other => Err(unexpected("Commit", other)),
        }
    }
}

fn unexpected(op: &str, resp: Response) -> anyhow::Error {
    match resp {
        Response::Error {
            status, message, ..
        } => anyhow::anyhow!("{} failed ({:?}): {}", op, status, message),
        other => anyhow::anyhow!("{} got unexpected response {:?}", op, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jw_ipc::{FrameDecoder, Status};
    use tokio::net::UnixListener;

    /// Answers each request with the next canned response
    async fn serve_once(listener: UnixListener, replies: Vec<Response>) -> Vec<Request> {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::default();
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        for reply in replies {
            let payload = loop {
                if let Some(payload) = decoder.next_frame().unwrap() {
                    break payload;
                }
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up early");
                decoder.push(&buf[..n]);
            };
            seen.push(Request::decode(&payload).unwrap());
            stream
                .write_all(&FramedMessage::response(&reply).encode())
                .await
                .unwrap();
        }
        seen
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jw.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            vec![
                Response::DisplayCreated { id: 3 },
                Response::CanvasCreated {
                    name: "/jw_shm_3".into(),
                },
                Response::Error {
                    opcode: 3,
                    status: Status::NoBuffer,
                    message: "no canvas".into(),
                },
            ],
        ));

        let mut client = IpcClient::connect(&path, 0).await.unwrap();
        assert_eq!(client.create_display("Client1", 8, 4).await.unwrap(), 3);
        assert_eq!(client.create_canvas(3, 8, 4).await.unwrap(), "/jw_shm_3");
        let err = client.commit(3).await.unwrap_err().to_string();
        assert!(err.contains("NoBuffer"), "{}", err);
        assert!(err.contains("no canvas"), "{}", err);

        let seen = server.await.unwrap();
        assert_eq!(
            seen[0],
            Request::CreateDisplay {
                name: "Client1".into(),
                width: 8,
                height: 4
            }
        );
        assert_eq!(seen[2], Request::Commit { display_id: 3 });
    }

    #[tokio::test]
    async fn test_missing_socket_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let result = IpcClient::connect(&dir.path().join("absent.sock"), 2).await;
        assert!(result.is_err());
    }
}
