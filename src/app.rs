//! The compositor event loop
//!
//! Single-threaded and cooperative: each tick waits briefly for socket
//! readiness, services connections, then always drains the backend's event
//! queue so windows stay responsive with no client traffic.

use crate::backend::{EventStatus, PresentationBackend};
use crate::compositor::Compositor;
use crate::config::Config;
use crate::server::Server;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CompositorApp<B: PresentationBackend> {
    server: Server,
    compositor: Compositor<B>,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<B: PresentationBackend> CompositorApp<B> {
    pub fn new(config: &Config, backend: B) -> Result<Self> {
        let server = Server::bind(
            &config.server.socket_path(),
            config.server.max_clients,
            config.server.max_frame_bytes,
        )
        .context("Failed to start IPC server")?;

        Ok(Self {
            server,
            compositor: Compositor::new(backend, config.buffers.shm_prefix.clone()),
            poll_timeout: config.server.poll_timeout(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the loop at the end of the current tick
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn compositor(&self) -> &Compositor<B> {
        &self.compositor
    }

    #[cfg(test)]
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Run one loop iteration. Returns `false` once the server should exit.
    pub fn tick(&mut self) -> Result<bool> {
        if let Err(e) = self.server.poll(self.poll_timeout) {
            warn!("Poll error: {}", e);
        }

        self.server.accept();

        let compositor = &mut self.compositor;
        self.server.service(|payload| compositor.handle_frame(payload));

        let status = self
            .compositor
            .drain_backend_events()
            .context("Presentation backend failed")?;

        if status == EventStatus::Shutdown {
            info!("Backend requested shutdown");
            return Ok(false);
        }
        if self.shutdown.load(Ordering::Relaxed) {
            info!("Termination signal received");
            return Ok(false);
        }
        Ok(true)
    }

    /// Main compositor loop
    pub fn run(mut self) -> Result<()> {
        while self.tick()? {}

        let registry = self.compositor.registry();
        if registry.is_empty() {
            info!("Compositor stopping, no surfaces were created");
        } else {
            let with_canvas = registry.iter().filter(|s| s.buffer().is_some()).count();
            info!(
                "Compositor stopping with {} surfaces ({} with canvases), {} clients",
                registry.len(),
                with_canvas,
                self.server.connection_count()
            );
            for surface in registry.iter() {
                debug!(
                    "Surface {} '{}': {} commits",
                    surface.id,
                    surface.title,
                    surface.commits()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::config::BackendKind;
    use jw_ipc::{FrameDecoder, FramedMessage, Request, Response, SharedBuffer, Status};
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const MAX_TICKS: usize = 200;

    fn start(max_clients: usize) -> (CompositorApp<HeadlessBackend>, TempDir) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.socket_path = Some(dir.path().join("jw.sock"));
        config.server.max_clients = max_clients;
        config.server.poll_timeout_ms = 1;
        config.backend.kind = BackendKind::Headless;
        config.buffers.shm_prefix = format!(
            "/jw_app_test_{}_{}_",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let app = CompositorApp::new(&config, HeadlessBackend::new()).unwrap();
        (app, dir)
    }

    /// Non-blocking test client
    struct TestClient {
        stream: UnixStream,
        decoder: FrameDecoder,
    }

    impl TestClient {
        fn connect(app: &CompositorApp<HeadlessBackend>) -> Self {
            let stream = UnixStream::connect(app.server().socket_path()).unwrap();
            stream.set_nonblocking(true).unwrap();
            Self {
                stream,
                decoder: FrameDecoder::default(),
            }
        }

        fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).unwrap();
        }

        fn send(&mut self, req: &Request) {
            self.send_raw(&FramedMessage::request(req).encode());
        }

        fn try_recv(&mut self) -> Option<Response> {
            let mut buf = [0u8; 1024];
            loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.decoder.push(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {}", e),
                }
            }
            self.decoder
                .next_frame()
                .unwrap()
                .map(|payload| Response::decode(&payload).unwrap())
        }

        fn recv(&mut self, app: &mut CompositorApp<HeadlessBackend>) -> Response {
            for _ in 0..MAX_TICKS {
                assert!(app.tick().unwrap());
                if let Some(resp) = self.try_recv() {
                    return resp;
                }
            }
            panic!("no response after {} ticks", MAX_TICKS);
        }

        fn request(&mut self, app: &mut CompositorApp<HeadlessBackend>, req: &Request) -> Response {
            self.send(req);
            self.recv(app)
        }
    }

    fn tick_n(app: &mut CompositorApp<HeadlessBackend>, n: usize) {
        for _ in 0..n {
            assert!(app.tick().unwrap());
        }
    }

    #[test]
    fn test_yellow_frame_end_to_end() {
        let (mut app, _dir) = start(10);
        let mut client = TestClient::connect(&app);

        let resp = client.request(
            &mut app,
            &Request::CreateDisplay {
                name: "W".into(),
                width: 800,
                height: 480,
            },
        );
        assert_eq!(resp, Response::DisplayCreated { id: 1 });

        let resp = client.request(
            &mut app,
            &Request::CreateCanvas {
                display_id: 1,
                width: 800,
                height: 480,
            },
        );
        let name = match resp {
            Response::CanvasCreated { name } => name,
            other => panic!("unexpected {:?}", other),
        };

        let mut canvas = SharedBuffer::open(&name, 800 * 480 * 4).unwrap();
        canvas.fill(0xFFFF00FF);

        let resp = client.request(&mut app, &Request::Commit { display_id: 1 });
        assert_eq!(resp, Response::Committed);

        let surface = app.compositor().registry().lookup(1).unwrap();
        let backend = app.compositor().backend();
        assert_eq!(backend.title(surface.handle().id()), Some("W"));
        assert_eq!(backend.frame(surface.handle().id()), Some(canvas.as_slice()));
    }

    #[test]
    fn test_truncated_frame_waits_then_garbage_is_bad_request() {
        let (mut app, _dir) = start(10);
        let mut client = TestClient::connect(&app);

        let frame = FramedMessage::request(&Request::CreateDisplay {
            name: "split".into(),
            width: 4,
            height: 4,
        })
        .encode();
        client.send_raw(&frame[..6]);
        tick_n(&mut app, 10);
        assert!(client.try_recv().is_none());
        assert!(app.compositor().registry().is_empty());

        client.send_raw(&frame[6..]);
        assert_eq!(client.recv(&mut app), Response::DisplayCreated { id: 1 });

        // Valid length prefix, garbage payload
        let mut garbage = 5u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00]);
        client.send_raw(&garbage);
        assert_eq!(client.recv(&mut app).status(), Status::BadRequest);

        // The session survives
        let resp = client.request(&mut app, &Request::Commit { display_id: 1 });
        assert_eq!(resp.status(), Status::NoBuffer);
        let resp = client.request(&mut app, &Request::Commit { display_id: 2 });
        assert_eq!(resp.status(), Status::NotFound);
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        let (mut app, _dir) = start(10);
        let mut client = TestClient::connect(&app);

        let mut batch = Vec::new();
        for name in ["a", "b", "c"] {
            batch.extend(
                FramedMessage::request(&Request::CreateDisplay {
                    name: name.into(),
                    width: 2,
                    height: 2,
                })
                .encode(),
            );
        }
        client.send_raw(&batch);

        let ids: Vec<_> = (0..3).map(|_| client.recv(&mut app)).collect();
        assert_eq!(
            ids,
            vec![
                Response::DisplayCreated { id: 1 },
                Response::DisplayCreated { id: 2 },
                Response::DisplayCreated { id: 3 },
            ]
        );
    }

    #[test]
    fn test_one_frame_per_connection_per_tick() {
        let (mut app, _dir) = start(10);
        let mut busy = TestClient::connect(&app);
        let mut quiet = TestClient::connect(&app);
        tick_n(&mut app, 5);
        assert_eq!(app.server().connection_count(), 2);

        let mut batch = Vec::new();
        for name in ["a", "b", "c", "d"] {
            batch.extend(
                FramedMessage::request(&Request::CreateDisplay {
                    name: name.into(),
                    width: 1,
                    height: 1,
                })
                .encode(),
            );
        }
        busy.send_raw(&batch);
        quiet.send(&Request::Commit { display_id: 99 });

        assert!(app.tick().unwrap());
        assert_eq!(quiet.try_recv().map(|r| r.status()), Some(Status::NotFound));
        assert_eq!(busy.try_recv(), Some(Response::DisplayCreated { id: 1 }));
        assert_eq!(busy.try_recv(), None);
        assert_eq!(app.compositor().registry().len(), 1);

        // The backlog drains one frame per tick
        for id in 2..=4 {
            assert!(app.tick().unwrap());
            assert_eq!(busy.try_recv(), Some(Response::DisplayCreated { id }));
            assert_eq!(busy.try_recv(), None);
        }
    }

    #[test]
    fn test_oversized_frame_closes_only_that_connection() {
        let (mut app, _dir) = start(10);
        let mut good = TestClient::connect(&app);
        let mut bad = TestClient::connect(&app);
        tick_n(&mut app, 5);
        assert_eq!(app.server().connection_count(), 2);

        bad.send_raw(&u32::MAX.to_be_bytes());
        tick_n(&mut app, 5);
        assert_eq!(app.server().connection_count(), 1);

        let resp = good.request(
            &mut app,
            &Request::CreateDisplay {
                name: "still".into(),
                width: 1,
                height: 1,
            },
        );
        assert_eq!(resp, Response::DisplayCreated { id: 1 });
    }

    #[test]
    fn test_disconnect_keeps_surfaces_and_frees_slot() {
        let (mut app, _dir) = start(1);
        let mut first = TestClient::connect(&app);
        let resp = first.request(
            &mut app,
            &Request::CreateDisplay {
                name: "kept".into(),
                width: 2,
                height: 2,
            },
        );
        assert_eq!(resp, Response::DisplayCreated { id: 1 });

        // Over the cap: stays in the backlog unanswered
        let mut second = TestClient::connect(&app);
        second.send(&Request::Commit { display_id: 1 });
        tick_n(&mut app, 10);
        assert!(second.try_recv().is_none());
        assert_eq!(app.server().connection_count(), 1);

        drop(first);
        assert_eq!(second.recv(&mut app).status(), Status::NoBuffer);
        assert_eq!(app.server().connection_count(), 1);
        assert_eq!(app.compositor().registry().len(), 1);
    }

    #[test]
    fn test_shutdown_sources_stop_the_loop() {
        let (mut app, _dir) = start(1);
        assert!(app.tick().unwrap());
        app.shutdown_flag().store(true, Ordering::Relaxed);
        assert!(!app.tick().unwrap());

        let (mut app, dir) = start(1);
        let socket = app.server().socket_path().to_path_buf();
        let mut client = TestClient::connect(&app);
        for (display_id, name) in [(0, "bare"), (1, "painted")] {
            let resp = client.request(
                &mut app,
                &Request::CreateDisplay {
                    name: name.into(),
                    width: 2,
                    height: 2,
                },
            );
            assert_eq!(resp, Response::DisplayCreated { id: display_id + 1 });
        }
        let resp = client.request(
            &mut app,
            &Request::CreateCanvas {
                display_id: 2,
                width: 2,
                height: 2,
            },
        );
        assert_eq!(resp.status(), Status::Ok);
        let surfaces: Vec<_> = app
            .compositor()
            .registry()
            .iter()
            .map(|s| (s.id, s.buffer().is_some()))
            .collect();
        assert_eq!(surfaces, vec![(1, false), (2, true)]);

        app.compositor()
            .backend()
            .shutdown_handle()
            .store(true, Ordering::Relaxed);
        assert!(!app.tick().unwrap());
        app.run().unwrap();
        assert!(!socket.exists());
        drop(dir);
    }
}
