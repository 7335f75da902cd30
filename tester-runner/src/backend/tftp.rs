// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Backend, Completion};
use crate::{
    capture::OutputSink,
    config::{TftpSettings, Timeouts},
    errors::BackendOpenError,
    helpers::lock,
    monitor::{Monitor, MonitorExit},
    tftp::{FileSource, TftpServer, TftpServerConfig, TftpServerHandle},
};
use camino::Utf8PathBuf;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, info};

/// Serves the test executable to a board that boots over the network.
///
/// Whatever file the board asks for, it gets the executable. The server allows exactly one
/// transfer per run, plus one more each time the target restarts or is reset. Timeouts are judged
/// by console output, not by transfer progress.
#[derive(Debug)]
pub struct TftpBootBackend {
    image: Utf8PathBuf,
    bind: SocketAddr,
    settings: TftpSettings,
    timeouts: Timeouts,
    monitor_step: Duration,
    completion: Completion,
    server: Mutex<Option<(TftpServerHandle, SocketAddr)>>,
}

impl TftpBootBackend {
    /// Creates a backend serving `image` on all interfaces at the configured port.
    pub fn new(image: Utf8PathBuf, settings: TftpSettings, timeouts: Timeouts) -> Self {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.port);
        Self {
            image,
            bind,
            settings,
            timeouts,
            monitor_step: Monitor::DEFAULT_STEP,
            completion: Completion::default(),
            server: Mutex::new(None),
        }
    }

    /// Listens on `ip` instead of all interfaces.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind.set_ip(ip);
        self
    }

    /// Sets the monitor's polling step.
    pub fn with_monitor_step(mut self, step: Duration) -> Self {
        self.monitor_step = step;
        self
    }

    /// The address the server is listening on while the backend is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.server).as_ref().map(|(_, addr)| *addr)
    }

    fn rearm(&self, why: &str) {
        if let Some((handle, _)) = lock(&self.server).as_ref() {
            info!(why, "re-arming TFTP server for another transfer");
            handle.arm();
        }
    }
}

impl Backend for TftpBootBackend {
    fn name(&self) -> &'static str {
        "tftp"
    }

    fn open(&self, sink: Arc<dyn OutputSink>) -> Result<(), BackendOpenError> {
        let Some(done) = self.completion.arm() else {
            debug!("tftp: killed before open");
            return Ok(());
        };

        let server = TftpServer::bind(TftpServerConfig {
            bind: self.bind,
            source: FileSource::Forced(self.image.clone()),
            resend_limit: self.settings.resend_limit,
            timeout: self.settings.timeout,
            sessions: Some(1),
        })?;
        let local_addr = server.local_addr();
        let (handle, thread) = server.spawn().map_err(|err| BackendOpenError::Thread {
            name: "tftp-server".to_owned(),
            err,
        })?;
        *lock(&self.server) = Some((handle.clone(), local_addr));

        let exit = Monitor::with_step(self.timeouts, self.monitor_step).run(&done, &*sink);
        if let MonitorExit::Fired(event) = exit {
            info!(?event, "stopping TFTP server after timeout");
            self.completion.signal();
        }

        handle.stop();
        lock(&self.server).take();
        thread
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        debug!(stats = ?handle.stats(), "tftp finished");
        Ok(())
    }

    fn kill(&self) {
        self.completion.signal();
    }

    fn target_restart(&self, started: bool) {
        if !started {
            self.rearm("target restarted");
        }
    }

    fn target_reset(&self, _started: bool) {
        // A reset board boots again whether or not the test had begun.
        self.rearm("target reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capture::test_helpers::RecordingSink, helpers::lock, monitor::MonitorEvent};
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    fn settings() -> TftpSettings {
        TftpSettings {
            port: 0,
            resend_limit: 2,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn missing_image() {
        let backend = TftpBootBackend::new(
            "/nonexistent/hello.exe".into(),
            settings(),
            Timeouts {
                idle: Duration::from_secs(1),
                max: Duration::from_secs(1),
            },
        )
        .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let err = backend
            .open(Arc::new(RecordingSink::default()))
            .expect_err("image doesn't exist");
        assert!(matches!(err, BackendOpenError::Tftp(_)));
    }

    #[test]
    fn idle_timeout_stops_the_server() {
        let dir = Utf8TempDir::new().expect("temp dir created");
        let image = dir.path().join("hello.exe");
        std::fs::write(&image, b"image").expect("image written");

        let backend = TftpBootBackend::new(
            image,
            settings(),
            Timeouts {
                idle: Duration::from_millis(100),
                max: Duration::from_secs(60),
            },
        )
        .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_monitor_step(Duration::from_millis(10));
        let sink = Arc::new(RecordingSink::default());
        backend.open(sink.clone()).expect("opened");

        assert_eq!(*lock(&sink.events), vec![MonitorEvent::Idle]);
        assert_eq!(backend.local_addr(), None, "server is gone after open");
        backend.kill();
    }
}
