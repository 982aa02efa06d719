//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Line-oriented frame source for the power monitor."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! The monitoring board prints one bracketed frame per line over a serial
//! link. The local tty is opened through `serialport` at the configured baud
//! rate (8N1, no flow control). A TCP bridge such as `ser2net` is read with
//! the same line splitting.

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ats_common::config::InputsConfig;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest line kept. A state frame is about 25 bytes.
pub const MAX_LINE_BYTES: usize = 256;
const READ_CHUNK: usize = 512;
/// Bounds how long a blocked serial read can delay shutdown.
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Where monitor frames are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEndpoint {
    Device { path: PathBuf, baud_rate: u32 },
    Tcp(String),
}

impl FrameEndpoint {
    pub fn from_config(config: &InputsConfig) -> Option<Self> {
        match (&config.device, &config.tcp) {
            (Some(device), _) => Some(Self::Device {
                path: device.clone(),
                baud_rate: config.baud_rate,
            }),
            (None, Some(tcp)) => Some(Self::Tcp(tcp.clone())),
            (None, None) => None,
        }
    }
}

impl fmt::Display for FrameEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { path, baud_rate } => write!(f, "{}@{}", path.display(), baud_rate),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Open the monitor tty for blocking reads with a short timeout.
pub fn open_serial(path: &Path, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    serialport::new(path.to_string_lossy(), baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()
        .with_context(|| {
            format!(
                "failed to open monitor device {} at {} baud",
                path.display(),
                baud_rate
            )
        })
}

/// Why a pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    Eof,
    ReceiverClosed,
    Stopped,
}

/// Splits a byte stream into frame lines.
///
/// Trailing `\r` is removed, blank lines are skipped and invalid UTF-8 is
/// replaced rather than rejected. A line growing past the limit is dropped
/// whole, up to and including its newline.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl LineSplitter {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len.min(READ_CHUNK)),
            max_len,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8], lines: &mut Vec<String>) {
        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if let Some(line) = self.take_line() {
                    lines.push(line);
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.buf.len() >= self.max_len {
                warn!(max_bytes = self.max_len, "dropping over-long monitor line");
                self.buf.clear();
                self.discarding = true;
                continue;
            }
            self.buf.push(byte);
        }
    }

    /// Flush an unterminated last line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.discarding) {
            self.buf.clear();
            return None;
        }
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches('\r')
            .to_owned();
        self.buf.clear();
        (!line.is_empty()).then_some(line)
    }
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

/// Forward every frame line read from an async stream to `frames`.
pub async fn pump_lines<R>(mut reader: R, frames: &mpsc::Sender<String>) -> Result<PumpEnd>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut chunk = [0u8; READ_CHUNK];
    let mut lines = Vec::new();
    loop {
        let read = reader
            .read(&mut chunk)
            .await
            .context("failed to read monitor stream")?;
        if read == 0 {
            lines.extend(splitter.finish());
        } else {
            splitter.push(&chunk[..read], &mut lines);
        }
        for line in lines.drain(..) {
            if frames.send(line).await.is_err() {
                return Ok(PumpEnd::ReceiverClosed);
            }
        }
        if read == 0 {
            return Ok(PumpEnd::Eof);
        }
    }
}

/// Blocking counterpart of [`pump_lines`] for the serial port. Read timeouts
/// only give `stop` a chance to be observed.
pub fn pump_blocking<R>(
    mut reader: R,
    frames: &mpsc::Sender<String>,
    stop: &AtomicBool,
) -> Result<PumpEnd>
where
    R: Read,
{
    let mut splitter = LineSplitter::default();
    let mut chunk = [0u8; READ_CHUNK];
    let mut lines = Vec::new();
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(PumpEnd::Stopped);
        }
        let read = match reader.read(&mut chunk) {
            Ok(read) => read,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(err) => return Err(err).context("failed to read monitor device"),
        };
        if read == 0 {
            lines.extend(splitter.finish());
        } else {
            splitter.push(&chunk[..read], &mut lines);
        }
        for line in lines.drain(..) {
            if frames.blocking_send(line).is_err() {
                return Ok(PumpEnd::ReceiverClosed);
            }
        }
        if read == 0 {
            return Ok(PumpEnd::Eof);
        }
    }
}

async fn run_session(
    endpoint: &FrameEndpoint,
    frames: &mpsc::Sender<String>,
    stop: Arc<AtomicBool>,
) -> Result<PumpEnd> {
    match endpoint {
        FrameEndpoint::Device { path, baud_rate } => {
            let path = path.clone();
            let baud_rate = *baud_rate;
            let frames = frames.clone();
            tokio::task::spawn_blocking(move || {
                let port = open_serial(&path, baud_rate)?;
                info!(device = %path.display(), baud_rate, "monitor serial port opened");
                pump_blocking(port, &frames, &stop)
            })
            .await
            .context("monitor reader task failed")?
        }
        FrameEndpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to monitor bridge {}", addr))?;
            info!(endpoint = %endpoint, "monitor stream opened");
            pump_lines(stream, frames).await
        }
    }
}

/// Keep the monitor stream open, reconnecting after `reconnect_delay` whenever
/// it ends or fails, until shutdown or until the frame receiver goes away.
pub fn spawn_frame_source(
    endpoint: FrameEndpoint,
    reconnect_delay: Duration,
    frames: mpsc::Sender<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stop = Arc::new(AtomicBool::new(false));
            tokio::select! {
                _ = shutdown.recv() => {
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
                result = run_session(&endpoint, &frames, stop.clone()) => match result {
                    Ok(PumpEnd::ReceiverClosed) => {
                        debug!("frame receiver closed");
                        break;
                    }
                    Ok(PumpEnd::Stopped) => break,
                    Ok(PumpEnd::Eof) => warn!(endpoint = %endpoint, "monitor stream ended"),
                    Err(err) => warn!(endpoint = %endpoint, error = %format!("{err:#}"), "monitor stream failed"),
                },
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(reconnect_delay) => {
                    debug!(endpoint = %endpoint, "reconnecting monitor stream");
                }
            }
        }
        debug!("frame source shutdown");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Replays canned reads, then reports end of stream.
    struct ScriptedPort(VecDeque<io::Result<&'static [u8]>>);

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }
    }

    fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn lines_are_trimmed_and_blank_lines_dropped() {
        let (tx, rx) = mpsc::channel(8);
        let input: &[u8] = b"[PING]\r\n\r\n[STATE:2:2:2:2:2:2:2:2]\n\xff[PING]";
        let end = pump_lines(input, &tx).await.unwrap();
        assert_eq!(end, PumpEnd::Eof);

        assert_eq!(
            drain(rx),
            vec![
                "[PING]".to_owned(),
                "[STATE:2:2:2:2:2:2:2:2]".to_owned(),
                "\u{fffd}[PING]".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn closed_receiver_stops_the_pump() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input: &[u8] = b"[PING]\n";
        assert_eq!(pump_lines(input, &tx).await.unwrap(), PumpEnd::ReceiverClosed);
    }

    #[test]
    fn over_long_lines_are_dropped_whole() {
        let mut splitter = LineSplitter::new(16);
        let mut lines = Vec::new();
        splitter.push(&[b'x'; 40], &mut lines);
        splitter.push(b"yy\n[PING]\n", &mut lines);
        assert_eq!(lines, vec!["[PING]".to_owned()]);

        splitter.push(&[b'z'; 17], &mut lines);
        assert_eq!(splitter.finish(), None);
        splitter.push(b"[PONG]", &mut lines);
        assert_eq!(splitter.finish().as_deref(), Some("[PONG]"));
    }

    #[tokio::test]
    async fn endless_garbage_does_not_block_later_frames() {
        let (tx, rx) = mpsc::channel(8);
        let mut input = vec![b'#'; MAX_LINE_BYTES * 8];
        input.extend_from_slice(b"\n[STATE:1:2:2:2:2:2:2:2]\n");
        assert_eq!(pump_lines(input.as_slice(), &tx).await.unwrap(), PumpEnd::Eof);
        assert_eq!(drain(rx), vec!["[STATE:1:2:2:2:2:2:2:2]".to_owned()]);
    }

    #[test]
    fn serial_pump_rides_out_read_timeouts() {
        let (tx, rx) = mpsc::channel(8);
        let port = ScriptedPort(VecDeque::from([
            Err(io::Error::from(io::ErrorKind::TimedOut)),
            Ok(&b"[PI"[..]),
            Err(io::Error::from(io::ErrorKind::TimedOut)),
            Ok(&b"NG]\r\n[STATE:2:1:2:2:2:2:2:2]\n"[..]),
        ]));
        let stop = AtomicBool::new(false);
        assert_eq!(pump_blocking(port, &tx, &stop).unwrap(), PumpEnd::Eof);
        assert_eq!(
            drain(rx),
            vec!["[PING]".to_owned(), "[STATE:2:1:2:2:2:2:2:2]".to_owned()]
        );
    }

    #[test]
    fn serial_pump_honours_the_stop_flag_and_real_errors() {
        let (tx, _rx) = mpsc::channel(8);
        let stop = AtomicBool::new(true);
        let port = ScriptedPort(VecDeque::from([Ok(&b"[PING]\n"[..])]));
        assert_eq!(pump_blocking(port, &tx, &stop).unwrap(), PumpEnd::Stopped);

        stop.store(false, Ordering::Relaxed);
        let port = ScriptedPort(VecDeque::from([Err(io::Error::from(
            io::ErrorKind::BrokenPipe,
        ))]));
        let err = pump_blocking(port, &tx, &stop).unwrap_err();
        assert!(format!("{err:#}").contains("monitor device"));
    }

    #[test]
    fn missing_device_reports_path_and_baud() {
        let err = open_serial(Path::new("/dev/ats-missing-tty"), 9600)
            .err()
            .unwrap();
        let message = format!("{err:#}");
        assert!(message.contains("/dev/ats-missing-tty"));
        assert!(message.contains("9600 baud"));
    }

    #[test]
    fn endpoint_prefers_the_device() {
        let mut config = InputsConfig::default();
        assert_eq!(FrameEndpoint::from_config(&config), None);
        config.tcp = Some("127.0.0.1:4001".into());
        assert_eq!(
            FrameEndpoint::from_config(&config),
            Some(FrameEndpoint::Tcp("127.0.0.1:4001".into()))
        );
        config.device = Some(PathBuf::from("/dev/ttyUSB0"));
        config.baud_rate = 115_200;
        assert_eq!(
            FrameEndpoint::from_config(&config),
            Some(FrameEndpoint::Device {
                path: PathBuf::from("/dev/ttyUSB0"),
                baud_rate: 115_200,
            })
        );
        assert_eq!(
            FrameEndpoint::from_config(&config).map(|e| e.to_string()),
            Some("/dev/ttyUSB0@115200".to_owned())
        );
    }

    #[tokio::test]
    async fn tcp_source_reconnects_after_the_bridge_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (tx, mut rx) = mpsc::channel(8);
        let source = spawn_frame_source(
            FrameEndpoint::Tcp(addr.to_string()),
            Duration::from_millis(20),
            tx,
            shutdown_tx.subscribe(),
        );

        for frame in ["[PING]\n", "[STATE:2:2:2:2:2:2:2:2]\n"] {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(frame.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }

        assert_eq!(rx.recv().await.as_deref(), Some("[PING]"));
        assert_eq!(rx.recv().await.as_deref(), Some("[STATE:2:2:2:2:2:2:2:2]"));
        shutdown_tx.send(()).unwrap();
        source.await.unwrap();
    }
}
