//! Exec bridge: run commands inside stack containers.
//!
//! An attached exec is serviced by two pumps. The output pump demultiplexes
//! the remote stream into local stdout/stderr; the input pump copies local
//! stdin to the remote side and half-closes it at end of input. Each pump is a
//! spawned task whose `JoinHandle` is its completion signal. The call returns
//! once the output pump is done, waiting for it even when input ends first.

use async_trait::async_trait;
use futures::StreamExt;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{ContainerEngine, EngineError, ExecOptions, ExecStream, OutputChunk};
use crate::errors::{Result, StackError};

const STDIN_CHUNK: usize = 8 * 1024;
const STDIN_BACKLOG: usize = 16;

/// Finds the container a command should run in.
#[async_trait]
pub trait ContainerResolver: Send + Sync {
    fn project(&self) -> &str;

    /// `Ok(None)` when no container matches the role.
    async fn resolve_container(&self, role: &str) -> Result<Option<String>>;
}

/// Local ends of an attached exec.
pub struct ExecIo {
    pub stdin: Pin<Box<dyn AsyncRead + Send>>,
    pub stdout: Pin<Box<dyn AsyncWrite + Send>>,
    pub stderr: Pin<Box<dyn AsyncWrite + Send>>,
}

impl ExecIo {
    /// The calling process's terminal.
    pub fn terminal() -> Self {
        Self {
            stdin: Box::pin(DetachedStdin::spawn()),
            stdout: Box::pin(tokio::io::stdout()),
            stderr: Box::pin(tokio::io::stderr()),
        }
    }
}

pub struct ExecBridge<E: ContainerEngine> {
    engine: Arc<E>,
}

impl<E: ContainerEngine> ExecBridge<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Run `args` in the container serving `role`, attached to `io`.
    pub async fn run<R: ContainerResolver + ?Sized>(
        &self,
        resolver: &R,
        role: &str,
        args: &[String],
        user: Option<&str>,
        mut io: ExecIo,
    ) -> Result<()> {
        io.stdout
            .write_all(format!("Running: {}\n", args.join(" ")).as_bytes())
            .await
            .map_err(StackError::io("error writing output"))?;
        io.stdout
            .flush()
            .await
            .map_err(StackError::io("error writing output"))?;

        let not_running = || StackError::NotRunning {
            project: resolver.project().to_string(),
            operation: "run commands",
        };

        let container_id = resolver
            .resolve_container(role)
            .await?
            .ok_or_else(not_running)?;

        let options = ExecOptions {
            cmd: args.to_vec(),
            user: user.filter(|u| !u.is_empty()).map(str::to_string),
            attach_stdin: true,
        };
        let exec_id = self
            .engine
            .create_exec(&container_id, &options)
            .await
            .map_err(|e| {
                debug!(error = %e, container = %container_id, "exec create failed");
                not_running()
            })?;

        let stream = self
            .engine
            .start_exec(&exec_id)
            .await
            .map_err(StackError::engine("error attaching to command"))?;

        pipe_streams(stream, io.stdin, io.stdout, io.stderr)
            .await
            .map_err(StackError::engine("error streaming command output"))
    }

    /// Run `bash -c <command>` without stdin and return what it printed.
    ///
    /// Failures are logged, not returned: a launch error yields an empty
    /// string, a stream error or non-zero exit yields the output gathered so
    /// far. Stderr goes to the local stderr.
    pub async fn exec_command(&self, container_id: &str, command: &str) -> String {
        let mut stdout = Vec::new();
        match self.collect_output(container_id, command, &mut stdout).await {
            Ok(Some(0)) | Ok(None) => {}
            Ok(Some(code)) => warn!(%command, code, "command exited with non-zero status"),
            Err(e) => warn!(%command, error = %e, "error running command"),
        }
        String::from_utf8_lossy(&stdout).into_owned()
    }

    async fn collect_output(
        &self,
        container_id: &str,
        command: &str,
        stdout: &mut Vec<u8>,
    ) -> std::result::Result<Option<i64>, EngineError> {
        let options = ExecOptions {
            cmd: vec!["bash".into(), "-c".into(), command.into()],
            user: None,
            attach_stdin: false,
        };
        let exec_id = self.engine.create_exec(container_id, &options).await?;
        let mut stream = self.engine.start_exec(&exec_id).await?;
        while let Some(chunk) = stream.output.next().await {
            match chunk? {
                OutputChunk::StdErr(bytes) => {
                    let mut stderr = std::io::stderr();
                    std::io::Write::write_all(&mut stderr, &bytes)?;
                }
                other => stdout.extend_from_slice(other.bytes()),
            }
        }
        self.engine.exec_exit_code(&exec_id).await
    }
}

/// Bridge an attached exec stream with local I/O until the output side ends.
///
/// Output pump errors are returned. Input pump errors are logged only.
pub async fn pipe_streams<I, O, W>(
    stream: ExecStream,
    mut stdin: I,
    mut stdout: O,
    mut stderr: W,
) -> std::result::Result<(), EngineError>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let ExecStream { mut output, mut input } = stream;

    let mut output_pump = tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            match chunk? {
                OutputChunk::StdErr(bytes) => {
                    stderr.write_all(&bytes).await?;
                    stderr.flush().await?;
                }
                other => {
                    stdout.write_all(other.bytes()).await?;
                    stdout.flush().await?;
                }
            }
        }
        Ok::<(), EngineError>(())
    });

    let mut input_pump = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut stdin, &mut input).await {
            warn!(error = %e, "error copying input stream");
        }
        if let Err(e) = input.shutdown().await {
            warn!(error = %e, "error closing input stream");
        }
    });

    let finished = tokio::select! {
        result = &mut output_pump => {
            input_pump.abort();
            result
        }
        result = &mut input_pump => {
            if let Err(e) = result {
                warn!(error = %e, "input pump did not finish cleanly");
            }
            debug!("input closed, waiting for output");
            output_pump.await
        }
    };

    finished.map_err(|e| EngineError::Other(format!("output pump failed: {}", e)))?
}

/// Stdin read on a detached OS thread and forwarded through a channel.
///
/// A blocking terminal read lives on that thread, so dropping the reader (or
/// the runtime) never waits for the user to press a key.
pub struct DetachedStdin {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
}

impl DetachedStdin {
    pub fn spawn() -> Self {
        Self::from_reader(std::io::stdin())
    }

    pub fn from_reader<R: Read + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = mpsc::channel(STDIN_BACKLOG);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; STDIN_CHUNK];
            loop {
                let item = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
        });
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl AsyncRead for DetachedStdin {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset >= this.pending.len() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let available = &this.pending[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// AsyncWrite into a shared buffer the test can read afterwards.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct StaticResolver {
        container: Option<String>,
    }

    #[async_trait]
    impl ContainerResolver for StaticResolver {
        fn project(&self) -> &str {
            "myproj_abc123"
        }

        async fn resolve_container(&self, _role: &str) -> Result<Option<String>> {
            Ok(self.container.clone())
        }
    }

    fn io_with(stdin: &'static [u8]) -> (ExecIo, SharedBuf, SharedBuf) {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        (
            ExecIo {
                stdin: Box::pin(stdin),
                stdout: Box::pin(out.clone()),
                stderr: Box::pin(err.clone()),
            },
            out,
            err,
        )
    }

    #[tokio::test]
    async fn test_pipe_waits_for_output_when_input_ends_first() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let output = futures::stream::once(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(OutputChunk::StdOut(b"late output\n".to_vec()))
        })
        .boxed();
        let stream = ExecStream {
            output,
            input: Box::pin(local),
        };
        let out = SharedBuf::default();

        pipe_streams(stream, &b"hello"[..], out.clone(), SharedBuf::default())
            .await
            .unwrap();

        assert_eq!(out.text(), "late output\n");
        let mut sent = Vec::new();
        remote.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"hello");
    }

    #[tokio::test]
    async fn test_pipe_splits_stdout_and_stderr() {
        let (local, _remote) = tokio::io::duplex(1024);
        let output = futures::stream::iter(vec![
            Ok(OutputChunk::StdOut(b"out\n".to_vec())),
            Ok(OutputChunk::StdErr(b"err\n".to_vec())),
        ])
        .boxed();
        let out = SharedBuf::default();
        let err = SharedBuf::default();

        pipe_streams(
            ExecStream {
                output,
                input: Box::pin(local),
            },
            DetachedStdin::from_reader(std::io::empty()),
            out.clone(),
            err.clone(),
        )
        .await
        .unwrap();

        assert_eq!(out.text(), "out\n");
        assert_eq!(err.text(), "err\n");
    }

    #[tokio::test]
    async fn test_pipe_returns_output_errors_after_partial_output() {
        let (local, _remote) = tokio::io::duplex(1024);
        let output = futures::stream::iter(vec![
            Ok(OutputChunk::StdOut(b"partial\n".to_vec())),
            Err(EngineError::Stream("connection reset".into())),
        ])
        .boxed();
        let out = SharedBuf::default();

        let err = pipe_streams(
            ExecStream {
                output,
                input: Box::pin(local),
            },
            tokio::io::empty(),
            out.clone(),
            SharedBuf::default(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert_eq!(out.text(), "partial\n");
    }

    #[tokio::test]
    async fn test_pipe_ignores_input_failures() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Err(std::io::Error::other("stdin gone")))
            }
        }

        let (local, _remote) = tokio::io::duplex(1024);
        let output = futures::stream::once(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(OutputChunk::StdOut(b"ok\n".to_vec()))
        })
        .boxed();
        let out = SharedBuf::default();

        pipe_streams(
            ExecStream {
                output,
                input: Box::pin(local),
            },
            Broken,
            out.clone(),
            SharedBuf::default(),
        )
        .await
        .unwrap();
        assert_eq!(out.text(), "ok\n");
    }

    #[tokio::test]
    async fn test_detached_stdin_reads_to_eof() {
        let mut reader = DetachedStdin::from_reader(std::io::Cursor::new(b"line one\nline two\n".to_vec()));
        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_run_without_container_is_not_running_and_skips_exec() {
        let engine = Arc::new(FakeEngine::new());
        let bridge = ExecBridge::new(Arc::clone(&engine));
        let (io, out, _) = io_with(b"");

        let err = bridge
            .run(
                &StaticResolver { container: None },
                "webserver",
                &["airflow".into(), "dags".into(), "list".into()],
                None,
                io,
            )
            .await
            .unwrap_err();

        assert!(err.is_not_running());
        assert_eq!(out.text(), "Running: airflow dags list\n");
        assert!(!engine.called("create_exec"));
    }

    #[tokio::test]
    async fn test_run_create_failure_is_not_running() {
        let engine = Arc::new(FakeEngine::new());
        engine.state.lock().unwrap().fail_exec_create = true;
        let bridge = ExecBridge::new(Arc::clone(&engine));
        let (io, _, _) = io_with(b"");

        let err = bridge
            .run(
                &StaticResolver {
                    container: Some("c0001".into()),
                },
                "webserver",
                &["bash".into()],
                None,
                io,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_running());
        assert!(!engine.called("start_exec"));
    }

    #[tokio::test]
    async fn test_run_attaches_and_streams() {
        let engine = Arc::new(FakeEngine::new());
        engine.state.lock().unwrap().exec_output = vec![
            OutputChunk::StdOut(b"dag_id | fileloc\n".to_vec()),
            OutputChunk::StdErr(b"warning\n".to_vec()),
        ];
        let bridge = ExecBridge::new(Arc::clone(&engine));
        let (io, out, err) = io_with(b"");

        bridge
            .run(
                &StaticResolver {
                    container: Some("c0001".into()),
                },
                "webserver",
                &["airflow".into(), "dags".into(), "list".into()],
                Some("airflow"),
                io,
            )
            .await
            .unwrap();

        assert_eq!(out.text(), "Running: airflow dags list\ndag_id | fileloc\n");
        assert_eq!(err.text(), "warning\n");
        let st = engine.state.lock().unwrap();
        let (container, options) = st.last_exec.clone().unwrap();
        assert_eq!(container, "c0001");
        assert_eq!(options.user.as_deref(), Some("airflow"));
        assert!(options.attach_stdin);
    }

    #[tokio::test]
    async fn test_exec_command_collects_stdout() {
        let engine = Arc::new(FakeEngine::new());
        {
            let mut st = engine.state.lock().unwrap();
            st.exec_output = vec![OutputChunk::StdOut(b"2.7.0\n".to_vec())];
            st.exec_exit_code = Some(0);
        }
        let bridge = ExecBridge::new(Arc::clone(&engine));

        let out = bridge.exec_command("c0001", "airflow version").await;

        assert_eq!(out, "2.7.0\n");
        let st = engine.state.lock().unwrap();
        let (_, options) = st.last_exec.clone().unwrap();
        assert_eq!(options.cmd, vec!["bash", "-c", "airflow version"]);
        assert!(!options.attach_stdin);
    }

    #[tokio::test]
    async fn test_exec_command_degrades_to_empty_on_failure() {
        let engine = Arc::new(FakeEngine::new());
        engine.state.lock().unwrap().fail_exec_create = true;
        let bridge = ExecBridge::new(Arc::clone(&engine));
        assert_eq!(bridge.exec_command("c0001", "false").await, "");
    }

    #[tokio::test]
    async fn test_exec_command_keeps_output_on_nonzero_exit() {
        let engine = Arc::new(FakeEngine::new());
        {
            let mut st = engine.state.lock().unwrap();
            st.exec_output = vec![OutputChunk::StdOut(b"partial".to_vec())];
            st.exec_exit_code = Some(2);
        }
        let bridge = ExecBridge::new(Arc::clone(&engine));
        assert_eq!(bridge.exec_command("c0001", "exit 2").await, "partial");
    }
}
