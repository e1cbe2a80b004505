/// FIFO-backed task stdio forwarded to the agent's own stdout/stderr
use nix::sys::stat::Mode;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWrite;
use tokio::net::unix::pipe;
use tokio_util::task::AbortOnDropHandle;

/// Named pipes a task writes its output to.
///
/// The read ends are opened read-write so the copy tasks never observe EOF between
/// writers; they stop when the `TaskIo` is dropped, which also removes the FIFOs.
pub struct TaskIo {
    stdout: PathBuf,
    stderr: PathBuf,
    _copiers: Vec<AbortOnDropHandle<()>>,
    _dir: TempDir,
}

impl TaskIo {
    pub fn create(id: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("tink-agent-io-").tempdir()?;
        let stdout = dir.path().join(format!("{}-stdout", id));
        let stderr = dir.path().join(format!("{}-stderr", id));

        for path in [&stdout, &stderr] {
            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }

        let copiers = vec![
            forward(&stdout, tokio::io::stdout())?,
            forward(&stderr, tokio::io::stderr())?,
        ];

        Ok(Self {
            stdout,
            stderr,
            _copiers: copiers,
            _dir: dir,
        })
    }

    pub fn stdout(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr(&self) -> &Path {
        &self.stderr
    }
}

fn forward<W>(path: &Path, mut writer: W) -> io::Result<AbortOnDropHandle<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;
    let name = path.display().to_string();
    Ok(AbortOnDropHandle::new(tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut receiver, &mut writer).await {
            tracing::debug!("[TaskIo] Forwarding {} stopped: {}", name, e);
        }
    })))
}
