//! The interactive session: the user's shell in a PTY, wrapped by the
//! decorator.

use anyhow::{Context, anyhow};
use crossterm::terminal;
use parking_lot::Mutex;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::sync::Arc;
use termpilot_agent::Transport;
use termpilot_term::TerminalIo;
use tokio::sync::mpsc;

use crate::decorator::{DecoratorOptions, TerminalDecorator};

const READ_BUFFER_SIZE: usize = 4096;

/// Shell input goes to the PTY; everything shown goes to our stdout.
struct PtyIo {
    writer: Mutex<Box<dyn Write + Send>>,
    stdout: Mutex<io::Stdout>,
}

impl PtyIo {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            stdout: Mutex::new(io::stdout()),
        }
    }

    /// Shell output, untouched
    fn passthrough(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stdout = self.stdout.lock();
        stdout.write_all(bytes)?;
        stdout.flush()
    }
}

impl TerminalIo for PtyIo {
    fn write_to_shell(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }

    fn write_to_display(&self, text: &str) -> io::Result<()> {
        self.passthrough(text.as_bytes())
    }
}

/// Restores cooked mode however the session ends
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!(error = %e, "failed to restore terminal mode");
        }
    }
}

/// Run the shell until it exits and return its exit code
pub async fn run(transport: Arc<dyn Transport>, options: DecoratorOptions) -> anyhow::Result<u32> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(current_size())
        .map_err(|e| anyhow!("failed to open pty: {}", e))?;

    let mut cmd = CommandBuilder::new(&options.shell);
    cmd.cwd(&options.cwd);
    cmd.env("TERMPILOT", "1");
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow!("failed to start {}: {}", options.shell, e))?;
    drop(pair.slave);
    tracing::info!(shell = %options.shell, cwd = %options.cwd.display(), "shell started");

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow!("failed to read from pty: {}", e))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow!("failed to write to pty: {}", e))?;
    let master = pair.master;

    let cwd = options.cwd.clone();
    let io = Arc::new(PtyIo::new(writer));
    let decorator = TerminalDecorator::new(io.clone(), transport, options);
    decorator.attach();
    decorator.set_cwd(cwd);
    let _raw = RawModeGuard::enable()?;

    let mut output = forward_reads(reader);
    let mut input = forward_reads(Box::new(io::stdin()));
    let mut resizes = watch_resizes();

    loop {
        tokio::select! {
            chunk = output.recv() => {
                let Some(chunk) = chunk else { break };
                if let Err(e) = io.passthrough(&chunk) {
                    tracing::warn!(error = %e, "write to terminal failed");
                }
                decorator.handle_output(&chunk);
            }
            Some(chunk) = input.recv() => decorator.handle_input(&chunk),
            Some(()) = resizes.recv() => resize(master.as_ref()),
        }
    }

    tracing::info!("shell output closed");
    decorator.detach().await;
    let status = tokio::task::spawn_blocking(move || wait_for_exit(child.as_mut()))
        .await
        .context("shell wait task failed")??;
    Ok(status)
}

fn wait_for_exit(child: &mut (dyn Child + Send + Sync)) -> anyhow::Result<u32> {
    let status = child.wait().context("failed to wait for shell")?;
    Ok(status.exit_code())
}

/// Pump a blocking reader into a channel from its own thread. The channel
/// closes at end of input.
fn forward_reads(mut reader: Box<dyn Read + Send>) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "reader closed");
                    break;
                }
            }
        }
    });
    rx
}

fn watch_resizes() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::window_change()) {
            Ok(mut winch) => {
                tokio::spawn(async move {
                    while winch.recv().await.is_some() {
                        if tx.send(()).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => tracing::debug!(error = %e, "resize notifications unavailable"),
        }
    }
    #[cfg(not(unix))]
    drop(tx);
    rx
}

fn current_size() -> PtySize {
    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn resize(master: &(dyn MasterPty + Send)) {
    let size = current_size();
    if let Err(e) = master.resize(size) {
        tracing::debug!(error = %e, "pty resize failed");
    }
}
