// ABOUTME: Zellij session management for agent instances
//
// Manages the lifecycle of zellij sessions including:
// - Detached session creation from a layout file
// - PTY-based monitoring with colored screen capture
// - Attach/detach operations with Ctrl+Q support
// - Prompt detection and program liveness heuristics

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};

pub mod cache;
pub mod orphan;
pub mod terminal;

pub use cache::ContentCache;
pub use orphan::{list_orphaned_sessions, recover_metadata, OrphanedSession};
pub use terminal::TerminalBuffer;

pub const PROGRAM_CLAUDE: &str = "claude";
pub const PROGRAM_AIDER: &str = "aider";
pub const PROGRAM_GEMINI: &str = "gemini";

/// Prefix carried by every session the product owns.
pub const ZELLIJ_PREFIX: &str = "claudesquad_";

/// TTL for the pane content cache.
pub(crate) const CONTENT_CACHE_TTL: Duration = Duration::from_millis(200);

const CAPTURE_FILE_MAX_RETRIES: u32 = 3;
const CAPTURE_FILE_INITIAL_DELAY: Duration = Duration::from_millis(5);
const CAPTURE_FILE_MAX_DELAY: Duration = Duration::from_millis(100);

const SESSION_POLL_BUDGET: Duration = Duration::from_secs(5);

/// Ctrl+Q, the detach keystroke while attached.
const DETACH_BYTE: u8 = 17;

/// Stdin bytes arriving within this window of attach are terminal control
/// sequences from the switch to raw mode, not user input.
const ATTACH_STDIN_DISCARD: Duration = Duration::from_millis(50);

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref ANSI_ESCAPE_RE: Regex = Regex::new(r"\x1b\[[0-9;]*m").unwrap();
}

/// Strips ANSI SGR escape sequences from text. Zellij colorizes
/// `list-sessions` output, which must be cleaned before line parsing.
pub fn strip_ansi_codes(text: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(text, "").into_owned()
}

/// Maps an instance title to its session name: whitespace removed, dots
/// replaced with underscores, product prefix applied exactly once.
/// Idempotent, so already-sanitized names pass through unchanged.
pub fn to_claude_squad_session_name(name: &str) -> String {
    let base = name.strip_prefix(ZELLIJ_PREFIX).unwrap_or(name);
    let cleaned = WHITESPACE_RE.replace_all(base, "").replace('.', "_");
    format!("{ZELLIJ_PREFIX}{cleaned}")
}

/// Tracks pane content changes through a streamed SHA-256 of the capture.
pub(crate) struct StatusMonitor {
    prev_output_hash: Option<[u8; 32]>,
}

impl StatusMonitor {
    pub(crate) fn new() -> Self {
        Self {
            prev_output_hash: None,
        }
    }

    /// Records the hash of the new content, returning whether it changed.
    pub(crate) fn has_changed(&mut self, content: &str) -> bool {
        let hash = content_hash(content);
        if self.prev_output_hash == Some(hash) {
            return false;
        }
        self.prev_output_hash = Some(hash);
        true
    }
}

/// SHA-256 of a string, hashed in place without copying it.
pub(crate) fn content_hash(content: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

/// A PTY master together with its reader task and child process.
pub(crate) struct PtyHandle {
    pub(crate) master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    pub(crate) writer: Arc<StdMutex<Box<dyn Write + Send>>>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    pub(crate) reader_shutdown: Arc<AtomicBool>,
}

impl PtyHandle {
    /// Opens a PTY running `cmd` and starts a background reader feeding the
    /// terminal buffer.
    pub(crate) fn open(cmd: CommandBuilder, term: &Arc<TerminalBuffer>) -> Result<Self> {
        let (rows, cols) = term.size();
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn PTY command")?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        let reader_shutdown = Arc::new(AtomicBool::new(false));
        spawn_pty_reader(reader, Arc::clone(term), Arc::clone(&reader_shutdown));

        Ok(Self {
            master: Arc::new(StdMutex::new(pair.master)),
            writer: Arc::new(StdMutex::new(writer)),
            child,
            reader_shutdown,
        })
    }

    /// Stops the reader task without closing the PTY. Used before attach,
    /// which takes over the PTY for direct I/O.
    pub(crate) fn stop_reader(&self) {
        self.reader_shutdown.store(true, Ordering::Relaxed);
    }

    /// Tears the PTY down: flips the reader's shutdown flag, kills the child
    /// attach process, and closes the master so blocked reads error out.
    pub(crate) fn shutdown(mut self) {
        self.reader_shutdown.store(true, Ordering::Relaxed);
        let _ = self.child.kill();
        // Dropping self closes the master; the reader exits on read error.
    }

    pub(crate) fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self
            .master
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize PTY")
    }
}

/// Continuously reads PTY output into the terminal buffer on an OS thread.
/// The thread exits when the shutdown flag flips or the PTY closes.
pub(crate) fn spawn_pty_reader(
    mut reader: Box<dyn Read + Send>,
    term: Arc<TerminalBuffer>,
    shutdown: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    term.write(&buf[..n]);
                }
            }
        }
    });
}

/// Attach state for a session.
enum AttachState {
    Detached,
    Attached { shutdown: Arc<AtomicBool> },
}

/// A managed zellij session.
pub struct ZellijSession {
    sanitized_name: String,
    program: String,

    /// Screen buffer fed by the PTY reader, shared with background tasks.
    term_buffer: Arc<TerminalBuffer>,
    /// Pane content cache shared with the trust-prompt handler.
    content_cache: Arc<ContentCache>,
    monitor: StatusMonitor,

    pty: Option<PtyHandle>,
    attach_state: AttachState,
}

impl std::fmt::Debug for ZellijSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZellijSession")
            .field("sanitized_name", &self.sanitized_name)
            .field("program", &self.program)
            .field("pty", &self.pty.is_some())
            .finish()
    }
}

impl ZellijSession {
    pub fn new(name: &str, program: &str) -> Self {
        Self {
            sanitized_name: to_claude_squad_session_name(name),
            program: program.to_string(),
            term_buffer: Arc::new(TerminalBuffer::new()),
            content_cache: Arc::new(ContentCache::new(CONTENT_CACHE_TTL)),
            monitor: StatusMonitor::new(),
            pty: None,
            attach_state: AttachState::Detached,
        }
    }

    /// The sanitized session name.
    pub fn name(&self) -> &str {
        &self.sanitized_name
    }

    pub fn get_program(&self) -> &str {
        &self.program
    }

    /// Creates and starts a new detached zellij session running the program.
    pub async fn start(&mut self, work_dir: &Path) -> Result<()> {
        if self.does_session_exist().await {
            anyhow::bail!("zellij session already exists: {}", self.sanitized_name);
        }

        let layout_file = std::env::temp_dir().join(format!(
            "zellij_layout_{}.kdl",
            self.sanitized_name
        ));
        let result = self.start_with_layout(work_dir, &layout_file).await;
        let _ = std::fs::remove_file(&layout_file);
        result?;

        if let Err(e) = self.restore().await {
            let _ = self.close().await;
            return Err(e.context("error restoring zellij session"));
        }

        // Answer the first-run trust screen in the background so session
        // creation returns immediately.
        tokio::spawn(handle_trust_screen(
            self.sanitized_name.clone(),
            self.program.clone(),
            Arc::clone(&self.term_buffer),
            Arc::clone(&self.content_cache),
        ));

        Ok(())
    }

    async fn start_with_layout(&self, work_dir: &Path, layout_file: &Path) -> Result<()> {
        // One pane running the program through sh, in KDL layout format.
        let layout_content = format!(
            "layout {{\n    pane {{\n        cwd \"{}\"\n        command \"sh\"\n        args \"-c\" \"{}\"\n    }}\n}}\n",
            work_dir.display(),
            self.program
        );
        std::fs::write(layout_file, layout_content).context("error creating layout file")?;
        debug!(
            "created layout file at {} for session {}",
            layout_file.display(),
            self.sanitized_name
        );

        let mut cmd = Command::new("zellij");
        cmd.args([
            "--session",
            &self.sanitized_name,
            "--new-session-with-layout",
        ])
        .arg(layout_file)
        .args([
            "options",
            "--attach-to-session",
            "false",
            "--show-startup-tips",
            "false",
            "--show-release-notes",
            "false",
        ]);

        // Clear zellij environment variables so creating a session from
        // within an existing zellij session does not trip nesting detection.
        for (key, _) in std::env::vars() {
            if key.starts_with("ZELLIJ") {
                cmd.env_remove(&key);
            }
        }

        // Detach from our TTY entirely; the command hangs if it can reach one.
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        cmd.spawn().context("error creating zellij session")?;

        // Wait for the session to appear with exponential backoff.
        let deadline = Instant::now() + SESSION_POLL_BUDGET;
        let mut delay = Duration::from_millis(10);
        while !self.does_session_exist().await {
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "timed out waiting for zellij session {} (ensure zellij is installed and working)",
                    self.sanitized_name
                );
            }
            sleep(delay).await;
            if delay < Duration::from_millis(100) {
                delay *= 2;
            }
        }

        Ok(())
    }

    /// Re-establishes the monitoring PTY for an existing session.
    pub async fn restore(&mut self) -> Result<()> {
        if !self.does_session_exist().await {
            anyhow::bail!("zellij session does not exist: {}", self.sanitized_name);
        }

        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }
        self.term_buffer.reset();

        let mut cmd = CommandBuilder::new("zellij");
        cmd.args(["attach", &self.sanitized_name]);
        let pty = PtyHandle::open(cmd, &self.term_buffer)?;
        self.pty = Some(pty);

        Ok(())
    }

    /// Attaches to the session for interactive use.
    ///
    /// Switches the terminal to raw mode and fans stdin to the PTY and PTY
    /// output to stdout. Ctrl+Q tears raw mode down and closes the returned
    /// channel; the caller then finishes with `detach` or `detach_safely`.
    pub async fn attach(&mut self) -> Result<mpsc::Receiver<()>> {
        if self.pty.is_none() {
            self.restore().await?;
        }
        let pty = self
            .pty
            .as_ref()
            .context("no PTY available for attach")?;

        // The preview reader stops; attach owns the PTY output now.
        pty.stop_reader();

        let shutdown = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        crossterm::terminal::enable_raw_mode().context("failed to enter raw mode")?;

        // Resize to the real terminal before mirroring output so content
        // rendered at preview size never reaches the screen.
        if let Ok((cols, rows)) = crossterm::terminal::size() {
            let _ = self.set_detached_size(cols, rows);
        }

        println!("\x1b[90m--- Press Ctrl+Q to detach ---\x1b[0m");

        let pty = self.pty.as_ref().context("no PTY available for attach")?;

        // PTY -> stdout
        {
            let master = Arc::clone(&pty.master);
            let shutdown = Arc::clone(&shutdown);
            let mut reader = master
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .try_clone_reader()
                .context("failed to clone PTY reader for attach")?;
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                let mut stdout = std::io::stdout();
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let _ = stdout.write_all(&buf[..n]);
                            let _ = stdout.flush();
                        }
                    }
                }
            });
        }

        // stdin -> PTY, watching for Ctrl+Q
        {
            let writer = Arc::clone(&pty.writer);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let started = Instant::now();
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; 32];
                // cancel_tx is dropped on every exit path, closing the channel.
                let _cancel_tx = cancel_tx;
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let n = match stdin.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };

                    // Swallow arrival-side control sequences.
                    if started.elapsed() < ATTACH_STDIN_DISCARD {
                        debug!("discarded initial stdin bytes: {:?}", &buf[..n]);
                        continue;
                    }

                    if n == 1 && buf[0] == DETACH_BYTE {
                        let _ = crossterm::terminal::disable_raw_mode();
                        shutdown.store(true, Ordering::Relaxed);
                        return;
                    }

                    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
                    let _ = writer.write_all(&buf[..n]);
                    let _ = writer.flush();
                }
            });
        }

        spawn_resize_monitor(
            Arc::clone(&shutdown),
            Arc::clone(&pty.master),
            Arc::clone(&self.term_buffer),
        );

        self.attach_state = AttachState::Attached { shutdown };
        Ok(cancel_rx)
    }

    /// Completes a detach: closes the PTY and restores the monitoring reader
    /// on the still-living session. Panics if the PTY cannot be restored;
    /// `detach_safely` is the non-panicking equivalent.
    pub async fn detach(&mut self) {
        self.end_attach();
        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }
        if let Err(e) = self.restore().await {
            let msg = format!("error restoring after detach: {e}");
            error!("{msg}");
            panic!("{msg}");
        }
    }

    /// Disconnects without panicking: closes the PTY, cancels the reader, and
    /// leaves the session alive and detached.
    pub async fn detach_safely(&mut self) -> Result<()> {
        self.end_attach();
        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }
        Ok(())
    }

    fn end_attach(&mut self) {
        if let AttachState::Attached { shutdown } = &self.attach_state {
            shutdown.store(true, Ordering::Relaxed);
            let _ = crossterm::terminal::disable_raw_mode();
        }
        self.attach_state = AttachState::Detached;
    }

    /// Terminates the session and cleans up all resources. Errors from the
    /// individual steps are accumulated.
    pub async fn close(&mut self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        self.end_attach();
        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }

        match Command::new("zellij")
            .args(["kill-session", &self.sanitized_name])
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                errs.push(format!(
                    "error killing zellij session: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
            }
            Err(e) => errs.push(format!("error killing zellij session: {e}")),
            Ok(_) => {}
        }

        match errs.len() {
            0 => Ok(()),
            1 => Err(anyhow::anyhow!("{}", errs.remove(0))),
            _ => {
                let mut msg = String::from("multiple errors during cleanup:");
                for err in &errs {
                    msg.push_str("\n  - ");
                    msg.push_str(err);
                }
                Err(anyhow::anyhow!(msg))
            }
        }
    }

    /// Sends keystrokes to the session.
    pub async fn send_keys(&self, keys: &str) -> Result<()> {
        self.content_cache.invalidate();
        zellij_action(&self.sanitized_name, &["write-chars", keys]).await
    }

    /// Sends an enter keystroke (carriage return).
    pub async fn tap_enter(&self) -> Result<()> {
        self.content_cache.invalidate();
        zellij_action(&self.sanitized_name, &["write", "13"]).await
    }

    /// Sends 'D' followed by enter, the confirm sequence for Aider/Gemini.
    pub async fn tap_d_and_enter(&self) -> Result<()> {
        self.send_keys("D").await?;
        self.tap_enter().await
    }

    /// Captures the current visible pane content, colored when the screen
    /// buffer has data, falling back to dump-screen during startup.
    pub async fn capture_pane_content(&self) -> Result<String> {
        capture_content(
            &self.sanitized_name,
            &self.term_buffer,
            &self.content_cache,
        )
        .await
    }

    /// Captures pane content including scroll history. Passing "-" for both
    /// bounds requests the full history.
    pub async fn capture_pane_content_with_options(
        &self,
        start: &str,
        end: &str,
    ) -> Result<String> {
        let tmp_file = capture_temp_path(&self.sanitized_name);

        let mut args: Vec<&str> = vec!["dump-screen"];
        if start == "-" && end == "-" {
            args.push("--full");
        }
        let tmp_str = tmp_file.to_string_lossy().into_owned();
        args.push(&tmp_str);

        let result = zellij_action(&self.sanitized_name, &args).await;
        let content = match result {
            Ok(()) => read_capture_file_with_retry(&tmp_file).await,
            Err(e) => Err(e),
        };
        let _ = std::fs::remove_file(&tmp_file);

        let content = content
            .with_context(|| format!("error reading capture file for session {}", self.sanitized_name))?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Checks whether pane content changed since the last call, and whether
    /// a confirmation prompt is currently displayed.
    pub async fn has_updated(&mut self) -> (bool, bool) {
        let content = match self.capture_pane_content().await {
            Ok(content) => content,
            Err(e) => {
                error!("error capturing pane content: {e}");
                return (false, false);
            }
        };

        let has_prompt = if self.program.ends_with(PROGRAM_CLAUDE) {
            content.contains("No, and tell Claude what to do differently")
        } else if self.program.starts_with(PROGRAM_AIDER) {
            content.contains("(Y)es/(N)o/(D)on't ask again")
        } else if self.program.starts_with(PROGRAM_GEMINI) {
            content.contains("Yes, allow once")
        } else {
            false
        };

        (self.monitor.has_changed(&content), has_prompt)
    }

    /// True if the session exists according to `list-sessions`.
    pub async fn does_session_exist(&self) -> bool {
        session_exists(&self.sanitized_name).await
    }

    /// Sets the pane dimensions while detached, propagating to both the
    /// screen buffer and the PTY.
    pub fn set_detached_size(&self, width: u16, height: u16) -> Result<()> {
        self.term_buffer.resize(height, width);
        if let Some(pty) = &self.pty {
            pty.resize(height, width)?;
        }
        Ok(())
    }

    /// Checks if the configured program is actively running in the session,
    /// as opposed to having exited back to a shell.
    pub async fn is_program_running(&self) -> Result<bool> {
        let content = self
            .capture_pane_content()
            .await
            .context("failed to capture pane content")?;
        Ok(detect_program_running(&content))
    }

    /// Relaunches the program in the existing session with optional extra
    /// arguments, re-arming the trust-prompt handler.
    pub async fn restart_program(&mut self, args: &str) -> Result<()> {
        let mut command = self.program.clone();
        if !args.is_empty() {
            command.push(' ');
            command.push_str(args);
        }

        self.send_keys(&command)
            .await
            .context("failed to send program command")?;
        self.tap_enter()
            .await
            .context("failed to execute program command")?;

        info!(
            "restarted program in session {}: {command}",
            self.sanitized_name
        );

        tokio::spawn(handle_trust_screen(
            self.sanitized_name.clone(),
            self.program.clone(),
            Arc::clone(&self.term_buffer),
            Arc::clone(&self.content_cache),
        ));

        Ok(())
    }
}

/// Runs `zellij -s <name> action <args...>`.
async fn zellij_action(session_name: &str, args: &[&str]) -> Result<()> {
    let output = Command::new("zellij")
        .args(["-s", session_name, "action"])
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run zellij action {args:?}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "zellij action {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

async fn session_exists(session_name: &str) -> bool {
    let Ok(output) = Command::new("zellij").arg("list-sessions").output().await else {
        return false;
    };
    if !output.status.success() {
        return false;
    }

    let clean = strip_ansi_codes(&String::from_utf8_lossy(&output.stdout));
    clean.lines().any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|name| name == session_name)
    })
}

fn capture_temp_path(session_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("zellij_capture_{session_name}_{nanos}.txt"))
}

/// Captures visible pane content for a session: cached content first, then
/// the colored screen buffer, then a dump-screen round trip.
async fn capture_content(
    session_name: &str,
    term: &TerminalBuffer,
    cache: &ContentCache,
) -> Result<String> {
    if let Some(content) = cache.get() {
        return Ok(content);
    }

    // Colored fast path once the PTY reader has produced something.
    let rendered = term.render();
    if !strip_ansi_codes(&rendered).trim().is_empty() {
        cache.set(rendered.clone());
        return Ok(rendered);
    }

    // Fall back to dump-screen, which works before the reader catches up.
    let tmp_file = capture_temp_path(session_name);
    let tmp_str = tmp_file.to_string_lossy().into_owned();
    let result = zellij_action(session_name, &["dump-screen", &tmp_str]).await;
    let content = match result {
        Ok(()) => read_capture_file_with_retry(&tmp_file).await,
        Err(e) => Err(e),
    };
    let _ = std::fs::remove_file(&tmp_file);

    let content = content
        .with_context(|| format!("error reading capture file for session {session_name}"))?;
    let content = String::from_utf8_lossy(&content).into_owned();
    cache.set(content.clone());
    Ok(content)
}

/// Reads the dump-screen output file, retrying while zellij is still writing
/// it. The file must exist and be non-empty to count as ready.
async fn read_capture_file_with_retry(path: &Path) -> Result<Vec<u8>> {
    let mut delay = CAPTURE_FILE_INITIAL_DELAY;
    let mut last_err = String::new();

    for attempt in 0..=CAPTURE_FILE_MAX_RETRIES {
        if attempt > 0 {
            sleep(delay).await;
            delay = std::cmp::min(delay.mul_f64(1.5), CAPTURE_FILE_MAX_DELAY);
        }

        match std::fs::metadata(path) {
            Err(e) => {
                last_err = format!(
                    "capture file does not exist (attempt {}/{}): {e}",
                    attempt + 1,
                    CAPTURE_FILE_MAX_RETRIES + 1
                );
                continue;
            }
            Ok(info) if info.len() == 0 => {
                last_err = format!(
                    "capture file is empty (attempt {}/{})",
                    attempt + 1,
                    CAPTURE_FILE_MAX_RETRIES + 1
                );
                continue;
            }
            Ok(_) => {}
        }

        match std::fs::read(path) {
            Ok(content) if !content.is_empty() => return Ok(content),
            Ok(_) => {
                last_err = format!(
                    "capture file read returned empty content (attempt {}/{})",
                    attempt + 1,
                    CAPTURE_FILE_MAX_RETRIES + 1
                );
            }
            Err(e) => {
                last_err = format!(
                    "error reading capture file (attempt {}/{}): {e}",
                    attempt + 1,
                    CAPTURE_FILE_MAX_RETRIES + 1
                );
            }
        }
    }

    anyhow::bail!(
        "failed to read capture file after {} attempts: {last_err}",
        CAPTURE_FILE_MAX_RETRIES + 1
    )
}

/// Answers the first-run trust screen in the background so session creation
/// never blocks on it.
async fn handle_trust_screen(
    session_name: String,
    program: String,
    term: Arc<TerminalBuffer>,
    cache: Arc<ContentCache>,
) {
    let is_claude = program.ends_with(PROGRAM_CLAUDE);
    let is_other = program.ends_with(PROGRAM_AIDER) || program.ends_with(PROGRAM_GEMINI);
    if !is_claude && !is_other {
        return;
    }

    let (search_string, max_wait, tap_d_first) = if is_claude {
        (
            "Do you trust the files in this folder?",
            Duration::from_secs(30),
            false,
        )
    } else {
        (
            "Open documentation url for more info",
            Duration::from_secs(45),
            true,
        )
    };

    let started = Instant::now();
    let mut delay = Duration::from_millis(100);

    while started.elapsed() < max_wait {
        sleep(delay).await;

        if let Ok(content) = capture_content(&session_name, &term, &cache).await {
            if content.contains(search_string) {
                cache.invalidate();
                let result = if tap_d_first {
                    match zellij_action(&session_name, &["write-chars", "D"]).await {
                        Ok(()) => zellij_action(&session_name, &["write", "13"]).await,
                        Err(e) => Err(e),
                    }
                } else {
                    zellij_action(&session_name, &["write", "13"]).await
                };
                if let Err(e) = result {
                    error!("could not confirm trust screen: {e}");
                }
                return;
            }
        }

        delay = std::cmp::min(delay.mul_f64(1.2), Duration::from_secs(1));
    }
}

/// Pushes terminal size changes to the PTY and screen buffer while attached.
/// On unix this reacts to SIGWINCH with a 50 ms debounce; elsewhere it polls.
fn spawn_resize_monitor(
    shutdown: Arc<AtomicBool>,
    master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    term: Arc<TerminalBuffer>,
) {
    let apply = move |master: &Arc<StdMutex<Box<dyn MasterPty + Send>>>,
                      term: &Arc<TerminalBuffer>| {
        if let Ok((cols, rows)) = crossterm::terminal::size() {
            term.resize(rows, cols);
            let guard = master.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = guard.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                warn!("failed to update window size: {e}");
            }
        }
    };

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut winch) = signal(SignalKind::window_change()) else {
            return;
        };

        apply(&master, &term);
        loop {
            tokio::select! {
                signal = winch.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    // Debounce: bursts of resize events coalesce into the
                    // pending signal during this sleep.
                    sleep(Duration::from_millis(50)).await;
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    apply(&master, &term);
                }
                _ = sleep(Duration::from_millis(200)) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                }
            }
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_millis(500)).await;
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            apply(&master, &term);
        }
    });
}

/// Analyzes terminal content to decide whether the agent program is running,
/// as opposed to having exited back to a shell prompt.
pub fn detect_program_running(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.len() < 10 {
        debug!("content too short ({} chars), assuming not running", trimmed.len());
        return false;
    }

    // Startup banners and permission prompts prove the program is up.
    const RUNNING_INDICATORS: &[&str] = &[
        "Do you trust the files",
        "Claude Code",
        "No, and tell Claude",
        "(Y)es/(N)o/(D)on't ask again",
        "Yes, allow once",
        "Open documentation url",
    ];
    for indicator in RUNNING_INDICATORS {
        if content.contains(indicator) {
            return true;
        }
    }

    // Shell prompts on the last non-blank lines mean the program exited.
    const SHELL_PROMPT_PATTERNS: &[&str] = &[
        "$ ",
        "% ",
        "# ",
        "\u{276f} ",
        "\u{279c} ",
        "[exited]",
        "[Exited]",
        "exited with",
    ];
    let last_lines: Vec<&str> = content
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(5)
        .collect();

    for line in &last_lines {
        for pattern in SHELL_PROMPT_PATTERNS {
            if line.contains(pattern) {
                debug!("found shell prompt pattern {pattern:?} in {line:?}");
                return false;
            }
        }
        // A bare prompt character is a prompt with its trailing space trimmed.
        if matches!(*line, "$" | "%" | "#" | "\u{276f}" | "\u{279c}") {
            debug!("found bare shell prompt {line:?}");
            return false;
        }
        // user@host:path$ style prompts
        if line.contains('@')
            && (line.ends_with('$') || line.ends_with('#') || line.ends_with('%'))
        {
            debug!("found user@host shell prompt in {line:?}");
            return false;
        }
    }

    // No definitive signal either way; assume running to avoid false restarts.
    true
}

/// True if zellij is installed and responding.
pub async fn is_available() -> bool {
    Command::new("zellij")
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Kills every zellij session bearing the product prefix.
pub async fn cleanup_sessions() -> Result<()> {
    let output = Command::new("zellij")
        .arg("list-sessions")
        .output()
        .await
        .context("failed to list zellij sessions")?;
    if !output.status.success() {
        // Exit code 1 means no sessions exist.
        if output.status.code() == Some(1) {
            return Ok(());
        }
        anyhow::bail!(
            "failed to list zellij sessions: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let clean = strip_ansi_codes(&String::from_utf8_lossy(&output.stdout));
    for line in clean.lines() {
        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        if !name.starts_with(ZELLIJ_PREFIX) {
            continue;
        }
        info!("cleaning up zellij session: {name}");
        let output = Command::new("zellij")
            .args(["kill-session", name])
            .output()
            .await
            .with_context(|| format!("failed to kill zellij session {name}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to kill zellij session {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_sanitization() {
        assert_eq!(
            to_claude_squad_session_name("my task"),
            "claudesquad_mytask"
        );
        assert_eq!(
            to_claude_squad_session_name("v1.2 fix"),
            "claudesquad_v1_2fix"
        );
        assert_eq!(to_claude_squad_session_name("alpha"), "claudesquad_alpha");
    }

    #[test]
    fn test_session_name_sanitization_is_idempotent() {
        for input in ["alpha", "my task", "a.b.c", "with\ttabs and spaces"] {
            let once = to_claude_squad_session_name(input);
            let twice = to_claude_squad_session_name(&once);
            assert_eq!(once, twice);
            // The prefix appears exactly once.
            assert_eq!(once.matches(ZELLIJ_PREFIX).count(), 1);
        }
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(
            strip_ansi_codes("\x1b[38;5;123mHello\x1b[0m World"),
            "Hello World"
        );
        assert_eq!(strip_ansi_codes("plain"), "plain");
        assert_eq!(strip_ansi_codes(""), "");
    }

    #[test]
    fn test_status_monitor_change_detection() {
        let mut monitor = StatusMonitor::new();
        assert!(monitor.has_changed("first"));
        assert!(!monitor.has_changed("first"));
        assert!(monitor.has_changed("second"));
        assert!(monitor.has_changed("first"));
    }

    #[test]
    fn test_detect_program_running_indicators() {
        assert!(detect_program_running(
            "some output\nDo you trust the files in this folder?\nmore"
        ));
        assert!(detect_program_running(
            "Claude Code v1.0\nworking on your request..."
        ));
    }

    #[test]
    fn test_detect_program_running_shell_prompts() {
        assert!(!detect_program_running(
            "program output here\nuser@host:~/project$ "
        ));
        assert!(!detect_program_running(
            "claude session ended\n[exited]\nsome trailing line padding"
        ));
        assert!(!detect_program_running(
            "long scrollback content\n\u{276f} "
        ));
    }

    #[test]
    fn test_detect_program_running_short_content() {
        assert!(!detect_program_running(""));
        assert!(!detect_program_running("$ "));
    }

    #[test]
    fn test_detect_program_running_conservative_default() {
        assert!(detect_program_running(
            "a long stream of build output\nwith no prompt markers anywhere\nstill going"
        ));
    }

    #[tokio::test]
    async fn test_read_capture_file_with_retry_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.txt");
        std::fs::write(&path, "pane content").unwrap();

        let content = read_capture_file_with_retry(&path).await.unwrap();
        assert_eq!(content, b"pane content");
    }

    #[tokio::test]
    async fn test_read_capture_file_with_retry_late_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.txt");

        // Simulate zellij's asynchronous file write landing after the first
        // attempts.
        let write_path = path.clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(8)).await;
            std::fs::write(&write_path, "late content").unwrap();
        });

        let content = read_capture_file_with_retry(&path).await.unwrap();
        assert_eq!(content, b"late content");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_capture_file_with_retry_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-written.txt");

        let err = read_capture_file_with_retry(&path).await.unwrap_err();
        assert!(err.to_string().contains("after 4 attempts"));
    }
}
