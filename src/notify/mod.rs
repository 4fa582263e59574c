//! Best-effort side channels for the serving URL
//!
//! A terminal QR code (via `qrencode`) and the host clipboard (via whichever
//! clipboard utility exists). Missing tools and failing tools are logged and
//! otherwise ignored; nothing here can fail a run.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from a notification channel
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("I/O error running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}")]
    Failed { tool: String, status: String },
}

/// One way of handing the URL to the user
pub trait Notifier {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn notify(&self, url: &str) -> Result<(), NotifyError>;
}

/// An external program plus fixed arguments
#[derive(Debug, Clone)]
struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ToolCommand {
    fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    fn run(&self, extra_arg: Option<&str>, stdin: Option<&str>, inherit_stdout: bool) -> Result<(), NotifyError> {
        let tool = self.display_name();
        let io_err = |source: io::Error| NotifyError::Io {
            tool: tool.clone(),
            source,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(if inherit_stdout { Stdio::inherit() } else { Stdio::null() })
            .stderr(Stdio::null());
        if let Some(arg) = extra_arg {
            command.arg(arg);
        }

        let mut child = command.spawn().map_err(io_err)?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            match pipe.write_all(data.as_bytes()) {
                // the exit status explains an early exit better than EPIPE
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(io_err(e)),
                _ => {}
            }
        }
        let status = child.wait().map_err(io_err)?;

        if status.success() {
            Ok(())
        } else {
            Err(NotifyError::Failed {
                tool,
                status: status.to_string(),
            })
        }
    }
}

/// Renders the URL as a QR code on the terminal
#[derive(Debug, Clone)]
pub struct QrTerminal {
    command: ToolCommand,
}

impl QrTerminal {
    pub fn detect() -> Option<Self> {
        which::which("qrencode").ok().map(Self::with_program)
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            command: ToolCommand::new(program, ["-t", "ANSIUTF8"]),
        }
    }
}

impl Notifier for QrTerminal {
    fn name(&self) -> &str {
        "qr"
    }

    fn notify(&self, url: &str) -> Result<(), NotifyError> {
        self.command.run(Some(url), None, true)
    }
}

/// Clipboard utilities in order of preference, with their arguments
const CLIPBOARD_TOOLS: &[(&str, &[&str])] = &[
    ("termux-clipboard-set", &[]),
    ("pbcopy", &[]),
    ("wl-copy", &[]),
    ("xclip", &["-selection", "clipboard"]),
    ("xsel", &["--clipboard", "--input"]),
];

/// Copies the URL to the host clipboard through an external utility
#[derive(Debug, Clone)]
pub struct Clipboard {
    command: ToolCommand,
}

impl Clipboard {
    /// First clipboard utility found on `PATH`
    pub fn detect() -> Option<Self> {
        CLIPBOARD_TOOLS.iter().find_map(|(tool, args)| {
            which::which(tool)
                .ok()
                .map(|path| Self::with_command(path, args.iter().copied()))
        })
    }

    /// Use an explicit program; it receives the URL on stdin
    pub fn with_command<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            command: ToolCommand::new(program, args),
        }
    }
}

impl Notifier for Clipboard {
    fn name(&self) -> &str {
        "clipboard"
    }

    fn notify(&self, url: &str) -> Result<(), NotifyError> {
        self.command.run(None, Some(url), false)
    }
}

/// Stand-in used when no channel is available
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn name(&self) -> &str {
        "none"
    }

    fn notify(&self, _url: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Channels available in this environment, honouring the switches
///
/// Never empty: falls back to [`NoopNotifier`].
pub fn detect(qr: bool, clipboard: bool) -> Vec<Box<dyn Notifier>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

    if qr {
        match QrTerminal::detect() {
            Some(n) => notifiers.push(Box::new(n)),
            None => debug!("qrencode not found, skipping QR code"),
        }
    }
    if clipboard {
        match Clipboard::detect() {
            Some(n) => notifiers.push(Box::new(n)),
            None => debug!("no clipboard utility found"),
        }
    }

    if notifiers.is_empty() {
        notifiers.push(Box::new(NoopNotifier));
    }
    notifiers
}

/// Offer `url` to every channel; returns how many succeeded
pub fn notify_all(notifiers: &[Box<dyn Notifier>], url: &str) -> usize {
    notifiers
        .iter()
        .filter(|n| match n.notify(url) {
            Ok(()) => {
                debug!(channel = n.name(), "delivered serving URL");
                true
            }
            Err(e) => {
                warn!(channel = n.name(), error = %e, "notification failed");
                false
            }
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_an_error() {
        let clipboard = Clipboard::with_command("/nonexistent/bin/pbcopy", Vec::<OsString>::new());
        let err = clipboard.notify("http://127.0.0.1:8000/x.zip").unwrap_err();
        assert!(matches!(err, NotifyError::Io { .. }));
        assert!(err.to_string().contains("pbcopy"));
    }

    #[test]
    fn test_disabled_channels_fall_back_to_noop() {
        let notifiers = detect(false, false);
        assert_eq!(notifiers.len(), 1);
        assert_eq!(notifiers[0].name(), "none");
        assert_eq!(notify_all(&notifiers, "http://h:1/f"), 1);
    }

    #[test]
    fn test_notify_all_counts_successes_only() {
        let notifiers: Vec<Box<dyn Notifier>> = vec![
            Box::new(QrTerminal::with_program("/nonexistent/qrencode")),
            Box::new(Clipboard::with_command("/nonexistent/xclip", ["-selection", "clipboard"])),
        ];
        assert_eq!(notify_all(&notifiers, "http://h:1/f"), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_clipboard_receives_url_on_stdin() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("clip.txt");
        let script = format!("cat > '{}'", out.display());
        let clipboard = Clipboard::with_command("/bin/sh", ["-c", script.as_str()]);

        clipboard.notify("http://10.0.0.2:8000/site.tar.gz").unwrap();

        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "http://10.0.0.2:8000/site.tar.gz"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_reports_status() {
        let clipboard = Clipboard::with_command("/bin/sh", ["-c", "exit 3"]);
        let err = clipboard.notify("http://h:1/f").unwrap_err();
        assert!(matches!(err, NotifyError::Failed { .. }));
    }
}
