//! Shell command execution.
//!
//! The command line is split by a POSIX-like tokenizer: single quotes are
//! literal, double quotes honor `\"` and `\\`, a bare backslash escapes the
//! next character. No expansion or redirection is performed; unquoted shell
//! metacharacters (`| & ; < > $ \` ( )`) are rejected outright instead of
//! being silently passed through.
//!
//! The child runs in its own process group so that deadline expiry can
//! terminate the whole tree: SIGTERM first, SIGKILL after a 500 ms grace.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::errors::Error;

const KILL_GRACE: Duration = Duration::from_millis(500);

/// Characters that would require a real shell; rejected when unquoted.
const FORBIDDEN: &[char] = &['|', '&', ';', '<', '>', '$', '`', '(', ')'];

pub fn tokenize(line: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(Error::BadArguments(
                                "unterminated single quote in command".into(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\')) => current.push(e),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(Error::BadArguments(
                                    "unterminated double quote in command".into(),
                                ))
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(Error::BadArguments(
                                "unterminated double quote in command".into(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => {
                        return Err(Error::BadArguments(
                            "trailing backslash in command".into(),
                        ))
                    }
                }
            }
            c if FORBIDDEN.contains(&c) => {
                return Err(Error::BadArguments(format!(
                    "unsupported shell construct {c:?}; quote it if it is literal"
                )));
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Everything a finished (or failed-to-start) command produced.
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
}

fn read_lines<R>(reader: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut collected = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push(line);
        }
        collected
    })
}

async fn terminate_group(pgid: Option<Pid>, child: &mut Child) {
    if let Some(pgid) = pgid {
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            debug!("SIGTERM to process group {pgid} failed: {e}");
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            warn!("SIGKILL to process group {pgid} failed: {e}");
        }
    }
    let _ = child.wait().await;
}

/// Runs one command line under `deadline`. Deadline enforcement lives here
/// (not in the dispatcher) so the process tree gets its termination grace.
pub async fn run(line: &str, deadline: Duration) -> Result<CommandOutput, Error> {
    let argv = tokenize(line)?;
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => return Err(Error::BadArguments("empty command".into())),
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            // mirror the shell's "command not found" convention
            return Ok(CommandOutput {
                stdout: Vec::new(),
                stderr: vec![format!("{program}: {e}")],
                exit_code: 127,
            });
        }
    };

    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
    let stdout = read_lines(child.stdout.take().expect("piped stdout"));
    let stderr = read_lines(child.stderr.take().expect("piped stderr"));

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| Error::Internal(format!("wait failed: {e}")))?
        }
        _ = tokio::time::sleep(deadline) => {
            terminate_group(pgid, &mut child).await;
            stdout.abort();
            stderr.abort();
            return Err(Error::DeadlineExceeded(deadline.as_millis() as u64));
        }
    };

    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("echo hello world").unwrap(), ["echo", "hello", "world"]);
        assert_eq!(tokenize("  ls   -la  ").unwrap(), ["ls", "-la"]);
    }

    #[test]
    fn single_quotes_are_literal() {
        assert_eq!(
            tokenize("echo 'hello world' '\\n'").unwrap(),
            ["echo", "hello world", "\\n"]
        );
    }

    #[test]
    fn double_quotes_honor_escapes() {
        assert_eq!(
            tokenize(r#"echo "a \"quoted\" word" "back\\slash""#).unwrap(),
            ["echo", r#"a "quoted" word"#, r"back\slash"]
        );
    }

    #[test]
    fn quotes_join_adjacent_text() {
        assert_eq!(tokenize("echo pre'mid'post").unwrap(), ["echo", "premidpost"]);
    }

    #[test]
    fn empty_quoted_token_survives() {
        assert_eq!(tokenize("printf ''").unwrap(), ["printf", ""]);
    }

    #[test]
    fn unquoted_metacharacters_are_rejected() {
        for line in ["a | b", "a && b", "a; b", "a > f", "echo $HOME", "a `b`"] {
            let err = tokenize(line).unwrap_err();
            assert_eq!(err.kind(), "bad_arguments", "line {line:?}");
        }
    }

    #[test]
    fn quoted_metacharacters_are_fine() {
        assert_eq!(
            tokenize("sh -c 'echo hello; echo world'").unwrap(),
            ["sh", "-c", "echo hello; echo world"]
        );
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(tokenize("echo 'oops").is_err());
        assert!(tokenize("echo \"oops").is_err());
        assert!(tokenize("echo oops\\").is_err());
    }

    #[tokio::test]
    async fn captures_stdout_line_wise() {
        let output = run("sh -c 'echo hello; echo world'", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, ["hello", "world"]);
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_stderr() {
        let output = run(
            "sh -c 'echo partial; echo failure >&2; exit 3'",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, ["partial"]);
        assert_eq!(output.stderr, ["failure"]);
    }

    #[tokio::test]
    async fn missing_binary_reports_127() {
        let output = run("definitely-not-a-binary-xyz", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 127);
        assert!(!output.stderr.is_empty());
    }

    #[tokio::test]
    async fn deadline_terminates_the_process() {
        let started = std::time::Instant::now();
        let err = run("sleep 5", Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
