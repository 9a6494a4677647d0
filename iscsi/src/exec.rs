use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::debug;

use crate::IscsiError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn ok<S: Into<String>>(stdout: S) -> Self {
        Output {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed<S: Into<String>>(code: i32, stderr: S) -> Self {
        Output {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Local command execution.
///
/// `Err` means the command could not be run to completion (spawn failure,
/// timeout); a non-zero exit status is reported through [`Output::code`].
pub trait Runner: Send + Sync {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<Output>;
}

/// Runs a command and turns a non-zero exit into [`IscsiError::ToolFailure`].
pub fn run_checked(
    runner: &dyn Runner,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<Output> {
    let output = runner.run(program, args, timeout)?;
    if !output.success() {
        anyhow::bail!(IscsiError::ToolFailure {
            command: command_line(program, args),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
    Ok(output)
}

pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Runner for ProcessRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<Output> {
        let line = command_line(program, args);
        debug!("exec: {}", line);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning '{}'", line))?;

        // drain pipes on their own threads so a chatty tool cannot block on a full pipe
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let out_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });
        let err_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!(IscsiError::ToolTimeout(line))
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();

        Ok(Output {
            // killed by a signal
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}
