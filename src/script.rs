//! Runs external programs: pre/post execution scripts and the script plugins.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Command;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `script` with the (already substituted) argument string.
    ///
    /// Output is forwarded to the log line by line. A non-zero exit status is an error.
    pub async fn run(&self, script: &str, arguments: Option<&str>) -> Result<(), Error> {
        let arguments = arguments.map(split_arguments).unwrap_or_default();
        self.execute(script, &arguments).await
    }

    /// Runs a whole command line, the first word being the program.
    pub async fn run_command_line(&self, command: &str) -> Result<(), Error> {
        let mut words = split_arguments(command);
        if words.is_empty() {
            return Err(Error::Script("empty command line".into()));
        }
        let program = words.remove(0);
        self.execute(&program, &words).await
    }

    async fn execute(&self, script: &str, arguments: &[String]) -> Result<(), Error> {
        info!("Running {} {}", script, arguments.join(" "));

        let child = Command::new(script)
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Script(format!("{}: {}", script, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "{} did not finish within {}s",
                    script,
                    self.timeout.as_secs()
                )))
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("[{}] {}", script, line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("[{}] {}", script, line);
        }

        if output.status.success() {
            debug!("{} finished", script);
            Ok(())
        } else {
            Err(Error::Script(format!("{} exited with {}", script, output.status)))
        }
    }
}

/// Replaces every `{Name}` token with its value.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_owned(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Splits on whitespace, keeping double quoted sections together.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in arguments.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    result.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        result.push(current);
    }
    result
}
