//! Capability interface for everything that touches the host: version control,
//! build tools, the package manager. Stages only talk to [`Host`]; tests swap
//! in a recording fake.

use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::log_sanitize::sanitize_log_line;

/// A declared external command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Shell-like rendering for logs; not meant to be re-parsed.
    pub fn command_line(&self) -> String {
        let mut out = String::new();
        if let Some(dir) = &self.cwd {
            out.push_str(&format!("(cd {}) ", dir.display()));
        }
        for (k, v) in &self.env {
            out.push_str(&format!("{k}={} ", quote_arg(v)));
        }
        out.push_str(&quote_arg(&self.program));
        for a in &self.args {
            out.push(' ');
            out.push_str(&quote_arg(a));
        }
        out
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env);
        cmd
    }
}

fn quote_arg(a: &str) -> String {
    let safe = !a.is_empty()
        && a.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '+' | ',' | '@')
        });
    if safe {
        a.to_string()
    } else {
        format!("'{}'", a.replace('\'', "'\"'\"'"))
    }
}

/// Exit status plus stdout of a command whose failure is an answer, not an error.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub success: bool,
    pub stdout: String,
}

pub mod invocations {
    use std::path::Path;

    use super::Invocation;

    pub fn git_clone(url: &str, tag: &str, dest: &Path, recurse_submodules: bool) -> Invocation {
        let mut inv = Invocation::new("git")
            .args(["clone", "--depth", "1", "--branch", tag]);
        if recurse_submodules {
            inv = inv.arg("--recurse-submodules").arg("--shallow-submodules");
        }
        inv.arg(url).arg_path(dest)
    }

    pub fn apply_patch(repo: &Path, patch: &Path) -> Invocation {
        Invocation::new("patch")
            .args(["-p1", "--forward", "--batch", "-i"])
            .arg_path(patch)
            .cwd(repo)
    }

    pub fn package_query(name: &str) -> Invocation {
        Invocation::new("dpkg-query")
            .args(["-W", "-f=${Status}", name])
    }

    pub fn apt(args: &[&str]) -> Invocation {
        Invocation::new("apt-get")
            .args(args.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive")
    }
}

pub trait Host: Send + Sync {
    /// Run to completion, streaming output into the task log; non-zero exit is an error.
    fn run(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<()>;

    /// Run and return stdout; non-zero exit is an error.
    fn capture(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<String>;

    fn probe(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<Probe>;

    fn git_clone(
        &self,
        ctx: &ExecCtx,
        url: &str,
        tag: &str,
        dest: &Path,
        recurse_submodules: bool,
    ) -> Result<()> {
        self.run(ctx, &invocations::git_clone(url, tag, dest, recurse_submodules))
            .map_err(|e| e.context(format!("clone of {url} at {tag} failed")))
    }

    fn apply_patch(&self, ctx: &ExecCtx, repo: &Path, patch: &Path) -> Result<()> {
        self.run(ctx, &invocations::apply_patch(repo, patch))
            .map_err(|e| e.context(format!("patch {} does not apply", patch.display())))
    }

    fn build(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<()> {
        self.run(ctx, inv)
    }

    fn package_installed(&self, ctx: &ExecCtx, name: &str) -> Result<bool> {
        let probe = self.probe(ctx, &invocations::package_query(name))?;
        Ok(probe.success && probe.stdout.contains("install ok installed"))
    }

    fn refresh_packages(&self, ctx: &ExecCtx) -> Result<()> {
        self.run(ctx, &invocations::apt(&["update"]))
    }

    fn install_package(&self, ctx: &ExecCtx, name: &str) -> Result<()> {
        self.run(
            ctx,
            &invocations::apt(&["install", "-y", "--no-install-recommends", name]),
        )
    }

    fn remove_package(&self, ctx: &ExecCtx, name: &str) -> Result<()> {
        self.run(ctx, &invocations::apt(&["purge", "-y", name]))
    }

    fn install_deb(&self, ctx: &ExecCtx, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run(ctx, &invocations::apt(&["install", "-y", path.as_ref()]))
    }
}

/// Executes commands on the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<()> {
        let line = inv.command_line();
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {line}"));
            return Ok(());
        }
        ctx.log(&format!("$ {line}"));
        tracing::debug!(cmd = %line, "spawning");

        let mut cmd = inv.to_command();
        // Own process group: a signal to the build tool's group must not reach us.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn '{}': {e}", inv.program)))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                ctx.log(&line);
            }
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed for '{}': {e}", inv.program)))?;
        if !status.success() {
            return Err(Error::msg(format!("command `{line}` failed: {status}")));
        }
        Ok(())
    }

    fn capture(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<String> {
        let line = inv.command_line();
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {line}"));
            return Ok(String::new());
        }
        tracing::debug!(cmd = %line, "capturing");
        let out = inv
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("failed to run '{}': {e}", inv.program)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::msg(format!(
                "command `{line}` failed: {}: {}",
                out.status,
                sanitize_log_line(stderr.trim())
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn probe(&self, ctx: &ExecCtx, inv: &Invocation) -> Result<Probe> {
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {}", inv.command_line()));
            return Ok(Probe::default());
        }
        let out = inv
            .to_command()
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("failed to run '{}': {e}", inv.program)))?;
        Ok(Probe {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}
