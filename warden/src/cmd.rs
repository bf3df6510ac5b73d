use std::ffi::OsString;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::access::ProtoPort;
use crate::now_unix;

/// Bounded run for the direct (run-as-root) path.
pub const DIRECT_CMD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct CmdOutput {
    /// Exit code; None when the child was killed or signalled.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

fn wait_bounded(child: &mut std::process::Child, timeout: Option<Duration>) -> Result<Option<i32>> {
    match timeout {
        None => Ok(child.wait()?.code()),
        Some(limit) => {
            let start = Instant::now();
            loop {
                if let Some(status) = child.try_wait()? {
                    return Ok(status.code());
                }
                if start.elapsed() > limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn run_child(mut command: Command, stdin: Option<&[u8]>, timeout: Option<Duration>) -> Result<CmdOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().context("spawn external command")?;

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child stdin missing"))?;
        pipe.write_all(input).context("write child stdin")?;
        // dropping the pipe closes it so the child sees EOF
    }

    let status = wait_bounded(&mut child, timeout)?;

    let mut stdout = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_end(&mut stdout);
    }
    let mut stderr = Vec::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_end(&mut stderr);
    }

    Ok(CmdOutput {
        status,
        stdout,
        stderr,
    })
}

/// Run a program with an explicit argv; no shell involved.
pub fn run_argv(
    program: &Path,
    args: &[OsString],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CmdOutput> {
    let mut command = Command::new(program);
    command.args(args);
    run_child(command, stdin, timeout)
}

fn split_cmdline(cmdline: &str) -> Result<(OsString, Vec<OsString>)> {
    let mut words = cmdline.split_whitespace().map(OsString::from);
    let program = words.next().ok_or_else(|| anyhow!("empty command line"))?;
    Ok((program, words.collect()))
}

/// Run a whitespace-split command line as the current user.
pub fn run(cmdline: &str, stdin: Option<&[u8]>, timeout: Option<Duration>) -> Result<CmdOutput> {
    let (program, args) = split_cmdline(cmdline)?;
    let mut command = Command::new(program);
    command.args(args);
    run_child(command, stdin, timeout)
}

/// Run a whitespace-split command line setuid/setgid to the given IDs.
#[cfg(unix)]
pub fn run_as(
    uid: u32,
    gid: u32,
    cmdline: &str,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CmdOutput> {
    use std::os::unix::process::CommandExt;

    let (program, args) = split_cmdline(cmdline)?;
    let mut command = Command::new(program);
    command.args(args).uid(uid).gid(gid);
    run_child(command, stdin, timeout)
}

/// Substitute the command-cycle template variables.
pub fn render_template(
    tpl: &str,
    ip: Ipv4Addr,
    port: Option<ProtoPort>,
    timeout_secs: u32,
) -> String {
    let mut out = tpl.replace("$IP", &ip.to_string());
    out = out.replace("$TIMEOUT", &timeout_secs.to_string());
    if let Some(pp) = port {
        out = out.replace("$PROTO", &pp.proto.to_string());
        out = out.replace("$PORT", &pp.port.to_string());
    }
    out
}

struct PendingClose {
    expire_at: i64,
    cmdline: String,
}

/// Close-side of the command cycle: rendered close commands wait here until
/// their access window lapses, then the collector runs them.
#[derive(Default)]
pub struct CmdCycle {
    pending: Mutex<Vec<PendingClose>>,
}

impl CmdCycle {
    pub fn new() -> CmdCycle {
        CmdCycle::default()
    }

    pub fn register_close(&self, cmdline: String, expire_at: i64) {
        let mut pending = self.pending.lock().expect("cmd cycle lock poisoned");
        pending.push(PendingClose { expire_at, cmdline });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("cmd cycle lock poisoned").len()
    }

    /// Run every close command whose window has lapsed.
    pub fn run_due(&self) {
        let now = now_unix();
        let due: Vec<PendingClose> = {
            let mut pending = self.pending.lock().expect("cmd cycle lock poisoned");
            let (expired, live) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|p| p.expire_at <= now);
            *pending = live;
            expired
        };
        for close in due {
            tracing::info!("Running command cycle close: '{}'", close.cmdline);
            match run(&close.cmdline, None, Some(DIRECT_CMD_TIMEOUT)) {
                Ok(out) if out.status == Some(0) => {}
                Ok(out) => {
                    tracing::warn!(
                        "Command cycle close '{}' returned {:?}",
                        close.cmdline,
                        out.status
                    );
                }
                Err(e) => {
                    tracing::warn!("Command cycle close '{}' failed: {e:#}", close.cmdline);
                }
            }
        }
    }

    /// Shutdown path: run everything that is still pending, due or not.
    pub fn flush_all(&self) {
        {
            let mut pending = self.pending.lock().expect("cmd cycle lock poisoned");
            for p in pending.iter_mut() {
                p.expire_at = 0;
            }
        }
        self.run_due();
    }
}
