//! Host process helpers: CPU detection, daemonizing, process titles and
//! privilege dropping.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, Gid, Group, Uid, User, fork, getegid, geteuid, setgid, setsid, setuid};
use tracing::warn;

use crate::error::{SupervisorError, SupervisorResult};

/// Workers started when nothing is configured and the CPU count is unknown.
pub const FALLBACK_WORKER_NUM: usize = 4;

/// Longest process name the kernel keeps, excluding the trailing NUL.
const TITLE_MAX: usize = 15;

pub fn cpu_count() -> Option<usize> {
    std::thread::available_parallelism().ok().map(|n| n.get())
}

/// Two workers per CPU.
pub fn default_worker_num() -> usize {
    cpu_count().map_or(FALLBACK_WORKER_NUM, |n| n.saturating_mul(2))
}

/// Detach from the controlling terminal.
///
/// Forks twice with a `setsid` in between so the surviving grandchild can
/// never reacquire a terminal. stdin is read from `/dev/null`; stdout and
/// stderr append to `log`. The working directory becomes `/` and the umask
/// is cleared. Intermediate processes exit with status 0.
///
/// Must be called while the process is single-threaded.
pub fn daemonize(log: &Path) -> SupervisorResult<()> {
    let null = File::open("/dev/null")
        .map_err(|e| SupervisorError::Config(format!("open /dev/null: {e}")))?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|e| SupervisorError::Config(format!("open log {}: {e}", log.display())))?;

    fork_and_exit_parent()?;
    setsid().map_err(|e| SupervisorError::Spawn(format!("setsid: {e}")))?;
    fork_and_exit_parent()?;

    std::env::set_current_dir("/")?;
    umask(Mode::empty());

    redirect(&null, libc::STDIN_FILENO)?;
    redirect(&out, libc::STDOUT_FILENO)?;
    redirect(&out, libc::STDERR_FILENO)?;
    Ok(())
}

fn fork_and_exit_parent() -> SupervisorResult<()> {
    // SAFETY: called before any thread is spawned; the child continues with a
    // consistent copy of the single-threaded parent.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => Ok(()),
        Err(e) => Err(SupervisorError::Spawn(format!("daemonize fork: {e}"))),
    }
}

fn redirect(file: &File, target: libc::c_int) -> SupervisorResult<()> {
    // SAFETY: both descriptors are open for the duration of the call; dup2
    // atomically replaces `target`.
    let ret = unsafe { libc::dup2(file.as_raw_fd(), target) };
    if ret < 0 {
        return Err(SupervisorError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Set the name shown by `ps -o comm` and `top`. Longer titles are cut to
/// what the kernel keeps. Failure is only logged.
pub fn set_process_title(title: &str) {
    let truncated = truncate_title(title);
    let name = match std::ffi::CString::new(truncated) {
        Ok(name) => name,
        Err(e) => {
            warn!(title, error = %e, "invalid process title");
            return;
        }
    };
    if let Err(e) = apply_title(&name) {
        warn!(title, error = %e, "failed to set process title");
    }
}

#[cfg(target_os = "linux")]
fn apply_title(name: &std::ffi::CStr) -> std::io::Result<()> {
    // SAFETY: PR_SET_NAME reads a NUL-terminated string of at most 16 bytes;
    // `name` outlives the call.
    let ret = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_title(_name: &std::ffi::CStr) -> std::io::Result<()> {
    Ok(())
}

fn truncate_title(title: &str) -> &str {
    if title.len() <= TITLE_MAX {
        return title;
    }
    let mut end = TITLE_MAX;
    while !title.is_char_boundary(end) {
        end -= 1;
    }
    title.get(..end).unwrap_or(title)
}

/// Numeric identity workers switch to after fork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Privileges {
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
}

impl Privileges {
    /// Resolve user and group names once, in the listener, so a typo fails
    /// before any worker is forked.
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> SupervisorResult<Self> {
        let uid = match user {
            Some(name) => Some(resolve_user(name)?),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(resolve_group(name)?),
            None => None,
        };
        Ok(Self { uid, gid })
    }

    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }

    /// Switch the calling process to the resolved identity. The group goes
    /// first: once the uid is dropped, `setgid` is no longer permitted.
    pub fn drop_privileges(&self) -> SupervisorResult<()> {
        if let Some(gid) = self.gid
            && gid != getegid()
        {
            setgid(gid).map_err(|e| SupervisorError::Privilege(format!("setgid {gid}: {e}")))?;
        }
        if let Some(uid) = self.uid
            && uid != geteuid()
        {
            setuid(uid).map_err(|e| SupervisorError::Privilege(format!("setuid {uid}: {e}")))?;
        }
        Ok(())
    }
}

fn resolve_user(name: &str) -> SupervisorResult<Uid> {
    let user = User::from_name(name)
        .map_err(|e| SupervisorError::Privilege(format!("lookup user {name}: {e}")))?
        .ok_or_else(|| SupervisorError::Privilege(format!("no such user: {name}")))?;
    let euid = geteuid();
    if !euid.is_root() && euid != user.uid {
        return Err(SupervisorError::Privilege(format!(
            "cannot switch to user {name} (uid {}) without root; running as uid {euid}",
            user.uid
        )));
    }
    Ok(user.uid)
}

fn resolve_group(name: &str) -> SupervisorResult<Gid> {
    let group = Group::from_name(name)
        .map_err(|e| SupervisorError::Privilege(format!("lookup group {name}: {e}")))?
        .ok_or_else(|| SupervisorError::Privilege(format!("no such group: {name}")))?;
    let euid = geteuid();
    let egid = getegid();
    if !euid.is_root() && egid != group.gid {
        return Err(SupervisorError::Privilege(format!(
            "cannot switch to group {name} (gid {}) without root; running as gid {egid}",
            group.gid
        )));
    }
    Ok(group.gid)
}
