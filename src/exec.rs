//! Preparing and performing the exec of a managed process.
//!
//! In order to call the exec family of syscalls one needs to provide values
//! with the type `*const *const c_char`, structured as a list of
//! null-terminated strings which is, itself, null-terminated. Everything that
//! allocates happens in the parent, before fork; the child only walks
//! pre-built pointer arrays and makes raw syscalls.
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{self, Gid, Pid, Uid, User};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use which::which;

use crate::conf::ProcessConf;
use crate::error::SpawnError;

/// Identity a child switches to before exec.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub name: CString,
    pub uid: Uid,
    pub gid: Gid,
}

#[derive(Clone, Debug)]
pub struct ExecArgs {
    pub program: CString,
    pub args: Vec<CString>,
    pub env: Vec<CString>,
    pub directory: Option<CString>,
    pub credentials: Option<Credentials>,
}

/// Find the executable for `command`, checking the categories of failure
/// an operator needs to tell apart.
pub fn resolve_program(command: &str) -> Result<PathBuf, SpawnError> {
    let path = if command.contains('/') {
        PathBuf::from(command)
    } else {
        which(command).map_err(|_| SpawnError::NotFound(command.to_string()))?
    };

    let meta = std::fs::metadata(&path).map_err(|_| SpawnError::NotFound(command.to_string()))?;
    if meta.is_dir() {
        return Err(SpawnError::IsDirectory(path));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(SpawnError::NotExecutable(path));
    }
    if unistd::access(&path, unistd::AccessFlags::X_OK).is_err() {
        return Err(SpawnError::NoPermission(path));
    }
    Ok(path)
}

/// Look up the configured user. Switching identity needs root unless the
/// target is who we already are.
pub fn resolve_user(name: &str) -> Result<Option<Credentials>, SpawnError> {
    let user = match User::from_name(name) {
        Ok(Some(user)) => user,
        Ok(None) => match name.parse::<u32>().ok().map(Uid::from_raw) {
            Some(uid) => User::from_uid(uid)
                .ok()
                .flatten()
                .ok_or_else(|| SpawnError::UnknownUser(name.to_string()))?,
            None => return Err(SpawnError::UnknownUser(name.to_string())),
        },
        Err(_) => return Err(SpawnError::UnknownUser(name.to_string())),
    };

    let euid = unistd::geteuid();
    if user.uid == euid {
        return Ok(None);
    }
    if !euid.is_root() {
        return Err(SpawnError::NotRoot(name.to_string()));
    }
    Ok(Some(Credentials {
        name: cstring(&user.name, name)?,
        uid: user.uid,
        gid: user.gid,
    }))
}

fn cstring(s: &str, owner: &str) -> Result<CString, SpawnError> {
    CString::new(s).map_err(|_| SpawnError::BadArgument(owner.to_string()))
}

impl ExecArgs {
    /// `command` may carry leading arguments separated by whitespace; they
    /// are placed before the configured `args`.
    pub fn new(conf: &ProcessConf, group: &str) -> Result<Self, SpawnError> {
        let mut words = conf.command.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| SpawnError::NotFound(conf.command.clone()))?;
        let path = resolve_program(command)?;

        let program = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| SpawnError::BadArgument(conf.name.clone()))?;

        let argv0 = path
            .file_name()
            .map(|name| name.as_bytes().to_vec())
            .unwrap_or_else(|| command.as_bytes().to_vec());
        let mut args = vec![CString::new(argv0).map_err(|_| SpawnError::BadArgument(conf.name.clone()))?];
        for arg in words.chain(conf.args.iter().map(String::as_str)) {
            args.push(cstring(arg, &conf.name)?);
        }

        let mut vars: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| !conf.environment.contains_key(k))
            .collect();
        vars.extend(conf.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.push(("SUPERVISOR_ENABLED".into(), "1".into()));
        vars.push(("SUPERVISOR_PROCESS_NAME".into(), conf.name.clone()));
        vars.push(("SUPERVISOR_GROUP_NAME".into(), group.to_string()));
        let env = vars
            .iter()
            .map(|(k, v)| cstring(&format!("{k}={v}"), &conf.name))
            .collect::<Result<Vec<_>, _>>()?;

        let directory = conf
            .directory
            .as_deref()
            .map(|dir| {
                CString::new(dir.as_os_str().as_bytes())
                    .map_err(|_| SpawnError::BadArgument(conf.name.clone()))
            })
            .transpose()?;

        let credentials = match &conf.user {
            Some(user) => resolve_user(user)?,
            None => None,
        };

        Ok(Self {
            program,
            args,
            env,
            directory,
            credentials,
        })
    }

    pub fn to_argv(&self) -> Vec<*const libc::c_char> {
        null_terminated(&self.args)
    }

    pub fn to_envp(&self) -> Vec<*const libc::c_char> {
        null_terminated(&self.env)
    }

}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Child-side descriptors, already opened by the parent.
pub struct ChildStdio {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// Runs in the forked child. Never returns.
///
/// # Safety
/// Must only be called in a freshly forked child of a single-threaded parent;
/// `argv` and `envp` must come from `exec.to_argv()` / `exec.to_envp()`.
pub unsafe fn exec_child(
    exec: &ExecArgs,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    stdio: ChildStdio,
) -> ! {
    let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

    for (fd, target) in [(stdio.stdin, 0), (stdio.stdout, 1), (stdio.stderr, 2)] {
        if let Err(errno) = install_fd(fd, target) {
            child_fail(b"couldn't set up stdio: ", errno);
        }
    }

    if let Some(dir) = &exec.directory {
        if let Err(errno) = unistd::chdir(dir.as_c_str()) {
            child_fail(b"couldn't chdir: ", errno);
        }
    }

    if let Some(creds) = &exec.credentials {
        if let Err(errno) = drop_privileges(creds) {
            child_fail(b"couldn't drop privileges: ", errno);
        }
    }

    libc::execve(exec.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    child_fail(b"couldn't exec: ", Errno::last())
}

/// Make `fd` available as `target` across exec. A pipe that already landed
/// on its target (the daemon ran with stdio closed) keeps O_CLOEXEC through
/// `dup2`, so the flag is cleared instead.
pub(crate) fn install_fd(fd: RawFd, target: RawFd) -> nix::Result<()> {
    if fd == target {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        unistd::dup2(fd, target)?;
    }
    Ok(())
}

fn drop_privileges(creds: &Credentials) -> nix::Result<()> {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    unistd::initgroups(creds.name.as_c_str(), creds.gid)?;
    unistd::setgid(creds.gid)?;
    unistd::setuid(creds.uid)?;
    Ok(())
}

fn child_fail(what: &[u8], errno: Errno) -> ! {
    let text = errno.desc().as_bytes();
    unsafe {
        libc::write(2, what.as_ptr().cast(), what.len());
        libc::write(2, text.as_ptr().cast(), text.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::_exit(127)
    }
}
