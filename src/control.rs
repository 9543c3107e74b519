//! External control channel
//!
//! One background thread listens on a process-scoped FIFO for plain-text
//! commands from cooperating tools. The endpoint lives at
//! `<tmpdir>/vkpace/<exe-name>-<pid>`, so exactly one controller per process
//! instance can attach. Commands are space/newline-delimited tokens,
//! upper-cased before dispatch; see [`LayerState::apply_command`].
//!
//! The listener blocks in a single two-source `poll(2)`: the FIFO fd and the
//! read end of a private self-pipe that serves as the shutdown signal. A
//! writer closing its end of the FIFO is not an error; the fd is reopened
//! and polling continues. Dropping [`ExternalControl`] writes the self-pipe,
//! joins the thread, and removes the endpoint (and its directory if empty).

use log::{debug, error, warn};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fs, io};

use crate::state::LayerState;

pub struct ExternalControl {
    fifo_path: PathBuf,
    dir_path: PathBuf,
    shutdown_write_fd: libc::c_int,
    shutdown_read_fd: libc::c_int,
    thread: Option<JoinHandle<()>>,
}

impl ExternalControl {
    /// Create the endpoint under the default directory and start listening.
    pub fn spawn(state: Arc<LayerState>) -> io::Result<Self> {
        Self::spawn_at(std::env::temp_dir().join("vkpace"), state)
    }

    /// Create the endpoint under `dir` and start the listener thread.
    pub fn spawn_at(dir: PathBuf, state: Arc<LayerState>) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;

        let exe_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|name| name.to_os_string()))
            .unwrap_or_else(|| "unknown".into());
        let mut endpoint_name = exe_name;
        endpoint_name.push(format!("-{}", std::process::id()));
        let fifo_path = dir.join(endpoint_name);

        let c_path = CString::new(fifo_path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "endpoint path contains NUL"))?;

        // A stale FIFO from a recycled pid is fine to reuse; anything else in
        // the way is not.
        unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        let is_fifo = fs::metadata(&fifo_path)
            .map(|meta| {
                use std::os::unix::fs::FileTypeExt;
                meta.file_type().is_fifo()
            })
            .unwrap_or(false);
        if !is_fifo {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a fifo", fifo_path.display()),
            ));
        }

        let mut pipe_fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let [shutdown_read_fd, shutdown_write_fd] = pipe_fds;

        let thread = std::thread::Builder::new()
            .name("vkpace-control".into())
            .spawn(move || listen(state, c_path, shutdown_read_fd));
        let thread = match thread {
            Ok(handle) => handle,
            Err(err) => {
                unsafe {
                    libc::close(shutdown_read_fd);
                    libc::close(shutdown_write_fd);
                }
                return Err(err);
            }
        };

        Ok(Self {
            fifo_path,
            dir_path: dir,
            shutdown_write_fd,
            shutdown_read_fd,
            thread: Some(thread),
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.fifo_path
    }
}

impl Drop for ExternalControl {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let byte = 1u8;
            unsafe {
                libc::write(
                    self.shutdown_write_fd,
                    &byte as *const u8 as *const libc::c_void,
                    1,
                );
            }
            let _ = thread.join();
        }
        unsafe {
            libc::close(self.shutdown_write_fd);
            libc::close(self.shutdown_read_fd);
        }
        let _ = fs::remove_file(&self.fifo_path);
        // Only goes away if no other process instance still has an endpoint.
        let _ = fs::remove_dir(&self.dir_path);
    }
}

fn listen(state: Arc<LayerState>, fifo_path: CString, shutdown_fd: libc::c_int) {
    let mut fifo_fd: libc::c_int = -1;
    let mut token = Vec::<u8>::new();

    loop {
        if fifo_fd < 0 {
            // Non-blocking: a read-only open would otherwise hang until the
            // first writer attaches.
            fifo_fd = unsafe { libc::open(fifo_path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
            if fifo_fd < 0 {
                error!(
                    "External control endpoint lost: {}",
                    io::Error::last_os_error()
                );
                break;
            }
        }

        let mut fds = [
            libc::pollfd {
                fd: shutdown_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: fifo_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        if unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("External control poll failed: {err}");
            break;
        }

        // Shutdown requested.
        if fds[0].revents & libc::POLLIN != 0 {
            break;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            let mut byte = 0u8;
            while unsafe { libc::read(fifo_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) } == 1
            {
                if byte != b'\n' && byte != b' ' {
                    token.push(byte.to_ascii_uppercase());
                    continue;
                }
                dispatch_token(&state, &mut token);
            }
        }

        // End of input only means no writer is currently attached; reopen
        // and keep polling.
        if fds[1].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            dispatch_token(&state, &mut token);
            unsafe { libc::close(fifo_fd) };
            fifo_fd = -1;
        }
    }

    if fifo_fd >= 0 {
        unsafe { libc::close(fifo_fd) };
    }
}

fn dispatch_token(state: &LayerState, token: &mut Vec<u8>) {
    if token.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(token).into_owned();
    if state.config.read().control_verbose {
        debug!("Control command: {text:?}");
    }
    state.apply_command(&text);
    token.clear();
}
