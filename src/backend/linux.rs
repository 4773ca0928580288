//! inotify-backed watch context.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use inotify::{Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::Mutex;
use super::{EventSource, OpenedBackend, RawEvent, WatchBackend, WatchId};
use crate::{BackendError, EventMask};

const MIN_READ_BUFFER: usize = 4096;

/// Kernel descriptors and the stable ids handed out for them.
///
/// inotify returns the same descriptor when a path is added twice, so the
/// same id is returned as well.
#[derive(Default)]
struct Descriptors {
    by_wd: HashMap<WatchDescriptor, WatchId>,
    by_id: HashMap<WatchId, WatchDescriptor>,
    next_id: u64,
}

struct Shared {
    descriptors: Mutex<Descriptors>,
    closed: AtomicBool,
    /// eventfd polled next to the inotify fd; written once on close.
    wake: OwnedFd,
}

pub struct InotifyControl {
    watches: Mutex<Watches>,
    shared: Arc<Shared>,
}

pub struct InotifyEvents {
    inotify: Inotify,
    buffer: Vec<u8>,
    shared: Arc<Shared>,
}

pub fn open(read_buffer_bytes: usize) -> io::Result<OpenedBackend> {
    let inotify = Inotify::init()?;
    let shared = Arc::new(Shared {
        descriptors: Mutex::new(Descriptors::default()),
        closed: AtomicBool::new(false),
        wake: wake_fd()?,
    });

    let control = InotifyControl {
        watches: Mutex::new(inotify.watches()),
        shared: shared.clone(),
    };
    let events = InotifyEvents {
        inotify,
        buffer: vec![0u8; read_buffer_bytes.max(MIN_READ_BUFFER)],
        shared,
    };

    Ok(OpenedBackend {
        control: Arc::new(control),
        events: Box::new(events),
    })
}

fn wake_fd() -> io::Result<OwnedFd> {
    // SAFETY: eventfd has no pointer arguments; a non-negative return is a
    // fresh descriptor owned by nobody else.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn signal(fd: &OwnedFd) -> io::Result<()> {
    let one: u64 = 1;
    // SAFETY: writes exactly the 8 bytes of `one`, as eventfd requires.
    let written = unsafe {
        libc::write(
            fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_backend_error(err: io::Error) -> BackendError {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        BackendError::LimitReached
    } else {
        BackendError::Rejected(err)
    }
}

impl WatchBackend for InotifyControl {
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchId, BackendError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }

        // MASK_ADD lets two roots that cover the same directory union their masks.
        let bits = (mask | EventMask::MASK_ADD | EventMask::ONLYDIR).bits();

        // The id mapping is published before the reader can map an event of
        // the new descriptor. Lock order: watches, then descriptors.
        let mut watches = self.watches.lock();
        let mut descriptors = self.shared.descriptors.lock();
        let wd = watches
            .add(path, WatchMask::from_bits_truncate(bits))
            .map_err(to_backend_error)?;

        if let Some(id) = descriptors.by_wd.get(&wd) {
            return Ok(*id);
        }
        descriptors.next_id += 1;
        let id = WatchId::new(descriptors.next_id);
        descriptors.by_wd.insert(wd.clone(), id);
        descriptors.by_id.insert(id, wd);
        Ok(id)
    }

    fn remove_watch(&self, handle: WatchId) -> Result<(), BackendError> {
        let wd = {
            let mut descriptors = self.shared.descriptors.lock();
            let Some(wd) = descriptors.by_id.remove(&handle) else {
                return Ok(());
            };
            descriptors.by_wd.remove(&wd);
            wd
        };

        // The kernel drops watches on deleted directories by itself; removing
        // one of those afterwards fails with EINVAL and is harmless.
        self.watches.lock().remove(wd).map_err(BackendError::Rejected)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = signal(&self.shared.wake) {
            tracing::warn!("Failed to wake inotify reader: {}", err);
        }

        let live: Vec<WatchDescriptor> = {
            let mut descriptors = self.shared.descriptors.lock();
            descriptors.by_id.clear();
            descriptors.by_wd.drain().map(|(wd, _)| wd).collect()
        };

        let mut watches = self.watches.lock();
        for wd in live {
            if let Err(err) = watches.remove(wd) {
                tracing::debug!("Removing watch during close failed: {}", err);
            }
        }
    }
}

impl InotifyEvents {
    /// Block until the inotify fd has data or the context is closed. Returns
    /// whether the inotify fd is readable.
    fn wait_readable(&self) -> io::Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd: self.inotify.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.shared.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: `fds` is a valid array of `fds.len()` pollfd entries.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fds[0].revents & libc::POLLIN != 0)
    }
}

impl EventSource for InotifyEvents {
    fn read_events(&mut self) -> io::Result<Vec<RawEvent>> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "inotify context closed"));
            }

            if !self.wait_readable()? {
                continue;
            }
            let events = match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            };

            let descriptors = self.shared.descriptors.lock();
            let batch: Vec<RawEvent> = events
                .map(|event| RawEvent {
                    handle: descriptors.by_wd.get(&event.wd).copied(),
                    mask: EventMask::from_bits_retain(event.mask.bits()),
                    cookie: event.cookie,
                    name: event.name.map(|name| name.to_os_string()),
                })
                .collect();
            drop(descriptors);

            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_directory_yields_same_id() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let opened = open(4096).expect("Failed to open inotify");

        let first = opened.control.add_watch(temp_dir.path(), EventMask::CREATE).unwrap();
        let second = opened.control.add_watch(temp_dir.path(), EventMask::DELETE).unwrap();

        assert_eq!(first, second);
        opened.control.remove_watch(first).unwrap();
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let opened = open(4096).expect("Failed to open inotify");

        let err = opened
            .control
            .add_watch(&temp_dir.path().join("missing"), EventMask::CREATE)
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[test]
    fn test_reads_create_event() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let OpenedBackend { control, mut events } = open(4096).expect("Failed to open inotify");

        let id = control.add_watch(temp_dir.path(), EventMask::CREATE).unwrap();
        std::fs::write(temp_dir.path().join("new.txt"), "x").unwrap();

        let batch = events.read_events().unwrap();
        let event = batch
            .iter()
            .find(|e| e.mask.contains(EventMask::CREATE))
            .expect("create event");
        assert_eq!(event.handle, Some(id));
        assert_eq!(event.name.as_deref(), Some(std::ffi::OsStr::new("new.txt")));
    }

    #[test]
    fn test_close_wakes_idle_reader() {
        let OpenedBackend { control, mut events } = open(4096).expect("Failed to open inotify");
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = std::thread::spawn(move || {
            let _ = tx.send(events.read_events());
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        control.close();

        let result = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("reader still blocked after close");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        reader.join().unwrap();
        assert!(matches!(
            control.add_watch(Path::new("/"), EventMask::CREATE),
            Err(BackendError::Closed)
        ));
    }

    #[test]
    fn test_events_on_fresh_watches_are_mapped() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let OpenedBackend { control, mut events } = open(4096).expect("Failed to open inotify");
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            while let Ok(batch) = events.read_events() {
                if tx.send(batch).is_err() {
                    break;
                }
            }
        });

        let mut expected = Vec::new();
        for i in 0..20 {
            let dir = temp_dir.path().join(format!("d{}", i));
            std::fs::create_dir(&dir).unwrap();
            let id = control.add_watch(&dir, EventMask::CREATE).unwrap();
            std::fs::write(dir.join("f"), "x").unwrap();
            expected.push(id);
        }

        let mut seen = Vec::new();
        while seen.len() < expected.len() {
            let batch = rx
                .recv_timeout(std::time::Duration::from_secs(2))
                .expect("missing create events");
            for event in batch {
                if event.mask.contains(EventMask::CREATE) {
                    seen.push(event.handle.expect("event on unmapped descriptor"));
                }
            }
        }
        assert_eq!(seen, expected);
        control.close();
    }
}
