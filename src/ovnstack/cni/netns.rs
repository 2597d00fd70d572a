/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! Pinned execution inside a network namespace.
//!
//! The kernel tracks the network namespace per thread, so a block that
//! enters a namespace must start and finish on the same OS thread and that
//! thread must never run unrelated work while switched. [`run_pinned`] hands
//! the block to a dedicated scoped thread, switches it into the target
//! namespace, and switches back on every exit path.

use crate::ovnstack::error::{detail, OverlayError};
use crate::ovnstack::logger::log_error;
use crate::ovnstack::observability::tracing::{current_context, with_context};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::path::Path;
use std::thread;

/// Switches the calling thread between network namespaces.
pub trait NamespaceSwitch: Send + Sync {
    /// Moves the calling thread into the namespace at `path`. An error of
    /// kind `NotFound` means the namespace no longer exists.
    fn enter(&self, path: &Path) -> io::Result<Box<dyn EnteredNamespace>>;
}

/// Handle returned by [`NamespaceSwitch::enter`]; leaving restores the
/// namespace the thread was in before.
pub trait EnteredNamespace {
    fn leave(self: Box<Self>) -> io::Result<()>;
}

/// The real switch, backed by `setns(2)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostNamespaces;

impl NamespaceSwitch for HostNamespaces {
    fn enter(&self, path: &Path) -> io::Result<Box<dyn EnteredNamespace>> {
        let original = File::open("/proc/thread-self/ns/net")?;
        let target = File::open(path)?;
        setns(&target, CloneFlags::CLONE_NEWNET).map_err(io::Error::from)?;
        Ok(Box::new(HostEntered { original }))
    }
}

struct HostEntered {
    original: File,
}

impl EnteredNamespace for HostEntered {
    fn leave(self: Box<Self>) -> io::Result<()> {
        setns(&self.original, CloneFlags::CLONE_NEWNET).map_err(io::Error::from)
    }
}

/// Restores the original namespace when dropped, including on panic.
struct Pinned<'a> {
    entered: Option<Box<dyn EnteredNamespace>>,
    path: &'a Path,
}

impl Pinned<'_> {
    fn release(mut self) -> io::Result<()> {
        match self.entered.take() {
            Some(entered) => entered.leave(),
            None => Ok(()),
        }
    }
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        if let Some(entered) = self.entered.take() {
            if let Err(err) = entered.leave() {
                log_error(
                    "netns",
                    "Failed to restore network namespace",
                    &[
                        ("path", &self.path.display().to_string()),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }
    }
}

/// Runs `f` on a dedicated thread switched into the namespace at `path`.
///
/// A namespace that cannot be opened because it is gone yields
/// [`OverlayError::NamespaceGone`]. When `f` fails its error wins over a
/// failure to switch back.
pub fn run_pinned<T, F>(switch: &dyn NamespaceSwitch, path: &Path, f: F) -> Result<T, OverlayError>
where
    F: FnOnce() -> Result<T, OverlayError> + Send,
    T: Send,
{
    let trace = current_context();
    thread::scope(|scope| {
        let handle = thread::Builder::new()
            .name("netns".to_string())
            .spawn_scoped(scope, move || {
                with_context(trace, || {
                    let entered = switch.enter(path).map_err(|err| {
                        if err.kind() == io::ErrorKind::NotFound {
                            OverlayError::NamespaceGone {
                                path: path.to_path_buf(),
                            }
                        } else {
                            OverlayError::namespace(
                                format!("enter network namespace {}", path.display()),
                                err,
                            )
                        }
                    })?;
                    let pinned = Pinned {
                        entered: Some(entered),
                        path,
                    };
                    let result = f();
                    match (result, pinned.release()) {
                        (Ok(value), Ok(())) => Ok(value),
                        (Ok(_), Err(err)) => Err(OverlayError::namespace(
                            format!("leave network namespace {}", path.display()),
                            err,
                        )),
                        (Err(err), Ok(())) => Err(err),
                        (Err(err), Err(restore)) => {
                            log_error(
                                "netns",
                                "Failed to restore network namespace",
                                &[
                                    ("path", &path.display().to_string()),
                                    ("error", &restore.to_string()),
                                ],
                            );
                            Err(err)
                        }
                    }
                })
            })
            .map_err(|err| OverlayError::namespace("spawn namespace thread", err))?;
        handle.join().map_err(|_| {
            OverlayError::namespace(
                format!("run in network namespace {}", path.display()),
                detail("namespace thread panicked"),
            )
        })?
    })
}
