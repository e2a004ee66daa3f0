//! Contains logic for reading the foreground window from different environments.
//! [GenericWindowProbe] is the main artifact of this module that abstracts
//! the operations.

#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "x11")]
extern crate xcb;

use std::{sync::Arc, time::Duration};

use anyhow::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSample {
    /// Full path to an executable. For example /usr/bin/nvim
    pub app_name: Arc<str>,
    /// Name of the window. For example 'bash in hello' or 'Vibing in YouTube - Chrome'
    pub window_title: Arc<str>,
    /// Working directory of the owning process when it can be read.
    pub project_path: Option<Arc<str>>,
}

/// Contract every desktop backend implements. Calls are blocking and may be slow, the sampler
/// runs them on the blocking pool with a timeout.
#[cfg_attr(test, mockall::automock)]
pub trait WindowProbe: Send {
    fn sample(&mut self) -> Result<WindowSample>;

    /// Time since the last user input.
    fn idle_time(&mut self) -> Result<Duration>;
}

/// Serves as a cross-compatible [WindowProbe] implementation.
pub struct GenericWindowProbe {
    inner: Box<dyn WindowProbe>,
}

impl GenericWindowProbe {
    pub fn new() -> Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "x11")] {
                use x11::X11WindowProbe;
                Ok(Self {
                    inner: Box::new(X11WindowProbe::new()?),
                })
            } else {
                anyhow::bail!("worktally was built without a window backend, enable the `x11` feature")
            }
        }
    }
}

impl WindowProbe for GenericWindowProbe {
    fn sample(&mut self) -> Result<WindowSample> {
        self.inner.sample()
    }

    fn idle_time(&mut self) -> Result<Duration> {
        self.inner.idle_time()
    }
}
