//! Coroutine creation options and the `Builder` front-end.

#[derive(Debug, Clone)]
pub struct Options {
    pub stack_size: usize,
    pub name: Option<String>,
}

impl Options {
    pub fn new() -> Options {
        Options { stack_size: 0, name: None }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

/// Coroutine configuration. Provides detailed control over the properties
/// and behavior of new coroutines, the way `std::thread::Builder` does for
/// OS threads.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    opts: Options,
}

impl Builder {
    pub fn new() -> Builder {
        Builder { opts: Options::new() }
    }

    pub fn stack_size(mut self, stack_size: usize) -> Builder {
        self.opts.stack_size = stack_size;
        self
    }

    /// Names the coroutine-to-be. Currently used for identification only in
    /// panic messages and log lines.
    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.opts.name = Some(name.into());
        self
    }

    pub fn spawn<F>(self, f: F) -> crate::scheduler::JoinHandle<()>
    where
        F: FnOnce() + 'static,
    {
        crate::scheduler::spawn_opts(f, self.opts)
    }
}
