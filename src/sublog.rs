/// A logger bound to a context tag (component name, listen address, peer).
///
/// Records are forwarded to the process-wide `tracing` dispatcher with the
/// tag attached; the subscriber serializes output, so clones may emit
/// concurrently.
#[derive(Debug, Clone)]
pub struct SubLogger {
    tag: String,
}

impl SubLogger {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        tracing::debug!(tag = %self.tag, "{}", msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        tracing::info!(tag = %self.tag, "{}", msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        tracing::warn!(tag = %self.tag, "{}", msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        tracing::error!(tag = %self.tag, "{}", msg.as_ref());
    }

    /// Logs the message and terminates the process with the fatal-I/O exit
    /// code. The global subscriber's non-blocking writer is flushed by the
    /// guard installed in `logging::init` before the process image goes away.
    pub fn fatal(&self, msg: impl AsRef<str>) -> ! {
        tracing::error!(tag = %self.tag, "fatal: {}", msg.as_ref());
        crate::logging::flush();
        std::process::exit(2);
    }
}
