//! Command context: the reply channel and locale of one control connection

use anyhow::Result;

use super::framing;
use super::locale::{LocalizationKey, Localizer};
use super::proto::{PbErrorCode, PbResult};
use crate::daemon::SharedLocalizer;

/// Where replies of a command go: the client socket, or an in-process
/// buffer for startup and tests
pub trait CommandSink {
    fn send(&mut self, result: &PbResult) -> Result<()>;
}

/// Sink writing framed messages to a stream
pub struct StreamSink<W: std::io::Write> {
    writer: W,
}

impl<W: std::io::Write> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: std::io::Write> CommandSink for StreamSink<W> {
    fn send(&mut self, result: &PbResult) -> Result<()> {
        framing::write_message(&mut self.writer, result)?;
        Ok(())
    }
}

/// Sink collecting replies in memory
#[derive(Default)]
pub struct CaptureSink {
    pub results: Vec<PbResult>,
}

impl CommandSink for CaptureSink {
    fn send(&mut self, result: &PbResult) -> Result<()> {
        self.results.push(result.clone());
        Ok(())
    }
}

pub struct CommandContext<'a> {
    sink: &'a mut dyn CommandSink,
    localizer: SharedLocalizer,
    locale: String,
}

impl<'a> CommandContext<'a> {
    pub fn new(sink: &'a mut dyn CommandSink, localizer: SharedLocalizer, locale: &str) -> Self {
        Self {
            sink,
            localizer,
            locale: locale.to_string(),
        }
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn send_result(&mut self, result: &PbResult) -> bool {
        if let Err(e) = self.sink.send(result) {
            log::warn!("Sending result failed: {:#}", e);
            return false;
        }
        result.status
    }

    /// Replies with a plain status and optional message. Returns the status
    /// so handlers can `return context.return_status(...)`.
    pub fn return_status(&mut self, status: bool, msg: &str) -> bool {
        if !status && !msg.is_empty() {
            log::error!("{}", msg);
        }

        let result = PbResult {
            status,
            msg: msg.to_string(),
            ..Default::default()
        };
        self.send_result(&result);
        status
    }

    pub fn return_ok(&mut self) -> bool {
        self.return_status(true, "")
    }

    /// Replies with a localized error. The log line always uses English,
    /// the reply uses the request locale.
    pub fn return_localized_error(&mut self, key: LocalizationKey, args: &[&str]) -> bool {
        self.return_localized_error_with_code(key, PbErrorCode::NoErrorCode, args)
    }

    pub fn return_localized_error_with_code(
        &mut self,
        key: LocalizationKey,
        error_code: PbErrorCode,
        args: &[&str],
    ) -> bool {
        log::error!("{}", self.localizer.localize(key, "en", args));

        let result = PbResult {
            status: false,
            msg: self.localizer.localize(key, &self.locale, args),
            error_code: error_code as i32,
            ..Default::default()
        };
        self.send_result(&result);
        false
    }

    pub fn localizer(&self) -> &Localizer {
        &self.localizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn localized_error_uses_request_locale() {
        let mut sink = CaptureSink::default();
        let mut context =
            CommandContext::new(&mut sink, Arc::new(Localizer::new()), "de");

        assert!(!context.return_localized_error(LocalizationKey::ErrorOperation, &[]));
        assert_eq!(sink.results.len(), 1);
        assert!(!sink.results[0].status);
        assert_eq!(sink.results[0].msg, "Unbekannte Operation");
    }

    #[test]
    fn return_status_reports_the_status() {
        let mut sink = CaptureSink::default();
        let mut context = CommandContext::new(&mut sink, Arc::new(Localizer::new()), "en");

        assert!(context.return_ok());
        assert!(!context.return_status(false, "this went wrong"));
        assert_eq!(sink.results[1].msg, "this went wrong");
    }
}
