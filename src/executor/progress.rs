//! Progress and status events

use tokio::sync::mpsc::UnboundedSender;

/// Event emitted while a file operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Overall completion, 0..=100, non-decreasing within one operation
    Percent(u8),
    /// Human-readable status line
    Status(String),
    /// Token to present to the approving device (e.g. as a QR code)
    ApprovalToken(String),
    /// The operation was abandoned; progress is back to zero
    Reset,
}

/// Consumer of progress events
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: ProgressEvent);

    fn percent(&self, value: u8) {
        self.on_event(ProgressEvent::Percent(value.min(100)));
    }

    fn status(&self, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.on_event(ProgressEvent::Status(message.into()));
    }
}

/// Observer that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_event(&self, _event: ProgressEvent) {}
}

impl ProgressObserver for UnboundedSender<ProgressEvent> {
    fn on_event(&self, event: ProgressEvent) {
        // Receiver gone means nobody is watching
        let _ = self.send(event);
    }
}

/// Maps an inner 0..=100 range onto `offset..=offset + span`
pub struct Scaled<'a> {
    inner: &'a dyn ProgressObserver,
    offset: u8,
    span: u8,
}

impl<'a> Scaled<'a> {
    pub fn new(inner: &'a dyn ProgressObserver, offset: u8, span: u8) -> Self {
        Scaled {
            inner,
            offset,
            span: span.min(100 - offset.min(100)),
        }
    }
}

impl ProgressObserver for Scaled<'_> {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Percent(p) => {
                let scaled = self.offset as u32 + p.min(100) as u32 * self.span as u32 / 100;
                self.inner.on_event(ProgressEvent::Percent(scaled as u8));
            }
            other => self.inner.on_event(other),
        }
    }
}
