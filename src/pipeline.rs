//! Event pipeline on top of a driver.
//!
//! [`BinaryLog`] pulls events from a [`BinlogDriver`] and passes each one
//! through an ordered list of [`ContentHandler`]s. A handler may rewrite the
//! event or swallow it; swallowed events never reach the caller, who simply
//! gets the next event that made it through.

use tracing::trace;

use crate::driver::{BinlogDriver, BinlogPosition, NullDriver};
use crate::mysql::types::BinlogEvent;
use crate::{Error, Result};

/// A step in the event pipeline.
///
/// Returning `Ok(None)` drops the event; later handlers do not see it.
pub trait ContentHandler: Send {
    fn process(&mut self, event: BinlogEvent) -> Result<Option<BinlogEvent>>;
}

impl<F> ContentHandler for F
where
    F: FnMut(BinlogEvent) -> Result<Option<BinlogEvent>> + Send,
{
    fn process(&mut self, event: BinlogEvent) -> Result<Option<BinlogEvent>> {
        self(event)
    }
}

pub struct BinaryLog {
    driver: Box<dyn BinlogDriver>,
    handlers: Vec<Box<dyn ContentHandler>>,
}

impl Default for BinaryLog {
    fn default() -> Self {
        Self::new(Box::new(NullDriver::default()))
    }
}

impl BinaryLog {
    pub fn new(driver: Box<dyn BinlogDriver>) -> Self {
        Self {
            driver,
            handlers: Vec::new(),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.driver.connect()
    }

    /// Appends a handler to the end of the pipeline.
    pub fn add_handler(&mut self, handler: impl ContentHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// The handlers in the order they run, for inspection or reordering.
    pub fn content_handler_pipeline(&mut self) -> &mut Vec<Box<dyn ContentHandler>> {
        &mut self.handlers
    }

    /// Next event that made it through every handler.
    pub fn wait_for_next_event(&mut self) -> Result<BinlogEvent> {
        loop {
            let event = self.driver.wait_for_next_event()?;
            let event_type = event.event_type();

            let mut current = Some(event);
            for handler in self.handlers.iter_mut() {
                current = match current {
                    Some(event) => handler.process(event)?,
                    None => break,
                };
            }

            match current {
                Some(event) => return Ok(event),
                None => trace!("{} event dropped by content handler", event_type),
            }
        }
    }

    /// Restarts reading at `position` in `file`.
    pub fn set_position(&mut self, file: &str, position: u64) -> Result<()> {
        self.driver.set_position(file, position)
    }

    /// Restarts reading at `position` in the current file.
    pub fn set_position_in_current_file(&mut self, position: u64) -> Result<()> {
        let current = self.driver.get_position()?;
        if current.file.is_empty() {
            return Err(Error::InvalidParams(
                "no current binlog file to reposition in".to_string(),
            ));
        }
        self.driver.set_position(&current.file, position)
    }

    pub fn get_position(&self) -> Result<BinlogPosition> {
        self.driver.get_position()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.driver.shutdown()
    }
}
