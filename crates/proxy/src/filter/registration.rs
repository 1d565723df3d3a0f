use bytes::Bytes;

use crate::error::BoxError;

/// Rewrites body blocks. The returned buffer replaces the block, its size may differ.
pub trait ByteFilter: Send {
    fn filter(&mut self, block: Bytes) -> Result<Bytes, BoxError>;

    /// Called once after the last block, for output the filter held back.
    fn finish(&mut self) -> Result<Bytes, BoxError> {
        Ok(Bytes::new())
    }
}

/// Looks at body blocks without changing them.
pub trait ByteObserver: Send {
    fn observe(&mut self, block: &[u8]) -> Result<(), BoxError>;
}

/// Rewrites text bodies one line at a time, line terminator included.
pub trait TextFilter: Send {
    fn filter(&mut self, line: String) -> Result<String, BoxError>;
}

/// Looks at text bodies one line at a time.
pub trait TextObserver: Send {
    fn observe(&mut self, line: &str) -> Result<(), BoxError>;
}

impl<F> ByteFilter for F
where
    F: FnMut(Bytes) -> Result<Bytes, BoxError> + Send,
{
    fn filter(&mut self, block: Bytes) -> Result<Bytes, BoxError> {
        (self)(block)
    }
}

impl<F> ByteObserver for F
where
    F: FnMut(&[u8]) -> Result<(), BoxError> + Send,
{
    fn observe(&mut self, block: &[u8]) -> Result<(), BoxError> {
        (self)(block)
    }
}

impl<F> TextFilter for F
where
    F: FnMut(String) -> Result<String, BoxError> + Send,
{
    fn filter(&mut self, line: String) -> Result<String, BoxError> {
        (self)(line)
    }
}

impl<F> TextObserver for F
where
    F: FnMut(&str) -> Result<(), BoxError> + Send,
{
    fn observe(&mut self, line: &str) -> Result<(), BoxError> {
        (self)(line)
    }
}

/// The stream filters attached to one message, in attachment order.
///
/// Filters can only be added while the message is offered; the pipeline then takes the
/// lists apart into the stream wrappers.
#[derive(Default)]
pub struct FilterRegistration {
    pub(crate) byte_filters: Vec<Box<dyn ByteFilter>>,
    pub(crate) byte_observers: Vec<Box<dyn ByteObserver>>,
    pub(crate) text_filters: Vec<Box<dyn TextFilter>>,
    pub(crate) text_observers: Vec<Box<dyn TextObserver>>,
}

impl std::fmt::Debug for FilterRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistration")
            .field("byte_filters", &self.byte_filters.len())
            .field("byte_observers", &self.byte_observers.len())
            .field("text_filters", &self.text_filters.len())
            .field("text_observers", &self.text_observers.len())
            .finish()
    }
}

impl FilterRegistration {
    pub fn add_byte_filter<F: ByteFilter + 'static>(&mut self, filter: F) -> &mut Self {
        self.byte_filters.push(Box::new(filter));
        self
    }

    pub fn add_byte_observer<F: ByteObserver + 'static>(&mut self, observer: F) -> &mut Self {
        self.byte_observers.push(Box::new(observer));
        self
    }

    pub fn add_text_filter<F: TextFilter + 'static>(&mut self, filter: F) -> &mut Self {
        self.text_filters.push(Box::new(filter));
        self
    }

    pub fn add_text_observer<F: TextObserver + 'static>(&mut self, observer: F) -> &mut Self {
        self.text_observers.push(Box::new(observer));
        self
    }

    /// Total number of attached filters and observers.
    pub fn len(&self) -> usize {
        self.byte_filters.len() + self.byte_observers.len() + self.text_filters.len() + self.text_observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if anything may change the body, which makes its length unknown.
    pub fn has_editing(&self) -> bool {
        !self.byte_filters.is_empty() || !self.text_filters.is_empty()
    }

    pub fn has_byte_stage(&self) -> bool {
        !self.byte_filters.is_empty() || !self.byte_observers.is_empty()
    }

    pub fn has_text_stage(&self) -> bool {
        !self.text_filters.is_empty() || !self.text_observers.is_empty()
    }

    /// Number of items attached to the byte stage and to the text stage.
    pub(crate) fn stage_sizes(&self) -> (usize, usize) {
        (self.byte_filters.len() + self.byte_observers.len(), self.text_filters.len() + self.text_observers.len())
    }

    pub(crate) fn clear(&mut self) {
        self.byte_filters.clear();
        self.byte_observers.clear();
        self.text_filters.clear();
        self.text_observers.clear();
    }
}
