/// A self-clearing latch for events etc.
#[derive(Debug, Default, Clone)]
pub struct LatchingEvent {
    val: bool,
}

impl LatchingEvent {
    /// Returns the current value and clears the event.
    pub fn get_clear(&mut self) -> bool {
        let v = self.val;
        self.val = false;
        v
    }

    /// Sets the event.
    pub fn set(&mut self) {
        self.val = true;
    }

    /// Returns the current value without clearing it.
    pub fn peek(&self) -> bool {
        self.val
    }
}
