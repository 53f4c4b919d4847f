//! A fixed-capacity ring of packets indexed by 32-bit sequence numbers.
//!
//! The array tracks a window `[start, end)` of sequence numbers (wrapping). The window never
//! grows past the capacity and every slot holds at most one entry, so nothing is ever
//! overwritten: inserts that would do so are rejected.

use crate::Error;

/// Largest capacity an array can have, so any window fits in `u32` sequence numbers.
pub const MAX_CAPACITY: usize = 1 << 31;

/// A sliding window of packets.
pub struct PacketArray<T> {
    slots: Vec<Option<T>>,
    start: u32,
    end: u32,
}

impl<T> PacketArray<T> {
    /// Create an empty array.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two that fits in a `u32`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        assert!(capacity <= MAX_CAPACITY, "capacity too large");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            start: 0,
            end: 0,
        }
    }

    /// Maximum number of sequence numbers the window can span.
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// First sequence number in the window.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the last sequence number in the window.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of sequence numbers spanned by the window (occupied or not).
    pub fn len(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// How many more entries [PacketArray::push] would accept.
    pub fn free(&self) -> u32 {
        self.capacity() - self.len()
    }

    fn index(&self, number: u32) -> usize {
        number as usize & (self.slots.len() - 1)
    }

    fn in_window(&self, number: u32) -> bool {
        number.wrapping_sub(self.start) < self.len()
    }

    /// Whether `number` lies at most one capacity before `start`, as an entry that already left
    /// the window would.
    pub fn is_behind(&self, number: u32) -> bool {
        let behind = self.start.wrapping_sub(number);
        behind != 0 && behind <= self.capacity()
    }

    /// Append an entry at `end`, returning its sequence number.
    pub fn push(&mut self, item: T) -> Result<u32, Error> {
        if self.len() >= self.capacity() {
            return Err(Error::SendQueueFull);
        }
        let number = self.end;
        let index = self.index(number);
        self.slots[index] = Some(item);
        self.end = self.end.wrapping_add(1);
        Ok(number)
    }

    /// Store an entry at `number`, extending the window if needed.
    pub fn insert(&mut self, number: u32, item: T) -> Result<(), Error> {
        let offset = number.wrapping_sub(self.start);
        if offset >= self.capacity() {
            return Err(Error::OutOfWindow(number));
        }
        let index = self.index(number);
        if self.slots[index].is_some() {
            return Err(Error::Occupied(number));
        }
        self.slots[index] = Some(item);
        if offset >= self.len() {
            self.end = number.wrapping_add(1);
        }
        Ok(())
    }

    /// The entry at `number`, if present.
    pub fn get(&self, number: u32) -> Option<&T> {
        if !self.in_window(number) {
            return None;
        }
        self.slots[self.index(number)].as_ref()
    }

    /// The entry at `number`, if present.
    pub fn get_mut(&mut self, number: u32) -> Option<&mut T> {
        if !self.in_window(number) {
            return None;
        }
        let index = self.index(number);
        self.slots[index].as_mut()
    }

    /// Free the slot at `number` without moving the window.
    pub fn remove(&mut self, number: u32) -> Option<T> {
        if !self.in_window(number) {
            return None;
        }
        let index = self.index(number);
        self.slots[index].take()
    }

    /// Free every slot before `number` and move `start` to it.
    ///
    /// `number` must lie within `[start, end]`.
    pub fn clear_until(&mut self, number: u32) -> Result<(), Error> {
        let len = self.len();
        if self.end.wrapping_sub(number) > len || number.wrapping_sub(self.start) > len {
            return Err(Error::OutOfWindow(number));
        }
        while self.start != number {
            let index = self.index(self.start);
            self.slots[index] = None;
            self.start = self.start.wrapping_add(1);
        }
        Ok(())
    }

    /// Move `end` forward to `number`, leaving holes for the skipped sequence numbers.
    pub fn set_end(&mut self, number: u32) -> Result<(), Error> {
        if number.wrapping_sub(self.start) > self.capacity()
            || number.wrapping_sub(self.end) > self.capacity()
        {
            return Err(Error::OutOfWindow(number));
        }
        self.end = number;
        Ok(())
    }

    /// Remove the entry at `start`, if present, advancing the window by one.
    ///
    /// Returns `None` when the window is empty or its first slot is a hole, so entries come out
    /// strictly in sequence order.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let index = self.index(self.start);
        let item = self.slots[index].take()?;
        self.start = self.start.wrapping_add(1);
        Some(item)
    }

    /// Whether `number` has left the array: either it precedes the window or its slot inside the
    /// window was freed.
    pub fn is_released(&self, number: u32) -> bool {
        if self.in_window(number) {
            return self.slots[self.index(number)].is_none();
        }
        number.wrapping_sub(self.start) > u32::MAX / 2
    }

    /// Sequence numbers in the window, in order.
    pub fn numbers(&self) -> impl Iterator<Item = u32> {
        let start = self.start;
        (0..self.len()).map(move |offset| start.wrapping_add(offset))
    }
}
