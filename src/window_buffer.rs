use std::collections::VecDeque;

use crate::route_point::RoutePoint;

/// Fixed-capacity ring of route points, indexed by age (0 = newest)
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    window: VecDeque<RoutePoint>,
    capacity: usize,
}

impl WindowBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window buffer capacity must be positive");
        WindowBuffer {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a point, dropping the oldest once full
    pub fn add(&mut self, point: RoutePoint) {
        if self.window.len() == self.capacity {
            self.window.pop_back();
        }
        self.window.push_front(point);
    }

    /// Point added `age` additions ago.
    ///
    /// Panics if fewer than `age + 1` points are held: callers derive ages from
    /// the buffer's own fill level, so a miss is a logic error.
    pub fn get(&self, age: usize) -> RoutePoint {
        match self.window.get(age) {
            Some(p) => *p,
            None => panic!(
                "window age {} out of range (filled {}/{})",
                age,
                self.window.len(),
                self.capacity
            ),
        }
    }

    pub fn filled_at_least(&self, n: usize) -> bool {
        self.window.len() >= n
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(i: i64) -> RoutePoint {
        RoutePoint::new(i as f64, -(i as f64), i)
    }

    #[test]
    fn test_newest_is_age_zero() {
        let mut buf = WindowBuffer::new(4);
        for i in 0..3 {
            buf.add(pt(i));
            assert_eq!(buf.get(0), pt(i));
        }
        assert_eq!(buf.get(2), pt(0));
    }

    #[test]
    fn test_oldest_after_wrap() {
        let capacity = 5;
        for extra in 0..7 {
            let mut buf = WindowBuffer::new(capacity);
            let total = capacity as i64 + extra;
            for i in 0..total {
                buf.add(pt(i));
            }
            // Oldest retained point is the one added `capacity - 1` additions ago
            assert_eq!(buf.get(capacity - 1), pt(extra));
            assert_eq!(buf.len(), capacity);
        }
    }

    #[test]
    fn test_filled_and_clear() {
        let mut buf = WindowBuffer::new(3);
        assert!(!buf.filled_at_least(1));
        buf.add(pt(1));
        buf.add(pt(2));
        assert!(buf.filled_at_least(2));
        assert!(!buf.filled_at_least(3));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_get_past_fill_panics() {
        let mut buf = WindowBuffer::new(3);
        buf.add(pt(1));
        buf.get(1);
    }
}
