//! Register-vector pooling (§4.H "Buffer pooling"): recursive calls pop
//! a previously returned vector of the right size instead of allocating
//! one, and push it back on return. Correctness never depends on reuse —
//! every slot is written (or left `None`, the documented sentinel) before
//! it is read.

use crate::slot::Slot;

#[derive(Debug, Default)]
pub struct RegisterPool {
    by_size: std::collections::HashMap<usize, Vec<Vec<Option<Slot>>>>,
}

impl RegisterPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, size: usize) -> Vec<Option<Slot>> {
        match self.by_size.get_mut(&size).and_then(|bucket| bucket.pop()) {
            Some(mut buf) => {
                buf.iter_mut().for_each(|slot| *slot = None);
                buf
            }
            None => vec![None; size],
        }
    }

    pub fn release(&mut self, buf: Vec<Option<Slot>>) {
        self.by_size.entry(buf.len()).or_default().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused_and_cleared() {
        let mut pool = RegisterPool::new();
        let mut buf = pool.acquire(4);
        buf[1] = Some(Slot::I64(7));
        pool.release(buf);

        let reused = pool.acquire(4);
        assert_eq!(reused.len(), 4);
        assert!(reused.iter().all(|s| s.is_none()));
    }

    #[test]
    fn mismatched_size_falls_back_to_a_fresh_allocation() {
        let mut pool = RegisterPool::new();
        pool.release(vec![None; 2]);
        let buf = pool.acquire(5);
        assert_eq!(buf.len(), 5);
    }
}
