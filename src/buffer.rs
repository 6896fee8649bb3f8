/*!
Double buffer for the raw firmware update packet.

Two equal-size byte buffers rotate between a writer (the evaluation loop
copying the freshly popped packet in) and readers (the decode pass plus any
debug copy). The slots swap only when both sides have signalled completion,
so a reader never observes a half-written packet.
*/

use std::sync::{Condvar, Mutex};

pub struct DoubleBuffer {
    inner: Mutex<Slots>,
    rotated: Condvar,
    size: usize,
}

struct Slots {
    buf0: Vec<u8>,
    buf1: Vec<u8>,
    /// True while buf0 is the write slot.
    write_is_buf0: bool,
    write_done: bool,
    read_done: bool,
    write_count: u64,
    read_count: u64,
}

impl Slots {
    fn try_rotate(&mut self) -> bool {
        if self.write_done && self.read_done {
            self.write_is_buf0 = !self.write_is_buf0;
            self.write_done = false;
            self.read_done = false;
            true
        } else {
            false
        }
    }
}

impl DoubleBuffer {
    pub fn new(size: usize) -> Self {
        DoubleBuffer {
            inner: Mutex::new(Slots {
                buf0: vec![0; size],
                buf1: vec![0; size],
                write_is_buf0: true,
                write_done: false,
                // The reader starts "done": the first write rotates
                // immediately and becomes visible.
                read_done: true,
                write_count: 0,
                read_count: 0,
            }),
            rotated: Condvar::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Fill the write slot and mark writing complete. Rotates if the reader
    /// is also done.
    pub fn write(&self, data: &[u8]) {
        let mut slots = self.inner.lock().unwrap();
        let dst = if slots.write_is_buf0 {
            &mut slots.buf0
        } else {
            &mut slots.buf1
        };
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        slots.write_count += 1;
        slots.write_done = true;
        if slots.try_rotate() {
            self.rotated.notify_all();
        }
    }

    /// Run `f` against the read slot. The lock is held for the duration of
    /// the call; the writer targets the other slot, so this only contends
    /// with slot rotation itself.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let slots = self.inner.lock().unwrap();
        let src = if slots.write_is_buf0 {
            &slots.buf1
        } else {
            &slots.buf0
        };
        f(src)
    }

    /// Mark the read slot consumed. Rotates if the writer is also done.
    pub fn done_reading(&self) {
        let mut slots = self.inner.lock().unwrap();
        slots.read_count += 1;
        slots.read_done = true;
        if slots.try_rotate() {
            self.rotated.notify_all();
        }
    }

    /// Copy of the current read slot, for debug inspection.
    pub fn snapshot(&self) -> Vec<u8> {
        self.read(|buf| buf.to_vec())
    }

    /// (writes, reads) completed so far.
    pub fn counts(&self) -> (u64, u64) {
        let slots = self.inner.lock().unwrap();
        (slots.write_count, slots.read_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_becomes_readable() {
        let db = DoubleBuffer::new(4);
        db.write(&[1, 2, 3, 4]);
        db.read(|buf| assert_eq!(buf, &[1, 2, 3, 4]));
    }

    #[test]
    fn no_rotation_until_reader_done() {
        let db = DoubleBuffer::new(2);
        db.write(&[1, 1]);
        // Reader has not finished with [1, 1]; a second write lands in the
        // write slot and must not become visible yet.
        db.write(&[2, 2]);
        db.read(|buf| assert_eq!(buf, &[1, 1]));
        db.done_reading();
        db.read(|buf| assert_eq!(buf, &[2, 2]));
    }

    #[test]
    fn alternating_write_read() {
        let db = DoubleBuffer::new(1);
        for i in 1..=5u8 {
            db.write(&[i]);
            db.read(|buf| assert_eq!(buf[0], i));
            db.done_reading();
        }
        assert_eq!(db.counts(), (5, 5));
    }

    #[test]
    fn short_write_leaves_tail() {
        let db = DoubleBuffer::new(3);
        db.write(&[9]);
        db.read(|buf| assert_eq!(buf, &[9, 0, 0]));
    }
}
