use std::sync::{Arc, Mutex};

pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Default, Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0_u8; COPY_BUFFER_SIZE]);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        self.free.lock().expect("buffer pool lock poisoned").push(buf);
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }
}

pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}
