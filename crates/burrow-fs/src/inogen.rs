//! Inode number allocation.
//!
//! A background producer keeps a bounded channel topped up so the
//! filesystem hot path only ever pops a ready number. Numbers start at 2
//! (1 is the FUSE root) and are never recycled within a process.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const BUFFERED: usize = 128;

pub struct InodeGenerator {
    numbers: Mutex<mpsc::Receiver<u64>>,
    stop: CancellationToken,
}

impl InodeGenerator {
    /// Spawn the producer. Must be called on a runtime.
    pub fn start() -> InodeGenerator {
        let (tx, rx) = mpsc::channel(BUFFERED);
        let stop = CancellationToken::new();
        let token = stop.clone();
        tokio::spawn(async move {
            let mut next = 2u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(next) => {
                        if sent.is_err() {
                            break;
                        }
                        next += 1;
                    }
                }
            }
        });
        InodeGenerator {
            numbers: Mutex::new(rx),
            stop,
        }
    }

    pub async fn next(&self) -> Option<u64> {
        self.numbers.lock().await.recv().await
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for InodeGenerator {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn numbers_are_unique_and_increasing() {
        let generator = InodeGenerator::start();
        let mut last = 1;
        for _ in 0..500 {
            let n = generator.next().await.unwrap();
            assert!(n > last);
            last = n;
        }
        generator.stop();
    }

    #[tokio::test]
    async fn stop_drains_the_producer() {
        let generator = InodeGenerator::start();
        generator.next().await.unwrap();
        generator.stop();
        // The buffer may still hold numbers; eventually recv sees closure.
        while generator.next().await.is_some() {}
    }
}
