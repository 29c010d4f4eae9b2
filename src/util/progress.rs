use std::io::{self, Read};

const MB: u64 = 1024 * 1024;

/// Logs every `step` bytes read through it.
pub struct ProgressReader<'a, R> {
    inner: R,
    name: &'a str,
    total: Option<u64>,
    step: u64,
    read: u64,
    next_report: u64,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, name: &'a str, total: Option<u64>) -> Self {
        Self::with_step(inner, name, total, 16 * MB)
    }

    pub fn with_step(inner: R, name: &'a str, total: Option<u64>, step: u64) -> Self {
        let step = step.max(1);
        Self {
            inner,
            name,
            total,
            step,
            read: 0,
            next_report: step,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    fn report(&self) {
        match self.total {
            Some(total) if total > 0 => log::info!(
                target: "upload::progress",
                "{}: {} of {} MB ({}%)",
                self.name,
                self.read / MB,
                total / MB,
                self.read * 100 / total,
            ),
            _ => log::info!(target: "upload::progress", "{}: {} MB", self.name, self.read / MB),
        }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if self.read >= self.next_report {
            self.report();
            while self.next_report <= self.read {
                self.next_report += self.step;
            }
        }
        Ok(n)
    }
}
