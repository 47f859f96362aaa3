//! Progress of downloads, merges and uploads, reported over an unbounded
//! channel so the bot can mirror it into a status message.
//!
//! Producers hold a [`ProgressSink`] and feed a [`ProgressMeter`]; the meter
//! decides when a new report is worth sending (every 5%, or every 8 MB when
//! the total is unknown).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

const PERCENT_STEP: u8 = 5;
const UNKNOWN_TOTAL_STEP: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Downloading,
    Merging,
    Uploading,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub stage: Stage,
    /// 0-100, when the total is known
    pub percent: Option<u8>,
    /// Bytes moved, or microseconds of output written while merging
    pub done: u64,
    pub total: Option<u64>,
    /// `done` units per second
    pub rate: Option<f64>,
    pub eta: Option<Duration>,
}

/// Sending half of a progress channel. The default sink discards reports.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink(Option<mpsc::UnboundedSender<Progress>>);

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn report(&self, progress: Progress) {
        if let Some(tx) = &self.0 {
            // the watcher may be gone already
            let _ = tx.send(progress);
        }
    }
}

/// Throttles a running count into [`Progress`] reports.
#[derive(Debug)]
pub struct ProgressMeter {
    stage: Stage,
    total: Option<u64>,
    done: u64,
    started: Instant,
    last_percent: Option<u8>,
    last_done: u64,
}

impl ProgressMeter {
    /// A zero total counts as unknown.
    pub fn new(stage: Stage, total: Option<u64>) -> Self {
        Self {
            stage,
            total: total.filter(|t| *t > 0),
            done: 0,
            started: Instant::now(),
            last_percent: None,
            last_done: 0,
        }
    }

    pub fn advance(&mut self, delta: u64) -> Option<Progress> {
        self.set(self.done.saturating_add(delta))
    }

    /// Moves to an absolute position. Going backwards is ignored.
    pub fn set(&mut self, done: u64) -> Option<Progress> {
        if done <= self.done && self.last_percent.is_some() {
            return None;
        }
        self.done = self.done.max(done);

        match self.total {
            Some(total) => {
                let percent = percent_of(self.done, total);
                let due = match self.last_percent {
                    None => true,
                    Some(last) => percent >= last.saturating_add(PERCENT_STEP) || (percent == 100 && last < 100),
                };
                if !due {
                    return None;
                }
                self.last_percent = Some(percent);
            }
            None => {
                if self.done < self.last_done + UNKNOWN_TOTAL_STEP {
                    return None;
                }
                self.last_done = self.done;
            }
        }
        Some(self.snapshot())
    }

    fn snapshot(&self) -> Progress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = (elapsed > 0.0 && self.done > 0).then(|| self.done as f64 / elapsed);
        let eta = match (self.total, rate) {
            (Some(total), Some(rate)) if rate > 0.0 => {
                Some(Duration::from_secs_f64(total.saturating_sub(self.done) as f64 / rate))
            }
            _ => None,
        };
        Progress {
            stage: self.stage,
            percent: self.total.map(|t| percent_of(self.done, t)),
            done: self.done,
            total: self.total,
            rate,
            eta,
        }
    }
}

fn percent_of(done: u64, total: u64) -> u8 {
    let ratio = (done as f64 / total as f64).clamp(0.0, 1.0);
    (ratio * 100.0) as u8
}

/// Counts bytes read through `inner` and reports them to a sink. Wraps
/// upload bodies, which are pulled by the HTTP client.
pub struct ProgressReader<R> {
    inner: R,
    meter: ProgressMeter,
    sink: ProgressSink,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, meter: ProgressMeter, sink: ProgressSink) -> Self {
        Self { inner, meter, sink }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                if let Some(progress) = this.meter.advance(read) {
                    this.sink.report(progress);
                }
            }
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_meter_reports_in_five_percent_steps() {
        let mut meter = ProgressMeter::new(Stage::Downloading, Some(1000));

        let percents: Vec<u8> = (0..100)
            .filter_map(|_| meter.advance(10))
            .filter_map(|p| p.percent)
            .collect();

        assert_eq!(percents.first(), Some(&1));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[1] >= w[0] + 5 || w[1] == 100));
        assert!(percents.len() <= 21);
    }

    #[test]
    fn test_meter_without_total_reports_by_volume() {
        let mut meter = ProgressMeter::new(Stage::Uploading, Some(0));

        assert!(meter.advance(UNKNOWN_TOTAL_STEP - 1).is_none());
        let progress = meter.advance(1).unwrap();
        assert_eq!(progress.percent, None);
        assert_eq!(progress.eta, None);
        assert_eq!(progress.done, UNKNOWN_TOTAL_STEP);
    }

    #[test]
    fn test_meter_ignores_moving_backwards() {
        let mut meter = ProgressMeter::new(Stage::Merging, Some(100));
        assert_eq!(meter.set(50).and_then(|p| p.percent), Some(50));
        assert!(meter.set(20).is_none());
        assert_eq!(meter.set(100).and_then(|p| p.percent), Some(100));
    }

    #[test]
    fn test_default_sink_discards() {
        ProgressSink::default().report(ProgressMeter::new(Stage::Merging, None).snapshot());
    }

    #[tokio::test]
    async fn test_reader_reports_bytes_read() {
        let data = vec![1u8; 4096];
        let (sink, mut rx) = ProgressSink::channel();
        let mut reader = ProgressReader::new(
            data.as_slice(),
            ProgressMeter::new(Stage::Uploading, Some(4096)),
            sink,
        );

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        drop(reader);

        let mut last = None;
        while let Some(p) = rx.recv().await {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(out.len(), 4096);
        assert_eq!(last.stage, Stage::Uploading);
        assert_eq!(last.percent, Some(100));
        assert_eq!(last.done, 4096);
    }
}
