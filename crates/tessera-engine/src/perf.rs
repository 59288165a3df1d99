//! Frame timing statistics.
//!
//! Keeps a rolling history of wall-clock update and draw times so the
//! driver can report how expensive the clipmap update loop is.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Rolling frame time collector.
#[derive(Debug)]
pub struct FrameStats {
    /// Update times (clipmap update and cache polling)
    update_times: VecDeque<f32>,
    /// Draw times (render command recording)
    draw_times: VecDeque<f32>,
    /// History size for averaging
    history_size: usize,
    /// Frames recorded since creation
    total_frames: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new(120)
    }
}

impl FrameStats {
    /// Create a collector averaging over the last `history_size` frames.
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        let history_size = history_size.max(1);
        Self {
            update_times: VecDeque::with_capacity(history_size),
            draw_times: VecDeque::with_capacity(history_size),
            history_size,
            total_frames: 0,
        }
    }

    /// Record one frame. Times are in seconds.
    pub fn record_frame(&mut self, update: f32, draw: f32) {
        push_bounded(&mut self.update_times, update, self.history_size);
        push_bounded(&mut self.draw_times, draw, self.history_size);
        self.total_frames += 1;
    }

    /// Frames recorded since creation.
    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Average frame time (update + draw) in seconds.
    #[must_use]
    pub fn avg_frame_time(&self) -> f32 {
        average(&self.update_times) + average(&self.draw_times)
    }

    /// Average update time in seconds.
    #[must_use]
    pub fn avg_update_time(&self) -> f32 {
        average(&self.update_times)
    }

    /// Average draw time in seconds.
    #[must_use]
    pub fn avg_draw_time(&self) -> f32 {
        average(&self.draw_times)
    }

    /// Worst frame time in the history, in seconds.
    #[must_use]
    pub fn worst_frame_time(&self) -> f32 {
        self.update_times
            .iter()
            .zip(&self.draw_times)
            .map(|(u, d)| u + d)
            .fold(0.0, f32::max)
    }

    /// Summary of the current history.
    #[must_use]
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            frames: self.total_frames(),
            frame_time_ms: self.avg_frame_time() * 1000.0,
            update_time_ms: self.avg_update_time() * 1000.0,
            draw_time_ms: self.avg_draw_time() * 1000.0,
            worst_frame_ms: self.worst_frame_time() * 1000.0,
        }
    }
}

fn push_bounded(history: &mut VecDeque<f32>, value: f32, limit: usize) {
    history.push_back(value);
    if history.len() > limit {
        history.pop_front();
    }
}

fn average(history: &VecDeque<f32>) -> f32 {
    if history.is_empty() {
        return 0.0;
    }
    history.iter().sum::<f32>() / history.len() as f32
}

/// Averaged frame timings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameSummary {
    /// Frames recorded
    pub frames: u64,
    /// Average frame time in milliseconds
    pub frame_time_ms: f32,
    /// Average update time in milliseconds
    pub update_time_ms: f32,
    /// Average draw time in milliseconds
    pub draw_time_ms: f32,
    /// Worst frame time in milliseconds
    pub worst_frame_ms: f32,
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames, {:.2}ms avg (update {:.2}ms, draw {:.2}ms), worst {:.2}ms",
            self.frames,
            self.frame_time_ms,
            self.update_time_ms,
            self.draw_time_ms,
            self.worst_frame_ms
        )
    }
}

/// Scoped timer for measuring code sections.
#[derive(Debug)]
pub struct ScopedTimer {
    start: Instant,
}

impl ScopedTimer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Stop and return elapsed time in seconds.
    #[must_use]
    pub fn stop(self) -> f32 {
        self.start.elapsed().as_secs_f32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let stats = FrameStats::new(60);
        assert_eq!(stats.avg_frame_time(), 0.0);
        assert_eq!(stats.worst_frame_time(), 0.0);
        assert_eq!(stats.total_frames(), 0);
    }

    #[test]
    fn test_averages_and_worst() {
        let mut stats = FrameStats::new(10);
        for _ in 0..9 {
            stats.record_frame(0.002, 0.001);
        }
        stats.record_frame(0.010, 0.005);

        assert!((stats.avg_update_time() - 0.0028).abs() < 1e-6);
        assert!((stats.worst_frame_time() - 0.015).abs() < 1e-6);

        let summary = stats.summary();
        assert_eq!(summary.frames, 10);
        assert!((summary.worst_frame_ms - 15.0).abs() < 1e-3);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut stats = FrameStats::new(4);
        stats.record_frame(1.0, 0.0);
        for _ in 0..4 {
            stats.record_frame(0.5, 0.0);
        }
        assert_eq!(stats.worst_frame_time(), 0.5);
        assert_eq!(stats.total_frames(), 5);
        assert!((stats.avg_frame_time() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_summary_display() {
        let summary = FrameSummary {
            frames: 600,
            frame_time_ms: 1.5,
            update_time_ms: 1.0,
            draw_time_ms: 0.5,
            worst_frame_ms: 4.25,
        };
        let text = summary.to_string();
        assert!(text.starts_with("600 frames"));
        assert!(text.contains("worst 4.25ms"));
    }

    #[test]
    fn test_scoped_timer() {
        let timer = ScopedTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() >= 0.004);
    }
}
